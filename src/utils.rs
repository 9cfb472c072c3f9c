use crate::peer::types::IceServerConfig;
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Collapses duplicate slashes (except the `scheme://` separator) and drops trailing ones.
pub fn normalize_api_url(raw: &str) -> String {
    // same as replacing `([^:])//+` with `$1/`
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '/' && out.len() > 1 && out.ends_with('/') && !out.ends_with(":/") {
            continue;
        }
        out.push(c);
    }
    out.truncate(out.trim_end_matches('/').len());
    out
}

/// Adds the `stun:`/`turn:` scheme to an ICE server URL if it is missing.
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.kind == "turn" { "turn:" } else { "stun:" };
        format!("{}{}", scheme, config.url)
    }
}
