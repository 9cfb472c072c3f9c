//! Picks the display transport offered for a component and prepares the
//! hand-off to the viewer surface.

use crate::config::XpraConf;
use crate::error::{ClientError, Result};
use crate::types::ControlUrls;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    Guacamole,
    Xpra,
    WebEmulator,
}

impl ConnectorKind {
    /// Negotiation order.
    pub const PRIORITY: [ConnectorKind; 3] = [
        ConnectorKind::Guacamole,
        ConnectorKind::Xpra,
        ConnectorKind::WebEmulator,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ConnectorKind::Guacamole => "guacamole",
            ConnectorKind::Xpra => "xpra",
            ConnectorKind::WebEmulator => "webemulator",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Everything a viewer needs to open the display.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiation {
    pub kind: ConnectorKind,
    /// URL handed to the viewer. For the web emulator this is the
    /// percent-encoded JSON of all control URLs.
    pub control_url: String,
    /// Parameters from the connector URL's fragment.
    pub params: BTreeMap<String, String>,
    /// Only set for XPRA.
    pub xpra: Option<XpraConf>,
}

/// The rendering side of a connection: owns the display widget.
#[async_trait]
pub trait ViewerSurface: Send + Sync {
    async fn attach(&self, negotiation: &Negotiation) -> Result<()>;

    /// Tears the display down. Called before another view is bound.
    fn detach(&self);
}

/// Selects exactly one display connector: guacamole, then xpra, then webemulator.
pub fn negotiate(urls: &ControlUrls, xpra: &XpraConf) -> Result<Negotiation> {
    let kind = ConnectorKind::PRIORITY
        .into_iter()
        .find(|kind| urls.get(kind.key()).is_some())
        .ok_or_else(|| ClientError::UnsupportedConnector(urls.keys().join(",")))?;

    // present, checked above
    let url = urls.get(kind.key()).unwrap_or_default();
    let params = fragment_params(url);

    let negotiation = match kind {
        ConnectorKind::Guacamole => Negotiation {
            kind,
            control_url: url.to_string(),
            params,
            xpra: None,
        },
        ConnectorKind::Xpra => Negotiation {
            kind,
            control_url: url.to_string(),
            params,
            xpra: Some(xpra.clone()),
        },
        ConnectorKind::WebEmulator => Negotiation {
            kind,
            control_url: urlencoding::encode(&serde_json::to_string(urls)?).into_owned(),
            params,
            xpra: None,
        },
    };
    Ok(negotiation)
}

/// Parameters encoded in the part of `url` after the first `#`.
pub fn fragment_params(url: &str) -> BTreeMap<String, String> {
    match url.split_once('#') {
        Some((_, fragment)) => parse_params(fragment),
        None => BTreeMap::new(),
    }
}

/// Parses `a=1&b=x%20y`. Values are percent-decoded; a pair without `=`
/// maps to an empty string.
pub fn parse_params(s: &str) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    if s.is_empty() {
        return result;
    }
    for part in s.split('&') {
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        result.insert(key.to_string(), value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(pairs: &[(&str, &str)]) -> ControlUrls {
        pairs.iter().copied().collect()
    }

    #[test]
    fn guacamole_wins_over_everything() {
        let n = negotiate(
            &urls(&[
                ("xpra", "wss://h/x#a=1"),
                ("guacamole", "https://h/tunnel#id=7&type=sdl"),
                ("webemulator", "https://h/w"),
            ]),
            &XpraConf::default(),
        )
        .unwrap();
        assert_eq!(n.kind, ConnectorKind::Guacamole);
        assert_eq!(n.control_url, "https://h/tunnel#id=7&type=sdl");
        assert_eq!(n.params.get("id").map(String::as_str), Some("7"));
        assert!(n.xpra.is_none());
    }

    #[test]
    fn each_single_connector_selects_its_branch() {
        for kind in ConnectorKind::PRIORITY {
            let n = negotiate(
                &urls(&[(kind.key(), "https://h/c#k=v"), ("audio", "https://h/a")]),
                &XpraConf::default(),
            )
            .unwrap();
            assert_eq!(n.kind, kind);
            assert_eq!(n.params.get("k").map(String::as_str), Some("v"));
        }
    }

    #[test]
    fn xpra_carries_viewer_settings() {
        let conf = XpraConf {
            encoding: "png".into(),
            ..Default::default()
        };
        let n = negotiate(&urls(&[("xpra", "wss://h/x")]), &conf).unwrap();
        assert_eq!(n.xpra, Some(conf));
        assert!(n.params.is_empty());
    }

    #[test]
    fn webemulator_gets_encoded_descriptor() {
        let all = urls(&[("webemulator", "https://h/w#x=1")]);
        let n = negotiate(&all, &XpraConf::default()).unwrap();
        let decoded = urlencoding::decode(&n.control_url).unwrap();
        let back: ControlUrls = serde_json::from_str(&decoded).unwrap();
        assert_eq!(back, all);
    }

    #[test]
    fn no_display_connector_is_unsupported() {
        let err = negotiate(
            &urls(&[("audio", "https://h/a"), ("ws+ethernet+1", "wss://h/e")]),
            &XpraConf::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedConnector(_)));
        assert!(matches!(
            negotiate(&ControlUrls::default(), &XpraConf::default()),
            Err(ClientError::UnsupportedConnector(_))
        ));
    }

    #[test]
    fn params_round_trip_through_percent_encoding() {
        let encoded = format!("a={}&b={}", urlencoding::encode("1"), urlencoding::encode("x y"));
        assert_eq!(encoded, "a=1&b=x%20y");
        let parsed = parse_params(&encoded);
        assert_eq!(parsed.get("a").map(String::as_str), Some("1"));
        assert_eq!(parsed.get("b").map(String::as_str), Some("x y"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn empty_inputs_yield_empty_maps() {
        assert!(parse_params("").is_empty());
        assert!(fragment_params("https://h/no-fragment").is_empty());
        assert!(fragment_params("https://h/empty#").is_empty());
    }

    #[test]
    fn pair_without_value_maps_to_empty_string() {
        let parsed = parse_params("flag&x=%2Fpath");
        assert_eq!(parsed.get("flag").map(String::as_str), Some(""));
        assert_eq!(parsed.get("x").map(String::as_str), Some("/path"));
    }
}
