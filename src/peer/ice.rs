use crate::config::{STUN_URL, TURN_CREDENTIAL, TURN_USERNAME};
use crate::error::Result;
use crate::peer::types::{IceCandidate, IceServerConfig};
use crate::utils::add_ice_url_scheme;
use tracing::{debug, warn};
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// ICE servers for an audio channel: the public STUN server plus a TURN
/// relay on the control host, unless that host is `localhost`.
pub fn audio_ice_servers(audio_url: &str) -> Result<Vec<IceServerConfig>> {
    let url = Url::parse(audio_url)?;
    let host = url.host_str().unwrap_or_default();
    debug!("using host {host} for audio connection");

    let mut servers = vec![IceServerConfig::stun(STUN_URL)];
    if host != "localhost" {
        servers.push(IceServerConfig::turn(host, TURN_USERNAME, TURN_CREDENTIAL));
    }
    Ok(servers)
}

pub fn rtc_ice_servers(servers: Vec<IceServerConfig>) -> Vec<RTCIceServer> {
    servers
        .into_iter()
        .map(|config| {
            let url = add_ice_url_scheme(&config);

            RTCIceServer {
                urls: vec![url],
                username: config.username.unwrap_or_default(),
                credential: config.credential.unwrap_or_default(),
            }
        })
        .collect()
}

/// Logs how many host/srflx/relay candidates were gathered locally.
pub fn analyze_candidates(candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    debug!("candidate analysis: {host_count} host, {srflx_count} srflx, {relay_count} relay");

    if relay_count == 0 && !candidates.is_empty() {
        warn!("no TURN relay candidates gathered, audio through NAT may fail");
    }
}
