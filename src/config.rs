// Client configuration.
// Logging defaults can only be relaxed in debug builds; RUST_LOG always wins.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// How often the liveness poller queries component state.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// Delay before the event stream reconnects when the server sent no `retry:` hint.
pub const EVENT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// STUN server every audio peer connection starts with.
pub const STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Shared TURN credentials of the emulation backend.
pub const TURN_USERNAME: &str = "eaas";
pub const TURN_CREDENTIAL: &str = "eaas";

/// Keyboard preferences forwarded with every component request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KeyboardLayout {
    pub language: String,
    pub layout: String,
}

impl Default for KeyboardLayout {
    fn default() -> Self {
        Self {
            language: "us".into(),
            layout: "pc105".into(),
        }
    }
}

/// Settings handed to the XPRA viewer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct XpraConf {
    #[serde(rename = "xpraWidth")]
    pub width: u32,
    #[serde(rename = "xpraHeight")]
    pub height: u32,
    #[serde(rename = "xpraDPI")]
    pub dpi: u32,
    #[serde(rename = "xpraEncoding")]
    pub encoding: String,
}

impl Default for XpraConf {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            dpi: 96,
            encoding: "jpeg".into(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the emulation API, e.g. `https://host/emil/`.
    pub api_url: String,
    /// Opaque credential; `None` runs anonymously.
    pub id_token: Option<String>,
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    pub keyboard: KeyboardLayout,
    pub xpra: XpraConf,
    /// Release everything when the host page goes away.
    pub delete_on_unload: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            id_token: None,
            poll_interval: POLL_INTERVAL,
            keyboard: KeyboardLayout::default(),
            xpra: XpraConf::default(),
            delete_on_unload: true,
        }
    }
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.id_token = Some(token.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_backend_expectations() {
        let cfg = ClientConfig::new("http://localhost:8080/emil");
        assert_eq!(cfg.poll_interval, Duration::from_millis(1500));
        assert_eq!(cfg.keyboard.language, "us");
        assert_eq!(cfg.keyboard.layout, "pc105");
        assert_eq!(cfg.xpra.encoding, "jpeg");
        assert!(cfg.delete_on_unload);
        assert!(cfg.id_token.is_none());
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let cfg: ClientConfig = serde_json::from_str(
            r#"{"api_url":"http://api","poll_interval":250,"xpra":{"xpraWidth":800,"xpraHeight":600,"xpraDPI":120,"xpraEncoding":"png"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.xpra.width, 800);
        assert_eq!(cfg.xpra.encoding, "png");
        assert_eq!(cfg.keyboard, KeyboardLayout::default());
    }

    #[test]
    fn xpra_conf_uses_viewer_field_names() {
        let json = serde_json::to_value(XpraConf::default()).unwrap();
        assert_eq!(json["xpraWidth"], 640);
        assert_eq!(json["xpraDPI"], 96);
    }
}
