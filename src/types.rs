//! Wire types of the emulation API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Body of `POST /components`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard_layout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard_model: Option<String>,
    /// Marks the component the client should show by default. Never sent.
    #[serde(skip)]
    pub interactive: bool,
    /// Any further request fields (object, archive, software, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ComponentRequest {
    pub fn machine(environment: impl Into<String>) -> Self {
        Self {
            kind: "machine".into(),
            environment: environment.into(),
            keyboard_layout: None,
            keyboard_model: None,
            interactive: false,
            extra: Map::new(),
        }
    }

    pub fn set_keyboard(&mut self, language: &str, layout: &str) {
        self.keyboard_layout = Some(language.to_string());
        self.keyboard_model = Some(layout.to_string());
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Reply of `POST /components`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ComponentCreated {
    pub id: String,
    #[serde(default)]
    pub removable_media_list: Option<Value>,
}

/// Reply of `GET /components/{id}/controlurls`: connector kind → URL.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct ControlUrls(pub BTreeMap<String, String>);

impl ControlUrls {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn guacamole(&self) -> Option<&str> {
        self.get("guacamole")
    }

    pub fn xpra(&self) -> Option<&str> {
        self.get("xpra")
    }

    pub fn webemulator(&self) -> Option<&str> {
        self.get("webemulator")
    }

    pub fn audio(&self) -> Option<&str> {
        self.get("audio")
    }

    /// First `ws+ethernet+*` connector, if any.
    pub fn ethernet(&self) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.starts_with("ws+ethernet+"))
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ControlUrls {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ControlUrls(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Reply of `GET /components/{id}/state`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EmulatorState {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reply of `GET /sessions/{id}`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    /// Not part of the reply; filled in from the request path.
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub components: Vec<SessionComponent>,
    #[serde(default)]
    pub network: Option<NetworkInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionComponent {
    pub component_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub environment_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub network_config: NetworkConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NetworkConfig {
    #[serde(default)]
    pub components: Vec<NetworkComponentConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkComponentConfig {
    pub component_id: String,
    #[serde(default)]
    pub network_label: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Options for [`crate::Client::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub network_enabled: bool,
    pub internet_enabled: bool,
    pub dhcp_enabled: bool,
    pub gateway: Option<String>,
    pub network: Option<String>,
    pub xpra_encoding: Option<String>,
}

impl StartOptions {
    pub fn networked() -> Self {
        Self {
            network_enabled: true,
            ..Default::default()
        }
    }
}

/// Body of `POST /networks`.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub components: Vec<NetworkMember>,
    pub has_internet: bool,
    pub enable_dhcp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMember {
    pub component_id: String,
    pub hw_address: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NetworkCreated {
    pub id: String,
}

/// Body of `POST /sessions/{id}/detach`.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DetachRequest {
    pub lifetime: u32,
    #[serde(rename = "lifetime_unit")]
    pub lifetime_unit: String,
    pub session_name: String,
}

/// Body of `POST /components/{id}/checkpoint`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for CheckpointRequest {
    fn default() -> Self {
        Self {
            kind: "newEnvironment".into(),
            extra: Map::new(),
        }
    }
}

impl CheckpointRequest {
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct CheckpointResult {
    pub envid: String,
}

/// One entry of [`crate::Client::stop`].
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StopResult {
    pub id: String,
    pub result: Value,
}

/// Entry of [`crate::Client::sessions`].
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn component_request_serializes_keyboard_and_extras() {
        let mut req = ComponentRequest::machine("env-1")
            .interactive(true)
            .with_field("object", "obj-7");
        req.set_keyboard("de", "pc105");

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "machine",
                "environment": "env-1",
                "keyboardLayout": "de",
                "keyboardModel": "pc105",
                "object": "obj-7"
            })
        );
    }

    #[test]
    fn control_urls_expose_connectors() {
        let urls: ControlUrls = serde_json::from_value(json!({
            "xpra": "wss://h/xpra#a=1",
            "ws+ethernet+00:11": "wss://h/eth",
            "audio": "https://h/audio"
        }))
        .unwrap();
        assert_eq!(urls.xpra(), Some("wss://h/xpra#a=1"));
        assert_eq!(urls.guacamole(), None);
        assert_eq!(urls.ethernet(), Some("wss://h/eth"));
        assert_eq!(urls.audio(), Some("https://h/audio"));
    }

    #[test]
    fn session_document_parses_backend_shape() {
        let doc: SessionDocument = serde_json::from_value(json!({
            "components": [
                {"componentId": "c1", "type": "machine", "environmentId": "e1"},
                {"componentId": "n1", "type": "nodetcp"}
            ],
            "network": {
                "networkId": "net-1",
                "networkConfig": {
                    "components": [{"componentId": "c1", "networkLabel": "Server"}],
                    "hasInternet": false
                }
            }
        }))
        .unwrap();
        assert_eq!(doc.components.len(), 2);
        let network = doc.network.unwrap();
        assert_eq!(network.network_id.as_deref(), Some("net-1"));
        assert_eq!(
            network.network_config.components[0].network_label.as_deref(),
            Some("Server")
        );
        assert_eq!(network.network_config.extra["hasInternet"], false);
    }

    #[test]
    fn missing_state_field_is_none() {
        let state: EmulatorState = serde_json::from_value(json!({"other": 1})).unwrap();
        assert!(state.state.is_none());
    }
}
