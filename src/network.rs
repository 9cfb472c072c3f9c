//! A group of components attached to one virtual switch.

use crate::component::ComponentSession;
use crate::error::{ClientError, Result};
use crate::transport::ApiClient;
use crate::types::{
    DetachRequest, NetworkComponentConfig, NetworkConfig, NetworkCreated, NetworkInfo,
    NetworkMember, NetworkRequest, StartOptions,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Members {
    sessions: Vec<Arc<ComponentSession>>,
    config: NetworkConfig,
}

pub struct NetworkSession {
    api: ApiClient,
    id: String,
    members: Mutex<Members>,
}

impl NetworkSession {
    /// Creates the network on the backend and takes ownership of `members`.
    pub async fn start(
        api: &ApiClient,
        members: Vec<Arc<ComponentSession>>,
        options: &StartOptions,
    ) -> Result<Arc<Self>> {
        let request = NetworkRequest {
            components: members
                .iter()
                .map(|m| NetworkMember {
                    component_id: m.id().to_string(),
                    hw_address: "auto".into(),
                })
                .collect(),
            has_internet: options.internet_enabled,
            enable_dhcp: options.dhcp_enabled,
            gateway: options.gateway.clone(),
            network: options.network.clone(),
        };
        let reply = api.post("/networks", &request).await?;
        let created: NetworkCreated = serde_json::from_value(reply)?;
        info!("network {} started with {} members", created.id, members.len());

        let config = NetworkConfig {
            components: members
                .iter()
                .map(|m| NetworkComponentConfig {
                    component_id: m.id().to_string(),
                    network_label: None,
                    extra: Default::default(),
                })
                .collect(),
            extra: Default::default(),
        };
        Ok(Self::adopt(api.clone(), created.id, members, config))
    }

    /// Rebuilds the descriptor of an existing session without touching the backend.
    pub fn load(
        api: &ApiClient,
        session_id: &str,
        members: Vec<Arc<ComponentSession>>,
        info: Option<NetworkInfo>,
    ) -> Arc<Self> {
        let config = info.map(|i| i.network_config).unwrap_or_default();
        debug!("loaded network session {session_id}");
        Self::adopt(api.clone(), session_id.to_string(), members, config)
    }

    fn adopt(
        api: ApiClient,
        id: String,
        sessions: Vec<Arc<ComponentSession>>,
        config: NetworkConfig,
    ) -> Arc<Self> {
        for session in &sessions {
            session.set_network(&id);
        }
        Arc::new(Self {
            api,
            id,
            members: Mutex::new(Members { sessions, config }),
        })
    }

    /// Network id; also the id of the backend session it belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn keepalive(&self) -> Result<()> {
        self.api
            .post_empty(&format!("/networks/{}/keepalive", self.id))
            .await?;
        Ok(())
    }

    /// Deletes the network, then releases every member individually.
    pub async fn release(&self) -> Result<()> {
        info!("releasing network {}", self.id);
        self.api
            .delete(&format!("/networks/{}", self.id))
            .await?;

        let members = std::mem::take(&mut self.members.lock().sessions);
        for member in members {
            member.leave_network();
            if let Err(e) = member.release().await {
                warn!("failed to release component {}: {e}", member.id());
            }
        }
        Ok(())
    }

    /// Keeps the session running on the backend for `minutes` after the
    /// client goes away. Returns the estimated expiry.
    pub async fn detach(&self, name: &str, minutes: u32) -> Result<DateTime<Utc>> {
        let request = DetachRequest {
            lifetime: minutes,
            lifetime_unit: "minutes".into(),
            session_name: name.to_string(),
        };
        self.api
            .post(&format!("/sessions/{}/detach", self.id), &request)
            .await?;
        let expires = Utc::now() + chrono::Duration::minutes(i64::from(minutes));
        info!("session {} detached until {expires}", self.id);
        Ok(expires)
    }

    /// Plugs a running component into this network's switch.
    pub async fn add_component(&self, component: Arc<ComponentSession>, label: &str) -> Result<()> {
        self.api
            .post(
                &format!("/networks/{}/addComponentToSwitch", self.id),
                &json!({ "componentId": component.id() }),
            )
            .await?;
        component.set_network(&self.id);

        let mut members = self.members.lock();
        members.config.components.push(NetworkComponentConfig {
            component_id: component.id().to_string(),
            network_label: Some(label.to_string()),
            extra: Default::default(),
        });
        members.sessions.push(component);
        Ok(())
    }

    pub fn get_session(&self, component_id: &str) -> Result<Arc<ComponentSession>> {
        self.members
            .lock()
            .sessions
            .iter()
            .find(|s| s.id() == component_id)
            .cloned()
            .ok_or_else(|| ClientError::UnknownComponent(component_id.to_string()))
    }

    pub fn sessions(&self) -> Vec<Arc<ComponentSession>> {
        self.members.lock().sessions.clone()
    }

    pub fn network_config(&self, component_id: &str) -> Option<NetworkComponentConfig> {
        self.members
            .lock()
            .config
            .components
            .iter()
            .find(|c| c.component_id == component_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Ownership;

    fn offline() -> ApiClient {
        ApiClient::new("http://127.0.0.1:9", None)
    }

    #[tokio::test]
    async fn load_takes_ownership_and_keeps_labels() {
        let api = offline();
        let a = ComponentSession::new(api.clone(), "e1", "c1", None);
        let b = ComponentSession::new(api.clone(), "e2", "c2", None);
        let info = NetworkInfo {
            network_id: Some("n".into()),
            network_config: NetworkConfig {
                components: vec![NetworkComponentConfig {
                    component_id: "c2".into(),
                    network_label: Some("Router".into()),
                    extra: Default::default(),
                }],
                extra: Default::default(),
            },
        };

        let network = NetworkSession::load(&api, "sess-1", vec![a.clone(), b], Some(info));

        assert_eq!(network.id(), "sess-1");
        assert_eq!(
            a.ownership(),
            Ownership::Network {
                network_id: "sess-1".into()
            }
        );
        assert_eq!(network.get_session("c2").unwrap().environment_id(), "e2");
        assert!(matches!(
            network.get_session("zz"),
            Err(ClientError::UnknownComponent(_))
        ));
        assert_eq!(
            network.network_config("c2").unwrap().network_label.as_deref(),
            Some("Router")
        );
        assert!(network.network_config("c1").is_none());
        assert_eq!(network.sessions().len(), 2);
    }
}
