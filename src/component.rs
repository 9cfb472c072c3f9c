//! One backend-managed machine instance.

use crate::error::{ClientError, Result};
use crate::events::{ComponentEvent, EventSubscription};
use crate::observers::{ObserverId, Observers};
use crate::signaling::AudioChannel;
use crate::transport::ApiClient;
use crate::types::{CheckpointRequest, CheckpointResult, ComponentCreated, ComponentRequest, ControlUrls, EmulatorState};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Who is responsible for keepalive and release of a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Standalone,
    /// Kept alive and released by the network session.
    Network { network_id: String },
}

struct ComponentState {
    /// `None` once released.
    component_id: Option<String>,
    started: bool,
    ownership: Ownership,
    force_keepalive: bool,
    last_state: Option<String>,
    events: Option<EventSubscription>,
    audio: Option<AudioChannel>,
}

pub struct ComponentSession {
    api: ApiClient,
    id: String,
    environment_id: String,
    removable_media: Option<Value>,
    observers: Arc<Observers<ComponentEvent>>,
    state: Mutex<ComponentState>,
}

impl fmt::Debug for ComponentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("ComponentSession")
            .field("id", &self.id)
            .field("environment_id", &self.environment_id)
            .field("released", &st.component_id.is_none())
            .field("started", &st.started)
            .field("ownership", &st.ownership)
            .finish()
    }
}

impl ComponentSession {
    /// `POST /components`, then subscribes to the new component's events.
    pub async fn start(api: &ApiClient, request: &ComponentRequest) -> Result<Arc<Self>> {
        let created: ComponentCreated = api
            .post("/components", request)
            .await
            .and_then(|v| Ok(serde_json::from_value(v)?))
            .map_err(ClientError::start_failure)?;

        let session = Self::new(
            api.clone(),
            &request.environment,
            &created.id,
            created.removable_media_list,
        );
        info!("environment {} started as {}", request.environment, created.id);
        Ok(session)
    }

    /// Wraps an already running component (e.g. from a loaded session).
    ///
    /// The event stream opens right away when called inside a tokio
    /// runtime, otherwise on the first [`ensure_events`](Self::ensure_events)
    /// (which [`Client::connect`](crate::Client::connect) does).
    pub fn new(
        api: ApiClient,
        environment_id: &str,
        component_id: &str,
        removable_media: Option<Value>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            api,
            id: component_id.to_string(),
            environment_id: environment_id.to_string(),
            removable_media,
            observers: Arc::new(Observers::default()),
            state: Mutex::new(ComponentState {
                component_id: Some(component_id.to_string()),
                started: true,
                ownership: Ownership::Standalone,
                force_keepalive: false,
                last_state: None,
                events: None,
                audio: None,
            }),
        });
        session.ensure_events();
        session
    }

    /// Id assigned at creation; stays readable after release.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Live component id, `None` once released.
    pub fn component_id(&self) -> Option<String> {
        self.state.lock().component_id.clone()
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn removable_media(&self) -> Option<&Value> {
        self.removable_media.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().component_id.is_none()
    }

    pub fn ownership(&self) -> Ownership {
        self.state.lock().ownership.clone()
    }

    pub fn network_id(&self) -> Option<String> {
        match &self.state.lock().ownership {
            Ownership::Network { network_id } => Some(network_id.clone()),
            Ownership::Standalone => None,
        }
    }

    pub fn set_network(&self, network_id: &str) {
        self.state.lock().ownership = Ownership::Network {
            network_id: network_id.to_string(),
        };
    }

    pub fn leave_network(&self) {
        self.state.lock().ownership = Ownership::Standalone;
    }

    pub fn force_keepalive(&self) -> bool {
        self.state.lock().force_keepalive
    }

    /// Keep this component alive individually even while it is network-owned.
    pub fn set_force_keepalive(&self, force: bool) {
        self.state.lock().force_keepalive = force;
    }

    /// Network-owned components without forced keepalive are the network's job.
    pub fn is_poll_exempt(&self) -> bool {
        let st = self.state.lock();
        matches!(st.ownership, Ownership::Network { .. }) && !st.force_keepalive
    }

    pub fn subscribe(&self, callback: impl Fn(&ComponentEvent) + Send + Sync + 'static) -> ObserverId {
        self.observers.register(callback)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers.unregister(id)
    }

    /// Opens the event stream unless it is already open or the component is released.
    pub fn ensure_events(&self) {
        let mut st = self.state.lock();
        let Some(id) = st.component_id.clone() else {
            return;
        };
        if st.events.as_ref().is_some_and(|e| !e.is_closed()) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("no runtime yet, deferring events of {id}");
            return;
        }
        match self.events_url(&id) {
            Ok(url) => {
                st.events = Some(EventSubscription::open(
                    self.api.http().clone(),
                    url,
                    self.observers.clone(),
                ));
            }
            Err(e) => warn!("cannot subscribe to events of {id}: {e}"),
        }
    }

    pub fn has_event_stream(&self) -> bool {
        self.state.lock().events.is_some()
    }

    fn events_url(&self, id: &str) -> Result<String> {
        let mut url = Url::parse(&self.api.url(&format!("/components/{id}/events")))?;
        if let Some(token) = self.api.token() {
            url.query_pairs_mut().append_pair("access_token", token);
        }
        Ok(url.into())
    }

    /// Live id of a component that has not been stopped.
    fn running_id(&self) -> Result<String> {
        let st = self.state.lock();
        let id = st.component_id.clone().ok_or(ClientError::Released)?;
        if !st.started {
            return Err(ClientError::NotStarted);
        }
        Ok(id)
    }

    pub async fn query_control_url(&self) -> Result<ControlUrls> {
        let id = self.running_id()?;
        self.api
            .get_json(&format!("/components/{id}/controlurls"))
            .await
    }

    /// `None` while the component is not (or no longer) running.
    pub async fn query_state(&self) -> Result<Option<EmulatorState>> {
        let id = {
            let st = self.state.lock();
            match (&st.component_id, st.started) {
                (Some(id), true) => id.clone(),
                _ => return Ok(None),
            }
        };
        let state: EmulatorState = self
            .api
            .get_json(&format!("/components/{id}/state"))
            .await?;
        Ok(Some(state))
    }

    /// Remembers the last observed state; true if it changed.
    pub(crate) fn record_state(&self, state: &str) -> bool {
        let mut st = self.state.lock();
        if st.last_state.as_deref() == Some(state) {
            return false;
        }
        st.last_state = Some(state.to_string());
        true
    }

    pub async fn keepalive(&self) -> Result<()> {
        let id = {
            let st = self.state.lock();
            if matches!(st.ownership, Ownership::Network { .. }) && !st.force_keepalive {
                return Ok(());
            }
            st.component_id.clone().ok_or(ClientError::Released)?
        };
        self.api
            .post_empty(&format!("/components/{id}/keepalive"))
            .await?;
        Ok(())
    }

    /// Snapshots the running component into a new environment and returns
    /// its id. A network-owned component leaves the network first.
    pub async fn checkpoint(&self, request: &CheckpointRequest) -> Result<String> {
        let id = self.running_id()?;

        if let Some(network_id) = self.network_id() {
            self.remove_from_network(&network_id, &id).await?;
            self.leave_network();
        }

        info!("checkpointing session {id}");
        let reply = self
            .api
            .post(&format!("/components/{id}/checkpoint"), request)
            .await?;
        let result: CheckpointResult = serde_json::from_value(reply)?;
        info!("checkpoint created: {}", result.envid);
        Ok(result.envid)
    }

    async fn remove_from_network(&self, network_id: &str, component_id: &str) -> Result<()> {
        debug!("removing component {component_id} from network {network_id}");
        self.api
            .delete(&format!("/networks/{network_id}/components/{component_id}"))
            .await?;
        debug!("component removed: {component_id}");
        Ok(())
    }

    /// `GET /components/{id}/stop`; the component counts as stopped even if
    /// the request fails.
    pub async fn stop(&self) -> Result<Value> {
        let id = {
            let mut st = self.state.lock();
            st.started = false;
            st.component_id.clone().ok_or(ClientError::Released)?
        };
        let res = self.api.get(&format!("/components/{id}/stop")).await?;
        debug!("stop {id}: {res}");
        Ok(res)
    }

    pub async fn container_result_url(&self) -> Result<Value> {
        let id = self.component_id().ok_or(ClientError::Released)?;
        self.api.get(&format!("/components/{id}/result")).await
    }

    /// Deletes the backend component. Does nothing when already released or
    /// when the component belongs to a network.
    pub async fn release(&self) -> Result<()> {
        let (id, events, audio) = {
            let mut st = self.state.lock();
            if matches!(st.ownership, Ownership::Network { .. }) {
                return Ok(());
            }
            let Some(id) = st.component_id.take() else {
                return Ok(());
            };
            (id, st.events.take(), st.audio.take())
        };

        if let Some(events) = events {
            events.close();
        }
        if let Some(audio) = audio {
            audio.close();
        }

        debug!("releasing component {id}");
        self.api.delete(&format!("/components/{id}")).await?;
        Ok(())
    }

    /// Closes the event stream and audio channel; the component keeps running.
    pub fn disconnect(&self) {
        let (events, audio) = {
            let mut st = self.state.lock();
            (st.events.take(), st.audio.take())
        };
        if let Some(events) = events {
            events.close();
        }
        if let Some(audio) = audio {
            audio.close();
        }
    }

    /// Binds an audio channel, closing any previous one.
    pub fn attach_audio(&self, channel: AudioChannel) {
        let previous = self.state.lock().audio.replace(channel);
        if let Some(previous) = previous {
            previous.close();
        }
    }

    pub fn has_audio(&self) -> bool {
        self.state.lock().audio.is_some()
    }
}

impl Drop for ComponentSession {
    fn drop(&mut self) {
        if let Some(audio) = self.state.get_mut().audio.take() {
            audio.close();
        }
    }
}
