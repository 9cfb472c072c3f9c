//! Top-level orchestrator: tracks components, the optional network, the
//! liveness poller and the one active view.

use crate::component::ComponentSession;
use crate::config::{ClientConfig, KeyboardLayout, XpraConf};
use crate::connector::{negotiate, ConnectorKind, ViewerSurface};
use crate::error::{ClientError, Result};
use crate::network::NetworkSession;
use crate::observers::{ObserverId, Observers};
use crate::poller::{LivenessPoller, PollSink, PollSnapshot};
use crate::signaling::AudioChannel;
use crate::transport::ApiClient;
use crate::types::{
    CheckpointRequest, ComponentRequest, SessionDocument, SessionInfo, StartOptions, StopResult,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What an `Error` event is about.
#[derive(Debug, Clone)]
pub enum ErrorDetail {
    /// The emulator reached a terminal state (`STOPPED`, `FAILED`).
    State(String),
    /// The component's state could not be read or was not understood.
    Session(Arc<ComponentSession>),
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Error(ErrorDetail),
    StateChanged {
        component_id: String,
        state: String,
    },
    ViewerConnected {
        component_id: String,
        kind: ConnectorKind,
    },
    ViewerDisconnected {
        component_id: String,
    },
}

type StoppedHook = Arc<dyn Fn() + Send + Sync>;

struct ActiveView {
    session: Arc<ComponentSession>,
    surface: Arc<dyn ViewerSurface>,
}

#[derive(Default)]
struct Tracked {
    sessions: Vec<Arc<ComponentSession>>,
    network: Option<Arc<NetworkSession>>,
    default_view: Option<Arc<ComponentSession>>,
}

struct Inner {
    api: ApiClient,
    keyboard: KeyboardLayout,
    poll_interval: Duration,
    xpra: Mutex<XpraConf>,
    delete_on_unload: AtomicBool,
    tracked: Mutex<Tracked>,
    active: Mutex<Option<ActiveView>>,
    ethernet_url: Mutex<Option<String>>,
    connected: AtomicBool,
    poller: LivenessPoller,
    observers: Observers<ClientEvent>,
    on_emulator_stopped: Mutex<Option<StoppedHook>>,
}

impl PollSink for Inner {
    fn snapshot(&self) -> PollSnapshot {
        let tracked = self.tracked.lock();
        PollSnapshot {
            network: tracked.network.clone(),
            sessions: tracked.sessions.clone(),
        }
    }

    fn report(&self, event: ClientEvent) {
        self.observers.emit(&event);
    }

    fn emulator_stopped(&self) {
        let hook = self.on_emulator_stopped.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let api = ApiClient::new(&config.api_url, config.id_token);
        info!("client for {}", api.base());
        Self {
            inner: Arc::new(Inner {
                api,
                keyboard: config.keyboard,
                poll_interval: config.poll_interval,
                xpra: Mutex::new(config.xpra),
                delete_on_unload: AtomicBool::new(config.delete_on_unload),
                tracked: Mutex::new(Tracked::default()),
                active: Mutex::new(None),
                ethernet_url: Mutex::new(None),
                connected: AtomicBool::new(false),
                poller: LivenessPoller::default(),
                observers: Observers::default(),
                on_emulator_stopped: Mutex::new(None),
            }),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn subscribe(&self, callback: impl Fn(&ClientEvent) + Send + Sync + 'static) -> ObserverId {
        self.inner.observers.register(callback)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.inner.observers.unregister(id)
    }

    /// Called by the poller whenever a component is found stopped or failed.
    pub fn set_on_emulator_stopped(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_emulator_stopped.lock() = Some(Arc::new(hook));
    }

    /// Applies to the next XPRA connection.
    pub fn set_xpra_conf(&self, conf: XpraConf) {
        *self.inner.xpra.lock() = conf;
    }

    pub fn xpra_conf(&self) -> XpraConf {
        self.inner.xpra.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// First `ws+ethernet+*` URL seen while connecting.
    pub fn ethernet_url(&self) -> Option<String> {
        self.inner.ethernet_url.lock().clone()
    }

    pub fn active_session(&self) -> Option<Arc<ComponentSession>> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|view| view.session.clone())
    }

    pub fn default_view(&self) -> Option<Arc<ComponentSession>> {
        self.inner.tracked.lock().default_view.clone()
    }

    /// Every component proxy the client tracks.
    pub fn components(&self) -> Vec<Arc<ComponentSession>> {
        self.inner.tracked.lock().sessions.clone()
    }

    pub fn network(&self) -> Option<Arc<NetworkSession>> {
        self.inner.tracked.lock().network.clone()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.poller.is_running()
    }

    fn start_polling(&self) {
        if self
            .inner
            .poller
            .start(Arc::downgrade(&self.inner), self.inner.poll_interval)
        {
            debug!("liveness poller started");
        }
    }

    fn with_keyboard(&self, mut request: ComponentRequest) -> ComponentRequest {
        request.set_keyboard(&self.inner.keyboard.language, &self.inner.keyboard.layout);
        request
    }

    fn track(&self, session: Arc<ComponentSession>, interactive: bool) {
        let mut tracked = self.inner.tracked.lock();
        if interactive {
            tracked.default_view = Some(session.clone());
        }
        tracked.sessions.push(session);
    }

    /// Starts all components concurrently and, if requested, a network
    /// around them. Any failure releases everything started so far.
    pub async fn start(&self, components: Vec<ComponentRequest>, options: StartOptions) -> Result<()> {
        if let Some(encoding) = &options.xpra_encoding {
            self.inner.xpra.lock().encoding = encoding.clone();
        }
        self.start_polling();

        let requests: Vec<ComponentRequest> = components
            .into_iter()
            .map(|r| self.with_keyboard(r))
            .collect();
        let results = join_all(
            requests
                .iter()
                .map(|r| ComponentSession::start(&self.inner.api, r)),
        )
        .await;

        let mut failure = None;
        for (request, result) in requests.iter().zip(results) {
            match result {
                Ok(session) => self.track(session, request.interactive),
                Err(e) => {
                    warn!("starting {} failed: {e}", request.environment);
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            self.rollback().await;
            return Err(ClientError::start_failure(e));
        }

        if options.network_enabled {
            let members = self.components();
            match NetworkSession::start(&self.inner.api, members, &options).await {
                Ok(network) => self.inner.tracked.lock().network = Some(network),
                Err(e) => {
                    self.rollback().await;
                    return Err(ClientError::start_failure(e));
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self) {
        warn!("releasing everything started so far");
        if let Err(e) = self.release(true).await {
            warn!("rollback incomplete: {e}");
        }
        let mut tracked = self.inner.tracked.lock();
        tracked.sessions.clear();
        tracked.network = None;
        tracked.default_view = None;
    }

    /// Binds `view` to `surface`, replacing any active view. Without an
    /// explicit view the default view is used, then the first tracked
    /// component.
    pub async fn connect(
        &self,
        surface: Arc<dyn ViewerSurface>,
        view: Option<Arc<ComponentSession>>,
    ) -> Result<()> {
        let view = view
            .or_else(|| self.default_view())
            .or_else(|| self.inner.tracked.lock().sessions.first().cloned());
        self.disconnect();
        let session = view.ok_or(ClientError::NoActiveViewPossible)?;

        *self.inner.active.lock() = Some(ActiveView {
            session: session.clone(),
            surface: surface.clone(),
        });

        match self.bind(&session, surface.as_ref()).await {
            Ok(kind) => {
                self.inner.connected.store(true, Ordering::SeqCst);
                self.inner.observers.emit(&ClientEvent::ViewerConnected {
                    component_id: session.id().to_string(),
                    kind,
                });
                Ok(())
            }
            Err(e) => {
                let mut active = self.inner.active.lock();
                if active
                    .as_ref()
                    .is_some_and(|v| Arc::ptr_eq(&v.session, &session))
                {
                    *active = None;
                }
                Err(e)
            }
        }
    }

    async fn bind(
        &self,
        session: &Arc<ComponentSession>,
        surface: &dyn ViewerSurface,
    ) -> Result<ConnectorKind> {
        session.ensure_events();
        let urls = session.query_control_url().await?;
        if let Some(ethernet) = urls.ethernet() {
            *self.inner.ethernet_url.lock() = Some(ethernet.to_string());
        }

        let negotiation = negotiate(&urls, &self.xpra_conf())?;
        info!("connecting {} via {}", session.id(), negotiation.kind);
        surface.attach(&negotiation).await?;

        if let Some(audio) = urls.audio() {
            session.attach_audio(AudioChannel::spawn(self.inner.api.http().clone(), audio));
        }
        Ok(negotiation.kind)
    }

    /// Tears down the active view, if any. Components keep running.
    pub fn disconnect(&self) {
        let Some(view) = self.inner.active.lock().take() else {
            return;
        };
        view.surface.detach();
        view.session.disconnect();
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.observers.emit(&ClientEvent::ViewerDisconnected {
            component_id: view.session.id().to_string(),
        });
    }

    /// Checkpoints the active view's component into a new environment.
    pub async fn checkpoint(&self, request: &CheckpointRequest) -> Result<String> {
        let session = self
            .active_session()
            .ok_or(ClientError::NoActiveViewPossible)?;
        self.disconnect();
        session.checkpoint(request).await
    }

    /// Adopts the machines of an existing backend session. Safe to call
    /// outside a tokio runtime; event streams then open on connect.
    pub fn load(&self, doc: SessionDocument) {
        let mut tracked = self.inner.tracked.lock();
        for component in doc.components.iter().filter(|c| c.kind == "machine") {
            if tracked
                .sessions
                .iter()
                .any(|s| s.id() == component.component_id)
            {
                continue;
            }
            let session = ComponentSession::new(
                self.inner.api.clone(),
                component.environment_id.as_deref().unwrap_or_default(),
                &component.component_id,
                None,
            );
            tracked.sessions.push(session);
        }
        tracked.network = Some(NetworkSession::load(
            &self.inner.api,
            &doc.session_id,
            tracked.sessions.clone(),
            doc.network,
        ));
    }

    async fn fetch_session(&self, session_id: &str) -> Result<SessionDocument> {
        let mut doc: SessionDocument = self
            .inner
            .api
            .get_json(&format!("/sessions/{session_id}"))
            .await?;
        doc.session_id = session_id.to_string();
        Ok(doc)
    }

    /// Loads an existing session and connects to one of its components
    /// (or the default view).
    pub async fn attach(
        &self,
        session_id: &str,
        surface: Arc<dyn ViewerSurface>,
        component_id: Option<&str>,
    ) -> Result<()> {
        let doc = self.fetch_session(session_id).await?;
        self.load(doc);

        let view = match component_id {
            Some(id) => Some(self.get_session(id)?),
            None => None,
        };
        self.start_polling();
        debug!("attaching to session {session_id}");
        self.connect(surface, view).await
    }

    /// Loads an existing session, starts one more component, plugs it into
    /// the session's network and connects to it.
    pub async fn attach_new_env(
        &self,
        session_id: &str,
        surface: Arc<dyn ViewerSurface>,
        request: ComponentRequest,
    ) -> Result<()> {
        let doc = self.fetch_session(session_id).await?;
        self.load(doc);

        let request = self.with_keyboard(request);
        let session = ComponentSession::start(&self.inner.api, &request).await?;
        self.start_polling();

        let network = self.network().ok_or(ClientError::NoNetworkSession)?;
        network.add_component(session.clone(), "Temp Client").await?;
        session.set_force_keepalive(true);
        self.track(session.clone(), false);

        self.connect(surface, Some(session)).await
    }

    /// Keeps the networked session alive on the backend after this client
    /// goes away; unloading will no longer release anything.
    pub async fn detach(&self, name: &str, minutes: u32) -> Result<DateTime<Utc>> {
        let network = self.network().ok_or(ClientError::NoNetworkSession)?;
        let expires = network.detach(name, minutes).await?;
        self.inner.delete_on_unload.store(false, Ordering::SeqCst);
        self.disconnect();
        Ok(expires)
    }

    /// Stops every tracked component and returns the backend replies.
    pub async fn stop(&self) -> Result<Vec<StopResult>> {
        self.disconnect();
        let mut results = Vec::new();
        for session in self.components() {
            let result = session.stop().await?;
            results.push(StopResult {
                id: session.id().to_string(),
                result,
            });
        }
        Ok(results)
    }

    /// Disconnects, stops polling and releases backend resources.
    ///
    /// A network is only deleted with `destroy_networks`; otherwise it and
    /// its members stay up. Standalone components are stopped and released;
    /// the reply of the last stop is returned.
    pub async fn release(&self, destroy_networks: bool) -> Result<Option<Value>> {
        info!("releasing client (destroy networks: {destroy_networks})");
        self.disconnect();
        self.inner.poller.cancel();

        if let Some(network) = self.network() {
            if destroy_networks {
                network.release().await?;
                let mut tracked = self.inner.tracked.lock();
                tracked.sessions.clear();
                tracked.network = None;
                tracked.default_view = None;
            }
            return Ok(None);
        }

        let sessions = {
            let mut tracked = self.inner.tracked.lock();
            tracked.default_view = None;
            std::mem::take(&mut tracked.sessions)
        };
        let mut last = None;
        for session in sessions {
            match session.stop().await {
                Ok(reply) => last = Some(reply),
                Err(e) => warn!("stopping {} failed: {e}", session.id()),
            }
            if let Err(e) = session.release().await {
                warn!("releasing {} failed: {e}", session.id());
            }
        }
        Ok(last)
    }

    /// Host shutdown hook: releases everything unless the session was detached.
    pub async fn unload(&self) -> Result<()> {
        if self.inner.delete_on_unload.load(Ordering::SeqCst) {
            self.release(false).await?;
        }
        Ok(())
    }

    pub fn get_session(&self, component_id: &str) -> Result<Arc<ComponentSession>> {
        self.network()
            .ok_or(ClientError::NoSessionsAvailable)?
            .get_session(component_id)
    }

    /// Components of the network with their labels.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let Some(network) = self.network() else {
            return Vec::new();
        };
        network
            .sessions()
            .iter()
            .map(|s| SessionInfo {
                id: s.id().to_string(),
                title: network
                    .network_config(s.id())
                    .and_then(|c| c.network_label),
            })
            .collect()
    }
}
