//! Periodic keepalive and state check of everything a client tracks.

use crate::client::{ClientEvent, ErrorDetail};
use crate::component::ComponentSession;
use crate::network::NetworkSession;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a tick looks at, captured once per tick.
#[derive(Default, Clone)]
pub struct PollSnapshot {
    pub network: Option<Arc<NetworkSession>>,
    pub sessions: Vec<Arc<ComponentSession>>,
}

/// The orchestrator side of the poller.
pub trait PollSink: Send + Sync {
    fn snapshot(&self) -> PollSnapshot;
    fn report(&self, event: ClientEvent);
    fn emulator_stopped(&self);
}

/// Counters of one tick, mostly for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub polled: usize,
    pub keepalives: usize,
    pub errors: usize,
}

/// Runs one pass over the snapshot.
///
/// | state            | action                                   |
/// |------------------|------------------------------------------|
/// | `OK`, `READY`    | keepalive                                |
/// | `STOPPED`,`FAILED` | stopped hook, keepalive, error(state)  |
/// | anything else    | error(session), never retried            |
pub async fn tick(sink: &dyn PollSink) -> TickReport {
    let snapshot = sink.snapshot();
    let mut report = TickReport::default();

    if let Some(network) = &snapshot.network {
        if let Err(e) = network.keepalive().await {
            warn!("keepalive of network {} failed: {e}", network.id());
        }
    }

    for session in &snapshot.sessions {
        if session.is_poll_exempt() {
            continue;
        }
        let state = match session.query_state().await {
            Ok(Some(state)) => state,
            Ok(None) => continue,
            Err(e) => {
                warn!("state of {} unavailable: {e}", session.id());
                report.errors += 1;
                sink.report(ClientEvent::Error(ErrorDetail::Session(session.clone())));
                continue;
            }
        };
        report.polled += 1;

        let name = state.state.unwrap_or_default();
        if !name.is_empty() && session.record_state(&name) {
            sink.report(ClientEvent::StateChanged {
                component_id: session.id().to_string(),
                state: name.clone(),
            });
        }

        match name.as_str() {
            "OK" | "READY" => {
                keepalive(session, &mut report).await;
            }
            "STOPPED" | "FAILED" => {
                sink.emulator_stopped();
                keepalive(session, &mut report).await;
                report.errors += 1;
                sink.report(ClientEvent::Error(ErrorDetail::State(name)));
            }
            other => {
                debug!("unexpected state {other:?} of {}", session.id());
                report.errors += 1;
                sink.report(ClientEvent::Error(ErrorDetail::Session(session.clone())));
            }
        }
    }
    report
}

async fn keepalive(session: &ComponentSession, report: &mut TickReport) {
    match session.keepalive().await {
        Ok(()) => report.keepalives += 1,
        Err(e) => warn!("keepalive of {} failed: {e}", session.id()),
    }
}

/// Owns the single recurring poll task of a client.
#[derive(Default)]
pub struct LivenessPoller {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessPoller {
    /// Starts ticking every `interval`. Returns false if already running.
    /// The task ends by itself once the sink is dropped.
    pub fn start<S: PollSink + 'static>(&self, sink: Weak<S>, interval: Duration) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick of an interval fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sink) = sink.upgrade() else {
                    debug!("poll sink gone, stopping");
                    return;
                };
                let report = tick(sink.as_ref()).await;
                debug!("poll tick: {report:?}");
            }
        }));
        true
    }

    pub fn cancel(&self) -> bool {
        match self.task.lock().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for LivenessPoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ApiClient;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Backend {
        states: HashMap<String, Value>,
        keepalives: Mutex<Vec<String>>,
    }

    async fn state(State(b): State<Arc<Backend>>, Path(id): Path<String>) -> (StatusCode, Json<Value>) {
        match b.states.get(&id) {
            Some(v) => (StatusCode::OK, Json(v.clone())),
            None => (StatusCode::INTERNAL_SERVER_ERROR, Json(Value::Null)),
        }
    }

    async fn keepalive(State(b): State<Arc<Backend>>, Path(id): Path<String>) -> StatusCode {
        b.keepalives.lock().push(id);
        StatusCode::OK
    }

    async fn serve(states: &[(&str, Value)]) -> (Arc<Backend>, ApiClient) {
        let backend = Arc::new(Backend {
            states: states
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            ..Default::default()
        });
        let app = Router::new()
            .route("/components/{id}/state", get(state))
            .route("/components/{id}/keepalive", post(keepalive))
            .route("/networks/{id}/keepalive", post(keepalive))
            .with_state(backend.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (backend, ApiClient::new(&format!("http://{addr}"), None))
    }

    #[derive(Default)]
    struct Sink {
        snapshot: PollSnapshot,
        events: Mutex<Vec<ClientEvent>>,
        stopped: Mutex<usize>,
    }

    impl PollSink for Sink {
        fn snapshot(&self) -> PollSnapshot {
            self.snapshot.clone()
        }

        fn report(&self, event: ClientEvent) {
            self.events.lock().push(event);
        }

        fn emulator_stopped(&self) {
            *self.stopped.lock() += 1;
        }
    }

    impl Sink {
        fn errors(&self) -> Vec<ClientEvent> {
            self.events
                .lock()
                .iter()
                .filter(|e| matches!(e, ClientEvent::Error(_)))
                .cloned()
                .collect()
        }
    }

    #[tokio::test]
    async fn failed_component_reports_once_and_everyone_is_kept_alive() {
        let (backend, api) = serve(&[
            ("a", json!({"state": "OK"})),
            ("b", json!({"state": "FAILED"})),
            ("c", json!({"state": "READY"})),
        ])
        .await;
        let sink = Sink {
            snapshot: PollSnapshot {
                network: None,
                sessions: ["a", "b", "c"]
                    .into_iter()
                    .map(|id| ComponentSession::new(api.clone(), "env", id, None))
                    .collect(),
            },
            ..Default::default()
        };

        let report = tick(&sink).await;

        assert_eq!(report, TickReport { polled: 3, keepalives: 3, errors: 1 });
        assert_eq!(*backend.keepalives.lock(), vec!["a", "b", "c"]);
        assert_eq!(*sink.stopped.lock(), 1);
        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], ClientEvent::Error(ErrorDetail::State(s)) if s == "FAILED"));
    }

    #[tokio::test]
    async fn unknown_state_is_reported_without_keepalive() {
        let (backend, api) = serve(&[("a", json!({"state": "PAUSED"})), ("b", json!({}))]).await;
        let sink = Sink {
            snapshot: PollSnapshot {
                network: None,
                sessions: vec![
                    ComponentSession::new(api.clone(), "env", "a", None),
                    ComponentSession::new(api.clone(), "env", "b", None),
                ],
            },
            ..Default::default()
        };

        let report = tick(&sink).await;

        assert_eq!(report.keepalives, 0);
        assert_eq!(sink.errors().len(), 2);
        assert!(backend.keepalives.lock().is_empty());
        assert_eq!(*sink.stopped.lock(), 0);
    }

    #[tokio::test]
    async fn transport_error_reports_session_and_continues() {
        let (backend, api) = serve(&[("ok", json!({"state": "OK"}))]).await;
        let broken = ComponentSession::new(api.clone(), "env", "missing", None);
        let sink = Sink {
            snapshot: PollSnapshot {
                network: None,
                sessions: vec![broken, ComponentSession::new(api.clone(), "env", "ok", None)],
            },
            ..Default::default()
        };

        tick(&sink).await;

        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert!(
            matches!(&errors[0], ClientEvent::Error(ErrorDetail::Session(s)) if s.id() == "missing")
        );
        assert_eq!(*backend.keepalives.lock(), vec!["ok"]);
    }

    #[tokio::test]
    async fn network_members_are_left_to_the_network() {
        let (backend, api) = serve(&[("m", json!({"state": "OK"}))]).await;
        let member = ComponentSession::new(api.clone(), "env", "m", None);
        let network = NetworkSession::load(&api, "net", vec![member.clone()], None);
        let sink = Sink {
            snapshot: PollSnapshot {
                network: Some(network),
                sessions: vec![member],
            },
            ..Default::default()
        };

        let report = tick(&sink).await;

        assert_eq!(report.polled, 0);
        assert_eq!(*backend.keepalives.lock(), vec!["net"]);
    }

    #[tokio::test]
    async fn poller_runs_once_and_stops_on_cancel() {
        let sink = Arc::new(Sink::default());
        let poller = LivenessPoller::default();

        assert!(poller.start(Arc::downgrade(&sink), Duration::from_millis(10)));
        assert!(!poller.start(Arc::downgrade(&sink), Duration::from_millis(10)));
        assert!(poller.is_running());

        assert!(poller.cancel());
        assert!(!poller.is_running());
        assert!(!poller.cancel());
    }
}
