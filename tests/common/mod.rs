#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::Router;
use eaas_client::{ClientConfig, Negotiation, Result, ViewerSurface};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// One request seen by the mock backend.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: String,
    pub path: String,
    pub body: Value,
}

/// In-process stand-in for the emulation API.
pub struct Backend {
    pub calls: Mutex<Vec<Call>>,
    /// Environments whose `POST /components` fails.
    pub failing_envs: Mutex<HashSet<String>>,
    pub control_urls: Mutex<Value>,
    pub state: Mutex<Value>,
    pub session: Mutex<Value>,
    pub network_fails: Mutex<bool>,
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing_envs: Mutex::new(HashSet::new()),
            control_urls: Mutex::new(json!({"guacamole": "https://h/tunnel#id=7&type=sdl"})),
            state: Mutex::new(json!({"state": "OK"})),
            session: Mutex::new(json!({"components": []})),
            network_fails: Mutex::new(false),
        }
    }
}

impl Backend {
    pub fn count(&self, method: &str, path: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    pub fn position(&self, method: &str, path: &str) -> Option<usize> {
        self.calls
            .lock()
            .iter()
            .position(|c| c.method == method && c.path == path)
    }

    pub fn body_of(&self, method: &str, path: &str) -> Option<Value> {
        self.calls
            .lock()
            .iter()
            .find(|c| c.method == method && c.path == path)
            .map(|c| c.body.clone())
    }

    /// Requests other than the event stream.
    pub fn api_calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| !c.path.ends_with("/events"))
            .cloned()
            .collect()
    }
}

fn reply(status: StatusCode, body: Value) -> (StatusCode, String) {
    (status, body.to_string())
}

async fn handle(
    State(backend): State<Arc<Backend>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> (StatusCode, String) {
    let path = uri.path().to_string();
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    backend.calls.lock().push(Call {
        method: method.to_string(),
        path: path.clone(),
        body: body.clone(),
    });

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match (method.as_str(), segments.as_slice()) {
        ("POST", ["components"]) => {
            let env = body["environment"].as_str().unwrap_or_default().to_string();
            if backend.failing_envs.lock().contains(&env) {
                return reply(StatusCode::INTERNAL_SERVER_ERROR, json!({"message": "boom"}));
            }
            reply(StatusCode::OK, json!({"id": format!("{env}-c")}))
        }
        ("GET", ["components", _, "events"]) => reply(StatusCode::NOT_FOUND, Value::Null),
        ("GET", ["components", _, "controlurls"]) => {
            reply(StatusCode::OK, backend.control_urls.lock().clone())
        }
        ("GET", ["components", _, "state"]) => reply(StatusCode::OK, backend.state.lock().clone()),
        ("GET", ["components", id, "stop"]) => {
            reply(StatusCode::OK, json!({"url": format!("https://h/result/{id}")}))
        }
        ("POST", ["components", _, "checkpoint"]) => reply(StatusCode::OK, json!({"envid": "snap-1"})),
        ("POST", ["components", _, "keepalive"]) => reply(StatusCode::OK, Value::Null),
        ("DELETE", ["components", _]) => reply(StatusCode::OK, Value::Null),
        ("POST", ["networks"]) => {
            if *backend.network_fails.lock() {
                return reply(StatusCode::BAD_GATEWAY, Value::Null);
            }
            reply(StatusCode::OK, json!({"id": "net-1"}))
        }
        ("POST", ["networks", _, "keepalive"]) => reply(StatusCode::OK, Value::Null),
        ("POST", ["networks", _, "addComponentToSwitch"]) => reply(StatusCode::OK, Value::Null),
        ("DELETE", ["networks", _, "components", _]) => reply(StatusCode::OK, Value::Null),
        ("DELETE", ["networks", _]) => reply(StatusCode::OK, Value::Null),
        ("GET", ["sessions", _]) => reply(StatusCode::OK, backend.session.lock().clone()),
        ("POST", ["sessions", _, "detach"]) => reply(StatusCode::OK, Value::Null),
        _ => reply(StatusCode::NOT_FOUND, Value::Null),
    }
}

pub async fn serve() -> (Arc<Backend>, ClientConfig) {
    eaas_client::logger::init();
    let backend = Arc::new(Backend::default());
    let app = Router::new().fallback(handle).with_state(backend.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let config = ClientConfig::new(format!("http://{addr}/"))
        .with_token("secret")
        .with_poll_interval(Duration::from_secs(3600));
    (backend, config)
}

/// Viewer surface that records what it was asked to do.
#[derive(Default)]
pub struct RecordingSurface {
    pub attached: Mutex<Vec<Negotiation>>,
    pub detached: AtomicUsize,
}

impl RecordingSurface {
    pub fn detach_count(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ViewerSurface for RecordingSurface {
    async fn attach(&self, negotiation: &Negotiation) -> Result<()> {
        self.attached.lock().push(negotiation.clone());
        Ok(())
    }

    fn detach(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
