//! Client for remote emulation sessions: starts and tracks backend
//! components, groups them into networks, keeps them alive, negotiates the
//! display connector and runs the WebRTC audio signaling.

pub mod client;
pub mod component;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod logger;
pub mod network;
pub mod observers;
pub mod peer;
pub mod poller;
pub mod signaling;
pub mod transport;
pub mod types;
mod utils;

pub use client::{Client, ClientEvent, ErrorDetail};
pub use component::{ComponentSession, Ownership};
pub use config::{ClientConfig, KeyboardLayout, XpraConf};
pub use connector::{negotiate, ConnectorKind, Negotiation, ViewerSurface};
pub use error::{ClientError, Result};
pub use events::{ComponentEvent, EventSubscription};
pub use network::NetworkSession;
pub use observers::ObserverId;
pub use poller::LivenessPoller;
pub use signaling::{AudioChannel, SignalingOutcome};
pub use transport::ApiClient;
pub use types::{
    CheckpointRequest, ComponentRequest, ControlUrls, EmulatorState, SessionDocument,
    SessionInfo, StartOptions, StopResult,
};
