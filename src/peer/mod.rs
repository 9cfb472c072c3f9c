pub mod connection;
pub mod ice;
pub mod types;

pub use connection::{AudioPeer, WebRtcAudioPeer};
pub use types::{IceCandidate, IceServerConfig};
