use crate::error::Result;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::ice::{analyze_candidates, rtc_ice_servers};
use crate::peer::types::{IceCandidate, IceServerConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// The receiving side of an audio channel, as seen by the signaling loop.
#[async_trait]
pub trait AudioPeer: Send + Sync {
    /// Adds a candidate announced by the backend.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Applies a remote offer and returns the local answer, already set as
    /// the local description.
    async fn answer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription>;

    async fn close(&self) -> Result<()>;
}

/// [`AudioPeer`] backed by a real `RTCPeerConnection`.
pub struct WebRtcAudioPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcAudioPeer {
    /// Creates the peer connection. Locally gathered candidates are delivered
    /// on the returned channel; the end-of-gathering marker is not.
    pub async fn new(
        servers: Vec<IceServerConfig>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<IceCandidate>)> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(servers),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        debug!("creating RTC peer connection");
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let (tx, rx) = mpsc::unbounded_channel();
        let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::new(Mutex::new(Vec::new()));

        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => {
                    dump_candidate("LOCAL", &c);
                    match c.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate::from(init);
                            gathered.lock().push(candidate.clone());
                            // receiver gone means the signaling loop ended
                            let _ = tx.send(candidate);
                        }
                        Err(e) => warn!("failed to serialize local candidate: {e}"),
                    }
                }
                None => {
                    debug!("ICE candidate exchange finished");
                    analyze_candidates(&gathered.lock());
                }
            }
            Box::pin(async {})
        }));

        pc.on_track(Box::new(
            |track: Arc<TrackRemote>,
             _receiver: Arc<RTCRtpReceiver>,
             _transceiver: Arc<RTCRtpTransceiver>| {
                info!("remote {} track received", track.kind());
                Box::pin(async {})
            },
        ));

        let pc_stats = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("audio peer connection state changed to {st:?}");
            match st {
                RTCPeerConnectionState::Connected | RTCPeerConnectionState::Failed => {
                    if let Some(pc) = pc_stats.upgrade() {
                        let moment = if st == RTCPeerConnectionState::Connected {
                            "CONNECTED"
                        } else {
                            "FAILED"
                        };
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, moment).await;
                        });
                    }
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        Ok((Self { pc }, rx))
    }
}

#[async_trait]
impl AudioPeer for WebRtcAudioPeer {
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        debug!("remote ICE candidate received: {}", candidate.candidate);
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn answer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        debug!("remote SDP offer received");
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        debug!("SDP answer: {}", answer.sdp);
        Ok(answer)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
