//! Long-polling signaling for the WebRTC audio side-channel.
//!
//! The backend never pushes: the client keeps exactly one `GET` outstanding
//! per session, so messages are handled in the order the backend sent them.

use crate::error::{ClientError, Result};
use crate::peer::ice::audio_ice_servers;
use crate::peer::{AudioPeer, IceCandidate, WebRtcAudioPeer};
use crate::utils::random_id;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Control message exchanged with the backend, `{ "type": ..., "data": ... }`.
#[derive(Debug, Clone)]
pub enum SignalMessage {
    Ice(IceCandidate),
    Sdp(RTCSessionDescription),
    Eos,
    Unknown(String),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct Outgoing<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
}

impl SignalMessage {
    /// `null` bodies carry no message.
    pub fn parse(value: Value) -> Result<Option<Self>> {
        if value.is_null() {
            return Ok(None);
        }
        let raw: RawMessage = serde_json::from_value(value)?;
        let msg = match raw.kind.as_str() {
            "ice" => SignalMessage::Ice(serde_json::from_value(raw.data)?),
            "sdp" => SignalMessage::Sdp(serde_json::from_value(raw.data)?),
            "eos" => SignalMessage::Eos,
            _ => SignalMessage::Unknown(raw.kind),
        };
        Ok(Some(msg))
    }
}

/// How a signaling loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingOutcome {
    /// The backend sent `eos`.
    EndOfStream,
    /// A poll came back with a non-success status.
    Rejected(u16),
    Cancelled,
}

pub enum PollReply {
    Message(Option<SignalMessage>),
    Rejected(u16),
}

/// HTTP side of one audio session.
#[derive(Clone, Debug)]
pub struct SignalingChannel {
    http: HttpClient,
    url: String,
}

impl SignalingChannel {
    pub fn new(http: HttpClient, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `POST {url}?connect`. The reply status is only logged; whether the
    /// session lives on is decided by the long-poll.
    pub async fn connect(&self) -> Result<()> {
        let resp = self.http.post(format!("{}?connect", self.url)).send().await?;
        if !resp.status().is_success() {
            warn!("audio handshake at {} answered {}", self.url, resp.status());
        }
        Ok(())
    }

    /// One blocking long-poll `GET`. Undecodable bodies are logged and
    /// treated as "no message".
    pub async fn poll(&self) -> Result<PollReply> {
        let resp = self.http.get(&self.url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Ok(PollReply::Rejected(status.as_u16()));
        }
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(PollReply::Message(None));
        }
        let parsed = serde_json::from_str::<Value>(&text)
            .map_err(ClientError::from)
            .and_then(SignalMessage::parse);
        match parsed {
            Ok(msg) => Ok(PollReply::Message(msg)),
            Err(e) => {
                warn!("dropping undecodable control message: {e}");
                Ok(PollReply::Message(None))
            }
        }
    }

    pub async fn send_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        debug!("sending ICE candidate to server: {}", candidate.candidate);
        self.send("ice", candidate).await
    }

    pub async fn send_answer(&self, answer: &RTCSessionDescription) -> Result<()> {
        debug!("sending SDP answer");
        self.send("sdp", answer).await
    }

    async fn send<T: Serialize>(&self, kind: &str, data: &T) -> Result<()> {
        let resp = self
            .http
            .post(&self.url)
            .json(&Outgoing { kind, data })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClientError::Status {
                method: "POST".into(),
                url: self.url.clone(),
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

enum Flow {
    Continue,
    Stop,
}

async fn handle_message(
    channel: &SignalingChannel,
    peer: &dyn AudioPeer,
    msg: SignalMessage,
) -> Result<Flow> {
    match msg {
        SignalMessage::Ice(candidate) => {
            peer.add_remote_candidate(candidate).await?;
        }
        SignalMessage::Sdp(offer) => {
            let answer = peer.answer(offer).await?;
            channel.send_answer(&answer).await?;
        }
        SignalMessage::Eos => {
            debug!("stop polling control-messages");
            return Ok(Flow::Stop);
        }
        SignalMessage::Unknown(kind) => {
            error!("unsupported message type: {kind}");
        }
    }
    Ok(Flow::Continue)
}

/// Polls until `eos`, a rejected poll, a transport error or cancellation.
/// Failures while handling a single message are logged and the loop re-arms.
pub async fn run_loop(
    channel: &SignalingChannel,
    peer: &dyn AudioPeer,
    cancel: &CancellationToken,
) -> Result<SignalingOutcome> {
    loop {
        if cancel.is_cancelled() {
            return Ok(SignalingOutcome::Cancelled);
        }

        let reply = tokio::select! {
            _ = cancel.cancelled() => return Ok(SignalingOutcome::Cancelled),
            reply = channel.poll() => reply?,
        };

        match reply {
            PollReply::Rejected(status) => {
                info!("stop polling control-messages, server returned {status}");
                return Ok(SignalingOutcome::Rejected(status));
            }
            PollReply::Message(None) => {}
            PollReply::Message(Some(msg)) => match handle_message(channel, peer, msg).await {
                Ok(Flow::Stop) => return Ok(SignalingOutcome::EndOfStream),
                Ok(Flow::Continue) => {}
                Err(e) => warn!("control message failed: {e}"),
            },
        }
    }
}

/// Posts every locally gathered candidate until the peer stops producing them.
pub async fn forward_candidates(
    channel: SignalingChannel,
    mut local: mpsc::UnboundedReceiver<IceCandidate>,
    cancel: CancellationToken,
) {
    loop {
        let candidate = tokio::select! {
            _ = cancel.cancelled() => return,
            c = local.recv() => c,
        };
        let Some(candidate) = candidate else {
            return;
        };
        if let Err(e) = channel.send_candidate(&candidate).await {
            warn!("failed to send ICE candidate: {e}");
        }
    }
}

/// Runs a whole audio session on an existing peer: handshake, candidate
/// forwarding and the poll loop. The peer stays open after the loop ends
/// and is closed once `cancel` fires.
pub async fn run_session(
    channel: SignalingChannel,
    peer: Arc<dyn AudioPeer>,
    local: mpsc::UnboundedReceiver<IceCandidate>,
    cancel: CancellationToken,
) -> Result<SignalingOutcome> {
    let forwarder = tokio::spawn(forward_candidates(channel.clone(), local, cancel.clone()));

    let outcome = run_loop(&channel, peer.as_ref(), &cancel).await;
    match &outcome {
        Ok(o) => debug!("signaling loop for {} finished: {o:?}", channel.url()),
        Err(e) => warn!("stop polling control-messages: {e}"),
    }

    cancel.cancelled().await;
    forwarder.abort();
    if let Err(e) = peer.close().await {
        warn!("closing audio peer failed: {e}");
    }
    outcome
}

/// Handle of a running audio side-channel.
pub struct AudioChannel {
    id: String,
    url: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<SignalingOutcome>>,
}

impl AudioChannel {
    /// Starts signaling against `audio_url` in the background.
    pub fn spawn(http: HttpClient, audio_url: &str) -> Self {
        let id = random_id();
        let cancel = CancellationToken::new();
        let url = audio_url.to_string();
        let span = info_span!("audio", id = %id);
        let task = tokio::spawn(start_audio(http, url.clone(), cancel.clone()).instrument(span));
        Self {
            id,
            url,
            cancel,
            task,
        }
    }

    /// Tags this channel's log lines.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stops polling and closes the peer connection.
    pub fn close(&self) {
        debug!("closing audio channel {} ({})", self.id, self.url);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the background task, mostly useful in tests.
    pub async fn join(self) -> Option<Result<SignalingOutcome>> {
        self.task.await.ok()
    }
}

async fn start_audio(
    http: HttpClient,
    url: String,
    cancel: CancellationToken,
) -> Result<SignalingOutcome> {
    let channel = SignalingChannel::new(http, url.clone());
    channel.connect().await?;

    let servers = audio_ice_servers(&url)?;
    let (peer, local) = WebRtcAudioPeer::new(servers).await?;
    run_session(channel, Arc::new(peer), local, cancel).await
}
