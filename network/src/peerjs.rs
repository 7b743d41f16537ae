//! PeerJS-compatible signaling over WebSocket.
//!
//! The endpoint speaks JSON frames `{type, src, dst, payload}`. A client is
//! registered once the server answers with `OPEN`; negotiation frames are
//! relayed between clients verbatim. The client keeps the socket alive with a
//! `HEARTBEAT` frame at a fixed interval.

use crate::signaling::{
    IceCandidate, Signal, SignalBody, SignalingChannel, SignalingTransport, TransportEvent,
    TransportEventKind,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use mesh_core::{Error, PeerIdentity};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use settings_manager::SignalingSettings;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

/// Frame types of the PeerJS wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum FrameType {
    Open,
    Offer,
    Answer,
    Candidate,
    Leave,
    Expire,
    Heartbeat,
    IdTaken,
    Error,
    #[serde(other)]
    Unknown,
}

/// A single frame on the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaPayload {
    #[serde(rename = "type")]
    kind: String,
    connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<SdpPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<CandidatePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SdpPayload {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CandidatePayload {
    candidate: String,
    #[serde(rename = "sdpMid", default)]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    sdp_mline_index: Option<u16>,
}

/// Interpretation of an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Registration accepted
    Open,
    /// Relayed negotiation message
    Signal(Signal),
    /// Registration refused or server error
    Rejected(String),
    /// Keepalive or unknown frame
    Ignored,
}

impl Frame {
    fn heartbeat() -> Self {
        Self {
            kind: FrameType::Heartbeat,
            src: None,
            dst: None,
            payload: None,
        }
    }

    /// Build the outbound frame for a negotiation message
    pub fn from_signal(signal: &Signal) -> Self {
        let media = |sdp: Option<SdpPayload>, candidate: Option<CandidatePayload>| MediaPayload {
            kind: "media".to_string(),
            connection_id: signal.connection_id.clone(),
            sdp,
            candidate,
        };

        let (kind, payload) = match &signal.body {
            SignalBody::Offer { sdp } => (
                FrameType::Offer,
                media(
                    Some(SdpPayload {
                        kind: "offer".to_string(),
                        sdp: sdp.clone(),
                    }),
                    None,
                ),
            ),
            SignalBody::Answer { sdp } => (
                FrameType::Answer,
                media(
                    Some(SdpPayload {
                        kind: "answer".to_string(),
                        sdp: sdp.clone(),
                    }),
                    None,
                ),
            ),
            SignalBody::Candidate(c) => (
                FrameType::Candidate,
                media(
                    None,
                    Some(CandidatePayload {
                        candidate: c.candidate.clone(),
                        sdp_mid: c.sdp_mid.clone(),
                        sdp_mline_index: c.sdp_mline_index,
                    }),
                ),
            ),
            SignalBody::Leave => (FrameType::Leave, media(None, None)),
        };

        Self {
            kind,
            src: None,
            dst: Some(signal.dst.to_string()),
            payload: serde_json::to_value(payload).ok(),
        }
    }

    /// Interpret a frame received by `local`
    pub fn interpret(self, local: &PeerIdentity) -> Inbound {
        match self.kind {
            FrameType::Open => Inbound::Open,
            FrameType::IdTaken => Inbound::Rejected("ID is taken".to_string()),
            FrameType::Error => Inbound::Rejected(
                self.payload
                    .as_ref()
                    .and_then(|p| p.get("msg"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("Server error")
                    .to_string(),
            ),
            FrameType::Heartbeat | FrameType::Unknown => Inbound::Ignored,
            FrameType::Offer
            | FrameType::Answer
            | FrameType::Candidate
            | FrameType::Leave
            | FrameType::Expire => self.into_signal(local).map_or(Inbound::Ignored, Inbound::Signal),
        }
    }

    fn into_signal(self, local: &PeerIdentity) -> Option<Signal> {
        let src = PeerIdentity::new(self.src?);
        let dst = self.dst.map_or_else(|| local.clone(), PeerIdentity::new);
        let media: Option<MediaPayload> = self
            .payload
            .and_then(|p| serde_json::from_value(p).ok());

        let body = match (self.kind, &media) {
            (FrameType::Leave | FrameType::Expire, _) => SignalBody::Leave,
            (FrameType::Offer, Some(MediaPayload { sdp: Some(sdp), .. })) => SignalBody::Offer {
                sdp: sdp.sdp.clone(),
            },
            (FrameType::Answer, Some(MediaPayload { sdp: Some(sdp), .. })) => SignalBody::Answer {
                sdp: sdp.sdp.clone(),
            },
            (
                FrameType::Candidate,
                Some(MediaPayload {
                    candidate: Some(c), ..
                }),
            ) => SignalBody::Candidate(IceCandidate {
                candidate: c.candidate.clone(),
                sdp_mid: c.sdp_mid.clone(),
                sdp_mline_index: c.sdp_mline_index,
            }),
            _ => {
                debug!("Malformed {:?} frame from {}", self.kind, src);
                return None;
            }
        };

        Some(Signal {
            src,
            dst,
            // LEAVE/EXPIRE from the server carry no payload
            connection_id: media.map(|m| m.connection_id).unwrap_or_default(),
            body,
        })
    }
}

/// WebSocket signaling transport for a PeerJS server
pub struct PeerJsTransport {
    settings: SignalingSettings,
}

impl PeerJsTransport {
    /// Create a new transport for the configured endpoint
    pub fn new(settings: SignalingSettings) -> Self {
        Self { settings }
    }

    /// URL registering `identity` with a random session token
    pub fn url_for(&self, identity: &PeerIdentity) -> Result<Url, Error> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();
        let base = format!("{}peerjs", self.settings.websocket_base());
        Url::parse_with_params(
            &base,
            &[
                ("key", self.settings.key.as_str()),
                ("id", identity.as_str()),
                ("token", token.as_str()),
            ],
        )
        .map_err(|e| Error::Signaling(format!("Invalid signaling URL: {}", e)))
    }
}

#[async_trait]
impl SignalingTransport for PeerJsTransport {
    async fn open(
        &self,
        identity: PeerIdentity,
        epoch: u64,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn SignalingChannel>, Error> {
        let url = self.url_for(&identity)?;
        let connect_timeout = self.settings.connect_timeout();
        debug!("Connecting to signaling server at {}", url);

        let (ws, _) = timeout(connect_timeout, connect_async(url.to_string()))
            .await
            .map_err(|_| Error::Signaling("Timed out connecting to signaling server".to_string()))?
            .map_err(|e| Error::Signaling(format!("Failed to connect: {}", e)))?;
        let (mut write, mut read) = ws.split();

        // Registration completes with OPEN
        let registered = timeout(connect_timeout, async {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(Error::Signaling(format!("Socket error: {}", e))),
                };
                match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => match frame.interpret(&identity) {
                        Inbound::Open => return Ok(()),
                        Inbound::Rejected(reason) => return Err(Error::Signaling(reason)),
                        _ => continue,
                    },
                    Err(e) => debug!("Unparseable frame before OPEN: {}", e),
                }
            }
            Err(Error::Signaling(
                "Server closed the connection before OPEN".to_string(),
            ))
        })
        .await
        .map_err(|_| Error::Signaling("Timed out waiting for OPEN".to_string()))?;
        registered?;

        info!("Registered with signaling server as {}", identity);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let cancel = CancellationToken::new();

        // Writer task: outbound frames and heartbeat
        let writer_cancel = cancel.clone();
        let heartbeat = self.settings.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                let frame = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    _ = ticker.tick() => Frame::heartbeat(),
                    next = out_rx.recv() => match next {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode frame: {}", e);
                        continue;
                    }
                };
                trace!("-> {}", text);
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("Failed to write to signaling socket: {}", e);
                    break;
                }
            }
            // Hang-ups queued right before a close still go out
            out_rx.close();
            while let Ok(frame) = out_rx.try_recv() {
                if let Ok(text) = serde_json::to_string(&frame) {
                    let _ = write.send(Message::Text(text)).await;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            debug!("Signaling writer ended");
        });

        // Reader task: relay inbound frames, report loss
        let reader_cancel = cancel.clone();
        let local = identity.clone();
        tokio::spawn(async move {
            let reason = loop {
                let msg = tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    msg = read.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        trace!("<- {}", text);
                        let frame = match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!("Ignoring unparseable frame: {}", e);
                                continue;
                            }
                        };
                        match frame.interpret(&local) {
                            Inbound::Signal(signal) => {
                                let event = TransportEvent {
                                    epoch,
                                    kind: TransportEventKind::Signal(signal),
                                };
                                if events.send(event).is_err() {
                                    return;
                                }
                            }
                            Inbound::Rejected(reason) => break reason,
                            Inbound::Open | Inbound::Ignored => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                }
            };
            reader_cancel.cancel();
            let _ = events.send(TransportEvent {
                epoch,
                kind: TransportEventKind::Lost(reason),
            });
        });

        Ok(Box::new(PeerJsChannel { out_tx, cancel }))
    }
}

/// Live PeerJS connection
struct PeerJsChannel {
    out_tx: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
}

impl SignalingChannel for PeerJsChannel {
    fn send(&self, signal: Signal) -> Result<(), Error> {
        self.out_tx
            .send(Frame::from_signal(&signal))
            .map_err(|_| Error::Signaling("Signaling connection closed".to_string()))
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PeerJsChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn me() -> PeerIdentity {
        PeerIdentity::format("me", 1)
    }

    #[test]
    fn frame_types_use_wire_names() {
        let frame: Frame = serde_json::from_value(json!({"type": "ID-TAKEN"})).unwrap();
        assert_eq!(frame.kind, FrameType::IdTaken);
        assert_eq!(frame.interpret(&me()), Inbound::Rejected("ID is taken".to_string()));

        let frame: Frame = serde_json::from_value(json!({"type": "SOMETHING-NEW"})).unwrap();
        assert_eq!(frame.interpret(&me()), Inbound::Ignored);
    }

    #[test]
    fn offer_frame_matches_peerjs_layout() {
        let signal = Signal {
            src: me(),
            dst: PeerIdentity::new("voice-you-2"),
            connection_id: "mc_abc".to_string(),
            body: SignalBody::Offer {
                sdp: "v=0".to_string(),
            },
        };
        let value = serde_json::to_value(Frame::from_signal(&signal)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "OFFER",
                "dst": "voice-you-2",
                "payload": {
                    "type": "media",
                    "connectionId": "mc_abc",
                    "sdp": {"type": "offer", "sdp": "v=0"}
                }
            })
        );
    }

    #[test]
    fn inbound_candidate_is_decoded() {
        let frame: Frame = serde_json::from_value(json!({
            "type": "CANDIDATE",
            "src": "voice-you-2",
            "dst": "voice-me-1",
            "payload": {
                "type": "media",
                "connectionId": "mc_abc",
                "candidate": {
                    "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            }
        }))
        .unwrap();

        match frame.interpret(&me()) {
            Inbound::Signal(signal) => {
                assert_eq!(signal.src.as_str(), "voice-you-2");
                assert_eq!(signal.connection_id, "mc_abc");
                match signal.body {
                    SignalBody::Candidate(c) => {
                        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                        assert_eq!(c.sdp_mline_index, Some(0));
                    }
                    other => panic!("Expected candidate, got {:?}", other),
                }
            }
            other => panic!("Expected signal, got {:?}", other),
        }
    }

    #[test]
    fn server_leave_without_payload_becomes_leave() {
        let frame: Frame =
            serde_json::from_value(json!({"type": "EXPIRE", "src": "voice-you-2"})).unwrap();
        match frame.interpret(&me()) {
            Inbound::Signal(signal) => {
                assert_eq!(signal.body, SignalBody::Leave);
                assert_eq!(signal.dst, me());
                assert!(signal.connection_id.is_empty());
            }
            other => panic!("Expected signal, got {:?}", other),
        }
    }

    #[test]
    fn offer_without_sdp_is_ignored() {
        let frame: Frame = serde_json::from_value(json!({
            "type": "OFFER",
            "src": "voice-you-2",
            "payload": {"type": "media", "connectionId": "mc_abc"}
        }))
        .unwrap();
        assert_eq!(frame.interpret(&me()), Inbound::Ignored);
    }

    #[test]
    fn error_frame_carries_server_message() {
        let frame: Frame = serde_json::from_value(json!({
            "type": "ERROR",
            "payload": {"msg": "Invalid key provided"}
        }))
        .unwrap();
        assert_eq!(
            frame.interpret(&me()),
            Inbound::Rejected("Invalid key provided".to_string())
        );
    }

    #[test]
    fn registration_url_carries_key_id_and_token() {
        let transport = PeerJsTransport::new(SignalingSettings {
            host: "signal.test".to_string(),
            port: 9000,
            ..Default::default()
        });
        let url = transport
            .url_for(&PeerIdentity::new("voice-Ana Maria-17"))
            .unwrap();

        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/peerjs");
        let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(params[0], ("key".to_string(), "peerjs".to_string()));
        assert_eq!(params[1], ("id".to_string(), "voice-Ana Maria-17".to_string()));
        assert_eq!(params[2].0, "token");
        assert_eq!(params[2].1.len(), 12);
    }
}
