//! WebRTC media sessions.
//!
//! Audio travels as PCMU (8 kHz mono, 20 ms packets). Negotiation messages go
//! out through the session context and come back through [`CallLink::deliver`].
//! Local ICE candidates are held until our description has been sent so the
//! remote side never sees a candidate before the offer or answer.

use crate::codec::{self, PCMU_RATE};
use crate::registry::{CallConnector, CallLink, SessionContext, SessionEventKind};
use crate::signaling::{IceCandidate, Signal, SignalBody};
use bytes::Bytes;
use log::{debug, info, trace, warn};
use mesh_core::{resample, Error, LocalStream, RemoteStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Packet duration on the wire
const PACKET_DURATION: Duration = Duration::from_millis(20);

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: PCMU_RATE,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Connector placing and answering calls over WebRTC
pub struct WebRtcConnector {
    api: Arc<API>,
    rtc_config: RTCConfiguration,
}

impl WebRtcConnector {
    /// Create a new connector using the given STUN/TURN servers
    pub fn new(ice_servers: &[String]) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: pcmu_capability(),
                    payload_type: 0,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| Error::Negotiation(format!("Failed to register PCMU: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::Negotiation(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        // Configure ICE servers (STUN/TURN)
        let ice_servers = ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api: Arc::new(api),
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }

    fn start(&self, ctx: SessionContext, offer_sdp: Option<String>) -> Box<dyn CallLink> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let link = WebRtcLink {
            inbox: inbox_tx,
            cancel: cancel.clone(),
            ctx: ctx.clone(),
        };

        let api = self.api.clone();
        let config = self.rtc_config.clone();
        tokio::spawn(run_session(api, config, ctx, offer_sdp, inbox_rx, cancel));
        Box::new(link)
    }
}

impl CallConnector for WebRtcConnector {
    fn dial(&self, ctx: SessionContext) -> Result<Box<dyn CallLink>, Error> {
        Ok(self.start(ctx, None))
    }

    fn answer(&self, ctx: SessionContext, offer: Signal) -> Result<Box<dyn CallLink>, Error> {
        match offer.body {
            SignalBody::Offer { sdp } => Ok(self.start(ctx, Some(sdp))),
            other => Err(Error::Negotiation(format!("Cannot answer {:?}", other))),
        }
    }
}

struct WebRtcLink {
    inbox: mpsc::UnboundedSender<Signal>,
    cancel: CancellationToken,
    ctx: SessionContext,
}

impl CallLink for WebRtcLink {
    fn deliver(&mut self, signal: Signal) {
        if self.inbox.send(signal).is_err() {
            trace!("Session with {} already ended", self.ctx.peer);
        }
    }

    fn hang_up(&mut self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            self.ctx.signal(SignalBody::Leave);
        }
    }
}

impl Drop for WebRtcLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_session(
    api: Arc<API>,
    config: RTCConfiguration,
    ctx: SessionContext,
    offer_sdp: Option<String>,
    mut inbox: mpsc::UnboundedReceiver<Signal>,
    cancel: CancellationToken,
) {
    let (candidates_tx, mut candidates_rx) = mpsc::unbounded_channel();
    let pc = match create_peer_connection(&api, config, &ctx, candidates_tx, &cancel).await {
        Ok(pc) => pc,
        Err(e) => {
            ctx.report(SessionEventKind::Failed(e.to_string()));
            return;
        }
    };

    let mut remote_set = offer_sdp.is_some();
    if let Err(e) = describe(&pc, &ctx, offer_sdp).await {
        ctx.report(SessionEventKind::Failed(e.to_string()));
        cancel.cancel();
        let _ = pc.close().await;
        return;
    }

    let mut early_candidates: Vec<RTCIceCandidateInit> = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            local = candidates_rx.recv() => {
                if let Some(candidate) = local {
                    ctx.signal(SignalBody::Candidate(candidate));
                }
            }
            remote = inbox.recv() => {
                let Some(signal) = remote else { break };
                match signal.body {
                    SignalBody::Answer { sdp } => {
                        let applied = match RTCSessionDescription::answer(sdp) {
                            Ok(answer) => pc.set_remote_description(answer).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = applied {
                            ctx.report(SessionEventKind::Failed(format!(
                                "Failed to apply answer: {}",
                                e
                            )));
                            break;
                        }
                        remote_set = true;
                        for candidate in early_candidates.drain(..) {
                            add_candidate(&pc, candidate).await;
                        }
                    }
                    SignalBody::Candidate(c) => {
                        let init = RTCIceCandidateInit {
                            candidate: c.candidate,
                            sdp_mid: c.sdp_mid,
                            sdp_mline_index: c.sdp_mline_index,
                            ..Default::default()
                        };
                        if remote_set {
                            add_candidate(&pc, init).await;
                        } else {
                            early_candidates.push(init);
                        }
                    }
                    SignalBody::Offer { .. } => {
                        debug!("Ignoring renegotiation offer from {}", ctx.peer);
                    }
                    SignalBody::Leave => {}
                }
            }
        }
    }

    cancel.cancel();
    if let Err(e) = pc.close().await {
        debug!("Error closing peer connection with {}: {}", ctx.peer, e);
    }
    debug!("Session {} with {} finished", ctx.session, ctx.peer);
}

async fn add_candidate(pc: &RTCPeerConnection, candidate: RTCIceCandidateInit) {
    if let Err(e) = pc.add_ice_candidate(candidate).await {
        debug!("Failed to add ICE candidate: {}", e);
    }
}

/// Send our offer, or answer the remote one
async fn describe(
    pc: &RTCPeerConnection,
    ctx: &SessionContext,
    offer_sdp: Option<String>,
) -> Result<(), Error> {
    match offer_sdp {
        None => {
            let offer = pc
                .create_offer(None)
                .await
                .map_err(|e| Error::Negotiation(format!("Failed to create offer: {}", e)))?;
            pc.set_local_description(offer.clone())
                .await
                .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))?;
            debug!("Sending offer to {}", ctx.peer);
            ctx.signal(SignalBody::Offer { sdp: offer.sdp });
        }
        Some(sdp) => {
            let offer = RTCSessionDescription::offer(sdp)
                .map_err(|e| Error::Negotiation(format!("Failed to parse offer: {}", e)))?;
            pc.set_remote_description(offer)
                .await
                .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {}", e)))?;
            let answer = pc
                .create_answer(None)
                .await
                .map_err(|e| Error::Negotiation(format!("Failed to create answer: {}", e)))?;
            pc.set_local_description(answer.clone())
                .await
                .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))?;
            debug!("Sending answer to {}", ctx.peer);
            ctx.signal(SignalBody::Answer { sdp: answer.sdp });
        }
    }
    Ok(())
}

async fn create_peer_connection(
    api: &API,
    config: RTCConfiguration,
    ctx: &SessionContext,
    candidates: mpsc::UnboundedSender<IceCandidate>,
    cancel: &CancellationToken,
) -> Result<Arc<RTCPeerConnection>, Error> {
    let pc = Arc::new(
        api.new_peer_connection(config)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create peer connection: {}", e)))?,
    );

    // Outbound audio
    let track = Arc::new(TrackLocalStaticSample::new(
        pcmu_capability(),
        "audio".to_owned(),
        ctx.local_stream.id().to_owned(),
    ));
    let rtp_sender = pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| Error::Negotiation(format!("Failed to add track: {}", e)))?;

    // Drain RTCP so interceptors keep working
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while rtp_sender.read(&mut buf).await.is_ok() {}
    });
    tokio::spawn(feed_track(track, ctx.local_stream.clone(), cancel.clone()));

    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidates = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = candidates.send(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    });
                }
                Err(e) => debug!("Failed to serialize ICE candidate: {}", e),
            }
        })
    }));

    let state_ctx = ctx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let ctx = state_ctx.clone();
        Box::pin(async move {
            debug!("Peer connection with {} is {}", ctx.peer, state);
            match state {
                RTCPeerConnectionState::Failed => {
                    ctx.report(SessionEventKind::Failed("ICE connection failed".to_string()))
                }
                RTCPeerConnectionState::Closed => ctx.report(SessionEventKind::Closed),
                _ => {}
            }
        })
    }));

    let track_ctx = ctx.clone();
    let track_cancel = cancel.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let ctx = track_ctx.clone();
        let cancel = track_cancel.clone();
        Box::pin(async move {
            if track.kind() != RTPCodecType::Audio {
                return;
            }
            info!("Receiving audio from {}", ctx.peer);
            tokio::spawn(read_track(track, ctx, cancel));
        })
    }));

    Ok(pc)
}

/// Encode local capture into PCMU samples on the outbound track
async fn feed_track(
    track: Arc<TrackLocalStaticSample>,
    stream: LocalStream,
    cancel: CancellationToken,
) {
    let mut frames = stream.subscribe();
    let packet_len = (PCMU_RATE as u128 * PACKET_DURATION.as_millis() / 1000) as usize;
    let mut pending: Vec<f32> = Vec::with_capacity(packet_len * 2);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = stream.ended() => break,
            frame = frames.recv() => frame,
        };
        match frame {
            Ok(samples) => {
                pending.extend(resample(&samples, stream.sample_rate(), PCMU_RATE));
                while pending.len() >= packet_len {
                    let packet: Vec<f32> = pending.drain(..packet_len).collect();
                    let sample = Sample {
                        data: Bytes::from(codec::encode(&packet)),
                        duration: PACKET_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        trace!("Dropped outbound packet: {}", e);
                    }
                }
            }
            Err(RecvError::Lagged(n)) => debug!("Outbound audio lagged by {} frames", n),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Decode inbound PCMU into a remote stream; the first packet activates the
/// session
async fn read_track(track: Arc<TrackRemote>, ctx: SessionContext, cancel: CancellationToken) {
    let remote = RemoteStream::new(track.id(), ctx.peer.clone(), PCMU_RATE);
    let mut announced = false;

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = track.read_rtp() => packet,
        };
        match packet {
            Ok((packet, _)) => {
                remote.push_samples(&codec::decode(&packet.payload));
                if !announced {
                    announced = true;
                    ctx.report(SessionEventKind::RemoteMedia(remote.clone()));
                }
            }
            Err(e) => {
                warn!("Audio track from {} ended: {}", ctx.peer, e);
                break;
            }
        }
    }
    remote.end();
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{PeerIdentity, SessionId};

    fn context() -> (
        SessionContext,
        mpsc::UnboundedReceiver<Signal>,
        mpsc::UnboundedReceiver<crate::registry::SessionEvent>,
    ) {
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            local: PeerIdentity::format("me", 1),
            peer: PeerIdentity::format("you", 2),
            session: SessionId(1),
            connection_id: "mc_test".to_string(),
            local_stream: LocalStream::new(48000),
            signals,
            events,
        };
        (ctx, signals_rx, events_rx)
    }

    #[test]
    fn connector_keeps_ice_servers() {
        let connector = WebRtcConnector::new(&["stun:stun.l.google.com:19302".to_string()]).unwrap();
        assert_eq!(connector.rtc_config.ice_servers.len(), 1);
        assert_eq!(
            connector.rtc_config.ice_servers[0].urls[0],
            "stun:stun.l.google.com:19302"
        );
    }

    #[tokio::test]
    async fn dial_sends_an_offer() {
        let connector = WebRtcConnector::new(&[]).unwrap();
        let (ctx, mut signals, _events) = context();

        let mut link = connector.dial(ctx).unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap()
            .unwrap();
        match signal.body {
            SignalBody::Offer { sdp } => assert!(sdp.contains("PCMU")),
            other => panic!("Expected offer, got {:?}", other),
        }
        assert_eq!(signal.connection_id, "mc_test");

        link.hang_up();
    }

    #[tokio::test]
    async fn answering_a_non_offer_is_rejected() {
        let connector = WebRtcConnector::new(&[]).unwrap();
        let (ctx, _signals, _events) = context();
        let not_offer = Signal {
            src: ctx.peer.clone(),
            dst: ctx.local.clone(),
            connection_id: "mc_test".to_string(),
            body: SignalBody::Leave,
        };
        assert!(matches!(
            connector.answer(ctx, not_offer),
            Err(Error::Negotiation(_))
        ));
    }
}
