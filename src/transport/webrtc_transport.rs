use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use super::{
    InboundTrack, MediaKind, MediaTransport, RelaySink, RelayTrackSpec, SessionEvent,
    SessionEvents, TransportError, TransportSession, TransportState,
};
use crate::config::Config;

// ─── Transport factory ──────────────────────────────────────────────────────

/// `MediaTransport` backed by webrtc-rs peer connections.
pub struct WebRtcTransport {
    config: Config,
}

impl WebRtcTransport {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_session(
        &self,
        peer_id: &str,
        events: SessionEvents,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let pc = create_peer_connection(&self.config)
            .await
            .map_err(|e| TransportError::Negotiation(format!("peer connection: {e}")))?;

        let cancel = CancellationToken::new();
        let keyframe_interval = match self.config.keyframe_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        install_handlers(&pc, peer_id, events, cancel.clone(), keyframe_interval);

        debug!(peer_id, "webrtc session created");
        Ok(Arc::new(WebRtcSession {
            pc,
            senders: Mutex::new(HashMap::new()),
            cancel,
        }))
    }
}

// ─── PeerConnection factory ─────────────────────────────────────────────────

/// Create a new `RTCPeerConnection` using the STUN servers and UDP port range
/// from the configuration.
async fn create_peer_connection(cfg: &Config) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    // UDP port range + NAT1To1 so the SFU is reachable through port mappings.
    let mut setting_engine = webrtc::api::setting_engine::SettingEngine::default();
    if cfg.udp_port_min > 0 && cfg.udp_port_max > 0 {
        let ephemeral =
            webrtc::ice::udp_network::EphemeralUDP::new(cfg.udp_port_min, cfg.udp_port_max)
                .map_err(|e| webrtc::Error::new(format!("invalid UDP port range: {e}")))?;
        setting_engine.set_udp_network(webrtc::ice::udp_network::UDPNetwork::Ephemeral(ephemeral));
    }
    setting_engine.set_nat_1to1_ips(
        vec![cfg.nat_ip()],
        webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType::Host,
    );

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    let ice_servers: Vec<RTCIceServer> = cfg
        .stun_urls
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await?;
    Ok(Arc::new(pc))
}

// ─── Callback → event queue bridge ──────────────────────────────────────────

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    peer_id: &str,
    events: SessionEvents,
    cancel: CancellationToken,
    keyframe_interval: Option<Duration>,
) {
    // Local ICE candidates are trickled to the peer as JSON `RTCIceCandidateInit`.
    {
        let events = events.clone();
        let pid = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let pid = pid.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let json = candidate
                    .to_json()
                    .map_err(|e| e.to_string())
                    .and_then(|init| serde_json::to_string(&init).map_err(|e| e.to_string()));
                match json {
                    Ok(json) => {
                        let _ = events.send(SessionEvent::IceCandidate(json));
                    }
                    Err(e) => warn!(peer_id = %pid, "failed to serialise ICE candidate: {e}"),
                }
            })
        }));
    }

    {
        let events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(SessionEvent::StateChanged(map_state(state)));
            })
        }));
    }

    {
        let pid = peer_id.to_string();
        let weak_pc = Arc::downgrade(pc);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            let pid = pid.clone();
            let weak_pc = weak_pc.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                info!(
                    peer_id = %pid,
                    track_id = %track.id(),
                    kind = %track.kind(),
                    ssrc = track.ssrc(),
                    "remote track received"
                );
                if track.kind() == RTPCodecType::Video {
                    if let Some(interval) = keyframe_interval {
                        spawn_keyframe_requests(weak_pc, track.ssrc(), interval, cancel);
                    }
                }
                let _ = events.send(SessionEvent::Track(Arc::new(RemoteTrack(track))));
            })
        }));
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

/// Periodically ask the publisher for a keyframe so late subscribers get a
/// decodable picture.
fn spawn_keyframe_requests(
    pc: Weak<RTCPeerConnection>,
    media_ssrc: u32,
    every: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Some(pc) = pc.upgrade() else {
                break;
            };
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                debug!("PLI send error: {e}");
                break;
            }
        }
    });
}

// ─── Session ────────────────────────────────────────────────────────────────

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    /// Relay track id → sender, for `remove_relay_track`.
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    cancel: CancellationToken,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;

        // Glare: drop our own pending offer before applying theirs.
        if self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.pc
                .set_local_description(rollback)
                .await
                .map_err(|e| TransportError::Negotiation(format!("rollback: {e}")))?;
        }

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(format!("create_answer: {e}")))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| TransportError::Negotiation(format!("set_local_description: {e}")))?;
        Ok(sdp)
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(format!("create_offer: {e}")))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| TransportError::Negotiation(format!("set_local_description: {e}")))?;
        Ok(sdp)
    }

    async fn apply_answer(&self, sdp: String) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: String) -> Result<(), TransportError> {
        let init = parse_candidate(candidate)?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn add_relay_track(
        &self,
        spec: RelayTrackSpec,
    ) -> Result<Arc<dyn RelaySink>, TransportError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            spec.codec,
            spec.track_id.clone(),
            spec.stream_id,
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Negotiation(format!("add_track: {e}")))?;

        // Drain RTCP so the sender's interceptors keep running.
        {
            let sender = Arc::clone(&sender);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        self.senders.lock().insert(spec.track_id, sender);
        Ok(Arc::new(LocalRelayTrack(track)))
    }

    async fn remove_relay_track(&self, track_id: &str) -> Result<(), TransportError> {
        let sender = self.senders.lock().remove(track_id);
        match sender {
            Some(sender) => self
                .pc
                .remove_track(&sender)
                .await
                .map_err(|e| TransportError::Negotiation(format!("remove_track: {e}"))),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        self.senders.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Negotiation(format!("close: {e}")))
    }
}

/// Candidates arrive either as JSON `RTCIceCandidateInit` or as a bare
/// `candidate:` line.
fn parse_candidate(candidate: String) -> Result<RTCIceCandidateInit, TransportError> {
    let trimmed = candidate.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed)
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()));
    }
    if trimmed.is_empty() {
        return Err(TransportError::InvalidCandidate("empty candidate".into()));
    }
    Ok(RTCIceCandidateInit {
        candidate: trimmed.to_string(),
        ..Default::default()
    })
}

// ─── Track adapters ─────────────────────────────────────────────────────────

struct RemoteTrack(Arc<TrackRemote>);

#[async_trait]
impl InboundTrack for RemoteTrack {
    fn id(&self) -> String {
        self.0.id()
    }

    fn kind(&self) -> MediaKind {
        match self.0.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        }
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        self.0.codec().capability
    }

    async fn read(&self) -> Result<Packet, TransportError> {
        self.0
            .read_rtp()
            .await
            .map(|(packet, _)| packet)
            .map_err(|e| TransportError::Read(e.to_string()))
    }
}

struct LocalRelayTrack(Arc<TrackLocalStaticRTP>);

#[async_trait]
impl RelaySink for LocalRelayTrack {
    async fn write(&self, packet: &Packet) -> Result<(), TransportError> {
        self.0
            .write_rtp(packet)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_candidate_line_is_accepted() {
        let init = parse_candidate("candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".into())
            .unwrap();
        assert!(init.candidate.starts_with("candidate:1"));
        assert!(init.sdp_mid.is_none());
    }

    #[test]
    fn json_candidate_is_parsed() {
        let json = r#"{"candidate":"candidate:2 1 udp 1 10.0.0.2 6000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let init = parse_candidate(json.into()).unwrap();
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
    }

    #[test]
    fn malformed_candidates_are_protocol_errors() {
        let err = parse_candidate("{not json".into()).unwrap_err();
        assert!(err.is_protocol());

        let err = parse_candidate("   ".into()).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn connection_states_map_one_to_one() {
        assert_eq!(map_state(RTCPeerConnectionState::Failed), TransportState::Failed);
        assert_eq!(map_state(RTCPeerConnectionState::Closed), TransportState::Closed);
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), TransportState::New);
    }
}
