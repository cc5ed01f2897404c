// src/transport/mod.rs
//
// The media stack as a capability.
//
// The SFU core never touches ICE/DTLS/SRTP directly.  It asks a
// `MediaTransport` for one `TransportSession` per peer, drives offer/answer
// through it, attaches relay tracks to it, and receives everything the stack
// reports (remote tracks, local ICE candidates, connection-state changes) as
// `SessionEvent`s on the session's own queue.  Callbacks therefore never
// reach into room or registry locks.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

#[cfg(test)]
pub mod fake;
pub mod webrtc_transport;

pub use webrtc_transport::WebRtcTransport;

// ─── Events ─────────────────────────────────────────────────────────────────

/// Connection state as reported by the media stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Everything a peer session's loop consumes besides signaling frames.
pub enum SessionEvent {
    /// The remote peer started sending a media track.
    Track(Arc<dyn InboundTrack>),
    /// A local ICE candidate (opaque, already serialised) to trickle out.
    IceCandidate(String),
    /// The media connection changed state.
    StateChanged(TransportState),
    /// Room topology changed; recompute this session's bindings.
    Renegotiate,
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Track(track) => write!(f, "Track({})", track.id()),
            Self::IceCandidate(_) => f.write_str("IceCandidate"),
            Self::StateChanged(state) => write!(f, "StateChanged({state:?})"),
            Self::Renegotiate => f.write_str("Renegotiate"),
        }
    }
}

/// Producer half of a session's event queue.
pub type SessionEvents = mpsc::UnboundedSender<SessionEvent>;

// ─── Media descriptions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Shape of an outbound relay track to create on a subscriber's connection.
#[derive(Debug, Clone)]
pub struct RelayTrackSpec {
    pub track_id: String,
    pub stream_id: String,
    pub codec: RTCRtpCodecCapability,
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("track read failed: {0}")]
    Read(String),
    #[error("track ended")]
    TrackEnded,
    #[error("relay write failed: {0}")]
    Write(String),
}

impl TransportError {
    /// Errors caused by malformed peer input rather than the network.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::InvalidDescription(_) | Self::InvalidCandidate(_))
    }
}

// ─── Capabilities ───────────────────────────────────────────────────────────

/// Factory for per-peer media sessions.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Create the media connection for `peer_id`.  Every notification the
    /// stack produces for it is delivered on `events`.
    async fn create_session(
        &self,
        peer_id: &str,
        events: SessionEvents,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// One peer's media connection.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Apply a remote offer and return the local answer SDP.
    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError>;

    /// Build a local offer reflecting the current track set and install it
    /// as the local description.
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Apply the remote answer to the last local offer.
    async fn apply_answer(&self, sdp: String) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: String) -> Result<(), TransportError>;

    async fn add_relay_track(
        &self,
        spec: RelayTrackSpec,
    ) -> Result<Arc<dyn RelaySink>, TransportError>;

    /// Detach a relay track.  Unknown ids are not an error.
    async fn remove_relay_track(&self, track_id: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A media track received from a remote peer.
#[async_trait]
pub trait InboundTrack: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn codec(&self) -> RTCRtpCodecCapability;

    /// Block until the next packet arrives.  An error means the source ended.
    async fn read(&self) -> Result<Packet, TransportError>;
}

/// Write side of an outbound relay track.
#[async_trait]
pub trait RelaySink: Send + Sync {
    async fn write(&self, packet: &Packet) -> Result<(), TransportError>;
}
