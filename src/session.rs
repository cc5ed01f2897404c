// src/session.rs
//
// One peer's membership in a room: its media connection, its signaling
// writer, the relay tracks it receives, and the generation-checked
// negotiation state.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcaster::{Attached, Negotiation};
use crate::relay::RelayHandle;
use crate::room::TrackKey;
use crate::signaling::{Envelope, SignalError, SignalEvent, SignalSink};
use crate::transport::{
    MediaTransport, SessionEvent, SessionEvents, TransportError, TransportSession, TransportState,
};

// ─── Connection state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// New → Connecting → Connected → {Disconnected, Failed} → Closed.
    /// Disconnected/Failed may also be reached before the first negotiation,
    /// and Closed from anywhere.  Nothing leaves Closed.
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Connecting) => true,
            (Connecting, Connected) => true,
            (New | Connecting | Connected, Disconnected | Failed) => true,
            _ => false,
        }
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("media connection {0:?}")]
    ConnectionLost(TransportState),
}

impl SessionError {
    /// Malformed input from the peer, as opposed to a network failure.
    pub fn is_protocol(&self) -> bool {
        match self {
            Self::Protocol(_) => true,
            Self::Transport(e) => e.is_protocol(),
            _ => false,
        }
    }
}

// ─── PeerSession ────────────────────────────────────────────────────────────

pub struct PeerSession {
    peer_id: String,
    room_id: String,
    /// Distinguishes this session from a later one with the same peer id.
    session_id: Uuid,
    transport: Arc<dyn TransportSession>,
    /// Serialises outbound signaling writes.
    writer: tokio::sync::Mutex<Box<dyn SignalSink>>,
    events: SessionEvents,
    state: Mutex<ConnectionState>,
    negotiation: Mutex<Negotiation>,
    relays: Mutex<HashMap<TrackKey, RelayHandle>>,
    /// Parent scope of every task working on behalf of this session.
    cancel: CancellationToken,
    renegotiation_queued: AtomicBool,
    closed: AtomicBool,
}

impl PeerSession {
    /// Create the media connection for `peer_id` and return the session
    /// together with the receiving end of its event queue.
    pub async fn open(
        peer_id: &str,
        room_id: &str,
        transport: &dyn MediaTransport,
        sink: Box<dyn SignalSink>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>), TransportError> {
        let (events, rx) = mpsc::unbounded_channel();
        let media = transport.create_session(peer_id, events.clone()).await?;

        let session = Arc::new(Self {
            peer_id: peer_id.to_string(),
            room_id: room_id.to_string(),
            session_id: Uuid::new_v4(),
            transport: media,
            writer: tokio::sync::Mutex::new(sink),
            events,
            state: Mutex::new(ConnectionState::New),
            negotiation: Mutex::new(Negotiation::default()),
            relays: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            renegotiation_queued: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        session.advance(ConnectionState::Connecting);
        Ok((session, rx))
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn transport(&self) -> &Arc<dyn TransportSession> {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Apply a state transition if it is legal.  Returns whether it happened.
    pub fn advance(&self, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == to || !state.can_transition(to) {
            return false;
        }
        debug!(peer_id = %self.peer_id, from = ?*state, to = ?to, "session state");
        *state = to;
        true
    }

    // ── Signaling ───────────────────────────────────────────────────────

    /// Write one envelope under the session's writer lock.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SignalError> {
        let text = envelope.encode()?;
        self.writer.lock().await.send_text(text).await
    }

    /// Route one inbound signaling frame.  Any error is fatal for the session.
    pub async fn handle_signal(&self, text: &str) -> Result<(), SessionError> {
        let envelope = Envelope::decode(text)
            .map_err(|e| SessionError::Protocol(format!("malformed envelope: {e}")))?;

        match envelope.event {
            SignalEvent::Offer => {
                // A peer offer invalidates whatever we had in flight.
                let generation = self.negotiation.lock().supersede();
                let answer = self.transport.accept_offer(envelope.data).await?;
                self.send(&Envelope::answer(answer)).await?;
                debug!(peer_id = %self.peer_id, generation, "answered peer offer");
                self.mark_negotiated();
                self.request_renegotiation();
            }
            SignalEvent::Answer => {
                let generation = envelope.generation.ok_or_else(|| {
                    SessionError::Protocol("answer without generation".to_string())
                })?;
                let pending = self.negotiation.lock().take_if_current(generation);
                match pending {
                    Some(bindings) => {
                        self.transport.apply_answer(envelope.data).await?;
                        let tracks = bindings.len();
                        self.negotiation.lock().commit(bindings);
                        self.mark_negotiated();
                        debug!(peer_id = %self.peer_id, generation, tracks, "answer applied");
                    }
                    None => {
                        debug!(peer_id = %self.peer_id, generation, "stale answer discarded");
                        self.request_renegotiation();
                    }
                }
            }
            SignalEvent::Candidate => {
                self.transport.add_ice_candidate(envelope.data).await?;
            }
        }
        Ok(())
    }

    fn mark_negotiated(&self) {
        if self.advance(ConnectionState::Connected) {
            info!(peer_id = %self.peer_id, room_id = %self.room_id, "session connected");
        }
    }

    /// React to a media connection state change.  Only a failed or closed
    /// connection is fatal; ICE may recover from a disconnect on its own.
    pub fn on_transport_state(&self, state: TransportState) -> Result<(), SessionError> {
        match state {
            TransportState::Failed => {
                self.advance(ConnectionState::Failed);
                Err(SessionError::ConnectionLost(state))
            }
            TransportState::Disconnected => {
                warn!(peer_id = %self.peer_id, room_id = %self.room_id, "media connection interrupted");
                Ok(())
            }
            TransportState::Closed => Err(SessionError::ConnectionLost(state)),
            other => {
                debug!(peer_id = %self.peer_id, state = ?other, "media connection state");
                Ok(())
            }
        }
    }

    // ── Renegotiation ───────────────────────────────────────────────────

    /// Ask this session's loop to reconcile.  Requests made while one is
    /// already queued are coalesced.
    pub fn request_renegotiation(&self) {
        if self.is_closed() || self.renegotiation_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.events.send(SessionEvent::Renegotiate).is_err() {
            self.renegotiation_queued.store(false, Ordering::Release);
        }
    }

    /// Called by the loop right before reconciling, so topology changes that
    /// happen during the reconcile queue another round.
    pub fn renegotiation_started(&self) {
        self.renegotiation_queued.store(false, Ordering::Release);
    }

    pub(crate) fn negotiation(&self) -> MutexGuard<'_, Negotiation> {
        self.negotiation.lock()
    }

    // ── Relay bookkeeping ───────────────────────────────────────────────

    pub fn relay_keys(&self) -> BTreeSet<TrackKey> {
        self.relays.lock().keys().cloned().collect()
    }

    pub(crate) fn attached(&self) -> Attached {
        self.relays
            .lock()
            .iter()
            .map(|(key, handle)| (key.clone(), handle.binding()))
            .collect()
    }

    pub(crate) fn insert_relay(&self, key: TrackKey, handle: RelayHandle) {
        if let Some(previous) = self.relays.lock().insert(key, handle) {
            previous.cancel();
        }
    }

    /// Take out every relay that has finished or is no longer in `desired`.
    pub(crate) fn prune_relays(&self, desired: &BTreeSet<TrackKey>) -> Vec<(TrackKey, RelayHandle)> {
        let mut relays = self.relays.lock();
        let stale: Vec<TrackKey> = relays
            .iter()
            .filter(|(key, handle)| handle.is_finished() || !desired.contains(*key))
            .map(|(key, _)| key.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|key| relays.remove(&key).map(|handle| (key, handle)))
            .collect()
    }

    // ── Lifetime ────────────────────────────────────────────────────────

    /// Child scope for a task that must not outlive this session.
    pub fn scope(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the session's loop and every task in its scope.  The loop's exit
    /// path performs the actual teardown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the media connection and the signaling channel.  Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.advance(ConnectionState::Closed);
        self.relays.lock().clear();

        if let Err(e) = self.transport.close().await {
            warn!(peer_id = %self.peer_id, "transport close failed: {e}");
        }
        if let Err(e) = self.writer.lock().await.close().await {
            debug!(peer_id = %self.peer_id, "signaling close failed: {e}");
        }
        info!(peer_id = %self.peer_id, room_id = %self.room_id, "session closed");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
