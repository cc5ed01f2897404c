// src/broadcaster.rs
//
// Renegotiation broadcaster.
//
// Topology changes (join, leave, track published or ended) do not touch any
// peer connection directly.  They enqueue a `Renegotiate` event on every
// member session; each session's own loop then reconciles: it brings its
// relay tracks in line with what the room says it should receive and, if the
// attached set differs from what the peer last agreed to, sends a fresh offer
// tagged with a new generation.  A relay re-attached under a fresh binding
// counts as a change even when the track set is the same.  Answers are only applied when they carry the
// latest generation.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::events::{EventBus, MeetEvent};
use crate::relay::Relay;
use crate::room::{BindingId, Room, TrackKey};
use crate::session::{PeerSession, SessionError};
use crate::signaling::Envelope;

// ─── Negotiation state ──────────────────────────────────────────────────────

/// Outbound relay tracks of a session, by the binding that feeds each one.
pub type Attached = BTreeMap<TrackKey, BindingId>;

#[derive(Debug, Clone)]
struct PendingOffer {
    generation: u64,
    bindings: Attached,
}

/// Per-session offer/answer bookkeeping.
#[derive(Debug, Default)]
pub struct Negotiation {
    generation: u64,
    pending: Option<PendingOffer>,
    /// Tracks the peer last accepted.
    negotiated: Attached,
}

impl Negotiation {
    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn pending_generation(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.generation)
    }

    /// Whether `attached` is neither in flight nor already agreed.
    pub fn needs_offer(&self, attached: &Attached) -> bool {
        match &self.pending {
            Some(pending) => pending.bindings != *attached,
            None => self.negotiated != *attached,
        }
    }

    /// Start a cycle for `bindings` and return its generation.
    pub fn begin(&mut self, bindings: Attached) -> u64 {
        self.generation += 1;
        self.pending = Some(PendingOffer {
            generation: self.generation,
            bindings,
        });
        self.generation
    }

    /// Claim the pending offer if `generation` is the latest one.
    pub fn take_if_current(&mut self, generation: u64) -> Option<Attached> {
        match &self.pending {
            Some(pending) if pending.generation == generation && generation == self.generation => {
                self.pending.take().map(|p| p.bindings)
            }
            _ => None,
        }
    }

    pub fn commit(&mut self, bindings: Attached) {
        self.negotiated = bindings;
    }

    /// Invalidate any offer in flight (the peer sent its own).
    pub fn supersede(&mut self) -> u64 {
        self.generation += 1;
        self.pending = None;
        self.generation
    }
}

// ─── Broadcast ──────────────────────────────────────────────────────────────

/// Ask every member of `room` to reconcile.
pub fn topology_changed(room: &Room, reason: &str) {
    let sessions = room.sessions();
    debug!(room_id = %room.id(), reason, sessions = sessions.len(), "topology changed");
    for session in sessions {
        session.request_renegotiation();
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    relay: Relay,
    bus: EventBus,
}

impl Broadcaster {
    pub fn new(relay: Relay, bus: EventBus) -> Self {
        Self { relay, bus }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Converge `session` on the room's current topology.  Runs on the
    /// session's own loop, so it never races with that session's signaling.
    pub async fn reconcile(
        &self,
        room: &Arc<Room>,
        session: &Arc<PeerSession>,
    ) -> Result<(), SessionError> {
        session.renegotiation_started();
        if session.is_closed() {
            return Ok(());
        }

        let desired = room.desired_bindings(session.peer_id());

        for (key, handle) in session.prune_relays(&desired) {
            self.relay.detach(room, session, &key, handle).await;
        }

        let missing: Vec<TrackKey> = desired
            .difference(&session.relay_keys())
            .cloned()
            .collect();
        for key in missing {
            let Some(track) = room.published_track(&key) else {
                continue;
            };
            match self.relay.attach(room, session, &track).await {
                Ok(Some(handle)) => session.insert_relay(key, handle),
                Ok(None) => debug!(peer_id = %session.peer_id(), track = %key, "binding no longer wanted"),
                Err(e) => warn!(peer_id = %session.peer_id(), track = %key, "relay attach failed: {e}"),
            }
        }

        let attached = session.attached();
        let generation = {
            let mut negotiation = session.negotiation();
            if !negotiation.needs_offer(&attached) {
                return Ok(());
            }
            negotiation.begin(attached.clone())
        };

        let sdp = session.transport().create_offer().await?;
        session.send(&Envelope::offer(sdp, generation)).await?;

        debug!(
            room_id = %room.id(),
            peer_id = %session.peer_id(),
            generation,
            tracks = attached.len(),
            "offer sent"
        );
        self.bus.emit(MeetEvent::session_renegotiated(
            room.id(),
            session.peer_id(),
            generation,
            attached.len(),
        ));
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
