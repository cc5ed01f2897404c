// src/events.rs
//
// Lifecycle event bus.
//
// Room, participant, track and negotiation changes are published as
// `MeetEvent`s on a single `tokio::sync::broadcast` channel.  The SSE
// endpoint is the main consumer; tests subscribe to observe the SFU.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::room::TrackKey;
use crate::transport::MediaKind;

// ─── Event types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "room.created")]
    RoomCreated,
    #[serde(rename = "room.deleted")]
    RoomDeleted,
    #[serde(rename = "participant.joined")]
    ParticipantJoined,
    #[serde(rename = "participant.left")]
    ParticipantLeft,
    #[serde(rename = "track.published")]
    TrackPublished,
    #[serde(rename = "track.unpublished")]
    TrackUnpublished,
    #[serde(rename = "session.renegotiated")]
    SessionRenegotiated,
    #[serde(rename = "relay.stopped")]
    RelayStopped,
}

impl EventType {
    /// Name used in SSE `event:` fields and `types=` filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoomCreated => "room.created",
            Self::RoomDeleted => "room.deleted",
            Self::ParticipantJoined => "participant.joined",
            Self::ParticipantLeft => "participant.left",
            Self::TrackPublished => "track.published",
            Self::TrackUnpublished => "track.unpublished",
            Self::SessionRenegotiated => "session.renegotiated",
            Self::RelayStopped => "relay.stopped",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPayload {
    pub room_id: String,
    pub creator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantPayload {
    pub room_id: String,
    pub peer_id: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackPayload {
    pub room_id: String,
    pub publisher: String,
    pub track_id: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationPayload {
    pub room_id: String,
    pub peer_id: String,
    pub generation: u64,
    pub tracks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPayload {
    pub room_id: String,
    pub publisher: String,
    pub track_id: String,
    pub subscriber: String,
    /// No subscriber is left on the track.
    pub last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Relay(RelayPayload),
    Negotiation(NegotiationPayload),
    Track(TrackPayload),
    Participant(ParticipantPayload),
    Room(RoomPayload),
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// ```json
/// {
///   "id":         "evt_a1b2c3d4-...",
///   "type":       "participant.joined",
///   "created_at": "2025-06-15T14:22:33.123Z",
///   "data": { "room_id": "r1", "peer_id": "bob", "role": "subscriber" }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    pub data: EventPayload,
}

impl MeetEvent {
    pub fn room_created(room_id: &str, creator: &str) -> Self {
        Self::new(
            EventType::RoomCreated,
            EventPayload::Room(RoomPayload {
                room_id: room_id.to_string(),
                creator: creator.to_string(),
            }),
        )
    }

    pub fn room_deleted(room_id: &str, creator: &str) -> Self {
        Self::new(
            EventType::RoomDeleted,
            EventPayload::Room(RoomPayload {
                room_id: room_id.to_string(),
                creator: creator.to_string(),
            }),
        )
    }

    pub fn participant_joined(room_id: &str, peer_id: &str, role: &str) -> Self {
        Self::new(
            EventType::ParticipantJoined,
            EventPayload::Participant(ParticipantPayload {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                role: role.to_string(),
            }),
        )
    }

    pub fn participant_left(room_id: &str, peer_id: &str, role: &str) -> Self {
        Self::new(
            EventType::ParticipantLeft,
            EventPayload::Participant(ParticipantPayload {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                role: role.to_string(),
            }),
        )
    }

    pub fn track_published(room_id: &str, key: &TrackKey, kind: MediaKind) -> Self {
        Self::new(EventType::TrackPublished, track_payload(room_id, key, kind))
    }

    pub fn track_unpublished(room_id: &str, key: &TrackKey, kind: MediaKind) -> Self {
        Self::new(EventType::TrackUnpublished, track_payload(room_id, key, kind))
    }

    pub fn session_renegotiated(room_id: &str, peer_id: &str, generation: u64, tracks: usize) -> Self {
        Self::new(
            EventType::SessionRenegotiated,
            EventPayload::Negotiation(NegotiationPayload {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                generation,
                tracks,
            }),
        )
    }

    pub fn relay_stopped(room_id: &str, key: &TrackKey, subscriber: &str, last: bool) -> Self {
        Self::new(
            EventType::RelayStopped,
            EventPayload::Relay(RelayPayload {
                room_id: room_id.to_string(),
                publisher: key.publisher.clone(),
                track_id: key.track_id.clone(),
                subscriber: subscriber.to_string(),
                last,
            }),
        )
    }

    fn new(event_type: EventType, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            data,
        }
    }

    pub fn room_id(&self) -> &str {
        match &self.data {
            EventPayload::Room(p) => &p.room_id,
            EventPayload::Participant(p) => &p.room_id,
            EventPayload::Track(p) => &p.room_id,
            EventPayload::Negotiation(p) => &p.room_id,
            EventPayload::Relay(p) => &p.room_id,
        }
    }
}

fn track_payload(room_id: &str, key: &TrackKey, kind: MediaKind) -> EventPayload {
    EventPayload::Track(TrackPayload {
        room_id: room_id.to_string(),
        publisher: key.publisher.clone(),
        track_id: key.track_id.clone(),
        kind: kind.as_str().to_string(),
    })
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast fan-out of `MeetEvent`s.  Cheap to clone.
///
/// Subscribers more than 4096 events behind skip ahead
/// (`broadcast::RecvError::Lagged`).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeetEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        Self { tx }
    }

    /// Publish an event and return how many subscribers will see it.
    pub fn emit(&self, event: MeetEvent) -> usize {
        debug!(event_type = %event.event_type, event_id = %event.id, room_id = %event.room_id(), "event emitted");
        // Err only means nobody is listening.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeetEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serialization() {
        let json = serde_json::to_string(&EventType::TrackPublished).unwrap();
        assert_eq!(json, "\"track.published\"");

        let parsed: EventType = serde_json::from_str("\"relay.stopped\"").unwrap();
        assert_eq!(parsed, EventType::RelayStopped);
    }

    #[test]
    fn event_envelope_json() {
        let evt = MeetEvent::track_published("r1", &TrackKey::new("alice", "cam"), MediaKind::Video);
        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(value["type"], "track.published");
        assert_eq!(value["data"]["publisher"], "alice");
        assert_eq!(value["data"]["kind"], "video");
        assert!(evt.id.starts_with("evt_"));
    }

    #[test]
    fn payloads_round_trip_to_their_variant() {
        let evt = MeetEvent::relay_stopped("r1", &TrackKey::new("alice", "cam"), "bob", true);
        let json = serde_json::to_string(&evt).unwrap();
        let back: MeetEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.data, EventPayload::Relay(RelayPayload { last: true, .. })));

        let evt = MeetEvent::participant_left("r1", "bob", "subscriber");
        let back: MeetEvent = serde_json::from_str(&serde_json::to_string(&evt).unwrap()).unwrap();
        assert!(matches!(back.data, EventPayload::Participant(_)));
    }

    #[tokio::test]
    async fn bus_fanout() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let n = bus.emit(MeetEvent::room_created("r1", "alice"));
        assert_eq!(n, 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.id, e2.id);
        assert_eq!(e1.room_id(), "r1");
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::with_capacity(4);
        assert_eq!(bus.emit(MeetEvent::room_deleted("r1", "alice")), 0);
    }
}
