// src/sfu.rs
//
// Service facade tying the pieces together: room lifecycle, admission
// (credentials → room lookup), joining a room, running a session to its end,
// and tearing it down.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use futures::stream::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::activity::{Action, ActivityLog, ActivityRecorder};
use crate::auth::{AuthError, CredentialStore};
use crate::broadcaster::{topology_changed, Broadcaster};
use crate::events::{EventBus, MeetEvent};
use crate::registry::{CreateRoomError, RoomRegistry};
use crate::relay::{Relay, RelayConfig};
use crate::room::{Departure, Role, Room};
use crate::session::PeerSession;
use crate::signaling::{run_session_loop, SessionExit, SignalError, SignalSink};
use crate::transport::{MediaTransport, SessionEvent, TransportError};

// ─── Admission ──────────────────────────────────────────────────────────────

/// What a peer supplies when opening its signaling channel.
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    pub room: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A request that passed credential and room checks.
pub struct Admission {
    pub room: Arc<Room>,
    pub username: String,
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("room, username and password are required")]
    MissingCredentials,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("room '{0}' does not exist")]
    UnknownRoom(String),
    #[error("credential store failure: {0}")]
    CredentialStore(String),
    #[error("media session could not be created: {0}")]
    Transport(#[from] TransportError),
}

// ─── Sfu ────────────────────────────────────────────────────────────────────

pub struct Sfu {
    registry: Arc<dyn RoomRegistry>,
    transport: Arc<dyn MediaTransport>,
    users: Arc<dyn CredentialStore>,
    activity: ActivityRecorder,
    broadcaster: Broadcaster,
    bus: EventBus,
}

impl Sfu {
    pub fn new(
        registry: Arc<dyn RoomRegistry>,
        transport: Arc<dyn MediaTransport>,
        users: Arc<dyn CredentialStore>,
        activity: Arc<dyn ActivityLog>,
        bus: EventBus,
        relay: RelayConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            users,
            activity: ActivityRecorder::new(activity),
            broadcaster: Broadcaster::new(Relay::new(relay, bus.clone()), bus.clone()),
            bus,
        }
    }

    pub fn registry(&self) -> &Arc<dyn RoomRegistry> {
        &self.registry
    }

    pub fn users(&self) -> &Arc<dyn CredentialStore> {
        &self.users
    }

    pub fn activity(&self) -> &ActivityRecorder {
        &self.activity
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ── Rooms ───────────────────────────────────────────────────────────

    /// Create a room with `creator` reserved as its host.
    pub fn create_room(&self, room_id: &str, creator: &str) -> Result<(), CreateRoomError> {
        self.registry.create_room(room_id, creator)?;
        info!(room_id, creator, "room created");
        self.bus.emit(MeetEvent::room_created(room_id, creator));
        self.activity
            .record(creator, Action::RoomCreated, format!("Created room {room_id}"));
        Ok(())
    }

    /// Delete a room and shut down every session in it.  Returns false if
    /// there was no such room.
    pub fn delete_room(&self, room_id: &str, deleted_by: &str) -> bool {
        let Some(room) = self.registry.delete_room(room_id) else {
            return false;
        };
        let sessions = room.shutdown();
        info!(room_id, deleted_by, sessions = sessions.len(), "room deleted");
        self.bus.emit(MeetEvent::room_deleted(room_id, room.creator()));
        self.activity
            .record(deleted_by, Action::RoomDeleted, format!("Deleted room {room_id}"));
        true
    }

    // ── Sessions ────────────────────────────────────────────────────────

    /// Check credentials, then resolve the room.  Nothing is mutated.
    pub async fn authorize(&self, request: &JoinRequest) -> Result<Admission, JoinError> {
        let (Some(room_id), Some(username), Some(password)) = (
            non_empty(&request.room),
            non_empty(&request.username),
            non_empty(&request.password),
        ) else {
            return Err(JoinError::MissingCredentials);
        };

        match self.users.validate_user(username, password).await {
            Ok(true) => {}
            Ok(false) | Err(AuthError::InvalidUsername) | Err(AuthError::InvalidPassword) => {
                return Err(JoinError::InvalidCredentials)
            }
            Err(e) => return Err(JoinError::CredentialStore(e.to_string())),
        }

        let room = self
            .registry
            .get_room(room_id)
            .ok_or_else(|| JoinError::UnknownRoom(room_id.to_string()))?;

        Ok(Admission {
            room,
            username: username.to_string(),
        })
    }

    /// Open a session for an admitted peer and add it to the room.  An
    /// existing session under the same username is replaced.
    pub async fn join(
        &self,
        admission: Admission,
        sink: Box<dyn SignalSink>,
    ) -> Result<(Arc<PeerSession>, mpsc::UnboundedReceiver<SessionEvent>), JoinError> {
        let Admission { room, username } = admission;
        let (session, events) =
            PeerSession::open(&username, room.id(), self.transport.as_ref(), sink).await?;

        let replaced = match room.add_peer(Arc::clone(&session)) {
            Ok(replaced) => replaced,
            Err(_) => {
                session.close().await;
                return Err(JoinError::UnknownRoom(room.id().to_string()));
            }
        };
        if let Some(previous) = replaced {
            info!(room_id = %room.id(), peer_id = %username, "replacing existing session");
            previous.session.shutdown();
            self.depart(&room, previous);
        }

        let role = room.role_of(&username).unwrap_or(Role::Subscriber);
        info!(room_id = %room.id(), peer_id = %username, role = role.as_str(), "peer joined");
        self.bus
            .emit(MeetEvent::participant_joined(room.id(), &username, role.as_str()));
        self.activity
            .record(&username, Action::JoinedRoom, format!("Joined room {}", room.id()));

        topology_changed(&room, "peer joined");
        Ok((session, events))
    }

    /// Run the session's loop until it ends, then tear it down.
    pub async fn serve<S>(
        &self,
        room: Arc<Room>,
        session: Arc<PeerSession>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        inbound: S,
    ) where
        S: Stream<Item = Result<String, SignalError>>,
    {
        let exit = run_session_loop(&self.broadcaster, &room, &session, events, inbound).await;
        self.teardown(&room, &session, exit).await;
    }

    async fn teardown(&self, room: &Arc<Room>, session: &Arc<PeerSession>, exit: SessionExit) {
        if let Some(state) = exit.terminal_state() {
            session.advance(state);
        }
        match &exit {
            SessionExit::Failed(e) => warn!(
                room_id = %room.id(),
                peer_id = %session.peer_id(),
                protocol = e.is_protocol(),
                "session failed: {e}"
            ),
            other => info!(
                room_id = %room.id(),
                peer_id = %session.peer_id(),
                reason = %other.reason(),
                "session ended"
            ),
        }

        session.shutdown();
        if let Some(departure) = room.remove_session(session) {
            self.depart(room, departure);
        }
        session.close().await;
    }

    fn depart(&self, room: &Arc<Room>, departure: Departure) {
        let peer_id = departure.session.peer_id().to_string();
        for track in &departure.withdrawn {
            track.stop();
            self.bus
                .emit(MeetEvent::track_unpublished(room.id(), &track.key, track.kind));
        }
        if departure.was_host {
            info!(room_id = %room.id(), peer_id = %peer_id, "host left, room has no publisher");
        }
        self.bus.emit(MeetEvent::participant_left(
            room.id(),
            &peer_id,
            departure.role.as_str(),
        ));
        self.activity
            .record(&peer_id, Action::LeftRoom, format!("Left room {}", room.id()));
        topology_changed(room, "peer left");
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

// ─── Tests ──────────────────────────────────────────────────────────────────
