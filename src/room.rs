use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::relay::PublishedTrack;
use crate::session::{ConnectionState, PeerSession};
use crate::transport::MediaKind;

/// Peer identity inside a room (the username).
pub type PeerId = String;

/// Identifies one relay binding so a finished relay task can only remove the
/// entry it created.
pub type BindingId = u64;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Per-member role tag.  The room's host is the member holding `Publisher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        }
    }
}

// ---------------------------------------------------------------------------
// TrackKey
// ---------------------------------------------------------------------------

/// (publisher peer id, source track id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TrackKey {
    pub publisher: PeerId,
    pub track_id: String,
}

impl TrackKey {
    pub fn new(publisher: impl Into<String>, track_id: impl Into<String>) -> Self {
        Self {
            publisher: publisher.into(),
            track_id: track_id.into(),
        }
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.publisher, self.track_id)
    }
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

struct Member {
    session: Arc<PeerSession>,
    role: Role,
}

#[derive(Default)]
struct RoomState {
    /// Current publisher, or `None` when the room is publisher-less.
    host: Option<PeerId>,
    /// Set once the reserved host (the creator) has actually joined.
    host_claimed: bool,
    members: HashMap<PeerId, Member>,
    published: HashMap<TrackKey, Arc<PublishedTrack>>,
    bindings: HashMap<TrackKey, HashMap<PeerId, BindingId>>,
    next_binding: BindingId,
    closed: bool,
}

/// A set of peer sessions sharing one media topology.
///
/// All state sits behind a single lock that is only held for in-memory
/// mutation, never across an `.await`.
pub struct Room {
    id: String,
    creator: String,
    created_at: DateTime<Utc>,
    state: Mutex<RoomState>,
}

/// The room was deleted; no new members are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomClosed;

/// Everything a departing member leaves behind.
pub struct Departure {
    pub session: Arc<PeerSession>,
    pub role: Role,
    pub was_host: bool,
    /// Tracks the member was publishing, already removed from the room.
    pub withdrawn: Vec<Arc<PublishedTrack>>,
}

/// Result of removing a single binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unbound {
    /// The binding was already gone or had been replaced.
    Stale,
    /// Removed; `last` is true when no subscriber remains on that track.
    Removed { last: bool },
}

impl Room {
    /// Create a room with `creator` reserved as host.
    pub fn new(id: impl Into<String>, creator: impl Into<String>) -> Self {
        let creator = creator.into();
        Self {
            id: id.into(),
            state: Mutex::new(RoomState {
                host: Some(creator.clone()),
                ..Default::default()
            }),
            creator,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    pub fn host(&self) -> Option<PeerId> {
        self.state.lock().host.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // ── Membership ──────────────────────────────────────────────────────

    /// Add a member.  A session already registered under the same peer id is
    /// evicted and returned; the host role survives such a replacement.
    pub fn add_peer(&self, session: Arc<PeerSession>) -> Result<Option<Departure>, RoomClosed> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RoomClosed);
        }

        let peer_id = session.peer_id().to_string();
        let is_host = state.host.as_deref() == Some(peer_id.as_str());
        let replaced = if state.members.contains_key(&peer_id) {
            evict(&mut state, &peer_id, is_host)
        } else {
            None
        };

        let role = if is_host {
            state.host_claimed = true;
            Role::Publisher
        } else {
            Role::Subscriber
        };
        state.members.insert(peer_id, Member { session, role });
        Ok(replaced)
    }

    /// Remove `session` if it is still the registered member for its peer id.
    /// Returns `None` when it was already removed or replaced.
    pub fn remove_session(&self, session: &PeerSession) -> Option<Departure> {
        let mut state = self.state.lock();
        let current = state.members.get(session.peer_id())?;
        if current.session.session_id() != session.session_id() {
            return None;
        }
        evict(&mut state, session.peer_id(), false)
    }

    /// Remove whichever session is registered under `peer_id`.
    #[cfg(test)]
    pub fn remove_peer(&self, peer_id: &str) -> Option<Departure> {
        evict(&mut self.state.lock(), peer_id, false)
    }

    pub fn role_of(&self, peer_id: &str) -> Option<Role> {
        self.state.lock().members.get(peer_id).map(|m| m.role)
    }

    pub fn session(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.state
            .lock()
            .members
            .get(peer_id)
            .map(|m| Arc::clone(&m.session))
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.state
            .lock()
            .members
            .values()
            .map(|m| Arc::clone(&m.session))
            .collect()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.state.lock().members.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Mark the room closed and cancel every member session.  Each session's
    /// own loop then runs its teardown.
    pub fn shutdown(&self) -> Vec<Arc<PeerSession>> {
        let sessions: Vec<Arc<PeerSession>> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.members.values().map(|m| Arc::clone(&m.session)).collect()
        };
        for session in &sessions {
            session.shutdown();
        }
        sessions
    }

    // ── Published tracks ────────────────────────────────────────────────

    /// Register an inbound track.  Only a current `Publisher` may publish,
    /// and a key is published at most once.
    pub fn publish(&self, track: Arc<PublishedTrack>) -> bool {
        let mut state = self.state.lock();
        let is_publisher = matches!(
            state.members.get(&track.key.publisher),
            Some(Member { role: Role::Publisher, .. })
        );
        if !is_publisher || state.published.contains_key(&track.key) {
            return false;
        }
        state.published.insert(track.key.clone(), track);
        true
    }

    /// Withdraw `track` and every binding on it.  Returns false if this exact
    /// track was no longer published.
    pub fn unpublish(&self, track: &Arc<PublishedTrack>) -> bool {
        let mut state = self.state.lock();
        match state.published.get(&track.key) {
            Some(current) if Arc::ptr_eq(current, track) => {
                state.published.remove(&track.key);
                state.bindings.remove(&track.key);
                true
            }
            _ => false,
        }
    }

    pub fn published_track(&self, key: &TrackKey) -> Option<Arc<PublishedTrack>> {
        self.state.lock().published.get(key).cloned()
    }

    pub fn published_keys(&self) -> BTreeSet<TrackKey> {
        self.state.lock().published.keys().cloned().collect()
    }

    // ── Bindings ────────────────────────────────────────────────────────

    /// Tracks `subscriber` should currently be receiving: everything
    /// published by another member holding the publisher role.
    pub fn desired_bindings(&self, subscriber: &str) -> BTreeSet<TrackKey> {
        let state = self.state.lock();
        if !state.members.contains_key(subscriber) {
            return BTreeSet::new();
        }
        state
            .published
            .keys()
            .filter(|key| key.publisher != subscriber)
            .filter(|key| {
                matches!(
                    state.members.get(&key.publisher),
                    Some(Member { role: Role::Publisher, .. })
                )
            })
            .cloned()
            .collect()
    }

    /// Record that `subscriber` now receives `key`.  Fails when the binding is
    /// no longer wanted by the time it is created, or when `subscriber` has
    /// been replaced by a newer session for the same peer.
    pub fn bind(&self, key: &TrackKey, subscriber: &PeerSession) -> Option<BindingId> {
        let mut state = self.state.lock();
        let peer_id = subscriber.peer_id();
        let is_member = state
            .members
            .get(peer_id)
            .is_some_and(|m| m.session.session_id() == subscriber.session_id());
        let valid = is_member
            && key.publisher != peer_id
            && state.published.contains_key(key)
            && state.host.as_deref() == Some(key.publisher.as_str());
        if !valid {
            return None;
        }
        state.next_binding += 1;
        let id = state.next_binding;
        state
            .bindings
            .entry(key.clone())
            .or_default()
            .insert(peer_id.to_string(), id);
        Some(id)
    }

    /// Remove a binding, but only if it is still the one identified by `id`.
    pub fn unbind(&self, key: &TrackKey, subscriber: &str, id: BindingId) -> Unbound {
        let mut state = self.state.lock();
        let Some(subscribers) = state.bindings.get_mut(key) else {
            return Unbound::Stale;
        };
        if subscribers.get(subscriber) != Some(&id) {
            return Unbound::Stale;
        }
        subscribers.remove(subscriber);
        let last = subscribers.is_empty();
        if last {
            state.bindings.remove(key);
        }
        Unbound::Removed { last }
    }

    /// Snapshot of every live binding.
    pub fn bindings(&self) -> BTreeMap<TrackKey, BTreeSet<PeerId>> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|(_, subs)| !subs.is_empty())
            .map(|(key, subs)| (key.clone(), subs.keys().cloned().collect()))
            .collect()
    }

    /// `host` is empty, a current member, or the creator's reservation that
    /// has not been claimed yet.
    pub fn host_is_consistent(&self) -> bool {
        let state = self.state.lock();
        match state.host.as_deref() {
            None => true,
            Some(host) if state.members.contains_key(host) => true,
            Some(host) => !state.host_claimed && host == self.creator,
        }
    }

    // ── Summary ─────────────────────────────────────────────────────────

    pub fn info(&self) -> RoomInfo {
        let state = self.state.lock();

        let mut peers: Vec<PeerInfo> = state
            .members
            .iter()
            .map(|(peer_id, m)| PeerInfo {
                peer_id: peer_id.clone(),
                role: m.role,
                state: m.session.state(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let mut tracks: Vec<TrackInfo> = state
            .published
            .values()
            .map(|t| TrackInfo {
                publisher: t.key.publisher.clone(),
                track_id: t.key.track_id.clone(),
                kind: t.kind,
            })
            .collect();
        tracks.sort_by(|a, b| (&a.publisher, &a.track_id).cmp(&(&b.publisher, &b.track_id)));

        let mut bindings: Vec<BindingInfo> = state
            .bindings
            .iter()
            .filter(|(_, subs)| !subs.is_empty())
            .map(|(key, subs)| {
                let mut subscribers: Vec<PeerId> = subs.keys().cloned().collect();
                subscribers.sort();
                BindingInfo {
                    publisher: key.publisher.clone(),
                    track_id: key.track_id.clone(),
                    subscribers,
                }
            })
            .collect();
        bindings.sort_by(|a, b| (&a.publisher, &a.track_id).cmp(&(&b.publisher, &b.track_id)));

        RoomInfo {
            id: self.id.clone(),
            creator: self.creator.clone(),
            host: state.host.clone(),
            created_at: self.created_at,
            peers,
            tracks,
            bindings,
        }
    }
}

/// Remove `peer_id` and everything hanging off it.  With `keep_host` the
/// host field is left pointing at the peer id (replacement in progress).
fn evict(state: &mut RoomState, peer_id: &str, keep_host: bool) -> Option<Departure> {
    let member = state.members.remove(peer_id)?;

    let was_host = state.host.as_deref() == Some(peer_id);
    if was_host && !keep_host {
        state.host = None;
    }

    let withdrawn_keys: Vec<TrackKey> = state
        .published
        .keys()
        .filter(|key| key.publisher == peer_id)
        .cloned()
        .collect();
    let mut withdrawn = Vec::with_capacity(withdrawn_keys.len());
    for key in withdrawn_keys {
        state.bindings.remove(&key);
        if let Some(track) = state.published.remove(&key) {
            withdrawn.push(track);
        }
    }

    for subscribers in state.bindings.values_mut() {
        subscribers.remove(peer_id);
    }
    state.bindings.retain(|_, subs| !subs.is_empty());

    Some(Departure {
        session: member.session,
        role: member.role,
        was_host: was_host && !keep_host,
        withdrawn,
    })
}

// ---------------------------------------------------------------------------
// Serialisable summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub id: String,
    pub creator: String,
    pub host: Option<String>,
    pub created_at: DateTime<Utc>,
    pub peers: Vec<PeerInfo>,
    pub tracks: Vec<TrackInfo>,
    pub bindings: Vec<BindingInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub role: Role,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackInfo {
    pub publisher: String,
    pub track_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindingInfo {
    pub publisher: String,
    pub track_id: String,
    pub subscribers: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
