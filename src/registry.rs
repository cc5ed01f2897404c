use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::room::Room;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CreateRoomError {
    #[error("room already exists")]
    Exists,
    #[error("room limit of {0} reached")]
    LimitReached(usize),
}

/// Process-wide table of rooms.
///
/// Every method is a short critical section; implementations must not do
/// transport or signaling I/O while holding their lock.
pub trait RoomRegistry: Send + Sync {
    /// Install a new room with `creator` as its reserved host.  A taken id
    /// leaves the existing room untouched.
    fn create_room(&self, id: &str, creator: &str) -> Result<(), CreateRoomError>;

    /// Remove a room.  Absent ids are a no-op.
    fn delete_room(&self, id: &str) -> Option<Arc<Room>>;

    fn get_room(&self, id: &str) -> Option<Arc<Room>>;

    /// Snapshot of room ids, in no particular order.
    fn list_rooms(&self) -> Vec<String>;

    fn len(&self) -> usize;
}

/// Single-lock in-memory registry.
pub struct InMemoryRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    max_rooms: usize,
}

impl InMemoryRegistry {
    pub fn new(max_rooms: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_rooms,
        }
    }
}

impl RoomRegistry for InMemoryRegistry {
    fn create_room(&self, id: &str, creator: &str) -> Result<(), CreateRoomError> {
        let mut rooms = self.rooms.write();
        if rooms.contains_key(id) {
            return Err(CreateRoomError::Exists);
        }
        if rooms.len() >= self.max_rooms {
            return Err(CreateRoomError::LimitReached(self.max_rooms));
        }
        rooms.insert(id.to_string(), Arc::new(Room::new(id, creator)));
        debug!(room_id = id, creator, "room installed");
        Ok(())
    }

    fn delete_room(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.write().remove(id)
    }

    fn get_room(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(id).cloned()
    }

    fn list_rooms(&self) -> Vec<String> {
        self.rooms.read().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.rooms.read().len()
    }
}
