// src/activity.rs
//
// Per-user activity log.  Writes from the signaling path are fire-and-forget:
// the recorder spawns the write and only logs a failure locally.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Registration,
    Login,
    LoginFailed,
    RoomCreated,
    RoomDeleted,
    JoinedRoom,
    LeftRoom,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Login => "login",
            Self::LoginFailed => "login_failed",
            Self::RoomCreated => "room_created",
            Self::RoomDeleted => "room_deleted",
            Self::JoinedRoom => "joined_room",
            Self::LeftRoom => "left_room",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub details: String,
}

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("activity store failure: {0}")]
    Store(String),
}

/// Append-only per-user log.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn add_log(&self, username: &str, action: Action, details: String)
        -> Result<(), ActivityError>;

    /// The newest `limit` entries, oldest first.
    async fn get_logs(&self, username: &str, limit: usize) -> Result<Vec<LogEntry>, ActivityError>;
}

#[derive(Default)]
pub struct InMemoryActivityLog {
    entries: Mutex<HashMap<String, Vec<LogEntry>>>,
}

impl InMemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActivityLog for InMemoryActivityLog {
    async fn add_log(
        &self,
        username: &str,
        action: Action,
        details: String,
    ) -> Result<(), ActivityError> {
        self.entries
            .lock()
            .entry(username.to_string())
            .or_default()
            .push(LogEntry {
                timestamp: Utc::now(),
                action,
                details,
            });
        Ok(())
    }

    async fn get_logs(&self, username: &str, limit: usize) -> Result<Vec<LogEntry>, ActivityError> {
        let entries = self.entries.lock();
        let Some(log) = entries.get(username) else {
            return Ok(Vec::new());
        };
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }
}

/// Non-blocking front for an `ActivityLog`.
#[derive(Clone)]
pub struct ActivityRecorder {
    log: Arc<dyn ActivityLog>,
}

impl ActivityRecorder {
    pub fn new(log: Arc<dyn ActivityLog>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &Arc<dyn ActivityLog> {
        &self.log
    }

    pub fn record(&self, username: &str, action: Action, details: impl Into<String>) {
        let log = Arc::clone(&self.log);
        let username = username.to_string();
        let details = details.into();
        tokio::spawn(async move {
            if let Err(e) = log.add_log(&username, action, details).await {
                warn!(username = %username, action = action.as_str(), "activity log write failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::wait_until_async;

    #[tokio::test]
    async fn newest_entries_in_chronological_order() {
        let log = InMemoryActivityLog::new();
        for i in 0..5 {
            log.add_log("alice", Action::Login, format!("#{i}")).await.unwrap();
        }

        let last = log.get_logs("alice", 2).await.unwrap();
        let details: Vec<_> = last.iter().map(|e| e.details.as_str()).collect();
        assert_eq!(details, vec!["#3", "#4"]);

        assert_eq!(log.get_logs("alice", 50).await.unwrap().len(), 5);
        assert!(log.get_logs("nobody", 50).await.unwrap().is_empty());
    }

    #[test]
    fn actions_serialise_as_snake_case() {
        let json = serde_json::to_string(&Action::LoginFailed).unwrap();
        assert_eq!(json, "\"login_failed\"");
        assert_eq!(Action::JoinedRoom.as_str(), "joined_room");
    }

    struct FailingLog;

    #[async_trait]
    impl ActivityLog for FailingLog {
        async fn add_log(&self, _: &str, _: Action, _: String) -> Result<(), ActivityError> {
            Err(ActivityError::Store("down".into()))
        }

        async fn get_logs(&self, _: &str, _: usize) -> Result<Vec<LogEntry>, ActivityError> {
            Err(ActivityError::Store("down".into()))
        }
    }

    #[tokio::test]
    async fn recorder_writes_in_background() {
        let log = Arc::new(InMemoryActivityLog::new());
        let recorder = ActivityRecorder::new(log.clone());
        recorder.record("alice", Action::JoinedRoom, "Joined room r1");

        wait_until_async(|| {
            let log = Arc::clone(&log);
            async move { log.get_logs("alice", 10).await.unwrap().len() == 1 }
        })
        .await;

        // Failures never reach the caller.
        ActivityRecorder::new(Arc::new(FailingLog)).record("alice", Action::Login, "x");
    }
}
