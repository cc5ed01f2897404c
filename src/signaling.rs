// src/signaling.rs
//
// Signaling channel: the wire envelope, the per-session message loop, and
// the WebSocket adapter behind `GET /ws`.
//
// ─ Wire format ──────────────────────────────────────────────────────────────
//
//   { "event": "offer" | "answer" | "candidate",
//     "data": "<sdp or candidate>",
//     "generation": 7 }
//
//   Server offers carry their generation; the peer must echo it on the
//   answer.  Peer offers and candidates may omit it.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::{SplitSink, Stream, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::error::ApiError;
use crate::room::Room;
use crate::session::{ConnectionState, PeerSession, SessionError};
use crate::sfu::JoinRequest;
use crate::transport::SessionEvent;
use crate::AppState;

// ─── Envelope ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalEvent {
    Offer,
    Answer,
    Candidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: SignalEvent,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
}

impl Envelope {
    pub fn offer(sdp: String, generation: u64) -> Self {
        Self {
            event: SignalEvent::Offer,
            data: sdp,
            generation: Some(generation),
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            event: SignalEvent::Answer,
            data: sdp,
            generation: None,
        }
    }

    pub fn candidate(candidate: String) -> Self {
        Self {
            event: SignalEvent::Candidate,
            data: candidate,
            generation: None,
        }
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, SignalError> {
        serde_json::to_string(self).map_err(|e| SignalError::Write(e.to_string()))
    }
}

// ─── Channel abstraction ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signaling channel closed")]
    Closed,
    #[error("signaling read failed: {0}")]
    Read(String),
    #[error("signaling write failed: {0}")]
    Write(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Write half of a peer's signaling channel.  Callers serialise access.
#[async_trait]
pub trait SignalSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SignalError>;
    async fn close(&mut self) -> Result<(), SignalError>;
}

pub struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl SignalSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), SignalError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| SignalError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SignalError> {
        let _ = self.0.send(Message::Close(None)).await;
        self.0
            .close()
            .await
            .map_err(|e| SignalError::Write(e.to_string()))
    }
}

/// Inbound frames as a stream of text payloads.  Control frames are
/// swallowed; a close frame ends the channel.  Binary frames must be UTF-8.
fn inbound_frames(
    stream: impl Stream<Item = Result<Message, axum::Error>> + Send,
) -> impl Stream<Item = Result<String, SignalError>> + Send {
    stream.filter_map(|frame| async move {
        match frame {
            Ok(Message::Text(text)) => Some(Ok(text)),
            Ok(Message::Binary(bytes)) => Some(
                String::from_utf8(bytes).map_err(|e| SignalError::Malformed(e.to_string())),
            ),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Ok(Message::Close(_)) => Some(Err(SignalError::Closed)),
            Err(e) => Some(Err(SignalError::Read(e.to_string()))),
        }
    })
}

// ─── Session loop ───────────────────────────────────────────────────────────

/// Why a session loop stopped.
#[derive(Debug)]
pub enum SessionExit {
    /// Shut down from outside (room deleted, replaced by a newer join).
    Cancelled,
    /// The peer closed the signaling channel.
    ChannelClosed,
    ChannelError(SignalError),
    Failed(SessionError),
}

impl SessionExit {
    /// State to record before the session is closed.
    pub fn terminal_state(&self) -> Option<ConnectionState> {
        match self {
            Self::ChannelClosed | Self::ChannelError(_) => Some(ConnectionState::Disconnected),
            Self::Failed(e) if !e.is_protocol() => Some(ConnectionState::Failed),
            _ => None,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Cancelled => "cancelled".to_string(),
            Self::ChannelClosed => "channel closed".to_string(),
            Self::ChannelError(e) => e.to_string(),
            Self::Failed(e) => e.to_string(),
        }
    }
}

/// The single reader for one session: inbound signaling frames and the
/// session's event queue, processed one at a time.
pub async fn run_session_loop<S>(
    broadcaster: &Broadcaster,
    room: &Arc<Room>,
    session: &Arc<PeerSession>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    inbound: S,
) -> SessionExit
where
    S: Stream<Item = Result<String, SignalError>>,
{
    futures::pin_mut!(inbound);
    let cancel = session.cancel_token();

    loop {
        let step = tokio::select! {
            _ = cancel.cancelled() => return SessionExit::Cancelled,
            frame = inbound.next() => match frame {
                Some(Ok(text)) => session.handle_signal(&text).await,
                Some(Err(SignalError::Closed)) | None => return SessionExit::ChannelClosed,
                Some(Err(SignalError::Malformed(reason))) => {
                    return SessionExit::Failed(SessionError::Protocol(reason))
                }
                Some(Err(e)) => return SessionExit::ChannelError(e),
            },
            Some(event) = events.recv() => handle_event(broadcaster, room, session, event).await,
        };
        if let Err(e) = step {
            return SessionExit::Failed(e);
        }
    }
}

async fn handle_event(
    broadcaster: &Broadcaster,
    room: &Arc<Room>,
    session: &Arc<PeerSession>,
    event: SessionEvent,
) -> Result<(), SessionError> {
    match event {
        SessionEvent::Track(track) => {
            broadcaster.relay().publish(room, session, track);
            Ok(())
        }
        SessionEvent::IceCandidate(candidate) => {
            session.send(&Envelope::candidate(candidate)).await?;
            Ok(())
        }
        SessionEvent::StateChanged(state) => session.on_transport_state(state),
        SessionEvent::Renegotiate => broadcaster.reconcile(room, session).await,
    }
}

// ─── WebSocket endpoint ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct JoinQuery {
    pub room: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// `GET /ws?room=&username=&password=`
///
/// Credentials and the room are checked before the upgrade so failures get
/// a status code; after the upgrade every failure is a channel closure.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JoinQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let request = JoinRequest {
        room: query.room,
        username: query.username,
        password: query.password,
    };
    let admission = state.sfu.authorize(&request).await?;

    let ws = ws.map_err(|e| ApiError::upgrade_failed(e.to_string()))?;
    let sfu = Arc::clone(&state.sfu);

    info!(room_id = %admission.room.id(), peer_id = %admission.username, "upgrading signaling channel");
    Ok(ws.on_upgrade(move |socket: WebSocket| async move {
        let (sink, stream) = socket.split();
        let room = Arc::clone(&admission.room);
        match sfu.join(admission, Box::new(WsSink(sink))).await {
            Ok((session, events)) => {
                sfu.serve(room, session, events, inbound_frames(stream)).await;
            }
            Err(e) => warn!(room_id = %room.id(), "join after upgrade failed: {e}"),
        }
        debug!("signaling socket finished");
    }))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
