// src/sse.rs
//
// `GET /api/events?room_id=<id>&types=<t1,t2>` streams lifecycle events as
// Server-Sent Events.  Requires HTTP Basic credentials.
//
//   event: <event type>   (e.g. "participant.joined")
//   id:    <event id>
//   data:  <json envelope>
//
// ────────────────────────────────────────────────────────────────────────────

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use tracing::{info, warn};

use crate::events::{EventType, MeetEvent};

#[derive(Debug, Default, Deserialize)]
pub struct SseQuery {
    pub room_id: Option<String>,
    /// Comma-separated event types, e.g. "participant.joined,track.published".
    pub types: Option<String>,
}

impl SseQuery {
    fn parsed_types(&self) -> Option<Vec<EventType>> {
        self.types.as_ref().map(|s| {
            s.split(',')
                .filter_map(|t| {
                    let trimmed = t.trim();
                    serde_json::from_str::<EventType>(&format!("\"{trimmed}\"")).ok()
                })
                .collect()
        })
    }

    fn matches(&self, event: &MeetEvent) -> bool {
        if let Some(ref room_id) = self.room_id {
            if event.room_id() != room_id {
                return false;
            }
        }
        if let Some(types) = self.parsed_types() {
            if !types.is_empty() && !types.contains(&event.event_type) {
                return false;
            }
        }
        true
    }
}

/// Heartbeat every 15 seconds keeps proxies from closing the stream.
pub async fn sse_events(
    State(state): State<Arc<crate::AppState>>,
    headers: HeaderMap,
    Query(query): Query<SseQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, crate::error::ApiError> {
    let user = crate::auth::require_user(&headers, state.sfu.users().as_ref()).await?;

    let mut rx = state.sfu.bus().subscribe();

    info!(
        user = %user,
        room_id = query.room_id.as_deref().unwrap_or("*"),
        types = query.types.as_deref().unwrap_or("*"),
        "SSE client connected"
    );

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !query.matches(&event) {
                        continue;
                    }
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("SSE: failed to serialize event: {e}");
                            continue;
                        }
                    };
                    yield Ok(SseEvent::default()
                        .event(event.event_type.as_str())
                        .id(event.id.clone())
                        .data(json));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client lagged, skipped {n} events");
                    yield Ok(SseEvent::default()
                        .event("_warning")
                        .data(format!("{{\"message\":\"lagged, skipped {n} events\"}}")));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    info!("SSE: event bus closed, ending stream");
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}
