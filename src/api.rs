use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::activity::{Action, LogEntry};
use crate::auth::AuthError;
use crate::error::ApiError;
use crate::registry::CreateRoomError;
use crate::room::RoomInfo;

// ---------------------------------------------------------------------------
// Request / Response DTOs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateRoomRequest {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct CreateRoomResponse {
    pub id: String,
    pub creator: String,
}

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub username: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<String>,
}

const DEFAULT_LOG_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// POST /api/rooms — create a room owned by the caller
// ---------------------------------------------------------------------------

pub async fn create_room(
    State(state): State<Arc<crate::AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<CreateRoomResponse>), ApiError> {
    let user = crate::auth::require_user(&headers, state.sfu.users().as_ref()).await?;

    let room_id = body.id.trim().to_string();
    if room_id.is_empty() {
        return Err(ApiError::bad_request("Room id must not be empty."));
    }

    match state.sfu.create_room(&room_id, &user) {
        Ok(()) => {}
        Err(CreateRoomError::Exists) => return Err(ApiError::room_exists(&room_id)),
        Err(CreateRoomError::LimitReached(max)) => return Err(ApiError::room_limit(max)),
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateRoomResponse {
            id: room_id,
            creator: user,
        }),
    ))
}

// ---------------------------------------------------------------------------
// GET /api/rooms — list room ids
// ---------------------------------------------------------------------------

pub async fn list_rooms(
    State(state): State<Arc<crate::AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>, ApiError> {
    crate::auth::require_user(&headers, state.sfu.users().as_ref()).await?;

    let mut rooms = state.sfu.registry().list_rooms();
    rooms.sort();
    Ok(Json(rooms))
}

// ---------------------------------------------------------------------------
// GET /api/rooms/:room_id — room summary
// ---------------------------------------------------------------------------

pub async fn get_room(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RoomInfo>, ApiError> {
    crate::auth::require_user(&headers, state.sfu.users().as_ref()).await?;

    let room = state
        .sfu
        .registry()
        .get_room(&room_id)
        .ok_or_else(|| ApiError::room_not_found(&room_id))?;

    Ok(Json(room.info()))
}

// ---------------------------------------------------------------------------
// DELETE /api/rooms/:room_id — idempotent
// ---------------------------------------------------------------------------

pub async fn delete_room(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user = crate::auth::require_user(&headers, state.sfu.users().as_ref()).await?;

    if !state.sfu.delete_room(&room_id, &user) {
        info!(room_id = %room_id, user = %user, "delete of absent room ignored");
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// POST /api/register, POST /api/login
// ---------------------------------------------------------------------------

pub async fn register(
    State(state): State<Arc<crate::AppState>>,
    Json(body): Json<Credentials>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    state
        .sfu
        .users()
        .create_user(&body.username, &body.password)
        .await?;

    info!(username = %body.username, "user registered");
    state
        .sfu
        .activity()
        .record(&body.username, Action::Registration, "Account created");

    Ok((
        StatusCode::CREATED,
        Json(UserResponse {
            username: body.username,
        }),
    ))
}

pub async fn login(
    State(state): State<Arc<crate::AppState>>,
    Json(body): Json<Credentials>,
) -> Result<Json<UserResponse>, ApiError> {
    match state
        .sfu
        .users()
        .validate_user(&body.username, &body.password)
        .await
    {
        Ok(true) => {
            state
                .sfu
                .activity()
                .record(&body.username, Action::Login, "Logged in");
            Ok(Json(UserResponse {
                username: body.username,
            }))
        }
        Ok(false) => {
            state
                .sfu
                .activity()
                .record(&body.username, Action::LoginFailed, "Wrong password");
            Err(ApiError::credentials_invalid())
        }
        Err(AuthError::InvalidUsername) | Err(AuthError::InvalidPassword) => {
            Err(ApiError::credentials_invalid())
        }
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// GET /api/logs?limit=N — the caller's own activity
// ---------------------------------------------------------------------------

pub async fn user_logs(
    State(state): State<Arc<crate::AppState>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let user = crate::auth::require_user(&headers, state.sfu.users().as_ref()).await?;

    let limit = match query.limit.as_deref() {
        None => DEFAULT_LOG_LIMIT,
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ApiError::bad_request("limit must be a positive integer."))?,
    };

    let entries = state
        .sfu
        .activity()
        .log()
        .get_logs(&user, limit)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(entries))
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub async fn health(State(state): State<Arc<crate::AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms_active": state.sfu.registry().len(),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::InMemoryActivityLog;
    use crate::auth::InMemoryUserStore;
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::registry::InMemoryRegistry;
    use crate::relay::RelayConfig;
    use crate::sfu::Sfu;
    use crate::transport::fake::{wait_until_async, FakeTransport};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn app_state(max_rooms: usize) -> Arc<crate::AppState> {
        let sfu = Sfu::new(
            Arc::new(InMemoryRegistry::new(max_rooms)),
            FakeTransport::new(),
            Arc::new(InMemoryUserStore::new()),
            Arc::new(InMemoryActivityLog::new()),
            EventBus::new(),
            RelayConfig::default(),
        );
        Arc::new(crate::AppState {
            sfu: Arc::new(sfu),
            config: Config {
                max_rooms,
                ..Config::default()
            },
        })
    }

    fn basic(user: &str, pass: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let token = STANDARD.encode(format!("{user}:{pass}"));
        headers.insert("authorization", format!("Basic {token}").parse().unwrap());
        headers
    }

    fn creds(user: &str, pass: &str) -> Json<Credentials> {
        Json(Credentials {
            username: user.into(),
            password: pass.into(),
        })
    }

    async fn registered(max_rooms: usize) -> Arc<crate::AppState> {
        let state = app_state(max_rooms);
        register(State(state.clone()), creds("alice", "secret"))
            .await
            .unwrap();
        state
    }

    fn room(id: &str) -> Json<CreateRoomRequest> {
        Json(CreateRoomRequest { id: id.into() })
    }

    #[tokio::test]
    async fn register_twice_conflicts() {
        let state = registered(10).await;
        let err = register(State(state.clone()), creds("alice", "other"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err = register(State(state), creds("al", "secret"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn login_records_success_and_failure() {
        let state = registered(10).await;

        let err = login(State(state.clone()), creds("alice", "nope1"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "credentials_invalid");
        login(State(state.clone()), creds("alice", "secret"))
            .await
            .unwrap();

        let log = Arc::clone(state.sfu.activity().log());
        wait_until_async(|| {
            let log = Arc::clone(&log);
            async move {
                let actions: Vec<Action> = log
                    .get_logs("alice", 10)
                    .await
                    .unwrap()
                    .iter()
                    .map(|e| e.action)
                    .collect();
                actions.len() == 3
                    && [Action::Registration, Action::LoginFailed, Action::Login]
                        .iter()
                        .all(|a| actions.contains(a))
            }
        })
        .await;
    }

    #[tokio::test]
    async fn room_crud() {
        let state = registered(10).await;
        let auth = basic("alice", "secret");

        let (status, Json(created)) = create_room(State(state.clone()), auth.clone(), room("r1"))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.creator, "alice");

        let err = create_room(State(state.clone()), auth.clone(), room("r1"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "room_exists");

        let Json(rooms) = list_rooms(State(state.clone()), auth.clone()).await.unwrap();
        assert_eq!(rooms, vec!["r1".to_string()]);

        let Json(info) = get_room(State(state.clone()), Path("r1".into()), auth.clone())
            .await
            .unwrap();
        assert_eq!(info.host.as_deref(), Some("alice"));
        assert!(info.peers.is_empty());

        for _ in 0..2 {
            let status = delete_room(State(state.clone()), Path("r1".into()), auth.clone())
                .await
                .unwrap();
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
        let err = get_room(State(state), Path("r1".into()), auth)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn room_limit_is_a_conflict() {
        let state = registered(1).await;
        let auth = basic("alice", "secret");

        create_room(State(state.clone()), auth.clone(), room("r1"))
            .await
            .unwrap();
        let err = create_room(State(state), auth, room("r2")).await.unwrap_err();
        assert_eq!(err.code, "room_limit_reached");
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn rooms_require_credentials() {
        let state = registered(10).await;
        let err = list_rooms(State(state.clone()), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let err = create_room(State(state), basic("alice", "wrong1"), room("r1"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "credentials_invalid");
    }

    #[tokio::test]
    async fn logs_limit_must_be_positive() {
        let state = registered(10).await;
        let auth = basic("alice", "secret");

        for bad in ["0", "-3", "ten"] {
            let query = LogsQuery {
                limit: Some(bad.into()),
            };
            let err = user_logs(State(state.clone()), auth.clone(), Query(query))
                .await
                .unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST);
        }

        let log = Arc::clone(state.sfu.activity().log());
        wait_until_async(|| {
            let log = Arc::clone(&log);
            async move { !log.get_logs("alice", 1).await.unwrap().is_empty() }
        })
        .await;
        let Json(entries) = user_logs(State(state), auth, Query(LogsQuery::default()))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, Action::Registration);
    }
}
