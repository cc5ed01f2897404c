use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::auth::AuthError;
use crate::sfu::JoinError;

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// Structured API error that serializes to JSON.
///
/// ```json
/// {
///   "error": {
///     "code": "room_not_found",
///     "message": "Room 'abc123' does not exist.",
///     "status": 404
///   }
/// }
/// ```
#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

// ─── IntoResponse ───────────────────────────────────────────────────────────

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        } else if self.status.is_client_error() {
            tracing::warn!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
            },
        };

        (self.status, Json(envelope)).into_response()
    }
}

// ─── Conversions ────────────────────────────────────────────────────────────

impl From<JoinError> for ApiError {
    fn from(err: JoinError) -> Self {
        match err {
            JoinError::MissingCredentials => Self::bad_request(err.to_string()),
            JoinError::InvalidCredentials => Self::credentials_invalid(),
            JoinError::UnknownRoom(ref room_id) => Self::room_not_found(room_id),
            JoinError::CredentialStore(_) | JoinError::Transport(_) => {
                Self::internal(err.to_string())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidUsername | AuthError::InvalidPassword => {
                Self::bad_request(err.to_string())
            }
            AuthError::UserExists => Self {
                code: "user_exists",
                message: err.to_string(),
                status: StatusCode::CONFLICT,
            },
            AuthError::Store(_) => Self::internal(err.to_string()),
        }
    }
}

// ─── Generic constructors ───────────────────────────────────────────────────

impl ApiError {
    /// 400 Bad Request with a custom message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            code: "bad_request",
            message: msg.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    /// 500 Internal Server Error with a custom message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: "internal_server_error",
            message: msg.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    // ─── Domain-specific constructors ───────────────────────────────────

    /// 401 — the `Authorization` header is missing or malformed.
    pub fn auth_header_missing() -> Self {
        Self {
            code: "auth_header_missing",
            message: "Authorization header is missing or malformed.".into(),
            status: StatusCode::UNAUTHORIZED,
        }
    }

    /// 401 — unknown user or wrong password.
    pub fn credentials_invalid() -> Self {
        Self {
            code: "credentials_invalid",
            message: "Invalid username or password.".into(),
            status: StatusCode::UNAUTHORIZED,
        }
    }

    /// 404 — the requested room does not exist.
    pub fn room_not_found(room_id: &str) -> Self {
        Self {
            code: "room_not_found",
            message: format!("Room '{room_id}' does not exist."),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 409 — a room with this id already exists.
    pub fn room_exists(room_id: &str) -> Self {
        Self {
            code: "room_exists",
            message: format!("Room '{room_id}' already exists."),
            status: StatusCode::CONFLICT,
        }
    }

    /// 409 — the server holds its maximum number of rooms.
    pub fn room_limit(max_rooms: usize) -> Self {
        Self {
            code: "room_limit_reached",
            message: format!("The server already holds {max_rooms} rooms."),
            status: StatusCode::CONFLICT,
        }
    }

    /// 500 — the WebSocket upgrade could not be performed.
    pub fn upgrade_failed(reason: String) -> Self {
        Self {
            code: "upgrade_failed",
            message: format!("WebSocket upgrade failed: {reason}"),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: ApiError) -> serde_json::Value {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn json_structure() {
        let value = body_json(ApiError::room_not_found("abc123")).await;

        assert_eq!(value["error"]["code"], "room_not_found");
        assert_eq!(value["error"]["message"], "Room 'abc123' does not exist.");
        assert_eq!(value["error"]["status"], 404);
    }

    #[test]
    fn join_errors_map_to_statuses() {
        let cases = [
            (JoinError::MissingCredentials, StatusCode::BAD_REQUEST),
            (JoinError::InvalidCredentials, StatusCode::UNAUTHORIZED),
            (JoinError::UnknownRoom("r1".into()), StatusCode::NOT_FOUND),
            (
                JoinError::CredentialStore("down".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn auth_errors_map_to_statuses() {
        assert_eq!(
            ApiError::from(AuthError::InvalidUsername).status,
            StatusCode::BAD_REQUEST
        );
        let exists = ApiError::from(AuthError::UserExists);
        assert_eq!(exists.status, StatusCode::CONFLICT);
        assert_eq!(exists.code, "user_exists");
    }

    #[tokio::test]
    async fn upgrade_failure_is_500() {
        let value = body_json(ApiError::upgrade_failed("not a websocket".into())).await;
        assert_eq!(value["error"]["code"], "upgrade_failed");
        assert_eq!(value["error"]["status"], 500);
        assert!(value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("not a websocket"));
    }
}
