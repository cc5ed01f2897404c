use std::collections::HashMap;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use thiserror::Error;

use crate::error::ApiError;

// ---------------------------------------------------------------------------
// Credential rules
// ---------------------------------------------------------------------------

const PASSWORD_SPECIALS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?/";

/// 4-32 ASCII letters or digits.
pub fn valid_username(username: &str) -> bool {
    (4..=32).contains(&username.len()) && username.chars().all(|c| c.is_ascii_alphanumeric())
}

/// 4-32 characters from ASCII letters, digits and `!@#$%^&*()_+-=[]{}|;:,.<>?/`.
pub fn valid_password(password: &str) -> bool {
    (4..=32).contains(&password.len())
        && password
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || PASSWORD_SPECIALS.contains(c))
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username: only latin letters and digits, 4-32 chars")]
    InvalidUsername,
    #[error("invalid password: only latin letters, digits and special chars (!@#$%^&*()_+-=[]{{}}|;:,.<>?/), 4-32 chars")]
    InvalidPassword,
    #[error("user already exists")]
    UserExists,
    #[error("credential store failure: {0}")]
    Store(String),
}

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

/// Argon2id PHC string for `password` with a fresh salt.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Store(format!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AuthError::Store(format!("invalid password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Username/password registry consulted before a peer may join.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn create_user(&self, username: &str, password: &str) -> Result<(), AuthError>;

    /// `Ok(false)` for unknown users or a wrong password.
    async fn validate_user(&self, username: &str, password: &str) -> Result<bool, AuthError>;
}

/// Users keyed by name, holding password hashes only.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<String, String>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryUserStore {
    async fn create_user(&self, username: &str, password: &str) -> Result<(), AuthError> {
        if !valid_username(username) {
            return Err(AuthError::InvalidUsername);
        }
        if !valid_password(password) {
            return Err(AuthError::InvalidPassword);
        }
        if self.users.read().contains_key(username) {
            return Err(AuthError::UserExists);
        }

        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| AuthError::Store(e.to_string()))??;

        let mut users = self.users.write();
        if users.contains_key(username) {
            return Err(AuthError::UserExists);
        }
        users.insert(username.to_string(), hash);
        Ok(())
    }

    async fn validate_user(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        if !valid_username(username) {
            return Err(AuthError::InvalidUsername);
        }
        if !valid_password(password) {
            return Err(AuthError::InvalidPassword);
        }
        let Some(hash) = self.users.read().get(username).cloned() else {
            return Ok(false);
        };

        let password = password.to_string();
        tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| AuthError::Store(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Axum helper -- HTTP Basic gate
// ---------------------------------------------------------------------------

/// Decode `Authorization: Basic <base64(user:pass)>`.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Validate Basic credentials against the store and return the username.
pub async fn require_user(
    headers: &HeaderMap,
    users: &dyn CredentialStore,
) -> Result<String, ApiError> {
    let (username, password) =
        basic_credentials(headers).ok_or_else(ApiError::auth_header_missing)?;

    match users.validate_user(&username, &password).await {
        Ok(true) => Ok(username),
        _ => Err(ApiError::credentials_invalid()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
