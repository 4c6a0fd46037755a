//! Device login and bearer tokens.
//!
//! Tokens are 32 random bytes, hex-encoded, issued against a provisioned
//! device record and valid for the configured TTL. They live in memory only;
//! a collector restart invalidates every token and devices log in again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use murmur_core::config::DeviceCredential;

use crate::CollectorState;

struct IssuedToken {
    device_id: String,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct TokenStore {
    devices: Arc<HashMap<String, String>>,
    tokens: Arc<DashMap<String, IssuedToken>>,
    ttl: Duration,
}

/// Compare without exiting at the first differing byte. Only the length
/// is observable through timing.
fn secrets_match(expected: &str, given: &str) -> bool {
    let (a, b) = (expected.as_bytes(), given.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl TokenStore {
    pub fn new(devices: &[DeviceCredential], ttl: Duration) -> Self {
        let devices = devices
            .iter()
            .map(|d| (d.device_id.clone(), d.device_secret.clone()))
            .collect();
        Self {
            devices: Arc::new(devices),
            tokens: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Issue a token if the credentials match a provisioned device.
    pub fn login(&self, device_id: &str, device_secret: &str) -> Option<String> {
        let expected = self.devices.get(device_id)?;
        if !secrets_match(expected, device_secret) {
            return None;
        }
        let token = hex::encode(rand::random::<[u8; 32]>());
        self.tokens.insert(
            token.clone(),
            IssuedToken {
                device_id: device_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Some(token)
    }

    /// Device id the token was issued to, if it is known and unexpired.
    pub fn validate(&self, token: &str) -> Option<String> {
        let now = Instant::now();
        let device_id = {
            let issued = self.tokens.get(token)?;
            (issued.expires_at > now).then(|| issued.device_id.clone())
        };
        if device_id.is_none() {
            self.tokens.remove(token);
        }
        device_id
    }

    /// Drop expired tokens. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.tokens.len();
        self.tokens.retain(|_, t| t.expires_at > now);
        before - self.tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

// ── /auth/login ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub device_id: String,
    pub device_secret: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
}

pub async fn handle_login(State(state): State<CollectorState>, body: Bytes) -> Response {
    let request: LoginRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable login body");
            return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response();
        }
    };

    match state
        .tokens
        .login(&request.device_id, &request.device_secret)
    {
        Some(access_token) => {
            tracing::info!(device_id = %request.device_id, "device logged in");
            Json(LoginResponse { access_token }).into_response()
        }
        None => {
            tracing::warn!(device_id = %request.device_id, "login rejected");
            (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response()
        }
    }
}
