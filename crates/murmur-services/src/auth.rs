//! Bearer token acquisition from the token-issuing endpoint.
//!
//! The token is opaque: it is fetched, attached to the transport handshake,
//! and never parsed here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token issuer unreachable: {0}")]
    Unreachable(String),
    #[error("login rejected: {status} {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid login response: {0}")]
    InvalidResponse(String),
    #[error("login timed out")]
    Timeout,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<String, AuthError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    device_id: &'a str,
    device_secret: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
}

/// Logs in with device credentials over HTTP: `POST {deviceId, deviceSecret}`
/// → `{accessToken}`.
pub struct HttpTokenProvider {
    client: reqwest::Client,
    url: String,
    device_id: String,
    device_secret: String,
}

impl HttpTokenProvider {
    pub fn new(
        url: impl Into<String>,
        device_id: impl Into<String>,
        device_secret: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            device_id: device_id.into(),
            device_secret: device_secret.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self) -> Result<String, AuthError> {
        tracing::debug!(device_id = %self.device_id, url = %self.url, "logging in");
        let response = self
            .client
            .post(&self.url)
            .json(&LoginRequest {
                device_id: &self.device_id,
                device_secret: &self.device_secret,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthError::Timeout
                } else {
                    AuthError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        tracing::info!(device_id = %self.device_id, "login successful");
        Ok(login.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_request_uses_camel_case_fields() {
        let body = serde_json::to_value(LoginRequest {
            device_id: "device-001",
            device_secret: "secret-001",
        })
        .unwrap();
        assert_eq!(body["deviceId"], "device-001");
        assert_eq!(body["deviceSecret"], "secret-001");
    }

    #[test]
    fn login_response_reads_access_token() {
        let r: LoginResponse = serde_json::from_str(r#"{"accessToken":"tok"}"#).unwrap();
        assert_eq!(r.access_token, "tok");
    }

    #[tokio::test]
    async fn unreachable_issuer_is_an_auth_failure() {
        let p = HttpTokenProvider::new("http://127.0.0.1:9/auth/login", "d", "s");
        assert!(matches!(
            p.fetch_token().await,
            Err(AuthError::Unreachable(_))
        ));
    }
}
