use crate::error::{HomologyError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

const SERVICE: &str = "auth";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenInfo {
    pub user: String,
}

#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Resolves a caller token to its user, or fails with `Unauthorized`.
    async fn validate_token(&self, token: &str) -> Result<TokenInfo>;
}

#[derive(Debug, Clone)]
pub struct HttpAuthClient {
    client: reqwest::Client,
    auth_url: String,
}

impl HttpAuthClient {
    pub fn new(client: reqwest::Client, auth_url: &str) -> Self {
        Self {
            client,
            auth_url: auth_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AuthClient for HttpAuthClient {
    async fn validate_token(&self, token: &str) -> Result<TokenInfo> {
        let response = self
            .client
            .get(format!("{}/api/V2/token", self.auth_url))
            .header(reqwest::header::AUTHORIZATION, token)
            .send()
            .await
            .map_err(|e| HomologyError::from_transport(SERVICE, "Could not reach auth service", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| HomologyError::from_transport(SERVICE, "Could not read auth reply", e))?;
        if status.is_client_error() {
            return Err(HomologyError::Unauthorized(auth_error_message(&text)));
        }
        if !status.is_success() {
            return Err(HomologyError::backend(
                SERVICE,
                format!("Auth service returned HTTP {status}: {text}"),
            ));
        }
        serde_json::from_str(&text)
            .map_err(|e| HomologyError::backend(SERVICE, format!("Could not parse auth reply: {e}")))
    }
}

/// The auth service replies `{"error": {"message": ..}}` on rejection.
fn auth_error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "Invalid token".to_string())
}
