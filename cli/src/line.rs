use std::time::Duration;

use pantry_core::broadcast::{
    BroadcastRequest, LINE_BROADCAST_URL, LINE_TOKEN_ENV, ListLine, SendOutcome,
};
use pantry_core::{Error, Result, UpstreamError};
use tracing::{info, warn};

/// Where the channel access token comes from.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Read `LINE_CHANNEL_ACCESS_TOKEN` on every send.
    FromEnv,
    Fixed(Option<String>),
}

/// Client for the LINE Messaging API broadcast endpoint.
pub struct LineClient {
    client: reqwest::Client,
    endpoint: String,
    credentials: Credentials,
}

impl LineClient {
    pub fn new(endpoint: impl Into<String>, credentials: Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "pantry/{} (household manager)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| UpstreamError::DeliveryFailed(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            credentials,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(LINE_BROADCAST_URL, Credentials::FromEnv)
    }

    fn token(&self) -> Option<String> {
        let token = match &self.credentials {
            Credentials::FromEnv => std::env::var(LINE_TOKEN_ENV).ok(),
            Credentials::Fixed(token) => token.clone(),
        };
        token.filter(|t| !t.trim().is_empty())
    }

    /// Broadcast a rendered shopping list. An empty list is not sent.
    pub async fn broadcast(&self, lines: &[ListLine]) -> Result<SendOutcome> {
        let Some(body) = BroadcastRequest::for_lines(lines) else {
            return Ok(SendOutcome::no_items());
        };
        let token = self
            .token()
            .ok_or(UpstreamError::MissingCredentials(LINE_TOKEN_ENV))?;

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::DeliveryFailed(e.to_string()))?;

        let status = resp.status();
        let request_id = resp
            .headers()
            .get("x-line-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let text = match resp.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!(%request_id, error = %e, "failed to read LINE response body");
                String::new()
            }
        };
        info!(%request_id, status = status.as_u16(), "LINE broadcast response");

        if status != reqwest::StatusCode::OK {
            warn!(%request_id, body = %text, "LINE broadcast rejected");
            return Err(Error::from(UpstreamError::Rejected {
                status: status.as_u16(),
                body: text,
            }));
        }

        Ok(SendOutcome::sent(lines.len()))
    }
}
