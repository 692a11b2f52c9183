//! Push provider client
//!
//! The provider session is established once per process. Concurrent first
//! callers share a single authentication request through `OnceCell`; a failed
//! attempt leaves the cell empty so the next caller retries.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use vigil_common::config::PushConfig;

use super::{provider_url, ChannelError, PushBatchOutcome, PushNotification, PushSender};

#[derive(Serialize)]
struct AuthRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    access_token: String,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    tokens: &'a [String],
    title: &'a str,
    body: &'a str,
    data: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct BatchResponse {
    results: Vec<TokenResult>,
}

#[derive(Deserialize)]
struct TokenResult {
    token: String,
    ok: bool,
    error: Option<String>,
}

pub struct HttpPushSender {
    http: reqwest::Client,
    config: PushConfig,
    session: OnceCell<String>,
}

impl HttpPushSender {
    pub fn new(config: PushConfig, timeout: Duration) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            config,
            session: OnceCell::new(),
        })
    }

    async fn session_token(&self) -> Result<&str, ChannelError> {
        self.session
            .get_or_try_init(|| self.authenticate())
            .await
            .map(String::as_str)
    }

    async fn authenticate(&self) -> Result<String, ChannelError> {
        tracing::info!("Initializing push provider session");
        let response = self
            .http
            .post(&self.config.auth_url)
            .json(&AuthRequest {
                client_id: &self.config.client_id,
                client_secret: &self.config.client_secret,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Auth(format!("provider returned HTTP {}", status.as_u16())));
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::Parse(e.to_string()))?;
        Ok(auth.access_token)
    }
}

#[async_trait]
impl PushSender for HttpPushSender {
    async fn send_batch(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<PushBatchOutcome, ChannelError> {
        if tokens.is_empty() {
            return Ok(PushBatchOutcome::default());
        }

        let session = self.session_token().await?;
        let response = self
            .http
            .post(provider_url(&self.config.base_url, "batch"))
            .bearer_auth(session)
            .json(&BatchRequest {
                tokens,
                title: &notification.title,
                body: &notification.body,
                data: &notification.data,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Http(status.as_u16()));
        }

        let batch: BatchResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::Parse(e.to_string()))?;

        let mut outcome = PushBatchOutcome::default();
        for result in batch.results {
            if result.ok {
                outcome.delivered += 1;
            } else {
                let reason = result.error.unwrap_or_else(|| "unknown".to_string());
                outcome.failed.push((result.token, reason));
            }
        }
        Ok(outcome)
    }
}
