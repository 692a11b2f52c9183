//! Outbound notification channels
//!
//! Each channel is a trait so the dispatcher and digest aggregator can run
//! against in-process fakes; the `Http*` types are the production
//! implementations.

pub mod email;
pub mod push;
pub mod sms;
pub mod webhook;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use email::{EmailError, EmailMessage, HttpEmailSender};
pub use push::HttpPushSender;
pub use sms::HttpSmsSender;
pub use webhook::HttpWebhookSender;

/// Failure of one channel call; logged and tallied, never propagated past
/// the dispatcher
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider returned HTTP {0}")]
    Http(u16),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        ChannelError::Network(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

/// Per-token outcome of a push batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushBatchOutcome {
    pub delivered: usize,
    /// (token, provider reason)
    pub failed: Vec<(String, String)>,
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Returns the provider message id
    async fn send_sms(&self, to: &str, body: &str) -> Result<String, ChannelError>;
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send_batch(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<PushBatchOutcome, ChannelError>;
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn post(&self, url: &str, payload: &serde_json::Value) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Returns the provider message id
    async fn send_email(&self, message: &EmailMessage) -> Result<String, EmailError>;
}

/// Append `path` to a provider base URL
pub(crate) fn provider_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
