//! Email provider client used for digests

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vigil_common::config::EmailConfig;

use super::{provider_url, EmailSender};

/// Provider outcome classes; the digest aggregator picks retry/opt-out from these
#[derive(Debug, Error, PartialEq)]
pub enum EmailError {
    #[error("Email provider rate limited the request")]
    RateLimited,

    /// Address rejected or hard-bounced; never retried
    #[error("Invalid recipient address: {0}")]
    InvalidAddress(String),

    #[error("Email provider error {0}")]
    ServerError(u16),

    #[error("Email provider rejected request with {0}")]
    ClientError(u16),

    #[error("Network error: {0}")]
    Network(String),
}

impl EmailError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmailError::RateLimited | EmailError::ServerError(_))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Serialize)]
struct SendEmail<'a> {
    to: &'a str,
    from: &'a str,
    subject: &'a str,
    html: &'a str,
}

#[derive(Deserialize)]
struct EmailAccepted {
    id: String,
}

#[derive(Deserialize)]
struct ProviderError {
    code: Option<String>,
    message: Option<String>,
}

pub struct HttpEmailSender {
    http: reqwest::Client,
    config: EmailConfig,
}

impl HttpEmailSender {
    pub fn new(config: EmailConfig, timeout: Duration) -> Result<Self, EmailError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmailError::Network(e.to_string()))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send_email(&self, message: &EmailMessage) -> Result<String, EmailError> {
        let response = self
            .http
            .post(provider_url(&self.config.base_url, "emails"))
            .bearer_auth(&self.config.api_key)
            .json(&SendEmail {
                to: &message.to,
                from: &self.config.from,
                subject: &message.subject,
                html: &message.html,
            })
            .send()
            .await
            .map_err(|e| EmailError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            let accepted: EmailAccepted = response
                .json()
                .await
                .map_err(|e| EmailError::Network(format!("unreadable provider response: {}", e)))?;
            return Ok(accepted.id);
        }

        match status {
            429 => Err(EmailError::RateLimited),
            500..=599 => Err(EmailError::ServerError(status)),
            422 => {
                let detail = response.json::<ProviderError>().await.ok();
                classify_rejection(status, detail)
            }
            _ => Err(EmailError::ClientError(status)),
        }
    }
}

fn classify_rejection(status: u16, detail: Option<ProviderError>) -> Result<String, EmailError> {
    match detail {
        Some(ProviderError { code: Some(code), message })
            if code == "invalid_address" || code == "hard_bounce" =>
        {
            Err(EmailError::InvalidAddress(message.unwrap_or(code)))
        }
        _ => Err(EmailError::ClientError(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_bounce_is_invalid_address() {
        let detail = ProviderError {
            code: Some("hard_bounce".into()),
            message: None,
        };
        assert_eq!(
            classify_rejection(422, Some(detail)),
            Err(EmailError::InvalidAddress("hard_bounce".into()))
        );
    }

    #[test]
    fn test_other_422_is_client_error() {
        let detail = ProviderError {
            code: Some("template_missing".into()),
            message: Some("no".into()),
        };
        assert_eq!(classify_rejection(422, Some(detail)), Err(EmailError::ClientError(422)));
        assert_eq!(classify_rejection(422, None), Err(EmailError::ClientError(422)));
    }

    #[test]
    fn test_retryable_classes() {
        assert!(EmailError::RateLimited.is_retryable());
        assert!(EmailError::ServerError(503).is_retryable());
        assert!(!EmailError::ClientError(400).is_retryable());
        assert!(!EmailError::InvalidAddress("x".into()).is_retryable());
    }
}
