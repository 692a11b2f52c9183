//! SMS provider client (`POST {base}/messages`)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vigil_common::config::SmsConfig;

use super::{provider_url, ChannelError, SmsSender};

#[derive(Serialize)]
struct SendMessage<'a> {
    to: &'a str,
    from: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct MessageAccepted {
    message_id: String,
}

pub struct HttpSmsSender {
    http: reqwest::Client,
    config: SmsConfig,
}

impl HttpSmsSender {
    pub fn new(config: SmsConfig, timeout: Duration) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl SmsSender for HttpSmsSender {
    async fn send_sms(&self, to: &str, body: &str) -> Result<String, ChannelError> {
        let response = self
            .http
            .post(provider_url(&self.config.base_url, "messages"))
            .bearer_auth(&self.config.api_key)
            .json(&SendMessage {
                to,
                from: &self.config.from,
                body,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Http(status.as_u16()));
        }

        let accepted: MessageAccepted = response
            .json()
            .await
            .map_err(|e| ChannelError::Parse(e.to_string()))?;
        tracing::debug!(message_id = %accepted.message_id, "SMS accepted");
        Ok(accepted.message_id)
    }
}
