//! In-process channel fakes that record every call

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use vigil_scan::channels::{
    ChannelError, EmailError, EmailMessage, EmailSender, PushBatchOutcome, PushNotification, PushSender,
    SmsSender, WebhookSender,
};

/// Counts calls currently in flight and remembers the highest count
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements on drop, so calls cancelled by a timeout are counted out too
struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeSms {
    pub sent: Mutex<Vec<(String, String)>>,
    pub fail: bool,
}

impl FakeSms {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl SmsSender for FakeSms {
    async fn send_sms(&self, to: &str, body: &str) -> Result<String, ChannelError> {
        if self.fail {
            return Err(ChannelError::Http(500));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), body.to_string()));
        Ok(format!("sms-{}", sent.len()))
    }
}

#[derive(Default)]
pub struct FakePush {
    pub batches: Mutex<Vec<(Vec<String>, PushNotification)>>,
    /// Tokens the provider reports as undeliverable
    pub rejected: HashSet<String>,
    /// Latency of every batch
    pub delay: Duration,
    pub in_flight: InFlight,
}

impl FakePush {
    pub fn count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl PushSender for FakePush {
    async fn send_batch(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<PushBatchOutcome, ChannelError> {
        let _guard = self.in_flight.enter();
        tokio::time::sleep(self.delay).await;
        self.batches
            .lock()
            .unwrap()
            .push((tokens.to_vec(), notification.clone()));

        let mut outcome = PushBatchOutcome::default();
        for token in tokens {
            if self.rejected.contains(token) {
                outcome.failed.push((token.clone(), "unregistered".to_string()));
            } else {
                outcome.delivered += 1;
            }
        }
        Ok(outcome)
    }
}

#[derive(Default)]
pub struct FakeWebhook {
    pub posted: Mutex<Vec<(String, serde_json::Value)>>,
    pub failing_urls: HashSet<String>,
    /// URLs that never answer
    pub hanging_urls: HashSet<String>,
    /// Latency of every answered post
    pub delay: Duration,
    pub in_flight: InFlight,
}

impl FakeWebhook {
    pub fn count(&self) -> usize {
        self.posted.lock().unwrap().len()
    }
}

#[async_trait]
impl WebhookSender for FakeWebhook {
    async fn post(&self, url: &str, payload: &serde_json::Value) -> Result<(), ChannelError> {
        let _guard = self.in_flight.enter();
        if self.hanging_urls.contains(url) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;
        self.posted
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));
        if self.failing_urls.contains(url) {
            return Err(ChannelError::Http(502));
        }
        Ok(())
    }
}

/// Email fake; pops scripted results first, then succeeds
#[derive(Default)]
pub struct FakeEmail {
    pub sent: Mutex<Vec<EmailMessage>>,
    pub script: Mutex<VecDeque<Result<String, EmailError>>>,
}

impl FakeEmail {
    pub fn scripted(results: Vec<Result<String, EmailError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl EmailSender for FakeEmail {
    async fn send_email(&self, message: &EmailMessage) -> Result<String, EmailError> {
        self.sent.lock().unwrap().push(message.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("email-ok".to_string()))
    }
}
