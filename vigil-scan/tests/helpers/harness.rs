//! Fully wired pipeline over a stub resolver and fake channels

use std::sync::Arc;

use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use vigil_common::config::TomlConfig;
use vigil_common::EventBus;
use vigil_scan::channels::{EmailSender, PushSender, SmsSender, WebhookSender};
use vigil_scan::services::{CredentialProvider, ResolutionClient, Resolver};
use vigil_scan::{spawn_workers, AppState, Channels};

use super::{create_test_db, test_config, FakeEmail, FakePush, FakeSms, FakeWebhook, StubResolver};

pub struct Harness {
    pub _dir: TempDir,
    pub pool: SqlitePool,
    pub config: TomlConfig,
    pub state: AppState,
    pub sms: Arc<FakeSms>,
    pub push: Arc<FakePush>,
    pub webhooks: Arc<FakeWebhook>,
    pub email: Arc<FakeEmail>,
    pub cancel: CancellationToken,
}

impl Harness {
    /// Wire everything against `stub` (already spawned at `resolver_base`)
    pub async fn new(resolver_base: &str, sms: FakeSms) -> Self {
        Self::with_config(test_config(resolver_base), sms).await
    }

    pub async fn with_config(config: TomlConfig, sms: FakeSms) -> Self {
        Self::build(config, sms, 256).await
    }

    /// Full control, including the event bus capacity
    pub async fn build(config: TomlConfig, sms: FakeSms, bus_capacity: usize) -> Self {
        let (dir, pool) = create_test_db().await.unwrap();

        let credentials = Arc::new(CredentialProvider::new(pool.clone(), config.resolver.api_key.clone()));
        let resolver: Arc<dyn Resolver> =
            Arc::new(ResolutionClient::new(config.resolver.clone(), credentials).unwrap());

        let sms = Arc::new(sms);
        let push = Arc::new(FakePush::default());
        let webhooks = Arc::new(FakeWebhook::default());
        let email = Arc::new(FakeEmail::default());
        let channels = Channels {
            sms: Some(sms.clone() as Arc<dyn SmsSender>),
            push: Some(push.clone() as Arc<dyn PushSender>),
            webhooks: webhooks.clone() as Arc<dyn WebhookSender>,
            email: Some(email.clone() as Arc<dyn EmailSender>),
        };

        let state = AppState::new(pool.clone(), EventBus::new(bus_capacity), &config, resolver, channels);

        Self {
            _dir: dir,
            pool,
            config,
            state,
            sms,
            push,
            webhooks,
            email,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the poll worker and dispatcher (and digest schedule)
    pub fn start_workers(&self) {
        spawn_workers(&self.state, self.cancel.clone());
    }

    pub async fn with_stub(stub: &StubResolver) -> Self {
        let base = stub.spawn().await;
        Self::new(&base, FakeSms::default()).await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
