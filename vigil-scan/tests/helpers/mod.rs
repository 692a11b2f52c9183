//! Test Helper Utilities
//!
//! Shared utilities for vigil-scan integration tests

#![allow(dead_code)]

pub mod db_utils;
pub mod fakes;
pub mod harness;
pub mod stub_servers;

pub use db_utils::{create_test_db, seed_contactable_account, test_config};
pub use fakes::{FakeEmail, FakePush, FakeSms, FakeWebhook};
pub use harness::Harness;
pub use stub_servers::{completed_job, pending_job, spawn_redirector, spawn_router, StubResolver};

use std::future::Future;
use std::time::Duration;

/// Poll `check` every 10 ms until it returns true or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
