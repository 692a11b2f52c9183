//! Alert dispatcher concurrency: webhook fan-out bounds and dispatch gating

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use helpers::{create_test_db, eventually, test_config, FakePush, FakeWebhook};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vigil_common::{AlertEvent, EventBus, ThreatEvent, Tier, Topic};
use vigil_scan::channels::{PushSender, WebhookSender};
use vigil_scan::db;
use vigil_scan::services::{AlertDispatcher, ChannelKind, ChannelOutcome};

fn alert(account_id: &str, tier: Tier) -> AlertEvent {
    AlertEvent {
        scan_id: Uuid::new_v4(),
        account_id: account_id.to_string(),
        tier,
        score: 92.0,
        subject_id: None,
        location: None,
        view_url: None,
        raised_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_webhook_fanout_is_bounded_and_times_out_hung_hooks() {
    let (_dir, pool) = create_test_db().await.unwrap();
    for n in 0..4 {
        db::webhooks::add_subscription(&pool, "acct-w", &format!("https://hooks.example.com/{}", n))
            .await
            .unwrap();
    }

    let webhooks = Arc::new(FakeWebhook {
        hanging_urls: ["https://hooks.example.com/2".to_string()].into_iter().collect(),
        delay: Duration::from_millis(50),
        ..Default::default()
    });
    let mut config = test_config("http://127.0.0.1:9");
    config.alerts.webhook_concurrency = 2;
    config.alerts.webhook_timeout_ms = 200;
    let dispatcher = AlertDispatcher::new(
        pool.clone(),
        EventBus::new(16),
        None,
        None,
        webhooks.clone() as Arc<dyn WebhookSender>,
        &config.alerts,
    );

    let report = tokio::time::timeout(Duration::from_secs(2), dispatcher.dispatch(&alert("acct-w", Tier::High)))
        .await
        .expect("hung webhook must not stall the dispatch");

    assert_eq!(
        report.outcome(ChannelKind::Webhook),
        Some(&ChannelOutcome::Failed {
            error: "3 delivered, 1 failed".to_string()
        })
    );
    assert!(webhooks.in_flight.peak() <= 2, "peak was {}", webhooks.in_flight.peak());
    let posted: Vec<String> = webhooks.posted.lock().unwrap().iter().map(|(url, _)| url.clone()).collect();
    assert_eq!(posted.len(), 3);
    assert!(!posted.contains(&"https://hooks.example.com/2".to_string()));
}

#[tokio::test]
async fn test_dispatch_tasks_are_capped() {
    let (_dir, pool) = create_test_db().await.unwrap();
    db::devices::register_token(&pool, "acct-c", "device-c").await.unwrap();

    let push = Arc::new(FakePush {
        delay: Duration::from_millis(100),
        ..Default::default()
    });
    let mut config = test_config("http://127.0.0.1:9");
    config.alerts.max_concurrent_dispatches = 2;
    let bus = EventBus::new(16);
    let dispatcher = AlertDispatcher::new(
        pool.clone(),
        bus.clone(),
        None,
        Some(push.clone() as Arc<dyn PushSender>),
        Arc::new(FakeWebhook::default()) as Arc<dyn WebhookSender>,
        &config.alerts,
    );

    let cancel = CancellationToken::new();
    let high = bus.take_work_queue(Topic::HighThreat).unwrap();
    let medium = bus.take_work_queue(Topic::MediumThreat).unwrap();
    tokio::spawn(dispatcher.run(high, medium, cancel.clone()));

    for _ in 0..5 {
        bus.publish(ThreatEvent::AlertRaised {
            alert: alert("acct-c", Tier::Medium),
        });
    }

    let push = &push;
    assert!(eventually(Duration::from_secs(5), || async move { push.count() == 5 }).await);
    assert_eq!(push.in_flight.peak(), 2);
    cancel.cancel();
}
