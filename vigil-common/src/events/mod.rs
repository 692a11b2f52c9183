//! Event types for the Vigil event system
//!
//! Provides the shared event definitions and the topic-aware EventBus that
//! stands in for the external pub/sub broker.

mod alert_types;

pub use alert_types::{AlertEvent, GeoPoint, Tier};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Logical topics carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    HighThreat,
    MediumThreat,
    WebhookFanout,
    /// Work distribution from the orchestrator to the poll worker
    DeferredScans,
    /// Quota warnings and other per-account notices
    AccountNotices,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::HighThreat => "high-threat",
            Topic::MediumThreat => "medium-threat",
            Topic::WebhookFanout => "webhook-fanout",
            Topic::DeferredScans => "deferred-scans",
            Topic::AccountNotices => "account-notices",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vigil event types
///
/// Every event belongs to exactly one [`Topic`]; consumers filter on
/// [`ThreatEvent::topic`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ThreatEvent {
    /// Scan accepted by the resolver but not yet complete
    ///
    /// Consumed by the poll worker, which owns the scan until it reaches a
    /// terminal state.
    ScanDeferred {
        scan_id: Uuid,
        account_id: String,
        job_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Classified result ready for channel dispatch
    AlertRaised { alert: AlertEvent },

    /// Summary of one webhook fan-out pass
    WebhookFanout {
        scan_id: Uuid,
        account_id: String,
        delivered: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },

    /// Account crossed the quota warning ratio (debounced to once per 24h)
    QuotaWarning {
        account_id: String,
        used: i64,
        limit: i64,
        timestamp: DateTime<Utc>,
    },
}

impl ThreatEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ThreatEvent::ScanDeferred { .. } => Topic::DeferredScans,
            ThreatEvent::AlertRaised { alert } => match alert.tier {
                Tier::High => Topic::HighThreat,
                // LOW alerts are not published; grouped with medium if ever sent
                Tier::Medium | Tier::Low => Topic::MediumThreat,
            },
            ThreatEvent::WebhookFanout { .. } => Topic::WebhookFanout,
            ThreatEvent::QuotaWarning { .. } => Topic::AccountNotices,
        }
    }
}

/// Event a consumer could not process
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub topic: Topic,
    pub event: ThreatEvent,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Topics whose events are units of work rather than notifications
///
/// Each gets a bounded queue with exactly one consumer, so a burst of
/// unrelated events can never push work out of the ring.
pub const WORK_TOPICS: [Topic; 3] = [Topic::DeferredScans, Topic::HighThreat, Topic::MediumThreat];

/// Central event distribution bus
///
/// Two delivery paths:
/// - Work topics ([`WORK_TOPICS`]) go to a bounded per-topic queue claimed by
///   one consumer via [`EventBus::take_work_queue`]. A full or abandoned
///   queue dead-letters the event instead of dropping it.
/// - Every event is also broadcast to observers ([`EventBus::subscribe`]).
///   Observers that fall behind see `Lagged` and lose events.
///
/// Failed deliveries are parked in a per-topic dead-letter sink, capped at
/// `capacity` entries (oldest dropped first).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ThreatEvent>,
    capacity: usize,
    work_tx: Arc<HashMap<Topic, mpsc::Sender<ThreatEvent>>>,
    work_rx: Arc<Mutex<HashMap<Topic, mpsc::Receiver<ThreatEvent>>>>,
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// The same capacity bounds the observer ring, each work queue and the
    /// dead-letter sink.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        let mut work_tx = HashMap::new();
        let mut work_rx = HashMap::new();
        for topic in WORK_TOPICS {
            let (queue_tx, queue_rx) = mpsc::channel(capacity);
            work_tx.insert(topic, queue_tx);
            work_rx.insert(topic, queue_rx);
        }
        Self {
            tx,
            capacity,
            work_tx: Arc::new(work_tx),
            work_rx: Arc::new(Mutex::new(work_rx)),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to all future events as an observer
    pub fn subscribe(&self) -> broadcast::Receiver<ThreatEvent> {
        self.tx.subscribe()
    }

    /// Claim the single consumer end of a work topic's queue
    ///
    /// Returns `None` for non-work topics and once the queue has been taken.
    /// Events published before the queue is claimed wait in it.
    pub fn take_work_queue(&self, topic: Topic) -> Option<mpsc::Receiver<ThreatEvent>> {
        self.work_rx.lock().unwrap_or_else(|e| e.into_inner()).remove(&topic)
    }

    /// Publish an event
    ///
    /// Returns the number of deliveries: the work queue (if the topic has one
    /// and accepted the event) plus observers. An event nobody accepted is
    /// moved to the dead-letter sink of its topic and `0` is returned.
    pub fn publish(&self, event: ThreatEvent) -> usize {
        let topic = event.topic();
        let observers = self.tx.receiver_count();
        if observers > 0 {
            let _ = self.tx.send(event.clone());
        }

        let Some(queue) = self.work_tx.get(&topic) else {
            if observers == 0 {
                tracing::error!(topic = %topic, "No subscribers for event, dead-lettering");
                self.dead_letter(event, "no subscribers");
            }
            return observers;
        };

        match queue.try_send(event) {
            Ok(()) => observers + 1,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::error!(topic = %topic, "Work queue full, dead-lettering");
                self.dead_letter(event, "work queue full");
                observers
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::error!(topic = %topic, "Work queue consumer gone, dead-lettering");
                self.dead_letter(event, "no consumer");
                observers
            }
        }
    }

    /// Broadcast an event to observers, ignoring if nobody is listening
    pub fn publish_lossy(&self, event: ThreatEvent) {
        let _ = self.tx.send(event);
    }

    /// Park an event that could not be processed
    pub fn dead_letter(&self, event: ThreatEvent, reason: impl Into<String>) {
        let entry = DeadLetter {
            topic: event.topic(),
            event,
            reason: reason.into(),
            failed_at: Utc::now(),
        };
        let mut sink = self.dead_letters.lock().unwrap_or_else(|e| e.into_inner());
        if sink.len() >= self.capacity {
            sink.remove(0);
        }
        sink.push(entry);
    }

    /// Snapshot of dead letters for one topic
    pub fn dead_letters(&self, topic: Topic) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|d| d.topic == topic)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(tier: Tier) -> AlertEvent {
        AlertEvent {
            scan_id: Uuid::new_v4(),
            account_id: "acct-1".to_string(),
            tier,
            score: 91.0,
            subject_id: Some("subject-9".to_string()),
            location: None,
            view_url: None,
            raised_at: Utc::now(),
        }
    }

    #[test]
    fn test_alert_topic_follows_tier() {
        let high = ThreatEvent::AlertRaised { alert: alert(Tier::High) };
        let medium = ThreatEvent::AlertRaised { alert: alert(Tier::Medium) };
        assert_eq!(high.topic(), Topic::HighThreat);
        assert_eq!(medium.topic(), Topic::MediumThreat);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        // Observer plus the high-threat work queue
        let receivers = bus.publish(ThreatEvent::AlertRaised { alert: alert(Tier::High) });
        assert_eq!(receivers, 2);

        match rx.recv().await.unwrap() {
            ThreatEvent::AlertRaised { alert } => assert_eq!(alert.tier, Tier::High),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    fn deferred(job_id: &str) -> ThreatEvent {
        ThreatEvent::ScanDeferred {
            scan_id: Uuid::new_v4(),
            account_id: "acct-1".to_string(),
            job_id: job_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn quota_warning() -> ThreatEvent {
        ThreatEvent::QuotaWarning {
            account_id: "acct-1".to_string(),
            used: 90,
            limit: 100,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_notice_without_subscribers_dead_letters() {
        let bus = EventBus::new(16);
        let receivers = bus.publish(quota_warning());

        assert_eq!(receivers, 0);
        let parked = bus.dead_letters(Topic::AccountNotices);
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].reason, "no subscribers");
        assert!(bus.dead_letters(Topic::HighThreat).is_empty());
    }

    #[tokio::test]
    async fn test_work_survives_a_burst_of_notices() {
        let bus = EventBus::new(2);
        let mut observer = bus.subscribe();

        assert_eq!(bus.publish(deferred("job-1")), 2);
        for _ in 0..3 {
            bus.publish(quota_warning());
        }

        // The observer ring overflowed...
        assert!(matches!(
            observer.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        // ...but the deferred scan is still queued for its consumer
        let mut queue = bus.take_work_queue(Topic::DeferredScans).unwrap();
        match queue.recv().await.unwrap() {
            ThreatEvent::ScanDeferred { job_id, .. } => assert_eq!(job_id, "job-1"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(bus.dead_letters(Topic::DeferredScans).is_empty());
    }

    #[test]
    fn test_work_queue_is_claimed_once() {
        let bus = EventBus::new(4);
        assert!(bus.take_work_queue(Topic::HighThreat).is_some());
        assert!(bus.take_work_queue(Topic::HighThreat).is_none());
        assert!(bus.take_work_queue(Topic::AccountNotices).is_none());
    }

    #[test]
    fn test_full_or_abandoned_work_queue_dead_letters() {
        let bus = EventBus::new(1);
        assert_eq!(bus.publish(deferred("job-1")), 1);
        assert_eq!(bus.publish(deferred("job-2")), 0);

        let parked = bus.dead_letters(Topic::DeferredScans);
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].reason, "work queue full");

        drop(bus.take_work_queue(Topic::MediumThreat));
        bus.publish(ThreatEvent::AlertRaised { alert: alert(Tier::Medium) });
        assert_eq!(bus.dead_letters(Topic::MediumThreat)[0].reason, "no consumer");
    }

    #[test]
    fn test_dead_letter_sink_is_bounded() {
        let bus = EventBus::new(2);
        for _ in 0..5 {
            bus.dead_letter(ThreatEvent::AlertRaised { alert: alert(Tier::High) }, "boom");
        }
        assert_eq!(bus.dead_letters(Topic::HighThreat).len(), 2);
    }
}
