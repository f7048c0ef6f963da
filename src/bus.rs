//! Topic-based publish/subscribe for state-change events
//!
//! Each subscriber owns a bounded `mpsc` channel filtered by a topic set.
//! Publishing never blocks longer than `publish_timeout` per subscriber; a
//! subscriber that cannot keep up misses the event. Closed subscribers are
//! pruned on the next publish. Delivery is at-least-once per live subscriber
//! with no retry.

use crate::core::{OrchestratorError, PoolId, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;
use uuid::Uuid;

/// Event topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// A pool was registered
    #[serde(rename = "pool.registered")]
    PoolRegistered,
    /// A pool was unregistered
    #[serde(rename = "pool.removed")]
    PoolRemoved,
    /// A worker changed lifecycle state
    #[serde(rename = "worker.status_changed")]
    WorkerStatusChanged,
    /// A scale operation started or completed
    #[serde(rename = "pool.scaling")]
    PoolScaling,
    /// A task was handed to a worker
    #[serde(rename = "task.dispatched")]
    TaskDispatched,
    /// A dispatch finished
    #[serde(rename = "task.completed")]
    TaskCompleted,
    /// A pool status changed
    #[serde(rename = "pool.health_changed")]
    PoolHealthChanged,
}

impl Topic {
    /// Every topic
    pub const ALL: [Topic; 7] = [
        Topic::PoolRegistered,
        Topic::PoolRemoved,
        Topic::WorkerStatusChanged,
        Topic::PoolScaling,
        Topic::TaskDispatched,
        Topic::TaskCompleted,
        Topic::PoolHealthChanged,
    ];

    /// Dotted topic name
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PoolRegistered => "pool.registered",
            Topic::PoolRemoved => "pool.removed",
            Topic::WorkerStatusChanged => "worker.status_changed",
            Topic::PoolScaling => "pool.scaling",
            Topic::TaskDispatched => "task.dispatched",
            Topic::TaskCompleted => "task.completed",
            Topic::PoolHealthChanged => "pool.health_changed",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        Topic::ALL
            .iter()
            .copied()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| OrchestratorError::invalid_config("topic", format!("unknown topic '{}'", s)))
    }
}

/// One published event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier
    pub id: Uuid,
    /// Topic
    pub topic: Topic,
    /// Pool the event concerns, if any
    pub pool_id: Option<PoolId>,
    /// Publication time
    pub timestamp: DateTime<Utc>,
    /// Topic-specific body
    pub payload: Value,
}

impl Event {
    /// Build an event stamped now
    pub fn new(topic: Topic, pool_id: Option<PoolId>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            pool_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// External consumer that receives every event
///
/// Implementations must not block; the bus calls them inline.
pub trait EventSink: Send + Sync {
    /// Receive one event serialized as JSON
    fn publish(&self, topic: &str, payload: &Value);
}

/// Bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Channel capacity per subscriber
    pub subscriber_capacity: usize,
    /// Longest a publish waits on one subscriber
    #[serde(with = "crate::core::duration_millis")]
    pub publish_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            publish_timeout: Duration::from_millis(100),
        }
    }
}

impl BusConfig {
    /// Set the per-subscriber capacity
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    /// Set the publish timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.subscriber_capacity == 0 {
            return Err(OrchestratorError::invalid_config(
                "subscriber_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Events published
    pub published: u64,
    /// Deliveries into subscriber channels
    pub delivered: u64,
    /// Deliveries missed by slow subscribers
    pub dropped: u64,
    /// Live subscribers
    pub subscribers: usize,
}

struct Subscriber {
    id: u64,
    topics: Option<HashSet<Topic>>,
    sender: mpsc::Sender<Event>,
}

impl Subscriber {
    fn wants(&self, topic: Topic) -> bool {
        self.topics.as_ref().map_or(true, |set| set.contains(&topic))
    }
}

/// Receiving end of a subscription
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Subscription identifier, for `MessageBus::unsubscribe`
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event; `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Take an event if one is queued
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

/// In-process message bus
pub struct MessageBus {
    config: BusConfig,
    subscribers: RwLock<Vec<Subscriber>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    /// Counters shared with spawned deliveries
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.config)
            .field("subscribers", &self.subscribers.read().len())
            .field("sinks", &self.sinks.read().len())
            .finish()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl MessageBus {
    /// Create a bus
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            subscribers: RwLock::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            delivered: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to `topics`; an empty slice means every topic
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.config.subscriber_capacity.max(1));
        let topics = if topics.is_empty() {
            None
        } else {
            Some(topics.iter().copied().collect())
        };
        self.subscribers.write().push(Subscriber {
            id,
            topics,
            sender,
        });
        Subscription { id, receiver }
    }

    /// Drop a subscription
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    /// Attach an external sink
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Counters since creation
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            subscribers: self.subscribers.read().len(),
        }
    }

    /// Publish and wait for every delivery attempt
    ///
    /// Returns the number of subscribers that received the event.
    pub async fn publish(&self, event: Event) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.forward_to_sinks(&event);

        let targets: Vec<(u64, mpsc::Sender<Event>)> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.wants(event.topic))
            .map(|s| (s.id, s.sender.clone()))
            .collect();

        let timeout = self.config.publish_timeout;
        let attempts = targets.into_iter().map(|(id, sender)| {
            let event = event.clone();
            async move { (id, sender.send_timeout(event, timeout).await) }
        });

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, result) in futures::future::join_all(attempts).await {
            match result {
                Ok(()) => delivered += 1,
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => self.record_drop(id, event.topic),
                Err(mpsc::error::SendTimeoutError::Closed(_)) => closed.push(id),
            }
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.prune(&closed);
        delivered
    }

    /// Fire-and-forget publish
    ///
    /// Subscribers with free capacity get the event immediately, preserving
    /// emission order; full ones get a spawned delivery bounded by
    /// `publish_timeout`. Outside a runtime, full subscribers miss the event.
    pub fn emit(&self, topic: Topic, pool_id: Option<PoolId>, payload: Value) {
        let event = Event::new(topic, pool_id, payload);
        self.published.fetch_add(1, Ordering::Relaxed);
        self.forward_to_sinks(&event);

        let mut closed = Vec::new();
        let mut delivered = 0u64;
        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter().filter(|s| s.wants(topic)) {
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Closed(_)) => closed.push(subscriber.id),
                    Err(TrySendError::Full(event)) => {
                        self.deliver_later(subscriber.id, subscriber.sender.clone(), event)
                    }
                }
            }
        }
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.prune(&closed);
    }

    fn deliver_later(&self, id: u64, sender: mpsc::Sender<Event>, event: Event) {
        let topic = event.topic;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let timeout = self.config.publish_timeout;
                let delivered = Arc::clone(&self.delivered);
                let dropped = Arc::clone(&self.dropped);
                handle.spawn(async move {
                    if sender.send_timeout(event, timeout).await.is_ok() {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    } else {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(subscriber = id, topic = %topic, "Subscriber missed event");
                        crate::tracing::metrics::record_event_dropped(topic.as_str());
                    }
                });
            }
            Err(_) => self.record_drop(id, topic),
        }
    }

    fn record_drop(&self, id: u64, topic: Topic) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(subscriber = id, topic = %topic, "Subscriber missed event");
        crate::tracing::metrics::record_event_dropped(topic.as_str());
    }

    fn forward_to_sinks(&self, event: &Event) {
        let sinks = self.sinks.read().clone();
        if sinks.is_empty() {
            return;
        }
        match serde_json::to_value(event) {
            Ok(value) => {
                for sink in sinks {
                    sink.publish(event.topic.as_str(), &value);
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize event for sinks"),
        }
    }

    fn prune(&self, closed: &[u64]) {
        if !closed.is_empty() {
            self.subscribers.write().retain(|s| !closed.contains(&s.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_topic_names_round_trip() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
        assert!("pool.unknown".parse::<Topic>().is_err());
        assert_eq!(
            serde_json::to_value(Topic::PoolHealthChanged).unwrap(),
            json!("pool.health_changed")
        );
    }

    #[tokio::test]
    async fn test_subscribers_receive_filtered_topics() {
        let bus = MessageBus::default();
        let mut pools = bus.subscribe(&[Topic::PoolRegistered]);
        let mut all = bus.subscribe(&[]);

        bus.emit(Topic::TaskDispatched, None, json!({"task_id": "t1"}));
        bus.emit(Topic::PoolRegistered, None, json!({"name": "p1"}));

        let event = pools.recv().await.unwrap();
        assert_eq!(event.topic, Topic::PoolRegistered);
        assert!(pools.try_recv().is_none());

        assert_eq!(all.recv().await.unwrap().topic, Topic::TaskDispatched);
        assert_eq!(all.recv().await.unwrap().topic, Topic::PoolRegistered);
    }

    #[tokio::test]
    async fn test_slow_subscriber_misses_events() {
        let bus = MessageBus::new(
            BusConfig::default()
                .with_subscriber_capacity(1)
                .with_publish_timeout(Duration::from_millis(10)),
        );
        let mut slow = bus.subscribe(&[]);

        let first = bus.publish(Event::new(Topic::TaskCompleted, None, json!(1))).await;
        let second = bus.publish(Event::new(Topic::TaskCompleted, None, json!(2))).await;
        assert_eq!((first, second), (1, 0));

        let stats = bus.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(slow.recv().await.unwrap().payload, json!(1));
    }

    #[tokio::test]
    async fn test_late_emit_deliveries_are_counted() {
        let bus = MessageBus::new(
            BusConfig::default()
                .with_subscriber_capacity(1)
                .with_publish_timeout(Duration::from_millis(500)),
        );
        let mut slow = bus.subscribe(&[]);

        bus.emit(Topic::TaskCompleted, None, json!(1));
        bus.emit(Topic::TaskCompleted, None, json!(2));
        assert_eq!(slow.recv().await.unwrap().payload, json!(1));
        assert_eq!(slow.recv().await.unwrap().payload, json!(2));

        for _ in 0..100 {
            if bus.stats().delivered == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = bus.stats();
        assert_eq!((stats.published, stats.delivered, stats.dropped), (2, 2, 0));
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let bus = MessageBus::default();
        let sub = bus.subscribe(&[]);
        drop(sub);
        bus.publish(Event::new(Topic::PoolRemoved, None, json!({}))).await;
        assert_eq!(bus.stats().subscribers, 0);

        let sub = bus.subscribe(&[]);
        bus.unsubscribe(sub.id());
        assert_eq!(bus.stats().subscribers, 0);
    }

    struct RecordingSink(Mutex<Vec<String>>);

    impl EventSink for RecordingSink {
        fn publish(&self, topic: &str, payload: &Value) {
            assert_eq!(payload["topic"], topic);
            self.0.lock().push(topic.to_string());
        }
    }

    #[test]
    fn test_sinks_receive_every_event() {
        let bus = MessageBus::default();
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        bus.add_sink(sink.clone());

        bus.emit(Topic::PoolScaling, None, json!({"from": 1, "to": 2}));
        bus.emit(Topic::PoolRemoved, None, json!({}));

        assert_eq!(
            *sink.0.lock(),
            vec!["pool.scaling".to_string(), "pool.removed".to_string()]
        );
    }
}
