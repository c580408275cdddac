//! In-process topic-based event fan-out.
//!
//! Observers subscribe to named topics on an [`EventBus`]. Publishing spawns
//! one task per subscribed observer; a failing or panicking observer is
//! logged and never affects the publisher or the other observers.
//!
//! Worker pools publish lifecycle events here when given a bus (see
//! [`topics`]).
//!
//! # Example
//!
//! ```ignore
//! use redjob::observer::{EventBus, Observer};
//!
//! let bus = EventBus::new();
//! bus.subscribe(topics::JOB_DEAD_LETTERED, Arc::new(PagerObserver::new()));
//! bus.publish(topics::JOB_DEAD_LETTERED, serde_json::json!({ "queue": "emails" }));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error};

/// Topics published by worker pools.
pub mod topics {
    /// An execution succeeded and the envelope was removed.
    pub const JOB_ACKED: &str = "job.acked";
    /// An execution failed and the envelope went back to the queue.
    pub const JOB_RETRIED: &str = "job.retried";
    /// An envelope exhausted its failure budget and was dead-lettered.
    pub const JOB_DEAD_LETTERED: &str = "job.dead_lettered";
    /// An envelope exhausted its failure budget and was dropped.
    pub const JOB_DISCARDED: &str = "job.discarded";
}

/// Receives events for the topics it is subscribed to.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Handles one event.
    async fn handle(&self, topic: &str, data: Value);

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Topic registry with fan-out publishing. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventBus {
    observers: Arc<RwLock<HashMap<String, Vec<Arc<dyn Observer>>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics: Vec<String> = self.observers.read().keys().cloned().collect();
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}

impl EventBus {
    /// Creates a bus without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `observer` to `topic`.
    pub fn subscribe(&self, topic: impl Into<String>, observer: Arc<dyn Observer>) {
        let topic = topic.into();
        debug!(topic = %topic, observer = observer.name(), "Observer subscribed");
        self.observers.write().entry(topic).or_default().push(observer);
    }

    /// Returns the number of observers subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.observers.read().get(topic).map_or(0, Vec::len)
    }

    /// Delivers `data` to every observer of `topic` in its own task.
    ///
    /// Returns the number of observers notified. Must be called inside a
    /// Tokio runtime when the topic has subscribers.
    pub fn publish(&self, topic: &str, data: Value) -> usize {
        let observers = match self.observers.read().get(topic) {
            Some(observers) => observers.clone(),
            None => return 0,
        };

        for observer in &observers {
            let observer = Arc::clone(observer);
            let topic = topic.to_string();
            let data = data.clone();

            tokio::spawn(async move {
                let name = observer.name().to_string();
                let event_topic = topic.clone();
                let delivery =
                    tokio::spawn(async move { observer.handle(&event_topic, data).await });

                if let Err(e) = delivery.await {
                    error!(topic = %topic, observer = %name, error = %e, "Observer panicked");
                }
            });
        }

        observers.len()
    }
}

/// Builds observers for a set of topics.
pub trait ConsumerFactory: Send + Sync {
    /// Creates a fresh observer instance.
    fn create_consumer(&self) -> Arc<dyn Observer>;

    /// Topics the created observers should be subscribed to.
    fn topics(&self) -> Vec<String>;
}

/// Collects factories and subscribes their observers in one step at startup.
#[derive(Default)]
pub struct ConsumerRegistry {
    factories: HashMap<String, Vec<Arc<dyn ConsumerFactory>>>,
}

impl ConsumerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for every topic it names.
    pub fn register(&mut self, factory: Arc<dyn ConsumerFactory>) {
        for topic in factory.topics() {
            self.factories
                .entry(topic)
                .or_default()
                .push(Arc::clone(&factory));
        }
    }

    /// Creates one observer per (topic, factory) pair and subscribes it.
    ///
    /// Returns the number of subscriptions made.
    pub fn initialize(&self, bus: &EventBus) -> usize {
        let mut subscribed = 0;
        for (topic, factories) in &self.factories {
            for factory in factories {
                bus.subscribe(topic.clone(), factory.create_consumer());
                subscribed += 1;
            }
        }
        subscribed
    }
}
