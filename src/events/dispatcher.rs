//! Consumer registration and event fan-out
//!
//! The transport (delivery, retries, dead-lettering) lives outside this crate. What lives
//! here is the registration contract: a consumer names itself, declares the event types it
//! wants, and returns the signals it emitted for each event.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::debug;

use crate::core::errors::{DetectionError, Result};
use crate::detection::signals::GeneratedSignal;
use crate::events::types::{DomainEvent, EventType};

/// An independent detector registered against a set of event types.
///
/// `handle` must not fail: storage problems are logged inside the consumer and surface as
/// fewer signals.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Stable consumer name
    fn name(&self) -> &str;

    /// Event types this consumer is interested in
    fn event_types(&self) -> &[EventType];

    /// Analyze one event and return the signals that were emitted
    async fn handle(&self, event: &DomainEvent) -> Vec<GeneratedSignal>;
}

/// Signals one consumer produced for one event
#[derive(Debug, Clone)]
pub struct ConsumerReport {
    pub consumer: String,
    pub signals: Vec<GeneratedSignal>,
}

/// Startup-built consumer registry
#[derive(Default)]
pub struct Dispatcher {
    consumers: Vec<Arc<dyn Consumer>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer. Names must be unique.
    pub fn register(&mut self, consumer: Arc<dyn Consumer>) -> Result<()> {
        if self.consumers.iter().any(|c| c.name() == consumer.name()) {
            return Err(DetectionError::Configuration(format!(
                "consumer '{}' registered twice",
                consumer.name()
            )));
        }
        debug!(
            consumer = consumer.name(),
            event_types = consumer.event_types().len(),
            "Registered consumer"
        );
        self.consumers.push(consumer);
        Ok(())
    }

    /// Fan one event out to every interested consumer.
    ///
    /// Consumers run concurrently; reports come back in registration order.
    pub async fn dispatch(&self, event: &DomainEvent) -> Vec<ConsumerReport> {
        let interested: Vec<&Arc<dyn Consumer>> = self
            .consumers
            .iter()
            .filter(|c| c.event_types().contains(&event.event_type))
            .collect();

        if interested.is_empty() {
            debug!(event_id = %event.id, event_type = %event.event_type, "No consumer for event");
            return Vec::new();
        }

        let runs = interested.iter().map(|consumer| async move {
            ConsumerReport {
                consumer: consumer.name().to_string(),
                signals: consumer.handle(event).await,
            }
        });
        join_all(runs).await
    }

    pub fn count(&self) -> usize {
        self.consumers.len()
    }

    pub fn consumer_names(&self) -> Vec<&str> {
        self.consumers.iter().map(|c| c.name()).collect()
    }
}
