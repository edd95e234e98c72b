//! Behavioral consumers
//!
//! Each consumer is registered independently, reads history through [`DetectionStore`] and
//! writes through [`SignalSink`]. Windows are anchored at the event timestamp.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::detection::persist::SignalSink;
use crate::detection::signals::{Evidence, GeneratedSignal};
use crate::events::types::DomainEvent;

pub mod booking;
pub mod contact_change;
pub mod correlation;
pub mod leakage;
pub mod payment;
pub mod provider;
pub mod relationship;
pub mod temporal;

pub use booking::BookingAnomalyConsumer;
pub use contact_change::ContactChangeConsumer;
pub use correlation::CorrelationEngine;
pub use leakage::LeakageTracker;
pub use payment::PaymentAnomalyConsumer;
pub use provider::ProviderBehaviorConsumer;
pub use relationship::RelationshipTracker;
pub use temporal::TemporalPatternConsumer;

/// Exclusive upper bound of a window that includes the event itself
pub(crate) fn through(event: &DomainEvent) -> DateTime<Utc> {
    event.timestamp + Duration::milliseconds(1)
}

pub(crate) fn evidence_for(event: &DomainEvent) -> Evidence {
    Evidence::for_event(&event.id, event.timestamp)
}

/// Persist signals attributed to `user_id` and log what was written
pub(crate) async fn emit(
    consumer: &str,
    sink: &SignalSink,
    event: &DomainEvent,
    user_id: &str,
    signals: Vec<GeneratedSignal>,
) -> Vec<GeneratedSignal> {
    if signals.is_empty() {
        return signals;
    }
    let written = sink.persist_all(&event.id, user_id, event.timestamp, signals).await;
    if !written.is_empty() {
        info!(
            consumer,
            event_id = %event.id,
            event_type = %event.event_type,
            user_id,
            signals = written.len(),
            "Anomaly signals emitted"
        );
    }
    written
}
