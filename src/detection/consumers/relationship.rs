//! Relationship graph edges
//!
//! Counts interactions between two users per relationship type in `user_relationships`.
//! Edges are undirected: the pair is stored with the smaller id first. No signals are raised.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::detection::signals::GeneratedSignal;
use crate::events::dispatcher::Consumer;
use crate::events::types::{BookingPayload, DomainEvent, EventType, MessagePayload, PaymentPayload, RatingPayload};
use crate::storage::{DetectionStore, RelationshipType};

pub const NAME: &str = "relationship-tracking";

const EVENT_TYPES: &[EventType] = &[
    EventType::MessageCreated,
    EventType::TransactionCompleted,
    EventType::BookingCompleted,
    EventType::RatingSubmitted,
];

/// One interaction read off an event
#[derive(Debug, Clone, PartialEq)]
struct Interaction {
    from: String,
    to: String,
    kind: RelationshipType,
    value: f64,
}

impl Interaction {
    fn from_event(event: &DomainEvent) -> Option<Self> {
        let (from, to, kind, value) = match event.event_type {
            EventType::MessageCreated => {
                let p = event.payload_as::<MessagePayload>()?;
                (p.sender_id, p.receiver_id, RelationshipType::Messaged, 0.0)
            }
            EventType::TransactionCompleted => {
                let p = event.payload_as::<PaymentPayload>()?;
                (p.user_id, p.counterparty_id?, RelationshipType::Transacted, p.amount)
            }
            EventType::BookingCompleted => {
                let p = event.payload_as::<BookingPayload>()?;
                (p.client_id, p.provider_id, RelationshipType::Booked, p.amount.unwrap_or(0.0))
            }
            EventType::RatingSubmitted => {
                let p = event.payload_as::<RatingPayload>()?;
                (p.client_id, p.provider_id, RelationshipType::Rated, 0.0)
            }
            _ => return None,
        };
        if from.is_empty() || to.is_empty() || from == to {
            return None;
        }
        Some(Self { from, to, kind, value })
    }

    /// Endpoints with the smaller id first
    fn canonical(&self) -> (&str, &str) {
        if self.from < self.to {
            (self.from.as_str(), self.to.as_str())
        } else {
            (self.to.as_str(), self.from.as_str())
        }
    }
}

pub struct RelationshipTracker {
    store: Arc<dyn DetectionStore>,
}

impl RelationshipTracker {
    pub fn new(store: Arc<dyn DetectionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Consumer for RelationshipTracker {
    fn name(&self) -> &str {
        NAME
    }

    fn event_types(&self) -> &[EventType] {
        EVENT_TYPES
    }

    async fn handle(&self, event: &DomainEvent) -> Vec<GeneratedSignal> {
        let Some(interaction) = Interaction::from_event(event) else {
            return Vec::new();
        };
        let (a, b) = interaction.canonical();
        match self
            .store
            .record_interaction(a, b, interaction.kind, interaction.value, event.timestamp)
            .await
        {
            Ok(edge) => debug!(
                consumer = NAME,
                user_a_id = %edge.user_a_id,
                user_b_id = %edge.user_b_id,
                relationship_type = edge.relationship_type.as_str(),
                interactions = edge.interaction_count,
                strength = edge.strength_score(),
                "Relationship updated"
            ),
            Err(e) => warn!(consumer = NAME, event_id = %event.id, error = %e, "Relationship update failed"),
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::FlakyStore;
    use crate::storage::MemoryStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 14, 18, 30, 0).unwrap()
    }

    #[test]
    fn test_self_interaction_is_skipped() {
        let event = DomainEvent::new(
            EventType::RatingSubmitted,
            t0(),
            json!({"client_id": "u-1", "provider_id": "u-1", "score": 5.0}),
        );
        assert_eq!(Interaction::from_event(&event), None);

        let no_counterparty = DomainEvent::new(
            EventType::TransactionCompleted,
            t0(),
            json!({"user_id": "u-1", "amount": 10.0}),
        );
        assert_eq!(Interaction::from_event(&no_counterparty), None);
    }

    #[tokio::test]
    async fn test_both_directions_share_one_edge() {
        let store = Arc::new(MemoryStore::new());
        let tracker = RelationshipTracker::new(store.clone());
        for (i, (from, to)) in [("zoe", "adam"), ("adam", "zoe"), ("zoe", "adam")].into_iter().enumerate() {
            let event = DomainEvent::new(
                EventType::MessageCreated,
                t0() + Duration::minutes(i as i64),
                json!({"sender_id": from, "receiver_id": to, "content": "hi"}),
            );
            assert!(tracker.handle(&event).await.is_empty());
        }

        let edges = store.relationships();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].user_a_id, "adam");
        assert_eq!(edges[0].user_b_id, "zoe");
        assert_eq!(edges[0].interaction_count, 3);
        assert_eq!(edges[0].last_interaction_at, t0() + Duration::minutes(2));
        assert_eq!(edges[0].strength_score(), 0.463);
    }

    #[tokio::test]
    async fn test_transaction_and_booking_values_accumulate() {
        let store = Arc::new(MemoryStore::new());
        let tracker = RelationshipTracker::new(store.clone());
        tracker
            .handle(&DomainEvent::new(
                EventType::TransactionCompleted,
                t0(),
                json!({"user_id": "c-1", "counterparty_id": "p-1", "amount": 75.0}),
            ))
            .await;
        tracker
            .handle(&DomainEvent::new(
                EventType::BookingCompleted,
                t0(),
                json!({"booking_id": "b-1", "client_id": "c-1", "provider_id": "p-1"}),
            ))
            .await;

        let edges = store.relationships();
        let kinds: Vec<_> = edges.iter().map(|e| (e.relationship_type, e.total_value)).collect();
        assert_eq!(
            kinds,
            vec![(RelationshipType::Transacted, 75.0), (RelationshipType::Booked, 0.0)]
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let store = Arc::new(FlakyStore::failing(&["record_interaction"]));
        let tracker = RelationshipTracker::new(store.clone());
        let event = DomainEvent::new(
            EventType::MessageCreated,
            t0(),
            json!({"sender_id": "a", "receiver_id": "b", "content": "hi"}),
        );
        assert!(tracker.handle(&event).await.is_empty());
        assert!(store.inner().relationships().is_empty());
    }
}
