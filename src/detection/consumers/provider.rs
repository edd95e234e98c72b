//! Provider behavior consumer

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

use crate::detection::baseline::{BaselineAnomalyDetector, Confidence, Measurement, Trigger};
use crate::detection::consumers::{emit, evidence_for, through};
use crate::detection::persist::SignalSink;
use crate::detection::signals::{GeneratedSignal, SignalType};
use crate::events::dispatcher::Consumer;
use crate::events::types::{DomainEvent, EventType, ProviderPayload};
use crate::storage::DetectionStore;

pub const NAME: &str = "provider-anomaly-detection";

const EVENT_TYPES: &[EventType] = &[
    EventType::ProviderRegistered,
    EventType::ProviderUpdated,
    EventType::BookingCompleted,
    EventType::BookingCancelled,
    EventType::RatingSubmitted,
];

const DUPLICATE_IDENTITY: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "provider_duplicate_identity",
    signal_type: SignalType::ProviderDuplicateIdentity,
    trigger: Trigger::CountAbove(0.0),
    confidence: Confidence::Fixed(0.8),
};

/// 30-day average completion duration against the 60 days before it
const RESPONSE_DEGRADATION: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "provider_response_degradation",
    signal_type: SignalType::ProviderResponseDegradation,
    trigger: Trigger::RatioAbove(1.5),
    confidence: Confidence::Fixed(0.6),
};

/// 14-day cancel rate against the 76 days before it
const CANCELLATION_SPIKE: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "provider_cancellation_spike",
    signal_type: SignalType::ProviderCancellationSpike,
    trigger: Trigger::RatioAbove(2.0),
    confidence: Confidence::Fixed(0.65),
};

const HIGH_RATING: f64 = 5.0;
const HIGH_RATING_SHARE: f64 = 0.8;

/// Top ratings in the last 24h; scored by their share of all ratings in that window
const RATING_MANIPULATION: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "provider_rating_manipulation",
    signal_type: SignalType::ProviderRatingManipulation,
    trigger: Trigger::CountAtLeast(5.0),
    confidence: Confidence::Custom(|m, _| match m.baseline {
        Some(total) if total > 0.0 && m.recent / total > HIGH_RATING_SHARE => 0.8,
        _ => 0.7,
    }),
};

pub struct ProviderBehaviorConsumer {
    store: Arc<dyn DetectionStore>,
    sink: SignalSink,
}

impl ProviderBehaviorConsumer {
    pub fn new(store: Arc<dyn DetectionStore>) -> Self {
        Self {
            sink: SignalSink::new(store.clone()),
            store,
        }
    }

    async fn duplicate_identity(&self, event: &DomainEvent) -> Option<(String, GeneratedSignal)> {
        let payload = event.payload_as::<ProviderPayload>()?;
        if payload.user_id.is_empty() {
            return None;
        }
        let store = &self.store;
        let finding = DUPLICATE_IDENTITY
            .run(async {
                let n = store.count_identity_matches(&payload.user_id).await?;
                Ok(Some(Measurement::count(n)))
            })
            .await?;
        let evidence = evidence_for(event)
            .with("provider_id", payload.provider_id.as_str())
            .with("user_id", payload.user_id.as_str());
        Some((payload.user_id.clone(), finding.into_signal(evidence)))
    }

    async fn response_degradation(&self, event: &DomainEvent, provider_id: &str) -> Option<GeneratedSignal> {
        let store = &self.store;
        let recent_since = event.timestamp - Duration::days(30);
        let finding = RESPONSE_DEGRADATION
            .run(async {
                let (recent, historical) = tokio::join!(
                    store.provider_duration_stats(provider_id, recent_since, through(event)),
                    store.provider_duration_stats(provider_id, event.timestamp - Duration::days(90), recent_since),
                );
                let (Some(recent), Some(historical)) = (recent?.mean_opt(), historical?.mean_opt()) else {
                    return Ok(None);
                };
                if recent <= 0.0 {
                    return Ok(None);
                }
                Ok(Some(Measurement::against(recent, historical)))
            })
            .await?;
        Some(finding.into_signal(evidence_for(event).with("provider_id", provider_id)))
    }

    async fn cancellation_spike(&self, event: &DomainEvent, provider_id: &str) -> Option<GeneratedSignal> {
        let store = &self.store;
        let recent_since = event.timestamp - Duration::days(14);
        let finding = CANCELLATION_SPIKE
            .run(async {
                let (recent, historical) = tokio::join!(
                    store.provider_booking_tally(provider_id, recent_since, through(event)),
                    store.provider_booking_tally(provider_id, event.timestamp - Duration::days(90), recent_since),
                );
                let (Some(recent), Some(historical)) = (recent?.cancel_rate(), historical?.cancel_rate()) else {
                    return Ok(None);
                };
                Ok(Some(Measurement::against(recent, historical)))
            })
            .await?;
        Some(finding.into_signal(evidence_for(event).with("provider_id", provider_id)))
    }

    async fn rating_manipulation(&self, event: &DomainEvent, provider_id: &str) -> Option<GeneratedSignal> {
        let store = &self.store;
        let since = event.timestamp - Duration::hours(24);
        let finding = RATING_MANIPULATION
            .run(async {
                let (high, total) = tokio::join!(
                    store.count_ratings(provider_id, Some(HIGH_RATING), since, through(event)),
                    store.count_ratings(provider_id, None, since, through(event)),
                );
                Ok(Some(Measurement::against(high? as f64, total? as f64)))
            })
            .await?;
        Some(finding.into_signal(evidence_for(event).with("provider_id", provider_id)))
    }
}

#[async_trait]
impl Consumer for ProviderBehaviorConsumer {
    fn name(&self) -> &str {
        NAME
    }

    fn event_types(&self) -> &[EventType] {
        EVENT_TYPES
    }

    async fn handle(&self, event: &DomainEvent) -> Vec<GeneratedSignal> {
        if matches!(event.event_type, EventType::ProviderRegistered | EventType::ProviderUpdated) {
            return match self.duplicate_identity(event).await {
                Some((user_id, signal)) => emit(NAME, &self.sink, event, &user_id, vec![signal]).await,
                None => Vec::new(),
            };
        }

        let Some(provider_id) = event.payload_str(&["provider_id"]) else {
            return Vec::new();
        };
        let signal = match event.event_type {
            EventType::BookingCompleted => self.response_degradation(event, &provider_id).await,
            EventType::BookingCancelled => self.cancellation_spike(event, &provider_id).await,
            EventType::RatingSubmitted => self.rating_manipulation(event, &provider_id).await,
            _ => None,
        };
        emit(NAME, &self.sink, event, &provider_id, signal.into_iter().collect()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BookingRecord, MemoryStore, RatingRecord, UserRecord};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    fn booking(id: &str, status: &str, updated_at: DateTime<Utc>, minutes: i64) -> BookingRecord {
        BookingRecord {
            id: id.to_string(),
            client_id: format!("client-{}", id),
            provider_id: "prov-1".to_string(),
            service_category: Some("plumbing".to_string()),
            amount: None,
            status: status.to_string(),
            scheduled_at: Some(updated_at - Duration::minutes(minutes)),
            created_at: updated_at - Duration::days(2),
            updated_at,
        }
    }

    fn booking_event(event_type: EventType) -> DomainEvent {
        DomainEvent::new(
            event_type,
            t0(),
            json!({"booking_id": "b", "client_id": "c", "provider_id": "prov-1"}),
        )
    }

    #[tokio::test]
    async fn test_duplicate_identity_on_registration() {
        let store = Arc::new(MemoryStore::new());
        store.add_user(UserRecord {
            id: "u-new".to_string(),
            phone: Some("+15550001111".to_string()),
            email: Some("new@example.com".to_string()),
        });
        store.add_user(UserRecord {
            id: "u-old".to_string(),
            phone: Some("+15550001111".to_string()),
            email: None,
        });
        let consumer = ProviderBehaviorConsumer::new(store.clone());
        let event = DomainEvent::new(
            EventType::ProviderRegistered,
            t0(),
            json!({"provider_id": "prov-9", "user_id": "u-new"}),
        );
        let signals = consumer.handle(&event).await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::ProviderDuplicateIdentity);
        assert_eq!(store.signals()[0].user_id, "u-new");
    }

    #[tokio::test]
    async fn test_response_degradation() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..4 {
            store.upsert_booking(booking(&format!("old{}", i), "completed", t0() - Duration::days(40 + i), 60));
            store.upsert_booking(booking(&format!("new{}", i), "completed", t0() - Duration::days(1 + i), 120));
        }
        let consumer = ProviderBehaviorConsumer::new(store.clone());
        let signals = consumer.handle(&booking_event(EventType::BookingCompleted)).await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::ProviderResponseDegradation);
        assert_eq!(store.signals()[0].user_id, "prov-1");
    }

    #[tokio::test]
    async fn test_cancellation_spike_requires_history() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..3 {
            store.upsert_booking(booking(&format!("recent{}", i), "cancelled", t0() - Duration::days(i + 1), 60));
        }
        let consumer = ProviderBehaviorConsumer::new(store.clone());
        // no historical cancellations: zero baseline, skipped
        assert!(consumer.handle(&booking_event(EventType::BookingCancelled)).await.is_empty());

        store.upsert_booking(booking("hist-c", "cancelled", t0() - Duration::days(30), 60));
        for i in 0..4 {
            store.upsert_booking(booking(&format!("hist{}", i), "completed", t0() - Duration::days(31 + i), 60));
        }
        let signals = consumer.handle(&booking_event(EventType::BookingCancelled)).await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].confidence, 0.65);
    }

    #[tokio::test]
    async fn test_rating_manipulation_share() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..6 {
            store.add_rating(RatingRecord {
                id: format!("r{}", i),
                client_id: format!("c{}", i),
                provider_id: "prov-1".to_string(),
                score: 5.0,
                created_at: t0() - Duration::hours(i + 1),
            });
        }
        let consumer = ProviderBehaviorConsumer::new(store.clone());
        let event = DomainEvent::new(
            EventType::RatingSubmitted,
            t0(),
            json!({"client_id": "c0", "provider_id": "prov-1", "score": 5}),
        );
        let signals = consumer.handle(&event).await;
        assert_eq!(signals[0].confidence, 0.8);

        for i in 0..3 {
            store.add_rating(RatingRecord {
                id: format!("low{}", i),
                client_id: format!("x{}", i),
                provider_id: "prov-1".to_string(),
                score: 2.0,
                created_at: t0() - Duration::hours(2),
            });
        }
        let signals = consumer.handle(&event).await;
        assert_eq!(signals[0].confidence, 0.7);
    }
}
