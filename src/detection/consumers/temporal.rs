//! Temporal pattern consumer: activity bursts and dormant-account reactivation

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

use crate::detection::baseline::{BaselineAnomalyDetector, Confidence, Measurement, Trigger};
use crate::detection::consumers::{emit, evidence_for, through};
use crate::detection::persist::SignalSink;
use crate::detection::signals::{GeneratedSignal, SignalType};
use crate::events::dispatcher::Consumer;
use crate::events::types::{DomainEvent, EventType};
use crate::storage::DetectionStore;

pub const NAME: &str = "temporal-anomaly-detection";

const EVENT_TYPES: &[EventType] = &[
    EventType::MessageCreated,
    EventType::BookingCreated,
    EventType::BookingCancelled,
    EventType::WalletDeposit,
    EventType::WalletWithdrawal,
    EventType::WalletTransfer,
    EventType::TransactionInitiated,
];

/// Hours in the baseline window `[ts - 7d, ts - 1h)`
const BASELINE_HOURS: f64 = 167.0;
const DORMANT_DAYS: f64 = 30.0;

/// Last hour against the hourly average of the preceding week
const BURST: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "temporal_burst",
    signal_type: SignalType::TemporalBurstActivity,
    trigger: Trigger::ZScoreAbove(3.0),
    confidence: Confidence::Linear { base: 0.5, step: 0.1, from: 3.0, cap: 0.9 },
};

/// Days since the previous activity
const DORMANT: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "temporal_dormant_activation",
    signal_type: SignalType::TemporalDormantActivation,
    trigger: Trigger::CountAbove(DORMANT_DAYS),
    confidence: Confidence::Fixed(0.55),
};

pub struct TemporalPatternConsumer {
    store: Arc<dyn DetectionStore>,
    sink: SignalSink,
}

impl TemporalPatternConsumer {
    pub fn new(store: Arc<dyn DetectionStore>) -> Self {
        Self {
            sink: SignalSink::new(store.clone()),
            store,
        }
    }

    async fn burst(&self, event: &DomainEvent, user_id: &str) -> Option<GeneratedSignal> {
        let store = &self.store;
        let hour_ago = event.timestamp - Duration::hours(1);
        let finding = BURST
            .run(async {
                let (recent, baseline) = tokio::join!(
                    store.count_activity(user_id, hour_ago, through(event)),
                    store.count_activity(user_id, event.timestamp - Duration::days(7), hour_ago),
                );
                Ok(Some(Measurement::against(recent? as f64, baseline? as f64 / BASELINE_HOURS)))
            })
            .await?;
        Some(finding.into_signal(evidence_for(event).with("window", "1h")))
    }

    async fn dormant(&self, event: &DomainEvent, user_id: &str) -> Option<GeneratedSignal> {
        let store = &self.store;
        let mut last_seen = None;
        let finding = DORMANT
            .run(async {
                let Some(last) = store
                    .last_activity_before(user_id, event.timestamp - Duration::minutes(1))
                    .await?
                else {
                    return Ok(None);
                };
                last_seen = Some(last);
                let idle_ms = (event.timestamp - last).num_milliseconds() as f64;
                Ok(Some(Measurement::value(idle_ms / 86_400_000.0)))
            })
            .await?;
        let mut evidence = evidence_for(event);
        if let Some(last) = last_seen {
            evidence = evidence.with("last_activity_at", last.to_rfc3339());
        }
        Some(finding.into_signal(evidence))
    }
}

#[async_trait]
impl Consumer for TemporalPatternConsumer {
    fn name(&self) -> &str {
        NAME
    }

    fn event_types(&self) -> &[EventType] {
        EVENT_TYPES
    }

    async fn handle(&self, event: &DomainEvent) -> Vec<GeneratedSignal> {
        let Some(user_id) = event.payload_str(&["sender_id", "user_id", "client_id"]) else {
            return Vec::new();
        };
        let (burst, dormant) = tokio::join!(self.burst(event, &user_id), self.dormant(event, &user_id));
        let signals = burst.into_iter().chain(dormant).collect();
        emit(NAME, &self.sink, event, &user_id, signals).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ActivityRecord, MemoryStore};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 10, 15, 0, 0).unwrap()
    }

    async fn activity(store: &MemoryStore, user_id: &str, at: DateTime<Utc>) {
        store
            .record_activity(&ActivityRecord {
                user_id: user_id.to_string(),
                event_type: "message.created".to_string(),
                created_at: at,
            })
            .await
            .unwrap();
    }

    fn message_event(user_id: &str) -> DomainEvent {
        DomainEvent::new(
            EventType::MessageCreated,
            anchor(),
            json!({"sender_id": user_id, "receiver_id": "other", "content": "hi"}),
        )
    }

    #[tokio::test]
    async fn test_burst_against_weekly_baseline() {
        let store = Arc::new(MemoryStore::new());
        // two per hour over the baseline week
        for i in 0..334 {
            activity(&store, "u-1", anchor() - Duration::minutes(61 + 30 * i)).await;
        }
        for i in 0..20 {
            activity(&store, "u-1", anchor() - Duration::minutes(i * 2)).await;
        }
        let consumer = TemporalPatternConsumer::new(store.clone());
        let signals = consumer.handle(&message_event("u-1")).await;
        let burst = signals
            .iter()
            .find(|s| s.signal_type == SignalType::TemporalBurstActivity)
            .expect("burst signal");
        assert_eq!(burst.confidence, 0.9);
        assert!(signals.iter().all(|s| s.signal_type != SignalType::TemporalDormantActivation));
    }

    #[tokio::test]
    async fn test_steady_activity_is_quiet() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..334 {
            activity(&store, "u-1", anchor() - Duration::minutes(61 + 30 * i)).await;
        }
        activity(&store, "u-1", anchor()).await;
        activity(&store, "u-1", anchor() - Duration::minutes(30)).await;
        let consumer = TemporalPatternConsumer::new(store.clone());
        assert!(consumer.handle(&message_event("u-1")).await.is_empty());
    }

    #[tokio::test]
    async fn test_dormant_account_reactivation() {
        let store = Arc::new(MemoryStore::new());
        activity(&store, "u-2", anchor() - Duration::days(45)).await;
        activity(&store, "u-2", anchor()).await;
        let consumer = TemporalPatternConsumer::new(store.clone());
        let signals = consumer.handle(&message_event("u-2")).await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::TemporalDormantActivation);
        assert_eq!(signals[0].confidence, 0.55);
        assert!(signals[0].evidence.get("last_activity_at").is_some());
        assert_eq!(store.signals()[0].user_id, "u-2");
    }

    #[tokio::test]
    async fn test_first_activity_is_not_dormant() {
        let store = Arc::new(MemoryStore::new());
        activity(&store, "u-3", anchor()).await;
        let consumer = TemporalPatternConsumer::new(store);
        assert!(consumer.handle(&message_event("u-3")).await.is_empty());
    }
}
