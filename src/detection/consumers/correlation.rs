//! Cross-signal correlation engine
//!
//! Links a contact-disclosure signal raised against a client to a later booking outcome
//! with the same client: a cancellation or no-show, or a completion far shorter than the
//! category norm. Each link is written to `signal_correlations` and raises a derived signal.

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::errors::Result;
use crate::detection::consumers::{emit, evidence_for, through};
use crate::detection::persist::SignalSink;
use crate::detection::signals::{flags, round_confidence, GeneratedSignal, SignalType};
use crate::events::dispatcher::Consumer;
use crate::events::types::{BookingPayload, DomainEvent, EventType};
use crate::storage::{CorrelationRecord, CorrelationType, DetectionStore, StoredSignal};

pub const NAME: &str = "correlation-engine";

const EVENT_TYPES: &[EventType] = &[
    EventType::BookingCancelled,
    EventType::BookingCompleted,
    EventType::BookingNoShow,
];

const LOOKBACK_HOURS: i64 = 6;
const CANDIDATE_LIMIT: usize = 5;

const CANCEL_BASE: f64 = 0.7;
const OBFUSCATION_BOOST: f64 = 0.1;
const QUICK_CANCEL_BOOST: f64 = 0.1;
const QUICK_CANCEL_SECS: i64 = 3600;

const FAKE_COMPLETE_CONFIDENCE: f64 = 0.75;
const FAKE_COMPLETE_RATIO: f64 = 0.25;

/// A contact signal matched to the triggering booking event
struct Link {
    contact: StoredSignal,
    delta_secs: i64,
}

pub struct CorrelationEngine {
    store: Arc<dyn DetectionStore>,
    sink: SignalSink,
}

impl CorrelationEngine {
    pub fn new(store: Arc<dyn DetectionStore>) -> Self {
        Self {
            sink: SignalSink::new(store.clone()),
            store,
        }
    }

    /// Most recent contact-disclosure signal for the client within the lookback horizon,
    /// never later than the event itself
    async fn latest_contact(&self, event: &DomainEvent, client_id: &str) -> Result<Option<Link>> {
        let since = event.timestamp - Duration::hours(LOOKBACK_HOURS);
        let candidates = self
            .store
            .recent_signals(client_id, SignalType::CONTACT_DISCLOSURE, since, through(event), CANDIDATE_LIMIT)
            .await?;
        Ok(candidates.into_iter().next().map(|contact| Link {
            delta_secs: (event.timestamp - contact.created_at).num_seconds(),
            contact,
        }))
    }

    async fn record(
        &self,
        event: &DomainEvent,
        correlation_type: CorrelationType,
        booking: &BookingPayload,
        link: &Link,
        confidence: f64,
        evidence: serde_json::Value,
    ) {
        let record = CorrelationRecord {
            id: Uuid::new_v4().to_string(),
            correlation_type,
            user_id: booking.client_id.clone(),
            counterparty_id: Some(booking.provider_id.clone()),
            primary_signal_id: link.contact.id.clone(),
            secondary_signal_id: None,
            booking_id: Some(booking.booking_id.clone()),
            confidence,
            time_delta_seconds: link.delta_secs,
            evidence,
            created_at: event.timestamp,
        };
        match self.store.insert_correlation(&record).await {
            Ok(()) => info!(
                correlation_type = correlation_type.as_str(),
                user_id = %booking.client_id,
                confidence,
                delta_secs = link.delta_secs,
                "Correlation recorded"
            ),
            Err(e) => warn!(
                correlation_type = correlation_type.as_str(),
                error = %e,
                "Failed to record correlation"
            ),
        }
    }

    async fn contact_then_cancel(&self, event: &DomainEvent, booking: &BookingPayload) -> Result<Option<GeneratedSignal>> {
        let Some(link) = self.latest_contact(event, &booking.client_id).await? else {
            return Ok(None);
        };
        let obfuscated = !link.contact.obfuscation_flags.is_empty();
        let quick = link.delta_secs < QUICK_CANCEL_SECS;
        let mut confidence = CANCEL_BASE;
        if obfuscated {
            confidence += OBFUSCATION_BOOST;
        }
        if quick {
            confidence += QUICK_CANCEL_BOOST;
        }
        let confidence = round_confidence(confidence);

        let correlation_type = CorrelationType::ContactThenCancel;
        self.record(
            event,
            correlation_type,
            booking,
            &link,
            confidence,
            json!({
                "contact_signal_type": link.contact.signal_type,
                "obfuscation_detected": obfuscated,
                "cancel_within_1hr": quick,
            }),
        )
        .await;

        let evidence = evidence_for(event)
            .with("correlation_type", correlation_type.as_str())
            .with("booking_id", booking.booking_id.as_str())
            .with("contact_signal_id", link.contact.id.as_str())
            .with("contact_signal_type", link.contact.signal_type.as_str())
            .with("time_delta_seconds", link.delta_secs)
            .with("obfuscation_detected", obfuscated);
        Ok(Some(
            GeneratedSignal::new(SignalType::BookingCancelAfterContact, confidence, evidence)
                .with_pattern_flag(flags::CORRELATION_CONTACT_CANCEL),
        ))
    }

    async fn contact_then_fake_complete(
        &self,
        event: &DomainEvent,
        booking: &BookingPayload,
    ) -> Result<Option<GeneratedSignal>> {
        let Some(record) = self.store.booking(&booking.booking_id).await? else {
            return Ok(None);
        };
        let (Some(duration), Some(category)) = (record.duration_secs(), record.service_category.as_deref()) else {
            return Ok(None);
        };
        let Some(category_avg) = self.store.category_duration_stats(category).await?.mean_opt() else {
            return Ok(None);
        };
        if category_avg <= 0.0 || duration >= category_avg * FAKE_COMPLETE_RATIO {
            return Ok(None);
        }
        let Some(link) = self.latest_contact(event, &booking.client_id).await? else {
            return Ok(None);
        };

        let correlation_type = CorrelationType::ContactThenFakeComplete;
        self.record(
            event,
            correlation_type,
            booking,
            &link,
            FAKE_COMPLETE_CONFIDENCE,
            json!({
                "contact_signal_type": link.contact.signal_type,
                "booking_duration_secs": duration,
                "category_avg_secs": category_avg,
            }),
        )
        .await;

        let evidence = evidence_for(event)
            .with("correlation_type", correlation_type.as_str())
            .with("booking_id", booking.booking_id.as_str())
            .with("contact_signal_id", link.contact.id.as_str())
            .with("time_delta_seconds", link.delta_secs)
            .with("duration_secs", duration)
            .with("category_avg_secs", category_avg);
        Ok(Some(
            GeneratedSignal::new(SignalType::OffPlatformTransactionCorrelated, FAKE_COMPLETE_CONFIDENCE, evidence)
                .with_pattern_flag(flags::CORRELATION_CONTACT_FAKE_COMPLETE),
        ))
    }
}

#[async_trait]
impl Consumer for CorrelationEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn event_types(&self) -> &[EventType] {
        EVENT_TYPES
    }

    async fn handle(&self, event: &DomainEvent) -> Vec<GeneratedSignal> {
        let Some(booking) = event.payload_as::<BookingPayload>() else {
            return Vec::new();
        };
        if booking.client_id.is_empty() || booking.provider_id.is_empty() {
            return Vec::new();
        }

        let outcome = match event.event_type {
            EventType::BookingCancelled | EventType::BookingNoShow => {
                self.contact_then_cancel(event, &booking).await
            }
            EventType::BookingCompleted => self.contact_then_fake_complete(event, &booking).await,
            _ => Ok(None),
        };
        match outcome {
            Ok(signal) => emit(NAME, &self.sink, event, &booking.client_id, signal.into_iter().collect()).await,
            Err(e) => {
                warn!(consumer = NAME, event_id = %event.id, error = %e, "Correlation lookup failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::signals::Evidence;
    use crate::storage::{BookingRecord, MemoryStore};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::BTreeSet;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 12, 14, 0, 0).unwrap()
    }

    async fn contact_signal(store: &MemoryStore, user_id: &str, signal_type: SignalType, obfuscated: bool) {
        let mut obfuscation_flags = BTreeSet::new();
        if obfuscated {
            obfuscation_flags.insert("LEETSPEAK".to_string());
        }
        store
            .insert_signal(&StoredSignal {
                id: "sig-contact".to_string(),
                source_event_id: "evt-msg".to_string(),
                user_id: user_id.to_string(),
                signal_type,
                confidence: 0.7,
                evidence: Evidence::for_event("evt-msg", t0()),
                obfuscation_flags,
                pattern_flags: BTreeSet::new(),
                created_at: t0(),
            })
            .await
            .unwrap();
    }

    fn booking_event(event_type: EventType, at: DateTime<Utc>) -> DomainEvent {
        DomainEvent::new(
            event_type,
            at,
            json!({"booking_id": "bk-1", "client_id": "client-1", "provider_id": "prov-1"}),
        )
    }

    fn completed(id: &str, minutes: i64) -> BookingRecord {
        BookingRecord {
            id: id.to_string(),
            client_id: "client-1".to_string(),
            provider_id: "prov-1".to_string(),
            service_category: Some("cleaning".to_string()),
            amount: None,
            status: "completed".to_string(),
            scheduled_at: Some(t0()),
            created_at: t0() - Duration::days(1),
            updated_at: t0() + Duration::minutes(minutes),
        }
    }

    #[tokio::test]
    async fn test_cancel_thirty_minutes_after_contact() {
        let store = Arc::new(MemoryStore::new());
        contact_signal(&store, "client-1", SignalType::ContactMessagingApp, false).await;
        let engine = CorrelationEngine::new(store.clone());

        let signals = engine
            .handle(&booking_event(EventType::BookingCancelled, t0() + Duration::minutes(30)))
            .await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::BookingCancelAfterContact);
        assert_eq!(signals[0].confidence, 0.8);
        assert!(signals[0].pattern_flags.contains(flags::CORRELATION_CONTACT_CANCEL));
        assert_eq!(signals[0].evidence.get("time_delta_seconds"), Some(&json!(1800)));

        let correlations = store.correlations();
        assert_eq!(correlations.len(), 1);
        assert_eq!(correlations[0].correlation_type, CorrelationType::ContactThenCancel);
        assert_eq!(correlations[0].primary_signal_id, "sig-contact");
        assert_eq!(correlations[0].time_delta_seconds, 1800);
        assert_eq!(correlations[0].counterparty_id.as_deref(), Some("prov-1"));
        assert_eq!(correlations[0].confidence, 0.8);
        assert_eq!(correlations[0].created_at, t0() + Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_no_show_with_obfuscated_contact_caps_at_one() {
        let store = Arc::new(MemoryStore::new());
        contact_signal(&store, "client-1", SignalType::ContactPhone, true).await;
        let engine = CorrelationEngine::new(store.clone());
        let signals = engine
            .handle(&booking_event(EventType::BookingNoShow, t0() + Duration::minutes(5)))
            .await;
        assert_eq!(signals[0].confidence, 0.9);

        let late = engine
            .handle(&booking_event(EventType::BookingNoShow, t0() + Duration::hours(2)))
            .await;
        assert_eq!(late[0].confidence, 0.8);
    }

    #[tokio::test]
    async fn test_contact_after_the_cancel_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        contact_signal(&store, "client-1", SignalType::ContactMessagingApp, false).await;
        let engine = CorrelationEngine::new(store.clone());

        let signals = engine
            .handle(&booking_event(EventType::BookingCancelled, t0() - Duration::minutes(20)))
            .await;
        assert!(signals.is_empty());
        assert!(store.correlations().is_empty());
    }

    #[tokio::test]
    async fn test_contact_outside_lookback_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        contact_signal(&store, "client-1", SignalType::ContactEmail, false).await;
        let engine = CorrelationEngine::new(store.clone());
        let signals = engine
            .handle(&booking_event(EventType::BookingCancelled, t0() + Duration::hours(7)))
            .await;
        assert!(signals.is_empty());
        assert!(store.correlations().is_empty());
    }

    #[tokio::test]
    async fn test_non_contact_signal_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        contact_signal(&store, "client-1", SignalType::GroomingLanguage, false).await;
        let engine = CorrelationEngine::new(store);
        assert!(engine
            .handle(&booking_event(EventType::BookingCancelled, t0() + Duration::minutes(10)))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_fast_completion_after_contact() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..3 {
            store.upsert_booking(completed(&format!("norm{}", i), 120));
        }
        store.upsert_booking(completed("bk-1", 10));
        contact_signal(&store, "client-1", SignalType::ContactSocial, false).await;
        let engine = CorrelationEngine::new(store.clone());

        let signals = engine
            .handle(&booking_event(EventType::BookingCompleted, t0() + Duration::minutes(10)))
            .await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::OffPlatformTransactionCorrelated);
        assert_eq!(signals[0].confidence, 0.75);
        assert_eq!(
            store.correlations()[0].correlation_type,
            CorrelationType::ContactThenFakeComplete
        );
    }

    #[tokio::test]
    async fn test_normal_completion_is_not_correlated() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..3 {
            store.upsert_booking(completed(&format!("norm{}", i), 120));
        }
        store.upsert_booking(completed("bk-1", 100));
        contact_signal(&store, "client-1", SignalType::ContactSocial, false).await;
        let engine = CorrelationEngine::new(store.clone());
        assert!(engine
            .handle(&booking_event(EventType::BookingCompleted, t0() + Duration::minutes(100)))
            .await
            .is_empty());
    }
}
