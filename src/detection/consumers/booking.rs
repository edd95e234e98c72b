//! Booking anomaly consumer
//!
//! Cancellation bursts, suspiciously short or early-cancelled bookings, repeat bookings
//! with one provider, odd-hour scheduling, out-of-range amounts and no-shows.

use async_trait::async_trait;
use chrono::{Duration, Timelike};
use std::sync::Arc;

use crate::detection::baseline::{BaselineAnomalyDetector, Confidence, Measurement, Trigger};
use crate::detection::consumers::{emit, evidence_for, through};
use crate::detection::persist::SignalSink;
use crate::detection::signals::{GeneratedSignal, SignalType};
use crate::events::dispatcher::Consumer;
use crate::events::types::{BookingPayload, DomainEvent, EventType};
use crate::storage::{BookingQuery, DetectionStore};

pub const NAME: &str = "booking-anomaly-detection";

const EVENT_TYPES: &[EventType] = &[
    EventType::BookingCreated,
    EventType::BookingCancelled,
    EventType::BookingCompleted,
    EventType::BookingNoShow,
];

const RAPID_CANCELLATION: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "booking_rapid_cancellation",
    signal_type: SignalType::BookingRapidCancellation,
    trigger: Trigger::CountAtLeast(3.0),
    confidence: Confidence::Linear { base: 0.7, step: 0.1, from: 3.0, cap: 1.0 },
};

/// Cancelled within half an hour of being created
const EARLY_CANCEL: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "booking_early_cancel",
    signal_type: SignalType::BookingFakeCompletion,
    trigger: Trigger::WithinRange(0.0, 30.0 * 60.0),
    confidence: Confidence::Fixed(0.6),
};

const FAKE_COMPLETION: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "booking_fake_completion",
    signal_type: SignalType::BookingFakeCompletion,
    trigger: Trigger::RatioBelow(0.25),
    confidence: Confidence::Fixed(0.75),
};

const SAME_PROVIDER_REPEAT: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "booking_same_provider_repeat",
    signal_type: SignalType::BookingSameProviderRepeat,
    trigger: Trigger::CountAtLeast(5.0),
    confidence: Confidence::Linear { base: 0.5, step: 0.05, from: 5.0, cap: 0.8 },
};

/// Scheduled between 02:00 and 05:00 UTC
const TIME_CLUSTERING: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "booking_time_clustering",
    signal_type: SignalType::BookingTimeClustering,
    trigger: Trigger::WithinRange(2.0, 5.0),
    confidence: Confidence::Fixed(0.4),
};

const VALUE_ANOMALY: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "booking_value_anomaly",
    signal_type: SignalType::BookingValueAnomaly,
    trigger: Trigger::DeviationAbove(2.0),
    confidence: Confidence::Fixed(0.55),
};

const NO_SHOW_CONFIDENCE: f64 = 0.7;

pub struct BookingAnomalyConsumer {
    store: Arc<dyn DetectionStore>,
    sink: SignalSink,
}

impl BookingAnomalyConsumer {
    pub fn new(store: Arc<dyn DetectionStore>) -> Self {
        Self {
            sink: SignalSink::new(store.clone()),
            store,
        }
    }

    async fn on_cancelled(&self, event: &DomainEvent, p: &BookingPayload) -> Vec<GeneratedSignal> {
        let store = &self.store;
        let evidence = evidence_for(event).with("booking_id", p.booking_id.as_str());

        let rapid = RAPID_CANCELLATION.run(async {
            let n = store
                .count_bookings(&BookingQuery {
                    client_id: Some(&p.client_id),
                    status: Some("cancelled"),
                    since: Some(event.timestamp - Duration::days(7)),
                    until: Some(through(event)),
                    ..Default::default()
                })
                .await?;
            Ok(Some(Measurement::count(n)))
        });
        let early = EARLY_CANCEL.run(async {
            let booking = store.booking(&p.booking_id).await?;
            Ok(booking.map(|b| Measurement::value((b.updated_at - b.created_at).num_seconds() as f64)))
        });
        let (rapid, early) = tokio::join!(rapid, early);

        let mut signals = Vec::new();
        if let Some(f) = rapid {
            signals.push(f.into_signal(evidence.clone().with("window", "7d")));
        }
        if let Some(f) = early {
            signals.push(f.into_signal(evidence.with("trigger", "early_cancel")));
        }
        signals
    }

    async fn on_completed(&self, event: &DomainEvent, p: &BookingPayload) -> Vec<GeneratedSignal> {
        let store = &self.store;
        let evidence = evidence_for(event).with("booking_id", p.booking_id.as_str());

        let fake = FAKE_COMPLETION.run(async {
            let Some(booking) = store.booking(&p.booking_id).await? else {
                return Ok(None);
            };
            let Some(category) = booking.service_category.clone().or_else(|| p.service_category.clone()) else {
                return Ok(None);
            };
            let Some(duration) = booking.duration_secs().filter(|d| *d > 0.0) else {
                return Ok(None);
            };
            let average = store.category_duration_stats(&category).await?.mean_opt();
            Ok(average.map(|avg| Measurement::against(duration, avg)))
        });
        let repeat = SAME_PROVIDER_REPEAT.run(async {
            let n = store
                .count_bookings(&BookingQuery {
                    client_id: Some(&p.client_id),
                    provider_id: Some(&p.provider_id),
                    status: Some("completed"),
                    since: Some(event.timestamp - Duration::days(30)),
                    until: Some(through(event)),
                })
                .await?;
            Ok(Some(Measurement::count(n)))
        });
        let (fake, repeat) = tokio::join!(fake, repeat);

        let mut signals = Vec::new();
        if let Some(f) = fake {
            signals.push(f.into_signal(evidence.clone().with("trigger", "short_duration")));
        }
        if let Some(f) = repeat {
            signals.push(f.into_signal(evidence.with("provider_id", p.provider_id.as_str())));
        }
        signals
    }

    async fn on_created(&self, event: &DomainEvent, p: &BookingPayload) -> Vec<GeneratedSignal> {
        let store = &self.store;
        let evidence = evidence_for(event).with("booking_id", p.booking_id.as_str());

        let clustering = TIME_CLUSTERING.run(async {
            Ok(p.scheduled_at.map(|at| Measurement::value(at.hour() as f64)))
        });
        let value = VALUE_ANOMALY.run(async {
            let (Some(amount), Some(category)) = (p.amount, p.service_category.as_deref()) else {
                return Ok(None);
            };
            let stats = store.category_amount_stats(category).await?;
            Ok(stats
                .mean_opt()
                .map(|avg| Measurement::against(amount, avg).with_spread(stats.stddev)))
        });
        let (clustering, value) = tokio::join!(clustering, value);

        let mut signals = Vec::new();
        if let Some(f) = clustering {
            signals.push(f.into_signal(evidence.clone().with("trigger", "odd_hour")));
        }
        if let Some(f) = value {
            signals.push(f.into_signal(evidence));
        }
        signals
    }

    fn on_no_show(&self, event: &DomainEvent, p: &BookingPayload) -> Vec<GeneratedSignal> {
        vec![GeneratedSignal::new(
            SignalType::BookingNoShowPattern,
            NO_SHOW_CONFIDENCE,
            evidence_for(event)
                .with("booking_id", p.booking_id.as_str())
                .with("trigger", "no_show"),
        )]
    }
}

#[async_trait]
impl Consumer for BookingAnomalyConsumer {
    fn name(&self) -> &str {
        NAME
    }

    fn event_types(&self) -> &[EventType] {
        EVENT_TYPES
    }

    async fn handle(&self, event: &DomainEvent) -> Vec<GeneratedSignal> {
        let Some(payload) = event.payload_as::<BookingPayload>() else {
            return Vec::new();
        };
        if payload.client_id.is_empty() {
            return Vec::new();
        }

        let signals = match event.event_type {
            EventType::BookingCancelled => self.on_cancelled(event, &payload).await,
            EventType::BookingCompleted => self.on_completed(event, &payload).await,
            EventType::BookingCreated => self.on_created(event, &payload).await,
            EventType::BookingNoShow => self.on_no_show(event, &payload),
            _ => Vec::new(),
        };
        emit(NAME, &self.sink, event, &payload.client_id, signals).await
    }
}
