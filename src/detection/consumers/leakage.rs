//! Off-platform leakage funnel
//!
//! Follows a (user, counterparty) pair through `signal -> attempt -> confirmation`. A funnel
//! opens when the sender has recent off-platform signals, advances to `attempt` when a new
//! kind of off-platform signal appears, and to `confirmation` when the client then cancels a
//! booking with that provider. Funnel rows are written to `leakage_events`; no signals are
//! raised here.

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::errors::Result;
use crate::detection::consumers::through;
use crate::detection::signals::{GeneratedSignal, SignalType};
use crate::events::dispatcher::Consumer;
use crate::events::types::{BookingPayload, DomainEvent, EventType, MessagePayload};
use crate::storage::{DetectionStore, LeakageRecord, LeakageStage};

pub const NAME: &str = "leakage-tracking";

const EVENT_TYPES: &[EventType] = &[
    EventType::MessageCreated,
    EventType::MessageEdited,
    EventType::BookingCancelled,
];

const OFF_PLATFORM: &[SignalType] = &[
    SignalType::ContactPhone,
    SignalType::ContactEmail,
    SignalType::ContactSocial,
    SignalType::ContactMessagingApp,
    SignalType::PaymentExternal,
    SignalType::OffPlatformIntent,
];

const LOOKBACK_DAYS: i64 = 7;
const SIGNAL_LIMIT: usize = 20;

/// Where the conversation is being moved, strongest indicator first
fn platform_destination(types: &BTreeSet<String>) -> Option<String> {
    [
        (SignalType::ContactMessagingApp, "messaging_app"),
        (SignalType::ContactSocial, "social_media"),
        (SignalType::ContactPhone, "phone"),
        (SignalType::ContactEmail, "email"),
        (SignalType::PaymentExternal, "external_payment"),
    ]
    .into_iter()
    .find(|(signal_type, _)| types.contains(signal_type.as_str()))
    .map(|(_, destination)| destination.to_string())
}

fn merge_evidence(target: &mut serde_json::Value, extra: serde_json::Value) {
    let serde_json::Value::Object(extra) = extra else {
        return;
    };
    if let Some(map) = target.as_object_mut() {
        map.extend(extra);
        return;
    }
    *target = serde_json::Value::Object(extra);
}

pub struct LeakageTracker {
    store: Arc<dyn DetectionStore>,
}

impl LeakageTracker {
    pub fn new(store: Arc<dyn DetectionStore>) -> Self {
        Self { store }
    }

    async fn open_funnel(&self, event: &DomainEvent, user_id: &str, counterparty_id: &str) -> Result<Option<LeakageRecord>> {
        self.store
            .latest_leakage(
                user_id,
                counterparty_id,
                event.timestamp - Duration::days(LOOKBACK_DAYS),
                through(event),
            )
            .await
    }

    /// Revenue at stake: the pair's latest booking amount, else the platform-wide average
    /// completed booking
    async fn estimate_revenue_loss(&self, client_id: &str, provider_id: &str) -> Result<Option<f64>> {
        if let Some(amount) = self
            .store
            .latest_booking_amount(client_id, provider_id)
            .await?
            .filter(|a| *a > 0.0)
        {
            return Ok(Some(amount));
        }
        let average = self.store.completed_amount_stats().await?.mean_opt();
        Ok(average.filter(|a| *a > 0.0).map(|a| (a * 100.0).round() / 100.0))
    }

    async fn on_message(&self, event: &DomainEvent, message: &MessagePayload) -> Result<()> {
        let signals = self
            .store
            .recent_signals(
                &message.sender_id,
                OFF_PLATFORM,
                event.timestamp - Duration::days(LOOKBACK_DAYS),
                through(event),
                SIGNAL_LIMIT,
            )
            .await?;
        if signals.is_empty() {
            return Ok(());
        }
        let types: BTreeSet<String> = signals.iter().map(|s| s.signal_type.as_str().to_string()).collect();

        let Some(mut funnel) = self.open_funnel(event, &message.sender_id, &message.receiver_id).await? else {
            let funnel = LeakageRecord {
                id: Uuid::new_v4().to_string(),
                user_id: message.sender_id.clone(),
                counterparty_id: message.receiver_id.clone(),
                stage: LeakageStage::Signal,
                signal_ids: signals.iter().map(|s| s.id.clone()).collect(),
                evidence: json!({
                    "signal_types": types,
                    "initial_detection": event.timestamp,
                }),
                platform_destination: platform_destination(&types),
                estimated_revenue_loss: None,
                signal_types: types,
                created_at: event.timestamp,
                updated_at: event.timestamp,
            };
            self.store.save_leakage(&funnel).await?;
            info!(
                consumer = NAME,
                user_id = %funnel.user_id,
                counterparty_id = %funnel.counterparty_id,
                destination = funnel.platform_destination.as_deref().unwrap_or("unknown"),
                "Leakage funnel opened"
            );
            return Ok(());
        };

        let new_types: Vec<&String> = types.difference(&funnel.signal_types).collect();
        if funnel.stage != LeakageStage::Signal || new_types.is_empty() {
            return Ok(());
        }
        let evidence = json!({
            "new_signal_types": new_types,
            "advanced_at": event.timestamp,
        });
        for signal in &signals {
            if !funnel.signal_ids.contains(&signal.id) {
                funnel.signal_ids.push(signal.id.clone());
            }
        }
        self.advance(event, &mut funnel, evidence, None).await
    }

    async fn on_cancellation(&self, event: &DomainEvent, booking: &BookingPayload) -> Result<()> {
        let Some(mut funnel) = self.open_funnel(event, &booking.client_id, &booking.provider_id).await? else {
            return Ok(());
        };
        if funnel.stage != LeakageStage::Attempt {
            return Ok(());
        }
        let loss = self.estimate_revenue_loss(&booking.client_id, &booking.provider_id).await?;
        let evidence = json!({
            "booking_cancelled": booking.booking_id,
            "cancellation_at": event.timestamp,
        });
        self.advance(event, &mut funnel, evidence, loss).await
    }

    async fn advance(
        &self,
        event: &DomainEvent,
        funnel: &mut LeakageRecord,
        evidence: serde_json::Value,
        revenue_loss: Option<f64>,
    ) -> Result<()> {
        let Some(next) = funnel.stage.next() else {
            return Ok(());
        };
        let previous = funnel.stage;
        funnel.stage = next;
        merge_evidence(&mut funnel.evidence, evidence);
        if revenue_loss.is_some() {
            funnel.estimated_revenue_loss = revenue_loss;
        }
        funnel.updated_at = event.timestamp;
        self.store.save_leakage(funnel).await?;
        info!(
            consumer = NAME,
            leakage_id = %funnel.id,
            user_id = %funnel.user_id,
            counterparty_id = %funnel.counterparty_id,
            previous_stage = previous.as_str(),
            new_stage = next.as_str(),
            "Leakage stage advanced"
        );
        Ok(())
    }
}

#[async_trait]
impl Consumer for LeakageTracker {
    fn name(&self) -> &str {
        NAME
    }

    fn event_types(&self) -> &[EventType] {
        EVENT_TYPES
    }

    async fn handle(&self, event: &DomainEvent) -> Vec<GeneratedSignal> {
        let outcome = match event.event_type {
            EventType::MessageCreated | EventType::MessageEdited => match event.payload_as::<MessagePayload>() {
                Some(m) if !m.sender_id.is_empty() && !m.receiver_id.is_empty() => self.on_message(event, &m).await,
                _ => Ok(()),
            },
            EventType::BookingCancelled => match event.payload_as::<BookingPayload>() {
                Some(b) if !b.client_id.is_empty() && !b.provider_id.is_empty() => {
                    self.on_cancellation(event, &b).await
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            warn!(consumer = NAME, event_id = %event.id, error = %e, "Leakage tracking failed");
        }
        Vec::new()
    }
}
