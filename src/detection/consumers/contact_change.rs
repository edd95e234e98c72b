//! Contact change consumer
//!
//! A phone or email change by a user who is already HIGH/CRITICAL tier or was recently
//! actioned. Scored higher when the new value belongs to another flagged user.

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;
use tracing::warn;

use crate::core::errors::Result;
use crate::detection::consumers::{emit, evidence_for};
use crate::detection::persist::SignalSink;
use crate::detection::signals::{round_confidence, GeneratedSignal, SignalType};
use crate::events::dispatcher::Consumer;
use crate::events::types::{ContactChangePayload, ContactField, DomainEvent, EventType};
use crate::storage::{is_flagged_tier, DetectionStore};

pub const NAME: &str = "contact-change-detection";

const EVENT_TYPES: &[EventType] = &[EventType::ContactFieldChanged];

const BASE_CONFIDENCE: f64 = 0.5;
const FLAGGED_TIER_BOOST: f64 = 0.15;
const ENFORCEMENT_BOOST: f64 = 0.1;
const CROSS_REFERENCE_CONFIDENCE: f64 = 0.85;
const DEFAULT_TIER: &str = "MONITOR";

/// Risk history gathered for one change
#[derive(Debug, Clone, PartialEq)]
struct RiskHistory {
    tier: String,
    enforcement_30d: u64,
    flagged_owner: Option<String>,
}

impl RiskHistory {
    fn flagged_tier(&self) -> bool {
        is_flagged_tier(&self.tier)
    }

    fn eligible(&self) -> bool {
        self.flagged_tier() || self.enforcement_30d > 0
    }

    fn confidence(&self) -> f64 {
        if self.flagged_owner.is_some() {
            return CROSS_REFERENCE_CONFIDENCE;
        }
        let mut confidence = BASE_CONFIDENCE;
        if self.flagged_tier() {
            confidence += FLAGGED_TIER_BOOST;
        }
        if self.enforcement_30d > 0 {
            confidence += ENFORCEMENT_BOOST;
        }
        round_confidence(confidence)
    }
}

pub struct ContactChangeConsumer {
    store: Arc<dyn DetectionStore>,
    sink: SignalSink,
}

impl ContactChangeConsumer {
    pub fn new(store: Arc<dyn DetectionStore>) -> Self {
        Self {
            sink: SignalSink::new(store.clone()),
            store,
        }
    }

    async fn risk_history(&self, event: &DomainEvent, change: &ContactChangePayload) -> Result<Option<RiskHistory>> {
        let (tier, enforcement) = tokio::join!(
            self.store.latest_risk_tier(&change.user_id),
            self.store
                .count_enforcement_actions(&change.user_id, event.timestamp - Duration::days(30)),
        );
        let mut history = RiskHistory {
            tier: tier?.unwrap_or_else(|| DEFAULT_TIER.to_string()),
            enforcement_30d: enforcement?,
            flagged_owner: None,
        };
        if !history.eligible() {
            return Ok(None);
        }
        history.flagged_owner = match self
            .store
            .find_flagged_contact_owner(change.field, &change.new_value, &change.user_id)
            .await
        {
            Ok(owner) => owner,
            Err(e) => {
                warn!(consumer = NAME, event_id = %event.id, error = %e, "Cross-reference lookup failed");
                None
            }
        };
        Ok(Some(history))
    }
}

#[async_trait]
impl Consumer for ContactChangeConsumer {
    fn name(&self) -> &str {
        NAME
    }

    fn event_types(&self) -> &[EventType] {
        EVENT_TYPES
    }

    async fn handle(&self, event: &DomainEvent) -> Vec<GeneratedSignal> {
        let Some(change) = event.payload_as::<ContactChangePayload>() else {
            return Vec::new();
        };
        if change.user_id.is_empty() || change.new_value.is_empty() {
            return Vec::new();
        }

        let history = match self.risk_history(event, &change).await {
            Ok(Some(history)) => history,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(consumer = NAME, event_id = %event.id, error = %e, "Contact change lookup failed");
                return Vec::new();
            }
        };

        let signal_type = match change.field {
            ContactField::Phone => SignalType::ContactPhoneChanged,
            ContactField::Email => SignalType::ContactEmailChanged,
        };
        let evidence = evidence_for(event)
            .with("user_id", change.user_id.as_str())
            .with("field", change.field.as_str())
            .with("tier", history.tier.as_str())
            .with("enforcement_count_30d", history.enforcement_30d)
            .with("matches_flagged_user", history.flagged_owner.is_some());
        let signal = GeneratedSignal::new(signal_type, history.confidence(), evidence);
        emit(NAME, &self.sink, event, &change.user_id, vec![signal]).await
    }
}
