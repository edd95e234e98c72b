//! Conversation context window
//!
//! Three read-only lookups per message (surrounding messages, nearest transaction between
//! the pair, aggregate conversation counts) run concurrently and are joined into one
//! [`ConversationContext`]. A failed lookup degrades to its empty value.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::core::config::ContextConfig;
use crate::storage::{DetectionStore, MessageAnchor, TransactionRecord};

/// Where a message sits relative to the nearest transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPhase {
    PrePayment,
    PaymentWindow,
    PostPayment,
}

impl TransactionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrePayment => "pre_payment",
            Self::PaymentWindow => "payment_window",
            Self::PostPayment => "post_payment",
        }
    }

    /// Classify by `delta_ms = transaction_time - message_time`.
    pub fn classify(delta_ms: i64, payment_window_secs: i64) -> Self {
        if delta_ms > 0 && delta_ms < payment_window_secs * 1000 {
            Self::PaymentWindow
        } else if delta_ms > 0 {
            Self::PrePayment
        } else {
            Self::PostPayment
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextMessage {
    pub id: String,
    pub sender_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionProximity {
    pub transaction_id: String,
    pub status: String,
    pub amount: f64,
    /// Transaction time minus message time
    pub time_delta_ms: i64,
    pub phase: TransactionPhase,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationPattern {
    pub message_count: u64,
    pub unique_signal_types: u64,
    pub has_escalation: bool,
    pub sender_initiated_count: u64,
    pub receiver_initiated_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationContext {
    pub messages: Vec<ContextMessage>,
    pub transaction_proximity: Option<TransactionProximity>,
    pub conversation_pattern: ConversationPattern,
}

/// The message a context is built around
#[derive(Debug, Clone)]
pub struct ContextTarget<'a> {
    pub sender_id: &'a str,
    pub receiver_id: &'a str,
    pub conversation_id: Option<&'a str>,
    pub at: DateTime<Utc>,
}

const ESCALATION_SIGNAL_TYPES: u64 = 2;

pub struct ContextAnalyzer {
    store: Arc<dyn DetectionStore>,
    config: ContextConfig,
}

impl ContextAnalyzer {
    pub fn new(store: Arc<dyn DetectionStore>, config: ContextConfig) -> Self {
        Self { store, config }
    }

    pub async fn analyze(&self, target: &ContextTarget<'_>) -> ConversationContext {
        let (messages, transaction_proximity, conversation_pattern) = tokio::join!(
            self.message_window(target),
            self.transaction_proximity(target),
            self.conversation_pattern(target),
        );
        ConversationContext {
            messages,
            transaction_proximity,
            conversation_pattern,
        }
    }

    async fn message_window(&self, target: &ContextTarget<'_>) -> Vec<ContextMessage> {
        let anchor = MessageAnchor {
            sender_id: target.sender_id,
            receiver_id: target.receiver_id,
            conversation_id: target.conversation_id,
            at: target.at,
        };
        let limit = self.config.window_size * 2 + 1;
        let span = Duration::minutes(self.config.window_span_minutes);

        match self.store.message_window(&anchor, span, limit).await {
            Ok(rows) => rows
                .into_iter()
                .map(|m| ContextMessage {
                    id: m.id,
                    sender_id: m.sender_id,
                    created_at: m.created_at,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Message window lookup failed");
                Vec::new()
            }
        }
    }

    async fn transaction_proximity(&self, target: &ContextTarget<'_>) -> Option<TransactionProximity> {
        match self
            .store
            .nearest_transaction(target.sender_id, target.receiver_id, target.at)
            .await
        {
            Ok(tx) => tx.map(|tx| self.proximity(&tx, target.at)),
            Err(e) => {
                warn!(error = %e, "Transaction proximity lookup failed");
                None
            }
        }
    }

    fn proximity(&self, tx: &TransactionRecord, at: DateTime<Utc>) -> TransactionProximity {
        let time_delta_ms = (tx.created_at - at).num_milliseconds();
        TransactionProximity {
            transaction_id: tx.id.clone(),
            status: tx.status.clone(),
            amount: tx.amount,
            time_delta_ms,
            phase: TransactionPhase::classify(time_delta_ms, self.config.payment_window_secs),
        }
    }

    async fn conversation_pattern(&self, target: &ContextTarget<'_>) -> ConversationPattern {
        let (counts, unique) = tokio::join!(
            self.store.conversation_counts(target.sender_id, target.receiver_id),
            self.store.distinct_signal_types(target.sender_id),
        );

        let counts = counts.unwrap_or_else(|e| {
            warn!(error = %e, "Conversation count lookup failed");
            Default::default()
        });
        let unique_signal_types = unique.unwrap_or_else(|e| {
            warn!(error = %e, "Signal history lookup failed");
            0
        });

        ConversationPattern {
            message_count: counts.total,
            unique_signal_types,
            has_escalation: unique_signal_types > ESCALATION_SIGNAL_TYPES,
            sender_initiated_count: counts.sender_initiated,
            receiver_initiated_count: counts.receiver_initiated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::signals::{Evidence, SignalType};
    use crate::storage::{MemoryStore, MessageRecord, StoredSignal};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn message(id: &str, from: &str, to: &str, when: DateTime<Utc>) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            conversation_id: None,
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            content: String::new(),
            created_at: when,
        }
    }

    fn target(when: DateTime<Utc>) -> ContextTarget<'static> {
        ContextTarget {
            sender_id: "alice",
            receiver_id: "bob",
            conversation_id: None,
            at: when,
        }
    }

    #[test_case(120_000, TransactionPhase::PaymentWindow; "two minutes before")]
    #[test_case(299_999, TransactionPhase::PaymentWindow; "just inside window")]
    #[test_case(300_000, TransactionPhase::PrePayment; "window edge")]
    #[test_case(3_600_000, TransactionPhase::PrePayment; "an hour before")]
    #[test_case(0, TransactionPhase::PostPayment; "same instant")]
    #[test_case(-60_000, TransactionPhase::PostPayment; "after transaction")]
    fn test_phase_classification(delta_ms: i64, expected: TransactionPhase) {
        assert_eq!(TransactionPhase::classify(delta_ms, 300), expected);
    }

    #[tokio::test]
    async fn test_context_merges_three_lookups() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..12 {
            let (from, to) = if i % 3 == 0 { ("bob", "alice") } else { ("alice", "bob") };
            store.add_message(message(&format!("m{}", i), from, to, at(12, i * 5)));
        }
        store.add_transaction(crate::storage::TransactionRecord {
            id: "tx-1".to_string(),
            user_id: "alice".to_string(),
            counterparty_id: Some("bob".to_string()),
            amount: 80.0,
            status: "pending".to_string(),
            created_at: at(12, 32),
        });
        for (i, signal_type) in [SignalType::ContactPhone, SignalType::ContactEmail, SignalType::PaymentExternal]
            .into_iter()
            .enumerate()
        {
            store
                .insert_signal(&StoredSignal {
                    id: format!("s{}", i),
                    source_event_id: "e".to_string(),
                    user_id: "alice".to_string(),
                    signal_type,
                    confidence: 0.5,
                    evidence: Evidence::default(),
                    obfuscation_flags: Default::default(),
                    pattern_flags: Default::default(),
                    created_at: at(11, 0),
                })
                .await
                .unwrap();
        }

        let analyzer = ContextAnalyzer::new(store, ContextConfig::default());
        let context = analyzer.analyze(&target(at(12, 30))).await;

        let ids: Vec<_> = context.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m4", "m5", "m6", "m7", "m8"]);

        let proximity = context.transaction_proximity.unwrap();
        assert_eq!(proximity.time_delta_ms, 120_000);
        assert_eq!(proximity.phase, TransactionPhase::PaymentWindow);

        assert_eq!(context.conversation_pattern.message_count, 12);
        assert_eq!(context.conversation_pattern.sender_initiated_count, 8);
        assert_eq!(context.conversation_pattern.receiver_initiated_count, 4);
        assert_eq!(context.conversation_pattern.unique_signal_types, 3);
        assert!(context.conversation_pattern.has_escalation);
    }

    #[tokio::test]
    async fn test_empty_history_yields_empty_context() {
        let analyzer = ContextAnalyzer::new(Arc::new(MemoryStore::new()), ContextConfig::default());
        let context = analyzer.analyze(&target(at(9, 0))).await;
        assert_eq!(context, ConversationContext::default());
    }
}
