//! Payment anomaly consumer
//!
//! Round-trip transfers, rapid top-ups, split payments, method switching and withdrawal
//! spikes over the wallet ledger.

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

use crate::detection::baseline::{BaselineAnomalyDetector, Confidence, Finding, Measurement, Trigger};
use crate::detection::consumers::{emit, evidence_for, through};
use crate::detection::persist::SignalSink;
use crate::detection::signals::{GeneratedSignal, SignalType};
use crate::events::dispatcher::Consumer;
use crate::events::types::{DomainEvent, EventType, PaymentPayload};
use crate::storage::{DetectionStore, WalletTxQuery};

pub const NAME: &str = "payment-anomaly-detection";

const EVENT_TYPES: &[EventType] = &[
    EventType::WalletDeposit,
    EventType::WalletWithdrawal,
    EventType::WalletTransfer,
    EventType::TransactionInitiated,
    EventType::TransactionCompleted,
    EventType::TransactionFailed,
];

/// Reverse transfers within this band of the amount count as a round trip
const CIRCULAR_BAND: f64 = 0.2;

const CIRCULAR: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "payment_circular",
    signal_type: SignalType::PaymentCircular,
    trigger: Trigger::CountAbove(0.0),
    confidence: Confidence::Fixed(0.75),
};

const RAPID_TOPUP: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "payment_rapid_topup",
    signal_type: SignalType::PaymentRapidTopup,
    trigger: Trigger::CountAtLeast(3.0),
    confidence: Confidence::Linear { base: 0.5, step: 0.1, from: 3.0, cap: 0.85 },
};

/// Hour total to one counterparty above the user's average single transaction
const SPLIT: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "payment_split_transaction",
    signal_type: SignalType::PaymentSplitTransaction,
    trigger: Trigger::RatioAbove(1.0),
    confidence: Confidence::Fixed(0.6),
};

const METHOD_SWITCHING: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "payment_method_switching",
    signal_type: SignalType::PaymentMethodSwitching,
    trigger: Trigger::CountAtLeast(3.0),
    confidence: Confidence::Fixed(0.5),
};

const WITHDRAWAL_SPIKE: BaselineAnomalyDetector = BaselineAnomalyDetector {
    name: "payment_withdrawal_spike",
    signal_type: SignalType::PaymentWithdrawalSpike,
    trigger: Trigger::RatioAbove(2.0),
    confidence: Confidence::Fixed(0.6),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    Circular,
    RapidTopup,
    Split,
    MethodSwitching,
    WithdrawalSpike,
}

fn checks_for(event_type: EventType) -> &'static [Check] {
    use Check::*;
    match event_type {
        EventType::WalletTransfer | EventType::TransactionInitiated => &[Circular, Split, MethodSwitching],
        EventType::WalletDeposit => &[RapidTopup, MethodSwitching],
        EventType::WalletWithdrawal => &[WithdrawalSpike, MethodSwitching],
        EventType::TransactionCompleted => &[Split],
        EventType::TransactionFailed => &[MethodSwitching],
        _ => &[],
    }
}

pub struct PaymentAnomalyConsumer {
    store: Arc<dyn DetectionStore>,
    sink: SignalSink,
}

impl PaymentAnomalyConsumer {
    pub fn new(store: Arc<dyn DetectionStore>) -> Self {
        Self {
            sink: SignalSink::new(store.clone()),
            store,
        }
    }

    async fn check(&self, check: Check, event: &DomainEvent, p: &PaymentPayload) -> Option<Finding> {
        let store = &self.store;
        let until = through(event);
        let counterparty = p.counterparty_id.as_deref().filter(|c| !c.is_empty());

        match check {
            Check::Circular => {
                CIRCULAR
                    .run(async {
                        let Some(counterparty) = counterparty.filter(|_| p.amount > 0.0) else {
                            return Ok(None);
                        };
                        let reverse = store
                            .wallet_tally(&WalletTxQuery {
                                user_id: counterparty,
                                counterparty_id: Some(&p.user_id),
                                tx_type: None,
                                min_amount: Some(p.amount * (1.0 - CIRCULAR_BAND)),
                                max_amount: Some(p.amount * (1.0 + CIRCULAR_BAND)),
                                since: event.timestamp - Duration::hours(48),
                                until,
                            })
                            .await?;
                        Ok(Some(Measurement::count(reverse.count)))
                    })
                    .await
            }
            Check::RapidTopup => {
                RAPID_TOPUP
                    .run(async {
                        let deposits = store
                            .wallet_tally(&WalletTxQuery {
                                user_id: &p.user_id,
                                counterparty_id: None,
                                tx_type: Some("deposit"),
                                min_amount: None,
                                max_amount: None,
                                since: event.timestamp - Duration::hours(24),
                                until,
                            })
                            .await?;
                        Ok(Some(Measurement::count(deposits.count)))
                    })
                    .await
            }
            Check::Split => {
                SPLIT
                    .run(async {
                        let Some(counterparty) = counterparty else {
                            return Ok(None);
                        };
                        let hour = store
                            .wallet_tally(&WalletTxQuery {
                                user_id: &p.user_id,
                                counterparty_id: Some(counterparty),
                                tx_type: None,
                                min_amount: None,
                                max_amount: None,
                                since: event.timestamp - Duration::hours(1),
                                until,
                            })
                            .await?;
                        if hour.count < 2 {
                            return Ok(None);
                        }
                        let average = store.wallet_amount_stats(&p.user_id, None).await?.mean_opt();
                        Ok(average.map(|avg| Measurement::against(hour.sum, avg)))
                    })
                    .await
            }
            Check::MethodSwitching => {
                METHOD_SWITCHING
                    .run(async {
                        let methods = store
                            .distinct_payment_methods(&p.user_id, event.timestamp - Duration::days(7), until)
                            .await?;
                        Ok(Some(Measurement::count(methods)))
                    })
                    .await
            }
            Check::WithdrawalSpike => {
                WITHDRAWAL_SPIKE
                    .run(async {
                        if p.amount <= 0.0 {
                            return Ok(None);
                        }
                        let deposits = store.wallet_amount_stats(&p.user_id, Some("deposit")).await?;
                        Ok(deposits.mean_opt().map(|avg| Measurement::against(p.amount, avg)))
                    })
                    .await
            }
        }
    }
}

#[async_trait]
impl Consumer for PaymentAnomalyConsumer {
    fn name(&self) -> &str {
        NAME
    }

    fn event_types(&self) -> &[EventType] {
        EVENT_TYPES
    }

    async fn handle(&self, event: &DomainEvent) -> Vec<GeneratedSignal> {
        let Some(payload) = event.payload_as::<PaymentPayload>() else {
            return Vec::new();
        };
        if payload.user_id.is_empty() {
            return Vec::new();
        }

        let mut evidence = evidence_for(event).with("amount", payload.amount);
        if let Some(counterparty) = &payload.counterparty_id {
            evidence = evidence.with("counterparty_id", counterparty.as_str());
        }
        if let Some(tx) = &payload.wallet_tx_id {
            evidence = evidence.with("wallet_tx_id", tx.as_str());
        }

        let mut signals = Vec::new();
        for check in checks_for(event.event_type) {
            if let Some(finding) = self.check(*check, event, &payload).await {
                signals.push(finding.into_signal(evidence.clone()));
            }
        }
        emit(NAME, &self.sink, event, &payload.user_id, signals).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, WalletTxRecord};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn wallet_tx(
        user: &str,
        counterparty: Option<&str>,
        tx_type: &str,
        amount: f64,
        method: Option<&str>,
        at: DateTime<Utc>,
    ) -> WalletTxRecord {
        WalletTxRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.to_string(),
            counterparty_id: counterparty.map(str::to_string),
            tx_type: tx_type.to_string(),
            amount,
            payment_method: method.map(str::to_string),
            created_at: at,
        }
    }

    fn types(signals: &[GeneratedSignal]) -> Vec<SignalType> {
        signals.iter().map(|s| s.signal_type).collect()
    }

    #[tokio::test]
    async fn test_circular_transfer() {
        let store = Arc::new(MemoryStore::new());
        store.add_wallet_tx(wallet_tx("bob", Some("alice"), "transfer", 105.0, None, t0() - Duration::hours(5)));
        let consumer = PaymentAnomalyConsumer::new(store);

        let event = DomainEvent::new(
            EventType::WalletTransfer,
            t0(),
            json!({"user_id": "alice", "counterparty_id": "bob", "amount": 100.0}),
        );
        let signals = consumer.handle(&event).await;
        assert_eq!(types(&signals), vec![SignalType::PaymentCircular]);
        assert_eq!(signals[0].confidence, 0.75);
    }

    #[tokio::test]
    async fn test_circular_ignores_amounts_outside_band() {
        let store = Arc::new(MemoryStore::new());
        store.add_wallet_tx(wallet_tx("bob", Some("alice"), "transfer", 150.0, None, t0() - Duration::hours(5)));
        let consumer = PaymentAnomalyConsumer::new(store);
        let event = DomainEvent::new(
            EventType::WalletTransfer,
            t0(),
            json!({"user_id": "alice", "counterparty_id": "bob", "amount": 100.0}),
        );
        assert!(consumer.handle(&event).await.is_empty());
    }

    #[tokio::test]
    async fn test_rapid_topup_and_method_switching() {
        let store = Arc::new(MemoryStore::new());
        for (i, method) in ["card", "bank", "crypto", "card"].into_iter().enumerate() {
            store.add_wallet_tx(wallet_tx(
                "alice",
                None,
                "deposit",
                50.0,
                Some(method),
                t0() - Duration::hours(i as i64 + 1),
            ));
        }
        let consumer = PaymentAnomalyConsumer::new(store);
        let event = DomainEvent::new(EventType::WalletDeposit, t0(), json!({"user_id": "alice", "amount": 50.0}));
        let signals = consumer.handle(&event).await;

        assert_eq!(
            types(&signals),
            vec![SignalType::PaymentRapidTopup, SignalType::PaymentMethodSwitching]
        );
        assert!((signals[0].confidence - 0.6).abs() < 1e-9);
        assert_eq!(signals[1].confidence, 0.5);
    }

    #[tokio::test]
    async fn test_split_transaction() {
        let store = Arc::new(MemoryStore::new());
        for minutes in [10, 20, 30] {
            store.add_wallet_tx(wallet_tx(
                "alice",
                Some("carol"),
                "transfer",
                40.0,
                None,
                t0() - Duration::minutes(minutes),
            ));
        }
        let consumer = PaymentAnomalyConsumer::new(store);
        let event = DomainEvent::new(
            EventType::TransactionCompleted,
            t0(),
            json!({"user_id": "alice", "counterparty_id": "carol", "amount": 40.0}),
        );
        let signals = consumer.handle(&event).await;
        assert_eq!(types(&signals), vec![SignalType::PaymentSplitTransaction]);
    }

    #[tokio::test]
    async fn test_split_average_ignores_refunds() {
        let store = Arc::new(MemoryStore::new());
        store.add_wallet_tx(wallet_tx("alice", Some("dave"), "transfer", 200.0, None, t0() - Duration::days(4)));
        store.add_wallet_tx(wallet_tx("alice", Some("dave"), "refund", -200.0, None, t0() - Duration::days(3)));
        for minutes in [10, 20] {
            store.add_wallet_tx(wallet_tx(
                "alice",
                Some("carol"),
                "transfer",
                40.0,
                None,
                t0() - Duration::minutes(minutes),
            ));
        }
        let consumer = PaymentAnomalyConsumer::new(store);
        let event = DomainEvent::new(
            EventType::TransactionCompleted,
            t0(),
            json!({"user_id": "alice", "counterparty_id": "carol", "amount": 40.0}),
        );
        // 80 in the hour against a positive-only average of about 93
        assert!(consumer.handle(&event).await.is_empty());
    }

    #[tokio::test]
    async fn test_withdrawal_spike_needs_deposit_history() {
        let store = Arc::new(MemoryStore::new());
        let consumer = PaymentAnomalyConsumer::new(store.clone());
        let event = DomainEvent::new(EventType::WalletWithdrawal, t0(), json!({"user_id": "alice", "amount": 500.0}));
        assert!(consumer.handle(&event).await.is_empty());

        store.add_wallet_tx(wallet_tx("alice", None, "deposit", 100.0, None, t0() - Duration::days(3)));
        let signals = consumer.handle(&event).await;
        assert_eq!(types(&signals), vec![SignalType::PaymentWithdrawalSpike]);
        assert_eq!(signals[0].evidence.get("statistic").and_then(|v| v.as_f64()), Some(5.0));
    }
}
