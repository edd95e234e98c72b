//! In-memory store
//!
//! Backs tests and offline replay. Every table is a plain `Vec` behind one lock; queries
//! are linear scans with the same semantics as the SQL in [`super::sqlite`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;

use super::*;
use crate::core::errors::Result;

#[derive(Default)]
struct Tables {
    messages: Vec<MessageRecord>,
    transactions: Vec<TransactionRecord>,
    wallet_transactions: Vec<WalletTxRecord>,
    bookings: Vec<BookingRecord>,
    users: Vec<UserRecord>,
    ratings: Vec<RatingRecord>,
    risk_scores: Vec<RiskScoreRecord>,
    enforcement_actions: Vec<EnforcementRecord>,
    activity: Vec<ActivityRecord>,
    signals: Vec<StoredSignal>,
    correlations: Vec<CorrelationRecord>,
    leakage: Vec<LeakageRecord>,
    relationships: Vec<RelationshipRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        store.load_snapshot(snapshot);
        store
    }

    /// Append every row of `snapshot`
    pub fn load_snapshot(&self, snapshot: Snapshot) {
        let mut t = self.tables.write();
        t.messages.extend(snapshot.messages);
        t.transactions.extend(snapshot.transactions);
        t.wallet_transactions.extend(snapshot.wallet_transactions);
        t.bookings.extend(snapshot.bookings);
        t.users.extend(snapshot.users);
        t.ratings.extend(snapshot.ratings);
        t.risk_scores.extend(snapshot.risk_scores);
        t.enforcement_actions.extend(snapshot.enforcement_actions);
        t.activity.extend(snapshot.activity);
        t.signals.extend(snapshot.signals);
    }

    pub fn add_message(&self, record: MessageRecord) {
        self.tables.write().messages.push(record);
    }

    pub fn add_transaction(&self, record: TransactionRecord) {
        self.tables.write().transactions.push(record);
    }

    pub fn add_wallet_tx(&self, record: WalletTxRecord) {
        self.tables.write().wallet_transactions.push(record);
    }

    /// Insert or replace by id
    pub fn upsert_booking(&self, record: BookingRecord) {
        let mut t = self.tables.write();
        t.bookings.retain(|b| b.id != record.id);
        t.bookings.push(record);
    }

    pub fn add_user(&self, record: UserRecord) {
        self.tables.write().users.push(record);
    }

    pub fn add_rating(&self, record: RatingRecord) {
        self.tables.write().ratings.push(record);
    }

    pub fn add_risk_score(&self, record: RiskScoreRecord) {
        self.tables.write().risk_scores.push(record);
    }

    pub fn add_enforcement_action(&self, record: EnforcementRecord) {
        self.tables.write().enforcement_actions.push(record);
    }

    pub fn signals(&self) -> Vec<StoredSignal> {
        self.tables.read().signals.clone()
    }

    pub fn correlations(&self) -> Vec<CorrelationRecord> {
        self.tables.read().correlations.clone()
    }

    pub fn leakage_events(&self) -> Vec<LeakageRecord> {
        self.tables.read().leakage.clone()
    }

    pub fn relationships(&self) -> Vec<RelationshipRecord> {
        self.tables.read().relationships.clone()
    }
}

fn is_pair(a: &str, b: &str, x: &str, y: &Option<String>) -> bool {
    let y = y.as_deref();
    (x == a && y == Some(b)) || (x == b && y == Some(a))
}

fn completed_durations<'a>(bookings: impl Iterator<Item = &'a BookingRecord>) -> Stats {
    Stats::from_values(
        bookings
            .filter(|b| b.status == "completed")
            .filter_map(BookingRecord::duration_secs),
    )
}

#[async_trait]
impl DetectionStore for MemoryStore {
    async fn message_window(
        &self,
        anchor: &MessageAnchor<'_>,
        span: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let t = self.tables.read();
        let mut window: Vec<MessageRecord> = t
            .messages
            .iter()
            .filter(|m| {
                (m.sender_id == anchor.sender_id && m.receiver_id == anchor.receiver_id)
                    || (m.sender_id == anchor.receiver_id && m.receiver_id == anchor.sender_id)
            })
            .filter(|m| anchor.conversation_id.map_or(true, |c| m.conversation_id.as_deref() == Some(c)))
            .filter(|m| (m.created_at - anchor.at).abs() <= span)
            .cloned()
            .collect();

        window.sort_by_key(|m| (m.created_at - anchor.at).abs());
        window.truncate(limit);
        window.sort_by_key(|m| m.created_at);
        Ok(window)
    }

    async fn nearest_transaction(
        &self,
        user_id: &str,
        counterparty_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<TransactionRecord>> {
        let t = self.tables.read();
        Ok(t.transactions
            .iter()
            .filter(|tx| is_pair(user_id, counterparty_id, &tx.user_id, &tx.counterparty_id))
            .min_by_key(|tx| (tx.created_at - at).abs())
            .cloned())
    }

    async fn conversation_counts(&self, sender_id: &str, receiver_id: &str) -> Result<ConversationCounts> {
        let t = self.tables.read();
        let mut counts = ConversationCounts::default();
        for m in &t.messages {
            if m.sender_id == sender_id && m.receiver_id == receiver_id {
                counts.sender_initiated += 1;
            } else if m.sender_id == receiver_id && m.receiver_id == sender_id {
                counts.receiver_initiated += 1;
            } else {
                continue;
            }
            counts.total += 1;
        }
        Ok(counts)
    }

    async fn distinct_signal_types(&self, user_id: &str) -> Result<u64> {
        let t = self.tables.read();
        let types: HashSet<SignalType> = t
            .signals
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.signal_type)
            .collect();
        Ok(types.len() as u64)
    }

    async fn booking(&self, booking_id: &str) -> Result<Option<BookingRecord>> {
        Ok(self.tables.read().bookings.iter().find(|b| b.id == booking_id).cloned())
    }

    async fn count_bookings(&self, query: &BookingQuery<'_>) -> Result<u64> {
        let t = self.tables.read();
        Ok(t.bookings
            .iter()
            .filter(|b| query.client_id.map_or(true, |c| b.client_id == c))
            .filter(|b| query.provider_id.map_or(true, |p| b.provider_id == p))
            .filter(|b| query.status.map_or(true, |s| b.status == s))
            .filter(|b| in_window(b.updated_at, query.since, query.until))
            .count() as u64)
    }

    async fn category_duration_stats(&self, category: &str) -> Result<Stats> {
        let t = self.tables.read();
        Ok(completed_durations(
            t.bookings
                .iter()
                .filter(|b| b.service_category.as_deref() == Some(category)),
        ))
    }

    async fn category_amount_stats(&self, category: &str) -> Result<Stats> {
        let t = self.tables.read();
        Ok(Stats::from_values(
            t.bookings
                .iter()
                .filter(|b| b.service_category.as_deref() == Some(category))
                .filter_map(|b| b.amount),
        ))
    }

    async fn provider_duration_stats(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Stats> {
        let t = self.tables.read();
        Ok(completed_durations(t.bookings.iter().filter(|b| {
            b.provider_id == provider_id && in_window(b.updated_at, Some(since), Some(until))
        })))
    }

    async fn provider_booking_tally(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<BookingTally> {
        let t = self.tables.read();
        let mut tally = BookingTally::default();
        for b in t.bookings.iter().filter(|b| {
            b.provider_id == provider_id && in_window(b.updated_at, Some(since), Some(until))
        }) {
            tally.total += 1;
            if b.status == "cancelled" {
                tally.cancelled += 1;
            }
        }
        Ok(tally)
    }

    async fn count_identity_matches(&self, user_id: &str) -> Result<u64> {
        let t = self.tables.read();
        let Some(user) = t.users.iter().find(|u| u.id == user_id) else {
            return Ok(0);
        };
        let same = |mine: &Option<String>, theirs: &Option<String>| {
            matches!((mine, theirs), (Some(a), Some(b)) if !a.is_empty() && a == b)
        };
        Ok(t.users
            .iter()
            .filter(|u| u.id != user_id)
            .filter(|u| same(&user.phone, &u.phone) || same(&user.email, &u.email))
            .count() as u64)
    }

    async fn count_ratings(
        &self,
        provider_id: &str,
        min_score: Option<f64>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        let t = self.tables.read();
        Ok(t.ratings
            .iter()
            .filter(|r| r.provider_id == provider_id)
            .filter(|r| min_score.map_or(true, |min| r.score >= min))
            .filter(|r| in_window(r.created_at, Some(since), Some(until)))
            .count() as u64)
    }

    async fn wallet_tally(&self, query: &WalletTxQuery<'_>) -> Result<Tally> {
        let t = self.tables.read();
        let mut tally = Tally::default();
        for tx in t.wallet_transactions.iter().filter(|tx| {
            tx.user_id == query.user_id
                && query.counterparty_id.map_or(true, |c| tx.counterparty_id.as_deref() == Some(c))
                && query.tx_type.map_or(true, |k| tx.tx_type == k)
                && query.min_amount.map_or(true, |min| tx.amount >= min)
                && query.max_amount.map_or(true, |max| tx.amount <= max)
                && in_window(tx.created_at, Some(query.since), Some(query.until))
        }) {
            tally.count += 1;
            tally.sum += tx.amount;
        }
        Ok(tally)
    }

    async fn wallet_amount_stats(&self, user_id: &str, tx_type: Option<&str>) -> Result<Stats> {
        let t = self.tables.read();
        Ok(Stats::from_values(
            t.wallet_transactions
                .iter()
                .filter(|tx| tx.user_id == user_id && tx_type.map_or(true, |k| tx.tx_type == k))
                .map(|tx| tx.amount)
                .filter(|amount| *amount > 0.0),
        ))
    }

    async fn distinct_payment_methods(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        let t = self.tables.read();
        let methods: HashSet<&str> = t
            .wallet_transactions
            .iter()
            .filter(|tx| tx.user_id == user_id && in_window(tx.created_at, Some(since), Some(until)))
            .filter_map(|tx| tx.payment_method.as_deref())
            .collect();
        Ok(methods.len() as u64)
    }

    async fn count_activity(&self, user_id: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<u64> {
        let t = self.tables.read();
        Ok(t.activity
            .iter()
            .filter(|a| a.user_id == user_id && in_window(a.created_at, Some(since), Some(until)))
            .count() as u64)
    }

    async fn last_activity_before(&self, user_id: &str, before: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let t = self.tables.read();
        Ok(t.activity
            .iter()
            .filter(|a| a.user_id == user_id && a.created_at < before)
            .map(|a| a.created_at)
            .max())
    }

    async fn record_activity(&self, activity: &ActivityRecord) -> Result<()> {
        self.tables.write().activity.push(activity.clone());
        Ok(())
    }

    async fn latest_risk_tier(&self, user_id: &str) -> Result<Option<String>> {
        let t = self.tables.read();
        Ok(t.risk_scores
            .iter()
            .filter(|r| r.user_id == user_id)
            .max_by_key(|r| r.created_at)
            .map(|r| r.tier.clone()))
    }

    async fn count_enforcement_actions(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64> {
        let t = self.tables.read();
        Ok(t.enforcement_actions
            .iter()
            .filter(|a| a.user_id == user_id && a.created_at >= since)
            .count() as u64)
    }

    async fn find_flagged_contact_owner(
        &self,
        field: ContactField,
        value: &str,
        exclude_user_id: &str,
    ) -> Result<Option<String>> {
        let t = self.tables.read();
        let latest_tier = |user_id: &str| {
            t.risk_scores
                .iter()
                .filter(|r| r.user_id == user_id)
                .max_by_key(|r| r.created_at)
                .map(|r| r.tier.as_str())
        };
        Ok(t.users
            .iter()
            .filter(|u| u.id != exclude_user_id)
            .filter(|u| {
                let stored = match field {
                    ContactField::Phone => u.phone.as_deref(),
                    ContactField::Email => u.email.as_deref(),
                };
                stored == Some(value)
            })
            .find(|u| latest_tier(&u.id).map_or(false, is_flagged_tier))
            .map(|u| u.id.clone()))
    }

    async fn recent_signals(
        &self,
        user_id: &str,
        types: &[SignalType],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredSignal>> {
        let t = self.tables.read();
        let mut found: Vec<StoredSignal> = t
            .signals
            .iter()
            .filter(|s| s.user_id == user_id && types.contains(&s.signal_type))
            .filter(|s| in_window(s.created_at, Some(since), Some(until)))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit);
        Ok(found)
    }

    async fn insert_signal(&self, signal: &StoredSignal) -> Result<()> {
        self.tables.write().signals.push(signal.clone());
        Ok(())
    }

    async fn insert_correlation(&self, record: &CorrelationRecord) -> Result<()> {
        self.tables.write().correlations.push(record.clone());
        Ok(())
    }

    async fn latest_leakage(
        &self,
        user_id: &str,
        counterparty_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<LeakageRecord>> {
        let t = self.tables.read();
        Ok(t.leakage
            .iter()
            .filter(|l| l.user_id == user_id && l.counterparty_id == counterparty_id)
            .filter(|l| in_window(l.created_at, Some(since), Some(until)))
            .max_by_key(|l| l.created_at)
            .cloned())
    }

    async fn save_leakage(&self, record: &LeakageRecord) -> Result<()> {
        let mut t = self.tables.write();
        match t.leakage.iter_mut().find(|l| l.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => t.leakage.push(record.clone()),
        }
        Ok(())
    }

    async fn latest_booking_amount(&self, client_id: &str, provider_id: &str) -> Result<Option<f64>> {
        let t = self.tables.read();
        Ok(t.bookings
            .iter()
            .filter(|b| b.client_id == client_id && b.provider_id == provider_id)
            .filter(|b| b.amount.is_some())
            .max_by_key(|b| b.created_at)
            .and_then(|b| b.amount))
    }

    async fn completed_amount_stats(&self) -> Result<Stats> {
        let t = self.tables.read();
        Ok(Stats::from_values(
            t.bookings
                .iter()
                .filter(|b| b.status == "completed")
                .filter_map(|b| b.amount),
        ))
    }

    async fn record_interaction(
        &self,
        user_a_id: &str,
        user_b_id: &str,
        relationship_type: RelationshipType,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<RelationshipRecord> {
        let mut t = self.tables.write();
        let existing = t.relationships.iter_mut().find(|r| {
            r.user_a_id == user_a_id && r.user_b_id == user_b_id && r.relationship_type == relationship_type
        });
        let edge = match existing {
            Some(edge) => {
                edge.interaction_count += 1;
                edge.total_value += value;
                edge.last_interaction_at = edge.last_interaction_at.max(at);
                edge.clone()
            }
            None => {
                let edge = RelationshipRecord {
                    user_a_id: user_a_id.to_string(),
                    user_b_id: user_b_id.to_string(),
                    relationship_type,
                    interaction_count: 1,
                    total_value: value,
                    first_interaction_at: at,
                    last_interaction_at: at,
                };
                t.relationships.push(edge.clone());
                edge
            }
        };
        Ok(edge)
    }
}
