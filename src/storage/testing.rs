//! Store wrapper that fails chosen queries, for exercising degraded paths

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use super::memory::MemoryStore;
use super::*;
use crate::core::errors::{DetectionError, Result};

/// Delegates to a [`MemoryStore`] except for the named trait methods, which return a
/// storage error
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failing: HashSet<&'static str>,
}

impl FlakyStore {
    pub fn failing(methods: &[&'static str]) -> Self {
        Self {
            inner: MemoryStore::new(),
            failing: methods.iter().copied().collect(),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check(&self, method: &'static str) -> Result<()> {
        if self.failing.contains(method) {
            return Err(DetectionError::Storage(format!("{} unavailable", method)));
        }
        Ok(())
    }
}

#[async_trait]
impl DetectionStore for FlakyStore {
    async fn message_window(
        &self,
        anchor: &MessageAnchor<'_>,
        span: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        self.check("message_window")?;
        self.inner.message_window(anchor, span, limit).await
    }

    async fn nearest_transaction(
        &self,
        user_id: &str,
        counterparty_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<TransactionRecord>> {
        self.check("nearest_transaction")?;
        self.inner.nearest_transaction(user_id, counterparty_id, at).await
    }

    async fn conversation_counts(&self, sender_id: &str, receiver_id: &str) -> Result<ConversationCounts> {
        self.check("conversation_counts")?;
        self.inner.conversation_counts(sender_id, receiver_id).await
    }

    async fn distinct_signal_types(&self, user_id: &str) -> Result<u64> {
        self.check("distinct_signal_types")?;
        self.inner.distinct_signal_types(user_id).await
    }

    async fn booking(&self, booking_id: &str) -> Result<Option<BookingRecord>> {
        self.check("booking")?;
        self.inner.booking(booking_id).await
    }

    async fn count_bookings(&self, query: &BookingQuery<'_>) -> Result<u64> {
        self.check("count_bookings")?;
        self.inner.count_bookings(query).await
    }

    async fn category_duration_stats(&self, category: &str) -> Result<Stats> {
        self.check("category_duration_stats")?;
        self.inner.category_duration_stats(category).await
    }

    async fn category_amount_stats(&self, category: &str) -> Result<Stats> {
        self.check("category_amount_stats")?;
        self.inner.category_amount_stats(category).await
    }

    async fn provider_duration_stats(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Stats> {
        self.check("provider_duration_stats")?;
        self.inner.provider_duration_stats(provider_id, since, until).await
    }

    async fn provider_booking_tally(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<BookingTally> {
        self.check("provider_booking_tally")?;
        self.inner.provider_booking_tally(provider_id, since, until).await
    }

    async fn count_identity_matches(&self, user_id: &str) -> Result<u64> {
        self.check("count_identity_matches")?;
        self.inner.count_identity_matches(user_id).await
    }

    async fn count_ratings(
        &self,
        provider_id: &str,
        min_score: Option<f64>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        self.check("count_ratings")?;
        self.inner.count_ratings(provider_id, min_score, since, until).await
    }

    async fn wallet_tally(&self, query: &WalletTxQuery<'_>) -> Result<Tally> {
        self.check("wallet_tally")?;
        self.inner.wallet_tally(query).await
    }

    async fn wallet_amount_stats(&self, user_id: &str, tx_type: Option<&str>) -> Result<Stats> {
        self.check("wallet_amount_stats")?;
        self.inner.wallet_amount_stats(user_id, tx_type).await
    }

    async fn distinct_payment_methods(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        self.check("distinct_payment_methods")?;
        self.inner.distinct_payment_methods(user_id, since, until).await
    }

    async fn count_activity(&self, user_id: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<u64> {
        self.check("count_activity")?;
        self.inner.count_activity(user_id, since, until).await
    }

    async fn last_activity_before(&self, user_id: &str, before: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        self.check("last_activity_before")?;
        self.inner.last_activity_before(user_id, before).await
    }

    async fn record_activity(&self, activity: &ActivityRecord) -> Result<()> {
        self.check("record_activity")?;
        self.inner.record_activity(activity).await
    }

    async fn latest_risk_tier(&self, user_id: &str) -> Result<Option<String>> {
        self.check("latest_risk_tier")?;
        self.inner.latest_risk_tier(user_id).await
    }

    async fn count_enforcement_actions(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64> {
        self.check("count_enforcement_actions")?;
        self.inner.count_enforcement_actions(user_id, since).await
    }

    async fn find_flagged_contact_owner(
        &self,
        field: ContactField,
        value: &str,
        exclude_user_id: &str,
    ) -> Result<Option<String>> {
        self.check("find_flagged_contact_owner")?;
        self.inner.find_flagged_contact_owner(field, value, exclude_user_id).await
    }

    async fn recent_signals(
        &self,
        user_id: &str,
        types: &[SignalType],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredSignal>> {
        self.check("recent_signals")?;
        self.inner.recent_signals(user_id, types, since, until, limit).await
    }

    async fn insert_signal(&self, signal: &StoredSignal) -> Result<()> {
        self.check("insert_signal")?;
        self.inner.insert_signal(signal).await
    }

    async fn insert_correlation(&self, record: &CorrelationRecord) -> Result<()> {
        self.check("insert_correlation")?;
        self.inner.insert_correlation(record).await
    }

    async fn latest_leakage(
        &self,
        user_id: &str,
        counterparty_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<LeakageRecord>> {
        self.check("latest_leakage")?;
        self.inner.latest_leakage(user_id, counterparty_id, since, until).await
    }

    async fn save_leakage(&self, record: &LeakageRecord) -> Result<()> {
        self.check("save_leakage")?;
        self.inner.save_leakage(record).await
    }

    async fn latest_booking_amount(&self, client_id: &str, provider_id: &str) -> Result<Option<f64>> {
        self.check("latest_booking_amount")?;
        self.inner.latest_booking_amount(client_id, provider_id).await
    }

    async fn completed_amount_stats(&self) -> Result<Stats> {
        self.check("completed_amount_stats")?;
        self.inner.completed_amount_stats().await
    }

    async fn record_interaction(
        &self,
        user_a_id: &str,
        user_b_id: &str,
        relationship_type: RelationshipType,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<RelationshipRecord> {
        self.check("record_interaction")?;
        self.inner
            .record_interaction(user_a_id, user_b_id, relationship_type, value, at)
            .await
    }
}
