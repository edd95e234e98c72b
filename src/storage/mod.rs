//! Storage seam
//!
//! Detectors only see [`DetectionStore`]: parameterized reads over the platform tables and
//! the two write paths (`risk_signals`, `signal_correlations`). All time windows are passed
//! in by the caller as half-open `[since, until)` ranges.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::errors::Result;
use crate::detection::signals::{Evidence, SignalType};
use crate::events::types::ContactField;

pub mod memory;
pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Platform transaction between two users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub counterparty_id: Option<String>,
    pub amount: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTxRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub counterparty_id: Option<String>,
    pub tx_type: String,
    pub amount: f64,
    #[serde(default)]
    pub payment_method: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: String,
    pub client_id: String,
    pub provider_id: String,
    #[serde(default)]
    pub service_category: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    pub status: String,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BookingRecord {
    /// Seconds from scheduled start to the last update (completion)
    pub fn duration_secs(&self) -> Option<f64> {
        self.scheduled_at
            .map(|start| (self.updated_at - start).num_milliseconds() as f64 / 1000.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub id: String,
    pub client_id: String,
    pub provider_id: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Output of the downstream scoring stage; read here only for the user's tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScoreRecord {
    pub user_id: String,
    pub tier: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementRecord {
    pub id: String,
    pub user_id: String,
    pub action_type: String,
    pub created_at: DateTime<Utc>,
}

/// One audited domain event attributed to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub user_id: String,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
}

/// A row of `risk_signals`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSignal {
    pub id: String,
    pub source_event_id: String,
    pub user_id: String,
    pub signal_type: SignalType,
    pub confidence: f64,
    pub evidence: Evidence,
    #[serde(default)]
    pub obfuscation_flags: BTreeSet<String>,
    #[serde(default)]
    pub pattern_flags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationType {
    ContactThenCancel,
    ContactThenFakeComplete,
}

impl CorrelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContactThenCancel => "contact_then_cancel",
            Self::ContactThenFakeComplete => "contact_then_fake_complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contact_then_cancel" => Some(Self::ContactThenCancel),
            "contact_then_fake_complete" => Some(Self::ContactThenFakeComplete),
            _ => None,
        }
    }
}

/// A row of `signal_correlations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRecord {
    pub id: String,
    pub correlation_type: CorrelationType,
    pub user_id: String,
    pub counterparty_id: Option<String>,
    pub primary_signal_id: String,
    pub secondary_signal_id: Option<String>,
    pub booking_id: Option<String>,
    pub confidence: f64,
    pub time_delta_seconds: i64,
    pub evidence: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Stages of the off-platform leakage funnel, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakageStage {
    Signal,
    Attempt,
    Confirmation,
    Leakage,
}

impl LeakageStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::Attempt => "attempt",
            Self::Confirmation => "confirmation",
            Self::Leakage => "leakage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signal" => Some(Self::Signal),
            "attempt" => Some(Self::Attempt),
            "confirmation" => Some(Self::Confirmation),
            "leakage" => Some(Self::Leakage),
            _ => None,
        }
    }

    /// `None` once the funnel is complete
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Signal => Some(Self::Attempt),
            Self::Attempt => Some(Self::Confirmation),
            Self::Confirmation => Some(Self::Leakage),
            Self::Leakage => None,
        }
    }
}

/// A row of `leakage_events`: one funnel per (user, counterparty) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakageRecord {
    pub id: String,
    pub user_id: String,
    pub counterparty_id: String,
    pub stage: LeakageStage,
    pub signal_ids: Vec<String>,
    /// Signal types seen when the funnel was opened
    pub signal_types: BTreeSet<String>,
    pub evidence: serde_json::Value,
    pub platform_destination: Option<String>,
    pub estimated_revenue_loss: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Messaged,
    Transacted,
    Booked,
    Rated,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messaged => "messaged",
            Self::Transacted => "transacted",
            Self::Booked => "booked",
            Self::Rated => "rated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "messaged" => Some(Self::Messaged),
            "transacted" => Some(Self::Transacted),
            "booked" => Some(Self::Booked),
            "rated" => Some(Self::Rated),
            _ => None,
        }
    }
}

/// A row of `user_relationships`. `user_a_id < user_b_id` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub user_a_id: String,
    pub user_b_id: String,
    pub relationship_type: RelationshipType,
    pub interaction_count: u64,
    pub total_value: f64,
    pub first_interaction_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
}

impl RelationshipRecord {
    /// Log-scaled edge weight, reaching 1.0 around 20 interactions
    pub fn strength_score(&self) -> f64 {
        let raw = ((self.interaction_count + 1) as f64).ln() / 20f64.ln();
        ((raw * 1000.0).round() / 1000.0).min(1.0)
    }
}

/// Pre-existing platform state, loadable into either store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub messages: Vec<MessageRecord>,
    pub transactions: Vec<TransactionRecord>,
    pub wallet_transactions: Vec<WalletTxRecord>,
    pub bookings: Vec<BookingRecord>,
    pub users: Vec<UserRecord>,
    pub ratings: Vec<RatingRecord>,
    pub risk_scores: Vec<RiskScoreRecord>,
    pub enforcement_actions: Vec<EnforcementRecord>,
    pub activity: Vec<ActivityRecord>,
    pub signals: Vec<StoredSignal>,
}

/// Where a message sits, for the context window lookup
#[derive(Debug, Clone)]
pub struct MessageAnchor<'a> {
    pub sender_id: &'a str,
    pub receiver_id: &'a str,
    pub conversation_id: Option<&'a str>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversationCounts {
    pub total: u64,
    pub sender_initiated: u64,
    pub receiver_initiated: u64,
}

/// Count, mean and sample standard deviation of a numeric column
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub count: u64,
    pub mean: f64,
    pub stddev: f64,
}

impl Stats {
    pub fn from_sums(count: u64, sum: f64, sum_sq: f64) -> Self {
        if count == 0 {
            return Self::default();
        }
        let n = count as f64;
        let mean = sum / n;
        let stddev = if count > 1 {
            ((sum_sq - sum * sum / n) / (n - 1.0)).max(0.0).sqrt()
        } else {
            0.0
        };
        Self { count, mean, stddev }
    }

    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        let (count, sum, sum_sq) = values
            .into_iter()
            .fold((0u64, 0.0, 0.0), |(c, s, q), v| (c + 1, s + v, q + v * v));
        Self::from_sums(count, sum, sum_sq)
    }

    /// Mean, or `None` when there is nothing to average
    pub fn mean_opt(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Tally {
    pub count: u64,
    pub sum: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingTally {
    pub cancelled: u64,
    pub total: u64,
}

impl BookingTally {
    pub fn cancel_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.cancelled as f64 / self.total as f64)
    }
}

/// Booking count filter over `updated_at`
#[derive(Debug, Clone, Default)]
pub struct BookingQuery<'a> {
    pub client_id: Option<&'a str>,
    pub provider_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Wallet transaction filter over `created_at`
#[derive(Debug, Clone)]
pub struct WalletTxQuery<'a> {
    pub user_id: &'a str,
    pub counterparty_id: Option<&'a str>,
    pub tx_type: Option<&'a str>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

pub(crate) fn in_window(at: DateTime<Utc>, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |s| at >= s) && until.map_or(true, |u| at < u)
}

pub(crate) fn is_flagged_tier(tier: &str) -> bool {
    tier.eq_ignore_ascii_case("high") || tier.eq_ignore_ascii_case("critical")
}

/// Read queries and write paths used by the detectors
#[async_trait]
pub trait DetectionStore: Send + Sync {
    // context window

    /// Messages between the pair within `span` of the anchor, closest first up to `limit`,
    /// returned in time order
    async fn message_window(
        &self,
        anchor: &MessageAnchor<'_>,
        span: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<MessageRecord>>;

    /// Transaction between the pair closest in time to `at`
    async fn nearest_transaction(
        &self,
        user_id: &str,
        counterparty_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<TransactionRecord>>;

    async fn conversation_counts(&self, sender_id: &str, receiver_id: &str) -> Result<ConversationCounts>;

    /// Distinct signal types ever persisted for `user_id`
    async fn distinct_signal_types(&self, user_id: &str) -> Result<u64>;

    // bookings

    async fn booking(&self, booking_id: &str) -> Result<Option<BookingRecord>>;

    async fn count_bookings(&self, query: &BookingQuery<'_>) -> Result<u64>;

    /// Completion duration (seconds) over completed bookings in a category
    async fn category_duration_stats(&self, category: &str) -> Result<Stats>;

    async fn category_amount_stats(&self, category: &str) -> Result<Stats>;

    // providers

    /// Completion duration (seconds) of a provider's completed bookings updated in the window
    async fn provider_duration_stats(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Stats>;

    /// Cancelled and total bookings for a provider, by `updated_at`
    async fn provider_booking_tally(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<BookingTally>;

    /// Other users sharing this user's phone or email
    async fn count_identity_matches(&self, user_id: &str) -> Result<u64>;

    async fn count_ratings(
        &self,
        provider_id: &str,
        min_score: Option<f64>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64>;

    // wallet

    async fn wallet_tally(&self, query: &WalletTxQuery<'_>) -> Result<Tally>;

    /// Amount stats over the user's positive wallet amounts; refunds and reversals are excluded
    async fn wallet_amount_stats(&self, user_id: &str, tx_type: Option<&str>) -> Result<Stats>;

    async fn distinct_payment_methods(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64>;

    // activity

    async fn count_activity(&self, user_id: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<u64>;

    async fn last_activity_before(&self, user_id: &str, before: DateTime<Utc>) -> Result<Option<DateTime<Utc>>>;

    async fn record_activity(&self, activity: &ActivityRecord) -> Result<()>;

    // risk history

    async fn latest_risk_tier(&self, user_id: &str) -> Result<Option<String>>;

    async fn count_enforcement_actions(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64>;

    /// Another user in HIGH/CRITICAL tier whose `field` equals `value`
    async fn find_flagged_contact_owner(
        &self,
        field: ContactField,
        value: &str,
        exclude_user_id: &str,
    ) -> Result<Option<String>>;

    // signals

    /// Signals of `types` created in `[since, until)`, most recent first
    async fn recent_signals(
        &self,
        user_id: &str,
        types: &[SignalType],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredSignal>>;

    async fn insert_signal(&self, signal: &StoredSignal) -> Result<()>;

    async fn insert_correlation(&self, record: &CorrelationRecord) -> Result<()>;

    // leakage funnel

    /// Most recent funnel for the pair opened in `[since, until)`
    async fn latest_leakage(
        &self,
        user_id: &str,
        counterparty_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<LeakageRecord>>;

    /// Insert or replace by id
    async fn save_leakage(&self, record: &LeakageRecord) -> Result<()>;

    /// Amount of the pair's most recent booking that has one
    async fn latest_booking_amount(&self, client_id: &str, provider_id: &str) -> Result<Option<f64>>;

    /// Amount stats over all completed bookings
    async fn completed_amount_stats(&self) -> Result<Stats>;

    // relationships

    /// Count one interaction on the edge, creating it on first contact. The pair must
    /// already be in canonical order. Returns the updated edge.
    async fn record_interaction(
        &self,
        user_a_id: &str,
        user_b_id: &str,
        relationship_type: RelationshipType,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<RelationshipRecord>;
}
