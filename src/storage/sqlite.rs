//! SQLite store (sqlx)
//!
//! Timestamps are stored as unix milliseconds so window arithmetic stays in SQL integers.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::*;
use crate::core::errors::{DetectionError, Result};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT,
        sender_id TEXT NOT NULL,
        receiver_id TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages (sender_id, receiver_id, created_at)",
    r#"CREATE TABLE IF NOT EXISTS transactions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        counterparty_id TEXT,
        amount REAL NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS wallet_transactions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        counterparty_id TEXT,
        tx_type TEXT NOT NULL,
        amount REAL NOT NULL,
        payment_method TEXT,
        created_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_wallet_user ON wallet_transactions (user_id, created_at)",
    r#"CREATE TABLE IF NOT EXISTS bookings (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        service_category TEXT,
        amount REAL,
        status TEXT NOT NULL,
        scheduled_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        phone TEXT,
        email TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS ratings (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        score REAL NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS risk_scores (
        user_id TEXT NOT NULL,
        tier TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS enforcement_actions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        action_type TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS activity_log (
        user_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_activity_user ON activity_log (user_id, created_at)",
    r#"CREATE TABLE IF NOT EXISTS risk_signals (
        id TEXT PRIMARY KEY,
        source_event_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        signal_type TEXT NOT NULL,
        confidence REAL NOT NULL,
        evidence TEXT NOT NULL,
        obfuscation_flags TEXT NOT NULL DEFAULT '[]',
        pattern_flags TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_signals_user ON risk_signals (user_id, created_at)",
    r#"CREATE TABLE IF NOT EXISTS signal_correlations (
        id TEXT PRIMARY KEY,
        correlation_type TEXT NOT NULL,
        user_id TEXT NOT NULL,
        counterparty_id TEXT,
        primary_signal_id TEXT NOT NULL,
        secondary_signal_id TEXT,
        booking_id TEXT,
        confidence REAL NOT NULL,
        time_delta_seconds INTEGER NOT NULL,
        evidence TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS leakage_events (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        counterparty_id TEXT NOT NULL,
        stage TEXT NOT NULL,
        signal_ids TEXT NOT NULL DEFAULT '[]',
        signal_types TEXT NOT NULL DEFAULT '[]',
        evidence TEXT NOT NULL,
        platform_destination TEXT,
        estimated_revenue_loss REAL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_leakage_pair ON leakage_events (user_id, counterparty_id, created_at)",
    r#"CREATE TABLE IF NOT EXISTS user_relationships (
        user_a_id TEXT NOT NULL,
        user_b_id TEXT NOT NULL,
        relationship_type TEXT NOT NULL,
        interaction_count INTEGER NOT NULL,
        total_value REAL NOT NULL,
        first_interaction_at INTEGER NOT NULL,
        last_interaction_at INTEGER NOT NULL,
        PRIMARY KEY (user_a_id, user_b_id, relationship_type)
    )"#,
];

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(v: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(v).single().unwrap_or_default()
}

fn count(v: i64) -> u64 {
    v.max(0) as u64
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        receiver_id: row.try_get("receiver_id")?,
        content: row.try_get("content")?,
        created_at: from_ms(row.try_get("created_at")?),
    })
}

fn booking_from_row(row: &SqliteRow) -> Result<BookingRecord> {
    let scheduled: Option<i64> = row.try_get("scheduled_at")?;
    Ok(BookingRecord {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        provider_id: row.try_get("provider_id")?,
        service_category: row.try_get("service_category")?,
        amount: row.try_get("amount")?,
        status: row.try_get("status")?,
        scheduled_at: scheduled.map(from_ms),
        created_at: from_ms(row.try_get("created_at")?),
        updated_at: from_ms(row.try_get("updated_at")?),
    })
}

fn signal_from_row(row: &SqliteRow) -> Result<StoredSignal> {
    let signal_type: String = row.try_get("signal_type")?;
    let evidence: String = row.try_get("evidence")?;
    let obfuscation: String = row.try_get("obfuscation_flags")?;
    let pattern: String = row.try_get("pattern_flags")?;
    Ok(StoredSignal {
        id: row.try_get("id")?,
        source_event_id: row.try_get("source_event_id")?,
        user_id: row.try_get("user_id")?,
        signal_type: signal_type.parse().map_err(DetectionError::Storage)?,
        confidence: row.try_get("confidence")?,
        evidence: serde_json::from_str(&evidence)?,
        obfuscation_flags: serde_json::from_str(&obfuscation)?,
        pattern_flags: serde_json::from_str(&pattern)?,
        created_at: from_ms(row.try_get("created_at")?),
    })
}

fn leakage_from_row(row: &SqliteRow) -> Result<LeakageRecord> {
    let stage: String = row.try_get("stage")?;
    let signal_ids: String = row.try_get("signal_ids")?;
    let signal_types: String = row.try_get("signal_types")?;
    let evidence: String = row.try_get("evidence")?;
    Ok(LeakageRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        counterparty_id: row.try_get("counterparty_id")?,
        stage: LeakageStage::parse(&stage)
            .ok_or_else(|| DetectionError::Storage(format!("unknown leakage stage '{}'", stage)))?,
        signal_ids: serde_json::from_str(&signal_ids)?,
        signal_types: serde_json::from_str(&signal_types)?,
        evidence: serde_json::from_str(&evidence)?,
        platform_destination: row.try_get("platform_destination")?,
        estimated_revenue_loss: row.try_get("estimated_revenue_loss")?,
        created_at: from_ms(row.try_get("created_at")?),
        updated_at: from_ms(row.try_get("updated_at")?),
    })
}

fn relationship_from_row(row: &SqliteRow) -> Result<RelationshipRecord> {
    let kind: String = row.try_get("relationship_type")?;
    Ok(RelationshipRecord {
        user_a_id: row.try_get("user_a_id")?,
        user_b_id: row.try_get("user_b_id")?,
        relationship_type: RelationshipType::parse(&kind)
            .ok_or_else(|| DetectionError::Storage(format!("unknown relationship type '{}'", kind)))?,
        interaction_count: count(row.try_get("interaction_count")?),
        total_value: row.try_get("total_value")?,
        first_interaction_at: from_ms(row.try_get("first_interaction_at")?),
        last_interaction_at: from_ms(row.try_get("last_interaction_at")?),
    })
}

fn stats_from_row(row: &SqliteRow) -> Result<Stats> {
    let n: i64 = row.try_get(0)?;
    let sum: f64 = row.try_get(1)?;
    let sum_sq: f64 = row.try_get(2)?;
    Ok(Stats::from_sums(count(n), sum, sum_sq))
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema. `sqlite::memory:` gets a single pinned connection.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let is_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DetectionError::Configuration(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true);
        if !is_memory {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        let pool_options = if is_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .acquire_timeout(Duration::from_secs(30))
        };
        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        info!(in_memory = is_memory, "Detection store initialized");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn initialize_schema(&self) -> Result<()> {
        debug!("Initializing detection schema");
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert every row of `snapshot` in one transaction
    pub async fn load_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for m in &snapshot.messages {
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(&m.id)
            .bind(&m.conversation_id)
            .bind(&m.sender_id)
            .bind(&m.receiver_id)
            .bind(&m.content)
            .bind(ms(m.created_at))
            .execute(&mut *tx)
            .await?;
        }
        for t in &snapshot.transactions {
            sqlx::query(
                "INSERT INTO transactions (id, user_id, counterparty_id, amount, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(&t.id)
            .bind(&t.user_id)
            .bind(&t.counterparty_id)
            .bind(t.amount)
            .bind(&t.status)
            .bind(ms(t.created_at))
            .execute(&mut *tx)
            .await?;
        }
        for w in &snapshot.wallet_transactions {
            sqlx::query(
                "INSERT INTO wallet_transactions (id, user_id, counterparty_id, tx_type, amount, payment_method, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&w.id)
            .bind(&w.user_id)
            .bind(&w.counterparty_id)
            .bind(&w.tx_type)
            .bind(w.amount)
            .bind(&w.payment_method)
            .bind(ms(w.created_at))
            .execute(&mut *tx)
            .await?;
        }
        for b in &snapshot.bookings {
            sqlx::query(
                "INSERT OR REPLACE INTO bookings (id, client_id, provider_id, service_category, amount, status, scheduled_at, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(&b.id)
            .bind(&b.client_id)
            .bind(&b.provider_id)
            .bind(&b.service_category)
            .bind(b.amount)
            .bind(&b.status)
            .bind(b.scheduled_at.map(ms))
            .bind(ms(b.created_at))
            .bind(ms(b.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        for u in &snapshot.users {
            sqlx::query("INSERT OR REPLACE INTO users (id, phone, email) VALUES (?1, ?2, ?3)")
                .bind(&u.id)
                .bind(&u.phone)
                .bind(&u.email)
                .execute(&mut *tx)
                .await?;
        }
        for r in &snapshot.ratings {
            sqlx::query(
                "INSERT INTO ratings (id, client_id, provider_id, score, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&r.id)
            .bind(&r.client_id)
            .bind(&r.provider_id)
            .bind(r.score)
            .bind(ms(r.created_at))
            .execute(&mut *tx)
            .await?;
        }
        for r in &snapshot.risk_scores {
            sqlx::query("INSERT INTO risk_scores (user_id, tier, created_at) VALUES (?1, ?2, ?3)")
                .bind(&r.user_id)
                .bind(&r.tier)
                .bind(ms(r.created_at))
                .execute(&mut *tx)
                .await?;
        }
        for e in &snapshot.enforcement_actions {
            sqlx::query(
                "INSERT INTO enforcement_actions (id, user_id, action_type, created_at) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&e.id)
            .bind(&e.user_id)
            .bind(&e.action_type)
            .bind(ms(e.created_at))
            .execute(&mut *tx)
            .await?;
        }
        for a in &snapshot.activity {
            sqlx::query("INSERT INTO activity_log (user_id, event_type, created_at) VALUES (?1, ?2, ?3)")
                .bind(&a.user_id)
                .bind(&a.event_type)
                .bind(ms(a.created_at))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        for s in &snapshot.signals {
            self.insert_signal(s).await?;
        }
        Ok(())
    }

    /// Signals persisted for a user, oldest first
    pub async fn signals_for(&self, user_id: &str) -> Result<Vec<StoredSignal>> {
        let rows = sqlx::query("SELECT * FROM risk_signals WHERE user_id = ?1 ORDER BY created_at ASC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(signal_from_row).collect()
    }

    pub async fn correlations_for(&self, user_id: &str) -> Result<Vec<CorrelationRecord>> {
        let rows = sqlx::query("SELECT * FROM signal_correlations WHERE user_id = ?1 ORDER BY created_at ASC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("correlation_type")?;
                let evidence: String = row.try_get("evidence")?;
                Ok(CorrelationRecord {
                    id: row.try_get("id")?,
                    correlation_type: CorrelationType::parse(&kind)
                        .ok_or_else(|| DetectionError::Storage(format!("unknown correlation type '{}'", kind)))?,
                    user_id: row.try_get("user_id")?,
                    counterparty_id: row.try_get("counterparty_id")?,
                    primary_signal_id: row.try_get("primary_signal_id")?,
                    secondary_signal_id: row.try_get("secondary_signal_id")?,
                    booking_id: row.try_get("booking_id")?,
                    confidence: row.try_get("confidence")?,
                    time_delta_seconds: row.try_get("time_delta_seconds")?,
                    evidence: serde_json::from_str(&evidence)?,
                    created_at: from_ms(row.try_get("created_at")?),
                })
            })
            .collect()
    }

    pub async fn leakage_for(&self, user_id: &str) -> Result<Vec<LeakageRecord>> {
        let rows = sqlx::query("SELECT * FROM leakage_events WHERE user_id = ?1 ORDER BY created_at ASC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(leakage_from_row).collect()
    }

    /// Edges touching `user_id` on either side
    pub async fn relationships_for(&self, user_id: &str) -> Result<Vec<RelationshipRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM user_relationships WHERE user_a_id = ?1 OR user_b_id = ?1 ORDER BY first_interaction_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(relationship_from_row).collect()
    }
}

#[async_trait]
impl DetectionStore for SqliteStore {
    async fn message_window(
        &self,
        anchor: &MessageAnchor<'_>,
        span: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let at = ms(anchor.at);
        let span = span.num_milliseconds();
        let rows = sqlx::query(
            r#"SELECT id, conversation_id, sender_id, receiver_id, content, created_at
               FROM messages
               WHERE ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
                 AND (?3 IS NULL OR conversation_id = ?3)
                 AND created_at BETWEEN ?4 AND ?5
               ORDER BY ABS(created_at - ?6) ASC, created_at ASC
               LIMIT ?7"#,
        )
        .bind(anchor.sender_id)
        .bind(anchor.receiver_id)
        .bind(anchor.conversation_id)
        .bind(at - span)
        .bind(at + span)
        .bind(at)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut window = rows.iter().map(message_from_row).collect::<Result<Vec<_>>>()?;
        window.sort_by_key(|m| m.created_at);
        Ok(window)
    }

    async fn nearest_transaction(
        &self,
        user_id: &str,
        counterparty_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<TransactionRecord>> {
        let row = sqlx::query(
            r#"SELECT id, user_id, counterparty_id, amount, status, created_at
               FROM transactions
               WHERE (user_id = ?1 AND counterparty_id = ?2) OR (user_id = ?2 AND counterparty_id = ?1)
               ORDER BY ABS(created_at - ?3) ASC
               LIMIT 1"#,
        )
        .bind(user_id)
        .bind(counterparty_id)
        .bind(ms(at))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(TransactionRecord {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                counterparty_id: row.try_get("counterparty_id")?,
                amount: row.try_get("amount")?,
                status: row.try_get("status")?,
                created_at: from_ms(row.try_get("created_at")?),
            })
        })
        .transpose()
    }

    async fn conversation_counts(&self, sender_id: &str, receiver_id: &str) -> Result<ConversationCounts> {
        let row = sqlx::query(
            r#"SELECT
                 COALESCE(SUM(CASE WHEN sender_id = ?1 THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN sender_id = ?2 THEN 1 ELSE 0 END), 0)
               FROM messages
               WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)"#,
        )
        .bind(sender_id)
        .bind(receiver_id)
        .fetch_one(&self.pool)
        .await?;
        let sender: i64 = row.try_get(0)?;
        let receiver: i64 = row.try_get(1)?;
        Ok(ConversationCounts {
            total: count(sender + receiver),
            sender_initiated: count(sender),
            receiver_initiated: count(receiver),
        })
    }

    async fn distinct_signal_types(&self, user_id: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT signal_type) FROM risk_signals WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count(n))
    }

    async fn booking(&self, booking_id: &str) -> Result<Option<BookingRecord>> {
        let row = sqlx::query("SELECT * FROM bookings WHERE id = ?1")
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn count_bookings(&self, query: &BookingQuery<'_>) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM bookings
               WHERE (?1 IS NULL OR client_id = ?1)
                 AND (?2 IS NULL OR provider_id = ?2)
                 AND (?3 IS NULL OR status = ?3)
                 AND (?4 IS NULL OR updated_at >= ?4)
                 AND (?5 IS NULL OR updated_at < ?5)"#,
        )
        .bind(query.client_id)
        .bind(query.provider_id)
        .bind(query.status)
        .bind(query.since.map(ms))
        .bind(query.until.map(ms))
        .fetch_one(&self.pool)
        .await?;
        Ok(count(n))
    }

    async fn category_duration_stats(&self, category: &str) -> Result<Stats> {
        let row = sqlx::query(
            r#"SELECT COUNT(*), COALESCE(SUM(d), 0.0), COALESCE(SUM(d * d), 0.0)
               FROM (SELECT (updated_at - scheduled_at) / 1000.0 AS d FROM bookings
                     WHERE service_category = ?1 AND status = 'completed' AND scheduled_at IS NOT NULL)"#,
        )
        .bind(category)
        .fetch_one(&self.pool)
        .await?;
        stats_from_row(&row)
    }

    async fn category_amount_stats(&self, category: &str) -> Result<Stats> {
        let row = sqlx::query(
            r#"SELECT COUNT(*), COALESCE(SUM(amount), 0.0), COALESCE(SUM(amount * amount), 0.0)
               FROM bookings WHERE service_category = ?1 AND amount IS NOT NULL"#,
        )
        .bind(category)
        .fetch_one(&self.pool)
        .await?;
        stats_from_row(&row)
    }

    async fn provider_duration_stats(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Stats> {
        let row = sqlx::query(
            r#"SELECT COUNT(*), COALESCE(SUM(d), 0.0), COALESCE(SUM(d * d), 0.0)
               FROM (SELECT (updated_at - scheduled_at) / 1000.0 AS d FROM bookings
                     WHERE provider_id = ?1 AND status = 'completed' AND scheduled_at IS NOT NULL
                       AND updated_at >= ?2 AND updated_at < ?3)"#,
        )
        .bind(provider_id)
        .bind(ms(since))
        .bind(ms(until))
        .fetch_one(&self.pool)
        .await?;
        stats_from_row(&row)
    }

    async fn provider_booking_tally(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<BookingTally> {
        let row = sqlx::query(
            r#"SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0)
               FROM bookings WHERE provider_id = ?1 AND updated_at >= ?2 AND updated_at < ?3"#,
        )
        .bind(provider_id)
        .bind(ms(since))
        .bind(ms(until))
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get(0)?;
        let cancelled: i64 = row.try_get(1)?;
        Ok(BookingTally {
            cancelled: count(cancelled),
            total: count(total),
        })
    }

    async fn count_identity_matches(&self, user_id: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM users o JOIN users u ON u.id = ?1
               WHERE o.id <> u.id
                 AND ((u.phone IS NOT NULL AND u.phone <> '' AND o.phone = u.phone)
                   OR (u.email IS NOT NULL AND u.email <> '' AND o.email = u.email))"#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count(n))
    }

    async fn count_ratings(
        &self,
        provider_id: &str,
        min_score: Option<f64>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM ratings
               WHERE provider_id = ?1 AND (?2 IS NULL OR score >= ?2)
                 AND created_at >= ?3 AND created_at < ?4"#,
        )
        .bind(provider_id)
        .bind(min_score)
        .bind(ms(since))
        .bind(ms(until))
        .fetch_one(&self.pool)
        .await?;
        Ok(count(n))
    }

    async fn wallet_tally(&self, query: &WalletTxQuery<'_>) -> Result<Tally> {
        let row = sqlx::query(
            r#"SELECT COUNT(*), COALESCE(SUM(amount), 0.0) FROM wallet_transactions
               WHERE user_id = ?1
                 AND (?2 IS NULL OR counterparty_id = ?2)
                 AND (?3 IS NULL OR tx_type = ?3)
                 AND (?4 IS NULL OR amount >= ?4)
                 AND (?5 IS NULL OR amount <= ?5)
                 AND created_at >= ?6 AND created_at < ?7"#,
        )
        .bind(query.user_id)
        .bind(query.counterparty_id)
        .bind(query.tx_type)
        .bind(query.min_amount)
        .bind(query.max_amount)
        .bind(ms(query.since))
        .bind(ms(query.until))
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get(0)?;
        Ok(Tally {
            count: count(n),
            sum: row.try_get(1)?,
        })
    }

    async fn wallet_amount_stats(&self, user_id: &str, tx_type: Option<&str>) -> Result<Stats> {
        let row = sqlx::query(
            r#"SELECT COUNT(*), COALESCE(SUM(amount), 0.0), COALESCE(SUM(amount * amount), 0.0)
               FROM wallet_transactions WHERE user_id = ?1 AND (?2 IS NULL OR tx_type = ?2) AND amount > 0"#,
        )
        .bind(user_id)
        .bind(tx_type)
        .fetch_one(&self.pool)
        .await?;
        stats_from_row(&row)
    }

    async fn distinct_payment_methods(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(DISTINCT payment_method) FROM wallet_transactions
               WHERE user_id = ?1 AND created_at >= ?2 AND created_at < ?3"#,
        )
        .bind(user_id)
        .bind(ms(since))
        .bind(ms(until))
        .fetch_one(&self.pool)
        .await?;
        Ok(count(n))
    }

    async fn count_activity(&self, user_id: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM activity_log WHERE user_id = ?1 AND created_at >= ?2 AND created_at < ?3",
        )
        .bind(user_id)
        .bind(ms(since))
        .bind(ms(until))
        .fetch_one(&self.pool)
        .await?;
        Ok(count(n))
    }

    async fn last_activity_before(&self, user_id: &str, before: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM activity_log WHERE user_id = ?1 AND created_at < ?2")
                .bind(user_id)
                .bind(ms(before))
                .fetch_one(&self.pool)
                .await?;
        Ok(last.map(from_ms))
    }

    async fn record_activity(&self, activity: &ActivityRecord) -> Result<()> {
        sqlx::query("INSERT INTO activity_log (user_id, event_type, created_at) VALUES (?1, ?2, ?3)")
            .bind(&activity.user_id)
            .bind(&activity.event_type)
            .bind(ms(activity.created_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_risk_tier(&self, user_id: &str) -> Result<Option<String>> {
        let tier: Option<String> = sqlx::query_scalar(
            "SELECT tier FROM risk_scores WHERE user_id = ?1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tier)
    }

    async fn count_enforcement_actions(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM enforcement_actions WHERE user_id = ?1 AND created_at >= ?2",
        )
        .bind(user_id)
        .bind(ms(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(count(n))
    }

    async fn find_flagged_contact_owner(
        &self,
        field: ContactField,
        value: &str,
        exclude_user_id: &str,
    ) -> Result<Option<String>> {
        let column = match field {
            ContactField::Phone => "phone",
            ContactField::Email => "email",
        };
        let sql = format!(
            r#"SELECT u.id FROM users u
               WHERE u.{column} = ?1 AND u.id <> ?2
                 AND UPPER((SELECT r.tier FROM risk_scores r WHERE r.user_id = u.id
                            ORDER BY r.created_at DESC LIMIT 1)) IN ('HIGH', 'CRITICAL')
               LIMIT 1"#
        );
        let owner: Option<String> = sqlx::query_scalar(&sql)
            .bind(value)
            .bind(exclude_user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(owner)
    }

    async fn recent_signals(
        &self,
        user_id: &str,
        types: &[SignalType],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredSignal>> {
        if types.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..types.len())
            .map(|i| format!("?{}", i + 5))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"SELECT * FROM risk_signals
               WHERE user_id = ?1 AND created_at >= ?2 AND created_at < ?3 AND signal_type IN ({})
               ORDER BY created_at DESC LIMIT ?4"#,
            placeholders
        );
        let mut query = sqlx::query(&sql)
            .bind(user_id)
            .bind(ms(since))
            .bind(ms(until))
            .bind(limit as i64);
        for signal_type in types {
            query = query.bind(signal_type.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(signal_from_row).collect()
    }

    async fn insert_signal(&self, signal: &StoredSignal) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO risk_signals
               (id, source_event_id, user_id, signal_type, confidence, evidence, obfuscation_flags, pattern_flags, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
        )
        .bind(&signal.id)
        .bind(&signal.source_event_id)
        .bind(&signal.user_id)
        .bind(signal.signal_type.as_str())
        .bind(signal.confidence)
        .bind(serde_json::to_string(&signal.evidence)?)
        .bind(serde_json::to_string(&signal.obfuscation_flags)?)
        .bind(serde_json::to_string(&signal.pattern_flags)?)
        .bind(ms(signal.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_correlation(&self, record: &CorrelationRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO signal_correlations
               (id, correlation_type, user_id, counterparty_id, primary_signal_id, secondary_signal_id,
                booking_id, confidence, time_delta_seconds, evidence, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
        )
        .bind(&record.id)
        .bind(record.correlation_type.as_str())
        .bind(&record.user_id)
        .bind(&record.counterparty_id)
        .bind(&record.primary_signal_id)
        .bind(&record.secondary_signal_id)
        .bind(&record.booking_id)
        .bind(record.confidence)
        .bind(record.time_delta_seconds)
        .bind(serde_json::to_string(&record.evidence)?)
        .bind(ms(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_leakage(
        &self,
        user_id: &str,
        counterparty_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<LeakageRecord>> {
        let row = sqlx::query(
            r#"SELECT * FROM leakage_events
               WHERE user_id = ?1 AND counterparty_id = ?2 AND created_at >= ?3 AND created_at < ?4
               ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(user_id)
        .bind(counterparty_id)
        .bind(ms(since))
        .bind(ms(until))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(leakage_from_row).transpose()
    }

    async fn save_leakage(&self, record: &LeakageRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO leakage_events
               (id, user_id, counterparty_id, stage, signal_ids, signal_types, evidence,
                platform_destination, estimated_revenue_loss, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.counterparty_id)
        .bind(record.stage.as_str())
        .bind(serde_json::to_string(&record.signal_ids)?)
        .bind(serde_json::to_string(&record.signal_types)?)
        .bind(serde_json::to_string(&record.evidence)?)
        .bind(&record.platform_destination)
        .bind(record.estimated_revenue_loss)
        .bind(ms(record.created_at))
        .bind(ms(record.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_booking_amount(&self, client_id: &str, provider_id: &str) -> Result<Option<f64>> {
        let amount: Option<f64> = sqlx::query_scalar(
            r#"SELECT amount FROM bookings
               WHERE client_id = ?1 AND provider_id = ?2 AND amount IS NOT NULL
               ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(client_id)
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(amount)
    }

    async fn completed_amount_stats(&self) -> Result<Stats> {
        let row = sqlx::query(
            r#"SELECT COUNT(*), COALESCE(SUM(amount), 0.0), COALESCE(SUM(amount * amount), 0.0)
               FROM bookings WHERE status = 'completed' AND amount IS NOT NULL"#,
        )
        .fetch_one(&self.pool)
        .await?;
        stats_from_row(&row)
    }

    async fn record_interaction(
        &self,
        user_a_id: &str,
        user_b_id: &str,
        relationship_type: RelationshipType,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<RelationshipRecord> {
        let row = sqlx::query(
            r#"INSERT INTO user_relationships
               (user_a_id, user_b_id, relationship_type, interaction_count, total_value,
                first_interaction_at, last_interaction_at)
               VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)
               ON CONFLICT (user_a_id, user_b_id, relationship_type) DO UPDATE SET
                 interaction_count = interaction_count + 1,
                 total_value = total_value + excluded.total_value,
                 last_interaction_at = MAX(last_interaction_at, excluded.last_interaction_at)
               RETURNING *"#,
        )
        .bind(user_a_id)
        .bind(user_b_id)
        .bind(relationship_type.as_str())
        .bind(value)
        .bind(ms(at))
        .fetch_one(&self.pool)
        .await?;
        relationship_from_row(&row)
    }
}
