//! Signal persistence sink, the single write path for `risk_signals`

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::detection::signals::{clamp_confidence, GeneratedSignal};
use crate::storage::{DetectionStore, StoredSignal};

#[derive(Clone)]
pub struct SignalSink {
    store: Arc<dyn DetectionStore>,
}

impl SignalSink {
    pub fn new(store: Arc<dyn DetectionStore>) -> Self {
        Self { store }
    }

    /// Clamp, normalize evidence and write one row.
    ///
    /// `observed_at` is the source event's timestamp and becomes the row's `created_at`, so
    /// history written during a replay lines up with the events that produced it.
    /// Returns the stored row, or `None` if the write failed. Failures are logged and never
    /// propagated to the calling detector.
    pub async fn persist(
        &self,
        source_event_id: &str,
        user_id: &str,
        observed_at: DateTime<Utc>,
        signal: &GeneratedSignal,
    ) -> Option<StoredSignal> {
        let created_at = observed_at;
        let mut evidence = signal.evidence.clone();
        if evidence.event_id.is_empty() {
            evidence.event_id = source_event_id.to_string();
        }
        if evidence.timestamps.is_empty() {
            evidence.timestamps.push(created_at);
        }

        let row = StoredSignal {
            id: Uuid::new_v4().to_string(),
            source_event_id: source_event_id.to_string(),
            user_id: user_id.to_string(),
            signal_type: signal.signal_type,
            confidence: clamp_confidence(signal.confidence),
            evidence,
            obfuscation_flags: signal.obfuscation_flags.clone(),
            pattern_flags: signal.pattern_flags.clone(),
            created_at,
        };

        match self.store.insert_signal(&row).await {
            Ok(()) => {
                debug!(
                    signal_id = %row.id,
                    signal_type = %row.signal_type,
                    user_id,
                    confidence = row.confidence,
                    "Signal persisted"
                );
                Some(row)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    signal_type = %signal.signal_type,
                    source_event_id,
                    "Failed to persist signal, dropping"
                );
                None
            }
        }
    }

    /// Persist each signal, returning those that were written
    pub async fn persist_all(
        &self,
        source_event_id: &str,
        user_id: &str,
        observed_at: DateTime<Utc>,
        signals: Vec<GeneratedSignal>,
    ) -> Vec<GeneratedSignal> {
        let mut written = Vec::with_capacity(signals.len());
        for signal in signals {
            if let Some(row) = self.persist(source_event_id, user_id, observed_at, &signal).await {
                written.push(GeneratedSignal {
                    confidence: row.confidence,
                    evidence: row.evidence,
                    ..signal
                });
            }
        }
        written
    }
}
