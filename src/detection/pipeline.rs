//! Message detection pipeline
//!
//! Scan, fetch context, synthesize, persist. Registered as `detection-orchestrator` for
//! message creates and edits.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::core::config::ContextConfig;
use crate::detection::context::{ContextAnalyzer, ContextTarget};
use crate::detection::persist::SignalSink;
use crate::detection::signals::GeneratedSignal;
use crate::detection::synthesizer::{synthesize, MessageOrigin, TextScanner};
use crate::events::dispatcher::Consumer;
use crate::events::types::{DomainEvent, EventType, MessagePayload};
use crate::logging::redact_content;
use crate::storage::DetectionStore;

pub const NAME: &str = "detection-orchestrator";

const EVENT_TYPES: &[EventType] = &[EventType::MessageCreated, EventType::MessageEdited];

pub struct MessageAnalyzer {
    scanner: Arc<TextScanner>,
    context: ContextAnalyzer,
    sink: SignalSink,
}

impl MessageAnalyzer {
    pub fn new(scanner: Arc<TextScanner>, store: Arc<dyn DetectionStore>, context: ContextConfig) -> Self {
        Self {
            scanner,
            context: ContextAnalyzer::new(store.clone(), context),
            sink: SignalSink::new(store),
        }
    }

    /// Analyze one message event. Events without content, sender or receiver yield nothing.
    pub async fn analyze_event(&self, event: &DomainEvent) -> Vec<GeneratedSignal> {
        if !EVENT_TYPES.contains(&event.event_type) {
            return Vec::new();
        }
        let Some(payload) = event.payload_as::<MessagePayload>() else {
            debug!(event_id = %event.id, "Message payload malformed, skipping");
            return Vec::new();
        };
        if payload.content.is_empty() || payload.sender_id.is_empty() || payload.receiver_id.is_empty() {
            return Vec::new();
        }

        let started = Instant::now();
        let message_id = payload.message_id.as_deref().unwrap_or(&event.id);
        debug!(
            event_id = %event.id,
            message_id,
            content = %redact_content(&payload.content),
            "Analyzing message"
        );

        let analysis = self.scanner.scan(&payload.content);
        let context = self
            .context
            .analyze(&ContextTarget {
                sender_id: &payload.sender_id,
                receiver_id: &payload.receiver_id,
                conversation_id: payload.conversation_id.as_deref(),
                at: event.timestamp,
            })
            .await;

        let origin = MessageOrigin {
            event_id: &event.id,
            message_id,
            at: event.timestamp,
        };
        let signals = synthesize(&origin, &analysis, &context);
        let written = self.sink.persist_all(&event.id, &payload.sender_id, event.timestamp, signals).await;

        if !written.is_empty() {
            info!(
                event_id = %event.id,
                signals = written.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Message signals emitted"
            );
        }
        written
    }
}

#[async_trait]
impl Consumer for MessageAnalyzer {
    fn name(&self) -> &str {
        NAME
    }

    fn event_types(&self) -> &[EventType] {
        EVENT_TYPES
    }

    async fn handle(&self, event: &DomainEvent) -> Vec<GeneratedSignal> {
        self.analyze_event(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::DetectionConfig;
    use crate::detection::signals::SignalType;
    use crate::storage::MemoryStore;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn analyzer(store: Arc<MemoryStore>) -> MessageAnalyzer {
        let config = DetectionConfig::default();
        let scanner = Arc::new(TextScanner::from_config(&config).unwrap());
        MessageAnalyzer::new(scanner, store, config.context)
    }

    fn message_event(payload: serde_json::Value) -> DomainEvent {
        DomainEvent::new(
            EventType::MessageCreated,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            payload,
        )
    }

    #[tokio::test]
    async fn test_phone_message_is_persisted_for_sender() {
        let store = Arc::new(MemoryStore::new());
        let event = message_event(json!({
            "message_id": "m-1",
            "sender_id": "alice",
            "receiver_id": "bob",
            "content": "my cell is 555-123-4567",
        }));

        let signals = analyzer(store.clone()).handle(&event).await;
        assert!(signals.iter().any(|s| s.signal_type == SignalType::ContactPhone));

        let stored = store.signals();
        assert_eq!(stored.len(), signals.len());
        assert!(stored.iter().all(|s| s.user_id == "alice" && s.source_event_id == event.id));
        assert_eq!(stored[0].evidence.message_ids[0], "m-1");
    }

    #[tokio::test]
    async fn test_message_id_defaults_to_event_id() {
        let store = Arc::new(MemoryStore::new());
        let event = message_event(json!({
            "sender_id": "alice",
            "receiver_id": "bob",
            "content": "add me on telegram",
        }));
        let signals = analyzer(store).handle(&event).await;
        assert!(!signals.is_empty());
        assert_eq!(signals[0].evidence.message_ids[0], event.id);
    }

    #[tokio::test]
    async fn test_incomplete_payloads_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let analyzer = analyzer(store.clone());
        for payload in [
            json!({"sender_id": "alice", "receiver_id": "bob", "content": ""}),
            json!({"sender_id": "", "receiver_id": "bob", "content": "call me 555-123-4567"}),
            json!({"receiver_id": "bob", "content": "call me 555-123-4567"}),
        ] {
            assert!(analyzer.handle(&message_event(payload)).await.is_empty());
        }
        assert!(store.signals().is_empty());
    }
}
