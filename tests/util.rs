// tests/util.rs
// Shared fixtures for the integration tests

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use contact_integrity::core::config::DetectionConfig;
use contact_integrity::detection::context::ConversationContext;
use contact_integrity::detection::synthesizer::{synthesize, MessageOrigin, TextScanner};
use contact_integrity::detection::GeneratedSignal;
use contact_integrity::events::{DomainEvent, EventType};
use contact_integrity::storage::BookingRecord;
use serde_json::json;

/// Fixed anchor so window arithmetic in tests is deterministic
pub fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 8, 20, 16, 0, 0).unwrap()
}

pub fn scanner() -> TextScanner {
    TextScanner::from_config(&DetectionConfig::default()).expect("default patterns compile")
}

/// Scan and synthesize one message with no conversation history
pub fn signals_for_text(scanner: &TextScanner, text: &str) -> Vec<GeneratedSignal> {
    let analysis = scanner.scan(text);
    let origin = MessageOrigin {
        event_id: "evt-test",
        message_id: "msg-test",
        at: anchor(),
    };
    synthesize(&origin, &analysis, &ConversationContext::default())
}

pub fn message_event(sender: &str, receiver: &str, content: &str, at: DateTime<Utc>) -> DomainEvent {
    DomainEvent::new(
        EventType::MessageCreated,
        at,
        json!({
            "message_id": format!("msg-{}", at.timestamp_millis()),
            "sender_id": sender,
            "receiver_id": receiver,
            "conversation_id": "conv-1",
            "content": content,
        }),
    )
}

pub fn booking_event(event_type: EventType, booking_id: &str, client: &str, provider: &str, at: DateTime<Utc>) -> DomainEvent {
    DomainEvent::new(
        event_type,
        at,
        json!({"booking_id": booking_id, "client_id": client, "provider_id": provider}),
    )
}

pub fn cancelled_booking(id: &str, client: &str, updated_at: DateTime<Utc>) -> BookingRecord {
    BookingRecord {
        id: id.to_string(),
        client_id: client.to_string(),
        provider_id: "prov-1".to_string(),
        service_category: Some("tutoring".to_string()),
        amount: Some(60.0),
        status: "cancelled".to_string(),
        scheduled_at: None,
        created_at: updated_at - Duration::days(3),
        updated_at,
    }
}
