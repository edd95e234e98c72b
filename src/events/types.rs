//! Canonical domain events and their typed payloads.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Event types recognised on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "message.created")]
    MessageCreated,
    #[serde(rename = "message.edited")]
    MessageEdited,
    #[serde(rename = "message.deleted")]
    MessageDeleted,
    #[serde(rename = "transaction.initiated")]
    TransactionInitiated,
    #[serde(rename = "transaction.completed")]
    TransactionCompleted,
    #[serde(rename = "transaction.failed")]
    TransactionFailed,
    #[serde(rename = "transaction.cancelled")]
    TransactionCancelled,
    #[serde(rename = "booking.created")]
    BookingCreated,
    #[serde(rename = "booking.updated")]
    BookingUpdated,
    #[serde(rename = "booking.completed")]
    BookingCompleted,
    #[serde(rename = "booking.cancelled")]
    BookingCancelled,
    #[serde(rename = "booking.no_show")]
    BookingNoShow,
    #[serde(rename = "wallet.deposit")]
    WalletDeposit,
    #[serde(rename = "wallet.withdrawal")]
    WalletWithdrawal,
    #[serde(rename = "wallet.transfer")]
    WalletTransfer,
    #[serde(rename = "provider.registered")]
    ProviderRegistered,
    #[serde(rename = "provider.updated")]
    ProviderUpdated,
    #[serde(rename = "user.registered")]
    UserRegistered,
    #[serde(rename = "user.contact_field_changed")]
    ContactFieldChanged,
    #[serde(rename = "rating.submitted")]
    RatingSubmitted,
    /// Any type this engine does not analyze
    #[serde(other)]
    Unrecognized,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageCreated => "message.created",
            Self::MessageEdited => "message.edited",
            Self::MessageDeleted => "message.deleted",
            Self::TransactionInitiated => "transaction.initiated",
            Self::TransactionCompleted => "transaction.completed",
            Self::TransactionFailed => "transaction.failed",
            Self::TransactionCancelled => "transaction.cancelled",
            Self::BookingCreated => "booking.created",
            Self::BookingUpdated => "booking.updated",
            Self::BookingCompleted => "booking.completed",
            Self::BookingCancelled => "booking.cancelled",
            Self::BookingNoShow => "booking.no_show",
            Self::WalletDeposit => "wallet.deposit",
            Self::WalletWithdrawal => "wallet.withdrawal",
            Self::WalletTransfer => "wallet.transfer",
            Self::ProviderRegistered => "provider.registered",
            Self::ProviderUpdated => "provider.updated",
            Self::UserRegistered => "user.registered",
            Self::ContactFieldChanged => "user.contact_field_changed",
            Self::RatingSubmitted => "rating.submitted",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable, time-ordered domain event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_version() -> u32 {
    1
}

impl DomainEvent {
    pub fn new(event_type: EventType, timestamp: DateTime<Utc>, payload: serde_json::Value) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            correlation_id: id.clone(),
            id,
            event_type,
            timestamp,
            version: 1,
            payload,
        }
    }

    /// Decode the payload into one of the typed payload structs.
    ///
    /// `None` means the payload does not have the shape the caller needs; callers skip the
    /// event in that case.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// First non-empty string among `keys` in the payload
    pub fn payload_str(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| {
            self.payload
                .get(*k)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub message_id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingPayload {
    pub booking_id: String,
    pub client_id: String,
    pub provider_id: String,
    #[serde(default)]
    pub service_category: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Wallet and platform-transaction payloads share one shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPayload {
    #[serde(default, alias = "transaction_id")]
    pub wallet_tx_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub counterparty_id: Option<String>,
    #[serde(default)]
    pub tx_type: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPayload {
    pub provider_id: String,
    pub user_id: String,
    #[serde(default)]
    pub service_category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingPayload {
    #[serde(default)]
    pub rating_id: Option<String>,
    pub client_id: String,
    pub provider_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactField {
    Phone,
    Email,
}

impl ContactField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phone => "phone",
            Self::Email => "email",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactChangePayload {
    pub user_id: String,
    pub field: ContactField,
    #[serde(default)]
    pub old_value: Option<String>,
    pub new_value: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_roundtrip_uses_dotted_type() {
        let raw = json!({
            "id": "evt-1",
            "type": "booking.no_show",
            "correlation_id": "c-1",
            "timestamp": "2024-05-01T10:00:00Z",
            "version": 1,
            "payload": {"booking_id": "b-1", "client_id": "u-1", "provider_id": "p-1"}
        });
        let event: DomainEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, EventType::BookingNoShow);
        assert_eq!(event.event_type.to_string(), "booking.no_show");

        let booking: BookingPayload = event.payload_as().unwrap();
        assert_eq!(booking.client_id, "u-1");
        assert!(booking.amount.is_none());
    }

    #[test]
    fn test_unknown_event_type_is_unrecognized() {
        let raw = json!({
            "id": "evt-2",
            "type": "appeal.submitted",
            "timestamp": "2024-05-01T10:00:00Z",
            "payload": {}
        });
        let event: DomainEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, EventType::Unrecognized);
        assert_eq!(event.version, 1);
    }

    #[test]
    fn test_payload_shape_mismatch_is_none() {
        let event = DomainEvent::new(
            EventType::MessageCreated,
            Utc::now(),
            json!({"sender_id": "u-1"}),
        );
        assert!(event.payload_as::<MessagePayload>().is_none());
    }

    #[test]
    fn test_payment_payload_accepts_transaction_id() {
        let event = DomainEvent::new(
            EventType::TransactionInitiated,
            Utc::now(),
            json!({"transaction_id": "tx-9", "user_id": "u-1", "amount": 40.0}),
        );
        let payment: PaymentPayload = event.payload_as().unwrap();
        assert_eq!(payment.wallet_tx_id.as_deref(), Some("tx-9"));
    }

    #[test]
    fn test_payload_str_falls_through_keys() {
        let event = DomainEvent::new(
            EventType::BookingCreated,
            Utc::now(),
            json!({"sender_id": "", "client_id": "c-7"}),
        );
        assert_eq!(
            event.payload_str(&["sender_id", "user_id", "client_id"]).as_deref(),
            Some("c-7")
        );
    }
}
