//! Signal model: the contract between detectors and downstream scoring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::str::FromStr;

macro_rules! signal_types {
    ($($variant:ident => $wire:literal,)+) => {
        /// Closed set of signal types. Wire names are stable.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum SignalType {
            $(#[serde(rename = $wire)] $variant,)+
        }

        impl SignalType {
            pub const ALL: &'static [SignalType] = &[$(SignalType::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(SignalType::$variant => $wire,)+
                }
            }
        }

        impl FromStr for SignalType {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(SignalType::$variant),)+
                    other => Err(format!("unknown signal type '{}'", other)),
                }
            }
        }
    };
}

signal_types! {
    ContactPhone => "CONTACT_PHONE",
    ContactEmail => "CONTACT_EMAIL",
    ContactSocial => "CONTACT_SOCIAL",
    ContactMessagingApp => "CONTACT_MESSAGING_APP",
    PaymentExternal => "PAYMENT_EXTERNAL",
    OffPlatformIntent => "OFF_PLATFORM_INTENT",
    GroomingLanguage => "GROOMING_LANGUAGE",
    TxRedirectAttempt => "TX_REDIRECT_ATTEMPT",
    TxFailureCorrelated => "TX_FAILURE_CORRELATED",
    TxTimingAlignment => "TX_TIMING_ALIGNMENT",
    BookingCancelPattern => "BOOKING_CANCEL_PATTERN",
    BookingNoShowPattern => "BOOKING_NO_SHOW_PATTERN",
    WalletVelocitySpike => "WALLET_VELOCITY_SPIKE",
    WalletSplitPattern => "WALLET_SPLIT_PATTERN",
    ProviderRatingDrop => "PROVIDER_RATING_DROP",
    ProviderComplaintCluster => "PROVIDER_COMPLAINT_CLUSTER",
    BookingRapidCancellation => "BOOKING_RAPID_CANCELLATION",
    BookingFakeCompletion => "BOOKING_FAKE_COMPLETION",
    BookingSameProviderRepeat => "BOOKING_SAME_PROVIDER_REPEAT",
    BookingTimeClustering => "BOOKING_TIME_CLUSTERING",
    BookingValueAnomaly => "BOOKING_VALUE_ANOMALY",
    PaymentCircular => "PAYMENT_CIRCULAR",
    PaymentRapidTopup => "PAYMENT_RAPID_TOPUP",
    PaymentSplitTransaction => "PAYMENT_SPLIT_TRANSACTION",
    PaymentMethodSwitching => "PAYMENT_METHOD_SWITCHING",
    PaymentWithdrawalSpike => "PAYMENT_WITHDRAWAL_SPIKE",
    ProviderDuplicateIdentity => "PROVIDER_DUPLICATE_IDENTITY",
    ProviderResponseDegradation => "PROVIDER_RESPONSE_DEGRADATION",
    ProviderRatingManipulation => "PROVIDER_RATING_MANIPULATION",
    ProviderCancellationSpike => "PROVIDER_CANCELLATION_SPIKE",
    TemporalBurstActivity => "TEMPORAL_BURST_ACTIVITY",
    TemporalDormantActivation => "TEMPORAL_DORMANT_ACTIVATION",
    ContactPhoneChanged => "CONTACT_PHONE_CHANGED",
    ContactEmailChanged => "CONTACT_EMAIL_CHANGED",
    BookingCancelAfterContact => "BOOKING_CANCEL_AFTER_CONTACT",
    RepeatedUnpaidBooking => "REPEATED_UNPAID_BOOKING",
    DiscountOfferDetected => "DISCOUNT_OFFER_DETECTED",
    OffPlatformTransactionCorrelated => "OFF_PLATFORM_TRANSACTION_CORRELATED",
}

impl SignalType {
    /// Contact-disclosure types the correlation engine links to later outcomes
    pub const CONTACT_DISCLOSURE: &'static [SignalType] = &[
        SignalType::ContactPhone,
        SignalType::ContactEmail,
        SignalType::ContactSocial,
        SignalType::ContactMessagingApp,
        SignalType::OffPlatformIntent,
    ];
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod flags {
    pub const ESCALATION_PATTERN: &str = "ESCALATION_PATTERN";
    pub const HIGH_VOLUME_CONVERSATION: &str = "HIGH_VOLUME_CONVERSATION";
    pub const REPEATED_SIGNALS: &str = "REPEATED_SIGNALS";
    pub const TRANSACTION_PROXIMATE: &str = "TRANSACTION_PROXIMATE";
    pub const TX_FAILURE_RECENT: &str = "TX_FAILURE_RECENT";
    pub const PAYMENT_WINDOW: &str = "PAYMENT_WINDOW";
    pub const CORRELATION_CONTACT_CANCEL: &str = "CORRELATION_CONTACT_CANCEL";
    pub const CORRELATION_CONTACT_FAKE_COMPLETE: &str = "CORRELATION_CONTACT_FAKE_COMPLETE";
}

/// Clamp to `[0, 1]`; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Clamp and round to two decimals, for confidences built by summing boosts
pub fn round_confidence(value: f64) -> f64 {
    clamp_confidence((value * 100.0).round() / 100.0)
}

/// Evidence attached to a signal.
///
/// `event_id` and at least one timestamp are always present once a signal has passed
/// through the sink; domain detectors add their own keys to `details`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default)]
    pub timestamps: Vec<DateTime<Utc>>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl Evidence {
    pub fn for_event(event_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: event_id.to_string(),
            timestamps: vec![timestamp],
            ..Self::default()
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}

/// A typed, confidence-scored unit of evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSignal {
    pub signal_type: SignalType,
    pub confidence: f64,
    pub evidence: Evidence,
    #[serde(default)]
    pub obfuscation_flags: BTreeSet<String>,
    #[serde(default)]
    pub pattern_flags: BTreeSet<String>,
}

impl GeneratedSignal {
    pub fn new(signal_type: SignalType, confidence: f64, evidence: Evidence) -> Self {
        Self {
            signal_type,
            confidence,
            evidence,
            obfuscation_flags: BTreeSet::new(),
            pattern_flags: BTreeSet::new(),
        }
    }

    pub fn with_pattern_flag(mut self, flag: &str) -> Self {
        self.pattern_flags.insert(flag.to_string());
        self
    }

    pub fn with_obfuscation_flags(mut self, flags: &BTreeSet<String>) -> Self {
        self.obfuscation_flags.extend(flags.iter().cloned());
        self
    }
}
