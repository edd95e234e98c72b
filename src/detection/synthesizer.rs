//! Signal synthesis for message events
//!
//! [`TextScanner`] turns one message into matcher output (obfuscation result, lexical and
//! keyword hits over the raw and the normalized text). [`synthesize`] is a pure function
//! from that output plus the conversation context to scored signals.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::config::DetectionConfig;
use crate::core::errors::Result;
use crate::detection::context::{ConversationContext, TransactionPhase};
use crate::detection::keywords::{deduplicate_keywords, KeywordCategory, KeywordDictionary, KeywordMatch};
use crate::detection::lexical::{LexicalMatcher, LexicalMatches};
use crate::detection::obfuscation::{detect_obfuscation, ObfuscationResult};
use crate::detection::signals::{flags, Evidence, GeneratedSignal, SignalType};

const OBFUSCATION_BOOST_WEIGHT: f64 = 0.3;
const GROOMING_SCALE: f64 = 0.8;
const HIGH_VOLUME_MESSAGES: u64 = 10;
const FAILED_TX_WINDOW_MS: i64 = 10 * 60 * 1000;

/// Matcher output for one message
#[derive(Debug, Clone, Serialize)]
pub struct MessageAnalysis {
    pub obfuscation: ObfuscationResult,
    pub lexical: LexicalMatches,
    pub keywords: Vec<KeywordMatch>,
}

impl MessageAnalysis {
    fn keyword_count(&self, category: KeywordCategory) -> usize {
        self.keywords.iter().filter(|m| m.category == category).count()
    }
}

/// Compiled lexical and keyword tables
pub struct TextScanner {
    lexical: LexicalMatcher,
    keywords: KeywordDictionary,
}

impl TextScanner {
    pub fn new(lexical: LexicalMatcher, keywords: KeywordDictionary) -> Self {
        Self { lexical, keywords }
    }

    pub fn from_config(config: &DetectionConfig) -> Result<Self> {
        Ok(Self::new(
            LexicalMatcher::from_config(&config.lexical)?,
            KeywordDictionary::from_config(&config.keywords),
        ))
    }

    /// Normalize, then match the raw text and (if anything was de-obfuscated) the
    /// normalized text. Keyword hits are deduplicated; lexical hits are not.
    pub fn scan(&self, text: &str) -> MessageAnalysis {
        let obfuscation = detect_obfuscation(text);

        let mut lexical = self.lexical.detect_all(text);
        let mut keywords = self.keywords.search_keywords(text);
        if obfuscation.detected {
            lexical.extend(self.lexical.detect_all(&obfuscation.normalized_text));
            keywords.extend(self.keywords.search_keywords(&obfuscation.normalized_text));
        }

        MessageAnalysis {
            obfuscation,
            lexical,
            keywords: deduplicate_keywords(keywords),
        }
    }
}

/// The message a set of signals is about
#[derive(Debug, Clone)]
pub struct MessageOrigin<'a> {
    pub event_id: &'a str,
    pub message_id: &'a str,
    pub at: DateTime<Utc>,
}

/// Base confidence by number of matches in a category
pub fn base_confidence(match_count: usize) -> f64 {
    match match_count {
        0 => 0.0,
        1 => 0.5,
        2 => 0.7,
        _ => 0.85,
    }
}

fn obfuscation_boost(confidence: f64, obfuscation: &ObfuscationResult) -> f64 {
    if obfuscation.detected {
        (confidence + obfuscation.confidence * OBFUSCATION_BOOST_WEIGHT).min(1.0)
    } else {
        confidence
    }
}

fn context_boost(confidence: f64, context: &ConversationContext) -> f64 {
    let mut boost = 0.0;
    match context.transaction_proximity.as_ref().map(|tx| tx.phase) {
        Some(TransactionPhase::PaymentWindow) => boost += 0.15,
        Some(TransactionPhase::PrePayment) => boost += 0.10,
        _ => {}
    }
    if context.conversation_pattern.has_escalation {
        boost += 0.10;
    }
    if context.conversation_pattern.unique_signal_types > 3 {
        boost += 0.10;
    }
    (confidence + boost).min(1.0)
}

fn shared_evidence(origin: &MessageOrigin<'_>, context: &ConversationContext) -> Evidence {
    let mut evidence = Evidence::for_event(origin.event_id, origin.at);
    evidence.message_ids.push(origin.message_id.to_string());
    for message in &context.messages {
        if !evidence.message_ids.contains(&message.id) {
            evidence.message_ids.push(message.id.clone());
            evidence.timestamps.push(message.created_at);
        }
    }
    evidence
}

fn conversation_flags(context: &ConversationContext) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if context.conversation_pattern.has_escalation {
        out.insert(flags::ESCALATION_PATTERN.to_string());
    }
    if context.conversation_pattern.message_count > HIGH_VOLUME_MESSAGES {
        out.insert(flags::HIGH_VOLUME_CONVERSATION.to_string());
    }
    out
}

/// Score every triggered category and the transaction-timing signals.
pub fn synthesize(
    origin: &MessageOrigin<'_>,
    analysis: &MessageAnalysis,
    context: &ConversationContext,
) -> Vec<GeneratedSignal> {
    let evidence = shared_evidence(origin, context);
    let base_flags = conversation_flags(context);
    let obfuscation = &analysis.obfuscation;

    let categories = [
        (SignalType::ContactPhone, analysis.lexical.phone.len()),
        (SignalType::ContactEmail, analysis.lexical.email.len()),
        (SignalType::ContactSocial, analysis.lexical.social.len()),
        (SignalType::ContactMessagingApp, analysis.keyword_count(KeywordCategory::MessagingApp)),
        (SignalType::PaymentExternal, analysis.keyword_count(KeywordCategory::PaymentPlatform)),
        (SignalType::OffPlatformIntent, analysis.keyword_count(KeywordCategory::OffPlatformIntent)),
        (SignalType::GroomingLanguage, analysis.keyword_count(KeywordCategory::GroomingLanguage)),
    ];

    let mut signals = Vec::new();
    for (signal_type, count) in categories {
        if count == 0 {
            continue;
        }

        let grooming = signal_type == SignalType::GroomingLanguage;
        let confidence = if grooming {
            base_confidence(count) * GROOMING_SCALE
        } else {
            obfuscation_boost(base_confidence(count), obfuscation)
        };

        let mut signal = GeneratedSignal::new(
            signal_type,
            context_boost(confidence, context),
            evidence.clone().with("match_count", count),
        );
        signal.pattern_flags = base_flags.clone();
        if count > 1 {
            signal = signal.with_pattern_flag(flags::REPEATED_SIGNALS);
        }
        if !grooming {
            signal = signal.with_obfuscation_flags(&obfuscation.flags);
        }
        signals.push(signal);
    }

    if let Some(tx) = &context.transaction_proximity {
        let evidence = evidence
            .with("transaction_id", tx.transaction_id.as_str())
            .with("time_delta_ms", tx.time_delta_ms)
            .with("phase", tx.phase.as_str());
        let tx_signal = |signal_type, confidence, flag| {
            let mut signal = GeneratedSignal::new(signal_type, confidence, evidence.clone());
            signal.pattern_flags = base_flags.clone();
            signal.with_pattern_flag(flag)
        };

        let external_payment = analysis.keyword_count(KeywordCategory::PaymentPlatform) > 0;
        if external_payment && tx.phase != TransactionPhase::PostPayment {
            let confidence = if obfuscation.detected { 0.85 } else { 0.7 };
            signals.push(
                tx_signal(SignalType::TxRedirectAttempt, confidence, flags::TRANSACTION_PROXIMATE)
                    .with_obfuscation_flags(&obfuscation.flags),
            );
        }

        if tx.status == "failed" && tx.time_delta_ms.abs() < FAILED_TX_WINDOW_MS {
            signals.push(tx_signal(SignalType::TxFailureCorrelated, 0.6, flags::TX_FAILURE_RECENT));
        }

        if tx.phase == TransactionPhase::PaymentWindow {
            signals.push(tx_signal(SignalType::TxTimingAlignment, 0.5, flags::PAYMENT_WINDOW));
        }
    }

    signals
}
