//! Keyword dictionary matchers
//!
//! Four phrase categories looked up with a word-boundary check, so a phrase never matches
//! inside a longer word ("whatsapp" does not hit "WhatsAppearance").

use serde::Serialize;

use crate::core::config::KeywordConfig;
use crate::detection::dedup::resolve_competing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordCategory {
    MessagingApp,
    PaymentPlatform,
    OffPlatformIntent,
    GroomingLanguage,
}

impl KeywordCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessagingApp => "messaging_app",
            Self::PaymentPlatform => "payment_platform",
            Self::OffPlatformIntent => "off_platform_intent",
            Self::GroomingLanguage => "grooming_language",
        }
    }
}

/// A dictionary hit, with a slice of surrounding text for reviewers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordMatch {
    pub category: KeywordCategory,
    pub keyword: String,
    pub index: usize,
    pub length: usize,
    pub context: String,
}

pub struct KeywordDictionary {
    entries: Vec<(KeywordCategory, String)>,
    context_chars: usize,
}

impl KeywordDictionary {
    pub fn from_config(config: &KeywordConfig) -> Self {
        let tables = [
            (KeywordCategory::MessagingApp, &config.messaging_apps),
            (KeywordCategory::PaymentPlatform, &config.payment_platforms),
            (KeywordCategory::OffPlatformIntent, &config.off_platform_intent),
            (KeywordCategory::GroomingLanguage, &config.grooming_language),
        ];
        let entries = tables
            .iter()
            .flat_map(|(category, list)| {
                list.iter()
                    .map(|phrase| phrase.trim().to_ascii_lowercase())
                    .filter(|phrase| !phrase.is_empty())
                    .map(move |phrase| (*category, phrase))
            })
            .collect();
        Self {
            entries,
            context_chars: config.context_chars,
        }
    }

    /// Every boundary-respecting occurrence of every phrase.
    ///
    /// ASCII lower-casing keeps byte offsets identical to the input, so `index` and the
    /// context slice refer to the caller's text.
    pub fn search_keywords(&self, text: &str) -> Vec<KeywordMatch> {
        let lower = text.to_ascii_lowercase();
        let mut found = Vec::new();

        for (category, phrase) in &self.entries {
            let mut from = 0;
            while let Some(offset) = lower[from..].find(phrase.as_str()) {
                let index = from + offset;
                let end = index + phrase.len();

                if is_boundary(lower[..index].chars().next_back())
                    && is_boundary(lower[end..].chars().next())
                {
                    found.push(KeywordMatch {
                        category: *category,
                        keyword: phrase.clone(),
                        index,
                        length: phrase.len(),
                        context: self.context_slice(text, index, end),
                    });
                }

                from = index + lower[index..].chars().next().map_or(1, char::len_utf8);
                if from >= lower.len() {
                    break;
                }
            }
        }
        found
    }

    fn context_slice(&self, text: &str, start: usize, end: usize) -> String {
        let mut lo = start.saturating_sub(self.context_chars);
        while !text.is_char_boundary(lo) {
            lo -= 1;
        }
        let mut hi = (end + self.context_chars).min(text.len());
        while !text.is_char_boundary(hi) {
            hi += 1;
        }
        text[lo..hi].to_string()
    }
}

fn is_boundary(neighbour: Option<char>) -> bool {
    neighbour.map_or(true, |c| !c.is_alphanumeric())
}

/// One match per `(category, keyword)`, keeping the first occurrence.
pub fn deduplicate_keywords(matches: Vec<KeywordMatch>) -> Vec<KeywordMatch> {
    resolve_competing(
        matches,
        |m| (m.category, m.keyword.to_lowercase()),
        |kept, candidate| kept.category == candidate.category && kept.keyword == candidate.keyword,
    )
}
