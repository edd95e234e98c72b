//! Lexical pattern matchers
//!
//! Regex extraction of phone numbers, emails, URLs and social handles. Patterns come from
//! [`LexicalConfig`] and are compiled once; each category runs all of its patterns and then
//! resolves overlapping hits in favour of the earliest, longest match.

use regex::Regex;
use serde::Serialize;
use std::cmp::Reverse;

use crate::core::config::{BoundaryGuard, LexicalConfig, PatternSpec};
use crate::core::errors::{DetectionError, Result};
use crate::detection::dedup::resolve_competing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LexicalCategory {
    Phone,
    Email,
    Url,
    Social,
}

impl LexicalCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phone => "phone",
            Self::Email => "email",
            Self::Url => "url",
            Self::Social => "social",
        }
    }
}

/// One regex hit. `index` and `length` are byte offsets into the scanned text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawMatch {
    pub category: LexicalCategory,
    pub pattern: String,
    pub matched_text: String,
    pub index: usize,
    pub length: usize,
}

impl RawMatch {
    pub fn end(&self) -> usize {
        self.index + self.length
    }
}

/// Matches from every category for one text
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LexicalMatches {
    pub phone: Vec<RawMatch>,
    pub email: Vec<RawMatch>,
    pub url: Vec<RawMatch>,
    pub social: Vec<RawMatch>,
}

impl LexicalMatches {
    pub fn is_empty(&self) -> bool {
        self.phone.is_empty() && self.email.is_empty() && self.url.is_empty() && self.social.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &RawMatch> {
        self.phone
            .iter()
            .chain(self.email.iter())
            .chain(self.url.iter())
            .chain(self.social.iter())
    }

    /// Append another scan's matches. No cross-scan dedupe: a hit found in both the raw
    /// and the normalized text counts twice.
    pub fn extend(&mut self, other: LexicalMatches) {
        self.phone.extend(other.phone);
        self.email.extend(other.email);
        self.url.extend(other.url);
        self.social.extend(other.social);
    }
}

struct CompiledPattern {
    name: String,
    regex: Regex,
    guard: BoundaryGuard,
    trim: bool,
}

impl CompiledPattern {
    fn compile(spec: &PatternSpec) -> Result<Self> {
        let regex = Regex::new(&spec.pattern).map_err(|source| DetectionError::InvalidPattern {
            name: spec.name.clone(),
            source,
        })?;
        Ok(Self {
            name: spec.name.clone(),
            regex,
            guard: spec.guard,
            trim: spec.trim,
        })
    }

    fn accepts(&self, text: &str, start: usize, end: usize) -> bool {
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        match self.guard {
            BoundaryGuard::None => true,
            BoundaryGuard::NoAdjacentDigit => {
                !before.map_or(false, |c| c.is_ascii_digit())
                    && !after.map_or(false, |c| c.is_ascii_digit())
            }
            BoundaryGuard::WhitespaceBefore => before.map_or(true, char::is_whitespace),
        }
    }

    fn scan(&self, category: LexicalCategory, text: &str, out: &mut Vec<RawMatch>) {
        let mut from = 0;
        while from <= text.len() {
            let Some(m) = self.regex.find_at(text, from) else {
                break;
            };
            let step = text[m.start()..].chars().next().map_or(1, char::len_utf8);

            if !self.accepts(text, m.start(), m.end()) {
                from = m.start() + step;
                continue;
            }

            let (index, matched) = if self.trim {
                let lead = m.as_str().len() - m.as_str().trim_start().len();
                (m.start() + lead, m.as_str().trim())
            } else {
                (m.start(), m.as_str())
            };
            if !matched.is_empty() {
                out.push(RawMatch {
                    category,
                    pattern: self.name.clone(),
                    matched_text: matched.to_string(),
                    index,
                    length: matched.len(),
                });
            }

            from = if m.end() > m.start() { m.end() } else { m.start() + step };
        }
    }
}

/// Keep the earliest, longest match among overlapping candidates.
pub fn deduplicate_matches(matches: Vec<RawMatch>) -> Vec<RawMatch> {
    resolve_competing(
        matches,
        |m| (m.index, Reverse(m.length)),
        |kept, candidate| candidate.index < kept.end(),
    )
}

/// Compiled lexical pattern tables
pub struct LexicalMatcher {
    phone: Vec<CompiledPattern>,
    email: Vec<CompiledPattern>,
    url: Vec<CompiledPattern>,
    social: Vec<CompiledPattern>,
}

impl LexicalMatcher {
    pub fn from_config(config: &LexicalConfig) -> Result<Self> {
        let compile = |specs: &[PatternSpec]| -> Result<Vec<CompiledPattern>> {
            specs.iter().map(CompiledPattern::compile).collect()
        };
        Ok(Self {
            phone: compile(&config.phone)?,
            email: compile(&config.email)?,
            url: compile(&config.url)?,
            social: compile(&config.social)?,
        })
    }

    fn detect(&self, category: LexicalCategory, text: &str) -> Vec<RawMatch> {
        let patterns = match category {
            LexicalCategory::Phone => &self.phone,
            LexicalCategory::Email => &self.email,
            LexicalCategory::Url => &self.url,
            LexicalCategory::Social => &self.social,
        };
        let mut found = Vec::new();
        for pattern in patterns {
            pattern.scan(category, text, &mut found);
        }
        deduplicate_matches(found)
    }

    pub fn detect_phone_numbers(&self, text: &str) -> Vec<RawMatch> {
        self.detect(LexicalCategory::Phone, text)
    }

    pub fn detect_emails(&self, text: &str) -> Vec<RawMatch> {
        self.detect(LexicalCategory::Email, text)
    }

    pub fn detect_urls(&self, text: &str) -> Vec<RawMatch> {
        self.detect(LexicalCategory::Url, text)
    }

    pub fn detect_social_handles(&self, text: &str) -> Vec<RawMatch> {
        self.detect(LexicalCategory::Social, text)
    }

    pub fn detect_all(&self, text: &str) -> LexicalMatches {
        LexicalMatches {
            phone: self.detect_phone_numbers(text),
            email: self.detect_emails(text),
            url: self.detect_urls(text),
            social: self.detect_social_handles(text),
        }
    }
}
