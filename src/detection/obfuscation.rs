//! Obfuscation normalizer
//!
//! Five evasion techniques are detected in a fixed order. Each stage sees the text as left
//! by the previous stages and, except partial disclosure, rewrites it back to plain form so
//! the lexical and keyword matchers can run again on the result.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;

pub const SPACED_CHARACTERS: &str = "spaced_characters";
pub const EMOJI_SUBSTITUTION: &str = "emoji_substitution";
pub const LEETSPEAK: &str = "leetspeak";
pub const PARTIAL_DISCLOSURE: &str = "partial_disclosure";
pub const CHARACTER_SEPARATORS: &str = "character_separators";

const TECHNIQUE_WEIGHTS: &[(&str, f64)] = &[
    (SPACED_CHARACTERS, 0.20),
    (EMOJI_SUBSTITUTION, 0.25),
    (LEETSPEAK, 0.15),
    (PARTIAL_DISCLOSURE, 0.10),
    (CHARACTER_SEPARATORS, 0.20),
];

const MULTI_TECHNIQUE_BONUS: f64 = 0.10;

/// Outcome of normalizing one message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObfuscationResult {
    pub detected: bool,
    pub flags: BTreeSet<String>,
    pub normalized_text: String,
    pub confidence: f64,
}

static EMOJI_DIGITS: Lazy<Vec<(String, &'static str)>> = Lazy::new(|| {
    const DIGITS: [&str; 10] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];
    let mut table = Vec::new();
    // keycaps with the emoji presentation selector first, then bare keycaps
    for digit in DIGITS {
        table.push((format!("{}\u{FE0F}\u{20E3}", digit), digit));
    }
    for digit in DIGITS {
        table.push((format!("{}\u{20E3}", digit), digit));
    }
    table.push(("\u{1F51F}".to_string(), "10"));
    table.push(("\u{24EA}".to_string(), "0"));
    for (offset, digit) in DIGITS[1..].iter().enumerate() {
        if let Some(circled) = char::from_u32(0x2460 + offset as u32) {
            table.push((circled.to_string(), digit));
        }
    }
    table
});

static PARTIAL_DISCLOSURE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(?:number|phone|cell)\s+(?:starts?|begins?|is)\s+(?:with\s+)?\d{3,}",
        r"(?i)(?:first|last)\s+(?:part|half|digits?)\s+(?:is|are)\s+\d{3,}",
        r"(?i)(?:email|address)\s+(?:starts?|begins?|is)\s+\w+",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

fn leet_decode(c: char) -> Option<char> {
    Some(match c {
        '0' => 'o',
        '1' => 'i',
        '3' => 'e',
        '4' => 'a',
        '5' => 's',
        '7' => 't',
        '8' => 'b',
        '@' => 'a',
        '$' => 's',
        '!' => 'i',
        '|' => 'l',
        '+' => 't',
        _ => return None,
    })
}

fn is_leet_symbol(c: char) -> bool {
    matches!(c, '@' | '$' | '!' | '|' | '+')
}

const SEPARATORS: &[u8] = b".-|_/\\";

/// Run all five stages over `text`.
pub fn detect_obfuscation(text: &str) -> ObfuscationResult {
    let mut flags = BTreeSet::new();
    let mut normalized = text.to_string();

    if let Some(collapsed) = collapse_spaced_characters(&normalized) {
        flags.insert(SPACED_CHARACTERS.to_string());
        normalized = collapsed;
    }
    if let Some(replaced) = replace_emoji_digits(&normalized) {
        flags.insert(EMOJI_SUBSTITUTION.to_string());
        normalized = replaced;
    }
    if let Some(decoded) = decode_leetspeak(&normalized) {
        flags.insert(LEETSPEAK.to_string());
        normalized = decoded;
    }
    if has_partial_disclosure(&normalized) {
        flags.insert(PARTIAL_DISCLOSURE.to_string());
    }
    if let Some(stripped) = collapse_separators(&normalized) {
        flags.insert(CHARACTER_SEPARATORS.to_string());
        normalized = stripped;
    }

    let confidence = obfuscation_confidence(&flags);
    ObfuscationResult {
        detected: !flags.is_empty(),
        flags,
        normalized_text: normalized,
        confidence,
    }
}

/// Additive technique weights plus a bonus per extra technique, capped at 1.0
pub fn obfuscation_confidence(flags: &BTreeSet<String>) -> f64 {
    if flags.is_empty() {
        return 0.0;
    }
    let base: f64 = TECHNIQUE_WEIGHTS
        .iter()
        .filter(|(name, _)| flags.contains(*name))
        .map(|(_, weight)| weight)
        .sum();
    let bonus = MULTI_TECHNIQUE_BONUS * (flags.len() as f64 - 1.0);
    (base + bonus).min(1.0)
}

/// Whitespace-delimited tokens as byte spans
fn tokens(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push((s, i));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

/// "c a s h a p p" -> "cashapp": runs of three or more single alphanumerics.
fn collapse_spaced_characters(text: &str) -> Option<String> {
    let spans = tokens(text);
    let is_single = |&(s, e): &(usize, usize)| {
        let mut chars = text[s..e].chars();
        matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_alphanumeric())
    };

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut changed = false;
    let mut i = 0;
    while i < spans.len() {
        if !is_single(&spans[i]) {
            i += 1;
            continue;
        }
        let mut j = i;
        while j + 1 < spans.len() && is_single(&spans[j + 1]) {
            j += 1;
        }
        if j - i + 1 >= 3 {
            out.push_str(&text[cursor..spans[i].0]);
            for &(s, e) in &spans[i..=j] {
                out.push_str(&text[s..e]);
            }
            cursor = spans[j].1;
            changed = true;
        }
        i = j + 1;
    }
    if !changed {
        return None;
    }
    out.push_str(&text[cursor..]);
    Some(out)
}

fn replace_emoji_digits(text: &str) -> Option<String> {
    let mut out = text.to_string();
    let mut changed = false;
    for (emoji, digit) in EMOJI_DIGITS.iter() {
        if out.contains(emoji.as_str()) {
            out = out.replace(emoji.as_str(), digit);
            changed = true;
        }
    }
    changed.then_some(out)
}

/// Decode runs such as "wh4t5" or "em@il".
///
/// Runs are maximal stretches of letters, digits and leet symbols with leading/trailing
/// symbols trimmed off. Pure digit runs and runs shorter than three characters are left
/// alone, as is the local part of an email address.
fn decode_leetspeak(text: &str) -> Option<String> {
    let is_run_char = |c: char| c.is_ascii_alphanumeric() || is_leet_symbol(c);

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut changed = false;
    let mut chars = text.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if !is_run_char(c) {
            continue;
        }
        let mut end = start + c.len_utf8();
        while let Some(&(i, next)) = chars.peek() {
            if !is_run_char(next) {
                break;
            }
            end = i + next.len_utf8();
            chars.next();
        }

        let run = &text[start..end];
        let trimmed = run.trim_matches(is_leet_symbol);
        if trimmed.len() < 3 || trimmed.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if !trimmed.chars().any(|c| leet_decode(c).is_some()) {
            continue;
        }
        if trimmed.contains('@') && text[end..].starts_with('.') {
            continue;
        }

        let decoded: String = trimmed.chars().map(|c| leet_decode(c).unwrap_or(c)).collect();
        if decoded == trimmed {
            continue;
        }
        let lead = run.len() - run.trim_start_matches(is_leet_symbol).len();
        let run_start = start + lead;
        out.push_str(&text[cursor..run_start]);
        out.push_str(&decoded);
        cursor = run_start + trimmed.len();
        changed = true;
    }

    if !changed {
        return None;
    }
    out.push_str(&text[cursor..]);
    Some(out)
}

fn has_partial_disclosure(text: &str) -> bool {
    PARTIAL_DISCLOSURE_PATTERNS.iter().any(|re| re.is_match(text))
}

/// "e.m.a.i.l" -> "email": an alphanumeric followed by three or more repetitions of the
/// same separator and another alphanumeric.
fn collapse_separators(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut changed = false;
    let mut i = 0;

    while i + 1 < bytes.len() {
        if !bytes[i].is_ascii_alphanumeric() || !SEPARATORS.contains(&bytes[i + 1]) {
            i += 1;
            continue;
        }
        let sep = bytes[i + 1];
        let mut j = i;
        let mut repeats = 0;
        while j + 2 < bytes.len() && bytes[j + 1] == sep && bytes[j + 2].is_ascii_alphanumeric() {
            j += 2;
            repeats += 1;
        }
        if repeats >= 3 {
            out.push_str(&text[cursor..i]);
            out.extend(
                text[i..=j]
                    .chars()
                    .filter(|c| !c.is_ascii() || !SEPARATORS.contains(&(*c as u8))),
            );
            cursor = j + 1;
            changed = true;
            i = j + 1;
        } else {
            i += 1;
        }
    }

    if !changed {
        return None;
    }
    out.push_str(&text[cursor..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn flags(result: &ObfuscationResult) -> Vec<&str> {
        result.flags.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_clean_text_untouched() {
        let result = detect_obfuscation("The package arrived in perfect condition. Thank you!");
        assert!(!result.detected);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.normalized_text, "The package arrived in perfect condition. Thank you!");
    }

    #[test]
    fn test_spaced_digits_collapse() {
        let result = detect_obfuscation("My number is 5 5 5 1 2 3 4 5 6 7 text me there");
        assert_eq!(result.normalized_text, "My number is 5551234567 text me there");
        // the collapsed digits then read as "number is 5551234567"
        assert_eq!(flags(&result), vec![PARTIAL_DISCLOSURE, SPACED_CHARACTERS]);
        assert!((result.confidence - 0.40).abs() < 1e-9);

        let result = detect_obfuscation("code: 7 7 4 before noon");
        assert_eq!(flags(&result), vec![SPACED_CHARACTERS]);
        assert!((result.confidence - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_two_single_chars_are_not_a_run() {
        assert!(!detect_obfuscation("I have a 2 room flat").detected);
    }

    #[test]
    fn test_keycap_emoji_digits() {
        let result = detect_obfuscation("Call me at 5️⃣5️⃣5️⃣ 1️⃣2️⃣3️⃣ 4️⃣5️⃣6️⃣7️⃣");
        assert_eq!(flags(&result), vec![EMOJI_SUBSTITUTION]);
        assert_eq!(result.normalized_text, "Call me at 555 123 4567");
    }

    #[test]
    fn test_circled_digits_and_ten() {
        let result = detect_obfuscation("room ①⓪ or 🔟");
        assert_eq!(result.normalized_text, "room 10 or 10");
    }

    #[test_case("h1t m3 up 0n wh4t5 4pp", "hit m3 up 0n whats app" ; "mixed digits")]
    #[test_case("em@il me", "email me" ; "symbol inside word")]
    #[test_case("pay via ca$happ!", "pay via cashapp!" ; "trailing symbol kept")]
    fn test_leetspeak(input: &str, expected: &str) {
        let result = detect_obfuscation(input);
        assert_eq!(flags(&result), vec![LEETSPEAK]);
        assert_eq!(result.normalized_text, expected);
    }

    #[test_case("Call 555-123-4567" ; "phone digits")]
    #[test_case("Five stars!" ; "punctuation only")]
    #[test_case("Email me at john@example.com" ; "plain email")]
    #[test_case("it costs $20" ; "currency")]
    fn test_leetspeak_leaves_alone(input: &str) {
        assert!(!detect_obfuscation(input).flags.contains(LEETSPEAK), "{}", input);
    }

    #[test]
    fn test_partial_disclosure_flags_without_rewrite() {
        let text = "my number starts with 555 and ends later";
        let result = detect_obfuscation(text);
        assert_eq!(flags(&result), vec![PARTIAL_DISCLOSURE]);
        assert_eq!(result.normalized_text, text);
    }

    #[test_case("write to e.m.a.i.l now", "write to email now" ; "dots")]
    #[test_case("dial 5-5-5-1-2-3", "dial 555123" ; "dashes")]
    #[test_case("x/y/z/w", "xyzw" ; "slashes")]
    fn test_separators(input: &str, expected: &str) {
        let result = detect_obfuscation(input);
        assert!(result.flags.contains(CHARACTER_SEPARATORS));
        assert_eq!(result.normalized_text, expected);
    }

    #[test]
    fn test_separators_leave_phone_and_dates() {
        assert!(!detect_obfuscation("555-123-4567 on 2024-01-15").detected);
    }

    #[test]
    fn test_multi_technique_confidence() {
        // spaced + partial: 0.20 + 0.10 + 0.10 bonus
        let result = detect_obfuscation("c a s h a p p and my number starts with 555");
        assert_eq!(flags(&result), vec![PARTIAL_DISCLOSURE, SPACED_CHARACTERS]);
        assert!((result.confidence - 0.40).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_capped() {
        let all: BTreeSet<String> = TECHNIQUE_WEIGHTS.iter().map(|(n, _)| n.to_string()).collect();
        // 0.90 + 0.40 bonus
        assert_eq!(obfuscation_confidence(&all), 1.0);
    }

    #[test_case("My number is 5 5 5 1 2 3 4 5 6 7 text me there" ; "spaced")]
    #[test_case("Call me at 5️⃣5️⃣5️⃣ 1️⃣2️⃣3️⃣ 4️⃣5️⃣6️⃣7️⃣" ; "emoji")]
    #[test_case("C a s h a p p me at $quickdealer" ; "spaced word")]
    #[test_case("h1t m3 up 0n wh4t5 4pp" ; "leet")]
    #[test_case("em@il me >> john [at] g m a i l [dot] c o m" ; "leet and spaced")]
    #[test_case("write to e.m.a.i.l now" ; "separators")]
    #[test_case("my number starts with 555" ; "partial")]
    fn test_normalization_is_idempotent(input: &str) {
        let first = detect_obfuscation(input);
        let second = detect_obfuscation(&first.normalized_text);
        assert!(second.flags.is_subset(&first.flags), "{:?} vs {:?}", second.flags, first.flags);
        assert_eq!(second.normalized_text, first.normalized_text);
    }
}
