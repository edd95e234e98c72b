//! Detection configuration
//!
//! Pattern and keyword tables are data, not globals: they are loaded here, validated, and
//! compiled into matchers at startup so tests can swap them out.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::errors::{DetectionError, Result};

/// Names of the consumers shipped with the engine.
pub const KNOWN_CONSUMERS: &[&str] = &[
    "detection-orchestrator",
    "booking-anomaly-detection",
    "payment-anomaly-detection",
    "provider-anomaly-detection",
    "temporal-anomaly-detection",
    "contact-change-detection",
    "correlation-engine",
    "leakage-tracking",
    "relationship-tracking",
];

/// Top-level detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DetectionConfig {
    /// Backing store
    pub storage: StorageConfig,

    /// Lexical pattern tables
    pub lexical: LexicalConfig,

    /// Keyword phrase tables
    pub keywords: KeywordConfig,

    /// Context window sizing
    pub context: ContextConfig,

    /// Consumer registration
    pub consumers: ConsumerConfig,

    /// Logging
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sqlx database URL; `None` selects the in-memory store
    pub database_url: Option<String>,

    /// Pool size for the sqlite store
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
        }
    }
}

/// Extra acceptance check applied around a regex match.
///
/// The regex engine has no lookaround, so the context conditions some patterns need are
/// checked on the surrounding characters instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryGuard {
    #[default]
    None,
    /// Neither neighbouring character may be an ASCII digit
    NoAdjacentDigit,
    /// The match must start the text or follow whitespace
    WhitespaceBefore,
}

/// One named lexical pattern
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternSpec {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub guard: BoundaryGuard,
    /// Strip surrounding whitespace from the matched text
    #[serde(default)]
    pub trim: bool,
}

impl PatternSpec {
    fn new(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            guard: BoundaryGuard::None,
            trim: false,
        }
    }

    fn guarded(mut self, guard: BoundaryGuard) -> Self {
        self.guard = guard;
        self
    }

    fn trimmed(mut self) -> Self {
        self.trim = true;
        self
    }
}

/// Lexical pattern tables, one list per category
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LexicalConfig {
    pub phone: Vec<PatternSpec>,
    pub email: Vec<PatternSpec>,
    pub url: Vec<PatternSpec>,
    pub social: Vec<PatternSpec>,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        use BoundaryGuard::*;
        Self {
            phone: vec![
                PatternSpec::new(
                    "phone_standard",
                    r"(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}",
                )
                .guarded(NoAdjacentDigit),
                PatternSpec::new(
                    "phone_international",
                    r"\+?[1-9]\d{0,2}[-.\s]?\d{2,4}[-.\s]?\d{3,4}[-.\s]?\d{3,4}",
                )
                .guarded(NoAdjacentDigit),
                PatternSpec::new("phone_spaced", r"\d(?:\s\d){9,14}").guarded(NoAdjacentDigit),
                PatternSpec::new(
                    "phone_written",
                    r"(?i)(?:(?:zero|one|two|three|four|five|six|seven|eight|nine)[\s,.\-]+){7,}",
                ),
            ],
            email: vec![
                PatternSpec::new(
                    "email_standard",
                    r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}",
                ),
                PatternSpec::new(
                    "email_obfuscated",
                    r"(?i)[a-z0-9._%+\-]+\s*(?:\[at\]|@|\(at\)|\{at\}|\bat\b)\s*[a-z0-9.\-]+\s*(?:\[dot\]|\(dot\)|\{dot\}|\bdot\b)\s*[a-z]{2,}",
                ),
                PatternSpec::new(
                    "email_spaced",
                    r"(?i)(?:[a-z]\s){3,}(?:@|\bat\b)\s*(?:[a-z]\s){3,}(?:\.|\bdot\b)\s*[a-z\s]{2,6}",
                ),
            ],
            url: vec![
                PatternSpec::new("url_http", r#"(?i)https?://[^\s<>"']+"#),
                PatternSpec::new("url_www", r#"www\.[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}[^\s<>"']*"#)
                    .guarded(WhitespaceBefore),
                PatternSpec::new(
                    "url_shortener",
                    r"(?i)(?:bit\.ly|tinyurl\.com|t\.co|goo\.gl|rb\.gy)/[a-zA-Z0-9]+",
                ),
            ],
            social: vec![
                PatternSpec::new("social_handle", r"(?:^|\s)@[a-zA-Z0-9_]{3,30}(?:\s|$)")
                    .trimmed(),
                PatternSpec::new(
                    "social_platform_prefix",
                    r"(?i)\b(?:instagram|insta|ig|facebook|fb|twitter|tiktok|snapchat|snap)\b\s*[:\-]?\s*@?[a-zA-Z0-9_.]{3,30}",
                ),
                PatternSpec::new(
                    "social_spaced_platform",
                    r"(?i)\b(?:i\s*n\s*s\s*t\s*a|f\s*b|t\s*w\s*i\s*t\s*t\s*e\s*r)\b\s*[:\-]?\s*@?[a-zA-Z0-9_.]{3,30}",
                ),
            ],
        }
    }
}

fn phrases(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| p.to_string()).collect()
}

/// Keyword phrase tables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordConfig {
    pub messaging_apps: Vec<String>,
    pub payment_platforms: Vec<String>,
    pub off_platform_intent: Vec<String>,
    pub grooming_language: Vec<String>,

    /// Characters of surrounding text captured on each side of a hit
    pub context_chars: usize,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            messaging_apps: phrases(&[
                "whatsapp", "whatapp", "watsapp", "wa", "what's app", "whats app",
                "telegram", "tg", "telgram", "signal", "signal app", "imessage",
                "facetime", "discord", "disc", "snapchat", "snap", "wechat",
                "line app", "viber", "kik", "messenger", "fb messenger",
            ]),
            payment_platforms: phrases(&[
                "venmo", "paypal", "cashapp", "cash app", "ca$happ", "zelle",
                "apple pay", "google pay", "gpay", "bitcoin", "btc", "ethereum",
                "eth", "crypto", "western union", "moneygram", "wire transfer",
                "bank transfer", "direct deposit", "cash only", "pay directly",
                "pay me directly", "outside the app", "off platform payment",
            ]),
            off_platform_intent: phrases(&[
                "text me", "call me", "dm me", "message me", "hit me up", "hmu",
                "reach me at", "contact me at", "contact me on", "contact me via",
                "off the app", "off platform", "outside the platform",
                "take this offline", "take this conversation offline",
                "talk privately", "talk directly", "lets move to", "lets go to",
                "switch to", "my number is", "my email is", "my handle is",
                "add me on", "find me on", "follow me on",
            ]),
            grooming_language: phrases(&[
                "trust me", "i promise", "between us", "just this once",
                "special deal", "exclusive offer", "don't tell", "keep this between",
                "our secret", "no need for the platform", "skip the middleman",
                "save on fees", "avoid the fee", "no commission",
                "i'll give you a discount", "better price privately",
                "we can work something out", "side deal", "privately",
                "in private", "just between us",
            ]),
            context_chars: 30,
        }
    }
}

/// Context window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Messages on each side of the target message
    pub window_size: usize,

    /// Half-width of the message time window, in minutes
    pub window_span_minutes: i64,

    /// A message this close before a transaction is in its payment window
    pub payment_window_secs: i64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_size: 2,
            window_span_minutes: 60,
            payment_window_secs: 300,
        }
    }
}

/// Consumer registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub enabled: Vec<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: phrases(KNOWN_CONSUMERS),
        }
    }
}

impl ConsumerConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.iter().any(|n| n == name)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl DetectionConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config: Self = if is_json {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)
                .map_err(|e| DetectionError::Configuration(format!("{}: {}", path.display(), e)))?
        };
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `CIS_DATABASE_URL`, `CIS_LOG_FILTER` and `CIS_CONTEXT_WINDOW`
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("CIS_DATABASE_URL") {
            if !url.trim().is_empty() {
                self.storage.database_url = Some(url);
            }
        }
        if let Ok(filter) = std::env::var("CIS_LOG_FILTER") {
            if !filter.trim().is_empty() {
                self.logging.filter = filter;
            }
        }
        if let Some(window) = std::env::var("CIS_CONTEXT_WINDOW")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.context.window_size = window;
        }
        self
    }

    /// Validate configuration validity
    pub fn validate(&self) -> std::result::Result<(), String> {
        let lexical = [
            ("phone", &self.lexical.phone),
            ("email", &self.lexical.email),
            ("url", &self.lexical.url),
            ("social", &self.lexical.social),
        ];
        for (category, patterns) in lexical {
            if patterns.is_empty() {
                return Err(format!("Lexical category '{}' has no patterns", category));
            }
            if let Some(p) = patterns.iter().find(|p| p.pattern.trim().is_empty()) {
                return Err(format!("Pattern '{}' is empty", p.name));
            }
        }

        let keywords = [
            ("messaging_apps", &self.keywords.messaging_apps),
            ("payment_platforms", &self.keywords.payment_platforms),
            ("off_platform_intent", &self.keywords.off_platform_intent),
            ("grooming_language", &self.keywords.grooming_language),
        ];
        for (category, list) in keywords {
            if list.is_empty() {
                return Err(format!("Keyword category '{}' is empty", category));
            }
            if list.iter().any(|k| k.trim().is_empty()) {
                return Err(format!("Keyword category '{}' contains a blank phrase", category));
            }
        }

        if self.context.window_size == 0 {
            return Err("Context window size must be greater than 0".to_string());
        }
        if self.context.window_span_minutes <= 0 || self.context.payment_window_secs <= 0 {
            return Err("Context time windows must be positive".to_string());
        }
        if self.storage.max_connections == 0 {
            return Err("Maximum connections must be greater than 0".to_string());
        }
        if let Some(unknown) = self
            .consumers
            .enabled
            .iter()
            .find(|n| !KNOWN_CONSUMERS.contains(&n.as_str()))
        {
            return Err(format!("Unknown consumer '{}'", unknown));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DetectionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.context.window_size, 2);
        assert_eq!(config.keywords.context_chars, 30);
        assert_eq!(config.consumers.enabled.len(), KNOWN_CONSUMERS.len());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DetectionConfig::default();
        config.context.window_size = 0;
        assert!(config.validate().is_err());

        let mut config = DetectionConfig::default();
        config.keywords.grooming_language.clear();
        assert!(config.validate().unwrap_err().contains("grooming_language"));

        let mut config = DetectionConfig::default();
        config.consumers.enabled.push("fraud-oracle".to_string());
        assert!(config.validate().unwrap_err().contains("fraud-oracle"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[context]\nwindow_size = 4\n\n[keywords]\nmessaging_apps = [\"whatsapp\"]"
        )
        .unwrap();

        let config = DetectionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.context.window_size, 4);
        assert_eq!(config.context.window_span_minutes, 60);
        assert_eq!(config.keywords.messaging_apps, vec!["whatsapp".to_string()]);
        assert!(!config.keywords.payment_platforms.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"logging": {{"filter": "debug"}}}}"#).unwrap();

        let config = DetectionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.logging.filter, "debug");
        assert_eq!(config.lexical.phone.len(), 4);
    }

    #[test]
    fn test_bad_toml_is_configuration_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[context\nwindow_size = ").unwrap();
        let err = DetectionConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, DetectionError::Configuration(_)));
    }
}
