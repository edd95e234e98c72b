//! Detection error types
//!
//! One error taxonomy for the whole engine. Detectors convert these into log lines at the
//! point of failure; nothing here ever reaches the dispatcher loop.

use thiserror::Error;

/// Detection engine error type
#[derive(Debug, Error)]
pub enum DetectionError {
    /// Storage-level failure reported by a store implementation
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database driver failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization / deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A configured pattern failed to compile
    #[error("Invalid pattern '{name}': {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Detection result type
pub type Result<T> = std::result::Result<T, DetectionError>;

impl DetectionError {
    /// Lookup failures a detector may degrade on ("no additional evidence").
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Database(_) | Self::Io(_)
        )
    }

    /// Errors that indicate a broken deployment rather than a bad event.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::InvalidPattern { .. })
    }

    /// Extra context for log lines
    pub fn context(&self) -> String {
        match self {
            Self::InvalidPattern { name, .. } => format!("Pattern: {}", name),
            _ => "No additional context".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DetectionError::Storage("Connection lost".to_string());
        assert_eq!(err.to_string(), "Storage error: Connection lost");
    }

    #[test]
    fn test_transient_classification() {
        assert!(DetectionError::Storage("timeout".into()).is_transient());
        assert!(DetectionError::Io(std::io::Error::other("disk")).is_transient());
        assert!(!DetectionError::Configuration("empty table".into()).is_transient());
        assert!(DetectionError::Configuration("empty table".into()).is_critical());
    }

    #[test]
    fn test_invalid_pattern_context() {
        let source = regex::Regex::new("(unclosed").unwrap_err();
        let err = DetectionError::InvalidPattern {
            name: "phone_standard".to_string(),
            source,
        };
        assert!(err.context().contains("phone_standard"));
        assert!(err.is_critical());
        assert!(err.to_string().starts_with("Invalid pattern 'phone_standard'"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{oops");
        let err: DetectionError = parse.unwrap_err().into();
        assert!(matches!(err, DetectionError::Serialization(_)));
    }
}
