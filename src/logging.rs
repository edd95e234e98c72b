//! Logging setup and log-safe helpers.

use std::env;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` (usually `logging.filter` from config).
pub fn init_logging(default_filter: &str) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}

/// Redact user-authored text unless DEV_PRINT_CONTENT=1 is set in the environment.
/// By default this returns a short placeholder containing only the length.
pub fn redact_content(s: &str) -> String {
    if env::var("DEV_PRINT_CONTENT").ok().as_deref() == Some("1") {
        return s.to_string();
    }
    format!("<redacted len={}>", s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_content_hides_text() {
        if env::var("DEV_PRINT_CONTENT").ok().as_deref() == Some("1") {
            return;
        }
        let redacted = redact_content("call me at 555-123-4567");
        assert_eq!(redacted, "<redacted len=23>");
        assert!(!redacted.contains("555"));
    }
}
