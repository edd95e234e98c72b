//! Detection engine
//!
//! Message-level analysis (matchers, obfuscation, context, synthesis), the persistence
//! sink, and the behavioral consumers built on [`baseline::BaselineAnomalyDetector`].

use std::sync::Arc;
use tracing::info;

use crate::core::config::DetectionConfig;
use crate::core::errors::Result;
use crate::events::dispatcher::{Consumer, Dispatcher};
use crate::storage::DetectionStore;

pub mod baseline;
pub mod consumers;
pub mod context;
pub mod dedup;
pub mod keywords;
pub mod lexical;
pub mod obfuscation;
pub mod persist;
pub mod pipeline;
pub mod signals;
pub mod synthesizer;

pub use signals::{GeneratedSignal, SignalType};
pub use synthesizer::TextScanner;

/// Build every enabled consumer over `store` and register it.
///
/// Pattern tables are compiled once here; an invalid pattern fails startup.
pub fn register_all(
    dispatcher: &mut Dispatcher,
    store: Arc<dyn DetectionStore>,
    config: &DetectionConfig,
) -> Result<()> {
    let scanner = Arc::new(TextScanner::from_config(config)?);
    let candidates: Vec<Arc<dyn Consumer>> = vec![
        Arc::new(pipeline::MessageAnalyzer::new(scanner, store.clone(), config.context.clone())),
        Arc::new(consumers::BookingAnomalyConsumer::new(store.clone())),
        Arc::new(consumers::PaymentAnomalyConsumer::new(store.clone())),
        Arc::new(consumers::ProviderBehaviorConsumer::new(store.clone())),
        Arc::new(consumers::TemporalPatternConsumer::new(store.clone())),
        Arc::new(consumers::ContactChangeConsumer::new(store.clone())),
        Arc::new(consumers::CorrelationEngine::new(store.clone())),
        Arc::new(consumers::LeakageTracker::new(store.clone())),
        Arc::new(consumers::RelationshipTracker::new(store)),
    ];

    for consumer in candidates {
        if config.consumers.is_enabled(consumer.name()) {
            dispatcher.register(consumer)?;
        }
    }
    info!(consumers = dispatcher.count(), "Detection consumers registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::KNOWN_CONSUMERS;
    use crate::storage::MemoryStore;

    #[test]
    fn test_register_all_honours_enabled_list() {
        let store: Arc<dyn DetectionStore> = Arc::new(MemoryStore::new());

        let mut dispatcher = Dispatcher::new();
        register_all(&mut dispatcher, store.clone(), &DetectionConfig::default()).unwrap();
        assert_eq!(dispatcher.consumer_names(), KNOWN_CONSUMERS.to_vec());

        let mut config = DetectionConfig::default();
        config.consumers.enabled = vec!["correlation-engine".to_string()];
        let mut dispatcher = Dispatcher::new();
        register_all(&mut dispatcher, store, &config).unwrap();
        assert_eq!(dispatcher.consumer_names(), vec!["correlation-engine"]);
    }
}
