// src/main.rs
//! cis-detect: offline driver for the detection engine.
//! Replays a JSONL event stream through every enabled consumer, or scans one message.
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use contact_integrity::core::config::DetectionConfig;
use contact_integrity::detection::context::ConversationContext;
use contact_integrity::detection::register_all;
use contact_integrity::detection::synthesizer::{synthesize, MessageOrigin, TextScanner};
use contact_integrity::events::{Dispatcher, DomainEvent};
use contact_integrity::logging::init_logging;
use contact_integrity::storage::{ActivityRecord, DetectionStore, MemoryStore, Snapshot, SqliteStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cis-detect")]
#[command(about = "Contact integrity detection engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch a JSONL file of domain events through all enabled consumers
    Replay(ReplayArgs),
    /// Scan a single message without storage and print the signals as JSON
    Scan {
        /// Message text
        #[arg(long)]
        text: String,
        /// Configuration file (.toml or .json)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load and validate a configuration file
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(ClapArgs)]
struct ReplayArgs {
    /// One DomainEvent per line
    #[arg(long)]
    events: PathBuf,
    /// Pre-existing platform state (JSON)
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// sqlx database URL; overrides the configured one
    #[arg(long)]
    database: Option<String>,
    /// Configuration file (.toml or .json)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Replay(replay_args) => {
            let config = load_config(replay_args.config.as_deref())?;
            init_logging(&config.logging.filter)?;
            info!("Starting cis-detect v{}", env!("CARGO_PKG_VERSION"));
            replay(replay_args, config).await
        }
        Commands::Scan { text, config } => {
            let config = load_config(config.as_deref())?;
            init_logging(&config.logging.filter)?;
            scan(&text, &config)
        }
        Commands::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            TextScanner::from_config(&config).context("Pattern tables do not compile")?;
            println!(
                "configuration ok: {} consumers enabled, context window {}",
                config.consumers.enabled.len(),
                config.context.window_size
            );
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<DetectionConfig> {
    let config = match path {
        Some(path) => DetectionConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?
            .with_env_overrides(),
        None => DetectionConfig::from_env(),
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

async fn open_store(args: &ReplayArgs, config: &DetectionConfig) -> Result<Arc<dyn DetectionStore>> {
    let snapshot = match &args.snapshot {
        Some(path) => {
            let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str::<Snapshot>(&raw).context("Snapshot is not valid JSON")?
        }
        None => Snapshot::default(),
    };

    let database_url = args.database.clone().or_else(|| config.storage.database_url.clone());
    match database_url {
        Some(url) => {
            let store = SqliteStore::connect(&url, config.storage.max_connections).await?;
            store.load_snapshot(&snapshot).await?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::from_snapshot(snapshot))),
    }
}

async fn replay(args: ReplayArgs, config: DetectionConfig) -> Result<()> {
    let store = open_store(&args, &config).await?;
    let mut dispatcher = Dispatcher::new();
    register_all(&mut dispatcher, store.clone(), &config)?;

    let raw = fs::read_to_string(&args.events)
        .with_context(|| format!("Failed to read {}", args.events.display()))?;
    let mut events = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DomainEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(line = line_no + 1, error = %e, "Skipping malformed event"),
        }
    }
    events.sort_by_key(|e| e.timestamp);

    let mut total = 0usize;
    for event in &events {
        if let Some(user_id) = event.payload_str(&["sender_id", "user_id", "client_id"]) {
            let activity = ActivityRecord {
                user_id,
                event_type: event.event_type.to_string(),
                created_at: event.timestamp,
            };
            if let Err(e) = store.record_activity(&activity).await {
                warn!(event_id = %event.id, error = %e, "Failed to record activity");
            }
        }

        for report in dispatcher.dispatch(event).await {
            for signal in &report.signals {
                total += 1;
                println!(
                    "{}",
                    serde_json::json!({
                        "event_id": event.id,
                        "consumer": report.consumer,
                        "signal": signal,
                    })
                );
            }
        }
    }

    info!(events = events.len(), signals = total, "Replay finished");
    Ok(())
}

fn scan(text: &str, config: &DetectionConfig) -> Result<()> {
    let scanner = TextScanner::from_config(config)?;
    let analysis = scanner.scan(text);
    let origin = MessageOrigin {
        event_id: "scan",
        message_id: "scan",
        at: Utc::now(),
    };
    let signals = synthesize(&origin, &analysis, &ConversationContext::default());
    let output = serde_json::json!({
        "analysis": analysis,
        "signals": signals,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
