use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use postmark_kernel::{DedupStore, RetentionPolicy};

/// Postmark dedup store CLI
#[derive(Parser, Debug)]
#[command(name = "postmark")]
#[command(about = "Inspect and maintain an aggregator dedup store", long_about = None)]
struct Cli {
    /// Path to the store file
    #[arg(long, env = "POSTMARK_STATE_FILE", default_value = "data/state.json")]
    state: PathBuf,

    /// Path to retention policy JSON
    #[arg(long)]
    retention: Option<PathBuf>,

    /// Override the retention window in days
    #[arg(long)]
    max_age_days: Option<u32>,

    /// Override the per-source record cap
    #[arg(long)]
    max_count: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show record counts and last runs
    Status {
        #[arg(long)]
        source: Option<String>,
    },

    /// Check whether a key is recorded
    Check { source: String, key: String },

    /// Record a key as posted
    Mark {
        source: String,
        key: String,
        external_ref: String,
    },

    /// Stamp the last run of a source with the current time
    Touch { source: String },

    /// List recorded keys of a source
    Keys { source: String },

    /// Apply retention now
    Evict {
        #[arg(long)]
        source: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct SourceStatus {
    source: String,
    posted: usize,
    last_run: Option<DateTime<Utc>>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // ----------------------------
    // Load retention policy
    // ----------------------------
    let mut policy = if let Some(path) = &cli.retention {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading retention policy {}", path.display()))?;
        serde_json::from_str::<RetentionPolicy>(&data)?
    } else {
        RetentionPolicy::default()
    };
    if let Some(days) = cli.max_age_days {
        policy.max_age_days = days;
    }
    if let Some(count) = cli.max_count {
        policy.max_count = count;
    }
    policy.validate()?;

    // ----------------------------
    // Open store
    // ----------------------------
    let mut store = DedupStore::open(&cli.state, policy)
        .with_context(|| format!("opening store {}", cli.state.display()))?;

    // ----------------------------
    // Run command
    // ----------------------------
    let output = match cli.command {
        Command::Status { source } => {
            let sources = match source {
                Some(source) => vec![source],
                None => store.source_ids(),
            };
            let report: Vec<SourceStatus> = sources
                .into_iter()
                .map(|source| SourceStatus {
                    posted: store.posted_count(&source),
                    last_run: store.last_run(&source),
                    source,
                })
                .collect();
            serde_json::to_value(report)?
        }
        Command::Check { source, key } => {
            serde_json::json!({ "posted": store.is_posted(&source, &key) })
        }
        Command::Mark {
            source,
            key,
            external_ref,
        } => {
            if store.is_posted(&source, &key) {
                tracing::warn!(%source, %key, "key already recorded, appending anyway");
            }
            store.mark_posted(&source, &key, &external_ref)?;
            serde_json::json!({ "posted": true, "count": store.posted_count(&source) })
        }
        Command::Touch { source } => {
            let now = store.now();
            store.update_last_run(&source, now)?;
            serde_json::json!({ "source": source, "last_run": now })
        }
        Command::Keys { source } => serde_json::to_value(store.posted_keys(&source))?,
        Command::Evict { source } => {
            let removed = match source {
                Some(source) => store.evict(&source)?,
                None => store.evict_all()?,
            };
            serde_json::json!({ "removed": removed })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
