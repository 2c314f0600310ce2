mod config;
mod models;
mod pipeline;
mod provider;
mod retry;
mod status;
mod store;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{AppConfig, ProviderKind};
use crate::pipeline::{Pipeline, PipelineStats, StopReason};
use crate::retry::RetryPolicy;
use crate::status::StatusReport;
use crate::store::{DatasetStore, StoreLock};

#[derive(Parser)]
#[command(
    name = "dearrow-enrich",
    about = "Enrich the deArrow dataset with YouTube video statistics",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch statistics for every video that still lacks them (resumable)
    Enrich {
        /// Dataset CSV (default: store.path from config)
        #[arg(short, long)]
        file: Option<PathBuf>,

        #[arg(long, value_enum)]
        provider: Option<ProviderKind>,

        /// YouTube Data API key
        #[arg(long, env = "YOUTUBE_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        #[arg(long)]
        min_delay_ms: Option<u64>,

        #[arg(long)]
        max_delay_ms: Option<u64>,

        /// Successful resolutions between checkpoints
        #[arg(long)]
        checkpoint_every: Option<usize>,

        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long)]
        backoff_base_ms: Option<u64>,

        #[arg(long)]
        backoff_multiplier: Option<f64>,

        /// Identifiers per API request (1-50)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Seconds to wait after printing the estimate, before the first request
        #[arg(long)]
        start_delay_secs: Option<u64>,
    },

    /// Show how much of the dataset is enriched
    Status {
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Print the first N pending rows
        #[arg(long, default_value_t = 0)]
        sample: usize,
    },

    /// Rewrite float-coerced counts ("1234.0") as integers
    Normalize {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "dearrow_enricher=info,warn",
        1 => "dearrow_enricher=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let mut config = AppConfig::load()?;

    match cli.command {
        Command::Enrich {
            file,
            provider: provider_kind,
            api_key,
            min_delay_ms,
            max_delay_ms,
            checkpoint_every,
            max_retries,
            backoff_base_ms,
            backoff_multiplier,
            batch_size,
            start_delay_secs,
        } => {
            if let Some(v) = file {
                config.store.path = v;
            }
            if let Some(v) = provider_kind {
                config.provider.kind = v;
            }
            if let Some(v) = api_key.filter(|k| !k.trim().is_empty()) {
                config.provider.api_key = Some(v);
            }
            if let Some(v) = min_delay_ms {
                config.pipeline.min_delay_ms = v;
                // a lone --min-delay-ms means a fixed interval
                if max_delay_ms.is_none() && config.pipeline.max_delay_ms < v {
                    config.pipeline.max_delay_ms = v;
                }
            }
            if let Some(v) = max_delay_ms {
                config.pipeline.max_delay_ms = v;
            }
            if let Some(v) = checkpoint_every {
                config.pipeline.checkpoint_every = v;
            }
            if let Some(v) = max_retries {
                config.retry.max_retries = v;
            }
            if let Some(v) = backoff_base_ms {
                config.retry.backoff_base_ms = v;
            }
            if let Some(v) = backoff_multiplier {
                config.retry.backoff_multiplier = v;
            }
            if let Some(v) = batch_size {
                config.provider.batch_size = v;
            }
            if let Some(v) = start_delay_secs {
                config.pipeline.start_delay_secs = v;
            }
            config.validate()?;

            let _t = utils::Timer::start("Enrichment run");
            let _lock = acquire_lock(&config)?;
            let mut store = DatasetStore::open(&config.store.path, config.store.scan_window)?;
            info!("Dataset: {:?}", store.path());

            let provider = provider::build_provider(&config.provider)?;
            let retry = RetryPolicy::from_config(&config.retry);
            info!(
                "Provider: {} (batch {}), retries: {}",
                provider.name(),
                provider.batch_size(),
                retry.max_retries()
            );

            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = cancel_tx.send(true);
            });

            let stats = Pipeline::new(config.pipeline.clone(), retry, provider)
                .run(&mut store, cancel_rx)
                .await?;
            print_summary(&stats);

            match stats.stop {
                StopReason::Completed => {}
                StopReason::Interrupted => {
                    info!("Interrupted: progress saved, run the same command to resume");
                }
                StopReason::Blocked(reason) => {
                    warn!("The provider refused further requests: {}", reason);
                    warn!(
                        "Progress is saved. Wait for the quota/IP block to lift, or switch with --provider, then re-run"
                    );
                    anyhow::bail!("Run stopped early: provider blocked ({})", reason);
                }
            }
        }

        Command::Status { file, sample } => {
            let path = file.unwrap_or(config.store.path);
            let _t = utils::Timer::start("Status scan");
            let store = DatasetStore::open(&path, config.store.scan_window)?;
            let report = StatusReport::collect(&store, sample)?;
            println!("  Dataset: {}", path.display());
            report.print();
            if report.is_complete() {
                println!("Nothing left to enrich.");
            }
        }

        Command::Normalize { file } => {
            if let Some(v) = file {
                config.store.path = v;
            }
            let _t = utils::Timer::start("Count normalization");
            let _lock = acquire_lock(&config)?;
            let store = DatasetStore::open(&config.store.path, config.store.scan_window)?;
            let rows = store.normalize_counts()?;
            println!("Normalized counts in {} rows.", utils::fmt_number(rows as i64));
        }
    }

    Ok(())
}

fn acquire_lock(config: &AppConfig) -> Result<Option<StoreLock>> {
    if config.store.lock {
        StoreLock::acquire(&config.store.path).map(Some)
    } else {
        Ok(None)
    }
}

fn print_summary(stats: &PipelineStats) {
    let outcome = match &stats.stop {
        StopReason::Completed => "completed".to_string(),
        StopReason::Interrupted => "interrupted".to_string(),
        StopReason::Blocked(_) => "blocked".to_string(),
    };

    println!("─────────────────────────────────────────");
    println!("  deArrow enrichment — Run summary");
    println!("─────────────────────────────────────────");
    println!("  Outcome     : {}", outcome);
    println!("  Pending     : {}", utils::fmt_number(stats.total as i64));
    println!("  Processed   : {}", utils::fmt_number(stats.processed as i64));
    println!("  Resolved    : {}", utils::fmt_number(stats.resolved as i64));
    println!("  Unavailable : {}", utils::fmt_number(stats.failed as i64));
    println!("  Checkpoints : {}", stats.flushes);
    println!("  Remaining   : {}", utils::fmt_number(stats.remaining as i64));
    println!("  Elapsed     : {}", utils::fmt_duration(stats.elapsed));
    println!("─────────────────────────────────────────");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, saving progress before exit"),
        _ = terminate => info!("Received SIGTERM, saving progress before exit"),
    }
}
