//! dynfwd - dynamic firewall daemon.
//!
//! Keeps a durable set of block intents in sync with a dedicated packet
//! filter chain, learns new blocks from authentication failures in a
//! followed log, and exposes the whole thing over an HTTP API.

mod config;
mod db;
mod detector;
mod engine;
mod error;
mod firewall;
mod http;
mod metrics;
mod scan;

use crate::config::Config;
use crate::db::Database;
use crate::detector::ThresholdDetector;
use crate::detector::tail::LogTail;
use crate::engine::Reconciler;
use crate::firewall::{IptablesBackend, RuleBackend};
use crate::http::ApiState;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first; the log file layer depends on it. A missing
    // file is fine (all defaults), a malformed one is not.
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = if Path::new(&config_path).exists() {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    init_tracing(config.api.log_path.as_deref())?;
    info!(config = %config_path, "Starting dynfwd");

    metrics::init();

    // Initialize database
    let db = Database::new(&config.database.path).await?;

    // The chain must exist before anything else runs; without it every
    // block is a silent no-op, so failure here is fatal.
    let backend = Arc::new(IptablesBackend::new(&config.firewall));
    backend
        .ensure_chain()
        .await
        .map_err(|e| anyhow::anyhow!("failed to prepare filter chain: {e}"))?;
    info!(chain = %config.firewall.chain, "filter chain ready");

    let reconciler = Arc::new(Reconciler::new(
        backend,
        db,
        config.firewall.default_comment.clone(),
    ));

    // Converge the live rule set with whatever the store holds from the
    // previous run before accepting new work.
    match reconciler.reconcile_orphans().await {
        Ok(outcome) => info!(
            orphan_rules_removed = outcome.orphan_rules_removed,
            intents_reapplied = outcome.intents_reapplied,
            "startup reconciliation completed"
        ),
        Err(e) => warn!(error = %e, "startup reconciliation failed"),
    }

    // Expiry sweep task
    {
        let reconciler = Arc::clone(&reconciler);
        let interval_secs = config.sweep.interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                match reconciler.sweep_expired(chrono::Utc::now().timestamp()).await {
                    Ok(outcome) if outcome.removed > 0 => {
                        info!(removed = outcome.removed, "expired blocks swept");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "expiry sweep failed"),
                }
            }
        });
    }

    // Periodic orphan reconciliation task
    {
        let reconciler = Arc::clone(&reconciler);
        let interval_secs = config.sweep.orphan_interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            // the startup pass already ran
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = reconciler.reconcile_orphans().await {
                    warn!(error = %e, "orphan reconciliation failed");
                }
            }
        });
    }

    // Threshold detector task
    if config.detector.enabled {
        if let Some(log_path) = config.detector.log_path.clone() {
            let detector_config = config.detector.clone();
            let sink = Arc::clone(&reconciler);
            tokio::spawn(async move {
                let poll = Duration::from_millis(detector_config.poll_interval_ms);
                let tail = match LogTail::open(Path::new(&log_path), poll).await {
                    Ok(tail) => tail,
                    Err(e) => {
                        error!(path = %log_path, error = %e, "failed to open detector log");
                        return;
                    }
                };
                let detector = ThresholdDetector::new(detector_config, sink);
                if let Err(e) = detector.run(tail).await {
                    error!(path = %log_path, error = %e, "detector stopped");
                }
            });
        } else {
            warn!("detector enabled but [detector].log_path is not set; skipping");
        }
    }

    // HTTP API (runs on the main task)
    let state = Arc::new(ApiState {
        reconciler,
        token: config.api.token.clone(),
        scan: config.scan.clone(),
    });
    http::run_http_server(config.api.bind, state).await?;

    Ok(())
}

/// Initialize tracing to stderr, optionally teeing into an append-only file.
fn init_tracing(log_path: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    match log_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
    }
    Ok(())
}
