// ConsultX - session and risk tracking service for a support-chat product
//
// Architecture:
// - HTTP API (axum): session lifecycle, message ingestion, summaries
// - Tracker: orchestrates sentiment/risk analysis, buffers, and metrics
// - Analysis: lexicon sentiment scorer and keyword risk classifier
// - Guardrails: safety and MI-tone enforcement over candidate replies
// - Storage: SQLite (append-only message log plus derived caches)
// - Pipeline: optional external reply generator behind one trait

mod analysis;
mod api;
mod cli;
mod config;
mod guardrail;
mod models;
mod pipeline;
mod storage;
mod tracker;

use anyhow::{Context, Result};
use config::{Config, LogRotation};
use pipeline::HttpReplyPipeline;
use std::sync::Arc;
use std::time::Duration;
use storage::SessionStorage;
use tracker::{SessionTracker, TrackerOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI subcommands first (config --show etc. exit early)
    if cli::handle_cli() {
        return Ok(());
    }

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists();

    let config = Config::from_env();

    // Precedence: RUST_LOG env var > config file > default "info"
    let default_filter = format!("consultx={},tower_http=debug,axum=debug", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // The guard must be kept alive for the duration of the program so that
    // buffered file logs flush on shutdown.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard> =
        if config.logging.file_enabled {
            match std::fs::create_dir_all(&config.logging.file_dir) {
                Err(e) => {
                    eprintln!(
                        "Warning: Could not create log directory {:?}: {}",
                        config.logging.file_dir, e
                    );
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(tracing_subscriber::fmt::layer())
                        .init();
                    None
                }
                Ok(()) => {
                    let file_appender = match config.logging.file_rotation {
                        LogRotation::Hourly => tracing_appender::rolling::hourly(
                            &config.logging.file_dir,
                            &config.logging.file_prefix,
                        ),
                        LogRotation::Daily => tracing_appender::rolling::daily(
                            &config.logging.file_dir,
                            &config.logging.file_prefix,
                        ),
                        LogRotation::Never => tracing_appender::rolling::never(
                            &config.logging.file_dir,
                            &config.logging.file_prefix,
                        ),
                    };
                    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                    // File layer uses JSON format for structured log parsing
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(tracing_subscriber::fmt::layer())
                        .with(
                            tracing_subscriber::fmt::layer()
                                .json()
                                .with_writer(non_blocking)
                                .with_ansi(false),
                        )
                        .init();
                    Some(guard)
                }
            }
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        };

    tracing::info!(db_path = %config.db_path.display(), "opening session store");
    let storage = SessionStorage::open(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;

    let options = TrackerOptions {
        buffer_size: config.buffer_size,
        rag_enabled: config.rag.enabled,
        rag_auto_reply: config.rag.auto_reply,
        rag_country_code: config.rag.country_code.clone(),
        rag_model: config.rag.model.clone(),
        rag_k: config.rag.k,
        rag_guardrails: config.rag.guardrails,
    };
    let mut tracker = SessionTracker::new(storage, options);

    match &config.rag.endpoint {
        Some(endpoint) => {
            let pipeline = HttpReplyPipeline::new(
                endpoint.clone(),
                Duration::from_secs(config.rag.timeout_secs),
            )?;
            tracker.set_pipeline(Box::new(pipeline));
            tracing::info!(endpoint, "reply pipeline configured");
        }
        None if config.rag.enabled => {
            tracing::warn!("rag enabled but no endpoint configured; turns will carry an unavailability note");
        }
        None => {}
    }

    let state = api::AppState {
        tracker: Arc::new(tracker),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        return;
    }
    tracing::info!("shutdown signal received");
}
