//! Application entry point for the `safehaven-alerts` service.
//!
//! Startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Connecting to PostgreSQL and applying migrations (postgres backend)
//! - Seeding the default rule set into an empty rule table
//! - Starting the ingest dispatcher and, when `FEED_URL` is set, the feed poller
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Serving until Ctrl-C, then draining in-flight evaluations
//!
//! # Environment Variables
//! See [`config::load_from_env`] for the service settings. Logging is
//! controlled separately:
//! - `SAFEHAVEN_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `SAFEHAVEN_SPAN_EVENTS` (optional) – span event mode for tracing
use std::{env, io::IsTerminal, net::SocketAddr, time::Duration};

use anyhow::Result;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use safehaven_alerts::config::{self, StorageBackend};
use safehaven_alerts::feed::FeedPoller;
use safehaven_alerts::store::Backend;
use safehaven_alerts::{app, routes, schema, seed};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let backend = match (cfg.storage, cfg.db_url.as_deref()) {
        (StorageBackend::Postgres, Some(db_url)) => {
            tracing::info!("Attempting to connect to database");
            let pool = PgPoolOptions::new()
                .max_connections(cfg.db_pool_max)
                .connect(db_url)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
            tracing::info!("Successfully connected to database");

            schema::run_migrations(&pool).await?;
            Backend::postgres(pool)
        }
        (StorageBackend::Postgres, None) => anyhow::bail!("DATABASE_URL must be set for postgres"),
        (StorageBackend::Memory, _) => {
            tracing::warn!("Using in-memory storage; rules and alerts are lost on exit");
            Backend::memory()
        }
    };

    let (state, ingest_handle) = app::assemble(backend, cfg.clone());

    if cfg.seed_default_rules {
        seed::seed_default_rules(&state.rules).await?;
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let poller = match cfg.feed_url.clone() {
        Some(url) => {
            let poller = FeedPoller::new(
                url,
                cfg.feed_max_pages,
                Duration::from_secs(u64::from(cfg.feed_poll_secs)),
                Duration::from_secs(u64::from(cfg.feed_timeout_secs)),
            )?;
            Some(tokio::spawn(poller.run(state.ingester.clone(), stop_rx)))
        }
        None => None,
    };

    // Build app from routes gateway (EMBP)
    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    stop_tx.send(true).ok();
    if let Some(poller) = poller {
        poller.await.ok();
    }
    ingest_handle.shutdown().await;

    Ok(())
}

// ---

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `SAFEHAVEN_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level from `RUST_LOG`, else `SAFEHAVEN_LOG_LEVEL`
///
/// Call once at startup before any logging macros run.
fn init_tracing() {
    // ---
    let span_events = match env::var("SAFEHAVEN_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("SAFEHAVEN_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
