//! Configuration loader for the `safehaven-alerts` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::evaluator::TieBreak;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional float environment variable with a default value.
macro_rules! parse_env_f64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<f64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional boolean environment variable with a default value.
macro_rules! parse_env_bool {
    ($var_name:expr, $default:expr) => {
        match env::var($var_name).ok().as_deref() {
            None => $default,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => bail!("Invalid {}: expected true/false, got '{}'", $var_name, other),
        }
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Where rules, alerts and logs are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    pub storage: StorageBackend,

    /// PostgreSQL connection string; required for the postgres backend.
    pub db_url: Option<String>,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// HTTP listen port.
    pub listen_port: u16,

    /// Cooldown applied to rules without their own override.
    pub alert_cooldown_minutes: u32,

    /// Edge length of a deduplication grid cell.
    pub location_grid_km: f64,

    /// Upper bound on any single store call.
    pub persist_timeout_ms: u32,

    /// Capacity of the ingest queue.
    pub ingest_queue_capacity: u32,

    /// Maximum concurrent evaluations.
    pub ingest_workers: u32,

    /// Winner among equally severe matches.
    pub rule_tie_break: TieBreak,

    /// Insert the default rules when the rule table is empty.
    pub seed_default_rules: bool,

    /// Optional weather/seismic feed to poll.
    pub feed_url: Option<String>,

    /// Seconds between feed polls.
    pub feed_poll_secs: u32,

    /// Maximum feed pages fetched per poll (safety limit).
    pub feed_max_pages: u32,

    /// Upper bound on a single feed page request.
    pub feed_timeout_secs: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageBackend::Memory,
            db_url: None,
            db_pool_max: 5,
            listen_port: 8080,
            alert_cooldown_minutes: 60,
            location_grid_km: 10.0,
            persist_timeout_ms: 5000,
            ingest_queue_capacity: 1024,
            ingest_workers: 4,
            rule_tie_break: TieBreak::NewestRule,
            seed_default_rules: true,
            feed_url: None,
            feed_poll_secs: 60,
            feed_max_pages: 100,
            feed_timeout_secs: 30,
        }
    }
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string (postgres backend only)
///
/// Optional:
/// - `STORAGE_BACKEND` – `postgres` or `memory` (default: postgres)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `LISTEN_PORT` – HTTP port (default: 8080)
/// - `ALERT_COOLDOWN_MINUTES` – default dedup window (default: 60)
/// - `LOCATION_GRID_KM` – dedup grid cell size (default: 10)
/// - `PERSIST_TIMEOUT_MS` – store call timeout (default: 5000)
/// - `INGEST_QUEUE_CAPACITY` – queued readings (default: 1024)
/// - `INGEST_WORKERS` – concurrent evaluations (default: 4)
/// - `RULE_TIE_BREAK` – `newest` or `oldest` rule wins a severity tie (default: newest)
/// - `SEED_DEFAULT_RULES` – seed an empty rule table (default: true)
/// - `FEED_URL` – reading feed to poll (default: unset)
/// - `FEED_POLL_SECS` – feed poll interval (default: 60)
/// - `FEED_MAX_PAGES` – max feed pages per poll (default: 100)
/// - `FEED_TIMEOUT_SECS` – per-request feed timeout (default: 30)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let storage = match env::var("STORAGE_BACKEND").ok().as_deref() {
        None | Some("postgres") => StorageBackend::Postgres,
        Some("memory") => StorageBackend::Memory,
        Some(other) => bail!("Invalid STORAGE_BACKEND: '{}'", other),
    };
    let db_url = match storage {
        StorageBackend::Postgres => Some(require_env!("DATABASE_URL")),
        StorageBackend::Memory => env::var("DATABASE_URL").ok(),
    };

    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let listen_port = u16::try_from(parse_env_u32!("LISTEN_PORT", 8080))
        .map_err(|e| anyhow!("Invalid LISTEN_PORT: {}", e))?;
    let alert_cooldown_minutes = parse_env_u32!("ALERT_COOLDOWN_MINUTES", 60);
    let location_grid_km = parse_env_f64!("LOCATION_GRID_KM", 10.0);
    let persist_timeout_ms = parse_env_u32!("PERSIST_TIMEOUT_MS", 5000);
    let ingest_queue_capacity = parse_env_u32!("INGEST_QUEUE_CAPACITY", 1024);
    let ingest_workers = parse_env_u32!("INGEST_WORKERS", 4);
    let rule_tie_break = match env::var("RULE_TIE_BREAK") {
        Ok(v) => v
            .parse::<TieBreak>()
            .map_err(|e| anyhow!("Invalid RULE_TIE_BREAK: {}", e))?,
        Err(_) => TieBreak::default(),
    };
    let seed_default_rules = parse_env_bool!("SEED_DEFAULT_RULES", true);
    let feed_url = env::var("FEED_URL").ok().filter(|u| !u.trim().is_empty());
    let feed_poll_secs = parse_env_u32!("FEED_POLL_SECS", 60);
    let feed_max_pages = parse_env_u32!("FEED_MAX_PAGES", 100);
    let feed_timeout_secs = parse_env_u32!("FEED_TIMEOUT_SECS", 30);

    if !(location_grid_km.is_finite() && location_grid_km > 0.0) {
        bail!("Invalid LOCATION_GRID_KM: must be a positive number");
    }
    if alert_cooldown_minutes == 0 {
        bail!("Invalid ALERT_COOLDOWN_MINUTES: must be positive");
    }
    if persist_timeout_ms == 0 || ingest_workers == 0 || ingest_queue_capacity == 0 {
        bail!("PERSIST_TIMEOUT_MS, INGEST_WORKERS and INGEST_QUEUE_CAPACITY must be positive");
    }
    if feed_poll_secs == 0 || feed_timeout_secs == 0 {
        bail!("FEED_POLL_SECS and FEED_TIMEOUT_SECS must be positive");
    }

    Ok(Config {
        storage,
        db_url,
        db_pool_max,
        listen_port,
        alert_cooldown_minutes,
        location_grid_km,
        persist_timeout_ms,
        ingest_queue_capacity,
        ingest_workers,
        rule_tie_break,
        seed_default_rules,
        feed_url,
        feed_poll_secs,
        feed_max_pages,
        feed_timeout_secs,
    })
}

impl Config {
    // ---
    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.persist_timeout_ms))
    }

    pub fn default_cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.alert_cooldown_minutes))
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        let masked_db_url = self
            .db_url
            .as_deref()
            .map(mask_db_url)
            .unwrap_or_else(|| "<unset>".to_string());

        tracing::info!("Configuration loaded:");
        tracing::info!("  STORAGE_BACKEND        : {:?}", self.storage);
        tracing::info!("  DATABASE_URL           : {}", masked_db_url);
        tracing::info!("  DB_POOL_MAX            : {}", self.db_pool_max);
        tracing::info!("  LISTEN_PORT            : {}", self.listen_port);
        tracing::info!("  ALERT_COOLDOWN_MINUTES : {}", self.alert_cooldown_minutes);
        tracing::info!("  LOCATION_GRID_KM       : {}", self.location_grid_km);
        tracing::info!("  PERSIST_TIMEOUT_MS     : {}", self.persist_timeout_ms);
        tracing::info!("  INGEST_QUEUE_CAPACITY  : {}", self.ingest_queue_capacity);
        tracing::info!("  INGEST_WORKERS         : {}", self.ingest_workers);
        tracing::info!("  RULE_TIE_BREAK         : {}", self.rule_tie_break);
        tracing::info!("  SEED_DEFAULT_RULES     : {}", self.seed_default_rules);
        tracing::info!(
            "  FEED_URL               : {}",
            self.feed_url.as_deref().unwrap_or("<unset>")
        );
        tracing::info!("  FEED_POLL_SECS         : {}", self.feed_poll_secs);
        tracing::info!("  FEED_MAX_PAGES         : {}", self.feed_max_pages);
        tracing::info!("  FEED_TIMEOUT_SECS      : {}", self.feed_timeout_secs);
    }
}

/// Mask the password in a database URL.
fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            // `postgres://host@...` has its only colon in the scheme
            if !db_url[colon_pos..].starts_with("://") {
                return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
            }
        }
    }
    db_url.to_string()
}
