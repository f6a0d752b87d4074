//! Runtime configuration loaded from the environment, and logger setup.
use figment::{providers::Env, Figment};
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    auditor::AuditStrategy,
    engine::HeaderStrategy,
    error::FetchError,
    retry::{Backoff, BackoffKind, RetryPolicy},
    rpc::HttpTransport,
};

/// Environment variable prefix, e.g. `BACKFILL_RPC_URL`.
pub const ENV_PREFIX: &str = "BACKFILL_";

fn default_db_path() -> PathBuf {
    PathBuf::from("./chain_backfill.sqlite")
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_retry_delay_secs() -> u64 {
    60
}
fn default_max_delay_secs() -> u64 {
    600
}
fn default_concurrency() -> usize {
    1
}
fn default_progress_buffer() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Everything the binary needs to build a client, a store and an engine.
#[derive(Clone, Debug, Deserialize)]
pub struct BackfillConfig {
    /// JSON-RPC endpoint.
    pub rpc_url: String,
    /// Sent as a bearer token when set.
    #[serde(default)]
    pub rpc_token: Option<String>,
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// First (or only) delay between attempts.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Total attempts per request; unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Delay shape between attempts.
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Ceiling for exponential backoff.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Heights fetched at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Progress channel capacity.
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,
    /// How missing heights are computed.
    #[serde(default)]
    pub audit_strategy: AuditStrategy,
    /// How header hashes are resolved.
    #[serde(default)]
    pub header_strategy: HeaderStrategy,
    /// Fallback filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines.
    #[serde(default)]
    pub log_json: bool,
}

impl BackfillConfig {
    /// Load `.env` (if any), then read `BACKFILL_*` variables.
    pub fn load() -> Result<Self, figment::Error> {
        dotenvy::dotenv().ok();
        Self::from_figment(Figment::new().join(Env::prefixed(ENV_PREFIX)))
    }

    /// Extract from an arbitrary figment (tests, layered sources).
    pub fn from_figment(figment: Figment) -> Result<Self, figment::Error> {
        figment.extract()
    }

    /// Retry policy described by the config.
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.retry_delay_secs);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(delay),
            BackoffKind::Exponential => Backoff::Exponential {
                initial: delay,
                max: Duration::from_secs(self.max_delay_secs),
            },
        };
        match self.max_attempts {
            Some(n) => RetryPolicy::bounded(n, backoff),
            None => RetryPolicy::unbounded(backoff),
        }
    }

    /// HTTP transport for the configured endpoint.
    pub fn transport(&self) -> Result<HttpTransport, FetchError> {
        HttpTransport::new(
            self.rpc_url.clone(),
            self.rpc_token.clone(),
            Duration::from_secs(self.request_timeout_secs),
        )
    }
}

/// Install the global tracing subscriber.
pub fn init_logger(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.event_format(fmt::format::json()).init();
    } else {
        builder.init();
    }
}
