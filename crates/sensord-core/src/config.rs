use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOOKAHEAD_MULTIPLIER: i64 = 10;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10; // minimum-duration polling while waiting for a tick
pub const DEFAULT_MAX_TASK_QUEUE: usize = 50; // upcoming tasks exposed for inspection
pub const DEFAULT_MAX_TASK_RESULTS: usize = 100; // results kept per schedule entry
pub const DEFAULT_MAX_DETAIL_LEN: usize = 512;
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 3;
pub const DEFAULT_RESULT_BASE_URL: &str = "http://localhost/api/v1";

/// Top-level config (sensord.toml + SENSORD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensordConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    /// Create the directory holding the database file if it does not exist yet.
    pub fn ensure_parent_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Tuning knobs for the scheduler loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// The upcoming queue looks ahead `lookahead_multiplier` times the
    /// shortest active interval.
    #[serde(default = "default_lookahead_multiplier")]
    pub lookahead_multiplier: i64,
    /// Sleep between clock checks while waiting for the next tick.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum number of upcoming tasks returned by an inspection snapshot.
    #[serde(default = "default_max_task_queue")]
    pub max_task_queue: usize,
    /// Results kept per schedule entry; the oldest are pruned first.
    #[serde(default = "default_max_task_results")]
    pub max_task_results: usize,
    /// Task result detail strings are truncated to this many characters.
    #[serde(default = "default_max_detail_len")]
    pub max_detail_len: usize,
    /// Stop the scheduler after this many back-to-back task failures.
    /// Unset disables the breaker.
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
    /// Removed when a blocking run starts, touched if the scheduler dies.
    #[serde(default)]
    pub healthcheck_file: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead_multiplier: DEFAULT_LOOKAHEAD_MULTIPLIER,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_task_queue: DEFAULT_MAX_TASK_QUEUE,
            max_task_results: DEFAULT_MAX_TASK_RESULTS,
            max_detail_len: DEFAULT_MAX_DETAIL_LEN,
            max_consecutive_failures: None,
            healthcheck_file: None,
        }
    }
}

/// Outbound task-result callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_callback_timeout_secs")]
    pub timeout_secs: u64,
    /// Disable only for lab setups with self-signed receivers.
    #[serde(default = "bool_true")]
    pub verify_ssl: bool,
    /// Extra PEM root certificate trusted for callback receivers.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Sent as `Authorization: Token <value>` when set.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Finalise results and POST callbacks on a spawned task.
    #[serde(default)]
    pub asynchronous: bool,
    /// Prefix for the self-referential `url` field of a posted result.
    #[serde(default = "default_result_base_url")]
    pub result_base_url: String,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_CALLBACK_TIMEOUT_SECS,
            verify_ssl: true,
            ca_cert_path: None,
            auth_token: None,
            asynchronous: false,
            result_base_url: default_result_base_url(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_lookahead_multiplier() -> i64 {
    DEFAULT_LOOKAHEAD_MULTIPLIER
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_max_task_queue() -> usize {
    DEFAULT_MAX_TASK_QUEUE
}
fn default_max_task_results() -> usize {
    DEFAULT_MAX_TASK_RESULTS
}
fn default_max_detail_len() -> usize {
    DEFAULT_MAX_DETAIL_LEN
}
fn default_callback_timeout_secs() -> u64 {
    DEFAULT_CALLBACK_TIMEOUT_SECS
}
fn default_result_base_url() -> String {
    DEFAULT_RESULT_BASE_URL.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.sensord/sensord.db", home)
}

impl SensordConfig {
    /// Load config from a TOML file with SENSORD_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `SENSORD_CALLBACK__TIMEOUT_SECS=5`. A missing file is not an error;
    /// every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading configuration");

        let config: SensordConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SENSORD_").split("__"))
            .extract()
            .map_err(|e| crate::error::SensordError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.sensord/sensord.toml", home)
}
