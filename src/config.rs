//! Configuration management for the postback reconciliation service.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use postback_reconcile::{
    client::ClientConfig,
    gateway::{GatewayConfig, GatewayEndpoint},
    pool::PoolConfig,
    MAX_RETRY_CEILING,
    provider::{LANGUAGE_ENGLISH, LANGUAGE_PORTUGUESE},
    ReconcileConfig, ScheduleConfig,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "postback.toml";

/// Prefix for service-specific environment variables.
const ENV_PREFIX: &str = "POSTBACK_";

/// Time kept free after a provider call for writing its outcome.
const STORAGE_SLACK_SECONDS: u64 = 5;

/// Default log filter when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_FILTER: &str = "info,postback=debug";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority): `POSTBACK_<FIELD>` for every
///    field, plus the conventional `DATABASE_URL` and `RUST_LOG`
/// 2. Configuration file (`postback.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    #[serde(default = "default_min_connections")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    #[serde(default = "default_acquire_timeout")]
    pub database_connection_timeout: u64,

    // Reconciliation
    /// Retry ceiling for errored requests.
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    /// Requests per tracking page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Tracking poll interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Retry pass interval in seconds.
    #[serde(default = "default_reprocess_interval")]
    pub reprocess_interval_seconds: u64,
    /// Reverse follow-up interval in seconds.
    #[serde(default = "default_follow_interval")]
    pub follow_interval_seconds: u64,

    // Dispatch
    /// Timeout for one requester callback in seconds.
    #[serde(default = "default_notification_timeout")]
    pub notification_timeout_seconds: u64,
    /// Deadline for one retry or callback task in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u64,
    /// Retries and callbacks running at once.
    #[serde(default = "default_dispatcher_concurrency")]
    pub dispatcher_concurrency: usize,
    /// Time allowed for in-flight work at shutdown in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    // Provider gateway
    /// Tracking service URL.
    #[serde(default = "default_tracking_url")]
    pub tracking_url: String,
    /// Tracking service user.
    #[serde(default)]
    pub tracking_user: String,
    /// Tracking service password.
    #[serde(default)]
    pub tracking_password: String,
    /// Reverse-logistics service base URL.
    #[serde(default = "default_reverse_url")]
    pub reverse_url: String,
    /// Reverse-logistics service user.
    #[serde(default)]
    pub reverse_user: String,
    /// Reverse-logistics service password.
    #[serde(default)]
    pub reverse_password: String,
    /// Timeout for one gateway call in seconds.
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_seconds: u64,
    /// Language code for tracking event descriptions.
    #[serde(default = "default_tracking_language")]
    pub tracking_language: String,
    /// Default callback sent with tracking queries.
    #[serde(default)]
    pub tracking_callback: Option<String>,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::raw().only(&["database_url", "rust_log"]))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the engine configuration.
    pub fn to_reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            max_retries: self.max_retries,
            page_size: self.page_size,
            tracking_language: self.tracking_language.clone(),
            tracking_callback: self.tracking_callback.clone(),
            pool: PoolConfig {
                concurrency: self.dispatcher_concurrency,
                task_timeout: Duration::from_secs(self.task_timeout_seconds),
            },
        }
    }

    /// Convert to job intervals.
    pub fn to_schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            reprocess_interval: Duration::from_secs(self.reprocess_interval_seconds),
            follow_interval: Duration::from_secs(self.follow_interval_seconds),
        }
    }

    /// Convert to callback client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.notification_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Convert to provider gateway configuration.
    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            tracking: GatewayEndpoint {
                url: self.tracking_url.clone(),
                username: self.tracking_user.clone(),
                password: self.tracking_password.clone(),
            },
            reverse: GatewayEndpoint {
                url: self.reverse_url.clone(),
                username: self.reverse_user.clone(),
                password: self.reverse_password.clone(),
            },
            timeout: Duration::from_secs(self.provider_timeout_seconds),
        }
    }

    /// Time allowed for in-flight work at shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                if !self.database_url[colon_pos + 1..].starts_with("//") {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if !(0..=MAX_RETRY_CEILING).contains(&self.max_retries) {
            anyhow::bail!("max_retries must be between 0 and {MAX_RETRY_CEILING}");
        }

        if self.page_size == 0 {
            anyhow::bail!("page_size must be greater than 0");
        }

        if self.poll_interval_seconds == 0
            || self.reprocess_interval_seconds == 0
            || self.follow_interval_seconds == 0
        {
            anyhow::bail!("job intervals must be greater than 0");
        }

        if self.dispatcher_concurrency == 0 {
            anyhow::bail!("dispatcher_concurrency must be greater than 0");
        }

        if self.notification_timeout_seconds == 0 || self.task_timeout_seconds == 0 {
            anyhow::bail!("notification and task timeouts must be greater than 0");
        }

        if self.provider_timeout_seconds == 0 {
            anyhow::bail!("provider_timeout_seconds must be greater than 0");
        }

        // A provider retry must fail on its own HTTP timeout and still have
        // time to record the failure before the task deadline.
        if self.task_timeout_seconds
            < self.provider_timeout_seconds.saturating_add(STORAGE_SLACK_SECONDS)
        {
            anyhow::bail!(
                "task_timeout_seconds must be at least provider_timeout_seconds + \
                 {STORAGE_SLACK_SECONDS}"
            );
        }

        for (name, url) in [("tracking_url", &self.tracking_url), ("reverse_url", &self.reverse_url)]
        {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("{name} must be an http or https URL");
            }
        }

        if ![LANGUAGE_PORTUGUESE, LANGUAGE_ENGLISH].contains(&self.tracking_language.as_str()) {
            anyhow::bail!(
                "tracking_language must be {LANGUAGE_PORTUGUESE} (Portuguese) or \
                 {LANGUAGE_ENGLISH} (English)"
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            max_retries: default_max_retries(),
            page_size: default_page_size(),
            poll_interval_seconds: default_poll_interval(),
            reprocess_interval_seconds: default_reprocess_interval(),
            follow_interval_seconds: default_follow_interval(),
            notification_timeout_seconds: default_notification_timeout(),
            task_timeout_seconds: default_task_timeout(),
            dispatcher_concurrency: default_dispatcher_concurrency(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            tracking_url: default_tracking_url(),
            tracking_user: String::new(),
            tracking_password: String::new(),
            reverse_url: default_reverse_url(),
            reverse_user: String::new(),
            reverse_password: String::new(),
            provider_timeout_seconds: default_provider_timeout(),
            tracking_language: default_tracking_language(),
            tracking_callback: None,
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/postback".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_max_retries() -> i32 {
    postback_reconcile::DEFAULT_MAX_RETRIES
}

fn default_page_size() -> usize {
    postback_reconcile::DEFAULT_PAGE_SIZE
}

fn default_poll_interval() -> u64 {
    30 * 60
}

fn default_reprocess_interval() -> u64 {
    20 * 60
}

fn default_follow_interval() -> u64 {
    6 * 60 * 60
}

fn default_notification_timeout() -> u64 {
    postback_reconcile::DEFAULT_NOTIFICATION_TIMEOUT_SECONDS
}

fn default_task_timeout() -> u64 {
    postback_reconcile::DEFAULT_TASK_TIMEOUT_SECONDS
}

fn default_dispatcher_concurrency() -> usize {
    postback_reconcile::DEFAULT_DISPATCH_CONCURRENCY
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_tracking_url() -> String {
    "http://localhost:8081/tracking".to_string()
}

fn default_reverse_url() -> String {
    "http://localhost:8081/reverse".to_string()
}

fn default_provider_timeout() -> u64 {
    30
}

fn default_tracking_language() -> String {
    LANGUAGE_PORTUGUESE.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
