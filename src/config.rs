//! Runtime configuration.
//!
//! Values come from environment variables, then from an optional JSON file
//! named by `AGENTFLOW_CONFIG` whose fields take precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::llm::{FailoverConfig, ProviderKind};
use crate::queue::QueueConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub supabase_url: Option<String>,
    pub supabase_service_role_key: Option<String>,
    pub queue_poll_interval: Duration,
    pub queue_batch_size: usize,
    pub queue_default_max_retries: u32,
    /// Run distinct agents of one batch concurrently.
    pub queue_parallel: bool,
    pub provider_timeout: Duration,
    pub provider_retries: u32,
    pub provider_failure_threshold: u32,
    pub provider_cooldown: Duration,
    pub provider_order: Vec<ProviderKind>,
}

impl Default for Config {
    fn default() -> Self {
        let queue = QueueConfig::default();
        let failover = FailoverConfig::default();
        Self {
            supabase_url: None,
            supabase_service_role_key: None,
            queue_poll_interval: queue.poll_interval,
            queue_batch_size: queue.batch_size,
            queue_default_max_retries: queue.default_max_retries,
            queue_parallel: queue.parallel,
            provider_timeout: failover.timeout,
            provider_retries: failover.retries,
            provider_failure_threshold: failover.failure_threshold,
            provider_cooldown: failover.cooldown,
            provider_order: failover.order,
        }
    }
}

/// Overrides read from `AGENTFLOW_CONFIG`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    supabase_url: Option<String>,
    supabase_service_role_key: Option<String>,
    queue_poll_interval_secs: Option<u64>,
    queue_batch_size: Option<usize>,
    queue_default_max_retries: Option<u32>,
    queue_parallel: Option<bool>,
    provider_timeout_secs: Option<u64>,
    provider_retries: Option<u32>,
    provider_failure_threshold: Option<u32>,
    provider_cooldown_secs: Option<u64>,
    provider_order: Option<Vec<ProviderKind>>,
}

impl Config {
    /// Read the process environment and the optional override file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Config::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = Self {
            supabase_url: get("SUPABASE_URL"),
            supabase_service_role_key: get("SUPABASE_SERVICE_ROLE_KEY"),
            queue_poll_interval: secs(
                "QUEUE_POLL_INTERVAL_SECS",
                get("QUEUE_POLL_INTERVAL_SECS"),
                defaults.queue_poll_interval,
            )?,
            queue_batch_size: positive(
                "QUEUE_BATCH_SIZE",
                get("QUEUE_BATCH_SIZE"),
                defaults.queue_batch_size,
            )?,
            queue_default_max_retries: number(
                "QUEUE_DEFAULT_MAX_RETRIES",
                get("QUEUE_DEFAULT_MAX_RETRIES"),
                defaults.queue_default_max_retries,
            )?,
            queue_parallel: flag("QUEUE_PARALLEL", get("QUEUE_PARALLEL"), defaults.queue_parallel)?,
            provider_timeout: secs(
                "PROVIDER_TIMEOUT_SECS",
                get("PROVIDER_TIMEOUT_SECS"),
                defaults.provider_timeout,
            )?,
            provider_retries: positive(
                "PROVIDER_RETRIES",
                get("PROVIDER_RETRIES"),
                defaults.provider_retries,
            )?,
            provider_failure_threshold: positive(
                "PROVIDER_FAILURE_THRESHOLD",
                get("PROVIDER_FAILURE_THRESHOLD"),
                defaults.provider_failure_threshold,
            )?,
            provider_cooldown: secs(
                "PROVIDER_COOLDOWN_SECS",
                get("PROVIDER_COOLDOWN_SECS"),
                defaults.provider_cooldown,
            )?,
            provider_order: match get("PROVIDER_ORDER") {
                Some(raw) => parse_order(&raw)?,
                None => defaults.provider_order,
            },
        };

        if let Some(path) = get("AGENTFLOW_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if let Some(v) = file.supabase_url {
            self.supabase_url = Some(v);
        }
        if let Some(v) = file.supabase_service_role_key {
            self.supabase_service_role_key = Some(v);
        }
        if let Some(v) = file.queue_poll_interval_secs {
            self.queue_poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.queue_batch_size {
            self.queue_batch_size = v;
        }
        if let Some(v) = file.queue_default_max_retries {
            self.queue_default_max_retries = v;
        }
        if let Some(v) = file.queue_parallel {
            self.queue_parallel = v;
        }
        if let Some(v) = file.provider_timeout_secs {
            self.provider_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.provider_retries {
            self.provider_retries = v;
        }
        if let Some(v) = file.provider_failure_threshold {
            self.provider_failure_threshold = v;
        }
        if let Some(v) = file.provider_cooldown_secs {
            self.provider_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = file.provider_order {
            self.provider_order = v;
        }

        if self.queue_batch_size == 0 {
            return Err(ConfigError::Invalid {
                var: "queue_batch_size",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.provider_order.is_empty() {
            return Err(ConfigError::Invalid {
                var: "provider_order",
                value: "[]".to_string(),
                reason: "must name at least one provider".to_string(),
            });
        }

        tracing::info!("Loaded config overrides from {}", path.display());
        Ok(())
    }

    /// Store URL and key; both are needed to reach the hosted database.
    pub fn supabase(&self) -> Result<(&str, &str), ConfigError> {
        let url = self
            .supabase_url
            .as_deref()
            .ok_or(ConfigError::Missing("SUPABASE_URL"))?;
        let key = self
            .supabase_service_role_key
            .as_deref()
            .ok_or(ConfigError::Missing("SUPABASE_SERVICE_ROLE_KEY"))?;
        Ok((url, key))
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            poll_interval: self.queue_poll_interval,
            batch_size: self.queue_batch_size,
            default_max_retries: self.queue_default_max_retries,
            parallel: self.queue_parallel,
            ..QueueConfig::default()
        }
    }

    pub fn failover_config(&self) -> FailoverConfig {
        FailoverConfig {
            order: self.provider_order.clone(),
            retries: self.provider_retries,
            timeout: self.provider_timeout,
            failure_threshold: self.provider_failure_threshold,
            cooldown: self.provider_cooldown,
            ..FailoverConfig::default()
        }
    }
}

fn number<T: std::str::FromStr>(
    var: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn positive<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let parsed = number(var, raw, default)?;
    if parsed == T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(parsed)
}

fn secs(var: &'static str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    number(var, raw, default.as_secs()).map(Duration::from_secs)
}

fn flag(var: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            var,
            value: v,
            reason: "expected true or false".to_string(),
        }),
    }
}

fn parse_order(raw: &str) -> Result<Vec<ProviderKind>, ConfigError> {
    let mut order = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let kind: ProviderKind = name.parse().map_err(|_| ConfigError::Invalid {
            var: "PROVIDER_ORDER",
            value: raw.to_string(),
            reason: format!("unknown provider {:?}", name),
        })?;
        if !order.contains(&kind) {
            order.push(kind);
        }
    }
    if order.is_empty() {
        return Err(ConfigError::Invalid {
            var: "PROVIDER_ORDER",
            value: raw.to_string(),
            reason: "must name at least one provider".to_string(),
        });
    }
    Ok(order)
}
