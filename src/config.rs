// src/config.rs

//! Manages server configuration: loading, defaulting, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Which admission policy the priority scheduler runs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulePolicy {
    Fifo,
    #[default]
    Fairness,
}

/// Scheduler tuning knobs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    /// Admission policy: `fifo` or `fairness`.
    #[serde(default)]
    pub policy: SchedulePolicy,
    /// Collapse same-shape same-priority requests into aggregated items.
    #[serde(default)]
    pub aggregate: bool,
    /// How often the scheduler re-reads the resource view and drains the
    /// running queue.
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulePolicy::default(),
            aggregate: false,
            tick_interval: default_tick_interval(),
        }
    }
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(100)
}

/// Group manager knobs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GroupConfig {
    /// How long a kill-group waits for member acknowledgements before
    /// returning REQUEST_TIME_OUT (the cascade continues in background).
    #[serde(with = "humantime_serde", default = "default_kill_timeout")]
    pub kill_timeout: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            kill_timeout: default_kill_timeout(),
        }
    }
}

fn default_kill_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Heartbeat monitor windows.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeartbeatConfig {
    /// Silence after which a running instance is marked sub-health.
    #[serde(with = "humantime_serde", default = "default_sub_health_after")]
    pub sub_health_after: Duration,
    /// Silence after which a running instance is marked FATAL.
    #[serde(with = "humantime_serde", default = "default_fatal_after")]
    pub fatal_after: Duration,
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            sub_health_after: default_sub_health_after(),
            fatal_after: default_fatal_after(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_sub_health_after() -> Duration {
    Duration::from_secs(5)
}
fn default_fatal_after() -> Duration {
    Duration::from_secs(30)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

/// Client runtime knobs; the adaptor reads these from the same file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientConfig {
    /// Transparent retries for retryable transport failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed pause between retry attempts, with a little jitter.
    #[serde(with = "humantime_serde", default = "default_retry_backoff")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff() -> Duration {
    Duration::from_millis(200)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Object store knobs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ObjectConfig {
    /// Default `get` timeout in milliseconds; −1 waits forever.
    #[serde(default = "default_get_timeout_ms")]
    pub default_get_timeout_ms: i64,
}

impl Default for ObjectConfig {
    fn default() -> Self {
        Self {
            default_get_timeout_ms: default_get_timeout_ms(),
        }
    }
}

fn default_get_timeout_ms() -> i64 {
    30_000
}

/// Configuration for the Prometheus metrics / HTTP query exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server exposes the query endpoints and /metrics.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub groups: GroupConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub objects: ObjectConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8790
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            scheduler: SchedulerConfig::default(),
            groups: GroupConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            client: ClientConfig::default(),
            objects: ObjectConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates a configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Config> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that would otherwise surface as confusing runtime
    /// behavior.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("listen port must not be 0"));
        }
        if self.heartbeat.sub_health_after >= self.heartbeat.fatal_after {
            return Err(anyhow!(
                "heartbeat.sub_health_after must be shorter than heartbeat.fatal_after"
            ));
        }
        if self.scheduler.tick_interval.is_zero() {
            return Err(anyhow!("scheduler.tick_interval must not be zero"));
        }
        if self.groups.kill_timeout < Duration::from_secs(1) {
            warn!(
                "groups.kill_timeout of {:?} is unusually short; in-flight kills will time out aggressively",
                self.groups.kill_timeout
            );
        }
        Ok(())
    }
}
