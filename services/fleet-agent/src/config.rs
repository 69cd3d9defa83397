//! Configuration for the fleet agent.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::health::WaitOptions;
use crate::image_watch::WatcherConfig;
use crate::lifecycle::LifecycleConfig;
use crate::ports::{PortRange, DEFAULT_PORT_HIGH, DEFAULT_PORT_LOW};

/// Fleet agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Docker daemon socket.
    pub docker_socket: String,

    /// Worker image every tenant runs.
    pub worker_image: String,

    /// Network all workers (and the message bus) share.
    pub shared_network: String,

    /// SQLite file holding tenant port assignments.
    pub registry_path: PathBuf,

    /// Prefix for service, volume and host names.
    pub service_prefix: String,

    /// Ports handed out to workers.
    pub port_range: PortRange,

    /// Message bus hostname passed to workers.
    pub message_bus_host: String,

    /// Optional `KEY=VALUE` file injected into every worker.
    pub worker_env_file: Option<PathBuf>,

    /// Path the worker health check probes.
    pub health_path: String,

    /// Time allowed for a worker to become healthy.
    pub health_timeout: Duration,

    /// Time between health probes.
    pub health_interval: Duration,

    /// Time between worker image checks.
    pub image_check_interval: Duration,

    /// Delay between rolling-update steps.
    pub update_delay: Duration,

    /// Tenants redeployed or reconciled at once.
    pub rollout_concurrency: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let worker_image = lookup("FLEET_WORKER_IMAGE")
            .filter(|s| !s.trim().is_empty())
            .context("FLEET_WORKER_IMAGE must be set")?;

        let port_low = parse_var(&lookup, "FLEET_PORT_LOW", DEFAULT_PORT_LOW)?;
        let port_high = parse_var(&lookup, "FLEET_PORT_HIGH", DEFAULT_PORT_HIGH)?;
        let Some(port_range) = PortRange::new(port_low, port_high) else {
            bail!("FLEET_PORT_LOW ({port_low}) must be below FLEET_PORT_HIGH ({port_high})");
        };

        let health_interval = secs_var(&lookup, "FLEET_HEALTH_INTERVAL_SECS", 5)?;
        if health_interval.is_zero() {
            bail!("FLEET_HEALTH_INTERVAL_SECS must be positive");
        }

        let image_check_interval = secs_var(&lookup, "FLEET_IMAGE_CHECK_INTERVAL_SECS", 3600)?;
        if image_check_interval.is_zero() {
            bail!("FLEET_IMAGE_CHECK_INTERVAL_SECS must be positive");
        }

        let service_prefix = var("FLEET_SERVICE_PREFIX", fleet_id::DEFAULT_NAME_PREFIX);
        fleet_id::ResourceNames::try_new(service_prefix.as_str())
            .context("FLEET_SERVICE_PREFIX is invalid")?;

        let rollout_concurrency = parse_var(&lookup, "FLEET_ROLLOUT_CONCURRENCY", 4usize)?;
        if rollout_concurrency == 0 {
            bail!("FLEET_ROLLOUT_CONCURRENCY must be positive");
        }

        Ok(Self {
            docker_socket: var("FLEET_DOCKER_SOCKET", "/var/run/docker.sock"),
            worker_image,
            shared_network: var("FLEET_SHARED_NETWORK", "fleet"),
            registry_path: var("FLEET_REGISTRY_PATH", "/var/lib/fleet/registry.db").into(),
            service_prefix,
            port_range,
            message_bus_host: var("FLEET_MESSAGE_BUS_HOST", "rabbitmq"),
            worker_env_file: lookup("FLEET_WORKER_ENV_FILE")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            health_path: var("FLEET_HEALTH_PATH", "/health"),
            health_timeout: secs_var(&lookup, "FLEET_HEALTH_TIMEOUT_SECS", 120)?,
            health_interval,
            image_check_interval,
            update_delay: secs_var(&lookup, "FLEET_UPDATE_DELAY_SECS", 10)?,
            rollout_concurrency,
            log_level: var("FLEET_LOG_LEVEL", "info"),
        })
    }

    /// Read the worker environment file, if one is configured.
    pub fn load_worker_env(&self) -> Result<Vec<(String, String)>> {
        match &self.worker_env_file {
            Some(path) => read_env_file(path),
            None => Ok(Vec::new()),
        }
    }

    /// Lifecycle settings, with the worker environment already loaded.
    pub fn lifecycle_config(&self, worker_env: Vec<(String, String)>) -> LifecycleConfig {
        LifecycleConfig {
            image: self.worker_image.clone(),
            network: self.shared_network.clone(),
            message_bus_host: self.message_bus_host.clone(),
            worker_env,
            health_path: self.health_path.clone(),
            update_delay: self.update_delay,
            wait: WaitOptions {
                timeout: self.health_timeout,
                interval: self.health_interval,
            },
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            image: self.worker_image.clone(),
            interval: self.image_check_interval,
            rollout_concurrency: self.rollout_concurrency,
        }
    }
}

fn parse_var<T>(lookup: impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn secs_var(lookup: impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    parse_var(lookup, key, default).map(Duration::from_secs)
}

/// Read a worker environment file.
pub fn read_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read worker env file {}", path.display()))?;
    parse_env_file(&contents).with_context(|| format!("invalid worker env file {}", path.display()))
}

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped;
/// values are kept verbatim.
pub fn parse_env_file(contents: &str) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();

    for (index, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some((key, value)) = trimmed.split_once('=') else {
            bail!("line {}: expected KEY=VALUE", index + 1);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("line {}: empty key", index + 1);
        }
        entries.push((key.to_string(), value.to_string()));
    }

    Ok(entries)
}
