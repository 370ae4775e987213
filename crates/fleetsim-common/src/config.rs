//! ---
//! fleetsim_section: "01-core-functionality"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Shared primitives and utilities for the simulator runtime."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::formats::Flexible;
use serde_with::{serde_as, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::{LogFormat, LogRotation};

fn default_fleet_size() -> usize {
    5
}

fn default_update_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_endpoint() -> String {
    "http://localhost:50051".to_owned()
}

fn default_auth_token() -> String {
    "greenlane-secret-token".to_owned()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_open_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_keep_alive_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

/// Primary configuration object for the simulator.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "FLEETSIM_CONFIG";

    /// Load configuration, respecting the `FLEETSIM_CONFIG` override.
    ///
    /// Resolution order: the environment override, then `explicit` (which must
    /// exist), then the first existing entry of `candidates`. When nothing
    /// matches the defaults are returned.
    pub fn load_with_source<P: AsRef<Path>>(
        explicit: Option<&Path>,
        candidates: &[P],
    ) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        if let Some(path) = explicit {
            let config = Self::from_path(path)?;
            return Ok(LoadedAppConfig {
                config,
                source: Some(path.to_path_buf()),
            });
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!("no configuration file found; using defaults");
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.fleet.validate()?;
        self.ingest.validate()?;
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Number of vehicles, one streaming session each.
    #[serde(default = "default_fleet_size")]
    pub size: usize,
    /// Seconds between telemetry ticks. Zero disables the sleep (test mode).
    #[serde(default = "default_update_interval")]
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub update_interval: Duration,
    /// Base seed for reproducible vehicles; vehicle `n` uses `seed + n`.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Upper bound on how long shutdown waits for sessions to wind down.
    #[serde(default = "default_shutdown_grace")]
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub shutdown_grace: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            size: default_fleet_size(),
            update_interval: default_update_interval(),
            seed: None,
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl FleetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(anyhow!("fleet.size must be at least 1"));
        }
        if self.shutdown_grace.is_zero() {
            return Err(anyhow!("fleet.shutdown_grace must be greater than zero"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Network address of the ingestion service.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Shared secret attached to every session as `x-api-token`.
    #[serde(default = "default_auth_token")]
    pub auth_token: String,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub connect_timeout: Duration,
    /// Upper bound on waiting for the endpoint's response headers.
    #[serde(default = "default_open_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub open_timeout: Duration,
    /// HTTP/2 PING cadence on an open call.
    #[serde(default = "default_keep_alive_interval")]
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub keep_alive_interval: Duration,
    /// A PING left unanswered this long fails the call.
    #[serde(default = "default_keep_alive_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub keep_alive_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            auth_token: default_auth_token(),
            connect_timeout: default_connect_timeout(),
            open_timeout: default_open_timeout(),
            keep_alive_interval: default_keep_alive_interval(),
            keep_alive_timeout: default_keep_alive_timeout(),
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(anyhow!("ingest.endpoint must not be empty"));
        }
        if self.auth_token.trim().is_empty() {
            return Err(anyhow!("ingest.auth_token must not be empty"));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("open_timeout", self.open_timeout),
            ("keep_alive_interval", self.keep_alive_interval),
            ("keep_alive_timeout", self.keep_alive_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("ingest.{name} must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Endpoint as a URI, assuming plaintext `http://` when no scheme is given.
    pub fn endpoint_uri(&self) -> String {
        let endpoint = self.endpoint.trim();
        if endpoint.contains("://") {
            endpoint.to_owned()
        } else {
            format!("http://{endpoint}")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub rotation: LogRotation,
    /// Log file name prefix; the service name when unset.
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            rotation: LogRotation::default(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
