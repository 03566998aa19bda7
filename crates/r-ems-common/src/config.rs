//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

const DIRECTIONS: [&str; 3] = ["input", "output", "inout"];

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_max_sleep() -> Duration {
    Duration::from_millis(1000)
}

fn default_idle_sleep() -> Duration {
    Duration::from_millis(1000)
}

fn default_scan_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_direction() -> String {
    "input".to_owned()
}

fn default_roles() -> Vec<String> {
    vec!["admin".to_owned()]
}

/// Primary configuration object for the channel manager daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub access: AccessConfig,
    /// Channels added at startup, keyed by a human readable name.
    #[serde(default)]
    pub channels: IndexMap<String, ChannelEntryConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_EMS_CONFIG";

    /// Load configuration from disk, respecting the `R_EMS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
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
        self.scheduler.validate()?;
        for (name, channel) in &self.channels {
            channel
                .validate()
                .with_context(|| format!("invalid channel '{}'", name))?;
        }
        Ok(())
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Extra filter directives such as `r_ems_channels=debug`, applied when
    /// no `R_EMS_LOG`/`RUST_LOG` override is set.
    #[serde(default)]
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            directives: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Tuning knobs for the per-device polling workers.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound for a single worker sleep slice.
    #[serde(default = "default_max_sleep", rename = "max_sleep_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_sleep: Duration,
    /// Sleep used while a device has nothing scheduled.
    #[serde(default = "default_idle_sleep", rename = "idle_sleep_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_sleep: Duration,
    /// Upper bound for blocking discovery calls.
    #[serde(default = "default_scan_timeout", rename = "scan_timeout_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub scan_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_sleep: default_max_sleep(),
            idle_sleep: default_idle_sleep(),
            scan_timeout: default_scan_timeout(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_sleep.is_zero() || self.idle_sleep.is_zero() {
            return Err(anyhow!("scheduler sleep slices must be greater than zero"));
        }
        Ok(())
    }
}

/// Roles the daemon presents to the access-control policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            roles: default_roles(),
        }
    }
}

/// Declarative channel definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntryConfig {
    pub driver: String,
    pub interface: String,
    pub device: String,
    #[serde(default)]
    pub parameters: Option<String>,
    pub address: String,
    /// `> 0` polls periodically, `< 0` subscribes to driver pushes, `0` reads on demand.
    #[serde(default)]
    pub sampling_period_ms: i64,
    #[serde(default = "default_direction")]
    pub direction: String,
}

impl ChannelEntryConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("driver", &self.driver),
            ("interface", &self.interface),
            ("device", &self.device),
            ("address", &self.address),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("field '{}' must not be empty", field));
            }
        }
        let direction = self.direction.to_lowercase();
        if !DIRECTIONS.contains(&direction.as_str()) {
            return Err(anyhow!(
                "unknown direction '{}', expected one of {}",
                self.direction,
                DIRECTIONS.join(", ")
            ));
        }
        if direction == "output" && self.sampling_period_ms != 0 {
            return Err(anyhow!(
                "output-only channels cannot be sampled (sampling_period_ms = {})",
                self.sampling_period_ms
            ));
        }
        Ok(())
    }
}
