//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use r_ems_common::time::{duration_to_millis, MILLIS_PER_DAY};
use r_ems_common::{ChannelEntryConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::locator::{ChannelLocator, DeviceLocator};

/// Sampling period requesting driver push delivery.
pub const LISTEN_FOR_UPDATE: i64 = -1;
/// Sampling period for channels that are only read on demand.
pub const NO_READ_NO_LISTEN: i64 = 0;
/// Longest accepted sampling period: one (leap) year.
pub const MAX_SAMPLING_PERIOD_MS: i64 = 366 * MILLIS_PER_DAY;

/// Data flow direction of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Input,
    Output,
    InOut,
}

impl Direction {
    pub fn is_readable(self) -> bool {
        matches!(self, Direction::Input | Direction::InOut)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Direction::Output | Direction::InOut)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Input => "input",
            Direction::Output => "output",
            Direction::InOut => "inout",
        })
    }
}

impl FromStr for Direction {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "input" => Ok(Direction::Input),
            "output" => Ok(Direction::Output),
            "inout" => Ok(Direction::InOut),
            other => Err(ChannelError::Configuration(format!(
                "unknown channel direction '{other}'"
            ))),
        }
    }
}

/// How values reach the registry for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Polled by the owning device group at a fixed period.
    Periodic(Duration),
    /// Delivered by the driver through its push callback.
    Pushed,
    /// Neither polled nor subscribed; read only when asked.
    OnDemand,
}

/// Configuration supplied by the application when adding a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfiguration {
    pub locator: ChannelLocator,
    /// Milliseconds. `> 0` periodic, `< 0` pushed, `0` on demand.
    pub sampling_period_ms: i64,
    pub direction: Direction,
}

impl ChannelConfiguration {
    pub fn new(locator: ChannelLocator, sampling_period_ms: i64, direction: Direction) -> Self {
        Self {
            locator,
            sampling_period_ms,
            direction,
        }
    }

    pub fn periodic(locator: ChannelLocator, period: Duration) -> Self {
        Self::new(locator, duration_to_millis(period), Direction::Input)
    }

    pub fn pushed(locator: ChannelLocator) -> Self {
        Self::new(locator, LISTEN_FOR_UPDATE, Direction::Input)
    }

    pub fn on_demand(locator: ChannelLocator, direction: Direction) -> Self {
        Self::new(locator, NO_READ_NO_LISTEN, direction)
    }

    pub fn sampling_mode(&self) -> SamplingMode {
        match self.sampling_period_ms {
            p if p > 0 => SamplingMode::Periodic(Duration::from_millis(p as u64)),
            p if p < 0 => SamplingMode::Pushed,
            _ => SamplingMode::OnDemand,
        }
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.direction == Direction::Output && self.sampling_period_ms != NO_READ_NO_LISTEN {
            return Err(ChannelError::Configuration(format!(
                "output channel {} cannot be sampled (period {} ms)",
                self.locator, self.sampling_period_ms
            )));
        }
        if self.sampling_period_ms > MAX_SAMPLING_PERIOD_MS {
            return Err(ChannelError::Configuration(format!(
                "channel {} sampling period {} ms exceeds the maximum of {} ms",
                self.locator, self.sampling_period_ms, MAX_SAMPLING_PERIOD_MS
            )));
        }
        Ok(())
    }

    /// Build a configuration from a `[channels.*]` table entry.
    pub fn from_entry(entry: &ChannelEntryConfig) -> Result<Self, ChannelError> {
        let device = DeviceLocator::intern(
            entry.driver.as_str(),
            entry.interface.as_str(),
            entry.device.as_str(),
            entry.parameters.clone(),
        );
        let locator = ChannelLocator::intern(&device, entry.address.as_str());
        let config = Self::new(
            locator,
            entry.sampling_period_ms,
            entry.direction.parse()?,
        );
        config.validate()?;
        Ok(config)
    }
}

/// Timing knobs for device-group workers and blocking scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Longest uninterrupted sleep of a worker; bounds reconfiguration latency.
    pub max_sleep: Duration,
    /// Sleep while a device group has nothing scheduled.
    pub idle_sleep: Duration,
    /// Upper bound for blocking discovery wrappers.
    pub scan_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_sleep: config.max_sleep,
            idle_sleep: config.idle_sleep,
            scan_timeout: config.scan_timeout,
        }
    }
}
