//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Channel registry and per-device sampling scheduler.
//!
//! Applications configure channels on a [`ChannelManager`]. Periodic channels
//! are grouped per device and polled in anchored batches by one worker per
//! device; pushed channels are subscribed through the driver. Both paths feed
//! the same update / changed listener model.

pub mod access;
mod channel;
pub mod config;
mod device;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod locator;
pub mod manager;
mod scan;
pub mod schedule;
pub mod value;

pub use access::{AccessControl, ChannelOperation, PermitAll, RoleBasedAccess};
pub use config::{
    ChannelConfiguration, Direction, SamplingMode, SchedulerSettings, LISTEN_FOR_UPDATE,
    MAX_SAMPLING_PERIOD_MS, NO_READ_NO_LISTEN,
};
pub use dispatch::{ChannelEventListener, EventType};
pub use driver::{
    ChannelDriver, ChannelScanListener, ChannelUpdateListener, DeviceListener, DeviceScanListener,
    DriverRegistry,
};
pub use error::{ChannelError, DriverError};
pub use locator::{ChannelLocator, DeviceLocator, LocatorInterner};
pub use manager::ChannelManager;
pub use value::{Quality, SampledValue, SampledValueContainer, Value, ValueContainer};

/// Result type used across the channel manager.
pub type Result<T> = std::result::Result<T, ChannelError>;
