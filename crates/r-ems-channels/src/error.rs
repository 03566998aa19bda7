//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

use crate::access::ChannelOperation;
use crate::locator::{ChannelLocator, DeviceLocator};

/// Failure reported by a driver implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Communication with the device failed. Recoverable; the channel stays configured.
    #[error("i/o failure: {0}")]
    Io(String),
    /// The driver does not implement the requested capability.
    #[error("operation not supported by driver: {0}")]
    Unsupported(String),
    /// The addressed device is unknown to the driver.
    #[error("no such device: {0}")]
    NoSuchDevice(String),
    /// The addressed channel is unknown to the driver.
    #[error("no such channel: {0}")]
    NoSuchChannel(String),
    /// The hardware interface is unknown to the driver.
    #[error("no such interface: {0}")]
    NoSuchInterface(String),
}

impl DriverError {
    /// Convenience constructor for I/O failures.
    pub fn io(message: impl Into<String>) -> Self {
        DriverError::Io(message.into())
    }

    /// Convenience constructor for missing capabilities.
    pub fn unsupported(capability: impl Into<String>) -> Self {
        DriverError::Unsupported(capability.into())
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Io(err.to_string())
    }
}

/// Errors surfaced by the channel manager façade.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The locator is already configured.
    #[error("channel already configured: {0}")]
    AlreadyExists(ChannelLocator),
    /// The locator is not configured.
    #[error("channel not configured: {0}")]
    NotConfigured(ChannelLocator),
    /// No driver is registered under the id.
    #[error("no such driver: {0}")]
    NoSuchDriver(String),
    /// The driver bound to a device was unregistered.
    #[error("driver {0} is no longer available")]
    DriverUnavailable(String),
    /// The device is unknown to its driver.
    #[error("no such device: {0}")]
    NoSuchDevice(DeviceLocator),
    /// The channel has not been sampled yet.
    #[error("no value sampled yet for channel {0}")]
    NoValue(ChannelLocator),
    /// The access-control collaborator denied the operation.
    #[error("{operation} denied for channel {locator}")]
    Unauthorized {
        /// Operation that was attempted.
        operation: ChannelOperation,
        /// Channel the operation targeted.
        locator: ChannelLocator,
    },
    /// The driver lacks the requested capability.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// The driver reported an I/O failure.
    #[error("driver i/o failure: {0}")]
    Io(#[source] DriverError),
    /// The configuration is malformed, e.g. a sampled output-only channel.
    #[error("invalid channel configuration: {0}")]
    Configuration(String),
    /// A discovery scan finished unsuccessfully.
    #[error("scan failed: {0}")]
    ScanFailed(String),
}

impl From<DriverError> for ChannelError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Unsupported(capability) => ChannelError::Unsupported(capability),
            other => ChannelError::Io(other),
        }
    }
}

impl ChannelError {
    /// Whether the error is a recoverable driver communication failure.
    pub fn is_io(&self) -> bool {
        matches!(self, ChannelError::Io(_) | ChannelError::DriverUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_driver_errors_keep_their_kind() {
        let err: ChannelError = DriverError::unsupported("listen_channels").into();
        assert!(matches!(err, ChannelError::Unsupported(ref cap) if cap == "listen_channels"));
        assert!(!err.is_io());
    }

    #[test]
    fn io_errors_are_wrapped() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "bus timeout");
        let err: ChannelError = DriverError::from(io).into();
        assert!(err.is_io());
        assert_eq!(format!("{err}"), "driver i/o failure: i/o failure: bus timeout");
    }
}
