//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Capability contract implemented by protocol drivers, and the registry the
//! manager resolves them through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::error::{ChannelError, DriverError};
use crate::locator::{ChannelLocator, DeviceLocator};
use crate::value::{SampledValue, SampledValueContainer, ValueContainer};

/// Receives values pushed by a driver for subscribed channels.
///
/// Callbacks may arrive on any thread, concurrently with polling workers.
pub trait ChannelUpdateListener: Send + Sync {
    /// New samples for some of the listened channels.
    fn channels_updated(&self, samples: Vec<SampledValueContainer>);

    /// The push link failed; subscribed values are no longer trustworthy.
    fn exception_occurred(&self, error: DriverError);
}

/// Progress sink for a channel scan on one device.
pub trait ChannelScanListener: Send + Sync {
    fn channel_found(&self, channel: ChannelLocator);

    /// Completion ratio in `0.0..=1.0`.
    fn progress(&self, _ratio: f32) {}

    fn finished(&self, success: bool);
}

/// Progress sink for a device scan on one interface.
pub trait DeviceScanListener: Send + Sync {
    fn device_found(&self, device: DeviceLocator);

    fn progress(&self, _ratio: f32) {}

    fn finished(&self, success: bool, error: Option<DriverError>);
}

/// Notified when a driver learns about devices appearing or disappearing.
pub trait DeviceListener: Send + Sync {
    fn device_added(&self, device: DeviceLocator);

    fn device_removed(&self, device: DeviceLocator);
}

/// Unified interface implemented by protocol-specific drivers.
///
/// Only batched reads and writes are mandatory; the remaining capabilities
/// default to `Unsupported` or a no-op.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    /// Identifier channels refer to in their device locator.
    fn driver_id(&self) -> &str;

    fn description(&self) -> &str {
        self.driver_id()
    }

    /// A channel of this driver was configured. Must tolerate repeats.
    fn channel_added(&self, _channel: &ChannelLocator) {}

    /// A channel of this driver was removed. Must tolerate unknown locators.
    fn channel_removed(&self, _channel: &ChannelLocator) {}

    /// Read a batch. Returns exactly one sample per requested channel, in order,
    /// or fails the whole batch.
    async fn read_channels(
        &self,
        channels: &[ChannelLocator],
    ) -> Result<Vec<SampledValue>, DriverError>;

    async fn write_channels(&self, values: &[ValueContainer]) -> Result<(), DriverError>;

    /// Replace the push subscription of this driver with `channels`.
    ///
    /// An empty slice cancels the subscription.
    fn listen_channels(
        &self,
        _channels: &[ChannelLocator],
        _listener: Arc<dyn ChannelUpdateListener>,
    ) -> Result<(), DriverError> {
        Err(DriverError::unsupported("listen_channels"))
    }

    fn start_channel_scan(
        &self,
        _device: &DeviceLocator,
        _listener: Arc<dyn ChannelScanListener>,
    ) -> Result<(), DriverError> {
        Err(DriverError::unsupported("start_channel_scan"))
    }

    fn start_device_scan(
        &self,
        _interface_id: &str,
        _filter: Option<&str>,
        _listener: Arc<dyn DeviceScanListener>,
    ) -> Result<(), DriverError> {
        Err(DriverError::unsupported("start_device_scan"))
    }

    fn abort_device_scan(&self, _interface_id: &str, _filter: Option<&str>) {}

    /// Synchronous channel enumeration for drivers that know their address space.
    fn channel_list(&self, _device: &DeviceLocator) -> Result<Vec<ChannelLocator>, DriverError> {
        Err(DriverError::unsupported("channel_list"))
    }

    fn add_device_listener(&self, _listener: Arc<dyn DeviceListener>) -> Result<(), DriverError> {
        Err(DriverError::unsupported("add_device_listener"))
    }

    /// Must not fail for listeners that were never added.
    fn remove_device_listener(&self, _listener: &Arc<dyn DeviceListener>) {}

    /// Release driver resources; called once when the manager shuts down.
    async fn shutdown(&self) {}
}

/// Drivers available to the manager, keyed by driver id.
///
/// The registry holds the only strong references; consumers that must not
/// extend a driver's lifetime downgrade what [`DriverRegistry::resolve`] returns.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn ChannelDriver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its own id, returning any driver it replaces.
    pub fn register(&self, driver: Arc<dyn ChannelDriver>) -> Option<Arc<dyn ChannelDriver>> {
        let id = driver.driver_id().to_owned();
        info!(driver = %id, description = driver.description(), "driver registered");
        self.drivers.write().insert(id, driver)
    }

    pub fn unregister(&self, driver_id: &str) -> Option<Arc<dyn ChannelDriver>> {
        let removed = self.drivers.write().remove(driver_id);
        if removed.is_some() {
            info!(driver = driver_id, "driver unregistered");
        }
        removed
    }

    pub fn resolve(&self, driver_id: &str) -> Result<Arc<dyn ChannelDriver>, ChannelError> {
        self.drivers
            .read()
            .get(driver_id)
            .cloned()
            .ok_or_else(|| ChannelError::NoSuchDriver(driver_id.to_owned()))
    }

    pub fn contains(&self, driver_id: &str) -> bool {
        self.drivers.read().contains_key(driver_id)
    }

    /// Registered ids in lexical order.
    pub fn driver_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn ChannelDriver>> {
        self.drivers.read().values().cloned().collect()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.driver_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver(&'static str);

    #[async_trait]
    impl ChannelDriver for NullDriver {
        fn driver_id(&self) -> &str {
            self.0
        }

        async fn read_channels(
            &self,
            channels: &[ChannelLocator],
        ) -> Result<Vec<SampledValue>, DriverError> {
            Ok(channels.iter().map(|_| SampledValue::bad_now()).collect())
        }

        async fn write_channels(&self, _values: &[ValueContainer]) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[test]
    fn resolve_follows_registration() {
        let registry = DriverRegistry::new();
        assert!(matches!(
            registry.resolve("null"),
            Err(ChannelError::NoSuchDriver(ref id)) if id == "null"
        ));

        registry.register(Arc::new(NullDriver("null")));
        registry.register(Arc::new(NullDriver("alpha")));
        assert_eq!(registry.driver_ids(), vec!["alpha", "null"]);
        assert_eq!(registry.resolve("null").unwrap().driver_id(), "null");

        assert!(registry.unregister("null").is_some());
        assert!(registry.unregister("null").is_none());
        assert!(!registry.contains("null"));
    }

    #[test]
    fn registry_owns_the_only_strong_reference() {
        let registry = DriverRegistry::new();
        registry.register(Arc::new(NullDriver("weak")));
        let weak = Arc::downgrade(&registry.resolve("weak").unwrap());
        assert!(weak.upgrade().is_some());
        registry.unregister("weak");
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn optional_capabilities_default_to_unsupported() {
        let driver = NullDriver("null");
        let device = DeviceLocator::intern("null", "if0", "dev", None);
        assert_eq!(
            driver.channel_list(&device),
            Err(DriverError::unsupported("channel_list"))
        );
    }
}
