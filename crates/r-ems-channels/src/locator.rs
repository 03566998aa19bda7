//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Interned identifiers for devices and channels.
//!
//! Locators are cheap to clone (`Arc` inside) and compare by identity fields.
//! The interner hands out one canonical instance per identity for as long as
//! any clone of it is alive, so pointer equality and structural equality agree
//! for locators obtained through it.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

static GLOBAL_INTERNER: Lazy<LocatorInterner> = Lazy::new(LocatorInterner::new);

const PRUNE_INTERVAL: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DeviceKey {
    driver_id: String,
    interface_id: String,
    device_address: String,
}

#[derive(Debug)]
struct DeviceInner {
    key: DeviceKey,
    parameters: RwLock<Option<String>>,
}

/// Identifies one physical device reachable through a driver.
#[derive(Clone)]
pub struct DeviceLocator {
    inner: Arc<DeviceInner>,
}

impl DeviceLocator {
    /// Canonical locator for the identity, created on first use.
    pub fn intern(
        driver_id: impl Into<String>,
        interface_id: impl Into<String>,
        device_address: impl Into<String>,
        parameters: Option<String>,
    ) -> Self {
        GLOBAL_INTERNER.device(driver_id, interface_id, device_address, parameters)
    }

    pub fn driver_id(&self) -> &str {
        &self.inner.key.driver_id
    }

    pub fn interface_id(&self) -> &str {
        &self.inner.key.interface_id
    }

    pub fn device_address(&self) -> &str {
        &self.inner.key.device_address
    }

    /// Advisory driver parameters (baud rate, unit id, ...).
    pub fn parameters(&self) -> Option<String> {
        self.inner.parameters.read().clone()
    }

    /// Refine the advisory parameters, e.g. after discovery. Identity is unaffected.
    pub fn set_parameters(&self, parameters: Option<String>) {
        *self.inner.parameters.write() = parameters;
    }

    /// Whether both handles point at the same canonical instance.
    pub fn is_same_instance(&self, other: &DeviceLocator) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for DeviceLocator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.key == other.inner.key
    }
}

impl Eq for DeviceLocator {}

impl Hash for DeviceLocator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.key.hash(state);
    }
}

impl fmt::Display for DeviceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.driver_id(),
            self.interface_id(),
            self.device_address()
        )
    }
}

impl fmt::Debug for DeviceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLocator")
            .field("driver_id", &self.driver_id())
            .field("interface_id", &self.interface_id())
            .field("device_address", &self.device_address())
            .field("parameters", &self.parameters())
            .finish()
    }
}

#[derive(Debug)]
struct ChannelInner {
    device: DeviceLocator,
    channel_address: String,
}

/// Identifies one channel (register, attribute, data point) of a device.
#[derive(Clone)]
pub struct ChannelLocator {
    inner: Arc<ChannelInner>,
}

impl ChannelLocator {
    /// Canonical locator for the channel address on `device`.
    pub fn intern(device: &DeviceLocator, channel_address: impl Into<String>) -> Self {
        GLOBAL_INTERNER.channel(device, channel_address)
    }

    pub fn device(&self) -> &DeviceLocator {
        &self.inner.device
    }

    pub fn channel_address(&self) -> &str {
        &self.inner.channel_address
    }

    pub fn driver_id(&self) -> &str {
        self.inner.device.driver_id()
    }

    pub fn is_same_instance(&self, other: &ChannelLocator) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ChannelLocator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.channel_address == other.inner.channel_address
                && self.inner.device == other.inner.device)
    }
}

impl Eq for ChannelLocator {}

impl Hash for ChannelLocator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.device.hash(state);
        self.inner.channel_address.hash(state);
    }
}

impl fmt::Display for ChannelLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.inner.device, self.inner.channel_address)
    }
}

impl fmt::Debug for ChannelLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLocator")
            .field("device", &self.inner.device)
            .field("channel_address", &self.inner.channel_address)
            .finish()
    }
}

/// Lookup-or-insert table producing canonical locators.
///
/// Entries are held weakly; an identity nobody references any more is dropped
/// and re-created on the next request.
#[derive(Debug, Default)]
pub struct LocatorInterner {
    devices: Mutex<HashMap<DeviceKey, Weak<DeviceInner>>>,
    channels: Mutex<HashMap<(DeviceKey, String), Weak<ChannelInner>>>,
}

impl LocatorInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide interner used by [`DeviceLocator::intern`] and [`ChannelLocator::intern`].
    pub fn global() -> &'static LocatorInterner {
        &GLOBAL_INTERNER
    }

    pub fn device(
        &self,
        driver_id: impl Into<String>,
        interface_id: impl Into<String>,
        device_address: impl Into<String>,
        parameters: Option<String>,
    ) -> DeviceLocator {
        let key = DeviceKey {
            driver_id: driver_id.into(),
            interface_id: interface_id.into(),
            device_address: device_address.into(),
        };
        let mut devices = self.devices.lock();
        if let Some(inner) = devices.get(&key).and_then(Weak::upgrade) {
            if let Some(parameters) = parameters {
                let mut current = inner.parameters.write();
                if current.is_none() {
                    *current = Some(parameters);
                }
            }
            return DeviceLocator { inner };
        }
        if devices.len() % PRUNE_INTERVAL == PRUNE_INTERVAL - 1 {
            devices.retain(|_, weak| weak.strong_count() > 0);
        }
        let inner = Arc::new(DeviceInner {
            key: key.clone(),
            parameters: RwLock::new(parameters),
        });
        devices.insert(key, Arc::downgrade(&inner));
        DeviceLocator { inner }
    }

    pub fn channel(
        &self,
        device: &DeviceLocator,
        channel_address: impl Into<String>,
    ) -> ChannelLocator {
        let key = (device.inner.key.clone(), channel_address.into());
        let mut channels = self.channels.lock();
        if let Some(inner) = channels.get(&key).and_then(Weak::upgrade) {
            return ChannelLocator { inner };
        }
        if channels.len() % PRUNE_INTERVAL == PRUNE_INTERVAL - 1 {
            channels.retain(|_, weak| weak.strong_count() > 0);
        }
        let inner = Arc::new(ChannelInner {
            device: device.clone(),
            channel_address: key.1.clone(),
        });
        channels.insert(key, Arc::downgrade(&inner));
        ChannelLocator { inner }
    }

    /// Number of device identities with at least one live locator.
    pub fn live_devices(&self) -> usize {
        self.devices
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn identical_identity_yields_canonical_instance() {
        let interner = LocatorInterner::new();
        let a = interner.device("modbus", "tcp0", "10.0.0.1:502", None);
        let b = interner.device("modbus", "tcp0", "10.0.0.1:502", Some("unit=3".into()));
        assert!(a.is_same_instance(&b));
        assert_eq!(a.parameters().as_deref(), Some("unit=3"));

        let c1 = interner.channel(&a, "holding:7");
        let c2 = interner.channel(&b, "holding:7");
        assert!(c1.is_same_instance(&c2));
        assert_eq!(c1.to_string(), "modbus:tcp0:10.0.0.1:502/holding:7");
    }

    #[test]
    fn parameters_do_not_take_part_in_identity() {
        let interner = LocatorInterner::new();
        let a = interner.device("mbus", "/dev/ttyUSB0", "p1", Some("2400".into()));
        let b = interner.device("mbus", "/dev/ttyUSB0", "p1", Some("9600".into()));
        assert_eq!(a, b);
        assert_eq!(b.parameters().as_deref(), Some("2400"));
        b.set_parameters(Some("9600".into()));
        assert_eq!(a.parameters().as_deref(), Some("9600"));
    }

    #[test]
    fn distinct_identities_differ() {
        let interner = LocatorInterner::new();
        let a = interner.device("modbus", "tcp0", "a", None);
        let b = interner.device("modbus", "tcp1", "a", None);
        assert_ne!(a, b);
        let set: HashSet<_> = [interner.channel(&a, "x"), interner.channel(&b, "x")]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn dropped_identities_are_released() {
        let interner = LocatorInterner::new();
        let device = interner.device("modbus", "tcp0", "gone", None);
        assert_eq!(interner.live_devices(), 1);
        drop(device);
        assert_eq!(interner.live_devices(), 0);
    }

    #[test]
    fn concurrent_interning_has_single_winner() {
        let interner = Arc::new(LocatorInterner::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let interner = interner.clone();
                thread::spawn(move || {
                    let device = interner.device("knx", "ip0", "1.1.4", None);
                    let channel = interner.channel(&device, "temperature");
                    (device, channel)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let (first_device, first_channel) = &results[0];
        for (device, channel) in &results[1..] {
            assert!(device.is_same_instance(first_device));
            assert!(channel.is_same_instance(first_channel));
        }
    }
}
