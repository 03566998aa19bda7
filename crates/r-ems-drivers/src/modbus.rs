//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory reference drivers for field device channels."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use r_ems_channels::{
    ChannelDriver, ChannelLocator, ChannelScanListener, DeviceLocator, DeviceScanListener,
    DriverError, SampledValue, Value, ValueContainer,
};
use tracing::{debug, info};

/// Driver id channels use to address this driver.
pub const DRIVER_ID: &str = "modbus";

/// Modbus data table a register belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl RegisterKind {
    fn prefix(self) -> &'static str {
        match self {
            RegisterKind::Coil => "coil",
            RegisterKind::DiscreteInput => "discrete",
            RegisterKind::InputRegister => "input",
            RegisterKind::HoldingRegister => "holding",
        }
    }

    pub fn is_writable(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::HoldingRegister)
    }

    fn is_bit(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }
}

/// Channel address of the form `holding:40`, `input:3`, `coil:7` or `discrete:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress {
    pub kind: RegisterKind,
    pub offset: u16,
}

impl RegisterAddress {
    pub fn holding(offset: u16) -> Self {
        Self {
            kind: RegisterKind::HoldingRegister,
            offset,
        }
    }

    pub fn input(offset: u16) -> Self {
        Self {
            kind: RegisterKind::InputRegister,
            offset,
        }
    }

    pub fn coil(offset: u16) -> Self {
        Self {
            kind: RegisterKind::Coil,
            offset,
        }
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.offset)
    }
}

impl FromStr for RegisterAddress {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DriverError::NoSuchChannel(format!("invalid modbus address: {s}"));
        let (prefix, offset) = s.split_once(':').ok_or_else(invalid)?;
        let kind = match prefix {
            "coil" => RegisterKind::Coil,
            "discrete" => RegisterKind::DiscreteInput,
            "input" => RegisterKind::InputRegister,
            "holding" => RegisterKind::HoldingRegister,
            _ => return Err(invalid()),
        };
        let offset = offset.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self { kind, offset })
    }
}

#[derive(Debug)]
struct DeviceMemory {
    registers: BTreeMap<RegisterAddress, u16>,
    online: bool,
}

impl Default for DeviceMemory {
    fn default() -> Self {
        Self {
            registers: BTreeMap::new(),
            online: true,
        }
    }
}

type DeviceKey = (String, String);

fn key_of(device: &DeviceLocator) -> DeviceKey {
    (
        device.interface_id().to_owned(),
        device.device_address().to_owned(),
    )
}

/// In-memory Modbus driver that simulates register tables per device.
///
/// Configuring a channel provisions its register (initially zero), so the
/// driver can back a configuration file without further setup.
#[derive(Debug, Default)]
pub struct ModbusDriver {
    devices: RwLock<BTreeMap<DeviceKey, DeviceMemory>>,
}

impl ModbusDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make a device known on an interface.
    pub fn add_device(&self, interface_id: &str, device_address: &str) {
        self.devices
            .write()
            .entry((interface_id.to_owned(), device_address.to_owned()))
            .or_default();
    }

    pub fn set_register(&self, device: &DeviceLocator, address: RegisterAddress, value: u16) {
        self.devices
            .write()
            .entry(key_of(device))
            .or_default()
            .registers
            .insert(address, value);
    }

    pub fn register(&self, device: &DeviceLocator, address: RegisterAddress) -> Option<u16> {
        self.devices
            .read()
            .get(&key_of(device))
            .and_then(|memory| memory.registers.get(&address).copied())
    }

    /// Simulate a device that stops answering.
    pub fn set_online(&self, device: &DeviceLocator, online: bool) {
        self.devices.write().entry(key_of(device)).or_default().online = online;
    }

    fn registers_of(&self, device: &DeviceLocator) -> Result<Vec<RegisterAddress>, DriverError> {
        self.devices
            .read()
            .get(&key_of(device))
            .map(|memory| memory.registers.keys().copied().collect())
            .ok_or_else(|| DriverError::NoSuchDevice(device.to_string()))
    }
}

fn decode(address: RegisterAddress, raw: u16) -> Value {
    if address.kind.is_bit() {
        Value::Boolean(raw != 0)
    } else {
        Value::Integer(i32::from(raw))
    }
}

fn encode(address: RegisterAddress, value: &Value) -> Result<u16, DriverError> {
    if !address.kind.is_writable() {
        return Err(DriverError::unsupported(format!("{address} is read-only")));
    }
    if address.kind.is_bit() {
        let bit = value
            .as_bool()
            .ok_or_else(|| DriverError::io(format!("{address} requires a boolean value")))?;
        return Ok(u16::from(bit));
    }
    let numeric = value
        .as_i64()
        .ok_or_else(|| DriverError::io(format!("{address} requires an integer value")))?;
    u16::try_from(numeric)
        .map_err(|_| DriverError::io(format!("value {numeric} out of range for 16-bit register")))
}

#[async_trait]
impl ChannelDriver for ModbusDriver {
    fn driver_id(&self) -> &str {
        DRIVER_ID
    }

    fn description(&self) -> &str {
        "In-memory Modbus register driver"
    }

    fn channel_added(&self, channel: &ChannelLocator) {
        if let Ok(address) = channel.channel_address().parse::<RegisterAddress>() {
            self.devices
                .write()
                .entry(key_of(channel.device()))
                .or_default()
                .registers
                .entry(address)
                .or_insert(0);
        }
    }

    async fn read_channels(
        &self,
        channels: &[ChannelLocator],
    ) -> Result<Vec<SampledValue>, DriverError> {
        let devices = self.devices.read();
        let now = Utc::now();
        let mut samples = Vec::with_capacity(channels.len());
        for channel in channels {
            let memory = devices
                .get(&key_of(channel.device()))
                .ok_or_else(|| DriverError::NoSuchDevice(channel.device().to_string()))?;
            if !memory.online {
                return Err(DriverError::io(format!(
                    "device {} is not responding",
                    channel.device()
                )));
            }
            // An unknown register answers with an exception; only that element goes bad.
            let sample = channel
                .channel_address()
                .parse::<RegisterAddress>()
                .ok()
                .and_then(|address| {
                    memory
                        .registers
                        .get(&address)
                        .map(|raw| SampledValue::good(decode(address, *raw), now))
                })
                .unwrap_or_else(|| SampledValue::bad(now));
            samples.push(sample);
        }
        debug!(channels = channels.len(), "modbus batch read");
        Ok(samples)
    }

    async fn write_channels(&self, values: &[ValueContainer]) -> Result<(), DriverError> {
        let mut updates = Vec::with_capacity(values.len());
        for container in values {
            let address: RegisterAddress = container.locator.channel_address().parse()?;
            updates.push((key_of(container.locator.device()), address, encode(address, &container.value)?));
        }

        let mut devices = self.devices.write();
        for (key, _, _) in &updates {
            match devices.get(key) {
                Some(memory) if memory.online => {}
                Some(_) => return Err(DriverError::io(format!("device {}:{} is not responding", key.0, key.1))),
                None => return Err(DriverError::NoSuchDevice(format!("{}:{}", key.0, key.1))),
            }
        }
        for (key, address, raw) in updates {
            if let Some(memory) = devices.get_mut(&key) {
                memory.registers.insert(address, raw);
            }
        }
        Ok(())
    }

    fn start_channel_scan(
        &self,
        device: &DeviceLocator,
        listener: Arc<dyn ChannelScanListener>,
    ) -> Result<(), DriverError> {
        let registers = self.registers_of(device)?;
        let total = registers.len().max(1) as f32;
        for (index, address) in registers.iter().enumerate() {
            listener.channel_found(ChannelLocator::intern(device, address.to_string()));
            listener.progress((index + 1) as f32 / total);
        }
        listener.finished(true);
        Ok(())
    }

    fn start_device_scan(
        &self,
        interface_id: &str,
        filter: Option<&str>,
        listener: Arc<dyn DeviceScanListener>,
    ) -> Result<(), DriverError> {
        let matches: Vec<String> = {
            let devices = self.devices.read();
            if !devices.keys().any(|(interface, _)| interface == interface_id) {
                drop(devices);
                listener.finished(
                    false,
                    Some(DriverError::NoSuchInterface(interface_id.to_owned())),
                );
                return Ok(());
            }
            devices
                .keys()
                .filter(|(interface, address)| {
                    interface == interface_id && filter.map_or(true, |f| address.contains(f))
                })
                .map(|(_, address)| address.clone())
                .collect()
        };
        info!(interface = interface_id, found = matches.len(), "modbus device scan");
        for address in matches {
            listener.device_found(DeviceLocator::intern(DRIVER_ID, interface_id, address, None));
        }
        listener.finished(true, None);
        Ok(())
    }

    fn channel_list(&self, device: &DeviceLocator) -> Result<Vec<ChannelLocator>, DriverError> {
        Ok(self
            .registers_of(device)?
            .into_iter()
            .map(|address| ChannelLocator::intern(device, address.to_string()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceLocator {
        DeviceLocator::intern(DRIVER_ID, "tcp0", "10.0.0.7:502", None)
    }

    #[tokio::test]
    async fn batched_reads_return_one_sample_per_channel() {
        let driver = ModbusDriver::new();
        let device = device();
        driver.set_register(&device, RegisterAddress::holding(1), 123);
        driver.set_register(&device, RegisterAddress::coil(4), 1);

        let batch = [
            ChannelLocator::intern(&device, "holding:1"),
            ChannelLocator::intern(&device, "coil:4"),
            ChannelLocator::intern(&device, "holding:99"),
        ];
        let samples = driver.read_channels(&batch).await.unwrap();
        assert_eq!(samples[0].value, Some(Value::Integer(123)));
        assert_eq!(samples[1].value, Some(Value::Boolean(true)));
        assert!(!samples[2].is_good());
    }

    #[tokio::test]
    async fn offline_devices_fail_the_whole_batch() {
        let driver = ModbusDriver::new();
        let device = device();
        driver.set_register(&device, RegisterAddress::input(2), 7);
        driver.set_online(&device, false);
        let err = driver
            .read_channels(&[ChannelLocator::intern(&device, "input:2")])
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Io(_)));
    }

    #[tokio::test]
    async fn writes_are_range_checked_and_atomic() {
        let driver = ModbusDriver::new();
        let device = device();
        driver.add_device("tcp0", "10.0.0.7:502");
        let holding = ChannelLocator::intern(&device, "holding:3");
        let input = ChannelLocator::intern(&device, "input:3");

        driver
            .write_channels(&[ValueContainer::new(holding.clone(), 789)])
            .await
            .unwrap();
        assert_eq!(driver.register(&device, RegisterAddress::holding(3)), Some(789));

        let err = driver
            .write_channels(&[
                ValueContainer::new(holding.clone(), 1),
                ValueContainer::new(holding.clone(), 70_000),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Io(_)));
        assert_eq!(driver.register(&device, RegisterAddress::holding(3)), Some(789));

        let err = driver
            .write_channels(&[ValueContainer::new(input, 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Unsupported(_)));
    }

    #[test]
    fn configured_channels_are_provisioned_and_listed() {
        let driver = ModbusDriver::new();
        let device = DeviceLocator::intern(DRIVER_ID, "rtu0", "unit-5", None);
        driver.channel_added(&ChannelLocator::intern(&device, "holding:10"));
        driver.channel_added(&ChannelLocator::intern(&device, "not-a-register"));

        let listed = driver.channel_list(&device).unwrap();
        assert_eq!(listed, vec![ChannelLocator::intern(&device, "holding:10")]);
        assert_eq!(
            "discrete:2".parse::<RegisterAddress>().unwrap().to_string(),
            "discrete:2"
        );
        assert!("holding:-1".parse::<RegisterAddress>().is_err());
    }
}
