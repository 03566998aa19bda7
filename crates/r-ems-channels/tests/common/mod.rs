//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "test"
//! ems_description: "Shared fixtures for channel manager integration tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use r_ems_channels::{
    ChannelDriver, ChannelEventListener, ChannelLocator, ChannelManager, ChannelScanListener,
    ChannelUpdateListener, DeviceLocator, DeviceScanListener, DriverError, EventType,
    SampledValue, SampledValueContainer, SchedulerSettings, Value, ValueContainer,
};

pub fn fast_settings() -> SchedulerSettings {
    SchedulerSettings {
        max_sleep: Duration::from_millis(20),
        idle_sleep: Duration::from_millis(20),
        scan_timeout: Duration::from_secs(2),
    }
}

pub fn manager_with(driver: Arc<RecordingDriver>) -> ChannelManager {
    let manager = ChannelManager::new(fast_settings());
    manager.register_driver(driver);
    manager
}

pub fn channel(driver: &str, device: &str, address: &str) -> ChannelLocator {
    let device = DeviceLocator::intern(driver, "bus0", device, None);
    ChannelLocator::intern(&device, address)
}

/// Driver double recording every interaction.
pub struct RecordingDriver {
    id: String,
    push: bool,
    values: Mutex<HashMap<ChannelLocator, Value>>,
    reads: AtomicUsize,
    batches: Mutex<Vec<Vec<ChannelLocator>>>,
    events: Mutex<Vec<String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    written: Mutex<Vec<ValueContainer>>,
    listener: Mutex<Option<Arc<dyn ChannelUpdateListener>>>,
    listened: Mutex<Vec<ChannelLocator>>,
    channel_scan: Mutex<(Vec<ChannelLocator>, bool)>,
    device_scan: Mutex<(Vec<DeviceLocator>, bool)>,
    shut_down: AtomicBool,
}

impl RecordingDriver {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id, false))
    }

    pub fn with_push(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id, true))
    }

    fn build(id: &str, push: bool) -> Self {
        Self {
            id: id.to_owned(),
            push,
            values: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            listened: Mutex::new(Vec::new()),
            channel_scan: Mutex::new((Vec::new(), true)),
            device_scan: Mutex::new((Vec::new(), true)),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn set_value(&self, channel: &ChannelLocator, value: impl Into<Value>) {
        self.values.lock().insert(channel.clone(), value.into());
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<ChannelLocator>> {
        self.batches.lock().clone()
    }

    pub fn clear_batches(&self) {
        self.batches.lock().clear();
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn written(&self) -> Vec<ValueContainer> {
        self.written.lock().clone()
    }

    pub fn listened(&self) -> Vec<ChannelLocator> {
        self.listened.lock().clone()
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn set_channel_scan(&self, found: Vec<ChannelLocator>, success: bool) {
        *self.channel_scan.lock() = (found, success);
    }

    pub fn set_device_scan(&self, found: Vec<DeviceLocator>, success: bool) {
        *self.device_scan.lock() = (found, success);
    }

    /// Deliver a spontaneous value through the registered push listener.
    pub fn push(&self, channel: &ChannelLocator, value: impl Into<Value>) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener.channels_updated(vec![SampledValueContainer::new(
                channel.clone(),
                SampledValue::good(value, Utc::now()),
            )]);
        }
    }

    pub fn fail_link(&self, message: &str) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener.exception_occurred(DriverError::io(message));
        }
    }
}

#[async_trait]
impl ChannelDriver for RecordingDriver {
    fn driver_id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "recording test driver"
    }

    fn channel_added(&self, channel: &ChannelLocator) {
        self.events.lock().push(format!("added:{channel}"));
    }

    fn channel_removed(&self, channel: &ChannelLocator) {
        self.events.lock().push(format!("removed:{channel}"));
    }

    async fn read_channels(
        &self,
        channels: &[ChannelLocator],
    ) -> Result<Vec<SampledValue>, DriverError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().push(channels.to_vec());
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DriverError::io("bus timeout"));
        }
        let values = self.values.lock();
        let now = Utc::now();
        Ok(channels
            .iter()
            .map(|channel| {
                let value = values.get(channel).cloned().unwrap_or(Value::Integer(0));
                SampledValue::good(value, now)
            })
            .collect())
    }

    async fn write_channels(&self, values: &[ValueContainer]) -> Result<(), DriverError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DriverError::io("write rejected"));
        }
        self.written.lock().extend_from_slice(values);
        Ok(())
    }

    fn listen_channels(
        &self,
        channels: &[ChannelLocator],
        listener: Arc<dyn ChannelUpdateListener>,
    ) -> Result<(), DriverError> {
        if !self.push {
            return Err(DriverError::unsupported("listen_channels"));
        }
        *self.listened.lock() = channels.to_vec();
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    fn start_channel_scan(
        &self,
        _device: &DeviceLocator,
        listener: Arc<dyn ChannelScanListener>,
    ) -> Result<(), DriverError> {
        let (found, success) = self.channel_scan.lock().clone();
        for (index, channel) in found.iter().enumerate() {
            listener.channel_found(channel.clone());
            listener.progress((index + 1) as f32 / found.len() as f32);
        }
        listener.finished(success);
        Ok(())
    }

    fn start_device_scan(
        &self,
        _interface_id: &str,
        _filter: Option<&str>,
        listener: Arc<dyn DeviceScanListener>,
    ) -> Result<(), DriverError> {
        let (found, success) = self.device_scan.lock().clone();
        for device in found {
            listener.device_found(device);
        }
        let error = (!success).then(|| DriverError::NoSuchInterface("bus0".into()));
        listener.finished(success, error);
        Ok(())
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Listener double storing every event.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(EventType, Vec<SampledValueContainer>)>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, kind: EventType) -> usize {
        self.events.lock().iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn events(&self) -> Vec<(EventType, Vec<SampledValueContainer>)> {
        self.events.lock().clone()
    }
}

impl ChannelEventListener for RecordingListener {
    fn channel_event(&self, event: EventType, samples: &[SampledValueContainer]) {
        self.events.lock().push((event, samples.to_vec()));
    }
}

pub fn as_listener(listener: &Arc<RecordingListener>) -> Arc<dyn ChannelEventListener> {
    listener.clone()
}
