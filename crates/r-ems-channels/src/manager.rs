//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Channel registry and the public façade applications talk to.
//!
//! Registry mutations are serialised by `inner`. When both are needed, `inner`
//! is locked before `channels`; push callbacks and readers only ever take
//! `channels`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use r_ems_metrics::ChannelMetrics;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::access::{AccessControl, ChannelOperation, PermitAll};
use crate::channel::Channel;
use crate::config::{ChannelConfiguration, SamplingMode, SchedulerSettings};
use crate::device::DeviceGroup;
use crate::dispatch::{dispatch, ChannelEventListener, EventType};
use crate::driver::{
    ChannelDriver, ChannelScanListener, ChannelUpdateListener, DeviceListener, DeviceScanListener,
    DriverRegistry,
};
use crate::error::{ChannelError, DriverError};
use crate::locator::{ChannelLocator, DeviceLocator};
use crate::scan::{collect_channels, collect_devices, AuthorizedChannelScan};
use crate::value::{SampledValue, SampledValueContainer, Value, ValueContainer};
use crate::Result;

type ChannelMap = RwLock<HashMap<ChannelLocator, Arc<Channel>>>;

#[derive(Default)]
struct RegistryInner {
    groups: HashMap<DeviceLocator, DeviceGroup>,
    subscriptions: HashMap<String, PushSubscription>,
    retired: Vec<JoinHandle<()>>,
}

/// Channels of one driver that are delivered by push.
struct PushSubscription {
    driver: Weak<dyn ChannelDriver>,
    channels: Vec<ChannelLocator>,
    router: Arc<PushRouter>,
}

/// Routes driver pushes into the dispatcher.
struct PushRouter {
    driver_id: String,
    channels: Weak<ChannelMap>,
    metrics: Option<ChannelMetrics>,
}

impl PushRouter {
    fn pushed_channel(&self, channel: &Channel) -> bool {
        channel.locator().driver_id() == self.driver_id
            && channel.configuration().sampling_mode() == SamplingMode::Pushed
    }
}

impl ChannelUpdateListener for PushRouter {
    fn channels_updated(&self, samples: Vec<SampledValueContainer>) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        let batch: Vec<(Arc<Channel>, SampledValue)> = {
            let channels = channels.read();
            samples
                .into_iter()
                .filter_map(|container| match channels.get(&container.locator) {
                    Some(channel) if self.pushed_channel(channel) => {
                        Some((channel.clone(), container.sample))
                    }
                    _ => {
                        trace!(channel = %container.locator, "dropping push for unsubscribed channel");
                        None
                    }
                })
                .collect()
        };
        if batch.is_empty() {
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_pushed(&self.driver_id, batch.len());
        }
        dispatch(batch, self.metrics.as_ref());
    }

    fn exception_occurred(&self, error: DriverError) {
        warn!(driver = %self.driver_id, error = %error, "push delivery failed, marking channels bad");
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        let now = Utc::now();
        let batch: Vec<(Arc<Channel>, SampledValue)> = channels
            .read()
            .values()
            .filter(|channel| self.pushed_channel(channel))
            .map(|channel| (channel.clone(), SampledValue::bad(now)))
            .collect();
        dispatch(batch, self.metrics.as_ref());
    }
}

/// Registry of configured channels and entry point for applications.
pub struct ChannelManager {
    drivers: Arc<DriverRegistry>,
    access: Arc<dyn AccessControl>,
    settings: SchedulerSettings,
    metrics: Option<ChannelMetrics>,
    channels: Arc<ChannelMap>,
    inner: Mutex<RegistryInner>,
}

impl ChannelManager {
    /// Manager with its own driver registry and no access restrictions.
    pub fn new(settings: SchedulerSettings) -> Self {
        Self {
            drivers: Arc::new(DriverRegistry::new()),
            access: Arc::new(PermitAll),
            settings,
            metrics: None,
            channels: Arc::new(RwLock::new(HashMap::new())),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn with_access(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn with_metrics(mut self, metrics: ChannelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Share a driver registry with other components.
    pub fn with_driver_registry(mut self, drivers: Arc<DriverRegistry>) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn register_driver(&self, driver: Arc<dyn ChannelDriver>) -> Option<Arc<dyn ChannelDriver>> {
        self.drivers.register(driver)
    }

    /// Device groups bound to the driver keep running and report it unavailable.
    pub fn unregister_driver(&self, driver_id: &str) -> Option<Arc<dyn ChannelDriver>> {
        self.drivers.unregister(driver_id)
    }

    pub fn device_locator(
        &self,
        driver_id: &str,
        interface_id: &str,
        device_address: &str,
        parameters: Option<String>,
    ) -> DeviceLocator {
        DeviceLocator::intern(driver_id, interface_id, device_address, parameters)
    }

    pub fn channel_locator(&self, device: &DeviceLocator, channel_address: &str) -> ChannelLocator {
        ChannelLocator::intern(device, channel_address)
    }

    /// Configure a channel and start delivering its values.
    ///
    /// Periodic channels need a running tokio runtime for their device worker.
    pub fn add_channel(&self, config: ChannelConfiguration) -> Result<()> {
        let locator = config.locator.clone();
        self.authorize(ChannelOperation::AddChannel, &locator)?;
        config.validate()?;
        let mode = config.sampling_mode();

        let mut inner = self.inner.lock();
        if self.channels.read().contains_key(&locator) {
            return Err(ChannelError::AlreadyExists(locator));
        }
        let driver = self.drivers.resolve(locator.driver_id())?;
        let channel = Arc::new(Channel::new(config));

        match mode {
            SamplingMode::Periodic(_) => {
                let device = locator.device().clone();
                if !inner.groups.contains_key(&device) {
                    let runtime = Handle::try_current().map_err(|_| {
                        ChannelError::Configuration(
                            "periodic channels require a running tokio runtime".into(),
                        )
                    })?;
                    let group = DeviceGroup::spawn(
                        &runtime,
                        device.clone(),
                        &driver,
                        self.settings,
                        self.metrics.clone(),
                    );
                    inner.groups.insert(device.clone(), group);
                }
                self.channels.write().insert(locator.clone(), channel.clone());
                if let Some(group) = inner.groups.get(&device) {
                    group.add_channel(channel);
                    debug!(device = %device, channels = group.len(), "device group updated");
                }
            }
            SamplingMode::Pushed => {
                let driver_id = locator.driver_id().to_owned();
                let (mut subscribed, router) = match inner.subscriptions.get(&driver_id) {
                    Some(existing) => (existing.channels.clone(), existing.router.clone()),
                    None => (
                        Vec::new(),
                        Arc::new(PushRouter {
                            driver_id: driver_id.clone(),
                            channels: Arc::downgrade(&self.channels),
                            metrics: self.metrics.clone(),
                        }),
                    ),
                };
                subscribed.push(locator.clone());
                driver.listen_channels(&subscribed, router.clone())?;
                self.channels.write().insert(locator.clone(), channel);
                inner.subscriptions.insert(
                    driver_id,
                    PushSubscription {
                        driver: Arc::downgrade(&driver),
                        channels: subscribed,
                        router,
                    },
                );
            }
            SamplingMode::OnDemand => {
                self.channels.write().insert(locator.clone(), channel);
            }
        }

        driver.channel_added(&locator);
        self.publish_gauges(&inner);
        info!(channel = %locator, mode = ?mode, "channel added");
        Ok(())
    }

    /// Remove a channel. Stops the device worker when its last channel goes.
    pub fn delete_channel(&self, locator: &ChannelLocator) -> Result<()> {
        self.authorize(ChannelOperation::DeleteChannel, locator)?;

        let mut inner = self.inner.lock();
        let channel = self
            .channels
            .write()
            .remove(locator)
            .ok_or_else(|| ChannelError::NotConfigured(locator.clone()))?;

        match channel.configuration().sampling_mode() {
            SamplingMode::Periodic(_) => {
                let device = locator.device();
                let empty = inner
                    .groups
                    .get(device)
                    .map_or(false, |group| group.remove_channel(locator));
                if empty {
                    if let Some(group) = inner.groups.remove(device) {
                        let handle = group.stop();
                        inner.retired.push(handle);
                    }
                }
            }
            SamplingMode::Pushed => {
                let driver_id = locator.driver_id();
                let cancelled = match inner.subscriptions.get_mut(driver_id) {
                    Some(subscription) => {
                        subscription.channels.retain(|c| c != locator);
                        if let Some(driver) = subscription.driver.upgrade() {
                            if let Err(err) = driver
                                .listen_channels(&subscription.channels, subscription.router.clone())
                            {
                                warn!(driver = driver_id, error = %err, "failed to shrink push subscription");
                            }
                        }
                        subscription.channels.is_empty()
                    }
                    None => false,
                };
                if cancelled {
                    inner.subscriptions.remove(driver_id);
                }
            }
            SamplingMode::OnDemand => {}
        }

        channel.clear_listeners();
        if let Ok(driver) = self.drivers.resolve(locator.driver_id()) {
            driver.channel_removed(locator);
        }
        inner.retired.retain(|handle| !handle.is_finished());
        self.publish_gauges(&inner);
        info!(channel = %locator, "channel deleted");
        Ok(())
    }

    pub fn get_channel_configuration(&self, locator: &ChannelLocator) -> Result<ChannelConfiguration> {
        Ok(self.channel(locator)?.configuration().clone())
    }

    /// Latest value of a configured channel.
    ///
    /// Periodic and pushed channels answer from the cache. On-demand channels
    /// are read from the driver now, and that read is dispatched to listeners.
    pub async fn read_value(&self, locator: &ChannelLocator) -> Result<SampledValue> {
        self.authorize(ChannelOperation::ReadChannel, locator)?;
        let channel = self.channel(locator)?;
        let direction = channel.configuration().direction;
        if !direction.is_readable() {
            return Err(ChannelError::Configuration(format!(
                "channel {locator} is {direction} and cannot be read"
            )));
        }
        if channel.configuration().sampling_mode() != SamplingMode::OnDemand {
            return channel
                .latest()
                .ok_or_else(|| ChannelError::NoValue(locator.clone()));
        }

        let driver = self.bound_driver(locator)?;
        let mut samples = driver
            .read_channels(std::slice::from_ref(locator))
            .await
            .map_err(ChannelError::from)?;
        let sample = match samples.pop() {
            Some(sample) if samples.is_empty() => sample,
            _ => {
                return Err(ChannelError::Io(DriverError::io(format!(
                    "driver {} returned a malformed batch",
                    driver.driver_id()
                ))))
            }
        };
        dispatch(vec![(channel, sample.clone())], self.metrics.as_ref());
        Ok(sample)
    }

    pub async fn write_value(&self, locator: &ChannelLocator, value: Value) -> Result<()> {
        self.authorize(ChannelOperation::WriteChannel, locator)?;
        let channel = self.channel(locator)?;
        let direction = channel.configuration().direction;
        if !direction.is_writable() {
            return Err(ChannelError::Configuration(format!(
                "channel {locator} is {direction} and cannot be written"
            )));
        }
        let driver = self.bound_driver(locator)?;
        driver
            .write_channels(&[ValueContainer::new(locator.clone(), value)])
            .await
            .map_err(|err| {
                warn!(channel = %locator, error = %err, "write failed");
                ChannelError::from(err)
            })
    }

    /// One outcome per locator; a failing element never aborts the rest.
    pub async fn read_multiple(&self, locators: &[ChannelLocator]) -> Vec<Result<SampledValue>> {
        let mut results = Vec::with_capacity(locators.len());
        for locator in locators {
            results.push(self.read_value(locator).await);
        }
        results
    }

    /// One outcome per element; a failing element never aborts the rest.
    pub async fn write_multiple(&self, values: &[ValueContainer]) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(values.len());
        for container in values {
            results.push(self.write_value(&container.locator, container.value.clone()).await);
        }
        results
    }

    /// Deliver every sample of the channels. Registering twice is a no-op.
    pub fn register_update_listener(
        &self,
        locators: &[ChannelLocator],
        listener: &Arc<dyn ChannelEventListener>,
    ) -> Result<()> {
        self.register_listener(EventType::Update, locators, listener)
    }

    /// Deliver samples whose value or quality changed. Registering twice is a no-op.
    pub fn register_changed_listener(
        &self,
        locators: &[ChannelLocator],
        listener: &Arc<dyn ChannelEventListener>,
    ) -> Result<()> {
        self.register_listener(EventType::ValueChanged, locators, listener)
    }

    pub fn unregister_update_listener(
        &self,
        locators: &[ChannelLocator],
        listener: &Arc<dyn ChannelEventListener>,
    ) {
        self.unregister_listener(EventType::Update, locators, listener);
    }

    pub fn unregister_changed_listener(
        &self,
        locators: &[ChannelLocator],
        listener: &Arc<dyn ChannelEventListener>,
    ) {
        self.unregister_listener(EventType::ValueChanged, locators, listener);
    }

    /// Blocking channel scan, limited to channels the caller may discover.
    pub async fn discover_channels(&self, device: &DeviceLocator) -> Result<Vec<ChannelLocator>> {
        let driver = self.drivers.resolve(device.driver_id())?;
        let found = collect_channels(driver, device, self.settings.scan_timeout).await?;
        Ok(found
            .into_iter()
            .filter(|channel| {
                self.access
                    .authorize(ChannelOperation::DiscoverChannels, channel)
            })
            .collect())
    }

    /// Callback variant of [`ChannelManager::discover_channels`].
    pub fn start_channel_discovery(
        &self,
        device: &DeviceLocator,
        listener: Arc<dyn ChannelScanListener>,
    ) -> Result<()> {
        let driver = self.drivers.resolve(device.driver_id())?;
        let filtered = Arc::new(AuthorizedChannelScan::new(listener, self.access.clone()));
        driver.start_channel_scan(device, filtered)?;
        Ok(())
    }

    /// Blocking device scan on one interface of a driver.
    pub async fn discover_devices(
        &self,
        driver_id: &str,
        interface_id: &str,
        filter: Option<&str>,
    ) -> Result<Vec<DeviceLocator>> {
        let driver = self.drivers.resolve(driver_id)?;
        collect_devices(driver, interface_id, filter, self.settings.scan_timeout).await
    }

    /// Callback variant of [`ChannelManager::discover_devices`].
    pub fn start_device_discovery(
        &self,
        driver_id: &str,
        interface_id: &str,
        filter: Option<&str>,
        listener: Arc<dyn DeviceScanListener>,
    ) -> Result<()> {
        let driver = self.drivers.resolve(driver_id)?;
        driver.start_device_scan(interface_id, filter, listener)?;
        Ok(())
    }

    pub fn abort_device_scan(
        &self,
        driver_id: &str,
        interface_id: &str,
        filter: Option<&str>,
    ) -> Result<()> {
        self.drivers
            .resolve(driver_id)?
            .abort_device_scan(interface_id, filter);
        Ok(())
    }

    /// Channels a driver reports for a device without scanning.
    pub fn channel_list(&self, device: &DeviceLocator) -> Result<Vec<ChannelLocator>> {
        let driver = self.drivers.resolve(device.driver_id())?;
        Ok(driver.channel_list(device)?)
    }

    pub fn add_device_listener(
        &self,
        driver_id: &str,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<()> {
        self.drivers
            .resolve(driver_id)?
            .add_device_listener(listener)?;
        Ok(())
    }

    pub fn remove_device_listener(&self, driver_id: &str, listener: &Arc<dyn DeviceListener>) {
        if let Ok(driver) = self.drivers.resolve(driver_id) {
            driver.remove_device_listener(listener);
        }
    }

    pub fn driver_description(&self, driver_id: &str) -> Option<String> {
        self.drivers
            .resolve(driver_id)
            .ok()
            .map(|driver| driver.description().to_owned())
    }

    /// Read channels that are not configured, straight from their drivers.
    ///
    /// Elements are batched per driver; a failed batch fails each of its elements.
    pub async fn read_unconfigured_channels(
        &self,
        locators: &[ChannelLocator],
    ) -> Vec<Result<SampledValue>> {
        let mut results: Vec<Option<Result<SampledValue>>> = vec![None; locators.len()];
        let mut batches: Vec<(String, Vec<usize>)> = Vec::new();
        for (index, locator) in locators.iter().enumerate() {
            if let Err(err) = self.authorize(ChannelOperation::ReadChannel, locator) {
                results[index] = Some(Err(err));
                continue;
            }
            push_indexed(&mut batches, locator.driver_id(), index);
        }

        for (driver_id, indices) in batches {
            let batch: Vec<ChannelLocator> = indices.iter().map(|&i| locators[i].clone()).collect();
            let outcome = match self.drivers.resolve(&driver_id) {
                Ok(driver) => driver
                    .read_channels(&batch)
                    .await
                    .map_err(ChannelError::from)
                    .and_then(|samples| {
                        if samples.len() == batch.len() {
                            Ok(samples)
                        } else {
                            Err(ChannelError::Io(DriverError::io(format!(
                                "driver {driver_id} returned a malformed batch"
                            ))))
                        }
                    }),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(samples) => {
                    for (index, sample) in indices.into_iter().zip(samples) {
                        results[index] = Some(Ok(sample));
                    }
                }
                Err(err) => {
                    for index in indices {
                        results[index] = Some(Err(err.clone()));
                    }
                }
            }
        }
        finish_indexed(results)
    }

    /// Write channels that are not configured, batched per driver.
    pub async fn write_unconfigured_channels(&self, values: &[ValueContainer]) -> Vec<Result<()>> {
        let mut results: Vec<Option<Result<()>>> = vec![None; values.len()];
        let mut batches: Vec<(String, Vec<usize>)> = Vec::new();
        for (index, container) in values.iter().enumerate() {
            if let Err(err) = self.authorize(ChannelOperation::WriteChannel, &container.locator) {
                results[index] = Some(Err(err));
                continue;
            }
            push_indexed(&mut batches, container.locator.driver_id(), index);
        }

        for (driver_id, indices) in batches {
            let batch: Vec<ValueContainer> = indices.iter().map(|&i| values[i].clone()).collect();
            let outcome = match self.drivers.resolve(&driver_id) {
                Ok(driver) => driver
                    .write_channels(&batch)
                    .await
                    .map_err(ChannelError::from),
                Err(err) => Err(err),
            };
            for index in indices {
                results[index] = Some(outcome.clone());
            }
        }
        finish_indexed(results)
    }

    pub fn driver_ids(&self) -> Vec<String> {
        self.drivers.driver_ids()
    }

    /// Configured locators ordered by their textual form.
    pub fn configured_channels(&self) -> Vec<ChannelLocator> {
        let mut locators: Vec<ChannelLocator> = self.channels.read().keys().cloned().collect();
        locators.sort_by_cached_key(|locator| locator.to_string());
        locators
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Devices with a running polling worker.
    pub fn device_group_count(&self) -> usize {
        self.inner.lock().groups.len()
    }

    /// Stop every device worker, wait for them, and shut the drivers down.
    ///
    /// Channel configurations are kept; a later periodic `add_channel` starts
    /// workers again.
    pub async fn shutdown(&self) {
        let (groups, retired, subscriptions) = {
            let mut inner = self.inner.lock();
            let groups: Vec<DeviceGroup> = inner.groups.drain().map(|(_, group)| group).collect();
            let retired = std::mem::take(&mut inner.retired);
            let subscriptions: Vec<PushSubscription> =
                inner.subscriptions.drain().map(|(_, sub)| sub).collect();
            self.publish_gauges(&inner);
            (groups, retired, subscriptions)
        };
        info!(groups = groups.len(), "channel manager shutting down");

        for subscription in subscriptions {
            if let Some(driver) = subscription.driver.upgrade() {
                if let Err(err) = driver.listen_channels(&[], subscription.router.clone()) {
                    debug!(driver = driver.driver_id(), error = %err, "push subscription not cancelled");
                }
            }
        }

        let handles = groups.into_iter().map(DeviceGroup::stop).chain(retired);
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "device worker terminated abnormally");
            }
        }

        for driver in self.drivers.snapshot() {
            driver.shutdown().await;
        }
        info!("channel manager stopped");
    }

    fn channel(&self, locator: &ChannelLocator) -> Result<Arc<Channel>> {
        self.channels
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| ChannelError::NotConfigured(locator.clone()))
    }

    fn bound_driver(&self, locator: &ChannelLocator) -> Result<Arc<dyn ChannelDriver>> {
        self.drivers
            .resolve(locator.driver_id())
            .map_err(|_| ChannelError::DriverUnavailable(locator.driver_id().to_owned()))
    }

    fn authorize(&self, operation: ChannelOperation, locator: &ChannelLocator) -> Result<()> {
        if self.access.authorize(operation, locator) {
            Ok(())
        } else {
            warn!(%operation, channel = %locator, "access denied");
            Err(ChannelError::Unauthorized {
                operation,
                locator: locator.clone(),
            })
        }
    }

    fn register_listener(
        &self,
        kind: EventType,
        locators: &[ChannelLocator],
        listener: &Arc<dyn ChannelEventListener>,
    ) -> Result<()> {
        let channels = locators
            .iter()
            .map(|locator| {
                self.authorize(ChannelOperation::ReadChannel, locator)?;
                self.channel(locator)
            })
            .collect::<Result<Vec<_>>>()?;
        for channel in channels {
            channel.add_listener(kind, listener);
        }
        Ok(())
    }

    fn unregister_listener(
        &self,
        kind: EventType,
        locators: &[ChannelLocator],
        listener: &Arc<dyn ChannelEventListener>,
    ) {
        let channels = self.channels.read();
        for locator in locators {
            if let Some(channel) = channels.get(locator) {
                channel.remove_listener(kind, listener);
            }
        }
    }

    fn publish_gauges(&self, inner: &RegistryInner) {
        if let Some(metrics) = &self.metrics {
            metrics.set_channels(self.channels.read().len());
            metrics.set_device_groups(inner.groups.len());
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        for (_, group) in self.inner.get_mut().groups.drain() {
            drop(group.stop());
        }
    }
}

fn push_indexed(batches: &mut Vec<(String, Vec<usize>)>, driver_id: &str, index: usize) {
    match batches.iter_mut().find(|(id, _)| id == driver_id) {
        Some((_, indices)) => indices.push(index),
        None => batches.push((driver_id.to_owned(), vec![index])),
    }
}

fn finish_indexed<T>(results: Vec<Option<Result<T>>>) -> Vec<Result<T>> {
    results
        .into_iter()
        .map(|result| {
            result.unwrap_or_else(|| {
                Err(ChannelError::Configuration("element was not processed".into()))
            })
        })
        .collect()
}
