//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Blocking wrappers and filters around the callback based driver scans.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::access::{AccessControl, ChannelOperation};
use crate::driver::{ChannelDriver, ChannelScanListener, DeviceScanListener};
use crate::error::{ChannelError, DriverError};
use crate::locator::{ChannelLocator, DeviceLocator};
use crate::Result;

struct ChannelCollector {
    found: Mutex<Vec<ChannelLocator>>,
    done: Mutex<Option<oneshot::Sender<bool>>>,
}

impl ChannelScanListener for ChannelCollector {
    fn channel_found(&self, channel: ChannelLocator) {
        self.found.lock().push(channel);
    }

    fn finished(&self, success: bool) {
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(success);
        }
    }
}

struct DeviceCollector {
    found: Mutex<Vec<DeviceLocator>>,
    done: Mutex<Option<oneshot::Sender<Option<DriverError>>>>,
}

impl DeviceScanListener for DeviceCollector {
    fn device_found(&self, device: DeviceLocator) {
        self.found.lock().push(device);
    }

    fn finished(&self, success: bool, error: Option<DriverError>) {
        if let Some(done) = self.done.lock().take() {
            let outcome = match (success, error) {
                (true, _) => None,
                (false, Some(error)) => Some(error),
                (false, None) => Some(DriverError::io("scan reported failure")),
            };
            let _ = done.send(outcome);
        }
    }
}

/// Run a channel scan to completion. An empty list means nothing was found.
pub(crate) async fn collect_channels(
    driver: Arc<dyn ChannelDriver>,
    device: &DeviceLocator,
    timeout: Duration,
) -> Result<Vec<ChannelLocator>> {
    let (done_tx, done_rx) = oneshot::channel();
    let collector = Arc::new(ChannelCollector {
        found: Mutex::new(Vec::new()),
        done: Mutex::new(Some(done_tx)),
    });
    driver.start_channel_scan(device, collector.clone())?;

    match tokio::time::timeout(timeout, done_rx).await {
        Ok(Ok(true)) => {
            let found = std::mem::take(&mut *collector.found.lock());
            debug!(device = %device, found = found.len(), "channel scan finished");
            Ok(found)
        }
        Ok(Ok(false)) => Err(ChannelError::ScanFailed(format!(
            "channel scan of {device} reported failure"
        ))),
        Ok(Err(_)) => Err(ChannelError::ScanFailed(format!(
            "driver {} abandoned channel scan of {device}",
            driver.driver_id()
        ))),
        Err(_) => Err(ChannelError::ScanFailed(format!(
            "channel scan of {device} timed out after {timeout:?}"
        ))),
    }
}

/// Run a device scan to completion. An empty list means nothing was found.
pub(crate) async fn collect_devices(
    driver: Arc<dyn ChannelDriver>,
    interface_id: &str,
    filter: Option<&str>,
    timeout: Duration,
) -> Result<Vec<DeviceLocator>> {
    let (done_tx, done_rx) = oneshot::channel();
    let collector = Arc::new(DeviceCollector {
        found: Mutex::new(Vec::new()),
        done: Mutex::new(Some(done_tx)),
    });
    driver.start_device_scan(interface_id, filter, collector.clone())?;

    match tokio::time::timeout(timeout, done_rx).await {
        Ok(Ok(None)) => {
            let found = std::mem::take(&mut *collector.found.lock());
            debug!(driver = driver.driver_id(), interface = interface_id, found = found.len(), "device scan finished");
            Ok(found)
        }
        Ok(Ok(Some(error))) => Err(ChannelError::ScanFailed(format!(
            "device scan on {interface_id} failed: {error}"
        ))),
        Ok(Err(_)) => Err(ChannelError::ScanFailed(format!(
            "driver {} abandoned device scan on {interface_id}",
            driver.driver_id()
        ))),
        Err(_) => {
            warn!(driver = driver.driver_id(), interface = interface_id, "device scan timed out, aborting");
            driver.abort_device_scan(interface_id, filter);
            Err(ChannelError::ScanFailed(format!(
                "device scan on {interface_id} timed out after {timeout:?}"
            )))
        }
    }
}

/// Forwards a channel scan to the application, hiding channels it may not see.
pub(crate) struct AuthorizedChannelScan {
    inner: Arc<dyn ChannelScanListener>,
    access: Arc<dyn AccessControl>,
}

impl AuthorizedChannelScan {
    pub(crate) fn new(inner: Arc<dyn ChannelScanListener>, access: Arc<dyn AccessControl>) -> Self {
        Self { inner, access }
    }
}

impl ChannelScanListener for AuthorizedChannelScan {
    fn channel_found(&self, channel: ChannelLocator) {
        if self
            .access
            .authorize(ChannelOperation::DiscoverChannels, &channel)
        {
            self.inner.channel_found(channel);
        }
    }

    fn progress(&self, ratio: f32) {
        self.inner.progress(ratio);
    }

    fn finished(&self, success: bool) {
        self.inner.finished(success);
    }
}
