//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Per-device polling worker.
//!
//! A device group owns the periodic channels of one device. Its worker is the
//! only code touching the schedule; everyone else sets the rebuild flag and
//! wakes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use r_ems_common::time::{now_millis, start_of_day_millis, until};
use r_ems_metrics::ChannelMetrics;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::channel::Channel;
use crate::config::SchedulerSettings;
use crate::dispatch::dispatch;
use crate::driver::ChannelDriver;
use crate::error::ChannelError;
use crate::locator::{ChannelLocator, DeviceLocator};
use crate::schedule::SamplingSchedule;
use crate::value::SampledValue;

struct DeviceGroupShared {
    device: DeviceLocator,
    driver_id: String,
    driver: Weak<dyn ChannelDriver>,
    channels: Mutex<HashMap<ChannelLocator, Arc<Channel>>>,
    rebuild: AtomicBool,
    stopped: AtomicBool,
    wake: Notify,
    settings: SchedulerSettings,
    metrics: Option<ChannelMetrics>,
}

/// Periodic channels of one device together with their polling worker.
pub(crate) struct DeviceGroup {
    shared: Arc<DeviceGroupShared>,
    worker: JoinHandle<()>,
}

impl DeviceGroup {
    /// Start a group bound to `driver` for its whole lifetime.
    pub(crate) fn spawn(
        runtime: &Handle,
        device: DeviceLocator,
        driver: &Arc<dyn ChannelDriver>,
        settings: SchedulerSettings,
        metrics: Option<ChannelMetrics>,
    ) -> Self {
        let shared = Arc::new(DeviceGroupShared {
            device,
            driver_id: driver.driver_id().to_owned(),
            driver: Arc::downgrade(driver),
            channels: Mutex::new(HashMap::new()),
            rebuild: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
            settings,
            metrics,
        });
        info!(device = %shared.device, driver = %shared.driver_id, "device group started");
        let span = info_span!(
            "device_worker",
            device = %shared.device,
            driver = %shared.driver_id
        );
        let worker = runtime.spawn(run(shared.clone()).instrument(span));
        Self { shared, worker }
    }

    pub(crate) fn add_channel(&self, channel: Arc<Channel>) {
        self.shared
            .channels
            .lock()
            .insert(channel.locator().clone(), channel);
        self.request_rebuild();
    }

    /// Remove a channel, returning whether the group is now empty.
    pub(crate) fn remove_channel(&self, locator: &ChannelLocator) -> bool {
        let empty = {
            let mut channels = self.shared.channels.lock();
            channels.remove(locator);
            channels.is_empty()
        };
        self.request_rebuild();
        empty
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.channels.lock().len()
    }

    pub(crate) fn request_rebuild(&self) {
        self.shared.rebuild.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    /// Ask the worker to exit. An in-flight read completes and is dispatched first.
    pub(crate) fn stop(self) -> JoinHandle<()> {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.wake.notify_one();
        info!(device = %self.shared.device, "device group stopping");
        self.worker
    }
}

async fn run(shared: Arc<DeviceGroupShared>) {
    let settings = shared.settings;
    let mut schedule = SamplingSchedule::default();
    loop {
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }
        if shared.rebuild.swap(false, Ordering::AcqRel) {
            schedule = shared.build_schedule(&schedule);
        }

        let now = now_millis();
        let wait = match schedule.next_due_ms() {
            None => Some(settings.idle_sleep),
            Some(due) if due > now => Some(until(due, now).min(settings.max_sleep)),
            Some(_) => None,
        };
        if let Some(wait) = wait {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            continue;
        }

        let Some(entry) = schedule.pop_next() else {
            continue;
        };
        shared.sample(&entry.channels).await;
        schedule.reschedule(&entry, now_millis());
    }
    debug!(device = %shared.device, "device worker exited");
}

impl DeviceGroupShared {
    fn build_schedule(&self, previous: &SamplingSchedule) -> SamplingSchedule {
        let now = now_millis();
        let periods: Vec<(ChannelLocator, i64)> = self
            .channels
            .lock()
            .values()
            .map(|channel| {
                (
                    channel.locator().clone(),
                    channel.configuration().sampling_period_ms,
                )
            })
            .collect();
        let schedule = previous.rebuild(start_of_day_millis(now), now, periods);
        debug!(
            device = %self.device,
            channels = schedule.channel_count(),
            next_due = ?schedule.next_due_ms(),
            "schedule rebuilt"
        );
        schedule
    }

    async fn sample(&self, due: &[ChannelLocator]) {
        let channels: Vec<Arc<Channel>> = {
            let members = self.channels.lock();
            due.iter().filter_map(|l| members.get(l).cloned()).collect()
        };
        if channels.is_empty() {
            return;
        }
        let batch: Vec<ChannelLocator> = channels.iter().map(|c| c.locator().clone()).collect();

        let outcome = match self.driver.upgrade() {
            Some(driver) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_read(&self.driver_id, batch.len());
                }
                driver
                    .read_channels(&batch)
                    .await
                    .map_err(ChannelError::from)
            }
            None => Err(ChannelError::DriverUnavailable(self.driver_id.clone())),
        };

        let samples = match outcome {
            Ok(samples) if samples.len() == batch.len() => {
                debug!(device = %self.device, batch = batch.len(), "batch read");
                samples
            }
            Ok(samples) => {
                warn!(
                    device = %self.device,
                    expected = batch.len(),
                    returned = samples.len(),
                    "driver returned a malformed batch, marking samples bad"
                );
                self.failed(batch.len())
            }
            Err(err) => {
                warn!(device = %self.device, error = %err, "batched read failed, marking samples bad");
                self.failed(batch.len())
            }
        };

        dispatch(channels.into_iter().zip(samples).collect(), self.metrics.as_ref());
    }

    fn failed(&self, len: usize) -> Vec<SampledValue> {
        if let Some(metrics) = &self.metrics {
            metrics.record_read_failure(&self.driver_id);
        }
        let now = Utc::now();
        vec![SampledValue::bad(now); len]
    }
}
