//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory reference drivers for field device channels."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use r_ems_channels::{
    ChannelDriver, ChannelLocator, ChannelUpdateListener, DeviceListener, DeviceLocator,
    DriverError, SampledValue, SampledValueContainer, Value, ValueContainer,
};
use tracing::{debug, info, warn};

/// Driver id channels use to address this driver.
pub const DRIVER_ID: &str = "iec104";

type Subscription = (Vec<ChannelLocator>, Arc<dyn ChannelUpdateListener>);

/// Telecontrol driver whose stations report spontaneously.
///
/// Information objects are addressed by their IOA as the channel address.
/// Values arrive through [`Iec104Driver::spontaneous`] and are forwarded to
/// the subscription installed by the channel manager.
#[derive(Default)]
pub struct Iec104Driver {
    points: RwLock<HashMap<ChannelLocator, SampledValue>>,
    subscription: Mutex<Option<Subscription>>,
    device_listeners: Mutex<Vec<Arc<dyn DeviceListener>>>,
}

impl Iec104Driver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Record a spontaneous transmission from a station and forward it if subscribed.
    pub fn spontaneous(&self, point: &ChannelLocator, value: impl Into<Value>) {
        let sample = SampledValue::good(value, Utc::now());
        self.points.write().insert(point.clone(), sample.clone());
        self.forward(vec![SampledValueContainer::new(point.clone(), sample)]);
    }

    /// The connection to the controlled stations dropped.
    pub fn link_lost(&self, reason: &str) {
        warn!(reason, "iec104 link lost");
        let listener = self.subscription.lock().as_ref().map(|(_, l)| l.clone());
        if let Some(listener) = listener {
            listener.exception_occurred(DriverError::io(reason));
        }
    }

    /// A station became reachable.
    pub fn announce_station(&self, station: DeviceLocator) {
        info!(%station, "iec104 station announced");
        for listener in self.device_listeners.lock().clone() {
            listener.device_added(station.clone());
        }
    }

    pub fn withdraw_station(&self, station: DeviceLocator) {
        info!(%station, "iec104 station withdrawn");
        self.points
            .write()
            .retain(|point, _| point.device() != &station);
        for listener in self.device_listeners.lock().clone() {
            listener.device_removed(station.clone());
        }
    }

    pub fn is_subscribed(&self, point: &ChannelLocator) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .map_or(false, |(points, _)| points.contains(point))
    }

    fn forward(&self, samples: Vec<SampledValueContainer>) {
        let target = {
            let guard = self.subscription.lock();
            guard.as_ref().map(|(points, listener)| {
                let subscribed: Vec<SampledValueContainer> = samples
                    .into_iter()
                    .filter(|s| points.contains(&s.locator))
                    .collect();
                (subscribed, listener.clone())
            })
        };
        match target {
            Some((subscribed, listener)) if !subscribed.is_empty() => {
                listener.channels_updated(subscribed)
            }
            _ => debug!("iec104 transmission without subscriber"),
        }
    }
}

#[async_trait]
impl ChannelDriver for Iec104Driver {
    fn driver_id(&self) -> &str {
        DRIVER_ID
    }

    fn description(&self) -> &str {
        "IEC 60870-5-104 spontaneous telecontrol driver"
    }

    async fn read_channels(
        &self,
        channels: &[ChannelLocator],
    ) -> Result<Vec<SampledValue>, DriverError> {
        let points = self.points.read();
        let now = Utc::now();
        Ok(channels
            .iter()
            .map(|point| points.get(point).cloned().unwrap_or_else(|| SampledValue::bad(now)))
            .collect())
    }

    /// Commands are confirmed by the station echoing the new state.
    async fn write_channels(&self, values: &[ValueContainer]) -> Result<(), DriverError> {
        let now = Utc::now();
        let echoed: Vec<SampledValueContainer> = values
            .iter()
            .map(|c| SampledValueContainer::new(c.locator.clone(), SampledValue::good(c.value.clone(), now)))
            .collect();
        {
            let mut points = self.points.write();
            for echo in &echoed {
                points.insert(echo.locator.clone(), echo.sample.clone());
            }
        }
        self.forward(echoed);
        Ok(())
    }

    fn listen_channels(
        &self,
        channels: &[ChannelLocator],
        listener: Arc<dyn ChannelUpdateListener>,
    ) -> Result<(), DriverError> {
        let mut subscription = self.subscription.lock();
        if channels.is_empty() {
            *subscription = None;
        } else {
            *subscription = Some((channels.to_vec(), listener));
        }
        debug!(points = channels.len(), "iec104 subscription replaced");
        Ok(())
    }

    fn channel_list(&self, device: &DeviceLocator) -> Result<Vec<ChannelLocator>, DriverError> {
        let mut listed: Vec<ChannelLocator> = self
            .points
            .read()
            .keys()
            .filter(|point| point.device() == device)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.channel_address().cmp(b.channel_address()));
        Ok(listed)
    }

    fn add_device_listener(&self, listener: Arc<dyn DeviceListener>) -> Result<(), DriverError> {
        let mut listeners = self.device_listeners.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
        Ok(())
    }

    fn remove_device_listener(&self, listener: &Arc<dyn DeviceListener>) {
        self.device_listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    async fn shutdown(&self) {
        self.subscription.lock().take();
        self.device_listeners.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Sink {
        samples: Mutex<Vec<SampledValueContainer>>,
        errors: Mutex<Vec<DriverError>>,
    }

    impl ChannelUpdateListener for Sink {
        fn channels_updated(&self, samples: Vec<SampledValueContainer>) {
            self.samples.lock().extend(samples);
        }

        fn exception_occurred(&self, error: DriverError) {
            self.errors.lock().push(error);
        }
    }

    #[derive(Default)]
    struct Stations {
        added: Mutex<Vec<DeviceLocator>>,
        removed: Mutex<Vec<DeviceLocator>>,
    }

    impl DeviceListener for Stations {
        fn device_added(&self, device: DeviceLocator) {
            self.added.lock().push(device);
        }

        fn device_removed(&self, device: DeviceLocator) {
            self.removed.lock().push(device);
        }
    }

    fn station(name: &str) -> DeviceLocator {
        DeviceLocator::intern(DRIVER_ID, "link0", name, None)
    }

    #[test]
    fn only_subscribed_points_are_forwarded() {
        let driver = Iec104Driver::new();
        let station = station("rtu-1");
        let breaker = ChannelLocator::intern(&station, "1001");
        let other = ChannelLocator::intern(&station, "1002");
        let sink = Arc::new(Sink::default());
        driver
            .listen_channels(&[breaker.clone()], sink.clone())
            .unwrap();

        driver.spontaneous(&breaker, true);
        driver.spontaneous(&other, 5);
        let samples = sink.samples.lock().clone();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].locator, breaker);

        driver.listen_channels(&[], sink.clone()).unwrap();
        assert!(!driver.is_subscribed(&breaker));
        driver.spontaneous(&breaker, false);
        assert_eq!(sink.samples.lock().len(), 1);
    }

    #[tokio::test]
    async fn reads_serve_last_transmission_or_bad() {
        let driver = Iec104Driver::new();
        let station = station("rtu-2");
        let known = ChannelLocator::intern(&station, "2001");
        let unknown = ChannelLocator::intern(&station, "2002");
        driver.spontaneous(&known, 11.5_f64);

        let samples = driver
            .read_channels(&[known.clone(), unknown])
            .await
            .unwrap();
        assert_eq!(samples[0].value, Some(Value::Double(11.5)));
        assert!(!samples[1].is_good());
        assert_eq!(driver.channel_list(&station).unwrap(), vec![known]);
    }

    #[tokio::test]
    async fn commands_are_echoed_and_link_loss_is_reported() {
        let driver = Iec104Driver::new();
        let point = ChannelLocator::intern(&station("rtu-3"), "3001");
        let sink = Arc::new(Sink::default());
        driver.listen_channels(&[point.clone()], sink.clone()).unwrap();

        driver
            .write_channels(&[ValueContainer::new(point.clone(), 1)])
            .await
            .unwrap();
        assert_eq!(sink.samples.lock()[0].sample.value, Some(Value::Integer(1)));

        driver.link_lost("t1 timeout");
        assert_eq!(*sink.errors.lock(), vec![DriverError::io("t1 timeout")]);
    }

    #[test]
    fn device_listeners_follow_station_changes() {
        let driver = Iec104Driver::new();
        let stations = Arc::new(Stations::default());
        let handle: Arc<dyn DeviceListener> = stations.clone();
        driver.add_device_listener(handle.clone()).unwrap();
        driver.add_device_listener(handle.clone()).unwrap();

        let rtu = station("rtu-4");
        driver.spontaneous(&ChannelLocator::intern(&rtu, "4001"), 1);
        driver.announce_station(rtu.clone());
        driver.withdraw_station(rtu.clone());
        assert_eq!(*stations.added.lock(), vec![rtu.clone()]);
        assert_eq!(*stations.removed.lock(), vec![rtu.clone()]);
        assert!(driver.channel_list(&rtu).unwrap().is_empty());

        driver.remove_device_listener(&handle);
        driver.announce_station(rtu);
        assert_eq!(stations.added.lock().len(), 1);
    }
}
