//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::{Arc, Weak};

use r_ems_metrics::ChannelMetrics;
use tracing::trace;

use crate::channel::Channel;
use crate::value::{SampledValue, SampledValueContainer};

/// Kind of notification delivered to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Every successful sample, changed or not.
    Update,
    /// Only samples whose value or quality differ from the cached one.
    ValueChanged,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Update => "update",
            EventType::ValueChanged => "value_changed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application callback for channel events.
///
/// The manager only keeps weak references; a listener is delivered to for as
/// long as the application holds its `Arc`.
pub trait ChannelEventListener: Send + Sync {
    fn channel_event(&self, event: EventType, samples: &[SampledValueContainer]);
}

fn listener_key(listener: &Arc<dyn ChannelEventListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

struct ListenerEntry {
    key: usize,
    listener: Weak<dyn ChannelEventListener>,
}

/// Weakly held, duplicate-free listener collection.
#[derive(Default)]
pub struct ListenerSet {
    entries: Vec<ListenerEntry>,
}

impl ListenerSet {
    /// Returns `false` when the listener was already present.
    pub fn insert(&mut self, listener: &Arc<dyn ChannelEventListener>) -> bool {
        self.prune();
        let key = listener_key(listener);
        if self.entries.iter().any(|entry| entry.key == key) {
            return false;
        }
        self.entries.push(ListenerEntry {
            key,
            listener: Arc::downgrade(listener),
        });
        true
    }

    pub fn remove(&mut self, listener: &Arc<dyn ChannelEventListener>) -> bool {
        let key = listener_key(listener);
        let before = self.entries.len();
        self.entries.retain(|entry| entry.key != key);
        self.entries.len() != before
    }

    /// Strong handles to listeners that are still alive; dead entries are dropped.
    pub fn live(&mut self) -> Vec<Arc<dyn ChannelEventListener>> {
        let mut live = Vec::with_capacity(self.entries.len());
        self.entries.retain(|entry| match entry.listener.upgrade() {
            Some(listener) => {
                live.push(listener);
                true
            }
            None => false,
        });
        live
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // A dead entry's address may be reused by a new allocation.
    fn prune(&mut self) {
        self.entries.retain(|entry| entry.listener.strong_count() > 0);
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[derive(Default)]
struct Deliveries {
    targets: Vec<(usize, Arc<dyn ChannelEventListener>, Vec<SampledValueContainer>)>,
}

impl Deliveries {
    fn add(&mut self, listener: Arc<dyn ChannelEventListener>, container: &SampledValueContainer) {
        let key = listener_key(&listener);
        match self.targets.iter_mut().find(|(k, _, _)| *k == key) {
            Some((_, _, samples)) => samples.push(container.clone()),
            None => self.targets.push((key, listener, vec![container.clone()])),
        }
    }

    fn deliver(self, event: EventType) -> usize {
        let notified = self.targets.len();
        for (_, listener, samples) in self.targets {
            listener.channel_event(event, &samples);
        }
        notified
    }
}

/// Store a batch of samples and notify listeners.
///
/// All caches are updated before the first listener is called, and each
/// listener receives the whole batch's relevant samples in one call.
pub(crate) fn dispatch(batch: Vec<(Arc<Channel>, SampledValue)>, metrics: Option<&ChannelMetrics>) {
    let mut updates = Deliveries::default();
    let mut changes = Deliveries::default();

    for (channel, sample) in batch {
        let changed = channel.store(sample.clone());
        let container = SampledValueContainer::new(channel.locator().clone(), sample);
        for listener in channel.listeners(EventType::Update) {
            updates.add(listener, &container);
        }
        if changed {
            for listener in channel.listeners(EventType::ValueChanged) {
                changes.add(listener, &container);
            }
        }
    }

    let updated = updates.deliver(EventType::Update);
    let changed = changes.deliver(EventType::ValueChanged);
    trace!(updated, changed, "listeners notified");
    if let Some(metrics) = metrics {
        metrics.record_events(EventType::Update.as_str(), updated);
        metrics.record_events(EventType::ValueChanged.as_str(), changed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfiguration, Direction};
    use crate::locator::{ChannelLocator, DeviceLocator};
    use crate::value::Value;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(EventType, Vec<Option<Value>>)>>,
    }

    impl ChannelEventListener for Recorder {
        fn channel_event(&self, event: EventType, samples: &[SampledValueContainer]) {
            self.events
                .lock()
                .push((event, samples.iter().map(|s| s.sample.value.clone()).collect()));
        }
    }

    fn channel(address: &str) -> Arc<Channel> {
        let device = DeviceLocator::intern("test", "bus0", "dispatch-device", None);
        let locator = ChannelLocator::intern(&device, address);
        Arc::new(Channel::new(ChannelConfiguration::new(
            locator,
            100,
            Direction::Input,
        )))
    }

    #[test]
    fn listener_set_is_idempotent_and_weak() {
        let mut set = ListenerSet::default();
        let listener: Arc<dyn ChannelEventListener> = Arc::new(Recorder::default());
        assert!(set.insert(&listener));
        assert!(!set.insert(&listener));
        assert_eq!(set.live().len(), 1);

        drop(listener);
        assert!(set.live().is_empty());
        assert!(set.is_empty());
    }

    #[test]
    fn changed_listeners_only_see_differences() {
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn ChannelEventListener> = recorder.clone();
        let voltage = channel("voltage");
        voltage.add_listener(EventType::Update, &listener);
        voltage.add_listener(EventType::ValueChanged, &listener);

        for value in [230, 230, 231] {
            dispatch(
                vec![(voltage.clone(), SampledValue::good(value, Utc::now()))],
                None,
            );
        }

        let events = recorder.events.lock();
        let kinds: Vec<EventType> = events.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventType::Update,
                EventType::ValueChanged,
                EventType::Update,
                EventType::Update,
                EventType::ValueChanged,
            ]
        );
    }

    #[test]
    fn repeated_nan_readings_change_only_once() {
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn ChannelEventListener> = recorder.clone();
        let flow = channel("flow-nan");
        flow.add_listener(EventType::Update, &listener);
        flow.add_listener(EventType::ValueChanged, &listener);

        for _ in 0..2 {
            dispatch(
                vec![(flow.clone(), SampledValue::good(f64::NAN, Utc::now()))],
                None,
            );
        }

        let events = recorder.events.lock();
        let changed = events
            .iter()
            .filter(|(kind, _)| *kind == EventType::ValueChanged)
            .count();
        let updates = events
            .iter()
            .filter(|(kind, _)| *kind == EventType::Update)
            .count();
        assert_eq!(changed, 1);
        assert_eq!(updates, 2);
    }

    #[test]
    fn one_call_per_listener_per_batch() {
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn ChannelEventListener> = recorder.clone();
        let a = channel("batch-a");
        let b = channel("batch-b");
        a.add_listener(EventType::Update, &listener);
        b.add_listener(EventType::Update, &listener);

        let now = Utc::now();
        dispatch(
            vec![
                (a.clone(), SampledValue::good(1, now)),
                (b.clone(), SampledValue::good(2, now)),
            ],
            None,
        );

        let events = recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, vec![Some(Value::Integer(1)), Some(Value::Integer(2))]);
        assert_eq!(a.latest().unwrap().value, Some(Value::Integer(1)));
    }
}
