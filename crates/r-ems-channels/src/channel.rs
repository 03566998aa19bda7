//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ChannelConfiguration;
use crate::dispatch::{ChannelEventListener, EventType, ListenerSet};
use crate::locator::ChannelLocator;
use crate::value::SampledValue;

/// Runtime state of one configured channel.
#[derive(Debug)]
pub struct Channel {
    config: ChannelConfiguration,
    latest: Mutex<Option<SampledValue>>,
    update_listeners: Mutex<ListenerSet>,
    changed_listeners: Mutex<ListenerSet>,
}

impl Channel {
    pub fn new(config: ChannelConfiguration) -> Self {
        Self {
            config,
            latest: Mutex::new(None),
            update_listeners: Mutex::new(ListenerSet::default()),
            changed_listeners: Mutex::new(ListenerSet::default()),
        }
    }

    pub fn locator(&self) -> &ChannelLocator {
        &self.config.locator
    }

    pub fn configuration(&self) -> &ChannelConfiguration {
        &self.config
    }

    pub fn latest(&self) -> Option<SampledValue> {
        self.latest.lock().clone()
    }

    /// Replace the cached sample, reporting whether it changed logically.
    pub fn store(&self, sample: SampledValue) -> bool {
        let mut latest = self.latest.lock();
        let changed = sample.differs_from(latest.as_ref());
        *latest = Some(sample);
        changed
    }

    pub fn add_listener(&self, kind: EventType, listener: &Arc<dyn ChannelEventListener>) -> bool {
        self.set(kind).lock().insert(listener)
    }

    pub fn remove_listener(
        &self,
        kind: EventType,
        listener: &Arc<dyn ChannelEventListener>,
    ) -> bool {
        self.set(kind).lock().remove(listener)
    }

    pub fn listeners(&self, kind: EventType) -> Vec<Arc<dyn ChannelEventListener>> {
        self.set(kind).lock().live()
    }

    pub fn clear_listeners(&self) {
        self.update_listeners.lock().clear();
        self.changed_listeners.lock().clear();
    }

    fn set(&self, kind: EventType) -> &Mutex<ListenerSet> {
        match kind {
            EventType::Update => &self.update_listeners,
            EventType::ValueChanged => &self.changed_listeners,
        }
    }
}
