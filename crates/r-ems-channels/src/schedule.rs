//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Anchored batch schedule for the channels of one device.
//!
//! Every channel with period `p` is due at `anchor + k·p`. Because all
//! channels share the anchor, channels with harmonically related periods
//! coincide at common multiples and are read in one batch.

use std::collections::{BTreeMap, HashMap};

use crate::locator::ChannelLocator;

/// Channels due together at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Epoch milliseconds.
    pub due_ms: i64,
    pub channels: Vec<ChannelLocator>,
}

/// First instant `anchor + k·period` that is not before `not_before`.
///
/// Saturates at `i64::MAX`; such a channel is simply never due.
pub fn next_due_at(anchor_ms: i64, period_ms: i64, not_before_ms: i64) -> i64 {
    debug_assert!(period_ms > 0);
    if not_before_ms <= anchor_ms {
        return anchor_ms;
    }
    let elapsed = not_before_ms.saturating_sub(anchor_ms);
    let mut periods = elapsed / period_ms;
    if elapsed % period_ms != 0 {
        periods += 1;
    }
    anchor_ms.saturating_add(periods.saturating_mul(period_ms))
}

/// Time-ordered schedule owned by a device-group worker.
#[derive(Debug, Clone, Default)]
pub struct SamplingSchedule {
    anchor_ms: i64,
    periods: HashMap<ChannelLocator, i64>,
    entries: BTreeMap<i64, Vec<ChannelLocator>>,
    last_due_ms: Option<i64>,
}

impl SamplingSchedule {
    /// Build from scratch. Channels with a non-positive period are ignored.
    pub fn build<I>(anchor_ms: i64, now_ms: i64, channels: I) -> Self
    where
        I: IntoIterator<Item = (ChannelLocator, i64)>,
    {
        let mut schedule = Self {
            anchor_ms,
            ..Self::default()
        };
        for (locator, period_ms) in channels {
            if period_ms <= 0 {
                continue;
            }
            let due = next_due_at(anchor_ms, period_ms, now_ms);
            schedule.periods.insert(locator.clone(), period_ms);
            schedule.entries.entry(due).or_default().push(locator);
        }
        schedule
    }

    /// Rebuild after a configuration change without repeating the instant
    /// that was sampled last.
    pub fn rebuild<I>(&self, anchor_ms: i64, now_ms: i64, channels: I) -> Self
    where
        I: IntoIterator<Item = (ChannelLocator, i64)>,
    {
        let not_before = match self.last_due_ms {
            Some(last) => now_ms.max(last.saturating_add(1)),
            None => now_ms,
        };
        let mut schedule = Self::build(anchor_ms, not_before, channels);
        schedule.last_due_ms = self.last_due_ms;
        schedule
    }

    pub fn anchor_ms(&self) -> i64 {
        self.anchor_ms
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of scheduled channels.
    pub fn channel_count(&self) -> usize {
        self.periods.len()
    }

    pub fn next_due_ms(&self) -> Option<i64> {
        self.entries.keys().next().copied()
    }

    /// Remove and return the earliest entry.
    pub fn pop_next(&mut self) -> Option<ScheduleEntry> {
        let (due_ms, channels) = self.entries.pop_first()?;
        self.last_due_ms = Some(due_ms);
        Some(ScheduleEntry { due_ms, channels })
    }

    /// Re-insert the channels of a completed entry at their next instant.
    ///
    /// Normally that is `due + period`. After an overrun the channel moves to
    /// the next anchored instant at or after `now_ms`; missed instants are
    /// skipped rather than replayed.
    pub fn reschedule(&mut self, entry: &ScheduleEntry, now_ms: i64) {
        for locator in &entry.channels {
            let Some(&period_ms) = self.periods.get(locator) else {
                continue;
            };
            let mut next = entry.due_ms.saturating_add(period_ms);
            if next < now_ms {
                next = next_due_at(self.anchor_ms, period_ms, now_ms);
            }
            self.entries.entry(next).or_default().push(locator.clone());
        }
    }

    /// The next `count` entries assuming every batch completes on time.
    pub fn project(&self, count: usize) -> Vec<ScheduleEntry> {
        let mut simulation = self.clone();
        let mut projected = Vec::with_capacity(count);
        while projected.len() < count {
            let Some(entry) = simulation.pop_next() else {
                break;
            };
            simulation.reschedule(&entry, entry.due_ms);
            projected.push(entry);
        }
        projected
    }
}
