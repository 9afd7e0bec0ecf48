//! # Event Buffer
//!
//! Bounded per-class event storage with three-phase consumption:
//!
//! 1. `select` marks the oldest pending events of a class for transmission;
//! 2. the response builder writes the selected events into a fragment and,
//!    once the peer confirms, marks them written;
//! 3. `clear_written` purges them.
//!
//! Selected events are immune to overflow eviction — when a class exceeds its
//! capacity the oldest *pending* event is discarded and the overflow flag
//! raised. The flag clears only when a purge brings the buffer back below
//! total capacity, so a master always learns that data was lost.

use std::collections::VecDeque;

use serde::Serialize;

use gridlink_protocol::config::EventBufferConfig;
use gridlink_protocol::measurement::{ClassMask, EventClass, Measurement};

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    Pending,
    Selected,
    Written,
}

/// One buffered event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventRecord {
    pub class: EventClass,
    pub measurement: Measurement,
    pub index: u16,
    /// Global insertion sequence; orders events across classes.
    pub sequence: u64,
    state: EventState,
}

/// Event buffer counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EventStats {
    pub inserted: u64,
    pub coalesced: u64,
    pub evicted: u64,
    pub written: u64,
}

// ─── Buffer ──────────────────────────────────────────────────────────────────

/// Bounded per-class event buffer, globally ordered by insertion.
pub struct EventBuffer {
    records: VecDeque<EventRecord>,
    config: EventBufferConfig,
    next_sequence: u64,
    overflow: bool,
    stats: EventStats,
}

impl EventBuffer {
    pub fn new(config: EventBufferConfig) -> Self {
        EventBuffer {
            records: VecDeque::new(),
            config,
            next_sequence: 0,
            overflow: false,
            stats: EventStats::default(),
        }
    }

    fn capacity(&self, class: EventClass) -> usize {
        match class {
            EventClass::Class1 => self.config.class1,
            EventClass::Class2 => self.config.class2,
            EventClass::Class3 => self.config.class3,
        }
    }

    fn total_capacity(&self) -> usize {
        self.config.total()
    }

    /// Insert an event, coalescing equal-value pending duplicates at the same
    /// index and evicting the oldest pending event of the class on overflow.
    pub fn update(&mut self, measurement: Measurement, class: EventClass, index: u16) {
        // Coalesce: an equal pending value at the same point adds no
        // information.
        if let Some(existing) = self.records.iter_mut().find(|r| {
            r.state == EventState::Pending
                && r.class == class
                && r.index == index
                && r.measurement.value == measurement.value
        }) {
            existing.measurement = measurement;
            self.stats.coalesced += 1;
            return;
        }

        let pending = self
            .records
            .iter()
            .filter(|r| r.class == class && r.state == EventState::Pending)
            .count();
        if pending >= self.capacity(class) {
            // Evict the oldest pending event of this class. Selected events
            // are immune.
            if let Some(pos) = self
                .records
                .iter()
                .position(|r| r.class == class && r.state == EventState::Pending)
            {
                self.records.remove(pos);
                self.overflow = true;
                self.stats.evicted += 1;
                tracing::warn!(?class, "event buffer overflow, oldest pending event dropped");
            }
        }

        self.records.push_back(EventRecord {
            class,
            measurement,
            index,
            sequence: self.next_sequence,
            state: EventState::Pending,
        });
        self.next_sequence += 1;
        self.stats.inserted += 1;
    }

    /// Mark up to `max` of the oldest pending events of `class` as selected.
    /// Returns how many were newly selected; already-selected events do not
    /// recount.
    pub fn select(&mut self, class: EventClass, max: usize) -> usize {
        self.select_where(ClassMask::single(class), |_, n| n < max)
    }

    /// Mark pending events matching `mask`, in insertion order, as selected
    /// while `keep(record, selected_so_far)` approves. Lets the response
    /// builder select by encoded-size budget instead of a flat count.
    pub fn select_where(
        &mut self,
        mask: ClassMask,
        mut keep: impl FnMut(&EventRecord, usize) -> bool,
    ) -> usize {
        let mut selected = 0;
        for record in self.records.iter_mut() {
            if record.state != EventState::Pending || !mask.contains(record.class) {
                continue;
            }
            if !keep(record, selected) {
                break;
            }
            record.state = EventState::Selected;
            selected += 1;
        }
        selected
    }

    /// Return every selected event to pending. Used when a transmit fails.
    pub fn deselect(&mut self) -> usize {
        let mut n = 0;
        for record in self.records.iter_mut() {
            if record.state == EventState::Selected {
                record.state = EventState::Pending;
                n += 1;
            }
        }
        n
    }

    /// Mark all currently selected events as written (transmitted and
    /// confirmed).
    pub fn mark_selected_written(&mut self) -> usize {
        let mut n = 0;
        for record in self.records.iter_mut() {
            if record.state == EventState::Selected {
                record.state = EventState::Written;
                n += 1;
            }
        }
        n
    }

    /// Purge written events. The overflow flag clears once the purge brings
    /// the buffer below total capacity.
    pub fn clear_written(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.state != EventState::Written);
        let cleared = before - self.records.len();
        self.stats.written += cleared as u64;
        if self.overflow && self.records.len() < self.total_capacity() {
            self.overflow = false;
        }
        cleared
    }

    /// Iterate the selected events in insertion order.
    pub fn selected(&self) -> impl Iterator<Item = &EventRecord> {
        self.records
            .iter()
            .filter(|r| r.state == EventState::Selected)
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn num_selected(&self) -> usize {
        self.selected().count()
    }

    pub fn is_overflown(&self) -> bool {
        self.overflow
    }

    /// Whether any pending event of the class exists (drives the class IIN
    /// bits).
    pub fn has_pending(&self, class: EventClass) -> bool {
        self.records
            .iter()
            .any(|r| r.class == class && r.state == EventState::Pending)
    }

    pub fn any_pending(&self, mask: ClassMask) -> bool {
        mask.classes().any(|c| self.has_pending(c))
    }

    pub fn stats(&self) -> &EventStats {
        &self.stats
    }
}
