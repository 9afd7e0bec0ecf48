//! # Measurement Database
//!
//! The outstation's current view of the world: one dense array of points per
//! measurement kind, each point carrying its latest value and an optional
//! event-class assignment. Updates from the field arrive through a bounded
//! [`ChangeBuffer`] owned by the producer side and are drained into the
//! database on the executor.

use std::collections::VecDeque;

use thiserror::Error;

use gridlink_protocol::measurement::{
    EventClass, Measurement, MeasurementValue, PointKind, Quality,
};

// ─── Points ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Point {
    value: Measurement,
    class: Option<EventClass>,
}

/// Number of points per kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointCounts {
    pub binaries: usize,
    pub double_bits: usize,
    pub analogs: usize,
    pub counters: usize,
    pub binary_output_status: usize,
    pub analog_output_status: usize,
}

fn initial_value(kind: PointKind) -> MeasurementValue {
    match kind {
        PointKind::Binary => MeasurementValue::Binary(false),
        PointKind::DoubleBitBinary => {
            MeasurementValue::DoubleBitBinary(gridlink_protocol::measurement::DoubleBit::Intermediate)
        }
        PointKind::Analog => MeasurementValue::Analog(0.0),
        PointKind::Counter => MeasurementValue::Counter(0),
        PointKind::BinaryOutputStatus => MeasurementValue::BinaryOutputStatus(false),
        PointKind::AnalogOutputStatus => MeasurementValue::AnalogOutputStatus(0.0),
    }
}

// ─── Database ────────────────────────────────────────────────────────────────

/// The static point database.
pub struct Database {
    binaries: Vec<Point>,
    double_bits: Vec<Point>,
    analogs: Vec<Point>,
    counters: Vec<Point>,
    binary_output_status: Vec<Point>,
    analog_output_status: Vec<Point>,
}

/// A database update that generated an event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratedEvent {
    pub class: EventClass,
    pub measurement: Measurement,
    pub index: u16,
}

impl Database {
    /// Create a database. Points start offline with the RESTART flag until
    /// their first update.
    pub fn new(counts: PointCounts) -> Self {
        let init = |kind: PointKind, n: usize| {
            vec![
                Point {
                    value: Measurement::new(initial_value(kind), Quality::RESTART),
                    class: None,
                };
                n
            ]
        };
        Database {
            binaries: init(PointKind::Binary, counts.binaries),
            double_bits: init(PointKind::DoubleBitBinary, counts.double_bits),
            analogs: init(PointKind::Analog, counts.analogs),
            counters: init(PointKind::Counter, counts.counters),
            binary_output_status: init(PointKind::BinaryOutputStatus, counts.binary_output_status),
            analog_output_status: init(PointKind::AnalogOutputStatus, counts.analog_output_status),
        }
    }

    fn points(&self, kind: PointKind) -> &Vec<Point> {
        match kind {
            PointKind::Binary => &self.binaries,
            PointKind::DoubleBitBinary => &self.double_bits,
            PointKind::Analog => &self.analogs,
            PointKind::Counter => &self.counters,
            PointKind::BinaryOutputStatus => &self.binary_output_status,
            PointKind::AnalogOutputStatus => &self.analog_output_status,
        }
    }

    fn points_mut(&mut self, kind: PointKind) -> &mut Vec<Point> {
        match kind {
            PointKind::Binary => &mut self.binaries,
            PointKind::DoubleBitBinary => &mut self.double_bits,
            PointKind::Analog => &mut self.analogs,
            PointKind::Counter => &mut self.counters,
            PointKind::BinaryOutputStatus => &mut self.binary_output_status,
            PointKind::AnalogOutputStatus => &mut self.analog_output_status,
        }
    }

    pub fn count(&self, kind: PointKind) -> usize {
        self.points(kind).len()
    }

    /// Assign the event class of a point. Out-of-range indexes are ignored
    /// with a warning.
    pub fn set_class(&mut self, kind: PointKind, index: u16, class: Option<EventClass>) {
        match self.points_mut(kind).get_mut(index as usize) {
            Some(point) => point.class = class,
            None => tracing::warn!(?kind, index, "set_class on unknown point"),
        }
    }

    pub fn get(&self, kind: PointKind, index: u16) -> Option<Measurement> {
        self.points(kind).get(index as usize).map(|p| p.value)
    }

    /// Apply an update. Returns the event to queue when the point has an
    /// event class and the value actually changed.
    pub fn update(&mut self, measurement: Measurement, index: u16) -> Option<GeneratedEvent> {
        let kind = measurement.kind();
        let Some(point) = self.points_mut(kind).get_mut(index as usize) else {
            tracing::warn!(?kind, index, "update for unknown point dropped");
            return None;
        };
        let changed = point.value.value != measurement.value;
        point.value = measurement;
        match point.class {
            Some(class) if changed => Some(GeneratedEvent {
                class,
                measurement,
                index,
            }),
            _ => None,
        }
    }
}

// ─── Change Buffer ───────────────────────────────────────────────────────────

/// Returned to producers when the change buffer is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("change buffer full")]
pub struct ChangeBufferFull;

/// Bounded queue between external measurement producers and the executor.
/// Producers push; the engine drains on its own thread of control.
pub struct ChangeBuffer {
    queue: VecDeque<(Measurement, u16)>,
    capacity: usize,
}

impl ChangeBuffer {
    pub fn new(capacity: usize) -> Self {
        ChangeBuffer {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Queue an update, refusing when full (flow control).
    pub fn push(&mut self, measurement: Measurement, index: u16) -> Result<(), ChangeBufferFull> {
        if self.queue.len() >= self.capacity {
            return Err(ChangeBufferFull);
        }
        self.queue.push_back((measurement, index));
        Ok(())
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (Measurement, u16)> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
