//! # Measurement Model
//!
//! Typed measurement values with quality flags and optional 48-bit millisecond
//! timestamps, plus the event-class machinery shared by the outstation
//! response engine and the master response loader.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Measurement quality octet. The low five bits are common to every
    /// point type; bit 7 doubles as the packed state bit for binary types.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Quality: u8 {
        const ONLINE = 0x01;
        const RESTART = 0x02;
        const COMM_LOST = 0x04;
        const REMOTE_FORCED = 0x08;
        const LOCAL_FORCED = 0x10;
        const CHATTER_FILTER = 0x20;
        const RESERVED = 0x40;
        const STATE = 0x80;
    }
}

impl Quality {
    /// Quality with only the ONLINE bit, applied to decoded variants that
    /// carry no flags octet of their own.
    pub fn online() -> Self {
        Quality::ONLINE
    }
}

// ─── Timestamps ──────────────────────────────────────────────────────────────

/// DNP absolute time: milliseconds since the UNIX epoch, 48 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DnpTime(pub u64);

impl DnpTime {
    pub const MAX: u64 = (1 << 48) - 1;

    pub fn new(ms: u64) -> Self {
        DnpTime(ms & Self::MAX)
    }

    /// Encode as 6 little-endian octets.
    pub fn encode(self, buf: &mut impl BufMut) {
        let bytes = self.0.to_le_bytes();
        buf.put_slice(&bytes[0..6]);
    }

    /// Decode 6 little-endian octets.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 6 {
            return None;
        }
        let mut bytes = [0u8; 8];
        buf.copy_to_slice(&mut bytes[0..6]);
        Some(DnpTime(u64::from_le_bytes(bytes)))
    }
}

// ─── Double-bit state ────────────────────────────────────────────────────────

/// Two-bit binary state (bits 6-7 of the double-bit flags octet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DoubleBit {
    Intermediate = 0b00,
    DeterminedOff = 0b01,
    DeterminedOn = 0b10,
    Indeterminate = 0b11,
}

impl DoubleBit {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => DoubleBit::Intermediate,
            0b01 => DoubleBit::DeterminedOff,
            0b10 => DoubleBit::DeterminedOn,
            _ => DoubleBit::Indeterminate,
        }
    }
}

// ─── Values ──────────────────────────────────────────────────────────────────

/// The point types carried by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointKind {
    Binary,
    DoubleBitBinary,
    Analog,
    Counter,
    BinaryOutputStatus,
    AnalogOutputStatus,
}

/// A typed measurement value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasurementValue {
    Binary(bool),
    DoubleBitBinary(DoubleBit),
    Analog(f64),
    Counter(u32),
    BinaryOutputStatus(bool),
    AnalogOutputStatus(f64),
}

impl MeasurementValue {
    pub fn kind(&self) -> PointKind {
        match self {
            MeasurementValue::Binary(_) => PointKind::Binary,
            MeasurementValue::DoubleBitBinary(_) => PointKind::DoubleBitBinary,
            MeasurementValue::Analog(_) => PointKind::Analog,
            MeasurementValue::Counter(_) => PointKind::Counter,
            MeasurementValue::BinaryOutputStatus(_) => PointKind::BinaryOutputStatus,
            MeasurementValue::AnalogOutputStatus(_) => PointKind::AnalogOutputStatus,
        }
    }
}

/// A measurement: value, quality, optional time of occurrence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub value: MeasurementValue,
    pub quality: Quality,
    pub time: Option<DnpTime>,
}

impl Measurement {
    pub fn new(value: MeasurementValue, quality: Quality) -> Self {
        Measurement {
            value,
            quality,
            time: None,
        }
    }

    pub fn with_time(mut self, time: DnpTime) -> Self {
        self.time = Some(time);
        self
    }

    pub fn binary(state: bool, quality: Quality) -> Self {
        Measurement::new(MeasurementValue::Binary(state), quality)
    }

    pub fn analog(value: f64, quality: Quality) -> Self {
        Measurement::new(MeasurementValue::Analog(value), quality)
    }

    pub fn counter(count: u32, quality: Quality) -> Self {
        Measurement::new(MeasurementValue::Counter(count), quality)
    }

    pub fn kind(&self) -> PointKind {
        self.value.kind()
    }
}

// ─── Event classes ───────────────────────────────────────────────────────────

/// Event class assignment of a point that generates events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventClass {
    Class1,
    Class2,
    Class3,
}

/// A set of event classes, as carried by unsolicited configuration and
/// class-scan requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClassMask {
    pub class1: bool,
    pub class2: bool,
    pub class3: bool,
}

impl ClassMask {
    pub const ALL: ClassMask = ClassMask {
        class1: true,
        class2: true,
        class3: true,
    };

    pub const NONE: ClassMask = ClassMask {
        class1: false,
        class2: false,
        class3: false,
    };

    pub fn single(class: EventClass) -> Self {
        let mut mask = ClassMask::NONE;
        mask.set(class, true);
        mask
    }

    pub fn contains(&self, class: EventClass) -> bool {
        match class {
            EventClass::Class1 => self.class1,
            EventClass::Class2 => self.class2,
            EventClass::Class3 => self.class3,
        }
    }

    pub fn set(&mut self, class: EventClass, enabled: bool) {
        match class {
            EventClass::Class1 => self.class1 = enabled,
            EventClass::Class2 => self.class2 = enabled,
            EventClass::Class3 => self.class3 = enabled,
        }
    }

    pub fn any(&self) -> bool {
        self.class1 || self.class2 || self.class3
    }

    pub fn classes(&self) -> impl Iterator<Item = EventClass> + '_ {
        [EventClass::Class1, EventClass::Class2, EventClass::Class3]
            .into_iter()
            .filter(|c| self.contains(*c))
    }
}
