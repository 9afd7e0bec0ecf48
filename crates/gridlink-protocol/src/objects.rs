//! # Object Codecs
//!
//! Wire codecs for the (group, variation) pairs the stack reads and writes.
//! Packed bitfields (g1v1, g10v1, g80v1) and size-by-variation octet strings
//! (g110, g111) do not fit the fixed-size object model and are handled by the
//! dispatcher code directly with the helpers at the bottom of this module.

use bytes::{Buf, BufMut, BytesMut};

use crate::measurement::{DnpTime, DoubleBit, Measurement, MeasurementValue, PointKind, Quality};

// ─── Group/Variation Catalogue ───────────────────────────────────────────────

/// The fixed-size object types the stack understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupVar {
    /// Binary input with flags.
    G1V2,
    /// Binary input event without time.
    G2V1,
    /// Binary input event with absolute time.
    G2V2,
    /// Binary input event with relative time (needs a CTO).
    G2V3,
    /// Double-bit binary input with flags.
    G3V2,
    /// Double-bit binary input event without time.
    G4V1,
    /// Binary output status with flags.
    G10V2,
    /// Counter, 32-bit with flags.
    G20V1,
    /// Counter event, 32-bit with flags.
    G22V1,
    /// Analog input, 32-bit with flags.
    G30V1,
    /// Analog input, 16-bit with flags.
    G30V2,
    /// Analog input event, 32-bit with flags.
    G32V1,
    /// Analog output status with flags.
    G40V1,
    /// Absolute time and date.
    G50V1,
    /// CTO, synchronized.
    G51V1,
    /// CTO, unsynchronized.
    G51V2,
    /// Delay measurement, fine (milliseconds).
    G52V2,
}

impl GroupVar {
    pub fn from_pair(group: u8, variation: u8) -> Option<Self> {
        match (group, variation) {
            (1, 2) => Some(GroupVar::G1V2),
            (2, 1) => Some(GroupVar::G2V1),
            (2, 2) => Some(GroupVar::G2V2),
            (2, 3) => Some(GroupVar::G2V3),
            (3, 2) => Some(GroupVar::G3V2),
            (4, 1) => Some(GroupVar::G4V1),
            (10, 2) => Some(GroupVar::G10V2),
            (20, 1) => Some(GroupVar::G20V1),
            (22, 1) => Some(GroupVar::G22V1),
            (30, 1) => Some(GroupVar::G30V1),
            (30, 2) => Some(GroupVar::G30V2),
            (32, 1) => Some(GroupVar::G32V1),
            (40, 1) => Some(GroupVar::G40V1),
            (50, 1) => Some(GroupVar::G50V1),
            (51, 1) => Some(GroupVar::G51V1),
            (51, 2) => Some(GroupVar::G51V2),
            (52, 2) => Some(GroupVar::G52V2),
            _ => None,
        }
    }

    pub fn pair(self) -> (u8, u8) {
        match self {
            GroupVar::G1V2 => (1, 2),
            GroupVar::G2V1 => (2, 1),
            GroupVar::G2V2 => (2, 2),
            GroupVar::G2V3 => (2, 3),
            GroupVar::G3V2 => (3, 2),
            GroupVar::G4V1 => (4, 1),
            GroupVar::G10V2 => (10, 2),
            GroupVar::G20V1 => (20, 1),
            GroupVar::G22V1 => (22, 1),
            GroupVar::G30V1 => (30, 1),
            GroupVar::G30V2 => (30, 2),
            GroupVar::G32V1 => (32, 1),
            GroupVar::G40V1 => (40, 1),
            GroupVar::G50V1 => (50, 1),
            GroupVar::G51V1 => (51, 1),
            GroupVar::G51V2 => (51, 2),
            GroupVar::G52V2 => (52, 2),
        }
    }

    /// Encoded object size in bytes.
    pub fn object_size(self) -> usize {
        match self {
            GroupVar::G1V2 | GroupVar::G2V1 | GroupVar::G3V2 | GroupVar::G4V1 | GroupVar::G10V2 => {
                1
            }
            GroupVar::G2V2 => 7,
            GroupVar::G2V3 => 3,
            GroupVar::G52V2 => 2,
            GroupVar::G20V1 | GroupVar::G22V1 | GroupVar::G30V1 | GroupVar::G32V1
            | GroupVar::G40V1 => 5,
            GroupVar::G30V2 => 3,
            GroupVar::G50V1 | GroupVar::G51V1 | GroupVar::G51V2 => 6,
        }
    }

    /// Whether decoded values need the CTO base added to their time.
    pub fn uses_cto(self) -> bool {
        matches!(self, GroupVar::G2V3)
    }

    /// The default static variation written for a point kind.
    pub fn static_for(kind: PointKind) -> Self {
        match kind {
            PointKind::Binary => GroupVar::G1V2,
            PointKind::DoubleBitBinary => GroupVar::G3V2,
            PointKind::Analog => GroupVar::G30V1,
            PointKind::Counter => GroupVar::G20V1,
            PointKind::BinaryOutputStatus => GroupVar::G10V2,
            PointKind::AnalogOutputStatus => GroupVar::G40V1,
        }
    }

    /// The default event variation written for a point kind, or `None` for
    /// kinds that do not generate events.
    pub fn event_for(kind: PointKind) -> Option<Self> {
        match kind {
            PointKind::Binary => Some(GroupVar::G2V1),
            PointKind::DoubleBitBinary => Some(GroupVar::G4V1),
            PointKind::Analog => Some(GroupVar::G32V1),
            PointKind::Counter => Some(GroupVar::G22V1),
            PointKind::BinaryOutputStatus | PointKind::AnalogOutputStatus => None,
        }
    }
}

// ─── Flags Octet ─────────────────────────────────────────────────────────────

fn binary_flags(state: bool, quality: Quality) -> u8 {
    let mut b = quality.bits() & 0x7F;
    if state {
        b |= Quality::STATE.bits();
    }
    b
}

fn double_bit_flags(state: DoubleBit, quality: Quality) -> u8 {
    (quality.bits() & 0x3F) | ((state as u8) << 6)
}

fn saturating_i32(value: f64) -> i32 {
    value.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

fn saturating_i16(value: f64) -> i16 {
    value.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

// ─── Encode ──────────────────────────────────────────────────────────────────

/// Write the object body for a measurement. The value variant must match the
/// group: a binary group with an analog value is a programming error, caught
/// in debug builds.
pub fn encode_object(gv: GroupVar, m: &Measurement, buf: &mut BytesMut) {
    match (gv, m.value) {
        (GroupVar::G1V2 | GroupVar::G2V1, MeasurementValue::Binary(state)) => {
            buf.put_u8(binary_flags(state, m.quality));
        }
        (GroupVar::G2V2, MeasurementValue::Binary(state)) => {
            buf.put_u8(binary_flags(state, m.quality));
            m.time.unwrap_or(DnpTime(0)).encode(buf);
        }
        (GroupVar::G10V2, MeasurementValue::BinaryOutputStatus(state)) => {
            buf.put_u8(binary_flags(state, m.quality));
        }
        (GroupVar::G3V2 | GroupVar::G4V1, MeasurementValue::DoubleBitBinary(state)) => {
            buf.put_u8(double_bit_flags(state, m.quality));
        }
        (GroupVar::G20V1 | GroupVar::G22V1, MeasurementValue::Counter(count)) => {
            buf.put_u8(m.quality.bits());
            buf.put_u32_le(count);
        }
        (GroupVar::G30V1 | GroupVar::G32V1, MeasurementValue::Analog(value)) => {
            buf.put_u8(m.quality.bits());
            buf.put_i32_le(saturating_i32(value));
        }
        (GroupVar::G30V2, MeasurementValue::Analog(value)) => {
            buf.put_u8(m.quality.bits());
            buf.put_i16_le(saturating_i16(value));
        }
        (GroupVar::G40V1, MeasurementValue::AnalogOutputStatus(value)) => {
            buf.put_u8(m.quality.bits());
            buf.put_i32_le(saturating_i32(value));
        }
        _ => debug_assert!(false, "group/value mismatch: {gv:?} vs {:?}", m.value),
    }
}

// ─── Decode ──────────────────────────────────────────────────────────────────

/// Decode one measurement object. Relative-time events (g2v3) come back with
/// the raw offset in `time`; the caller adds the CTO base. Time objects
/// (g50/g51/g52) are not measurements and are handled by their own readers.
pub fn decode_object(gv: GroupVar, buf: &mut impl Buf) -> Option<Measurement> {
    if buf.remaining() < gv.object_size() {
        return None;
    }
    let m = match gv {
        GroupVar::G1V2 | GroupVar::G2V1 => {
            let flags = buf.get_u8();
            Measurement::binary(
                flags & Quality::STATE.bits() != 0,
                Quality::from_bits_retain(flags & 0x7F),
            )
        }
        GroupVar::G2V2 => {
            let flags = buf.get_u8();
            let time = DnpTime::decode(buf)?;
            Measurement::binary(
                flags & Quality::STATE.bits() != 0,
                Quality::from_bits_retain(flags & 0x7F),
            )
            .with_time(time)
        }
        GroupVar::G2V3 => {
            let flags = buf.get_u8();
            let offset = buf.get_u16_le();
            Measurement::binary(
                flags & Quality::STATE.bits() != 0,
                Quality::from_bits_retain(flags & 0x7F),
            )
            .with_time(DnpTime(offset as u64))
        }
        GroupVar::G3V2 | GroupVar::G4V1 => {
            let flags = buf.get_u8();
            Measurement::new(
                MeasurementValue::DoubleBitBinary(DoubleBit::from_bits(flags >> 6)),
                Quality::from_bits_retain(flags & 0x3F),
            )
        }
        GroupVar::G10V2 => {
            let flags = buf.get_u8();
            Measurement::new(
                MeasurementValue::BinaryOutputStatus(flags & Quality::STATE.bits() != 0),
                Quality::from_bits_retain(flags & 0x7F),
            )
        }
        GroupVar::G20V1 | GroupVar::G22V1 => {
            let quality = Quality::from_bits_retain(buf.get_u8());
            Measurement::counter(buf.get_u32_le(), quality)
        }
        GroupVar::G30V1 | GroupVar::G32V1 => {
            let quality = Quality::from_bits_retain(buf.get_u8());
            Measurement::analog(buf.get_i32_le() as f64, quality)
        }
        GroupVar::G30V2 => {
            let quality = Quality::from_bits_retain(buf.get_u8());
            Measurement::analog(buf.get_i16_le() as f64, quality)
        }
        GroupVar::G40V1 => {
            let quality = Quality::from_bits_retain(buf.get_u8());
            Measurement::new(
                MeasurementValue::AnalogOutputStatus(buf.get_i32_le() as f64),
                quality,
            )
        }
        GroupVar::G50V1 | GroupVar::G51V1 | GroupVar::G51V2 | GroupVar::G52V2 => return None,
    };
    Some(m)
}

// ─── Packed Bitfields ────────────────────────────────────────────────────────

/// Bytes needed to pack `count` single bits.
pub fn packed_bit_len(count: usize) -> usize {
    count.div_ceil(8)
}

/// Read bit `i` of a packed bitfield.
pub fn packed_bit(data: &[u8], i: usize) -> bool {
    data[i / 8] & (1 << (i % 8)) != 0
}

/// Pack an iterator of bits into the buffer.
pub fn write_packed_bits(bits: impl Iterator<Item = bool>, buf: &mut BytesMut) {
    let mut acc = 0u8;
    let mut n = 0;
    for bit in bits {
        if bit {
            acc |= 1 << (n % 8);
        }
        n += 1;
        if n % 8 == 0 {
            buf.put_u8(acc);
            acc = 0;
        }
    }
    if n % 8 != 0 {
        buf.put_u8(acc);
    }
}
