//! # Response Loader
//!
//! Decodes the object region of a response fragment into measurements and
//! batches them for atomic publication. Handles the three shapes that do not
//! fit the plain fixed-size object model:
//!
//! - **size-by-variation** octet strings (g110, g111), where the variation
//!   octet is the object length;
//! - **packed bitfields** (g1v1, g10v1), unpacked by position;
//! - **CTO groups** (g51v1/v2), which set the time base that subsequent
//!   relative-time events (g2v3) add to. A relative-time event without a
//!   preceding CTO is dropped with a warning.
//!
//! Variants that carry no quality octet get a default ONLINE quality.

use bytes::{Buf, Bytes};
use serde::Serialize;

use gridlink_protocol::apdu::ObjectHeader;
use gridlink_protocol::error::AppError;
use gridlink_protocol::measurement::{DnpTime, Measurement, PointKind, Quality};
use gridlink_protocol::objects::{decode_object, packed_bit, packed_bit_len, GroupVar};

// ─── Measurement sink ────────────────────────────────────────────────────────

/// Receiver of decoded measurements, one method per point kind.
pub trait MeasurementHandler {
    fn on_binary(&mut self, index: u16, measurement: &Measurement);
    fn on_double_bit(&mut self, index: u16, measurement: &Measurement);
    fn on_analog(&mut self, index: u16, measurement: &Measurement);
    fn on_counter(&mut self, index: u16, measurement: &Measurement);
    fn on_binary_output_status(&mut self, index: u16, measurement: &Measurement);
    fn on_analog_output_status(&mut self, index: u16, measurement: &Measurement);
    fn on_octet_string(&mut self, index: u16, data: &[u8]);
}

/// A batch of decoded measurements published atomically when the loader
/// finishes a fragment.
#[derive(Debug, Default)]
pub struct MeasurementUpdate {
    measurements: Vec<(u16, Measurement)>,
    octet_strings: Vec<(u16, Bytes)>,
}

impl MeasurementUpdate {
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty() && self.octet_strings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.measurements.len() + self.octet_strings.len()
    }

    /// Dispatch the whole batch to a handler in decode order.
    pub fn publish(&self, handler: &mut dyn MeasurementHandler) {
        for (index, m) in &self.measurements {
            match m.kind() {
                PointKind::Binary => handler.on_binary(*index, m),
                PointKind::DoubleBitBinary => handler.on_double_bit(*index, m),
                PointKind::Analog => handler.on_analog(*index, m),
                PointKind::Counter => handler.on_counter(*index, m),
                PointKind::BinaryOutputStatus => handler.on_binary_output_status(*index, m),
                PointKind::AnalogOutputStatus => handler.on_analog_output_status(*index, m),
            }
        }
        for (index, data) in &self.octet_strings {
            handler.on_octet_string(*index, data);
        }
    }
}

// ─── CTO ─────────────────────────────────────────────────────────────────────

/// Holds the most recent Common Time of Occurrence. Survives across
/// fragments of one response but is reset between responses.
#[derive(Debug, Default)]
pub struct CtoHistory {
    cto: Option<DnpTime>,
}

impl CtoHistory {
    pub fn set(&mut self, time: DnpTime) {
        self.cto = Some(time);
    }

    pub fn get(&self) -> Option<DnpTime> {
        self.cto
    }

    pub fn clear(&mut self) {
        self.cto = None;
    }
}

// ─── Loader ──────────────────────────────────────────────────────────────────

/// Loader counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoaderStats {
    pub objects_decoded: u64,
    /// Relative-time events dropped because no CTO preceded them.
    pub dropped_no_cto: u64,
}

/// Decodes one response fragment's object region.
pub struct ResponseLoader<'a> {
    cto: &'a mut CtoHistory,
    update: MeasurementUpdate,
    stats: LoaderStats,
}

impl<'a> ResponseLoader<'a> {
    pub fn new(cto: &'a mut CtoHistory) -> Self {
        ResponseLoader {
            cto,
            update: MeasurementUpdate::default(),
            stats: LoaderStats::default(),
        }
    }

    /// Walk every object header in the fragment. Decoding stops at the first
    /// unknown group/variation since the object size is unknowable past it.
    pub fn process(&mut self, objects: &Bytes) -> Result<(), AppError> {
        let mut buf = objects.clone();
        while buf.has_remaining() {
            let header = ObjectHeader::decode(&mut buf)?;
            self.process_header(&header, &mut buf)?;
        }
        Ok(())
    }

    /// Consume the loader, returning the batch for atomic publication.
    pub fn finish(self) -> (MeasurementUpdate, LoaderStats) {
        (self.update, self.stats)
    }

    fn process_header(&mut self, header: &ObjectHeader, buf: &mut Bytes) -> Result<(), AppError> {
        match (header.group, header.variation) {
            // Size-by-variation octet strings.
            (110 | 111, size) => self.read_octet_strings(header, size as usize, buf),
            // Packed bitfields.
            (1, 1) => self.read_bitfield(header, buf, |state| {
                Measurement::binary(state, Quality::ONLINE)
            }),
            (10, 1) => self.read_bitfield(header, buf, |state| {
                Measurement::new(
                    gridlink_protocol::measurement::MeasurementValue::BinaryOutputStatus(state),
                    Quality::ONLINE,
                )
            }),
            (group, variation) => {
                let Some(gv) = GroupVar::from_pair(group, variation) else {
                    tracing::warn!(group, variation, "unknown object in response");
                    return Err(AppError::BadFragment);
                };
                match gv {
                    GroupVar::G51V1 | GroupVar::G51V2 => self.read_cto(header, buf),
                    GroupVar::G50V1 => {
                        // Absolute time in a response carries no measurement.
                        if buf.remaining() < gv.object_size() {
                            return Err(AppError::BadFragment);
                        }
                        buf.advance(gv.object_size());
                        Ok(())
                    }
                    GroupVar::G52V2 => {
                        // Delay measurements are consumed by the time-sync
                        // task, not the loader.
                        if buf.remaining() < gv.object_size() {
                            return Err(AppError::BadFragment);
                        }
                        buf.advance(gv.object_size());
                        Ok(())
                    }
                    _ => self.read_measurements(header, gv, buf),
                }
            }
        }
    }

    fn read_octet_strings(
        &mut self,
        header: &ObjectHeader,
        size: usize,
        buf: &mut Bytes,
    ) -> Result<(), AppError> {
        if size == 0 {
            tracing::warn!("zero-length octet string variation");
            return Err(AppError::BadFragment);
        }
        for position in 0..header.range.count() {
            let index = header.object_index(buf, position)?;
            if buf.remaining() < size {
                return Err(AppError::BadFragment);
            }
            let data = buf.copy_to_bytes(size);
            self.update.octet_strings.push((index, data));
            self.stats.objects_decoded += 1;
        }
        Ok(())
    }

    fn read_bitfield(
        &mut self,
        header: &ObjectHeader,
        buf: &mut Bytes,
        make: impl Fn(bool) -> Measurement,
    ) -> Result<(), AppError> {
        let count = header.range.count();
        let len = packed_bit_len(count);
        if buf.remaining() < len {
            return Err(AppError::BadFragment);
        }
        let data = buf.copy_to_bytes(len);
        for i in 0..count {
            let index = header.range.start() + i as u16;
            self.update.measurements.push((index, make(packed_bit(&data, i))));
            self.stats.objects_decoded += 1;
        }
        Ok(())
    }

    fn read_cto(&mut self, header: &ObjectHeader, buf: &mut Bytes) -> Result<(), AppError> {
        if header.range.count() != 1 {
            tracing::warn!("invalid number of CTO objects");
            return Err(AppError::BadFragment);
        }
        let time = DnpTime::decode(buf).ok_or(AppError::BadFragment)?;
        self.cto.set(time);
        Ok(())
    }

    fn read_measurements(
        &mut self,
        header: &ObjectHeader,
        gv: GroupVar,
        buf: &mut Bytes,
    ) -> Result<(), AppError> {
        let base = if gv.uses_cto() {
            match self.cto.get() {
                Some(base) => Some(base),
                None => {
                    // No time base: skip the run, keep the stream aligned.
                    tracing::warn!(?gv, "relative-time objects without a CTO dropped");
                    let count = header.range.count();
                    for position in 0..count {
                        header.object_index(buf, position)?;
                        if buf.remaining() < gv.object_size() {
                            return Err(AppError::BadFragment);
                        }
                        buf.advance(gv.object_size());
                        self.stats.dropped_no_cto += 1;
                    }
                    return Ok(());
                }
            }
        } else {
            None
        };

        for position in 0..header.range.count() {
            let index = header.object_index(buf, position)?;
            let mut measurement = decode_object(gv, buf).ok_or(AppError::BadFragment)?;
            if let Some(base) = base {
                let offset = measurement.time.map(|t| t.0).unwrap_or(0);
                measurement.time = Some(DnpTime::new(base.0 + offset));
            }
            if !measurement.quality.contains(Quality::ONLINE) && measurement.quality.is_empty() {
                measurement.quality = Quality::ONLINE;
            }
            self.update.measurements.push((index, measurement));
            self.stats.objects_decoded += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use gridlink_protocol::apdu::{QualifierCode, Range};
    use gridlink_protocol::measurement::MeasurementValue;
    use gridlink_protocol::objects::encode_object;

    #[derive(Default)]
    struct Sink {
        binaries: Vec<(u16, bool)>,
        analogs: Vec<(u16, f64)>,
        counters: Vec<(u16, u32)>,
        times: Vec<(u16, Option<DnpTime>)>,
        octets: Vec<(u16, Vec<u8>)>,
    }

    impl MeasurementHandler for Sink {
        fn on_binary(&mut self, index: u16, m: &Measurement) {
            if let MeasurementValue::Binary(v) = m.value {
                self.binaries.push((index, v));
                self.times.push((index, m.time));
            }
        }
        fn on_double_bit(&mut self, _index: u16, _m: &Measurement) {}
        fn on_analog(&mut self, index: u16, m: &Measurement) {
            if let MeasurementValue::Analog(v) = m.value {
                self.analogs.push((index, v));
            }
        }
        fn on_counter(&mut self, index: u16, m: &Measurement) {
            if let MeasurementValue::Counter(v) = m.value {
                self.counters.push((index, v));
            }
        }
        fn on_binary_output_status(&mut self, _index: u16, _m: &Measurement) {}
        fn on_analog_output_status(&mut self, _index: u16, _m: &Measurement) {}
        fn on_octet_string(&mut self, index: u16, data: &[u8]) {
            self.octets.push((index, data.to_vec()));
        }
    }

    fn load(objects: Bytes) -> (MeasurementUpdate, LoaderStats) {
        let mut cto = CtoHistory::default();
        let mut loader = ResponseLoader::new(&mut cto);
        loader.process(&objects).unwrap();
        loader.finish()
    }

    #[test]
    fn static_analogs_and_binaries_decode() {
        let mut buf = BytesMut::new();
        ObjectHeader {
            group: 30,
            variation: 1,
            qualifier: QualifierCode::Uint16StartStop,
            range: Range::StartStop(0, 1),
        }
        .encode(&mut buf);
        encode_object(
            GroupVar::G30V1,
            &Measurement::analog(-17.0, Quality::ONLINE),
            &mut buf,
        );
        encode_object(
            GroupVar::G30V1,
            &Measurement::analog(42.0, Quality::ONLINE),
            &mut buf,
        );
        ObjectHeader {
            group: 1,
            variation: 2,
            qualifier: QualifierCode::Uint16StartStop,
            range: Range::StartStop(5, 5),
        }
        .encode(&mut buf);
        encode_object(
            GroupVar::G1V2,
            &Measurement::binary(true, Quality::ONLINE),
            &mut buf,
        );

        let (update, stats) = load(buf.freeze());
        assert_eq!(stats.objects_decoded, 3);

        let mut sink = Sink::default();
        update.publish(&mut sink);
        assert_eq!(sink.analogs, vec![(0, -17.0), (1, 42.0)]);
        assert_eq!(sink.binaries, vec![(5, true)]);
    }

    #[test]
    fn packed_bitfield_unpacks_by_index() {
        let mut buf = BytesMut::new();
        ObjectHeader {
            group: 1,
            variation: 1,
            qualifier: QualifierCode::Uint16StartStop,
            range: Range::StartStop(8, 17),
        }
        .encode(&mut buf);
        // Bits 0 and 9 of the 10-bit run are set.
        buf.put_u8(0b0000_0001);
        buf.put_u8(0b0000_0010);

        let (update, _) = load(buf.freeze());
        let mut sink = Sink::default();
        update.publish(&mut sink);
        assert_eq!(sink.binaries.len(), 10);
        assert_eq!(sink.binaries[0], (8, true));
        assert_eq!(sink.binaries[1], (9, false));
        assert_eq!(sink.binaries[9], (17, true));
    }

    #[test]
    fn cto_base_applies_to_relative_time_events() {
        let mut buf = BytesMut::new();
        ObjectHeader {
            group: 51,
            variation: 1,
            qualifier: QualifierCode::Uint8Count,
            range: Range::Count(1),
        }
        .encode(&mut buf);
        DnpTime::new(1_000_000).encode(&mut buf);
        ObjectHeader {
            group: 2,
            variation: 3,
            qualifier: QualifierCode::Uint16CountUint16Index,
            range: Range::Count(1),
        }
        .encode(&mut buf);
        buf.put_u16_le(3); // index
        buf.put_u8(Quality::ONLINE.bits() | 0x80); // flags, state on
        buf.put_u16_le(250); // relative offset

        let (update, stats) = load(buf.freeze());
        assert_eq!(stats.dropped_no_cto, 0);
        let mut sink = Sink::default();
        update.publish(&mut sink);
        assert_eq!(sink.binaries, vec![(3, true)]);
        assert_eq!(sink.times, vec![(3, Some(DnpTime(1_000_250)))]);
    }

    #[test]
    fn relative_time_without_cto_is_dropped() {
        let mut buf = BytesMut::new();
        ObjectHeader {
            group: 2,
            variation: 3,
            qualifier: QualifierCode::Uint16CountUint16Index,
            range: Range::Count(1),
        }
        .encode(&mut buf);
        buf.put_u16_le(3);
        buf.put_u8(Quality::ONLINE.bits());
        buf.put_u16_le(250);

        let (update, stats) = load(buf.freeze());
        assert!(update.is_empty());
        assert_eq!(stats.dropped_no_cto, 1);
    }

    #[test]
    fn octet_strings_sized_by_variation() {
        let mut buf = BytesMut::new();
        ObjectHeader {
            group: 110,
            variation: 5,
            qualifier: QualifierCode::Uint16CountUint16Index,
            range: Range::Count(1),
        }
        .encode(&mut buf);
        buf.put_u16_le(2);
        buf.put_slice(b"hello");

        let (update, _) = load(buf.freeze());
        let mut sink = Sink::default();
        update.publish(&mut sink);
        assert_eq!(sink.octets, vec![(2, b"hello".to_vec())]);
    }

    #[test]
    fn counter_events_with_indexes() {
        let mut buf = BytesMut::new();
        ObjectHeader {
            group: 22,
            variation: 1,
            qualifier: QualifierCode::Uint16CountUint16Index,
            range: Range::Count(2),
        }
        .encode(&mut buf);
        for (index, value) in [(4u16, 100u32), (9, 200)] {
            buf.put_u16_le(index);
            encode_object(
                GroupVar::G22V1,
                &Measurement::counter(value, Quality::ONLINE),
                &mut buf,
            );
        }

        let (update, _) = load(buf.freeze());
        let mut sink = Sink::default();
        update.publish(&mut sink);
        assert_eq!(sink.counters, vec![(4, 100), (9, 200)]);
    }

    #[test]
    fn unknown_group_stops_decoding() {
        let mut buf = BytesMut::new();
        buf.put_u8(99); // group
        buf.put_u8(1); // variation
        buf.put_u8(0x06); // all-objects qualifier
        let mut cto = CtoHistory::default();
        let mut loader = ResponseLoader::new(&mut cto);
        assert!(loader.process(&buf.freeze()).is_err());
    }

    #[test]
    fn truncated_object_is_an_error() {
        let mut buf = BytesMut::new();
        ObjectHeader {
            group: 30,
            variation: 1,
            qualifier: QualifierCode::Uint16StartStop,
            range: Range::StartStop(0, 0),
        }
        .encode(&mut buf);
        buf.put_u8(0x01); // only 1 of 5 object bytes

        let mut cto = CtoHistory::default();
        let mut loader = ResponseLoader::new(&mut cto);
        assert!(loader.process(&buf.freeze()).is_err());
    }
}
