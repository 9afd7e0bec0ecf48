//! # Request Builders
//!
//! Fragment builders for every request the master tasks issue. Each returns
//! a complete APDU ready for the transport function.

use bytes::{BufMut, Bytes};

use gridlink_protocol::apdu::{
    ApduBuilder, AppControl, FunctionCode, ObjectHeader, QualifierCode, Range,
};
use gridlink_protocol::command::{Command, CommandStatus};
use gridlink_protocol::config::{AppConfig, DEFAULT_MAX_FRAGMENT_SIZE};
use gridlink_protocol::measurement::{ClassMask, DnpTime, EventClass};

fn class_header(class: Option<EventClass>) -> ObjectHeader {
    let variation = match class {
        None => 1, // class 0: all static data
        Some(EventClass::Class1) => 2,
        Some(EventClass::Class2) => 3,
        Some(EventClass::Class3) => 4,
    };
    ObjectHeader {
        group: 60,
        variation,
        qualifier: QualifierCode::AllObjects,
        range: Range::All,
    }
}

/// READ of all event classes plus class 0 — the integrity poll.
pub fn integrity_poll(seq: u8) -> Bytes {
    let mut builder = ApduBuilder::request(
        FunctionCode::Read,
        AppControl::single(seq),
        DEFAULT_MAX_FRAGMENT_SIZE,
    );
    for class in [
        Some(EventClass::Class1),
        Some(EventClass::Class2),
        Some(EventClass::Class3),
        None,
    ] {
        builder.write_header(&class_header(class));
    }
    builder.freeze()
}

/// READ of the event classes in `mask` — an event (class) scan.
pub fn class_scan(mask: ClassMask, seq: u8) -> Bytes {
    let mut builder = ApduBuilder::request(
        FunctionCode::Read,
        AppControl::single(seq),
        DEFAULT_MAX_FRAGMENT_SIZE,
    );
    for class in mask.classes() {
        builder.write_header(&class_header(Some(class)));
    }
    builder.freeze()
}

/// ENABLE_UNSOLICITED / DISABLE_UNSOLICITED for the classes in `mask`.
pub fn unsol_control(enable: bool, mask: ClassMask, seq: u8) -> Bytes {
    let function = if enable {
        FunctionCode::EnableUnsolicited
    } else {
        FunctionCode::DisableUnsolicited
    };
    let mut builder = ApduBuilder::request(
        function,
        AppControl::single(seq),
        DEFAULT_MAX_FRAGMENT_SIZE,
    );
    for class in mask.classes() {
        builder.write_header(&class_header(Some(class)));
    }
    builder.freeze()
}

/// A CONFIRM for the given response sequence.
pub fn confirm(seq: u8, unsolicited: bool) -> Bytes {
    let mut control = AppControl::single(seq);
    if unsolicited {
        control = control.with_uns();
    }
    ApduBuilder::request(FunctionCode::Confirm, control, DEFAULT_MAX_FRAGMENT_SIZE).freeze()
}

/// DELAY_MEASURE, the first half of a time sync.
pub fn delay_measure(seq: u8) -> Bytes {
    ApduBuilder::request(
        FunctionCode::DelayMeasure,
        AppControl::single(seq),
        DEFAULT_MAX_FRAGMENT_SIZE,
    )
    .freeze()
}

/// WRITE of the absolute time (g50v1), the second half of a time sync.
pub fn time_write(time: DnpTime, seq: u8) -> Bytes {
    let mut builder = ApduBuilder::request(
        FunctionCode::Write,
        AppControl::single(seq),
        DEFAULT_MAX_FRAGMENT_SIZE,
    );
    builder.write_header(&ObjectHeader {
        group: 50,
        variation: 1,
        qualifier: QualifierCode::Uint8Count,
        range: Range::Count(1),
    });
    time.encode(builder.raw());
    builder.freeze()
}

/// WRITE clearing the outstation's DEVICE_RESTART indication (g80v1 bit 7).
pub fn clear_restart(seq: u8) -> Bytes {
    let mut builder = ApduBuilder::request(
        FunctionCode::Write,
        AppControl::single(seq),
        DEFAULT_MAX_FRAGMENT_SIZE,
    );
    builder.write_header(&ObjectHeader {
        group: 80,
        variation: 1,
        qualifier: QualifierCode::Uint8StartStop,
        range: Range::StartStop(7, 7),
    });
    builder.raw().put_u8(0x00);
    builder.freeze()
}

/// SELECT / OPERATE / DIRECT_OPERATE carrying a single command object.
pub fn command_request(
    function: FunctionCode,
    command: &Command,
    index: u16,
    seq: u8,
    app: &AppConfig,
) -> Bytes {
    debug_assert!(matches!(
        function,
        FunctionCode::Select
            | FunctionCode::Operate
            | FunctionCode::DirectOperate
            | FunctionCode::DirectOperateNr
    ));
    let mut builder =
        ApduBuilder::request(function, AppControl::single(seq), app.max_fragment_size);
    let (group, variation) = command.kind().group_var();
    builder.write_header(&ObjectHeader {
        group,
        variation,
        qualifier: QualifierCode::Uint16CountUint16Index,
        range: Range::Count(1),
    });
    builder.raw().put_u16_le(index);
    command.encode(CommandStatus::Success, builder.raw());
    builder.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use gridlink_protocol::apdu::Apdu;
    use gridlink_protocol::command::{CommandKind, Crob};

    fn headers(apdu: &Apdu) -> Vec<(u8, u8)> {
        let mut buf = apdu.objects.clone();
        let mut out = Vec::new();
        while buf.has_remaining() {
            let header = ObjectHeader::decode(&mut buf).unwrap();
            out.push((header.group, header.variation));
            // Tests only build object-less headers here, except commands.
            if header.group == 12 {
                buf.advance(2 + CommandKind::Crob.object_size());
            }
            if header.group == 50 {
                buf.advance(6);
            }
            if header.group == 80 {
                buf.advance(1);
            }
        }
        out
    }

    #[test]
    fn integrity_poll_reads_all_classes() {
        let apdu = Apdu::parse(integrity_poll(3)).unwrap();
        assert_eq!(apdu.function, FunctionCode::Read);
        assert_eq!(apdu.control.seq, 3);
        assert_eq!(
            headers(&apdu),
            vec![(60, 2), (60, 3), (60, 4), (60, 1)],
            "events before class 0"
        );
    }

    #[test]
    fn class_scan_honors_mask() {
        let mask = ClassMask {
            class1: true,
            class2: false,
            class3: true,
        };
        let apdu = Apdu::parse(class_scan(mask, 0)).unwrap();
        assert_eq!(headers(&apdu), vec![(60, 2), (60, 4)]);
    }

    #[test]
    fn unsol_control_function_codes() {
        let apdu = Apdu::parse(unsol_control(false, ClassMask::ALL, 1)).unwrap();
        assert_eq!(apdu.function, FunctionCode::DisableUnsolicited);
        assert_eq!(headers(&apdu).len(), 3);

        let apdu = Apdu::parse(unsol_control(true, ClassMask::ALL, 2)).unwrap();
        assert_eq!(apdu.function, FunctionCode::EnableUnsolicited);
    }

    #[test]
    fn confirm_carries_uns_for_unsolicited() {
        let apdu = Apdu::parse(confirm(7, true)).unwrap();
        assert_eq!(apdu.function, FunctionCode::Confirm);
        assert!(apdu.control.uns);
        assert_eq!(apdu.control.seq, 7);
        assert!(apdu.objects.is_empty());
    }

    #[test]
    fn time_write_carries_g50v1() {
        let apdu = Apdu::parse(time_write(DnpTime::new(123_456), 0)).unwrap();
        assert_eq!(headers(&apdu), vec![(50, 1)]);
    }

    #[test]
    fn clear_restart_writes_bit_seven() {
        let apdu = Apdu::parse(clear_restart(0)).unwrap();
        assert_eq!(apdu.function, FunctionCode::Write);
        assert_eq!(headers(&apdu), vec![(80, 1)]);
    }

    #[test]
    fn command_request_echoable() {
        let command = Command::Crob(Crob::new(Crob::LATCH_ON));
        let apdu = Apdu::parse(command_request(
            FunctionCode::Select,
            &command,
            7,
            3,
            &AppConfig::default(),
        ))
        .unwrap();
        assert_eq!(apdu.function, FunctionCode::Select);

        let mut buf = apdu.objects.clone();
        let header = ObjectHeader::decode(&mut buf).unwrap();
        assert_eq!((header.group, header.variation), (12, 1));
        assert_eq!(buf.get_u16_le(), 7);
        let (decoded, _) = Command::decode(CommandKind::Crob, &mut buf).unwrap();
        assert_eq!(decoded, command);
    }
}
