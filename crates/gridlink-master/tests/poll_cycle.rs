//! # Integration tests: master ↔ outstation at the application layer
//!
//! Drives a real outstation engine with master-built requests and decodes
//! the engine's responses with the master's response loader. No framing —
//! the two ends exchange application fragments directly; the link and
//! transport layers are covered by the protocol crate's own suite.

use quanta::Instant;

use gridlink_master::loader::{CtoHistory, MeasurementHandler, ResponseLoader};
use gridlink_master::requests;
use gridlink_protocol::apdu::{Apdu, FunctionCode, IinField};
use gridlink_protocol::command::{Command, CommandHandler, CommandStatus, Crob};
use gridlink_protocol::config::{AppConfig, OutstationConfig};
use gridlink_protocol::measurement::{
    ClassMask, EventClass, Measurement, MeasurementValue, PointKind, Quality,
};
use gridlink_outstation::database::PointCounts;
use gridlink_outstation::engine::{OutstationAction, OutstationEngine};

// ─── Helpers ────────────────────────────────────────────────────────────────

struct NullCommandHandler;

impl CommandHandler for NullCommandHandler {
    fn select(&mut self, _command: &Command, _index: u16) -> CommandStatus {
        CommandStatus::Success
    }
    fn operate(&mut self, _command: &Command, _index: u16) -> CommandStatus {
        CommandStatus::Success
    }
    fn direct_operate(&mut self, _command: &Command, _index: u16) -> CommandStatus {
        CommandStatus::Success
    }
}

#[derive(Default)]
struct Recorder {
    binaries: Vec<(u16, bool)>,
    analogs: Vec<(u16, f64)>,
}

impl MeasurementHandler for Recorder {
    fn on_binary(&mut self, index: u16, m: &Measurement) {
        if let MeasurementValue::Binary(v) = m.value {
            self.binaries.push((index, v));
        }
    }
    fn on_double_bit(&mut self, _index: u16, _m: &Measurement) {}
    fn on_analog(&mut self, index: u16, m: &Measurement) {
        if let MeasurementValue::Analog(v) = m.value {
            self.analogs.push((index, v));
        }
    }
    fn on_counter(&mut self, _index: u16, _m: &Measurement) {}
    fn on_binary_output_status(&mut self, _index: u16, _m: &Measurement) {}
    fn on_analog_output_status(&mut self, _index: u16, _m: &Measurement) {}
    fn on_octet_string(&mut self, _index: u16, _data: &[u8]) {}
}

fn outstation() -> OutstationEngine {
    let mut engine = OutstationEngine::new(
        OutstationConfig {
            disable_unsol: true,
            ..Default::default()
        },
        AppConfig::default(),
        PointCounts {
            binaries: 3,
            analogs: 2,
            ..Default::default()
        },
        Box::new(NullCommandHandler),
    );
    engine
        .database()
        .set_class(PointKind::Binary, 0, Some(EventClass::Class1));
    engine.on_link_up(Instant::now());
    engine
}

fn solicited(engine: &mut OutstationEngine) -> Apdu {
    let fragment = engine
        .drain_actions()
        .find_map(|a| match a {
            OutstationAction::SendSolicited(f) => Some(f),
            _ => None,
        })
        .expect("a solicited response");
    Apdu::parse(fragment).unwrap()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[test]
fn integrity_poll_roundtrip_loads_measurements() {
    let mut engine = outstation();
    let now = Instant::now();

    // Field data arrives before the poll.
    engine
        .update(Measurement::binary(true, Quality::ONLINE), 0)
        .unwrap();
    engine
        .update(Measurement::analog(3.5, Quality::ONLINE), 0)
        .unwrap();
    engine.process_updates(now);

    engine.on_request(requests::integrity_poll(4), now);
    let response = solicited(&mut engine);
    assert_eq!(response.function, FunctionCode::Response);
    assert_eq!(response.control.seq, 4);

    let mut cto = CtoHistory::default();
    let mut loader = ResponseLoader::new(&mut cto);
    loader.process(&response.objects).unwrap();
    let (update, stats) = loader.finish();
    assert!(stats.objects_decoded >= 5, "1 event + 5 static points");

    let mut recorder = Recorder::default();
    update.publish(&mut recorder);

    // The binary event and the static image both report index 0 as true.
    assert!(recorder.binaries.iter().any(|&(i, v)| i == 0 && v));
    assert!(recorder.analogs.contains(&(0, 3.5)));
    assert_eq!(recorder.analogs.len(), 2);

    // Master confirms; the outstation purges its events.
    engine.on_sol_send_result(true, now);
    assert!(!engine.iin().contains(IinField::CLASS1_EVENTS));
}

#[test]
fn class_scan_returns_only_events() {
    let mut engine = outstation();
    let now = Instant::now();
    engine
        .update(Measurement::binary(true, Quality::ONLINE), 0)
        .unwrap();
    engine.process_updates(now);

    engine.on_request(requests::class_scan(ClassMask::single(EventClass::Class1), 1), now);
    let response = solicited(&mut engine);

    let mut cto = CtoHistory::default();
    let mut loader = ResponseLoader::new(&mut cto);
    loader.process(&response.objects).unwrap();
    let (update, _) = loader.finish();

    let mut recorder = Recorder::default();
    update.publish(&mut recorder);
    assert_eq!(recorder.binaries, vec![(0, true)]);
    assert!(recorder.analogs.is_empty(), "no static data in a class scan");
}

#[test]
fn clear_restart_cycle() {
    let mut engine = outstation();
    let now = Instant::now();

    engine.on_request(requests::integrity_poll(0), now);
    let response = solicited(&mut engine);
    assert!(response.iin.unwrap().contains(IinField::DEVICE_RESTART));
    engine.on_sol_send_result(true, now);

    // The master sees DEVICE_RESTART and writes it clear.
    engine.on_request(requests::clear_restart(1), now);
    let response = solicited(&mut engine);
    assert!(!response.iin.unwrap().contains(IinField::DEVICE_RESTART));
}

#[test]
fn select_operate_command_cycle() {
    let mut engine = outstation();
    let now = Instant::now();
    let command = Command::Crob(Crob::new(Crob::LATCH_ON));
    let app = AppConfig::default();

    engine.on_request(
        requests::command_request(FunctionCode::Select, &command, 1, 3, &app),
        now,
    );
    let response = solicited(&mut engine);
    assert_eq!(response.control.seq, 3);
    engine.on_sol_send_result(true, now);

    engine.on_request(
        requests::command_request(FunctionCode::Operate, &command, 1, 4, &app),
        now,
    );
    let response = solicited(&mut engine);
    // The echoed status octet is the last byte of the command object.
    let status = *response.objects.last().unwrap();
    assert_eq!(status, CommandStatus::Success as u8);
}
