//! # Outstation Engine
//!
//! Request dispatch, IIN maintenance, response building, and the
//! solicited/unsolicited serialization rules. Pure logic: the engine emits
//! [`OutstationAction`]s (fragments to send, timers to arm, callbacks to
//! post) and the owner wires them to the application channel and executor.
//!
//! One response may be outstanding at a time. Requests, data updates, and
//! unsolicited triggers that arrive while a response is in flight are
//! deferred and flushed after the next completion event, mirroring the
//! single-threaded executor model of the rest of the stack.

use bytes::{Buf, BufMut, Bytes};
use quanta::Instant;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use gridlink_protocol::apdu::{
    next_seq, Apdu, ApduBuilder, AppControl, FunctionCode, IinField, ObjectHeader, QualifierCode,
    Range,
};
use gridlink_protocol::command::{Command, CommandHandler, CommandKind, CommandStatus};
use gridlink_protocol::config::{AppConfig, OutstationConfig};
use gridlink_protocol::measurement::{ClassMask, DnpTime, EventClass, Measurement, PointKind};
use gridlink_protocol::objects::{
    encode_object, packed_bit, packed_bit_len, GroupVar,
};

use crate::database::{ChangeBuffer, ChangeBufferFull, Database, PointCounts};
use crate::events::EventBuffer;
use crate::sbo::SboHandler;

/// Default capacity of the producer change buffer.
pub const DEFAULT_CHANGE_BUFFER_CAPACITY: usize = 1024;

// ─── Actions ─────────────────────────────────────────────────────────────────

/// Side effects for the owner to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum OutstationAction {
    /// Send a solicited response through the application channel.
    SendSolicited(Bytes),
    /// Send an unsolicited response through the application channel.
    SendUnsolicited(Bytes),
    /// Arm the unsolicited hold/retry timer.
    StartUnsolTimer(Duration),
    /// Post the master-written absolute time to the time handler.
    WriteAbsoluteTime(DnpTime),
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    /// Lower layer down.
    Closed,
    Idle,
    /// A solicited response is in flight.
    SolPending,
    /// An unsolicited response is in flight.
    UnsolPending,
}

#[derive(Debug, Clone, Copy)]
struct StaticRange {
    kind: PointKind,
    next: u16,
    /// Inclusive.
    stop: u16,
}

/// Pagination state of a READ spanning multiple response fragments.
struct ReadContext {
    classes: ClassMask,
    statics: VecDeque<StaticRange>,
    first: bool,
}

#[derive(Debug, Clone, Copy)]
enum CommandOp {
    Select,
    Operate,
    DirectOperate,
    DirectOperateNoResp,
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineStats {
    pub requests: u64,
    pub duplicate_requests: u64,
    pub malformed_requests: u64,
    pub responses: u64,
    pub unsolicited: u64,
    pub unknown_objects: u64,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// The outstation response engine.
pub struct OutstationEngine {
    config: OutstationConfig,
    app: AppConfig,
    db: Database,
    events: EventBuffer,
    sbo: SboHandler,
    handler: Box<dyn CommandHandler>,
    /// Persistent IIN bits (restart, need-time, trouble).
    iin: IinField,
    state: EngineState,
    unsol_mask: ClassMask,
    completed_null_unsol: bool,
    deferred_unsol: bool,
    deferred_request: Option<Bytes>,
    unsol_timer_running: bool,
    /// Whether the in-flight unsolicited response carried events.
    unsol_had_events: bool,
    sol_seq: u8,
    unsol_seq: u8,
    read_context: Option<ReadContext>,
    /// Last request fragment and its response, for duplicate replay.
    last_request: Option<(Bytes, Bytes)>,
    change_buffer: ChangeBuffer,
    actions: Vec<OutstationAction>,
    stats: EngineStats,
}

impl OutstationEngine {
    pub fn new(
        config: OutstationConfig,
        app: AppConfig,
        counts: PointCounts,
        handler: Box<dyn CommandHandler>,
    ) -> Self {
        let events = EventBuffer::new(config.event_buffer);
        let sbo = SboHandler::new(config.select_timeout);
        OutstationEngine {
            unsol_mask: config.unsol_class_mask,
            events,
            sbo,
            config,
            app,
            db: Database::new(counts),
            handler,
            iin: IinField::DEVICE_RESTART, // always set on restart
            state: EngineState::Closed,
            completed_null_unsol: false,
            deferred_unsol: false,
            deferred_request: None,
            unsol_timer_running: false,
            unsol_had_events: false,
            sol_seq: 0,
            unsol_seq: 0,
            read_context: None,
            last_request: None,
            change_buffer: ChangeBuffer::new(DEFAULT_CHANGE_BUFFER_CAPACITY),
            actions: Vec::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn database(&mut self) -> &mut Database {
        &mut self.db
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn iin(&self) -> IinField {
        self.dynamic_iin()
    }

    pub fn drain_actions(&mut self) -> impl Iterator<Item = OutstationAction> + '_ {
        self.actions.drain(..)
    }

    // ─── Producer side ──────────────────────────────────────────────────

    /// Queue a measurement update from the field. Producers run off-executor;
    /// a full buffer is a flow-control error, not data loss inside the stack.
    pub fn update(&mut self, measurement: Measurement, index: u16) -> Result<(), ChangeBufferFull> {
        self.change_buffer.push(measurement, index)
    }

    /// Drain the change buffer into the database and event buffer. Posted to
    /// the executor by the owner after [`OutstationEngine::update`].
    pub fn process_updates(&mut self, now: Instant) {
        let mut generated = Vec::new();
        for (measurement, index) in self.change_buffer.drain() {
            if let Some(event) = self.db.update(measurement, index) {
                generated.push(event);
            }
        }
        for event in generated {
            if GroupVar::event_for(event.measurement.kind()).is_some() {
                self.events.update(event.measurement, event.class, event.index);
            }
        }
        self.flush(now);
    }

    // ─── Layer events ───────────────────────────────────────────────────

    pub fn on_link_up(&mut self, now: Instant) {
        self.state = EngineState::Idle;
        if !self.config.disable_unsol {
            // Run the null-unsolicited startup sequence on every link-up.
            self.completed_null_unsol = false;
            self.deferred_unsol = true;
        }
        self.flush(now);
    }

    pub fn on_link_down(&mut self) {
        self.state = EngineState::Closed;
        self.events.deselect();
        self.read_context = None;
        self.unsol_timer_running = false;
        self.last_request = None;
    }

    /// The configured time-sync period elapsed: prompt the master for time.
    pub fn on_time_sync_period(&mut self) {
        self.iin |= IinField::NEED_TIME;
    }

    // ─── Request path ───────────────────────────────────────────────────

    /// Process a request fragment delivered by the application layer.
    pub fn on_request(&mut self, fragment: Bytes, now: Instant) {
        match self.state {
            EngineState::Closed => {
                tracing::warn!("request while closed dropped");
                return;
            }
            EngineState::SolPending | EngineState::UnsolPending => {
                self.deferred_request = Some(fragment);
                return;
            }
            EngineState::Idle => {}
        }

        // An identical retransmitted request replays the stored response.
        let replay = match &self.last_request {
            Some((last_req, last_rsp)) if *last_req == fragment => Some(last_rsp.clone()),
            _ => None,
        };
        if let Some(replay) = replay {
            self.stats.duplicate_requests += 1;
            self.send_solicited(replay);
            return;
        }

        let apdu = match Apdu::parse(fragment.clone()) {
            Ok(apdu) => apdu,
            Err(err) => {
                self.stats.malformed_requests += 1;
                tracing::warn!(error = %err, "malformed request dropped");
                return;
            }
        };
        self.stats.requests += 1;
        self.sol_seq = apdu.control.seq;

        let response = match apdu.function {
            FunctionCode::Read => self.handle_read(&apdu),
            FunctionCode::Write => self.handle_write(&apdu),
            FunctionCode::Select => self.handle_commands(CommandOp::Select, &apdu, now),
            FunctionCode::Operate => self.handle_commands(CommandOp::Operate, &apdu, now),
            FunctionCode::DirectOperate => {
                self.handle_commands(CommandOp::DirectOperate, &apdu, now)
            }
            FunctionCode::DirectOperateNr => {
                self.handle_commands(CommandOp::DirectOperateNoResp, &apdu, now)
            }
            FunctionCode::DelayMeasure => self.handle_delay_measure(&apdu),
            FunctionCode::EnableUnsolicited => self.handle_unsol_config(true, &apdu),
            FunctionCode::DisableUnsolicited => self.handle_unsol_config(false, &apdu),
            FunctionCode::Confirm => {
                tracing::debug!("confirm is handled by the channel, ignoring");
                None
            }
            FunctionCode::Response | FunctionCode::UnsolicitedResponse => {
                tracing::warn!("response function in request direction dropped");
                None
            }
        };

        if let Some(response) = response {
            self.last_request = Some((fragment, response.clone()));
            self.send_solicited(response);
        } else {
            self.flush(now);
        }
    }

    /// The solicited response completed (send done, confirm received when one
    /// was requested).
    pub fn on_sol_send_result(&mut self, success: bool, now: Instant) {
        if self.state != EngineState::SolPending {
            tracing::debug!("spurious solicited send result");
            return;
        }
        self.state = EngineState::Idle;

        if success {
            self.events.mark_selected_written();
            self.events.clear_written();
            if self.read_context.is_some() {
                // Continue a paginated READ.
                let fragment = self.build_read_fragment(self.sol_seq, IinField::empty());
                self.send_solicited(fragment);
                return;
            }
        } else {
            self.events.deselect();
            self.read_context = None;
        }
        self.flush(now);
    }

    /// The unsolicited response completed.
    pub fn on_unsol_send_result(&mut self, success: bool, now: Instant) {
        if self.state != EngineState::UnsolPending {
            tracing::debug!("spurious unsolicited send result");
            return;
        }
        self.state = EngineState::Idle;

        if success {
            if !self.completed_null_unsol {
                self.completed_null_unsol = true;
            } else if self.unsol_had_events {
                self.events.mark_selected_written();
                self.events.clear_written();
            }
            self.unsol_seq = next_seq(self.unsol_seq);
        } else {
            tracing::warn!("unsolicited response failed, scheduling retry");
            self.events.deselect();
            self.arm_unsol_timer(self.config.unsol_retry_timer);
        }
        self.flush(now);
    }

    /// The unsolicited hold/retry timer expired.
    pub fn on_unsol_timer(&mut self) {
        self.unsol_timer_running = false;
        if self.state != EngineState::Idle {
            self.deferred_unsol = true;
            return;
        }
        if self.config.disable_unsol {
            return;
        }
        if !self.completed_null_unsol {
            self.send_null_unsolicited();
        } else if self.events.any_pending(self.unsol_mask) {
            self.send_event_unsolicited();
        }
    }

    // ─── Deferred-event flushing ────────────────────────────────────────

    fn flush(&mut self, now: Instant) {
        if self.state != EngineState::Idle {
            return;
        }

        if self.deferred_unsol && !self.config.disable_unsol {
            self.deferred_unsol = false;
            if !self.completed_null_unsol {
                self.send_null_unsolicited();
            } else if self.events.any_pending(self.unsol_mask) {
                self.send_event_unsolicited();
            }
        }

        if self.state == EngineState::Idle {
            if let Some(request) = self.deferred_request.take() {
                self.on_request(request, now);
            }
        }

        self.maybe_arm_unsol();
    }

    fn maybe_arm_unsol(&mut self) {
        if self.state == EngineState::Idle
            && !self.config.disable_unsol
            && self.completed_null_unsol
            && !self.unsol_timer_running
            && self.events.any_pending(self.unsol_mask)
        {
            self.arm_unsol_timer(self.config.unsol_pack_timer);
        }
    }

    fn arm_unsol_timer(&mut self, delay: Duration) {
        self.unsol_timer_running = true;
        self.actions.push(OutstationAction::StartUnsolTimer(delay));
    }

    // ─── IIN ────────────────────────────────────────────────────────────

    fn dynamic_iin(&self) -> IinField {
        let mut iin = self.iin;
        if self.events.has_pending(EventClass::Class1) {
            iin |= IinField::CLASS1_EVENTS;
        }
        if self.events.has_pending(EventClass::Class2) {
            iin |= IinField::CLASS2_EVENTS;
        }
        if self.events.has_pending(EventClass::Class3) {
            iin |= IinField::CLASS3_EVENTS;
        }
        if self.events.is_overflown() {
            iin |= IinField::EVENT_BUFFER_OVERFLOW;
        }
        iin
    }

    // ─── READ ───────────────────────────────────────────────────────────

    fn handle_read(&mut self, apdu: &Apdu) -> Option<Bytes> {
        let mut objects = apdu.objects.clone();
        let mut rsp_iin = IinField::empty();
        let mut ctx = ReadContext {
            classes: ClassMask::NONE,
            statics: VecDeque::new(),
            first: true,
        };

        while objects.has_remaining() {
            let header = match ObjectHeader::decode(&mut objects) {
                Ok(h) => h,
                Err(_) => {
                    rsp_iin |= IinField::PARAMETER_ERROR;
                    break;
                }
            };
            match (header.group, header.variation) {
                (60, 1) => self.push_all_statics(&mut ctx),
                (60, 2) => ctx.classes.set(EventClass::Class1, true),
                (60, 3) => ctx.classes.set(EventClass::Class2, true),
                (60, 4) => ctx.classes.set(EventClass::Class3, true),
                (1, 0 | 2) => self.push_static(&mut ctx, PointKind::Binary, &header),
                (3, 0 | 2) => self.push_static(&mut ctx, PointKind::DoubleBitBinary, &header),
                (10, 0 | 2) => self.push_static(&mut ctx, PointKind::BinaryOutputStatus, &header),
                (20, 0 | 1) => self.push_static(&mut ctx, PointKind::Counter, &header),
                (30, 0..=2) => self.push_static(&mut ctx, PointKind::Analog, &header),
                (40, 0 | 1) => self.push_static(&mut ctx, PointKind::AnalogOutputStatus, &header),
                (group, variation) => {
                    self.stats.unknown_objects += 1;
                    tracing::warn!(group, variation, "unknown object in READ");
                    rsp_iin |= IinField::OBJECT_UNKNOWN;
                }
            }
        }

        self.read_context = Some(ctx);
        Some(self.build_read_fragment(apdu.control.seq, rsp_iin))
    }

    fn push_all_statics(&self, ctx: &mut ReadContext) {
        for kind in [
            PointKind::Binary,
            PointKind::DoubleBitBinary,
            PointKind::Counter,
            PointKind::Analog,
            PointKind::BinaryOutputStatus,
            PointKind::AnalogOutputStatus,
        ] {
            let count = self.db.count(kind);
            if count > 0 {
                ctx.statics.push_back(StaticRange {
                    kind,
                    next: 0,
                    stop: (count - 1) as u16,
                });
            }
        }
    }

    fn push_static(&self, ctx: &mut ReadContext, kind: PointKind, header: &ObjectHeader) {
        let count = self.db.count(kind);
        if count == 0 {
            return;
        }
        let max_stop = (count - 1) as u16;
        let (next, stop) = match header.range {
            Range::StartStop(start, stop) => (start, stop.min(max_stop)),
            _ => (0, max_stop),
        };
        if next <= stop {
            ctx.statics.push_back(StaticRange { kind, next, stop });
        }
    }

    /// Build one response fragment from the read context: selected events
    /// first, then as much static data as fits.
    fn build_read_fragment(&mut self, seq: u8, rsp_iin: IinField) -> Bytes {
        let mut ctx = self.read_context.take().expect("read context present");
        let control = AppControl {
            fir: ctx.first,
            fin: true,
            con: false,
            uns: false,
            seq,
        };
        ctx.first = false;
        let mut builder =
            ApduBuilder::response(FunctionCode::Response, control, self.app.max_fragment_size);

        // Events for the requested classes, selected under a size budget.
        let mut wrote_events = false;
        if ctx.classes.any() {
            let mut budget = builder.remaining();
            self.events.select_where(ctx.classes, |record, _| {
                let gv = GroupVar::event_for(record.measurement.kind())
                    .expect("only event-capable kinds are buffered");
                // Worst case: a fresh object header plus the indexed object.
                let cost = 7 + 2 + gv.object_size();
                if budget >= cost {
                    budget -= cost;
                    true
                } else {
                    false
                }
            });

            let selected: Vec<(GroupVar, u16, Measurement)> = self
                .events
                .selected()
                .map(|r| {
                    let gv = GroupVar::event_for(r.measurement.kind()).unwrap();
                    (gv, r.index, r.measurement)
                })
                .collect();
            wrote_events = !selected.is_empty();

            // One header per run of equal group/variation.
            let mut i = 0;
            while i < selected.len() {
                let gv = selected[i].0;
                let run_end = selected[i..]
                    .iter()
                    .position(|(g, _, _)| *g != gv)
                    .map(|n| i + n)
                    .unwrap_or(selected.len());
                let (group, variation) = gv.pair();
                builder.write_header(&ObjectHeader {
                    group,
                    variation,
                    qualifier: QualifierCode::Uint16CountUint16Index,
                    range: Range::Count((run_end - i) as u16),
                });
                for (_, index, measurement) in &selected[i..run_end] {
                    builder.raw().put_u16_le(*index);
                    encode_object(gv, measurement, builder.raw());
                }
                i = run_end;
            }
        }
        let events_remaining = ctx.classes.any() && self.events.any_pending(ctx.classes);

        // Static data, range by range, as much as fits.
        let mut statics_remaining = false;
        while let Some(range) = ctx.statics.front_mut() {
            let gv = GroupVar::static_for(range.kind);
            let object_size = gv.object_size();
            let header_size = 7; // group, var, qualifier, u16 start/stop
            let available = builder.remaining();
            if available < header_size + object_size {
                statics_remaining = true;
                break;
            }
            let fit = ((available - header_size) / object_size) as u16;
            let wanted = range.stop - range.next + 1;
            let count = fit.min(wanted);
            let stop = range.next + count - 1;
            let (group, variation) = gv.pair();
            builder.write_header(&ObjectHeader {
                group,
                variation,
                qualifier: QualifierCode::Uint16StartStop,
                range: Range::StartStop(range.next, stop),
            });
            for index in range.next..=stop {
                let measurement = self
                    .db
                    .get(range.kind, index)
                    .expect("range clamped to database size");
                encode_object(gv, &measurement, builder.raw());
            }
            if stop == range.stop {
                ctx.statics.pop_front();
            } else {
                range.next = stop + 1;
                statics_remaining = true;
                break;
            }
        }

        let more = statics_remaining || events_remaining;
        builder.set_control(AppControl {
            fir: control.fir,
            fin: !more,
            // Events always require a confirm; so does every non-final
            // fragment.
            con: wrote_events || more,
            uns: false,
            seq,
        });
        builder.set_iin(self.dynamic_iin() | rsp_iin);

        if more {
            self.read_context = Some(ctx);
        }
        builder.freeze()
    }

    // ─── WRITE ──────────────────────────────────────────────────────────

    fn handle_write(&mut self, apdu: &Apdu) -> Option<Bytes> {
        let mut objects = apdu.objects.clone();
        let mut rsp_iin = IinField::empty();

        while objects.has_remaining() {
            let header = match ObjectHeader::decode(&mut objects) {
                Ok(h) => h,
                Err(_) => {
                    rsp_iin |= IinField::PARAMETER_ERROR;
                    break;
                }
            };
            match (header.group, header.variation) {
                (80, 1) => {
                    let count = header.range.count();
                    let len = packed_bit_len(count);
                    if objects.remaining() < len {
                        rsp_iin |= IinField::PARAMETER_ERROR;
                        break;
                    }
                    let data = objects.copy_to_bytes(len);
                    for i in 0..count {
                        let index = header.range.start() + i as u16;
                        let value = packed_bit(&data, i);
                        // Only clearing DEVICE_RESTART (bit 7) is writable.
                        if index == 7 && !value {
                            self.iin.remove(IinField::DEVICE_RESTART);
                        } else {
                            rsp_iin |= IinField::PARAMETER_ERROR;
                            tracing::warn!(index, value, "invalid IIN write");
                        }
                    }
                }
                (50, 1) => {
                    if header.range.count() != 1 {
                        rsp_iin |= IinField::PARAMETER_ERROR;
                        break;
                    }
                    let Some(time) = DnpTime::decode(&mut objects) else {
                        rsp_iin |= IinField::PARAMETER_ERROR;
                        break;
                    };
                    if self.iin.contains(IinField::NEED_TIME) {
                        self.iin.remove(IinField::NEED_TIME);
                        // Posted back to the owner with the stack unwound.
                        self.actions.push(OutstationAction::WriteAbsoluteTime(time));
                        tracing::info!(ms = time.0, "time synchronized with master");
                    } else {
                        tracing::warn!("time write while not requesting time sync");
                    }
                }
                (group, variation) => {
                    tracing::warn!(group, variation, "object/function mismatch in WRITE");
                    rsp_iin |= IinField::FUNC_NOT_SUPPORTED;
                    break;
                }
            }
        }

        Some(self.null_response(apdu.control.seq, rsp_iin))
    }

    // ─── Commands ───────────────────────────────────────────────────────

    fn handle_commands(&mut self, op: CommandOp, apdu: &Apdu, now: Instant) -> Option<Bytes> {
        let mut objects = apdu.objects.clone();
        let seq = apdu.control.seq;
        let mut rsp_iin = IinField::empty();
        let mut builder = ApduBuilder::response(
            FunctionCode::Response,
            AppControl::single(seq),
            self.app.max_fragment_size,
        );
        let mut controls_seen = 0usize;

        'headers: while objects.has_remaining() {
            let header = match ObjectHeader::decode(&mut objects) {
                Ok(h) => h,
                Err(_) => {
                    rsp_iin |= IinField::PARAMETER_ERROR;
                    break;
                }
            };
            let Some(kind) = CommandKind::from_group_var(header.group, header.variation) else {
                tracing::warn!(
                    group = header.group,
                    variation = header.variation,
                    "object/function mismatch in control request"
                );
                rsp_iin |= IinField::FUNC_NOT_SUPPORTED;
                break;
            };

            builder.write_header(&header);
            let count = header.range.count();
            for position in 0..count {
                let Ok(index) = header.object_index(&mut objects, position) else {
                    rsp_iin |= IinField::PARAMETER_ERROR;
                    break 'headers;
                };
                let Ok((command, _)) = Command::decode(kind, &mut objects) else {
                    rsp_iin |= IinField::PARAMETER_ERROR;
                    break 'headers;
                };

                let status = if controls_seen >= self.config.max_controls_per_request {
                    CommandStatus::TooManyOps
                } else {
                    match op {
                        CommandOp::Select => self.sbo.select(
                            self.handler.as_mut(),
                            command,
                            index,
                            seq,
                            header.qualifier,
                            now,
                        ),
                        CommandOp::Operate => self.sbo.operate(
                            self.handler.as_mut(),
                            command,
                            index,
                            seq,
                            header.qualifier,
                            now,
                        ),
                        CommandOp::DirectOperate | CommandOp::DirectOperateNoResp => {
                            self.handler.direct_operate(&command, index)
                        }
                    }
                };
                controls_seen += 1;

                match header.qualifier {
                    QualifierCode::Uint8CountUint8Index => builder.raw().put_u8(index as u8),
                    QualifierCode::Uint16CountUint16Index => builder.raw().put_u16_le(index),
                    _ => {}
                }
                command.encode(status, builder.raw());
            }
        }

        if matches!(op, CommandOp::DirectOperateNoResp) {
            return None;
        }
        builder.set_iin(self.dynamic_iin() | rsp_iin);
        Some(builder.freeze())
    }

    // ─── DELAY_MEASURE and unsolicited config ───────────────────────────

    fn handle_delay_measure(&mut self, apdu: &Apdu) -> Option<Bytes> {
        let mut rsp_iin = IinField::empty();
        if !apdu.objects.is_empty() {
            rsp_iin |= IinField::FUNC_NOT_SUPPORTED;
        }
        let mut builder = ApduBuilder::response(
            FunctionCode::Response,
            AppControl::single(apdu.control.seq),
            self.app.max_fragment_size,
        );
        builder.write_header(&ObjectHeader {
            group: 52,
            variation: 2,
            qualifier: QualifierCode::Uint8Count,
            range: Range::Count(1),
        });
        // Turnaround time: this stack answers within the same executor tick.
        builder.raw().put_u16_le(0);
        builder.set_iin(self.dynamic_iin() | rsp_iin);
        Some(builder.freeze())
    }

    fn handle_unsol_config(&mut self, enable: bool, apdu: &Apdu) -> Option<Bytes> {
        let mut objects = apdu.objects.clone();
        let mut rsp_iin = IinField::empty();

        if self.config.disable_unsol {
            rsp_iin |= IinField::FUNC_NOT_SUPPORTED;
        } else {
            while objects.has_remaining() {
                let header = match ObjectHeader::decode(&mut objects) {
                    Ok(h) => h,
                    Err(_) => {
                        rsp_iin |= IinField::PARAMETER_ERROR;
                        break;
                    }
                };
                match (header.group, header.variation) {
                    (60, 2) => self.unsol_mask.set(EventClass::Class1, enable),
                    (60, 3) => self.unsol_mask.set(EventClass::Class2, enable),
                    (60, 4) => self.unsol_mask.set(EventClass::Class3, enable),
                    (group, variation) => {
                        tracing::warn!(group, variation, "cannot change unsol for object");
                        rsp_iin |= IinField::FUNC_NOT_SUPPORTED;
                    }
                }
            }
            if enable {
                // A deferred scan picks up any events already queued.
                self.deferred_unsol = true;
            }
        }

        Some(self.null_response(apdu.control.seq, rsp_iin))
    }

    // ─── Response emission ──────────────────────────────────────────────

    fn null_response(&self, seq: u8, rsp_iin: IinField) -> Bytes {
        let mut builder = ApduBuilder::response(
            FunctionCode::Response,
            AppControl::single(seq),
            self.app.max_fragment_size,
        );
        builder.set_iin(self.dynamic_iin() | rsp_iin);
        builder.freeze()
    }

    fn send_solicited(&mut self, fragment: Bytes) {
        self.state = EngineState::SolPending;
        self.stats.responses += 1;
        self.actions.push(OutstationAction::SendSolicited(fragment));
    }

    fn send_null_unsolicited(&mut self) {
        let control = AppControl {
            fir: true,
            fin: true,
            con: true,
            uns: true,
            seq: self.unsol_seq,
        };
        let mut builder = ApduBuilder::response(
            FunctionCode::UnsolicitedResponse,
            control,
            self.app.max_fragment_size,
        );
        builder.set_iin(self.dynamic_iin());
        self.unsol_had_events = false;
        self.state = EngineState::UnsolPending;
        self.stats.unsolicited += 1;
        self.actions
            .push(OutstationAction::SendUnsolicited(builder.freeze()));
    }

    fn send_event_unsolicited(&mut self) {
        let control = AppControl {
            fir: true,
            fin: true,
            con: true,
            uns: true,
            seq: self.unsol_seq,
        };
        let mut builder = ApduBuilder::response(
            FunctionCode::UnsolicitedResponse,
            control,
            self.app.max_fragment_size,
        );

        let mut budget = builder.remaining();
        let selected_count = self.events.select_where(self.unsol_mask, |record, _| {
            let gv = GroupVar::event_for(record.measurement.kind())
                .expect("only event-capable kinds are buffered");
            let cost = 7 + 2 + gv.object_size();
            if budget >= cost {
                budget -= cost;
                true
            } else {
                false
            }
        });
        if selected_count == 0 {
            return;
        }

        let selected: Vec<(GroupVar, u16, Measurement)> = self
            .events
            .selected()
            .map(|r| {
                let gv = GroupVar::event_for(r.measurement.kind()).unwrap();
                (gv, r.index, r.measurement)
            })
            .collect();
        let mut i = 0;
        while i < selected.len() {
            let gv = selected[i].0;
            let run_end = selected[i..]
                .iter()
                .position(|(g, _, _)| *g != gv)
                .map(|n| i + n)
                .unwrap_or(selected.len());
            let (group, variation) = gv.pair();
            builder.write_header(&ObjectHeader {
                group,
                variation,
                qualifier: QualifierCode::Uint16CountUint16Index,
                range: Range::Count((run_end - i) as u16),
            });
            for (_, index, measurement) in &selected[i..run_end] {
                builder.raw().put_u16_le(*index);
                encode_object(gv, measurement, builder.raw());
            }
            i = run_end;
        }

        builder.set_iin(self.dynamic_iin());
        self.unsol_had_events = true;
        self.state = EngineState::UnsolPending;
        self.stats.unsolicited += 1;
        self.actions
            .push(OutstationAction::SendUnsolicited(builder.freeze()));
    }
}
