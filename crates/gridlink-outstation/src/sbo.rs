//! # Select-Before-Operate
//!
//! The two-step control safeguard: a SELECT arms a point, a matching OPERATE
//! within the arming window fires it. One map keyed by (command kind, point
//! index) holds every armed selection regardless of command type.

use std::collections::HashMap;
use std::time::Duration;

use quanta::Instant;

use gridlink_protocol::apdu::{next_seq, QualifierCode};
use gridlink_protocol::command::{Command, CommandHandler, CommandKind, CommandStatus};

/// One armed selection.
#[derive(Debug, Clone, Copy)]
struct SelectEntry {
    command: Command,
    sequence: u8,
    qualifier: QualifierCode,
    selected_at: Instant,
    operated: bool,
}

/// The SBO state machine.
pub struct SboHandler {
    select_timeout: Duration,
    /// Application sequence of the most recent SELECT request.
    current_seq: u8,
    selections: HashMap<(CommandKind, u16), SelectEntry>,
}

impl SboHandler {
    pub fn new(select_timeout: Duration) -> Self {
        SboHandler {
            select_timeout,
            current_seq: 0,
            selections: HashMap::new(),
        }
    }

    /// Arm a point. A sequence change relative to the previous SELECT clears
    /// every armed entry first. The entry is stored only when the command
    /// handler accepts the selection.
    pub fn select(
        &mut self,
        handler: &mut dyn CommandHandler,
        command: Command,
        index: u16,
        sequence: u8,
        qualifier: QualifierCode,
        now: Instant,
    ) -> CommandStatus {
        if sequence != self.current_seq {
            self.selections.clear();
        }
        self.current_seq = sequence;

        let status = handler.select(&command, index);
        if status == CommandStatus::Success {
            self.selections.insert(
                (command.kind(), index),
                SelectEntry {
                    command,
                    sequence,
                    qualifier,
                    selected_at: now,
                    operated: false,
                },
            );
        }
        status
    }

    /// Fire a previously armed point. The OPERATE must arrive with the next
    /// application sequence, the same qualifier, and an identical command
    /// payload, inside the arming window. A repeated identical OPERATE
    /// returns the stored success without re-invoking the handler.
    pub fn operate(
        &mut self,
        handler: &mut dyn CommandHandler,
        command: Command,
        index: u16,
        sequence: u8,
        qualifier: QualifierCode,
        now: Instant,
    ) -> CommandStatus {
        let key = (command.kind(), index);
        let Some(entry) = self.selections.get_mut(&key) else {
            self.selections.clear();
            return CommandStatus::NoSelect;
        };

        let seq_ok = next_seq(entry.sequence) == sequence;
        if !seq_ok || qualifier != entry.qualifier || command != entry.command {
            tracing::warn!(index, "operate does not match armed select");
            self.selections.clear();
            return CommandStatus::NoSelect;
        }

        if now.duration_since(entry.selected_at) >= self.select_timeout {
            return CommandStatus::Timeout;
        }

        if entry.operated {
            return CommandStatus::Success;
        }
        entry.operated = true;
        handler.operate(&command, index)
    }

    /// Number of armed selections.
    pub fn armed(&self) -> usize {
        self.selections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridlink_protocol::command::Crob;

    /// Counts invocations and answers with a fixed status.
    struct CountingHandler {
        selects: usize,
        operates: usize,
        status: CommandStatus,
    }

    impl CountingHandler {
        fn new() -> Self {
            CountingHandler {
                selects: 0,
                operates: 0,
                status: CommandStatus::Success,
            }
        }
    }

    impl CommandHandler for CountingHandler {
        fn select(&mut self, _command: &Command, _index: u16) -> CommandStatus {
            self.selects += 1;
            self.status
        }

        fn operate(&mut self, _command: &Command, _index: u16) -> CommandStatus {
            self.operates += 1;
            self.status
        }

        fn direct_operate(&mut self, _command: &Command, _index: u16) -> CommandStatus {
            self.status
        }
    }

    fn crob() -> Command {
        Command::Crob(Crob::new(Crob::LATCH_ON))
    }

    const QUAL: QualifierCode = QualifierCode::Uint16CountUint16Index;

    #[test]
    fn select_then_operate_within_window() {
        let mut sbo = SboHandler::new(Duration::from_secs(5));
        let mut handler = CountingHandler::new();
        let t0 = Instant::now();

        let status = sbo.select(&mut handler, crob(), 7, 3, QUAL, t0);
        assert_eq!(status, CommandStatus::Success);
        assert_eq!(sbo.armed(), 1);

        let t1 = t0 + Duration::from_secs(4);
        let status = sbo.operate(&mut handler, crob(), 7, 4, QUAL, t1);
        assert_eq!(status, CommandStatus::Success);
        assert_eq!(handler.operates, 1);
    }

    #[test]
    fn operate_after_window_times_out() {
        let mut sbo = SboHandler::new(Duration::from_secs(5));
        let mut handler = CountingHandler::new();
        let t0 = Instant::now();

        sbo.select(&mut handler, crob(), 7, 3, QUAL, t0);
        let late = t0 + Duration::from_secs(5) + Duration::from_millis(1);
        let status = sbo.operate(&mut handler, crob(), 7, 4, QUAL, late);
        assert_eq!(status, CommandStatus::Timeout);
        assert_eq!(handler.operates, 0);
    }

    #[test]
    fn repeated_operate_returns_stored_success_without_reinvoking() {
        let mut sbo = SboHandler::new(Duration::from_secs(5));
        let mut handler = CountingHandler::new();
        let t0 = Instant::now();

        sbo.select(&mut handler, crob(), 7, 3, QUAL, t0);
        let t1 = t0 + Duration::from_secs(1);
        assert_eq!(
            sbo.operate(&mut handler, crob(), 7, 4, QUAL, t1),
            CommandStatus::Success
        );
        let t2 = t1 + Duration::from_millis(50);
        assert_eq!(
            sbo.operate(&mut handler, crob(), 7, 4, QUAL, t2),
            CommandStatus::Success
        );
        assert_eq!(handler.operates, 1, "handler must fire exactly once");
    }

    #[test]
    fn operate_without_select_is_rejected() {
        let mut sbo = SboHandler::new(Duration::from_secs(5));
        let mut handler = CountingHandler::new();
        assert_eq!(
            sbo.operate(&mut handler, crob(), 7, 4, QUAL, Instant::now()),
            CommandStatus::NoSelect
        );
    }

    #[test]
    fn wrong_sequence_clears_all_selections() {
        let mut sbo = SboHandler::new(Duration::from_secs(5));
        let mut handler = CountingHandler::new();
        let t0 = Instant::now();

        sbo.select(&mut handler, crob(), 7, 3, QUAL, t0);
        // seq 6 != 3 + 1
        assert_eq!(
            sbo.operate(&mut handler, crob(), 7, 6, QUAL, t0),
            CommandStatus::NoSelect
        );
        assert_eq!(sbo.armed(), 0);
    }

    #[test]
    fn different_payload_is_rejected() {
        let mut sbo = SboHandler::new(Duration::from_secs(5));
        let mut handler = CountingHandler::new();
        let t0 = Instant::now();

        sbo.select(&mut handler, crob(), 7, 3, QUAL, t0);
        let other = Command::Crob(Crob::new(Crob::LATCH_OFF));
        assert_eq!(
            sbo.operate(&mut handler, other, 7, 4, QUAL, t0),
            CommandStatus::NoSelect
        );
    }

    #[test]
    fn sequence_change_on_select_rearms_clean() {
        let mut sbo = SboHandler::new(Duration::from_secs(5));
        let mut handler = CountingHandler::new();
        let t0 = Instant::now();

        sbo.select(&mut handler, crob(), 1, 3, QUAL, t0);
        sbo.select(&mut handler, crob(), 2, 9, QUAL, t0);
        // The first selection was cleared by the sequence change.
        assert_eq!(sbo.armed(), 1);
        assert_eq!(
            sbo.operate(&mut handler, crob(), 1, 10, QUAL, t0),
            CommandStatus::NoSelect
        );
    }

    #[test]
    fn failed_select_is_not_armed() {
        let mut sbo = SboHandler::new(Duration::from_secs(5));
        let mut handler = CountingHandler::new();
        handler.status = CommandStatus::NotSupported;
        assert_eq!(
            sbo.select(&mut handler, crob(), 7, 3, QUAL, Instant::now()),
            CommandStatus::NotSupported
        );
        assert_eq!(sbo.armed(), 0);
    }

    #[test]
    fn selections_keyed_by_kind_and_index() {
        let mut sbo = SboHandler::new(Duration::from_secs(5));
        let mut handler = CountingHandler::new();
        let t0 = Instant::now();

        sbo.select(&mut handler, crob(), 7, 3, QUAL, t0);
        sbo.select(&mut handler, Command::AnalogInt16(42), 7, 3, QUAL, t0);
        assert_eq!(sbo.armed(), 2);

        // Operating the analog entry leaves the CROB armed.
        assert_eq!(
            sbo.operate(&mut handler, Command::AnalogInt16(42), 7, 4, QUAL, t0),
            CommandStatus::Success
        );
        assert_eq!(sbo.armed(), 2);
    }
}
