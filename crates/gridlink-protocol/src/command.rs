//! # Control Commands
//!
//! CROB and analog-output command objects, their wire codecs, and the
//! command-status vocabulary shared by SELECT / OPERATE / DIRECT_OPERATE.
//!
//! A single tagged [`Command`] union covers every command group, so the SBO
//! handler keys one map by `(CommandKind, index)` instead of one map per
//! command type.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::AppError;

// ─── Command Status ──────────────────────────────────────────────────────────

/// Status echoed in each command object of a control response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandStatus {
    Success = 0,
    Timeout = 1,
    NoSelect = 2,
    FormatError = 3,
    NotSupported = 4,
    AlreadyActive = 5,
    HardwareError = 6,
    Local = 7,
    TooManyOps = 8,
    NotAuthorized = 9,
}

impl CommandStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CommandStatus::Success),
            1 => Some(CommandStatus::Timeout),
            2 => Some(CommandStatus::NoSelect),
            3 => Some(CommandStatus::FormatError),
            4 => Some(CommandStatus::NotSupported),
            5 => Some(CommandStatus::AlreadyActive),
            6 => Some(CommandStatus::HardwareError),
            7 => Some(CommandStatus::Local),
            8 => Some(CommandStatus::TooManyOps),
            9 => Some(CommandStatus::NotAuthorized),
            _ => None,
        }
    }
}

// ─── CROB ────────────────────────────────────────────────────────────────────

/// Control Relay Output Block (group 12 variation 1), status octet excluded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crob {
    /// Control code octet (operation type, queue/clear, trip/close pair).
    pub code: u8,
    /// Number of times to execute the operation.
    pub count: u8,
    /// On-time in milliseconds.
    pub on_time_ms: u32,
    /// Off-time in milliseconds.
    pub off_time_ms: u32,
}

impl Crob {
    pub const LATCH_ON: u8 = 0x03;
    pub const LATCH_OFF: u8 = 0x04;
    pub const PULSE_ON: u8 = 0x01;

    pub fn new(code: u8) -> Self {
        Crob {
            code,
            count: 1,
            on_time_ms: 100,
            off_time_ms: 100,
        }
    }
}

// ─── Tagged Command Union ────────────────────────────────────────────────────

/// The command groups supported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Group 12 var 1.
    Crob,
    /// Group 41 var 1.
    AnalogInt32,
    /// Group 41 var 2.
    AnalogInt16,
    /// Group 41 var 3.
    AnalogFloat32,
    /// Group 41 var 4.
    AnalogDouble64,
}

impl CommandKind {
    pub fn from_group_var(group: u8, variation: u8) -> Option<Self> {
        match (group, variation) {
            (12, 1) => Some(CommandKind::Crob),
            (41, 1) => Some(CommandKind::AnalogInt32),
            (41, 2) => Some(CommandKind::AnalogInt16),
            (41, 3) => Some(CommandKind::AnalogFloat32),
            (41, 4) => Some(CommandKind::AnalogDouble64),
            _ => None,
        }
    }

    pub fn group_var(self) -> (u8, u8) {
        match self {
            CommandKind::Crob => (12, 1),
            CommandKind::AnalogInt32 => (41, 1),
            CommandKind::AnalogInt16 => (41, 2),
            CommandKind::AnalogFloat32 => (41, 3),
            CommandKind::AnalogDouble64 => (41, 4),
        }
    }

    /// Encoded object size, status octet included.
    pub fn object_size(self) -> usize {
        match self {
            CommandKind::Crob => 11,
            CommandKind::AnalogInt32 => 5,
            CommandKind::AnalogInt16 => 3,
            CommandKind::AnalogFloat32 => 5,
            CommandKind::AnalogDouble64 => 9,
        }
    }
}

/// A decoded command payload. Equality over payloads is what the SBO handler
/// uses to match an OPERATE against its prior SELECT.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Crob(Crob),
    AnalogInt32(i32),
    AnalogInt16(i16),
    AnalogFloat32(f32),
    AnalogDouble64(f64),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Crob(_) => CommandKind::Crob,
            Command::AnalogInt32(_) => CommandKind::AnalogInt32,
            Command::AnalogInt16(_) => CommandKind::AnalogInt16,
            Command::AnalogFloat32(_) => CommandKind::AnalogFloat32,
            Command::AnalogDouble64(_) => CommandKind::AnalogDouble64,
        }
    }

    /// Encode the command object with its trailing status octet.
    pub fn encode(&self, status: CommandStatus, buf: &mut BytesMut) {
        match *self {
            Command::Crob(crob) => {
                buf.put_u8(crob.code);
                buf.put_u8(crob.count);
                buf.put_u32_le(crob.on_time_ms);
                buf.put_u32_le(crob.off_time_ms);
            }
            Command::AnalogInt32(v) => buf.put_i32_le(v),
            Command::AnalogInt16(v) => buf.put_i16_le(v),
            Command::AnalogFloat32(v) => buf.put_f32_le(v),
            Command::AnalogDouble64(v) => buf.put_f64_le(v),
        }
        buf.put_u8(status as u8);
    }

    /// Decode a command object of the given kind, returning the payload and
    /// its status octet.
    pub fn decode(kind: CommandKind, buf: &mut impl Buf) -> Result<(Self, CommandStatus), AppError> {
        if buf.remaining() < kind.object_size() {
            return Err(AppError::BadFragment);
        }
        let command = match kind {
            CommandKind::Crob => Command::Crob(Crob {
                code: buf.get_u8(),
                count: buf.get_u8(),
                on_time_ms: buf.get_u32_le(),
                off_time_ms: buf.get_u32_le(),
            }),
            CommandKind::AnalogInt32 => Command::AnalogInt32(buf.get_i32_le()),
            CommandKind::AnalogInt16 => Command::AnalogInt16(buf.get_i16_le()),
            CommandKind::AnalogFloat32 => Command::AnalogFloat32(buf.get_f32_le()),
            CommandKind::AnalogDouble64 => Command::AnalogDouble64(buf.get_f64_le()),
        };
        let status = CommandStatus::from_byte(buf.get_u8()).ok_or(AppError::BadFragment)?;
        Ok((command, status))
    }
}

/// Receiver of control commands on the outstation side. Implemented by the
/// application that owns the physical outputs.
pub trait CommandHandler {
    fn select(&mut self, command: &Command, index: u16) -> CommandStatus;
    fn operate(&mut self, command: &Command, index: u16) -> CommandStatus;
    fn direct_operate(&mut self, command: &Command, index: u16) -> CommandStatus;
}
