//! # Error Taxonomy
//!
//! One error enum per layer. Framing errors are absorbed at the link layer
//! (drop the frame, count it, keep reading). Link retry exhaustion surfaces
//! to the application channel as a send failure. Transport sequence errors
//! reset the reassembler silently. Application-layer protocol errors surface
//! to the user exactly once per initiated operation. Nothing in this crate
//! panics on wire input.

use thiserror::Error;

/// Frame-level parse failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    /// The buffer does not begin with the 0x05 0x64 start octets.
    #[error("frame does not start with 0x05 0x64")]
    BadStart,
    /// The length octet is outside the legal range [5, 255].
    #[error("length octet {0} outside [5, 255]")]
    BadLength(u8),
    /// The header CRC does not match the first 8 octets.
    #[error("header CRC mismatch")]
    BadHeaderCrc,
    /// A user-data block CRC does not match its block.
    #[error("body block CRC mismatch")]
    BadBodyCrc,
    /// The buffer is shorter than the frame the header describes.
    #[error("buffer too short for a complete frame")]
    ShortBuffer,
}

/// Link-layer transaction failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The ACK retry budget was exhausted without a confirmation.
    #[error("link retry budget exhausted")]
    RetryExhausted,
    /// The remote replied with a function we did not expect in this state.
    #[error("unexpected link function {0:#04x}")]
    UnexpectedFunction(u8),
    /// The remote rejected the transaction with NACK or NOT_SUPPORTED.
    #[error("link transaction rejected by remote")]
    Rejected,
    /// A transmit was requested while a confirmed transaction is in flight.
    #[error("link transmit already in progress")]
    Busy,
}

/// Transport-function reassembly failures. These never propagate past the
/// transport layer — the receiver resets and the error is logged and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A segment arrived with a sequence other than the expected one.
    #[error("transport sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u8, got: u8 },
    /// A non-FIR segment arrived with no reassembly in progress.
    #[error("non-FIR segment with no reassembly in progress")]
    NoFrameInProgress,
    /// Reassembly exceeded the maximum application fragment size.
    #[error("reassembled fragment exceeds {max} bytes")]
    OversizeReassembly { max: usize },
    /// The segment carried no payload after the transport octet.
    #[error("empty transport segment")]
    EmptySegment,
}

/// Application-layer failures reported to the operation initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AppError {
    /// The fragment could not be parsed as an APDU.
    #[error("malformed application fragment")]
    BadFragment,
    /// A response failed validation (function, FIR/FIN shape, or content).
    #[error("bad response")]
    BadResponse,
    /// The response sequence did not match the request sequence.
    #[error("response sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u8, got: u8 },
    /// The confirm or response timer expired.
    #[error("application timeout")]
    Timeout,
    /// The operation was canceled by the user.
    #[error("operation canceled")]
    Canceled,
    /// The lower layers reported a send failure.
    #[error("send failure from lower layer")]
    SendFailed,
    /// The layer below is down.
    #[error("lower layer is down")]
    LayerDown,
    /// A second operation was initiated while one is outstanding.
    #[error("channel already has an outstanding operation")]
    Busy,
}

/// Command failures reported to the command initiator on the master side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The outstation does not support this command at this point.
    #[error("command not supported at target")]
    NotSupported,
    /// Operate was attempted without a matching prior select.
    #[error("no prior select for operate")]
    NoSelect,
    /// The select-to-operate window expired.
    #[error("select-to-operate window expired")]
    Timeout,
    /// The command object was malformed.
    #[error("command format error")]
    FormatError,
}

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A numeric knob is outside its allowed range.
    #[error("{field}: value {value} outside [{min}, {max}]")]
    InvalidRange {
        field: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },
}
