//! # gridlink-protocol
//!
//! Gridlink DNP3 (IEEE 1815) protocol core.
//!
//! Pure-logic implementation of the three-layer DNP3 pipeline — no sockets,
//! no timers, no threads. Byte transports feed frames in, drain frames out,
//! and deliver timer expirations as events; everything in between is
//! deterministic state-machine code driven from a single-threaded executor.
//!
//! ## Crate structure
//!
//! - [`frame`] — DNP CRC-16, 10-byte link header, block-CRC framing codec
//! - [`link`] — Link-layer state machine (FCB/FCV, confirmed data, retries)
//! - [`transport`] — Transport function (FIR/FIN/SEQ segmentation/reassembly)
//! - [`apdu`] — Application control, function codes, IIN, object headers
//! - [`objects`] — Per-(group, variation) object codecs
//! - [`measurement`] — Typed measurement values, quality flags, 48-bit time
//! - [`command`] — Control commands (CROB, analog outputs), command status
//! - [`channel`] — Application channel state machine (request/confirm/response)
//! - [`monitor`] — Physical channel monitor lifecycle state machine
//! - [`config`] — Stack configuration
//! - [`error`] — Error taxonomy

pub mod apdu;
pub mod channel;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod link;
pub mod measurement;
pub mod monitor;
pub mod objects;
pub mod transport;
