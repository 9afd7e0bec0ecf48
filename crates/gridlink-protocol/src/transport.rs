//! # Transport Function
//!
//! Segmentation and reassembly of application fragments across link frames.
//!
//! Every transport segment carries a single header octet:
//!
//! ```text
//! +-----+-----+-----------------+
//! | FIR | FIN |   SEQ (6 bits)  |
//! +-----+-----+-----------------+
//! ```
//!
//! A complete APDU is the concatenation of payloads from a FIR-marked segment
//! through a FIN-marked segment with consecutive sequences mod 64. The
//! receiver is strict: any gap, overlong reassembly, or headerless start
//! drops the partial fragment and resets.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::error::TransportError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum payload bytes in one transport segment (250 link bytes - 1 header).
pub const MAX_TPDU_PAYLOAD: usize = 249;

/// Transport sequence modulus.
pub const SEQ_MODULUS: u8 = 64;

const FIR_MASK: u8 = 0x40;
const FIN_MASK: u8 = 0x80;
const SEQ_MASK: u8 = 0x3F;

// ─── Transport Header ────────────────────────────────────────────────────────

/// Decoded transport header octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub fir: bool,
    pub fin: bool,
    pub seq: u8,
}

impl TransportHeader {
    pub fn new(fir: bool, fin: bool, seq: u8) -> Self {
        TransportHeader {
            fir,
            fin,
            seq: seq % SEQ_MODULUS,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = self.seq & SEQ_MASK;
        if self.fir {
            b |= FIR_MASK;
        }
        if self.fin {
            b |= FIN_MASK;
        }
        b
    }

    pub fn from_byte(b: u8) -> Self {
        TransportHeader {
            fir: b & FIR_MASK != 0,
            fin: b & FIN_MASK != 0,
            seq: b & SEQ_MASK,
        }
    }
}

// ─── Segmenter ───────────────────────────────────────────────────────────────

/// Splits outgoing APDUs into transport segments. The sequence counter runs
/// continuously across APDUs.
#[derive(Debug, Default)]
pub struct Segmenter {
    next_seq: u8,
}

impl Segmenter {
    pub fn new() -> Self {
        Segmenter::default()
    }

    /// Segment an APDU into `ceil(len / 249)` TPDUs with FIR on the first,
    /// FIN on the last, and consecutive sequences.
    pub fn segment(&mut self, apdu: &[u8]) -> Vec<Bytes> {
        if apdu.is_empty() {
            return Vec::new();
        }

        let count = apdu.len().div_ceil(MAX_TPDU_PAYLOAD);
        let mut segments = Vec::with_capacity(count);
        for (i, chunk) in apdu.chunks(MAX_TPDU_PAYLOAD).enumerate() {
            let header = TransportHeader::new(i == 0, i == count - 1, self.next_seq);
            self.next_seq = (self.next_seq + 1) % SEQ_MODULUS;

            let mut buf = BytesMut::with_capacity(1 + chunk.len());
            buf.put_u8(header.to_byte());
            buf.put_slice(chunk);
            segments.push(buf.freeze());
        }
        segments
    }

    /// Sequence the next segment will carry.
    pub fn next_seq(&self) -> u8 {
        self.next_seq
    }
}

// ─── Reassembler ─────────────────────────────────────────────────────────────

/// Transport receive counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransportStats {
    /// Segments accepted into a reassembly.
    pub segments_accepted: u64,
    /// Segments dropped (gap, headerless start, oversize, empty).
    pub segments_dropped: u64,
    /// Complete APDUs delivered upward.
    pub fragments_delivered: u64,
}

/// Reassembles incoming transport segments into complete APDUs.
#[derive(Debug)]
pub struct Reassembler {
    max_fragment_size: usize,
    buffer: BytesMut,
    expected_seq: u8,
    in_frame: bool,
    stats: TransportStats,
}

impl Reassembler {
    pub fn new(max_fragment_size: usize) -> Self {
        Reassembler {
            max_fragment_size,
            buffer: BytesMut::new(),
            expected_seq: 0,
            in_frame: false,
            stats: TransportStats::default(),
        }
    }

    /// Process one received segment (header octet + payload). Returns a
    /// complete APDU when this segment carries FIN and the run was intact.
    ///
    /// All violations reset the reassembler and are absorbed here: the error
    /// is logged and counted, never propagated.
    pub fn receive(&mut self, tpdu: &[u8]) -> Option<Bytes> {
        match self.try_receive(tpdu) {
            Ok(complete) => complete,
            Err(err) => {
                tracing::warn!(error = %err, "transport segment dropped");
                self.stats.segments_dropped += 1;
                self.reset();
                None
            }
        }
    }

    fn try_receive(&mut self, tpdu: &[u8]) -> Result<Option<Bytes>, TransportError> {
        let Some((&header_byte, payload)) = tpdu.split_first() else {
            return Err(TransportError::EmptySegment);
        };
        let header = TransportHeader::from_byte(header_byte);

        if header.fir {
            self.buffer.clear();
            self.expected_seq = header.seq;
            self.in_frame = true;
        } else if !self.in_frame {
            return Err(TransportError::NoFrameInProgress);
        }

        if header.seq != self.expected_seq {
            return Err(TransportError::SequenceGap {
                expected: self.expected_seq,
                got: header.seq,
            });
        }

        if self.buffer.len() + payload.len() > self.max_fragment_size {
            return Err(TransportError::OversizeReassembly {
                max: self.max_fragment_size,
            });
        }

        self.buffer.put_slice(payload);
        self.stats.segments_accepted += 1;

        if header.fin {
            let apdu = self.buffer.split().freeze();
            self.reset();
            self.stats.fragments_delivered += 1;
            Ok(Some(apdu))
        } else {
            self.expected_seq = (self.expected_seq + 1) % SEQ_MODULUS;
            Ok(None)
        }
    }

    /// Drop any partial reassembly. Called on link-down.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }
}
