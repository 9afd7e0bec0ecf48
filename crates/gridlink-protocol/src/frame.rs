//! # Link Frame Codec
//!
//! DNP3 link-layer framing: a fixed 10-byte header followed by the user data
//! split into 16-byte blocks, each block trailed by a CRC-16.
//!
//! ```text
//!  0        1        2        3        4..5     6..7     8..9
//! +--------+--------+--------+--------+--------+--------+--------+
//! |  0x05  |  0x64  | LENGTH |  CTRL  | DST LE | SRC LE | CRC LE |
//! +--------+--------+--------+--------+--------+--------+--------+
//! | 16 user bytes | CRC LE | 16 user bytes | CRC LE | ... (≤250 user bytes)
//! +---------------+--------+---------------+--------+
//! ```
//!
//! CTRL bits (MSB→LSB): DIR, PRM, FCB, FCV/DFC, function (4 bits).
//! LENGTH counts the control/address octets plus user data: `user_len + 5`.
//! The header CRC covers the first 8 octets, start bytes included.
//!
//! The CRC is the DNP variant of CRC-16: polynomial 0x3D65, reflected,
//! initial 0x0000, final XOR 0xFFFF.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_DNP};

use crate::error::FramingError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Frame start octets.
pub const START_BYTES: [u8; 2] = [0x05, 0x64];

/// Fixed header size, CRC included.
pub const HEADER_SIZE: usize = 10;

/// User bytes per CRC-protected data block.
pub const DATA_BLOCK_SIZE: usize = 16;

/// Maximum user payload of a single frame.
pub const MAX_USER_DATA: usize = 250;

/// Minimum value of the length octet (control + two address fields).
pub const MIN_LENGTH: u8 = 5;

const DNP_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_DNP);

// ─── CRC ─────────────────────────────────────────────────────────────────────

/// Compute the DNP CRC-16 over a byte slice.
#[inline]
pub fn calc_crc(bytes: &[u8]) -> u16 {
    DNP_CRC.checksum(bytes)
}

/// Check a slice against an expected CRC value.
#[inline]
pub fn verify(bytes: &[u8], expected: u16) -> bool {
    calc_crc(bytes) == expected
}

/// Total frame size on the wire for a given user-data length.
pub fn frame_size(user_len: usize) -> usize {
    debug_assert!(user_len <= MAX_USER_DATA);
    let mut size = HEADER_SIZE;
    if user_len > 0 {
        size += user_len + 2 * user_len.div_ceil(DATA_BLOCK_SIZE);
    }
    size
}

// ─── Link Function ───────────────────────────────────────────────────────────

/// Link-layer function codes. The discriminant folds in the PRM bit
/// (0x40 set = primary-to-secondary) so one enum covers both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkFunction {
    // Primary to secondary
    ResetLinkStates = 0x40,
    TestLink = 0x42,
    ConfirmedUserData = 0x43,
    UnconfirmedUserData = 0x44,
    RequestLinkStatus = 0x49,
    // Secondary to primary
    Ack = 0x00,
    Nack = 0x01,
    LinkStatus = 0x0B,
    NotSupported = 0x0F,
}

impl LinkFunction {
    /// Decode from the PRM bit plus function nibble of a control octet.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x40 => Some(LinkFunction::ResetLinkStates),
            0x42 => Some(LinkFunction::TestLink),
            0x43 => Some(LinkFunction::ConfirmedUserData),
            0x44 => Some(LinkFunction::UnconfirmedUserData),
            0x49 => Some(LinkFunction::RequestLinkStatus),
            0x00 => Some(LinkFunction::Ack),
            0x01 => Some(LinkFunction::Nack),
            0x0B => Some(LinkFunction::LinkStatus),
            0x0F => Some(LinkFunction::NotSupported),
            _ => None,
        }
    }

    /// Whether this is a primary-to-secondary function (PRM set).
    #[inline]
    pub fn is_primary(self) -> bool {
        (self as u8) & 0x40 != 0
    }
}

// ─── Control Field ───────────────────────────────────────────────────────────

/// Decoded link control octet.
///
/// `func` holds the raw low nibble so frames with unknown function codes can
/// still be parsed and answered with NOT_SUPPORTED; [`ControlField::function`]
/// resolves the (PRM, nibble) pair to a known [`LinkFunction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField {
    /// Physical direction: set on frames sent by the master station.
    pub dir: bool,
    /// Primary message bit.
    pub prm: bool,
    /// Frame count bit.
    pub fcb: bool,
    /// FCV on primary frames, DFC on secondary frames.
    pub fcv: bool,
    /// Raw function nibble.
    pub func: u8,
}

impl ControlField {
    /// Build a control field from a known function; PRM comes from the
    /// function's direction.
    pub fn new(dir: bool, fcb: bool, fcv: bool, function: LinkFunction) -> Self {
        ControlField {
            dir,
            prm: function.is_primary(),
            fcb,
            fcv,
            func: (function as u8) & 0x0F,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = self.func & 0x0F;
        if self.dir {
            b |= 0x80;
        }
        if self.prm {
            b |= 0x40;
        }
        if self.fcb {
            b |= 0x20;
        }
        if self.fcv {
            b |= 0x10;
        }
        b
    }

    pub fn from_byte(b: u8) -> Self {
        ControlField {
            dir: b & 0x80 != 0,
            prm: b & 0x40 != 0,
            fcb: b & 0x20 != 0,
            fcv: b & 0x10 != 0,
            func: b & 0x0F,
        }
    }

    /// Resolve the function code, if known.
    pub fn function(&self) -> Option<LinkFunction> {
        let prm_bit = if self.prm { 0x40 } else { 0x00 };
        LinkFunction::from_byte(prm_bit | self.func)
    }
}

// ─── Link Header ─────────────────────────────────────────────────────────────

/// Decoded 10-byte link header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHeader {
    /// Length octet: user data length + 5.
    pub length: u8,
    pub control: ControlField,
    pub destination: u16,
    pub source: u16,
}

impl LinkHeader {
    pub fn new(control: ControlField, destination: u16, source: u16, user_len: usize) -> Self {
        debug_assert!(user_len <= MAX_USER_DATA);
        LinkHeader {
            length: user_len as u8 + MIN_LENGTH,
            control,
            destination,
            source,
        }
    }

    /// User-data length described by the length octet.
    #[inline]
    pub fn user_len(&self) -> usize {
        (self.length - MIN_LENGTH) as usize
    }

    /// Encode the header, header CRC included.
    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_slice(&START_BYTES);
        buf.put_u8(self.length);
        buf.put_u8(self.control.to_byte());
        buf.put_u16_le(self.destination);
        buf.put_u16_le(self.source);
        let crc = calc_crc(&buf[start..start + 8]);
        buf.put_u16_le(crc);
    }

    /// Decode and validate a header from the first 10 bytes of a buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FramingError::ShortBuffer);
        }
        if bytes[0..2] != START_BYTES {
            return Err(FramingError::BadStart);
        }
        let length = bytes[2];
        if length < MIN_LENGTH {
            return Err(FramingError::BadLength(length));
        }
        let crc = u16::from_le_bytes([bytes[8], bytes[9]]);
        if !verify(&bytes[0..8], crc) {
            return Err(FramingError::BadHeaderCrc);
        }
        Ok(LinkHeader {
            length,
            control: ControlField::from_byte(bytes[3]),
            destination: u16::from_le_bytes([bytes[4], bytes[5]]),
            source: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }
}

// ─── Frame Emit / Parse ──────────────────────────────────────────────────────

/// Serialize a complete link frame: header, then each 16-byte user-data block
/// followed by its CRC.
pub fn write_frame(
    control: ControlField,
    destination: u16,
    source: u16,
    payload: &[u8],
) -> BytesMut {
    debug_assert!(payload.len() <= MAX_USER_DATA);
    let mut buf = BytesMut::with_capacity(frame_size(payload.len()));
    LinkHeader::new(control, destination, source, payload.len()).encode(&mut buf);
    for block in payload.chunks(DATA_BLOCK_SIZE) {
        buf.put_slice(block);
        buf.put_u16_le(calc_crc(block));
    }
    buf
}

/// Parse and validate a complete link frame, returning the header and the
/// user data with block CRCs stripped.
pub fn parse_frame(bytes: &[u8]) -> Result<(LinkHeader, Bytes), FramingError> {
    let header = LinkHeader::decode(bytes)?;
    let user_len = header.user_len();
    if bytes.len() < frame_size(user_len) {
        return Err(FramingError::ShortBuffer);
    }

    let mut payload = BytesMut::with_capacity(user_len);
    let mut body = &bytes[HEADER_SIZE..];
    let mut remaining = user_len;
    while remaining > 0 {
        let n = remaining.min(DATA_BLOCK_SIZE);
        let block = &body[..n];
        let crc = u16::from_le_bytes([body[n], body[n + 1]]);
        if !verify(block, crc) {
            return Err(FramingError::BadBodyCrc);
        }
        payload.put_slice(block);
        body = &body[n + 2..];
        remaining -= n;
    }

    Ok((header, payload.freeze()))
}
