//! # Application Fragment Codec
//!
//! APDU structure:
//!
//! ```text
//! +---------+----------+-----------------+------------------------+
//! | AC (1)  | FC (1)   | IIN (2, resp.)  | object headers + data  |
//! +---------+----------+-----------------+------------------------+
//! ```
//!
//! AC bits (MSB→LSB): FIR, FIN, CON, UNS, SEQ (4 bits). Responses and
//! unsolicited responses carry the two IIN octets; requests do not.
//!
//! Object header: `GROUP(1) | VARIATION(1) | QUALIFIER(1) | RANGE`, where the
//! range field shape depends on the qualifier code.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::AppError;

// ─── Application Control ─────────────────────────────────────────────────────

/// Decoded application control octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppControl {
    pub fir: bool,
    pub fin: bool,
    pub con: bool,
    pub uns: bool,
    pub seq: u8,
}

impl AppControl {
    /// A single-fragment control with the given sequence.
    pub fn single(seq: u8) -> Self {
        AppControl {
            fir: true,
            fin: true,
            con: false,
            uns: false,
            seq: seq & 0x0F,
        }
    }

    pub fn with_con(mut self) -> Self {
        self.con = true;
        self
    }

    pub fn with_uns(mut self) -> Self {
        self.uns = true;
        self
    }

    pub fn to_byte(self) -> u8 {
        let mut b = self.seq & 0x0F;
        if self.fir {
            b |= 0x80;
        }
        if self.fin {
            b |= 0x40;
        }
        if self.con {
            b |= 0x20;
        }
        if self.uns {
            b |= 0x10;
        }
        b
    }

    pub fn from_byte(b: u8) -> Self {
        AppControl {
            fir: b & 0x80 != 0,
            fin: b & 0x40 != 0,
            con: b & 0x20 != 0,
            uns: b & 0x10 != 0,
            seq: b & 0x0F,
        }
    }
}

/// Next application sequence, mod 16.
#[inline]
pub fn next_seq(seq: u8) -> u8 {
    (seq + 1) % 16
}

// ─── Function Codes ──────────────────────────────────────────────────────────

/// Application-layer function codes handled by this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    Confirm = 0x00,
    Read = 0x01,
    Write = 0x02,
    Select = 0x03,
    Operate = 0x04,
    DirectOperate = 0x05,
    DirectOperateNr = 0x06,
    EnableUnsolicited = 0x14,
    DisableUnsolicited = 0x15,
    DelayMeasure = 0x17,
    Response = 0x81,
    UnsolicitedResponse = 0x82,
}

impl FunctionCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(FunctionCode::Confirm),
            0x01 => Some(FunctionCode::Read),
            0x02 => Some(FunctionCode::Write),
            0x03 => Some(FunctionCode::Select),
            0x04 => Some(FunctionCode::Operate),
            0x05 => Some(FunctionCode::DirectOperate),
            0x06 => Some(FunctionCode::DirectOperateNr),
            0x14 => Some(FunctionCode::EnableUnsolicited),
            0x15 => Some(FunctionCode::DisableUnsolicited),
            0x17 => Some(FunctionCode::DelayMeasure),
            0x81 => Some(FunctionCode::Response),
            0x82 => Some(FunctionCode::UnsolicitedResponse),
            _ => None,
        }
    }

    /// Whether fragments with this code carry the IIN octets.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            FunctionCode::Response | FunctionCode::UnsolicitedResponse
        )
    }

    /// Whether a request with this code expects a solicited response.
    pub fn expects_response(self) -> bool {
        matches!(
            self,
            FunctionCode::Read
                | FunctionCode::Write
                | FunctionCode::Select
                | FunctionCode::Operate
                | FunctionCode::DirectOperate
                | FunctionCode::EnableUnsolicited
                | FunctionCode::DisableUnsolicited
                | FunctionCode::DelayMeasure
        )
    }
}

// ─── IIN ─────────────────────────────────────────────────────────────────────

bitflags! {
    /// Internal Indication bits. The low byte is IIN1 (first octet on the
    /// wire), the high byte IIN2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IinField: u16 {
        // IIN1
        const ALL_STATIONS = 0x0001;
        const CLASS1_EVENTS = 0x0002;
        const CLASS2_EVENTS = 0x0004;
        const CLASS3_EVENTS = 0x0008;
        const NEED_TIME = 0x0010;
        const LOCAL_CONTROL = 0x0020;
        const DEVICE_TROUBLE = 0x0040;
        const DEVICE_RESTART = 0x0080;
        // IIN2
        const FUNC_NOT_SUPPORTED = 0x0100;
        const OBJECT_UNKNOWN = 0x0200;
        const PARAMETER_ERROR = 0x0400;
        const EVENT_BUFFER_OVERFLOW = 0x0800;
        const ALREADY_EXECUTING = 0x1000;
        const CONFIG_CORRUPT = 0x2000;
    }
}

impl IinField {
    /// Encode as two octets, IIN1 first.
    pub fn encode(self, buf: &mut impl BufMut) {
        buf.put_u8(self.bits() as u8);
        buf.put_u8((self.bits() >> 8) as u8);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 2 {
            return None;
        }
        let iin1 = buf.get_u8() as u16;
        let iin2 = buf.get_u8() as u16;
        Some(IinField::from_bits_retain(iin1 | (iin2 << 8)))
    }
}

// ─── Qualifiers and Ranges ───────────────────────────────────────────────────

/// Object-header qualifier codes used by this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QualifierCode {
    Uint8StartStop = 0x00,
    Uint16StartStop = 0x01,
    AllObjects = 0x06,
    Uint8Count = 0x07,
    Uint16Count = 0x08,
    Uint8CountUint8Index = 0x17,
    Uint16CountUint16Index = 0x28,
}

impl QualifierCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(QualifierCode::Uint8StartStop),
            0x01 => Some(QualifierCode::Uint16StartStop),
            0x06 => Some(QualifierCode::AllObjects),
            0x07 => Some(QualifierCode::Uint8Count),
            0x08 => Some(QualifierCode::Uint16Count),
            0x17 => Some(QualifierCode::Uint8CountUint8Index),
            0x28 => Some(QualifierCode::Uint16CountUint16Index),
            _ => None,
        }
    }

    /// Whether each object is prefixed with its own index.
    pub fn is_indexed(self) -> bool {
        matches!(
            self,
            QualifierCode::Uint8CountUint8Index | QualifierCode::Uint16CountUint16Index
        )
    }
}

/// Decoded range field of an object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Range {
    /// All-objects qualifier: no range field.
    All,
    /// Object count without indexes.
    Count(u16),
    /// Inclusive start/stop index range.
    StartStop(u16, u16),
}

impl Range {
    /// Number of objects the range describes. `All` has no count of its own.
    pub fn count(&self) -> usize {
        match *self {
            Range::All => 0,
            Range::Count(n) => n as usize,
            Range::StartStop(start, stop) => {
                if stop >= start {
                    (stop - start) as usize + 1
                } else {
                    0
                }
            }
        }
    }

    pub fn start(&self) -> u16 {
        match *self {
            Range::StartStop(start, _) => start,
            _ => 0,
        }
    }
}

// ─── Object Header ───────────────────────────────────────────────────────────

/// One object header within an APDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub group: u8,
    pub variation: u8,
    pub qualifier: QualifierCode,
    pub range: Range,
}

impl ObjectHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.group);
        buf.put_u8(self.variation);
        buf.put_u8(self.qualifier as u8);
        match (self.qualifier, self.range) {
            (QualifierCode::AllObjects, Range::All) => {}
            (QualifierCode::Uint8Count | QualifierCode::Uint8CountUint8Index, Range::Count(n)) => {
                buf.put_u8(n as u8)
            }
            (
                QualifierCode::Uint16Count | QualifierCode::Uint16CountUint16Index,
                Range::Count(n),
            ) => buf.put_u16_le(n),
            (QualifierCode::Uint8StartStop, Range::StartStop(a, b)) => {
                buf.put_u8(a as u8);
                buf.put_u8(b as u8);
            }
            (QualifierCode::Uint16StartStop, Range::StartStop(a, b)) => {
                buf.put_u16_le(a);
                buf.put_u16_le(b);
            }
            _ => debug_assert!(false, "qualifier/range shape mismatch"),
        }
    }

    /// Decode one object header from the buffer.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, AppError> {
        if buf.remaining() < 3 {
            return Err(AppError::BadFragment);
        }
        let group = buf.get_u8();
        let variation = buf.get_u8();
        let qualifier = QualifierCode::from_byte(buf.get_u8()).ok_or(AppError::BadFragment)?;
        let range = match qualifier {
            QualifierCode::AllObjects => Range::All,
            QualifierCode::Uint8Count | QualifierCode::Uint8CountUint8Index => {
                if buf.remaining() < 1 {
                    return Err(AppError::BadFragment);
                }
                Range::Count(buf.get_u8() as u16)
            }
            QualifierCode::Uint16Count | QualifierCode::Uint16CountUint16Index => {
                if buf.remaining() < 2 {
                    return Err(AppError::BadFragment);
                }
                Range::Count(buf.get_u16_le())
            }
            QualifierCode::Uint8StartStop => {
                if buf.remaining() < 2 {
                    return Err(AppError::BadFragment);
                }
                Range::StartStop(buf.get_u8() as u16, buf.get_u8() as u16)
            }
            QualifierCode::Uint16StartStop => {
                if buf.remaining() < 4 {
                    return Err(AppError::BadFragment);
                }
                Range::StartStop(buf.get_u16_le(), buf.get_u16_le())
            }
        };
        Ok(ObjectHeader {
            group,
            variation,
            qualifier,
            range,
        })
    }

    /// Read the index of the next object under this header, given the
    /// position of the object within the run.
    pub fn object_index(&self, buf: &mut impl Buf, position: usize) -> Result<u16, AppError> {
        match self.qualifier {
            QualifierCode::Uint8CountUint8Index => {
                if buf.remaining() < 1 {
                    return Err(AppError::BadFragment);
                }
                Ok(buf.get_u8() as u16)
            }
            QualifierCode::Uint16CountUint16Index => {
                if buf.remaining() < 2 {
                    return Err(AppError::BadFragment);
                }
                Ok(buf.get_u16_le())
            }
            _ => Ok(self.range.start() + position as u16),
        }
    }
}

// ─── APDU ────────────────────────────────────────────────────────────────────

/// A parsed application fragment. `objects` is the raw header+object region;
/// the outstation dispatcher and the master loader walk it with
/// [`ObjectHeader::decode`] and the codecs in [`crate::objects`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub control: AppControl,
    pub function: FunctionCode,
    pub iin: Option<IinField>,
    pub objects: Bytes,
}

impl Apdu {
    pub fn parse(mut bytes: Bytes) -> Result<Self, AppError> {
        if bytes.remaining() < 2 {
            return Err(AppError::BadFragment);
        }
        let control = AppControl::from_byte(bytes.get_u8());
        let function = FunctionCode::from_byte(bytes.get_u8()).ok_or(AppError::BadFragment)?;
        let iin = if function.is_response() {
            Some(IinField::decode(&mut bytes).ok_or(AppError::BadFragment)?)
        } else {
            None
        };
        Ok(Apdu {
            control,
            function,
            iin,
            objects: bytes,
        })
    }
}

// ─── APDU Builder ────────────────────────────────────────────────────────────

/// Incremental APDU writer with a fragment-size cap. The control and IIN
/// octets sit at fixed offsets and can be rewritten after object data has
/// been appended, which is how the response builder stamps FIN/CON and the
/// final IIN once it knows whether the fragment overflowed.
#[derive(Debug)]
pub struct ApduBuilder {
    buf: BytesMut,
    capacity: usize,
    has_iin: bool,
}

impl ApduBuilder {
    /// Start a request fragment.
    pub fn request(function: FunctionCode, control: AppControl, capacity: usize) -> Self {
        debug_assert!(!function.is_response());
        let mut buf = BytesMut::with_capacity(capacity.min(64));
        buf.put_u8(control.to_byte());
        buf.put_u8(function as u8);
        ApduBuilder {
            buf,
            capacity,
            has_iin: false,
        }
    }

    /// Start a response fragment with a placeholder IIN.
    pub fn response(function: FunctionCode, control: AppControl, capacity: usize) -> Self {
        debug_assert!(function.is_response());
        let mut buf = BytesMut::with_capacity(capacity.min(256));
        buf.put_u8(control.to_byte());
        buf.put_u8(function as u8);
        IinField::empty().encode(&mut buf);
        ApduBuilder {
            buf,
            capacity,
            has_iin: true,
        }
    }

    /// Rewrite the control octet.
    pub fn set_control(&mut self, control: AppControl) {
        self.buf[0] = control.to_byte();
    }

    /// Rewrite the IIN octets of a response.
    pub fn set_iin(&mut self, iin: IinField) {
        debug_assert!(self.has_iin);
        self.buf[2] = iin.bits() as u8;
        self.buf[3] = (iin.bits() >> 8) as u8;
    }

    /// Bytes still available under the fragment cap.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether any object data has been written yet.
    pub fn has_objects(&self) -> bool {
        self.buf.len() > if self.has_iin { 4 } else { 2 }
    }

    /// Append an object header. The caller is responsible for having checked
    /// the size against [`ApduBuilder::remaining`].
    pub fn write_header(&mut self, header: &ObjectHeader) {
        header.encode(&mut self.buf);
    }

    /// Raw access for object payload writes.
    pub fn raw(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
