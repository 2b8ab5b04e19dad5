//! Message framing: turning a [`MessageBuilder`] into wire bytes and a raw
//! byte stream back into a [`MessageReader`].
//!
//! The fixed header is 16 bytes: a one-byte endianness marker, message type,
//! flags, protocol version, a uint32 body length, a uint32 serial, and a
//! uint32 giving the byte length of the header fields array that follows
//! (bytes 12..16). Header fields are themselves `(y v)` struct entries —
//! field code, then a variant holding the field's value — padded to an
//! 8-byte boundary between entries, per the teacher's `wire::marshal`.

use crate::codec::Codec;
use crate::error::ProtocolError;
use crate::signature::Base;
use crate::value::Value;
use crate::wire::cursor::{ReadCursor, WriteCursor};
use crate::ByteOrder;

pub const HEADER_LEN: usize = 12;
pub const PROTOCOL_VERSION: u8 = 1;

pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x01;
pub const FLAG_NO_AUTO_START: u8 = 0x02;
pub const FLAG_ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x04;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageType {
    Call,
    Reply,
    Error,
    Signal,
}

impl MessageType {
    fn code(self) -> u8 {
        match self {
            MessageType::Call => 1,
            MessageType::Reply => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    fn from_code(c: u8) -> Result<MessageType, ProtocolError> {
        Ok(match c {
            1 => MessageType::Call,
            2 => MessageType::Reply,
            3 => MessageType::Error,
            4 => MessageType::Signal,
            other => return Err(ProtocolError::InvalidMessageKind(other)),
        })
    }
}

/// A header field. Restricted to the ids this crate understands and emits;
/// unix-fd passing (`id 9`) is out of scope, so `UnixFds` has no variant
/// here — a message that carries it is read by skipping the field (see
/// [`HeaderField::skip_unknown`]) rather than by decoding it.
#[derive(Clone, Debug, PartialEq)]
pub enum HeaderField {
    Path(String),
    Interface(String),
    Member(String),
    ErrorName(String),
    ReplySerial(u32),
    Destination(String),
    Sender(String),
    Signature(String),
}

impl HeaderField {
    fn id(&self) -> u8 {
        match self {
            HeaderField::Path(_) => 1,
            HeaderField::Interface(_) => 2,
            HeaderField::Member(_) => 3,
            HeaderField::ErrorName(_) => 4,
            HeaderField::ReplySerial(_) => 5,
            HeaderField::Destination(_) => 6,
            HeaderField::Sender(_) => 7,
            HeaderField::Signature(_) => 8,
        }
    }

    /// Upper bound on the bytes [`HeaderField::marshal`] will write for this
    /// field, via the same [`Codec::estimate`] §3 contracts every body value
    /// to: worst-case 8-byte pad, the id byte, a tiny inner-signature header,
    /// then the value's own codec estimate.
    fn estimate(&self) -> usize {
        let value_estimate = match self {
            HeaderField::Path(s) => Codec::ObjectPath.estimate(&Value::ObjectPath(s.clone())),
            HeaderField::Interface(s)
            | HeaderField::Member(s)
            | HeaderField::ErrorName(s)
            | HeaderField::Destination(s)
            | HeaderField::Sender(s) => Codec::String.estimate(&Value::String(s.clone())),
            HeaderField::Signature(s) => Codec::Signature.estimate(&Value::Signature(s.clone())),
            HeaderField::ReplySerial(v) => {
                Codec::Primitive(Base::Uint32).estimate(&Value::Uint32(*v))
            }
        }
        .expect("a header field's own value always matches its own codec");
        7 + 1 + 4 + value_estimate
    }

    /// Writes this field as an 8-byte-aligned `(y v)` struct entry.
    fn marshal(&self, cursor: &mut WriteCursor) {
        cursor.pad(8);
        cursor.put_u8(self.id());
        match self {
            HeaderField::Path(s) => {
                cursor.put_signature("o").unwrap();
                cursor.put_string(s).unwrap();
            }
            HeaderField::Interface(s)
            | HeaderField::Member(s)
            | HeaderField::ErrorName(s)
            | HeaderField::Destination(s)
            | HeaderField::Sender(s) => {
                cursor.put_signature("s").unwrap();
                cursor.put_string(s).unwrap();
            }
            HeaderField::Signature(s) => {
                cursor.put_signature("g").unwrap();
                cursor.put_signature(s).unwrap();
            }
            HeaderField::ReplySerial(v) => {
                cursor.put_signature("u").unwrap();
                cursor.put_u32(*v);
            }
        }
    }

    /// Reads one `(y v)` entry. `cursor` must already be aligned to 8.
    fn unmarshal(cursor: &mut ReadCursor) -> Result<Option<HeaderField>, ProtocolError> {
        let id = cursor.read_u8()?;
        let variant_sig = cursor.read_signature()?.to_owned();
        Ok(match (id, variant_sig.as_str()) {
            (1, "o") => Some(HeaderField::Path(cursor.read_string()?.to_owned())),
            (2, "s") => Some(HeaderField::Interface(cursor.read_string()?.to_owned())),
            (3, "s") => Some(HeaderField::Member(cursor.read_string()?.to_owned())),
            (4, "s") => Some(HeaderField::ErrorName(cursor.read_string()?.to_owned())),
            (5, "u") => Some(HeaderField::ReplySerial(cursor.read_u32()?)),
            (6, "s") => Some(HeaderField::Destination(cursor.read_string()?.to_owned())),
            (7, "s") => Some(HeaderField::Sender(cursor.read_string()?.to_owned())),
            (8, "g") => Some(HeaderField::Signature(cursor.read_signature()?.to_owned())),
            // A known id carrying a value of the wrong basic type is a
            // malformed message, not forward-compat noise (§1's "header field
            // with unknown basic type" is exactly this case).
            (1..=8, _) => return Err(ProtocolError::UnknownHeaderFieldType(id)),
            // An id we don't decode at all (e.g. 9, unix fds): skip the
            // single variant value and report nothing.
            (_, sig) => {
                skip_variant_value(cursor, sig)?;
                None
            }
        })
    }
}

/// Skips over a variant's value given its inner signature, without
/// interpreting it. Used for header field ids this crate does not decode
/// (still validated structurally so a genuinely corrupt message is caught).
fn skip_variant_value(cursor: &mut ReadCursor, sig: &str) -> Result<(), ProtocolError> {
    let types = crate::signature::parse(sig).map_err(ProtocolError::Signature)?;
    for ty in &types {
        skip_type(cursor, ty)?;
    }
    Ok(())
}

/// The wire alignment of a grammar-level type, used only while skipping over
/// header field values this crate does not decode (variant contents, for
/// instance, can recurse into types with no compiled [`crate::codec::Codec`]).
fn sigtype_alignment(ty: &crate::signature::SigType) -> usize {
    use crate::signature::{Base, SigType};
    match ty {
        SigType::Base(b) => b.alignment(),
        SigType::Variant => 1,
        SigType::Struct(_) | SigType::Dict(_, _) => 8,
        SigType::Array(_) => 4,
    }
}

fn skip_type(cursor: &mut ReadCursor, ty: &crate::signature::SigType) -> Result<(), ProtocolError> {
    use crate::signature::{Base, SigType};
    match ty {
        SigType::Base(Base::Byte) => {
            cursor.read_u8()?;
        }
        SigType::Base(Base::Boolean) => {
            cursor.read_bool()?;
        }
        SigType::Base(Base::Int16 | Base::Uint16) => {
            cursor.read_u16()?;
        }
        SigType::Base(Base::Int32 | Base::Uint32 | Base::UnixFd) => {
            cursor.read_u32()?;
        }
        SigType::Base(Base::Int64 | Base::Uint64 | Base::Double) => {
            cursor.read_u64()?;
        }
        SigType::Base(Base::String | Base::ObjectPath) => {
            cursor.read_string()?;
        }
        SigType::Base(Base::Signature) => {
            cursor.read_signature()?;
        }
        SigType::Variant => {
            let inner_sig = cursor.read_signature()?.to_owned();
            skip_variant_value(cursor, &inner_sig)?;
        }
        SigType::Struct(fields) => {
            cursor.align_to(8)?;
            for f in fields {
                skip_type(cursor, f)?;
            }
        }
        SigType::Array(elem) => {
            cursor.align_to(4)?;
            let byte_len = cursor.read_u32()? as usize;
            cursor.align_to(sigtype_alignment(elem))?;
            let end = cursor.position() + byte_len;
            while cursor.position() < end {
                skip_type(cursor, elem)?;
            }
        }
        SigType::Dict(key, val) => {
            cursor.align_to(4)?;
            let byte_len = cursor.read_u32()? as usize;
            cursor.align_to(8)?;
            let end = cursor.position() + byte_len;
            while cursor.position() < end {
                cursor.align_to(8)?;
                skip_type(cursor, &SigType::Base(*key))?;
                skip_type(cursor, val)?;
            }
        }
    }
    Ok(())
}

/// Builds one complete message from its parts and returns the finished bytes.
///
/// Construction order follows the teacher's `marshal_header`: endianness,
/// type, flags, version, a zeroed length slot, the serial, a zeroed
/// header-fields-length slot, then each present field in fixed id order, then
/// the length back-patch, then padding to 8 and the body.
///
/// Always emits little-endian (`'l'`) — per §1's Non-goals, this crate does
/// not produce big-endian messages, only `ReadCursor`/`MessageReader` accept
/// them. There is no `byteorder` field to set: the cursor's scalar writers
/// are hardcoded little-endian, so exposing one here would let a caller
/// request a `'B'` marker over an LE-encoded body, an internally
/// inconsistent message no real peer could parse.
pub struct MessageBuilder {
    pub typ: MessageType,
    pub flags: u8,
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub body_signature: Option<String>,
    pub body: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(typ: MessageType, serial: u32) -> Self {
        MessageBuilder {
            typ,
            flags: 0,
            serial,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            body_signature: None,
            body: Vec::new(),
        }
    }

    fn header_fields(&self) -> Vec<HeaderField> {
        let mut fields = Vec::new();
        if let Some(v) = &self.reply_serial {
            fields.push(HeaderField::ReplySerial(*v));
        }
        if let Some(v) = &self.interface {
            fields.push(HeaderField::Interface(v.clone()));
        }
        if let Some(v) = &self.destination {
            fields.push(HeaderField::Destination(v.clone()));
        }
        if let Some(v) = &self.sender {
            fields.push(HeaderField::Sender(v.clone()));
        }
        if let Some(v) = &self.member {
            fields.push(HeaderField::Member(v.clone()));
        }
        if let Some(v) = &self.path {
            fields.push(HeaderField::Path(v.clone()));
        }
        if let Some(v) = &self.error_name {
            fields.push(HeaderField::ErrorName(v.clone()));
        }
        if !self.body.is_empty() {
            if let Some(sig) = &self.body_signature {
                fields.push(HeaderField::Signature(sig.clone()));
            }
        }
        fields
    }

    /// Serializes the complete message: fixed header, header fields, padding
    /// to 8, then the body bytes exactly as given.
    pub fn build(&self) -> Vec<u8> {
        let fields = self.header_fields();
        let fields_estimate: usize = fields.iter().map(HeaderField::estimate).sum();
        let mut cursor =
            WriteCursor::with_capacity(HEADER_LEN + 4 + fields_estimate + 8 + self.body.len());
        cursor.put_u8(b'l');
        cursor.put_u8(self.typ.code());
        cursor.put_u8(self.flags);
        cursor.put_u8(PROTOCOL_VERSION);
        let body_len_slot = cursor.reserve_u32();
        cursor.put_u32(self.serial);
        let fields_len_slot = cursor.reserve_u32();
        let fields_start = cursor.position();
        for field in fields {
            field.marshal(&mut cursor);
        }
        let fields_len = (cursor.position() - fields_start) as u32;
        cursor.backpatch_u32(fields_len_slot, fields_len);

        cursor.pad(8);
        cursor.put_bytes(&self.body);
        cursor.backpatch_u32(body_len_slot, self.body.len() as u32);
        cursor.into_inner()
    }
}

/// The fixed-header fields, parsed but not yet interpreted into a
/// [`MessageReader`] — exposed separately because the connection layer needs
/// `body_len` and `byteorder` to know how many more bytes to read off the
/// wire before the rest of parsing can proceed.
#[derive(Clone, Copy, Debug)]
pub struct FixedHeader {
    pub byteorder: ByteOrder,
    pub typ: MessageType,
    pub flags: u8,
    pub version: u8,
    pub body_len: u32,
    pub serial: u32,
}

/// Parses just the 12-byte fixed header (no header-fields-length, no body).
pub fn parse_fixed_header(buf: &[u8]) -> Result<FixedHeader, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::NotEnoughBytes);
    }
    let byteorder = match buf[0] {
        b'l' => ByteOrder::LittleEndian,
        b'B' => ByteOrder::BigEndian,
        other => return Err(ProtocolError::InvalidByteOrder(other)),
    };
    let typ = MessageType::from_code(buf[1])?;
    let flags = buf[2];
    let version = buf[3];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::InvalidVersion(version));
    }
    let mut cursor = ReadCursor::at(buf, 4, byteorder);
    let body_len = cursor.read_u32()?;
    let serial = cursor.read_u32()?;
    Ok(FixedHeader {
        byteorder,
        typ,
        flags,
        version,
        body_len,
        serial,
    })
}

/// Given a parsed [`FixedHeader`], the number of additional bytes needed
/// after the 12-byte fixed header before the whole message (header fields +
/// padding + body) can be parsed. The caller reads the 4-byte header-fields
/// length first, then this much more.
pub fn header_fields_len(buf: &[u8]) -> Result<u32, ProtocolError> {
    if buf.len() < HEADER_LEN + 4 {
        return Err(ProtocolError::NotEnoughBytes);
    }
    let byteorder = match buf[0] {
        b'l' => ByteOrder::LittleEndian,
        b'B' => ByteOrder::BigEndian,
        other => return Err(ProtocolError::InvalidByteOrder(other)),
    };
    let mut cursor = ReadCursor::at(buf, HEADER_LEN, byteorder);
    Ok(cursor.read_u32()?)
}

/// A fully parsed message: fixed header, decoded fields, and the raw body
/// bytes (left unmarshalled until a caller asks for them with a signature).
#[derive(Clone, Debug, PartialEq)]
pub struct MessageReader {
    pub byteorder: ByteOrder,
    pub typ: MessageType,
    pub flags: u8,
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub body_signature: Option<String>,
    pub body: Vec<u8>,
}

impl MessageReader {
    /// Parses a single complete message starting at `buf[0]`. `buf` must
    /// contain at least `HEADER_LEN + 4 + header_fields_len` rounded up to 8,
    /// plus `body_len` bytes — i.e. the caller has already used
    /// [`parse_fixed_header`] and [`header_fields_len`] to know how much to
    /// read off the transport before calling this.
    pub fn parse(buf: &[u8]) -> Result<MessageReader, ProtocolError> {
        let fixed = parse_fixed_header(buf)?;
        let mut cursor = ReadCursor::at(buf, HEADER_LEN, fixed.byteorder);
        let fields_len = cursor.read_u32()? as usize;
        let fields_end = cursor.position() + fields_len;
        if fields_end > buf.len() {
            return Err(ProtocolError::LengthOverflow);
        }

        let mut reader = MessageReader {
            byteorder: fixed.byteorder,
            typ: fixed.typ,
            flags: fixed.flags,
            serial: fixed.serial,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            body_signature: None,
            body: Vec::new(),
        };

        while cursor.position() < fields_end {
            cursor.align_to(8)?;
            if cursor.position() >= fields_end {
                break;
            }
            if let Some(field) = HeaderField::unmarshal(&mut cursor)? {
                reader.apply(field);
            }
        }
        cursor.seek(fields_end);
        cursor.align_to(8)?;

        let body_start = cursor.position();
        let body_end = body_start + fixed.body_len as usize;
        if body_end > buf.len() {
            return Err(ProtocolError::LengthOverflow);
        }
        reader.body = buf[body_start..body_end].to_vec();

        reader.validate_required_fields()?;
        Ok(reader)
    }

    fn apply(&mut self, field: HeaderField) {
        match field {
            HeaderField::Path(v) => self.path = Some(v),
            HeaderField::Interface(v) => self.interface = Some(v),
            HeaderField::Member(v) => self.member = Some(v),
            HeaderField::ErrorName(v) => self.error_name = Some(v),
            HeaderField::ReplySerial(v) => self.reply_serial = Some(v),
            HeaderField::Destination(v) => self.destination = Some(v),
            HeaderField::Sender(v) => self.sender = Some(v),
            HeaderField::Signature(v) => self.body_signature = Some(v),
        }
    }

    fn validate_required_fields(&self) -> Result<(), ProtocolError> {
        match self.typ {
            MessageType::Call => {
                if self.path.is_none() || self.member.is_none() {
                    return Err(ProtocolError::MissingRequiredHeaderField);
                }
            }
            MessageType::Signal => {
                if self.path.is_none() || self.interface.is_none() || self.member.is_none() {
                    return Err(ProtocolError::MissingRequiredHeaderField);
                }
            }
            MessageType::Reply => {
                if self.reply_serial.is_none() {
                    return Err(ProtocolError::MissingRequiredHeaderField);
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() || self.reply_serial.is_none() {
                    return Err(ProtocolError::MissingRequiredHeaderField);
                }
            }
        }
        Ok(())
    }

    /// Decodes the body against `sig`, which must match `self.body_signature`
    /// (or both must be absent/empty).
    pub fn read_body(&self) -> Result<Vec<crate::value::Value>, ProtocolError> {
        let sig = self.body_signature.as_deref().unwrap_or("");
        let codecs = crate::codec::Codec::compile_all(sig).map_err(ProtocolError::Signature)?;
        let mut cursor = ReadCursor::new(&self.body, self.byteorder);
        let mut values = Vec::with_capacity(codecs.len());
        for codec in &codecs {
            values.push(codec.unmarshal(&mut cursor)?);
        }
        if cursor.position() != self.body.len() {
            return Err(ProtocolError::NotAllBytesUsed);
        }
        Ok(values)
    }
}
