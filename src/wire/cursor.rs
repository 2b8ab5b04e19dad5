//! The position-tracked byte cursor that backs marshalling and unmarshalling.
//!
//! [`WriteCursor`] owns a growable `Vec<u8>`; [`ReadCursor`] borrows a slice
//! and tracks byte order per the message it is reading (byte 0 of the
//! header: `l` little-endian, `B` big-endian). Both halves are grounded in
//! the teacher's `wire::unmarshal_context::Cursor` and `wire::util` free
//! functions, folded into two small types instead of one struct plus a pile
//! of module-level helpers.

use crate::error::ProtocolError;
use crate::ByteOrder;

/// An offset into a [`WriteCursor`]'s buffer recorded by [`WriteCursor::reserve_u32`].
///
/// Back-patch handles are plain offsets, never pointers, so they stay valid
/// across any amount of buffer growth.
#[derive(Clone, Copy, Debug)]
pub struct U32Slot(usize);

pub struct WriteCursor {
    buf: Vec<u8>,
}

impl WriteCursor {
    pub fn new() -> Self {
        WriteCursor { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        WriteCursor {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Advances to the next multiple of `align_to`, writing zero bytes into
    /// the skipped region.
    #[inline]
    pub fn pad(&mut self, align_to: usize) {
        let rem = self.buf.len() % align_to;
        if rem != 0 {
            let padding = align_to - rem;
            self.buf.resize(self.buf.len() + padding, 0);
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u32(if v { 1 } else { 0 });
    }

    pub fn put_i16(&mut self, v: i16) {
        self.put_u16(v as u16);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.pad(2);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.pad(4);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_u64(v as u64);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.pad(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.pad(8);
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    /// Aligns to 4, writes the uint32 byte length of `s` (not counting the
    /// trailing NUL), the UTF-8 bytes, and a terminating NUL.
    pub fn put_string(&mut self, s: &str) -> Result<(), crate::error::MarshalError> {
        if s.len() > u32::MAX as usize {
            return Err(crate::error::MarshalError::StringTooLong(s.len()));
        }
        if s.as_bytes().contains(&0) {
            return Err(crate::error::MarshalError::StringContainsNullByte);
        }
        self.put_u32(s.len() as u32);
        self.put_bytes(s.as_bytes());
        self.put_u8(0);
        Ok(())
    }

    /// Writes a uint8 length, the bytes of `s`, then a NUL. No prior alignment.
    pub fn put_signature(&mut self, s: &str) -> Result<(), crate::error::MarshalError> {
        if s.len() > u8::MAX as usize {
            return Err(crate::error::MarshalError::SignatureTooLong(s.len()));
        }
        self.put_u8(s.len() as u8);
        self.put_bytes(s.as_bytes());
        self.put_u8(0);
        Ok(())
    }

    /// Reserves 4 zeroed bytes (aligned to 4) and returns a handle that
    /// [`WriteCursor::backpatch_u32`] later uses to fill in the real value,
    /// e.g. an array's byte length, known only after its elements are written.
    pub fn reserve_u32(&mut self) -> U32Slot {
        self.pad(4);
        let slot = self.buf.len();
        self.buf.extend_from_slice(&[0, 0, 0, 0]);
        U32Slot(slot)
    }

    pub fn backpatch_u32(&mut self, slot: U32Slot, value: u32) {
        self.buf[slot.0..slot.0 + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn seek(&mut self, pos: usize) {
        if pos > self.buf.len() {
            self.buf.resize(pos, 0);
        }
        self.buf.truncate(pos);
    }
}

impl Default for WriteCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// A read position over a borrowed byte slice, aware of the byte order
/// announced by the message it belongs to.
#[derive(Clone, Copy)]
pub struct ReadCursor<'a> {
    buf: &'a [u8],
    offset: usize,
    byteorder: ByteOrder,
}

type Result<T> = std::result::Result<T, ProtocolError>;

impl<'a> ReadCursor<'a> {
    pub fn new(buf: &'a [u8], byteorder: ByteOrder) -> Self {
        ReadCursor {
            buf,
            offset: 0,
            byteorder,
        }
    }

    pub fn at(buf: &'a [u8], offset: usize, byteorder: ByteOrder) -> Self {
        ReadCursor {
            buf,
            offset,
            byteorder,
        }
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn byteorder(&self) -> ByteOrder {
        self.byteorder
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.offset..]
    }

    pub fn seek(&mut self, pos: usize) {
        self.offset = pos;
    }

    /// Advances to the next multiple of `align_to`, verifying every skipped
    /// byte is zero (a non-zero pad byte means corrupted or malicious input).
    pub fn align_to(&mut self, align_to: usize) -> Result<()> {
        let rem = self.offset % align_to;
        if rem == 0 {
            return Ok(());
        }
        let padding = align_to - rem;
        if self.offset + padding > self.buf.len() {
            return Err(ProtocolError::NotEnoughBytes);
        }
        for i in 0..padding {
            if self.buf[self.offset + i] != 0 {
                return Err(ProtocolError::PaddingContainedData);
            }
        }
        self.offset += padding;
        Ok(())
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.offset + len > self.buf.len() {
            return Err(ProtocolError::NotEnoughBytes);
        }
        let slice = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = self.read_raw(1)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ProtocolError::NotEnoughBytes),
        }
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.align_to(2)?;
        let b = self.read_raw(2)?;
        Ok(match self.byteorder {
            ByteOrder::LittleEndian => u16::from_le_bytes([b[0], b[1]]),
            ByteOrder::BigEndian => u16::from_be_bytes([b[0], b[1]]),
        })
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.align_to(4)?;
        let b = self.read_raw(4)?;
        Ok(match self.byteorder {
            ByteOrder::LittleEndian => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            ByteOrder::BigEndian => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        })
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.align_to(8)?;
        let b = self.read_raw(8)?;
        let arr = [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]];
        Ok(match self.byteorder {
            ByteOrder::LittleEndian => u64::from_le_bytes(arr),
            ByteOrder::BigEndian => u64::from_be_bytes(arr),
        })
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Reads a uint32 length, the UTF-8 bytes, and the terminating NUL.
    pub fn read_string(&mut self) -> Result<&'a str> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_raw(len)?;
        let nul = self.read_u8()?;
        if nul != 0 {
            return Err(ProtocolError::PaddingContainedData);
        }
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Reads a uint8 length, the signature bytes, and the terminating NUL.
    /// No prior alignment.
    pub fn read_signature(&mut self) -> Result<&'a str> {
        let len = self.read_u8()? as usize;
        let bytes = self.read_raw(len)?;
        let nul = self.read_u8()?;
        if nul != 0 {
            return Err(ProtocolError::PaddingContainedData);
        }
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_writes_zero_bytes_to_alignment() {
        let mut w = WriteCursor::new();
        w.put_u8(1);
        w.pad(4);
        assert_eq!(w.as_slice(), &[1, 0, 0, 0]);
    }

    #[test]
    fn scalar_write_pads_first() {
        let mut w = WriteCursor::new();
        w.put_u8(7);
        w.put_i32(-3);
        assert_eq!(w.as_slice(), &[7, 0, 0, 0, 0xfd, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn string_round_trip() {
        let mut w = WriteCursor::new();
        w.put_string("abc").unwrap();
        assert_eq!(w.as_slice(), &[3, 0, 0, 0, b'a', b'b', b'c', 0]);

        let mut r = ReadCursor::new(w.as_slice(), ByteOrder::LittleEndian);
        assert_eq!(r.read_string().unwrap(), "abc");
    }

    #[test]
    fn backpatch_survives_growth() {
        let mut w = WriteCursor::new();
        let slot = w.reserve_u32();
        for _ in 0..10_000 {
            w.put_u8(0xaa);
        }
        w.backpatch_u32(slot, 0xdead_beef);
        let bytes = &w.as_slice()[0..4];
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 0xdead_beef);
    }

    #[test]
    fn reader_rejects_nonzero_padding() {
        let buf = [1u8, 1, 1, 1, 0, 0, 0, 0];
        let mut r = ReadCursor::new(&buf, ByteOrder::LittleEndian);
        let _ = r.read_u8().unwrap();
        assert_eq!(r.read_u32(), Err(ProtocolError::PaddingContainedData));
    }

    #[test]
    fn big_endian_scalars() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&42u32.to_be_bytes());
        let mut r = ReadCursor::new(&buf, ByteOrder::BigEndian);
        assert_eq!(r.read_u32().unwrap(), 42);
    }
}
