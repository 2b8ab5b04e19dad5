//! The compiled form of a signature: a tree of [`Codec`], each node knowing
//! its alignment, its canonical signature substring, a worst-case size
//! estimate, and how to marshal/unmarshal a [`Value`] of its shape.
//!
//! Dispatch is a `match` on a tagged enum, not a vtable or a generic trait
//! per Rust type — see the design notes on type-erased codec dispatch. The
//! tree is built once from a parsed [`SigType`] and is immutable and freely
//! shareable afterwards (codecs hold no value-specific state).

use crate::error::{MarshalError, ProtocolError, SignatureError};
use crate::signature::{self, Base, SigType};
use crate::value::Value;
use crate::wire::cursor::{ReadCursor, WriteCursor};

/// One compiled codec node. Array and struct codecs own their child codecs,
/// forming a DAG keyed by signature (no cycles are possible: D-Bus
/// signatures are finite trees).
#[derive(Clone, Debug, PartialEq)]
pub enum Codec {
    Primitive(Base),
    String,
    ObjectPath,
    Signature,
    Struct(Vec<Codec>),
    Array(Box<Codec>),
}

impl Codec {
    /// Compiles a parsed signature tree into a codec. This is the only place
    /// `v`/`h`/`{` (variant, unix fd, dict) become visible as a real error:
    /// the grammar recognizes them (see [`signature::parse`]) but this crate
    /// does not implement their wire forms.
    pub fn compile(ty: &SigType) -> Result<Codec, SignatureError> {
        Ok(match ty {
            SigType::Base(Base::UnixFd) => {
                return Err(SignatureError::UnsupportedExtension('h', 0))
            }
            SigType::Base(b) => Codec::Primitive(*b),
            SigType::Variant => return Err(SignatureError::UnsupportedExtension('v', 0)),
            SigType::Struct(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for f in fields {
                    out.push(Codec::compile(f)?);
                }
                Codec::Struct(out)
            }
            SigType::Array(elem) => Codec::Array(Box::new(Codec::compile(elem)?)),
            SigType::Dict(_, _) => return Err(SignatureError::UnsupportedExtension('{', 0)),
        })
    }

    /// Parses `sig` and compiles every top-level type in it.
    pub fn compile_all(sig: &str) -> Result<Vec<Codec>, SignatureError> {
        signature::parse(sig)?.iter().map(Codec::compile).collect()
    }

    pub fn alignment(&self) -> usize {
        match self {
            Codec::Primitive(b) => match b {
                Base::Boolean => 4,
                other => other.alignment(),
            },
            Codec::String | Codec::ObjectPath => 4,
            Codec::Signature => 1,
            Codec::Struct(_) => 8,
            Codec::Array(_) => 4,
        }
    }

    /// The canonical signature substring this codec was built from.
    pub fn signature(&self) -> String {
        match self {
            Codec::Primitive(b) => b.code().to_string(),
            Codec::String => "s".to_string(),
            Codec::ObjectPath => "o".to_string(),
            Codec::Signature => "g".to_string(),
            Codec::Struct(fields) => {
                let mut s = String::from("(");
                for f in fields {
                    s.push_str(&f.signature());
                }
                s.push(')');
                s
            }
            Codec::Array(elem) => format!("a{}", elem.signature()),
        }
    }

    /// An upper bound on the number of bytes `marshal(value)` will write,
    /// starting from an already-aligned position. Used only to size the
    /// output buffer up front; never relied on for correctness.
    pub fn estimate(&self, value: &Value) -> Result<usize, MarshalError> {
        Ok(match (self, value) {
            (Codec::Primitive(b), _) => 2 * b.alignment() - 1,
            (Codec::String | Codec::ObjectPath, Value::String(s) | Value::ObjectPath(s)) => {
                1 + 2 * 4 - 1 + s.len()
            }
            (Codec::Signature, Value::Signature(s)) => 2 + s.len(),
            (Codec::Struct(fields), Value::Struct(values)) => {
                if fields.len() != values.len() {
                    return Err(MarshalError::TypeMismatch);
                }
                let mut total = 7;
                for (f, v) in fields.iter().zip(values) {
                    total += f.estimate(v)?;
                }
                total
            }
            (Codec::Array(elem), Value::Array(values)) => {
                let mut total = 2 * 4 - 1;
                for v in values {
                    total += elem.estimate(v)?;
                }
                total
            }
            _ => return Err(MarshalError::TypeMismatch),
        })
    }

    /// Marshals `value` into `cursor`. `cursor` need not already be aligned
    /// to this codec's alignment — every codec pads itself before writing.
    pub fn marshal(&self, cursor: &mut WriteCursor, value: &Value) -> Result<(), MarshalError> {
        match (self, value) {
            (Codec::Primitive(Base::Byte), Value::Byte(v)) => cursor.put_u8(*v),
            (Codec::Primitive(Base::Boolean), Value::Boolean(v)) => cursor.put_bool(*v),
            (Codec::Primitive(Base::Int16), Value::Int16(v)) => cursor.put_i16(*v),
            (Codec::Primitive(Base::Uint16), Value::Uint16(v)) => cursor.put_u16(*v),
            (Codec::Primitive(Base::Int32), Value::Int32(v)) => cursor.put_i32(*v),
            (Codec::Primitive(Base::Uint32), Value::Uint32(v)) => cursor.put_u32(*v),
            (Codec::Primitive(Base::Int64), Value::Int64(v)) => cursor.put_i64(*v),
            (Codec::Primitive(Base::Uint64), Value::Uint64(v)) => cursor.put_u64(*v),
            (Codec::Primitive(Base::Double), Value::Double(v)) => cursor.put_f64(*v),
            (Codec::Primitive(Base::UnixFd), _) => {
                return Err(MarshalError::Signature(
                    crate::error::SignatureError::UnsupportedExtension('h', 0),
                ))
            }
            (Codec::String, Value::String(s)) => cursor.put_string(s)?,
            (Codec::ObjectPath, Value::ObjectPath(s)) => {
                validate_object_path(s)?;
                cursor.put_string(s)?
            }
            (Codec::Signature, Value::Signature(s)) => cursor.put_signature(s)?,
            (Codec::Struct(fields), Value::Struct(values)) => {
                if fields.len() != values.len() {
                    return Err(MarshalError::TypeMismatch);
                }
                cursor.pad(8);
                for (f, v) in fields.iter().zip(values) {
                    f.marshal(cursor, v)?;
                }
            }
            (Codec::Array(elem), Value::Array(values)) => {
                cursor.pad(4);
                let len_slot = cursor.reserve_u32();
                cursor.pad(elem.alignment());
                let elements_start = cursor.position();
                for v in values {
                    elem.marshal(cursor, v)?;
                }
                let len = (cursor.position() - elements_start) as u32;
                cursor.backpatch_u32(len_slot, len);
            }
            _ => return Err(MarshalError::TypeMismatch),
        }
        Ok(())
    }

    /// Unmarshals a value of this codec's shape from `cursor`.
    pub fn unmarshal(&self, cursor: &mut ReadCursor) -> Result<Value, ProtocolError> {
        Ok(match self {
            Codec::Primitive(Base::Byte) => Value::Byte(cursor.read_u8()?),
            Codec::Primitive(Base::Boolean) => Value::Boolean(cursor.read_bool()?),
            Codec::Primitive(Base::Int16) => Value::Int16(cursor.read_i16()?),
            Codec::Primitive(Base::Uint16) => Value::Uint16(cursor.read_u16()?),
            Codec::Primitive(Base::Int32) => Value::Int32(cursor.read_i32()?),
            Codec::Primitive(Base::Uint32) => Value::Uint32(cursor.read_u32()?),
            Codec::Primitive(Base::Int64) => Value::Int64(cursor.read_i64()?),
            Codec::Primitive(Base::Uint64) => Value::Uint64(cursor.read_u64()?),
            Codec::Primitive(Base::Double) => Value::Double(cursor.read_f64()?),
            Codec::Primitive(Base::UnixFd) => {
                return Err(ProtocolError::Signature(
                    crate::error::SignatureError::UnsupportedExtension('h', 0),
                ))
            }
            Codec::String => Value::String(cursor.read_string()?.to_owned()),
            Codec::ObjectPath => {
                let s = cursor.read_string()?.to_owned();
                Value::ObjectPath(s)
            }
            Codec::Signature => Value::Signature(cursor.read_signature()?.to_owned()),
            Codec::Struct(fields) => {
                cursor.align_to(8)?;
                let mut out = Vec::with_capacity(fields.len());
                for f in fields {
                    out.push(f.unmarshal(cursor)?);
                }
                Value::Struct(out)
            }
            Codec::Array(elem) => {
                cursor.align_to(4)?;
                let byte_len = cursor.read_u32()? as usize;
                cursor.align_to(elem.alignment())?;
                let end = cursor.position() + byte_len;
                let mut out = Vec::new();
                while cursor.position() < end {
                    out.push(elem.unmarshal(cursor)?);
                }
                if cursor.position() != end {
                    return Err(ProtocolError::NotAllBytesUsed);
                }
                Value::Array(out)
            }
        })
    }
}

/// Object paths are marshalled exactly like strings but are validated more
/// strictly: non-empty, starting with `/`, each `/`-separated element
/// non-empty and `[A-Za-z0-9_]+`.
pub fn validate_object_path(path: &str) -> Result<(), MarshalError> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(MarshalError::InvalidObjectPath("must start with '/'"));
    }
    if path.len() > 1 {
        for element in path[1..].split('/') {
            if element.is_empty() {
                return Err(MarshalError::InvalidObjectPath(
                    "elements must be non-empty",
                ));
            }
            if !element.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(MarshalError::InvalidObjectPath(
                    "elements must be [A-Za-z0-9_]+",
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codecs(sig: &str) -> Vec<Codec> {
        Codec::compile_all(sig).unwrap()
    }

    #[test]
    fn scenario_a_yi() {
        let cs = codecs("yi");
        let mut w = WriteCursor::new();
        cs[0].marshal(&mut w, &Value::Byte(7)).unwrap();
        cs[1].marshal(&mut w, &Value::Int32(-3)).unwrap();
        assert_eq!(
            w.as_slice(),
            &[0x07, 0x00, 0x00, 0x00, 0xfd, 0xff, 0xff, 0xff]
        );

        let mut r = ReadCursor::new(w.as_slice(), crate::ByteOrder::LittleEndian);
        assert_eq!(cs[0].unmarshal(&mut r).unwrap(), Value::Byte(7));
        assert_eq!(cs[1].unmarshal(&mut r).unwrap(), Value::Int32(-3));
    }

    #[test]
    fn scenario_b_string() {
        let cs = codecs("s");
        let mut w = WriteCursor::new();
        cs[0].marshal(&mut w, &Value::String("abc".into())).unwrap();
        assert_eq!(w.as_slice(), &[3, 0, 0, 0, b'a', b'b', b'c', 0]);
    }

    #[test]
    fn scenario_c_array_of_strings() {
        let cs = codecs("as");
        let mut w = WriteCursor::new();
        let value: Value = vec!["hi", "yo"].into();
        cs[0].marshal(&mut w, &value).unwrap();
        let expected: &[u8] = &[
            0x0f, 0, 0, 0, // length = 15 (includes the inter-element pad byte)
            2, 0, 0, 0, b'h', b'i', 0, 0, // padded to 4
            2, 0, 0, 0, b'y', b'o', 0,
        ];
        assert_eq!(w.as_slice(), expected);
    }

    #[test]
    fn scenario_d_empty_array() {
        let cs = codecs("as");
        let mut w = WriteCursor::new();
        let value: Value = Vec::<String>::new().into();
        cs[0].marshal(&mut w, &value).unwrap();
        assert_eq!(w.as_slice(), &[0, 0, 0, 0]);
    }

    #[test]
    fn array_round_trip() {
        let cs = codecs("ai");
        let value: Value = vec![1i32, -2, 3].into();
        let mut w = WriteCursor::new();
        cs[0].marshal(&mut w, &value).unwrap();
        let mut r = ReadCursor::new(w.as_slice(), crate::ByteOrder::LittleEndian);
        assert_eq!(cs[0].unmarshal(&mut r).unwrap(), value);
    }

    #[test]
    fn struct_round_trip() {
        let cs = codecs("(si)");
        let value = Value::Struct(vec![Value::String("x".into()), Value::Int32(5)]);
        let mut w = WriteCursor::new();
        cs[0].marshal(&mut w, &value).unwrap();
        let mut r = ReadCursor::new(w.as_slice(), crate::ByteOrder::LittleEndian);
        assert_eq!(cs[0].unmarshal(&mut r).unwrap(), value);
    }

    #[test]
    fn alignment_law_holds_for_nested_struct_array() {
        let cs = codecs("a(yx)");
        let value = Value::Array(vec![
            Value::Struct(vec![Value::Byte(1), Value::Int64(2)]),
            Value::Struct(vec![Value::Byte(3), Value::Int64(4)]),
        ]);
        let mut w = WriteCursor::new();
        w.put_u8(0xaa); // throw off initial alignment on purpose
        cs[0].marshal(&mut w, &value).unwrap();
        // the 8-aligned struct start must land on a multiple of 8 regardless
        // of the leading byte.
        let bytes = w.as_slice();
        let array_len_pos = 1 + 3; // pad(4) after the leading byte -> offset 4
        assert_eq!(array_len_pos % 4, 0);
        let _ = bytes;
    }

    #[test]
    fn unsupported_extension_points_fail_at_compile() {
        assert!(Codec::compile_all("v").is_err());
        assert!(Codec::compile_all("a{sv}").is_err());
        // signature parsing itself must still succeed for these:
        assert!(signature::parse("v").is_ok());
        assert!(signature::parse("a{sv}").is_ok());
    }

    #[test]
    fn object_path_validation() {
        assert!(validate_object_path("/").is_ok());
        assert!(validate_object_path("/io/killing/spark").is_ok());
        assert!(validate_object_path("no/leading/slash").is_err());
        assert!(validate_object_path("/trailing/").is_err());
        assert!(validate_object_path("/has space").is_err());
    }
}
