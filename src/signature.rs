//! D-Bus type signatures: the grammar, independent of the codecs that realize it.
//!
//! This module only knows how to recognize well-formed signatures and turn
//! them into a tree of [`SigType`]. Turning that tree into something that can
//! actually marshal a value is [`crate::codec::Codec::compile`] — kept
//! separate so that a signature containing `v`/`h`/`{` still *parses*
//! (every D-Bus implementation on the bus needs to agree on that much) even
//! though this crate cannot yet marshal those types.

use crate::error::SignatureError;

/// Basic (non-container) types.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Base {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
}

impl Base {
    pub fn alignment(self) -> usize {
        match self {
            Base::Byte => 1,
            Base::Boolean => 4,
            Base::Int16 | Base::Uint16 => 2,
            Base::Int32 | Base::Uint32 => 4,
            Base::Int64 | Base::Uint64 => 8,
            Base::Double => 8,
            Base::String | Base::ObjectPath => 4,
            Base::Signature => 1,
            Base::UnixFd => 4,
        }
    }

    pub fn code(self) -> char {
        match self {
            Base::Byte => 'y',
            Base::Boolean => 'b',
            Base::Int16 => 'n',
            Base::Uint16 => 'q',
            Base::Int32 => 'i',
            Base::Uint32 => 'u',
            Base::Int64 => 'x',
            Base::Uint64 => 't',
            Base::Double => 'd',
            Base::String => 's',
            Base::ObjectPath => 'o',
            Base::Signature => 'g',
            Base::UnixFd => 'h',
        }
    }

    fn from_code(c: char) -> Option<Base> {
        Some(match c {
            'y' => Base::Byte,
            'b' => Base::Boolean,
            'n' => Base::Int16,
            'q' => Base::Uint16,
            'i' => Base::Int32,
            'u' => Base::Uint32,
            'x' => Base::Int64,
            't' => Base::Uint64,
            'd' => Base::Double,
            's' => Base::String,
            'o' => Base::ObjectPath,
            'g' => Base::Signature,
            'h' => Base::UnixFd,
            _ => return None,
        })
    }
}

/// One parsed top-level type: a basic type or a container of other types.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SigType {
    Base(Base),
    Array(Box<SigType>),
    Struct(Vec<SigType>),
    Dict(Base, Box<SigType>),
    Variant,
}

impl SigType {
    pub fn to_str(&self, buf: &mut String) {
        match self {
            SigType::Base(b) => buf.push(b.code()),
            SigType::Array(elem) => {
                buf.push('a');
                elem.to_str(buf);
            }
            SigType::Struct(fields) => {
                buf.push('(');
                for f in fields {
                    f.to_str(buf);
                }
                buf.push(')');
            }
            SigType::Dict(k, v) => {
                buf.push('a');
                buf.push('{');
                buf.push(k.code());
                v.to_str(buf);
                buf.push('}');
            }
            SigType::Variant => buf.push('v'),
        }
    }
}

/// Parses `sig` into the ordered list of top-level types it describes.
///
/// A method's argument list, or a message body signature, is exactly such a
/// list: `"yi"` parses to `[Base(Byte), Base(Int32)]`.
pub fn parse(sig: &str) -> Result<Vec<SigType>, SignatureError> {
    if sig.is_empty() {
        return Err(SignatureError::EmptySignature);
    }
    if sig.len() > 255 {
        return Err(SignatureError::TooLong);
    }

    let chars: Vec<(usize, char)> = sig.char_indices().collect();
    let mut pos = 0;
    let mut types = Vec::new();
    while pos < chars.len() {
        let (t, next) = parse_type(&chars, pos)?;
        types.push(t);
        pos = next;
    }

    for t in &types {
        check_depth(t, 0, 0)?;
    }

    Ok(types)
}

fn check_depth(t: &SigType, struct_depth: u8, array_depth: u8) -> Result<(), SignatureError> {
    if struct_depth >= 32 || array_depth >= 32 {
        return Err(SignatureError::NestingTooDeep);
    }
    match t {
        SigType::Base(_) | SigType::Variant => Ok(()),
        SigType::Struct(fields) => {
            for f in fields {
                check_depth(f, struct_depth + 1, array_depth)?;
            }
            Ok(())
        }
        SigType::Array(elem) => check_depth(elem, struct_depth, array_depth + 1),
        SigType::Dict(_, val) => check_depth(val, struct_depth, array_depth + 1),
    }
}

/// Parses exactly one complete type starting at `pos`, returning it and the
/// index just past it. This is the recursive-descent realization of the
/// push-down scan described for the signature grammar: each call frame plays
/// the role of one stack frame (`Array` pushes by recursing into its one
/// required element type, `Struct`/`Dict` push by recursing until the
/// matching close brace).
fn parse_type(chars: &[(usize, char)], pos: usize) -> Result<(SigType, usize), SignatureError> {
    let (idx, c) = chars[pos];
    match c {
        'a' => {
            if pos + 1 >= chars.len() {
                return Err(SignatureError::DanglingArray(idx));
            }
            if chars[pos + 1].1 == '{' {
                let (key, val, next) = parse_dict(chars, pos + 1)?;
                Ok((SigType::Dict(key, Box::new(val)), next))
            } else {
                let (elem, next) = parse_type(chars, pos + 1)?;
                Ok((SigType::Array(Box::new(elem)), next))
            }
        }
        '(' => {
            let (fields, next) = parse_struct(chars, pos + 1)?;
            if fields.is_empty() {
                return Err(SignatureError::EmptyComposite(idx));
            }
            Ok((SigType::Struct(fields), next))
        }
        ')' | '}' => Err(SignatureError::UnbalancedBraces(idx)),
        '{' => Err(SignatureError::UnbalancedBraces(idx)),
        'v' => Ok((SigType::Variant, pos + 1)),
        'h' => Ok((SigType::Base(Base::UnixFd), pos + 1)),
        other => match Base::from_code(other) {
            Some(b) => Ok((SigType::Base(b), pos + 1)),
            None => Err(SignatureError::UnknownTypeCode(other, idx)),
        },
    }
}

fn parse_struct(
    chars: &[(usize, char)],
    mut pos: usize,
) -> Result<(Vec<SigType>, usize), SignatureError> {
    let mut fields = Vec::new();
    loop {
        if pos >= chars.len() {
            return Err(SignatureError::UnbalancedBraces(
                chars.last().map(|(i, _)| *i + 1).unwrap_or(0),
            ));
        }
        if chars[pos].1 == ')' {
            return Ok((fields, pos + 1));
        }
        let (t, next) = parse_type(chars, pos)?;
        fields.push(t);
        pos = next;
    }
}

fn parse_dict(
    chars: &[(usize, char)],
    brace_pos: usize,
) -> Result<(Base, SigType, usize), SignatureError> {
    // chars[brace_pos] == '{'
    let key_pos = brace_pos + 1;
    if key_pos >= chars.len() {
        return Err(SignatureError::UnbalancedBraces(chars[brace_pos].0));
    }
    let (key_idx, key_c) = chars[key_pos];
    let key = Base::from_code(key_c).ok_or(SignatureError::BadDictKey(key_idx))?;
    if matches!(key, Base::UnixFd) {
        return Err(SignatureError::BadDictKey(key_idx));
    }
    let (val, next) = parse_type(chars, key_pos + 1)?;
    if next >= chars.len() || chars[next].1 != '}' {
        return Err(SignatureError::UnbalancedBraces(chars[brace_pos].0));
    }
    Ok((key, val, next + 1))
}

/// Renders a list of types back to its canonical signature string.
pub fn to_string(types: &[SigType]) -> String {
    let mut s = String::new();
    for t in types {
        t.to_str(&mut s);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(s: &str) {
        let types = parse(s).unwrap();
        assert_eq!(to_string(&types), s);
    }

    #[test]
    fn basic_types_roundtrip() {
        for s in ["y", "b", "n", "q", "i", "u", "x", "t", "d", "s", "o", "g", "h", "v"] {
            roundtrip(s);
        }
    }

    #[test]
    fn containers_roundtrip() {
        roundtrip("(si)");
        roundtrip("a(si)");
        roundtrip("a(sa(sv))");
        roundtrip("a{si}");
        roundtrip("a{s(dv)}");
        roundtrip("aas");
        roundtrip("yi");
    }

    #[test]
    fn empty_signature_is_an_error() {
        assert_eq!(parse(""), Err(SignatureError::EmptySignature));
    }

    #[test]
    fn unknown_type_code_is_an_error() {
        assert_eq!(parse("k"), Err(SignatureError::UnknownTypeCode('k', 0)));
    }

    #[test]
    fn unbalanced_braces_are_an_error() {
        assert!(parse("(si").is_err());
        assert!(parse("si)").is_err());
        assert!(parse("a{sv").is_err());
    }

    #[test]
    fn empty_struct_is_an_error() {
        assert_eq!(parse("()"), Err(SignatureError::EmptyComposite(0)));
    }

    #[test]
    fn dangling_array_is_an_error() {
        assert_eq!(parse("a"), Err(SignatureError::DanglingArray(0)));
    }

    #[test]
    fn dict_key_must_be_basic() {
        assert!(parse("a{vi}").is_err());
        assert!(parse("a{(i)i}").is_err());
    }

    #[test]
    fn nesting_too_deep_is_rejected() {
        let deep_struct: String = "(".repeat(33) + &")".repeat(33);
        assert_eq!(parse(&deep_struct), Err(SignatureError::NestingTooDeep));

        let deep_array: String = "a".repeat(33) + "y";
        assert_eq!(parse(&deep_array), Err(SignatureError::NestingTooDeep));
    }

    #[test]
    fn right_associative_array_nesting() {
        // aas => array of array of string
        let types = parse("aas").unwrap();
        assert_eq!(
            types,
            vec![SigType::Array(Box::new(SigType::Array(Box::new(
                SigType::Base(Base::String)
            ))))]
        );
    }
}
