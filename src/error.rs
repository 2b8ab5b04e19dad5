//! The typed error hierarchy used across the crate.
//!
//! Every layer gets its own error enum instead of bubbling up raw strings;
//! `connection::Error` is the only one a caller driving a [`crate::connection::Connection`]
//! usually needs to match on, the others surface through `#[from]` conversions.

use thiserror::Error;

/// Errors produced while parsing or compiling a type signature.
#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum SignatureError {
    #[error("signature is empty")]
    EmptySignature,
    #[error("signature longer than 255 bytes")]
    TooLong,
    #[error("unknown type code {0:?} at index {1}")]
    UnknownTypeCode(char, usize),
    #[error("unbalanced braces in signature at index {0}")]
    UnbalancedBraces(usize),
    #[error("empty struct or dict at index {0}")]
    EmptyComposite(usize),
    #[error("'a' not followed by a complete type at index {0}")]
    DanglingArray(usize),
    #[error("dict entry key at index {0} is not a basic type")]
    BadDictKey(usize),
    #[error("nesting too deep (struct/array depth > 32)")]
    NestingTooDeep,
    #[error("signature character {0:?} at index {1} is a recognized but unimplemented extension point")]
    UnsupportedExtension(char, usize),
}

/// Errors produced while marshalling a [`crate::value::Value`] through a [`crate::codec::Codec`].
#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum MarshalError {
    #[error("value did not match the shape required by its codec")]
    TypeMismatch,
    #[error("string contains an embedded NUL byte")]
    StringContainsNullByte,
    #[error("string is too long to be length-prefixed ({0} bytes)")]
    StringTooLong(usize),
    #[error("signature string is too long to be length-prefixed ({0} bytes)")]
    SignatureTooLong(usize),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("{0}")]
    InvalidObjectPath(&'static str),
}

/// Errors produced while parsing on-wire bytes: header, header fields, or body.
#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum ProtocolError {
    #[error("not enough bytes available to complete this read")]
    NotEnoughBytes,
    #[error("padding between values contained non-zero bytes")]
    PaddingContainedData,
    #[error("unknown endianness byte {0:#x}, expected 'l' or 'B'")]
    InvalidByteOrder(u8),
    #[error("unknown message kind {0}")]
    InvalidMessageKind(u8),
    #[error("unsupported protocol version {0}, only version 1 is understood")]
    InvalidVersion(u8),
    #[error("declared length overflowed the receive buffer")]
    LengthOverflow,
    #[error("header field {0} declared an unexpected or unknown basic type")]
    UnknownHeaderFieldType(u8),
    #[error("a required header field was missing for this message kind")]
    MissingRequiredHeaderField,
    #[error("message body was not entirely consumed while reading")]
    NotAllBytesUsed,
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("string was not valid UTF-8")]
    InvalidUtf8,
}

/// Errors produced by the SASL-style text handshake.
#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum AuthError {
    #[error("every configured authentication method was rejected by the server")]
    NoUsableMethod,
    #[error("server sent unparseable handshake text: {0:?}")]
    MalformedHandshakeLine(String),
    #[error("server closed the connection during the handshake")]
    ClosedDuringHandshake,
}

/// Errors from the underlying socket.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("an io error occurred: {0}")]
    Io(#[from] std::io::Error),
    #[error("a nix error occurred: {0}")]
    Nix(#[from] nix::Error),
    #[error("the peer closed the connection unexpectedly")]
    UnexpectedClose,
}

/// Errors produced while parsing introspection XML.
#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum IntrospectError {
    #[error("malformed xml at byte {0}: {1}")]
    Xml(usize, String),
    #[error("unexpected element <{0}> inside <{1}>")]
    UnexpectedElement(String, String),
    #[error("element <{0}> is missing required attribute {1:?}")]
    MissingAttribute(String, &'static str),
    #[error("unknown direction {0:?}, expected \"in\" or \"out\"")]
    UnknownDirection(String),
    #[error("unknown access {0:?}, expected \"read\", \"write\" or \"readwrite\"")]
    UnknownAccess(String),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("closing tag </{0}> does not match the open element")]
    MismatchedClose(String),
    #[error("document ended with unclosed elements")]
    UnexpectedEof,
}

/// The peer replied with `kind = error`.
#[derive(Debug, Error, Clone)]
#[error("peer returned error {name}")]
pub struct CallError {
    pub name: String,
    pub body: Vec<u8>,
    pub signature: String,
}

/// Top level error type returned by [`crate::connection::Connection`] and friends.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("call failed: {0}")]
    Call(#[from] CallError),
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("the call was cancelled")]
    Cancelled,
    #[error("the connection has been closed")]
    ConnectionClosed,
    #[error("address type {0:?} is not supported")]
    AddressTypeNotSupported(String),
    #[error("{0} does not exist")]
    PathDoesNotExist(String),
    #[error("no bus address found ($DBUS_SESSION_BUS_ADDRESS is unset)")]
    NoAddressFound,
    #[error("unexpected message kind received")]
    UnexpectedMessageKind,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(TransportError::Io(e))
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Transport(TransportError::Nix(e))
    }
}
