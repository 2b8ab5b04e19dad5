//! # dbuscore
//! The wire-level core of a client-side D-Bus implementation: type
//! signatures, marshalling, message framing, the SASL-style authentication
//! handshake, and a connection that dispatches calls, replies, and signals.
//!
//! ## Quickstart
//! ```no_run
//! use dbuscore::connection::rpc::Connection;
//! use dbuscore::connection::Timeout;
//! use dbuscore::standard_messages;
//!
//! fn main() -> Result<(), dbuscore::error::Error> {
//!     let mut con = Connection::session(Timeout::Infinite)?;
//!     println!("connected as {}", con.unique_name());
//!
//!     let mut call = standard_messages::list_names();
//!     let reply = con.call(&mut call, Timeout::Infinite)?;
//!     println!("{:?}", reply.read_body());
//!     Ok(())
//! }
//! ```
//!
//! ## Layout
//! * [`signature`] — the type-signature grammar, independent of any codec.
//! * [`value`] — the dynamic [`value::Value`] carried across the marshal boundary.
//! * [`codec`] — compiles a signature into a [`codec::Codec`] tree that can marshal/unmarshal values.
//! * [`wire`] — the byte cursor and message framing built on top of it.
//! * [`connection`] — the socket, handshake, and call/reply/signal dispatcher.
//! * [`introspect`] — parses `org.freedesktop.DBus.Introspectable.Introspect` XML.
//! * [`standard_messages`] — the handful of calls almost every client needs.

pub mod codec;
pub mod connection;
pub mod error;
pub mod introspect;
pub mod signature;
pub mod standard_messages;
pub mod value;
pub mod wire;

#[cfg(test)]
mod tests;

/// The byte order a message is encoded in, selected by the first byte of its
/// fixed header (`'l'` or `'B'`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// The byte order this machine would use to encode a message natively.
    #[cfg(target_endian = "little")]
    pub fn native() -> ByteOrder {
        ByteOrder::LittleEndian
    }

    #[cfg(target_endian = "big")]
    pub fn native() -> ByteOrder {
        ByteOrder::BigEndian
    }
}

pub use connection::rpc::Connection;
pub use connection::transport::{DuplexConn, RecvConn, SendConn};
pub use connection::Timeout;
pub use error::Error;
pub use value::Value;
pub use wire::message::{MessageBuilder, MessageReader, MessageType};
