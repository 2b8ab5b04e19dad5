//! Everything that deals with converting to/from raw bytes: the byte cursor
//! and the message framing built on top of it.

pub mod cursor;
pub mod message;
