//! Standard messages almost every client needs to send: greeting the bus
//! daemon, requesting a well-known name, listening for signals, and building
//! the stock error replies a service sends back for calls it doesn't handle.

use crate::value::Value;
use crate::wire::cursor::WriteCursor;
use crate::wire::message::{MessageBuilder, MessageReader, MessageType};

const BUS_PATH: &str = "/org/freedesktop/DBus";
const BUS_INTERFACE: &str = "org.freedesktop.DBus";
const BUS_DESTINATION: &str = "org.freedesktop.DBus";

fn call(member: &str) -> MessageBuilder {
    let mut builder = MessageBuilder::new(MessageType::Call, 0);
    builder.path = Some(BUS_PATH.to_string());
    builder.interface = Some(BUS_INTERFACE.to_string());
    builder.member = Some(member.to_string());
    builder.destination = Some(BUS_DESTINATION.to_string());
    builder
}

/// The obligatory first call every connection makes: the daemon replies with
/// the connection's unique bus name.
pub fn hello() -> MessageBuilder {
    call("Hello")
}

pub fn list_names() -> MessageBuilder {
    call("ListNames")
}

pub const NAME_FLAG_ALLOW_REPLACEMENT: u32 = 1;
pub const NAME_FLAG_REPLACE_EXISTING: u32 = 1 << 1;
pub const NAME_FLAG_DO_NOT_QUEUE: u32 = 1 << 2;

pub const REQUEST_NAME_REPLY_PRIMARY_OWNER: u32 = 1;
pub const REQUEST_NAME_REPLY_IN_QUEUE: u32 = 2;
pub const REQUEST_NAME_REPLY_EXISTS: u32 = 3;
pub const REQUEST_NAME_REPLY_ALREADY_OWNER: u32 = 4;

/// Requests ownership of a well-known bus name.
pub fn request_name(name: &str, flags: u32) -> Result<MessageBuilder, crate::error::MarshalError> {
    let mut builder = call("RequestName");
    let codecs = crate::codec::Codec::compile_all("su")?;
    let mut body = WriteCursor::new();
    codecs[0].marshal(&mut body, &Value::String(name.to_string()))?;
    codecs[1].marshal(&mut body, &Value::Uint32(flags))?;
    builder.body_signature = Some("su".to_string());
    builder.body = body.into_inner();
    Ok(builder)
}

/// Adds a match rule, e.g. `"type='signal'"`, so the daemon starts routing
/// matching signals to this connection.
pub fn add_match(match_rule: &str) -> Result<MessageBuilder, crate::error::MarshalError> {
    let mut builder = call("AddMatch");
    let codecs = crate::codec::Codec::compile_all("s")?;
    let mut body = WriteCursor::new();
    codecs[0].marshal(&mut body, &Value::String(match_rule.to_string()))?;
    builder.body_signature = Some("s".to_string());
    builder.body = body.into_inner();
    Ok(builder)
}

fn error_reply(call: &MessageReader, error_name: &str, message: String) -> MessageBuilder {
    let mut reply = MessageBuilder::new(MessageType::Error, 0);
    reply.reply_serial = Some(call.serial);
    reply.destination = call.sender.clone();
    reply.error_name = Some(error_name.to_string());

    let codecs = crate::codec::Codec::compile_all("s").expect("'s' always compiles");
    let mut body = WriteCursor::new();
    codecs[0]
        .marshal(&mut body, &Value::String(message))
        .expect("a plain string always marshals");
    reply.body_signature = Some("s".to_string());
    reply.body = body.into_inner();
    reply
}

/// The reply a service sends back when `call` names a method it doesn't
/// implement.
pub fn unknown_method(call: &MessageReader) -> MessageBuilder {
    error_reply(
        call,
        "org.freedesktop.DBus.Error.UnknownMethod",
        format!(
            "No calls to {}.{} are accepted for object {}",
            call.interface.as_deref().unwrap_or(""),
            call.member.as_deref().unwrap_or(""),
            call.path.as_deref().unwrap_or(""),
        ),
    )
}

/// The reply a service sends back when `call`'s body signature doesn't match
/// what the method expects.
pub fn invalid_args(call: &MessageReader, expected_sig: Option<&str>) -> MessageBuilder {
    let suffix = expected_sig
        .map(|sig| format!(" expected signature: {}", sig))
        .unwrap_or_default();
    error_reply(
        call,
        "org.freedesktop.DBus.Error.InvalidArgs",
        format!(
            "Invalid arguments for calls to {}.{} on object {}{}",
            call.interface.as_deref().unwrap_or(""),
            call.member.as_deref().unwrap_or(""),
            call.path.as_deref().unwrap_or(""),
            suffix,
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_targets_the_bus_daemon() {
        let hello = hello();
        assert_eq!(hello.path.as_deref(), Some(BUS_PATH));
        assert_eq!(hello.interface.as_deref(), Some(BUS_INTERFACE));
        assert_eq!(hello.member.as_deref(), Some("Hello"));
        assert_eq!(hello.destination.as_deref(), Some(BUS_DESTINATION));
    }

    #[test]
    fn unknown_method_names_the_missing_call() {
        let mut incoming = MessageBuilder::new(MessageType::Call, 9);
        incoming.path = Some("/a/b".to_string());
        incoming.interface = Some("a.b".to_string());
        incoming.member = Some("DoThing".to_string());
        incoming.sender = Some(":1.5".to_string());
        let bytes = incoming.build();
        let reader = MessageReader::parse(&bytes).unwrap();

        let reply = unknown_method(&reader);
        assert_eq!(reply.reply_serial, Some(9));
        assert_eq!(reply.destination.as_deref(), Some(":1.5"));
        assert_eq!(
            reply.error_name.as_deref(),
            Some("org.freedesktop.DBus.Error.UnknownMethod")
        );
        let reply_bytes = reply.build();
        let reply_reader = MessageReader::parse(&reply_bytes).unwrap();
        let body = reply_reader.read_body().unwrap();
        match &body[0] {
            Value::String(s) => assert!(s.contains("a.b.DoThing")),
            other => panic!("expected a string, got {:?}", other),
        }
    }

    #[test]
    fn request_name_encodes_name_and_flags() {
        let builder = request_name("io.example.Test", NAME_FLAG_DO_NOT_QUEUE).unwrap();
        let bytes = builder.build();
        let reader = MessageReader::parse(&bytes).unwrap();
        let body = reader.read_body().unwrap();
        assert_eq!(body[0], Value::String("io.example.Test".to_string()));
        assert_eq!(body[1], Value::Uint32(NAME_FLAG_DO_NOT_QUEUE));
    }
}
