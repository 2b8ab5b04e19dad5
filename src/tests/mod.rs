//! Cross-cutting integration tests that exercise more than one module at
//! once — unit tests inside each module cover that module's own invariants.

use crate::codec::Codec;
use crate::value::Value;
use crate::wire::cursor::WriteCursor;
use crate::wire::message::{MessageBuilder, MessageReader, MessageType};

/// Scenario F from the marshalling properties: a method call whose body is a
/// struct containing an array of structs, sent little-endian and read back
/// big-endian-compiled-codec-agnostic (the codec doesn't care about byte
/// order, only the cursor does).
#[test]
fn nested_struct_array_round_trips_through_a_full_message() {
    let sig = "a(su)";
    let codecs = Codec::compile_all(sig).unwrap();
    let value = Value::Array(vec![
        Value::Struct(vec![Value::String("first".into()), Value::Uint32(1)]),
        Value::Struct(vec![Value::String("second".into()), Value::Uint32(2)]),
    ]);

    let mut body = WriteCursor::new();
    codecs[0].marshal(&mut body, &value).unwrap();

    let mut builder = MessageBuilder::new(MessageType::Signal, 0);
    builder.path = Some("/io/killing/spark".to_string());
    builder.interface = Some("io.killing.spark".to_string());
    builder.member = Some("Batch".to_string());
    builder.body_signature = Some(sig.to_string());
    builder.body = body.into_inner();

    let bytes = builder.build();
    let reader = MessageReader::parse(&bytes).unwrap();
    let decoded = reader.read_body().unwrap();
    assert_eq!(decoded, vec![value]);
}

/// A round trip through the connection-less plumbing a real `Connection`
/// uses internally: build a call, parse it back as a service would, and
/// build the matching error reply via `standard_messages`.
#[test]
fn unanswerable_call_produces_a_well_formed_error_reply() {
    let mut call = MessageBuilder::new(MessageType::Call, 0);
    call.path = Some("/io/killing/spark".to_string());
    call.interface = Some("io.killing.spark".to_string());
    call.member = Some("DoesNotExist".to_string());
    call.sender = Some(":1.42".to_string());
    let call_bytes = call.build();

    let incoming = MessageReader::parse(&call_bytes).unwrap();
    let mut reply = crate::standard_messages::unknown_method(&incoming);
    reply.serial = 7;
    let reply_bytes = reply.build();

    let reply_reader = MessageReader::parse(&reply_bytes).unwrap();
    assert_eq!(reply_reader.typ, MessageType::Error);
    assert_eq!(reply_reader.reply_serial, Some(0));
    assert_eq!(reply_reader.destination.as_deref(), Some(":1.42"));
}

/// Introspection XML for a service feeds straight into the same codecs the
/// wire layer uses, so a method's declared signature and its actual call
/// arguments can be cross-checked.
#[test]
fn introspected_method_signature_matches_a_real_call_body() {
    let xml = r#"
        <node name="/io/killing/spark">
            <interface name="io.killing.spark">
                <method name="Concat">
                    <arg name="a" type="s" direction="in"/>
                    <arg name="b" type="s" direction="in"/>
                    <arg name="result" type="s" direction="out"/>
                </method>
            </interface>
        </node>
    "#;
    let node = crate::introspect::parse(xml).unwrap();
    let method = node.interface("io.killing.spark").unwrap().method("Concat").unwrap();

    let in_codecs = method.input_codecs().unwrap();
    assert_eq!(in_codecs.len(), 2);

    let mut call = MessageBuilder::new(MessageType::Call, 0);
    call.path = Some("/io/killing/spark".to_string());
    call.interface = Some("io.killing.spark".to_string());
    call.member = Some("Concat".to_string());
    let mut body = WriteCursor::new();
    in_codecs[0].marshal(&mut body, &Value::String("foo".into())).unwrap();
    in_codecs[1].marshal(&mut body, &Value::String("bar".into())).unwrap();
    call.body_signature = Some("ss".to_string());
    call.body = body.into_inner();

    let bytes = call.build();
    let reader = MessageReader::parse(&bytes).unwrap();
    assert_eq!(
        reader.read_body().unwrap(),
        vec![Value::String("foo".into()), Value::String("bar".into())]
    );
}
