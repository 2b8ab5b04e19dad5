//! Consuming introspection XML (the document a `org.freedesktop.DBus.Introspectable.Introspect`
//! call returns) into method/signal/property descriptors.
//!
//! Grounded in `tokio-dbus-xml`'s parser: a stack of element builders driven
//! by `xmlparser::Tokenizer`, one state pushed per `ElementStart` and popped
//! (then folded into its parent) per matching `ElementEnd`. Struct-typed
//! arguments get their codec compiled lazily, the first time a caller asks
//! for it, since most introspected methods are never actually invoked.

use std::cell::OnceCell;

use xmlparser::{ElementEnd, Token, Tokenizer};

use crate::codec::Codec;
use crate::error::IntrospectError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

#[derive(Clone, Debug)]
pub struct Argument {
    pub name: Option<String>,
    pub signature: String,
    pub direction: Direction,
}

/// A method or signal argument list's compiled codecs, built once on first
/// use and cached for the descriptor's lifetime.
struct LazyCodecs {
    signature: String,
    compiled: OnceCell<Result<Vec<Codec>, IntrospectError>>,
}

impl LazyCodecs {
    fn new(signature: String) -> Self {
        LazyCodecs {
            signature,
            compiled: OnceCell::new(),
        }
    }

    fn get(&self) -> Result<&[Codec], IntrospectError> {
        let result = self
            .compiled
            .get_or_init(|| Codec::compile_all(&self.signature).map_err(IntrospectError::from));
        result.as_deref().map_err(Clone::clone)
    }
}

impl std::fmt::Debug for LazyCodecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyCodecs")
            .field("signature", &self.signature)
            .finish()
    }
}

#[derive(Debug)]
pub struct Method {
    pub name: String,
    pub arguments: Vec<Argument>,
    in_codecs: LazyCodecs,
    out_codecs: LazyCodecs,
}

impl Method {
    /// The compiled codecs for this method's `in` arguments, in declaration order.
    pub fn input_codecs(&self) -> Result<&[Codec], IntrospectError> {
        self.in_codecs.get()
    }

    /// The compiled codecs for this method's `out` arguments, in declaration order.
    pub fn output_codecs(&self) -> Result<&[Codec], IntrospectError> {
        self.out_codecs.get()
    }
}

#[derive(Debug)]
pub struct Signal {
    pub name: String,
    pub arguments: Vec<Argument>,
    codecs: LazyCodecs,
}

impl Signal {
    pub fn codecs(&self) -> Result<&[Codec], IntrospectError> {
        self.codecs.get()
    }
}

#[derive(Debug)]
pub struct Property {
    pub name: String,
    pub signature: String,
    pub access: Access,
    codec: LazyCodecs,
}

impl Property {
    pub fn is_readable(&self) -> bool {
        self.access.readable()
    }

    pub fn is_writable(&self) -> bool {
        self.access.writable()
    }

    pub fn codec(&self) -> Result<&Codec, IntrospectError> {
        self.codec.get().map(|c| &c[0])
    }
}

#[derive(Debug, Default)]
pub struct Interface {
    pub name: String,
    pub methods: Vec<Method>,
    pub signals: Vec<Signal>,
    pub properties: Vec<Property>,
}

impl Interface {
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Default)]
pub struct Node {
    pub name: Option<String>,
    pub interfaces: Vec<Interface>,
    /// Child node names referenced by `<node name="..."/>`, without their
    /// own nested introspection data (the real daemon expects a follow-up
    /// `Introspect` call on the child's own path for that).
    pub children: Vec<String>,
}

impl Node {
    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}

#[derive(Default)]
struct ArgumentBuilder {
    name: Option<String>,
    ty: Option<String>,
    direction: Option<Direction>,
}

#[derive(Default)]
struct MethodBuilder {
    name: Option<String>,
    arguments: Vec<Argument>,
}

#[derive(Default)]
struct SignalBuilder {
    name: Option<String>,
    arguments: Vec<Argument>,
}

#[derive(Default)]
struct PropertyBuilder {
    name: Option<String>,
    ty: Option<String>,
    access: Option<Access>,
}

#[derive(Default)]
struct InterfaceBuilder {
    name: Option<String>,
    methods: Vec<Method>,
    signals: Vec<Signal>,
    properties: Vec<Property>,
}

#[derive(Default)]
struct NodeBuilder {
    name: Option<String>,
    interfaces: Vec<Interface>,
    children: Vec<String>,
}

enum State {
    Node(NodeBuilder),
    ChildNode(String),
    Interface(InterfaceBuilder),
    Method(MethodBuilder),
    Signal(SignalBuilder),
    Property(PropertyBuilder),
    Argument(ArgumentBuilder),
    /// An element recognized but not represented in the descriptor model,
    /// e.g. `<annotation>` or `<doc>` — skipped, including its subtree.
    Ignored(String, usize),
}

fn method_from_builder(b: MethodBuilder) -> Result<Method, IntrospectError> {
    let name = b.name.ok_or(IntrospectError::MissingAttribute(
        "method".to_string(),
        "name",
    ))?;
    let in_sig: String = b
        .arguments
        .iter()
        .filter(|a| a.direction == Direction::In)
        .map(|a| a.signature.as_str())
        .collect();
    let out_sig: String = b
        .arguments
        .iter()
        .filter(|a| a.direction == Direction::Out)
        .map(|a| a.signature.as_str())
        .collect();
    Ok(Method {
        name,
        arguments: b.arguments,
        in_codecs: LazyCodecs::new(in_sig),
        out_codecs: LazyCodecs::new(out_sig),
    })
}

fn signal_from_builder(b: SignalBuilder) -> Result<Signal, IntrospectError> {
    let name = b.name.ok_or(IntrospectError::MissingAttribute(
        "signal".to_string(),
        "name",
    ))?;
    let sig: String = b.arguments.iter().map(|a| a.signature.as_str()).collect();
    Ok(Signal {
        name,
        arguments: b.arguments,
        codecs: LazyCodecs::new(sig),
    })
}

fn property_from_builder(b: PropertyBuilder) -> Result<Property, IntrospectError> {
    let name = b.name.ok_or(IntrospectError::MissingAttribute(
        "property".to_string(),
        "name",
    ))?;
    let signature = b.ty.ok_or(IntrospectError::MissingAttribute(
        "property".to_string(),
        "type",
    ))?;
    let access = b.access.unwrap_or(Access::Read);
    Ok(Property {
        codec: LazyCodecs::new(signature.clone()),
        name,
        signature,
        access,
    })
}

fn argument_from_builder(
    b: ArgumentBuilder,
    default_direction: Direction,
) -> Result<Argument, IntrospectError> {
    let signature = b.ty.ok_or(IntrospectError::MissingAttribute(
        "arg".to_string(),
        "type",
    ))?;
    Ok(Argument {
        name: b.name,
        signature,
        direction: b.direction.unwrap_or(default_direction),
    })
}

/// Parses a complete `<node>` introspection document.
pub fn parse(xml: &str) -> Result<Node, IntrospectError> {
    let mut stack: Vec<State> = Vec::new();
    let mut root = NodeBuilder::default();
    let mut seen_root = false;

    for token in Tokenizer::from(xml) {
        let token = token.map_err(|e| IntrospectError::Xml(0, e.to_string()))?;
        match token {
            Token::ElementStart { local, .. } => {
                let name = local.as_str().to_string();
                if let Some(State::Ignored(_, depth)) = stack.last_mut() {
                    *depth += 1;
                    continue;
                }
                let top = stack.last();
                let next = match (top, name.as_str()) {
                    (None, "node") => {
                        seen_root = true;
                        State::Node(NodeBuilder::default())
                    }
                    (Some(State::Node(_)), "interface") => State::Interface(InterfaceBuilder::default()),
                    (Some(State::Node(_)), "node") => State::ChildNode(String::new()),
                    (Some(State::Interface(_)), "method") => State::Method(MethodBuilder::default()),
                    (Some(State::Interface(_)), "signal") => State::Signal(SignalBuilder::default()),
                    (Some(State::Interface(_)), "property") => {
                        State::Property(PropertyBuilder::default())
                    }
                    (Some(State::Method(_) | State::Signal(_)), "arg") => {
                        State::Argument(ArgumentBuilder::default())
                    }
                    (Some(_), "annotation" | "doc") => State::Ignored(name.clone(), 0),
                    (parent, other) => {
                        return Err(IntrospectError::UnexpectedElement(
                            other.to_string(),
                            parent_name(parent),
                        ))
                    }
                };
                stack.push(next);
            }
            Token::Attribute { local, value, .. } => {
                let value = value.as_str();
                match stack.last_mut() {
                    Some(State::ChildNode(n)) if local.as_str() == "name" => {
                        *n = value.to_string();
                    }
                    Some(State::Interface(b)) if local.as_str() == "name" => {
                        b.name = Some(value.to_string())
                    }
                    Some(State::Method(b)) if local.as_str() == "name" => {
                        b.name = Some(value.to_string())
                    }
                    Some(State::Signal(b)) if local.as_str() == "name" => {
                        b.name = Some(value.to_string())
                    }
                    Some(State::Property(b)) if local.as_str() == "name" => {
                        b.name = Some(value.to_string())
                    }
                    Some(State::Property(b)) if local.as_str() == "type" => {
                        b.ty = Some(value.to_string())
                    }
                    Some(State::Property(b)) if local.as_str() == "access" => {
                        b.access = Some(match value {
                            "read" => Access::Read,
                            "write" => Access::Write,
                            "readwrite" => Access::ReadWrite,
                            other => return Err(IntrospectError::UnknownAccess(other.to_string())),
                        });
                    }
                    Some(State::Argument(b)) if local.as_str() == "name" => {
                        b.name = Some(value.to_string())
                    }
                    Some(State::Argument(b)) if local.as_str() == "type" => {
                        b.ty = Some(value.to_string())
                    }
                    Some(State::Argument(b)) if local.as_str() == "direction" => {
                        b.direction = Some(match value {
                            "in" => Direction::In,
                            "out" => Direction::Out,
                            other => {
                                return Err(IntrospectError::UnknownDirection(other.to_string()))
                            }
                        });
                    }
                    _ => {}
                }
            }
            Token::ElementEnd { end, .. } => {
                if let ElementEnd::Open = end {
                    continue;
                }
                if let Some(State::Ignored(_, depth)) = stack.last_mut() {
                    if *depth > 0 {
                        *depth -= 1;
                        continue;
                    }
                }
                let Some(top) = stack.pop() else {
                    return Err(IntrospectError::UnexpectedEof);
                };
                match (stack.last_mut(), top) {
                    (None, State::Node(n)) => {
                        root = n;
                    }
                    (Some(State::Node(n)), State::Interface(b)) => {
                        n.interfaces.push(interface_from_builder(b)?);
                    }
                    (Some(State::Node(n)), State::ChildNode(child_name)) => {
                        n.children.push(child_name);
                    }
                    (Some(State::Interface(i)), State::Method(b)) => {
                        i.methods.push(method_from_builder(b)?);
                    }
                    (Some(State::Interface(i)), State::Signal(b)) => {
                        i.signals.push(signal_from_builder(b)?);
                    }
                    (Some(State::Interface(i)), State::Property(b)) => {
                        i.properties.push(property_from_builder(b)?);
                    }
                    (Some(State::Method(m)), State::Argument(b)) => {
                        m.arguments.push(argument_from_builder(b, Direction::In)?);
                    }
                    (Some(State::Signal(s)), State::Argument(b)) => {
                        s.arguments.push(argument_from_builder(b, Direction::Out)?);
                    }
                    (_, State::Ignored(_, _)) => {}
                    (parent, child) => {
                        return Err(IntrospectError::MismatchedClose(format!(
                            "{}/{}",
                            parent_name(parent.map(|s| &*s)),
                            state_name(&child)
                        )))
                    }
                }
            }
            _ => {}
        }
    }

    if !seen_root || !stack.is_empty() {
        return Err(IntrospectError::UnexpectedEof);
    }

    Ok(Node {
        name: root.name,
        interfaces: root.interfaces,
        children: root.children,
    })
}

fn interface_from_builder(b: InterfaceBuilder) -> Result<Interface, IntrospectError> {
    Ok(Interface {
        name: b
            .name
            .ok_or(IntrospectError::MissingAttribute("interface".to_string(), "name"))?,
        methods: b.methods,
        signals: b.signals,
        properties: b.properties,
    })
}

fn parent_name(state: Option<&State>) -> String {
    match state {
        Some(s) => state_name(s),
        None => "<root>".to_string(),
    }
}

fn state_name(state: &State) -> String {
    match state {
        State::Node(_) => "node",
        State::ChildNode(_) => "node",
        State::Interface(_) => "interface",
        State::Method(_) => "method",
        State::Signal(_) => "signal",
        State::Property(_) => "property",
        State::Argument(_) => "arg",
        State::Ignored(name, _) => name,
    }
    .to_string()
}
