//! The call/reply/signal-dispatching connection built on top of
//! [`super::transport`] — this is what callers actually construct and hold.
//!
//! Grounded in the teacher's `connection::rpc_conn::RpcConn`: incoming
//! messages get sorted into three queues (pending call responses keyed by
//! `REPLY_SERIAL`, signals, and incoming calls) by [`Connection::refill_once`],
//! and a caller blocks on whichever queue it cares about.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use super::transport::DuplexConn;
use super::{auth, calc_timeout_left, get_session_bus_path, get_system_bus_path, BusAddress, Timeout};
use crate::error::{CallError, Error};
use crate::wire::message::{MessageBuilder, MessageReader, MessageType};

type Result<T> = std::result::Result<T, Error>;

/// A client-side connection to a bus: one TCP-like duplex stream plus the
/// bookkeeping needed to match replies to the calls that triggered them.
pub struct Connection {
    conn: DuplexConn,
    unique_name: String,
    responses: HashMap<u32, MessageReader>,
    signals: VecDeque<MessageReader>,
    calls: VecDeque<MessageReader>,
    /// Serials a caller has abandoned via [`Connection::cancel_call`]; a
    /// reply that later arrives for one of these is dropped rather than
    /// filed into `responses`, per §4.4/§5.
    cancelled: HashSet<u32>,
    /// Set once a transport/protocol/auth error has torn down the socket —
    /// every further operation fails fast with [`Error::ConnectionClosed`]
    /// instead of touching the dead stream again.
    closed: bool,
}

impl Connection {
    /// Connects to the session bus, runs the handshake, and sends `Hello`.
    pub fn session(timeout: Timeout) -> Result<Self> {
        Self::connect(get_session_bus_path()?, timeout)
    }

    /// Connects to the system bus, runs the handshake, and sends `Hello`.
    pub fn system(timeout: Timeout) -> Result<Self> {
        Self::connect(get_system_bus_path()?, timeout)
    }

    pub fn connect(addr: BusAddress, timeout: Timeout) -> Result<Self> {
        let conn = DuplexConn::connect_to_bus(
            addr,
            &[auth::Mechanism::External, auth::Mechanism::Anonymous],
        )?;
        let mut this = Connection {
            conn,
            unique_name: String::new(),
            responses: HashMap::new(),
            signals: VecDeque::new(),
            calls: VecDeque::new(),
            cancelled: HashSet::new(),
            closed: false,
        };

        let start = Instant::now();
        let mut hello = crate::standard_messages::hello();
        let serial = this
            .conn
            .send
            .send(&mut hello, calc_timeout_left(&start, timeout)?)?;
        let reply = this.wait_response(serial, calc_timeout_left(&start, timeout)?)?;
        let values = reply.read_body().map_err(Error::Protocol)?;
        this.unique_name = match values.first() {
            Some(crate::value::Value::String(s)) => s.clone(),
            _ => return Err(Error::UnexpectedMessageKind),
        };
        log::info!("assigned unique name {}", this.unique_name);
        Ok(this)
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// The `guid` key from the address this connection was opened with, if
    /// the address carried one.
    pub fn guid(&self) -> Option<&str> {
        self.conn.guid.as_deref()
    }

    /// The next serial this connection will use.
    pub fn alloc_serial(&mut self) -> u32 {
        self.conn.send.alloc_serial()
    }

    /// Sends `builder`, stamping it with a fresh serial, and returns that
    /// serial so the caller can later [`Connection::wait_response`] on it.
    pub fn send(&mut self, builder: &mut MessageBuilder, timeout: Timeout) -> Result<u32> {
        self.fail_fast_if_closed()?;
        self.conn.send.send(builder, timeout)
    }

    fn fail_fast_if_closed(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Abandons interest in `serial`'s reply. If the reply already arrived it
    /// is returned now; otherwise the serial is marked cancelled so a later
    /// reply is silently dropped instead of filed into `responses`, and this
    /// call resolves immediately with [`Error::Cancelled`] rather than
    /// blocking further, per §4.4/§5.
    pub fn cancel_call(&mut self, serial: u32) -> Result<MessageReader> {
        if let Some(msg) = self.try_get_response(serial) {
            return as_reply(msg);
        }
        self.cancelled.insert(serial);
        Err(Error::Cancelled)
    }

    /// Sends a method call and blocks for its reply.
    pub fn call(&mut self, builder: &mut MessageBuilder, timeout: Timeout) -> Result<MessageReader> {
        let start = Instant::now();
        let serial = self.send(builder, calc_timeout_left(&start, timeout)?)?;
        self.wait_response(serial, calc_timeout_left(&start, timeout)?)
    }

    pub fn try_get_response(&mut self, serial: u32) -> Option<MessageReader> {
        self.responses.remove(&serial)
    }

    /// Blocks until the reply to `serial` has arrived, turning an `Error`
    /// message kind into [`Error::Call`].
    pub fn wait_response(&mut self, serial: u32, timeout: Timeout) -> Result<MessageReader> {
        self.fail_fast_if_closed()?;
        let start = Instant::now();
        loop {
            if let Some(msg) = self.try_get_response(serial) {
                return as_reply(msg);
            }
            self.refill_once(calc_timeout_left(&start, timeout)?)?;
        }
    }

    pub fn try_get_signal(&mut self) -> Option<MessageReader> {
        self.signals.pop_front()
    }

    pub fn wait_signal(&mut self, timeout: Timeout) -> Result<MessageReader> {
        self.fail_fast_if_closed()?;
        let start = Instant::now();
        loop {
            if let Some(msg) = self.try_get_signal() {
                return Ok(msg);
            }
            self.refill_once(calc_timeout_left(&start, timeout)?)?;
        }
    }

    pub fn try_get_call(&mut self) -> Option<MessageReader> {
        self.calls.pop_front()
    }

    pub fn wait_call(&mut self, timeout: Timeout) -> Result<MessageReader> {
        self.fail_fast_if_closed()?;
        let start = Instant::now();
        loop {
            if let Some(msg) = self.try_get_call() {
                return Ok(msg);
            }
            self.refill_once(calc_timeout_left(&start, timeout)?)?;
        }
    }

    /// Reads one incoming message off the wire and files it into the
    /// matching queue. On a transport error every pending call is evicted
    /// (there is no way to tell which one the broken connection affected).
    pub fn refill_once(&mut self, timeout: Timeout) -> Result<MessageType> {
        self.fail_fast_if_closed()?;
        let msg = match self.conn.recv.get_next_message(timeout) {
            Ok(msg) => msg,
            Err(Error::Timeout) => return Err(Error::Timeout),
            Err(e) => {
                self.fail_all_pending();
                return Err(e);
            }
        };
        let typ = msg.typ;
        match typ {
            MessageType::Call => self.calls.push_back(msg),
            MessageType::Signal => self.signals.push_back(msg),
            MessageType::Reply | MessageType::Error => {
                if let Some(serial) = msg.reply_serial {
                    // A late reply for a call its owner already cancelled is
                    // dropped rather than filed, per §4.4/§5.
                    if !self.cancelled.remove(&serial) {
                        self.responses.insert(serial, msg);
                    }
                }
            }
        }
        Ok(typ)
    }

    /// Drains whatever is already buffered without blocking, filing each
    /// message into its queue. Stops at the first would-block/timeout.
    pub fn refill_all(&mut self) -> Result<()> {
        loop {
            match self.refill_once(Timeout::Nonblock) {
                Ok(_) => continue,
                Err(Error::Timeout) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn fail_all_pending(&mut self) {
        self.closed = true;
        self.responses.clear();
        self.cancelled.clear();
    }
}

fn as_reply(msg: MessageReader) -> Result<MessageReader> {
    if msg.typ == MessageType::Error {
        let body = msg.body.clone();
        let signature = msg.body_signature.clone().unwrap_or_default();
        let name = msg.error_name.clone().unwrap_or_default();
        return Err(Error::Call(CallError {
            name,
            body,
            signature,
        }));
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::transport::test_paired_conns;

    fn test_connection() -> (Connection, std::os::unix::net::UnixStream) {
        let (conn, peer) = test_paired_conns();
        let this = Connection {
            conn,
            unique_name: ":1.0".to_string(),
            responses: HashMap::new(),
            signals: VecDeque::new(),
            calls: VecDeque::new(),
            cancelled: HashSet::new(),
            closed: false,
        };
        (this, peer)
    }

    #[test]
    fn cancel_call_drops_a_late_reply_instead_of_filing_it() {
        let (mut conn, mut peer) = test_connection();
        let serial = conn.send(&mut MessageBuilder::new(MessageType::Call, 0), Timeout::Infinite).unwrap();
        assert!(matches!(conn.cancel_call(serial).unwrap_err(), Error::Cancelled));

        let mut reply = MessageBuilder::new(MessageType::Reply, 0);
        reply.reply_serial = Some(serial);
        let bytes = reply.build();
        use std::io::Write;
        peer.write_all(&bytes).unwrap();

        conn.refill_once(Timeout::Infinite).unwrap();
        assert!(conn.try_get_response(serial).is_none());
    }

    #[test]
    fn cancel_call_returns_an_already_arrived_reply() {
        let (mut conn, _peer) = test_connection();
        let serial = 7;
        let mut reply = MessageBuilder::new(MessageType::Reply, 0);
        reply.reply_serial = Some(serial);
        let bytes = reply.build();
        let msg = MessageReader::parse(&bytes).unwrap();
        conn.responses.insert(serial, msg);

        let got = conn.cancel_call(serial).unwrap();
        assert_eq!(got.reply_serial, Some(serial));
    }

    #[test]
    fn a_closed_connection_fails_fast_instead_of_touching_the_socket() {
        let (mut conn, peer) = test_connection();
        drop(peer);

        let err = conn.refill_once(Timeout::Infinite).unwrap_err();
        assert!(!matches!(err, Error::Timeout));
        assert!(matches!(
            conn.send(&mut MessageBuilder::new(MessageType::Call, 0), Timeout::Infinite)
                .unwrap_err(),
            Error::ConnectionClosed
        ));
    }

    #[test]
    fn as_reply_turns_error_messages_into_call_error() {
        let mut builder = MessageBuilder::new(MessageType::Error, 1);
        builder.error_name = Some("org.freedesktop.DBus.Error.Failed".to_string());
        builder.reply_serial = Some(5);
        let bytes = builder.build();
        let reader = MessageReader::parse(&bytes).unwrap();
        let err = as_reply(reader).unwrap_err();
        match err {
            Error::Call(CallError { name, .. }) => {
                assert_eq!(name, "org.freedesktop.DBus.Error.Failed");
            }
            other => panic!("expected Error::Call, got {:?}", other),
        }
    }

    #[test]
    fn as_reply_passes_through_non_error_messages() {
        let mut builder = MessageBuilder::new(MessageType::Reply, 1);
        builder.reply_serial = Some(5);
        let bytes = builder.build();
        let reader = MessageReader::parse(&bytes).unwrap();
        assert!(as_reply(reader).is_ok());
    }
}
