//! The basic send/receive primitives over a connected unix socket.
//!
//! Grounded in the teacher's `connection::ll_conn`: a [`SendConn`] and
//! [`RecvConn`] half, joined into a [`DuplexConn`] that owns both. Unlike the
//! teacher, there is no unix-fd passing here (out of scope for this crate),
//! so sending is a plain `write_all` and receiving needs no control-message
//! bookkeeping — both halves can be built directly on `std::os::unix::net::UnixStream`.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Instant;

use super::{auth, calc_timeout_left, BusAddress, Timeout};
use crate::error::{Error, TransportError};
use crate::wire::message::{header_fields_len, parse_fixed_header, MessageBuilder, MessageReader};

type Result<T> = std::result::Result<T, Error>;

/// The write half: owns the socket, a scratch buffer, and serial allocation.
#[derive(Debug)]
pub struct SendConn {
    stream: UnixStream,
    buf: Vec<u8>,
    next_serial: u32,
}

/// The read half: owns the socket and the "bytes still due" reassembly
/// buffer described by the stream reassembly rule — `msg_buf_in` accumulates
/// raw bytes until [`RecvConn::bytes_needed_for_current_message`] says a
/// complete message is present.
pub struct RecvConn {
    stream: UnixStream,
    msg_buf_in: Vec<u8>,
}

pub struct DuplexConn {
    pub send: SendConn,
    pub recv: RecvConn,
    /// The `guid` key from the address this connection was opened with, if
    /// any — parsed and retained per §6, not interpreted.
    pub guid: Option<String>,
}

impl SendConn {
    /// The next serial, without consuming it. Serials wrap at 2^31 rather
    /// than overflowing a u32, per the chosen resolution for serial reuse.
    pub fn alloc_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = if serial >= (1u32 << 31) {
            1
        } else {
            serial + 1
        };
        serial
    }

    fn set_write_timeout(&self, timeout: Timeout) -> Result<Option<std::time::Duration>> {
        let old = self.stream.write_timeout().map_err(TransportError::Io)?;
        match timeout {
            Timeout::Duration(d) => self.stream.set_write_timeout(Some(d)),
            Timeout::Infinite => self.stream.set_write_timeout(None),
            Timeout::Nonblock => self.stream.set_nonblocking(true),
        }
        .map_err(TransportError::Io)?;
        Ok(old)
    }

    /// Sends `builder` after stamping it with a freshly allocated serial and
    /// returns that serial.
    pub fn send(&mut self, builder: &mut MessageBuilder, timeout: Timeout) -> Result<u32> {
        let serial = self.alloc_serial();
        builder.serial = serial;
        self.buf.clear();
        self.buf.extend_from_slice(&builder.build());
        log::trace!(
            "sending serial={} kind={:?} member={:?}",
            serial,
            builder.typ,
            builder.member
        );

        let old_timeout = self.set_write_timeout(timeout)?;
        let result = self.stream.write_all(&self.buf).map_err(TransportError::Io);
        self.stream.set_nonblocking(false).map_err(TransportError::Io)?;
        self.stream
            .set_write_timeout(old_timeout)
            .map_err(TransportError::Io)?;
        result?;
        Ok(serial)
    }
}

impl RecvConn {
    /// How many bytes the buffer needs to hold before a full message can be
    /// parsed out of it: 16 bytes (fixed header + fields length) at minimum,
    /// then the exact byte count once the fixed header is available.
    fn bytes_needed_for_current_message(&self) -> Result<usize> {
        if self.msg_buf_in.len() < crate::wire::message::HEADER_LEN + 4 {
            return Ok(crate::wire::message::HEADER_LEN + 4);
        }
        let fixed = parse_fixed_header(&self.msg_buf_in).map_err(Error::Protocol)?;
        let fields_len = header_fields_len(&self.msg_buf_in).map_err(Error::Protocol)?;
        let header_total = crate::wire::message::HEADER_LEN + 4 + fields_len as usize;
        let padded = (header_total + 7) / 8 * 8;
        Ok(padded + fixed.body_len as usize)
    }

    fn buffer_contains_whole_message(&self) -> Result<bool> {
        if self.msg_buf_in.len() < crate::wire::message::HEADER_LEN + 4 {
            return Ok(false);
        }
        Ok(self.msg_buf_in.len() >= self.bytes_needed_for_current_message()?)
    }

    fn set_read_timeout(&self, timeout: Timeout) -> Result<Option<std::time::Duration>> {
        let old = self.stream.read_timeout().map_err(TransportError::Io)?;
        match timeout {
            Timeout::Duration(d) => self.stream.set_read_timeout(Some(d)),
            Timeout::Infinite => self.stream.set_read_timeout(None),
            Timeout::Nonblock => self.stream.set_nonblocking(true),
        }
        .map_err(TransportError::Io)?;
        Ok(old)
    }

    /// Reads once, growing `msg_buf_in` by whatever arrived, up to the
    /// number of bytes still needed for the current message.
    fn refill_buffer(&mut self, max_total: usize, timeout: Timeout) -> Result<()> {
        let to_read = max_total.saturating_sub(self.msg_buf_in.len());
        const BUFSIZE: usize = 4096;
        let mut tmp = [0u8; BUFSIZE];
        let slice = &mut tmp[..usize::min(to_read, BUFSIZE)];

        let old_timeout = self.set_read_timeout(timeout)?;
        let result = self.stream.read(slice);
        self.stream.set_nonblocking(false).map_err(TransportError::Io)?;
        self.stream.set_read_timeout(old_timeout).map_err(TransportError::Io)?;

        let n = match result {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Err(Error::Timeout),
            Err(e) => return Err(TransportError::Io(e).into()),
        };
        if n == 0 {
            return Err(TransportError::UnexpectedClose.into());
        }
        self.msg_buf_in.extend_from_slice(&slice[..n]);
        log::trace!(
            "reassembly buffer grew by {} bytes, now {}/{} for the current message",
            n,
            self.msg_buf_in.len(),
            max_total
        );
        Ok(())
    }

    /// Blocks until one complete message is buffered, then parses and
    /// removes it from `msg_buf_in`.
    pub fn get_next_message(&mut self, timeout: Timeout) -> Result<MessageReader> {
        let start = Instant::now();
        while !self.buffer_contains_whole_message()? {
            let needed = self.bytes_needed_for_current_message()?;
            self.refill_buffer(needed, calc_timeout_left(&start, timeout)?)?;
        }
        let total = self.bytes_needed_for_current_message()?;
        let message = MessageReader::parse(&self.msg_buf_in[..total]).map_err(Error::Protocol)?;
        self.msg_buf_in.drain(..total);
        log::trace!(
            "received serial={} kind={:?} member={:?}",
            message.serial,
            message.typ,
            message.member
        );
        Ok(message)
    }
}

impl DuplexConn {
    /// Connects to `addr`, runs the SASL handshake, and returns a connection
    /// ready to exchange binary messages (the caller still needs to send the
    /// `Hello` call themselves — see [`crate::connection::rpc::Connection`]).
    pub fn connect_to_bus(addr: BusAddress, mechanisms: &[auth::Mechanism]) -> Result<DuplexConn> {
        let fd = nix::sys::socket::socket(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            nix::sys::socket::SockFlag::empty(),
            None,
        )
        .map_err(TransportError::from)?;
        nix::sys::socket::connect(fd.as_raw_fd(), &addr.addr).map_err(TransportError::from)?;
        let mut stream = UnixStream::from(fd);

        auth::handshake(&mut stream, mechanisms)?;

        let recv_stream = stream.try_clone().map_err(TransportError::Io)?;
        Ok(DuplexConn {
            send: SendConn {
                stream,
                buf: Vec::new(),
                next_serial: 1,
            },
            recv: RecvConn {
                stream: recv_stream,
                msg_buf_in: Vec::new(),
            },
            guid: addr.guid,
        })
    }
}

impl AsRawFd for SendConn {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl AsRawFd for RecvConn {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl AsRawFd for DuplexConn {
    fn as_raw_fd(&self) -> RawFd {
        self.send.as_raw_fd()
    }
}

/// A `DuplexConn` wired to a local socketpair, for tests in this module and
/// in [`super::rpc`] that need a real `Connection` without a live bus.
#[cfg(test)]
pub(crate) fn test_paired_conns() -> (DuplexConn, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    let conn = DuplexConn {
        send: SendConn {
            stream: a.try_clone().unwrap(),
            buf: Vec::new(),
            next_serial: 1,
        },
        recv: RecvConn {
            stream: a,
            msg_buf_in: Vec::new(),
        },
        guid: None,
    };
    (conn, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::MessageType;

    fn paired_conns() -> (DuplexConn, UnixStream) {
        test_paired_conns()
    }

    #[test]
    fn send_then_receive_round_trips_a_message() {
        let (mut conn, mut peer) = paired_conns();
        let mut builder = MessageBuilder::new(MessageType::Signal, 0);
        builder.path = Some("/a".to_string());
        builder.interface = Some("a.b".to_string());
        builder.member = Some("M".to_string());
        conn.send.send(&mut builder, Timeout::Infinite).unwrap();

        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).unwrap();
        let reader = MessageReader::parse(&buf[..n]).unwrap();
        assert_eq!(reader.member.as_deref(), Some("M"));
    }

    #[test]
    fn reassembly_handles_a_message_split_across_reads() {
        let (mut conn, mut peer) = paired_conns();
        let mut builder = MessageBuilder::new(MessageType::Signal, 0);
        builder.path = Some("/a".to_string());
        builder.interface = Some("a.b".to_string());
        builder.member = Some("M".to_string());
        builder.body_signature = Some("s".to_string());
        let codecs = crate::codec::Codec::compile_all("s").unwrap();
        let mut body = crate::wire::cursor::WriteCursor::new();
        codecs[0]
            .marshal(&mut body, &crate::value::Value::String("hello world".into()))
            .unwrap();
        builder.body = body.into_inner();

        let bytes = builder.build();
        std::thread::spawn(move || {
            for chunk in bytes.chunks(3) {
                peer.write_all(chunk).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });

        let msg = conn.recv.get_next_message(Timeout::Duration(std::time::Duration::from_secs(2))).unwrap();
        assert_eq!(msg.member.as_deref(), Some("M"));
        assert_eq!(
            msg.read_body().unwrap(),
            vec![crate::value::Value::String("hello world".into())]
        );
    }

    #[test]
    fn serial_allocation_wraps_at_2_31() {
        let (mut conn, _peer) = paired_conns();
        conn.send.next_serial = 1u32 << 31;
        assert_eq!(conn.send.alloc_serial(), 1u32 << 31);
        assert_eq!(conn.send.alloc_serial(), 1);
    }
}
