//! The SASL-style text handshake D-Bus runs over the raw socket before any
//! binary message may be sent.
//!
//! Grounded in the line-based `AUTH`/`OK`/`BEGIN` exchange, adapted from an
//! async `BufReader`/`BufWriter` pair to the blocking `std::io::Read`/`Write`
//! this crate's transport uses.

use std::io::{Read, Write};

use crate::error::AuthError;

/// Which SASL mechanism to attempt. `External` authenticates as the local
/// unix uid and is what every real bus daemon expects; `Anonymous` exists for
/// test buses that allow it.
#[derive(Clone, Copy, Debug)]
pub enum Mechanism {
    External,
    Anonymous,
}

/// Runs the handshake over `stream` and leaves it ready for binary message
/// traffic (i.e. past `BEGIN`). `stream` must be freshly connected with
/// nothing written to it yet.
pub fn handshake<S: Read + Write>(
    stream: &mut S,
    mechanisms: &[Mechanism],
) -> Result<(), AuthError> {
    log::debug!("writing null byte");
    stream.write_all(&[0]).map_err(|_| AuthError::ClosedDuringHandshake)?;

    let mut last_err = AuthError::NoUsableMethod;
    for mechanism in mechanisms {
        let line = match mechanism {
            Mechanism::External => format!("AUTH EXTERNAL {}", external_param()),
            Mechanism::Anonymous => "AUTH ANONYMOUS ".to_string(),
        };
        log::debug!("C: {}", line);
        write_line(stream, &line)?;
        let reply = read_line(stream)?;
        log::debug!("S: {}", reply);
        if reply.starts_with("OK") {
            log::info!("authenticated via {:?}", mechanism);
            write_line(stream, "BEGIN")?;
            return Ok(());
        }
        if reply.starts_with("REJECTED") {
            log::debug!("{:?} rejected, trying next mechanism", mechanism);
            last_err = AuthError::NoUsableMethod;
            continue;
        }
        if reply.starts_with("ERROR") || reply.starts_with("DATA") {
            log::warn!("unexpected handshake reply: {}", reply);
            last_err = AuthError::MalformedHandshakeLine(reply);
            continue;
        }
        return Err(AuthError::MalformedHandshakeLine(reply));
    }
    Err(last_err)
}

/// Hex-encoded ASCII decimal uid, e.g. uid 1000 becomes the ASCII text
/// `"1000"` then that text's hex encoding — the format `AUTH EXTERNAL`
/// expects.
fn external_param() -> String {
    let uid = nix::unistd::Uid::current().as_raw();
    hex::encode(uid.to_string())
}

fn write_line<W: Write>(w: &mut W, line: &str) -> Result<(), AuthError> {
    w.write_all(line.as_bytes())
        .and_then(|_| w.write_all(b"\r\n"))
        .and_then(|_| w.flush())
        .map_err(|_| AuthError::ClosedDuringHandshake)
}

/// Reads one `\r\n`-terminated line, one byte at a time. The handshake is
/// the only line-based part of the protocol and only ever exchanges a
/// handful of short lines, so there is no need for a buffered reader here —
/// and using one would fight over `&mut S` with the writes on the same
/// stream.
fn read_line<R: Read>(r: &mut R) -> Result<String, AuthError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = r.read(&mut byte).map_err(|_| AuthError::ClosedDuringHandshake)?;
        if n == 0 {
            return Err(AuthError::ClosedDuringHandshake);
        }
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() > 4096 {
            return Err(AuthError::MalformedHandshakeLine(
                "handshake line exceeded 4096 bytes".to_string(),
            ));
        }
    }
    line.truncate(line.len() - 2);
    String::from_utf8(line).map_err(|_| AuthError::MalformedHandshakeLine("non-UTF8 line".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory duplex stream good enough to drive the handshake state
    /// machine in tests without a real socket.
    struct MockStream {
        to_server: Vec<u8>,
        from_server: VecDeque<u8>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = std::cmp::min(buf.len(), self.from_server.len());
            for (i, b) in self.from_server.drain(..n).enumerate() {
                buf[i] = b;
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.to_server.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn successful_external_handshake_sends_null_auth_and_begin() {
        let mut stream = MockStream {
            to_server: Vec::new(),
            from_server: b"OK 1234deadbeef\r\n".iter().copied().collect(),
        };
        handshake(&mut stream, &[Mechanism::External]).unwrap();
        assert_eq!(stream.to_server[0], 0);
        let sent = String::from_utf8(stream.to_server[1..].to_vec()).unwrap();
        assert!(sent.starts_with("AUTH EXTERNAL "));
        assert!(sent.trim_end().ends_with("BEGIN"));
    }

    #[test]
    fn rejected_mechanism_falls_through_to_next() {
        let mut stream = MockStream {
            to_server: Vec::new(),
            from_server: b"REJECTED EXTERNAL\r\nOK 1234\r\n"
                .iter()
                .copied()
                .collect(),
        };
        handshake(&mut stream, &[Mechanism::External, Mechanism::Anonymous]).unwrap();
        let sent = String::from_utf8(stream.to_server[1..].to_vec()).unwrap();
        assert!(sent.contains("AUTH EXTERNAL"));
        assert!(sent.contains("AUTH ANONYMOUS"));
    }

    #[test]
    fn all_mechanisms_rejected_is_an_error() {
        let mut stream = MockStream {
            to_server: Vec::new(),
            from_server: b"REJECTED\r\n".iter().copied().collect(),
        };
        assert!(handshake(&mut stream, &[Mechanism::External]).is_err());
    }

    #[test]
    fn closed_stream_during_handshake_is_an_error() {
        let mut stream = MockStream {
            to_server: Vec::new(),
            from_server: VecDeque::new(),
        };
        assert_eq!(
            handshake(&mut stream, &[Mechanism::External]),
            Err(AuthError::ClosedDuringHandshake)
        );
    }
}
