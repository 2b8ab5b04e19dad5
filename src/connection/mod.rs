//! Connecting to a bus and exchanging messages over it.
//!
//! * `auth` is the SASL-style text handshake run once, right after the
//!   socket connects.
//! * `transport` is the basic send/receive primitives over the raw unix
//!   socket, including stream reassembly.
//! * `rpc` is the call/reply/signal-dispatching connection built on top of
//!   `transport`, the piece most callers actually hold onto.

pub mod auth;
pub mod rpc;
pub mod transport;

use std::path::PathBuf;
use std::time;

use nix::sys::socket::UnixAddr;

use crate::error::Error;

type Result<T> = std::result::Result<T, Error>;

/// How long a blocking operation is allowed to wait.
///
/// There is no async runtime in this crate's dependency stack, so suspension
/// is expressed the way the teacher's connection layer expresses it: a
/// blocking call parameterized by one of these three choices, rather than a
/// `Future` a caller polls or awaits.
#[derive(Clone, Copy, Debug)]
pub enum Timeout {
    Infinite,
    Nonblock,
    Duration(time::Duration),
}

/// A resolved bus address: the socket address to connect to, plus whatever
/// trailing `key=value` pairs the address string carried that this client
/// doesn't act on. `guid` in particular is parsed and retained here (per
/// §6) rather than interpreted — nothing compares it against the `OK <guid>`
/// the server sends back during the handshake.
#[derive(Clone, Debug)]
pub struct BusAddress {
    pub addr: UnixAddr,
    pub guid: Option<String>,
}

fn parse_dbus_addr_str(addr: &str) -> Result<BusAddress> {
    let addr_parts: Vec<&str> = addr.split(',').collect();
    let first = addr_parts.first().copied().unwrap_or(addr);
    let guid = addr_parts
        .iter()
        .skip(1)
        .find_map(|kv| kv.strip_prefix("guid=").map(str::to_owned));

    let sock_addr = if let Some(path) = first.strip_prefix("unix:path=") {
        let p = PathBuf::from(path);
        if p.exists() {
            UnixAddr::new(&p).map_err(crate::error::TransportError::from)?
        } else {
            return Err(Error::PathDoesNotExist(path.to_owned()));
        }
    } else if let Some(path) = first.strip_prefix("unix:abstract=") {
        #[cfg(not(target_os = "linux"))]
        {
            let _ = path;
            return Err(Error::AddressTypeNotSupported(first.to_owned()));
        }
        #[cfg(target_os = "linux")]
        {
            UnixAddr::new_abstract(path.as_bytes()).map_err(crate::error::TransportError::from)?
        }
    } else {
        return Err(Error::AddressTypeNotSupported(first.to_owned()));
    };

    Ok(BusAddress {
        addr: sock_addr,
        guid,
    })
}

/// The session bus address from `$DBUS_SESSION_BUS_ADDRESS`.
pub fn get_session_bus_path() -> Result<BusAddress> {
    match std::env::var("DBUS_SESSION_BUS_ADDRESS") {
        Ok(envvar) => parse_dbus_addr_str(&envvar),
        Err(_) => Err(Error::NoAddressFound),
    }
}

/// The conventional system bus socket path.
pub fn get_system_bus_path() -> Result<BusAddress> {
    let ps = "/run/dbus/system_bus_socket";
    let p = PathBuf::from(ps);
    if p.exists() {
        Ok(BusAddress {
            addr: UnixAddr::new(&p).map_err(crate::error::TransportError::from)?,
            guid: None,
        })
    } else {
        Err(Error::PathDoesNotExist(ps.to_owned()))
    }
}

pub(crate) fn calc_timeout_left(start_time: &time::Instant, timeout: Timeout) -> Result<Timeout> {
    match timeout {
        Timeout::Duration(timeout) => {
            let elapsed = start_time.elapsed();
            if elapsed >= timeout {
                return Err(Error::Timeout);
            }
            Ok(Timeout::Duration(timeout - elapsed))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_bus_keys_are_stripped() {
        let path_with_keys = "unix:path=/tmp/dbus-test-not-exist,guid=aaaaa,test=bbbbbbbb";
        match parse_dbus_addr_str(path_with_keys) {
            Err(Error::PathDoesNotExist(path)) => {
                assert_eq!("/tmp/dbus-test-not-exist", path);
            }
            other => panic!("expected PathDoesNotExist, got {:?}", other),
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn abstract_socket_address_round_trips() {
        let abstract_path = "unix:abstract=/tmp/dbus-test";
        let abstract_path_with_keys = "unix:abstract=/tmp/dbus-test,guid=aaaaaaaa,test=bbbbbbbb";

        let resolved = parse_dbus_addr_str(abstract_path).unwrap();
        assert_eq!(resolved.addr, UnixAddr::new_abstract(b"/tmp/dbus-test").unwrap());
        assert_eq!(resolved.guid, None);

        let resolved = parse_dbus_addr_str(abstract_path_with_keys).unwrap();
        assert_eq!(resolved.addr, UnixAddr::new_abstract(b"/tmp/dbus-test").unwrap());
        assert_eq!(resolved.guid.as_deref(), Some("aaaaaaaa"));
    }

    #[test]
    fn guid_is_retained_regardless_of_trailing_key_order() {
        // "/" always exists, so this exercises the success path.
        let resolved = parse_dbus_addr_str("unix:path=/,test=bbbbbbbb,guid=deadbeef").unwrap();
        assert_eq!(resolved.guid.as_deref(), Some("deadbeef"));

        let resolved = parse_dbus_addr_str("unix:path=/,guid=deadbeef,test=bbbbbbbb").unwrap();
        assert_eq!(resolved.guid.as_deref(), Some("deadbeef"));

        let resolved = parse_dbus_addr_str("unix:path=/").unwrap();
        assert_eq!(resolved.guid, None);
    }

    #[test]
    fn unknown_address_type_is_rejected() {
        assert!(matches!(
            parse_dbus_addr_str("tcp:host=localhost,port=1234"),
            Err(Error::AddressTypeNotSupported(_))
        ));
    }

    #[test]
    fn calc_timeout_left_errors_once_elapsed() {
        let start = time::Instant::now();
        std::thread::sleep(time::Duration::from_millis(5));
        let result = calc_timeout_left(&start, Timeout::Duration(time::Duration::from_millis(1)));
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
