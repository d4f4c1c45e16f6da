//! engine error
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `socksify::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while redirecting a connection through the proxy.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// The TCP connect to the proxy itself failed.
  #[error("proxy endpoint unreachable: {0}")]
  EndpointUnreachable(std::io::Error),
  /// The proxy answered the greeting with something other than `05 00`.
  #[error("unexpected greeting reply: version {version:#04x}, method {method:#04x}")]
  ProtocolMismatch {
    /// VER byte of the reply
    version: u8,
    /// METHOD byte of the reply
    method: u8,
  },
  /// The captured hostname does not fit into a CONNECT frame.
  #[error("hostname of {0} bytes does not fit into a CONNECT request")]
  OversizedHostname(usize),
  /// A sentinel address whose hostname was already evicted.
  #[error("no hostname recorded for sentinel address {0}")]
  UnknownSentinel(Ipv4Addr),
  /// The destination is neither IPv4 nor IPv6.
  #[error("address family {0} cannot be encoded in a CONNECT request")]
  UnsupportedAddressFamily(i32),
  /// Proxy ReplyError
  #[error(transparent)]
  ReplyRejected(#[from] ReplyError),
  /// Name resolution failed
  #[error("resolve {host}: {reason}")]
  Resolve {
    /// host that was looked up
    host: String,
    /// resolver message
    reason: String,
  },
  /// Invalid configuration
  #[error("config: {0}")]
  Config(String),
}

/// REP field of a SOCKS5 reply other than `succeeded`.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
  /// 0x01
  #[error("General failure")]
  GeneralFailure,
  /// 0x02
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed,
  /// 0x03
  #[error("Network unreachable")]
  NetworkUnreachable,
  /// 0x04
  #[error("Host unreachable")]
  HostUnreachable,
  /// 0x05
  #[error("Connection refused")]
  ConnectionRefused,
  /// 0x06
  #[error("TTL expired")]
  TtlExpired,
  /// 0x07
  #[error("Command not supported")]
  CommandNotSupported,
  /// 0x08
  #[error("Address type not supported")]
  AddressTypeNotSupported,
  /// Anything outside the codes RFC 1928 assigns
  #[error("Unassigned reply code {0:#04x}")]
  Other(u8),
}

impl Error {
  /// The `errno` value the C layer reports for this error.
  ///
  /// Proxy-level failures look like a refused connection, so callers need
  /// no special handling for the proxied path.
  pub fn errno(&self) -> i32 {
    match self {
      Error::IO(err) | Error::EndpointUnreachable(err) => match err.raw_os_error() {
        Some(errno) => errno,
        None if err.kind() == ErrorKind::Unsupported => libc::EAFNOSUPPORT,
        None => libc::ECONNREFUSED,
      },
      Error::UnsupportedAddressFamily(_) => libc::EAFNOSUPPORT,
      Error::ProtocolMismatch { .. }
      | Error::OversizedHostname(_)
      | Error::UnknownSentinel(_)
      | Error::ReplyRejected(_)
      | Error::Resolve { .. }
      | Error::Config(_) => libc::ECONNREFUSED,
    }
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn endpoint_error_keeps_os_errno() {
    let err = Error::EndpointUnreachable(std::io::Error::from_raw_os_error(libc::ENETUNREACH));
    assert_eq!(err.errno(), libc::ENETUNREACH);
  }

  #[test]
  fn protocol_failures_look_refused() {
    assert_eq!(
      Error::ProtocolMismatch {
        version: 5,
        method: 2
      }
      .errno(),
      libc::ECONNREFUSED
    );
    assert_eq!(Error::OversizedHostname(300).errno(), libc::ECONNREFUSED);
    assert_eq!(
      Error::ReplyRejected(ReplyError::HostUnreachable).errno(),
      libc::ECONNREFUSED
    );
    assert_eq!(
      new_io_error(ErrorKind::UnexpectedEof, "closed").errno(),
      libc::ECONNREFUSED
    );
  }

  #[test]
  fn family_mismatch_with_proxy() {
    let err = Error::EndpointUnreachable(std::io::Error::new(
      ErrorKind::Unsupported,
      "IPv4 socket cannot reach IPv6 proxy [::1]:1080",
    ));
    assert_eq!(err.errno(), libc::EAFNOSUPPORT);
  }

  #[test]
  fn unsupported_family_is_recoverable() {
    assert_eq!(
      Error::UnsupportedAddressFamily(libc::AF_UNIX).errno(),
      libc::EAFNOSUPPORT
    );
  }
}
