use crate::endpoint::ProxyEndpoint;
use crate::errors::Result;
use crate::sentinel::SentinelTable;
use crate::socks5::Socks5Handshake;
use crate::transport::Transport;
use socket2::{SockAddr, SockRef, Type};
use std::ffi::c_int;
use std::os::fd::BorrowedFd;

/// How a connect call is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// SOCKS5 handshake against the proxy endpoint
  Proxy,
  /// the real connect, with the caller's arguments untouched
  Direct,
}

/// Runs the proxied half of a connect call.
///
/// Which calls get here is decided by [`route`]; the rest go to the real
/// `connect` with the caller's own arguments.
pub struct ProxyConnector<'a, T: Transport + ?Sized> {
  transport: &'a T,
  endpoint: ProxyEndpoint,
  sentinels: &'a SentinelTable,
}

impl<'a, T: Transport + ?Sized> ProxyConnector<'a, T> {
  /// new ProxyConnector
  pub fn new(transport: &'a T, endpoint: ProxyEndpoint, sentinels: &'a SentinelTable) -> Self {
    ProxyConnector {
      transport,
      endpoint,
      sentinels,
    }
  }
  /// Run the SOCKS5 handshake for `dest` on `fd`.
  pub fn proxy(&self, fd: BorrowedFd<'_>, dest: &SockAddr) -> Result<()> {
    tracing::debug!(address = ?dest.as_socket(), "stream connect");
    Socks5Handshake::new(self.transport, self.endpoint, self.sentinels).establish(fd, dest)
  }
}

/// Route for a connect on `fd` to an address of `family`.
///
/// Only TCP over IPv4 or IPv6 is proxied. Datagram sockets and every other
/// address family keep their direct connection.
pub fn route(fd: BorrowedFd<'_>, family: c_int) -> Route {
  if family != libc::AF_INET && family != libc::AF_INET6 {
    return Route::Direct;
  }
  match SockRef::from(&fd).r#type() {
    Ok(ty) if ty == Type::STREAM => Route::Proxy,
    Ok(ty) => {
      if ty == Type::DGRAM {
        tracing::debug!(family, "datagram socket, not proxied");
      }
      Route::Direct
    }
    Err(err) => {
      tracing::debug!(%err, "cannot read socket type");
      Route::Direct
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::errors::Error;
  use socket2::{Domain, Socket};
  use std::cell::RefCell;
  use std::net::SocketAddr;
  use std::os::fd::{AsFd, AsRawFd, RawFd};

  /// Records connect calls and answers them with a fixed errno, or success.
  struct Recorder {
    errno: Option<i32>,
    connects: RefCell<Vec<(RawFd, Option<SocketAddr>)>>,
  }

  impl Recorder {
    fn new(errno: Option<i32>) -> Self {
      Recorder {
        errno,
        connects: RefCell::new(vec![]),
      }
    }
  }

  impl Transport for Recorder {
    fn resolve(&self, _host: &str, _port: u16) -> Result<Vec<SocketAddr>> {
      Ok(vec![])
    }
    fn connect(&self, fd: RawFd, addr: &SockAddr) -> std::io::Result<()> {
      self.connects.borrow_mut().push((fd, addr.as_socket()));
      match self.errno {
        None => Ok(()),
        Some(errno) => Err(std::io::Error::from_raw_os_error(errno)),
      }
    }
  }

  fn endpoint() -> ProxyEndpoint {
    ProxyEndpoint::from("127.0.0.1:1080".parse::<SocketAddr>().unwrap())
  }

  #[test]
  fn stream_goes_to_proxy_endpoint() {
    let transport = Recorder::new(Some(libc::ECONNREFUSED));
    let sentinels = SentinelTable::new(1);
    let connector = ProxyConnector::new(&transport, endpoint(), &sentinels);
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    let dest: SocketAddr = "1.2.3.4:443".parse().unwrap();
    assert_eq!(route(socket.as_fd(), libc::AF_INET), Route::Proxy);
    let err = connector
      .proxy(socket.as_fd(), &SockAddr::from(dest))
      .unwrap_err();
    assert!(matches!(err, Error::EndpointUnreachable(_)));
    assert_eq!(
      transport.connects.borrow().as_slice(),
      &[(socket.as_raw_fd(), Some(endpoint().addr()))]
    );
  }

  #[test]
  fn datagram_and_other_families_pass_through() {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None).unwrap();
    assert_eq!(route(socket.as_fd(), libc::AF_UNIX), Route::Direct);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap();
    assert_eq!(route(socket.as_fd(), libc::AF_INET), Route::Direct);
    assert_eq!(route(socket.as_fd(), libc::AF_INET6), Route::Direct);
  }
}
