use crate::config::ProxyLocation;
use crate::errors::{Error, Result};
use crate::transport::Transport;
use socket2::SockAddr;
use std::ffi::c_int;
use std::net::{SocketAddr, SocketAddrV6};

/// Resolved address of the SOCKS5 proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyEndpoint {
  addr: SocketAddr,
}

impl ProxyEndpoint {
  /// Resolve `location` through the un-intercepted resolver.
  ///
  /// IPv4 results win over IPv6 ones; otherwise the first result is kept.
  pub fn resolve<T: Transport + ?Sized>(location: &ProxyLocation, transport: &T) -> Result<Self> {
    let addrs = transport.resolve(location.host(), location.port())?;
    let addr = addrs
      .iter()
      .find(|addr| addr.is_ipv4())
      .or_else(|| addrs.first())
      .copied()
      .ok_or_else(|| Error::Resolve {
        host: location.host().to_string(),
        reason: "no usable address".to_string(),
      })?;
    tracing::debug!(proxy = %location, %addr, "resolved proxy endpoint");
    Ok(ProxyEndpoint { addr })
  }
  /// Address the handshake connects to.
  pub fn addr(&self) -> SocketAddr {
    self.addr
  }
  /// The endpoint as a socket of `family` can reach it.
  ///
  /// An IPv6 socket reaches an IPv4 proxy through its IPv4-mapped address.
  pub fn sockaddr_for(&self, family: c_int) -> SockAddr {
    match self.addr {
      SocketAddr::V4(v4) if family == libc::AF_INET6 => SockAddr::from(SocketAddrV6::new(
        v4.ip().to_ipv6_mapped(),
        v4.port(),
        0,
        0,
      )),
      addr => SockAddr::from(addr),
    }
  }
}

impl From<SocketAddr> for ProxyEndpoint {
  fn from(addr: SocketAddr) -> Self {
    ProxyEndpoint { addr }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::RefCell;
  use std::os::fd::RawFd;

  /// Records lookups and answers with a fixed list.
  struct Recorder {
    answer: Vec<SocketAddr>,
    asked: RefCell<Vec<(String, u16)>>,
  }

  impl Recorder {
    fn new(answer: &[&str]) -> Self {
      Recorder {
        answer: answer.iter().map(|a| a.parse().unwrap()).collect(),
        asked: RefCell::new(vec![]),
      }
    }
  }

  impl Transport for Recorder {
    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
      self.asked.borrow_mut().push((host.to_string(), port));
      Ok(self.answer.clone())
    }
    fn connect(&self, _fd: RawFd, _addr: &SockAddr) -> std::io::Result<()> {
      unreachable!("resolution never connects")
    }
  }

  #[test]
  fn resolves_configured_location() {
    let transport = Recorder::new(&["192.0.2.7:9050"]);
    let location = ProxyLocation::parse("proxy.example:9050").unwrap();
    let endpoint = ProxyEndpoint::resolve(&location, &transport).unwrap();
    assert_eq!(
      transport.asked.borrow().as_slice(),
      &[("proxy.example".to_string(), 9050)]
    );
    assert_eq!(endpoint.addr(), "192.0.2.7:9050".parse().unwrap());
  }

  #[test]
  fn resolves_default_location() {
    let transport = Recorder::new(&["127.0.0.1:1080"]);
    ProxyEndpoint::resolve(&ProxyLocation::default(), &transport).unwrap();
    assert_eq!(
      transport.asked.borrow().as_slice(),
      &[("localhost".to_string(), 1080)]
    );
  }

  #[test]
  fn prefers_ipv4() {
    let transport = Recorder::new(&["[::1]:1080", "127.0.0.1:1080"]);
    let endpoint = ProxyEndpoint::resolve(&ProxyLocation::default(), &transport).unwrap();
    assert_eq!(endpoint.addr(), "127.0.0.1:1080".parse().unwrap());
  }

  #[test]
  fn ipv6_sockets_use_mapped_address() {
    let endpoint = ProxyEndpoint::from("127.0.0.1:1080".parse::<SocketAddr>().unwrap());
    assert_eq!(
      endpoint.sockaddr_for(libc::AF_INET6).as_socket(),
      Some("[::ffff:127.0.0.1]:1080".parse().unwrap())
    );
    assert_eq!(
      endpoint.sockaddr_for(libc::AF_INET).as_socket(),
      Some(endpoint.addr())
    );
  }

  #[test]
  fn empty_answer_is_an_error() {
    let transport = Recorder::new(&[]);
    let err = ProxyEndpoint::resolve(&ProxyLocation::default(), &transport).unwrap_err();
    assert!(matches!(err, Error::Resolve { .. }));
  }
}
