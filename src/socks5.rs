//! SOCKS5 client handshake over an application-owned socket.
//!
//! ```text
//! Init -> TcpConnected -> GreetingSent -> GreetingAcked -> RequestSent -> Established
//!   \__________\_______________\______________\_______________\______> Failed
//! ```
//!
//! Only the "no authentication required" method and the CONNECT command are
//! spoken. The socket is switched to blocking mode for the whole exchange,
//! and its file status flags are put back only once the tunnel is
//! established; a failed handshake leaves the socket blocking.
use crate::endpoint::ProxyEndpoint;
use crate::errors::{new_io_error, Error, ReplyError, Result};
use crate::sentinel::SentinelTable;
use crate::transport::Transport;
use bytes::{BufMut, BytesMut};
use socket2::{SockAddr, SockRef, Socket};
use std::ffi::c_int;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, BorrowedFd};

/// Largest CONNECT request: header, ATYP, length, 255 name bytes and port.
pub(crate) const FRAME_CAPACITY: usize = consts::MAX_ADDR_LEN + 3;

/// Progress of one handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
  /// nothing done yet
  Init,
  /// TCP connection to the proxy is up
  TcpConnected,
  /// method selection sent
  GreetingSent,
  /// proxy accepted "no authentication"
  GreetingAcked,
  /// CONNECT request sent
  RequestSent,
  /// tunnel ready, flags restored
  Established,
  /// terminal failure
  Failed,
}

/// Socket, saved flags and framing buffer for the duration of one handshake.
struct SocketHandshakeContext<'fd> {
  fd: BorrowedFd<'fd>,
  saved_flags: c_int,
  buf: BytesMut,
}

impl<'fd> SocketHandshakeContext<'fd> {
  fn new(fd: BorrowedFd<'fd>) -> Result<Self> {
    // SAFETY: fd is a live descriptor for 'fd.
    let saved_flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if saved_flags == -1 {
      return Err(std::io::Error::last_os_error().into());
    }
    Ok(SocketHandshakeContext {
      fd,
      saved_flags,
      buf: BytesMut::with_capacity(FRAME_CAPACITY),
    })
  }
  fn set_flags(&self, flags: c_int) -> Result<()> {
    // SAFETY: fd is a live descriptor for 'fd.
    if unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_SETFL, flags) } == -1 {
      return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
  }
  fn force_blocking(&self) -> Result<()> {
    self.set_flags(self.saved_flags & !libc::O_NONBLOCK)
  }
  fn restore_flags(&self) -> Result<()> {
    self.set_flags(self.saved_flags)
  }
  fn family(&self) -> Result<c_int> {
    let local = SockRef::from(&self.fd).local_addr()?;
    Ok(c_int::from(local.family()))
  }
  /// Write out the whole buffer.
  fn send(&mut self) -> Result<()> {
    let socket = SockRef::from(&self.fd);
    let mut stream: &Socket = &socket;
    stream.write_all(&self.buf)?;
    stream.flush()?;
    self.buf.clear();
    Ok(())
  }
  /// Read exactly `len` bytes into the buffer.
  fn recv_exact(&mut self, len: usize) -> Result<&[u8]> {
    self.buf.clear();
    self.buf.resize(len, 0);
    let socket = SockRef::from(&self.fd);
    let mut stream: &Socket = &socket;
    stream.read_exact(&mut self.buf[..])?;
    Ok(&self.buf[..])
  }
}

/// Drives a socket through the SOCKS5 handshake against the proxy endpoint.
pub struct Socks5Handshake<'a, T: Transport + ?Sized> {
  transport: &'a T,
  endpoint: ProxyEndpoint,
  sentinels: &'a SentinelTable,
  state: HandshakeState,
}

impl<'a, T: Transport + ?Sized> Socks5Handshake<'a, T> {
  /// new Socks5Handshake
  pub fn new(transport: &'a T, endpoint: ProxyEndpoint, sentinels: &'a SentinelTable) -> Self {
    Socks5Handshake {
      transport,
      endpoint,
      sentinels,
      state: HandshakeState::Init,
    }
  }
  /// Where the handshake stopped.
  pub fn state(&self) -> HandshakeState {
    self.state
  }
  /// Connect `fd` to the proxy and ask it to CONNECT to `dest`.
  ///
  /// A `dest` that is a sentinel address is sent by the hostname it stands
  /// for, anything else by its raw address.
  pub fn establish(&mut self, fd: BorrowedFd<'_>, dest: &SockAddr) -> Result<()> {
    let result = self.drive(fd, dest);
    if let Err(err) = &result {
      tracing::debug!(state = ?self.state, %err, "proxy handshake failed");
      self.state = HandshakeState::Failed;
    }
    result
  }
  fn advance(&mut self, next: HandshakeState) {
    tracing::trace!(from = ?self.state, to = ?next, "handshake");
    self.state = next;
  }
  fn drive(&mut self, fd: BorrowedFd<'_>, dest: &SockAddr) -> Result<()> {
    let mut ctx = SocketHandshakeContext::new(fd)?;
    ctx.force_blocking()?;
    let family = ctx.family()?;
    let proxy = self.endpoint.sockaddr_for(family);
    if family == libc::AF_INET && proxy.is_ipv6() {
      tracing::debug!(
        proxy = %self.endpoint.addr(),
        "IPv4 socket cannot reach an IPv6-only proxy"
      );
      return Err(Error::EndpointUnreachable(std::io::Error::new(
        ErrorKind::Unsupported,
        format!(
          "IPv4 socket cannot reach IPv6 proxy {}",
          self.endpoint.addr()
        ),
      )));
    }
    if let Err(err) = self.transport.connect(fd.as_raw_fd(), &proxy) {
      tracing::debug!(proxy = %self.endpoint.addr(), %err, "failed to connect proxy");
      return Err(Error::EndpointUnreachable(err));
    }
    self.advance(HandshakeState::TcpConnected);

    self.version_methods(&mut ctx)?;
    self.advance(HandshakeState::GreetingSent);

    self.which_method_accepted(&mut ctx)?;
    self.advance(HandshakeState::GreetingAcked);

    let target = self.target_addr(dest)?;
    tracing::debug!(%target, "requesting tunnel");
    target.write_request(&mut ctx.buf, Socks5Command::TCPConnect)?;
    ctx.send()?;
    self.advance(HandshakeState::RequestSent);

    let bound = read_request_reply(&mut ctx)?;
    ctx.restore_flags()?;
    self.advance(HandshakeState::Established);
    tracing::debug!(%target, %bound, "tunnel established");
    Ok(())
  }
  /// The client offers a single method:
  ///
  /// | VER | NMETHODS | METHODS |
  /// | --- | --- | --- |
  /// | 0x05 | 0x01 | 0x00 |
  fn version_methods(&self, ctx: &mut SocketHandshakeContext<'_>) -> Result<()> {
    ctx.buf.clear();
    ctx.buf.put_slice(&[consts::SOCKS5_VERSION, 1, consts::SOCKS5_AUTH_METHOD_NONE]);
    ctx.send()
  }
  /// The proxy picks a method:
  ///
  /// | VER | METHOD |
  /// | --- | --- |
  /// | 0x05 | 0x00 no auth, 0x02 password, 0xFF none acceptable |
  ///
  /// Anything but `05 00` ends the handshake, including methods the proxy
  /// could only have chosen if they had been offered.
  fn which_method_accepted(&self, ctx: &mut SocketHandshakeContext<'_>) -> Result<()> {
    let reply = ctx.recv_exact(2)?;
    let (version, method) = (reply[0], reply[1]);
    if version != consts::SOCKS5_VERSION || method != consts::SOCKS5_AUTH_METHOD_NONE {
      return Err(Error::ProtocolMismatch { version, method });
    }
    Ok(())
  }
  fn target_addr(&self, dest: &SockAddr) -> Result<TargetAddr> {
    let addr = dest
      .as_socket()
      .ok_or_else(|| Error::UnsupportedAddressFamily(c_int::from(dest.family())))?;
    match self.sentinels.sentinel_of(addr.ip()) {
      Some(sentinel) => {
        let host = self
          .sentinels
          .hostname(sentinel)
          .ok_or(Error::UnknownSentinel(sentinel))?;
        Ok(TargetAddr::Domain(host, addr.port()))
      }
      None => Ok(TargetAddr::IP(addr)),
    }
  }
}

/// The proxy answers the request with:
///
/// | VER | REP | RSV | ATYP | BND.ADDR | BND.PORT |
/// | --- | --- | --- | --- | --- | --- |
/// | 0x05 | 0x00 succeeded | 0x00 | 0x01 / 0x03 / 0x04 | variable | 2 |
///
/// The whole reply is consumed so none of it reaches the application.
fn read_request_reply(ctx: &mut SocketHandshakeContext<'_>) -> Result<TargetAddr> {
  let head = ctx.recv_exact(2)?;
  let (version, reply) = (head[0], head[1]);
  if version != consts::SOCKS5_VERSION {
    return Err(Error::ProtocolMismatch {
      version,
      method: reply,
    });
  }
  if reply != consts::SOCKS5_REPLY_SUCCEEDED {
    tracing::debug!(status = reply, "proxy refused the request");
    return Err(Error::ReplyRejected(ReplyError::from(reply)));
  }
  let address_type = ctx.recv_exact(2)?[1];
  read_address(ctx, address_type)
}

fn read_port(ctx: &mut SocketHandshakeContext<'_>) -> Result<u16> {
  let port = ctx.recv_exact(2)?;
  Ok(u16::from_be_bytes([port[0], port[1]]))
}

fn read_address(ctx: &mut SocketHandshakeContext<'_>, addr_type: u8) -> Result<TargetAddr> {
  let addr = match addr_type {
    consts::SOCKS5_ADDR_TYPE_IPV4 => {
      let mut ip = [0u8; 4];
      ip.copy_from_slice(ctx.recv_exact(4)?);
      TargetAddr::IP(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(ip),
        read_port(ctx)?,
      )))
    }
    consts::SOCKS5_ADDR_TYPE_IPV6 => {
      let mut ip = [0u8; 16];
      ip.copy_from_slice(ctx.recv_exact(16)?);
      TargetAddr::IP(SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(ip),
        read_port(ctx)?,
        0,
        0,
      )))
    }
    consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
      let len = ctx.recv_exact(1)?[0] as usize;
      let domain = ctx.recv_exact(len)?.to_vec();
      TargetAddr::Domain(domain, read_port(ctx)?)
    }
    _ => {
      return Err(new_io_error(
        ErrorKind::InvalidData,
        "incorrect address type in reply",
      ))
    }
  };
  Ok(addr)
}

#[derive(Debug, PartialEq)]
enum Socks5Command {
  /// CONNECT, proxy TCP traffic
  TCPConnect,
}

impl Socks5Command {
  #[inline]
  fn as_u8(&self) -> u8 {
    match self {
      Socks5Command::TCPConnect => consts::SOCKS5_CMD_TCP_CONNECT,
    }
  }
}

/// Destination as it goes on the wire.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TargetAddr {
  // IPV4 IPV6
  IP(SocketAddr),
  // raw hostname bytes, as the application passed them to the resolver
  Domain(Vec<u8>, u16),
}

impl TargetAddr {
  /// Fill `packet` with the request:
  ///
  /// | VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT |
  /// | --- | --- | --- | --- | --- | --- |
  /// | 0x05 | 0x01 CONNECT | 0x00 | 0x01 IPv4, 0x03 domain, 0x04 IPv6 | 4, 1 + len or 16 | 2, big endian |
  ///
  /// Nothing is written when the hostname does not fit.
  fn write_request(&self, packet: &mut BytesMut, cmd: Socks5Command) -> Result<()> {
    if let TargetAddr::Domain(domain, _) = self {
      if domain.len() > u8::MAX as usize || 7 + domain.len() > FRAME_CAPACITY {
        return Err(Error::OversizedHostname(domain.len()));
      }
    }
    packet.clear();
    packet.put_slice(&[consts::SOCKS5_VERSION, cmd.as_u8(), 0x00]);
    match self {
      TargetAddr::IP(SocketAddr::V4(addr)) => {
        packet.put_u8(consts::SOCKS5_ADDR_TYPE_IPV4);
        packet.put_slice(&addr.ip().octets());
        packet.put_u16(addr.port());
      }
      TargetAddr::IP(SocketAddr::V6(addr)) => {
        packet.put_u8(consts::SOCKS5_ADDR_TYPE_IPV6);
        packet.put_slice(&addr.ip().octets());
        packet.put_u16(addr.port());
      }
      TargetAddr::Domain(domain, port) => {
        packet.put_u8(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
        packet.put_u8(domain.len() as u8);
        packet.put_slice(domain);
        packet.put_u16(*port);
      }
    }
    Ok(())
  }
}

impl std::fmt::Display for TargetAddr {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TargetAddr::IP(addr) => write!(f, "{addr}"),
      TargetAddr::Domain(domain, port) => {
        write!(f, "{}:{}", String::from_utf8_lossy(domain), port)
      }
    }
  }
}

impl From<u8> for ReplyError {
  /// REP values other than 0x00:
  ///
  /// - 0x01 general SOCKS server failure
  /// - 0x02 connection not allowed by ruleset
  /// - 0x03 network unreachable
  /// - 0x04 host unreachable
  /// - 0x05 connection refused
  /// - 0x06 TTL expired
  /// - 0x07 command not supported
  /// - 0x08 address type not supported
  fn from(value: u8) -> Self {
    match value {
      consts::SOCKS5_REPLY_GENERAL_FAILURE => ReplyError::GeneralFailure,
      consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED => ReplyError::ConnectionNotAllowed,
      consts::SOCKS5_REPLY_NETWORK_UNREACHABLE => ReplyError::NetworkUnreachable,
      consts::SOCKS5_REPLY_HOST_UNREACHABLE => ReplyError::HostUnreachable,
      consts::SOCKS5_REPLY_CONNECTION_REFUSED => ReplyError::ConnectionRefused,
      consts::SOCKS5_REPLY_TTL_EXPIRED => ReplyError::TtlExpired,
      consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED => ReplyError::CommandNotSupported,
      consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED => ReplyError::AddressTypeNotSupported,
      other => ReplyError::Other(other),
    }
  }
}

#[rustfmt::skip]
pub(crate) mod consts {
  pub const MAX_ADDR_LEN: usize = 260;
  pub const SOCKS5_VERSION: u8 = 0x05;

  pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;

  pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;

  pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

  pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
  pub const SOCKS5_REPLY_GENERAL_FAILURE: u8 = 0x01;
  pub const SOCKS5_REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
  pub const SOCKS5_REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
  pub const SOCKS5_REPLY_HOST_UNREACHABLE: u8 = 0x04;
  pub const SOCKS5_REPLY_CONNECTION_REFUSED: u8 = 0x05;
  pub const SOCKS5_REPLY_TTL_EXPIRED: u8 = 0x06;
  pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
  pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}
