//! The resolver and connect calls that the interposed ones stand in for.
//!
//! Proxying logic only talks to a [`Transport`]. [`Primitives`] is the
//! implementation backed by the next definitions of `getaddrinfo`,
//! `gethostbyname` and `connect` in the symbol lookup order, normally libc.
use crate::errors::{new_io_error, Error, Result};
use socket2::SockAddr;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::OnceLock;
use std::{mem, ptr};

type GetAddrInfoFn = unsafe extern "C" fn(
  *const c_char,
  *const c_char,
  *const libc::addrinfo,
  *mut *mut libc::addrinfo,
) -> c_int;
type GetHostByNameFn = unsafe extern "C" fn(*const c_char) -> *mut libc::hostent;
type ConnectFn = unsafe extern "C" fn(c_int, *const libc::sockaddr, libc::socklen_t) -> c_int;

/// Name resolution and connection establishment, as seen by the proxy logic.
pub trait Transport {
  /// Resolve `host` for a TCP connection to `port`, without interception.
  fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;
  /// Connect the socket `fd` to `addr`, without interception.
  fn connect(&self, fd: RawFd, addr: &SockAddr) -> std::io::Result<()>;
}

/// Bindings to the real libc primitives, looked up once.
#[derive(Debug, Clone, Copy)]
pub struct Primitives {
  getaddrinfo: GetAddrInfoFn,
  gethostbyname: GetHostByNameFn,
  connect: ConnectFn,
}

impl Primitives {
  /// Look the primitives up with `dlsym(RTLD_NEXT, ..)`.
  pub fn load() -> Result<Self> {
    // SAFETY: each symbol is the libc function of the matching signature.
    unsafe {
      Ok(Primitives {
        getaddrinfo: mem::transmute::<*mut c_void, GetAddrInfoFn>(next_symbol(c"getaddrinfo")?),
        gethostbyname: mem::transmute::<*mut c_void, GetHostByNameFn>(next_symbol(
          c"gethostbyname",
        )?),
        connect: mem::transmute::<*mut c_void, ConnectFn>(next_symbol(c"connect")?),
      })
    }
  }
  /// The process-wide bindings.
  ///
  /// Without them no call can be served at all, so a failed lookup aborts.
  pub fn global() -> &'static Primitives {
    static PRIMITIVES: OnceLock<Primitives> = OnceLock::new();
    PRIMITIVES.get_or_init(|| match Primitives::load() {
      Ok(primitives) => primitives,
      Err(err) => {
        eprintln!("socksify: {err}");
        std::process::abort()
      }
    })
  }
  /// Call the real `getaddrinfo`.
  ///
  /// # Safety
  ///
  /// Same contract as `getaddrinfo(3)`.
  pub unsafe fn getaddrinfo(
    &self,
    node: *const c_char,
    service: *const c_char,
    hints: *const libc::addrinfo,
    res: *mut *mut libc::addrinfo,
  ) -> c_int {
    (self.getaddrinfo)(node, service, hints, res)
  }
  /// Call the real `gethostbyname`.
  ///
  /// # Safety
  ///
  /// Same contract as `gethostbyname(3)`.
  pub unsafe fn gethostbyname(&self, name: *const c_char) -> *mut libc::hostent {
    (self.gethostbyname)(name)
  }
  /// Call the real `connect`.
  ///
  /// # Safety
  ///
  /// Same contract as `connect(2)`.
  pub unsafe fn connect_raw(
    &self,
    fd: c_int,
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
  ) -> c_int {
    (self.connect)(fd, addr, len)
  }
}

impl Transport for Primitives {
  fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let node = CString::new(host)
      .map_err(|_| new_io_error(ErrorKind::InvalidInput, "host contains a NUL byte"))?;
    let service = CString::new(port.to_string())
      .map_err(|_| new_io_error(ErrorKind::InvalidInput, "port contains a NUL byte"))?;
    // SAFETY: all-zero is a valid addrinfo.
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    let mut res: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: arguments are valid for the duration of the call.
    let rc = unsafe { self.getaddrinfo(node.as_ptr(), service.as_ptr(), &hints, &mut res) };
    if rc != 0 {
      // SAFETY: gai_strerror returns a static string.
      let reason = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
        .to_string_lossy()
        .into_owned();
      return Err(Error::Resolve {
        host: host.to_string(),
        reason,
      });
    }
    let mut addrs = Vec::new();
    let mut cursor = res;
    while !cursor.is_null() {
      // SAFETY: cursor walks the list getaddrinfo returned.
      let info = unsafe { &*cursor };
      if let Some(addr) = unsafe { sockaddr_from_raw(info.ai_addr, info.ai_addrlen) }
        .and_then(|addr| addr.as_socket())
      {
        addrs.push(addr);
      }
      cursor = info.ai_next;
    }
    // SAFETY: res came from a successful getaddrinfo.
    unsafe { libc::freeaddrinfo(res) };
    Ok(addrs)
  }

  fn connect(&self, fd: RawFd, addr: &SockAddr) -> std::io::Result<()> {
    // SAFETY: SockAddr guarantees pointer and length agree.
    let rc = unsafe { self.connect_raw(fd, addr.as_ptr(), addr.len()) };
    if rc == 0 {
      Ok(())
    } else {
      Err(std::io::Error::last_os_error())
    }
  }
}

fn next_symbol(name: &CStr) -> Result<*mut c_void> {
  // SAFETY: name is NUL terminated.
  let symbol = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
  if symbol.is_null() {
    return Err(new_io_error(
      ErrorKind::NotFound,
      &format!("no next definition of `{}`", name.to_string_lossy()),
    ));
  }
  Ok(symbol)
}

/// Port of the TCP service `name` in the services database, host order.
pub(crate) fn service_port(name: &str) -> Option<u16> {
  let name = CString::new(name).ok()?;
  // SAFETY: both arguments are NUL terminated; the entry is read before
  // any other lookup can reuse it.
  unsafe {
    let entry = libc::getservbyname(name.as_ptr(), c"tcp".as_ptr());
    if entry.is_null() {
      return None;
    }
    Some(u16::from_be((*entry).s_port as u16))
  }
}

/// Copy a C socket address into an owned `SockAddr`.
///
/// # Safety
///
/// `addr` must be null or point to at least `len` readable bytes.
pub(crate) unsafe fn sockaddr_from_raw(
  addr: *const libc::sockaddr,
  len: libc::socklen_t,
) -> Option<SockAddr> {
  if addr.is_null() {
    return None;
  }
  let len = (len as usize).min(mem::size_of::<libc::sockaddr_storage>());
  let mut storage: libc::sockaddr_storage = mem::zeroed();
  ptr::copy_nonoverlapping(
    addr.cast::<u8>(),
    ptr::addr_of_mut!(storage).cast::<u8>(),
    len,
  );
  Some(SockAddr::new(storage, len as libc::socklen_t))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::{Ipv4Addr, SocketAddrV4};

  #[test]
  fn resolves_numeric_hosts() {
    let primitives = Primitives::load().unwrap();
    let addrs = primitives.resolve("127.0.0.1", 1080).unwrap();
    assert_eq!(
      addrs,
      vec![SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1080))]
    );
  }

  #[test]
  fn refuses_nul_in_host() {
    let primitives = Primitives::load().unwrap();
    let err = primitives.resolve("proxy\0example", 1080).unwrap_err();
    assert!(matches!(err, Error::IO(ref e) if e.kind() == ErrorKind::InvalidInput));
  }

  #[test]
  fn service_names() {
    assert_eq!(service_port("socks"), Some(1080));
    assert_eq!(service_port("http"), Some(80));
    assert_eq!(service_port("no-such-service"), None);
  }

  #[test]
  fn raw_sockaddr_round_trip() {
    let expected: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
    let source = SockAddr::from(expected);
    let copy = unsafe { sockaddr_from_raw(source.as_ptr(), source.len()) }.unwrap();
    assert_eq!(copy.as_socket(), Some(expected));
    assert!(unsafe { sockaddr_from_raw(ptr::null(), 0) }.is_none());
  }
}
