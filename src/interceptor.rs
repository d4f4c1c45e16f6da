use crate::sentinel::SentinelTable;
use crate::transport::Primitives;
use std::ffi::{c_char, c_int, CStr, CString};

/// Stands between the application and the resolver.
///
/// Every looked-up hostname is remembered and the real resolver is asked
/// for a sentinel address instead, so the application ends up connecting to
/// the sentinel. Service, hints and result pointers pass through unchanged.
#[derive(Debug)]
pub struct AddressInterceptor {
  sentinels: SentinelTable,
}

impl AddressInterceptor {
  /// new AddressInterceptor
  pub fn new(sentinels: SentinelTable) -> Self {
    AddressInterceptor { sentinels }
  }
  /// Table the captured hostnames live in.
  pub fn sentinels(&self) -> &SentinelTable {
    &self.sentinels
  }
  /// Capture `hostname`, returning the sentinel literal to resolve instead.
  pub fn substitute(&self, hostname: &CStr) -> CString {
    let sentinel = self.sentinels.capture(hostname.to_bytes());
    // a dotted quad never holds a NUL
    CString::new(sentinel.to_string()).unwrap_or_default()
  }
  /// `getaddrinfo(3)` with `node` swapped for its sentinel.
  ///
  /// # Safety
  ///
  /// Same contract as `getaddrinfo(3)`.
  pub unsafe fn getaddrinfo(
    &self,
    primitives: &Primitives,
    node: *const c_char,
    service: *const c_char,
    hints: *const libc::addrinfo,
    res: *mut *mut libc::addrinfo,
  ) -> c_int {
    if node.is_null() {
      return primitives.getaddrinfo(node, service, hints, res);
    }
    let hostname = CStr::from_ptr(node);
    let literal = self.substitute(hostname);
    tracing::debug!(
      node = %hostname.to_string_lossy(),
      service = ?opt_cstr(service),
      sentinel = %literal.to_string_lossy(),
      "getaddrinfo"
    );
    primitives.getaddrinfo(literal.as_ptr(), service, hints, res)
  }
  /// `gethostbyname(3)` with `name` swapped for its sentinel.
  ///
  /// # Safety
  ///
  /// Same contract as `gethostbyname(3)`.
  pub unsafe fn gethostbyname(
    &self,
    primitives: &Primitives,
    name: *const c_char,
  ) -> *mut libc::hostent {
    if name.is_null() {
      return primitives.gethostbyname(name);
    }
    let hostname = CStr::from_ptr(name);
    let literal = self.substitute(hostname);
    tracing::debug!(
      name = %hostname.to_string_lossy(),
      sentinel = %literal.to_string_lossy(),
      "gethostbyname"
    );
    primitives.gethostbyname(literal.as_ptr())
  }
}

unsafe fn opt_cstr<'a>(ptr: *const c_char) -> Option<std::borrow::Cow<'a, str>> {
  if ptr.is_null() {
    return None;
  }
  Some(CStr::from_ptr(ptr).to_string_lossy())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::sockaddr_from_raw;
  use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
  use std::{mem, ptr};

  fn stream_hints(flags: c_int) -> libc::addrinfo {
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_INET;
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_flags = flags;
    hints
  }

  unsafe fn first_addr(res: *mut libc::addrinfo) -> Option<SocketAddr> {
    let info = &*res;
    sockaddr_from_raw(info.ai_addr, info.ai_addrlen).and_then(|addr| addr.as_socket())
  }

  #[test]
  fn getaddrinfo_resolves_to_sentinel() {
    let primitives = Primitives::load().unwrap();
    let interceptor = AddressInterceptor::new(SentinelTable::new(1));
    let hints = stream_hints(0);
    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe {
      interceptor.getaddrinfo(
        &primitives,
        c"example.com".as_ptr(),
        c"80".as_ptr(),
        &hints,
        &mut res,
      )
    };
    assert_eq!(rc, 0);
    let addr = unsafe { first_addr(res) };
    unsafe { libc::freeaddrinfo(res) };
    assert_eq!(
      addr,
      Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 1), 80)))
    );
    assert_eq!(
      interceptor
        .sentinels()
        .hostname(Ipv4Addr::new(0, 0, 0, 1))
        .as_deref(),
      Some(&b"example.com"[..])
    );
  }

  #[test]
  fn getaddrinfo_without_node_passes_through() {
    let primitives = Primitives::load().unwrap();
    let interceptor = AddressInterceptor::new(SentinelTable::new(1));
    let hints = stream_hints(libc::AI_PASSIVE);
    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe {
      interceptor.getaddrinfo(&primitives, ptr::null(), c"8080".as_ptr(), &hints, &mut res)
    };
    assert_eq!(rc, 0);
    let addr = unsafe { first_addr(res) };
    unsafe { libc::freeaddrinfo(res) };
    assert_eq!(addr, Some("0.0.0.0:8080".parse().unwrap()));
    assert_eq!(
      interceptor.sentinels().hostname(Ipv4Addr::new(0, 0, 0, 1)),
      None
    );
  }

  #[test]
  fn gethostbyname_resolves_to_sentinel() {
    let primitives = Primitives::load().unwrap();
    let interceptor = AddressInterceptor::new(SentinelTable::new(8));
    interceptor.substitute(c"first.example");
    let entry = unsafe { interceptor.gethostbyname(&primitives, c"second.example".as_ptr()) };
    assert!(!entry.is_null());
    let first = unsafe {
      let entry = &*entry;
      assert_eq!(entry.h_addrtype, libc::AF_INET);
      let raw = *entry.h_addr_list;
      std::slice::from_raw_parts(raw.cast::<u8>(), 4).to_vec()
    };
    assert_eq!(first, [0, 0, 0, 2]);
    assert_eq!(
      interceptor
        .sentinels()
        .hostname(Ipv4Addr::new(0, 0, 0, 2))
        .as_deref(),
      Some(&b"second.example"[..])
    );
  }
}
