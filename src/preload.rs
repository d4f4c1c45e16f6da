//! C entry points that shadow libc once the library is preloaded.
//!
//! With the `preload` feature the three functions below are exported under
//! their libc names, so `LD_PRELOAD=libsocksify.so` puts them ahead of the
//! real ones. Each keeps the libc calling convention: `getaddrinfo` returns
//! an EAI code, `gethostbyname` a possibly null entry, and `connect` `0` or
//! `-1` with `errno` set.
use crate::connector::{self, ProxyConnector, Route};
use crate::state::ProcessState;
use crate::transport::{sockaddr_from_raw, Primitives};
use std::ffi::{c_char, c_int};
use std::mem;
use std::os::fd::BorrowedFd;

unsafe fn set_errno(val: c_int) {
  *libc::__errno_location() = val;
}

/// Interposed `getaddrinfo(3)`.
///
/// # Safety
///
/// Same contract as `getaddrinfo(3)`.
#[cfg_attr(all(feature = "preload", not(test)), no_mangle)]
pub unsafe extern "C" fn getaddrinfo(
  node: *const c_char,
  service: *const c_char,
  hints: *const libc::addrinfo,
  res: *mut *mut libc::addrinfo,
) -> c_int {
  let state = ProcessState::global();
  state
    .interceptor()
    .getaddrinfo(state.primitives(), node, service, hints, res)
}

/// Interposed `gethostbyname(3)`.
///
/// # Safety
///
/// Same contract as `gethostbyname(3)`.
#[cfg_attr(all(feature = "preload", not(test)), no_mangle)]
pub unsafe extern "C" fn gethostbyname(name: *const c_char) -> *mut libc::hostent {
  let state = ProcessState::global();
  state.interceptor().gethostbyname(state.primitives(), name)
}

/// Interposed `connect(2)`.
///
/// Stream sockets headed for an IPv4 or IPv6 address are connected to the
/// proxy and handed back with the tunnel established. Everything else goes
/// straight to the real `connect` with its arguments untouched.
///
/// # Safety
///
/// Same contract as `connect(2)`.
#[cfg_attr(all(feature = "preload", not(test)), no_mangle)]
pub unsafe extern "C" fn connect(
  fd: c_int,
  addr: *const libc::sockaddr,
  len: libc::socklen_t,
) -> c_int {
  connect_with(
    Primitives::global(),
    || ProcessState::global().connector(),
    fd,
    addr,
    len,
  )
}

/// `connect` over explicit primitives. The process state behind `connector`
/// is only touched for calls that end up proxied.
unsafe fn connect_with<'s, F>(
  primitives: &Primitives,
  connector: F,
  fd: c_int,
  addr: *const libc::sockaddr,
  len: libc::socklen_t,
) -> c_int
where
  F: FnOnce() -> ProxyConnector<'s, Primitives>,
{
  if addr.is_null() || fd < 0 || (len as usize) < mem::size_of::<libc::sa_family_t>() {
    return primitives.connect_raw(fd, addr, len);
  }
  let family = c_int::from((*addr).sa_family);
  let socket = BorrowedFd::borrow_raw(fd);
  if connector::route(socket, family) == Route::Direct {
    return primitives.connect_raw(fd, addr, len);
  }
  let Some(dest) = sockaddr_from_raw(addr, len) else {
    return primitives.connect_raw(fd, addr, len);
  };
  match connector().proxy(socket, &dest) {
    Ok(()) => 0,
    Err(err) => {
      tracing::debug!(fd, %err, "proxied connect failed");
      set_errno(err.errno());
      -1
    }
  }
}
