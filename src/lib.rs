#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # socksify
//!
//! Sends the TCP connections of an unmodified, dynamically linked program
//! through a SOCKS5 proxy, with hostnames resolved on the proxy side.
//!
//! Built as a shared object and loaded with `LD_PRELOAD`, the library
//! shadows three libc functions:
//!
//! - `getaddrinfo` and `gethostbyname` remember the requested hostname and
//!   answer with a sentinel address from `0.0.0.0/8` instead of asking DNS.
//! - `connect` on a stream socket is redirected to the proxy. A SOCKS5
//!   `CONNECT` is negotiated for the original destination, or for the
//!   remembered hostname when the destination is a sentinel, and the socket
//!   is returned to the caller with the tunnel already open.
//!
//! Datagram sockets and non-IP address families are left alone.
//!
//! ## Usage
//!
//! ```text
//! socks_proxy=127.0.0.1:9050 LD_PRELOAD=./libsocksify.so curl http://example.com/
//! ```
//!
//! ## Configuration
//!
//! All settings come from the environment of the preloaded process:
//!
//! - `socks_proxy`: `host[:port]` of the proxy, optionally prefixed with
//!   `socks5://` or `socks5h://`. Defaults to `localhost:1080`.
//! - `DEBUG`: when present, diagnostics are written to stderr. `RUST_LOG`
//!   narrows or widens them.
//! - `SOCKSIFY_SENTINELS`: how many hostnames may be in flight at once.
//!   Defaults to `256`; `1` reuses a single sentinel for every lookup.
//!
//! A proxy that cannot be resolved aborts the process rather than letting
//! connections go out directly.
//!
//! ## Without preloading
//!
//! With `default-features = false` nothing is exported under libc names and
//! the pieces can be driven directly: [`Socks5Handshake`] runs the protocol
//! on any blocking-capable socket, through any [`Transport`].
mod config;
mod connector;
mod endpoint;
mod errors;
mod interceptor;
mod logging;
/// C entry points
pub mod preload;
mod sentinel;
mod socks5;
mod state;
mod transport;

pub use config::{
  Config, ProxyLocation, DEFAULT_PROXY_HOST, DEFAULT_PROXY_PORT, DEFAULT_SENTINEL_POOL,
};
pub use connector::{route, ProxyConnector, Route};
pub use endpoint::ProxyEndpoint;
pub use errors::{Error, ReplyError, Result};
pub use interceptor::AddressInterceptor;
pub use logging::init as init_logging;
pub use sentinel::{SentinelTable, HOSTNAME_CAPACITY, MAX_SENTINELS};
pub use socks5::{HandshakeState, Socks5Handshake};
pub use state::ProcessState;
pub use transport::{Primitives, Transport};
