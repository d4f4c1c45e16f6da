//! Proxy location and runtime switches, read from the environment.
use crate::errors::{Error, Result};
use crate::transport::service_port;
use http::uri::{Authority, Uri};
use std::borrow::Cow;
use std::str::FromStr;

/// Proxy host used when `socks_proxy` is absent.
pub const DEFAULT_PROXY_HOST: &str = "localhost";
/// Proxy port used when `socks_proxy` names no port.
pub const DEFAULT_PROXY_PORT: u16 = 1080;
/// Number of sentinel addresses handed out before the oldest is reused.
pub const DEFAULT_SENTINEL_POOL: usize = 256;

const ENV_SOCKS_PROXY: &str = "socks_proxy";
const ENV_DEBUG: &str = "DEBUG";
const ENV_SENTINELS: &str = "SOCKSIFY_SENTINELS";

/// Where the SOCKS5 proxy lives, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLocation {
  host: String,
  port: u16,
}

impl Default for ProxyLocation {
  fn default() -> Self {
    ProxyLocation::new(DEFAULT_PROXY_HOST, DEFAULT_PROXY_PORT)
  }
}

impl ProxyLocation {
  /// new ProxyLocation
  pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
    ProxyLocation {
      host: host.into(),
      port,
    }
  }
  /// Parse `host[:port]`, or a `socks5://` / `socks5h://` URI.
  ///
  /// The port may also be a TCP service name such as `socks`. An empty
  /// value yields the default location. Credentials are refused, since only
  /// the "no authentication" method is spoken.
  pub fn parse(value: &str) -> Result<Self> {
    let value = value.trim();
    if value.is_empty() {
      return Ok(ProxyLocation::default());
    }
    let value = numeric_port(value)?;
    let value = value.as_ref();
    let authority = if value.contains("://") {
      let uri = Uri::from_str(value).map_err(|e| Error::Config(format!("{value}: {e}")))?;
      match uri.scheme_str() {
        Some("socks5") | Some("socks5h") => {}
        other => {
          return Err(Error::Config(format!(
            "unsupported proxy scheme `{}`",
            other.unwrap_or_default()
          )));
        }
      }
      uri
        .authority()
        .cloned()
        .ok_or_else(|| Error::Config(format!("{value}: no host in proxy uri")))?
    } else {
      Authority::from_str(value).map_err(|e| Error::Config(format!("{value}: {e}")))?
    };
    if authority.as_str().contains('@') {
      return Err(Error::Config(
        "proxy authentication is not supported".to_string(),
      ));
    }
    // IPv6 literals come back bracketed
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() {
      DEFAULT_PROXY_HOST
    } else {
      host
    };
    Ok(ProxyLocation::new(
      host,
      authority.port_u16().unwrap_or(DEFAULT_PROXY_PORT),
    ))
  }
  /// Proxy host name or address literal.
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Proxy port.
  pub fn port(&self) -> u16 {
    self.port
  }
}

/// Replace a trailing `:service` by the port the services database gives it.
fn numeric_port(value: &str) -> Result<Cow<'_, str>> {
  let Some((head, service)) = value.rsplit_once(':') else {
    return Ok(Cow::Borrowed(value));
  };
  let named = !service.is_empty()
    && !service.bytes().all(|b| b.is_ascii_digit())
    && service
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
  if !named || head.is_empty() || head.ends_with(':') {
    return Ok(Cow::Borrowed(value));
  }
  let port = service_port(service)
    .ok_or_else(|| Error::Config(format!("{value}: unknown service `{service}`")))?;
  Ok(Cow::Owned(format!("{head}:{port}")))
}

impl std::fmt::Display for ProxyLocation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

/// Process configuration.
///
/// | Variable | Meaning |
/// | --- | --- |
/// | `socks_proxy` | `host[:port]` of the proxy, `localhost:1080` when unset |
/// | `DEBUG` | any value turns diagnostics on |
/// | `SOCKSIFY_SENTINELS` | size of the sentinel address pool |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  proxy: ProxyLocation,
  diagnostics: bool,
  sentinel_pool: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      proxy: ProxyLocation::default(),
      diagnostics: false,
      sentinel_pool: DEFAULT_SENTINEL_POOL,
    }
  }
}

impl Config {
  /// Read the configuration from the process environment.
  pub fn from_env() -> Result<Self> {
    Self::from_vars(|key| {
      std::env::var_os(key).map(|value| value.to_string_lossy().into_owned())
    })
  }
  /// Build the configuration from an arbitrary variable lookup.
  pub fn from_vars<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Config::default();
    if let Some(value) = lookup(ENV_SOCKS_PROXY) {
      config = config.proxy(ProxyLocation::parse(&value)?);
    }
    config = config.diagnostics(lookup(ENV_DEBUG).is_some());
    if let Some(value) = lookup(ENV_SENTINELS) {
      let pool = value
        .trim()
        .parse::<usize>()
        .map_err(|e| Error::Config(format!("{ENV_SENTINELS}={value}: {e}")))?;
      config = config.sentinel_pool(pool);
    }
    Ok(config)
  }
  /// Set the proxy location.
  pub fn proxy(mut self, value: ProxyLocation) -> Config {
    self.proxy = value;
    self
  }
  /// Enable verbose diagnostics on stderr.
  ///
  /// Default is `false`.
  pub fn diagnostics(mut self, value: bool) -> Config {
    self.diagnostics = value;
    self
  }
  /// Set how many distinct hostnames can be awaiting their connect call.
  ///
  /// Default is 256. A value of 1 keeps a single, process-wide slot.
  pub fn sentinel_pool(mut self, value: usize) -> Config {
    self.sentinel_pool = value;
    self
  }
  /// The configured proxy location.
  pub fn proxy_location(&self) -> &ProxyLocation {
    &self.proxy
  }
  /// Whether diagnostics are enabled.
  pub fn diagnostics_enabled(&self) -> bool {
    self.diagnostics
  }
  /// Requested sentinel pool size.
  pub fn sentinel_pool_size(&self) -> usize {
    self.sentinel_pool
  }
}
