use crate::config::Config;
use crate::connector::ProxyConnector;
use crate::endpoint::ProxyEndpoint;
use crate::errors::Result;
use crate::interceptor::AddressInterceptor;
use crate::logging;
use crate::sentinel::SentinelTable;
use crate::transport::Primitives;
use std::sync::OnceLock;

/// Everything the interposed calls share for the life of the process.
#[derive(Debug)]
pub struct ProcessState {
  primitives: &'static Primitives,
  config: Config,
  endpoint: ProxyEndpoint,
  interceptor: AddressInterceptor,
}

impl ProcessState {
  /// Build the state from `config`, resolving the proxy through `primitives`.
  pub fn new(primitives: &'static Primitives, config: Config) -> Result<Self> {
    let endpoint = ProxyEndpoint::resolve(config.proxy_location(), primitives)?;
    let interceptor = AddressInterceptor::new(SentinelTable::new(config.sentinel_pool_size()));
    Ok(ProcessState {
      primitives,
      config,
      endpoint,
      interceptor,
    })
  }
  /// The process-wide state, initialised on first use.
  ///
  /// Traffic must never silently bypass the proxy, so a configuration or
  /// proxy resolution failure aborts the process.
  pub fn global() -> &'static ProcessState {
    static STATE: OnceLock<ProcessState> = OnceLock::new();
    STATE.get_or_init(|| {
      let primitives = Primitives::global();
      let state = Config::from_env().and_then(|config| {
        logging::init(config.diagnostics_enabled());
        ProcessState::new(primitives, config)
      });
      match state {
        Ok(state) => {
          tracing::debug!(
            proxy = %state.endpoint.addr(),
            sentinels = state.interceptor.sentinels().pool(),
            "initialised"
          );
          state
        }
        Err(err) => {
          tracing::error!(%err, "cannot set up the proxy");
          eprintln!("socksify: {err}");
          std::process::abort()
        }
      }
    })
  }
  /// Real libc primitives.
  pub fn primitives(&self) -> &'static Primitives {
    self.primitives
  }
  /// Loaded configuration.
  pub fn config(&self) -> &Config {
    &self.config
  }
  /// Resolved proxy endpoint.
  pub fn endpoint(&self) -> ProxyEndpoint {
    self.endpoint
  }
  /// Resolver interception.
  pub fn interceptor(&self) -> &AddressInterceptor {
    &self.interceptor
  }
  /// Connect dispatch over the real primitives.
  pub fn connector(&self) -> ProxyConnector<'_, Primitives> {
    ProxyConnector::new(self.primitives, self.endpoint, self.interceptor.sentinels())
  }
}
