//! Placeholder addresses handed to the application instead of real
//! resolution results.
//!
//! Each captured hostname is bound to its own address out of `0.0.0.0/8`,
//! a block that is never assigned to a host. At connect time the address is
//! looked up again to recover the name the application asked for. The pool
//! is bounded: once every sentinel is taken, the least recently captured
//! hostname is evicted and its sentinel reused. A pool of one is a single
//! process-wide slot that each resolution overwrites.
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, PoisonError};

/// Longest hostname kept, in bytes. Longer names are truncated.
pub const HOSTNAME_CAPACITY: usize = 255;
/// Largest pool `0.0.0.0/8` can back.
pub const MAX_SENTINELS: usize = 0x00FF_FFFF;
// 0.0.0.1
const SENTINEL_BASE: u32 = 1;

/// Bounded map from sentinel address to captured hostname.
#[derive(Debug)]
pub struct SentinelTable {
  slots: Mutex<Slots>,
  pool: usize,
  hostname_capacity: usize,
}

#[derive(Debug, Default)]
struct Slots {
  names: Vec<Vec<u8>>,
  by_name: HashMap<Vec<u8>, usize>,
  // least recently captured first
  order: VecDeque<usize>,
}

impl Slots {
  fn touch(&mut self, index: usize) {
    self.order.retain(|&i| i != index);
    self.order.push_back(index);
  }
}

impl SentinelTable {
  /// A table of `pool` sentinels, clamped to `1..=MAX_SENTINELS`.
  pub fn new(pool: usize) -> Self {
    Self::with_hostname_capacity(pool, HOSTNAME_CAPACITY)
  }
  /// Like [`SentinelTable::new`], keeping at most `hostname_capacity` bytes
  /// of each hostname.
  pub fn with_hostname_capacity(pool: usize, hostname_capacity: usize) -> Self {
    SentinelTable {
      slots: Mutex::new(Slots::default()),
      pool: pool.clamp(1, MAX_SENTINELS),
      hostname_capacity,
    }
  }
  /// Number of sentinels in the pool.
  pub fn pool(&self) -> usize {
    self.pool
  }
  /// Record `hostname` and return the sentinel standing in for it.
  pub fn capture(&self, hostname: &[u8]) -> Ipv4Addr {
    let name = &hostname[..hostname.len().min(self.hostname_capacity)];
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    let existing = slots.by_name.get(name).copied();
    let index = if let Some(index) = existing {
      slots.touch(index);
      index
    } else if slots.names.len() < self.pool {
      let index = slots.names.len();
      slots.names.push(name.to_vec());
      slots.by_name.insert(name.to_vec(), index);
      slots.order.push_back(index);
      index
    } else {
      let index = slots.order.pop_front().unwrap_or(0);
      let evicted = std::mem::replace(&mut slots.names[index], name.to_vec());
      slots.by_name.remove(&evicted);
      slots.by_name.insert(name.to_vec(), index);
      slots.order.push_back(index);
      tracing::debug!(
        evicted = %String::from_utf8_lossy(&evicted),
        "sentinel pool exhausted"
      );
      index
    };
    sentinel_at(index)
  }
  /// The sentinel `addr` denotes, if it is one. IPv4-mapped IPv6 sentinels
  /// count too.
  pub fn sentinel_of(&self, addr: IpAddr) -> Option<Ipv4Addr> {
    let v4 = match addr {
      IpAddr::V4(v4) => v4,
      IpAddr::V6(v6) => v6.to_ipv4_mapped()?,
    };
    self.index_of(v4).map(|_| v4)
  }
  /// Hostname currently bound to `sentinel`.
  pub fn hostname(&self, sentinel: Ipv4Addr) -> Option<Vec<u8>> {
    let index = self.index_of(sentinel)?;
    let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    slots.names.get(index).cloned()
  }
  fn index_of(&self, addr: Ipv4Addr) -> Option<usize> {
    let offset = u32::from(addr).checked_sub(SENTINEL_BASE)? as usize;
    (offset < self.pool).then_some(offset)
  }
}

fn sentinel_at(index: usize) -> Ipv4Addr {
  Ipv4Addr::from(SENTINEL_BASE + index as u32)
}
