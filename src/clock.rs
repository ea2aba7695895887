//! Clocks and transaction timestamps
//!
//! Leases compare wall-clock microseconds across machines, so every node reads
//! time through the [`Clock`] trait. Tests swap in a [`ManualClock`] to expire
//! leases deterministically.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in microseconds
pub trait Clock: Send + Sync + Debug {
    fn now_us(&self) -> u64;
}

/// Reads the system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now: AtomicU64::new(start_us),
        }
    }

    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }

    pub fn set(&self, us: u64) {
        self.now.store(us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Bits below the clock reading that make a timestamp unique per coroutine
pub const TIMESTAMP_SHIFT: u32 = 11;

/// Start timestamp of a transaction: `(now << 11) + node*200 + worker*20 + cor + 1`.
///
/// Unique across the cluster as long as `worker < 10` and `cor < 20`; larger
/// deployments still get monotonic timestamps per coroutine (see
/// `TxnContext::next_timestamp`) but may tie across coroutines.
pub fn txn_timestamp(now_us: u64, node: u8, worker: u8, cor: u16) -> u64 {
    (now_us << TIMESTAMP_SHIFT) + node as u64 * 200 + worker as u64 * 20 + cor as u64 + 1
}
