//! Transaction outcome events
//!
//! Every commit and abort is reported once through [`AbortCollector::record_abort`]
//! or [`AbortCollector::record_commit`]. The protocol decides *why*; counting
//! is the collector's job.

use std::sync::atomic::{AtomicU64, Ordering};

/// Why a transaction attempt did not commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AbortReason {
    /// Write lock already held, or a lease could not be installed
    LockConflict = 0,
    /// A previously read record changed before commit
    ValidationFailure = 1,
    /// A Sundial lease could not be renewed, or a NOWAIT read lease expired
    StaleLease = 2,
    /// A 2PC participant voted to abort
    PrepareVoteFailed = 3,
    /// MVCC: no version visible at the transaction's timestamp
    VersionInvisible = 4,
    /// MVCC: the visible version changed while it was being read
    VersionChanged = 5,
    /// The workload asked for the abort
    UserAbort = 6,
}

impl AbortReason {
    /// All reasons, in counter order
    pub const ALL: [AbortReason; 7] = [
        AbortReason::LockConflict,
        AbortReason::ValidationFailure,
        AbortReason::StaleLease,
        AbortReason::PrepareVoteFailed,
        AbortReason::VersionInvisible,
        AbortReason::VersionChanged,
        AbortReason::UserAbort,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::LockConflict => "lock_conflict",
            AbortReason::ValidationFailure => "validation_failure",
            AbortReason::StaleLease => "stale_lease",
            AbortReason::PrepareVoteFailed => "prepare_vote_failed",
            AbortReason::VersionInvisible => "version_invisible",
            AbortReason::VersionChanged => "version_changed",
            AbortReason::UserAbort => "user_abort",
        }
    }
}

/// Lock-free per-node outcome counters
#[derive(Debug, Default)]
pub struct AbortCollector {
    commits: AtomicU64,
    aborts: [AtomicU64; AbortReason::ALL.len()],
}

impl AbortCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self, reason: AbortReason) {
        self.aborts[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Aborts recorded for one reason
    pub fn aborts(&self, reason: AbortReason) -> u64 {
        self.aborts[reason as usize].load(Ordering::Relaxed)
    }

    pub fn total_aborts(&self) -> u64 {
        self.aborts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Non-zero abort counters, for reporting
    pub fn snapshot(&self) -> Vec<(AbortReason, u64)> {
        AbortReason::ALL
            .iter()
            .map(|r| (*r, self.aborts(*r)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}
