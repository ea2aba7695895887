//! Configuration for rtxkv
//!
//! Centralized configuration with sensible defaults. One `Config` is shared by
//! every node of a cluster; the protocol is chosen once here and never mixed
//! within a transaction.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RtxError};

/// Main configuration for an rtxkv cluster
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Cluster Configuration
    // -------------------------------------------------------------------------
    /// Number of machines in the cluster (node ids are `0..nodes`)
    pub nodes: usize,

    /// Concurrency-control protocol used by every worker
    pub protocol: Protocol,

    // -------------------------------------------------------------------------
    // Remote Access Configuration
    // -------------------------------------------------------------------------
    /// Which operations use one-sided verbs instead of RPC
    pub one_sided: OneSidedOps,

    // -------------------------------------------------------------------------
    // Commit Configuration
    // -------------------------------------------------------------------------
    /// Number of backup machines each write set is logged to
    pub replication_factor: usize,

    /// Run prepare/decide rounds for transactions writing remote records
    pub two_phase_commit: bool,

    /// Commit unconditionally when read validation fails.
    /// Debugging aid only: it breaks serializability.
    pub no_abort: bool,

    // -------------------------------------------------------------------------
    // Lease Configuration
    // -------------------------------------------------------------------------
    /// NOWAIT read lease length (microseconds)
    pub lease_time_us: u64,

    /// Clock skew tolerated when checking a lease (microseconds)
    pub lease_delta_us: u64,

    /// What Sundial does when a read lease cannot be renewed
    pub renew_policy: RenewPolicy,

    /// Local lock attempts an MVCC writer makes before aborting
    pub mvcc_lock_spin_limit: u32,

    // -------------------------------------------------------------------------
    // Memory Configuration
    // -------------------------------------------------------------------------
    /// Bytes reserved for records in each node's region
    pub record_zone_bytes: usize,

    /// Slots in each node's remote log ring
    pub log_slots: usize,

    /// Bytes per log slot (multiple of 8)
    pub log_slot_bytes: usize,

    /// Chunk size handed out by the RDMA heap
    pub rdma_heap_chunk: usize,

    // -------------------------------------------------------------------------
    // Scheduling Configuration
    // -------------------------------------------------------------------------
    /// Coroutines multiplexed onto one worker thread
    pub coroutines: usize,

    /// Forwarding slots per coroutine (Calvin)
    pub forward_window: usize,

    /// Largest value that can be forwarded through a slot (Calvin)
    pub max_forward_value: usize,
}

/// Concurrency-control protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Occ,
    Mvcc,
    Nowait,
    Sundial,
    Calvin,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Occ,
        Protocol::Mvcc,
        Protocol::Nowait,
        Protocol::Sundial,
        Protocol::Calvin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Occ => "occ",
            Protocol::Mvcc => "mvcc",
            Protocol::Nowait => "nowait",
            Protocol::Sundial => "sundial",
            Protocol::Calvin => "calvin",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = RtxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "occ" => Ok(Protocol::Occ),
            "mvcc" => Ok(Protocol::Mvcc),
            "nowait" | "2pl" => Ok(Protocol::Nowait),
            "sundial" => Ok(Protocol::Sundial),
            "calvin" => Ok(Protocol::Calvin),
            other => Err(RtxError::Config(format!("unknown protocol: {}", other))),
        }
    }
}

/// Per-operation choice between one-sided verbs and RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OneSidedOps {
    pub read: bool,
    pub lock: bool,
    pub validate: bool,
    pub commit: bool,
    pub release: bool,
    pub log: bool,
    pub renew: bool,
    pub forward: bool,
}

impl OneSidedOps {
    /// Every operation goes over one-sided verbs
    pub fn all() -> Self {
        Self {
            read: true,
            lock: true,
            validate: true,
            commit: true,
            release: true,
            log: true,
            renew: true,
            forward: true,
        }
    }

    /// Every operation goes over RPC
    pub fn none() -> Self {
        Self {
            read: false,
            lock: false,
            validate: false,
            commit: false,
            release: false,
            log: false,
            renew: false,
            forward: false,
        }
    }
}

impl Default for OneSidedOps {
    fn default() -> Self {
        Self::all()
    }
}

/// Sundial behaviour on a failed lease renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewPolicy {
    /// Abort the transaction immediately
    Abort,

    /// Re-read the record and try again, up to `attempts` times, before aborting
    Retry { attempts: u32 },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: 3,
            protocol: Protocol::Occ,
            one_sided: OneSidedOps::all(),
            replication_factor: 2,
            two_phase_commit: true,
            no_abort: false,
            lease_time_us: 400,
            lease_delta_us: 50,
            renew_policy: RenewPolicy::Abort,
            mvcc_lock_spin_limit: 64,
            record_zone_bytes: 4 * 1024 * 1024, // 4 MB
            log_slots: 1024,
            log_slot_bytes: 1024,
            rdma_heap_chunk: 4096,
            coroutines: 8,
            forward_window: 64,
            max_forward_value: 256,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 || self.nodes > u8::MAX as usize {
            return Err(RtxError::Config(format!(
                "node count must be in 1..=255, got {}",
                self.nodes
            )));
        }
        if self.replication_factor >= self.nodes {
            return Err(RtxError::Config(format!(
                "replication factor {} needs more than {} nodes",
                self.replication_factor, self.nodes
            )));
        }
        if self.log_slot_bytes % 8 != 0 || self.log_slot_bytes < 32 {
            return Err(RtxError::Config(format!(
                "log slot size must be a multiple of 8 and at least 32, got {}",
                self.log_slot_bytes
            )));
        }
        if self.coroutines == 0 || self.coroutines > 1024 {
            return Err(RtxError::Config(format!(
                "coroutines must be in 1..=1024, got {}",
                self.coroutines
            )));
        }
        if self.forward_window == 0 || self.forward_window % 4 != 0 {
            return Err(RtxError::Config(format!(
                "forward window must be a non-zero multiple of 4, got {}",
                self.forward_window
            )));
        }
        if self.lease_delta_us >= self.lease_time_us {
            return Err(RtxError::Config(format!(
                "lease delta {}us must be shorter than the lease {}us",
                self.lease_delta_us, self.lease_time_us
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the number of machines
    pub fn nodes(mut self, nodes: usize) -> Self {
        self.config.nodes = nodes;
        self
    }

    /// Set the concurrency-control protocol
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Choose one-sided verbs or RPC per operation
    pub fn one_sided(mut self, ops: OneSidedOps) -> Self {
        self.config.one_sided = ops;
        self
    }

    pub fn replication_factor(mut self, factor: usize) -> Self {
        self.config.replication_factor = factor;
        self
    }

    pub fn two_phase_commit(mut self, enabled: bool) -> Self {
        self.config.two_phase_commit = enabled;
        self
    }

    /// Enable the no-abort debugging mode
    pub fn no_abort(mut self, enabled: bool) -> Self {
        self.config.no_abort = enabled;
        self
    }

    /// Set the NOWAIT lease length and skew tolerance (microseconds)
    pub fn lease(mut self, time_us: u64, delta_us: u64) -> Self {
        self.config.lease_time_us = time_us;
        self.config.lease_delta_us = delta_us;
        self
    }

    pub fn renew_policy(mut self, policy: RenewPolicy) -> Self {
        self.config.renew_policy = policy;
        self
    }

    pub fn mvcc_lock_spin_limit(mut self, limit: u32) -> Self {
        self.config.mvcc_lock_spin_limit = limit;
        self
    }

    /// Set the record zone size (in bytes)
    pub fn record_zone_bytes(mut self, bytes: usize) -> Self {
        self.config.record_zone_bytes = bytes;
        self
    }

    /// Set the log ring geometry
    pub fn log_zone(mut self, slots: usize, slot_bytes: usize) -> Self {
        self.config.log_slots = slots;
        self.config.log_slot_bytes = slot_bytes;
        self
    }

    pub fn rdma_heap_chunk(mut self, bytes: usize) -> Self {
        self.config.rdma_heap_chunk = bytes;
        self
    }

    pub fn coroutines(mut self, count: usize) -> Self {
        self.config.coroutines = count;
        self
    }

    /// Set the Calvin forwarding geometry
    pub fn forwarding(mut self, window: usize, max_value: usize) -> Self {
        self.config.forward_window = window;
        self.config.max_forward_value = max_value;
        self
    }

    pub fn build(self) -> Config {
        if self.config.no_abort {
            tracing::warn!("no_abort is enabled: failed validations will commit anyway");
        }
        self.config
    }
}
