//! # rtxkv
//!
//! The distributed transaction core of an RDMA key-value store:
//! - Five concurrency-control protocols behind one interface: OCC, MVCC,
//!   NOWAIT two-phase locking, Sundial and Calvin
//! - Every remote step over one-sided verbs or batched RPC, per operation
//! - Two-phase commit and write-set replication to backup logs
//! - Cooperative coroutines per worker, suspended at every round trip
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Worker (one OS thread)                      │
//! │        coroutines on a current-thread tokio runtime         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ TxnAlgorithm
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │        OCC │ MVCC │ NOWAIT │ Sundial │ Calvin               │
//! │     read/write sets · staged buffers · 2PC · remote log     │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  One-sided  │          │   Batched   │
//!   │    verbs    │          │     RPC     │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │ service handler
//!          ▼                        ▼
//!   ┌─────────────────────────────────────────┐
//!   │  Node: memory region (records, log      │
//!   │  ring, forwarding slots) + side tables  │
//!   └─────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod config;
pub mod error;
pub mod events;

pub mod access;
pub mod commit;
pub mod gc;
pub mod log;
pub mod network;
pub mod node;
pub mod rpc;
pub mod rwset;
pub mod store;
pub mod txn;
pub mod worker;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, Protocol};
pub use error::{Result, RtxError};
pub use network::Cluster;
pub use txn::{new_txn, TxnAlgorithm, TxnContext};
pub use worker::{Worker, WorkerStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of rtxkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
