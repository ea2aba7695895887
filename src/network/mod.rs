//! Network Module
//!
//! The simulated RDMA fabric connecting the nodes of a cluster.
//!
//! ## Architecture
//! - One-sided verbs (read, write, CAS, FAA) act directly on a target
//!   node's memory region
//! - Batched RPCs are delivered to the target's service handler
//! - Every verb and RPC suspends the calling coroutine, the way a real
//!   round trip would

mod fabric;
mod service;

pub use fabric::Cluster;
