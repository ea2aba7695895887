//! In-process fabric
//!
//! The cluster's interconnect. One-sided verbs act directly on the target
//! node's region; RPCs are decoded and served by the target's handler. Every
//! operation first yields to the worker's scheduler, so a coroutine issuing a
//! remote operation always gives other coroutines on its thread a turn before
//! it resumes with the completion.

use std::sync::Arc;

use bytes::Bytes;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Result, RtxError};
use crate::node::{Node, NodeId};

use super::service;

/// All machines of a cluster and the verbs connecting them
pub struct Cluster {
    config: Arc<Config>,
    nodes: Vec<Arc<Node>>,
}

impl Cluster {
    /// Build a cluster driven by the system clock
    pub fn new(config: Config) -> Result<Arc<Self>> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a cluster whose nodes share `clock`
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let nodes = (0..config.nodes)
            .map(|id| Arc::new(Node::new(id as NodeId, config.clone(), clock.clone())))
            .collect();

        tracing::info!(
            nodes = config.nodes,
            protocol = %config.protocol,
            replication = config.replication_factor,
            "cluster started"
        );
        Ok(Arc::new(Self { config, nodes }))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn node(&self, id: NodeId) -> Result<&Arc<Node>> {
        self.nodes
            .get(id as usize)
            .ok_or_else(|| RtxError::Network(format!("unknown node {}", id)))
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Backup machines holding the log of `id`: the next `replication_factor` nodes
    pub fn backups_of(&self, id: NodeId) -> Vec<NodeId> {
        let n = self.nodes.len();
        (1..=self.config.replication_factor)
            .map(|i| ((id as usize + i) % n) as NodeId)
            .collect()
    }

    /// Commits recorded across every node
    pub fn total_commits(&self) -> u64 {
        self.nodes.iter().map(|n| n.collector().commits()).sum()
    }

    /// Aborts recorded across every node
    pub fn total_aborts(&self) -> u64 {
        self.nodes.iter().map(|n| n.collector().total_aborts()).sum()
    }

    // =========================================================================
    // One-sided Verbs
    // =========================================================================

    pub async fn rdma_read(&self, node: NodeId, off: u64, buf: &mut [u8]) -> Result<()> {
        let target = self.node(node)?;
        tokio::task::yield_now().await;
        target.counters().read();
        target.region().read_bytes(off, buf)
    }

    pub async fn rdma_write(&self, node: NodeId, off: u64, data: &[u8]) -> Result<()> {
        let target = self.node(node)?;
        tokio::task::yield_now().await;
        target.counters().write();
        target.region().write_bytes(off, data)
    }

    /// Remote compare-and-swap; returns the value observed
    pub async fn rdma_cas(&self, node: NodeId, off: u64, expected: u64, new: u64) -> Result<u64> {
        let target = self.node(node)?;
        tokio::task::yield_now().await;
        target.counters().cas();
        target.region().cas(off, expected, new)
    }

    /// Remote fetch-and-add; returns the value before the addition
    pub async fn rdma_faa(&self, node: NodeId, off: u64, delta: u64) -> Result<u64> {
        let target = self.node(node)?;
        tokio::task::yield_now().await;
        target.counters().faa();
        target.region().fetch_add(off, delta)
    }

    // =========================================================================
    // RPC
    // =========================================================================

    /// Deliver a request buffer to `node` and wait for its reply
    pub async fn rpc(&self, node: NodeId, request: Bytes) -> Result<Bytes> {
        let target = self.node(node)?;
        tokio::task::yield_now().await;
        target.counters().rpc();
        let reply = service::handle(target, request).await;
        tokio::task::yield_now().await;
        reply
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.nodes.len())
            .field("protocol", &self.config.protocol)
            .finish()
    }
}
