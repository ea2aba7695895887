//! Worker: one OS thread running a set of transaction coroutines
//!
//! Each worker owns a current-thread tokio runtime. Its coroutines are tasks
//! on that runtime and interleave only at suspension points: every one-sided
//! verb and RPC yields, so one coroutine's round trip lets the others run.
//! Nothing is shared between coroutines except the cluster itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::error::{Result, RtxError};
use crate::network::Cluster;
use crate::node::NodeId;
use crate::txn::{new_txn, TxnAlgorithm, TxnContext};

/// One transaction attempt driven by workload code
///
/// Resolves to `Ok(true)` on commit and `Ok(false)` on abort.
pub type TxnFuture<'a> = Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

/// Outcome counts of a worker run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub committed: u64,
    pub aborted: u64,
    /// Attempts that failed with an error other than an abort
    pub failed: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: WorkerStats) {
        self.committed += other.committed;
        self.aborted += other.aborted;
        self.failed += other.failed;
    }

    pub fn attempts(&self) -> u64 {
        self.committed + self.aborted + self.failed
    }
}

/// A worker thread bound to one node
#[derive(Debug, Clone)]
pub struct Worker {
    cluster: Arc<Cluster>,
    node: NodeId,
    id: u8,
    coroutines: usize,
}

impl Worker {
    pub fn new(cluster: Arc<Cluster>, node: NodeId, id: u8) -> Self {
        let coroutines = cluster.config().coroutines;
        Self {
            cluster,
            node,
            id,
            coroutines,
        }
    }

    pub fn with_coroutines(mut self, coroutines: usize) -> Self {
        self.coroutines = coroutines;
        self
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Run `iterations` attempts per coroutine on a fresh current-thread runtime
    ///
    /// `body` gets the coroutine's transaction and the attempt number and
    /// drives one attempt from `begin` to `commit`.
    pub fn run<F>(&self, iterations: u64, body: F) -> Result<WorkerStats>
    where
        F: for<'a> Fn(&'a mut dyn TxnAlgorithm, u64) -> TxnFuture<'a> + Send + Sync + 'static,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run_async(iterations, Arc::new(body)))
    }

    /// Same as [`Worker::run`], on the caller's runtime
    pub async fn run_async<F>(&self, iterations: u64, body: Arc<F>) -> Result<WorkerStats>
    where
        F: for<'a> Fn(&'a mut dyn TxnAlgorithm, u64) -> TxnFuture<'a> + Send + Sync + 'static,
    {
        let mut coroutines = JoinSet::new();
        for cor in 0..self.coroutines {
            let ctx = TxnContext::new(self.cluster.clone(), self.node, self.id, cor as u16)?;
            let body = body.clone();
            coroutines.spawn(async move { run_coroutine(new_txn(ctx), iterations, body).await });
        }

        let mut stats = WorkerStats::default();
        while let Some(joined) = coroutines.join_next().await {
            let coroutine = joined.map_err(|e| RtxError::Protocol(format!("coroutine failed: {}", e)))?;
            stats.merge(coroutine);
        }

        tracing::info!(
            node = self.node,
            worker = self.id,
            committed = stats.committed,
            aborted = stats.aborted,
            failed = stats.failed,
            "worker finished"
        );
        Ok(stats)
    }
}

async fn run_coroutine<F>(mut txn: Box<dyn TxnAlgorithm>, iterations: u64, body: Arc<F>) -> WorkerStats
where
    F: for<'a> Fn(&'a mut dyn TxnAlgorithm, u64) -> TxnFuture<'a> + Send + Sync + 'static,
{
    let mut stats = WorkerStats::default();
    for attempt in 0..iterations {
        match (*body)(txn.as_mut(), attempt).await {
            Ok(true) => stats.committed += 1,
            Ok(false) => stats.aborted += 1,
            Err(e) if e.is_abort() => stats.aborted += 1,
            Err(e) => {
                stats.failed += 1;
                let ctx = txn.context();
                tracing::warn!(
                    node = ctx.node().id(),
                    worker = ctx.worker(),
                    cor = ctx.cor(),
                    error = %e,
                    "transaction failed"
                );
                if let Err(e) = txn.abort().await {
                    tracing::error!(error = %e, "abort after failure did not complete");
                }
            }
        }
    }
    stats
}
