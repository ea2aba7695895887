//! rtxkv Simulator Binary
//!
//! Builds an in-process cluster, spreads bank accounts over its nodes and
//! runs transfer transactions with the chosen protocol. Reports commits,
//! aborts per reason and checks that the total balance is conserved.

use std::sync::Arc;
use std::thread;

use clap::Parser;
use rand::Rng;
use rtxkv::config::OneSidedOps;
use rtxkv::events::AbortReason;
use rtxkv::node::NodeId;
use rtxkv::store::TableId;
use rtxkv::txn::calvin::{self, CalvinTxn, DeclaredSets, Sequencer};
use rtxkv::worker::TxnFuture;
use rtxkv::{Cluster, Config, Protocol, Result, TxnAlgorithm, TxnContext, Worker, WorkerStats};
use tracing_subscriber::{fmt, EnvFilter};

const ACCOUNTS: TableId = 0;
const BALANCE_LEN: usize = 8;

/// rtxkv transaction simulator
#[derive(Parser, Debug)]
#[command(name = "rtxkv-sim")]
#[command(about = "Run bank transfers over an in-process RDMA cluster")]
#[command(version)]
struct Args {
    /// Concurrency-control protocol (occ, mvcc, nowait, sundial, calvin)
    #[arg(short, long, default_value = "occ")]
    protocol: Protocol,

    /// Machines in the cluster
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// Worker threads per machine
    #[arg(short, long, default_value = "2")]
    workers: usize,

    /// Coroutines per worker (Calvin lanes)
    #[arg(short, long, default_value = "4")]
    coroutines: usize,

    /// Bank accounts, spread round-robin over the machines
    #[arg(short, long, default_value = "64")]
    accounts: u64,

    /// Transfers attempted per coroutine
    #[arg(short, long, default_value = "200")]
    iterations: u64,

    /// Opening balance of every account
    #[arg(short, long, default_value = "1000")]
    balance: u64,

    /// Backups each write set is logged to
    #[arg(short, long, default_value = "1")]
    replication: usize,

    /// Use RPC for every remote operation instead of one-sided verbs
    #[arg(long)]
    rpc_only: bool,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rtxkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("rtxkv simulator v{}", rtxkv::VERSION);
    tracing::info!("Protocol: {}", args.protocol);
    tracing::info!(
        "Cluster: {} nodes, {} workers x {} coroutines each",
        args.nodes,
        args.workers,
        args.coroutines
    );

    if let Err(e) = run(&args) {
        tracing::error!("Simulation failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    if args.accounts < 2 {
        return Err(rtxkv::RtxError::Config(format!(
            "transfers need at least 2 accounts, got {}",
            args.accounts
        )));
    }
    let ops = if args.rpc_only {
        OneSidedOps::none()
    } else {
        OneSidedOps::all()
    };
    let config = Config::builder()
        .nodes(args.nodes)
        .protocol(args.protocol)
        .one_sided(ops)
        .replication_factor(args.replication)
        .coroutines(args.coroutines)
        .build();
    let cluster = Cluster::new(config)?;

    for key in 0..args.accounts {
        let node = cluster.node(home(key, args.nodes))?;
        node.load(ACCOUNTS, key, &args.balance.to_le_bytes())?;
    }
    tracing::info!("Loaded {} accounts of {}", args.accounts, args.balance);

    let stats = match args.protocol {
        Protocol::Calvin => run_calvin(&cluster, args)?,
        _ => run_workers(&cluster, args)?,
    };

    report(&cluster, args, stats)
}

// =============================================================================
// Workloads
// =============================================================================

/// Node owning account `key`
fn home(key: u64, nodes: usize) -> NodeId {
    (key % nodes as u64) as NodeId
}

/// Two distinct accounts picked at random
fn pick_pair(accounts: u64) -> (u64, u64) {
    let mut rng = rand::rng();
    let from = rng.random_range(0..accounts);
    let to = (from + 1 + rng.random_range(0..accounts - 1)) % accounts;
    (from, to)
}

fn decode_balance(bytes: &[u8]) -> u64 {
    let mut word = [0u8; BALANCE_LEN];
    word.copy_from_slice(&bytes[..BALANCE_LEN]);
    u64::from_le_bytes(word)
}

/// Move `amount` between two accounts, aborting on insufficient funds
fn transfer<'a>(
    txn: &'a mut dyn TxnAlgorithm,
    nodes: usize,
    from: u64,
    to: u64,
    amount: u64,
) -> TxnFuture<'a> {
    Box::pin(async move {
        txn.begin().await?;
        let src = txn.write(home(from, nodes), ACCOUNTS, from, BALANCE_LEN).await?;
        let dst = txn.write(home(to, nodes), ACCOUNTS, to, BALANCE_LEN).await?;

        let available = decode_balance(txn.load_write(src, BALANCE_LEN)?);
        if available < amount {
            txn.abort().await?;
            return Ok(false);
        }
        let received = decode_balance(txn.load_write(dst, BALANCE_LEN)?);
        txn.load_write(src, BALANCE_LEN)?
            .copy_from_slice(&(available - amount).to_le_bytes());
        txn.load_write(dst, BALANCE_LEN)?
            .copy_from_slice(&(received + amount).to_le_bytes());

        txn.commit().await
    })
}

fn run_workers(cluster: &Arc<Cluster>, args: &Args) -> Result<WorkerStats> {
    let mut handles = Vec::new();
    for node in 0..args.nodes {
        for id in 0..args.workers {
            let worker = Worker::new(cluster.clone(), node as NodeId, id as u8);
            let (nodes, accounts, iterations) = (args.nodes, args.accounts, args.iterations);
            handles.push(thread::spawn(move || {
                worker.run(iterations, move |txn, _attempt| {
                    let (from, to) = pick_pair(accounts);
                    transfer(txn, nodes, from, to, 5)
                })
            }));
        }
    }

    let mut stats = WorkerStats::default();
    for handle in handles {
        let worker = handle
            .join()
            .map_err(|_| rtxkv::RtxError::Protocol("worker thread panicked".to_string()))??;
        stats.merge(worker);
    }
    Ok(stats)
}

/// Deterministic transfers: one lane per coroutine, each lane runs its
/// requests in order on every participant
fn run_calvin(cluster: &Arc<Cluster>, args: &Args) -> Result<WorkerStats> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let sequencer = Arc::new(Sequencer::new(cluster.clone()));

    runtime.block_on(async {
        let mut lanes = tokio::task::JoinSet::new();
        for lane in 0..args.coroutines {
            let mut txns = Vec::with_capacity(args.nodes);
            for node in 0..args.nodes {
                let ctx = TxnContext::new(cluster.clone(), node as NodeId, 0, lane as u16)?;
                txns.push(CalvinTxn::new(ctx));
            }
            let sequencer = sequencer.clone();
            let (nodes, accounts, iterations) = (args.nodes, args.accounts, args.iterations);

            lanes.spawn(async move {
                let mut stats = WorkerStats::default();
                for _ in 0..iterations {
                    let (from, to) = pick_pair(accounts);
                    let sets = DeclaredSets::new()
                        .write(home(from, nodes), ACCOUNTS, from, BALANCE_LEN)
                        .write(home(to, nodes), ACCOUNTS, to, BALANCE_LEN);
                    let request = sequencer.submit(lane as u16, sets)?;

                    let logic = Arc::new(|t: &mut CalvinTxn| -> Result<()> {
                        let available = decode_balance(t.load_write(0, BALANCE_LEN)?);
                        if available < 5 {
                            return Ok(());
                        }
                        let received = decode_balance(t.load_write(1, BALANCE_LEN)?);
                        t.load_write(0, BALANCE_LEN)?
                            .copy_from_slice(&(available - 5).to_le_bytes());
                        t.load_write(1, BALANCE_LEN)?
                            .copy_from_slice(&(received + 5).to_le_bytes());
                        Ok(())
                    });
                    let (back, _) = calvin::run_request(txns, request, logic).await?;
                    txns = back;
                    stats.committed += 1;
                }
                Ok::<_, rtxkv::RtxError>(stats)
            });
        }

        let mut stats = WorkerStats::default();
        while let Some(joined) = lanes.join_next().await {
            let lane = joined.map_err(|e| rtxkv::RtxError::Protocol(format!("lane failed: {}", e)))??;
            stats.merge(lane);
        }
        Ok::<_, rtxkv::RtxError>(stats)
    })
}

// =============================================================================
// Report
// =============================================================================

fn report(cluster: &Arc<Cluster>, args: &Args, stats: WorkerStats) -> Result<()> {
    tracing::info!(
        committed = stats.committed,
        aborted = stats.aborted,
        failed = stats.failed,
        "Run finished after {} attempts",
        stats.attempts()
    );

    for reason in AbortReason::ALL {
        let count: u64 = cluster
            .nodes()
            .iter()
            .map(|n| n.collector().aborts(reason))
            .sum();
        if count > 0 {
            tracing::info!("  {:<20} {}", reason.as_str(), count);
        }
    }

    for node in cluster.nodes() {
        let verbs = node.counters().snapshot();
        tracing::debug!(node = node.id(), verbs = ?verbs, "verb counters");
    }

    let mut total = 0u64;
    for key in 0..args.accounts {
        let node = cluster.node(home(key, args.nodes))?;
        total += decode_balance(&node.committed_value(ACCOUNTS, key)?);
    }
    let expected = args.accounts * args.balance;
    if total != expected {
        return Err(rtxkv::RtxError::Storage(format!(
            "total balance {} differs from the loaded {}",
            total, expected
        )));
    }
    tracing::info!("Total balance conserved: {}", total);
    Ok(())
}
