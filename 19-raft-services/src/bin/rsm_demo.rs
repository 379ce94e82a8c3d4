//! Boots an in-process cluster and drives a scripted workload through clerks.
//!
//! # Example usage
//!
//! ```bash
//! # Five KV replicas, four concurrent clients, leader crashes midway
//! RUST_LOG=info cargo run --bin rsm-demo -- kv --nodes 5 --clients 4 --crash-leader
//!
//! # Configuration master with logged reads
//! cargo run --bin rsm-demo -- master --read-mode log
//! ```

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use raft_services::cluster::{KvCluster, MasterCluster};
use raft_services::master::NSHARDS;
use raft_services::settings::{ClerkSettings, RaftSettings, ReadMode, ServiceSettings};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated service cluster in one process")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Key-value service: concurrent clients append to their own keys.
    Kv(KvArgs),
    /// Configuration master: groups join, shards move, groups leave.
    Master(ClusterArgs),
}

#[derive(Args, Debug, Clone)]
struct ClusterArgs {
    /// Number of replicas.
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Raft tick interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// How long a handler waits for its entry to apply, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    apply_timeout_ms: u64,

    /// How reads are served.
    #[arg(long, value_enum, default_value_t = ReadModeArg::Probe)]
    read_mode: ReadModeArg,

    /// Crash the current leader halfway through the workload.
    #[arg(long)]
    crash_leader: bool,
}

#[derive(Args, Debug, Clone)]
struct KvArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Number of concurrent clerks.
    #[arg(long, default_value_t = 3)]
    clients: usize,

    /// Appends per clerk.
    #[arg(long, default_value_t = 20)]
    ops: usize,

    /// Probability that any Raft message is dropped.
    #[arg(long, default_value_t = 0.0)]
    drop_rate: f64,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ReadModeArg {
    Probe,
    Log,
}

impl ClusterArgs {
    fn raft(&self) -> RaftSettings {
        RaftSettings {
            tick_interval: Duration::from_millis(self.tick_ms),
            ..RaftSettings::default()
        }
    }

    fn service(&self) -> ServiceSettings {
        ServiceSettings {
            apply_timeout: Duration::from_millis(self.apply_timeout_ms),
            read_mode: match self.read_mode {
                ReadModeArg::Probe => ReadMode::LeaderProbe,
                ReadModeArg::Log => ReadMode::Log,
            },
            ..ServiceSettings::default()
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.nodes > 0, "--nodes must be at least 1");
        ensure!(
            !self.crash_leader || self.nodes >= 3,
            "--crash-leader needs at least 3 nodes to keep a majority"
        );
        Ok(())
    }

    /// Enough time for a few election rounds.
    fn election_wait(&self) -> Duration {
        Duration::from_millis(self.tick_ms * 100)
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Kv(args) => run_kv(&args),
        Command::Master(args) => run_master(&args),
    }
}

fn run_kv(args: &KvArgs) -> Result<()> {
    args.cluster.validate()?;
    ensure!((0.0..1.0).contains(&args.drop_rate), "--drop-rate must be in [0, 1)");
    let cluster = KvCluster::start_kv(args.cluster.nodes, args.cluster.raft(), args.cluster.service())?;
    let leader = cluster.wait_for_leader(args.cluster.election_wait())?;
    info!(leader = cluster.id(leader), "leader elected");
    cluster.network().set_drop_rate(args.drop_rate);

    let half = args.ops / 2;
    let workers = (0..args.clients)
        .map(|client| {
            let mut clerk = cluster.clerk(ClerkSettings::default())?;
            let ops = args.ops;
            thread::Builder::new()
                .name(format!("clerk-{client}"))
                .spawn(move || {
                    let key = format!("client-{client}");
                    for op in 0..ops {
                        clerk.append(&key, &format!("[{op}]"));
                    }
                    clerk.get(&key)
                })
                .context("failed to spawn clerk thread")
        })
        .collect::<Result<Vec<_>>>()?;

    if args.cluster.crash_leader {
        // Give the clerks time to get some writes in before the crash.
        thread::sleep(args.cluster.raft().tick_interval * half as u32);
        if let Some(leader) = cluster.leader() {
            warn!(node = cluster.id(leader), "crashing leader");
            cluster.crash(leader);
        }
    }

    for (client, worker) in workers.into_iter().enumerate() {
        let value = worker
            .join()
            .map_err(|_| anyhow!("clerk {client} panicked"))?
            .unwrap_or_default();
        let expected: String = (0..args.ops).map(|op| format!("[{op}]")).collect();
        if value == expected {
            info!(client, appends = args.ops, "client history intact");
        } else {
            warn!(client, %value, %expected, "client history diverged");
        }
    }

    cluster.network().set_drop_rate(0.0);
    let leader = cluster.wait_for_leader(args.cluster.election_wait())?;
    let snapshot = cluster.server(leader).snapshot();
    info!(keys = snapshot.len(), leader = cluster.id(leader), "workload done");
    cluster.shutdown();
    Ok(())
}

fn run_master(args: &ClusterArgs) -> Result<()> {
    args.validate()?;
    let cluster = MasterCluster::start_master(args.nodes, args.raft(), args.service())?;
    let leader = cluster.wait_for_leader(args.election_wait())?;
    info!(leader = cluster.id(leader), "leader elected");
    let mut clerk = cluster.clerk(ClerkSettings::default())?;

    for gid in 1..=3 {
        let servers = (0..3).map(|n| format!("g{gid}-s{n}")).collect();
        clerk.join(BTreeMap::from([(gid, servers)]))?;
        let config = clerk.query(-1);
        info!(num = config.num, shards = ?config.shards, "group {gid} joined");
    }

    if args.crash_leader {
        if let Some(leader) = cluster.leader() {
            warn!(node = cluster.id(leader), "crashing leader");
            cluster.crash(leader);
        }
    }

    clerk.move_shard(NSHARDS - 1, 1)?;
    let config = clerk.query(-1);
    info!(num = config.num, shards = ?config.shards, "moved shard {}", NSHARDS - 1);

    clerk.leave(vec![2])?;
    let config = clerk.query(-1);
    info!(num = config.num, shards = ?config.shards, "group 2 left");

    for num in 0..=config.num {
        let historical = clerk.query(num as i64);
        info!(num = historical.num, groups = ?historical.groups.keys().collect::<Vec<_>>(), "history");
    }
    cluster.shutdown();
    Ok(())
}
