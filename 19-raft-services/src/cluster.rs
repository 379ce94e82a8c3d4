//! In-process clusters: one Raft worker plus one service replica per node,
//! all wired to a shared [`Network`] that tests and the demo can partition.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use crossbeam_channel::Receiver;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::command::{ApplyMsg, ConfigCommand, KvCommand};
use crate::consensus::{Consensus, Role};
use crate::kv::{KvClerk, KvServer};
use crate::master::{MasterClerk, ShardMaster};
use crate::network::Network;
use crate::rpc::{KvService, MasterService};
use crate::runtime::{RaftHandle, spawn_raft};
use crate::settings::{ClerkSettings, RaftSettings, ServiceSettings};

/// A service replica that can be stopped from outside.
pub trait Killable: Send + Sync + 'static {
    fn kill(&self);
}

impl<L: Consensus<KvCommand>> Killable for KvServer<L> {
    fn kill(&self) {
        KvServer::kill(self);
    }
}

impl<L: Consensus<ConfigCommand>> Killable for ShardMaster<L> {
    fn kill(&self) {
        ShardMaster::kill(self);
    }
}

pub type KvCluster = Cluster<KvCommand, KvServer<RaftHandle<KvCommand>>>;
pub type MasterCluster = Cluster<ConfigCommand, ShardMaster<RaftHandle<ConfigCommand>>>;

/// Nodes are numbered 1..=n; index `i` in every accessor is node `i + 1`.
pub struct Cluster<C, S: Killable> {
    network: Arc<Network>,
    rafts: Vec<Arc<RaftHandle<C>>>,
    servers: Vec<Arc<S>>,
}

impl<C, S> Cluster<C, S>
where
    C: Serialize + DeserializeOwned + Send + 'static,
    S: Killable,
{
    fn start(
        n: usize,
        raft: RaftSettings,
        build: impl Fn(u64, Arc<RaftHandle<C>>, Receiver<ApplyMsg<C>>) -> Result<S>,
    ) -> Result<Self> {
        ensure!(n > 0, "a cluster needs at least one node");
        let network = Network::new();
        let voters: Vec<u64> = (1..=n as u64).collect();
        let mut rafts = Vec::with_capacity(n);
        let mut servers = Vec::with_capacity(n);
        for &id in &voters {
            let (handle, apply_rx) = spawn_raft(id, &voters, Arc::clone(&network), raft)
                .with_context(|| format!("failed to start raft node {id}"))?;
            let handle = Arc::new(handle);
            let server = build(id, Arc::clone(&handle), apply_rx)
                .with_context(|| format!("failed to start server {id}"))?;
            rafts.push(handle);
            servers.push(Arc::new(server));
        }
        info!(nodes = n, "cluster started");
        Ok(Self {
            network,
            rafts,
            servers,
        })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn server(&self, i: usize) -> &Arc<S> {
        &self.servers[i]
    }

    pub fn raft(&self, i: usize) -> &Arc<RaftHandle<C>> {
        &self.rafts[i]
    }

    /// Node id of index `i`.
    pub fn id(&self, i: usize) -> u64 {
        self.rafts[i].id()
    }

    /// Index of the leader with the highest term, if any node claims to lead.
    /// A deposed leader in a minority keeps claiming until it notices.
    pub fn leader(&self) -> Option<usize> {
        self.rafts
            .iter()
            .enumerate()
            .filter(|(_, raft)| raft.role() == Role::Leader)
            .filter_map(|(i, raft)| raft.status().map(|status| (status.term, i)))
            .max()
            .map(|(_, i)| i)
    }

    /// Polls until some node leads.
    ///
    /// # Errors
    ///
    /// Returns error if no leader emerges within `timeout`.
    pub fn wait_for_leader(&self, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader() {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                bail!("no leader elected within {timeout:?}");
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Cuts node `i` off from every other node.
    pub fn disconnect(&self, i: usize) {
        self.network.isolate(self.id(i));
    }

    pub fn reconnect(&self, i: usize) {
        self.network.reconnect(self.id(i));
    }

    /// Stops node `i` for good: its server stops answering and its Raft
    /// worker exits. Nothing is persisted, so a crashed node never returns.
    pub fn crash(&self, i: usize) {
        info!(node = self.id(i), "crashing node");
        self.network.isolate(self.id(i));
        self.servers[i].kill();
        self.rafts[i].shutdown();
    }
}

impl<C, S: Killable> Cluster<C, S> {
    pub fn shutdown(&self) {
        for server in &self.servers {
            server.kill();
        }
        for raft in &self.rafts {
            raft.shutdown();
        }
    }
}

impl<C, S: Killable> Drop for Cluster<C, S> {
    fn drop(&mut self) {
        // Clerks may still hold servers; stop them explicitly.
        self.shutdown();
    }
}

impl KvCluster {
    pub fn start_kv(n: usize, raft: RaftSettings, service: ServiceSettings) -> Result<Self> {
        Self::start(n, raft, |id, log, apply_rx| KvServer::new(id, log, apply_rx, service))
    }

    /// A clerk that knows every server of this cluster.
    pub fn clerk(&self, settings: ClerkSettings) -> Result<KvClerk> {
        let servers = self
            .servers
            .iter()
            .map(|server| Arc::clone(server) as Arc<dyn KvService>)
            .collect();
        KvClerk::new(servers, settings)
    }
}

impl MasterCluster {
    pub fn start_master(n: usize, raft: RaftSettings, service: ServiceSettings) -> Result<Self> {
        Self::start(n, raft, |id, log, apply_rx| ShardMaster::new(id, log, apply_rx, service))
    }

    pub fn clerk(&self, settings: ClerkSettings) -> Result<MasterClerk> {
        let servers = self
            .servers
            .iter()
            .map(|server| Arc::clone(server) as Arc<dyn MasterService>)
            .collect();
        MasterClerk::new(servers, settings)
    }
}
