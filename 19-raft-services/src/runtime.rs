//! Worker runtime for Raft nodes.
//!
//! Each node runs one worker thread that owns its [`RaftNode`] and multiplexes
//! three event sources with `crossbeam_channel::select!`:
//!
//! - **Requests** from the service layer (propose, read-index probe, status)
//! - **Messages** from peers, delivered through the in-process [`Network`]
//! - **Ticks** every `tick_interval`, driving elections and heartbeats
//!
//! The worker decodes committed entries and pushes them onto the commit
//! stream consumed by the service's apply loop. It never touches service
//! state, so a service may call into [`RaftHandle`] while holding its own lock.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use raft::StateRole;
use raft::prelude::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::command::{self, ApplyMsg};
use crate::consensus::{Consensus, NotLeader, Role, Ticket};
use crate::error::RuntimeError;
use crate::network::Network;
use crate::node::{CommittedEntry, RaftNode};
use crate::settings::RaftSettings;

/// Snapshot of a node's consensus state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: Role,
    pub leader_id: u64,
    pub term: u64,
    pub commit_index: u64,
}

/// Requests sent from service threads to the worker thread.
enum Request {
    Propose {
        data: Vec<u8>,
        respond_to: Sender<Option<Ticket>>,
    },
    ReadIndex {
        ctx: Vec<u8>,
        respond_to: Sender<Option<u64>>,
    },
    Status {
        respond_to: Sender<NodeStatus>,
    },
    Campaign,
    Shutdown,
}

fn role_from(state: StateRole) -> Role {
    match state {
        StateRole::Follower => Role::Follower,
        StateRole::PreCandidate => Role::PreCandidate,
        StateRole::Candidate => Role::Candidate,
        StateRole::Leader => Role::Leader,
    }
}

fn role_to_u8(role: Role) -> u8 {
    match role {
        Role::Follower => 0,
        Role::PreCandidate => 1,
        Role::Candidate => 2,
        Role::Leader => 3,
    }
}

fn role_from_u8(raw: u8) -> Role {
    match raw {
        3 => Role::Leader,
        2 => Role::Candidate,
        1 => Role::PreCandidate,
        _ => Role::Follower,
    }
}

/// Handle to a running Raft worker; implements [`Consensus`] for commands of
/// type `C`.
pub struct RaftHandle<C> {
    id: u64,
    request_tx: Sender<Request>,
    role: Arc<AtomicU8>,
    next_read: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    _command: PhantomData<fn(C)>,
}

/// Spawns the worker for node `id` and returns its handle plus the commit
/// stream.
///
/// # Errors
///
/// Returns error if `id` is not among `voters`, if the id is already
/// registered on `network`, or if the raft node cannot be built.
pub fn spawn_raft<C>(
    id: u64,
    voters: &[u64],
    network: Arc<Network>,
    settings: RaftSettings,
) -> Result<(RaftHandle<C>, Receiver<ApplyMsg<C>>)>
where
    C: Serialize + DeserializeOwned + Send + 'static,
{
    if !voters.contains(&id) {
        return Err(RuntimeError::UnknownNode(id).into());
    }

    let node = RaftNode::new(id, voters, &settings)?;
    let inbox = network.register(id)?;
    let (request_tx, request_rx) = unbounded();
    let (apply_tx, apply_rx) = unbounded();
    let role = Arc::new(AtomicU8::new(role_to_u8(Role::Follower)));

    let worker = Worker {
        node,
        network,
        inbox,
        request_rx,
        apply_tx,
        role: Arc::clone(&role),
        pending_reads: HashMap::new(),
        last_role: StateRole::Follower,
        tick_interval: settings.tick_interval,
    };
    let handle = thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = worker.run() {
                warn!(node = id, error = ?err, "raft worker crashed");
            }
        })
        .context("failed to spawn raft worker")?;

    Ok((
        RaftHandle {
            id,
            request_tx,
            role,
            next_read: AtomicU64::new(1),
            worker: Mutex::new(Some(handle)),
            _command: PhantomData,
        },
        apply_rx,
    ))
}

impl<C> RaftHandle<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current consensus state, or `None` once the worker has stopped.
    pub fn status(&self) -> Option<NodeStatus> {
        let (tx, rx) = bounded(1);
        self.request_tx.send(Request::Status { respond_to: tx }).ok()?;
        rx.recv().ok()
    }

    /// Forces this node to start an election.
    pub fn campaign(&self) {
        let _ = self.request_tx.send(Request::Campaign);
    }

    /// Stops the worker and waits for it. The commit stream closes with it.
    pub fn shutdown(&self) {
        let _ = self.request_tx.send(Request::Shutdown);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.role.store(role_to_u8(Role::Follower), Ordering::Release);
    }
}

impl<C> Drop for RaftHandle<C> {
    fn drop(&mut self) {
        let _ = self.request_tx.send(Request::Shutdown);
    }
}

impl<C> Consensus<C> for RaftHandle<C>
where
    C: Serialize + Send + 'static,
{
    fn start(&self, command: C) -> Result<Ticket, NotLeader> {
        if !self.role().is_leader() {
            return Err(NotLeader);
        }
        let data = command::encode(&command).map_err(|err| {
            warn!(node = self.id, error = ?err, "refusing command that does not encode");
            NotLeader
        })?;
        let (tx, rx) = bounded(1);
        self.request_tx
            .send(Request::Propose {
                data,
                respond_to: tx,
            })
            .map_err(|_| NotLeader)?;
        rx.recv().ok().flatten().ok_or(NotLeader)
    }

    fn role(&self) -> Role {
        role_from_u8(self.role.load(Ordering::Acquire))
    }

    fn confirm_leadership(&self, within: Duration) -> Option<u64> {
        if !self.role().is_leader() {
            return None;
        }
        let ctx = self.next_read.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec();
        let (tx, rx) = bounded(1);
        if self
            .request_tx
            .send(Request::ReadIndex {
                ctx,
                respond_to: tx,
            })
            .is_err()
        {
            return None;
        }
        rx.recv_timeout(within).ok().flatten()
    }
}

/// The worker that runs the Raft event loop.
struct Worker<C> {
    node: RaftNode,
    network: Arc<Network>,
    inbox: Receiver<Message>,
    request_rx: Receiver<Request>,
    apply_tx: Sender<ApplyMsg<C>>,
    role: Arc<AtomicU8>,
    pending_reads: HashMap<Vec<u8>, Sender<Option<u64>>>,
    last_role: StateRole,
    tick_interval: Duration,
}

impl<C: DeserializeOwned> Worker<C> {
    /// Runs the main event loop until shutdown.
    ///
    /// Each iteration waits (at most until the next tick) for a request or a
    /// peer message, ticks when due, drains Ready state, then publishes the
    /// role so that `Consensus::role` stays a plain atomic load.
    fn run(mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = self
                .tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::from_secs(0));

            crossbeam_channel::select! {
                recv(self.request_rx) -> req => match req {
                    Ok(req) => {
                        if !self.handle_request(req)? {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(self.inbox) -> msg => {
                    if let Ok(msg) = msg {
                        // Stale or out-of-order messages are expected under
                        // partitions; raft rejects them without harm.
                        if let Err(err) = self.node.step(msg) {
                            debug!(node = self.node.id(), error = ?err, "ignored message");
                        }
                    }
                },
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.publish_role();
        }

        self.fail_pending_reads();
        debug!(node = self.node.id(), "raft worker stopped");
        Ok(())
    }

    /// Returns `false` if shutdown was requested.
    fn handle_request(&mut self, req: Request) -> Result<bool> {
        match req {
            Request::Propose { data, respond_to } => {
                let ticket = match self.node.propose(data) {
                    Ok(ticket) => Some(ticket),
                    Err(err) => {
                        debug!(node = self.node.id(), error = ?err, "proposal rejected");
                        None
                    }
                };
                let _ = respond_to.send(ticket);
            }
            Request::ReadIndex { ctx, respond_to } => {
                if self.node.role() == StateRole::Leader {
                    self.pending_reads.insert(ctx.clone(), respond_to);
                    self.node.read_index(ctx);
                } else {
                    let _ = respond_to.send(None);
                }
            }
            Request::Status { respond_to } => {
                let _ = respond_to.send(NodeStatus {
                    node_id: self.node.id(),
                    role: role_from(self.node.role()),
                    leader_id: self.node.leader_id(),
                    term: self.node.term(),
                    commit_index: self.node.commit_index(),
                });
            }
            Request::Campaign => {
                info!(node = self.node.id(), role = ?self.node.role(), "campaign requested");
                if let Err(err) = self.node.campaign() {
                    warn!(node = self.node.id(), error = ?err, "campaign failed");
                }
            }
            Request::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    /// Drains all ready state: dispatch messages first, then answer
    /// confirmed reads, then hand committed entries to the apply loop.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for read in bundle.confirmed_reads {
                if let Some(respond_to) = self.pending_reads.remove(&read.ctx) {
                    let _ = respond_to.send(Some(read.index));
                }
            }
            for entry in bundle.committed {
                self.deliver(entry);
            }
        }
        Ok(())
    }

    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }
        self.network.send(msg);
        Ok(())
    }

    fn deliver(&self, entry: CommittedEntry) {
        let CommittedEntry { index, term, data } = entry;
        let msg = match data.map(|bytes| command::decode::<C>(&bytes)) {
            Some(Ok(command)) => ApplyMsg::Command {
                index,
                term,
                command,
            },
            Some(Err(err)) => {
                warn!(node = self.node.id(), index, error = ?err, "undecodable entry treated as no-op");
                ApplyMsg::NoOp { index, term }
            }
            None => ApplyMsg::NoOp { index, term },
        };
        if self.apply_tx.send(msg).is_err() {
            debug!(node = self.node.id(), index, "apply loop gone, dropping committed entry");
        }
    }

    fn publish_role(&mut self) {
        let current = self.node.role();
        self.role.store(role_to_u8(role_from(current)), Ordering::Release);
        if current != self.last_role {
            info!(
                node = self.node.id(),
                from = ?self.last_role,
                to = ?current,
                term = self.node.term(),
                leader = self.node.leader_id(),
                "role changed"
            );
            if self.last_role == StateRole::Leader {
                self.fail_pending_reads();
            }
            self.last_role = current;
        }
    }

    fn fail_pending_reads(&mut self) {
        for (_, respond_to) in self.pending_reads.drain() {
            let _ = respond_to.send(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::KvCommand;

    fn wait_for_leader(handles: &[RaftHandle<KvCommand>]) -> usize {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(i) = handles.iter().position(|h| h.role().is_leader()) {
                return i;
            }
            assert!(Instant::now() < deadline, "no leader elected");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn spawn_cluster(n: u64) -> Result<(Arc<Network>, Vec<RaftHandle<KvCommand>>, Vec<Receiver<ApplyMsg<KvCommand>>>)> {
        let network = Network::new();
        let voters: Vec<u64> = (1..=n).collect();
        let mut handles = Vec::new();
        let mut streams = Vec::new();
        for &id in &voters {
            let (handle, stream) = spawn_raft(id, &voters, Arc::clone(&network), RaftSettings::fast())?;
            handles.push(handle);
            streams.push(stream);
        }
        Ok((network, handles, streams))
    }

    fn put(key: &str) -> KvCommand {
        KvCommand {
            key: key.to_string(),
            op: crate::command::KvOp::Put {
                value: "v".to_string(),
            },
            id: format!("req-{key}"),
        }
    }

    fn next_command(stream: &Receiver<ApplyMsg<KvCommand>>) -> (u64, KvCommand) {
        loop {
            match stream.recv_timeout(Duration::from_secs(5)).expect("commit") {
                ApplyMsg::Command { index, command, .. } => return (index, command),
                ApplyMsg::NoOp { .. } => continue,
            }
        }
    }

    #[test]
    fn rejects_node_outside_voters() {
        let network = Network::new();
        let result = spawn_raft::<KvCommand>(9, &[1, 2, 3], network, RaftSettings::fast());
        assert!(result.is_err());
    }

    #[test]
    fn leader_commits_and_followers_see_the_same_entry() -> Result<()> {
        let (_network, handles, streams) = spawn_cluster(3)?;
        let leader = wait_for_leader(&handles);

        let ticket = handles[leader].start(put("a")).expect("leader accepts");
        for stream in &streams {
            let (index, command) = next_command(stream);
            assert_eq!(index, ticket.index);
            assert_eq!(command, put("a"));
        }

        let follower = (leader + 1) % handles.len();
        assert_eq!(handles[follower].start(put("b")), Err(NotLeader));

        for handle in &handles {
            handle.shutdown();
        }
        Ok(())
    }

    #[test]
    fn probe_succeeds_on_leader_only() -> Result<()> {
        let (network, handles, _streams) = spawn_cluster(3)?;
        let leader = wait_for_leader(&handles);
        assert!(handles[leader].confirm_leadership(Duration::from_secs(2)).is_some());

        let follower = (leader + 1) % handles.len();
        assert_eq!(handles[follower].confirm_leadership(Duration::from_millis(200)), None);

        network.isolate(handles[leader].id());
        // Either the probe finds no quorum or the leader already stepped down.
        assert_eq!(handles[leader].confirm_leadership(Duration::from_millis(300)), None);

        for handle in &handles {
            handle.shutdown();
        }
        Ok(())
    }

    #[test]
    fn status_reports_role_and_stops_after_shutdown() -> Result<()> {
        let (_network, handles, _streams) = spawn_cluster(1)?;
        wait_for_leader(&handles);

        let status = handles[0].status().expect("worker running");
        assert_eq!(status.node_id, 1);
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.leader_id, 1);

        handles[0].shutdown();
        assert!(handles[0].status().is_none());
        assert_eq!(handles[0].role(), Role::Follower);
        Ok(())
    }
}
