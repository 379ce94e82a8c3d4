//! Core Raft node implementation.
//!
//! This module wraps the tikv/raft library to provide a simplified interface for
//! running a Raft consensus node. [`RaftNode`] only orders opaque byte payloads;
//! decoding them and applying them to a state machine happens elsewhere.

use anyhow::{Context, Result, bail};
use raft::StateRole;
use raft::prelude::{ConfState, Config, Entry, EntryType, Message, RawNode};
use raft::storage::MemStorage;
use slog::{Logger, o};

use crate::consensus::Ticket;
use crate::settings::RaftSettings;

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a logger, but we handle logging at the application
/// level instead. This avoids duplicate/verbose Raft internals in our output.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// A committed log position.
///
/// `data` is `None` for entries that carry no application command: the empty
/// entry a new leader appends, and membership changes.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedEntry {
    pub index: u64,
    pub term: u64,
    pub data: Option<Vec<u8>>,
}

/// Output from processing a Raft ready state.
///
/// - **messages**: Raft messages to send to other nodes
/// - **committed**: Entries that became committed, in index order
/// - **confirmed_reads**: Read-index requests a quorum has confirmed
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub committed: Vec<CommittedEntry>,
    pub confirmed_reads: Vec<ConfirmedRead>,
}

/// A read-index round that a quorum acknowledged. Reads are linearizable
/// once the state machine has applied up to `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedRead {
    pub ctx: Vec<u8>,
    pub index: u64,
}

/// A Raft consensus node backed by in-memory storage.
///
/// We use `MemStorage` because persistence is delegated away from this crate;
/// a restarted node rejoins empty and catches up from the leader.
pub struct RaftNode {
    id: u64,
    raw: RawNode<MemStorage>,
    storage: MemStorage,
}

impl RaftNode {
    /// Creates a new Raft node with the given ID and cluster configuration.
    ///
    /// `check_quorum` is enabled so that a leader cut off from the majority
    /// steps down after an election timeout instead of believing it still leads.
    pub fn new(id: u64, voters: &[u64], settings: &RaftSettings) -> Result<Self> {
        let cfg = Config {
            id,
            election_tick: settings.election_tick,
            heartbeat_tick: settings.heartbeat_tick,
            max_inflight_msgs: 256,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        let storage = MemStorage::new_with_conf_state(ConfState::from((voters.to_vec(), vec![])));
        let logger = silent_logger();
        let raw = RawNode::new(&cfg, storage.clone(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self { id, raw, storage })
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election to become leader.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Returns the current leader's ID, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn commit_index(&self) -> u64 {
        self.raw.raft.raft_log.committed
    }

    /// Appends `data` to the leader's log and reports where it landed.
    ///
    /// Only a leader may propose: tikv/raft would forward a follower's
    /// proposal to the leader, which would leave the caller without a ticket.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<Ticket> {
        if self.role() != StateRole::Leader {
            bail!("node {} is not the leader", self.id);
        }
        self.raw.propose(vec![], data).context("propose failed")?;
        Ok(Ticket {
            index: self.raw.raft.raft_log.last_index(),
            term: self.raw.raft.term,
        })
    }

    /// Starts a read-index round; `ctx` shows up in a later
    /// [`ReadyBundle::confirmed_reads`] once a quorum has acknowledged it.
    pub fn read_index(&mut self, ctx: Vec<u8>) {
        self.raw.read_index(ctx);
    }

    /// Processes a Raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Checks if Raft has work to do, processes it, and returns results.
    ///
    /// Returns `None` if nothing to do, or `Some(ReadyBundle)` with messages to
    /// send, newly committed entries and confirmed reads.
    ///
    /// # Processing flow
    ///
    /// Raft uses a two-phase advancement protocol (Ready → LightReady):
    ///
    /// **Phase 1 (Ready)**: persist hard state, append entries, apply any
    /// snapshot, collect committed entries, read states and messages.
    ///
    /// **Phase 2 (LightReady)**: update the commit index and collect any
    /// further committed entries and messages.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut committed = Vec::new();
        let mut outbound = Vec::new();

        // Phase 1: Persist durable state

        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }

        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if !ready.snapshot().is_empty() {
            self.storage
                .wl()
                .apply_snapshot(ready.snapshot().clone())
                .context("apply snapshot failed")?;
        }

        let confirmed_reads = ready
            .read_states()
            .iter()
            .map(|state| ConfirmedRead {
                ctx: state.request_ctx.clone(),
                index: state.index,
            })
            .collect();

        committed.extend(collect_committed(ready.take_committed_entries()));
        outbound.extend(ready.take_messages());
        outbound.extend(ready.take_persisted_messages());

        // Phase 2: Continue processing after persistence acknowledgment

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }

        committed.extend(collect_committed(light_ready.take_committed_entries()));
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            committed,
            confirmed_reads,
        }))
    }
}

/// Keeps every committed index so the commit stream stays contiguous; only
/// non-empty normal entries carry a payload.
fn collect_committed(entries: Vec<Entry>) -> Vec<CommittedEntry> {
    entries
        .into_iter()
        .map(|entry| {
            let data = (entry.get_entry_type() == EntryType::EntryNormal && !entry.data.is_empty())
                .then(|| entry.data.to_vec());
            CommittedEntry {
                index: entry.index,
                term: entry.term,
                data,
            }
        })
        .collect()
}
