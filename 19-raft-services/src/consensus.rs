//! The seam between the replicated services and the consensus log.
//!
//! Services only ever see this trait plus the commit stream
//! (`Receiver<ApplyMsg<C>>`) handed to them at construction. Leader
//! election, replication and persistence live behind it.

use std::fmt;
use std::time::Duration;

/// Current role of a replica, as last published by its consensus worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl Role {
    pub fn is_leader(self) -> bool {
        self == Role::Leader
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::PreCandidate => "pre-candidate",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Where a submitted command was placed in the log.
///
/// The command is committed at `index` only if the entry found there at apply
/// time carries the same `term`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub index: u64,
    pub term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("this replica is not the leader")]
pub struct NotLeader;

/// Interface consumed from the consensus layer.
pub trait Consensus<C>: Send + Sync + 'static {
    /// Appends `command` to the leader's log without waiting for commitment.
    fn start(&self, command: C) -> Result<Ticket, NotLeader>;

    /// Pure read of the current role.
    fn role(&self) -> Role;

    /// Asks a quorum whether this replica is still leader. On confirmation
    /// returns the commit index a linearizable read must wait to apply;
    /// `None` when no confirmation arrives within `within`.
    fn confirm_leadership(&self, within: Duration) -> Option<u64>;
}
