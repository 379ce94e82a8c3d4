use thiserror::Error;

use crate::consensus::NotLeader;
use crate::rpc::Status;

/// Why a submitted command produced no result for its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("not leader")]
    NotLeader,
    /// The entry may still commit later; retry with the same request id.
    #[error("timed out waiting for the entry to apply")]
    Timeout,
    /// A different entry was committed at the ticket's index.
    #[error("log entry at index {index} was replaced")]
    Superseded { index: u64 },
}

impl SubmitError {
    /// Superseded entries mean another leader took over the index, so the
    /// client should look elsewhere.
    pub fn is_wrong_leader(self) -> bool {
        matches!(self, SubmitError::NotLeader | SubmitError::Superseded { .. })
    }

    /// Reply status for this failure; only meaningful when not
    /// [`is_wrong_leader`](Self::is_wrong_leader).
    pub fn status(self) -> Status {
        match self {
            SubmitError::Timeout => Status::Timeout,
            SubmitError::NotLeader | SubmitError::Superseded { .. } => Status::Ok,
        }
    }
}

impl From<NotLeader> for SubmitError {
    fn from(_: NotLeader) -> Self {
        SubmitError::NotLeader
    }
}

/// Failures while wiring up consensus workers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("node {0} is not a member of the cluster")]
    UnknownNode(u64),
    #[error("node {0} is already registered on the network")]
    DuplicateNode(u64),
}

/// Requests a clerk gives up on instead of retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClerkError {
    #[error("request rejected as invalid")]
    InvalidArgument,
}
