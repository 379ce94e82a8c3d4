//! Request and reply types for both services, plus the traits clerks call.
//!
//! Every failure a client can observe is a field of a reply; handlers never
//! return `Result`. A reply with `wrong_leader = true` carries no other
//! information.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::{Gid, RequestId};
use crate::master::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Ok,
    /// Read miss. Informational, not a failure.
    NoKey,
    /// The write was applied earlier; a retry counts it as success.
    Executed,
    /// No outcome within the handler's window. Retry with the same id.
    Timeout,
    /// Rejected before reaching the log.
    InvalidArgument,
}

impl Status {
    /// Whether a write with this status has taken effect.
    pub fn is_success(self) -> bool {
        matches!(self, Status::Ok | Status::Executed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutAppendOp {
    Put,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetReply {
    pub wrong_leader: bool,
    pub err: Status,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: PutAppendOp,
    pub id: RequestId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub wrong_leader: bool,
    pub err: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinArgs {
    pub servers: BTreeMap<Gid, Vec<String>>,
    pub id: RequestId,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveArgs {
    pub gids: Vec<Gid>,
    pub id: RequestId,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveArgs {
    pub shard: usize,
    pub gid: Gid,
    pub id: RequestId,
    pub seq: u64,
}

/// Reply to Join, Leave and Move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdminReply {
    pub wrong_leader: bool,
    pub err: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryArgs {
    /// `-1` (or any number past the newest) asks for the latest configuration.
    pub num: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryReply {
    pub wrong_leader: bool,
    pub err: Status,
    pub config: Config,
}

macro_rules! wrong_leader_reply {
    ($($reply:ty),+ $(,)?) => {
        $(
            impl $reply {
                pub fn wrong_leader() -> Self {
                    Self {
                        wrong_leader: true,
                        ..Self::default()
                    }
                }

                pub fn with_status(err: Status) -> Self {
                    Self {
                        err,
                        ..Self::default()
                    }
                }
            }
        )+
    };
}

wrong_leader_reply!(GetReply, PutAppendReply, AdminReply, QueryReply);

/// Key-value RPC surface.
pub trait KvService: Send + Sync {
    fn get(&self, args: &GetArgs) -> GetReply;
    fn put_append(&self, args: &PutAppendArgs) -> PutAppendReply;
}

/// Configuration master RPC surface.
pub trait MasterService: Send + Sync {
    fn join(&self, args: &JoinArgs) -> AdminReply;
    fn leave(&self, args: &LeaveArgs) -> AdminReply;
    fn move_shard(&self, args: &MoveArgs) -> AdminReply;
    fn query(&self, args: &QueryArgs) -> QueryReply;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_leader_replies_carry_defaults() {
        let reply = GetReply::wrong_leader();
        assert!(reply.wrong_leader);
        assert_eq!(reply.err, Status::Ok);
        assert!(reply.value.is_empty());

        let reply = QueryReply::wrong_leader();
        assert_eq!(reply.config, Config::default());
    }

    #[test]
    fn executed_counts_as_success() {
        assert!(Status::Ok.is_success());
        assert!(Status::Executed.is_success());
        assert!(!Status::Timeout.is_success());
        assert!(!Status::NoKey.is_success());
    }
}
