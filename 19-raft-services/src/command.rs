//! Commands that flow through the replicated log.
//!
//! Each service has its own tagged union. The same type is encoded when a
//! handler submits it and decoded when the apply loop receives it, so both
//! sites always agree on what an entry means.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Client-chosen identity of a request. Retries reuse the same id.
pub type RequestId = String;

/// Replica group identifier. `0` is reserved for "no group".
pub type Gid = u64;

/// Operations accepted by the key-value service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOp {
    /// Only replicated when reads are routed through the log.
    Get,
    Put { value: String },
    Append { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCommand {
    pub key: String,
    pub op: KvOp,
    pub id: RequestId,
}

impl KvCommand {
    pub fn is_write(&self) -> bool {
        !matches!(self.op, KvOp::Get)
    }
}

/// Operations accepted by the configuration master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigOp {
    Join { servers: BTreeMap<Gid, Vec<String>> },
    Leave { gids: Vec<Gid> },
    Move { shard: usize, gid: Gid },
    /// Only replicated when reads are routed through the log.
    Query { num: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigCommand {
    pub op: ConfigOp,
    pub id: RequestId,
    /// Per-client sequence number; grows by one after every acknowledged write.
    pub seq: u64,
}

impl ConfigCommand {
    pub fn is_write(&self) -> bool {
        !matches!(self.op, ConfigOp::Query { .. })
    }
}

/// One committed log position, delivered to the apply loop exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyMsg<C> {
    Command { index: u64, term: u64, command: C },
    /// Empty entries appended by a new leader, membership entries and
    /// anything that fails to decode. They occupy an index but change nothing.
    NoOp { index: u64, term: u64 },
}

impl<C> ApplyMsg<C> {
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::Command { index, .. } | ApplyMsg::NoOp { index, .. } => *index,
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            ApplyMsg::Command { term, .. } | ApplyMsg::NoOp { term, .. } => *term,
        }
    }
}

pub fn encode<C: Serialize>(command: &C) -> Result<Vec<u8>> {
    bincode::serialize(command).context("encode command failed")
}

pub fn decode<C: DeserializeOwned>(bytes: &[u8]) -> Result<C> {
    bincode::deserialize(bytes).context("decode command failed")
}
