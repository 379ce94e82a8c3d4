//! Client library for the configuration master.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use anyhow::{Result, ensure};
use nanoid::nanoid;
use tracing::trace;

use super::config::Config;
use crate::command::Gid;
use crate::error::ClerkError;
use crate::rpc::{AdminReply, JoinArgs, LeaveArgs, MasterService, MoveArgs, QueryArgs, Status};
use crate::settings::ClerkSettings;

/// Issues admin requests under one persistent client id. Writes are
/// numbered; the number only advances once a write is acknowledged, so a
/// retried write is recognised by the master.
pub struct MasterClerk {
    servers: Vec<Arc<dyn MasterService>>,
    client_id: String,
    seq: u64,
    leader: usize,
    settings: ClerkSettings,
}

/// Result of one attempt against one server.
enum Attempt<T> {
    Done(T),
    Rejected,
    Retry,
}

impl MasterClerk {
    /// # Errors
    ///
    /// Returns error if `servers` is empty.
    pub fn new(servers: Vec<Arc<dyn MasterService>>, settings: ClerkSettings) -> Result<Self> {
        ensure!(!servers.is_empty(), "a clerk needs at least one server");
        Ok(Self {
            servers,
            client_id: nanoid!(8),
            seq: 1,
            leader: 0,
            settings,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Adds replica groups, each with its server names.
    pub fn join(&mut self, servers: BTreeMap<Gid, Vec<String>>) -> Result<(), ClerkError> {
        let args = JoinArgs {
            servers,
            id: self.client_id.clone(),
            seq: self.seq,
        };
        self.write(|server| server.join(&args))
    }

    pub fn leave(&mut self, gids: Vec<Gid>) -> Result<(), ClerkError> {
        let args = LeaveArgs {
            gids,
            id: self.client_id.clone(),
            seq: self.seq,
        };
        self.write(|server| server.leave(&args))
    }

    /// Pins `shard` to `gid` without rebalancing the others.
    pub fn move_shard(&mut self, shard: usize, gid: Gid) -> Result<(), ClerkError> {
        let args = MoveArgs {
            shard,
            gid,
            id: self.client_id.clone(),
            seq: self.seq,
        };
        self.write(|server| server.move_shard(&args))
    }

    /// Configuration `num`; `-1` asks for the latest.
    pub fn query(&mut self, num: i64) -> Config {
        let args = QueryArgs { num };
        self.call(|server| {
            let reply = server.query(&args);
            if !reply.wrong_leader && reply.err == Status::Ok {
                Attempt::Done(reply.config)
            } else {
                Attempt::Retry
            }
        })
        .unwrap_or_default()
    }

    fn write(&mut self, mut send: impl FnMut(&dyn MasterService) -> AdminReply) -> Result<(), ClerkError> {
        let result = self.call(|server| {
            let reply = send(server);
            match reply.err {
                _ if reply.wrong_leader => Attempt::Retry,
                Status::InvalidArgument => Attempt::Rejected,
                status if status.is_success() => Attempt::Done(()),
                _ => Attempt::Retry,
            }
        });
        if result.is_some() {
            self.seq += 1;
        }
        result.ok_or(ClerkError::InvalidArgument)
    }

    /// Tries servers starting from the last known leader until one answers
    /// for good. `None` means the request was rejected.
    fn call<T>(&mut self, mut attempt: impl FnMut(&dyn MasterService) -> Attempt<T>) -> Option<T> {
        let count = self.servers.len();
        loop {
            for offset in 0..count {
                let index = (self.leader + offset) % count;
                match attempt(self.servers[index].as_ref()) {
                    Attempt::Done(result) => {
                        self.leader = index;
                        return Some(result);
                    }
                    Attempt::Rejected => {
                        self.leader = index;
                        return None;
                    }
                    Attempt::Retry => {
                        trace!(client = %self.client_id, server = index, "no answer, trying next server");
                    }
                }
            }
            thread::sleep(self.settings.retry_interval);
        }
    }
}
