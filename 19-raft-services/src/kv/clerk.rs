//! Client library for the key-value service.

use std::sync::Arc;
use std::thread;

use anyhow::{Result, ensure};
use nanoid::nanoid;
use tracing::trace;

use crate::command::RequestId;
use crate::rpc::{GetArgs, KvService, PutAppendArgs, PutAppendOp, Status};
use crate::settings::ClerkSettings;

/// Sends requests to whichever server currently leads, retrying until one
/// of them answers with an outcome.
///
/// A clerk is meant for one caller at a time; run several clerks for
/// concurrent clients.
pub struct KvClerk {
    servers: Vec<Arc<dyn KvService>>,
    client_id: String,
    next_request: u64,
    leader: usize,
    settings: ClerkSettings,
}

impl KvClerk {
    /// # Errors
    ///
    /// Returns error if `servers` is empty.
    pub fn new(servers: Vec<Arc<dyn KvService>>, settings: ClerkSettings) -> Result<Self> {
        ensure!(!servers.is_empty(), "a clerk needs at least one server");
        Ok(Self {
            servers,
            client_id: nanoid!(8),
            next_request: 0,
            leader: 0,
            settings,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn request_id(&mut self) -> RequestId {
        self.next_request += 1;
        format!("{}-{}", self.client_id, self.next_request)
    }

    /// Fetches the current value of `key`; `None` if it was never written.
    pub fn get(&mut self, key: &str) -> Option<String> {
        let args = GetArgs {
            key: key.to_string(),
            id: self.request_id(),
        };
        self.call(|server| {
            let reply = server.get(&args);
            if reply.wrong_leader {
                return None;
            }
            match reply.err {
                Status::Ok => Some(Some(reply.value)),
                Status::NoKey => Some(None),
                _ => None,
            }
        })
    }

    pub fn put(&mut self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Put);
    }

    pub fn append(&mut self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Append);
    }

    fn put_append(&mut self, key: &str, value: &str, op: PutAppendOp) {
        // Every retry reuses the id so the write lands at most once.
        let args = PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            op,
            id: self.request_id(),
        };
        self.call(|server| {
            let reply = server.put_append(&args);
            (!reply.wrong_leader && reply.err.is_success()).then_some(())
        });
    }

    /// Tries servers starting from the last known leader until `attempt`
    /// yields a result, pausing after each full round.
    fn call<T>(&mut self, mut attempt: impl FnMut(&dyn KvService) -> Option<T>) -> T {
        let count = self.servers.len();
        loop {
            for offset in 0..count {
                let index = (self.leader + offset) % count;
                if let Some(result) = attempt(self.servers[index].as_ref()) {
                    self.leader = index;
                    return result;
                }
                trace!(client = %self.client_id, server = index, "no answer, trying next server");
            }
            thread::sleep(self.settings.retry_interval);
        }
    }
}
