//! In-process message routing between Raft workers.
//!
//! Every node registers a mailbox; [`Network::send`] delivers a message to the
//! destination's mailbox unless the two nodes are cut off from each other.
//! Tests use the fault controls to isolate nodes, split the cluster into
//! partitions, or drop a fraction of all messages.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender, unbounded};
use rand::Rng;
use raft::prelude::Message;
use tracing::trace;

use crate::error::RuntimeError;

#[derive(Default)]
struct Routes {
    mailboxes: HashMap<u64, Sender<Message>>,
    isolated: HashSet<u64>,
    /// Node id -> partition number. Empty means fully connected.
    sides: HashMap<u64, usize>,
    drop_rate: f64,
}

impl Routes {
    fn connected(&self, from: u64, to: u64) -> bool {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            return false;
        }
        match (self.sides.get(&from), self.sides.get(&to)) {
            (Some(a), Some(b)) => a == b,
            (None, None) => true,
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct Network {
    routes: Mutex<Routes>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the mailbox for node `id`.
    pub fn register(&self, id: u64) -> Result<Receiver<Message>, RuntimeError> {
        let mut routes = self.routes();
        if routes.mailboxes.contains_key(&id) {
            return Err(RuntimeError::DuplicateNode(id));
        }
        let (tx, rx) = unbounded();
        routes.mailboxes.insert(id, tx);
        Ok(rx)
    }

    /// Routes `msg` to `msg.to`. Returns whether it was delivered.
    pub fn send(&self, msg: Message) -> bool {
        let routes = self.routes();
        let (from, to) = (msg.from, msg.to);
        if !routes.connected(from, to) {
            trace!(from, to, "link down, dropping message");
            return false;
        }
        if routes.drop_rate > 0.0 && rand::thread_rng().gen_bool(routes.drop_rate) {
            trace!(from, to, "unreliable network dropped message");
            return false;
        }
        match routes.mailboxes.get(&to) {
            Some(mailbox) => mailbox.send(msg).is_ok(),
            None => {
                trace!(from, to, "no mailbox for destination");
                false
            }
        }
    }

    /// Cuts `id` off from every other node.
    pub fn isolate(&self, id: u64) {
        self.routes().isolated.insert(id);
    }

    pub fn reconnect(&self, id: u64) {
        self.routes().isolated.remove(&id);
    }

    /// Splits the nodes into groups that can only talk among themselves.
    /// Nodes not listed end up together in their own group.
    pub fn partition(&self, groups: &[&[u64]]) {
        let mut routes = self.routes();
        routes.sides.clear();
        for (side, group) in groups.iter().enumerate() {
            for &id in group.iter() {
                routes.sides.insert(id, side);
            }
        }
    }

    /// Removes every partition and isolation.
    pub fn heal(&self) {
        let mut routes = self.routes();
        routes.sides.clear();
        routes.isolated.clear();
    }

    /// Drops each message independently with probability `rate` (0.0..=1.0).
    pub fn set_drop_rate(&self, rate: f64) {
        self.routes().drop_rate = rate.clamp(0.0, 1.0);
    }
}
