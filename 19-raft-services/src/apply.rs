//! Commit-and-apply machinery shared by both services.
//!
//! A [`Replica`] owns one state machine (store plus dedup table) behind a
//! single mutex, a table of handlers waiting for specific log indices, and
//! the apply loop thread that drains the consensus commit stream.
//!
//! # Completion protocol
//!
//! 1. A handler locks the replica, calls `start`, and registers a waiter for
//!    the returned index before unlocking. The apply loop needs the same lock
//!    to apply anything, so the entry cannot be applied before its waiter
//!    exists.
//! 2. The apply loop applies one entry per critical section. If the replica
//!    is leader at that moment it takes the waiter for the index, then
//!    releases the lock and only afterwards hands the output over with a
//!    non-blocking `try_send`.
//! 3. The handler races its channel against the apply timeout. A completion
//!    whose term differs from the ticket, or a waiter dropped because another
//!    entry won the index, is never reported as success.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use tracing::{debug, warn};

use crate::command::ApplyMsg;
use crate::consensus::{Consensus, Ticket};
use crate::error::SubmitError;
use crate::settings::ServiceSettings;

/// Deterministic state that every replica rebuilds from the log.
///
/// `apply` runs inside the replica's critical section, so a store mutation
/// and the matching dedup record always become visible together.
pub trait StateMachine: Send + 'static {
    type Command: Send + 'static;
    type Output: Send + 'static;

    fn apply(&mut self, command: Self::Command) -> Self::Output;
}

/// Result of applying the entry a handler is waiting for.
#[derive(Debug)]
pub struct Completion<O> {
    pub index: u64,
    pub term: u64,
    pub output: O,
}

struct Waiter<O> {
    term: u64,
    tx: Sender<Completion<O>>,
}

struct Inner<S: StateMachine> {
    machine: S,
    waiters: HashMap<u64, Waiter<S::Output>>,
    last_applied: u64,
}

fn lock<S: StateMachine>(state: &Mutex<Inner<S>>) -> MutexGuard<'_, Inner<S>> {
    // Entries are applied whole inside the lock, so a panicking holder
    // cannot leave the machine half-updated.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One server's replicated state plus its apply loop.
pub struct Replica<S: StateMachine, L> {
    node: u64,
    state: Arc<Mutex<Inner<S>>>,
    /// Signalled whenever `last_applied` advances.
    applied: Arc<Condvar>,
    log: Arc<L>,
    settings: ServiceSettings,
    shutdown_tx: Sender<()>,
    apply_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<S, L> Replica<S, L>
where
    S: StateMachine,
    L: Consensus<S::Command>,
{
    /// Wraps `machine` and starts the apply loop over `apply_rx`.
    pub fn new(
        node: u64,
        machine: S,
        log: Arc<L>,
        apply_rx: Receiver<ApplyMsg<S::Command>>,
        settings: ServiceSettings,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(Inner {
            machine,
            waiters: HashMap::new(),
            last_applied: 0,
        }));
        let applied = Arc::new(Condvar::new());
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let apply_loop = ApplyLoop {
            node,
            state: Arc::clone(&state),
            applied: Arc::clone(&applied),
            log: Arc::clone(&log),
            apply_rx,
            shutdown_rx,
        };
        let handle = thread::Builder::new()
            .name(format!("apply-{node}"))
            .spawn(move || apply_loop.run())
            .with_context(|| format!("failed to spawn apply loop for node {node}"))?;

        Ok(Self {
            node,
            state,
            applied,
            log,
            settings,
            shutdown_tx,
            apply_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn node(&self) -> u64 {
        self.node
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn is_leader(&self) -> bool {
        self.log.role().is_leader()
    }

    /// Checks with a quorum that this replica still leads, then waits until
    /// everything committed before the check has been applied locally. Both
    /// steps share the probe timeout.
    pub fn confirm_leadership(&self) -> bool {
        let started = Instant::now();
        let Some(read_index) = self.log.confirm_leadership(self.settings.probe_timeout) else {
            return false;
        };
        let remaining = self.settings.probe_timeout.saturating_sub(started.elapsed());
        let inner = lock(&self.state);
        let (inner, _) = self
            .applied
            .wait_timeout_while(inner, remaining, |inner| inner.last_applied < read_index)
            .unwrap_or_else(PoisonError::into_inner);
        if inner.last_applied < read_index {
            debug!(
                node = self.node,
                read_index,
                last_applied = inner.last_applied,
                "apply loop did not catch up with the read index"
            );
            return false;
        }
        true
    }

    /// Runs `f` against the state machine under the replica lock.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&lock(&self.state).machine)
    }

    pub fn last_applied(&self) -> u64 {
        lock(&self.state).last_applied
    }

    /// Number of handlers currently blocked on an index.
    pub fn pending(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    /// Submits `command` and blocks until it is applied or the apply timeout
    /// fires. A timeout does not withdraw the command from the log.
    pub fn submit(&self, command: S::Command) -> Result<S::Output, SubmitError> {
        let (tx, rx) = bounded(1);
        let ticket = {
            let mut inner = lock(&self.state);
            let ticket = self.log.start(command)?;
            if ticket.index <= inner.last_applied {
                warn!(
                    node = self.node,
                    index = ticket.index,
                    last_applied = inner.last_applied,
                    "start returned an index that is already applied"
                );
                return Err(SubmitError::Superseded {
                    index: ticket.index,
                });
            }
            let waiter = Waiter {
                term: ticket.term,
                tx,
            };
            if let Some(previous) = inner.waiters.insert(ticket.index, waiter) {
                // Same index handed out again in a later term: the older
                // entry was truncated, so its handler can stop waiting.
                debug!(
                    node = self.node,
                    index = ticket.index,
                    stale_term = previous.term,
                    "replacing waiter for reused index"
                );
            }
            ticket
        };
        debug!(node = self.node, index = ticket.index, term = ticket.term, "submitted");

        select! {
            recv(rx) -> completion => match completion {
                Ok(completion) if completion.term == ticket.term => Ok(completion.output),
                _ => Err(SubmitError::Superseded { index: ticket.index }),
            },
            default(self.settings.apply_timeout) => {
                self.forget(ticket);
                // The apply loop may have handed the result over just before
                // the waiter was removed.
                match rx.try_recv() {
                    Ok(completion) if completion.term == ticket.term => Ok(completion.output),
                    _ => {
                        debug!(node = self.node, index = ticket.index, "apply timeout");
                        Err(SubmitError::Timeout)
                    }
                }
            }
        }
    }

    fn forget(&self, ticket: Ticket) {
        let mut inner = lock(&self.state);
        if inner
            .waiters
            .get(&ticket.index)
            .is_some_and(|waiter| waiter.term == ticket.term)
        {
            inner.waiters.remove(&ticket.index);
        }
    }

    /// Stops the apply loop and waits for it to exit. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
        let handle = self
            .apply_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(node = self.node, "apply loop panicked");
            }
        }
    }
}

impl<S: StateMachine, L> Drop for Replica<S, L> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.try_send(());
    }
}

/// The single sequential consumer of the commit stream.
struct ApplyLoop<S: StateMachine, L> {
    node: u64,
    state: Arc<Mutex<Inner<S>>>,
    applied: Arc<Condvar>,
    log: Arc<L>,
    apply_rx: Receiver<ApplyMsg<S::Command>>,
    shutdown_rx: Receiver<()>,
}

impl<S, L> ApplyLoop<S, L>
where
    S: StateMachine,
    L: Consensus<S::Command>,
{
    fn run(self) {
        loop {
            select! {
                recv(self.shutdown_rx) -> _ => break,
                recv(self.apply_rx) -> msg => match msg {
                    Ok(msg) => self.apply(msg),
                    Err(_) => break,
                },
            }
        }
        debug!(node = self.node, "apply loop stopped");
    }

    fn apply(&self, msg: ApplyMsg<S::Command>) {
        let index = msg.index();
        let term = msg.term();

        let (waiter, output) = {
            let mut inner = lock(&self.state);
            if index <= inner.last_applied {
                warn!(
                    node = self.node,
                    index,
                    last_applied = inner.last_applied,
                    "skipping entry that was already applied"
                );
                return;
            }
            let output = match msg {
                ApplyMsg::Command { command, .. } => Some(inner.machine.apply(command)),
                ApplyMsg::NoOp { .. } => None,
            };
            inner.last_applied = index;

            // Followers and deposed leaders never signal; their handlers
            // run into the timeout and the client retries.
            let waiter = if self.log.role().is_leader() {
                inner.waiters.remove(&index)
            } else {
                None
            };
            (waiter, output)
        };
        self.applied.notify_all();

        let Some(waiter) = waiter else {
            return;
        };
        match output {
            Some(output) if waiter.term == term => {
                let completion = Completion {
                    index,
                    term,
                    output,
                };
                if waiter.tx.try_send(completion).is_err() {
                    debug!(node = self.node, index, "handler stopped waiting before completion");
                }
            }
            _ => debug!(
                node = self.node,
                index,
                term,
                waiter_term = waiter.term,
                "entry at index belongs to another term; releasing waiter"
            ),
        }
    }
}
