//! Fault-tolerant key-value server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use super::store::KvStore;
use crate::apply::{Replica, StateMachine};
use crate::command::{ApplyMsg, KvCommand, KvOp};
use crate::consensus::Consensus;
use crate::dedup::ExecutedSet;
use crate::rpc::{GetArgs, GetReply, KvService, PutAppendArgs, PutAppendOp, PutAppendReply, Status};
use crate::settings::{ReadMode, ServiceSettings};

/// What applying one [`KvCommand`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOutcome {
    /// A logged read.
    Value(Option<String>),
    Applied,
    /// The request id had already been applied; the store is unchanged.
    Duplicate,
}

/// Store plus dedup table; the replica's single lock covers both.
#[derive(Debug, Default)]
pub struct KvMachine {
    store: KvStore,
    executed: ExecutedSet,
}

impl KvMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn is_executed(&self, id: &str) -> bool {
        self.executed.lookup(id)
    }
}

impl StateMachine for KvMachine {
    type Command = KvCommand;
    type Output = KvOutcome;

    fn apply(&mut self, command: KvCommand) -> KvOutcome {
        let KvCommand { key, op, id } = command;
        if let KvOp::Get = op {
            return KvOutcome::Value(self.store.get(&key));
        }
        if self.executed.lookup(&id) {
            return KvOutcome::Duplicate;
        }
        match op {
            KvOp::Put { value } => self.store.put(key, value),
            KvOp::Append { value } => self.store.append(key, &value),
            KvOp::Get => {}
        }
        self.executed.record(id);
        KvOutcome::Applied
    }
}

/// One replica of the key-value service.
pub struct KvServer<L> {
    replica: Replica<KvMachine, L>,
    killed: AtomicBool,
}

impl<L: Consensus<KvCommand>> KvServer<L> {
    /// Starts the server's apply loop over `apply_rx`, the commit stream of
    /// `log`.
    pub fn new(
        node: u64,
        log: Arc<L>,
        apply_rx: Receiver<ApplyMsg<KvCommand>>,
        settings: ServiceSettings,
    ) -> Result<Self> {
        Ok(Self {
            replica: Replica::new(node, KvMachine::new(), log, apply_rx, settings)?,
            killed: AtomicBool::new(false),
        })
    }

    pub fn node(&self) -> u64 {
        self.replica.node()
    }

    fn serving(&self) -> bool {
        !self.killed.load(Ordering::Acquire) && self.replica.is_leader()
    }

    pub fn get(&self, args: &GetArgs) -> GetReply {
        if !self.serving() {
            return GetReply::wrong_leader();
        }
        match self.replica.settings().read_mode {
            ReadMode::LeaderProbe => {
                // Confirms a quorum still follows us and that the read
                // index is applied, then serves from memory. Leadership can
                // still move between the probe and the read below.
                if !self.replica.confirm_leadership() || !self.serving() {
                    return GetReply::wrong_leader();
                }
                let value = self.replica.read(|machine| machine.store.get(&args.key));
                value_reply(value)
            }
            ReadMode::Log => {
                let command = KvCommand {
                    key: args.key.clone(),
                    op: KvOp::Get,
                    id: args.id.clone(),
                };
                match self.replica.submit(command) {
                    Ok(KvOutcome::Value(value)) => value_reply(value),
                    Ok(other) => {
                        warn!(node = self.node(), outcome = ?other, "logged read produced no value");
                        GetReply::with_status(Status::Timeout)
                    }
                    Err(err) => GetReply {
                        wrong_leader: err.is_wrong_leader(),
                        err: err.status(),
                        value: String::new(),
                    },
                }
            }
        }
    }

    pub fn put_append(&self, args: &PutAppendArgs) -> PutAppendReply {
        if !self.serving() {
            return PutAppendReply::wrong_leader();
        }
        if self.replica.read(|machine| machine.is_executed(&args.id)) {
            debug!(node = self.node(), id = %args.id, "request already executed");
            return PutAppendReply::with_status(Status::Executed);
        }

        let value = args.value.clone();
        let op = match args.op {
            PutAppendOp::Put => KvOp::Put { value },
            PutAppendOp::Append => KvOp::Append { value },
        };
        let command = KvCommand {
            key: args.key.clone(),
            op,
            id: args.id.clone(),
        };
        match self.replica.submit(command) {
            Ok(KvOutcome::Duplicate) => PutAppendReply::with_status(Status::Executed),
            Ok(_) => PutAppendReply::with_status(Status::Ok),
            Err(err) => PutAppendReply {
                wrong_leader: err.is_wrong_leader(),
                err: err.status(),
            },
        }
    }

    /// Local copy of the store, whatever this replica has applied so far.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.replica.read(|machine| machine.store.snapshot())
    }

    pub fn last_applied(&self) -> u64 {
        self.replica.last_applied()
    }

    pub fn pending(&self) -> usize {
        self.replica.pending()
    }

    /// Stops serving and stops the apply loop. The consensus log is owned
    /// elsewhere and is shut down separately.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.replica.shutdown();
    }
}

fn value_reply(value: Option<String>) -> GetReply {
    match value {
        Some(value) => GetReply {
            wrong_leader: false,
            err: Status::Ok,
            value,
        },
        None => GetReply::with_status(Status::NoKey),
    }
}

impl<L: Consensus<KvCommand>> KvService for KvServer<L> {
    fn get(&self, args: &GetArgs) -> GetReply {
        KvServer::get(self, args)
    }

    fn put_append(&self, args: &PutAppendArgs) -> PutAppendReply {
        KvServer::put_append(self, args)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::consensus::Role;
    use crate::consensus::scripted::ScriptedLog;

    type Server = KvServer<ScriptedLog<KvCommand>>;

    fn server(settings: ServiceSettings) -> (Arc<Server>, Arc<ScriptedLog<KvCommand>>) {
        let (log, apply_rx) = ScriptedLog::new();
        let log = Arc::new(log);
        let server = KvServer::new(1, Arc::clone(&log), apply_rx, settings).expect("server");
        (Arc::new(server), log)
    }

    fn patient() -> ServiceSettings {
        ServiceSettings {
            apply_timeout: Duration::from_secs(5),
            ..ServiceSettings::default()
        }
    }

    fn put_append(key: &str, value: &str, op: PutAppendOp, id: &str) -> PutAppendArgs {
        PutAppendArgs {
            key: key.into(),
            value: value.into(),
            op,
            id: id.into(),
        }
    }

    fn get(key: &str) -> GetArgs {
        GetArgs {
            key: key.into(),
            id: format!("get-{key}"),
        }
    }

    /// Plays the consensus layer: commits whatever gets started.
    fn auto_commit(log: Arc<ScriptedLog<KvCommand>>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                log.commit_started();
                thread::sleep(Duration::from_millis(2));
            }
        })
    }

    fn with_auto_commit<R>(log: &Arc<ScriptedLog<KvCommand>>, f: impl FnOnce() -> R) -> R {
        let stop = Arc::new(AtomicBool::new(false));
        let committer = auto_commit(Arc::clone(log), Arc::clone(&stop));
        let result = f();
        stop.store(true, Ordering::Release);
        committer.join().expect("committer");
        result
    }

    #[test]
    fn apply_is_idempotent_per_request_id() {
        let mut machine = KvMachine::new();
        let append = KvCommand {
            key: "x".into(),
            op: KvOp::Append { value: "b".into() },
            id: "r1".into(),
        };
        assert_eq!(machine.apply(append.clone()), KvOutcome::Applied);
        assert_eq!(machine.apply(append), KvOutcome::Duplicate);
        assert_eq!(machine.store().get("x").as_deref(), Some("b"));
    }

    #[test]
    fn put_then_append_then_get() {
        let (server, log) = server(patient());
        with_auto_commit(&log, || {
            let reply = server.put_append(&put_append("x", "a", PutAppendOp::Put, "r1"));
            assert_eq!(reply, PutAppendReply::with_status(Status::Ok));
            assert_eq!(server.get(&get("x")).value, "a");

            server.put_append(&put_append("x", "b", PutAppendOp::Append, "r2"));
            let reply = server.get(&get("x"));
            assert_eq!((reply.err, reply.value.as_str()), (Status::Ok, "ab"));
        });
    }

    #[test]
    fn missing_key_reports_no_key() {
        let (server, _log) = server(patient());
        let reply = server.get(&get("nope"));
        assert!(!reply.wrong_leader);
        assert_eq!(reply.err, Status::NoKey);
    }

    #[test]
    fn retry_of_executed_request_is_not_resubmitted() {
        let (server, log) = server(patient());
        let args = put_append("x", "b", PutAppendOp::Append, "same");
        with_auto_commit(&log, || {
            assert_eq!(server.put_append(&args).err, Status::Ok);
            assert_eq!(server.put_append(&args).err, Status::Executed);
        });
        assert!(log.started().is_empty());
        assert_eq!(server.snapshot().get("x").map(String::as_str), Some("b"));
    }

    #[test]
    fn concurrent_duplicates_apply_once() {
        let (server, log) = server(patient());
        with_auto_commit(&log, || {
            server.put_append(&put_append("x", "a", PutAppendOp::Put, "put"));
        });

        // Both handlers pass the dedup check before either entry commits.
        let args = put_append("x", "b", PutAppendOp::Append, "dup");
        let handlers: Vec<_> = (0..2)
            .map(|_| {
                let server = Arc::clone(&server);
                let args = args.clone();
                thread::spawn(move || server.put_append(&args))
            })
            .collect();
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.started().len() < 2 {
            assert!(Instant::now() < deadline, "handlers never submitted");
            thread::sleep(Duration::from_millis(2));
        }
        log.commit_started();

        let mut statuses: Vec<Status> = handlers
            .into_iter()
            .map(|handler| handler.join().unwrap().err)
            .collect();
        statuses.sort_by_key(|status| *status as u8);
        assert_eq!(statuses, vec![Status::Ok, Status::Executed]);
        assert_eq!(server.snapshot().get("x").map(String::as_str), Some("ab"));
    }

    #[test]
    fn follower_answers_wrong_leader() {
        let (server, log) = server(patient());
        log.set_role(Role::Follower);
        assert!(server.get(&get("x")).wrong_leader);
        assert!(server.put_append(&put_append("x", "a", PutAppendOp::Put, "r")).wrong_leader);
        assert!(log.started().is_empty());
    }

    #[test]
    fn failed_probe_refuses_read() {
        let (server, log) = server(patient());
        log.set_confirm(false);
        assert!(server.get(&get("x")).wrong_leader);
    }

    #[test]
    fn uncommitted_write_times_out_and_retry_succeeds() {
        let (server, log) = server(ServiceSettings {
            apply_timeout: Duration::from_millis(50),
            ..ServiceSettings::default()
        });
        let args = put_append("x", "a", PutAppendOp::Append, "slow");
        assert_eq!(server.put_append(&args).err, Status::Timeout);
        assert_eq!(server.pending(), 0);

        // The first attempt commits late; the retry resubmits and is
        // recognised as a duplicate when it applies.
        let retry = {
            let server = Arc::clone(&server);
            let args = args.clone();
            thread::spawn(move || server.put_append(&args))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.started().len() < 2 {
            assert!(Instant::now() < deadline, "retry never submitted");
            thread::sleep(Duration::from_millis(2));
        }
        log.commit_started();
        let reply = retry.join().unwrap();
        assert!(reply.err.is_success(), "unexpected {reply:?}");
        assert_eq!(server.snapshot().get("x").map(String::as_str), Some("a"));
    }

    #[test]
    fn logged_reads_go_through_the_log() {
        let (server, log) = server(ServiceSettings {
            read_mode: ReadMode::Log,
            ..patient()
        });
        with_auto_commit(&log, || {
            server.put_append(&put_append("x", "a", PutAppendOp::Put, "r1"));
            assert_eq!(server.get(&get("x")).value, "a");
            assert_eq!(server.get(&get("y")).err, Status::NoKey);
        });
        // put, get x and get y each took a log slot.
        assert_eq!(server.last_applied(), 3);
    }

    #[test]
    fn killed_server_stops_serving() {
        let (server, _log) = server(patient());
        server.kill();
        assert!(server.get(&get("x")).wrong_leader);
        assert!(server.put_append(&put_append("x", "a", PutAppendOp::Put, "r")).wrong_leader);
    }
}
