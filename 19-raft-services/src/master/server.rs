//! Fault-tolerant configuration master.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use super::config::{Config, NSHARDS};
use crate::apply::{Replica, StateMachine};
use crate::command::{ApplyMsg, ConfigCommand, ConfigOp};
use crate::consensus::Consensus;
use crate::dedup::SequenceTable;
use crate::error::SubmitError;
use crate::rpc::{AdminReply, JoinArgs, LeaveArgs, MasterService, MoveArgs, QueryArgs, QueryReply, Status};
use crate::settings::{ReadMode, ServiceSettings};

/// What applying one [`ConfigCommand`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOutcome {
    /// A new configuration with this number was appended.
    Applied { num: usize },
    /// The sequence number was not newer than the client's last write.
    Duplicate,
    /// A logged query.
    Config(Config),
}

/// Configuration history plus the per-client sequence table.
#[derive(Debug)]
pub struct ConfigMachine {
    configs: Vec<Config>,
    applied: SequenceTable,
}

impl Default for ConfigMachine {
    fn default() -> Self {
        Self {
            configs: vec![Config::default()],
            applied: SequenceTable::new(),
        }
    }
}

impl ConfigMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> &Config {
        // Configuration 0 is never removed.
        &self.configs[self.configs.len() - 1]
    }

    /// Configuration `num`, or the latest for `-1` and numbers past the end.
    pub fn query(&self, num: i64) -> Config {
        usize::try_from(num)
            .ok()
            .and_then(|num| self.configs.get(num))
            .unwrap_or_else(|| self.latest())
            .clone()
    }

    pub fn configs(&self) -> &[Config] {
        &self.configs
    }

    pub fn is_applied(&self, id: &str, seq: u64) -> bool {
        self.applied.is_duplicate(id, seq)
    }
}

impl StateMachine for ConfigMachine {
    type Command = ConfigCommand;
    type Output = ConfigOutcome;

    fn apply(&mut self, command: ConfigCommand) -> ConfigOutcome {
        let ConfigCommand { op, id, seq } = command;
        if let ConfigOp::Query { num } = op {
            return ConfigOutcome::Config(self.query(num));
        }
        if self.applied.is_duplicate(&id, seq) {
            return ConfigOutcome::Duplicate;
        }

        let mut next = self.latest().next();
        match op {
            ConfigOp::Join { servers } => {
                next.groups.extend(servers);
                next.rebalance();
            }
            ConfigOp::Leave { gids } => {
                for gid in &gids {
                    next.groups.remove(gid);
                }
                next.rebalance();
            }
            ConfigOp::Move { shard, gid } => {
                if let Some(slot) = next.shards.get_mut(shard) {
                    *slot = gid;
                }
            }
            ConfigOp::Query { .. } => {}
        }
        let num = next.num;
        self.configs.push(next);
        self.applied.record(id, seq);
        ConfigOutcome::Applied { num }
    }
}

/// One replica of the configuration master.
pub struct ShardMaster<L> {
    replica: Replica<ConfigMachine, L>,
    killed: AtomicBool,
}

impl<L: Consensus<ConfigCommand>> ShardMaster<L> {
    /// Starts the master's apply loop over `apply_rx`, the commit stream of
    /// `log`.
    pub fn new(
        node: u64,
        log: Arc<L>,
        apply_rx: Receiver<ApplyMsg<ConfigCommand>>,
        settings: ServiceSettings,
    ) -> Result<Self> {
        Ok(Self {
            replica: Replica::new(node, ConfigMachine::new(), log, apply_rx, settings)?,
            killed: AtomicBool::new(false),
        })
    }

    pub fn node(&self) -> u64 {
        self.replica.node()
    }

    fn serving(&self) -> bool {
        !self.killed.load(Ordering::Acquire) && self.replica.is_leader()
    }

    pub fn join(&self, args: &JoinArgs) -> AdminReply {
        if args.servers.is_empty() || args.servers.contains_key(&0) {
            return AdminReply::with_status(Status::InvalidArgument);
        }
        self.write(ConfigCommand {
            op: ConfigOp::Join {
                servers: args.servers.clone(),
            },
            id: args.id.clone(),
            seq: args.seq,
        })
    }

    pub fn leave(&self, args: &LeaveArgs) -> AdminReply {
        self.write(ConfigCommand {
            op: ConfigOp::Leave {
                gids: args.gids.clone(),
            },
            id: args.id.clone(),
            seq: args.seq,
        })
    }

    pub fn move_shard(&self, args: &MoveArgs) -> AdminReply {
        if args.shard >= NSHARDS || args.gid == 0 {
            return AdminReply::with_status(Status::InvalidArgument);
        }
        self.write(ConfigCommand {
            op: ConfigOp::Move {
                shard: args.shard,
                gid: args.gid,
            },
            id: args.id.clone(),
            seq: args.seq,
        })
    }

    fn write(&self, command: ConfigCommand) -> AdminReply {
        if !self.serving() {
            return AdminReply::wrong_leader();
        }
        if self.replica.read(|machine| machine.is_applied(&command.id, command.seq)) {
            debug!(node = self.node(), id = %command.id, seq = command.seq, "write already applied");
            return AdminReply::with_status(Status::Executed);
        }

        let id = command.id.clone();
        match self.replica.submit(command) {
            Ok(ConfigOutcome::Applied { num }) => {
                info!(node = self.node(), %id, num, "configuration advanced");
                AdminReply::with_status(Status::Ok)
            }
            Ok(ConfigOutcome::Duplicate) => AdminReply::with_status(Status::Executed),
            Ok(other) => {
                warn!(node = self.node(), outcome = ?other, "write produced a query outcome");
                AdminReply::with_status(Status::Timeout)
            }
            Err(err) => admin_failure(err),
        }
    }

    pub fn query(&self, args: &QueryArgs) -> QueryReply {
        if !self.serving() {
            return QueryReply::wrong_leader();
        }
        match self.replica.settings().read_mode {
            ReadMode::LeaderProbe => {
                if !self.replica.confirm_leadership() || !self.serving() {
                    return QueryReply::wrong_leader();
                }
                config_reply(self.replica.read(|machine| machine.query(args.num)))
            }
            ReadMode::Log => {
                let command = ConfigCommand {
                    op: ConfigOp::Query { num: args.num },
                    id: String::new(),
                    seq: 0,
                };
                match self.replica.submit(command) {
                    Ok(ConfigOutcome::Config(config)) => config_reply(config),
                    Ok(other) => {
                        warn!(node = self.node(), outcome = ?other, "logged query produced no config");
                        QueryReply::with_status(Status::Timeout)
                    }
                    Err(err) => QueryReply {
                        wrong_leader: err.is_wrong_leader(),
                        err: err.status(),
                        config: Config::default(),
                    },
                }
            }
        }
    }

    /// Local copy of the newest configuration this replica has applied.
    pub fn latest_config(&self) -> Config {
        self.replica.read(|machine| machine.latest().clone())
    }

    /// Local copy of the whole configuration history.
    pub fn configs(&self) -> Vec<Config> {
        self.replica.read(|machine| machine.configs().to_vec())
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

fn admin_failure(err: SubmitError) -> AdminReply {
    AdminReply {
        wrong_leader: err.is_wrong_leader(),
        err: err.status(),
    }
}

fn config_reply(config: Config) -> QueryReply {
    QueryReply {
        wrong_leader: false,
        err: Status::Ok,
        config,
    }
}

impl<L: Consensus<ConfigCommand>> MasterService for ShardMaster<L> {
    fn join(&self, args: &JoinArgs) -> AdminReply {
        ShardMaster::join(self, args)
    }

    fn leave(&self, args: &LeaveArgs) -> AdminReply {
        ShardMaster::leave(self, args)
    }

    fn move_shard(&self, args: &MoveArgs) -> AdminReply {
        ShardMaster::move_shard(self, args)
    }

    fn query(&self, args: &QueryArgs) -> QueryReply {
        ShardMaster::query(self, args)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::command::Gid;
    use crate::consensus::Role;
    use crate::consensus::scripted::ScriptedLog;

    type Master = ShardMaster<ScriptedLog<ConfigCommand>>;

    fn master(settings: ServiceSettings) -> (Arc<Master>, Arc<ScriptedLog<ConfigCommand>>) {
        let (log, apply_rx) = ScriptedLog::new();
        let log = Arc::new(log);
        let master = ShardMaster::new(1, Arc::clone(&log), apply_rx, settings).expect("master");
        (Arc::new(master), log)
    }

    fn patient() -> ServiceSettings {
        ServiceSettings {
            apply_timeout: Duration::from_secs(5),
            ..ServiceSettings::default()
        }
    }

    /// Runs `f` on another thread while committing whatever it submits.
    fn committed<R: Send + 'static>(
        log: &Arc<ScriptedLog<ConfigCommand>>,
        f: impl FnOnce() -> R + Send + 'static,
    ) -> R {
        let handler = thread::spawn(f);
        while !handler.is_finished() {
            log.commit_started();
            thread::sleep(Duration::from_millis(2));
        }
        handler.join().expect("handler")
    }

    fn join_args(gids: &[Gid], seq: u64) -> JoinArgs {
        JoinArgs {
            servers: gids.iter().map(|&gid| (gid, vec![format!("g{gid}")])).collect(),
            id: "admin".into(),
            seq,
        }
    }

    fn query(master: &Master, num: i64) -> Config {
        let reply = master.query(&QueryArgs { num });
        assert!(!reply.wrong_leader);
        reply.config
    }

    #[test]
    fn machine_starts_with_empty_config() {
        let machine = ConfigMachine::new();
        assert_eq!(machine.configs().len(), 1);
        assert_eq!(machine.query(-1), Config::default());
        assert_eq!(machine.query(7), Config::default());
    }

    #[test]
    fn stale_sequence_number_is_ignored() {
        let mut machine = ConfigMachine::new();
        let join = |seq| ConfigCommand {
            op: ConfigOp::Join {
                servers: BTreeMap::from([(seq, vec!["s".to_string()])]),
            },
            id: "c".into(),
            seq,
        };
        assert_eq!(machine.apply(join(2)), ConfigOutcome::Applied { num: 1 });
        assert_eq!(machine.apply(join(2)), ConfigOutcome::Duplicate);
        assert_eq!(machine.apply(join(1)), ConfigOutcome::Duplicate);
        assert_eq!(machine.apply(join(3)), ConfigOutcome::Applied { num: 2 });
        assert_eq!(machine.configs().len(), 3);
    }

    #[test]
    fn configuration_evolves_one_number_per_write() {
        let (master, log) = master(patient());

        let m = Arc::clone(&master);
        let reply = committed(&log, move || m.join(&join_args(&[1, 2], 1)));
        assert_eq!(reply, AdminReply::with_status(Status::Ok));
        let config = query(&master, -1);
        assert_eq!(config.num, 1);
        assert!(config.groups.contains_key(&1) && config.groups.contains_key(&2));
        assert_eq!(config.shards_of(1).len(), 5);

        let m = Arc::clone(&master);
        committed(&log, move || {
            m.move_shard(&MoveArgs {
                shard: 0,
                gid: 2,
                id: "admin".into(),
                seq: 2,
            })
        });
        let config = query(&master, -1);
        assert_eq!((config.num, config.shards[0]), (2, 2));
        assert_eq!(config.shards_of(2).len(), 6);

        let m = Arc::clone(&master);
        committed(&log, move || {
            m.leave(&LeaveArgs {
                gids: vec![2],
                id: "admin".into(),
                seq: 3,
            })
        });
        let config = query(&master, -1);
        assert_eq!(config.num, 3);
        assert!(!config.groups.contains_key(&2));
        assert_eq!(config.shards, [1; NSHARDS]);

        // History stays queryable.
        assert_eq!(query(&master, 1).num, 1);
        assert_eq!(query(&master, 0), Config::default());
        assert_eq!(master.configs().len(), 4);
    }

    #[test]
    fn applied_sequence_number_answers_executed() {
        let (master, log) = master(patient());
        let m = Arc::clone(&master);
        committed(&log, move || m.join(&join_args(&[1], 1)));

        let reply = master.join(&join_args(&[1], 1));
        assert_eq!(reply.err, Status::Executed);
        assert!(log.started().is_empty());
        assert_eq!(master.latest_config().num, 1);
    }

    #[test]
    fn invalid_arguments_never_reach_the_log() {
        let (master, log) = master(patient());
        let bad_move = MoveArgs {
            shard: NSHARDS,
            gid: 1,
            id: "admin".into(),
            seq: 1,
        };
        assert_eq!(master.move_shard(&bad_move).err, Status::InvalidArgument);
        let unassign = MoveArgs { gid: 0, shard: 1, ..bad_move };
        assert_eq!(master.move_shard(&unassign).err, Status::InvalidArgument);
        assert_eq!(master.join(&join_args(&[], 1)).err, Status::InvalidArgument);
        assert_eq!(master.join(&join_args(&[0], 1)).err, Status::InvalidArgument);
        assert!(log.started().is_empty());
    }

    #[test]
    fn follower_answers_wrong_leader() {
        let (master, log) = master(patient());
        log.set_role(Role::Follower);
        assert!(master.join(&join_args(&[1], 1)).wrong_leader);
        assert!(master.query(&QueryArgs { num: -1 }).wrong_leader);
        assert!(log.started().is_empty());
    }

    #[test]
    fn logged_query_reads_through_the_log() {
        let (master, log) = master(ServiceSettings {
            read_mode: ReadMode::Log,
            ..patient()
        });
        let m = Arc::clone(&master);
        committed(&log, move || m.join(&join_args(&[4], 1)));
        let m = Arc::clone(&master);
        let reply = committed(&log, move || m.query(&QueryArgs { num: -1 }));
        assert_eq!(reply.config.shards, [4; NSHARDS]);
        assert_eq!(master.last_applied(), 2);
    }

    #[test]
    fn timed_out_write_reports_timeout() {
        let (master, _log) = master(ServiceSettings {
            apply_timeout: Duration::from_millis(30),
            ..ServiceSettings::default()
        });
        let reply = master.join(&join_args(&[1], 1));
        assert_eq!(reply, AdminReply::with_status(Status::Timeout));
        assert_eq!(master.pending(), 0);
    }
}
