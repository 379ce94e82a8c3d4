//! The shard-configuration master: a replicated, append-only history of
//! which replica group serves which shard.

pub mod clerk;
pub mod config;
pub mod server;

pub use clerk::MasterClerk;
pub use config::{Config, NSHARDS, key_to_shard};
pub use server::{ConfigMachine, ConfigOutcome, ShardMaster};
