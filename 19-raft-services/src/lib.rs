//! Replicated services on a Raft log.
//!
//! Two services share one replication core: a key-value store (`Get`, `Put`,
//! `Append`) and a shard-configuration master (`Join`, `Leave`, `Move`,
//! `Query`). Each server replica submits client writes to its Raft node, waits
//! for the entry to come back through the commit stream, and only then
//! answers the client.
//!
//! # Architecture
//!
//! Every node runs two long-lived threads:
//!
//! - **Raft worker** ([`runtime`]): owns the tikv/raft node, ticks it, routes
//!   messages through the in-process [`network`] and pushes committed entries
//!   onto the commit stream
//! - **Apply loop** ([`apply`]): drains the commit stream in index order,
//!   applies each entry to the service's state machine and wakes the handler
//!   waiting for that index
//!
//! Client handlers run on the caller's thread. A handler checks leadership,
//! consults the dedup table, submits the command and blocks on a one-shot
//! crossbeam channel raced against a timeout. The state machine and its
//! dedup table sit behind a single mutex, which the apply loop holds for one
//! entry at a time.
//!
//! Requests carry client-chosen ids. Retrying with the same id never applies
//! a write twice: the KV service remembers every executed id, the master
//! remembers the highest sequence number per client.
//!
//! # Modules
//!
//! - [`command`]: Commands replicated through the log and their codec
//! - [`consensus`]: The [`Consensus`](consensus::Consensus) seam services submit through
//! - [`node`]: Core Raft node wrapping tikv/raft
//! - [`runtime`]: Worker loop and [`RaftHandle`](runtime::RaftHandle)
//! - [`network`]: In-process message routing with partitions and drops
//! - [`apply`]: Apply loop, waiter registry and the submit/wait protocol
//! - [`dedup`]: Duplicate detection tables
//! - [`kv`]: Key-value store, server and clerk
//! - [`master`]: Configurations, rebalancing, master server and clerk
//! - [`rpc`]: Request and reply types shared by servers and clerks
//! - [`cluster`]: Boots whole clusters in one process
//! - [`settings`]: Timing and read-mode tunables
//! - [`error`]: Internal error types

pub mod apply;
pub mod cluster;
pub mod command;
pub mod consensus;
pub mod dedup;
pub mod error;
pub mod kv;
pub mod master;
pub mod network;
pub mod node;
pub mod rpc;
pub mod runtime;
pub mod settings;
