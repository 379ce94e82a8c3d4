//! The replicated key-value service: storage, server replicas and clerks.

pub mod clerk;
pub mod server;
pub mod store;

pub use clerk::KvClerk;
pub use server::{KvMachine, KvOutcome, KvServer};
pub use store::KvStore;
