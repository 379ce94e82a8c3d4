//! Tunables for the consensus worker, the service handlers and the clerks.

use std::time::Duration;

/// Raft logical clock settings.
///
/// With the defaults a heartbeat goes out every ~300ms and a follower that
/// hears nothing for 1-2 seconds starts an election.
#[derive(Debug, Clone, Copy)]
pub struct RaftSettings {
    pub tick_interval: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 3,
        }
    }
}

impl RaftSettings {
    /// Shorter ticks for in-process clusters where elections should be quick.
    pub fn fast() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

/// How reads (`Get`, `Query`) are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Confirm leadership with a quorum round, then read local memory.
    /// A leader deposed right after the probe can still serve a stale value.
    #[default]
    LeaderProbe,
    /// Submit the read as a log entry and answer from the apply loop.
    Log,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    /// How long a handler waits for its entry to be applied.
    pub apply_timeout: Duration,
    /// How long the leadership probe may take before the read is refused.
    pub probe_timeout: Duration,
    pub read_mode: ReadMode,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            read_mode: ReadMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClerkSettings {
    /// Pause after every server has been tried without success.
    pub retry_interval: Duration,
}

impl Default for ClerkSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(100),
        }
    }
}
