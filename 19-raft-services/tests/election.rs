//! Leader election on real raft workers connected by the in-process network.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use raft_services::cluster::KvCluster;
use raft_services::consensus::{Consensus, Role};
use raft_services::settings::{RaftSettings, ServiceSettings};

const ELECTION_TIMEOUT: Duration = Duration::from_secs(10);

fn cluster(n: usize) -> Result<KvCluster> {
    KvCluster::start_kv(n, RaftSettings::fast(), ServiceSettings::default())
}

fn eventually(what: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + ELECTION_TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

#[test]
fn test_cluster_elects_a_single_leader() -> Result<()> {
    let cluster = cluster(3)?;
    let leader = cluster.wait_for_leader(ELECTION_TIMEOUT)?;
    let leader_id = cluster.id(leader);

    // Followers learn about the leader through its heartbeats.
    eventually("followers to agree on the leader", || {
        (0..cluster.len()).all(|i| {
            cluster
                .raft(i)
                .status()
                .is_some_and(|status| status.leader_id == leader_id)
        })
    })?;
    let leaders = (0..cluster.len())
        .filter(|&i| cluster.raft(i).role() == Role::Leader)
        .count();
    assert_eq!(leaders, 1);
    Ok(())
}

#[test]
fn test_campaign_cannot_depose_a_healthy_leader() -> Result<()> {
    let cluster = cluster(3)?;
    let leader = cluster.wait_for_leader(ELECTION_TIMEOUT)?;
    let term = cluster.raft(leader).status().map_or(0, |status| status.term);

    // Pre-vote fails while the leader's heartbeats keep followers in lease.
    let challenger = (leader + 1) % cluster.len();
    cluster.raft(challenger).campaign();
    thread::sleep(Duration::from_millis(300));

    assert_eq!(cluster.leader(), Some(leader));
    let status = cluster.raft(leader).status().expect("worker running");
    assert_eq!(status.term, term);
    Ok(())
}

#[test]
fn test_isolated_leader_is_replaced() -> Result<()> {
    let cluster = cluster(3)?;
    let old = cluster.wait_for_leader(ELECTION_TIMEOUT)?;
    cluster.disconnect(old);

    // check_quorum makes the isolated node give up; the majority elects.
    eventually("the old leader to step down", || cluster.raft(old).role() != Role::Leader)?;
    eventually("a new leader", || cluster.leader().is_some_and(|leader| leader != old))?;

    cluster.reconnect(old);
    eventually("the old leader to follow", || {
        let Some(leader) = cluster.leader() else {
            return false;
        };
        leader != old
            && cluster.raft(old).status().is_some_and(|status| {
                status.role == Role::Follower && status.leader_id == cluster.id(leader)
            })
    })?;
    Ok(())
}
