//! Configurations and the shard assignment policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::Gid;

/// Number of shards the key space is split into.
pub const NSHARDS: usize = 10;

/// Shard for `key`. Clients of sharded groups route with this.
pub fn key_to_shard(key: &str) -> usize {
    key.bytes().next().map_or(0, |byte| usize::from(byte) % NSHARDS)
}

/// One numbered configuration. Group id 0 in `shards` means unassigned.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    pub num: usize,
    pub shards: [Gid; NSHARDS],
    pub groups: BTreeMap<Gid, Vec<String>>,
}

impl Config {
    /// Copy of this configuration numbered one higher.
    pub fn next(&self) -> Self {
        Self {
            num: self.num + 1,
            ..self.clone()
        }
    }

    /// Shards assigned to `gid`, ascending.
    pub fn shards_of(&self, gid: Gid) -> Vec<usize> {
        (0..NSHARDS).filter(|&shard| self.shards[shard] == gid).collect()
    }

    /// Spreads shards over the current groups so per-group counts differ by
    /// at most one, keeping every shard whose group may keep it.
    ///
    /// Groups that already hold the most shards are allowed the larger
    /// share (ties go to the lower gid). Shards of unknown groups and any
    /// surplus are handed out in ascending shard order to groups below their
    /// target, lowest gid first.
    pub fn rebalance(&mut self) {
        if self.groups.is_empty() {
            self.shards = [0; NSHARDS];
            return;
        }

        let mut owned: BTreeMap<Gid, Vec<usize>> =
            self.groups.keys().map(|&gid| (gid, Vec::new())).collect();
        let mut free = Vec::new();
        for (shard, gid) in self.shards.iter().enumerate() {
            match owned.get_mut(gid) {
                Some(held) => held.push(shard),
                None => free.push(shard),
            }
        }

        let base = NSHARDS / owned.len();
        let extra = NSHARDS % owned.len();
        let mut by_load: Vec<Gid> = owned.keys().copied().collect();
        by_load.sort_by(|a, b| owned[b].len().cmp(&owned[a].len()).then(a.cmp(b)));
        let targets: BTreeMap<Gid, usize> = by_load
            .iter()
            .enumerate()
            .map(|(rank, &gid)| (gid, base + usize::from(rank < extra)))
            .collect();

        for (gid, held) in owned.iter_mut() {
            while held.len() > targets[gid] {
                free.extend(held.pop());
            }
        }
        free.sort_unstable();
        let mut free = free.into_iter();
        for (gid, held) in owned.iter_mut() {
            while held.len() < targets[gid] {
                match free.next() {
                    Some(shard) => held.push(shard),
                    None => break,
                }
            }
        }

        for (&gid, held) in &owned {
            for &shard in held {
                self.shards[shard] = gid;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_groups(gids: &[Gid]) -> Config {
        Config {
            groups: gids.iter().map(|&gid| (gid, vec![format!("server-{gid}")])).collect(),
            ..Config::default()
        }
    }

    fn counts(config: &Config) -> BTreeMap<Gid, usize> {
        config.groups.keys().map(|&gid| (gid, config.shards_of(gid).len())).collect()
    }

    fn moved(before: &Config, after: &Config) -> usize {
        (0..NSHARDS).filter(|&s| before.shards[s] != after.shards[s]).count()
    }

    #[test]
    fn first_group_takes_every_shard() {
        let mut config = with_groups(&[1]);
        config.rebalance();
        assert_eq!(config.shards, [1; NSHARDS]);
    }

    #[test]
    fn counts_differ_by_at_most_one() {
        for n in 1..=12u64 {
            let gids: Vec<Gid> = (1..=n).collect();
            let mut config = with_groups(&gids);
            config.rebalance();
            let counts = counts(&config);
            let max = counts.values().max().copied().unwrap_or(0);
            let min = counts.values().min().copied().unwrap_or(0);
            assert!(max - min <= 1, "{n} groups: {counts:?}");
            assert!(config.shards.iter().all(|gid| *gid != 0));
        }
    }

    #[test]
    fn joining_group_only_takes_what_it_needs() {
        let mut before = with_groups(&[1, 2]);
        before.rebalance();

        let mut after = before.next();
        after.groups.insert(3, vec!["c".into()]);
        after.rebalance();

        // 5/5 becomes 4/3/3: three shards move, all to the new group.
        assert_eq!(moved(&before, &after), 3);
        assert_eq!(after.shards_of(3).len(), 3);
        assert_eq!(after.num, before.num + 1);
    }

    #[test]
    fn departed_group_shards_are_reassigned() {
        let mut before = with_groups(&[1, 2, 3]);
        before.rebalance();
        let orphaned = before.shards_of(2);

        let mut after = before.next();
        after.groups.remove(&2);
        after.rebalance();

        assert!(after.shards_of(2).is_empty());
        assert_eq!(moved(&before, &after), orphaned.len());
        assert_eq!(counts(&after).values().sum::<usize>(), NSHARDS);
    }

    #[test]
    fn rebalance_is_deterministic() {
        let mut a = with_groups(&[7, 3, 5]);
        let mut b = a.clone();
        a.rebalance();
        b.rebalance();
        assert_eq!(a, b);
    }

    #[test]
    fn no_groups_means_unassigned() {
        let mut config = with_groups(&[1]);
        config.rebalance();
        config.groups.clear();
        config.rebalance();
        assert_eq!(config.shards, [0; NSHARDS]);
    }

    #[test]
    fn shard_for_key() {
        assert_eq!(key_to_shard(""), 0);
        assert_eq!(key_to_shard("a"), usize::from(b'a') % NSHARDS);
        assert_eq!(key_to_shard("ab"), key_to_shard("a"));
    }
}
