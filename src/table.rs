//! The sharded node table and the shared mutex pool.
//!
//! All non-root nodes are owned here, keyed by their 128-bit identity hash.
//! Shards are plain mutex-guarded maps: allocation and lookup are rare
//! relative to selection, so a true mutex (not a spinlock) is the right
//! tradeoff. Boxing each node keeps its address stable while the map
//! rehashes, which the raw child pointers in the tree rely on.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::hash::Hash128;
use crate::node::SearchNode;

pub struct NodeTable {
    shards: Vec<Mutex<HashMap<Hash128, Box<SearchNode>>>>,
}

impl NodeTable {
    pub fn new(shards_power_of_two: usize) -> NodeTable {
        let num_shards = 1usize << shards_power_of_two.min(20);
        NodeTable { shards: (0..num_shards).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    pub fn shard_index(&self, hash: Hash128) -> usize {
        (hash.hash0 as usize) & (self.shards.len() - 1)
    }

    /// Lock one shard for lookup/insertion.
    pub fn lock_shard(
        &self,
        idx: usize,
    ) -> MutexGuard<'_, HashMap<Hash128, Box<SearchNode>>> {
        self.shards[idx].lock().unwrap()
    }

    /// Total entries across shards. Takes each shard lock in turn; meant for
    /// idle-time reporting and tests, not hot paths.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retain only nodes satisfying `keep`, handing each removed node to
    /// `on_remove` before it drops. Restricted to the shard range
    /// [shard_begin, shard_end) so parallel sweepers can partition the table.
    pub fn retain_in_shards(
        &self,
        shard_begin: usize,
        shard_end: usize,
        mut keep: impl FnMut(&SearchNode) -> bool,
        mut on_remove: impl FnMut(&mut SearchNode),
    ) {
        for shard in &self.shards[shard_begin..shard_end] {
            let mut map = shard.lock().unwrap();
            map.retain(|_, node| {
                if keep(&**node) {
                    true
                } else {
                    on_remove(&mut **node);
                    false
                }
            });
        }
    }

    /// Drop every node in the shard range.
    pub fn clear_shards(&self, shard_begin: usize, shard_end: usize) {
        for shard in &self.shards[shard_begin..shard_end] {
            shard.lock().unwrap().clear();
        }
    }
}

/// A fixed pool of mutexes shared by all nodes, indexed by each node's
/// randomly-assigned `mutex_idx`. Used only for rare synchronization (child
/// installation, post-order marking), never on the pure read path.
pub struct MutexPool {
    mutexes: Vec<Mutex<()>>,
}

impl MutexPool {
    pub fn new(num_mutexes: usize) -> MutexPool {
        let n = num_mutexes.max(1).next_power_of_two();
        MutexPool { mutexes: (0..n).map(|_| Mutex::new(())).collect() }
    }

    pub fn num_mutexes(&self) -> usize {
        self.mutexes.len()
    }

    pub fn lock(&self, idx: u32) -> MutexGuard<'_, ()> {
        self.mutexes[idx as usize & (self.mutexes.len() - 1)].lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::Player;

    #[test]
    fn insert_lookup_and_len() {
        let table = NodeTable::new(4);
        assert_eq!(table.num_shards(), 16);
        let h = Hash128::new(42, 7);
        let idx = table.shard_index(h);
        {
            let mut shard = table.lock_shard(idx);
            shard.insert(h, Box::new(SearchNode::new(Player::Black, false, 0)));
        }
        assert_eq!(table.len(), 1);
        {
            let shard = table.lock_shard(idx);
            assert!(shard.contains_key(&h));
        }
    }

    #[test]
    fn node_address_stable_across_rehash() {
        let table = NodeTable::new(0);
        let h0 = Hash128::new(1, 1);
        let idx = table.shard_index(h0);
        let p0 = {
            let mut shard = table.lock_shard(idx);
            let node = Box::new(SearchNode::new(Player::Black, false, 0));
            let p = &*node as *const SearchNode;
            shard.insert(h0, node);
            p
        };
        // Force plenty of rehashing in the same shard.
        for i in 2..2000u64 {
            let h = Hash128::new(i, i);
            let idx = table.shard_index(h);
            table.lock_shard(idx).insert(h, Box::new(SearchNode::new(Player::White, false, 0)));
        }
        let shard = table.lock_shard(idx);
        assert_eq!(&*shard[&h0] as *const SearchNode, p0);
    }

    #[test]
    fn retain_reports_removed() {
        let table = NodeTable::new(2);
        for i in 0..10u64 {
            let h = Hash128::new(i, 0);
            let idx = table.shard_index(h);
            table.lock_shard(idx).insert(
                h,
                Box::new(SearchNode::new(Player::Black, i % 2 == 0, 0)),
            );
        }
        let mut removed = 0;
        table.retain_in_shards(
            0,
            table.num_shards(),
            |node| node.force_non_terminal,
            |_| removed += 1,
        );
        assert_eq!(removed, 5);
        assert_eq!(table.len(), 5);
    }
}
