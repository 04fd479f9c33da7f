//! Shared correction tables: subtree value bias and pattern bonuses.
//!
//! The subtree-value-bias table accumulates, per {player, previous move,
//! move, recent board} context, the running difference between what subtrees
//! under that context converge to and what the evaluator said directly. Nodes
//! blend a fraction of that difference into their own utility. Entries are
//! shared by `Arc`; a node swaps its old contribution out and its new one in
//! under the entry's spinlock, so the entry always holds each node's latest
//! contribution exactly once.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::game::{Loc, Player};
use crate::hash::Hash128;
use crate::stats::{AtomicF64, SpinLock};

/// Context key for one bias entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubtreeValueBiasKey {
    pub pla: Player,
    pub prev_move_loc: Loc,
    pub move_loc: Loc,
    pub recent_board_hash: Hash128,
}

/// One shared accumulator. Fields are only read/written under `lock`; they
/// are atomics merely so the entry is `Sync` without unsafe code.
#[derive(Default)]
pub struct SubtreeValueBiasEntry {
    lock: SpinLock,
    delta_utility_sum: AtomicF64,
    weight_sum: AtomicF64,
}

pub type SubtreeValueBiasHandle = Arc<SubtreeValueBiasEntry>;

impl SubtreeValueBiasEntry {
    /// Replace `(old_delta, old_weight)` with `(new_delta, new_weight)` and
    /// return the entry's resulting totals.
    pub fn swap_contribution(
        &self,
        old_delta: f64,
        old_weight: f64,
        new_delta: f64,
        new_weight: f64,
    ) -> (f64, f64) {
        self.lock.with(|| {
            let delta = self.delta_utility_sum.load(Ordering::Relaxed) - old_delta + new_delta;
            let weight = self.weight_sum.load(Ordering::Relaxed) - old_weight + new_weight;
            self.delta_utility_sum.store(delta, Ordering::Relaxed);
            self.weight_sum.store(weight, Ordering::Relaxed);
            (delta, weight)
        })
    }

    /// Read the totals without contributing.
    pub fn totals(&self) -> (f64, f64) {
        self.lock.with(|| {
            (
                self.delta_utility_sum.load(Ordering::Relaxed),
                self.weight_sum.load(Ordering::Relaxed),
            )
        })
    }

    /// Subtract a (possibly partial) contribution, used when the node that
    /// made it is deleted.
    pub fn subtract(&self, delta: f64, weight: f64) {
        self.lock.with(|| {
            self.delta_utility_sum
                .store(self.delta_utility_sum.load(Ordering::Relaxed) - delta, Ordering::Relaxed);
            self.weight_sum
                .store(self.weight_sum.load(Ordering::Relaxed) - weight, Ordering::Relaxed);
        });
    }
}

/// Sharded map from context keys to shared entries.
pub struct SubtreeValueBiasTable {
    shards: Vec<Mutex<HashMap<SubtreeValueBiasKey, SubtreeValueBiasHandle>>>,
}

impl SubtreeValueBiasTable {
    pub fn new(num_shards: usize) -> SubtreeValueBiasTable {
        let num_shards = num_shards.max(1).next_power_of_two();
        SubtreeValueBiasTable {
            shards: (0..num_shards).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, key: &SubtreeValueBiasKey) -> &Mutex<HashMap<SubtreeValueBiasKey, SubtreeValueBiasHandle>> {
        let h = key
            .recent_board_hash
            .mix_u64(key.move_loc.0 as u64 | ((key.prev_move_loc.0 as u64) << 16))
            .hash0;
        &self.shards[(h as usize) & (self.shards.len() - 1)]
    }

    /// Fetch or create the entry for a context.
    pub fn get(
        &self,
        pla: Player,
        prev_move_loc: Loc,
        move_loc: Loc,
        recent_board_hash: Hash128,
    ) -> SubtreeValueBiasHandle {
        let key = SubtreeValueBiasKey { pla, prev_move_loc, move_loc, recent_board_hash };
        let mut shard = self.shard_for(&key).lock().unwrap();
        Arc::clone(shard.entry(key).or_default())
    }

    /// Drop entries no node references anymore. Caller must be the only
    /// thread touching the table.
    pub fn clear_unused_synchronous(&self) {
        for shard in &self.shards {
            shard.lock().unwrap().retain(|_, v| Arc::strong_count(v) > 1);
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Utility bonuses keyed by local pattern hash. The table itself is dumb
/// storage; hashes come from the game's pattern hasher and bonuses are
/// installed by the search (or supplied externally) before a search begins.
#[derive(Debug, Clone, Default)]
pub struct PatternBonusTable {
    entries: HashMap<Hash128, f64>,
}

impl PatternBonusTable {
    pub fn new() -> PatternBonusTable {
        PatternBonusTable::default()
    }

    pub fn get_bonus(&self, hash: Hash128) -> f64 {
        if hash.is_zero() {
            return 0.0;
        }
        self.entries.get(&hash).copied().unwrap_or(0.0)
    }

    /// Accumulate a bonus for a pattern context.
    pub fn add_bonus(&mut self, hash: Hash128, utility: f64) {
        if hash.is_zero() {
            return;
        }
        *self.entries.entry(hash).or_insert(0.0) += utility;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_contribution_replaces_not_accumulates() {
        let entry = SubtreeValueBiasEntry::default();
        entry.swap_contribution(0.0, 0.0, 0.5, 2.0);
        let (d, w) = entry.swap_contribution(0.5, 2.0, 0.25, 3.0);
        assert!((d - 0.25).abs() < 1e-12);
        assert!((w - 3.0).abs() < 1e-12);
    }

    #[test]
    fn table_dedupes_by_context() {
        let table = SubtreeValueBiasTable::new(8);
        let h = Hash128::new(11, 22);
        let a = table.get(Player::Black, Loc(3), Loc(4), h);
        let b = table.get(Player::Black, Loc(3), Loc(4), h);
        let c = table.get(Player::White, Loc(3), Loc(4), h);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn clear_unused_keeps_live_handles() {
        let table = SubtreeValueBiasTable::new(4);
        let h = Hash128::new(1, 2);
        let keep = table.get(Player::Black, Loc(0), Loc(1), h);
        let _drop = table.get(Player::White, Loc(0), Loc(2), h);
        drop(_drop);
        table.clear_unused_synchronous();
        assert_eq!(table.len(), 1);
        drop(keep);
        table.clear_unused_synchronous();
        assert!(table.is_empty());
    }

    #[test]
    fn pattern_bonus_accumulates() {
        let mut t = PatternBonusTable::new();
        let h = Hash128::new(5, 6);
        t.add_bonus(h, 0.1);
        t.add_bonus(h, -0.04);
        assert!((t.get_bonus(h) - 0.06).abs() < 1e-12);
        assert_eq!(t.get_bonus(Hash128::new(7, 8)), 0.0);
        // The zero hash is reserved for "no pattern".
        t.add_bonus(Hash128::ZERO, 1.0);
        assert_eq!(t.get_bonus(Hash128::ZERO), 0.0);
    }
}
