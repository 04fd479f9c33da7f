//! Atomic per-node statistics.
//!
//! Every statistic a node carries is individually atomic, so readers never
//! see torn numerics even without taking a lock. Writers serialize full-set
//! updates through a per-node test-and-set spinlock; readers may observe a
//! snapshot that is slightly stale or mid-update across fields, which the
//! consumers tolerate (and clamp where it matters).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// An `f64` cell with atomic load/store, bit-cast over `AtomicU64`.
#[derive(Default)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> AtomicF64 {
        AtomicF64 { bits: AtomicU64::new(value.to_bits()) }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> f64 {
        f64::from_bits(self.bits.load(order))
    }

    #[inline]
    pub fn store(&self, value: f64, order: Ordering) {
        self.bits.store(value.to_bits(), order)
    }
}

impl std::fmt::Debug for AtomicF64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.load(Ordering::Relaxed))
    }
}

/// Test-and-set spinlock guarding short critical sections (statistics
/// stores, bias-entry updates). Deliberately busy-waits: the hold times are
/// a handful of stores, far below the cost of parking a thread.
#[derive(Default)]
pub struct SpinLock {
    flag: AtomicBool,
}

impl SpinLock {
    pub fn new() -> SpinLock {
        SpinLock { flag: AtomicBool::new(false) }
    }

    #[inline]
    pub fn lock(&self) {
        while self.flag.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Run `f` under the lock.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let r = f();
        self.unlock();
        r
    }
}

/// Running averages and weights for one node, all white-perspective.
///
/// `*_avg` fields are weighted averages over the node's subtree (plus its own
/// evaluation); `weight_sum`/`weight_sq_sum` track the total and
/// sum-of-squares of contributing weights; `visits` counts completed visits
/// through this node.
#[derive(Default)]
pub struct NodeStats {
    pub visits: AtomicI64,
    pub win_loss_value_avg: AtomicF64,
    pub no_result_value_avg: AtomicF64,
    pub score_mean_avg: AtomicF64,
    pub score_mean_sq_avg: AtomicF64,
    pub lead_avg: AtomicF64,
    pub utility_avg: AtomicF64,
    pub utility_sq_avg: AtomicF64,
    pub weight_sum: AtomicF64,
    pub weight_sq_sum: AtomicF64,
}

impl NodeStats {
    pub fn new() -> NodeStats {
        NodeStats::default()
    }

    /// Acquire-load every field. Fields are read individually, so the result
    /// can mix values from two adjacent updates; it is never torn within one
    /// field.
    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            visits: self.visits.load(Ordering::Acquire),
            win_loss_value_avg: self.win_loss_value_avg.load(Ordering::Acquire),
            no_result_value_avg: self.no_result_value_avg.load(Ordering::Acquire),
            score_mean_avg: self.score_mean_avg.load(Ordering::Acquire),
            score_mean_sq_avg: self.score_mean_sq_avg.load(Ordering::Acquire),
            lead_avg: self.lead_avg.load(Ordering::Acquire),
            utility_avg: self.utility_avg.load(Ordering::Acquire),
            utility_sq_avg: self.utility_sq_avg.load(Ordering::Acquire),
            weight_sum: self.weight_sum.load(Ordering::Acquire),
            weight_sq_sum: self.weight_sq_sum.load(Ordering::Acquire),
        }
    }

    /// Copy for root promotion. The clone target is not yet shared.
    pub fn clone_values(&self) -> NodeStats {
        let s = self.snapshot();
        let out = NodeStats::new();
        out.visits.store(s.visits, Ordering::Relaxed);
        out.win_loss_value_avg.store(s.win_loss_value_avg, Ordering::Relaxed);
        out.no_result_value_avg.store(s.no_result_value_avg, Ordering::Relaxed);
        out.score_mean_avg.store(s.score_mean_avg, Ordering::Relaxed);
        out.score_mean_sq_avg.store(s.score_mean_sq_avg, Ordering::Relaxed);
        out.lead_avg.store(s.lead_avg, Ordering::Relaxed);
        out.utility_avg.store(s.utility_avg, Ordering::Relaxed);
        out.utility_sq_avg.store(s.utility_sq_avg, Ordering::Relaxed);
        out.weight_sum.store(s.weight_sum, Ordering::Relaxed);
        out.weight_sq_sum.store(s.weight_sq_sum, Ordering::Relaxed);
        out
    }
}

/// Per-child scratch used while recomputing a parent from its children.
#[derive(Clone, Copy, Debug)]
pub struct MoreChildStats {
    pub stats: NodeStatsSnapshot,
    /// Child utility from the parent's point of view.
    pub self_utility: f64,
    /// Child weight after edge-visit scaling and reweighting passes.
    pub weight_adjusted: f64,
    pub prev_move_loc: crate::game::Loc,
}

impl Default for MoreChildStats {
    fn default() -> Self {
        MoreChildStats {
            stats: NodeStatsSnapshot::default(),
            self_utility: 0.0,
            weight_adjusted: 0.0,
            prev_move_loc: crate::game::Loc::NULL,
        }
    }
}

/// Plain-value copy of [`NodeStats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeStatsSnapshot {
    pub visits: i64,
    pub win_loss_value_avg: f64,
    pub no_result_value_avg: f64,
    pub score_mean_avg: f64,
    pub score_mean_sq_avg: f64,
    pub lead_avg: f64,
    pub utility_avg: f64,
    pub utility_sq_avg: f64,
    pub weight_sum: f64,
    pub weight_sq_sum: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn atomic_f64_roundtrip() {
        let a = AtomicF64::new(1.5);
        assert_eq!(a.load(Ordering::Relaxed), 1.5);
        a.store(-0.25, Ordering::Release);
        assert_eq!(a.load(Ordering::Acquire), -0.25);
        a.store(f64::NEG_INFINITY, Ordering::Relaxed);
        assert_eq!(a.load(Ordering::Relaxed), f64::NEG_INFINITY);
    }

    #[test]
    fn spinlock_mutual_exclusion() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(AtomicF64::new(0.0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    lock.with(|| {
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1.0, Ordering::Relaxed);
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000.0);
    }

    #[test]
    fn snapshot_copies_all_fields() {
        let stats = NodeStats::new();
        stats.visits.store(7, Ordering::Relaxed);
        stats.utility_avg.store(0.125, Ordering::Relaxed);
        stats.weight_sum.store(7.5, Ordering::Relaxed);
        let s = stats.snapshot();
        assert_eq!(s.visits, 7);
        assert_eq!(s.utility_avg, 0.125);
        assert_eq!(s.weight_sum, 7.5);
        let copy = stats.clone_values();
        assert_eq!(copy.snapshot().visits, 7);
    }
}
