//! Search nodes and the lock-free child-array protocol.
//!
//! A node's children live in one of three fixed-capacity arrays (tiers).
//! Which tier is live is encoded in the node's `state` word, which only ever
//! advances. Readers load `state` with acquire semantics and index the
//! matching array; writers install children by CAS on individual slots and
//! grow capacity by CAS-ing `state` through a GROWING value while they copy
//! slots into the next tier. Old tiers are retained until the node is
//! dropped, so a reader holding a stale `state` still reads valid memory.
//!
//! Node ownership: all non-root nodes are owned by the
//! [`NodeTable`](crate::table::NodeTable); the root is owned directly by the
//! search handle. Child slots hold raw pointers into those allocations.
//! Nodes are only freed by the single-threaded sweep phases that run between
//! searches, which is what makes dereferencing an acquired child pointer
//! sound while a search is active.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicPtr, AtomicU16, AtomicU32, Ordering};

use crate::bias::SubtreeValueBiasHandle;
use crate::eval::NNOutput;
use crate::game::{Loc, Player, MAX_POLICY_SIZE};
use crate::hash::Hash128;
use crate::stats::{AtomicF64, NodeStats, SpinLock};

/// Capacities of the three child-array tiers. Most nodes never outgrow the
/// smallest tier.
pub const CHILDREN0_SIZE: usize = 8;
pub const CHILDREN1_SIZE: usize = 64;
pub const CHILDREN2_SIZE: usize = MAX_POLICY_SIZE;

/// One child slot: {child pointer, edge visits, move}. The pointer is the
/// publication point — a slot is live once its pointer is non-null, and the
/// move is always released before (or with) the pointer.
pub struct SearchChildPointer {
    node: AtomicPtr<SearchNode>,
    edge_visits: AtomicI64,
    move_loc: AtomicU16,
}

impl Default for SearchChildPointer {
    fn default() -> Self {
        SearchChildPointer {
            node: AtomicPtr::new(std::ptr::null_mut()),
            edge_visits: AtomicI64::new(0),
            move_loc: AtomicU16::new(Loc::NULL.0),
        }
    }
}

impl SearchChildPointer {
    /// Copy every field from another slot. Used single-threadedly (tier
    /// growth of a fresh array, root cloning).
    pub fn store_all(&self, other: &SearchChildPointer) {
        let n = other.node.load(Ordering::Acquire);
        let e = other.edge_visits.load(Ordering::Acquire);
        let m = other.move_loc.load(Ordering::Acquire);
        self.move_loc.store(m, Ordering::Release);
        self.edge_visits.store(e, Ordering::Release);
        self.node.store(n, Ordering::Release);
    }

    #[inline]
    pub fn get_if_allocated(&self) -> Option<&SearchNode> {
        let p = self.node.load(Ordering::Acquire);
        // Safety: see module docs — published nodes outlive the search phase.
        unsafe { p.as_ref() }
    }

    #[inline]
    pub fn raw(&self) -> *mut SearchNode {
        self.node.load(Ordering::Acquire)
    }

    #[inline]
    pub fn raw_relaxed(&self) -> *mut SearchNode {
        self.node.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, node: *mut SearchNode) {
        self.node.store(node, Ordering::Release);
    }

    #[inline]
    pub fn store_relaxed(&self, node: *mut SearchNode) {
        self.node.store(node, Ordering::Relaxed);
    }

    pub fn store_if_null(&self, node: *mut SearchNode) -> bool {
        self.node
            .compare_exchange(std::ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn edge_visits(&self) -> i64 {
        self.edge_visits.load(Ordering::Acquire)
    }

    #[inline]
    pub fn edge_visits_relaxed(&self) -> i64 {
        self.edge_visits.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_edge_visits(&self, x: i64) {
        self.edge_visits.store(x, Ordering::Release);
    }

    #[inline]
    pub fn set_edge_visits_relaxed(&self, x: i64) {
        self.edge_visits.store(x, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_edge_visits(&self, delta: i64) {
        self.edge_visits.fetch_add(delta, Ordering::AcqRel);
    }

    /// Weak-CAS on edge visits; on failure `expected` is refreshed.
    #[inline]
    pub fn compare_exchange_weak_edge_visits(&self, expected: &mut i64, desired: i64) -> bool {
        match self.edge_visits.compare_exchange_weak(
            *expected,
            desired,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(actual) => {
                *expected = actual;
                false
            }
        }
    }

    #[inline]
    pub fn move_loc(&self) -> Loc {
        Loc(self.move_loc.load(Ordering::Acquire))
    }

    #[inline]
    pub fn move_loc_relaxed(&self) -> Loc {
        Loc(self.move_loc.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_move_loc(&self, loc: Loc) {
        self.move_loc.store(loc.0, Ordering::Release);
    }

    #[inline]
    pub fn set_move_loc_relaxed(&self, loc: Loc) {
        self.move_loc.store(loc.0, Ordering::Relaxed);
    }
}

fn alloc_child_array(capacity: usize) -> *mut SearchChildPointer {
    let boxed: Box<[SearchChildPointer]> =
        (0..capacity).map(|_| SearchChildPointer::default()).collect();
    Box::into_raw(boxed) as *mut SearchChildPointer
}

unsafe fn free_child_array(ptr: *mut SearchChildPointer, capacity: usize) {
    if !ptr.is_null() {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, capacity)));
    }
}

/// One position in the tree (graph mode: one per distinct position; tree
/// mode: one per edge).
pub struct SearchNode {
    /// Player to move at this node.
    pub next_pla: Player,
    /// Terminal detection is suppressed here (root, and root-pass children
    /// under conservative pass).
    pub force_non_terminal: bool,
    /// Key into the pattern-bonus table, fixed at creation.
    pub pattern_bonus_hash: Hash128,
    /// Index into the shared mutex pool for rare per-node synchronization.
    pub mutex_idx: u32,

    /// Expansion state machine; monotone non-decreasing.
    pub state: AtomicU32,
    nn_output: AtomicPtr<NNOutput>,
    /// GC / root-refresh age mark.
    pub node_age: AtomicU32,

    children0: AtomicPtr<SearchChildPointer>,
    children1: AtomicPtr<SearchChildPointer>,
    children2: AtomicPtr<SearchChildPointer>,

    pub stats: NodeStats,
    pub stats_lock: SpinLock,
    /// Threads currently descending through this node.
    pub virtual_losses: AtomicI32,
    /// Pending stat-recomputation count; the thread that raises it from zero
    /// is the recomputer.
    pub dirty_counter: AtomicI32,

    /// This node's last contribution to its shared bias entry, so the
    /// contribution can be swapped rather than double-counted. Only the
    /// single active recomputer writes these.
    pub last_subtree_value_bias_delta_sum: AtomicF64,
    pub last_subtree_value_bias_weight: AtomicF64,
    /// Shared bias entry, fixed at creation (never copied on clone: the clone
    /// would otherwise double-subtract on deletion).
    pub bias_handle: Option<SubtreeValueBiasHandle>,
}

impl SearchNode {
    pub const STATE_UNEVALUATED: u32 = 0;
    pub const STATE_EVALUATING: u32 = 1;
    pub const STATE_EXPANDED0: u32 = 2;
    pub const STATE_GROWING1: u32 = 3;
    pub const STATE_EXPANDED1: u32 = 4;
    pub const STATE_GROWING2: u32 = 5;
    pub const STATE_EXPANDED2: u32 = 6;

    pub fn new(next_pla: Player, force_non_terminal: bool, mutex_idx: u32) -> SearchNode {
        SearchNode {
            next_pla,
            force_non_terminal,
            pattern_bonus_hash: Hash128::ZERO,
            mutex_idx,
            state: AtomicU32::new(SearchNode::STATE_UNEVALUATED),
            nn_output: AtomicPtr::new(std::ptr::null_mut()),
            node_age: AtomicU32::new(0),
            children0: AtomicPtr::new(std::ptr::null_mut()),
            children1: AtomicPtr::new(std::ptr::null_mut()),
            children2: AtomicPtr::new(std::ptr::null_mut()),
            stats: NodeStats::new(),
            stats_lock: SpinLock::new(),
            virtual_losses: AtomicI32::new(0),
            dirty_counter: AtomicI32::new(0),
            last_subtree_value_bias_delta_sum: AtomicF64::new(0.0),
            last_subtree_value_bias_weight: AtomicF64::new(0.0),
            bias_handle: None,
        }
    }

    /// Deep-enough copy for promoting a child to root: children slots and the
    /// evaluator output are duplicated, the bias entry is dropped.
    pub fn clone_for_root(&self, force_non_terminal: bool) -> SearchNode {
        let node = SearchNode {
            next_pla: self.next_pla,
            force_non_terminal,
            pattern_bonus_hash: self.pattern_bonus_hash,
            mutex_idx: self.mutex_idx,
            state: AtomicU32::new(self.state.load(Ordering::Acquire)),
            nn_output: AtomicPtr::new(match self.nn_output() {
                Some(out) => Box::into_raw(Box::new(out.clone())),
                None => std::ptr::null_mut(),
            }),
            node_age: AtomicU32::new(self.node_age.load(Ordering::Acquire)),
            children0: AtomicPtr::new(std::ptr::null_mut()),
            children1: AtomicPtr::new(std::ptr::null_mut()),
            children2: AtomicPtr::new(std::ptr::null_mut()),
            stats: self.stats.clone_values(),
            stats_lock: SpinLock::new(),
            virtual_losses: AtomicI32::new(self.virtual_losses.load(Ordering::Acquire)),
            dirty_counter: AtomicI32::new(self.dirty_counter.load(Ordering::Acquire)),
            last_subtree_value_bias_delta_sum: AtomicF64::new(0.0),
            last_subtree_value_bias_weight: AtomicF64::new(0.0),
            bias_handle: None,
        };

        for (src, dst, cap) in [
            (&self.children0, &node.children0, CHILDREN0_SIZE),
            (&self.children1, &node.children1, CHILDREN1_SIZE),
            (&self.children2, &node.children2, CHILDREN2_SIZE),
        ] {
            let src_ptr = src.load(Ordering::Acquire);
            if !src_ptr.is_null() {
                let arr = alloc_child_array(cap);
                let src_slice = unsafe { std::slice::from_raw_parts(src_ptr, cap) };
                let dst_slice = unsafe { std::slice::from_raw_parts(arr, cap) };
                for (s, d) in src_slice.iter().zip(dst_slice.iter()) {
                    d.store_all(s);
                }
                dst.store(arr, Ordering::Relaxed);
            }
        }
        node
    }

    // ---- children --------------------------------------------------------

    pub fn children_capacity_for_state(state_value: u32) -> usize {
        if state_value >= SearchNode::STATE_EXPANDED2 {
            CHILDREN2_SIZE
        } else if state_value >= SearchNode::STATE_EXPANDED1 {
            CHILDREN1_SIZE
        } else if state_value >= SearchNode::STATE_EXPANDED0 {
            CHILDREN0_SIZE
        } else {
            0
        }
    }

    /// Children array live under the given observed state value. Empty before
    /// EXPANDED0.
    pub fn children_for_state(&self, state_value: u32) -> &[SearchChildPointer] {
        let (ptr, cap) = if state_value >= SearchNode::STATE_EXPANDED2 {
            (self.children2.load(Ordering::Acquire), CHILDREN2_SIZE)
        } else if state_value >= SearchNode::STATE_EXPANDED1 {
            (self.children1.load(Ordering::Acquire), CHILDREN1_SIZE)
        } else if state_value >= SearchNode::STATE_EXPANDED0 {
            (self.children0.load(Ordering::Acquire), CHILDREN0_SIZE)
        } else {
            (std::ptr::null_mut(), 0)
        };
        if ptr.is_null() {
            &[]
        } else {
            // Safety: arrays are only freed on node drop, and a state value
            // >= EXPANDEDk implies the tier-k array was published.
            unsafe { std::slice::from_raw_parts(ptr, cap) }
        }
    }

    pub fn children(&self) -> &[SearchChildPointer] {
        self.children_for_state(self.state.load(Ordering::Acquire))
    }

    /// Count of live children: slots are filled left to right, so stop at the
    /// first null.
    pub fn count_children_in(children: &[SearchChildPointer]) -> usize {
        let mut n = 0;
        for c in children {
            if c.get_if_allocated().is_none() {
                break;
            }
            n += 1;
        }
        n
    }

    pub fn count_children(&self) -> usize {
        SearchNode::count_children_in(self.children())
    }

    /// Allocate the first tier. Called exactly once, by the thread that won
    /// the EVALUATING transition.
    pub fn initialize_children(&self) {
        debug_assert!(self.children0.load(Ordering::Relaxed).is_null());
        self.children0.store(alloc_child_array(CHILDREN0_SIZE), Ordering::Release);
    }

    /// Ensure capacity for one more child given that `num_children_full_plus_one - 1`
    /// slots of the tier indicated by `state_value` are occupied.
    ///
    /// Returns false if another thread is currently growing; the caller
    /// should yield and retry selection. On success `state_value` is updated
    /// to the current state.
    pub fn maybe_expand_children_capacity_for_new_child(
        &self,
        state_value: &mut u32,
        num_children_full_plus_one: usize,
    ) -> bool {
        let capacity = SearchNode::children_capacity_for_state(*state_value);
        if capacity < num_children_full_plus_one {
            debug_assert_eq!(capacity, num_children_full_plus_one - 1);
            return self.try_expanding_children_capacity_assume_full(state_value);
        }
        true
    }

    /// Grow to the next tier, assuming the current tier is completely full.
    /// Every occupied slot was observed non-null by the caller, so relaxed
    /// re-loads of those slots are sound; the new array is published by the
    /// release store of `state`.
    fn try_expanding_children_capacity_assume_full(&self, state_value: &mut u32) -> bool {
        if *state_value < SearchNode::STATE_EXPANDED1 {
            if *state_value == SearchNode::STATE_GROWING1 {
                return false;
            }
            debug_assert_eq!(*state_value, SearchNode::STATE_EXPANDED0);
            if self
                .state
                .compare_exchange(
                    *state_value,
                    SearchNode::STATE_GROWING1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return false;
            }
            *state_value = SearchNode::STATE_GROWING1;

            let new_arr = alloc_child_array(CHILDREN1_SIZE);
            let old = self.children0.load(Ordering::Acquire);
            debug_assert!(!old.is_null());
            let old_slice = unsafe { std::slice::from_raw_parts(old, CHILDREN0_SIZE) };
            let new_slice = unsafe { std::slice::from_raw_parts(new_arr, CHILDREN1_SIZE) };
            for (o, n) in old_slice.iter().zip(new_slice.iter()) {
                let child = o.raw_relaxed();
                debug_assert!(!child.is_null());
                n.store_relaxed(child);
                // Edge visits may lag a racing update; playouts self-correct.
                n.set_edge_visits_relaxed(o.edge_visits_relaxed());
                n.set_move_loc_relaxed(o.move_loc_relaxed());
            }
            debug_assert!(self.children1.load(Ordering::Relaxed).is_null());
            self.children1.store(new_arr, Ordering::Release);
            self.state.store(SearchNode::STATE_EXPANDED1, Ordering::Release);
            *state_value = SearchNode::STATE_EXPANDED1;
        } else if *state_value < SearchNode::STATE_EXPANDED2 {
            if *state_value == SearchNode::STATE_GROWING2 {
                return false;
            }
            debug_assert_eq!(*state_value, SearchNode::STATE_EXPANDED1);
            if self
                .state
                .compare_exchange(
                    *state_value,
                    SearchNode::STATE_GROWING2,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return false;
            }
            *state_value = SearchNode::STATE_GROWING2;

            let new_arr = alloc_child_array(CHILDREN2_SIZE);
            let old = self.children1.load(Ordering::Acquire);
            debug_assert!(!old.is_null());
            let old_slice = unsafe { std::slice::from_raw_parts(old, CHILDREN1_SIZE) };
            let new_slice = unsafe { std::slice::from_raw_parts(new_arr, CHILDREN2_SIZE) };
            for (o, n) in old_slice.iter().zip(new_slice.iter()) {
                let child = o.raw_relaxed();
                debug_assert!(!child.is_null());
                n.store_relaxed(child);
                n.set_edge_visits_relaxed(o.edge_visits_relaxed());
                n.set_move_loc_relaxed(o.move_loc_relaxed());
            }
            debug_assert!(self.children2.load(Ordering::Relaxed).is_null());
            self.children2.store(new_arr, Ordering::Release);
            self.state.store(SearchNode::STATE_EXPANDED2, Ordering::Release);
            *state_value = SearchNode::STATE_EXPANDED2;
        } else {
            unreachable!("no tier beyond the largest children array");
        }
        true
    }

    /// Drop smaller tiers after single-threaded root filtering rewrote the
    /// live one. Only valid while nothing else runs.
    pub fn discard_stale_tiers_below_live(&self) {
        let state_value = self.state.load(Ordering::Acquire);
        if state_value >= SearchNode::STATE_EXPANDED2 {
            unsafe {
                free_child_array(self.children1.swap(std::ptr::null_mut(), Ordering::AcqRel), CHILDREN1_SIZE);
                free_child_array(self.children0.swap(std::ptr::null_mut(), Ordering::AcqRel), CHILDREN0_SIZE);
            }
        } else if state_value >= SearchNode::STATE_EXPANDED1 {
            unsafe {
                free_child_array(self.children0.swap(std::ptr::null_mut(), Ordering::AcqRel), CHILDREN0_SIZE);
            }
        }
    }

    // ---- evaluator output ------------------------------------------------

    pub fn nn_output(&self) -> Option<&NNOutput> {
        let p = self.nn_output.load(Ordering::Acquire);
        // Safety: replaced outputs are retired to cleanup lists and freed
        // only between searches, so an acquired pointer stays valid for the
        // remainder of the search phase.
        unsafe { p.as_ref() }
    }

    pub fn has_nn_output(&self) -> bool {
        !self.nn_output.load(Ordering::Acquire).is_null()
    }

    /// Unconditionally replace the output, returning the retired prior value
    /// (if any) for deferred cleanup. Returns `Ok` when there was no prior
    /// value.
    pub fn store_nn_output(&self, new: Box<NNOutput>) -> Result<(), RetiredNNOutput> {
        let old = self.nn_output.swap(Box::into_raw(new), Ordering::AcqRel);
        if old.is_null() {
            Ok(())
        } else {
            Err(RetiredNNOutput(old))
        }
    }

    /// First-writer-wins install. Losers get their payload back to free
    /// immediately (it was never published).
    pub fn store_nn_output_if_null(&self, new: Box<NNOutput>) -> Result<(), Box<NNOutput>> {
        let raw = Box::into_raw(new);
        match self.nn_output.compare_exchange(
            std::ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            // Safety: raw was just created by us and never shared.
            Err(_) => Err(unsafe { Box::from_raw(raw) }),
        }
    }
}

impl Drop for SearchNode {
    fn drop(&mut self) {
        // Children are owned by the node table, not recursively deleted.
        unsafe {
            free_child_array(*self.children2.get_mut(), CHILDREN2_SIZE);
            free_child_array(*self.children1.get_mut(), CHILDREN1_SIZE);
            free_child_array(*self.children0.get_mut(), CHILDREN0_SIZE);
            let nn = *self.nn_output.get_mut();
            if !nn.is_null() {
                drop(Box::from_raw(nn));
            }
        }
    }
}

/// An evaluator output detached from its node, awaiting deferred cleanup.
/// Holding one is an obligation to call [`RetiredNNOutput::free`] (or drop
/// it) strictly after every reader of the old pointer has finished, which the
/// search guarantees by freeing only between searches.
pub struct RetiredNNOutput(*mut NNOutput);

// The pointed-to output is exclusively owned once retired; moving the
// obligation across threads is fine.
unsafe impl Send for RetiredNNOutput {}

impl Drop for RetiredNNOutput {
    fn drop(&mut self) {
        // Safety: exclusive ownership per the retirement contract.
        unsafe { drop(Box::from_raw(self.0)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::NNOutput;

    fn dummy_output(tag: u64) -> Box<NNOutput> {
        Box::new(NNOutput {
            nn_hash: Hash128::new(tag, tag),
            policy: vec![1.0],
            noised_policy: None,
            white_win_prob: 0.5,
            white_loss_prob: 0.5,
            white_no_result_prob: 0.0,
            white_score_mean: 0.0,
            white_score_mean_sq: 0.0,
            white_lead: 0.0,
            shortterm_winloss_error: 0.0,
            shortterm_score_error: 0.0,
            white_owner_map: None,
        })
    }

    #[test]
    fn nn_output_install_first_writer_wins() {
        let node = SearchNode::new(Player::Black, false, 0);
        assert!(node.nn_output().is_none());
        assert!(node.store_nn_output_if_null(dummy_output(1)).is_ok());
        let lost = node.store_nn_output_if_null(dummy_output(2));
        assert!(lost.is_err());
        assert_eq!(node.nn_output().unwrap().nn_hash, Hash128::new(1, 1));
    }

    #[test]
    fn nn_output_replace_retires_old() {
        let node = SearchNode::new(Player::Black, false, 0);
        assert!(node.store_nn_output(dummy_output(1)).is_ok());
        let retired = node.store_nn_output(dummy_output(2));
        assert!(retired.is_err());
        assert_eq!(node.nn_output().unwrap().nn_hash, Hash128::new(2, 2));
        drop(retired);
    }

    #[test]
    fn tier_growth_preserves_slots() {
        let node = SearchNode::new(Player::White, false, 0);
        node.initialize_children();
        node.state.store(SearchNode::STATE_EXPANDED0, Ordering::Release);

        // Fill tier 0 with pointers to leaked dummy nodes.
        let mut leaked: Vec<*mut SearchNode> = Vec::new();
        {
            let children = node.children();
            assert_eq!(children.len(), CHILDREN0_SIZE);
            for (i, c) in children.iter().enumerate() {
                let p = Box::into_raw(Box::new(SearchNode::new(Player::Black, false, 0)));
                leaked.push(p);
                c.set_move_loc(Loc(i as u16));
                c.set_edge_visits(i as i64);
                assert!(c.store_if_null(p));
            }
        }

        let mut state = node.state.load(Ordering::Acquire);
        assert!(node
            .maybe_expand_children_capacity_for_new_child(&mut state, CHILDREN0_SIZE + 1));
        assert_eq!(state, SearchNode::STATE_EXPANDED1);

        let children = node.children();
        assert_eq!(children.len(), CHILDREN1_SIZE);
        for i in 0..CHILDREN0_SIZE {
            assert_eq!(children[i].raw(), leaked[i]);
            assert_eq!(children[i].move_loc(), Loc(i as u16));
            assert_eq!(children[i].edge_visits(), i as i64);
        }
        assert!(children[CHILDREN0_SIZE].get_if_allocated().is_none());

        // A stale observer of the old state still reads the old tier safely.
        let old_children = node.children_for_state(SearchNode::STATE_EXPANDED0);
        assert_eq!(old_children.len(), CHILDREN0_SIZE);
        assert_eq!(old_children[3].raw(), leaked[3]);

        for p in leaked {
            unsafe { drop(Box::from_raw(p)) };
        }
    }

    #[test]
    fn growth_contended_state_fails_fast() {
        let node = SearchNode::new(Player::White, false, 0);
        node.initialize_children();
        node.state.store(SearchNode::STATE_GROWING1, Ordering::Release);
        let mut state = SearchNode::STATE_GROWING1;
        assert!(!node.maybe_expand_children_capacity_for_new_child(&mut state, CHILDREN0_SIZE + 1));
    }

    #[test]
    fn clone_for_root_copies_but_drops_bias() {
        let node = SearchNode::new(Player::White, false, 7);
        assert!(node.store_nn_output_if_null(dummy_output(9)).is_ok());
        node.initialize_children();
        node.state.store(SearchNode::STATE_EXPANDED0, Ordering::Release);
        node.stats.visits.store(5, Ordering::Relaxed);

        let clone = node.clone_for_root(true);
        assert!(clone.force_non_terminal);
        assert_eq!(clone.stats.visits.load(Ordering::Relaxed), 5);
        assert_eq!(clone.nn_output().unwrap().nn_hash, Hash128::new(9, 9));
        assert!(clone.bias_handle.is_none());
        // The cloned output is a distinct allocation.
        assert!(!std::ptr::eq(node.nn_output().unwrap(), clone.nn_output().unwrap()));
    }
}
