//! Tree maintenance between searches: marking, sweeping, and whole-tree
//! statistics recomputation.
//!
//! Node ages double as mark bits. Every traversal first advances the global
//! age epoch, then stamps nodes as it finishes them; a sweep afterwards
//! deletes whatever kept a stale age. Traversals run on all worker threads,
//! with per-thread shuffled child orders so the threads fan out instead of
//! convoying. Cycles (possible in the DAG) are cut by a per-thread
//! in-progress set.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::eval::Evaluator;
use crate::game::{GameState, Loc};
use crate::node::SearchNode;
use crate::search::Search;

impl<G: GameState, E: Evaluator<G>> Search<G, E> {
    /// Mark everything reachable from the root, in no particular order.
    pub(crate) fn mark_reachable_any_order(&mut self) {
        self.apply_recursively_any_order_multithreaded(None);
    }

    /// Advance the age epoch (invalidating all ages so they can serve as
    /// done-markers) and draw per-thread shuffle seeds.
    fn prepare_walk(&mut self) -> (u32, Vec<u64>) {
        self.search_node_age += 1;
        let age = self.search_node_age;
        let num_threads = self.params.num_threads.max(1);
        let seeds: Vec<u64> = (0..num_threads).map(|_| self.non_search_rng.gen()).collect();
        (age, seeds)
    }

    fn run_post_order_walk(
        &self,
        age: u32,
        seeds: &[u64],
        f: Option<&(dyn Fn(&SearchNode, usize) + Sync)>,
    ) {
        let Some(root) = self.root_node.as_deref() else { return };
        let task = |thread_idx: usize| {
            // Thread 0 walks in order; the rest shuffle to spread out.
            let mut rng =
                (thread_idx > 0).then(|| ChaCha20Rng::seed_from_u64(seeds[thread_idx]));
            let mut in_progress: HashSet<*const SearchNode> = HashSet::new();
            self.post_order_helper(root, age, thread_idx, &mut rng, &mut in_progress, f);
        };
        self.perform_task_with_threads(&task);
    }

    /// Walk the tree from the root, calling `f` once per node in post-order
    /// (children strictly before parents), in parallel. As a side effect,
    /// exactly the walked nodes end with `node_age == search_node_age`.
    pub(crate) fn apply_recursively_post_order_multithreaded(
        &mut self,
        f: Option<&(dyn Fn(&SearchNode, usize) + Sync)>,
    ) {
        let (age, seeds) = self.prepare_walk();
        self.run_post_order_walk(age, &seeds, f);
    }

    fn post_order_helper(
        &self,
        node: &SearchNode,
        age: u32,
        thread_idx: usize,
        rng: &mut Option<ChaCha20Rng>,
        in_progress: &mut HashSet<*const SearchNode>,
        f: Option<&(dyn Fn(&SearchNode, usize) + Sync)>,
    ) {
        // age == current epoch means the node is done.
        if node.node_age.load(Ordering::Acquire) == age {
            return;
        }
        // Cycle: treat the back edge as already finished.
        if !in_progress.insert(node as *const SearchNode) {
            return;
        }

        let children = node.children();
        let num_children = SearchNode::count_children_in(children);
        if num_children > 0 {
            let mut order: Vec<usize> = (0..num_children).collect();
            if let Some(rng) = rng.as_mut() {
                order.shuffle(rng);
            }
            for &i in &order {
                if let Some(child) = children[i].get_if_allocated() {
                    self.post_order_helper(child, age, thread_idx, rng, in_progress, f);
                }
            }
        }
        in_progress.remove(&(node as *const SearchNode));

        // Serialize the post-visit through the node's pooled mutex so `f`
        // runs exactly once even when two threads finish simultaneously.
        let _guard = self.mutex_pool.lock(node.mutex_idx);
        if node.node_age.load(Ordering::Acquire) == age {
            return;
        }
        if let Some(f) = f {
            f(node, thread_idx);
        }
        node.node_age.store(age, Ordering::Release);
    }

    /// Like the post-order walk but with no ordering guarantee, only
    /// exactly-once per node.
    pub(crate) fn apply_recursively_any_order_multithreaded(
        &mut self,
        f: Option<&(dyn Fn(&SearchNode, usize) + Sync)>,
    ) {
        let (age, seeds) = self.prepare_walk();
        let Some(root) = self.root_node.as_deref() else { return };
        let task = |thread_idx: usize| {
            let mut rng =
                (thread_idx > 0).then(|| ChaCha20Rng::seed_from_u64(seeds[thread_idx]));
            let mut in_progress: HashSet<*const SearchNode> = HashSet::new();
            self.any_order_helper(root, age, thread_idx, &mut rng, &mut in_progress, f);
        };
        self.perform_task_with_threads(&task);
    }

    fn any_order_helper(
        &self,
        node: &SearchNode,
        age: u32,
        thread_idx: usize,
        rng: &mut Option<ChaCha20Rng>,
        in_progress: &mut HashSet<*const SearchNode>,
        f: Option<&(dyn Fn(&SearchNode, usize) + Sync)>,
    ) {
        if node.node_age.load(Ordering::Acquire) == age {
            return;
        }
        if !in_progress.insert(node as *const SearchNode) {
            return;
        }

        let children = node.children();
        let num_children = SearchNode::count_children_in(children);
        if num_children > 0 {
            let mut order: Vec<usize> = (0..num_children).collect();
            if let Some(rng) = rng.as_mut() {
                order.shuffle(rng);
            }
            for &i in &order {
                if let Some(child) = children[i].get_if_allocated() {
                    self.any_order_helper(child, age, thread_idx, rng, in_progress, f);
                }
            }
        }
        in_progress.remove(&(node as *const SearchNode));

        // First thread to stamp the age wins and performs the action.
        let old_age = node.node_age.swap(age, Ordering::AcqRel);
        if old_age == age {
            return;
        }
        if let Some(f) = f {
            f(node, thread_idx);
        }
    }

    /// Unwind a to-be-deleted node's contribution to its shared bias entry.
    fn remove_subtree_value_bias(&self, node: &mut SearchNode) {
        if let Some(entry) = node.bias_handle.take() {
            let free_prop = self.params.subtree_value_bias_free_prop;
            let delta =
                node.last_subtree_value_bias_delta_sum.load(Ordering::Acquire) * free_prop;
            let weight = node.last_subtree_value_bias_weight.load(Ordering::Acquire) * free_prop;
            entry.subtract(delta, weight);
        }
    }

    /// Delete every table node whose age predates the current epoch,
    /// unwinding bias contributions as they go.
    pub(crate) fn delete_old_table_nodes_and_unwind_bias(&self) {
        let age = self.search_node_age;
        let num_shards = self.node_table.num_shards();
        let num_threads = self.params.num_threads.max(1);
        let task = |thread_idx: usize| {
            let begin = thread_idx * num_shards / num_threads;
            let end = (thread_idx + 1) * num_shards / num_threads;
            self.node_table.retain_in_shards(
                begin,
                end,
                |node| node.node_age.load(Ordering::Acquire) >= age,
                |node| self.remove_subtree_value_bias(node),
            );
        };
        self.perform_task_with_threads(&task);
    }

    /// Delete every table node. Cheaper than the age-filtered sweep and does
    /// not bother unwinding bias entries (the bias table dies with the tree).
    pub(crate) fn delete_all_table_nodes_multithreaded(&self) {
        let num_shards = self.node_table.num_shards();
        let num_threads = self.params.num_threads.max(1);
        let task = |thread_idx: usize| {
            let begin = thread_idx * num_shards / num_threads;
            let end = (thread_idx + 1) * num_shards / num_threads;
            self.node_table.clear_shards(begin, end);
        };
        self.perform_task_with_threads(&task);
    }

    /// Recompute every node's statistics bottom-up. Used when utility
    /// definitions shifted under the tree (score center moved, bias/pattern
    /// tables rebuilt). Must not run concurrently with playouts.
    pub(crate) fn recursively_recompute_stats(&mut self) {
        let (age, seeds) = self.prepare_walk();
        let num_threads = self.params.num_threads.max(1);
        let dummy_threads: Vec<Mutex<crate::worker::SearchThread<G>>> =
            (0..num_threads).map(|i| Mutex::new(self.make_search_thread(i))).collect();
        // Address only, so the closure stays shareable across workers.
        let root_addr = match self.root_node.as_deref() {
            Some(root) => root as *const SearchNode as usize,
            None => return,
        };

        let this: &Search<G, E> = self;
        let f = move |node: &SearchNode, thread_idx: usize| {
            let mut thread = dummy_threads[thread_idx].lock().unwrap();

            let num_children = node.count_children();
            debug_assert!(num_children == 0 || node.has_nn_output());
            debug_assert_eq!(node.virtual_losses.load(Ordering::Acquire), 0);

            let is_root = node as *const SearchNode as usize == root_addr;
            if num_children == 0 {
                let visits = node.stats.visits.load(Ordering::Acquire);
                let weight_sum = node.stats.weight_sum.load(Ordering::Acquire);
                if weight_sum <= 0.0 {
                    // A root that was created but never searched.
                    debug_assert_eq!(visits, 0);
                    debug_assert!(is_root);
                } else {
                    let win_loss = node.stats.win_loss_value_avg.load(Ordering::Acquire);
                    let no_result = node.stats.no_result_value_avg.load(Ordering::Acquire);
                    let score_mean = node.stats.score_mean_avg.load(Ordering::Acquire);
                    let score_mean_sq = node.stats.score_mean_sq_avg.load(Ordering::Acquire);
                    let mut utility = this.get_result_utility(win_loss, no_result)
                        + this.get_score_utility(score_mean, score_mean_sq);
                    utility +=
                        this.get_pattern_bonus(node.pattern_bonus_hash, node.next_pla.opp());
                    let utility_sq = utility * utility;
                    node.stats_lock.with(|| {
                        node.stats.utility_avg.store(utility, Ordering::Release);
                        node.stats.utility_sq_avg.store(utility_sq, Ordering::Release);
                    });
                }
            } else {
                this.recompute_node_stats(node, &mut thread, 0, is_root);
            }
        };
        this.run_post_order_walk(age, &seeds, Some(&f));
    }

    /// Filter root children that are no longer legal or allowed, fix up the
    /// root's statistics, and sweep anything that became unreachable.
    /// Single-threaded with respect to the tree; runs before workers spawn.
    pub(crate) fn filter_and_refresh_root_children(&mut self) {
        let mut any_filtered = false;
        {
            let root = self.root_node.as_deref().expect("root exists");
            let children = root.children();
            if !children.is_empty() {
                // Collect the live slots, then rewrite the array compacted.
                // This breaks the usual append-only invariant, which is fine
                // only because nothing else is running.
                let slots: Vec<(*mut SearchNode, i64, Loc)> = children
                    .iter()
                    .take_while(|c| !c.raw().is_null())
                    .map(|c| (c.raw(), c.edge_visits(), c.move_loc()))
                    .collect();
                for c in children.iter().take(slots.len()) {
                    c.store(std::ptr::null_mut());
                    c.set_edge_visits(0);
                    c.set_move_loc(Loc::NULL);
                }
                let mut num_good = 0usize;
                for &(ptr, edge_visits, loc) in &slots {
                    // Strict legality here: whatever graph oddities occurred
                    // deeper in the tree, the root obeys the real rules.
                    if self.root_game.is_legal(loc, self.root_pla) && self.is_allowed_root_move(loc)
                    {
                        children[num_good].store(ptr);
                        children[num_good].set_edge_visits(edge_visits);
                        children[num_good].set_move_loc(loc);
                        num_good += 1;
                    } else {
                        any_filtered = true;
                        // Dropped children stay in the table until the sweep.
                    }
                }

                if any_filtered {
                    let new_num_visits: i64 = children
                        .iter()
                        .take(num_good)
                        .map(|c| c.edge_visits())
                        .sum::<i64>()
                        + 1; // the node's own visit
                    root.discard_stale_tiers_below_live();
                    root.stats_lock.with(|| {
                        root.stats.visits.store(new_num_visits, Ordering::Release);
                    });
                    let mut thread = self.make_search_thread(0);
                    self.recompute_node_stats(root, &mut thread, 0, true);
                }
            }
        }

        // Dynamic score centers, bias tables, and pattern bonuses all shift
        // what utilities mean between searches; rewrite the whole tree's
        // statistics under the new definitions.
        if self.params.dynamic_score_utility_factor != 0.0
            || self.params.subtree_value_bias_factor != 0.0
            || self.pattern_bonus_table.is_some()
        {
            self.recursively_recompute_stats();
            if any_filtered {
                // The recompute marked everything reachable; sweep the rest.
                self.delete_old_table_nodes_and_unwind_bias();
            }
        } else if any_filtered {
            self.mark_reachable_any_order();
            self.delete_old_table_nodes_and_unwind_bias();
        }
    }

    /// Walk the tree checking structural invariants. Must not run while a
    /// search is active. Intended for tests and debugging.
    pub fn verify_tree_integrity(&self) -> Result<(), String> {
        let Some(root) = self.root_node.as_deref() else {
            return Ok(());
        };
        let mut visited: HashSet<*const SearchNode> = HashSet::new();
        self.verify_node(root, true, &mut visited)
    }

    fn verify_node(
        &self,
        node: &SearchNode,
        is_root: bool,
        visited: &mut HashSet<*const SearchNode>,
    ) -> Result<(), String> {
        if !visited.insert(node as *const SearchNode) {
            return Ok(());
        }

        let state = node.state.load(Ordering::Acquire);
        if state >= SearchNode::STATE_EXPANDED0 && !node.has_nn_output() {
            return Err("expanded node with no evaluator output".to_string());
        }
        let visits = node.stats.visits.load(Ordering::Acquire);
        let weight_sum = node.stats.weight_sum.load(Ordering::Acquire);
        let weight_sq_sum = node.stats.weight_sq_sum.load(Ordering::Acquire);
        if weight_sum < 0.0 || weight_sq_sum < 0.0 {
            return Err(format!("negative weights: {weight_sum} {weight_sq_sum}"));
        }
        if visits == 0 && weight_sum != 0.0 {
            return Err("zero visits with nonzero weight".to_string());
        }
        if node.virtual_losses.load(Ordering::Acquire) != 0 {
            return Err("virtual losses outstanding at quiescence".to_string());
        }

        let children = node.children();
        let mut edge_visit_sum = 0i64;
        let mut seen_null = false;
        for c in children {
            match c.get_if_allocated() {
                None => seen_null = true,
                Some(child) => {
                    if seen_null {
                        return Err("child slots are not left-packed".to_string());
                    }
                    let edge_visits = c.edge_visits();
                    let child_visits = child.stats.visits.load(Ordering::Acquire);
                    if edge_visits > child_visits {
                        return Err(format!(
                            "edge visits {edge_visits} exceed child visits {child_visits}"
                        ));
                    }
                    edge_visit_sum += edge_visits;
                    self.verify_node(child, false, visited)?;
                }
            }
        }
        if is_root && visits > 0 && edge_visit_sum + 1 > visits {
            return Err(format!(
                "root edge visits {edge_visit_sum} + 1 exceed root visits {visits}"
            ));
        }
        Ok(())
    }
}
