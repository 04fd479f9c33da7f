//! Playouts: descend from the root, expand or evaluate a leaf, and walk the
//! statistics back up.
//!
//! A playout that loses a race (evaluator install, state transition, child
//! slot) returns `Ok(false)` without touching statistics; the driver yields
//! and retries. Genuine errors (evaluator failure) propagate and end the
//! search.

use std::sync::atomic::Ordering;

use tracing::warn;

use crate::eval::{EvalParams, Evaluator, NNOutput};
use crate::game::{center_loc, GameState, Loc, Move, Outcome, Player};
use crate::hash::Hash128;
use crate::node::SearchNode;
use crate::search::{NewChildContext, Search, SearchError};
use crate::worker::SearchThread;

impl<G: GameState, E: Evaluator<G>> Search<G, E> {
    /// One playout from the root. Returns whether the playout completed.
    pub(crate) fn run_single_playout(
        &self,
        thread: &mut SearchThread<G>,
        upper_bound_visits_left: f64,
    ) -> Result<bool, SearchError> {
        thread.upper_bound_visits_left = upper_bound_visits_left;
        let root = self.root_node.as_deref().expect("search must have a root node");
        let finished = self.playout_descend(thread, root, true)?;
        thread.reset_to_root(self.root_pla, &self.root_game, self.root_graph_hash);
        Ok(finished)
    }

    fn playout_descend(
        &self,
        thread: &mut SearchThread<G>,
        node: &SearchNode,
        is_root: bool,
    ) -> Result<bool, SearchError> {
        // Terminal positions back up their exact values. forceNonTerminal
        // marks nodes that must keep searching anyway: the root always, and a
        // root pass under conservative pass.
        if thread.game.is_finished() && !node.force_non_terminal {
            // Pace terminal backups like an evaluation, so one thread cannot
            // flood terminal visits while its peers wait on the evaluator.
            self.evaluator.wait_for_next_eval();
            let weight = if self.params.use_uncertainty
                && self.evaluator.supports_shortterm_error()
            {
                self.params.uncertainty_max_weight
            } else {
                1.0
            };
            match thread.game.outcome() {
                Outcome::NoResult => {
                    self.add_leaf_value(node, 0.0, 1.0, 0.0, 0.0, 0.0, weight, true, false);
                }
                Outcome::Scored { winner, white_minus_black } => {
                    let white_wins = match winner {
                        Some(Player::White) => 1.0,
                        Some(Player::Black) => 0.0,
                        None => self.params.draw_equivalent_wins_for_white,
                    };
                    let win_loss_value = 2.0 * white_wins - 1.0;
                    let score_mean = white_minus_black;
                    let score_mean_sq = score_mean * score_mean;
                    self.add_leaf_value(
                        node,
                        win_loss_value,
                        0.0,
                        score_mean,
                        score_mean_sq,
                        score_mean,
                        weight,
                        true,
                        false,
                    );
                }
            }
            return Ok(true);
        }

        let mut node_state = node.state.load(Ordering::Acquire);
        if node_state == SearchNode::STATE_UNEVALUATED {
            // Always attempt a fresh evaluation rather than waiting on
            // whichever thread got here first; a stalled evaluator backend
            // then cannot wedge every worker behind one node.
            if !self.init_node_nn_output(thread, node, is_root, false, false)? {
                return Ok(false);
            }
            // Only the thread that actually installed the output advances the
            // state, so stats are initialized before the node expands.
            if node
                .state
                .compare_exchange(
                    node_state,
                    SearchNode::STATE_EVALUATING,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                return Ok(false);
            }
            node.initialize_children();
            node.state.store(SearchNode::STATE_EXPANDED0, Ordering::SeqCst);
            return Ok(true);
        } else if node_state == SearchNode::STATE_EVALUATING {
            // Another thread is mid-expansion; retry from the top.
            return Ok(false);
        }

        debug_assert!(node_state >= SearchNode::STATE_EXPANDED0);
        self.maybe_recompute_existing_nn_output(thread, node, is_root)?;

        let child: &SearchNode;
        let best_child_idx: usize;
        loop {
            let mut sel = self.select_best_child_to_descend(thread, node, node_state, is_root);

            // The absurdly rare case that the chosen move is not legal: a
            // hash collision, or a cycle/superko interaction under graph
            // search transposing positions that do not really transpose.
            // Re-evaluate with the cache bypassed and retry once.
            if sel.best_child_idx.is_some()
                && !thread.game.is_legal(sel.best_child_move_loc, thread.pla)
            {
                self.init_node_nn_output(thread, node, is_root, true, true)?;
                if let Some(out) = node.nn_output() {
                    if thread.illegal_move_hashes.insert(out.nn_hash) {
                        warn!(
                            thread_idx = thread.thread_idx,
                            nn_hash = %out.nn_hash,
                            "chosen move not legal, regenerated evaluator output"
                        );
                    }
                }

                node_state = node.state.load(Ordering::Acquire);
                sel = self.select_best_child_to_descend(thread, node, node_state, is_root);

                if let Some(idx) = sel.best_child_idx {
                    if idx >= sel.num_children_found {
                        // Could still be illegal if we raced a re-noising
                        // based on an older cached output; give up on the
                        // playout in that case.
                        if !thread.game.is_legal(sel.best_child_move_loc, thread.pla) {
                            return Ok(false);
                        }
                    } else {
                        // An illegal move only reaches the tree via cycle or
                        // bad transposition. Count an edge visit so the rest
                        // of the search keeps making progress.
                        let children = node.children_for_state(node_state);
                        children[idx].add_edge_visits(1);
                        return Ok(true);
                    }
                }
            }

            let Some(idx) = sel.best_child_idx else {
                // Every move is forbidden; the node just accumulates visits
                // of its own evaluation.
                self.add_current_nn_output_as_leaf_value(node, false);
                return Ok(true);
            };
            let best_move_loc = sel.best_child_move_loc;

            if idx >= sel.num_children_found {
                // Expanding a new child.
                debug_assert_eq!(idx, sel.num_children_found);
                if !node.maybe_expand_children_capacity_for_new_child(&mut node_state, idx + 1) {
                    // Someone else is growing the array; let them finish.
                    std::thread::yield_now();
                    node_state = node.state.load(Ordering::Acquire);
                    continue;
                }
                let children = node.children_for_state(node_state);
                debug_assert!(idx < children.len());

                // Capture table keys before the board changes under the move.
                let ctx = NewChildContext {
                    move_pla: thread.pla,
                    move_loc: best_move_loc,
                    prev_move_loc: thread
                        .prev_move(&self.root_moves)
                        .map(|m| m.loc)
                        .unwrap_or(Loc::NULL),
                    board_hash_before: thread.game.recent_board_hash(),
                    pattern_hash: if self.pattern_bonus_table.is_some() {
                        thread.game.local_pattern_hash(thread.pla, best_move_loc)
                    } else {
                        Hash128::ZERO
                    },
                };

                let move_pla = thread.pla;
                thread.game.play_assume_legal(best_move_loc, move_pla);
                thread.moves_since_root.push(Move::new(move_pla, best_move_loc));
                thread.pla = move_pla.opp();
                thread.graph_hash = if self.params.use_graph_search {
                    thread.game.graph_hash(thread.pla, self.params.graph_search_rep_bound)
                } else {
                    Hash128::ZERO
                };

                // A pass from the root never ends the game under conservative
                // pass; the node for it must never flip to terminal.
                let force_non_terminal =
                    self.params.conservative_pass && is_root && best_move_loc == Loc::PASS;
                let child_pla = thread.pla;
                let child_ptr =
                    self.allocate_or_find_node(thread, child_pla, force_non_terminal, ctx);
                let new_child = unsafe { &*child_ptr };
                new_child.virtual_losses.fetch_add(1, Ordering::Release);

                {
                    // The slot install is the one place two writers could
                    // collide on the same index; serialize through the node's
                    // pooled mutex. Move loc is set before the pointer so the
                    // pointer's release publishes it.
                    let _guard = self.mutex_pool.lock(node.mutex_idx);
                    let slot = &children[idx];
                    if slot.get_if_allocated().is_none() {
                        slot.set_move_loc_relaxed(best_move_loc);
                        slot.store(child_ptr);
                    } else {
                        // Lost the race after already making the move; the
                        // playout cannot back out, so fail it. A freshly
                        // allocated node stays in the table for the next
                        // mark-and-sweep.
                        new_child.virtual_losses.fetch_add(-1, Ordering::Release);
                        return Ok(false);
                    }
                }

                if self.maybe_catch_up_edge_visits(thread, node, new_child, node_state, idx) {
                    self.update_stats_after_playout(node, thread, is_root);
                    new_child.virtual_losses.fetch_add(-1, Ordering::Release);
                    return Ok(true);
                }
                child = new_child;
                best_child_idx = idx;
            } else {
                // Descending an existing child.
                let children = node.children_for_state(node_state);
                let existing = children[idx].get_if_allocated().expect("selected child exists");
                existing.virtual_losses.fetch_add(1, Ordering::Release);

                if self.maybe_catch_up_edge_visits(thread, node, existing, node_state, idx) {
                    self.update_stats_after_playout(node, thread, is_root);
                    existing.virtual_losses.fetch_add(-1, Ordering::Release);
                    return Ok(true);
                }

                let move_pla = thread.pla;
                thread.game.play_assume_legal(best_move_loc, move_pla);
                thread.moves_since_root.push(Move::new(move_pla, best_move_loc));
                thread.pla = move_pla.opp();
                thread.graph_hash = if self.params.use_graph_search {
                    thread.game.graph_hash(thread.pla, self.params.graph_search_rep_bound)
                } else {
                    Hash128::ZERO
                };

                child = existing;
                best_child_idx = idx;
            }
            break;
        }

        let finished = match self.playout_descend(thread, child, false) {
            Ok(finished) => finished,
            Err(e) => {
                child.virtual_losses.fetch_add(-1, Ordering::Release);
                return Err(e);
            }
        };
        if finished {
            let node_state = node.state.load(Ordering::Acquire);
            let children = node.children_for_state(node_state);
            children[best_child_idx].add_edge_visits(1);
            self.update_stats_after_playout(node, thread, is_root);
        }
        child.virtual_losses.fetch_add(-1, Ordering::Release);
        Ok(finished)
    }

    /// When an edge lags far behind a transposed child's total visits, credit
    /// the edge instead of descending: the child's statistics already carry
    /// the information a descent would gather.
    fn maybe_catch_up_edge_visits(
        &self,
        thread: &mut SearchThread<G>,
        node: &SearchNode,
        child: &SearchNode,
        node_state: u32,
        best_child_idx: usize,
    ) -> bool {
        let children = node.children_for_state(node_state);
        let child_visits = child.stats.visits.load(Ordering::Acquire);
        let mut edge_visits = children[best_child_idx].edge_visits();

        // Sometimes keep searching the transposition anyway, so its subtree
        // continues to deepen from this parent's perspective.
        if self.params.graph_search_catch_up_leak_prob > 0.0
            && edge_visits < child_visits
            && rand::Rng::gen_bool(&mut thread.rng, self.params.graph_search_catch_up_leak_prob)
        {
            return false;
        }

        // Step size is fixed at one; `graph_search_catch_up_prop` stays a
        // reserved knob until a larger step is empirically justified.
        let num_to_add = 1i64;
        loop {
            if edge_visits >= child_visits {
                return false;
            }
            let new_edge_visits = edge_visits + num_to_add;
            if children[best_child_idx]
                .compare_exchange_weak_edge_visits(&mut edge_visits, new_edge_visits)
            {
                return true;
            }
        }
    }

    /// Install a fresh evaluator output on a node.
    ///
    /// With `is_re_init` false, the first thread to install wins and the
    /// node's first-visit statistics are written; with `is_re_init` true the
    /// output is unconditionally replaced (used for cache-bypass regeneration
    /// and root refresh) and statistics are left for the next backup to fix.
    ///
    /// Returns whether this call installed an output where none was before.
    pub(crate) fn init_node_nn_output(
        &self,
        thread: &mut SearchThread<G>,
        node: &SearchNode,
        is_root: bool,
        skip_cache: bool,
        is_re_init: bool,
    ) -> Result<bool, SearchError> {
        let mut include_owner_map = is_root || self.always_include_owner_map;

        // In the difficult mirror position, fold center ownership into the
        // win/loss estimate so the search feels the center's weight.
        let mut anti_mirror_difficult = false;
        let cloc = center_loc(self.root_game.x_size(), self.root_game.y_size());
        if self.params.anti_mirror
            && self.mirroring_pla.is_some()
            && self.mirror_advantage >= -0.5
            && cloc != Loc::NULL
            && thread.game.stone_at(cloc) == Some(self.root_pla.opp())
            && self.is_mirroring_since_search_start(thread, 4)
        {
            include_owner_map = true;
            anti_mirror_difficult = true;
        }

        let eval_params = EvalParams {
            symmetry: None,
            skip_cache,
            include_owner_map,
            conservative_pass: self.params.conservative_pass,
            draw_equivalent_wins_for_white: self.params.draw_equivalent_wins_for_white,
            policy_temperature: self.params.nn_policy_temperature,
        };

        let mut out: Box<NNOutput> = if is_root && self.params.root_num_symmetries_to_sample > 1 {
            let num_symmetries = self.evaluator.num_symmetries();
            let sample = self.params.root_num_symmetries_to_sample.min(num_symmetries);
            let mut symmetry_indexes: Vec<usize> = (0..num_symmetries).collect();
            let mut outputs = Vec::with_capacity(sample);
            for i in 0..sample {
                let j = rand::Rng::gen_range(&mut thread.rng, i..num_symmetries);
                symmetry_indexes.swap(i, j);
                let params = EvalParams {
                    symmetry: Some(symmetry_indexes[i]),
                    // No guarantee which symmetry a cache would hold.
                    skip_cache: true,
                    ..eval_params.clone()
                };
                outputs.push(self.evaluator.evaluate(&thread.game, thread.pla, &params)?);
            }
            Box::new(NNOutput::average(&outputs))
        } else {
            Box::new(self.evaluator.evaluate(&thread.game, thread.pla, &eval_params)?)
        };

        if anti_mirror_difficult {
            if let Some(owner_map) = &out.white_owner_map {
                let center_pos = crate::eval::loc_to_pos(
                    cloc,
                    self.root_game.x_size(),
                    self.nn_x_len,
                    self.nn_y_len,
                );
                let total_wl = (out.white_win_prob + out.white_loss_prob) as f64;
                let own_scale =
                    if self.mirror_center_symmetry_error <= 0.0 { 0.7 } else { 0.3 };
                let wl = ((out.white_win_prob - out.white_loss_prob) as f64 / (total_wl + 1e-10))
                    .clamp(-1.0 + 1e-15, 1.0 - 1e-15);
                let wl = (wl.atanh() + own_scale * owner_map[center_pos] as f64).tanh();
                let new_win = total_wl * (0.5 + 0.5 * wl);
                out.white_win_prob = new_win as f32;
                out.white_loss_prob = (total_wl - new_win) as f32;
            }
        }

        debug_assert!(out.noised_policy.is_none());
        if let Some(noised) = self.maybe_add_policy_noise_and_temp(thread, is_root, Some(&out)) {
            out = noised;
        }

        node.node_age.store(self.search_node_age, Ordering::Release);
        if is_re_init {
            // Statistics are knowingly left stale; the next backup through
            // this node recomputes them from the new output.
            match node.store_nn_output(out) {
                Ok(()) => Ok(true),
                Err(retired) => {
                    thread.retired_nn_outputs.push(retired);
                    Ok(false)
                }
            }
        } else {
            match node.store_nn_output_if_null(out) {
                Ok(()) => {
                    self.add_current_nn_output_as_leaf_value(node, true);
                    Ok(true)
                }
                // Lost the install race; the payload was never published.
                Err(lost) => {
                    drop(lost);
                    Ok(false)
                }
            }
        }
    }

    /// Refresh a stale root output at the start of a search. The first thread
    /// to bump the age does the work; later threads proceed with whatever is
    /// installed, tolerating a few playouts under the old policy.
    fn maybe_recompute_existing_nn_output(
        &self,
        thread: &mut SearchThread<G>,
        node: &SearchNode,
        is_root: bool,
    ) -> Result<(), SearchError> {
        if !is_root || node.node_age.load(Ordering::Acquire) == self.search_node_age {
            return Ok(());
        }
        let old_age = node.node_age.swap(self.search_node_age, Ordering::AcqRel);
        if old_age >= self.search_node_age {
            return Ok(());
        }

        let needs_full_reeval = match node.nn_output() {
            None => true,
            Some(out) => {
                // Ownership is needed for ending bonuses; conservative pass
                // needs the policy recomputed as if a pass does not end the
                // game; symmetry averaging cannot reuse a single cached eval.
                out.white_owner_map.is_none()
                    || (self.params.conservative_pass
                        && thread.game.pass_would_end_game(thread.pla))
                    || self.params.root_num_symmetries_to_sample > 1
            }
        };
        if needs_full_reeval {
            self.init_node_nn_output(thread, node, is_root, false, true)?;
        } else if let Some(noised) =
            self.maybe_add_policy_noise_and_temp(thread, is_root, node.nn_output())
        {
            match node.store_nn_output(noised) {
                Ok(()) => {}
                Err(retired) => thread.retired_nn_outputs.push(retired),
            }
        }
        Ok(())
    }

    /// Fold one leaf observation into a node's statistics.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_leaf_value(
        &self,
        node: &SearchNode,
        win_loss_value: f64,
        no_result_value: f64,
        score_mean: f64,
        score_mean_sq: f64,
        lead: f64,
        weight: f64,
        is_terminal: bool,
        assume_no_existing_weight: bool,
    ) {
        let mut utility = self.get_result_utility(win_loss_value, no_result_value)
            + self.get_score_utility(score_mean, score_mean_sq);

        if self.params.subtree_value_bias_factor != 0.0 && !is_terminal {
            if let Some(entry) = &node.bias_handle {
                let (delta_sum, weight_sum) = entry.totals();
                if weight_sum > 0.001 {
                    utility += self.params.subtree_value_bias_factor * delta_sum / weight_sum;
                }
            }
        }

        utility += self.get_pattern_bonus(node.pattern_bonus_hash, node.next_pla.opp());

        let utility_sq = utility * utility;
        let weight_sq = weight * weight;

        if assume_no_existing_weight {
            node.stats_lock.with(|| {
                node.stats.win_loss_value_avg.store(win_loss_value, Ordering::Release);
                node.stats.no_result_value_avg.store(no_result_value, Ordering::Release);
                node.stats.score_mean_avg.store(score_mean, Ordering::Release);
                node.stats.score_mean_sq_avg.store(score_mean_sq, Ordering::Release);
                node.stats.lead_avg.store(lead, Ordering::Release);
                node.stats.utility_avg.store(utility, Ordering::Release);
                node.stats.utility_sq_avg.store(utility_sq, Ordering::Release);
                node.stats.weight_sq_sum.store(weight_sq, Ordering::Release);
                node.stats.weight_sum.store(weight, Ordering::Release);
                let old_visits = node.stats.visits.fetch_add(1, Ordering::Release);
                debug_assert_eq!(old_visits, 0, "first-visit write must see zero visits");
            });
        } else {
            node.stats_lock.with(|| {
                let old_weight_sum = node.stats.weight_sum.load(Ordering::Relaxed);
                let new_weight_sum = old_weight_sum + weight;
                let blend = |avg: &crate::stats::AtomicF64, value: f64| {
                    let old = avg.load(Ordering::Relaxed);
                    avg.store(
                        (old * old_weight_sum + value * weight) / new_weight_sum,
                        Ordering::Release,
                    );
                };
                blend(&node.stats.win_loss_value_avg, win_loss_value);
                blend(&node.stats.no_result_value_avg, no_result_value);
                blend(&node.stats.score_mean_avg, score_mean);
                blend(&node.stats.score_mean_sq_avg, score_mean_sq);
                blend(&node.stats.lead_avg, lead);
                blend(&node.stats.utility_avg, utility);
                blend(&node.stats.utility_sq_avg, utility_sq);
                node.stats.weight_sq_sum.store(
                    node.stats.weight_sq_sum.load(Ordering::Relaxed) + weight_sq,
                    Ordering::Release,
                );
                node.stats.weight_sum.store(new_weight_sum, Ordering::Release);
                node.stats.visits.fetch_add(1, Ordering::Release);
            });
        }
    }

    /// Back up the node's own evaluator output as a leaf observation.
    pub(crate) fn add_current_nn_output_as_leaf_value(
        &self,
        node: &SearchNode,
        assume_no_existing_weight: bool,
    ) {
        let out = node.nn_output().expect("node must have an evaluator output");
        let weight = self.compute_weight_from_nn_output(out);
        self.add_leaf_value(
            node,
            (out.white_win_prob - out.white_loss_prob) as f64,
            out.white_no_result_prob as f64,
            out.white_score_mean as f64,
            out.white_score_mean_sq as f64,
            out.white_lead as f64,
            weight,
            false,
            assume_no_existing_weight,
        );
    }

    /// Weight of one evaluation: confident evaluations count for more when
    /// uncertainty weighting is enabled.
    pub(crate) fn compute_weight_from_nn_output(&self, out: &NNOutput) -> f64 {
        if !self.params.use_uncertainty || !self.evaluator.supports_shortterm_error() {
            return 1.0;
        }
        let utility_uncertainty_wl =
            self.params.win_loss_utility_factor * out.shortterm_winloss_error as f64;
        let utility_uncertainty_score =
            self.get_approx_score_utility_derivative(out.white_score_mean as f64)
                * out.shortterm_score_error as f64;
        let utility_uncertainty = utility_uncertainty_wl + utility_uncertainty_score;

        let powered_uncertainty = if self.params.uncertainty_exponent == 1.0 {
            utility_uncertainty
        } else if self.params.uncertainty_exponent == 0.5 {
            utility_uncertainty.sqrt()
        } else {
            utility_uncertainty.powf(self.params.uncertainty_exponent)
        };

        let baseline_uncertainty =
            self.params.uncertainty_coeff / self.params.uncertainty_max_weight;
        self.params.uncertainty_coeff / (powered_uncertainty + baseline_uncertainty)
    }
}
