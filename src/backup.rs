//! Backup: recomputing a parent's statistics from its children.
//!
//! Rather than incrementally adding one leaf value at every ancestor, each
//! playout re-derives the ancestor's statistics from its children's current
//! averages. Concurrent playouts through the same node coalesce: the thread
//! that raises the dirty counter from zero recomputes on behalf of everyone
//! who bumped it meanwhile, looping until the counter drains.

use std::sync::atomic::Ordering;

use crate::eval::{loc_to_pos, Evaluator};
use crate::game::{GameState, Player};
use crate::node::SearchNode;
use crate::search::Search;
use crate::stats::MoreChildStats;
use crate::worker::SearchThread;

impl<G: GameState, E: Evaluator<G>> Search<G, E> {
    /// Credit one finished playout to this node, recomputing its statistics
    /// from its children. Threads that find a recomputation already running
    /// leave their visit behind for the running thread to fold in.
    pub(crate) fn update_stats_after_playout(
        &self,
        node: &SearchNode,
        thread: &mut SearchThread<G>,
        is_root: bool,
    ) {
        let old_dirty_counter = node.dirty_counter.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old_dirty_counter >= 0);
        if old_dirty_counter > 0 {
            return;
        }
        let mut num_visits_completed: i32 = 1;
        loop {
            self.recompute_node_stats(node, thread, num_visits_completed as i64, is_root);
            let old = node.dirty_counter.fetch_add(-num_visits_completed, Ordering::AcqRel);
            let new_dirty_counter = old - num_visits_completed;
            if new_dirty_counter <= 0 {
                debug_assert_eq!(new_dirty_counter, 0);
                break;
            }
            // More playouts landed while we recomputed; fold theirs in too.
            num_visits_completed = new_dirty_counter;
        }
    }

    /// Recompute every child-derived statistic of `node`, and add
    /// `num_visits_to_add` visits. Assumes the node has an evaluator output.
    pub(crate) fn recompute_node_stats(
        &self,
        node: &SearchNode,
        thread: &mut SearchThread<G>,
        num_visits_to_add: i64,
        is_root: bool,
    ) {
        let stats_buf = &mut thread.stats_buf;
        let mut num_good_children = 0usize;

        let children = node.children();
        let mut orig_total_child_weight = 0.0f64;
        for c in children {
            let Some(child) = c.get_if_allocated() else { break };
            let move_loc = c.move_loc_relaxed();
            let edge_visits = c.edge_visits();
            let stats = child.stats.snapshot();

            if stats.visits <= 0 || stats.weight_sum <= 0.0 || edge_visits <= 0 {
                continue;
            }

            let child_weight = stats.weight_sum * (edge_visits as f64 / stats.visits as f64);
            let child_utility = stats.utility_avg;
            let entry = &mut stats_buf[num_good_children];
            entry.stats = stats;
            entry.self_utility = match node.next_pla {
                Player::White => child_utility,
                Player::Black => -child_utility,
            };
            entry.weight_adjusted = child_weight;
            entry.prev_move_loc = move_loc;

            orig_total_child_weight += child_weight;
            num_good_children += 1;
        }

        let mut current_total_child_weight = orig_total_child_weight;

        if self.params.use_noise_pruning
            && num_good_children > 0
            && !(self.params.anti_mirror && self.mirroring_pla.is_some())
        {
            let mut policy_probs_buf = [0.0f64; crate::game::MAX_POLICY_SIZE];
            {
                let nn_output = node.nn_output().expect("node being recomputed has an output");
                let policy_probs = nn_output.policy_probs_maybe_noised();
                let board_x = self.root_game.x_size();
                for i in 0..num_good_children {
                    let pos = loc_to_pos(
                        stats_buf[i].prev_move_loc,
                        board_x,
                        self.nn_x_len,
                        self.nn_y_len,
                    );
                    policy_probs_buf[i] = (policy_probs[pos] as f64).max(1.0e-30);
                }
            }
            current_total_child_weight = self.prune_noise_weight(
                stats_buf,
                num_good_children,
                current_total_child_weight,
                &policy_probs_buf,
            );
        }

        {
            let mut amount_to_subtract = 0.0;
            let mut amount_to_prune = 0.0;
            if is_root && self.params.root_noise_enabled && !self.params.use_noise_pruning {
                let max_child_weight = stats_buf[..num_good_children]
                    .iter()
                    .map(|s| s.weight_adjusted)
                    .fold(0.0f64, f64::max);
                amount_to_subtract =
                    self.params.chosen_move_subtract.min(max_child_weight / 64.0);
                amount_to_prune = self.params.chosen_move_prune.min(max_child_weight / 64.0);
            }
            current_total_child_weight = self.downweight_bad_children_and_normalize_weight(
                stats_buf,
                num_good_children,
                current_total_child_weight,
                current_total_child_weight,
                amount_to_subtract,
                amount_to_prune,
            );
        }

        let mut win_loss_value_sum = 0.0f64;
        let mut no_result_value_sum = 0.0f64;
        let mut score_mean_sum = 0.0f64;
        let mut score_mean_sq_sum = 0.0f64;
        let mut lead_sum = 0.0f64;
        let mut utility_sum = 0.0f64;
        let mut utility_sq_sum = 0.0f64;
        let mut weight_sq_sum = 0.0f64;
        let mut weight_sum = current_total_child_weight;
        for entry in stats_buf[..num_good_children].iter() {
            let stats = &entry.stats;
            let desired_weight = entry.weight_adjusted;
            let weight_scaling = desired_weight / stats.weight_sum;

            win_loss_value_sum += desired_weight * stats.win_loss_value_avg;
            no_result_value_sum += desired_weight * stats.no_result_value_avg;
            score_mean_sum += desired_weight * stats.score_mean_avg;
            score_mean_sq_sum += desired_weight * stats.score_mean_sq_avg;
            lead_sum += desired_weight * stats.lead_avg;
            utility_sum += desired_weight * stats.utility_avg;
            utility_sq_sum += desired_weight * stats.utility_sq_avg;
            weight_sq_sum += weight_scaling * weight_scaling * stats.weight_sq_sum;
        }

        // The node's own evaluation joins as a pseudo-child.
        {
            let nn_output = node.nn_output().expect("node being recomputed has an output");
            let win_prob = nn_output.white_win_prob as f64;
            let loss_prob = nn_output.white_loss_prob as f64;
            let no_result_prob = nn_output.white_no_result_prob as f64;
            let score_mean = nn_output.white_score_mean as f64;
            let score_mean_sq = nn_output.white_score_mean_sq as f64;
            let lead = nn_output.white_lead as f64;
            let mut utility = self.get_result_utility(win_prob - loss_prob, no_result_prob)
                + self.get_score_utility(score_mean, score_mean_sq);

            if self.params.subtree_value_bias_factor != 0.0 {
                if let Some(entry) = &node.bias_handle {
                    let (new_delta_sum, new_weight_sum);
                    if current_total_child_weight > 1.0e-10 {
                        let utility_children = utility_sum / current_total_child_weight;
                        let bias_weight = orig_total_child_weight
                            .powf(self.params.subtree_value_bias_weight_exponent);
                        let bias_delta_sum = (utility_children - utility) * bias_weight;

                        // Swap this node's previous contribution for the new
                        // one; the dirty counter guarantees a single writer
                        // per node.
                        let old_delta =
                            node.last_subtree_value_bias_delta_sum.load(Ordering::Relaxed);
                        let old_weight =
                            node.last_subtree_value_bias_weight.load(Ordering::Relaxed);
                        (new_delta_sum, new_weight_sum) = entry.swap_contribution(
                            old_delta,
                            old_weight,
                            bias_delta_sum,
                            bias_weight,
                        );
                        node.last_subtree_value_bias_delta_sum
                            .store(bias_delta_sum, Ordering::Relaxed);
                        node.last_subtree_value_bias_weight.store(bias_weight, Ordering::Relaxed);
                    } else {
                        (new_delta_sum, new_weight_sum) = entry.totals();
                    }
                    if new_weight_sum > 0.001 {
                        utility += self.params.subtree_value_bias_factor * new_delta_sum
                            / new_weight_sum;
                    }
                }
            }

            let weight = self.compute_weight_from_nn_output(nn_output);
            win_loss_value_sum += (win_prob - loss_prob) * weight;
            no_result_value_sum += no_result_prob * weight;
            score_mean_sum += score_mean * weight;
            score_mean_sq_sum += score_mean_sq * weight;
            lead_sum += lead * weight;
            utility_sum += utility * weight;
            utility_sq_sum += utility * utility * weight;
            weight_sq_sum += weight * weight;
            weight_sum += weight;
        }

        let win_loss_value_avg = win_loss_value_sum / weight_sum;
        let no_result_value_avg = no_result_value_sum / weight_sum;
        let score_mean_avg = score_mean_sum / weight_sum;
        let score_mean_sq_avg = score_mean_sq_sum / weight_sum;
        let lead_avg = lead_sum / weight_sum;
        let mut utility_avg = utility_sum / weight_sum;
        let mut utility_sq_avg = utility_sq_sum / weight_sum;

        let old_utility_avg = utility_avg;
        utility_avg += self.get_pattern_bonus(node.pattern_bonus_hash, node.next_pla.opp());
        utility_sq_avg += utility_avg * utility_avg - old_utility_avg * old_utility_avg;

        node.stats_lock.with(|| {
            node.stats.win_loss_value_avg.store(win_loss_value_avg, Ordering::Release);
            node.stats.no_result_value_avg.store(no_result_value_avg, Ordering::Release);
            node.stats.score_mean_avg.store(score_mean_avg, Ordering::Release);
            node.stats.score_mean_sq_avg.store(score_mean_sq_avg, Ordering::Release);
            node.stats.lead_avg.store(lead_avg, Ordering::Release);
            node.stats.utility_avg.store(utility_avg, Ordering::Release);
            node.stats.utility_sq_avg.store(utility_sq_avg, Ordering::Release);
            node.stats.weight_sq_sum.store(weight_sq_sum, Ordering::Release);
            node.stats.weight_sum.store(weight_sum, Ordering::Release);
            node.stats.visits.fetch_add(num_visits_to_add, Ordering::Release);
        });
    }

    /// Downweight children that soaked up far more weight than their policy
    /// share while underperforming the running average. Counters root noise
    /// and transient value spikes. Returns the new total weight.
    pub(crate) fn prune_noise_weight(
        &self,
        stats_buf: &mut [MoreChildStats],
        num_children: usize,
        total_child_weight: f64,
        policy_probs_buf: &[f64],
    ) -> f64 {
        if num_children <= 1 || total_child_weight <= 0.00001 {
            return total_child_weight;
        }

        // Children are visited in array order, which tracks policy order
        // closely enough for a single greedy pass.
        let mut utility_sum_so_far = 0.0f64;
        let mut weight_sum_so_far = 0.0f64;
        let mut raw_policy_sum_so_far = 0.0f64;
        for i in 0..num_children {
            let utility = stats_buf[i].self_utility;
            let old_weight = stats_buf[i].weight_adjusted;
            let raw_policy = policy_probs_buf[i];

            let mut new_weight = old_weight;
            if weight_sum_so_far > 0.0 && raw_policy_sum_so_far > 0.0 {
                let avg_utility_so_far = utility_sum_so_far / weight_sum_so_far;
                let utility_gap = avg_utility_so_far - utility;
                if utility_gap > 0.0 {
                    let weight_share_from_raw_policy =
                        weight_sum_so_far * raw_policy / raw_policy_sum_so_far;
                    // Over double its proper share: start pruning the excess.
                    let lenient_share = 2.0 * weight_share_from_raw_policy;
                    if old_weight > lenient_share {
                        let excess_weight = old_weight - lenient_share;
                        let mut weight_to_subtract = excess_weight
                            * (1.0 - (-utility_gap / self.params.noise_prune_utility_scale).exp());
                        if weight_to_subtract > self.params.noise_pruning_cap {
                            weight_to_subtract = self.params.noise_pruning_cap;
                        }
                        new_weight = old_weight - weight_to_subtract;
                        stats_buf[i].weight_adjusted = new_weight;
                    }
                }
            }
            utility_sum_so_far += utility * new_weight;
            weight_sum_so_far += new_weight;
            raw_policy_sum_so_far += raw_policy;
        }
        weight_sum_so_far
    }

    /// Reweight children by how plausible their utility is relative to the
    /// weighted sibling mean, under a heavy-tailed distribution; optionally
    /// subtract/prune a flat amount first. Normalizes the result back to
    /// `desired_total_weight`. Returns the new total.
    pub(crate) fn downweight_bad_children_and_normalize_weight(
        &self,
        stats_buf: &mut [MoreChildStats],
        num_children: usize,
        mut current_total_weight: f64,
        desired_total_weight: f64,
        amount_to_subtract: f64,
        amount_to_prune: f64,
    ) -> f64 {
        if num_children == 0 || current_total_weight <= 0.0 {
            return current_total_weight;
        }

        if self.params.value_weight_exponent == 0.0 || self.mirroring_pla.is_some() {
            for entry in stats_buf[..num_children].iter_mut() {
                if entry.weight_adjusted < amount_to_prune {
                    current_total_weight -= entry.weight_adjusted;
                    entry.weight_adjusted = 0.0;
                    continue;
                }
                let new_weight = entry.weight_adjusted - amount_to_subtract;
                if new_weight <= 0.0 {
                    current_total_weight -= entry.weight_adjusted;
                    entry.weight_adjusted = 0.0;
                } else {
                    current_total_weight -= amount_to_subtract;
                    entry.weight_adjusted = new_weight;
                }
            }
            if current_total_weight != desired_total_weight && current_total_weight > 0.0 {
                let factor = desired_total_weight / current_total_weight;
                for entry in stats_buf[..num_children].iter_mut() {
                    entry.weight_adjusted *= factor;
                }
                current_total_weight = desired_total_weight;
            }
            return current_total_weight;
        }

        let mut stdevs = [0.0f64; crate::game::MAX_POLICY_SIZE];
        let mut simple_value_sum = 0.0f64;
        for i in 0..num_children {
            if stats_buf[i].stats.visits == 0 {
                continue;
            }
            let weight = stats_buf[i].weight_adjusted;
            let precision = 1.5 * weight.sqrt();
            // A floor keeps the z-scores sane however the precision formula
            // evolves.
            const MIN_VARIANCE: f64 = 0.00000001;
            stdevs[i] = (MIN_VARIANCE + 1.0 / precision).sqrt();
            simple_value_sum += stats_buf[i].self_utility * weight;
        }
        let simple_value = simple_value_sum / current_total_weight;

        let mut total_new_unnorm_weight = 0.0f64;
        for i in 0..num_children {
            if stats_buf[i].stats.visits == 0 {
                continue;
            }
            if stats_buf[i].weight_adjusted < amount_to_prune {
                current_total_weight -= stats_buf[i].weight_adjusted;
                stats_buf[i].weight_adjusted = 0.0;
                continue;
            }
            let new_weight = stats_buf[i].weight_adjusted - amount_to_subtract;
            if new_weight <= 0.0 {
                current_total_weight -= stats_buf[i].weight_adjusted;
                stats_buf[i].weight_adjusted = 0.0;
            } else {
                current_total_weight -= amount_to_subtract;
                stats_buf[i].weight_adjusted = new_weight;
            }

            let z = (stats_buf[i].self_utility - simple_value) / stdevs[i];
            // A tiny floor keeps even wild outliers from vanishing entirely.
            let p = self.value_weight_distribution.get_cdf(z) + 0.0001;
            stats_buf[i].weight_adjusted *= p.powf(self.params.value_weight_exponent);
            total_new_unnorm_weight += stats_buf[i].weight_adjusted;
        }

        debug_assert!(total_new_unnorm_weight > 0.0);
        if total_new_unnorm_weight > 0.0 {
            let factor = desired_total_weight / total_new_unnorm_weight;
            for entry in stats_buf[..num_children].iter_mut() {
                entry.weight_adjusted *= factor;
            }
        }
        desired_total_weight
    }
}
