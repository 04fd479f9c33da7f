//! Child selection: the PUCT rule and everything that perturbs it.
//!
//! Selection never takes a lock. It reads child statistics through acquire
//! loads, tolerates the brief inconsistencies multithreading can produce
//! (edge visits ahead of weights, weights ahead of visits), and repairs what
//! it can on the fly.

use std::sync::atomic::Ordering;

use rand::Rng;

use crate::eval::{loc_to_pos, pos_to_loc, Evaluator};
use crate::game::{
    center_loc, euclidean_distance_squared, is_central, is_near_central, mirror_loc, GameState,
    Loc, Player,
};
use crate::node::SearchNode;
use crate::search::Search;
use crate::worker::SearchThread;

/// Selection value of a move that may never be picked.
pub(crate) const POLICY_ILLEGAL_SELECTION_VALUE: f64 = -1.0e50;
/// Selection value of a move pruned as futile for this descent.
pub(crate) const FUTILE_VISITS_PRUNE_VALUE: f64 = -1.0e40;

/// Keeps the exploration numerator positive even at zero weight.
const TOTAL_CHILD_WEIGHT_PUCT_OFFSET: f64 = 0.01;

/// Result of picking a child to descend into.
pub(crate) struct BestChildResult {
    pub num_children_found: usize,
    /// Index into the children array; `num_children_found` means "expand a
    /// new child"; `None` means nothing is selectable.
    pub best_child_idx: Option<usize>,
    pub best_child_move_loc: Loc,
}

impl<G: GameState, E: Evaluator<G>> Search<G, E> {
    fn cpuct_exploration(&self, total_child_weight: f64) -> f64 {
        self.params.cpuct_exploration
            + self.params.cpuct_exploration_log
                * ((total_child_weight + self.params.cpuct_exploration_base)
                    / self.params.cpuct_exploration_base)
                    .ln()
    }

    /// The PUCT score: exploration term plus mover-perspective utility.
    pub(crate) fn explore_selection_value(
        &self,
        nn_policy_prob: f64,
        total_child_weight: f64,
        child_weight: f64,
        child_utility: f64,
        parent_utility_stdev_factor: f64,
        pla: Player,
    ) -> f64 {
        if nn_policy_prob < 0.0 {
            return POLICY_ILLEGAL_SELECTION_VALUE;
        }
        let explore_component = self.cpuct_exploration(total_child_weight)
            * parent_utility_stdev_factor
            * nn_policy_prob
            * (total_child_weight + TOTAL_CHILD_WEIGHT_PUCT_OFFSET).sqrt()
            / (1.0 + child_weight);
        let value_component = match pla {
            Player::White => child_utility,
            Player::Black => -child_utility,
        };
        explore_component + value_component
    }

    /// The child weight at which `explore_selection_value` would equal the
    /// given value, or 0 if none.
    pub(crate) fn explore_selection_value_inverse(
        &self,
        explore_selection_value: f64,
        nn_policy_prob: f64,
        total_child_weight: f64,
        child_utility: f64,
        parent_utility_stdev_factor: f64,
        pla: Player,
    ) -> f64 {
        if nn_policy_prob < 0.0 {
            return 0.0;
        }
        let value_component = match pla {
            Player::White => child_utility,
            Player::Black => -child_utility,
        };
        let explore_component = explore_selection_value - value_component;
        let explore_component_scaling = self.cpuct_exploration(total_child_weight)
            * parent_utility_stdev_factor
            * nn_policy_prob
            * (total_child_weight + TOTAL_CHILD_WEIGHT_PUCT_OFFSET).sqrt();
        if explore_component <= 0.0 {
            return 1.0e100;
        }
        (explore_component_scaling / explore_component - 1.0).max(0.0)
    }

    /// First-play urgency for this node's unvisited children, along with the
    /// parent quantities selection reuses for every child.
    ///
    /// Returns (fpu_value, parent_utility, parent_weight_per_visit,
    /// parent_utility_stdev_factor).
    pub(crate) fn fpu_value_for_children_assume_visited(
        &self,
        node: &SearchNode,
        pla: Player,
        is_root: bool,
        policy_prob_mass_visited: f64,
    ) -> (f64, f64, f64, f64) {
        let visits = node.stats.visits.load(Ordering::Acquire);
        let weight_sum = node.stats.weight_sum.load(Ordering::Acquire);
        let utility_avg = node.stats.utility_avg.load(Ordering::Acquire);
        let mut utility_sq_avg = node.stats.utility_sq_avg.load(Ordering::Acquire);

        debug_assert!(visits > 0);
        debug_assert!(weight_sum > 0.0);
        let parent_weight_per_visit = weight_sum / visits.max(1) as f64;
        let mut parent_utility = utility_avg;

        let variance_prior =
            self.params.cpuct_utility_stdev_prior * self.params.cpuct_utility_stdev_prior;
        let variance_prior_weight = self.params.cpuct_utility_stdev_prior_weight;
        let parent_utility_stdev = if visits <= 0 || weight_sum <= 1.0 {
            self.params.cpuct_utility_stdev_prior
        } else {
            let utility_sq = parent_utility * parent_utility;
            // Guard against relaxed-read desync producing negative variance.
            if utility_sq_avg < utility_sq {
                utility_sq_avg = utility_sq;
            }
            (((utility_sq + variance_prior) * variance_prior_weight
                + utility_sq_avg * weight_sum)
                / (variance_prior_weight + weight_sum - 1.0)
                - utility_sq)
                .max(0.0)
                .sqrt()
        };
        let parent_utility_stdev_factor = 1.0
            + self.params.cpuct_utility_stdev_scale
                * (parent_utility_stdev / self.params.cpuct_utility_stdev_prior - 1.0);

        if self.params.fpu_parent_weight > 0.0 {
            if let Some(out) = node.nn_output() {
                parent_utility = self.params.fpu_parent_weight * self.get_utility_from_nn(out)
                    + (1.0 - self.params.fpu_parent_weight) * parent_utility;
            }
        }

        let fpu_reduction_max =
            if is_root { self.params.root_fpu_reduction_max } else { self.params.fpu_reduction_max };
        let fpu_loss_prop =
            if is_root { self.params.root_fpu_loss_prop } else { self.params.fpu_loss_prop };
        let utility_radius = self.params.utility_radius();

        let reduction = fpu_reduction_max * policy_prob_mass_visited.sqrt();
        let mut fpu_value = match pla {
            Player::White => parent_utility - reduction,
            Player::Black => parent_utility + reduction,
        };
        let loss_value = match pla {
            Player::White => -utility_radius,
            Player::Black => utility_radius,
        };
        fpu_value += (loss_value - fpu_value) * fpu_loss_prop;

        (fpu_value, parent_utility, parent_weight_per_visit, parent_utility_stdev_factor)
    }

    /// Selection value for an existing child.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn explore_selection_value_of_child(
        &self,
        node: &SearchNode,
        parent_policy_probs: &[f32],
        child: &SearchNode,
        move_loc: Loc,
        total_child_weight: f64,
        child_edge_visits: i64,
        fpu_value: f64,
        parent_utility: f64,
        parent_weight_per_visit: f64,
        parent_utility_stdev_factor: f64,
        is_during_search: bool,
        is_root: bool,
        anti_mirror: bool,
        max_child_weight: f64,
        thread: &mut SearchThread<G>,
    ) -> f64 {
        let move_pos = loc_to_pos(move_loc, self.root_game.x_size(), self.nn_x_len, self.nn_y_len);
        let mut nn_policy_prob = parent_policy_probs[move_pos];

        let child_visits = child.stats.visits.load(Ordering::Acquire);
        let raw_child_weight = child.stats.weight_sum.load(Ordering::Acquire);
        let utility_avg = child.stats.utility_avg.load(Ordering::Acquire);
        let score_mean_avg = child.stats.score_mean_avg.load(Ordering::Acquire);
        let score_mean_sq_avg = child.stats.score_mean_sq_avg.load(Ordering::Acquire);
        let child_virtual_losses = child.virtual_losses.load(Ordering::Acquire);

        let mut child_weight =
            raw_child_weight * (child_edge_visits as f64 / child_visits.max(1) as f64);

        // A child can be observed mid-first-visit: no visits or no weight
        // yet. Treat it like an unvisited move.
        let mut child_utility;
        if child_visits <= 0 || child_weight <= 0.0 {
            child_utility = fpu_value;
        } else {
            child_utility = utility_avg;
            let ending_score_bonus = self.get_ending_white_score_bonus(node, is_root, move_loc);
            if ending_score_bonus != 0.0 {
                child_utility +=
                    self.get_score_utility_diff(score_mean_avg, score_mean_sq_avg, ending_score_bonus);
            }
        }

        // Separate atomics can be momentarily out of sync; repair provable
        // inconsistency.
        let mut total_child_weight = total_child_weight;
        if total_child_weight < child_weight {
            total_child_weight = child_weight;
        }

        // Virtual losses blend the child toward a loss, spreading concurrent
        // descents across siblings.
        if child_virtual_losses > 0 {
            let virtual_loss_weight =
                child_virtual_losses as f64 * self.params.num_virtual_losses_per_thread;
            let utility_radius = self.params.utility_radius();
            let virtual_loss_utility = match node.next_pla {
                Player::White => -utility_radius,
                Player::Black => utility_radius,
            };
            let frac = virtual_loss_weight / (virtual_loss_weight + child_weight.max(0.25));
            child_utility += (virtual_loss_utility - child_utility) * frac;
            child_weight += virtual_loss_weight;
        }

        if is_during_search && is_root {
            // Futile visits: skip a move that can no longer catch the leader
            // in the remaining budget. Uses total child visits, since a
            // lagging edge catches up instantly.
            if self.params.futile_visits_threshold > 0.0 {
                let required_weight = self.params.futile_visits_threshold * max_child_weight;
                let average_visits_per_weight =
                    (child_edge_visits as f64 + 1.0) / (child_weight + parent_weight_per_visit);
                let estimated_required_visits = required_weight * average_visits_per_weight;
                if (child_visits as f64) + thread.upper_bound_visits_left
                    < estimated_required_visits
                {
                    return FUTILE_VISITS_PRUNE_VALUE;
                }
            }
            // Funnel a floor of visits down every root child.
            if self.params.root_desired_per_child_visits_coeff > 0.0
                && child_weight
                    < (nn_policy_prob as f64
                        * total_child_weight
                        * self.params.root_desired_per_child_visits_coeff)
                        .sqrt()
            {
                return 1.0e20;
            }
            // The hint move must stay within 0.8x of every sibling's
            // per-visit-normalized weight.
            if self.root_hint_loc != Loc::NULL && move_loc == self.root_hint_loc {
                let average_weight_per_visit =
                    (child_weight + parent_weight_per_visit) / (child_visits as f64 + 1.0);
                let children = node.children();
                for c in children {
                    let Some(sibling) = c.get_if_allocated() else { break };
                    let sib_edge_visits = c.edge_visits();
                    let sib_visits = sibling.stats.visits.load(Ordering::Acquire);
                    let sib_raw_weight = sibling.stats.weight_sum.load(Ordering::Acquire);
                    let sib_weight =
                        sib_raw_weight * (sib_edge_visits as f64 / sib_visits.max(1) as f64);
                    if child_weight + average_weight_per_visit < sib_weight * 0.8 {
                        return 1.0e20;
                    }
                }
            }
            if self.params.wide_root_noise > 0.0 {
                self.maybe_apply_wide_root_noise(
                    &mut child_utility,
                    &mut nn_policy_prob,
                    node.next_pla,
                    thread,
                );
            }
        }
        if is_during_search && anti_mirror {
            self.maybe_apply_anti_mirror_policy(
                &mut nn_policy_prob,
                move_loc,
                parent_policy_probs,
                node.next_pla,
                thread,
            );
            self.maybe_apply_anti_mirror_forced_explore(
                &mut child_utility,
                parent_utility,
                move_loc,
                parent_policy_probs,
                child_weight,
                total_child_weight,
                node.next_pla,
                is_root,
                thread,
            );
        }

        self.explore_selection_value(
            nn_policy_prob as f64,
            total_child_weight,
            child_weight,
            child_utility,
            parent_utility_stdev_factor,
            node.next_pla,
        )
    }

    /// Selection value for expanding a new child with the given policy.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_explore_selection_value(
        &self,
        node: &SearchNode,
        nn_policy_prob: f32,
        total_child_weight: f64,
        fpu_value: f64,
        parent_weight_per_visit: f64,
        parent_utility_stdev_factor: f64,
        max_child_weight: f64,
        is_root: bool,
        thread: &mut SearchThread<G>,
    ) -> f64 {
        let child_weight = 0.0;
        let mut child_utility = fpu_value;
        let mut nn_policy_prob = nn_policy_prob;
        if is_root {
            if self.params.futile_visits_threshold > 0.0 {
                let average_visits_per_weight = 1.0 / parent_weight_per_visit;
                let required_weight = self.params.futile_visits_threshold * max_child_weight;
                let estimated_required_visits = required_weight * average_visits_per_weight;
                if thread.upper_bound_visits_left < estimated_required_visits {
                    return FUTILE_VISITS_PRUNE_VALUE;
                }
            }
            if self.params.wide_root_noise > 0.0 {
                self.maybe_apply_wide_root_noise(
                    &mut child_utility,
                    &mut nn_policy_prob,
                    node.next_pla,
                    thread,
                );
            }
        }
        self.explore_selection_value(
            nn_policy_prob as f64,
            total_child_weight,
            child_weight,
            child_utility,
            parent_utility_stdev_factor,
            node.next_pla,
        )
    }

    /// Weight this root child retrospectively deserves, given the best
    /// sibling's selection value; caps runaway weights when reporting.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn reduced_play_selection_weight(
        &self,
        node: &SearchNode,
        parent_policy_probs: &[f32],
        child: &SearchNode,
        move_loc: Loc,
        total_child_weight: f64,
        child_edge_visits: i64,
        parent_utility_stdev_factor: f64,
        best_child_explore_selection_value: f64,
    ) -> f64 {
        let move_pos = loc_to_pos(move_loc, self.root_game.x_size(), self.nn_x_len, self.nn_y_len);
        let nn_policy_prob = parent_policy_probs[move_pos];

        let child_visits = child.stats.visits.load(Ordering::Acquire);
        let raw_child_weight = child.stats.weight_sum.load(Ordering::Acquire);
        let score_mean_avg = child.stats.score_mean_avg.load(Ordering::Acquire);
        let score_mean_sq_avg = child.stats.score_mean_sq_avg.load(Ordering::Acquire);
        let utility_avg = child.stats.utility_avg.load(Ordering::Acquire);

        let child_weight =
            raw_child_weight * (child_edge_visits as f64 / child_visits.max(1) as f64);
        if child_visits <= 0 || child_weight <= 0.0 {
            return 0.0;
        }

        let mut child_utility = utility_avg;
        let ending_score_bonus = self.get_ending_white_score_bonus(node, true, move_loc);
        if ending_score_bonus != 0.0 {
            child_utility +=
                self.get_score_utility_diff(score_mean_avg, score_mean_sq_avg, ending_score_bonus);
        }

        let wanted = self.explore_selection_value_inverse(
            best_child_explore_selection_value,
            nn_policy_prob as f64,
            total_child_weight,
            child_utility,
            parent_utility_stdev_factor,
            node.next_pla,
        );
        child_weight.min(wanted)
    }

    /// Pick the best move to descend into: the best existing child, a new
    /// child at the best unexpanded policy position, or nothing.
    pub(crate) fn select_best_child_to_descend(
        &self,
        thread: &mut SearchThread<G>,
        node: &SearchNode,
        node_state: u32,
        is_root: bool,
    ) -> BestChildResult {
        debug_assert_eq!(thread.pla, node.next_pla);

        let mut max_selection_value = POLICY_ILLEGAL_SELECTION_VALUE;
        let mut best_child_idx = None;
        let mut best_child_move_loc = Loc::NULL;

        let children = node.children_for_state(node_state);
        let nn_output = node.nn_output().expect("expanded node must have an evaluator output");
        let policy_probs = nn_output.policy_probs_maybe_noised();

        let board_x = self.root_game.x_size();
        let mut policy_prob_mass_visited = 0.0f64;
        let mut total_child_weight = 0.0f64;
        let mut max_child_weight = 0.0f64;
        for c in children {
            let Some(child) = c.get_if_allocated() else { break };
            let move_loc = c.move_loc_relaxed();
            let move_pos = loc_to_pos(move_loc, board_x, self.nn_x_len, self.nn_y_len);
            policy_prob_mass_visited += policy_probs[move_pos].max(0.0) as f64;

            let edge_visits = c.edge_visits();
            let raw_child_weight = child.stats.weight_sum.load(Ordering::Acquire);
            let child_visits = child.stats.visits.load(Ordering::Acquire);
            let child_weight =
                raw_child_weight * (edge_visits as f64 / child_visits.max(1) as f64);
            total_child_weight += child_weight;
            if child_weight > max_child_weight {
                max_child_weight = child_weight;
            }
        }

        let (fpu_value, parent_utility, parent_weight_per_visit, parent_utility_stdev_factor) =
            self.fpu_value_for_children_assume_visited(
                node,
                thread.pla,
                is_root,
                policy_prob_mass_visited.min(1.0),
            );

        let anti_mirror = self.params.anti_mirror
            && self.mirroring_pla.is_some()
            && self.is_mirroring_since_search_start(thread, 0);

        let mut poses_with_child = vec![false; self.policy_size];
        let mut num_children_found = 0usize;
        for c in children {
            let Some(child) = c.get_if_allocated() else { break };
            num_children_found += 1;
            let child_edge_visits = c.edge_visits();
            let move_loc = c.move_loc_relaxed();

            let selection_value = self.explore_selection_value_of_child(
                node,
                policy_probs,
                child,
                move_loc,
                total_child_weight,
                child_edge_visits,
                fpu_value,
                parent_utility,
                parent_weight_per_visit,
                parent_utility_stdev_factor,
                true,
                is_root,
                anti_mirror,
                max_child_weight,
                thread,
            );
            if selection_value > max_selection_value {
                max_selection_value = selection_value;
                best_child_idx = Some(num_children_found - 1);
                best_child_move_loc = move_loc;
            }
            poses_with_child[loc_to_pos(move_loc, board_x, self.nn_x_len, self.nn_y_len)] = true;
        }

        let avoid_move_until_by_loc = self.avoid_move_until_by_loc(thread.pla);

        // Candidate new child: the untried position with the best policy.
        let mut best_new_move_loc = Loc::NULL;
        let mut best_new_nn_policy_prob = -1.0f32;
        for move_pos in 0..self.policy_size {
            if poses_with_child[move_pos] {
                continue;
            }
            let move_loc =
                pos_to_loc(move_pos, board_x, self.root_game.y_size(), self.nn_x_len, self.nn_y_len);
            if move_loc == Loc::NULL {
                continue;
            }
            if is_root && !self.is_allowed_root_move(move_loc) {
                continue;
            }
            if !avoid_move_until_by_loc.is_empty() {
                let until_depth = avoid_move_until_by_loc[self.avoid_index(move_loc)];
                if (thread.moves_since_root.len() as i32) < until_depth {
                    continue;
                }
            }

            let mut nn_policy_prob = policy_probs[move_pos];
            if anti_mirror {
                self.maybe_apply_anti_mirror_policy(
                    &mut nn_policy_prob,
                    move_loc,
                    policy_probs,
                    node.next_pla,
                    thread,
                );
            }
            if nn_policy_prob > best_new_nn_policy_prob {
                best_new_nn_policy_prob = nn_policy_prob;
                best_new_move_loc = move_loc;
            }
        }
        if best_new_move_loc != Loc::NULL {
            let selection_value = self.new_explore_selection_value(
                node,
                best_new_nn_policy_prob,
                total_child_weight,
                fpu_value,
                parent_weight_per_visit,
                parent_utility_stdev_factor,
                max_child_weight,
                is_root,
                thread,
            );
            if selection_value > max_selection_value {
                best_child_idx = Some(num_children_found);
                best_child_move_loc = best_new_move_loc;
            }
        }

        BestChildResult { num_children_found, best_child_idx, best_child_move_loc }
    }

    // ---- root-only noise -------------------------------------------------

    /// Smooth the policy and randomly bump utilities toward the mover so the
    /// root explores broadly. Analysis-oriented; never on in match play.
    fn maybe_apply_wide_root_noise(
        &self,
        child_utility: &mut f64,
        nn_policy_prob: &mut f32,
        pla: Player,
        thread: &mut SearchThread<G>,
    ) {
        let wide = self.params.wide_root_noise;
        *nn_policy_prob = (*nn_policy_prob as f64).powf(1.0 / (4.0 * wide + 1.0)) as f32;
        if thread.rng.gen_bool(0.5) {
            let z: f64 = thread.rng.sample(rand_distr::StandardNormal);
            let bonus = wide * z.abs();
            match pla {
                Player::White => *child_utility += bonus,
                Player::Black => *child_utility -= bonus,
            }
        }
    }

    // ---- anti-mirror -----------------------------------------------------

    /// Move at absolute history index `i`, counting root history then the
    /// worker's path.
    fn thread_move_at(&self, thread: &SearchThread<G>, i: usize) -> crate::game::Move {
        if i < self.root_moves.len() {
            self.root_moves[i]
        } else {
            thread.moves_since_root[i - self.root_moves.len()]
        }
    }

    /// True if every opponent move since search start mirrored ours,
    /// ignoring the most recent `skip_recent` plies.
    pub(crate) fn is_mirroring_since_search_start(
        &self,
        thread: &SearchThread<G>,
        skip_recent: usize,
    ) -> bool {
        let x_size = self.root_game.x_size();
        let y_size = self.root_game.y_size();
        let total = self.root_moves.len() + thread.moves_since_root.len();
        let mut i = self.root_moves.len() + 1;
        while i + skip_recent < total {
            let prev = self.thread_move_at(thread, i - 1);
            let cur = self.thread_move_at(thread, i);
            if cur.loc != mirror_loc(prev.loc, x_size, y_size) {
                return false;
            }
            i += 2;
        }
        true
    }

    /// Raise the prior on the opponent continuing to mirror, and on our
    /// center-proximal refutations.
    pub(crate) fn maybe_apply_anti_mirror_policy(
        &self,
        nn_policy_prob: &mut f32,
        move_loc: Loc,
        policy_probs: &[f32],
        move_pla: Player,
        thread: &SearchThread<G>,
    ) {
        let x_size = self.root_game.x_size();
        let y_size = self.root_game.y_size();
        let Some(mirroring_pla) = self.mirroring_pla else { return };

        let mut weight = 0.0f64;

        if move_pla == self.root_pla.opp() {
            let Some(prev) = thread.prev_move(&self.root_moves) else { return };
            if prev.loc == Loc::PASS {
                return;
            }
            let mut mloc = mirror_loc(prev.loc, x_size, y_size);
            if policy_probs[loc_to_pos(mloc, x_size, self.nn_x_len, self.nn_y_len)] < 0.0 {
                mloc = Loc::PASS;
            }
            if move_loc == mloc {
                weight = 1.0;
                let cloc = center_loc(x_size, y_size);
                let is_difficult = cloc != Loc::NULL
                    && thread.game.stone_at(cloc) == Some(mirroring_pla)
                    && self.mirror_advantage >= -0.5;
                if is_difficult {
                    weight *= 3.0;
                }
            }
        } else if move_pla == self.root_pla && move_loc != Loc::PASS {
            if is_central(move_loc, x_size, y_size) {
                weight = 0.3;
            } else {
                if is_near_central(move_loc, x_size, y_size) {
                    weight = 0.05;
                }
                let cloc = center_loc(x_size, y_size);
                if cloc != Loc::NULL && self.root_game.stone_at(cloc) == Some(move_pla.opp()) {
                    let dist_sq = euclidean_distance_squared(move_loc, cloc, x_size);
                    if dist_sq <= 2 {
                        weight = 0.05;
                    } else if dist_sq <= 4 {
                        weight = 0.03;
                    }
                }
            }
        }

        if weight > 0.0 {
            let depth = thread.moves_since_root.len() as f64;
            let weight = weight / (1.0 + depth.sqrt());
            *nn_policy_prob += (1.0 - *nn_policy_prob) * weight as f32;
        }
    }

    /// Dump a proportion of playouts down mirror moves (to make them look
    /// bad) and down our refutations (to tolerate their slightly worse
    /// utilities).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn maybe_apply_anti_mirror_forced_explore(
        &self,
        child_utility: &mut f64,
        parent_utility: f64,
        move_loc: Loc,
        policy_probs: &[f32],
        this_child_weight: f64,
        total_child_weight: f64,
        move_pla: Player,
        is_root: bool,
        thread: &SearchThread<G>,
    ) {
        let Some(mirroring_pla) = self.mirroring_pla else { return };
        debug_assert_eq!(mirroring_pla, self.root_pla.opp());

        let x_size = self.root_game.x_size();
        let y_size = self.root_game.y_size();
        let cloc = center_loc(x_size, y_size);
        // The hard case: the opponent holds the center and komi favors them.
        let is_difficult = cloc != Loc::NULL
            && thread.game.stone_at(cloc) == Some(mirroring_pla)
            && self.mirror_advantage >= -0.5;

        // A positive amount favors the mover in white-positive utility space.
        let mover_bonus = |amount: f64| match move_pla {
            Player::White => amount,
            Player::Black => -amount,
        };

        if move_pla == mirroring_pla {
            let Some(prev) = thread.prev_move(&self.root_moves) else { return };
            if prev.loc == Loc::PASS {
                return;
            }
            let mut mloc = mirror_loc(prev.loc, x_size, y_size);
            if policy_probs[loc_to_pos(mloc, x_size, self.nn_x_len, self.nn_y_len)] < 0.0 {
                mloc = Loc::PASS;
            }
            if move_loc != mloc {
                return;
            }

            let mut proportion_to_dump: f64;
            let mut proportion_to_bias;
            if is_difficult {
                proportion_to_dump = 0.20;
                if mloc != Loc::PASS && cloc != Loc::NULL {
                    let dist_sq = euclidean_distance_squared(cloc, mloc, x_size) as f64;
                    proportion_to_dump = proportion_to_dump.max(
                        1.0 / (0.75 + 0.5 * dist_sq.sqrt())
                            / self.mirror_center_symmetry_error.max(1.0),
                    );
                }
                proportion_to_bias = 0.75;
            } else if self.mirror_advantage >= 5.0 {
                proportion_to_dump = 0.15;
                proportion_to_bias = 0.50;
            } else if self.mirror_advantage >= -5.0 {
                proportion_to_dump = 0.10 + self.mirror_advantage;
                proportion_to_bias = 0.30 + self.mirror_advantage * 4.0;
            } else {
                proportion_to_dump = 0.05;
                proportion_to_bias = 0.10;
            }

            if mloc == Loc::PASS {
                proportion_to_dump *= 0.35 / self.mirror_center_symmetry_error.sqrt().max(1.0);
            }
            if self.mirror_center_symmetry_error >= 1.0 {
                proportion_to_dump /= self.mirror_center_symmetry_error;
                proportion_to_bias /= self.mirror_center_symmetry_error;
            }

            let damp = (0.3f64).max(1.0 - 0.7 * parent_utility * parent_utility);
            if this_child_weight < proportion_to_dump * total_child_weight {
                *child_utility += mover_bonus(100.0);
            }
            if this_child_weight < proportion_to_bias * total_child_weight {
                *child_utility += mover_bonus(0.18) * damp;
            }
            if this_child_weight < 0.5 * proportion_to_bias * total_child_weight {
                *child_utility += mover_bonus(0.36) * damp;
            }
        } else if move_pla == self.root_pla && move_loc != Loc::PASS {
            let mut proportion_to_dump = 0.0f64;
            let damp = (0.3f64).max(1.0 - 0.7 * parent_utility * parent_utility);
            if is_difficult && cloc != Loc::NULL {
                let dist_sq = euclidean_distance_squared(move_loc, cloc, x_size);
                // Contact with the center stone: encourage the refutation
                // even if its utility looks slightly worse.
                if dist_sq <= 2 {
                    *child_utility +=
                        mover_bonus(0.19) / self.mirror_center_symmetry_error.max(1.0) * damp;
                    proportion_to_dump = 0.033;
                }
                if dist_sq <= 2 {
                    proportion_to_dump = proportion_to_dump.max(0.010);
                } else if dist_sq <= 4 {
                    proportion_to_dump = proportion_to_dump.max(0.005);
                }
            }
            if cloc != Loc::NULL && move_loc == cloc {
                proportion_to_dump = if is_root { 0.06 } else { 0.12 };
            }

            let utility_loss = match move_pla {
                Player::White => parent_utility - *child_utility,
                Player::Black => *child_utility - parent_utility,
            };
            if utility_loss > 0.0 && utility_loss * proportion_to_dump > 0.03 {
                proportion_to_dump += 0.5 * (0.03 / utility_loss - proportion_to_dump);
            }

            if let Some(prev) = thread.prev_move(&self.root_moves) {
                if prev.loc.is_board() && cloc != Loc::NULL {
                    let center_dist_sq = euclidean_distance_squared(cloc, prev.loc, x_size);
                    if center_dist_sq <= 16 {
                        proportion_to_dump *= 0.900;
                    }
                    if center_dist_sq <= 5 {
                        proportion_to_dump *= 0.825;
                    }
                    if center_dist_sq <= 2 {
                        proportion_to_dump *= 0.750;
                    }
                }
            }

            if this_child_weight < proportion_to_dump * total_child_weight {
                *child_utility += mover_bonus(100.0);
            }
        }
    }
}
