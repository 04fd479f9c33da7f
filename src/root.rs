//! Root-only shaping of the search.
//!
//! The root's evaluator output is reshaped before selection ever sees it:
//! policy temperature, Dirichlet noise, and hint-move redistribution all
//! operate on a copy of the policy stored alongside the original. Root moves
//! can additionally be filtered outright (useless-move and symmetry
//! pruning), and ownership information slightly biases move utilities toward
//! clean game endings.

use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Gamma};

use crate::eval::{loc_to_pos, Evaluator, NNOutput};
use crate::game::{GameState, Loc, Player};
use crate::node::SearchNode;
use crate::search::Search;
use crate::worker::SearchThread;

impl<G: GameState, E: Evaluator<G>> Search<G, E> {
    /// Whether a move may be searched at the root at all.
    pub(crate) fn is_allowed_root_move(&self, move_loc: Loc) -> bool {
        debug_assert!(move_loc == Loc::PASS || move_loc.is_board());

        // After four consecutive opponent passes, refuse to keep playing
        // inside anyone's settled territory: it only prolongs a decided game.
        if self.params.root_prune_useless_moves
            && !self.root_moves.is_empty()
            && move_loc != Loc::PASS
        {
            let n = self.root_moves.len();
            let opp = self.root_pla.opp();
            if n >= 7 {
                let all_recent_opp_passes = (0..4).all(|k| {
                    let mv = self.root_moves[n - 1 - 2 * k];
                    mv.loc == Loc::PASS && mv.pla == opp
                });
                if all_recent_opp_passes {
                    let owner = self.root_safe_area.get(move_loc.0 as usize).copied().flatten();
                    if owner.is_some() {
                        return false;
                    }
                }
            }
        }

        if self.params.root_symmetry_pruning
            && move_loc.is_board()
            && self.root_sym_dup_loc.get(move_loc.0 as usize).copied().unwrap_or(false)
        {
            return false;
        }

        true
    }

    /// Small utility adjustment from the ownership map, discouraging moves
    /// that only fill decided territory at the end of the game. Returns extra
    /// points from white's perspective.
    pub(crate) fn get_ending_white_score_bonus(
        &self,
        node: &SearchNode,
        is_root: bool,
        move_loc: Loc,
    ) -> f64 {
        if !is_root || move_loc == Loc::NULL || self.params.root_ending_bonus_points == 0.0 {
            return 0.0;
        }
        let Some(nn_output) = node.nn_output() else { return 0.0 };
        let Some(owner_map) = &nn_output.white_owner_map else { return 0.0 };

        const EXTREME: f64 = 0.95;
        const TAIL: f64 = 0.05;

        let mut extra_root_points = 0.0f64;
        if move_loc != Loc::PASS {
            let pos =
                loc_to_pos(move_loc, self.root_game.x_size(), self.nn_x_len, self.nn_y_len);
            let white_ownership = owner_map[pos] as f64;
            let pla_ownership = match self.root_pla {
                Player::White => white_ownership,
                Player::Black => -white_ownership,
            };
            if pla_ownership <= -EXTREME {
                extra_root_points -=
                    self.params.root_ending_bonus_points * ((-EXTREME - pla_ownership) / TAIL);
            } else if pla_ownership >= EXTREME && !self.is_adjacent_to_opponent(move_loc) {
                extra_root_points -=
                    self.params.root_ending_bonus_points * ((pla_ownership - EXTREME) / TAIL);
            }
        }

        match self.root_pla {
            Player::White => extra_root_points,
            Player::Black => -extra_root_points,
        }
    }

    fn is_adjacent_to_opponent(&self, loc: Loc) -> bool {
        let x_size = self.root_game.x_size();
        let y_size = self.root_game.y_size();
        let x = loc.x(x_size) as i64;
        let y = loc.y(x_size) as i64;
        let opp = self.root_pla.opp();
        for (dx, dy) in [(-1i64, 0i64), (1, 0), (0, -1), (0, 1)] {
            let (nx, ny) = (x + dx, y + dy);
            if nx >= 0 && ny >= 0 && (nx as usize) < x_size && (ny as usize) < y_size {
                let nloc = Loc::from_xy(nx as usize, ny as usize, x_size);
                if self.root_game.stone_at(nloc) == Some(opp) {
                    return true;
                }
            }
        }
        false
    }

    /// Per-move Dirichlet concentrations: half uniform, half shaped by the
    /// log of the existing policy, summing to 1 over legal moves.
    pub(crate) fn compute_dirichlet_alpha_distribution(
        policy: &[f32],
        alpha_distr: &mut [f64],
    ) -> usize {
        let legal_count = policy.iter().filter(|&&p| p >= 0.0).count();
        assert!(legal_count > 0, "no move with nonnegative policy");

        let mut log_policy_sum = 0.0f64;
        for (a, &p) in alpha_distr.iter_mut().zip(policy.iter()) {
            if p >= 0.0 {
                *a = ((p as f64).min(0.01) + 1.0e-20).ln();
                log_policy_sum += *a;
            }
        }
        let log_policy_mean = log_policy_sum / legal_count as f64;
        let mut alpha_prop_sum = 0.0f64;
        for (a, &p) in alpha_distr.iter_mut().zip(policy.iter()) {
            if p >= 0.0 {
                *a = (*a - log_policy_mean).max(0.0);
                alpha_prop_sum += *a;
            }
        }
        let uniform_prob = 1.0 / legal_count as f64;
        if alpha_prop_sum <= 0.0 {
            for (a, &p) in alpha_distr.iter_mut().zip(policy.iter()) {
                if p >= 0.0 {
                    *a = uniform_prob;
                }
            }
        } else {
            for (a, &p) in alpha_distr.iter_mut().zip(policy.iter()) {
                if p >= 0.0 {
                    *a = 0.5 * (*a / alpha_prop_sum + uniform_prob);
                }
            }
        }
        legal_count
    }

    /// Mix a Dirichlet draw into the policy, drawn as independent Gammas and
    /// normalized.
    pub(crate) fn add_dirichlet_noise(&self, rng: &mut ChaCha20Rng, policy: &mut [f32]) {
        let mut r = vec![0.0f64; policy.len()];
        Self::compute_dirichlet_alpha_distribution(policy, &mut r);

        let total = self.params.root_dirichlet_noise_total_concentration;
        let mut r_sum = 0.0f64;
        for (ri, &p) in r.iter_mut().zip(policy.iter()) {
            if p >= 0.0 {
                let alpha = (*ri * total).max(1.0e-10);
                let gamma = Gamma::new(alpha, 1.0).unwrap();
                *ri = gamma.sample(rng);
                r_sum += *ri;
            } else {
                *ri = 0.0;
            }
        }
        if r_sum <= 0.0 {
            return;
        }
        for ri in r.iter_mut() {
            *ri /= r_sum;
        }

        let weight = self.params.root_dirichlet_noise_weight;
        for (p, &ri) in policy.iter_mut().zip(r.iter()) {
            if *p >= 0.0 {
                *p = (ri * weight + *p as f64 * (1.0 - weight)) as f32;
            }
        }
    }

    /// Build the root's shaped policy copy: temperature, Dirichlet noise, and
    /// hint redistribution. Returns `None` when nothing applies (or the
    /// output is already shaped).
    pub(crate) fn maybe_add_policy_noise_and_temp(
        &self,
        thread: &mut SearchThread<G>,
        is_root: bool,
        old_output: Option<&NNOutput>,
    ) -> Option<Box<NNOutput>> {
        if !is_root {
            return None;
        }
        if !self.params.root_noise_enabled
            && self.params.root_policy_temperature == 1.0
            && self.params.root_policy_temperature_early == 1.0
            && self.root_hint_loc == Loc::NULL
        {
            return None;
        }
        let old_output = old_output?;
        if old_output.noised_policy.is_some() {
            return None;
        }

        let mut new_output = Box::new(old_output.clone());
        let mut noised: Vec<f32> = new_output.policy.clone();

        if self.params.root_policy_temperature != 1.0
            || self.params.root_policy_temperature_early != 1.0
        {
            let temperature = self.interpolate_early(
                self.params.chosen_move_temperature_halflife,
                self.params.root_policy_temperature_early,
                self.params.root_policy_temperature,
            );
            let max_value =
                noised.iter().copied().fold(0.0f32, f32::max) as f64;
            debug_assert!(max_value > 0.0);
            let log_max = max_value.ln();
            let inv_temp = 1.0 / temperature;
            let mut sum = 0.0f64;
            for p in noised.iter_mut() {
                if *p > 0.0 {
                    let q = (((*p as f64).ln() - log_max) * inv_temp).exp();
                    *p = q as f32;
                    sum += q;
                }
            }
            debug_assert!(sum > 0.0);
            for p in noised.iter_mut() {
                if *p >= 0.0 {
                    *p = (*p as f64 / sum) as f32;
                }
            }
        }

        if self.params.root_noise_enabled {
            self.add_dirichlet_noise(&mut thread.rng, &mut noised);
        }

        // Move a sliver of policy onto the hint move, comparable to what the
        // noise would have given it.
        if self.root_hint_loc != Loc::NULL {
            const PROP_TO_MOVE: f32 = 0.02;
            let pos = loc_to_pos(
                self.root_hint_loc,
                self.root_game.x_size(),
                self.nn_x_len,
                self.nn_y_len,
            );
            if noised[pos] >= 0.0 {
                let mut amount_to_move = 0.0f32;
                for p in noised.iter_mut() {
                    if *p >= 0.0 {
                        amount_to_move += *p * PROP_TO_MOVE;
                        *p *= 1.0 - PROP_TO_MOVE;
                    }
                }
                noised[pos] += amount_to_move;
            }
        }

        new_output.noised_policy = Some(noised);
        Some(new_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchParams;
    use crate::eval::ConstEvaluator;
    use crate::games::gridgo::GridGo;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn make_search(params: SearchParams) -> Search<GridGo, ConstEvaluator> {
        let game = GridGo::new(5, 5, 0.5);
        Search::new(params, Arc::new(ConstEvaluator::new(5, 5)), game, "root-tests")
    }

    #[test]
    fn alpha_distribution_sums_to_one_over_legal() {
        let policy = vec![0.5f32, 0.3, -1.0, 0.15, 0.05];
        let mut alpha = vec![0.0f64; policy.len()];
        let legal = Search::<GridGo, ConstEvaluator>::compute_dirichlet_alpha_distribution(
            &policy, &mut alpha,
        );
        assert_eq!(legal, 4);
        let sum: f64 = alpha.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(alpha[2], 0.0);
        // Every legal move keeps at least part of the uniform share.
        for (&a, &p) in alpha.iter().zip(policy.iter()) {
            if p >= 0.0 {
                assert!(a >= 0.5 / 4.0 - 1e-12);
            }
        }
    }

    #[test]
    fn dirichlet_noise_preserves_normalization_and_legality() {
        let search = make_search(SearchParams::for_testing().with_root_noise(true));
        let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(7);
        let mut policy = vec![0.5f32, 0.3, -1.0, 0.15, 0.05];
        search.add_dirichlet_noise(&mut rng, &mut policy);
        assert!(policy[2] < 0.0);
        let sum: f32 = policy.iter().filter(|&&p| p >= 0.0).sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn noise_mixing_weight_bounds_policy_change() {
        // With weight w, each legal move's policy moves at most w away from
        // its raw value in L-infinity.
        let mut params = SearchParams::for_testing().with_root_noise(true);
        params.root_dirichlet_noise_weight = 0.25;
        let search = make_search(params);
        let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(99);
        let raw = vec![0.7f32, 0.1, 0.1, 0.1, -1.0];
        for _ in 0..50 {
            let mut noised = raw.clone();
            search.add_dirichlet_noise(&mut rng, &mut noised);
            for (n, r) in noised.iter().zip(raw.iter()) {
                if *r >= 0.0 {
                    assert!((n - r).abs() <= 0.25 + 1e-5);
                }
            }
        }
    }

    #[test]
    fn useless_move_pruning_needs_four_opponent_passes() {
        let mut search = make_search(SearchParams::for_testing());
        // No history: everything allowed.
        assert!(search.is_allowed_root_move(Loc(0)));
        assert!(search.is_allowed_root_move(Loc::PASS));
        // Even with passes in history, GridGo reports no safe territory, so
        // nothing is pruned.
        for _ in 0..4 {
            search.root_moves.push(crate::game::Move::new(Player::Black, Loc(1)));
            search.root_moves.push(crate::game::Move::new(Player::White, Loc::PASS));
        }
        assert!(search.is_allowed_root_move(Loc(0)));
    }

    #[test]
    fn symmetry_pruning_filters_duplicates() {
        let mut params = SearchParams::for_testing();
        params.root_symmetry_pruning = true;
        let mut search = make_search(params);
        search.root_sym_dup_loc = vec![false; 25];
        search.root_sym_dup_loc[24] = true;
        assert!(!search.is_allowed_root_move(Loc(24)));
        assert!(search.is_allowed_root_move(Loc(23)));
    }
}
