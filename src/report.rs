//! Read-only projections of the search tree: reported values, play-selection
//! weights, and the chosen move.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use std::sync::atomic::Ordering;

use crate::eval::{loc_to_pos, Evaluator};
use crate::game::{GameState, Loc};
use crate::hash::hash_of_bytes;
use crate::math::stdev_of;
use crate::search::Search;

/// Aggregate values at the root, clamped to their legal ranges on export.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedSearchValues {
    /// Expected win minus loss, white perspective, in [-1, 1].
    pub win_loss_value: f64,
    pub no_result_value: f64,
    pub win_value: f64,
    pub loss_value: f64,
    pub expected_score: f64,
    pub expected_score_stdev: f64,
    pub lead: f64,
    pub utility: f64,
    pub weight: f64,
    pub visits: i64,
}

/// One root move with its play-selection weight.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaySelectionValue {
    pub loc: Loc,
    /// Relative weight for move selection; not normalized.
    pub selection_value: f64,
    pub visits: f64,
}

impl<G: GameState, E: Evaluator<G>> Search<G, E> {
    /// Aggregate values at the root, or `None` before any search.
    pub fn get_root_values(&self) -> Option<ReportedSearchValues> {
        let root = self.root_node.as_deref()?;
        let stats = root.stats.snapshot();
        if stats.visits <= 0 || stats.weight_sum <= 0.0 {
            return None;
        }

        // Tiny floating point drift can push the averages out of range.
        let win_loss_value = stats.win_loss_value_avg.clamp(-1.0, 1.0);
        let no_result_value =
            stats.no_result_value_avg.clamp(0.0, 1.0 - win_loss_value.abs());
        let win_value = (0.5 * (win_loss_value + (1.0 - no_result_value))).clamp(0.0, 1.0);
        let loss_value = (0.5 * (-win_loss_value + (1.0 - no_result_value))).clamp(0.0, 1.0);

        Some(ReportedSearchValues {
            win_loss_value,
            no_result_value,
            win_value,
            loss_value,
            expected_score: stats.score_mean_avg,
            expected_score_stdev: stdev_of(stats.score_mean_avg, stats.score_mean_sq_avg),
            lead: stats.lead_avg,
            utility: stats.utility_avg,
            weight: stats.weight_sum,
            visits: stats.visits,
        })
    }

    /// Per-root-move weights for choosing the move to play.
    ///
    /// Weights start from each child's visit-scaled weight, capped at the
    /// weight that the best child's selection value retrospectively
    /// justifies, so a move that briefly soaked up visits on a value spike
    /// cannot outrank the genuinely best move. Falls back to the raw policy
    /// maximum when no child has any weight.
    pub fn get_play_selection_values(&self) -> Option<Vec<PlaySelectionValue>> {
        let root = self.root_node.as_deref()?;
        let nn_output = root.nn_output()?;
        let policy_probs = nn_output.policy_probs_maybe_noised();

        let children = root.children();
        let num_children = crate::node::SearchNode::count_children_in(children);

        if num_children == 0 {
            // No search yet: report the best raw-policy move if any.
            let mut best_pos = None;
            let mut best_prob = 0.0f32;
            for (pos, &p) in policy_probs.iter().enumerate() {
                if p > best_prob {
                    best_prob = p;
                    best_pos = Some(pos);
                }
            }
            let pos = best_pos?;
            let loc = crate::eval::pos_to_loc(
                pos,
                self.root_game.x_size(),
                self.root_game.y_size(),
                self.nn_x_len,
                self.nn_y_len,
            );
            return Some(vec![PlaySelectionValue { loc, selection_value: 1.0, visits: 0.0 }]);
        }

        let mut total_child_weight = 0.0f64;
        let mut policy_prob_mass_visited = 0.0f64;
        let board_x = self.root_game.x_size();
        for c in children.iter().take(num_children) {
            let child = c.get_if_allocated().unwrap();
            let stats = child.stats.snapshot();
            let child_weight =
                stats.weight_sum * (c.edge_visits() as f64 / stats.visits.max(1) as f64);
            total_child_weight += child_weight;
            let pos = loc_to_pos(c.move_loc(), board_x, self.nn_x_len, self.nn_y_len);
            policy_prob_mass_visited += policy_probs[pos].max(0.0) as f64;
        }

        let (fpu_value, parent_utility, parent_weight_per_visit, parent_utility_stdev_factor) =
            self.fpu_value_for_children_assume_visited(
                root,
                root.next_pla,
                true,
                policy_prob_mass_visited.min(1.0),
            );

        // Reporting-only thread: selection is queried with search-time
        // modifiers (noise, futility, anti-mirror) disabled.
        let mut scratch = self.make_search_thread(0);
        let mut best_selection_value = crate::select::POLICY_ILLEGAL_SELECTION_VALUE;
        for c in children.iter().take(num_children) {
            let child = c.get_if_allocated().unwrap();
            let v = self.explore_selection_value_of_child(
                root,
                policy_probs,
                child,
                c.move_loc(),
                total_child_weight,
                c.edge_visits(),
                fpu_value,
                parent_utility,
                parent_weight_per_visit,
                parent_utility_stdev_factor,
                false,
                true,
                false,
                0.0,
                &mut scratch,
            );
            if v > best_selection_value {
                best_selection_value = v;
            }
        }

        let mut out = Vec::with_capacity(num_children);
        let mut any_nonzero = false;
        for c in children.iter().take(num_children) {
            let child = c.get_if_allocated().unwrap();
            let weight = self.reduced_play_selection_weight(
                root,
                policy_probs,
                child,
                c.move_loc(),
                total_child_weight,
                c.edge_visits(),
                parent_utility_stdev_factor,
                best_selection_value,
            );
            if weight > 0.0 {
                any_nonzero = true;
            }
            out.push(PlaySelectionValue {
                loc: c.move_loc(),
                selection_value: weight,
                visits: child.stats.visits.load(Ordering::Acquire) as f64,
            });
        }

        if !any_nonzero {
            // All children were raced to zero weight; use raw policy order.
            for v in out.iter_mut() {
                let pos = loc_to_pos(v.loc, board_x, self.nn_x_len, self.nn_y_len);
                v.selection_value = policy_probs[pos].max(0.0) as f64;
            }
        }
        Some(out)
    }

    /// The move the search would play now, sampled under the configured
    /// move-selection temperature. Deterministic for a given search.
    pub fn get_chosen_move_loc(&self) -> Loc {
        let Some(selection) = self.get_play_selection_values() else {
            return Loc::NULL;
        };
        if selection.is_empty() {
            return Loc::NULL;
        }

        let temperature = self.interpolate_early(
            self.params.chosen_move_temperature_halflife,
            self.params.chosen_move_temperature_early,
            self.params.chosen_move_temperature,
        );

        let values: Vec<f64> = selection.iter().map(|s| s.selection_value).collect();
        // Stable per search: repeated queries return the same move.
        let mut rng = ChaCha20Rng::seed_from_u64(
            hash_of_bytes(self.rand_seed.as_bytes())
                .combine(self.root_game.pos_hash())
                .mix_u64(self.num_searches_begun)
                .hash1,
        );
        let idx = choose_index_with_temperature(&mut rng, &values, temperature);
        selection[idx].loc
    }

    /// (surprise, search entropy, policy entropy) at the root: how far the
    /// search's move distribution drifted from the raw policy. Low surprise
    /// plus low policy entropy marks an "obvious" move.
    pub fn get_policy_surprise_and_entropy(&self) -> Option<(f64, f64, f64)> {
        let root = self.root_node.as_deref()?;
        let nn_output = root.nn_output()?;
        let policy_probs = nn_output.policy_probs_maybe_noised();
        let selection = self.get_play_selection_values()?;

        let total: f64 = selection.iter().map(|s| s.selection_value).sum();
        if total <= 0.0 {
            return None;
        }

        let board_x = self.root_game.x_size();
        let mut surprise = 0.0f64;
        let mut search_entropy = 0.0f64;
        for s in &selection {
            let target = s.selection_value / total;
            if target <= 0.0 {
                continue;
            }
            let pos = loc_to_pos(s.loc, board_x, self.nn_x_len, self.nn_y_len);
            let policy = (policy_probs[pos].max(1.0e-10)) as f64;
            surprise += target * (target / policy).ln();
            search_entropy -= target * target.ln();
        }

        let mut policy_entropy = 0.0f64;
        for &p in policy_probs {
            if p > 0.0 {
                policy_entropy -= (p as f64) * (p as f64).ln();
            }
        }

        Some((surprise.max(0.0), search_entropy, policy_entropy))
    }

    /// Per-root-child statistics, for inspection and tests.
    pub fn root_child_summaries(&self) -> Vec<RootChildSummary> {
        let Some(root) = self.root_node.as_deref() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for c in root.children() {
            let Some(child) = c.get_if_allocated() else { break };
            let stats = child.stats.snapshot();
            out.push(RootChildSummary {
                loc: c.move_loc(),
                edge_visits: c.edge_visits(),
                child_visits: stats.visits,
                child_weight_sum: stats.weight_sum,
                child_utility_avg: stats.utility_avg,
            });
        }
        out
    }
}

/// One root child as seen from outside the search.
#[derive(Debug, Clone, PartialEq)]
pub struct RootChildSummary {
    pub loc: Loc,
    pub edge_visits: i64,
    pub child_visits: i64,
    pub child_weight_sum: f64,
    pub child_utility_avg: f64,
}

/// Sample an index proportionally to `relative_probs^(1/temperature)`;
/// argmax when the temperature is (near) zero.
pub(crate) fn choose_index_with_temperature(
    rng: &mut ChaCha20Rng,
    relative_probs: &[f64],
    temperature: f64,
) -> usize {
    debug_assert!(!relative_probs.is_empty());
    let max_value = relative_probs.iter().copied().fold(f64::MIN, f64::max);
    debug_assert!(max_value > 0.0);

    if temperature <= 1.0e-4 {
        let mut best_idx = 0;
        for (i, &p) in relative_probs.iter().enumerate() {
            if p > relative_probs[best_idx] {
                best_idx = i;
            }
        }
        return best_idx;
    }

    // Numerically stable powering and normalization in log space.
    let log_max = max_value.ln();
    let processed: Vec<f64> = relative_probs
        .iter()
        .map(|&p| if p <= 0.0 { 0.0 } else { ((p.ln() - log_max) / temperature).exp() })
        .collect();
    let sum: f64 = processed.iter().sum();
    debug_assert!(sum > 0.0);

    let r: f64 = rand::Rng::gen::<f64>(rng) * sum;
    let mut cumulative = 0.0;
    for (i, &p) in processed.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return i;
        }
    }
    processed.iter().rposition(|&p| p > 0.0).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_zero_is_argmax() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let probs = vec![0.1, 3.0, 0.2];
        for _ in 0..10 {
            assert_eq!(choose_index_with_temperature(&mut rng, &probs, 0.0), 1);
        }
    }

    #[test]
    fn temperature_one_samples_proportionally() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let probs = vec![1.0, 3.0];
        let mut counts = [0usize; 2];
        for _ in 0..4000 {
            counts[choose_index_with_temperature(&mut rng, &probs, 1.0)] += 1;
        }
        let frac = counts[1] as f64 / 4000.0;
        assert!((frac - 0.75).abs() < 0.05, "frac={frac}");
    }

    #[test]
    fn high_temperature_flattens() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let probs = vec![1.0, 8.0];
        let mut counts = [0usize; 2];
        for _ in 0..4000 {
            counts[choose_index_with_temperature(&mut rng, &probs, 8.0)] += 1;
        }
        // At temperature 8 the ratio 8:1 becomes 8^(1/8):1 ~ 1.3:1.
        let frac = counts[1] as f64 / 4000.0;
        assert!(frac < 0.65 && frac > 0.45, "frac={frac}");
    }
}
