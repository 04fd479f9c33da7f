//! Search configuration.
//!
//! One flat struct controls the whole engine. Everything is serde-friendly so
//! callers can load parameter sets from config files; unspecified fields fall
//! back to the production defaults.

use serde::{Deserialize, Serialize};

/// Configuration for the search engine.
///
/// Utilities are white-positive and bounded by the utility radius
/// `win_loss_utility_factor + static_score_utility_factor +
/// dynamic_score_utility_factor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Worker thread count, including the calling thread.
    pub num_threads: usize,

    /// Visit cap per search (tree visits at the root, including reused ones).
    pub max_visits: i64,
    /// Playout cap per search (new descents only).
    pub max_playouts: i64,
    /// Wall-clock cap per search in seconds.
    pub max_time: f64,
    pub max_visits_pondering: i64,
    pub max_playouts_pondering: i64,
    pub max_time_pondering: f64,

    // ---- utility shaping -------------------------------------------------
    pub win_loss_utility_factor: f64,
    pub no_result_utility_for_white: f64,
    pub static_score_utility_factor: f64,
    pub dynamic_score_utility_factor: f64,
    /// Pull of the dynamic score center toward zero, in [0,1].
    pub dynamic_score_center_zero_weight: f64,
    pub dynamic_score_center_scale: f64,
    pub draw_equivalent_wins_for_white: f64,

    // ---- PUCT ------------------------------------------------------------
    pub cpuct_exploration: f64,
    pub cpuct_exploration_log: f64,
    pub cpuct_exploration_base: f64,
    pub cpuct_utility_stdev_prior: f64,
    pub cpuct_utility_stdev_prior_weight: f64,
    pub cpuct_utility_stdev_scale: f64,

    // ---- first play urgency ----------------------------------------------
    pub fpu_reduction_max: f64,
    pub fpu_loss_prop: f64,
    pub root_fpu_reduction_max: f64,
    pub root_fpu_loss_prop: f64,
    /// Blend of the parent's raw network utility into its observed utility
    /// when computing FPU.
    pub fpu_parent_weight: f64,

    // ---- backup reweighting ----------------------------------------------
    /// Exponent on the t-distribution CDF used to downweight children whose
    /// utility lags the sibling average. 0 disables.
    pub value_weight_exponent: f64,
    pub use_noise_pruning: bool,
    pub noise_prune_utility_scale: f64,
    pub noise_pruning_cap: f64,

    // ---- uncertainty weighting -------------------------------------------
    pub use_uncertainty: bool,
    pub uncertainty_coeff: f64,
    pub uncertainty_exponent: f64,
    pub uncertainty_max_weight: f64,

    // ---- root shaping ----------------------------------------------------
    pub root_noise_enabled: bool,
    pub root_dirichlet_noise_total_concentration: f64,
    pub root_dirichlet_noise_weight: f64,
    pub root_policy_temperature: f64,
    pub root_policy_temperature_early: f64,
    /// Symmetries averaged when (re)evaluating the root. 1 disables sampling.
    pub root_num_symmetries_to_sample: usize,
    pub root_desired_per_child_visits_coeff: f64,
    pub root_ending_bonus_points: f64,
    pub root_prune_useless_moves: bool,
    pub root_symmetry_pruning: bool,
    pub wide_root_noise: f64,

    // ---- move choice -----------------------------------------------------
    pub chosen_move_temperature: f64,
    pub chosen_move_temperature_early: f64,
    /// Halflife in moves (19x19-equivalent) of the early temperature.
    pub chosen_move_temperature_halflife: f64,
    pub chosen_move_subtract: f64,
    pub chosen_move_prune: f64,

    // ---- concurrency -----------------------------------------------------
    pub num_virtual_losses_per_thread: f64,
    /// log2 of the node-table shard count.
    pub node_table_shards_power_of_two: usize,

    // ---- graph search ----------------------------------------------------
    pub use_graph_search: bool,
    pub graph_search_rep_bound: usize,
    /// Probability of descending into a transposed child even when its edge
    /// visits could simply catch up.
    pub graph_search_catch_up_leak_prob: f64,
    /// Edge visits added per catch-up step. Kept configurable, but the engine
    /// currently always steps by 1.
    pub graph_search_catch_up_prop: f64,

    // ---- subtree value bias ----------------------------------------------
    pub subtree_value_bias_factor: f64,
    pub subtree_value_bias_weight_exponent: f64,
    /// Fraction of a deleted node's bias contribution that is unwound from
    /// the shared entry.
    pub subtree_value_bias_free_prop: f64,
    pub subtree_value_bias_table_num_shards: usize,

    // ---- pattern bonus ---------------------------------------------------
    /// Utility penalty for repeating local patterns already played by the
    /// side the search is for. 0 disables the internal table.
    pub avoid_repeated_pattern_utility: f64,

    // ---- misc behaviors --------------------------------------------------
    pub anti_mirror: bool,
    pub conservative_pass: bool,
    pub futile_visits_threshold: f64,
    pub nn_policy_temperature: f64,

    // ---- time management -------------------------------------------------
    pub lag_buffer: f64,
    pub overallocate_time_factor: f64,
    pub midgame_time_factor: f64,
    pub midgame_turn_peak_time: f64,
    pub endgame_turn_time_decay: f64,
    pub obvious_moves_time_factor: f64,
    pub obvious_moves_policy_entropy_tolerance: f64,
    pub obvious_moves_policy_surprise_tolerance: f64,
    pub search_factor_after_one_pass: f64,
    pub search_factor_after_two_pass: f64,
    pub tree_reuse_carry_over_time_factor: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            num_threads: 1,

            max_visits: 1 << 50,
            max_playouts: 1 << 50,
            max_time: 1e20,
            max_visits_pondering: 1 << 50,
            max_playouts_pondering: 1 << 50,
            max_time_pondering: 1e20,

            win_loss_utility_factor: 1.0,
            no_result_utility_for_white: 0.0,
            static_score_utility_factor: 0.1,
            dynamic_score_utility_factor: 0.3,
            dynamic_score_center_zero_weight: 0.2,
            dynamic_score_center_scale: 0.75,
            draw_equivalent_wins_for_white: 0.5,

            cpuct_exploration: 1.0,
            cpuct_exploration_log: 0.45,
            cpuct_exploration_base: 500.0,
            cpuct_utility_stdev_prior: 0.40,
            cpuct_utility_stdev_prior_weight: 2.0,
            cpuct_utility_stdev_scale: 0.85,

            fpu_reduction_max: 0.2,
            fpu_loss_prop: 0.0,
            root_fpu_reduction_max: 0.1,
            root_fpu_loss_prop: 0.0,
            fpu_parent_weight: 0.0,

            value_weight_exponent: 0.25,
            use_noise_pruning: true,
            noise_prune_utility_scale: 0.15,
            noise_pruning_cap: 1e50,

            use_uncertainty: true,
            uncertainty_coeff: 0.25,
            uncertainty_exponent: 1.0,
            uncertainty_max_weight: 8.0,

            root_noise_enabled: false,
            root_dirichlet_noise_total_concentration: 10.83,
            root_dirichlet_noise_weight: 0.25,
            root_policy_temperature: 1.0,
            root_policy_temperature_early: 1.0,
            root_num_symmetries_to_sample: 1,
            root_desired_per_child_visits_coeff: 0.0,
            root_ending_bonus_points: 0.5,
            root_prune_useless_moves: true,
            root_symmetry_pruning: false,
            wide_root_noise: 0.0,

            chosen_move_temperature: 0.1,
            chosen_move_temperature_early: 0.5,
            chosen_move_temperature_halflife: 19.0,
            chosen_move_subtract: 0.0,
            chosen_move_prune: 1.0,

            num_virtual_losses_per_thread: 1.0,
            node_table_shards_power_of_two: 12,

            use_graph_search: true,
            graph_search_rep_bound: 11,
            graph_search_catch_up_leak_prob: 0.0,
            graph_search_catch_up_prop: 1.0,

            subtree_value_bias_factor: 0.45,
            subtree_value_bias_weight_exponent: 0.85,
            subtree_value_bias_free_prop: 0.8,
            subtree_value_bias_table_num_shards: 1024,

            avoid_repeated_pattern_utility: 0.0,

            anti_mirror: false,
            conservative_pass: true,
            futile_visits_threshold: 0.0,
            nn_policy_temperature: 1.0,

            lag_buffer: 0.0,
            overallocate_time_factor: 1.0,
            midgame_time_factor: 1.0,
            midgame_turn_peak_time: 130.0,
            endgame_turn_time_decay: 100.0,
            obvious_moves_time_factor: 1.0,
            obvious_moves_policy_entropy_tolerance: 0.30,
            obvious_moves_policy_surprise_tolerance: 0.15,
            search_factor_after_one_pass: 1.0,
            search_factor_after_two_pass: 1.0,
            tree_reuse_carry_over_time_factor: 0.0,
        }
    }
}

impl SearchParams {
    /// Small deterministic configuration for tests: single thread, no noise,
    /// no move-choice temperature.
    pub fn for_testing() -> SearchParams {
        SearchParams {
            num_threads: 1,
            max_visits: 100,
            chosen_move_temperature: 0.0,
            chosen_move_temperature_early: 0.0,
            root_noise_enabled: false,
            wide_root_noise: 0.0,
            ..SearchParams::default()
        }
    }

    pub fn with_threads(mut self, n: usize) -> SearchParams {
        self.num_threads = n;
        self
    }

    pub fn with_max_visits(mut self, n: i64) -> SearchParams {
        self.max_visits = n;
        self
    }

    pub fn with_max_playouts(mut self, n: i64) -> SearchParams {
        self.max_playouts = n;
        self
    }

    pub fn with_root_noise(mut self, enabled: bool) -> SearchParams {
        self.root_noise_enabled = enabled;
        self
    }

    pub fn with_graph_search(mut self, enabled: bool) -> SearchParams {
        self.use_graph_search = enabled;
        self
    }

    /// Total swing of utility between a certain white win and a certain white
    /// loss, as used for FPU and virtual-loss blending.
    pub fn utility_radius(&self) -> f64 {
        self.win_loss_utility_factor
            + self.static_score_utility_factor
            + self.dynamic_score_utility_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_radius() {
        let p = SearchParams::default();
        assert!((p.utility_radius() - 1.4).abs() < 1e-9);
    }

    #[test]
    fn builder_chain() {
        let p = SearchParams::for_testing().with_threads(4).with_max_visits(800);
        assert_eq!(p.num_threads, 4);
        assert_eq!(p.max_visits, 800);
    }

    #[test]
    fn testing_preset_is_deterministic() {
        let p = SearchParams::for_testing();
        assert_eq!(p.num_threads, 1);
        assert!(!p.root_noise_enabled);
        assert_eq!(p.chosen_move_temperature, 0.0);
    }
}
