//! The search handle: owns the tree, the node table, and all search state.
//!
//! One `Search` plays one game. Callers feed it positions and moves, run
//! searches, and read results back out. Every setter that changes what the
//! tree's statistics mean clears the search; `make_move` instead tries to
//! promote the matching root child and garbage-collect the rest.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::debug;

use crate::bias::{PatternBonusTable, SubtreeValueBiasTable};
use crate::config::SearchParams;
use crate::eval::{EvalError, EvalParams, Evaluator};
use crate::game::{mirror_loc, GameState, Loc, Move, Player};
use crate::hash::{hash_of_bytes, Hash128};
use crate::math::DistributionTable;
use crate::node::{RetiredNNOutput, SearchNode};
use crate::table::{MutexPool, NodeTable};
use crate::worker::SearchThread;

/// Mixed into a node's table key when terminal detection is suppressed, so a
/// forced-non-terminal node never transposes with the ordinary node for the
/// same position.
const FORCE_NON_TERMINAL_HASH: Hash128 = Hash128::new(0x81ad3e5f0d2bc441, 0xe6c92f7a5b13d98e);

/// Errors surfaced from a whole search. Race losses inside playouts are not
/// errors; they are retried internally.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("bad configuration: {0}")]
    BadConfiguration(String),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Context captured just before a child move is played, used to key the
/// bias and pattern tables for a newly allocated node.
pub(crate) struct NewChildContext {
    pub move_pla: Player,
    pub move_loc: Loc,
    pub prev_move_loc: Loc,
    /// Board hash before the move was played.
    pub board_hash_before: Hash128,
    /// Local pattern hash around the move, before it was played.
    pub pattern_hash: Hash128,
}

pub struct Search<G: GameState, E: Evaluator<G>> {
    pub(crate) params: SearchParams,

    pub(crate) root_pla: Player,
    pub(crate) root_game: G,
    /// Game history leading to the root, oldest first.
    pub(crate) root_moves: Vec<Move>,
    /// Turn number of the first move in `root_moves`.
    pub(crate) initial_turn_number: usize,
    pub(crate) root_graph_hash: Hash128,
    pub(crate) root_hint_loc: Loc,

    /// Per-location search-depth thresholds below which a move may not be
    /// searched, one per player. Indexed by board point, with pass last.
    pub(crate) avoid_move_until_by_loc_black: Vec<i32>,
    pub(crate) avoid_move_until_by_loc_white: Vec<i32>,

    pub(crate) root_prune_only_symmetries: Vec<usize>,
    pub(crate) root_sym_dup_loc: Vec<bool>,
    pub(crate) root_safe_area: Vec<Option<Player>>,

    pub(crate) recent_score_center: f64,
    pub(crate) mirroring_pla: Option<Player>,
    pub(crate) mirror_advantage: f64,
    pub(crate) mirror_center_symmetry_error: f64,
    pub(crate) always_include_owner_map: bool,

    pub(crate) num_searches_begun: u64,
    pub(crate) search_node_age: u32,
    pub(crate) pla_search_is_for: Option<Player>,
    pub(crate) pla_search_is_for_last_search: Option<Player>,
    pub(crate) last_search_num_playouts: i64,
    pub(crate) effective_search_time_carried_over: f64,

    pub(crate) rand_seed: String,
    pub(crate) non_search_rng: ChaCha20Rng,
    pub(crate) value_weight_distribution: DistributionTable,

    pub(crate) root_node: Option<Box<SearchNode>>,
    pub(crate) node_table: NodeTable,
    pub(crate) mutex_pool: MutexPool,

    pub(crate) evaluator: Arc<E>,
    pub(crate) nn_x_len: usize,
    pub(crate) nn_y_len: usize,
    pub(crate) policy_size: usize,

    pub(crate) subtree_value_bias_table: Option<SubtreeValueBiasTable>,
    pub(crate) pattern_bonus_table: Option<PatternBonusTable>,
    pub(crate) external_pattern_bonus_table: Option<Arc<PatternBonusTable>>,
    /// Pattern hashes of moves actually played in the game, accumulated by
    /// `make_move`; feeds the repeated-pattern penalty.
    pub(crate) game_pattern_hashes: Vec<(Player, Hash128)>,

    /// Evaluator outputs displaced during search, merged from workers and
    /// freed between searches.
    pub(crate) retired_nn_outputs: Mutex<Vec<RetiredNNOutput>>,
}

impl<G: GameState, E: Evaluator<G>> Search<G, E> {
    pub fn new(params: SearchParams, evaluator: Arc<E>, game: G, rand_seed: &str) -> Search<G, E> {
        let nn_x_len = evaluator.nn_x_len();
        let nn_y_len = evaluator.nn_y_len();
        let policy_size = nn_x_len * nn_y_len + 1;
        let avoid_len = game.x_size() * game.y_size() + 1;
        let node_table = NodeTable::new(params.node_table_shards_power_of_two);
        let mutex_pool = MutexPool::new(node_table.num_shards());
        let non_search_seed = hash_of_bytes(format!("{rand_seed}$nonSearchRand").as_bytes()).hash0;

        Search {
            params,
            root_pla: game.next_player(),
            root_game: game,
            root_moves: Vec::new(),
            initial_turn_number: 0,
            root_graph_hash: Hash128::ZERO,
            root_hint_loc: Loc::NULL,
            avoid_move_until_by_loc_black: vec![0; avoid_len],
            avoid_move_until_by_loc_white: vec![0; avoid_len],
            root_prune_only_symmetries: Vec::new(),
            root_sym_dup_loc: Vec::new(),
            root_safe_area: Vec::new(),
            recent_score_center: 0.0,
            mirroring_pla: None,
            mirror_advantage: 0.0,
            mirror_center_symmetry_error: 1.0e10,
            always_include_owner_map: false,
            num_searches_begun: 0,
            search_node_age: 0,
            pla_search_is_for: None,
            pla_search_is_for_last_search: None,
            last_search_num_playouts: 0,
            effective_search_time_carried_over: 0.0,
            rand_seed: rand_seed.to_string(),
            non_search_rng: ChaCha20Rng::seed_from_u64(non_search_seed),
            value_weight_distribution: DistributionTable::value_weight_table(),
            root_node: None,
            node_table,
            mutex_pool,
            evaluator,
            nn_x_len,
            nn_y_len,
            policy_size,
            subtree_value_bias_table: None,
            pattern_bonus_table: None,
            external_pattern_bonus_table: None,
            game_pattern_hashes: Vec::new(),
            retired_nn_outputs: Mutex::new(Vec::new()),
        }
    }

    // ---- simple accessors ------------------------------------------------

    pub fn root_pla(&self) -> Player {
        self.root_pla
    }

    pub fn root_game(&self) -> &G {
        &self.root_game
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn root_visits(&self) -> i64 {
        match &self.root_node {
            Some(node) => node.stats.visits.load(Ordering::Acquire),
            None => 0,
        }
    }

    pub fn has_root(&self) -> bool {
        self.root_node.is_some()
    }

    pub fn node_table_len(&self) -> usize {
        self.node_table.len()
    }

    pub fn last_search_num_playouts(&self) -> i64 {
        self.last_search_num_playouts
    }

    /// The opponent currently judged to be mirroring, if any.
    pub fn mirroring_player(&self) -> Option<Player> {
        self.mirroring_pla
    }

    pub(crate) fn board_area(&self) -> f64 {
        (self.root_game.x_size() * self.root_game.y_size()) as f64
    }

    // ---- position / parameter setters ------------------------------------

    /// Install a new root position with its game history. Clears the search.
    pub fn set_position(&mut self, pla: Player, game: G, history: Vec<Move>) {
        self.clear_search();
        self.initial_turn_number = 0;
        self.root_pla = pla;
        self.root_game = game;
        self.root_moves = history;
        self.pla_search_is_for = None;
        self.game_pattern_hashes.clear();
        let avoid_len = self.root_game.x_size() * self.root_game.y_size() + 1;
        self.avoid_move_until_by_loc_black = vec![0; avoid_len];
        self.avoid_move_until_by_loc_white = vec![0; avoid_len];
    }

    /// Forget the move history but keep the position, and set the player to
    /// move. Clears the search.
    pub fn set_player_and_clear_history(&mut self, pla: Player) {
        self.clear_search();
        self.initial_turn_number += self.root_moves.len();
        self.root_moves.clear();
        self.game_pattern_hashes.clear();
        self.root_pla = pla;
        self.pla_search_is_for = None;
        for v in self.avoid_move_until_by_loc_black.iter_mut() {
            *v = 0;
        }
        for v in self.avoid_move_until_by_loc_white.iter_mut() {
            *v = 0;
        }
    }

    pub fn set_player_if_new(&mut self, pla: Player) {
        if pla != self.root_pla {
            self.set_player_and_clear_history(pla);
        }
    }

    pub fn set_komi_if_new(&mut self, komi: f32) {
        if self.root_game.komi() != komi {
            self.clear_search();
            self.root_game.set_komi(komi);
        }
    }

    /// Per-location minimum search depths before a move becomes searchable.
    pub fn set_avoid_moves_until_by_loc(&mut self, black: Vec<i32>, white: Vec<i32>) {
        if self.avoid_move_until_by_loc_black == black
            && self.avoid_move_until_by_loc_white == white
        {
            return;
        }
        self.clear_search();
        self.avoid_move_until_by_loc_black = black;
        self.avoid_move_until_by_loc_white = white;
    }

    /// Bias the search toward one root move. Setting a new hint clears the
    /// search so the hint takes effect in every root evaluation.
    pub fn set_root_hint_loc(&mut self, loc: Loc) {
        if loc != Loc::NULL && self.root_hint_loc != loc {
            self.clear_search();
        }
        self.root_hint_loc = loc;
    }

    pub fn set_always_include_owner_map(&mut self, b: bool) {
        if !self.always_include_owner_map && b {
            self.clear_search();
        }
        self.always_include_owner_map = b;
    }

    pub fn set_root_symmetry_prune_only(&mut self, symmetries: Vec<usize>) {
        if self.root_prune_only_symmetries == symmetries {
            return;
        }
        self.clear_search();
        self.root_prune_only_symmetries = symmetries;
    }

    pub fn set_params(&mut self, params: SearchParams) {
        self.clear_search();
        self.params = params;
    }

    /// Swap parameters without invalidating the tree. Only safe for changes
    /// that do not reinterpret accumulated statistics (thread count, caps).
    pub fn set_params_no_clearing(&mut self, params: SearchParams) {
        self.params = params;
    }

    pub fn set_external_pattern_bonus_table(&mut self, table: Option<Arc<PatternBonusTable>>) {
        let same = match (&self.external_pattern_bonus_table, &table) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if same {
            return;
        }
        self.clear_search();
        self.external_pattern_bonus_table = table;
    }

    // ---- clearing / tree reuse -------------------------------------------

    /// Drop the whole tree and all cached cleanup state.
    pub fn clear_search(&mut self) {
        self.effective_search_time_carried_over = 0.0;
        self.delete_all_table_nodes_multithreaded();
        // Root is not stored in the node table.
        self.root_node = None;
        self.clear_retired_nn_outputs();
        self.search_node_age = 0;
    }

    pub fn is_legal_tolerant(&self, loc: Loc, pla: Player) -> bool {
        self.root_game.is_legal_tolerant(loc, pla)
    }

    pub fn is_legal_strict(&self, loc: Loc, pla: Player) -> bool {
        pla == self.root_pla && self.root_game.is_legal(loc, pla)
    }

    /// Advance the root by one move. If the move matches a root child that
    /// already has an evaluator output, that child's subtree is kept and
    /// everything else is swept; otherwise the search is cleared. Returns
    /// false (and changes nothing) if the move is illegal.
    pub fn make_move(&mut self, loc: Loc, pla: Player) -> bool {
        if !self.is_legal_tolerant(loc, pla) {
            return false;
        }
        if pla != self.root_pla {
            self.set_player_and_clear_history(pla);
        }

        if self.root_node.is_some() {
            let found: Option<*mut SearchNode> = {
                let root = self.root_node.as_ref().unwrap();
                let children = root.children();
                let mut found = None;
                for c in children {
                    let child = c.raw();
                    if child.is_null() {
                        break;
                    }
                    if found.is_none() && c.move_loc_relaxed() == loc {
                        // Keep the child only if it has an evaluator output;
                        // a bare allocation is not worth preserving.
                        let child_ref = unsafe { &*child };
                        if child_ref.has_nn_output() {
                            found = Some(child);
                        }
                    }
                }
                found
            };

            match found {
                Some(child_ptr) => {
                    let child = unsafe { &*child_ptr };
                    // Scale carried-over think time by how much of the tree
                    // survives.
                    {
                        let root = self.root_node.as_ref().unwrap();
                        let root_visits = root.stats.visits.load(Ordering::Acquire);
                        let child_visits = child.stats.visits.load(Ordering::Acquire);
                        let proportion = if root_visits > 0 {
                            (child_visits as f64 / root_visits as f64).min(1.0)
                        } else {
                            0.0
                        };
                        self.effective_search_time_carried_over = self
                            .effective_search_time_carried_over
                            * proportion
                            * self.params.tree_reuse_carry_over_time_factor;
                    }

                    // Promote a copy so the root stays out of the node table.
                    let new_root = Box::new(child.clone_for_root(true));
                    let old_root = self.root_node.replace(new_root);
                    self.mark_reachable_any_order();
                    drop(old_root);
                    self.delete_old_table_nodes_and_unwind_bias();
                }
                None => self.clear_search(),
            }
        }

        // Record the pattern of the move actually played, for the
        // repeated-pattern penalty, before the board changes under it.
        self.game_pattern_hashes.push((pla, self.root_game.local_pattern_hash(pla, loc)));

        self.root_game.play_assume_legal(loc, pla);
        self.root_moves.push(Move::new(pla, loc));
        self.root_pla = pla.opp();

        // Avoid-move constraints are tied to the position they were given
        // for; the caller must respecify them.
        for v in self.avoid_move_until_by_loc_black.iter_mut() {
            *v = 0;
        }
        for v in self.avoid_move_until_by_loc_white.iter_mut() {
            *v = 0;
        }

        // Deeper in the tree a root pass was treated as game-ending; once it
        // actually is one at the root under conservative pass, those nodes
        // are wrong, so start over.
        if self.params.conservative_pass && self.root_game.pass_would_end_game(self.root_pla) {
            self.clear_search();
        }

        true
    }

    // ---- utility arithmetic ----------------------------------------------

    pub(crate) fn get_result_utility(&self, win_loss_value: f64, no_result_value: f64) -> f64 {
        win_loss_value * self.params.win_loss_utility_factor
            + no_result_value * self.params.no_result_utility_for_white
    }

    pub(crate) fn get_score_utility(&self, score_mean: f64, score_mean_sq: f64) -> f64 {
        let stdev = crate::math::stdev_of(score_mean, score_mean_sq);
        let area = self.board_area();
        let static_value = crate::math::expected_score_value(score_mean, stdev, 0.0, 2.0, area);
        let dynamic_value = crate::math::expected_score_value(
            score_mean,
            stdev,
            self.recent_score_center,
            self.params.dynamic_score_center_scale,
            area,
        );
        static_value * self.params.static_score_utility_factor
            + dynamic_value * self.params.dynamic_score_utility_factor
    }

    pub(crate) fn get_score_utility_diff(
        &self,
        score_mean: f64,
        score_mean_sq: f64,
        delta: f64,
    ) -> f64 {
        self.get_score_utility(score_mean + delta, score_mean_sq + delta * (2.0 * score_mean + delta))
            - self.get_score_utility(score_mean, score_mean_sq)
    }

    /// d(score utility)/d(score), ignoring variance effects.
    pub(crate) fn get_approx_score_utility_derivative(&self, score_mean: f64) -> f64 {
        let area = self.board_area();
        let static_d = crate::math::score_value_derivative(score_mean, 0.0, 2.0, area);
        let dynamic_d = crate::math::score_value_derivative(
            score_mean,
            self.recent_score_center,
            self.params.dynamic_score_center_scale,
            area,
        );
        static_d * self.params.static_score_utility_factor
            + dynamic_d * self.params.dynamic_score_utility_factor
    }

    pub(crate) fn get_result_utility_from_nn(&self, out: &crate::eval::NNOutput) -> f64 {
        self.get_result_utility(
            (out.white_win_prob - out.white_loss_prob) as f64,
            out.white_no_result_prob as f64,
        )
    }

    pub(crate) fn get_utility_from_nn(&self, out: &crate::eval::NNOutput) -> f64 {
        self.get_result_utility_from_nn(out)
            + self.get_score_utility(out.white_score_mean as f64, out.white_score_mean_sq as f64)
    }

    pub(crate) fn get_pattern_bonus(&self, hash: Hash128, prev_move_pla: Player) -> f64 {
        match (&self.pattern_bonus_table, self.pla_search_is_for) {
            (Some(table), Some(pla)) if pla == prev_move_pla => table.get_bonus(hash),
            _ => 0.0,
        }
    }

    /// Blend from an early-game value toward a late-game value with the given
    /// halflife in (19x19-equivalent) turns.
    pub(crate) fn interpolate_early(&self, halflife: f64, early_value: f64, value: f64) -> f64 {
        let raw_halflives = (self.initial_turn_number + self.root_moves.len()) as f64 / halflife;
        let halflives = raw_halflives * 19.0 / self.board_area().sqrt();
        value + (early_value - value) * 0.5f64.powf(halflives)
    }

    // ---- worker plumbing -------------------------------------------------

    pub(crate) fn make_search_thread(&self, thread_idx: usize) -> SearchThread<G> {
        let seed = hash_of_bytes(self.rand_seed.as_bytes())
            .mix_u64(thread_idx as u64)
            .combine(self.root_game.pos_hash())
            .mix_u64(self.root_moves.len() as u64)
            .mix_u64(self.num_searches_begun)
            .hash0;
        SearchThread::new(
            thread_idx,
            self.root_pla,
            self.root_game.clone(),
            self.root_graph_hash,
            ChaCha20Rng::seed_from_u64(seed),
            self.policy_size,
        )
    }

    pub(crate) fn transfer_retired_nn_outputs(&self, thread: &mut SearchThread<G>) {
        if thread.retired_nn_outputs.is_empty() {
            return;
        }
        let mut retired = self.retired_nn_outputs.lock().unwrap();
        retired.append(&mut thread.retired_nn_outputs);
    }

    pub(crate) fn clear_retired_nn_outputs(&mut self) {
        self.retired_nn_outputs.lock().unwrap().clear();
    }

    pub(crate) fn create_mutex_idx(&self, rng: &mut ChaCha20Rng) -> u32 {
        rng.gen::<u32>() & (self.mutex_pool.num_mutexes() as u32 - 1)
    }

    pub(crate) fn avoid_index(&self, loc: Loc) -> usize {
        let area = self.root_game.x_size() * self.root_game.y_size();
        if loc == Loc::PASS {
            area
        } else {
            loc.0 as usize
        }
    }

    pub(crate) fn avoid_move_until_by_loc(&self, pla: Player) -> &[i32] {
        match pla {
            Player::Black => &self.avoid_move_until_by_loc_black,
            Player::White => &self.avoid_move_until_by_loc_white,
        }
    }

    // ---- node allocation -------------------------------------------------

    /// Find or create the node for the position the worker just moved into.
    ///
    /// Under graph search the key is the structural hash, so transpositions
    /// collapse to one node; under tree search a fresh 128-bit random keeps
    /// every edge distinct. The node's bias entry and pattern hash are set up
    /// under the shard mutex, before any other thread can observe the node.
    pub(crate) fn allocate_or_find_node(
        &self,
        thread: &mut SearchThread<G>,
        next_pla: Player,
        force_non_terminal: bool,
        ctx: NewChildContext,
    ) -> *mut SearchNode {
        let child_hash = if self.params.use_graph_search {
            let mut h = thread.graph_hash;
            if force_non_terminal {
                h ^= FORCE_NON_TERMINAL_HASH;
            }
            h
        } else {
            thread.game.pos_hash()
                ^ Hash128::new(thread.rng.gen::<u64>(), thread.rng.gen::<u64>())
        };

        let shard_idx = self.node_table.shard_index(child_hash);
        let mut shard = self.node_table.lock_shard(shard_idx);

        if let Some(existing) = shard.get_mut(&child_hash) {
            return &mut **existing as *mut SearchNode;
        }

        let mutex_idx = self.create_mutex_idx(&mut thread.rng);
        let mut node = Box::new(SearchNode::new(next_pla, force_non_terminal, mutex_idx));

        // Bias/pattern wiring happens before insertion: these fields are not
        // atomic, so they must be complete before the node is reachable.
        if self.params.subtree_value_bias_factor != 0.0 {
            if let Some(table) = &self.subtree_value_bias_table {
                if ctx.prev_move_loc != Loc::NULL {
                    node.bias_handle = Some(table.get(
                        ctx.move_pla,
                        ctx.prev_move_loc,
                        ctx.move_loc,
                        ctx.board_hash_before,
                    ));
                }
            }
        }
        if self.pattern_bonus_table.is_some() {
            node.pattern_bonus_hash = ctx.pattern_hash;
        }

        let ptr = &mut *node as *mut SearchNode;
        shard.insert(child_hash, node);
        ptr
    }

    // ---- search preparation ----------------------------------------------

    /// Prepare state for a new search: validate configuration, refresh
    /// root-derived values, rebuild bonus tables, filter stale root children,
    /// and advance the node age epoch.
    pub(crate) fn begin_search(&mut self, pondering: bool) -> Result<(), SearchError> {
        if self.root_game.x_size() > self.nn_x_len || self.root_game.y_size() > self.nn_y_len {
            return Err(SearchError::BadConfiguration(format!(
                "board {}x{} exceeds evaluator dimensions {}x{}",
                self.root_game.x_size(),
                self.root_game.y_size(),
                self.nn_x_len,
                self.nn_y_len
            )));
        }
        if self.params.num_threads == 0 {
            return Err(SearchError::BadConfiguration("num_threads must be >= 1".to_string()));
        }

        self.num_searches_begun += 1;

        // Headroom for the age epoch counter.
        if self.search_node_age > 0x3FFF_FFFF {
            self.clear_search();
        }

        if !pondering {
            self.pla_search_is_for = Some(self.root_pla);
        }
        if self.pla_search_is_for.is_none() {
            self.pla_search_is_for = Some(self.root_pla.opp());
        }

        if self.pla_search_is_for_last_search != self.pla_search_is_for {
            // Pattern bonuses are one-sided; a tree built for the other side
            // has the wrong playout distribution baked in.
            if self.params.avoid_repeated_pattern_utility != 0.0
                || self.external_pattern_bonus_table.is_some()
            {
                self.clear_search();
            }
        }
        self.pla_search_is_for_last_search = self.pla_search_is_for;

        self.clear_retired_nn_outputs();
        self.compute_root_values()?;

        if self.params.subtree_value_bias_factor != 0.0
            && self.subtree_value_bias_table.is_none()
            && !(self.params.anti_mirror && self.mirroring_pla.is_some())
        {
            self.subtree_value_bias_table =
                Some(SubtreeValueBiasTable::new(self.params.subtree_value_bias_table_num_shards));
        }

        // Rebuild pattern bonuses from scratch each search.
        self.pattern_bonus_table = None;
        if self.params.avoid_repeated_pattern_utility != 0.0
            || self.external_pattern_bonus_table.is_some()
        {
            let mut table = match &self.external_pattern_bonus_table {
                Some(ext) => (**ext).clone(),
                None => PatternBonusTable::new(),
            };
            if self.params.avoid_repeated_pattern_utility != 0.0 {
                let pla = self.pla_search_is_for.unwrap();
                let bonus = match pla {
                    Player::White => -self.params.avoid_repeated_pattern_utility,
                    Player::Black => self.params.avoid_repeated_pattern_utility,
                };
                for &(move_pla, hash) in &self.game_pattern_hashes {
                    if move_pla == pla {
                        table.add_bonus(hash, bonus);
                    }
                }
            }
            self.pattern_bonus_table = Some(table);
            if let Some(root) = &mut self.root_node {
                // The root position was already reached; no bonus on itself.
                root.pattern_bonus_hash = Hash128::ZERO;
            }
        }

        self.root_sym_dup_loc = if self.params.root_symmetry_pruning {
            self.root_game.symmetry_duplicate_locs(&self.root_prune_only_symmetries)
        } else {
            Vec::new()
        };

        if self.root_node.is_none() {
            // The root lives outside the table: it can never transpose, never
            // participate in a cycle, and never ends the game early.
            let mutex_idx =
                self.non_search_rng.gen::<u32>() & (self.mutex_pool.num_mutexes() as u32 - 1);
            self.root_node = Some(Box::new(SearchNode::new(self.root_pla, true, mutex_idx)));
        } else {
            self.filter_and_refresh_root_children();
        }

        if self.params.subtree_value_bias_factor != 0.0 {
            if let Some(table) = &self.subtree_value_bias_table {
                table.clear_unused_synchronous();
            }
        }

        // Everything currently in the tree is now "old" for the purposes of
        // refreshing root evaluator outputs.
        self.search_node_age += 1;

        debug!(
            searches_begun = self.num_searches_begun,
            table_nodes = self.node_table.len(),
            root_visits = self.root_visits(),
            "search prepared"
        );
        Ok(())
    }

    /// Refresh values derived from the root position: safe territory, the
    /// dynamic score center, the root graph hash, and mirror detection.
    fn compute_root_values(&mut self) -> Result<(), SearchError> {
        self.root_safe_area = self.root_game.safe_territory();

        // Score center: prefer the tree's converged estimate, else ask the
        // evaluator directly.
        let mut expected_score = None;
        if let Some(root) = &self.root_node {
            let visits = root.stats.visits.load(Ordering::Acquire);
            let weight = root.stats.weight_sum.load(Ordering::Acquire);
            if visits > 0 && weight > 0.0 {
                expected_score = Some(root.stats.score_mean_avg.load(Ordering::Acquire));
            }
        }
        let expected_score = match expected_score {
            Some(s) => s,
            None => {
                let eval_params = EvalParams {
                    include_owner_map: true,
                    conservative_pass: self.params.conservative_pass,
                    draw_equivalent_wins_for_white: self.params.draw_equivalent_wins_for_white,
                    policy_temperature: self.params.nn_policy_temperature,
                    ..EvalParams::default()
                };
                let out = self.evaluator.evaluate(&self.root_game, self.root_pla, &eval_params)?;
                out.white_score_mean as f64
            }
        };
        let cap = self.board_area().sqrt() * self.params.dynamic_score_center_scale;
        self.recent_score_center = (expected_score
            * (1.0 - self.params.dynamic_score_center_zero_weight))
            .clamp(expected_score - cap, expected_score + cap);

        self.root_graph_hash = if self.params.use_graph_search {
            self.root_game.graph_hash(self.root_pla, self.params.graph_search_rep_bound)
        } else {
            Hash128::ZERO
        };

        let was_mirroring = self.mirroring_pla;
        self.detect_mirroring();
        if was_mirroring != self.mirroring_pla {
            // The tree was searched under the other assumption.
            self.clear_search();
            self.subtree_value_bias_table = None;
        }
        Ok(())
    }

    /// Decide whether the opponent has been mirroring our moves, and measure
    /// how hard the mirror is to break.
    fn detect_mirroring(&mut self) {
        self.mirroring_pla = None;
        self.mirror_advantage = 0.0;
        self.mirror_center_symmetry_error = 1.0e10;
        if !self.params.anti_mirror {
            return;
        }

        let x_size = self.root_game.x_size();
        let y_size = self.root_game.y_size();
        let mut mirror_count = 0.0;
        let mut total_count = 0.0;
        let mut mirror_ewms = 0.0;
        let mut total_ewms = 0.0;
        let mut last_was_mirror = false;
        for i in 1..self.root_moves.len() {
            if self.root_moves[i].pla != self.root_pla {
                last_was_mirror = false;
                if self.root_moves[i].loc
                    == mirror_loc(self.root_moves[i - 1].loc, x_size, y_size)
                {
                    mirror_count += 1.0;
                    mirror_ewms += 1.0;
                    last_was_mirror = true;
                }
                total_count += 1.0;
                total_ewms += 1.0;
                mirror_ewms *= 0.75;
                total_ewms *= 0.75;
            }
        }
        if mirror_count >= 7.0 + 0.5 * total_count && mirror_ewms >= 0.45 * total_ewms && last_was_mirror
        {
            let mirroring = self.root_pla.opp();
            self.mirroring_pla = Some(mirroring);
            let komi = self.root_game.komi() as f64;
            self.mirror_advantage = match mirroring {
                Player::Black => -komi,
                Player::White => komi,
            };
        }

        if x_size >= 7 && y_size >= 7 {
            if let Some(mirroring) = self.mirroring_pla {
                let mut error = 0.0f64;
                let mut unmatched_mirror_stones = 0.0f64;
                let half_x = x_size / 2;
                let half_y = y_size / 2;
                for dy in -3i64..=3 {
                    for dx in -3i64..=3 {
                        let x = (half_x as i64 + dx) as usize;
                        let y = (half_y as i64 + dy) as usize;
                        let loc = Loc::from_xy(x, y, x_size);
                        let mloc = mirror_loc(loc, x_size, y_size);
                        if loc == mloc {
                            continue;
                        }
                        let c0 = self.root_game.stone_at(loc);
                        let c1 = self.root_game.stone_at(mloc);
                        if c0 == Some(mirroring.opp()) && c1 != Some(mirroring) {
                            error += 1.0;
                        }
                        if c0 == Some(mirroring) && c1.is_none() {
                            unmatched_mirror_stones += 1.0;
                        }
                    }
                }
                if error > 0.0 {
                    error += 0.2 * unmatched_mirror_stones;
                }
                if error >= 1.0 {
                    error = 0.5 * error * (1.0 + error);
                }
                self.mirror_center_symmetry_error = error;
            }
        }
    }
}
