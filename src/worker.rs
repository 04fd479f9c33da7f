//! Per-worker scratch state.
//!
//! Each worker owns a clone of the root position and replays moves onto it
//! while descending, so the shared tree never has to store board state.
//! Workers also accumulate retired evaluator outputs locally and hand them to
//! the search when their loop exits, keeping the cleanup mutex off the hot
//! path.

use std::collections::HashSet;

use rand_chacha::ChaCha20Rng;

use crate::game::{GameState, Move, Player};
use crate::hash::Hash128;
use crate::node::RetiredNNOutput;
use crate::stats::MoreChildStats;

pub(crate) struct SearchThread<G: GameState> {
    pub thread_idx: usize,
    /// Player to move at the position the worker is currently standing on.
    pub pla: Player,
    pub game: G,
    /// Moves played since the root in the current playout.
    pub moves_since_root: Vec<Move>,
    /// Incrementally-maintained graph hash of the current position.
    pub graph_hash: Hash128,
    pub rng: ChaCha20Rng,
    /// Scratch buffer for stats recomputation, sized to the policy.
    pub stats_buf: Vec<MoreChildStats>,
    /// Visit budget estimate this worker computed before its current descent;
    /// consumed by futile-visit pruning.
    pub upper_bound_visits_left: f64,
    /// Evaluator outputs this worker displaced, pending deferred cleanup.
    pub retired_nn_outputs: Vec<RetiredNNOutput>,
    /// Evaluator hashes this worker already warned about, so a cycle or bad
    /// transposition logs once per search rather than per playout.
    pub illegal_move_hashes: HashSet<Hash128>,
}

impl<G: GameState> SearchThread<G> {
    pub fn new(
        thread_idx: usize,
        root_pla: Player,
        root_game: G,
        root_graph_hash: Hash128,
        rng: ChaCha20Rng,
        policy_size: usize,
    ) -> SearchThread<G> {
        SearchThread {
            thread_idx,
            pla: root_pla,
            game: root_game,
            moves_since_root: Vec::with_capacity(64),
            graph_hash: root_graph_hash,
            rng,
            stats_buf: vec![MoreChildStats::default(); policy_size],
            upper_bound_visits_left: 1.0e30,
            retired_nn_outputs: Vec::with_capacity(8),
            illegal_move_hashes: HashSet::new(),
        }
    }

    /// Rewind to the root between playouts.
    pub fn reset_to_root(&mut self, root_pla: Player, root_game: &G, root_graph_hash: Hash128) {
        self.pla = root_pla;
        self.game = root_game.clone();
        self.graph_hash = root_graph_hash;
        self.moves_since_root.clear();
    }

    /// Last move on the worker's path, falling back to the tail of the root
    /// history.
    pub fn prev_move(&self, root_moves: &[Move]) -> Option<Move> {
        self.moves_since_root.last().or_else(|| root_moves.last()).copied()
    }
}
