//! Concurrent Monte Carlo Tree Search driven by a neural-network evaluator.
//!
//! Many worker threads cooperatively grow one shared search tree — a DAG
//! under graph-search mode, where transposing lines of play meet at a single
//! node — rooted at a game position and guided by a PUCT-style selection
//! rule. The engine is generic over the game rules ([`GameState`]) and the
//! evaluator ([`Evaluator`]); both are treated as external collaborators.
//!
//! # Overview
//!
//! One playout is a descent from the root: at each node the worker selects
//! the child with the best exploration-adjusted utility, expanding a new
//! child when the policy prior justifies it, until it reaches a terminal
//! position or a node needing evaluation. The evaluator's output (policy
//! priors plus value statistics) is installed at the leaf and statistics are
//! recomputed up the path.
//!
//! The engineering weight is in the concurrency:
//!
//! - nodes advance through a monotone state machine (`UNEVALUATED →
//!   EVALUATING → EXPANDED0 → … → EXPANDED2`) with CAS transitions, so
//!   expansion never blocks readers;
//! - children live in tiered fixed-capacity arrays published by
//!   release-stores of the state word, so selection is lock-free;
//! - statistics are individually-atomic fields written under a per-node
//!   spinlock and coalesced by a dirty counter, so concurrent backups merge
//!   instead of queueing;
//! - transpositions resolve through a sharded node table keyed by 128-bit
//!   structural hashes, with per-edge visit accounting that lets an edge
//!   "catch up" to a transposed child instead of re-searching it;
//! - in-flight descents leave virtual losses behind them to spread threads
//!   across the tree.
//!
//! Between searches the tree is reused: [`Search::make_move`] promotes the
//! played child to the new root and mark-and-sweeps the node table.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tengen::{ConstEvaluator, GridGo, Player, Search, SearchParams};
//!
//! let game = GridGo::new(5, 5, 0.5);
//! let evaluator = Arc::new(ConstEvaluator::new(5, 5));
//! let params = SearchParams::for_testing().with_max_visits(200);
//! let mut search = Search::new(params, evaluator, game, "example-seed");
//!
//! let loc = search.run_whole_search_and_get_move(Player::Black).unwrap();
//! assert!(loc != tengen::Loc::NULL);
//! let values = search.get_root_values().unwrap();
//! assert!(values.visits >= 200);
//! ```

pub mod bias;
pub mod config;
pub mod eval;
pub mod game;
pub mod games;
pub mod hash;
pub mod math;
pub mod node;
pub mod report;
pub mod search;
pub mod stats;
pub mod table;
pub mod timecontrol;

mod backup;
mod driver;
mod gc;
mod playout;
mod root;
mod select;
mod worker;

pub use config::SearchParams;
pub use eval::{ConstEvaluator, EvalError, EvalParams, Evaluator, NNOutput};
pub use game::{GameState, Loc, Move, Outcome, Player};
pub use games::gridgo::GridGo;
pub use hash::Hash128;
pub use report::{PlaySelectionValue, ReportedSearchValues, RootChildSummary};
pub use search::{Search, SearchError};
pub use timecontrol::TimeControls;
