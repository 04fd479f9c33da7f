//! Evaluator interface: position in, policy + value statistics out.
//!
//! The engine treats the evaluator as an external collaborator behind the
//! [`Evaluator`] trait. A neural network is the intended implementation; the
//! [`ConstEvaluator`] here returns a uniform policy over legal moves with a
//! fixed value and exists so the search can be exercised without a model.

use thiserror::Error;

use crate::game::{GameState, Loc, Player};
use crate::hash::{hash_of_bytes, Hash128};

/// Errors surfaced by an evaluator.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("board {0}x{1} exceeds evaluator dimensions {2}x{3}")]
    BoardTooLarge(usize, usize, usize, usize),
}

/// Per-query knobs passed down to the evaluator.
#[derive(Debug, Clone)]
pub struct EvalParams {
    /// Board symmetry index to evaluate under, if the evaluator supports
    /// symmetries. `None` lets the evaluator pick (or skip) one.
    pub symmetry: Option<usize>,
    /// Bypass any evaluator-side cache for this query.
    pub skip_cache: bool,
    /// Request the ownership map.
    pub include_owner_map: bool,
    /// Treat a root pass as not ending the game when encoding history.
    pub conservative_pass: bool,
    /// How much of a draw counts as a white win, in [0,1].
    pub draw_equivalent_wins_for_white: f64,
    /// Softmax temperature applied to the raw policy.
    pub policy_temperature: f64,
}

impl Default for EvalParams {
    fn default() -> Self {
        EvalParams {
            symmetry: None,
            skip_cache: false,
            include_owner_map: false,
            conservative_pass: false,
            draw_equivalent_wins_for_white: 0.5,
            policy_temperature: 1.0,
        }
    }
}

/// One evaluation result. All values are from white's perspective.
///
/// The policy is indexed by evaluator position: `y * nn_x_len + x` for board
/// points and `nn_x_len * nn_y_len` for pass. Illegal moves carry a negative
/// policy value.
#[derive(Debug, Clone)]
pub struct NNOutput {
    pub nn_hash: Hash128,
    pub policy: Vec<f32>,
    /// Policy after root noise/temperature shaping, when present. Readers use
    /// [`NNOutput::policy_probs_maybe_noised`] so shaping is transparent.
    pub noised_policy: Option<Vec<f32>>,
    pub white_win_prob: f32,
    pub white_loss_prob: f32,
    pub white_no_result_prob: f32,
    pub white_score_mean: f32,
    pub white_score_mean_sq: f32,
    pub white_lead: f32,
    pub shortterm_winloss_error: f32,
    pub shortterm_score_error: f32,
    pub white_owner_map: Option<Vec<f32>>,
}

impl NNOutput {
    #[inline]
    pub fn policy_probs_maybe_noised(&self) -> &[f32] {
        match &self.noised_policy {
            Some(p) => p,
            None => &self.policy,
        }
    }

    /// Average several outputs of the same position (e.g. across sampled
    /// symmetries). Policies average componentwise; a move is kept legal only
    /// if legal in every sample.
    pub fn average(outputs: &[NNOutput]) -> NNOutput {
        assert!(!outputs.is_empty());
        let n = outputs.len() as f32;
        let policy_len = outputs[0].policy.len();
        let mut policy = vec![0.0f32; policy_len];
        for i in 0..policy_len {
            let mut sum = 0.0f32;
            let mut any_illegal = false;
            for out in outputs {
                if out.policy[i] < 0.0 {
                    any_illegal = true;
                } else {
                    sum += out.policy[i];
                }
            }
            policy[i] = if any_illegal { -1.0 } else { sum / n };
        }

        let owner_map = if outputs.iter().all(|o| o.white_owner_map.is_some()) {
            let len = outputs[0].white_owner_map.as_ref().unwrap().len();
            let mut avg = vec![0.0f32; len];
            for out in outputs {
                for (a, &v) in avg.iter_mut().zip(out.white_owner_map.as_ref().unwrap()) {
                    *a += v / n;
                }
            }
            Some(avg)
        } else {
            None
        };

        let mut hash = Hash128::ZERO;
        for out in outputs {
            hash = hash.combine(out.nn_hash);
        }

        NNOutput {
            nn_hash: hash,
            policy,
            noised_policy: None,
            white_win_prob: outputs.iter().map(|o| o.white_win_prob).sum::<f32>() / n,
            white_loss_prob: outputs.iter().map(|o| o.white_loss_prob).sum::<f32>() / n,
            white_no_result_prob: outputs.iter().map(|o| o.white_no_result_prob).sum::<f32>() / n,
            white_score_mean: outputs.iter().map(|o| o.white_score_mean).sum::<f32>() / n,
            white_score_mean_sq: outputs.iter().map(|o| o.white_score_mean_sq).sum::<f32>() / n,
            white_lead: outputs.iter().map(|o| o.white_lead).sum::<f32>() / n,
            shortterm_winloss_error: outputs.iter().map(|o| o.shortterm_winloss_error).sum::<f32>()
                / n,
            shortterm_score_error: outputs.iter().map(|o| o.shortterm_score_error).sum::<f32>() / n,
            white_owner_map: owner_map,
        }
    }
}

/// Trait for position evaluators.
pub trait Evaluator<G: GameState>: Send + Sync {
    /// Fixed evaluator board dimensions; boards larger than this are rejected
    /// at search start.
    fn nn_x_len(&self) -> usize;
    fn nn_y_len(&self) -> usize;

    fn policy_size(&self) -> usize {
        self.nn_x_len() * self.nn_y_len() + 1
    }

    /// Evaluate a position for the player to move.
    fn evaluate(&self, game: &G, next_pla: Player, params: &EvalParams)
        -> Result<NNOutput, EvalError>;

    /// Whether [`NNOutput::shortterm_winloss_error`] and friends are real
    /// estimates rather than zeros.
    fn supports_shortterm_error(&self) -> bool {
        false
    }

    /// Number of board symmetries the evaluator can evaluate under.
    fn num_symmetries(&self) -> usize {
        8
    }

    /// Pacing hook: block for roughly one evaluation's latency. Terminal-leaf
    /// backups call this so a thread that keeps hitting terminal positions
    /// cannot flood statistics while its peers wait on the evaluator.
    fn wait_for_next_eval(&self) {}
}

/// Map a board location to an evaluator policy index.
#[inline]
pub fn loc_to_pos(loc: Loc, board_x_size: usize, nn_x_len: usize, nn_y_len: usize) -> usize {
    if loc == Loc::PASS {
        nn_x_len * nn_y_len
    } else {
        let x = loc.x(board_x_size);
        let y = loc.y(board_x_size);
        y * nn_x_len + x
    }
}

/// Map an evaluator policy index back to a board location. Returns
/// [`Loc::NULL`] for positions outside the actual board.
#[inline]
pub fn pos_to_loc(
    pos: usize,
    board_x_size: usize,
    board_y_size: usize,
    nn_x_len: usize,
    nn_y_len: usize,
) -> Loc {
    if pos == nn_x_len * nn_y_len {
        return Loc::PASS;
    }
    let x = pos % nn_x_len;
    let y = pos / nn_x_len;
    if x >= board_x_size || y >= board_y_size {
        Loc::NULL
    } else {
        Loc::from_xy(x, y, board_x_size)
    }
}

/// Uniform-policy evaluator with a fixed value, for tests and benchmarks.
#[derive(Debug, Clone)]
pub struct ConstEvaluator {
    pub nn_x_len: usize,
    pub nn_y_len: usize,
    /// White-perspective win minus loss value in [-1, 1].
    pub white_value: f32,
    pub score_mean: f32,
    pub shortterm_errors: Option<(f32, f32)>,
}

impl ConstEvaluator {
    pub fn new(nn_x_len: usize, nn_y_len: usize) -> ConstEvaluator {
        ConstEvaluator {
            nn_x_len,
            nn_y_len,
            white_value: 0.0,
            score_mean: 0.0,
            shortterm_errors: None,
        }
    }

    pub fn with_value(mut self, white_value: f32) -> ConstEvaluator {
        self.white_value = white_value;
        self
    }
}

impl<G: GameState> Evaluator<G> for ConstEvaluator {
    fn nn_x_len(&self) -> usize {
        self.nn_x_len
    }

    fn nn_y_len(&self) -> usize {
        self.nn_y_len
    }

    fn evaluate(
        &self,
        game: &G,
        next_pla: Player,
        params: &EvalParams,
    ) -> Result<NNOutput, EvalError> {
        if game.x_size() > self.nn_x_len || game.y_size() > self.nn_y_len {
            return Err(EvalError::BoardTooLarge(
                game.x_size(),
                game.y_size(),
                self.nn_x_len,
                self.nn_y_len,
            ));
        }

        let policy_size = self.nn_x_len * self.nn_y_len + 1;
        let mut policy = vec![-1.0f32; policy_size];
        let mut num_legal = 0usize;
        for y in 0..game.y_size() {
            for x in 0..game.x_size() {
                let loc = Loc::from_xy(x, y, game.x_size());
                if game.is_legal(loc, next_pla) {
                    policy[loc_to_pos(loc, game.x_size(), self.nn_x_len, self.nn_y_len)] = 0.0;
                    num_legal += 1;
                }
            }
        }
        if game.is_legal(Loc::PASS, next_pla) {
            policy[policy_size - 1] = 0.0;
            num_legal += 1;
        }
        let p = 1.0 / num_legal.max(1) as f32;
        for v in policy.iter_mut() {
            if *v >= 0.0 {
                *v = p;
            }
        }

        let win = 0.5 + 0.5 * self.white_value;
        let owner_map = if params.include_owner_map {
            Some(vec![0.0f32; self.nn_x_len * self.nn_y_len])
        } else {
            None
        };
        let (st_wl, st_sc) = self.shortterm_errors.unwrap_or((0.0, 0.0));

        Ok(NNOutput {
            nn_hash: game.pos_hash().combine(hash_of_bytes(b"const-eval")).mix_u64(match next_pla {
                Player::Black => 0,
                Player::White => 1,
            }),
            policy,
            noised_policy: None,
            white_win_prob: win,
            white_loss_prob: 1.0 - win,
            white_no_result_prob: 0.0,
            white_score_mean: self.score_mean,
            white_score_mean_sq: self.score_mean * self.score_mean,
            white_lead: self.score_mean,
            shortterm_winloss_error: st_wl,
            shortterm_score_error: st_sc,
            white_owner_map: owner_map,
        })
    }

    fn supports_shortterm_error(&self) -> bool {
        self.shortterm_errors.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::gridgo::GridGo;

    #[test]
    fn const_evaluator_uniform_over_legal() {
        let game = GridGo::new(3, 3, 0.5);
        let eval = ConstEvaluator::new(3, 3);
        let out = Evaluator::<GridGo>::evaluate(&eval, &game, Player::Black, &EvalParams::default())
            .unwrap();

        // 9 board points + pass all legal on an empty board.
        let legal: Vec<f32> = out.policy.iter().copied().filter(|&p| p >= 0.0).collect();
        assert_eq!(legal.len(), 10);
        for p in legal {
            assert!((p - 0.1).abs() < 1e-6);
        }
    }

    #[test]
    fn board_too_large_is_rejected() {
        let game = GridGo::new(5, 5, 0.5);
        let eval = ConstEvaluator::new(3, 3);
        let res =
            Evaluator::<GridGo>::evaluate(&eval, &game, Player::Black, &EvalParams::default());
        assert!(res.is_err());
    }

    #[test]
    fn pos_loc_roundtrip() {
        let (bx, by, nx, ny) = (5, 4, 9, 9);
        for y in 0..by {
            for x in 0..bx {
                let loc = Loc::from_xy(x, y, bx);
                let pos = loc_to_pos(loc, bx, nx, ny);
                assert_eq!(pos_to_loc(pos, bx, by, nx, ny), loc);
            }
        }
        assert_eq!(pos_to_loc(loc_to_pos(Loc::PASS, bx, nx, ny), bx, by, nx, ny), Loc::PASS);
        // A position on the evaluator grid but off the board maps to NULL.
        assert_eq!(pos_to_loc(8, bx, by, nx, ny), Loc::NULL);
    }

    #[test]
    fn average_keeps_only_jointly_legal_moves() {
        let base = NNOutput {
            nn_hash: Hash128::ZERO,
            policy: vec![0.5, 0.5, -1.0],
            noised_policy: None,
            white_win_prob: 0.6,
            white_loss_prob: 0.4,
            white_no_result_prob: 0.0,
            white_score_mean: 1.0,
            white_score_mean_sq: 1.0,
            white_lead: 1.0,
            shortterm_winloss_error: 0.0,
            shortterm_score_error: 0.0,
            white_owner_map: None,
        };
        let mut other = base.clone();
        other.policy = vec![0.25, -1.0, 0.75];
        other.white_win_prob = 0.4;
        other.white_loss_prob = 0.6;

        let avg = NNOutput::average(&[base, other]);
        assert!((avg.policy[0] - 0.375).abs() < 1e-6);
        assert!(avg.policy[1] < 0.0);
        assert!(avg.policy[2] < 0.0);
        assert!((avg.white_win_prob - 0.5).abs() < 1e-6);
    }
}
