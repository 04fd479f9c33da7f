//! A miniature Go-like placement game.
//!
//! Stones are placed on empty points and never captured. The game ends on two
//! consecutive passes or a full board, and is scored by stone count plus
//! komi. Deliberately simple, but it exercises everything the search needs:
//! passes, komi, transpositions (different move orders reaching the same
//! position), symmetry, and mirror play.

use crate::game::{GameState, Loc, Outcome, Player};
use crate::hash::{mix64, Hash128};

#[derive(Clone, Debug)]
pub struct GridGo {
    x_size: usize,
    y_size: usize,
    stones: Vec<Option<Player>>,
    next_pla: Player,
    consecutive_passes: u32,
    komi: f32,
}

impl GridGo {
    pub fn new(x_size: usize, y_size: usize, komi: f32) -> GridGo {
        assert!(x_size >= 1 && y_size >= 1);
        GridGo {
            x_size,
            y_size,
            stones: vec![None; x_size * y_size],
            next_pla: Player::Black,
            consecutive_passes: 0,
            komi,
        }
    }

    /// Place stones directly, for setting up positions in tests.
    pub fn with_stone(mut self, loc: Loc, pla: Player) -> GridGo {
        self.stones[loc.0 as usize] = Some(pla);
        self
    }

    pub fn with_next_player(mut self, pla: Player) -> GridGo {
        self.next_pla = pla;
        self
    }

    fn board_full(&self) -> bool {
        self.stones.iter().all(|s| s.is_some())
    }

    fn num_stones(&self, pla: Player) -> usize {
        self.stones.iter().filter(|&&s| s == Some(pla)).count()
    }

    fn stone_code(s: Option<Player>) -> u64 {
        match s {
            None => 0,
            Some(Player::Black) => 1,
            Some(Player::White) => 2,
        }
    }

    fn transformed_loc(&self, loc: Loc, symmetry: usize) -> Loc {
        let mut x = loc.x(self.x_size);
        let mut y = loc.y(self.x_size);
        if symmetry & 1 != 0 {
            x = self.x_size - 1 - x;
        }
        if symmetry & 2 != 0 {
            y = self.y_size - 1 - y;
        }
        if symmetry & 4 != 0 {
            std::mem::swap(&mut x, &mut y);
        }
        Loc::from_xy(x, y, self.x_size)
    }

    fn invariant_under(&self, symmetry: usize) -> bool {
        if symmetry & 4 != 0 && self.x_size != self.y_size {
            return false;
        }
        for i in 0..self.stones.len() {
            let loc = Loc(i as u16);
            if self.stones[i] != self.stones[self.transformed_loc(loc, symmetry).0 as usize] {
                return false;
            }
        }
        true
    }
}

impl GameState for GridGo {
    fn x_size(&self) -> usize {
        self.x_size
    }

    fn y_size(&self) -> usize {
        self.y_size
    }

    fn next_player(&self) -> Player {
        self.next_pla
    }

    // Moves stay legal even in a finished game: the search may probe past
    // the nominal end when the root is forced non-terminal.
    fn is_legal(&self, loc: Loc, _pla: Player) -> bool {
        if loc == Loc::PASS {
            return true;
        }
        loc.is_board()
            && (loc.0 as usize) < self.stones.len()
            && self.stones[loc.0 as usize].is_none()
    }

    fn stone_at(&self, loc: Loc) -> Option<Player> {
        if loc.is_board() && (loc.0 as usize) < self.stones.len() {
            self.stones[loc.0 as usize]
        } else {
            None
        }
    }

    fn play_assume_legal(&mut self, loc: Loc, pla: Player) {
        if loc == Loc::PASS {
            self.consecutive_passes += 1;
        } else {
            self.stones[loc.0 as usize] = Some(pla);
            self.consecutive_passes = 0;
        }
        self.next_pla = pla.opp();
    }

    fn is_finished(&self) -> bool {
        self.consecutive_passes >= 2 || self.board_full()
    }

    fn outcome(&self) -> Outcome {
        let score = self.num_stones(Player::White) as f64 - self.num_stones(Player::Black) as f64
            + self.komi as f64;
        let winner = if score > 0.0 {
            Some(Player::White)
        } else if score < 0.0 {
            Some(Player::Black)
        } else {
            None
        };
        Outcome::Scored { winner, white_minus_black: score }
    }

    fn pass_would_end_game(&self, _pla: Player) -> bool {
        self.consecutive_passes >= 1 || self.board_full()
    }

    fn komi(&self) -> f32 {
        self.komi
    }

    fn set_komi(&mut self, komi: f32) {
        self.komi = komi;
    }

    fn pos_hash(&self) -> Hash128 {
        let mut h = Hash128::new(
            mix64(self.x_size as u64 ^ (self.y_size as u64) << 32),
            mix64(0x9d2c5680 ^ self.x_size as u64),
        );
        for (i, &s) in self.stones.iter().enumerate() {
            if s.is_some() {
                h ^= Hash128::new(
                    mix64(i as u64 * 3 + Self::stone_code(s)),
                    mix64(i as u64 * 7 + Self::stone_code(s) * 5),
                );
            }
        }
        h
    }

    fn graph_hash(&self, next_pla: Player, rep_bound: usize) -> Hash128 {
        let passes = (self.consecutive_passes as usize).min(rep_bound) as u64;
        self.pos_hash()
            .mix_u64(match next_pla {
                Player::Black => 0x6b,
                Player::White => 0x77,
            })
            .mix_u64(passes)
    }

    fn local_pattern_hash(&self, pla: Player, loc: Loc) -> Hash128 {
        if !loc.is_board() {
            return Hash128::ZERO;
        }
        let x = loc.x(self.x_size) as i64;
        let y = loc.y(self.x_size) as i64;
        let mut h = Hash128::new(0x517cc1b727220a95, 0x2545f4914f6cdd1d).mix_u64(match pla {
            Player::Black => 2,
            Player::White => 3,
        });
        for dy in -1..=1i64 {
            for dx in -1..=1i64 {
                let (nx, ny) = (x + dx, y + dy);
                let code = if nx < 0 || ny < 0 || nx >= self.x_size as i64 || ny >= self.y_size as i64
                {
                    3
                } else {
                    Self::stone_code(self.stones[(ny as usize) * self.x_size + nx as usize])
                };
                h = h.mix_u64(code);
            }
        }
        h
    }

    fn recent_board_hash(&self) -> Hash128 {
        self.pos_hash()
    }

    fn symmetry_duplicate_locs(&self, prune_only_symmetries: &[usize]) -> Vec<bool> {
        let mut dup = vec![false; self.stones.len()];
        let symmetries: Vec<usize> = if prune_only_symmetries.is_empty() {
            (1..8).collect()
        } else {
            prune_only_symmetries.iter().copied().filter(|&s| s != 0 && s < 8).collect()
        };
        for s in symmetries {
            if !self.invariant_under(s) {
                continue;
            }
            for i in 0..self.stones.len() {
                let loc = Loc(i as u16);
                if self.stones[i].is_none() {
                    let image = self.transformed_loc(loc, s);
                    if image.0 < loc.0 {
                        dup[i] = true;
                    }
                }
            }
        }
        dup
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_passes_end_the_game() {
        let mut g = GridGo::new(3, 3, 0.5);
        assert!(!g.is_finished());
        g.play_assume_legal(Loc::PASS, Player::Black);
        assert!(!g.is_finished());
        assert!(g.pass_would_end_game(Player::White));
        g.play_assume_legal(Loc::PASS, Player::White);
        assert!(g.is_finished());
        match g.outcome() {
            Outcome::Scored { winner, white_minus_black } => {
                assert_eq!(winner, Some(Player::White));
                assert!((white_minus_black - 0.5).abs() < 1e-9);
            }
            Outcome::NoResult => panic!("scored game expected"),
        }
    }

    #[test]
    fn placement_resets_pass_count() {
        let mut g = GridGo::new(2, 2, 0.0);
        g.play_assume_legal(Loc::PASS, Player::Black);
        g.play_assume_legal(Loc::from_xy(0, 0, 2), Player::White);
        g.play_assume_legal(Loc::PASS, Player::Black);
        assert!(!g.is_finished());
    }

    #[test]
    fn transpositions_share_graph_hash() {
        let mut a = GridGo::new(3, 3, 0.0);
        a.play_assume_legal(Loc(0), Player::Black);
        a.play_assume_legal(Loc(1), Player::White);
        a.play_assume_legal(Loc(2), Player::Black);

        let mut b = GridGo::new(3, 3, 0.0);
        b.play_assume_legal(Loc(2), Player::Black);
        b.play_assume_legal(Loc(1), Player::White);
        b.play_assume_legal(Loc(0), Player::Black);

        assert_eq!(a.graph_hash(Player::White, 11), b.graph_hash(Player::White, 11));

        let mut c = GridGo::new(3, 3, 0.0);
        c.play_assume_legal(Loc(0), Player::Black);
        c.play_assume_legal(Loc(2), Player::White);
        assert_ne!(a.graph_hash(Player::White, 11), c.graph_hash(Player::Black, 11));
    }

    #[test]
    fn pass_count_and_player_distinguish_graph_hash() {
        let mut a = GridGo::new(3, 3, 0.0);
        a.play_assume_legal(Loc(0), Player::Black);
        let mut b = a.clone();
        b.play_assume_legal(Loc::PASS, Player::White);
        // Same stones, but a pending pass changes the node identity.
        assert_eq!(a.pos_hash(), b.pos_hash());
        assert_ne!(a.graph_hash(Player::Black, 11), b.graph_hash(Player::Black, 11));
        assert_ne!(a.graph_hash(Player::Black, 11), a.graph_hash(Player::White, 11));
    }

    #[test]
    fn empty_board_is_fully_symmetric() {
        let g = GridGo::new(3, 3, 0.0);
        let dup = g.symmetry_duplicate_locs(&[]);
        // Only the canonical orbit representatives stay unmarked: the
        // corner (0,0), edge (1,0), and center survive.
        let unmarked = dup.iter().filter(|&&d| !d).count();
        assert_eq!(unmarked, 3);
    }

    #[test]
    fn partial_symmetry_marks_only_its_orbit() {
        let g = GridGo::new(3, 3, 0.0).with_stone(Loc(1), Player::Black);
        // Position is only invariant under the x-mirror; locs 0 and 2 are an
        // orbit, everything else fixed or asymmetric.
        let dup = g.symmetry_duplicate_locs(&[]);
        assert!(dup[2]);
        assert!(!dup[0]);
        assert!(!dup[1]);
    }
}
