//! Search orchestration: worker threads, budgets, and time management.
//!
//! Workers run under a thread scope with the calling thread participating as
//! worker 0. Worker 0 additionally recomputes the time limit at most 10 times
//! per second; every worker derives its own upper bound on remaining visits
//! before each descent so futile-visit pruning adapts as time runs out.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, error};

use crate::eval::Evaluator;
use crate::game::{GameState, Loc, Player};
use crate::search::{Search, SearchError};
use crate::stats::AtomicF64;
use crate::timecontrol::TimeControls;

impl<G: GameState, E: Evaluator<G>> Search<G, E> {
    /// Run a closure once per worker index, in parallel, with the calling
    /// thread as worker 0. Panics in workers propagate on join.
    pub(crate) fn perform_task_with_threads(&self, task: &(impl Fn(usize) + Sync)) {
        let num_threads = self.params.num_threads.max(1);
        if num_threads == 1 {
            task(0);
            return;
        }
        std::thread::scope(|scope| {
            for thread_idx in 1..num_threads {
                scope.spawn(move || task(thread_idx));
            }
            task(0);
        });
    }

    /// Search until a budget is exhausted, then pick nothing: results are
    /// read separately. Convenience form with no external stop or clock.
    pub fn run_whole_search_for_player(
        &mut self,
        pla: Player,
        pondering: bool,
    ) -> Result<(), SearchError> {
        if pla != self.root_pla {
            self.set_player_and_clear_history(pla);
        }
        let should_stop = AtomicBool::new(false);
        self.run_whole_search(&should_stop, pondering, &TimeControls::unlimited(), 1.0)
    }

    pub fn run_whole_search_and_get_move(&mut self, pla: Player) -> Result<Loc, SearchError> {
        self.run_whole_search_for_player(pla, false)?;
        Ok(self.get_chosen_move_loc())
    }

    /// Run the search until visit/playout/time caps, the external stop flag,
    /// or the computed time-control limit fires.
    pub fn run_whole_search(
        &mut self,
        should_stop: &AtomicBool,
        pondering: bool,
        tc: &TimeControls,
        mut search_factor: f64,
    ) -> Result<(), SearchError> {
        let timer = Instant::now();
        let num_playouts_shared = AtomicI64::new(0);

        self.begin_search(pondering)?;
        let num_non_playout_visits = self.root_visits();

        let mut max_visits =
            if pondering { self.params.max_visits_pondering } else { self.params.max_visits };
        let mut max_playouts =
            if pondering { self.params.max_playouts_pondering } else { self.params.max_playouts };
        let mut max_time =
            if pondering { self.params.max_time_pondering } else { self.params.max_time };

        // Play faster after passes, for friendliness in filled-out positions.
        if let Some(last) = self.root_moves.last() {
            if last.loc == Loc::PASS {
                let n = self.root_moves.len();
                if n >= 3 && self.root_moves[n - 3].loc == Loc::PASS {
                    search_factor *= self.params.search_factor_after_two_pass;
                } else {
                    search_factor *= self.params.search_factor_after_one_pass;
                }
            }
        }
        if search_factor != 1.0 {
            let cap = (1i64 << 62) as f64;
            max_visits = (max_visits as f64 * search_factor).min(cap).ceil() as i64;
            max_playouts = (max_playouts as f64 * search_factor).min(cap).ceil() as i64;
            max_time *= search_factor;
        }

        let tc_max_time = AtomicF64::new(1.0e30);
        let upper_bound_visits_left_due_to_time = AtomicF64::new(1.0e30);
        let has_max_time = max_time < 1.0e12;
        let has_tc = !pondering && !tc.is_effectively_unlimited_time();

        if !pondering && (has_tc || has_max_time) {
            let root_visits =
                num_playouts_shared.load(Ordering::Relaxed) + num_non_playout_visits;
            let time_used = timer.elapsed().as_secs_f64();
            let mut tc_limit = 1.0e30;
            if has_tc {
                tc_limit = self.recompute_search_time_limit(tc, time_used, search_factor, root_visits);
                tc_max_time.store(tc_limit, Ordering::Release);
            }
            let upper_bound = self.compute_upper_bound_visits_left_due_to_time(
                root_visits,
                time_used,
                tc_limit.min(max_time),
            );
            upper_bound_visits_left_due_to_time.store(upper_bound, Ordering::Release);
        }

        let first_error: Mutex<Option<SearchError>> = Mutex::new(None);

        let search_start = timer.elapsed().as_secs_f64();
        {
            let this: &Search<G, E> = self;
            let search_loop = |thread_idx: usize| {
                let mut thread = this.make_search_thread(thread_idx);
                let mut num_playouts = num_playouts_shared.load(Ordering::Relaxed);
                let mut last_time_recomputed = 0.0f64;
                loop {
                    let time_used = if has_tc || has_max_time {
                        timer.elapsed().as_secs_f64()
                    } else {
                        0.0
                    };
                    let tc_max_time_limit =
                        if has_tc { tc_max_time.load(Ordering::Acquire) } else { 0.0 };

                    let mut stop = num_playouts >= max_playouts
                        || num_playouts + num_non_playout_visits >= max_visits;
                    if has_max_time && num_playouts >= 2 && time_used >= max_time {
                        stop = true;
                    }
                    if has_tc && num_playouts >= 2 && time_used >= tc_max_time_limit {
                        stop = true;
                    }
                    if stop || should_stop.load(Ordering::Relaxed) {
                        should_stop.store(true, Ordering::Relaxed);
                        break;
                    }

                    // Worker 0 alone refreshes time limits, at most 10/sec.
                    if !pondering
                        && (has_tc || has_max_time)
                        && thread_idx == 0
                        && time_used >= last_time_recomputed + 0.1
                    {
                        last_time_recomputed = time_used;
                        let root_visits = num_playouts + num_non_playout_visits;
                        let mut tc_limit = 1.0e30;
                        if has_tc {
                            tc_limit = this.recompute_search_time_limit(
                                tc,
                                time_used,
                                search_factor,
                                root_visits,
                            );
                            tc_max_time.store(tc_limit, Ordering::Release);
                        }
                        let upper_bound = this.compute_upper_bound_visits_left_due_to_time(
                            root_visits,
                            time_used,
                            tc_limit.min(max_time),
                        );
                        upper_bound_visits_left_due_to_time.store(upper_bound, Ordering::Release);
                    }

                    let mut upper_bound_visits_left = 1.0e30f64;
                    if has_tc {
                        upper_bound_visits_left =
                            upper_bound_visits_left_due_to_time.load(Ordering::Acquire);
                    }
                    upper_bound_visits_left =
                        upper_bound_visits_left.min((max_playouts - num_playouts) as f64);
                    upper_bound_visits_left = upper_bound_visits_left
                        .min((max_visits - num_playouts - num_non_playout_visits) as f64);

                    match this.run_single_playout(&mut thread, upper_bound_visits_left) {
                        Ok(true) => {
                            num_playouts =
                                num_playouts_shared.fetch_add(1, Ordering::Relaxed) + 1;
                        }
                        Ok(false) => {
                            // No progress (lost a race); give other threads a
                            // chance to clear the way.
                            std::thread::yield_now();
                            num_playouts = num_playouts_shared.load(Ordering::Relaxed);
                        }
                        Err(e) => {
                            error!(thread_idx, error = %e, "search worker failed");
                            let mut slot = first_error.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            should_stop.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                }
                this.transfer_retired_nn_outputs(&mut thread);
            };
            this.perform_task_with_threads(&search_loop);
        }

        self.last_search_num_playouts = num_playouts_shared.load(Ordering::Relaxed);
        self.effective_search_time_carried_over += timer.elapsed().as_secs_f64() - search_start;

        debug!(
            playouts = self.last_search_num_playouts,
            root_visits = self.root_visits(),
            seconds = timer.elapsed().as_secs_f64(),
            "search finished"
        );

        match first_error.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Highest number of additional visits the clock could still allow, from
    /// the observed visit rate so far.
    pub(crate) fn compute_upper_bound_visits_left_due_to_time(
        &self,
        root_visits: i64,
        time_used: f64,
        planned_time_limit: f64,
    ) -> f64 {
        if root_visits <= 1 {
            return 1.0e30;
        }
        let time_thought_so_far = self.effective_search_time_carried_over + time_used;
        let time_left_planned = planned_time_limit - time_used;
        // Visit-rate estimates from under a tenth of a second are noise.
        if time_thought_so_far < 0.1 {
            return 1.0e30;
        }
        let proportion_left = time_left_planned / time_thought_so_far;
        (proportion_left * root_visits as f64 + (self.params.num_threads - 1) as f64).ceil()
    }

    /// Visits a move needs before it could still become the chosen move.
    pub(crate) fn num_visits_needed_to_be_non_futile(&self, max_visits_move_visits: f64) -> f64 {
        let required_visits = self.params.futile_visits_threshold * max_visits_move_visits;
        // Under a high move-selection temperature, also require that the move
        // cannot reach 1:100 selection odds.
        let chosen_move_temperature = self.interpolate_early(
            self.params.chosen_move_temperature_halflife,
            self.params.chosen_move_temperature_early,
            self.params.chosen_move_temperature,
        );
        if chosen_move_temperature < 1.0e-3 {
            return required_visits;
        }
        let required_due_to_temp =
            max_visits_move_visits * 0.01f64.powf(chosen_move_temperature);
        required_visits.min(required_due_to_temp)
    }

    /// Reshape the recommended time for this move.
    pub(crate) fn recompute_search_time_limit(
        &self,
        tc: &TimeControls,
        time_used: f64,
        search_factor: f64,
        root_visits: i64,
    ) -> f64 {
        let (tc_min, mut tc_rec, tc_max) = tc.get_time(self.params.lag_buffer);

        tc_rec *= self.params.overallocate_time_factor;

        if self.params.midgame_time_factor != 1.0 {
            let board_area_scale = self.board_area() / 361.0;
            let presumed_turn_number =
                (self.initial_turn_number + self.root_moves.len()) as f64;
            let peak = self.params.midgame_turn_peak_time * board_area_scale;
            let midgame_weight = if presumed_turn_number < peak {
                presumed_turn_number / peak
            } else {
                (-(presumed_turn_number - peak)
                    / (self.params.endgame_turn_time_decay * board_area_scale))
                    .exp()
            }
            .clamp(0.0, 1.0);
            tc_rec *= 1.0 + midgame_weight * (self.params.midgame_time_factor - 1.0);
        }

        if self.params.obvious_moves_time_factor < 1.0 {
            if let Some((surprise, _search_entropy, policy_entropy)) =
                self.get_policy_surprise_and_entropy()
            {
                // Confident raw policy plus a search that agrees with it
                // means an "obvious" move: spend less.
                let obviousness_by_entropy =
                    (-policy_entropy / self.params.obvious_moves_policy_entropy_tolerance).exp();
                let obviousness_by_surprise =
                    (-surprise / self.params.obvious_moves_policy_surprise_tolerance).exp();
                let obviousness_weight = obviousness_by_entropy.min(obviousness_by_surprise);
                tc_rec *= 1.0 + obviousness_weight * (self.params.obvious_moves_time_factor - 1.0);
            }
        }

        if tc_rec > 1.0e-20 {
            // Taper against time already "thought" via tree reuse, but keep a
            // sliver of fresh root exploration rather than instamoving.
            let remaining_time_needed = tc_rec - self.effective_search_time_carried_over;
            let remaining_factor = remaining_time_needed / tc_rec;
            tc_rec *= ((1.0 + (remaining_factor * 6.0).exp()).ln() / 6.0).min(1.0);
        }

        tc_rec = tc.round_up_time_limit_if_needed(self.params.lag_buffer, time_used, tc_rec);
        if tc_rec > tc_max {
            tc_rec = tc_max;
        }

        // With the planned time fixed, check whether searching on could still
        // change the move; if not, stop now.
        if self.params.futile_visits_threshold > 0.0 {
            let upper_bound_visits_left =
                self.compute_upper_bound_visits_left_due_to_time(root_visits, time_used, tc_rec);
            if upper_bound_visits_left < self.params.futile_visits_threshold * root_visits as f64 {
                if let Some(selection) = self.get_play_selection_values() {
                    if !selection.is_empty() {
                        let mut best_move_idx = 0;
                        let mut max_visits_idx = 0;
                        for i in 1..selection.len() {
                            if selection[i].selection_value
                                > selection[best_move_idx].selection_value
                            {
                                best_move_idx = i;
                            }
                            if selection[i].visits > selection[max_visits_idx].visits {
                                max_visits_idx = i;
                            }
                        }
                        if max_visits_idx == best_move_idx {
                            let required = self
                                .num_visits_needed_to_be_non_futile(
                                    selection[max_visits_idx].visits,
                                );
                            let any_alternative = selection.iter().enumerate().any(|(i, s)| {
                                i != best_move_idx
                                    && s.visits + upper_bound_visits_left >= required
                            });
                            if !any_alternative {
                                tc_rec = time_used * (1.0 - 1.0e-10);
                            }
                        }
                    }
                }
            }
        }

        tc_rec = tc.round_up_time_limit_if_needed(self.params.lag_buffer, time_used, tc_rec);
        if tc_rec > tc_max {
            tc_rec = tc_max;
        }

        // The search factor is allowed to violate the minimum: it exists for
        // friendliness, e.g. fast play after passes.
        if tc_rec < tc_min {
            tc_rec = tc_min;
        }
        tc_rec *= search_factor;
        if tc_rec > tc_max {
            tc_rec = tc_max;
        }

        tc_rec
    }
}
