//! Time-control boundary inputs.
//!
//! The arithmetic that turns a clock state into per-move budgets lives with
//! the caller; the search consumes a precomputed (min, recommended, max)
//! triple and reshapes the recommended time itself (overallocation, midgame
//! weighting, obviousness, futility early-stop).

/// Per-move time budget handed to the search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeControls {
    /// Floor on thinking time, in seconds.
    pub min_time: f64,
    /// Recommended thinking time before the search's own adjustments.
    pub recommended_time: f64,
    /// Hard cap; never exceeded.
    pub max_time: f64,
}

const EFFECTIVELY_UNLIMITED: f64 = 1.0e12;

impl TimeControls {
    pub fn unlimited() -> TimeControls {
        TimeControls { min_time: 0.0, recommended_time: 1.0e30, max_time: 1.0e30 }
    }

    pub fn fixed(seconds: f64) -> TimeControls {
        TimeControls { min_time: 0.0, recommended_time: seconds, max_time: seconds }
    }

    pub fn is_effectively_unlimited_time(&self) -> bool {
        self.recommended_time >= EFFECTIVELY_UNLIMITED && self.max_time >= EFFECTIVELY_UNLIMITED
    }

    /// The (min, rec, max) triple after reserving the lag buffer out of the
    /// hard cap.
    pub fn get_time(&self, lag_buffer: f64) -> (f64, f64, f64) {
        let max = (self.max_time - lag_buffer).max(0.0);
        (self.min_time.min(max), self.recommended_time.min(max), max)
    }

    /// Avoid planning a stop a hair after `time_used`: once past the planned
    /// limit minus the lag buffer, there is no value in a fractional topup.
    pub fn round_up_time_limit_if_needed(&self, lag_buffer: f64, time_used: f64, rec: f64) -> f64 {
        if rec > time_used && rec - time_used < lag_buffer * 0.5 {
            time_used
        } else {
            rec
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_is_unlimited() {
        assert!(TimeControls::unlimited().is_effectively_unlimited_time());
        assert!(!TimeControls::fixed(5.0).is_effectively_unlimited_time());
    }

    #[test]
    fn lag_buffer_comes_off_the_cap() {
        let tc = TimeControls { min_time: 1.0, recommended_time: 10.0, max_time: 12.0 };
        let (min, rec, max) = tc.get_time(2.0);
        assert_eq!(max, 10.0);
        assert_eq!(rec, 10.0);
        assert_eq!(min, 1.0);
    }

    #[test]
    fn round_up_truncates_marginal_overruns() {
        let tc = TimeControls::fixed(10.0);
        assert_eq!(tc.round_up_time_limit_if_needed(1.0, 9.8, 10.0), 9.8);
        assert_eq!(tc.round_up_time_limit_if_needed(1.0, 5.0, 10.0), 10.0);
    }
}
