//! Numeric helpers: score-to-utility curves and the heavy-tailed value
//! weighting distribution.
//!
//! Everything here is pure `f64` math. The search calls these from hot loops,
//! so the t-distribution CDF is served from a precomputed interpolation table
//! rather than evaluated per call.

use std::f64::consts::PI;

/// Degrees of freedom of the value-weighting distribution. Heavy tails keep a
/// single outlier child from being zeroed out entirely.
pub const VALUE_WEIGHT_DEGREES_OF_FREEDOM: f64 = 3.0;

/// CDF of the Student-t distribution with 3 degrees of freedom.
pub fn tdist3_cdf(x: f64) -> f64 {
    let u = x / 3.0f64.sqrt();
    0.5 + (u / (1.0 + u * u) + u.atan()) / PI
}

/// Precomputed CDF lookup with linear interpolation, clamped at the ends.
pub struct DistributionTable {
    min_z: f64,
    max_z: f64,
    entries: Vec<f64>,
}

impl DistributionTable {
    pub fn new(min_z: f64, max_z: f64, size: usize, cdf: impl Fn(f64) -> f64) -> DistributionTable {
        assert!(size >= 2 && max_z > min_z);
        let entries = (0..size)
            .map(|i| cdf(min_z + (max_z - min_z) * i as f64 / (size - 1) as f64))
            .collect();
        DistributionTable { min_z, max_z, entries }
    }

    /// Table over [-50, 50] for the 3-d.o.f. Student-t.
    pub fn value_weight_table() -> DistributionTable {
        DistributionTable::new(-50.0, 50.0, 2000, tdist3_cdf)
    }

    pub fn get_cdf(&self, z: f64) -> f64 {
        let n = self.entries.len();
        let t = (z - self.min_z) / (self.max_z - self.min_z) * (n - 1) as f64;
        if t <= 0.0 {
            return self.entries[0];
        }
        if t >= (n - 1) as f64 {
            return self.entries[n - 1];
        }
        let i = t as usize;
        let frac = t - i as f64;
        self.entries[i] * (1.0 - frac) + self.entries[i + 1] * frac
    }
}

/// Smooth white score value in [-1, 1]: the expected sign of the final score,
/// softened over a scale proportional to the board size.
pub fn score_value_of_score(score: f64, center: f64, scale: f64, board_area: f64) -> f64 {
    let b = scale * board_area.max(1.0).sqrt();
    (2.0 / PI) * ((score - center) / b).atan()
}

// 5-point Gauss-Hermite quadrature: abscissae and weights for ∫f(x)e^{-x²}dx.
const GH_NODES: [f64; 5] =
    [-2.020182870456086, -0.958572464613819, 0.0, 0.958572464613819, 2.020182870456086];
const GH_WEIGHTS: [f64; 5] =
    [0.019953242059046, 0.393619323152241, 0.945308720482942, 0.393619323152241, 0.019953242059046];
const INV_SQRT_PI: f64 = 0.5641895835477563;

/// Expected score value of a normally-distributed score with the given mean
/// and standard deviation.
pub fn expected_score_value(
    mean: f64,
    stdev: f64,
    center: f64,
    scale: f64,
    board_area: f64,
) -> f64 {
    if stdev <= 0.0 {
        return score_value_of_score(mean, center, scale, board_area);
    }
    let sqrt2_sigma = stdev * std::f64::consts::SQRT_2;
    let mut sum = 0.0;
    for (&t, &w) in GH_NODES.iter().zip(GH_WEIGHTS.iter()) {
        sum += w * score_value_of_score(mean + sqrt2_sigma * t, center, scale, board_area);
    }
    sum * INV_SQRT_PI
}

/// d(score value)/d(score) at the given score, ignoring variance effects.
pub fn score_value_derivative(score: f64, center: f64, scale: f64, board_area: f64) -> f64 {
    let b = scale * board_area.max(1.0).sqrt();
    let u = (score - center) / b;
    (2.0 / PI) / (b * (1.0 + u * u))
}

/// Standard deviation implied by a running mean and mean-square, clamped
/// against transient `mean_sq < mean²` from relaxed reads.
pub fn stdev_of(mean: f64, mean_sq: f64) -> f64 {
    let variance = mean_sq - mean * mean;
    if variance <= 0.0 {
        0.0
    } else {
        variance.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t3_cdf_basics() {
        assert!((tdist3_cdf(0.0) - 0.5).abs() < 1e-12);
        assert!(tdist3_cdf(-30.0) < 1e-4);
        assert!(tdist3_cdf(30.0) > 1.0 - 1e-4);
        // Known value: F(1.0) for t(3) ≈ 0.80450.
        assert!((tdist3_cdf(1.0) - 0.80450).abs() < 1e-4);
        // Symmetry.
        assert!((tdist3_cdf(1.7) + tdist3_cdf(-1.7) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn table_matches_closed_form() {
        let table = DistributionTable::value_weight_table();
        for &z in &[-10.0, -2.5, -0.3, 0.0, 0.3, 2.5, 10.0] {
            assert!((table.get_cdf(z) - tdist3_cdf(z)).abs() < 1e-5, "z={z}");
        }
        // Clamped outside the range.
        assert_eq!(table.get_cdf(-1000.0), table.get_cdf(-50.0));
        assert_eq!(table.get_cdf(1000.0), table.get_cdf(50.0));
    }

    #[test]
    fn score_value_monotone_and_bounded() {
        let area = 81.0;
        let mut last = -1.0;
        for i in -40..=40 {
            let v = score_value_of_score(i as f64, 0.0, 0.75, area);
            assert!(v > last);
            assert!(v.abs() < 1.0);
            last = v;
        }
        assert_eq!(score_value_of_score(0.0, 0.0, 0.75, area), 0.0);
    }

    #[test]
    fn expected_score_value_shrinks_with_noise() {
        let area = 81.0;
        let sharp = expected_score_value(10.0, 0.0, 0.0, 0.75, area);
        let fuzzy = expected_score_value(10.0, 20.0, 0.0, 0.75, area);
        assert!(fuzzy < sharp);
        assert!(fuzzy > 0.0);
        // Zero-mean noise keeps the value at zero by symmetry.
        assert!(expected_score_value(0.0, 15.0, 0.0, 0.75, area).abs() < 1e-12);
    }

    #[test]
    fn derivative_is_positive_and_peaks_at_center() {
        let area = 81.0;
        let at_center = score_value_derivative(3.0, 3.0, 0.75, area);
        let off_center = score_value_derivative(20.0, 3.0, 0.75, area);
        assert!(at_center > off_center);
        assert!(off_center > 0.0);
    }

    #[test]
    fn stdev_clamps_negative_variance() {
        assert_eq!(stdev_of(2.0, 3.9), 0.0);
        assert!((stdev_of(0.0, 4.0) - 2.0).abs() < 1e-12);
    }
}
