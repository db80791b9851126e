//! Trailing-window operators over a single time series.
//!
//! Every function returns a vector with the same length as its input. Rows
//! whose window is not yet full are `NaN`. Unless a function says otherwise,
//! a window containing any non-finite value also yields `NaN`.

use crate::stats::{nan_mean, nan_std};

/// Apply `f` to every full trailing window of `period` values.
///
/// Windows containing a non-finite value produce `NaN` without calling `f`.
pub fn rolling_apply<F>(values: &[f64], period: usize, f: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let len = values.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || period > len {
        return result;
    }
    for i in period - 1..len {
        let window = &values[i + 1 - period..=i];
        if window.iter().any(|v| !v.is_finite()) {
            continue;
        }
        result[i] = f(window);
    }
    result
}

/// Like [`rolling_apply`] but hands `f` only the finite values of each
/// window. A window with no finite value yields `NaN`.
pub fn rolling_apply_finite<F>(values: &[f64], period: usize, f: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let len = values.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || period > len {
        return result;
    }
    let mut scratch = Vec::with_capacity(period);
    for i in period - 1..len {
        scratch.clear();
        scratch.extend(
            values[i + 1 - period..=i]
                .iter()
                .copied()
                .filter(|v| v.is_finite()),
        );
        if scratch.is_empty() {
            continue;
        }
        result[i] = f(&scratch);
    }
    result
}

pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    rolling_apply(values, period, |w| w.iter().sum::<f64>() / w.len() as f64)
}

pub fn rolling_sum(values: &[f64], period: usize) -> Vec<f64> {
    rolling_apply(values, period, |w| w.iter().sum::<f64>())
}

/// Rolling population standard deviation (ddof = 0).
pub fn rolling_pstd(values: &[f64], period: usize) -> Vec<f64> {
    rolling_apply(values, period, |w| variance(w, 0).sqrt())
}

pub fn rolling_max(values: &[f64], period: usize) -> Vec<f64> {
    rolling_apply(values, period, |w| {
        w.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    })
}

pub fn rolling_min(values: &[f64], period: usize) -> Vec<f64> {
    rolling_apply(values, period, |w| w.iter().copied().fold(f64::INFINITY, f64::min))
}

/// Rolling maximum that skips `NaN` entries instead of propagating them.
pub fn rolling_max_finite(values: &[f64], period: usize) -> Vec<f64> {
    rolling_apply_finite(values, period, |w| {
        w.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    })
}

/// Rolling minimum that skips `NaN` entries instead of propagating them.
pub fn rolling_min_finite(values: &[f64], period: usize) -> Vec<f64> {
    rolling_apply_finite(values, period, |w| {
        w.iter().copied().fold(f64::INFINITY, f64::min)
    })
}

/// Midpoint of the rolling range: `(max + min) / 2`.
pub fn midpoint(values: &[f64], period: usize) -> Vec<f64> {
    rolling_apply(values, period, |w| {
        let (lo, hi) = w
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        (lo + hi) / 2.0
    })
}

/// Fraction of the window that is less than or equal to the latest value.
pub fn rolling_rank(values: &[f64], period: usize) -> Vec<f64> {
    rolling_apply(values, period, |w| {
        let last = w[w.len() - 1];
        w.iter().filter(|&&v| v <= last).count() as f64 / w.len() as f64
    })
}

/// `x_t - x_{t-lag}`.
pub fn delta(values: &[f64], lag: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, &val)| {
            if i < lag {
                f64::NAN
            } else {
                val - values[i - lag]
            }
        })
        .collect()
}

/// `x_{t-lag}`.
pub fn delay(values: &[f64], lag: usize) -> Vec<f64> {
    (0..values.len())
        .map(|i| if i < lag { f64::NAN } else { values[i - lag] })
        .collect()
}

/// Rolling z-score of the latest value against its trailing window.
///
/// Mean and population std are computed over the finite entries of the
/// window only. The std is floored at `std_floor`, so a constant window
/// yields 0. A non-finite latest value stays `NaN`.
pub fn rolling_zscore(values: &[f64], period: usize, std_floor: f64) -> Vec<f64> {
    let len = values.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || period > len {
        return result;
    }
    for i in period - 1..len {
        let current = values[i];
        if !current.is_finite() {
            continue;
        }
        let window = &values[i + 1 - period..=i];
        let mean = nan_mean(window);
        let std = nan_std(window);
        if !mean.is_finite() || !std.is_finite() {
            continue;
        }
        result[i] = (current - mean) / std.max(std_floor);
    }
    result
}

/// Rolling Pearson correlation between two aligned series.
pub fn rolling_corr(x: &[f64], y: &[f64], period: usize) -> Vec<f64> {
    let len = x.len().min(y.len());
    let mut result = vec![f64::NAN; len];
    if period < 2 || period > len {
        return result;
    }
    for i in period - 1..len {
        let start = i + 1 - period;
        result[i] = crate::stats::pearson(&x[start..=i], &y[start..=i]);
    }
    result
}

/// Replace every non-finite entry with the last finite value seen.
pub fn forward_fill(values: &mut [f64]) {
    let mut last: Option<f64> = None;
    for value in values.iter_mut() {
        if value.is_finite() {
            last = Some(*value);
        } else if let Some(prev) = last {
            *value = prev;
        }
    }
}

/// Replace every non-finite entry with the next finite value.
pub fn backward_fill(values: &mut [f64]) {
    let mut next: Option<f64> = None;
    for value in values.iter_mut().rev() {
        if value.is_finite() {
            next = Some(*value);
        } else if let Some(after) = next {
            *value = after;
        }
    }
}

pub fn fill_non_finite(values: &mut [f64], fill: f64) {
    for value in values.iter_mut() {
        if !value.is_finite() {
            *value = fill;
        }
    }
}

fn variance(window: &[f64], ddof: usize) -> f64 {
    let n = window.len();
    if n <= ddof {
        return f64::NAN;
    }
    let mean = window.iter().sum::<f64>() / n as f64;
    window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - ddof) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_propagates_nan_inside_window() {
        let out = sma(&[1.0, 2.0, f64::NAN, 4.0, 5.0, 6.0], 2);
        assert!(out[0].is_nan());
        assert!((out[1] - 1.5).abs() < 1e-12);
        assert!(out[2].is_nan());
        assert!(out[3].is_nan());
        assert!((out[5] - 5.5).abs() < 1e-12);
    }

    #[test]
    fn finite_extrema_skip_missing_values() {
        let values = [f64::NAN, 3.0, f64::NAN, 1.0];
        let strict = rolling_max(&values, 3);
        let dynamic = rolling_max_finite(&values, 3);
        assert!(strict[2].is_nan());
        assert_eq!(dynamic[2], 3.0);
        assert_eq!(dynamic[3], 3.0);
        assert_eq!(rolling_min_finite(&values, 3)[3], 1.0);
    }

    #[test]
    fn midpoint_is_center_of_range() {
        let out = midpoint(&[1.0, 5.0, 3.0, 9.0], 3);
        assert_eq!(out[2], 3.0);
        assert_eq!(out[3], 6.0);
    }

    #[test]
    fn zscore_of_constant_window_is_zero() {
        let out = rolling_zscore(&[7.0; 6], 3, 1e-8);
        assert!(out[..2].iter().all(|v| v.is_nan()));
        assert!(out[2..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn zscore_excludes_nan_from_window_stats() {
        let out = rolling_zscore(&[1.0, f64::NAN, 3.0], 3, 1e-8);
        // mean 2, population std 1
        assert!((out[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fills_respect_direction() {
        let mut values = [f64::NAN, 1.0, f64::NAN, 3.0, f64::NAN];
        forward_fill(&mut values);
        assert!(values[0].is_nan());
        assert_eq!(values[2], 1.0);
        assert_eq!(values[4], 3.0);
        backward_fill(&mut values);
        assert_eq!(values[0], 1.0);
    }

    #[test]
    fn rank_counts_values_at_or_below_latest() {
        let out = rolling_rank(&[3.0, 1.0, 2.0], 3);
        assert!((out[2] - 2.0 / 3.0).abs() < 1e-12);
    }
}
