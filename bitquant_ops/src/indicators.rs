use crate::rolling::{rolling_pstd, sma};

const NON_ZERO_RANGE_EPS: f64 = f64::EPSILON;

/// Wilder's moving average seeded with the SMA of the first `period` finite
/// values. Non-finite inputs after the seed hold the previous value.
pub fn wilder(values: &[f64], period: usize) -> Vec<f64> {
    let len = values.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 {
        return result;
    }
    let Some(start) = values.iter().position(|v| v.is_finite()) else {
        return result;
    };
    if start + period > len {
        return result;
    }
    let seed_window = &values[start..start + period];
    if seed_window.iter().any(|v| !v.is_finite()) {
        return result;
    }
    let mut prev = seed_window.iter().sum::<f64>() / period as f64;
    result[start + period - 1] = prev;
    let p = period as f64;
    for i in start + period..len {
        let value = values[i];
        if value.is_finite() {
            prev = (prev * (p - 1.0) + value) / p;
        }
        result[i] = prev;
    }
    result
}

/// True range. The first bar has no previous close and is `NaN`.
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let len = close.len().min(high.len()).min(low.len());
    let mut tr = vec![f64::NAN; len];
    for i in 1..len {
        let high_low = high[i] - low[i];
        let high_close = (high[i] - close[i - 1]).abs();
        let low_close = (low[i] - close[i - 1]).abs();
        tr[i] = high_low.max(high_close).max(low_close);
    }
    tr
}

/// Average true range with Wilder smoothing. The first value lands on index
/// `period` of the finite suffix (one bar is spent on the previous close).
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let tr = true_range(high, low, close);
    if period <= 1 {
        return tr;
    }
    wilder(&tr, period)
}

/// ATR as a percentage of the close.
pub fn natr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    atr(high, low, close, period)
        .into_iter()
        .zip(close.iter())
        .map(|(a, c)| {
            if c.abs() < f64::EPSILON {
                f64::NAN
            } else {
                a / c * 100.0
            }
        })
        .collect()
}

/// Middle, upper and lower Bollinger bands with a population std.
pub fn bollinger_bands(
    values: &[f64],
    period: usize,
    std_mult: f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mid = sma(values, period);
    let std = rolling_pstd(values, period);
    let upper = mid
        .iter()
        .zip(std.iter())
        .map(|(m, s)| m + s * std_mult)
        .collect();
    let lower = mid
        .iter()
        .zip(std.iter())
        .map(|(m, s)| m - s * std_mult)
        .collect();
    (mid, upper, lower)
}

/// Position of each value inside its band, 0 at the lower band and 1 at the
/// upper. A collapsed band maps to 0.5.
pub fn bollinger_position(values: &[f64], lower: &[f64], upper: &[f64]) -> Vec<f64> {
    values
        .iter()
        .zip(lower.iter().zip(upper.iter()))
        .map(|(c, (l, u))| {
            if !l.is_finite() || !u.is_finite() || !c.is_finite() {
                f64::NAN
            } else if (u - l).abs() < NON_ZERO_RANGE_EPS {
                0.5
            } else {
                (c - l) / (u - l)
            }
        })
        .collect()
}
