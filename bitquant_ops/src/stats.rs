//! Point statistics over a slice, used both along time and across symbols.

/// Mean of the finite entries, `NaN` when there are none.
pub fn nan_mean(values: &[f64]) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Population standard deviation of the finite entries.
pub fn nan_std(values: &[f64]) -> f64 {
    let mean = nan_mean(values);
    if !mean.is_finite() {
        return f64::NAN;
    }
    let (sq, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), v| (s + (v - mean).powi(2), c + 1));
    (sq / count as f64).sqrt()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with `ddof` delta degrees of freedom.
pub fn std_dev(values: &[f64], ddof: usize) -> f64 {
    let n = values.len();
    if n <= ddof {
        return f64::NAN;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - ddof) as f64).sqrt()
}

/// Pearson correlation. Any non-finite input or a zero-variance side gives
/// `NaN`.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len();
    if n != y.len() || n < 2 {
        return f64::NAN;
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return f64::NAN;
    }
    let mx = mean(x);
    let my = mean(y);
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mx;
        let dy = b - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return f64::NAN;
    }
    (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
}

/// Pearson correlation over the pairs where both sides are finite.
pub fn pearson_pairwise(x: &[f64], y: &[f64]) -> f64 {
    let (xs, ys): (Vec<f64>, Vec<f64>) = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .unzip();
    pearson(&xs, &ys)
}

/// Spearman rank correlation: Pearson over average-tie ranks.
pub fn spearman(x: &[f64], y: &[f64]) -> f64 {
    if x.len() != y.len() || x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return f64::NAN;
    }
    pearson(&average_ranks(x), &average_ranks(y))
}

/// 1-based ranks with ties sharing the mean of their positions. Non-finite
/// values keep `NaN` as their rank.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len())
        .filter(|&i| values[i].is_finite())
        .collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![f64::NAN; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for &idx in &order[start..=end] {
            ranks[idx] = rank;
        }
        start = end + 1;
    }
    ranks
}

/// Cross-sectional z-score with a floored population std.
pub fn zscore(values: &[f64], std_floor: f64) -> Vec<f64> {
    let mean = nan_mean(values);
    let std = nan_std(values);
    values
        .iter()
        .map(|v| {
            if !v.is_finite() || !mean.is_finite() {
                f64::NAN
            } else {
                (v - mean) / std.max(std_floor)
            }
        })
        .collect()
}

/// Ranks scaled into `(0, 1]`.
pub fn percentile_ranks(values: &[f64]) -> Vec<f64> {
    let finite = values.iter().filter(|v| v.is_finite()).count();
    if finite == 0 {
        return vec![f64::NAN; values.len()];
    }
    average_ranks(values)
        .into_iter()
        .map(|r| r / finite as f64)
        .collect()
}
