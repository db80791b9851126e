use serde::Serialize;

use crate::matrix::Matrix;

pub const MS_PER_HOUR: i64 = 3_600_000;
pub const MS_PER_YEAR: f64 = 365.0 * 86_400_000.0;

/// `num / den` with defined results for a zero (or undefined) denominator:
/// `+inf` for a positive numerator, `-inf` for a negative one, `0` for zero.
pub fn ratio_or_sentinel(num: f64, den: f64) -> f64 {
    if num.is_nan() {
        return 0.0;
    }
    if den == 0.0 || !den.is_finite() {
        if num > 0.0 {
            f64::INFINITY
        } else if num < 0.0 {
            f64::NEG_INFINITY
        } else {
            0.0
        }
    } else {
        num / den
    }
}

/// Bars per 365-day year for a bar duration in milliseconds.
pub fn periods_per_year(bar_ms: i64) -> f64 {
    if bar_ms <= 0 {
        return 0.0;
    }
    MS_PER_YEAR / bar_ms as f64
}

/// Summary statistics of one equity curve.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EquityStats {
    pub steps: usize,
    pub initial_equity: f64,
    pub final_equity: f64,
    pub pnl_pct: f64,
    /// Total PnL % divided by the number of steps.
    pub pnl_pct_per_step: f64,
    pub annual_pnl_pct: f64,
    pub annual_sharpe: f64,
    pub annual_sortino: f64,
    pub max_drawdown_pct: f64,
    /// Equity-increasing steps as a % of steps where equity changed.
    pub win_rate_pct: f64,
    /// Mean gain over mean absolute loss, in %.
    pub avg_win_loss_ratio_pct: f64,
}

#[derive(Debug, Default)]
struct EquityAccumulator {
    previous: Option<f64>,
    peak: f64,
    max_drawdown: f64,
    returns: Vec<f64>,
    gain_sum: f64,
    gain_count: usize,
    loss_sum: f64,
    loss_count: usize,
}

impl EquityAccumulator {
    fn push(&mut self, equity: f64) {
        if equity > self.peak || self.previous.is_none() {
            self.peak = equity;
        }
        if self.peak > 0.0 {
            let dd = 1.0 - equity / self.peak;
            if dd > self.max_drawdown {
                self.max_drawdown = dd;
            }
        }
        if let Some(prev) = self.previous {
            let change = equity - prev;
            if change > 0.0 {
                self.gain_sum += change;
                self.gain_count += 1;
            } else if change < 0.0 {
                self.loss_sum += change;
                self.loss_count += 1;
            }
            let r = change / prev.abs();
            if r.is_finite() {
                self.returns.push(r);
            }
        }
        self.previous = Some(equity);
    }
}

/// Statistics over `equity`, where `equity[0]` is the starting capital and
/// consecutive points are `bar_ms` apart.
pub fn equity_stats(equity: &[f64], bar_ms: i64) -> EquityStats {
    let mut acc = EquityAccumulator::default();
    for &e in equity {
        acc.push(e);
    }
    let steps = equity.len().saturating_sub(1);
    let initial_equity = equity.first().copied().unwrap_or(0.0);
    let final_equity = equity.last().copied().unwrap_or(0.0);
    let pnl_pct = ratio_or_sentinel(final_equity - initial_equity, initial_equity) * 100.0;

    let ppy = periods_per_year(bar_ms);
    let span_years = steps as f64 * bar_ms as f64 / MS_PER_YEAR;
    let annualize = ppy.sqrt();

    let returns = &acc.returns;
    let mean_return = bitquant_ops::stats::mean(returns);
    let annual_sharpe = if returns.len() < 2 {
        0.0
    } else {
        ratio_or_sentinel(mean_return, bitquant_ops::stats::std_dev(returns, 1)) * annualize
    };
    let downside: Vec<f64> = returns.iter().map(|r| r.min(0.0)).collect();
    let annual_sortino = if returns.is_empty() {
        0.0
    } else {
        ratio_or_sentinel(mean_return, bitquant_ops::stats::std_dev(&downside, 0)) * annualize
    };

    let changed = acc.gain_count + acc.loss_count;
    let mean_gain = ratio_or_sentinel(acc.gain_sum, acc.gain_count as f64);
    let mean_loss = ratio_or_sentinel(acc.loss_sum, acc.loss_count as f64);

    EquityStats {
        steps,
        initial_equity,
        final_equity,
        pnl_pct,
        pnl_pct_per_step: ratio_or_sentinel(pnl_pct, steps as f64),
        annual_pnl_pct: ratio_or_sentinel(pnl_pct, span_years),
        annual_sharpe,
        annual_sortino,
        max_drawdown_pct: acc.max_drawdown * 100.0,
        win_rate_pct: ratio_or_sentinel(acc.gain_count as f64, changed as f64) * 100.0,
        avg_win_loss_ratio_pct: ratio_or_sentinel(mean_gain, mean_loss.abs()) * 100.0,
    }
}

/// Turnover of traded notional in units of `order_size`, bucketed by hour.
///
/// `notional` is `step × symbol` and `timestamps` are the fill times. Every
/// hour between the first and last fill is a bucket, empty ones count as
/// zero. Returns the per-symbol mean hourly turnover.
pub fn hourly_turnover(timestamps: &[i64], notional: &Matrix, order_size: f64) -> Vec<f64> {
    let cols = notional.cols();
    let (Some(&first), Some(&last)) = (timestamps.first(), timestamps.last()) else {
        return vec![0.0; cols];
    };
    let first_bucket = first.div_euclid(MS_PER_HOUR);
    let buckets = (last.div_euclid(MS_PER_HOUR) - first_bucket + 1).max(1) as usize;
    let mut totals = vec![0.0; cols];
    for row in notional.iter_rows() {
        for (total, &value) in totals.iter_mut().zip(row) {
            if value.is_finite() {
                *total += value;
            }
        }
    }
    totals
        .into_iter()
        .map(|total| total / order_size / buckets as f64)
        .collect()
}
