use bitquant_ops::stats::{self, mean, std_dev};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{AggregatorConfig, IcType, RollingType};
use crate::error::{QuantError, Result};
use crate::factor::FactorTable;
use crate::matrix::Matrix;

/// Per-symbol scores indexed by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreTable {
    pub timestamps: Vec<i64>,
    pub symbols: Vec<String>,
    /// `time × symbol`
    pub values: Matrix,
}

impl ScoreTable {
    pub fn n_rows(&self) -> usize {
        self.timestamps.len()
    }

    /// The actionable prediction: the last row and its timestamp.
    pub fn latest(&self) -> Option<(i64, &[f64])> {
        let last = self.timestamps.len().checked_sub(1)?;
        Some((self.timestamps[last], self.values.row(last)))
    }
}

/// Everything the aggregator derives on the way to a score table.
#[derive(Debug, Clone)]
pub struct IcAnalysis {
    /// Raw information coefficients, `time × factor`, aligned with the
    /// factor table rows.
    pub ic: Matrix,
    /// Rolled factor weights, `time × factor`, aligned with `scores` rows.
    pub weights: Matrix,
    pub scores: ScoreTable,
}

/// Combines factors into one score per symbol using rolling IC weights.
#[derive(Debug, Clone, Copy)]
pub struct IcAggregator {
    pub training_window: usize,
    pub rolling_type: RollingType,
    pub ic_type: IcType,
}

impl IcAggregator {
    pub fn from_config(config: &AggregatorConfig) -> Self {
        Self {
            training_window: config.training_window,
            rolling_type: config.rolling_type,
            ic_type: config.ic_type,
        }
    }

    /// Cross-sectional correlation between each factor and the forward
    /// return at every timestamp. Undefined correlations stay `NaN`.
    pub fn information_coefficients(&self, table: &FactorTable, target: &Matrix) -> Result<Matrix> {
        if target.rows() != table.n_rows() || target.cols() != table.n_symbols() {
            return Err(QuantError::alignment(format!(
                "target shape {}x{} does not match factor table {}x{}",
                target.rows(),
                target.cols(),
                table.n_rows(),
                table.n_symbols()
            )));
        }
        let correlate: fn(&[f64], &[f64]) -> f64 = match self.ic_type {
            IcType::Pearson => stats::pearson,
            IcType::Spearman => stats::spearman,
        };
        let rows: Vec<Vec<f64>> = (0..table.n_rows())
            .into_par_iter()
            .map(|t| {
                let returns = target.row(t);
                table
                    .values()
                    .iter()
                    .map(|factor| correlate(factor.row(t), returns))
                    .collect()
            })
            .collect();
        Ok(Matrix::new(
            table.n_rows(),
            table.n_factors(),
            rows.into_iter().flatten().collect(),
        ))
    }

    /// Rolled per-factor weights for rows `training_window - 1 ..` of `ic`.
    ///
    /// The IC table is lagged one row first so the weight at `t` only uses
    /// correlations whose forward returns were realised by `t`. Undefined
    /// correlations contribute zero.
    pub fn rolled_weights(&self, ic: &Matrix) -> Result<Matrix> {
        let window = self.training_window;
        let (n, k) = (ic.rows(), ic.cols());
        if window == 0 || n < window {
            return Err(QuantError::InsufficientHistory {
                stage: "IC aggregation",
                required: window.max(1),
                available: n,
            });
        }
        let lagged = lag_ic(ic);
        let out_rows = n - window + 1;
        if k == 0 {
            return Ok(Matrix::zeros(out_rows, 0));
        }

        let weights = match self.rolling_type {
            RollingType::Avg => lagged
                .map_columns(|c| bitquant_ops::sma(c, window))
                .slice_rows(window - 1, n),
            RollingType::Ewm => lagged
                .map_columns(|c| ewm_mean(c, window))
                .slice_rows(window - 1, n),
            RollingType::IcIr => lagged
                .map_columns(|c| {
                    bitquant_ops::rolling::rolling_apply(c, window, |w| mean(w) / std_dev(w, 1))
                })
                .slice_rows(window - 1, n),
            RollingType::MaxIcIr => {
                let rows: Vec<Vec<f64>> = (0..out_rows)
                    .into_par_iter()
                    .map(|start| max_ic_ir_weights(&lagged.slice_rows(start, start + window)))
                    .collect();
                Matrix::new(out_rows, k, rows.into_iter().flatten().collect())
            }
        };
        Ok(weights.map(|w| if w.is_finite() { w } else { 0.0 }))
    }

    /// Dot the rolled weights with each row's exposures.
    pub fn scores(&self, table: &FactorTable, weights: &Matrix) -> ScoreTable {
        let offset = table.n_rows() - weights.rows();
        let n_symbols = table.n_symbols();
        let mut values = Matrix::zeros(weights.rows(), n_symbols);
        for r in 0..weights.rows() {
            let t = r + offset;
            let row_weights = weights.row(r);
            let scores = values.row_mut(r);
            for (factor, &w) in table.values().iter().zip(row_weights) {
                for (score, &x) in scores.iter_mut().zip(factor.row(t)) {
                    if x.is_finite() {
                        *score += w * x;
                    }
                }
            }
        }
        ScoreTable {
            timestamps: table.timestamps()[offset..].to_vec(),
            symbols: table.symbols().to_vec(),
            values,
        }
    }

    /// Run the full IC pipeline. The latest score row is the live
    /// prediction; earlier rows drive backtests.
    pub fn predict(&self, table: &FactorTable, target: &Matrix) -> Result<IcAnalysis> {
        if table.n_factors() == 0 {
            warn!("no factors left after selection; scores are all zero");
        }
        let ic = self.information_coefficients(table, target)?;
        let weights = self.rolled_weights(&ic)?;
        let scores = self.scores(table, &weights);
        debug!(
            undefined_ic = ic.as_slice().iter().filter(|v| v.is_nan()).count(),
            "computed information coefficients"
        );
        info!(
            rows = scores.n_rows(),
            factors = table.n_factors(),
            rolling = ?self.rolling_type,
            ic = ?self.ic_type,
            "aggregated factor scores"
        );
        Ok(IcAnalysis {
            ic,
            weights,
            scores,
        })
    }
}

/// Shift down one row. The first row, which has no history, takes the
/// unshifted first row. Undefined values become zero.
fn lag_ic(ic: &Matrix) -> Matrix {
    let (n, k) = (ic.rows(), ic.cols());
    let mut out = Matrix::zeros(n, k);
    for t in 0..n {
        let source = ic.row(t.saturating_sub(1));
        for (dst, &v) in out.row_mut(t).iter_mut().zip(source) {
            *dst = if v.is_finite() { v } else { 0.0 };
        }
    }
    out
}

/// Adjusted exponentially weighted mean with centre of mass `com`.
/// A window of one leaves the series unchanged.
fn ewm_mean(values: &[f64], com: usize) -> Vec<f64> {
    if com <= 1 {
        return values.to_vec();
    }
    let decay = 1.0 - 1.0 / (1.0 + com as f64);
    let (mut num, mut den) = (0.0, 0.0);
    values
        .iter()
        .map(|&x| {
            num = x + decay * num;
            den = 1.0 + decay * den;
            num / den
        })
        .collect()
}

/// `Σ⁻¹·mean(IC)` scaled to unit absolute sum, or `mean / Σ|mean|` when the
/// window covariance is singular.
fn max_ic_ir_weights(window: &Matrix) -> Vec<f64> {
    let (n, k) = (window.rows(), window.cols());
    let means: Vec<f64> = (0..k).map(|f| mean(&window.column(f))).collect();
    let fallback = || normalize_abs(&means);
    if n < 2 || k == 0 {
        return fallback();
    }

    let data = DMatrix::from_row_slice(n, k, window.as_slice());
    let mut centered = data.clone();
    for (mut column, m) in centered.column_iter_mut().zip(&means) {
        column.add_scalar_mut(-m);
    }
    let cov = (centered.transpose() * &centered) / (n as f64 - 1.0);
    let det = cov.determinant();
    if det == 0.0 || !det.is_finite() {
        return fallback();
    }
    match cov.try_inverse() {
        Some(inverse) => {
            let raw = inverse * DVector::from_column_slice(&means);
            normalize_abs(raw.as_slice())
        }
        None => fallback(),
    }
}

fn normalize_abs(values: &[f64]) -> Vec<f64> {
    let total: f64 = values.iter().map(|v| v.abs()).sum();
    values
        .iter()
        .map(|v| {
            let w = v / total;
            if w.is_finite() { w } else { 0.0 }
        })
        .collect()
}
