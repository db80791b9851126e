use std::sync::Arc;

use tracing::{info, warn};

use crate::aggregator::{IcAggregator, IcAnalysis, ScoreTable};
use crate::config::{Config, Construction};
use crate::error::{QuantError, Result};
use crate::factor::{FactorCalculator, FactorTable};
use crate::matrix::Matrix;
use crate::panel::Panel;
use crate::portfolio::{Portfolio, PortfolioRecord, SymbolUniverse, ensure_delta_neutral};
use crate::scaler::FactorScaler;
use crate::selector::FactorSelector;
use crate::simulator::{BacktestReport, ExecutionPrices, Simulator};

/// Intermediate tables of one signal computation.
#[derive(Debug, Clone)]
pub struct SignalRun {
    pub factors: FactorTable,
    pub scaled: FactorTable,
    pub selected: Vec<String>,
    pub analysis: IcAnalysis,
}

/// Multi-factor strategy: factors → scaling → selection → IC aggregation →
/// delta-neutral weights.
#[derive(Debug, Clone)]
pub struct StrategyEngine {
    pub factors: Vec<String>,
    pub calculator: FactorCalculator,
    pub scaler: FactorScaler,
    pub selector: FactorSelector,
    pub aggregator: IcAggregator,
    pub construction: Construction,
    pub neutrality_epsilon: f64,
}

impl StrategyEngine {
    pub fn from_config(config: &Config) -> Self {
        Self {
            factors: config.factors.clone(),
            calculator: FactorCalculator,
            scaler: FactorScaler::from_config(&config.scaler),
            selector: FactorSelector::from_config(&config.selector),
            aggregator: IcAggregator::from_config(&config.aggregator),
            construction: config.construction,
            neutrality_epsilon: config.simulation.neutrality_epsilon,
        }
    }

    /// Score every usable panel row.
    pub fn signal(&self, panel: &Panel) -> Result<SignalRun> {
        let factors = self.calculator.compute(panel, &self.factors)?;
        let scaled = self.scaler.scale(&factors)?;
        let selected = self.selector.select(&scaled);
        let chosen = scaled.select(&selected);
        let offset = panel.n_rows() - scaled.n_rows();
        let target = panel.returns().slice_rows(offset, panel.n_rows());
        let analysis = self.aggregator.predict(&chosen, &target)?;
        Ok(SignalRun {
            factors,
            scaled,
            selected,
            analysis,
        })
    }

    /// Portfolio for the latest bar.
    pub fn run(&self, panel: &Panel) -> Result<PortfolioRecord> {
        let signal = self.signal(panel)?;
        let (timestamp, scores) = signal
            .analysis
            .scores
            .latest()
            .ok_or_else(|| QuantError::alignment("no score rows to trade on"))?;
        let weights = weights_from_scores(scores, self.construction);
        ensure_delta_neutral(
            &Matrix::new(1, weights.len(), weights.clone()),
            self.neutrality_epsilon,
            "latest portfolio",
        )?;
        let universe = Arc::new(SymbolUniverse::new(panel.symbols().to_vec())?);
        let portfolio = Portfolio::from_weights(universe, weights)?;
        info!(
            timestamp,
            gross = portfolio.gross_exposure(),
            factors = signal.selected.len(),
            "built portfolio"
        );
        Ok(PortfolioRecord {
            timestamp,
            portfolio,
        })
    }

    /// One weight row per score row.
    pub fn weight_matrix(&self, scores: &ScoreTable) -> Result<Matrix> {
        let rows: Vec<Vec<f64>> = scores
            .values
            .iter_rows()
            .map(|row| weights_from_scores(row, self.construction))
            .collect();
        let weights = Matrix::new(
            scores.values.rows(),
            scores.values.cols(),
            rows.into_iter().flatten().collect(),
        );
        ensure_delta_neutral(&weights, self.neutrality_epsilon, "backtest weights")?;
        Ok(weights)
    }

    /// Replay the historical scores. Weights decided at bar `t` fill at the
    /// open of bar `t + 1` and are marked at its close.
    pub fn run_backtest(
        &self,
        panel: &Panel,
        simulator: &Simulator,
    ) -> Result<(SignalRun, BacktestReport)> {
        let signal = self.signal(panel)?;
        let weights = self.weight_matrix(&signal.analysis.scores)?;
        let prices = next_bar_prices(panel, &signal.analysis.scores.timestamps)?;
        let mut report = simulator.run(&weights, &prices)?;
        report.metrics.data_fingerprint = Some(panel.fingerprint());
        Ok((signal, report))
    }
}

/// Convert one row of scores to weights.
///
/// Every construction yields a vector summing to zero, or all zeros when the
/// scores cannot separate symbols.
pub fn weights_from_scores(scores: &[f64], construction: Construction) -> Vec<f64> {
    let n = scores.len();
    if n == 0 {
        return Vec::new();
    }
    match construction {
        Construction::Normalized => {
            if scores.iter().all(|&s| s == scores[0]) {
                return vec![0.0; n];
            }
            let mean = scores.iter().sum::<f64>() / n as f64;
            let centered: Vec<f64> = scores.iter().map(|s| s - mean).collect();
            let abs_sum: f64 = centered.iter().map(|v| v.abs()).sum();
            if abs_sum == 0.0 || !abs_sum.is_finite() {
                return vec![0.0; n];
            }
            centered.into_iter().map(|v| v / abs_sum).collect()
        }
        Construction::QuantileLongShort { fraction } => {
            let count = (n as f64 * fraction).floor() as usize;
            if count == 0 || 2 * count > n {
                if count > 0 {
                    warn!(fraction, symbols = n, "quantile legs would overlap");
                }
                return vec![0.0; n];
            }
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
            let leg = 0.5 / count as f64;
            let mut weights = vec![0.0; n];
            for &i in &order[..count] {
                weights[i] = -leg;
            }
            for &i in &order[n - count..] {
                weights[i] = leg;
            }
            weights
        }
    }
}

/// Fill/mark prices for score rows at `signal_timestamps`: the next bar's
/// open and close. The panel's last bar has no successor, so its close is
/// used for both.
pub fn next_bar_prices(panel: &Panel, signal_timestamps: &[i64]) -> Result<ExecutionPrices> {
    let bar_ms = panel
        .bar_interval_ms()
        .ok_or_else(|| QuantError::alignment("a backtest needs at least two bars"))?;
    let m = panel.n_symbols();
    let n = signal_timestamps.len();
    let mut open = Matrix::zeros(n, m);
    let mut close = Matrix::zeros(n, m);
    let mut timestamps = Vec::with_capacity(n);
    for (i, &ts) in signal_timestamps.iter().enumerate() {
        let row = panel
            .row_of(ts)
            .ok_or_else(|| QuantError::alignment(format!("no panel bar at {ts}")))?;
        if row + 1 < panel.n_rows() {
            open.row_mut(i).copy_from_slice(panel.open().row(row + 1));
            close.row_mut(i).copy_from_slice(panel.close().row(row + 1));
        } else {
            open.row_mut(i).copy_from_slice(panel.close().row(row));
            close.row_mut(i).copy_from_slice(panel.close().row(row));
        }
        timestamps.push(ts + bar_ms);
    }
    Ok(ExecutionPrices {
        timestamps,
        open,
        close,
        bar_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_weights_are_neutral_and_fully_invested() {
        let w = weights_from_scores(&[3.0, 1.0, -2.0, 0.5], Construction::Normalized);
        assert!(w.iter().sum::<f64>().abs() < 1e-12);
        assert!((w.iter().map(|v| v.abs()).sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(w[0] > w[1] && w[1] > w[3] && w[3] > w[2]);
    }

    #[test]
    fn equal_scores_give_zero_weights() {
        let w = weights_from_scores(&[0.1, 0.1, 0.1], Construction::Normalized);
        assert_eq!(w, vec![0.0; 3]);
    }

    #[test]
    fn quantile_legs_are_half_each() {
        let scores = [5.0, 1.0, 3.0, 4.0, 2.0];
        let w = weights_from_scores(
            &scores,
            Construction::QuantileLongShort { fraction: 0.4 },
        );
        assert_eq!(w, vec![0.25, -0.25, 0.0, 0.25, -0.25]);

        let none = weights_from_scores(
            &scores,
            Construction::QuantileLongShort { fraction: 0.1 },
        );
        assert_eq!(none, vec![0.0; 5]);
    }
}
