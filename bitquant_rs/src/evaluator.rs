use tracing::{info, warn};

use crate::config::SimulationConfig;
use crate::error::{QuantError, Result};
use crate::matrix::Matrix;
use crate::panel::Panel;
use crate::portfolio::{PortfolioRecord, ensure_delta_neutral};
use crate::simulator::{SymbolSpec, execute};

/// Scores one submitted weight schedule over a short price window.
///
/// The schedule must be delta neutral on every row; otherwise nothing is
/// simulated. The score is the profit ratio `final_value / init_cash - 1`,
/// where the final value marks the last positions at the window's last close.
#[derive(Debug, Clone)]
pub struct Evaluator {
    pub config: SimulationConfig,
    pub specs: Vec<SymbolSpec>,
}

/// Submitted weights and the prices they are replayed against, all
/// `step × symbol` in the panel's symbol order.
#[derive(Debug, Clone)]
pub struct EvaluationWindow {
    pub timestamps: Vec<i64>,
    pub weights: Matrix,
    pub open: Matrix,
    pub close: Matrix,
}

impl Evaluator {
    pub fn new(config: SimulationConfig, specs: Vec<SymbolSpec>) -> Self {
        Self { config, specs }
    }

    pub fn evaluate(&self, weights: &Matrix, open: &Matrix, close: &Matrix) -> Result<f64> {
        ensure_delta_neutral(weights, self.config.neutrality_epsilon, "evaluation")?;
        if weights.rows() == 0 {
            return Err(QuantError::alignment("evaluation window is empty"));
        }
        if close.rows() != weights.rows() || close.cols() != weights.cols() {
            return Err(QuantError::alignment(format!(
                "close prices are {}x{}, weights are {}x{}",
                close.rows(),
                close.cols(),
                weights.rows(),
                weights.cols()
            )));
        }
        let execution = execute(weights, open, &self.specs, &self.config)?;
        let last = weights.rows() - 1;
        let holdings: f64 = execution
            .positions
            .row(last)
            .iter()
            .zip(close.row(last))
            .map(|(units, price)| units * price)
            .filter(|value| value.is_finite())
            .sum();
        let final_value = execution.cash[last] + holdings;
        let profit_ratio = final_value / self.config.init_cash - 1.0;
        info!(
            steps = weights.rows(),
            final_value,
            profit_ratio,
            "evaluated submission"
        );
        Ok(profit_ratio)
    }

    pub fn evaluate_window(&self, window: &EvaluationWindow) -> Result<f64> {
        self.evaluate(&window.weights, &window.open, &window.close)
    }
}

/// Place submitted records on the panel's bars.
///
/// Records are sorted by timestamp and each must land exactly on a panel
/// bar. Panel symbols absent from a record's universe get a zero weight; any
/// symbol the panel does not carry is an invalid portfolio, whatever its
/// weight.
pub fn align_records(records: &[PortfolioRecord], panel: &Panel) -> Result<EvaluationWindow> {
    if records.is_empty() {
        return Err(QuantError::alignment("no portfolio records to evaluate"));
    }
    let mut ordered: Vec<&PortfolioRecord> = records.iter().collect();
    ordered.sort_by_key(|record| record.timestamp);
    if let Some(pair) = ordered
        .windows(2)
        .find(|pair| pair[0].timestamp == pair[1].timestamp)
    {
        return Err(QuantError::alignment(format!(
            "two records share timestamp {}",
            pair[0].timestamp
        )));
    }

    let m = panel.n_symbols();
    let n = ordered.len();
    let mut weights = Matrix::zeros(n, m);
    let mut open = Matrix::zeros(n, m);
    let mut close = Matrix::zeros(n, m);
    let mut timestamps = Vec::with_capacity(n);
    for (i, record) in ordered.iter().enumerate() {
        let row = panel.row_of(record.timestamp).ok_or_else(|| {
            QuantError::alignment(format!(
                "no panel bar at record timestamp {}",
                record.timestamp
            ))
        })?;
        for (symbol, w) in record.portfolio.iter() {
            let col = panel.symbols().iter().position(|s| s == symbol).ok_or_else(|| {
                QuantError::portfolio(format!(
                    "record at {} names {symbol}, which the panel does not carry",
                    record.timestamp
                ))
            })?;
            weights.set(i, col, w);
        }
        open.row_mut(i).copy_from_slice(panel.open().row(row));
        close.row_mut(i).copy_from_slice(panel.close().row(row));
        timestamps.push(record.timestamp);
    }
    if let Some(interval) = panel.bar_interval_ms() {
        let gaps = timestamps
            .windows(2)
            .filter(|pair| pair[1] - pair[0] != interval)
            .count();
        if gaps > 0 {
            warn!(gaps, "evaluation records skip panel bars");
        }
    }
    Ok(EvaluationWindow {
        timestamps,
        weights,
        open,
        close,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator(fee: f64) -> Evaluator {
        Evaluator::new(
            SimulationConfig {
                init_cash: 1000.0,
                order_size: 1000.0,
                taker_fee: fee,
                neutrality_epsilon: 1e-6,
            },
            vec![SymbolSpec::unconstrained(); 2],
        )
    }

    #[test]
    fn non_neutral_weights_fail_before_simulation() {
        let weights = Matrix::from_rows(&[vec![0.6, -0.3]]);
        // mismatched prices would fail later; neutrality is checked first
        let err = evaluator(0.0)
            .evaluate(&weights, &Matrix::zeros(0, 0), &Matrix::zeros(0, 0))
            .expect_err("not neutral");
        assert!(err.to_string().contains("not always delta neutral"));
    }

    #[test]
    fn profit_ratio_marks_at_last_close() {
        let weights = Matrix::from_rows(&[vec![0.5, -0.5], vec![0.5, -0.5]]);
        let open = Matrix::filled(2, 2, 100.0);
        let close = Matrix::from_rows(&[vec![100.0, 100.0], vec![120.0, 100.0]]);
        let ratio = evaluator(0.0)
            .evaluate(&weights, &open, &close)
            .expect("evaluate");
        // long 5 units gains 20 each
        assert!((ratio - 0.1).abs() < 1e-12);
    }

    #[test]
    fn zero_weights_return_zero() {
        let weights = Matrix::zeros(3, 2);
        let prices = Matrix::filled(3, 2, 50.0);
        let ratio = evaluator(0.001)
            .evaluate(&weights, &prices, &prices)
            .expect("evaluate");
        assert_eq!(ratio, 0.0);
    }

    fn two_symbol_panel() -> Panel {
        let fields = (0..9).map(|_| Matrix::filled(3, 2, 100.0)).collect();
        Panel::from_kline_fields(
            vec![0, 60_000, 120_000],
            vec!["A".into(), "B".into()],
            fields,
        )
        .expect("panel")
    }

    fn record(timestamp: i64, symbols: &[&str], weights: Vec<f64>) -> PortfolioRecord {
        let universe = std::sync::Arc::new(
            crate::portfolio::SymbolUniverse::new(symbols.iter().map(|s| s.to_string()).collect())
                .expect("universe"),
        );
        PortfolioRecord {
            timestamp,
            portfolio: crate::portfolio::Portfolio::from_weights(universe, weights)
                .expect("portfolio"),
        }
    }

    #[test]
    fn records_land_on_panel_bars_in_time_order() {
        let panel = two_symbol_panel();
        let window = align_records(
            &[
                record(120_000, &["B"], vec![0.0]),
                record(60_000, &["B", "A"], vec![0.5, -0.5]),
            ],
            &panel,
        )
        .expect("aligned");
        assert_eq!(window.timestamps, vec![60_000, 120_000]);
        assert_eq!(window.weights.row(0), &[-0.5, 0.5]);
        assert_eq!(window.weights.row(1), &[0.0, 0.0]);
    }

    #[test]
    fn symbols_outside_the_panel_are_invalid_even_at_zero_weight() {
        let panel = two_symbol_panel();
        let err = align_records(&[record(0, &["A", "ZZZ"], vec![0.0, 0.0])], &panel)
            .expect_err("unknown symbol");
        assert!(matches!(err, QuantError::InvalidPortfolio { .. }));
    }
}
