//! Sequential order simulation over a weight schedule.
//!
//! Every step fills at the bar's open and marks at the same bar's close. The
//! loop is strictly sequential: the order at step `i` depends on the
//! position carried out of step `i - 1`.

use serde::Serialize;
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::error::{QuantError, Result};
use crate::matrix::Matrix;
use crate::stats::{EquityStats, equity_stats, hourly_turnover, ratio_or_sentinel};

/// Exchange trading rules for one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolSpec {
    /// Decimal places an order quantity is rounded to.
    pub volume_precision: u32,
    /// Smallest accepted order value in quote currency.
    pub min_notional: f64,
}

impl SymbolSpec {
    /// Whole-unit lots and no minimum order value.
    pub fn unconstrained() -> Self {
        Self {
            volume_precision: 0,
            min_notional: 0.0,
        }
    }
}

/// Round half to even at `precision` decimal places.
pub fn round_units(units: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision as i32);
    (units * scale).round_ties_even() / scale
}

/// Fill and mark prices for each step of a weight schedule.
#[derive(Debug, Clone)]
pub struct ExecutionPrices {
    /// Time of each fill (the bar open).
    pub timestamps: Vec<i64>,
    /// Fill prices, `step × symbol`.
    pub open: Matrix,
    /// Mark prices, `step × symbol`.
    pub close: Matrix,
    pub bar_ms: i64,
}

impl ExecutionPrices {
    pub fn steps(&self) -> usize {
        self.timestamps.len()
    }

    /// Time at which step `i` is marked: the close of its bar.
    pub fn marked_timestamps(&self) -> Vec<i64> {
        self.timestamps.iter().map(|ts| ts + self.bar_ms).collect()
    }
}

/// Raw output of the fill loop.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Units held after each step, `step × symbol`.
    pub positions: Matrix,
    /// Cash after each step.
    pub cash: Vec<f64>,
    /// Signed units traded at each step, `step × symbol`.
    pub orders: Matrix,
    pub fee_cost: f64,
    /// Orders zeroed by the minimum-notional rule.
    pub rejected_orders: usize,
}

/// Run the rebalance loop.
///
/// At each step the current weight of a symbol is `position * price /
/// order_size`; the difference to the target weight is converted to units,
/// rounded to the symbol's precision, and dropped when its notional is below
/// the symbol's minimum. Buys pay `1 + fee`, sells receive `1 - fee`.
pub fn execute(
    weights: &Matrix,
    fill_prices: &Matrix,
    specs: &[SymbolSpec],
    config: &SimulationConfig,
) -> Result<Execution> {
    let (steps, m) = (weights.rows(), weights.cols());
    if fill_prices.rows() != steps || fill_prices.cols() != m {
        return Err(QuantError::alignment(format!(
            "weights are {steps}x{m} but fill prices are {}x{}",
            fill_prices.rows(),
            fill_prices.cols()
        )));
    }
    if specs.len() != m {
        return Err(QuantError::alignment(format!(
            "{} symbol specs for {m} symbols",
            specs.len()
        )));
    }

    let order_size = config.order_size;
    let fee = config.taker_fee;
    let mut position = vec![0.0; m];
    let mut cash = config.init_cash;
    let mut positions = Matrix::zeros(steps, m);
    let mut orders = Matrix::zeros(steps, m);
    let mut cash_path = Vec::with_capacity(steps);
    let mut fee_cost = 0.0;
    let mut rejected_orders = 0usize;

    for i in 0..steps {
        let target = weights.row(i);
        let prices = fill_prices.row(i);
        for (j, spec) in specs.iter().enumerate() {
            let w = target[j];
            if !w.is_finite() {
                return Err(QuantError::portfolio(format!(
                    "non-finite weight {w} at step {i}, symbol {j}"
                )));
            }
            let price = prices[j];
            if !(price.is_finite() && price > 0.0) {
                continue;
            }
            let current = position[j] * price / order_size;
            let mut units = round_units((w - current) * order_size / price, spec.volume_precision);
            if units != 0.0 && units.abs() * price < spec.min_notional {
                rejected_orders += 1;
                units = 0.0;
            }
            if units == 0.0 {
                continue;
            }
            let multiplier = if units > 0.0 { 1.0 + fee } else { 1.0 - fee };
            cash -= units * price * multiplier;
            fee_cost += units.abs() * price * fee;
            position[j] += units;
            orders.set(i, j, units);
        }
        positions.row_mut(i).copy_from_slice(&position);
        cash_path.push(cash);
    }

    Ok(Execution {
        positions,
        cash: cash_path,
        orders,
        fee_cost,
        rejected_orders,
    })
}

/// Metrics of one backtest, ready to be written as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMetrics {
    #[serde(flatten)]
    pub equity: EquityStats,
    /// Sum over symbols of the mean hourly turnover.
    pub turnover: f64,
    pub turnover_per_symbol: Vec<(String, f64)>,
    pub n_trades: usize,
    pub rejected_orders: usize,
    pub traded_notional: f64,
    pub taker_fee_cost: f64,
    pub min_net_leverage: f64,
    pub max_net_leverage: f64,
    pub min_gross_leverage: f64,
    pub max_gross_leverage: f64,
    pub data_fingerprint: Option<String>,
}

/// Full result of [`Simulator::run`]: metrics plus the per-step series.
#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub symbols: Vec<String>,
    pub fill_timestamps: Vec<i64>,
    pub marked_timestamps: Vec<i64>,
    pub positions: Matrix,
    pub cash: Vec<f64>,
    pub equity: Vec<f64>,
    pub net_leverage: Vec<f64>,
    pub gross_leverage: Vec<f64>,
    pub metrics: ReportMetrics,
}

/// Replays a weight schedule against prices and reports performance.
#[derive(Debug, Clone)]
pub struct Simulator {
    pub config: SimulationConfig,
    pub symbols: Vec<String>,
    pub specs: Vec<SymbolSpec>,
}

impl Simulator {
    pub fn new(config: SimulationConfig, symbols: Vec<String>, specs: Vec<SymbolSpec>) -> Self {
        Self {
            config,
            symbols,
            specs,
        }
    }

    pub fn run(&self, weights: &Matrix, prices: &ExecutionPrices) -> Result<BacktestReport> {
        if prices.steps() != weights.rows() {
            return Err(QuantError::alignment(format!(
                "{} weight rows for {} price steps",
                weights.rows(),
                prices.steps()
            )));
        }
        if self.symbols.len() != weights.cols() {
            return Err(QuantError::alignment(format!(
                "{} symbols for {} weight columns",
                self.symbols.len(),
                weights.cols()
            )));
        }
        if prices.close.rows() != weights.rows() || prices.close.cols() != weights.cols() {
            return Err(QuantError::alignment("mark prices do not match the weights"));
        }
        let execution = execute(weights, &prices.open, &self.specs, &self.config)?;

        let steps = weights.rows();
        let mut equity = Vec::with_capacity(steps);
        let mut net_leverage = Vec::with_capacity(steps);
        let mut gross_leverage = Vec::with_capacity(steps);
        for i in 0..steps {
            let (net, gross) = execution
                .positions
                .row(i)
                .iter()
                .zip(prices.close.row(i))
                .map(|(units, price)| units * price)
                .filter(|value| value.is_finite())
                .fold((0.0, 0.0), |(net, gross), value| {
                    (net + value, gross + value.abs())
                });
            let e = execution.cash[i] + net;
            equity.push(e);
            net_leverage.push(ratio_or_sentinel(net, e));
            gross_leverage.push(ratio_or_sentinel(gross, e));
        }

        let traded = execution
            .orders
            .zip_map(&prices.open, |units, price| (units * price).abs());
        let per_symbol = hourly_turnover(&prices.timestamps, &traded, self.config.order_size);
        let n_trades = execution
            .orders
            .as_slice()
            .iter()
            .filter(|&&units| units != 0.0)
            .count();

        let mut curve = Vec::with_capacity(steps + 1);
        curve.push(self.config.init_cash);
        curve.extend_from_slice(&equity);
        let metrics = ReportMetrics {
            equity: equity_stats(&curve, prices.bar_ms),
            turnover: per_symbol.iter().sum(),
            turnover_per_symbol: self.symbols.iter().cloned().zip(per_symbol).collect(),
            n_trades,
            rejected_orders: execution.rejected_orders,
            traded_notional: traded.as_slice().iter().filter(|v| v.is_finite()).sum(),
            taker_fee_cost: execution.fee_cost,
            min_net_leverage: fold_min(&net_leverage),
            max_net_leverage: fold_max(&net_leverage),
            min_gross_leverage: fold_min(&gross_leverage),
            max_gross_leverage: fold_max(&gross_leverage),
            data_fingerprint: None,
        };
        debug!(
            rejected = execution.rejected_orders,
            fee_cost = execution.fee_cost,
            "order loop finished"
        );
        info!(
            steps,
            pnl_pct = metrics.equity.pnl_pct,
            sharpe = metrics.equity.annual_sharpe,
            max_dd_pct = metrics.equity.max_drawdown_pct,
            trades = n_trades,
            "backtest finished"
        );

        Ok(BacktestReport {
            symbols: self.symbols.clone(),
            fill_timestamps: prices.timestamps.clone(),
            marked_timestamps: prices.marked_timestamps(),
            positions: execution.positions,
            cash: execution.cash,
            equity,
            net_leverage,
            gross_leverage,
            metrics,
        })
    }
}

fn fold_min(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn fold_max(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}
