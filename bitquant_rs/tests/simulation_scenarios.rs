mod common;

use anyhow::Result;
use bitquant_rs::aggregator::IcAggregator;
use bitquant_rs::config::{IcType, RollingType, SimulationConfig};
use bitquant_rs::error::QuantError;
use bitquant_rs::evaluator::Evaluator;
use bitquant_rs::factor::{FactorCalculator, FactorTable};
use bitquant_rs::matrix::Matrix;
use bitquant_rs::simulator::{ExecutionPrices, Simulator, SymbolSpec, round_units};

use common::{HOUR_MS, START_MS, panel_from_close, symbols};

fn sim_config(init_cash: f64, order_size: f64, taker_fee: f64) -> SimulationConfig {
    SimulationConfig {
        init_cash,
        order_size,
        taker_fee,
        neutrality_epsilon: 1e-6,
    }
}

fn flat_prices(steps: usize, cols: usize, price: f64) -> ExecutionPrices {
    ExecutionPrices {
        timestamps: (0..steps as i64).map(|i| START_MS + i * HOUR_MS).collect(),
        open: Matrix::filled(steps, cols, price),
        close: Matrix::filled(steps, cols, price),
        bar_ms: HOUR_MS,
    }
}

#[test]
fn hedged_pair_at_flat_price_keeps_equity() -> Result<()> {
    let weights = Matrix::from_rows(&vec![vec![0.5, -0.5]; 5]);
    let simulator = Simulator::new(
        sim_config(1000.0, 1000.0, 0.0),
        symbols(2),
        vec![SymbolSpec::unconstrained(); 2],
    );
    let report = simulator.run(&weights, &flat_prices(5, 2, 100.0))?;

    for row in report.positions.iter_rows() {
        assert_eq!(row, &[5.0, -5.0]);
    }
    assert!(report.cash.iter().all(|&c| (c - 1000.0).abs() < 1e-9));
    assert!(report.equity.iter().all(|&e| (e - 1000.0).abs() < 1e-9));
    assert_eq!(report.metrics.n_trades, 2);
    assert_eq!(report.metrics.equity.pnl_pct, 0.0);
    assert!((report.metrics.max_gross_leverage - 1.0).abs() < 1e-12);
    assert_eq!(report.metrics.max_net_leverage, 0.0);
    assert_eq!(
        report.marked_timestamps,
        report
            .fill_timestamps
            .iter()
            .map(|ts| ts + HOUR_MS)
            .collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn evaluator_rejects_unhedged_weights() {
    let evaluator = Evaluator::new(
        sim_config(1000.0, 1000.0, 0.0),
        vec![SymbolSpec::unconstrained(); 2],
    );
    let weights = Matrix::from_rows(&[vec![0.6, -0.3]]);
    let prices = Matrix::filled(1, 2, 100.0);
    let err = evaluator
        .evaluate(&weights, &prices, &prices)
        .expect_err("unhedged");
    assert!(matches!(err, QuantError::DeltaNeutrality { row: 0, .. }));
    assert!(err.to_string().contains("not always delta neutral"));
}

#[test]
fn unknown_operator_is_a_factor_expression_error() {
    let panel = panel_from_close(&Matrix::filled(10, 2, 100.0));
    let err = FactorCalculator
        .compute(&panel, &["foo_bar(close,5)".to_string()])
        .expect_err("unknown operator");
    match err {
        QuantError::FactorExpression { expression, .. } => {
            assert_eq!(expression, "foo_bar(close,5)");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn constant_factor_gets_zero_weight() -> Result<()> {
    let rows = 8;
    let timestamps: Vec<i64> = (0..rows as i64).map(|i| START_MS + i * HOUR_MS).collect();
    let informative = Matrix::from_columns(
        rows,
        &[
            (0..rows).map(|i| i as f64).collect(),
            (0..rows).map(|i| (i * 3 % 5) as f64).collect(),
            (0..rows).map(|i| (i * 2 % 7) as f64 - 3.0).collect(),
        ],
    );
    let constant = Matrix::filled(rows, 3, 1.0);
    let table = FactorTable::new(
        timestamps,
        symbols(3),
        vec!["informative".into(), "constant".into()],
        vec![informative.clone(), constant],
    )?;
    let aggregator = IcAggregator {
        training_window: 3,
        rolling_type: RollingType::Avg,
        ic_type: IcType::Pearson,
    };
    let analysis = aggregator.predict(&table, &informative)?;
    assert!(analysis.ic.column(1).iter().all(|v| v.is_nan()));
    assert!(analysis.weights.column(1).iter().all(|&w| w == 0.0));
    assert!(analysis.weights.column(0).iter().all(|&w| (w - 1.0).abs() < 1e-12));
    Ok(())
}

#[test]
fn zero_weights_never_trade() -> Result<()> {
    let simulator = Simulator::new(
        sim_config(5000.0, 1000.0, 0.001),
        symbols(3),
        vec![SymbolSpec {
            volume_precision: 3,
            min_notional: 5.0,
        }; 3],
    );
    let report = simulator.run(&Matrix::zeros(6, 3), &flat_prices(6, 3, 42.0))?;
    assert_eq!(report.metrics.n_trades, 0);
    assert_eq!(report.metrics.turnover, 0.0);
    assert!(report.positions.as_slice().iter().all(|&u| u == 0.0));
    assert!(report.cash.iter().all(|&c| c == 5000.0));
    assert!(report.equity.iter().all(|&e| e == 5000.0));
    assert_eq!(report.metrics.equity.annual_sharpe, 0.0);
    Ok(())
}

#[test]
fn rounding_is_idempotent() {
    for &units in &[0.12345, -7.5, 2.5, 1e-9, -0.0049, 123.456789] {
        for precision in 0..6 {
            let once = round_units(units, precision);
            assert_eq!(round_units(once, precision), once, "{units} at {precision}");
        }
    }
    assert_eq!(round_units(2.5, 0), 2.0);
    assert_eq!(round_units(3.5, 0), 4.0);
}

#[test]
fn orders_below_min_notional_are_dropped() -> Result<()> {
    let simulator = Simulator::new(
        sim_config(1000.0, 100.0, 0.0),
        symbols(2),
        vec![
            SymbolSpec {
                volume_precision: 4,
                min_notional: 10.0,
            };
            2
        ],
    );
    // 0.05 of 100 is a 5.0 order
    let weights = Matrix::from_rows(&[vec![0.05, -0.05], vec![0.5, -0.5]]);
    let report = simulator.run(&weights, &flat_prices(2, 2, 20.0))?;
    assert_eq!(report.positions.row(0), &[0.0, 0.0]);
    assert_eq!(report.positions.row(1), &[2.5, -2.5]);
    assert_eq!(report.metrics.rejected_orders, 2);
    Ok(())
}

#[test]
fn taker_fee_is_charged_on_both_sides() -> Result<()> {
    let simulator = Simulator::new(
        sim_config(1000.0, 1000.0, 0.001),
        symbols(2),
        vec![SymbolSpec::unconstrained(); 2],
    );
    let weights = Matrix::from_rows(&[vec![0.5, -0.5]]);
    let report = simulator.run(&weights, &flat_prices(1, 2, 100.0))?;
    // 500 bought and 500 sold at 0.1%
    assert!((report.metrics.taker_fee_cost - 1.0).abs() < 1e-9);
    assert!((report.cash[0] - 999.0).abs() < 1e-9);
    assert!((report.equity[0] - 999.0).abs() < 1e-9);
    Ok(())
}
