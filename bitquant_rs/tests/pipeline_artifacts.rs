use std::path::{Path, PathBuf};

use anyhow::Result;
use bitquant_rs::config::Config;
use bitquant_rs::error::QuantError;
use bitquant_rs::pipeline::{run_backtest_pipeline, run_evaluation, run_signal_pipeline};
use bitquant_rs::portfolio::WireRecord;
use bitquant_rs::storage::read_wire_records;
use tempfile::tempdir;

const HOUR_MS: i64 = 3_600_000;
const FIRST_BAR_MS: i64 = 1_704_067_200_000;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("workspace root")
        .join("tests")
        .join("data")
        .join(name)
}

fn config(output_dir: &Path) -> Config {
    let mut config = Config::with_klines(fixture("klines_tiny.csv"));
    config.data.symbols = Some(fixture("symbols.csv"));
    config.factors = vec![
        "ts_delta(close, 3)".into(),
        "ts_natr(high, low, close, 7)".into(),
        "cs_rank(ts_mean(volume, 5))".into(),
    ];
    config.scaler.window = 12;
    config.aggregator.training_window = 8;
    config.n_workers = 2;
    config.output_dir = output_dir.to_path_buf();
    config
}

fn record(hours: i64, weights: &[(&str, f64)]) -> WireRecord {
    WireRecord {
        timestamp: FIRST_BAR_MS + hours * HOUR_MS,
        portfolio: weights.iter().map(|(s, w)| (s.to_string(), *w)).collect(),
    }
}

#[test]
fn backtest_pipeline_writes_every_artifact() -> Result<()> {
    let dir = tempdir()?;
    let outcome = run_backtest_pipeline(&config(dir.path()))?;
    assert!(outcome.excluded.is_empty());
    assert_eq!(outcome.report.symbols.len(), 4);

    let equity = std::fs::read_to_string(dir.path().join("equity.csv"))?;
    let mut lines = equity.lines();
    assert_eq!(
        lines.next(),
        Some("timestamp,equity,cash,net_leverage,gross_leverage")
    );
    assert_eq!(lines.count(), outcome.report.equity.len());
    assert!(dir.path().join("positions.parquet").exists());

    let metrics: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("metrics.json"))?)?;
    assert_eq!(metrics["steps"], outcome.report.equity.len());
    assert!(metrics["data_fingerprint"].is_string());
    Ok(())
}

#[test]
fn signal_pipeline_round_trips_through_json() -> Result<()> {
    let dir = tempdir()?;
    let record = run_signal_pipeline(&config(dir.path()))?;
    assert_eq!(record.timestamp, FIRST_BAR_MS + 159 * HOUR_MS);
    assert!(record.portfolio.is_delta_neutral(1e-6));

    let written = read_wire_records(&dir.path().join("signal.json"))?;
    assert_eq!(written, vec![record.to_wire()]);
    Ok(())
}

#[test]
fn evaluation_scores_submitted_records() -> Result<()> {
    let dir = tempdir()?;
    let records = vec![
        record(150, &[("ETHUSDT", -0.5), ("BTCUSDT", 0.5)]),
        record(151, &[("ETHUSDT", -0.5), ("BTCUSDT", 0.5)]),
        record(152, &[("SOLUSDT", 0.3), ("BNBUSDT", -0.3)]),
    ];
    let outcome = run_evaluation(&config(dir.path()), &records)?;
    assert_eq!(outcome.steps, 3);
    assert_eq!(outcome.first_timestamp, FIRST_BAR_MS + 150 * HOUR_MS);
    assert!(outcome.profit_ratio.is_finite());
    assert!(outcome.profit_ratio.abs() < 0.5);
    assert!(dir.path().join("evaluation.json").exists());
    Ok(())
}

#[test]
fn evaluation_rejects_off_grid_and_unhedged_records() -> Result<()> {
    let dir = tempdir()?;
    let mut off_grid = record(10, &[("BTCUSDT", 0.0)]);
    off_grid.timestamp += 1;
    let err = run_evaluation(&config(dir.path()), &[off_grid]).expect_err("off grid");
    assert!(matches!(
        err.downcast_ref::<QuantError>(),
        Some(QuantError::DataAlignment { .. })
    ));

    let unhedged = record(10, &[("BTCUSDT", 0.6), ("ETHUSDT", -0.3)]);
    let err = run_evaluation(&config(dir.path()), &[unhedged]).expect_err("unhedged");
    assert!(matches!(
        err.downcast_ref::<QuantError>(),
        Some(QuantError::DeltaNeutrality { .. })
    ));
    assert!(err.to_string().contains("not always delta neutral"));

    Ok(())
}

#[test]
fn evaluation_rejects_symbols_outside_the_universe() -> Result<()> {
    let dir = tempdir()?;
    for weight in [0.0, 0.5] {
        let unknown = record(
            10,
            &[
                ("BTCUSDT", 0.5),
                ("ETHUSDT", -0.5 - weight),
                ("NOT_A_SYMBOL", weight),
            ],
        );
        let err = run_evaluation(&config(dir.path()), &[unknown]).expect_err("unknown symbol");
        assert!(
            matches!(
                err.downcast_ref::<QuantError>(),
                Some(QuantError::InvalidPortfolio { .. })
            ),
            "weight {weight}: {err:#}"
        );
    }
    assert!(!dir.path().join("evaluation.json").exists());
    Ok(())
}

#[test]
fn date_window_restricts_the_panel() -> Result<()> {
    let dir = tempdir()?;
    let mut config = config(dir.path());
    config.data.include_date_start = chrono::NaiveDate::from_ymd_opt(2024, 1, 3);
    let record = run_signal_pipeline(&config)?;
    assert_eq!(record.timestamp, FIRST_BAR_MS + 159 * HOUR_MS);

    config.data.include_date_start = chrono::NaiveDate::from_ymd_opt(2030, 1, 1);
    assert!(run_signal_pipeline(&config).is_err());
    Ok(())
}
