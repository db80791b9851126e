use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::tempdir;

const HOUR_MS: i64 = 3_600_000;
const FIRST_BAR_MS: i64 = 1_704_067_200_000;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("workspace root")
        .to_path_buf()
}

fn fixture(name: &str) -> PathBuf {
    let path = workspace_root().join("tests").join("data").join(name);
    assert!(path.exists(), "fixture missing at {}", path.display());
    path
}

fn bitquant() -> Command {
    if let Some(bin) = option_env!("CARGO_BIN_EXE_bitquant_cli") {
        Command::new(bin)
    } else {
        let mut cmd = Command::new("cargo");
        cmd.args(["run", "-p", "bitquant_cli", "--"]);
        cmd
    }
}

fn run(subcommand: &str, output_dir: &Path, extra: &[&str]) -> Output {
    let klines = fixture("klines_tiny.csv");
    let symbols = fixture("symbols.csv");
    bitquant()
        .arg(subcommand)
        .args([
            "--klines",
            klines.to_str().expect("klines"),
            "--symbols",
            symbols.to_str().expect("symbols"),
            "--output-dir",
            output_dir.to_str().expect("output"),
            "--workers",
            "2",
            "--factor",
            "ts_delta(close, 3)",
            "--factor",
            "ts_mean(div(taker_buy_volume, volume), 6)",
            "--factor",
            "ts_natr(high, low, close, 7)",
            "--scaling-window",
            "12",
            "--training-window",
            "8",
            "--taker-fee",
            "0.0004",
        ])
        .args(extra)
        .current_dir(workspace_root())
        .output()
        .expect("failed to spawn bitquant_cli")
}

#[test]
fn backtest_writes_artifacts() {
    let temp_dir = tempdir().expect("temp output dir");
    let output_dir = temp_dir.path().join("bitquant_output");
    let output = run("backtest", &output_dir, &[]);
    assert!(
        output.status.success(),
        "backtest failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    for artefact in ["equity.csv", "positions.parquet", "metrics.json", "bitquant.log"] {
        let path = output_dir.join(artefact);
        assert!(path.exists(), "expected {}", path.display());
    }
    let metrics: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("metrics JSON on stdout");
    assert!(metrics.get("pnl_pct").is_some());
    assert!(metrics.get("turnover").is_some());
    assert!(metrics["data_fingerprint"].is_string());
}

#[test]
fn signal_is_delta_neutral() {
    let temp_dir = tempdir().expect("temp output dir");
    let output = run("signal", temp_dir.path(), &["--no-file-log"]);
    assert!(
        output.status.success(),
        "signal failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(!temp_dir.path().join("bitquant.log").exists());

    let record: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("record JSON on stdout");
    let weights = record["portfolio"].as_object().expect("portfolio map");
    assert_eq!(weights.len(), 4);
    let sum: f64 = weights.values().map(|w| w.as_f64().expect("weight")).sum();
    assert!(sum.abs() < 1e-6, "weights sum to {sum}");
    assert!(temp_dir.path().join("signal.json").exists());
}

#[test]
fn evaluate_scores_neutral_records_and_rejects_others() {
    let temp_dir = tempdir().expect("temp output dir");
    let records = temp_dir.path().join("records.json");
    let neutral = serde_json::json!([
        { "timestamp": FIRST_BAR_MS + 100 * HOUR_MS,
          "portfolio": { "BTCUSDT": 0.5, "ETHUSDT": -0.5 } },
        { "timestamp": FIRST_BAR_MS + 101 * HOUR_MS,
          "portfolio": { "BTCUSDT": 0.25, "ETHUSDT": -0.25, "SOLUSDT": 0.0 } },
    ]);
    std::fs::write(&records, neutral.to_string()).expect("write records");
    let output = run(
        "evaluate",
        temp_dir.path(),
        &["--records", records.to_str().expect("records")],
    );
    assert!(
        output.status.success(),
        "evaluate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let outcome: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("evaluation JSON");
    assert!(outcome["profit_ratio"].as_f64().expect("ratio").is_finite());
    assert_eq!(outcome["steps"], 2);

    let skewed = serde_json::json!({
        "timestamp": FIRST_BAR_MS + 100 * HOUR_MS,
        "portfolio": { "BTCUSDT": 0.6, "ETHUSDT": -0.3 }
    });
    std::fs::write(&records, skewed.to_string()).expect("write records");
    let output = run(
        "evaluate",
        temp_dir.path(),
        &["--records", records.to_str().expect("records")],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not always delta neutral"));
}

#[test]
fn factors_writes_table_and_rejects_unknown_operators() {
    let temp_dir = tempdir().expect("temp output dir");
    let output = run("factors", temp_dir.path(), &[]);
    assert!(output.status.success());
    let table = std::fs::read_to_string(temp_dir.path().join("factors.csv")).expect("factors");
    let header = table.lines().next().expect("header");
    assert!(header.starts_with("timestamp,symbol"));
    assert!(header.contains("ts_delta(close, 3)"));

    let output = run("factors", temp_dir.path(), &["--factor", "foo_bar(close, 5)"]);
    assert!(!output.status.success());
}
