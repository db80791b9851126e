use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use polars::io::parquet::{ParquetCompression, ParquetWriter};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::factor::FactorTable;
use crate::portfolio::WireRecord;
use crate::simulator::BacktestReport;

/// File layout of one run inside `output_dir`.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub root: PathBuf,
}

impl ArtifactPaths {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Unable to create output dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn equity_csv(&self) -> PathBuf {
        self.root.join("equity.csv")
    }

    pub fn positions_parquet(&self) -> PathBuf {
        self.root.join("positions.parquet")
    }

    pub fn metrics_json(&self) -> PathBuf {
        self.root.join("metrics.json")
    }

    pub fn factors_csv(&self) -> PathBuf {
        self.root.join("factors.csv")
    }

    pub fn signal_json(&self) -> PathBuf {
        self.root.join("signal.json")
    }

    pub fn evaluation_json(&self) -> PathBuf {
        self.root.join("evaluation.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("bitquant.log")
    }
}

fn write_csv(df: &mut DataFrame, path: &Path) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Unable to create {}", path.display()))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(df)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Marked equity curve: `timestamp, equity, cash, net_leverage, gross_leverage`.
pub fn write_equity_csv(report: &BacktestReport, path: &Path) -> Result<()> {
    let mut df = DataFrame::new(vec![
        Series::new("timestamp", report.marked_timestamps.as_slice()),
        Series::new("equity", report.equity.as_slice()),
        Series::new("cash", report.cash.as_slice()),
        Series::new("net_leverage", report.net_leverage.as_slice()),
        Series::new("gross_leverage", report.gross_leverage.as_slice()),
    ])
    .context("Failed to build equity frame")?;
    write_csv(&mut df, path)
}

/// Positions after each fill in long format: `timestamp, symbol, units`.
pub fn write_positions_parquet(report: &BacktestReport, path: &Path) -> Result<()> {
    let n = report.fill_timestamps.len() * report.symbols.len();
    let mut timestamps = Vec::with_capacity(n);
    let mut symbols = Vec::with_capacity(n);
    for &ts in &report.fill_timestamps {
        for symbol in &report.symbols {
            timestamps.push(ts);
            symbols.push(symbol.as_str());
        }
    }
    let mut df = DataFrame::new(vec![
        Series::new("timestamp", timestamps),
        Series::new("symbol", symbols),
        Series::new("units", report.positions.as_slice()),
    ])
    .context("Failed to build positions frame")?;
    let mut file =
        File::create(path).with_context(|| format!("Unable to create {}", path.display()))?;
    ParquetWriter::new(&mut file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(&mut df)
        .context("Failed to write positions Parquet")?;
    Ok(())
}

pub fn write_factor_csv(table: &FactorTable, path: &Path) -> Result<()> {
    let mut df = table.to_data_frame()?;
    write_csv(&mut df, path)
}

pub fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    fs::write(path, body).with_context(|| format!("Unable to write {}", path.display()))
}

/// Equity curve, positions and metrics of one backtest.
pub fn write_backtest_artifacts(report: &BacktestReport, paths: &ArtifactPaths) -> Result<()> {
    write_equity_csv(report, &paths.equity_csv())?;
    write_positions_parquet(report, &paths.positions_parquet())?;
    write_json(&report.metrics, &paths.metrics_json())?;
    info!(dir = %paths.root.display(), "wrote backtest artifacts");
    Ok(())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordFile {
    Many(Vec<WireRecord>),
    One(WireRecord),
}

/// Read one record or an array of records. Symbols are checked later,
/// against the universe of the panel being scored.
pub fn read_wire_records(path: &Path) -> Result<Vec<WireRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Unable to read records {}", path.display()))?;
    let parsed: RecordFile = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse records {}", path.display()))?;
    Ok(match parsed {
        RecordFile::Many(records) => records,
        RecordFile::One(record) => vec![record],
    })
}
