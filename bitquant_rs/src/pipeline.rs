use std::sync::Arc;

use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::data::{SymbolBook, filter_by_date_range, load_klines, load_symbol_book};
use crate::evaluator::{EvaluationWindow, Evaluator, align_records};
use crate::factor::{FactorCalculator, FactorTable};
use crate::panel::{ExcludedSymbol, Panel};
use crate::portfolio::{PortfolioRecord, SymbolUniverse, WireRecord};
use crate::simulator::{BacktestReport, Simulator};
use crate::storage::{self, ArtifactPaths};
use crate::strategy::StrategyEngine;

/// Panel and symbol metadata shared by every pipeline.
#[derive(Debug, Clone)]
pub struct MarketData {
    pub panel: Panel,
    pub excluded: Vec<ExcludedSymbol>,
    pub book: SymbolBook,
}

impl MarketData {
    pub fn load(config: &Config) -> Result<Self> {
        let raw = load_klines(&config.data.klines)
            .with_context(|| format!("Failed to load klines {}", config.data.klines.display()))?;
        let raw = filter_by_date_range(
            raw,
            config.data.include_date_start,
            config.data.include_date_end,
        );
        let assembly = Panel::assemble(&raw, config.data.reference_symbol.as_deref())
            .context("Failed to assemble panel")?;
        let book = match &config.data.symbols {
            Some(path) => load_symbol_book(path)
                .with_context(|| format!("Failed to load symbol metadata {}", path.display()))?,
            None => SymbolBook::default(),
        };
        info!(
            symbols = assembly.panel.n_symbols(),
            rows = assembly.panel.n_rows(),
            excluded = assembly.excluded.len(),
            metadata = book.len(),
            fingerprint = %assembly.panel.fingerprint(),
            "loaded market data"
        );
        Ok(Self {
            panel: assembly.panel,
            excluded: assembly.excluded,
            book,
        })
    }

    pub fn simulator(&self, config: &Config) -> Simulator {
        let symbols = self.panel.symbols().to_vec();
        let specs = self.book.specs_for(&symbols);
        Simulator::new(config.simulation, symbols, specs)
    }
}

/// Dedicated pool for the parallel stages; 0 workers uses every core.
pub fn build_pool(n_workers: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(n_workers)
        .build()
        .context("Failed to build worker pool")
}

fn prepare(config: &Config) -> Result<(ArtifactPaths, ThreadPool)> {
    config.validate().context("Invalid configuration")?;
    let paths = ArtifactPaths::new(&config.output_dir)?;
    let pool = build_pool(config.n_workers)?;
    info!(
        klines = %config.data.klines.display(),
        factors = config.factors.len(),
        scaling_window = config.scaler.window,
        training_window = config.aggregator.training_window,
        rolling_type = ?config.aggregator.rolling_type,
        ic_type = ?config.aggregator.ic_type,
        construction = ?config.construction,
        n_workers = pool.current_num_threads(),
        output = %paths.root.display(),
        "Initialized pipeline configuration"
    );
    Ok((paths, pool))
}

#[derive(Debug, Clone)]
pub struct BacktestOutcome {
    pub report: BacktestReport,
    pub selected: Vec<String>,
    pub excluded: Vec<ExcludedSymbol>,
    pub paths: ArtifactPaths,
}

/// Load data, replay the strategy over the whole panel and write the
/// equity, positions and metrics artifacts.
pub fn run_backtest_pipeline(config: &Config) -> Result<BacktestOutcome> {
    let (paths, pool) = prepare(config)?;
    let market = MarketData::load(config)?;
    let engine = StrategyEngine::from_config(config);
    let simulator = market.simulator(config);
    let (signal, report) = pool
        .install(|| engine.run_backtest(&market.panel, &simulator))
        .context("Backtest failed")?;
    storage::write_backtest_artifacts(&report, &paths)?;

    let metrics = &report.metrics;
    info!(
        steps = metrics.equity.steps,
        selected = ?signal.selected,
        pnl_pct = metrics.equity.pnl_pct,
        annual_sharpe = metrics.equity.annual_sharpe,
        max_drawdown_pct = metrics.equity.max_drawdown_pct,
        turnover = metrics.turnover,
        n_trades = metrics.n_trades,
        "Backtest complete"
    );
    Ok(BacktestOutcome {
        report,
        selected: signal.selected,
        excluded: market.excluded,
        paths,
    })
}

/// Portfolio for the latest panel bar, written to `signal.json`.
pub fn run_signal_pipeline(config: &Config) -> Result<PortfolioRecord> {
    let (paths, pool) = prepare(config)?;
    let market = MarketData::load(config)?;
    let engine = StrategyEngine::from_config(config);
    let record = pool
        .install(|| engine.run(&market.panel))
        .context("Signal generation failed")?;
    storage::write_json(&record.to_wire(), &paths.signal_json())?;
    info!(
        timestamp = record.timestamp,
        path = %paths.signal_json().display(),
        "wrote signal"
    );
    Ok(record)
}

/// Raw factor values for every configured expression, written to
/// `factors.csv`.
pub fn run_factor_pipeline(config: &Config) -> Result<FactorTable> {
    let (paths, pool) = prepare(config)?;
    let market = MarketData::load(config)?;
    let table = pool
        .install(|| FactorCalculator.compute(&market.panel, &config.factors))
        .context("Factor computation failed")?;
    storage::write_factor_csv(&table, &paths.factors_csv())?;
    info!(
        factors = table.n_factors(),
        rows = table.n_rows(),
        path = %paths.factors_csv().display(),
        "wrote factor table"
    );
    Ok(table)
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationOutcome {
    pub profit_ratio: f64,
    pub steps: usize,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    pub data_fingerprint: String,
}

/// Score submitted weight records against the panel bars they name.
///
/// Every record is validated against the panel's symbol universe; symbols a
/// record omits trade at zero weight.
pub fn run_evaluation(config: &Config, records: &[WireRecord]) -> Result<EvaluationOutcome> {
    let (paths, pool) = prepare(config)?;
    let market = MarketData::load(config)?;
    let universe = Arc::new(SymbolUniverse::new(market.panel.symbols().to_vec())?);
    let window = pool.install(|| -> Result<EvaluationWindow> {
        let records = records
            .par_iter()
            .map(|wire| {
                PortfolioRecord::from_wire(wire, Arc::clone(&universe)).with_context(|| {
                    format!("Invalid portfolio record at {}", wire.timestamp)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(align_records(&records, &market.panel)?)
    })?;
    debug!(steps = window.timestamps.len(), "aligned records with panel bars");

    let symbols = market.panel.symbols().to_vec();
    let evaluator = Evaluator::new(config.simulation, market.book.specs_for(&symbols));
    let profit_ratio = evaluator.evaluate_window(&window)?;
    let outcome = EvaluationOutcome {
        profit_ratio,
        steps: window.timestamps.len(),
        first_timestamp: window.timestamps.first().copied().unwrap_or_default(),
        last_timestamp: window.timestamps.last().copied().unwrap_or_default(),
        data_fingerprint: market.panel.fingerprint(),
    };
    storage::write_json(&outcome, &paths.evaluation_json())?;
    info!(
        profit_ratio,
        steps = outcome.steps,
        path = %paths.evaluation_json().display(),
        "Evaluation complete"
    );
    Ok(outcome)
}
