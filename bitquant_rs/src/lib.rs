pub mod aggregator;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluator;
pub mod expr;
pub mod factor;
pub mod functions;
pub mod matrix;
pub mod panel;
pub mod pipeline;
pub mod portfolio;
pub mod scaler;
pub mod selector;
pub mod simulator;
pub mod stats;
pub mod storage;
pub mod strategy;

pub use config::{Config, Construction, IcType, OrthogonalMethod, RollingType};
pub use error::QuantError;
pub use factor::{FactorCalculator, FactorTable};
pub use matrix::Matrix;
pub use panel::Panel;
pub use pipeline::{
    run_backtest_pipeline, run_evaluation, run_factor_pipeline, run_signal_pipeline,
};
pub use portfolio::{Portfolio, PortfolioRecord, SymbolUniverse, WireRecord};
pub use simulator::{BacktestReport, Simulator, SymbolSpec};
pub use strategy::StrategyEngine;
