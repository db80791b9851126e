use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::QuantError;

/// How rolled IC statistics are turned into per-factor weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollingType {
    /// Rolling mean of the IC.
    #[default]
    Avg,
    /// Exponentially weighted mean with centre of mass equal to the window.
    Ewm,
    /// Rolling mean divided by rolling sample std.
    IcIr,
    /// Inverse-covariance weights `Σ⁻¹·mean(IC)` per window.
    MaxIcIr,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IcType {
    #[default]
    Pearson,
    Spearman,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrthogonalMethod {
    /// Löwdin symmetric orthogonalization.
    Symmetric,
    GramSchmidt,
}

/// Rule that turns one row of scores into portfolio weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Construction {
    /// Demean, then scale so absolute weights sum to one.
    #[default]
    Normalized,
    /// Equal-weight long the top `fraction` and short the bottom `fraction`.
    QuantileLongShort { fraction: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Long-format klines table (CSV or Parquet).
    pub klines: PathBuf,
    /// Optional `symbol,volume_precision,notional` table.
    #[serde(default)]
    pub symbols: Option<PathBuf>,
    /// Symbol whose timestamp grid defines the panel. Defaults to the symbol
    /// with the most rows.
    #[serde(default)]
    pub reference_symbol: Option<String>,
    /// Inclusive start date filter applied before alignment.
    #[serde(default)]
    pub include_date_start: Option<NaiveDate>,
    /// Inclusive end date filter applied before alignment.
    #[serde(default)]
    pub include_date_end: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerConfig {
    #[serde(default = "default_scaling_window")]
    pub window: usize,
    #[serde(default = "default_true")]
    pub time_series: bool,
    #[serde(default)]
    pub cross_section: bool,
    #[serde(default)]
    pub orthogonalize: Option<OrthogonalMethod>,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            window: default_scaling_window(),
            time_series: true,
            cross_section: false,
            orthogonalize: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default = "default_selector_threshold")]
    pub threshold: f64,
    /// When false, a correlation above `threshold` rejects a factor. When
    /// true, a correlation below `threshold` does.
    #[serde(default)]
    pub greater_is_better: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            threshold: default_selector_threshold(),
            greater_is_better: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_training_window")]
    pub training_window: usize,
    #[serde(default)]
    pub rolling_type: RollingType,
    #[serde(default)]
    pub ic_type: IcType,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            training_window: default_training_window(),
            rolling_type: RollingType::Avg,
            ic_type: IcType::Pearson,
        }
    }
}

/// Execution parameters shared by the backtest simulator and the evaluator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SimulationConfig {
    #[serde(default = "default_cash")]
    pub init_cash: f64,
    /// Notional that a weight of 1.0 corresponds to.
    #[serde(default = "default_cash")]
    pub order_size: f64,
    #[serde(default = "default_taker_fee")]
    pub taker_fee: f64,
    /// Tolerance for `|Σ weights|` in the delta-neutral check.
    #[serde(default = "default_neutrality_epsilon")]
    pub neutrality_epsilon: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            init_cash: default_cash(),
            order_size: default_cash(),
            taker_fee: default_taker_fee(),
            neutrality_epsilon: default_neutrality_epsilon(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data: DataConfig,
    #[serde(default = "default_factors")]
    pub factors: Vec<String>,
    #[serde(default)]
    pub scaler: ScalerConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub construction: Construction,
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Worker threads for factor and IC computation; 0 uses every core.
    #[serde(default)]
    pub n_workers: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Config {
    /// Defaults for every section around the given klines table.
    pub fn with_klines(klines: impl Into<PathBuf>) -> Self {
        Self {
            data: DataConfig {
                klines: klines.into(),
                symbols: None,
                reference_symbol: None,
                include_date_start: None,
                include_date_end: None,
            },
            factors: default_factors(),
            scaler: ScalerConfig::default(),
            selector: SelectorConfig::default(),
            aggregator: AggregatorConfig::default(),
            construction: Construction::default(),
            simulation: SimulationConfig::default(),
            n_workers: 0,
            output_dir: default_output_dir(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), QuantError> {
        if self.factors.is_empty() {
            return Err(QuantError::config("at least one factor expression is required"));
        }
        if self.scaler.window == 0 {
            return Err(QuantError::config("scaler.window must be positive"));
        }
        if self.aggregator.training_window == 0 {
            return Err(QuantError::config(
                "aggregator.training_window must be positive",
            ));
        }
        let sim = &self.simulation;
        if !(sim.init_cash.is_finite() && sim.init_cash > 0.0) {
            return Err(QuantError::config("simulation.init_cash must be positive"));
        }
        if !(sim.order_size.is_finite() && sim.order_size > 0.0) {
            return Err(QuantError::config("simulation.order_size must be positive"));
        }
        if !(sim.taker_fee.is_finite() && sim.taker_fee >= 0.0) {
            return Err(QuantError::config(
                "simulation.taker_fee must be a non-negative rate",
            ));
        }
        if !(sim.neutrality_epsilon.is_finite() && sim.neutrality_epsilon > 0.0) {
            return Err(QuantError::config(
                "simulation.neutrality_epsilon must be positive",
            ));
        }
        if let Construction::QuantileLongShort { fraction } = self.construction {
            if !(fraction > 0.0 && fraction <= 0.5) {
                return Err(QuantError::config(format!(
                    "quantile fraction must lie in (0, 0.5], got {fraction}"
                )));
            }
        }
        if let (Some(start), Some(end)) = (self.data.include_date_start, self.data.include_date_end)
        {
            if start > end {
                return Err(QuantError::config(format!(
                    "date window is empty: {start} > {end}"
                )));
            }
        }
        Ok(())
    }
}

const fn default_scaling_window() -> usize {
    180
}

const fn default_training_window() -> usize {
    90
}

const fn default_selector_threshold() -> f64 {
    0.6
}

const fn default_cash() -> f64 {
    10_000.0
}

const fn default_taker_fee() -> f64 {
    0.0004
}

const fn default_neutrality_epsilon() -> f64 {
    1e-6
}

const fn default_true() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("bitquant_output")
}

pub fn default_factors() -> Vec<String> {
    [
        "ts_midpoint(ts_natr(high,low,close,7),14)",
        "ts_delta(dynamic_ts_max(ts_bbands(close,20),28),7)",
        "ts_midpoint(ts_ht_trendmode(close),21)",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_json_takes_defaults() {
        let raw = r#"{
            "data": { "klines": "k.csv" },
            "aggregator": { "rolling_type": "max_ic_ir", "ic_type": "spearman" },
            "construction": { "mode": "quantile_long_short", "fraction": 0.2 }
        }"#;
        let config: Config = serde_json::from_str(raw).expect("parse");
        assert_eq!(config.scaler.window, 180);
        assert_eq!(config.aggregator.training_window, 90);
        assert_eq!(config.aggregator.rolling_type, RollingType::MaxIcIr);
        assert_eq!(config.aggregator.ic_type, IcType::Spearman);
        assert_eq!(config.factors.len(), 3);
        assert!((config.simulation.taker_fee - 0.0004).abs() < 1e-12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut config = Config::with_klines("k.csv");
        config.scaler.window = 0;
        assert!(matches!(
            config.validate(),
            Err(QuantError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn validate_rejects_non_positive_neutrality_epsilon() {
        for epsilon in [0.0, -1e-6, f64::NAN] {
            let mut config = Config::with_klines("k.csv");
            config.simulation.neutrality_epsilon = epsilon;
            assert!(
                matches!(config.validate(), Err(QuantError::InvalidConfig { .. })),
                "epsilon {epsilon} should be rejected"
            );
        }
    }
}
