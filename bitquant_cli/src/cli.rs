use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};

use bitquant_rs::config::{Config, Construction, IcType, OrthogonalMethod, RollingType};

const DEFAULT_QUANTILE_FRACTION: f64 = 0.2;

#[derive(Parser, Debug)]
#[command(
    name = "bitquant",
    version,
    about = "Factor signals, delta-neutral portfolios and backtests over crypto klines"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay the strategy over the whole panel and write equity, positions and metrics
    Backtest(RunArgs),
    /// Compute the portfolio for the latest bar
    Signal(RunArgs),
    /// Score submitted weight records against the panel
    Evaluate(EvaluateArgs),
    /// Compute and write the raw factor table
    Factors(RunArgs),
}

impl Commands {
    pub fn run_args(&self) -> &RunArgs {
        match self {
            Commands::Backtest(args) | Commands::Signal(args) | Commands::Factors(args) => args,
            Commands::Evaluate(args) => &args.run,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// JSON config file; flags below override its fields
    #[arg(long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Long-format klines table (CSV or Parquet)
    #[arg(long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub klines: Option<PathBuf>,

    /// Symbol metadata table (symbol, volume_precision, notional)
    #[arg(long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub symbols: Option<PathBuf>,

    /// Symbol whose timestamp grid defines the panel
    #[arg(long = "reference-symbol")]
    pub reference_symbol: Option<String>,

    /// Output directory for artefacts and the run log
    #[arg(long = "output-dir", value_hint = clap::ValueHint::DirPath)]
    pub output_dir: Option<PathBuf>,

    /// Number of worker threads (omit to use all logical cores)
    #[arg(long = "workers", alias = "n-workers")]
    pub workers: Option<usize>,

    /// Disable writing bitquant.log into the output directory
    #[arg(long = "no-file-log", default_value_t = false)]
    pub no_file_log: bool,

    /// Inclusive start date filter (YYYY-MM-DD)
    #[arg(long = "date-start")]
    pub date_start: Option<String>,

    /// Inclusive end date filter (YYYY-MM-DD)
    #[arg(long = "date-end")]
    pub date_end: Option<String>,

    /// Factor expression; repeat to replace the configured list
    #[arg(long = "factor", value_name = "EXPR")]
    pub factors: Vec<String>,

    /// Rolling window of the time-series z-score
    #[arg(long = "scaling-window")]
    pub scaling_window: Option<usize>,

    /// Also z-score each timestamp across symbols
    #[arg(long = "cross-section", default_value_t = false)]
    pub cross_section: bool,

    /// Skip the time-series z-score
    #[arg(long = "no-time-series", default_value_t = false)]
    pub no_time_series: bool,

    /// Orthogonalize factors per timestamp after scaling
    #[arg(long, value_enum)]
    pub orthogonalize: Option<OrthogonalValue>,

    /// Correlation threshold of the factor selector
    #[arg(long = "selector-threshold")]
    pub selector_threshold: Option<f64>,

    /// Reject factors whose correlation falls below the threshold instead of above it
    #[arg(long = "greater-is-better", default_value_t = false)]
    pub greater_is_better: bool,

    /// Rolling window of the IC weighting
    #[arg(long = "training-window")]
    pub training_window: Option<usize>,

    #[arg(long = "rolling-type", value_enum)]
    pub rolling_type: Option<RollingTypeValue>,

    #[arg(long = "ic-type", value_enum)]
    pub ic_type: Option<IcTypeValue>,

    /// Score-to-weight rule
    #[arg(long, value_enum)]
    pub construction: Option<ConstructionValue>,

    /// Fraction of symbols in each leg for quantile construction
    #[arg(long = "quantile-fraction")]
    pub quantile_fraction: Option<f64>,

    #[arg(long = "init-cash")]
    pub init_cash: Option<f64>,

    /// Notional that a weight of 1.0 corresponds to
    #[arg(long = "order-size")]
    pub order_size: Option<f64>,

    /// Taker fee rate charged on traded notional
    #[arg(long = "taker-fee")]
    pub taker_fee: Option<f64>,
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// JSON file with one weight record or an array of records
    #[arg(long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub records: PathBuf,
}

impl RunArgs {
    pub fn into_config(self) -> Result<Config> {
        let mut config = match (&self.config, &self.klines) {
            (Some(path), _) => Config::load(path)?,
            (None, Some(klines)) => Config::with_klines(klines),
            (None, None) => return Err(anyhow!("either --config or --klines is required")),
        };

        if let Some(klines) = self.klines {
            config.data.klines = klines;
        }
        if let Some(symbols) = self.symbols {
            config.data.symbols = Some(symbols);
        }
        if let Some(reference) = self.reference_symbol {
            config.data.reference_symbol = Some(reference);
        }
        if let Some(start) = parse_optional_date(self.date_start.as_deref())? {
            config.data.include_date_start = Some(start);
        }
        if let Some(end) = parse_optional_date(self.date_end.as_deref())? {
            config.data.include_date_end = Some(end);
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(workers) = self.workers {
            config.n_workers = workers;
        }
        if !self.factors.is_empty() {
            config.factors = self.factors;
        }

        if let Some(window) = self.scaling_window {
            config.scaler.window = window;
        }
        if self.cross_section {
            config.scaler.cross_section = true;
        }
        if self.no_time_series {
            config.scaler.time_series = false;
        }
        if let Some(method) = self.orthogonalize {
            config.scaler.orthogonalize = Some(method.to_method());
        }

        if let Some(threshold) = self.selector_threshold {
            config.selector.threshold = threshold;
        }
        if self.greater_is_better {
            config.selector.greater_is_better = true;
        }

        if let Some(window) = self.training_window {
            config.aggregator.training_window = window;
        }
        if let Some(rolling) = self.rolling_type {
            config.aggregator.rolling_type = rolling.to_rolling_type();
        }
        if let Some(ic) = self.ic_type {
            config.aggregator.ic_type = ic.to_ic_type();
        }

        config.construction = match (self.construction, self.quantile_fraction) {
            (Some(ConstructionValue::Normalized), _) => Construction::Normalized,
            (Some(ConstructionValue::Quantile), fraction) => Construction::QuantileLongShort {
                fraction: fraction.unwrap_or(DEFAULT_QUANTILE_FRACTION),
            },
            (None, Some(fraction)) => Construction::QuantileLongShort { fraction },
            (None, None) => config.construction,
        };

        if let Some(cash) = self.init_cash {
            config.simulation.init_cash = cash;
        }
        if let Some(size) = self.order_size {
            config.simulation.order_size = size;
        }
        if let Some(fee) = self.taker_fee {
            config.simulation.taker_fee = fee;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum RollingTypeValue {
    Avg,
    Ewm,
    #[value(name = "ic-ir", alias = "ic_ir")]
    IcIr,
    #[value(name = "max-ic-ir", alias = "max_ic_ir")]
    MaxIcIr,
}

impl RollingTypeValue {
    fn to_rolling_type(self) -> RollingType {
        match self {
            RollingTypeValue::Avg => RollingType::Avg,
            RollingTypeValue::Ewm => RollingType::Ewm,
            RollingTypeValue::IcIr => RollingType::IcIr,
            RollingTypeValue::MaxIcIr => RollingType::MaxIcIr,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum IcTypeValue {
    Pearson,
    Spearman,
}

impl IcTypeValue {
    fn to_ic_type(self) -> IcType {
        match self {
            IcTypeValue::Pearson => IcType::Pearson,
            IcTypeValue::Spearman => IcType::Spearman,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OrthogonalValue {
    Symmetric,
    #[value(name = "gram-schmidt", alias = "gram_schmidt")]
    GramSchmidt,
}

impl OrthogonalValue {
    fn to_method(self) -> OrthogonalMethod {
        match self {
            OrthogonalValue::Symmetric => OrthogonalMethod::Symmetric,
            OrthogonalValue::GramSchmidt => OrthogonalMethod::GramSchmidt,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ConstructionValue {
    Normalized,
    Quantile,
}

fn parse_optional_date(value: Option<&str>) -> Result<Option<NaiveDate>> {
    match value {
        Some(raw) => {
            let parsed = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .with_context(|| format!("Invalid date format for {raw}. Expected YYYY-MM-DD"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}
