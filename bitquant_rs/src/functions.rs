//! Closed registry of operators callable from factor expressions.

use std::collections::HashMap;

use bitquant_ops as ops;
use once_cell::sync::Lazy;

use crate::matrix::Matrix;

const STD_FLOOR: f64 = 1e-8;
const BBANDS_STD_MULT: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    TsDelta,
    TsDelay,
    TsMean,
    TsSum,
    TsStd,
    TsMax,
    TsMin,
    DynamicTsMax,
    DynamicTsMin,
    TsMidpoint,
    TsRank,
    TsZscore,
    TsAtr,
    TsNatr,
    TsBbands,
    TsHtTrendmode,
    TsCorr,
    Abs,
    Log,
    Sqrt,
    Sign,
    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    CsRank,
    CsZscore,
}

/// Argument shape of a registered function: `series` matrix inputs,
/// optionally followed by one integer window literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub series: usize,
    pub window: bool,
}

impl Signature {
    pub fn arity(self) -> usize {
        self.series + usize::from(self.window)
    }
}

static REGISTRY: Lazy<HashMap<&'static str, Function>> = Lazy::new(|| {
    Function::ALL
        .iter()
        .map(|function| (function.name(), *function))
        .collect()
});

pub fn find_function(name: &str) -> Option<Function> {
    REGISTRY.get(name).copied()
}

impl Function {
    pub const ALL: [Function; 30] = [
        Function::TsDelta,
        Function::TsDelay,
        Function::TsMean,
        Function::TsSum,
        Function::TsStd,
        Function::TsMax,
        Function::TsMin,
        Function::DynamicTsMax,
        Function::DynamicTsMin,
        Function::TsMidpoint,
        Function::TsRank,
        Function::TsZscore,
        Function::TsAtr,
        Function::TsNatr,
        Function::TsBbands,
        Function::TsHtTrendmode,
        Function::TsCorr,
        Function::Abs,
        Function::Log,
        Function::Sqrt,
        Function::Sign,
        Function::Neg,
        Function::Add,
        Function::Sub,
        Function::Mul,
        Function::Div,
        Function::Max,
        Function::Min,
        Function::CsRank,
        Function::CsZscore,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Function::TsDelta => "ts_delta",
            Function::TsDelay => "ts_delay",
            Function::TsMean => "ts_mean",
            Function::TsSum => "ts_sum",
            Function::TsStd => "ts_std",
            Function::TsMax => "ts_max",
            Function::TsMin => "ts_min",
            Function::DynamicTsMax => "dynamic_ts_max",
            Function::DynamicTsMin => "dynamic_ts_min",
            Function::TsMidpoint => "ts_midpoint",
            Function::TsRank => "ts_rank",
            Function::TsZscore => "ts_zscore",
            Function::TsAtr => "ts_atr",
            Function::TsNatr => "ts_natr",
            Function::TsBbands => "ts_bbands",
            Function::TsHtTrendmode => "ts_ht_trendmode",
            Function::TsCorr => "ts_corr",
            Function::Abs => "abs",
            Function::Log => "log",
            Function::Sqrt => "sqrt",
            Function::Sign => "sign",
            Function::Neg => "neg",
            Function::Add => "add",
            Function::Sub => "sub",
            Function::Mul => "mul",
            Function::Div => "div",
            Function::Max => "max",
            Function::Min => "min",
            Function::CsRank => "cs_rank",
            Function::CsZscore => "cs_zscore",
        }
    }

    pub fn signature(self) -> Signature {
        let (series, window) = match self {
            Function::TsDelta
            | Function::TsDelay
            | Function::TsMean
            | Function::TsSum
            | Function::TsStd
            | Function::TsMax
            | Function::TsMin
            | Function::DynamicTsMax
            | Function::DynamicTsMin
            | Function::TsMidpoint
            | Function::TsRank
            | Function::TsZscore
            | Function::TsBbands => (1, true),
            Function::TsAtr | Function::TsNatr => (3, true),
            Function::TsCorr => (2, true),
            Function::TsHtTrendmode
            | Function::Abs
            | Function::Log
            | Function::Sqrt
            | Function::Sign
            | Function::Neg
            | Function::CsRank
            | Function::CsZscore => (1, false),
            Function::Add
            | Function::Sub
            | Function::Mul
            | Function::Div
            | Function::Max
            | Function::Min => (2, false),
        };
        Signature { series, window }
    }

    /// Evaluate over `time × symbol` inputs of identical shape.
    ///
    /// `window` is present exactly when the signature declares one.
    pub fn apply(self, inputs: &[Matrix], window: Option<usize>) -> Matrix {
        let d = window.unwrap_or(1);
        match self {
            Function::TsDelta => per_symbol(inputs, |c| ops::delta(&c[0], d)),
            Function::TsDelay => per_symbol(inputs, |c| ops::delay(&c[0], d)),
            Function::TsMean => per_symbol(inputs, |c| ops::sma(&c[0], d)),
            Function::TsSum => per_symbol(inputs, |c| ops::rolling_sum(&c[0], d)),
            Function::TsStd => per_symbol(inputs, |c| ops::rolling_pstd(&c[0], d)),
            Function::TsMax => per_symbol(inputs, |c| ops::rolling_max(&c[0], d)),
            Function::TsMin => per_symbol(inputs, |c| ops::rolling_min(&c[0], d)),
            Function::DynamicTsMax => per_symbol(inputs, |c| ops::rolling_max_finite(&c[0], d)),
            Function::DynamicTsMin => per_symbol(inputs, |c| ops::rolling_min_finite(&c[0], d)),
            Function::TsMidpoint => per_symbol(inputs, |c| ops::midpoint(&c[0], d)),
            Function::TsRank => per_symbol(inputs, |c| ops::rolling_rank(&c[0], d)),
            Function::TsZscore => {
                per_symbol(inputs, |c| ops::rolling_zscore(&c[0], d, STD_FLOOR))
            }
            Function::TsAtr => per_symbol(inputs, |c| ops::atr(&c[0], &c[1], &c[2], d)),
            Function::TsNatr => per_symbol(inputs, |c| ops::natr(&c[0], &c[1], &c[2], d)),
            Function::TsBbands => per_symbol(inputs, |c| {
                let (_, upper, lower) = ops::bollinger_bands(&c[0], d, BBANDS_STD_MULT);
                ops::bollinger_position(&c[0], &lower, &upper)
            }),
            Function::TsHtTrendmode => per_symbol(inputs, |c| ops::ht_trendmode(&c[0])),
            Function::TsCorr => per_symbol(inputs, |c| ops::rolling_corr(&c[0], &c[1], d)),
            Function::Abs => inputs[0].map(f64::abs),
            Function::Log => inputs[0].map(|v| if v > 0.0 { v.ln() } else { f64::NAN }),
            Function::Sqrt => inputs[0].map(|v| if v >= 0.0 { v.sqrt() } else { f64::NAN }),
            Function::Sign => inputs[0].map(|v| {
                if v.is_nan() {
                    f64::NAN
                } else if v > 0.0 {
                    1.0
                } else if v < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }),
            Function::Neg => inputs[0].map(|v| -v),
            Function::Add => inputs[0].zip_map(&inputs[1], |a, b| a + b),
            Function::Sub => inputs[0].zip_map(&inputs[1], |a, b| a - b),
            Function::Mul => inputs[0].zip_map(&inputs[1], |a, b| a * b),
            Function::Div => inputs[0].zip_map(&inputs[1], safe_div),
            Function::Max => inputs[0].zip_map(&inputs[1], nan_max),
            Function::Min => inputs[0].zip_map(&inputs[1], nan_min),
            Function::CsRank => inputs[0].map_rows(ops::stats::percentile_ranks),
            Function::CsZscore => inputs[0].map_rows(|row| ops::stats::zscore(row, STD_FLOOR)),
        }
    }
}

/// Division that maps a zero denominator to `NaN` instead of `±inf`.
pub fn safe_div(a: f64, b: f64) -> f64 {
    if b == 0.0 { f64::NAN } else { a / b }
}

fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

/// Run a time-series kernel on every symbol column.
fn per_symbol<F>(inputs: &[Matrix], kernel: F) -> Matrix
where
    F: Fn(&[Vec<f64>]) -> Vec<f64>,
{
    let rows = inputs[0].rows();
    let cols = inputs[0].cols();
    let columns: Vec<Vec<f64>> = (0..cols)
        .map(|c| {
            let series: Vec<Vec<f64>> = inputs.iter().map(|m| m.column(c)).collect();
            kernel(&series)
        })
        .collect();
    Matrix::from_columns(rows, &columns)
}
