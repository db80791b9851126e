use anyhow::Context;
use polars::prelude::*;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{QuantError, Result};
use crate::expr::{BinaryOp, Expr};
use crate::functions::safe_div;
use crate::matrix::Matrix;
use crate::panel::Panel;

/// Factor values indexed like the panel they were computed from: one
/// `time × symbol` matrix per named factor.
#[derive(Debug, Clone)]
pub struct FactorTable {
    timestamps: Vec<i64>,
    symbols: Vec<String>,
    names: Vec<String>,
    values: Vec<Matrix>,
}

impl FactorTable {
    /// Every matrix must be `timestamps × symbols`, one per name.
    pub fn new(
        timestamps: Vec<i64>,
        symbols: Vec<String>,
        names: Vec<String>,
        values: Vec<Matrix>,
    ) -> Result<Self> {
        if names.len() != values.len() {
            return Err(QuantError::alignment(format!(
                "{} factor names for {} value matrices",
                names.len(),
                values.len()
            )));
        }
        if let Some((name, matrix)) = names.iter().zip(&values).find(|(_, m)| {
            m.rows() != timestamps.len() || m.cols() != symbols.len()
        }) {
            return Err(QuantError::alignment(format!(
                "factor {name} is {}x{}, index is {}x{}",
                matrix.rows(),
                matrix.cols(),
                timestamps.len(),
                symbols.len()
            )));
        }
        Ok(Self::from_parts(timestamps, symbols, names, values))
    }

    fn from_parts(
        timestamps: Vec<i64>,
        symbols: Vec<String>,
        names: Vec<String>,
        values: Vec<Matrix>,
    ) -> Self {
        debug_assert_eq!(names.len(), values.len());
        Self {
            timestamps,
            symbols,
            names,
            values,
        }
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_rows(&self) -> usize {
        self.timestamps.len()
    }

    pub fn n_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn n_factors(&self) -> usize {
        self.names.len()
    }

    pub fn values(&self) -> &[Matrix] {
        &self.values
    }

    pub fn factor(&self, name: &str) -> Option<&Matrix> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| &self.values[idx])
    }

    /// Same index, new values (one matrix per existing factor).
    pub fn with_values(&self, values: Vec<Matrix>) -> Self {
        debug_assert!(values.len() == self.n_factors());
        Self::from_parts(
            self.timestamps.clone(),
            self.symbols.clone(),
            self.names.clone(),
            values,
        )
    }

    /// Keep only `names` that exist, in the order given.
    pub fn select(&self, names: &[String]) -> Self {
        let (kept_names, kept_values) = names
            .iter()
            .filter_map(|name| self.factor(name).map(|m| (name.clone(), m.clone())))
            .unzip();
        Self::from_parts(
            self.timestamps.clone(),
            self.symbols.clone(),
            kept_names,
            kept_values,
        )
    }

    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.n_rows());
        let start = start.min(end);
        Self::from_parts(
            self.timestamps[start..end].to_vec(),
            self.symbols.clone(),
            self.names.clone(),
            self.values
                .iter()
                .map(|m| m.slice_rows(start, end))
                .collect(),
        )
    }

    /// Exposure of every symbol to every factor at one row, as
    /// `symbols × factors` in row-major order.
    pub fn cross_section(&self, row: usize) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.n_symbols() * self.n_factors());
        for s in 0..self.n_symbols() {
            out.extend(self.values.iter().map(|m| m.get(row, s)));
        }
        out
    }

    /// Every value of one factor flattened over (time, symbol).
    pub fn stacked(&self, factor: usize) -> &[f64] {
        self.values[factor].as_slice()
    }

    /// Long format: `timestamp`, `symbol`, then one column per factor.
    pub fn to_data_frame(&self) -> anyhow::Result<DataFrame> {
        let mut timestamps = Vec::with_capacity(self.n_rows() * self.n_symbols());
        let mut symbols = Vec::with_capacity(self.n_rows() * self.n_symbols());
        for &ts in &self.timestamps {
            for symbol in &self.symbols {
                timestamps.push(ts);
                symbols.push(symbol.as_str());
            }
        }
        let mut columns = vec![
            Series::new("timestamp", timestamps),
            Series::new("symbol", symbols),
        ];
        for (name, values) in self.names.iter().zip(&self.values) {
            columns.push(Series::new(name, values.as_slice()));
        }
        DataFrame::new(columns).context("Failed to build factor frame")
    }
}

/// Evaluates factor expressions over a panel.
///
/// Expressions are parsed up front so a bad expression fails the whole call
/// before any evaluation work starts. Evaluation then runs one expression
/// per rayon task against the shared read-only panel.
#[derive(Debug, Clone, Copy, Default)]
pub struct FactorCalculator;

impl FactorCalculator {
    pub fn parse_all(expressions: &[String]) -> Result<Vec<Expr>> {
        expressions.iter().map(|source| Expr::parse(source)).collect()
    }

    pub fn compute(&self, panel: &Panel, expressions: &[String]) -> Result<FactorTable> {
        let parsed = Self::parse_all(expressions)?;
        let values: Vec<Matrix> = parsed
            .par_iter()
            .map(|expr| {
                let matrix = evaluate(expr, panel);
                debug!(
                    factor = %expr,
                    finite = matrix.as_slice().iter().filter(|v| v.is_finite()).count(),
                    "evaluated factor"
                );
                matrix
            })
            .collect();
        info!(
            factors = values.len(),
            rows = panel.n_rows(),
            symbols = panel.n_symbols(),
            "computed factor table"
        );
        FactorTable::new(
            panel.timestamps().to_vec(),
            panel.symbols().to_vec(),
            expressions.to_vec(),
            values,
        )
    }
}

enum Value {
    Scalar(f64),
    Series(Matrix),
}

impl Value {
    fn into_matrix(self, rows: usize, cols: usize) -> Matrix {
        match self {
            Value::Scalar(v) => Matrix::filled(rows, cols, v),
            Value::Series(m) => m,
        }
    }
}

/// Evaluate a parsed expression to a `time × symbol` matrix. Literal results
/// are broadcast to the panel shape.
pub fn evaluate(expr: &Expr, panel: &Panel) -> Matrix {
    eval(expr, panel).into_matrix(panel.n_rows(), panel.n_symbols())
}

fn eval(expr: &Expr, panel: &Panel) -> Value {
    let (rows, cols) = (panel.n_rows(), panel.n_symbols());
    match expr {
        Expr::Literal(v) => Value::Scalar(*v),
        Expr::Field(name) => Value::Series(
            panel
                .field(name)
                .cloned()
                .unwrap_or_else(|| Matrix::filled(rows, cols, f64::NAN)),
        ),
        Expr::Call {
            function,
            args,
            window,
        } => {
            let inputs: Vec<Matrix> = args
                .iter()
                .map(|arg| eval(arg, panel).into_matrix(rows, cols))
                .collect();
            Value::Series(function.apply(&inputs, *window))
        }
        Expr::Neg(inner) => match eval(inner, panel) {
            Value::Scalar(v) => Value::Scalar(-v),
            Value::Series(m) => Value::Series(m.map(|v| -v)),
        },
        Expr::Binary { op, lhs, rhs } => {
            let f = binary_kernel(*op);
            match (eval(lhs, panel), eval(rhs, panel)) {
                (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(f(a, b)),
                (Value::Series(a), Value::Scalar(b)) => Value::Series(a.map(|v| f(v, b))),
                (Value::Scalar(a), Value::Series(b)) => Value::Series(b.map(|v| f(a, v))),
                (Value::Series(a), Value::Series(b)) => Value::Series(a.zip_map(&b, f)),
            }
        }
    }
}

fn binary_kernel(op: BinaryOp) -> fn(f64, f64) -> f64 {
    match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::Div => safe_div,
    }
}
