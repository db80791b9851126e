use anyhow::Context;
use polars::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::data::{KLINE_FIELDS, SymbolKlines};
use crate::error::{QuantError, Result};
use crate::matrix::Matrix;

/// Fields available to factor expressions, in storage order.
pub const PANEL_FIELDS: [&str; 10] = [
    "open",
    "high",
    "low",
    "close",
    "volume",
    "quote_volume",
    "trades",
    "taker_buy_volume",
    "taker_buy_quote_volume",
    "vwap",
];

/// Forward one-bar simple return of the close.
pub const TARGET_FIELD: &str = "return_1";

const VWAP_INDEX: usize = 9;

/// A symbol that did not make it into the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedSymbol {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PanelAssembly {
    pub panel: Panel,
    pub excluded: Vec<ExcludedSymbol>,
}

/// Aligned `time × symbol × field` market data.
///
/// Every symbol shares one strictly increasing, evenly spaced timestamp
/// grid. The panel is immutable once built; derived tables copy its index.
#[derive(Debug, Clone)]
pub struct Panel {
    timestamps: Vec<i64>,
    symbols: Vec<String>,
    fields: Vec<Matrix>,
    returns: Matrix,
}

impl Panel {
    /// Build a panel from already aligned per-field matrices ordered as the
    /// first nine [`PANEL_FIELDS`]. `vwap` and `return_1` are derived.
    pub fn from_kline_fields(
        timestamps: Vec<i64>,
        symbols: Vec<String>,
        kline_fields: Vec<Matrix>,
    ) -> Result<Self> {
        if kline_fields.len() != KLINE_FIELDS.len() {
            return Err(QuantError::alignment(format!(
                "expected {} kline fields, got {}",
                KLINE_FIELDS.len(),
                kline_fields.len()
            )));
        }
        for (name, matrix) in KLINE_FIELDS.iter().zip(&kline_fields) {
            if matrix.rows() != timestamps.len() || matrix.cols() != symbols.len() {
                return Err(QuantError::alignment(format!(
                    "field {name} is {}x{}, expected {}x{}",
                    matrix.rows(),
                    matrix.cols(),
                    timestamps.len(),
                    symbols.len()
                )));
            }
        }
        check_grid(&timestamps)?;

        let mut fields = kline_fields;
        let vwap = fields[5]
            .zip_map(&fields[4], |quote, base| quote / base)
            .map_columns(fill_vwap_gaps);
        let close = &fields[3];
        let vwap = Matrix::from_columns(
            vwap.rows(),
            &(0..vwap.cols())
                .map(|c| {
                    let column = vwap.column(c);
                    if column.iter().all(|v| !v.is_finite()) {
                        close.column(c)
                    } else {
                        column
                    }
                })
                .collect::<Vec<_>>(),
        );
        fields.push(vwap);
        let returns = fields[3].map_columns(forward_returns);

        Ok(Self {
            timestamps,
            symbols,
            fields,
            returns,
        })
    }

    /// Align raw per-symbol klines onto one reference grid.
    ///
    /// The reference is `reference` when given, otherwise the symbol with the
    /// most bars. Symbols whose bars inside the reference window do not match
    /// the grid exactly, or that carry missing or non-positive prices, are
    /// excluded and reported. Fails only when the reference grid itself is
    /// unusable or no symbol survives.
    pub fn assemble(klines: &[SymbolKlines], reference: Option<&str>) -> Result<PanelAssembly> {
        let reference_klines = match reference {
            Some(name) => klines.iter().find(|k| k.symbol == name).ok_or_else(|| {
                QuantError::alignment(format!("reference symbol {name} has no klines"))
            })?,
            None => klines
                .iter()
                .fold(None::<&SymbolKlines>, |best, k| match best {
                    Some(b) if b.len() >= k.len() => Some(b),
                    _ => Some(k),
                })
                .ok_or_else(|| QuantError::alignment("no klines supplied"))?,
        };
        let grid = reference_klines.timestamps.clone();
        let (Some(&start), Some(&end)) = (grid.first(), grid.last()) else {
            return Err(QuantError::alignment(format!(
                "reference symbol {} has no bars",
                reference_klines.symbol
            )));
        };
        check_grid(&grid)?;

        let mut symbols = Vec::new();
        let mut columns: Vec<Vec<Vec<f64>>> = vec![Vec::new(); KLINE_FIELDS.len()];
        let mut excluded = Vec::new();
        for raw in klines {
            let window = raw.restrict(start, end);
            let reason = if window.len() != grid.len() {
                Some(format!(
                    "{} bars inside the reference window, expected {}",
                    window.len(),
                    grid.len()
                ))
            } else if window.timestamps != grid {
                Some("timestamp grid differs from reference".to_string())
            } else if window
                .fields
                .iter()
                .any(|f| f.iter().any(|v| !v.is_finite()))
            {
                Some("missing observations".to_string())
            } else if window.fields[3].iter().any(|&c| c <= 0.0) {
                Some("non-positive close".to_string())
            } else {
                None
            };
            match reason {
                Some(reason) => {
                    warn!(symbol = %raw.symbol, %reason, "excluding symbol from panel");
                    excluded.push(ExcludedSymbol {
                        symbol: raw.symbol.clone(),
                        reason,
                    });
                }
                None => {
                    symbols.push(raw.symbol.clone());
                    for (column, values) in columns.iter_mut().zip(window.fields) {
                        column.push(values);
                    }
                }
            }
        }

        if symbols.is_empty() {
            return Err(QuantError::alignment(format!(
                "no symbol survived alignment ({} excluded)",
                excluded.len()
            )));
        }

        let kline_fields = columns
            .iter()
            .map(|per_symbol| Matrix::from_columns(grid.len(), per_symbol))
            .collect();
        let panel = Self::from_kline_fields(grid, symbols, kline_fields)?;
        info!(
            symbols = panel.n_symbols(),
            rows = panel.n_rows(),
            excluded = excluded.len(),
            reference = %reference_klines.symbol,
            "assembled panel"
        );
        Ok(PanelAssembly { panel, excluded })
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn n_rows(&self) -> usize {
        self.timestamps.len()
    }

    pub fn n_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn field(&self, name: &str) -> Option<&Matrix> {
        PANEL_FIELDS
            .iter()
            .position(|f| *f == name)
            .map(|idx| &self.fields[idx])
    }

    pub fn open(&self) -> &Matrix {
        &self.fields[0]
    }

    pub fn high(&self) -> &Matrix {
        &self.fields[1]
    }

    pub fn low(&self) -> &Matrix {
        &self.fields[2]
    }

    pub fn close(&self) -> &Matrix {
        &self.fields[3]
    }

    pub fn vwap(&self) -> &Matrix {
        &self.fields[VWAP_INDEX]
    }

    /// `return_1`: `close[t+1] / close[t] - 1`, `NaN` on the last row.
    pub fn returns(&self) -> &Matrix {
        &self.returns
    }

    /// Spacing of the timestamp grid, `None` for fewer than two rows.
    pub fn bar_interval_ms(&self) -> Option<i64> {
        match self.timestamps.as_slice() {
            [first, second, ..] => Some(second - first),
            _ => None,
        }
    }

    pub fn row_of(&self, timestamp: i64) -> Option<usize> {
        self.timestamps.binary_search(&timestamp).ok()
    }

    /// Rows `[start, end)`. `return_1` keeps its values from the full panel.
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.n_rows());
        let start = start.min(end);
        Self {
            timestamps: self.timestamps[start..end].to_vec(),
            symbols: self.symbols.clone(),
            fields: self
                .fields
                .iter()
                .map(|f| f.slice_rows(start, end))
                .collect(),
            returns: self.returns.slice_rows(start, end),
        }
    }

    /// SHA-256 over the grid, symbols and every stored value.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for ts in &self.timestamps {
            hasher.update(ts.to_le_bytes());
        }
        for symbol in &self.symbols {
            hasher.update(symbol.as_bytes());
            hasher.update([0u8]);
        }
        for field in &self.fields {
            for value in field.as_slice() {
                hasher.update(value.to_bits().to_le_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Long format: one row per (timestamp, symbol).
    pub fn to_data_frame(&self) -> anyhow::Result<DataFrame> {
        let n = self.n_rows() * self.n_symbols();
        let mut timestamps = Vec::with_capacity(n);
        let mut symbols = Vec::with_capacity(n);
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
        for (name, field) in PANEL_FIELDS.iter().zip(&self.fields) {
            columns.push(Series::new(name, field.as_slice()));
        }
        columns.push(Series::new(TARGET_FIELD, self.returns.as_slice()));
        DataFrame::new(columns).context("Failed to build panel frame")
    }
}

fn check_grid(timestamps: &[i64]) -> Result<()> {
    let Some(step) = timestamps.windows(2).map(|w| w[1] - w[0]).next() else {
        return Ok(());
    };
    if step <= 0 {
        return Err(QuantError::alignment(format!(
            "timestamps must be strictly increasing, found step {step}"
        )));
    }
    if let Some(pair) = timestamps.windows(2).find(|w| w[1] - w[0] != step) {
        return Err(QuantError::alignment(format!(
            "timestamp grid has a gap between {} and {} (expected step {step})",
            pair[0], pair[1]
        )));
    }
    Ok(())
}

fn fill_vwap_gaps(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    bitquant_ops::forward_fill(&mut out);
    bitquant_ops::backward_fill(&mut out);
    out
}

fn forward_returns(close: &[f64]) -> Vec<f64> {
    (0..close.len())
        .map(|t| match close.get(t + 1) {
            Some(next) => next / close[t] - 1.0,
            None => f64::NAN,
        })
        .collect()
}
