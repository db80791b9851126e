use std::path::Path;

use ahash::AHashMap;
use anyhow::{Context, Result, anyhow};
use chrono::{Days, NaiveDate};
use polars::prelude::*;
use tracing::{debug, warn};

use crate::simulator::SymbolSpec;

/// Raw kline columns, in the order stored by [`SymbolKlines`].
pub const KLINE_FIELDS: [&str; 9] = [
    "open",
    "high",
    "low",
    "close",
    "volume",
    "quote_volume",
    "trades",
    "taker_buy_volume",
    "taker_buy_quote_volume",
];

/// One bar as delivered by the exchange client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kline {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades: f64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
}

impl Kline {
    fn values(&self) -> [f64; 9] {
        [
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.quote_volume,
            self.trades,
            self.taker_buy_volume,
            self.taker_buy_quote_volume,
        ]
    }
}

/// Column-oriented kline history of one symbol, sorted by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolKlines {
    pub symbol: String,
    pub timestamps: Vec<i64>,
    /// One vector per entry of [`KLINE_FIELDS`].
    pub fields: Vec<Vec<f64>>,
}

impl SymbolKlines {
    /// Build from bars in any order. Duplicate timestamps are rejected.
    pub fn from_klines(symbol: impl Into<String>, klines: &[Kline]) -> Result<Self> {
        let symbol = symbol.into();
        let mut sorted = klines.to_vec();
        sorted.sort_by_key(|k| k.timestamp);
        if let Some(pair) = sorted.windows(2).find(|w| w[0].timestamp == w[1].timestamp) {
            return Err(anyhow!(
                "Symbol {symbol} has duplicate bars at timestamp {}",
                pair[0].timestamp
            ));
        }
        let mut fields = vec![Vec::with_capacity(sorted.len()); KLINE_FIELDS.len()];
        for kline in &sorted {
            for (column, value) in fields.iter_mut().zip(kline.values()) {
                column.push(value);
            }
        }
        Ok(Self {
            symbol,
            timestamps: sorted.iter().map(|k| k.timestamp).collect(),
            fields,
        })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&[f64]> {
        KLINE_FIELDS
            .iter()
            .position(|f| *f == name)
            .map(|idx| self.fields[idx].as_slice())
    }

    /// Rows with `start_ms <= timestamp <= end_ms`.
    pub fn restrict(&self, start_ms: i64, end_ms: i64) -> Self {
        let lo = self.timestamps.partition_point(|&t| t < start_ms);
        let hi = self.timestamps.partition_point(|&t| t <= end_ms);
        Self {
            symbol: self.symbol.clone(),
            timestamps: self.timestamps[lo..hi].to_vec(),
            fields: self.fields.iter().map(|f| f[lo..hi].to_vec()).collect(),
        }
    }
}

/// Keep only bars whose UTC calendar date lies within the optional bounds.
pub fn filter_by_date_range(
    klines: Vec<SymbolKlines>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Vec<SymbolKlines> {
    if start.is_none() && end.is_none() {
        return klines;
    }
    let start_ms = start.map_or(i64::MIN, day_start_ms);
    let end_ms = end
        .and_then(|d| d.checked_add_days(Days::new(1)))
        .map_or(i64::MAX, |d| day_start_ms(d) - 1);
    klines
        .into_iter()
        .map(|k| k.restrict(start_ms, end_ms))
        .filter(|k| !k.is_empty())
        .collect()
}

fn day_start_ms(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map_or(0, |dt| dt.and_utc().timestamp_millis())
}

fn read_frame(path: &Path) -> Result<DataFrame> {
    let is_parquet = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"));
    let lazy = if is_parquet {
        LazyFrame::scan_parquet(path, ScanArgsParquet::default())
            .with_context(|| format!("Failed to initialize Parquet scan for {}", path.display()))?
    } else {
        LazyCsvReader::new(path)
            .has_header(true)
            .finish()
            .with_context(|| format!("Failed to initialize CSV reader for {}", path.display()))?
    };
    lazy.collect()
        .with_context(|| format!("Failed to collect data from {}", path.display()))
}

fn float_column(frame: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let series = frame
        .column(name)
        .with_context(|| format!("Missing required column {name}"))?
        .cast(&DataType::Float64)
        .with_context(|| format!("Column {name} must be numeric"))?;
    Ok(series
        .f64()
        .with_context(|| format!("Column {name} must be float"))?
        .into_iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect())
}

fn i64_column(frame: &DataFrame, name: &str) -> Result<Vec<i64>> {
    let series = frame
        .column(name)
        .with_context(|| format!("Missing required column {name}"))?
        .cast(&DataType::Int64)
        .with_context(|| format!("Column {name} must be integer"))?;
    series
        .i64()
        .with_context(|| format!("Column {name} must be i64"))?
        .into_iter()
        .map(|opt| opt.ok_or_else(|| anyhow!("Column {name} contains nulls")))
        .collect()
}

fn string_column(frame: &DataFrame, name: &str) -> Result<Vec<String>> {
    let series = frame
        .column(name)
        .with_context(|| format!("Missing required column {name}"))?;
    series
        .str()
        .with_context(|| format!("Column {name} must be text"))?
        .into_iter()
        .map(|opt| {
            opt.map(str::to_string)
                .ok_or_else(|| anyhow!("Column {name} contains nulls"))
        })
        .collect()
}

/// Load a long-format klines table (`timestamp` in ms, `symbol`, then the
/// [`KLINE_FIELDS`]) and split it per symbol in first-seen order.
pub fn load_klines(path: &Path) -> Result<Vec<SymbolKlines>> {
    let frame = read_frame(path)?;
    let timestamps = i64_column(&frame, "timestamp")?;
    let symbols = string_column(&frame, "symbol")?;
    let columns = KLINE_FIELDS
        .iter()
        .map(|name| float_column(&frame, name))
        .collect::<Result<Vec<_>>>()?;

    let mut order: Vec<String> = Vec::new();
    let mut rows_by_symbol: AHashMap<String, Vec<Kline>> = AHashMap::new();
    for (row, symbol) in symbols.into_iter().enumerate() {
        let kline = Kline {
            timestamp: timestamps[row],
            open: columns[0][row],
            high: columns[1][row],
            low: columns[2][row],
            close: columns[3][row],
            volume: columns[4][row],
            quote_volume: columns[5][row],
            trades: columns[6][row],
            taker_buy_volume: columns[7][row],
            taker_buy_quote_volume: columns[8][row],
        };
        rows_by_symbol
            .entry(symbol.clone())
            .or_insert_with(|| {
                order.push(symbol);
                Vec::new()
            })
            .push(kline);
    }

    let klines = order
        .iter()
        .map(|symbol| {
            let rows = rows_by_symbol.get(symbol).map_or(&[][..], Vec::as_slice);
            SymbolKlines::from_klines(symbol.clone(), rows)
        })
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("Invalid klines in {}", path.display()))?;
    debug!(
        path = %path.display(),
        symbols = klines.len(),
        rows = frame.height(),
        "loaded klines"
    );
    Ok(klines)
}

/// Per-symbol exchange constraints keyed by symbol.
#[derive(Debug, Clone, Default)]
pub struct SymbolBook {
    specs: AHashMap<String, SymbolSpec>,
}

impl SymbolBook {
    pub fn new(specs: impl IntoIterator<Item = (String, SymbolSpec)>) -> Self {
        Self {
            specs: specs.into_iter().collect(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolSpec> {
        self.specs.get(symbol).copied()
    }

    /// Specs in the order of `symbols`. Unknown symbols get no rounding and
    /// no minimum notional.
    pub fn specs_for(&self, symbols: &[String]) -> Vec<SymbolSpec> {
        symbols
            .iter()
            .map(|symbol| {
                self.get(symbol).unwrap_or_else(|| {
                    warn!(%symbol, "no symbol metadata; trading without lot rounding");
                    SymbolSpec::unconstrained()
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Load `symbol,volume_precision,notional` rows.
pub fn load_symbol_book(path: &Path) -> Result<SymbolBook> {
    let frame = read_frame(path)?;
    let symbols = string_column(&frame, "symbol")?;
    let precision = i64_column(&frame, "volume_precision")?;
    let notional = float_column(&frame, "notional")?;
    let mut specs = Vec::with_capacity(symbols.len());
    for ((symbol, precision), min_notional) in symbols.into_iter().zip(precision).zip(notional) {
        let volume_precision = u32::try_from(precision).map_err(|_| {
            anyhow!("Symbol {symbol} has invalid volume_precision {precision}")
        })?;
        specs.push((
            symbol,
            SymbolSpec {
                volume_precision,
                min_notional: if min_notional.is_finite() { min_notional } else { 0.0 },
            },
        ));
    }
    Ok(SymbolBook::new(specs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(timestamp: i64, close: f64) -> Kline {
        Kline {
            timestamp,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            quote_volume: close,
            trades: 1.0,
            taker_buy_volume: 0.5,
            taker_buy_quote_volume: close / 2.0,
        }
    }

    #[test]
    fn from_klines_sorts_and_rejects_duplicates() {
        let klines = SymbolKlines::from_klines("A", &[bar(2, 2.0), bar(1, 1.0)]).expect("valid");
        assert_eq!(klines.timestamps, vec![1, 2]);
        assert_eq!(klines.field("close"), Some(&[1.0, 2.0][..]));
        assert!(SymbolKlines::from_klines("A", &[bar(1, 1.0), bar(1, 2.0)]).is_err());
    }

    #[test]
    fn restrict_is_inclusive() {
        let klines =
            SymbolKlines::from_klines("A", &[bar(1, 1.0), bar(2, 2.0), bar(3, 3.0)]).expect("ok");
        assert_eq!(klines.restrict(2, 3).timestamps, vec![2, 3]);
    }
}
