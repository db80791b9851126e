use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};
use crate::matrix::Matrix;

/// Fixed, ordered list of tradable symbols.
#[derive(Debug, Clone)]
pub struct SymbolUniverse {
    symbols: Vec<String>,
    index: AHashMap<String, usize>,
}

impl SymbolUniverse {
    pub fn new(symbols: Vec<String>) -> Result<Self> {
        let mut index = AHashMap::with_capacity(symbols.len());
        for (i, symbol) in symbols.iter().enumerate() {
            if index.insert(symbol.clone(), i).is_some() {
                return Err(QuantError::portfolio(format!(
                    "symbol {symbol} appears twice in the universe"
                )));
            }
        }
        Ok(Self { symbols, index })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn position(&self, symbol: &str) -> Option<usize> {
        self.index.get(symbol).copied()
    }
}

/// Signed weight per symbol of a universe.
///
/// Values are always finite. There is no way to change a weight in place;
/// the `with_*` methods return a new portfolio.
#[derive(Debug, Clone, PartialEq)]
pub struct Portfolio {
    universe: Arc<SymbolUniverse>,
    weights: Arc<[f64]>,
}

impl Portfolio {
    /// Weights in universe order. The length must match exactly.
    pub fn from_weights(universe: Arc<SymbolUniverse>, weights: Vec<f64>) -> Result<Self> {
        if weights.len() != universe.len() {
            return Err(QuantError::portfolio(format!(
                "expected {} weights, got {}",
                universe.len(),
                weights.len()
            )));
        }
        for (symbol, w) in universe.symbols().iter().zip(&weights) {
            check_finite(symbol, *w)?;
        }
        Ok(Self {
            universe,
            weights: weights.into(),
        })
    }

    /// Symbols missing from `map` get a zero weight; unknown symbols are
    /// rejected.
    pub fn from_map<'a, I>(universe: Arc<SymbolUniverse>, map: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut weights = vec![0.0; universe.len()];
        for (symbol, w) in map {
            let idx = universe.position(symbol).ok_or_else(|| {
                QuantError::portfolio(format!("symbol {symbol} is not in the universe"))
            })?;
            weights[idx] = w;
        }
        Self::from_weights(universe, weights)
    }

    pub fn zeros(universe: Arc<SymbolUniverse>) -> Self {
        let weights = vec![0.0; universe.len()].into();
        Self { universe, weights }
    }

    pub fn universe(&self) -> &Arc<SymbolUniverse> {
        &self.universe
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.universe.position(symbol).map(|i| self.weights[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.universe
            .symbols()
            .iter()
            .map(String::as_str)
            .zip(self.weights.iter().copied())
    }

    pub fn with_weight(&self, symbol: &str, weight: f64) -> Result<Self> {
        self.with_updates([(symbol, weight)])
    }

    pub fn with_updates<'a, I>(&self, updates: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut weights = self.weights.to_vec();
        for (symbol, w) in updates {
            let idx = self.universe.position(symbol).ok_or_else(|| {
                QuantError::portfolio(format!("symbol {symbol} is not in the universe"))
            })?;
            weights[idx] = w;
        }
        Self::from_weights(Arc::clone(&self.universe), weights)
    }

    pub fn net_exposure(&self) -> f64 {
        self.weights.iter().sum()
    }

    pub fn gross_exposure(&self) -> f64 {
        self.weights.iter().map(|w| w.abs()).sum()
    }

    pub fn is_delta_neutral(&self, epsilon: f64) -> bool {
        self.net_exposure().abs() < epsilon
    }
}

/// Fail on the first row of `weights` whose sum is not within `epsilon` of
/// zero.
pub fn ensure_delta_neutral(weights: &Matrix, epsilon: f64, context: &str) -> Result<()> {
    for (row, values) in weights.iter_rows().enumerate() {
        let sum: f64 = values.iter().sum();
        if !(sum.abs() < epsilon) {
            return Err(QuantError::DeltaNeutrality {
                row,
                sum,
                context: context.to_string(),
            });
        }
    }
    Ok(())
}

impl PartialEq for SymbolUniverse {
    fn eq(&self, other: &Self) -> bool {
        self.symbols == other.symbols
    }
}

fn check_finite(symbol: &str, weight: f64) -> Result<()> {
    if weight.is_finite() {
        Ok(())
    } else {
        Err(QuantError::portfolio(format!(
            "weight for {symbol} is not finite ({weight})"
        )))
    }
}

/// A portfolio stamped with the bar it was produced for.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioRecord {
    /// Unix milliseconds.
    pub timestamp: i64,
    pub portfolio: Portfolio,
}

/// JSON shape of a [`PortfolioRecord`].
///
/// `portfolio` keys serialize in sorted symbol order, not universe order, so
/// the same record always produces the same bytes. Readers map keys back to
/// universe positions through [`PortfolioRecord::from_wire`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireRecord {
    pub timestamp: i64,
    pub portfolio: BTreeMap<String, f64>,
}

impl PortfolioRecord {
    pub fn to_wire(&self) -> WireRecord {
        WireRecord {
            timestamp: self.timestamp,
            portfolio: self
                .portfolio
                .iter()
                .map(|(symbol, w)| (symbol.to_string(), w))
                .collect(),
        }
    }

    /// Validate a received record against the universe.
    pub fn from_wire(wire: &WireRecord, universe: Arc<SymbolUniverse>) -> Result<Self> {
        let portfolio = Portfolio::from_map(
            universe,
            wire.portfolio.iter().map(|(symbol, w)| (symbol.as_str(), *w)),
        )?;
        Ok(Self {
            timestamp: wire.timestamp,
            portfolio,
        })
    }
}
