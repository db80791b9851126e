use std::collections::BTreeSet;

use bitquant_ops::stats::pearson_pairwise;
use itertools::Itertools;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::SelectorConfig;
use crate::error::{QuantError, Result};
use crate::factor::FactorTable;

/// Symmetric factor-by-factor correlation over every (time, symbol) cell.
#[derive(Debug, Clone)]
pub struct CorrelationMatrix {
    names: Vec<String>,
    values: Vec<f64>,
}

impl CorrelationMatrix {
    /// Pearson correlation between factor columns, using only cells where both
    /// factors are finite.
    pub fn from_table(table: &FactorTable) -> Self {
        let k = table.n_factors();
        let pairs: Vec<(usize, usize)> = (0..k).tuple_combinations().collect();
        let upper: Vec<f64> = pairs
            .par_iter()
            .map(|&(i, j)| pearson_pairwise(table.stacked(i), table.stacked(j)))
            .collect();
        let mut values = vec![1.0; k * k];
        for (&(i, j), &corr) in pairs.iter().zip(&upper) {
            values[i * k + j] = corr;
            values[j * k + i] = corr;
        }
        Self {
            names: table.names().to_vec(),
            values,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.len() + j]
    }
}

/// Prunes correlated factors.
#[derive(Debug, Clone, Copy)]
pub struct FactorSelector {
    pub threshold: f64,
    pub greater_is_better: bool,
}

impl FactorSelector {
    pub fn from_config(config: &SelectorConfig) -> Self {
        Self {
            threshold: config.threshold,
            greater_is_better: config.greater_is_better,
        }
    }

    /// True when `corr` crosses the threshold in the rejected direction.
    /// An undefined correlation never rejects.
    fn rejects(&self, corr: f64) -> bool {
        if corr.is_nan() {
            return false;
        }
        if self.greater_is_better {
            corr < self.threshold
        } else {
            corr > self.threshold
        }
    }

    /// True when `corr` passes the threshold in the wanted direction.
    fn admits(&self, corr: f64) -> bool {
        if corr.is_nan() {
            return false;
        }
        if self.greater_is_better {
            corr > self.threshold
        } else {
            corr < self.threshold
        }
    }

    /// Backward greedy filter. Walking from the last factor to the first, a
    /// factor survives when its correlation with every already-kept factor
    /// after it stays on the wanted side of the threshold. Survivors keep their
    /// input order.
    pub fn select(&self, table: &FactorTable) -> Vec<String> {
        let corr = CorrelationMatrix::from_table(table);
        self.select_from(&corr)
    }

    pub fn select_from(&self, corr: &CorrelationMatrix) -> Vec<String> {
        let mut kept: Vec<usize> = Vec::with_capacity(corr.len());
        for i in (0..corr.len()).rev() {
            if kept.iter().all(|&j| !self.rejects(corr.get(i, j))) {
                kept.push(i);
            } else {
                debug!(factor = %corr.names()[i], "dropped correlated factor");
            }
        }
        kept.reverse();
        let selected: Vec<String> = kept.iter().map(|&i| corr.names()[i].clone()).collect();
        info!(
            input = corr.len(),
            kept = selected.len(),
            threshold = self.threshold,
            "selected factors"
        );
        selected
    }

    /// Grow combinations of `combination_size` factors from `init_factor`.
    ///
    /// Each level extends every current combination with up to
    /// `max_per_iteration` factors (in column order) whose correlation with
    /// every member is admitted by the threshold. Combinations are returned as
    /// sorted, deduplicated name lists in column order.
    pub fn find_low_corr_combinations(
        &self,
        table: &FactorTable,
        init_factor: &str,
        combination_size: usize,
        max_per_iteration: Option<usize>,
    ) -> Result<Vec<Vec<String>>> {
        let corr = CorrelationMatrix::from_table(table);
        let start = corr
            .names()
            .iter()
            .position(|name| name == init_factor)
            .ok_or_else(|| QuantError::config(format!("unknown init factor `{init_factor}`")))?;
        if combination_size == 0 {
            return Err(QuantError::config("combination size must be positive"));
        }
        let limit = max_per_iteration.unwrap_or(corr.len());

        let mut combinations = vec![vec![start]];
        for _ in 1..combination_size {
            combinations = combinations
                .iter()
                .flat_map(|current| {
                    (0..corr.len())
                        .filter(|candidate| !current.contains(candidate))
                        .filter(|&candidate| {
                            current
                                .iter()
                                .all(|&member| self.admits(corr.get(candidate, member)))
                        })
                        .take(limit)
                        .map(|candidate| {
                            let mut next = current.clone();
                            next.push(candidate);
                            next
                        })
                        .collect::<Vec<_>>()
                })
                .collect();
        }

        let unique: BTreeSet<Vec<usize>> = combinations
            .into_iter()
            .map(|combination| combination.into_iter().sorted().collect())
            .collect();
        Ok(unique
            .into_iter()
            .map(|combination| {
                combination
                    .into_iter()
                    .map(|i| corr.names()[i].clone())
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Matrix;

    fn table(columns: &[Vec<f64>]) -> FactorTable {
        let rows = columns[0].len();
        FactorTable::new(
            (0..rows as i64).collect(),
            vec!["S0".to_string()],
            (0..columns.len()).map(|f| format!("f{f}")).collect(),
            columns
                .iter()
                .map(|c| Matrix::from_columns(rows, std::slice::from_ref(c)))
                .collect(),
        )
        .expect("table")
    }

    fn selector(threshold: f64) -> FactorSelector {
        FactorSelector {
            threshold,
            greater_is_better: false,
        }
    }

    #[test]
    fn correlated_earlier_factor_is_dropped() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = vec![2.0, 4.0, 6.0, 8.0, 11.0];
        let c = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        let picked = selector(0.6).select(&table(&[a, b, c]));
        assert_eq!(picked, vec!["f1".to_string(), "f2".to_string()]);
    }

    #[test]
    fn greater_is_better_flips_the_test() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = vec![2.0, 4.0, 6.0, 8.0, 11.0];
        let c = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        let s = FactorSelector {
            threshold: 0.6,
            greater_is_better: true,
        };
        // f2 is kept first; f1 and f0 are uncorrelated with it
        assert_eq!(s.select(&table(&[a, b, c])), vec!["f2".to_string()]);
    }

    #[test]
    fn constant_factor_never_rejects() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let flat = vec![7.0; 4];
        let picked = selector(0.6).select(&table(&[a, flat]));
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn combinations_start_from_init_factor() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = vec![2.0, 4.0, 6.0, 8.0, 11.0];
        let c = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        let d = vec![1.0, 3.0, 2.0, 5.0, 1.0];
        let t = table(&[a, b, c, d]);
        let combos = selector(0.6)
            .find_low_corr_combinations(&t, "f0", 2, None)
            .expect("search");
        assert!(combos.iter().all(|c| c.len() == 2 && c.contains(&"f0".to_string())));
        assert!(!combos.contains(&vec!["f0".to_string(), "f1".to_string()]));
        assert!(combos.contains(&vec!["f0".to_string(), "f2".to_string()]));

        let limited = selector(0.6)
            .find_low_corr_combinations(&t, "f0", 2, Some(1))
            .expect("search");
        assert_eq!(limited.len(), 1);
        assert!(
            selector(0.6)
                .find_low_corr_combinations(&t, "nope", 2, None)
                .is_err()
        );
    }
}
