use bitquant_ops::{fill_non_finite, forward_fill, rolling_zscore, stats};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::{OrthogonalMethod, ScalerConfig};
use crate::error::{QuantError, Result};
use crate::factor::FactorTable;
use crate::matrix::Matrix;

pub const STD_FLOOR: f64 = 1e-8;
const EIGEN_FLOOR: f64 = 1e-12;

/// Normalizes factor columns before selection and aggregation.
///
/// Stages run in a fixed order: time-series z-score, cross-sectional z-score,
/// then orthogonalization. Each enabled stage sees the output of the one
/// before it.
#[derive(Debug, Clone)]
pub struct FactorScaler {
    pub window: usize,
    pub time_series: bool,
    pub cross_section: bool,
    pub orthogonalize: Option<OrthogonalMethod>,
}

impl FactorScaler {
    pub fn from_config(config: &ScalerConfig) -> Self {
        Self {
            window: config.window,
            time_series: config.time_series,
            cross_section: config.cross_section,
            orthogonalize: config.orthogonalize,
        }
    }

    /// Scale every factor. With time-series normalization enabled, the first
    /// `window - 1` rows are dropped from the result.
    pub fn scale(&self, table: &FactorTable) -> Result<FactorTable> {
        let mut scaled = table.clone();

        if self.time_series {
            if self.window == 0 || table.n_rows() < self.window {
                return Err(QuantError::InsufficientHistory {
                    stage: "time-series normalization",
                    required: self.window.max(1),
                    available: table.n_rows(),
                });
            }
            let window = self.window;
            let values = table
                .values()
                .par_iter()
                .map(|m| {
                    m.map_columns(|column| rolling_zscore(column, window, STD_FLOOR))
                        .slice_rows(window - 1, m.rows())
                        .map_columns(fill_forward_then_zero)
                })
                .collect();
            scaled = table
                .slice_rows(window - 1, table.n_rows())
                .with_values(values);
        }

        if self.cross_section {
            let values = scaled
                .values()
                .par_iter()
                .map(|m| {
                    m.map_rows(|row| stats::zscore(row, STD_FLOOR))
                        .map_columns(fill_forward_then_zero)
                })
                .collect();
            scaled = scaled.with_values(values);
        }

        if let Some(method) = self.orthogonalize {
            scaled = orthogonalize_table(&scaled, method);
        }

        debug!(
            rows = scaled.n_rows(),
            factors = scaled.n_factors(),
            "scaled factor table"
        );
        Ok(scaled)
    }
}

fn fill_forward_then_zero(column: &[f64]) -> Vec<f64> {
    let mut out = column.to_vec();
    forward_fill(&mut out);
    fill_non_finite(&mut out, 0.0);
    out
}

/// Decorrelate factors across symbols at every timestamp. Timestamps whose
/// exposures cannot be transformed keep their input values.
pub fn orthogonalize_table(table: &FactorTable, method: OrthogonalMethod) -> FactorTable {
    let (n, k) = (table.n_symbols(), table.n_factors());
    if k == 0 || n == 0 {
        return table.clone();
    }
    let rows: Vec<(Vec<f64>, bool)> = (0..table.n_rows())
        .into_par_iter()
        .map(|row| {
            let exposures = DMatrix::from_row_slice(n, k, &table.cross_section(row));
            let transformed = match method {
                OrthogonalMethod::Symmetric => symmetric_orthogonalize(&exposures),
                OrthogonalMethod::GramSchmidt => gram_schmidt(&exposures),
            };
            match transformed {
                Some(out) => (out.transpose().as_slice().to_vec(), false),
                None => (exposures.transpose().as_slice().to_vec(), true),
            }
        })
        .collect();

    let fallbacks = rows.iter().filter(|(_, fell_back)| *fell_back).count();
    if fallbacks > 0 {
        warn!(
            ?method,
            fallbacks,
            rows = table.n_rows(),
            "orthogonalization kept input exposures for degenerate timestamps"
        );
    }

    // row-major symbols × factors per timestamp back into one matrix per factor
    let mut values = vec![Matrix::zeros(table.n_rows(), n); k];
    for (t, (flat, _)) in rows.iter().enumerate() {
        for s in 0..n {
            for (f, matrix) in values.iter_mut().enumerate() {
                matrix.set(t, s, flat[s * k + f]);
            }
        }
    }
    table.with_values(values)
}

/// Löwdin symmetric orthogonalization of `symbols × factors` exposures.
///
/// `M = (n-1)·cov(F)`, `S = U·diag(λ^-1/2)·Uᵀ`, result `F·S`. Returns `None`
/// when the exposures are non-finite or `M` is not positive definite.
pub fn symmetric_orthogonalize(exposures: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let (n, k) = exposures.shape();
    if n < 2 || k == 0 || exposures.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let means = DVector::from_iterator(k, exposures.column_iter().map(|c| c.mean()));
    let mut centered = exposures.clone();
    for (mut column, mean) in centered.column_iter_mut().zip(means.iter()) {
        column.add_scalar_mut(-mean);
    }
    let overlap = centered.transpose() * &centered;
    let eigen = overlap.symmetric_eigen();
    let largest = eigen.eigenvalues.iter().copied().fold(0.0f64, f64::max);
    let floor = EIGEN_FLOOR * largest.max(1.0);
    if eigen
        .eigenvalues
        .iter()
        .any(|&lambda| !lambda.is_finite() || lambda <= floor)
    {
        return None;
    }
    let inv_sqrt = DMatrix::from_diagonal(&eigen.eigenvalues.map(|lambda| lambda.powf(-0.5)));
    let s = &eigen.eigenvectors * inv_sqrt * eigen.eigenvectors.transpose();
    let out = exposures * s;
    out.iter().all(|v| v.is_finite()).then_some(out)
}

/// Classical Gram-Schmidt over factor columns, returning unit-norm columns.
/// Returns `None` when a column is (numerically) dependent on earlier ones.
pub fn gram_schmidt(exposures: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let (n, k) = exposures.shape();
    if n == 0 || k == 0 || exposures.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut q = DMatrix::<f64>::zeros(n, k);
    for j in 0..k {
        let mut v = exposures.column(j).clone_owned();
        for i in 0..j {
            let qi = q.column(i).clone_owned();
            let projection = qi.dot(&exposures.column(j));
            v -= qi * projection;
        }
        let norm = v.norm();
        if !norm.is_finite() || norm < EIGEN_FLOOR {
            return None;
        }
        q.set_column(j, &(v / norm));
    }
    Some(q)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: Vec<Matrix>) -> FactorTable {
        let rows = columns[0].rows();
        let cols = columns[0].cols();
        FactorTable::new(
            (0..rows as i64).collect(),
            (0..cols).map(|s| format!("S{s}")).collect(),
            (0..columns.len()).map(|f| format!("f{f}")).collect(),
            columns,
        )
        .expect("table")
    }

    #[test]
    fn constant_history_scales_to_zero() {
        let scaler = FactorScaler {
            window: 3,
            time_series: true,
            cross_section: false,
            orthogonalize: None,
        };
        let scaled = scaler
            .scale(&table(vec![Matrix::filled(5, 2, 4.2)]))
            .expect("scale");
        assert_eq!(scaled.n_rows(), 3);
        assert_eq!(scaled.timestamps(), &[2, 3, 4]);
        assert!(scaled.values()[0].as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn missing_values_are_forward_filled_then_zeroed() {
        let column = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        let m = Matrix::from_columns(5, &[column, vec![f64::NAN; 5]]);
        let scaler = FactorScaler {
            window: 2,
            time_series: true,
            cross_section: false,
            orthogonalize: None,
        };
        let scaled = scaler.scale(&table(vec![m])).expect("scale");
        let first = scaled.values()[0].column(0);
        // z of [1,2] at the second bar is +1
        assert!((first[0] - 1.0).abs() < 1e-12);
        assert_eq!(first[2], first[1]);
        assert!(scaled.values()[0].column(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn window_longer_than_history_is_an_error() {
        let scaler = FactorScaler {
            window: 10,
            time_series: true,
            cross_section: false,
            orthogonalize: None,
        };
        assert!(matches!(
            scaler.scale(&table(vec![Matrix::filled(3, 1, 1.0)])),
            Err(QuantError::InsufficientHistory { .. })
        ));
    }

    #[test]
    fn cross_section_zscore_runs_per_timestamp() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0, 3.0], vec![5.0, 5.0, 5.0]]);
        let scaler = FactorScaler {
            window: 1,
            time_series: false,
            cross_section: true,
            orthogonalize: None,
        };
        let scaled = scaler.scale(&table(vec![m])).expect("scale");
        let row = scaled.values()[0].row(0);
        let std = (2.0f64 / 3.0).sqrt();
        assert!((row[0] + 1.0 / std).abs() < 1e-12);
        assert_eq!(scaled.values()[0].row(1), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn symmetric_orthogonalization_decorrelates() {
        let f = DMatrix::from_row_slice(4, 2, &[1.0, 2.0, 2.0, 1.0, 3.0, 5.0, 4.0, 3.0]);
        let out = symmetric_orthogonalize(&f).expect("well conditioned");
        let mut centered = out.clone();
        for mut column in centered.column_iter_mut() {
            let mean = column.mean();
            column.add_scalar_mut(-mean);
        }
        let gram = centered.transpose() * &centered;
        assert!((gram[(0, 0)] - 1.0).abs() < 1e-9);
        assert!((gram[(1, 1)] - 1.0).abs() < 1e-9);
        assert!(gram[(0, 1)].abs() < 1e-9);
    }

    #[test]
    fn singular_exposures_fall_back_to_input() {
        // second factor duplicates the first
        let m = Matrix::from_rows(&[vec![1.0, 2.0, 3.0]]);
        let t = table(vec![m.clone(), m]);
        let out = orthogonalize_table(&t, OrthogonalMethod::Symmetric);
        assert_eq!(out.values()[0].row(0), &[1.0, 2.0, 3.0]);
        assert_eq!(out.values()[1].row(0), &[1.0, 2.0, 3.0]);
        let out = orthogonalize_table(&t, OrthogonalMethod::GramSchmidt);
        assert_eq!(out.values()[1].row(0), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn gram_schmidt_columns_are_orthonormal() {
        let f = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 0.0, 1.0, 1.0, 0.0]);
        let q = gram_schmidt(&f).expect("independent");
        let gram = q.transpose() * &q;
        assert!((gram[(0, 0)] - 1.0).abs() < 1e-12);
        assert!(gram[(0, 1)].abs() < 1e-12);
    }
}
