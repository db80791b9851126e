/// Dense row-major `time × symbol` matrix of `f64`.
///
/// Rows are timestamps and columns are symbols everywhere in this crate, so
/// a row is one cross-section and a column is one symbol's history. Shapes
/// are fixed by the caller; mismatches are only checked in debug builds.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), rows * cols, "matrix data length mismatch");
        Self { rows, cols, data }
    }

    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self::new(rows, cols, vec![value; rows * cols])
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Self {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            debug_assert_eq!(row.len(), cols, "ragged rows");
            data.extend_from_slice(row);
        }
        Self::new(rows.len(), cols, data)
    }

    /// Build from per-column vectors of equal length.
    pub fn from_columns(rows: usize, columns: &[Vec<f64>]) -> Self {
        let cols = columns.len();
        let mut data = vec![f64::NAN; rows * cols];
        for (c, column) in columns.iter().enumerate() {
            debug_assert_eq!(column.len(), rows, "column length mismatch");
            for (r, value) in column.iter().enumerate() {
                data[r * cols + c] = *value;
            }
        }
        Self::new(rows, cols, data)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [f64] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.rows).map(move |r| self.row(r))
    }

    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.rows).map(|r| self.get(r, col)).collect()
    }

    pub fn set_column(&mut self, col: usize, values: &[f64]) {
        debug_assert_eq!(values.len(), self.rows, "column length mismatch");
        for (r, value) in values.iter().enumerate() {
            self.set(r, col, *value);
        }
    }

    /// Apply `f` to every column independently.
    pub fn map_columns<F>(&self, f: F) -> Self
    where
        F: Fn(&[f64]) -> Vec<f64>,
    {
        let columns: Vec<Vec<f64>> = (0..self.cols).map(|c| f(&self.column(c))).collect();
        Self::from_columns(self.rows, &columns)
    }

    /// Apply `f` to every row independently.
    pub fn map_rows<F>(&self, f: F) -> Self
    where
        F: Fn(&[f64]) -> Vec<f64>,
    {
        let mut data = Vec::with_capacity(self.data.len());
        for row in self.iter_rows() {
            let mapped = f(row);
            debug_assert_eq!(mapped.len(), self.cols, "row length mismatch");
            data.extend(mapped);
        }
        Self::new(self.rows, self.cols, data)
    }

    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(f64) -> f64,
    {
        Self::new(self.rows, self.cols, self.data.iter().map(|v| f(*v)).collect())
    }

    pub fn zip_map<F>(&self, other: &Self, f: F) -> Self
    where
        F: Fn(f64, f64) -> f64,
    {
        debug_assert_eq!(
            (self.rows, self.cols),
            (other.rows, other.cols),
            "matrix shape mismatch"
        );
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| f(*a, *b))
            .collect();
        Self::new(self.rows, self.cols, data)
    }

    /// Rows `[start, end)` as a new matrix.
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.rows);
        let start = start.min(end);
        Self::new(
            end - start,
            self.cols,
            self.data[start * self.cols..end * self.cols].to_vec(),
        )
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_and_rows_agree() {
        let m = Matrix::from_columns(2, &[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(m.row(0), &[1.0, 3.0]);
        assert_eq!(m.column(1), vec![3.0, 4.0]);
        assert_eq!(m.slice_rows(1, 5).row(0), &[2.0, 4.0]);
    }
}
