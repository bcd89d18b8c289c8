//! Dense math primitives: activations and a flat row-major matrix.
//!
//! Everything is plain `f64` loops over contiguous storage, indexed as
//! `data[row * cols + col]`.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::ModelError;

// ============================================================================
// Activation functions
// ============================================================================

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Derivative of the sigmoid with respect to its pre-activation `z`.
#[inline]
pub fn sigmoid_grad(z: f64) -> f64 {
    let s = sigmoid(z);
    s * (1.0 - s)
}

/// Numerically stable softmax (max-shifted).
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[inline]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `acc += scale * x`
#[inline]
pub fn add_scaled(acc: &mut [f64], x: &[f64], scale: f64) {
    debug_assert_eq!(acc.len(), x.len());
    for (a, v) in acc.iter_mut().zip(x) {
        *a += scale * v;
    }
}

// ============================================================================
// Matrix
// ============================================================================

/// Row-major dense matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, data: vec![0.0; rows * cols] }
    }

    /// Wrap row-major storage, checking that it matches the declared shape.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, ModelError> {
        if data.len() != rows * cols {
            return Err(ModelError::Construction(format!(
                "matrix storage has {} elements, expected {}x{}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Build from nested rows; every row must have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, ModelError> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(ModelError::Construction(format!(
                    "row {} has {} columns, expected {}",
                    i,
                    row.len(),
                    cols
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self { rows: rows.len(), cols, data })
    }

    /// Xavier/Glorot uniform init: U(-e, e) with e = sqrt(6 / (rows + cols)).
    pub fn xavier<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Self {
        let bound = (6.0 / (rows + cols).max(1) as f64).sqrt();
        let data = (0..rows * cols)
            .map(|_| rng.gen::<f64>() * 2.0 * bound - bound)
            .collect();
        Self { rows, cols, data }
    }

    /// Zero-mean Gaussian init with the given standard deviation.
    pub fn gaussian<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        std: f64,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        let normal = Normal::new(0.0, std)
            .map_err(|e| ModelError::Construction(format!("gaussian init (std {}): {}", std, e)))?;
        let data = (0..rows * cols).map(|_| normal.sample(rng)).collect();
        Ok(Self { rows, cols, data })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    #[inline]
    pub fn row_mut(&mut self, r: usize) -> &mut [f64] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// `M * x`
    pub fn matvec(&self, x: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.cols);
        (0..self.rows).map(|r| dot(self.row(r), x)).collect()
    }

    /// Row vector times matrix: `g^T * M`, i.e. `M^T * g`.
    pub fn vecmat(&self, g: &[f64]) -> Vec<f64> {
        debug_assert_eq!(g.len(), self.rows);
        let mut out = vec![0.0; self.cols];
        for (r, &gr) in g.iter().enumerate() {
            if gr != 0.0 {
                add_scaled(&mut out, self.row(r), gr);
            }
        }
        out
    }

    /// `M += a ⊗ b` (outer product, `a` indexes rows).
    pub fn add_outer(&mut self, a: &[f64], b: &[f64]) {
        debug_assert_eq!(a.len(), self.rows);
        debug_assert_eq!(b.len(), self.cols);
        for (r, &ar) in a.iter().enumerate() {
            if ar != 0.0 {
                add_scaled(self.row_mut(r), b, ar);
            }
        }
    }

    /// `M += scale * other`
    pub fn add_scaled(&mut self, other: &Self, scale: f64) {
        debug_assert_eq!(self.shape(), other.shape());
        add_scaled(&mut self.data, &other.data, scale);
    }

    pub fn fill_zero(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Squared Frobenius norm.
    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }
}
