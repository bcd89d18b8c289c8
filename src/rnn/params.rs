//! Parameter store: dense matrices H, W, (U) and the sparse embedding table L.
//!
//! Dense parameters carry a same-shaped gradient accumulator. The embedding
//! table only ever receives row-addressed gradients, kept in an ordered map
//! so repeated hits on the same word sum instead of overwriting.

use std::collections::BTreeMap;

use super::math::{add_scaled, Matrix};
use super::{check_index, ModelError};

/// Names of the dense parameter matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenseParam {
    /// Hidden-to-hidden recurrence, `D x D`.
    H,
    /// Input projection applied to the embedding, `D x D`.
    W,
    /// Flat output layer, `V x D`.
    U,
}

impl DenseParam {
    pub const ALL: [DenseParam; 3] = [DenseParam::H, DenseParam::W, DenseParam::U];

    pub fn name(self) -> &'static str {
        match self {
            DenseParam::H => "H",
            DenseParam::W => "W",
            DenseParam::U => "U",
        }
    }
}

impl std::fmt::Display for DenseParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
struct Dense {
    value: Matrix,
    grad: Matrix,
}

impl Dense {
    fn new(value: Matrix) -> Self {
        let grad = Matrix::zeros(value.rows(), value.cols());
        Self { value, grad }
    }
}

#[derive(Debug, Clone)]
pub struct ParameterStore {
    h: Dense,
    w: Dense,
    u: Option<Dense>,
    l: Matrix,
    /// Touched embedding rows → summed gradient.
    sparse_grads: BTreeMap<usize, Vec<f64>>,
}

impl ParameterStore {
    /// Assemble a store. `l` is `V x D`; `h`, `w` are `D x D`; `u` if present
    /// must match `l`'s shape.
    pub fn new(h: Matrix, w: Matrix, u: Option<Matrix>, l: Matrix) -> Result<Self, ModelError> {
        let (vocab, dim) = l.shape();
        if vocab == 0 || dim == 0 {
            return Err(ModelError::Construction(format!(
                "embedding table must be non-empty, got {}x{}",
                vocab, dim
            )));
        }
        for (name, m) in [("H", &h), ("W", &w)] {
            if m.shape() != (dim, dim) {
                return Err(ModelError::Construction(format!(
                    "{} is {}x{}, expected {}x{}",
                    name,
                    m.rows(),
                    m.cols(),
                    dim,
                    dim
                )));
            }
        }
        if let Some(u) = &u {
            if u.shape() != l.shape() {
                return Err(ModelError::Construction(format!(
                    "U is {}x{}, expected {}x{} to match the embedding table",
                    u.rows(),
                    u.cols(),
                    vocab,
                    dim
                )));
            }
        }

        Ok(Self {
            h: Dense::new(h),
            w: Dense::new(w),
            u: u.map(Dense::new),
            l,
            sparse_grads: BTreeMap::new(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.l.rows()
    }

    pub fn hidden_dim(&self) -> usize {
        self.l.cols()
    }

    pub fn has(&self, name: DenseParam) -> bool {
        name != DenseParam::U || self.u.is_some()
    }

    /// Dense parameter names present in this store, in canonical order.
    pub fn dense_names(&self) -> Vec<DenseParam> {
        DenseParam::ALL.into_iter().filter(|&p| self.has(p)).collect()
    }

    fn dense(&self, name: DenseParam) -> Option<&Dense> {
        match name {
            DenseParam::H => Some(&self.h),
            DenseParam::W => Some(&self.w),
            DenseParam::U => self.u.as_ref(),
        }
    }

    fn dense_mut(&mut self, name: DenseParam) -> Option<&mut Dense> {
        match name {
            DenseParam::H => Some(&mut self.h),
            DenseParam::W => Some(&mut self.w),
            DenseParam::U => self.u.as_mut(),
        }
    }

    fn missing(name: DenseParam) -> ModelError {
        ModelError::Construction(format!("parameter {} is not part of this model", name))
    }

    pub fn value(&self, name: DenseParam) -> Option<&Matrix> {
        self.dense(name).map(|d| &d.value)
    }

    pub fn value_mut(&mut self, name: DenseParam) -> Option<&mut Matrix> {
        self.dense_mut(name).map(|d| &mut d.value)
    }

    pub fn grad(&self, name: DenseParam) -> Option<&Matrix> {
        self.dense(name).map(|d| &d.grad)
    }

    pub(crate) fn grad_mut(&mut self, name: DenseParam) -> Option<&mut Matrix> {
        self.dense_mut(name).map(|d| &mut d.grad)
    }

    pub fn h(&self) -> &Matrix {
        &self.h.value
    }

    pub fn w(&self) -> &Matrix {
        &self.w.value
    }

    pub fn u(&self) -> Option<&Matrix> {
        self.u.as_ref().map(|d| &d.value)
    }

    pub fn embeddings(&self) -> &Matrix {
        &self.l
    }

    pub fn embeddings_mut(&mut self) -> &mut Matrix {
        &mut self.l
    }

    /// Embedding row for a word, bounds-checked.
    pub fn embedding(&self, index: usize) -> Result<&[f64], ModelError> {
        check_index(index, self.vocab_size())?;
        Ok(self.l.row(index))
    }

    /// Zero every dense accumulator and forget all touched embedding rows.
    pub fn reset_gradients(&mut self) {
        self.h.grad.fill_zero();
        self.w.grad.fill_zero();
        if let Some(u) = &mut self.u {
            u.grad.fill_zero();
        }
        self.sparse_grads.clear();
    }

    /// `grad[name] += delta`
    pub fn accumulate_dense(&mut self, name: DenseParam, delta: &Matrix) -> Result<(), ModelError> {
        let dense = self.dense_mut(name).ok_or_else(|| Self::missing(name))?;
        if dense.grad.shape() != delta.shape() {
            return Err(ModelError::Construction(format!(
                "gradient for {} has shape {:?}, expected {:?}",
                name,
                delta.shape(),
                dense.grad.shape()
            )));
        }
        dense.grad.add_scaled(delta, 1.0);
        Ok(())
    }

    /// `sgrad[index] += delta`; repeated hits on one row sum.
    pub fn accumulate_sparse_row(&mut self, index: usize, delta: &[f64]) -> Result<(), ModelError> {
        check_index(index, self.vocab_size())?;
        let dim = self.hidden_dim();
        if delta.len() != dim {
            return Err(ModelError::Construction(format!(
                "sparse gradient row has length {}, expected {}",
                delta.len(),
                dim
            )));
        }
        let row = self.sparse_grads.entry(index).or_insert_with(|| vec![0.0; dim]);
        add_scaled(row, delta, 1.0);
        Ok(())
    }

    /// Touched embedding rows and their summed gradients, ascending by index.
    pub fn sparse_grads(&self) -> impl Iterator<Item = (usize, &[f64])> {
        self.sparse_grads.iter().map(|(&i, g)| (i, g.as_slice()))
    }

    pub fn sparse_grad(&self, index: usize) -> Option<&[f64]> {
        self.sparse_grads.get(&index).map(Vec::as_slice)
    }

    /// One truncated-BPTT step at input word `word`, with `g = dJ/dz`:
    /// `dH += g ⊗ h_prev`, `dW += g ⊗ L[word]`, `dL[word] += g · W`.
    pub(crate) fn accumulate_recurrent_step(
        &mut self,
        g: &[f64],
        h_prev: &[f64],
        word: usize,
    ) -> Result<(), ModelError> {
        check_index(word, self.vocab_size())?;
        self.h.grad.add_outer(g, h_prev);
        self.w.grad.add_outer(g, self.l.row(word));
        let row_grad = self.w.value.vecmat(g);
        self.accumulate_sparse_row(word, &row_grad)
    }

    /// Add `lambda * param` to every dense gradient.
    pub(crate) fn add_l2_gradient(&mut self, lambda: f64) {
        let dense_params = [Some(&mut self.h), Some(&mut self.w), self.u.as_mut()];
        for dense in dense_params.into_iter().flatten() {
            let Dense { value, grad } = dense;
            grad.add_scaled(value, lambda);
        }
    }

    /// `||H||^2 + ||W||^2 (+ ||U||^2)`
    pub fn dense_sum_squares(&self) -> f64 {
        self.h.value.sum_squares()
            + self.w.value.sum_squares()
            + self.u.as_ref().map_or(0.0, |u| u.value.sum_squares())
    }

    /// SGD step: `param -= lr * grad` for dense params and touched rows.
    ///
    /// Gradients are stale afterwards; call `reset_gradients` before the next
    /// accumulation round.
    pub fn apply(&mut self, learning_rate: f64) {
        let dense_params = [Some(&mut self.h), Some(&mut self.w), self.u.as_mut()];
        for dense in dense_params.into_iter().flatten() {
            let Dense { value, grad } = dense;
            value.add_scaled(grad, -learning_rate);
        }
        for (&index, grad) in &self.sparse_grads {
            add_scaled(self.l.row_mut(index), grad, -learning_rate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(with_u: bool) -> ParameterStore {
        let h = Matrix::from_rows(&[vec![0.1, 0.2], vec![0.3, 0.4]]).unwrap();
        let w = Matrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let l = Matrix::from_rows(&[vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0]]).unwrap();
        let u = with_u.then(|| Matrix::zeros(3, 2));
        ParameterStore::new(h, w, u, l).unwrap()
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let l = Matrix::zeros(3, 2);
        let bad_h = Matrix::zeros(3, 3);
        assert!(ParameterStore::new(bad_h, Matrix::zeros(2, 2), None, l.clone()).is_err());
        let bad_u = Some(Matrix::zeros(2, 2));
        assert!(ParameterStore::new(Matrix::zeros(2, 2), Matrix::zeros(2, 2), bad_u, l).is_err());
        let empty = Matrix::zeros(0, 2);
        let square = || Matrix::zeros(2, 2);
        assert!(ParameterStore::new(square(), square(), None, empty).is_err());
    }

    #[test]
    fn test_sparse_rows_sum() {
        let mut s = store(false);
        s.accumulate_sparse_row(1, &[1.0, 2.0]).unwrap();
        s.accumulate_sparse_row(1, &[0.5, 0.5]).unwrap();
        assert_eq!(s.sparse_grad(1), Some(&[1.5, 2.5][..]));
        assert_eq!(s.sparse_grad(0), None);
        assert_eq!(s.sparse_grads().count(), 1);
    }

    #[test]
    fn test_sparse_row_index_checked() {
        let mut s = store(false);
        assert!(matches!(
            s.accumulate_sparse_row(3, &[0.0, 0.0]),
            Err(ModelError::IndexOutOfRange { index: 3, vocab_size: 3 })
        ));
        assert!(s.embedding(5).is_err());
    }

    #[test]
    fn test_apply_updates_dense_and_touched_rows_only() {
        let mut s = store(true);
        let mut delta = Matrix::zeros(2, 2);
        delta.add_outer(&[1.0, 0.0], &[1.0, 1.0]);
        s.accumulate_dense(DenseParam::H, &delta).unwrap();
        s.accumulate_sparse_row(2, &[1.0, -1.0]).unwrap();

        s.apply(0.5);

        assert_eq!(s.h().row(0), &[0.1 - 0.5, 0.2 - 0.5]);
        assert_eq!(s.h().row(1), &[0.3, 0.4]);
        assert_eq!(s.embeddings().row(2), &[2.5, 3.5]);
        assert_eq!(s.embeddings().row(0), &[1.0, 1.0]);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut s = store(true);
        s.accumulate_sparse_row(0, &[1.0, 1.0]).unwrap();
        s.add_l2_gradient(1.0);
        s.reset_gradients();
        s.reset_gradients();
        for name in s.dense_names() {
            assert_eq!(s.grad(name).unwrap().sum_squares(), 0.0);
        }
        assert_eq!(s.sparse_grads().count(), 0);
    }

    #[test]
    fn test_accumulate_missing_u_fails() {
        let mut s = store(false);
        assert!(!s.has(DenseParam::U));
        assert_eq!(s.dense_names(), vec![DenseParam::H, DenseParam::W]);
        assert!(s.accumulate_dense(DenseParam::U, &Matrix::zeros(3, 2)).is_err());
    }
}
