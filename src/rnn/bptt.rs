//! Forward recurrence and truncated backpropagation through time.
//!
//! Both output layers share one backward routine. The output layer only
//! decides where the per-step hidden gradient comes from (the `OutputHead`
//! strategy); pushing it back through H, W and the embedding rows is the
//! same code either way.
//!
//! Indexing: `h[0] = 0`, and step `t` (1-based) consumes `xs[t-1]` and
//! predicts `ys[t-1]`.

use super::math::{add_scaled, sigmoid, sigmoid_grad, softmax};
use super::params::ParameterStore;
use super::tree::HierarchicalSoftmaxTree;
use super::{check_index, ModelError};

/// Hidden and pre-activation states for one sequence, both of length n+1.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub h: Vec<Vec<f64>>,
    pub z: Vec<Vec<f64>>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.h.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One recurrence step: `z = H·h_prev + W·L[word]`, `h = sigmoid(z)`.
pub fn step(
    params: &ParameterStore,
    h_prev: &[f64],
    word: usize,
) -> Result<(Vec<f64>, Vec<f64>), ModelError> {
    let embedding = params.embedding(word)?;
    let mut z = params.h().matvec(h_prev);
    add_scaled(&mut z, &params.w().matvec(embedding), 1.0);
    let h = z.iter().map(|&v| sigmoid(v)).collect();
    Ok((z, h))
}

/// Run the recurrence over `xs` from the zero state.
pub fn forward(params: &ParameterStore, xs: &[usize]) -> Result<Trajectory, ModelError> {
    let dim = params.hidden_dim();
    let mut h = Vec::with_capacity(xs.len() + 1);
    let mut z = Vec::with_capacity(xs.len() + 1);
    h.push(vec![0.0; dim]);
    z.push(vec![0.0; dim]);

    for &x in xs {
        let (z_t, h_t) = step(params, &h[h.len() - 1], x)?;
        z.push(z_t);
        h.push(h_t);
    }
    Ok(Trajectory { h, z })
}

// ============================================================================
// Output heads
// ============================================================================

/// Per-step scoring strategy of the output layer.
pub trait OutputHead {
    /// `-ln P(target | hidden)`.
    fn target_loss(
        &self,
        params: &ParameterStore,
        target: usize,
        hidden: &[f64],
    ) -> Result<f64, ModelError>;

    /// Full next-word distribution (generation only).
    fn distribution(&self, params: &ParameterStore, hidden: &[f64]) -> Result<Vec<f64>, ModelError>;

    /// Accumulate output-layer gradients for one target and return
    /// `dJ/dh` for that step.
    fn hidden_gradient(
        &mut self,
        params: &mut ParameterStore,
        target: usize,
        hidden: &[f64],
    ) -> Result<Vec<f64>, ModelError>;

    /// `Σ ||w||²` over the head's own weights that live outside the store.
    fn sum_squared_weights(&self) -> f64 {
        0.0
    }
}

/// Full-vocabulary softmax over `U·h`; U lives in the parameter store.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatSoftmax;

impl FlatSoftmax {
    fn probabilities(params: &ParameterStore, hidden: &[f64]) -> Result<Vec<f64>, ModelError> {
        let u = params.u().ok_or_else(|| {
            ModelError::Construction("flat softmax requires an output matrix U".into())
        })?;
        Ok(softmax(&u.matvec(hidden)))
    }
}

impl OutputHead for FlatSoftmax {
    fn target_loss(
        &self,
        params: &ParameterStore,
        target: usize,
        hidden: &[f64],
    ) -> Result<f64, ModelError> {
        check_index(target, params.vocab_size())?;
        let p = Self::probabilities(params, hidden)?;
        Ok(-p[target].ln())
    }

    fn distribution(
        &self,
        params: &ParameterStore,
        hidden: &[f64],
    ) -> Result<Vec<f64>, ModelError> {
        Self::probabilities(params, hidden)
    }

    fn hidden_gradient(
        &mut self,
        params: &mut ParameterStore,
        target: usize,
        hidden: &[f64],
    ) -> Result<Vec<f64>, ModelError> {
        check_index(target, params.vocab_size())?;
        // delta = p - onehot(target)
        let mut delta = Self::probabilities(params, hidden)?;
        delta[target] -= 1.0;

        let upstream = params.u().map(|u| u.vecmat(&delta)).unwrap_or_default();
        if let Some(grad_u) = params.grad_mut(super::params::DenseParam::U) {
            grad_u.add_outer(&delta, hidden);
        }
        Ok(upstream)
    }
}

impl OutputHead for HierarchicalSoftmaxTree {
    fn target_loss(
        &self,
        _params: &ParameterStore,
        target: usize,
        hidden: &[f64],
    ) -> Result<f64, ModelError> {
        self.path_probability_loss(target, hidden)
    }

    fn distribution(
        &self,
        _params: &ParameterStore,
        hidden: &[f64],
    ) -> Result<Vec<f64>, ModelError> {
        Ok(self.sample_distribution(hidden))
    }

    fn hidden_gradient(
        &mut self,
        params: &mut ParameterStore,
        target: usize,
        hidden: &[f64],
    ) -> Result<Vec<f64>, ModelError> {
        let mut upstream = vec![0.0; params.hidden_dim()];
        self.accumulate_gradient(target, hidden, &mut upstream)?;
        Ok(upstream)
    }

    fn sum_squared_weights(&self) -> f64 {
        HierarchicalSoftmaxTree::sum_squared_weights(self)
    }
}

// ============================================================================
// Backward pass
// ============================================================================

/// Push `g = dJ/dz[t]` back through at most `bptt + 1` steps ending at `t`,
/// accumulating into H, W and the embedding rows of the inputs visited.
pub fn backprop_through_time(
    params: &mut ParameterStore,
    xs: &[usize],
    trajectory: &Trajectory,
    t: usize,
    mut g: Vec<f64>,
    bptt: usize,
) -> Result<(), ModelError> {
    let steps = t.min(bptt.saturating_add(1));
    for j in 0..steps {
        let s = t - 1 - j;
        params.accumulate_recurrent_step(&g, &trajectory.h[s], xs[s])?;

        if j + 1 < steps {
            let mut next = params.h().vecmat(&g);
            for (n, &z) in next.iter_mut().zip(&trajectory.z[s]) {
                *n *= sigmoid_grad(z);
            }
            g = next;
        }
    }
    Ok(())
}

/// Forward over `xs`, then backprop every target in `ys` through the head
/// and the truncated recurrence. Regularization is left to the caller.
pub fn accumulate_sequence<H: OutputHead + ?Sized>(
    params: &mut ParameterStore,
    head: &mut H,
    xs: &[usize],
    ys: &[usize],
    bptt: usize,
) -> Result<(), ModelError> {
    check_lengths(xs, ys)?;
    let trajectory = forward(params, xs)?;

    for t in 1..=xs.len() {
        let h_t = &trajectory.h[t];
        let mut g = head.hidden_gradient(params, ys[t - 1], h_t)?;
        for (gk, &z) in g.iter_mut().zip(&trajectory.z[t]) {
            *gk *= sigmoid_grad(z);
        }
        backprop_through_time(params, xs, &trajectory, t, g, bptt)?;
    }
    Ok(())
}

/// Unregularized `Σ_t -ln P(ys[t-1] | h[t])`.
pub fn sequence_data_loss<H: OutputHead + ?Sized>(
    params: &ParameterStore,
    head: &H,
    xs: &[usize],
    ys: &[usize],
) -> Result<f64, ModelError> {
    check_lengths(xs, ys)?;
    let dim = params.hidden_dim();
    let mut h = vec![0.0; dim];
    let mut loss = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        let (_, h_t) = step(params, &h, x)?;
        loss += head.target_loss(params, y, &h_t)?;
        h = h_t;
    }
    Ok(loss)
}

fn check_lengths(xs: &[usize], ys: &[usize]) -> Result<(), ModelError> {
    if xs.len() == ys.len() {
        Ok(())
    } else {
        Err(ModelError::Construction(format!(
            "input and target sequences differ in length ({} vs {})",
            xs.len(),
            ys.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rnn::math::Matrix;
    use crate::rnn::params::DenseParam;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn store(v: usize, d: usize, seed: u64) -> ParameterStore {
        let mut rng = StdRng::seed_from_u64(seed);
        let h = Matrix::xavier(d, d, &mut rng);
        let w = Matrix::xavier(d, d, &mut rng);
        let u = Matrix::gaussian(v, d, 0.1, &mut rng).unwrap();
        let l = Matrix::gaussian(v, d, 0.1, &mut rng).unwrap();
        ParameterStore::new(h, w, Some(u), l).unwrap()
    }

    #[test]
    fn test_forward_zero_initial_state() {
        let params = store(6, 4, 1);
        let traj = forward(&params, &[1, 2, 3]).unwrap();
        assert_eq!(traj.len(), 3);
        assert_eq!(traj.h[0], vec![0.0; 4]);
        for t in 1..=3 {
            for (h, z) in traj.h[t].iter().zip(&traj.z[t]) {
                assert!((h - sigmoid(*z)).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn test_single_step_matches_manual() {
        let params = store(5, 3, 2);
        let traj = forward(&params, &[4]).unwrap();
        let emb = params.embeddings().row(4);
        for r in 0..3 {
            let z: f64 = (0..3).map(|c| params.w().get(r, c) * emb[c]).sum();
            assert!((traj.h[1][r] - sigmoid(z)).abs() < 1e-15);
        }
    }

    #[test]
    fn test_forward_rejects_bad_index() {
        let params = store(5, 3, 2);
        assert!(matches!(
            forward(&params, &[0, 5]),
            Err(ModelError::IndexOutOfRange { index: 5, vocab_size: 5 })
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut params = store(5, 3, 2);
        let mut head = FlatSoftmax;
        assert!(accumulate_sequence(&mut params, &mut head, &[0, 1], &[1], 1).is_err());
    }

    #[test]
    fn test_truncation_only_adds_older_steps() {
        let xs = [0, 3, 1, 4, 2];
        let ys = [3, 1, 4, 2, 0];
        let grads = |bptt: usize| {
            let mut params = store(5, 3, 4);
            accumulate_sequence(&mut params, &mut FlatSoftmax, &xs, &ys, bptt).unwrap();
            let h = params.grad(DenseParam::H).unwrap().clone();
            let u = params.grad(DenseParam::U).unwrap().clone();
            (h, u)
        };

        let (h0, u0) = grads(0);
        let (h1, u1) = grads(1);
        let (h_full, _) = grads(xs.len() - 1);
        let (h_more, _) = grads(100);

        // U's gradient never depends on the window.
        assert_eq!(u0, u1);
        assert_ne!(h0, h1);
        // A window covering the whole sequence is full BPTT.
        assert_eq!(h_full, h_more);
    }

    #[test]
    fn test_wider_window_adds_exactly_one_step() {
        let xs = [0, 3, 1, 4, 2];
        let ys = [3, 1, 4, 2, 0];
        let k = 1;
        let grads = |bptt: usize| {
            let mut params = store(5, 3, 4);
            accumulate_sequence(&mut params, &mut FlatSoftmax, &xs, &ys, bptt).unwrap();
            (
                params.grad(DenseParam::H).unwrap().clone(),
                params.grad(DenseParam::W).unwrap().clone(),
            )
        };
        let (h_k, w_k) = grads(k);
        let (h_next, w_next) = grads(k + 1);

        // Step k+1 back from output t touches h[t-k-2] and L[xs[t-k-2]].
        let params = store(5, 3, 4);
        let traj = forward(&params, &xs).unwrap();
        let mut extra_h = Matrix::zeros(3, 3);
        let mut extra_w = Matrix::zeros(3, 3);
        for t in (k + 2)..=xs.len() {
            let mut delta = softmax(&params.u().unwrap().matvec(&traj.h[t]));
            delta[ys[t - 1]] -= 1.0;
            let mut g: Vec<f64> = params
                .u()
                .unwrap()
                .vecmat(&delta)
                .iter()
                .zip(&traj.z[t])
                .map(|(v, &z)| v * sigmoid_grad(z))
                .collect();
            for j in 1..=(k + 1) {
                g = params
                    .h()
                    .vecmat(&g)
                    .iter()
                    .zip(&traj.z[t - j])
                    .map(|(v, &z)| v * sigmoid_grad(z))
                    .collect();
            }
            let s = t - k - 2;
            extra_h.add_outer(&g, &traj.h[s]);
            extra_w.add_outer(&g, params.embeddings().row(xs[s]));
        }

        for (got, (a, b)) in [(&extra_h, (&h_k, &h_next)), (&extra_w, (&w_k, &w_next))] {
            for i in 0..9 {
                let diff = b.as_slice()[i] - a.as_slice()[i];
                let want = got.as_slice()[i];
                assert!((diff - want).abs() < 1e-12, "{} vs {}", diff, want);
            }
        }
    }

    #[test]
    fn test_full_window_matches_central_differences() {
        let xs = [2, 0, 4, 1];
        let ys = [0, 4, 1, 3];
        let mut params = store(5, 3, 6);
        accumulate_sequence(&mut params, &mut FlatSoftmax, &xs, &ys, xs.len()).unwrap();

        let eps = 1e-5;
        for name in [DenseParam::H, DenseParam::W] {
            let analytic = params.grad(name).unwrap().clone();
            for i in 0..9 {
                let orig = params.value(name).unwrap().as_slice()[i];
                params.value_mut(name).unwrap().as_mut_slice()[i] = orig + eps;
                let plus = sequence_data_loss(&params, &FlatSoftmax, &xs, &ys).unwrap();
                params.value_mut(name).unwrap().as_mut_slice()[i] = orig - eps;
                let minus = sequence_data_loss(&params, &FlatSoftmax, &xs, &ys).unwrap();
                params.value_mut(name).unwrap().as_mut_slice()[i] = orig;
                let fd = (plus - minus) / (2.0 * eps);
                assert!(
                    (fd - analytic.as_slice()[i]).abs() < 1e-7,
                    "d{}[{}]: fd {} vs {}",
                    name,
                    i,
                    fd,
                    analytic.as_slice()[i]
                );
            }
        }
    }

    #[test]
    fn test_data_loss_finite_and_positive() {
        let params = store(7, 4, 5);
        let loss = sequence_data_loss(&params, &FlatSoftmax, &[0, 1, 2], &[1, 2, 3]).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
        assert_eq!(sequence_data_loss(&params, &FlatSoftmax, &[], &[]).unwrap(), 0.0);
    }
}
