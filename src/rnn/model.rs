//! `RnnLm`: the language model and its training-step contract.
//!
//! A driver composes SGD from three calls:
//!
//! ```ignore
//! model.reset_gradients();
//! for (xs, ys) in batch {
//!     model.accumulate_gradients(xs, ys)?;
//! }
//! model.apply_gradients(learning_rate);
//! ```
//!
//! `train_minibatch` wraps exactly that sequence.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::{ModelConfig, OutputKind};

use super::bptt::{self, FlatSoftmax, OutputHead};
use super::math::Matrix;
use super::params::ParameterStore;
use super::tree::HierarchicalSoftmaxTree;
use super::{check_finite, ModelError};

/// Std-dev of Gaussian init for U and for generated embedding tables.
const GAUSSIAN_INIT_STD: f64 = 0.1;

/// Output layer of the model.
#[derive(Debug, Clone)]
pub enum OutputLayer {
    Flat(FlatSoftmax),
    Hierarchical(HierarchicalSoftmaxTree),
}

impl OutputLayer {
    pub fn kind(&self) -> OutputKind {
        match self {
            OutputLayer::Flat(_) => OutputKind::Flat,
            OutputLayer::Hierarchical(_) => OutputKind::Hierarchical,
        }
    }

    pub fn head(&self) -> &dyn OutputHead {
        match self {
            OutputLayer::Flat(flat) => flat,
            OutputLayer::Hierarchical(tree) => tree,
        }
    }

    pub fn head_mut(&mut self) -> &mut dyn OutputHead {
        match self {
            OutputLayer::Flat(flat) => flat,
            OutputLayer::Hierarchical(tree) => tree,
        }
    }
}

/// Single-layer sigmoid RNN language model.
#[derive(Debug, Clone)]
pub struct RnnLm {
    params: ParameterStore,
    output: OutputLayer,
    bptt: usize,
    learning_rate: f64,
    l2_reg: f64,
}

impl RnnLm {
    /// Build a model around a supplied `V x D` embedding table.
    ///
    /// H and W get Xavier init from `config.model.seed`. The flat variant
    /// uses `u0` when given (it must match `l0`'s shape) and Gaussian noise
    /// otherwise; the hierarchical variant ignores `u0` and seeds its tree
    /// from `seed + 1`.
    pub fn new(l0: Matrix, u0: Option<Matrix>, config: &ModelConfig) -> Result<Self, ModelError> {
        let (vocab_size, hidden_dim) = l0.shape();
        if vocab_size == 0 || hidden_dim == 0 {
            return Err(ModelError::Construction(format!(
                "embedding table must be non-empty, got {}x{}",
                vocab_size, hidden_dim
            )));
        }
        config
            .validate()
            .map_err(|e| ModelError::Construction(e.to_string()))?;

        let seed = config.model.seed;
        let mut rng = StdRng::seed_from_u64(seed);
        let h = Matrix::xavier(hidden_dim, hidden_dim, &mut rng);
        let w = Matrix::xavier(hidden_dim, hidden_dim, &mut rng);

        let (u, output) = match config.model.output_layer {
            OutputKind::Flat => {
                let u = match u0 {
                    Some(u) => u,
                    None => Matrix::gaussian(vocab_size, hidden_dim, GAUSSIAN_INIT_STD, &mut rng)?,
                };
                (Some(u), OutputLayer::Flat(FlatSoftmax))
            }
            OutputKind::Hierarchical => {
                if u0.is_some() {
                    debug!("Ignoring supplied U: the hierarchical softmax owns its weights");
                }
                let mut tree_rng = StdRng::seed_from_u64(seed.wrapping_add(1));
                let tree = HierarchicalSoftmaxTree::new(vocab_size, hidden_dim, &mut tree_rng)?;
                (None, OutputLayer::Hierarchical(tree))
            }
        };

        let params = ParameterStore::new(h, w, u, l0)?;
        info!(
            vocab_size,
            hidden_dim,
            output = %config.model.output_layer,
            bptt = config.model.bptt,
            seed,
            "RNN language model initialized"
        );

        Ok(Self {
            params,
            output,
            bptt: config.model.bptt,
            learning_rate: config.training.learning_rate,
            l2_reg: config.training.l2_reg,
        })
    }

    /// Build a model with a Gaussian embedding table drawn from the
    /// configured seed.
    pub fn with_random_embeddings(
        vocab_size: usize,
        hidden_dim: usize,
        config: &ModelConfig,
    ) -> Result<Self, ModelError> {
        let mut rng = StdRng::seed_from_u64(config.model.seed.wrapping_add(2));
        let l0 = Matrix::gaussian(vocab_size, hidden_dim, GAUSSIAN_INIT_STD, &mut rng)?;
        Self::new(l0, None, config)
    }

    /// Re-draw H, W and tree node weights from a new seed. The embedding
    /// table and a supplied U are kept; gradients are cleared.
    pub fn reseed(&mut self, seed: u64) -> Result<(), ModelError> {
        let dim = self.hidden_dim();
        let mut rng = StdRng::seed_from_u64(seed);
        let h = Matrix::xavier(dim, dim, &mut rng);
        let w = Matrix::xavier(dim, dim, &mut rng);
        let u = self.params.u().cloned();
        let l = self.params.embeddings().clone();
        self.params = ParameterStore::new(h, w, u, l)?;

        if let OutputLayer::Hierarchical(tree) = &mut self.output {
            let mut tree_rng = StdRng::seed_from_u64(seed.wrapping_add(1));
            *tree = HierarchicalSoftmaxTree::new(self.params.vocab_size(), dim, &mut tree_rng)?;
        }
        info!(seed, "Model reseeded");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn vocab_size(&self) -> usize {
        self.params.vocab_size()
    }

    pub fn hidden_dim(&self) -> usize {
        self.params.hidden_dim()
    }

    pub fn bptt(&self) -> usize {
        self.bptt
    }

    pub fn set_bptt(&mut self, bptt: usize) {
        self.bptt = bptt;
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn l2_reg(&self) -> f64 {
        self.l2_reg
    }

    pub fn output_kind(&self) -> OutputKind {
        self.output.kind()
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParameterStore {
        &mut self.params
    }

    pub fn output(&self) -> &OutputLayer {
        &self.output
    }

    pub fn tree(&self) -> Option<&HierarchicalSoftmaxTree> {
        match &self.output {
            OutputLayer::Hierarchical(tree) => Some(tree),
            OutputLayer::Flat(_) => None,
        }
    }

    pub fn tree_mut(&mut self) -> Option<&mut HierarchicalSoftmaxTree> {
        match &mut self.output {
            OutputLayer::Hierarchical(tree) => Some(tree),
            OutputLayer::Flat(_) => None,
        }
    }

    // ------------------------------------------------------------------------
    // Training-step contract
    // ------------------------------------------------------------------------

    /// Clear dense, sparse and tree-node gradients.
    pub fn reset_gradients(&mut self) {
        self.params.reset_gradients();
        if let Some(tree) = self.tree_mut() {
            tree.reset_gradients();
        }
    }

    /// Add the gradient of `compute_seq_loss(xs, ys)` to the accumulators.
    ///
    /// An empty sequence contributes nothing, not even the L2 term.
    pub fn accumulate_gradients(&mut self, xs: &[usize], ys: &[usize]) -> Result<(), ModelError> {
        if xs.is_empty() && ys.is_empty() {
            return Ok(());
        }
        bptt::accumulate_sequence(&mut self.params, self.output.head_mut(), xs, ys, self.bptt)?;

        self.params.add_l2_gradient(self.l2_reg);
        if let OutputLayer::Hierarchical(tree) = &mut self.output {
            tree.add_l2_gradient(ys, self.l2_reg)?;
        }
        Ok(())
    }

    /// SGD step over everything accumulated since the last reset.
    pub fn apply_gradients(&mut self, learning_rate: f64) {
        self.params.apply(learning_rate);
        if let OutputLayer::Hierarchical(tree) = &mut self.output {
            tree.apply_gradients(learning_rate);
        }
    }

    /// Reset → accumulate every sequence → apply at the configured rate.
    /// Returns the batch loss measured before the update.
    pub fn train_minibatch<X, Y>(&mut self, batch: &[(X, Y)]) -> Result<f64, ModelError>
    where
        X: AsRef<[usize]>,
        Y: AsRef<[usize]>,
    {
        let loss = self.compute_loss(batch)?;
        self.reset_gradients();
        for (xs, ys) in batch {
            self.accumulate_gradients(xs.as_ref(), ys.as_ref())?;
        }
        self.apply_gradients(self.learning_rate);
        debug!(sequences = batch.len(), loss, "Minibatch applied");
        Ok(loss)
    }

    // ------------------------------------------------------------------------
    // Losses
    // ------------------------------------------------------------------------

    /// `0.5 · λ · (||H||² + ||W||² + ||U||²  or  Σ_nodes ||w||²)`
    pub fn regularization_loss(&self) -> f64 {
        0.5 * self.l2_reg
            * (self.params.dense_sum_squares() + self.output.head().sum_squared_weights())
    }

    /// Cross-entropy of one sequence plus the regularization term.
    pub fn compute_seq_loss(&self, xs: &[usize], ys: &[usize]) -> Result<f64, ModelError> {
        let data = bptt::sequence_data_loss(&self.params, self.output.head(), xs, ys)?;
        check_finite(data + self.regularization_loss(), "sequence loss")
    }

    /// Summed loss over a dataset of `(xs, ys)` pairs.
    pub fn compute_loss<X, Y>(&self, data: &[(X, Y)]) -> Result<f64, ModelError>
    where
        X: AsRef<[usize]>,
        Y: AsRef<[usize]>,
    {
        data.iter()
            .map(|(xs, ys)| self.compute_seq_loss(xs.as_ref(), ys.as_ref()))
            .sum()
    }

    /// Dataset loss per target token.
    pub fn compute_mean_loss<X, Y>(&self, data: &[(X, Y)]) -> Result<f64, ModelError>
    where
        X: AsRef<[usize]>,
        Y: AsRef<[usize]>,
    {
        let total = self.compute_loss(data)?;
        let tokens: usize = data.iter().map(|(_, ys)| ys.as_ref().len()).sum();
        if tokens == 0 {
            return Ok(0.0);
        }
        Ok(total / tokens as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rnn::math::sigmoid;
    use crate::rnn::params::DenseParam;

    fn config(kind: OutputKind) -> ModelConfig {
        let mut config = ModelConfig::default();
        config.model.output_layer = kind;
        config.model.bptt = 2;
        config.training.l2_reg = 0.001;
        config
    }

    fn model(kind: OutputKind) -> RnnLm {
        RnnLm::with_random_embeddings(8, 4, &config(kind)).unwrap()
    }

    #[test]
    fn test_construction_errors() {
        let cfg = config(OutputKind::Flat);
        assert!(RnnLm::new(Matrix::zeros(0, 3), None, &cfg).is_err());
        assert!(RnnLm::new(Matrix::zeros(3, 0), None, &cfg).is_err());
        let bad_u = Some(Matrix::zeros(3, 2));
        assert!(matches!(
            RnnLm::new(Matrix::zeros(3, 4), bad_u, &cfg),
            Err(ModelError::Construction(_))
        ));

        let mut invalid = cfg;
        invalid.training.learning_rate = -1.0;
        assert!(RnnLm::new(Matrix::zeros(3, 4), None, &invalid).is_err());
    }

    #[test]
    fn test_same_seed_same_model() {
        let a = model(OutputKind::Hierarchical);
        let b = model(OutputKind::Hierarchical);
        assert_eq!(a.params().h(), b.params().h());
        assert_eq!(
            a.compute_seq_loss(&[0, 1, 2], &[1, 2, 3]).unwrap(),
            b.compute_seq_loss(&[0, 1, 2], &[1, 2, 3]).unwrap()
        );
    }

    #[test]
    fn test_empty_sequence_leaves_gradients_zero() {
        for kind in [OutputKind::Flat, OutputKind::Hierarchical] {
            let mut m = model(kind);
            m.reset_gradients();
            m.accumulate_gradients(&[], &[]).unwrap();
            for name in m.params().dense_names() {
                assert_eq!(m.params().grad(name).unwrap().sum_squares(), 0.0);
            }
            assert_eq!(m.params().sparse_grads().count(), 0);
            if let Some(tree) = m.tree() {
                assert!(tree.touched_nodes().is_empty());
            }
            let loss = m.compute_seq_loss(&[], &[]).unwrap();
            assert!((loss - m.regularization_loss()).abs() < 1e-15);
        }
    }

    #[test]
    fn test_single_step_hidden_state() {
        let m = model(OutputKind::Flat);
        let (i, j) = (3, 5);
        let emb = m.params().embeddings().row(i).to_vec();
        let h1: Vec<f64> = m.params().w().matvec(&emb).into_iter().map(sigmoid).collect();

        let u = m.params().u().unwrap();
        let p = crate::rnn::math::softmax(&u.matvec(&h1));
        let expected = -p[j].ln() + m.regularization_loss();
        let loss = m.compute_seq_loss(&[i], &[j]).unwrap();
        assert!((loss - expected).abs() < 1e-12);
    }

    #[test]
    fn test_sparse_gradients_only_for_inputs() {
        let mut m = model(OutputKind::Hierarchical);
        m.reset_gradients();
        m.accumulate_gradients(&[1, 4, 1], &[4, 1, 6]).unwrap();
        let rows: Vec<usize> = m.params().sparse_grads().map(|(i, _)| i).collect();
        assert_eq!(rows, vec![1, 4]);
    }

    #[test]
    fn test_tree_gradients_independent_of_sequence_order() {
        let mut cfg = config(OutputKind::Hierarchical);
        cfg.training.l2_reg = 0.1;
        let base = RnnLm::with_random_embeddings(8, 3, &cfg).unwrap();
        let a = (vec![0, 1], vec![0, 1]);
        let b = (vec![2, 3], vec![6, 7]);

        let mut ab = base.clone();
        ab.reset_gradients();
        ab.accumulate_gradients(&a.0, &a.1).unwrap();
        ab.accumulate_gradients(&b.0, &b.1).unwrap();

        let mut ba = base;
        ba.reset_gradients();
        ba.accumulate_gradients(&b.0, &b.1).unwrap();
        ba.accumulate_gradients(&a.0, &a.1).unwrap();

        let (t1, t2) = (ab.tree().unwrap(), ba.tree().unwrap());
        assert_eq!(t1.touched_nodes(), t2.touched_nodes());
        for node in t1.touched_nodes() {
            for (x, y) in t1.grad(node).unwrap().iter().zip(t2.grad(node).unwrap()) {
                assert!((x - y).abs() < 1e-12, "node {:?}: {} vs {}", node, x, y);
            }
        }
    }

    #[test]
    fn test_index_errors_surface() {
        let mut m = model(OutputKind::Flat);
        assert!(matches!(
            m.accumulate_gradients(&[0, 8], &[1, 2]),
            Err(ModelError::IndexOutOfRange { index: 8, .. })
        ));
        assert!(m.compute_seq_loss(&[0], &[9]).is_err());
    }

    #[test]
    fn test_training_reduces_loss() {
        for kind in [OutputKind::Flat, OutputKind::Hierarchical] {
            let mut cfg = config(kind);
            cfg.training.learning_rate = 0.1;
            let mut m = RnnLm::with_random_embeddings(6, 5, &cfg).unwrap();
            let batch = vec![(vec![0, 1, 2, 3, 4], vec![1, 2, 3, 4, 5])];
            let before = m.compute_loss(&batch).unwrap();
            for _ in 0..100 {
                m.train_minibatch(&batch).unwrap();
            }
            let after = m.compute_loss(&batch).unwrap();
            assert!(after < before, "{:?}: {} -> {}", kind, before, after);
        }
    }

    #[test]
    fn test_mean_loss_divides_by_tokens() {
        let m = model(OutputKind::Hierarchical);
        let data = vec![(vec![0, 1], vec![1, 2]), (vec![3], vec![4])];
        let total = m.compute_loss(&data).unwrap();
        let mean = m.compute_mean_loss(&data).unwrap();
        assert!((mean - total / 3.0).abs() < 1e-12);
        let empty: Vec<(Vec<usize>, Vec<usize>)> = Vec::new();
        assert_eq!(m.compute_mean_loss(&empty).unwrap(), 0.0);
    }

    #[test]
    fn test_reseed_keeps_embeddings() {
        let mut m = model(OutputKind::Flat);
        let l_before = m.params().embeddings().clone();
        let u_before = m.params().u().cloned();
        let h_before = m.params().h().clone();
        m.reseed(99).unwrap();
        assert_eq!(m.params().embeddings(), &l_before);
        assert_eq!(m.params().u().cloned(), u_before);
        assert_ne!(m.params().h(), &h_before);
        assert_eq!(m.params().grad(DenseParam::H).unwrap().sum_squares(), 0.0);
    }
}
