//! Recurrent neural-network language model: numerical training core.
//!
//! A single-layer sigmoid recurrence predicts the next word of a sequence:
//!
//! ```text
//! z[t] = H * h[t-1] + W * L[x[t-1]]
//! h[t] = sigmoid(z[t])          (h[0] = 0)
//! y[t] = softmax(U * h[t])      (flat output layer)
//!      | tree path product      (hierarchical softmax)
//! ```
//!
//! ## Components
//!
//! - **Parameter store** (`params`): dense H, W, optional U, plus the sparse
//!   embedding table L whose gradients are keyed by row.
//! - **Hierarchical softmax tree** (`tree`): balanced binary tree over the
//!   vocabulary, one weight vector per internal node.
//! - **BPTT engine** (`bptt`): forward recurrence plus one truncated
//!   backprop-through-time routine shared by both output layers.
//! - **Generator** (`generate`): forward-only sampling.
//! - **Gradient checker** (`gradcheck`): central-difference validation.
//!
//! Training follows a strict reset → accumulate → apply protocol; nothing is
//! applied mid-sequence.

pub mod math;
pub mod params;
pub mod tree;
pub mod bptt;
pub mod model;
pub mod generate;
pub mod gradcheck;
pub mod eval;

pub use gradcheck::{GradCheckEntry, GradCheckReport};
pub use math::Matrix;
pub use model::{OutputLayer, RnnLm};
pub use params::{DenseParam, ParameterStore};
pub use tree::{HierarchicalSoftmaxTree, NodeId};

use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid model construction: {0}")]
    Construction(String),

    #[error("Vocabulary index {index} out of range (vocabulary size {vocab_size})")]
    IndexOutOfRange { index: usize, vocab_size: usize },

    #[error("Numeric divergence in {context}: value {value}")]
    NumericDivergence { context: &'static str, value: f64 },

    #[error("Failed to write gradient check report: {0}")]
    Report(#[from] std::io::Error),
}

/// Fail fast on a vocabulary index outside `[0, vocab_size)`.
pub(crate) fn check_index(index: usize, vocab_size: usize) -> Result<(), ModelError> {
    if index < vocab_size {
        Ok(())
    } else {
        Err(ModelError::IndexOutOfRange { index, vocab_size })
    }
}

/// Surface NaN/Inf as an error instead of letting it poison training.
pub(crate) fn check_finite(value: f64, context: &'static str) -> Result<f64, ModelError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ModelError::NumericDivergence { context, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_index_bounds() {
        assert!(check_index(0, 3).is_ok());
        assert!(check_index(2, 3).is_ok());
        match check_index(3, 3) {
            Err(ModelError::IndexOutOfRange { index, vocab_size }) => {
                assert_eq!(index, 3);
                assert_eq!(vocab_size, 3);
            }
            other => panic!("expected IndexOutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn test_check_finite_rejects_nan_and_inf() {
        assert_eq!(check_finite(1.5, "loss").unwrap(), 1.5);
        assert!(matches!(
            check_finite(f64::NAN, "loss"),
            Err(ModelError::NumericDivergence { context: "loss", .. })
        ));
        assert!(check_finite(f64::INFINITY, "loss").is_err());
    }
}
