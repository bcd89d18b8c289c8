//! Evaluation helpers for reporting loss as perplexity.

use super::{check_finite, ModelError};

/// `exp(mean_loss)`, with `mean_loss` in nats per token.
pub fn perplexity(mean_loss: f64) -> f64 {
    mean_loss.exp()
}

/// How `adjust_loss` accounts for words folded into the unknown token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdjustMode {
    /// Renormalize over the known-word fraction: `(loss + f·ln f) / (1 - f)`.
    #[default]
    Basic,
    /// Charge each unknown word `-ln q`: `loss + f·ln f - f·ln q`.
    Full,
}

/// Correct a mean per-token loss for the fraction `fraction_lost` of
/// tokens mapped to the unknown word, where `q` is the probability of
/// guessing the specific unknown word.
pub fn adjust_loss(
    loss: f64,
    fraction_lost: f64,
    q: f64,
    mode: AdjustMode,
) -> Result<f64, ModelError> {
    let f = fraction_lost;
    // 0 · ln 0 = 0
    let f_ln_f = if f > 0.0 { f * f.ln() } else { 0.0 };
    let adjusted = match mode {
        AdjustMode::Basic => (loss + f_ln_f) / (1.0 - f),
        AdjustMode::Full => {
            let f_ln_q = if f > 0.0 { f * q.ln() } else { 0.0 };
            loss + f_ln_f - f_ln_q
        }
    };
    check_finite(adjusted, "adjusted loss")
}
