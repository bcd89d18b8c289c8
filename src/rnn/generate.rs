//! Forward-only sequence sampling.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::debug;

use super::bptt::step;
use super::model::RnnLm;
use super::{check_finite, check_index, ModelError};

impl RnnLm {
    /// Sample a sequence starting from `start` until `end` is emitted or
    /// `max_len` words have been drawn.
    ///
    /// Returns the emitted sequence (beginning with `start`, so at most
    /// `max_len + 1` long) and its loss: `-ln p` of every sampled word except
    /// a terminating `end`, plus the regularization term.
    pub fn generate_sequence<R: Rng + ?Sized>(
        &self,
        start: usize,
        end: usize,
        max_len: usize,
        rng: &mut R,
    ) -> Result<(Vec<usize>, f64), ModelError> {
        let vocab_size = self.vocab_size();
        check_index(start, vocab_size)?;
        check_index(end, vocab_size)?;

        let head = self.output().head();
        let mut ys = vec![start];
        let mut h = vec![0.0; self.hidden_dim()];
        let mut loss = 0.0;

        for _ in 0..max_len {
            let prev = ys[ys.len() - 1];
            let (_, h_t) = step(self.params(), &h, prev)?;
            let p = head.distribution(self.params(), &h_t)?;
            let dist = WeightedIndex::new(&p).map_err(|_| ModelError::NumericDivergence {
                context: "sampling distribution",
                value: p.iter().sum(),
            })?;
            let y = dist.sample(rng);
            ys.push(y);
            if y == end {
                debug!(length = ys.len(), "Generation reached end token");
                break;
            }
            loss -= p[y].ln();
            h = h_t;
        }

        let loss = check_finite(loss + self.regularization_loss(), "generation loss")?;
        Ok((ys, loss))
    }
}
