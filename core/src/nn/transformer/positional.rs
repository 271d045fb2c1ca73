//! Fixed sinusoidal positional embeddings.
//!
//! For position `p` and channel pair `i`:
//!
//! ```text
//! PE[p, 2i]     = sin(p * 10000^(-2i / E))
//! PE[p, 2i + 1] = cos(p * 10000^(-2i / E))
//! ```
//!
//! The table is computed once, in `f64`, for every position up to `max_len`
//! and is never learned.

use crate::tensor::{PARALLEL_THRESHOLD, Result, Tensor, TensorElem, TensorError, scalar};
use rayon::prelude::*;

/// Default number of precomputed positions.
pub const DEFAULT_MAX_LEN: usize = 5000;

#[derive(Debug, Clone)]
pub struct SinusoidalPositionalEmbedding<T: TensorElem> {
    /// Shape `[max_len, embedding_dim]`.
    table: Tensor<T, 2>,
}

impl<T: TensorElem> SinusoidalPositionalEmbedding<T> {
    /// Precomputes the table. `embedding_dim` must be even and non-zero.
    pub fn new(max_len: usize, embedding_dim: usize) -> Result<Self> {
        if embedding_dim == 0 || embedding_dim % 2 != 0 {
            return Err(TensorError::Configuration(format!(
                "sinusoidal embeddings need an even, non-zero width, got {embedding_dim}"
            )));
        }
        if max_len == 0 {
            return Err(TensorError::Configuration(
                "positional table needs max_len >= 1".to_string(),
            ));
        }

        let e = embedding_dim;
        let log_base = -(10000.0f64).ln() / e as f64;
        let div_term: Vec<f64> = (0..e / 2)
            .map(|i| ((2 * i) as f64 * log_base).exp())
            .collect();

        let mut data = Vec::with_capacity(max_len * e);
        for pos in 0..max_len {
            for &div in &div_term {
                let angle = pos as f64 * div;
                data.push(scalar(angle.sin())?);
                data.push(scalar(angle.cos())?);
            }
        }

        Ok(Self {
            table: Tensor::new(data, [max_len, e])?,
        })
    }

    pub fn max_len(&self) -> usize {
        self.table.shape()[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.table.shape()[1]
    }

    /// The full `[max_len, E]` table.
    pub fn table(&self) -> &Tensor<T, 2> {
        &self.table
    }

    fn check_len(&self, seq_len: usize) -> Result<()> {
        if seq_len == 0 {
            return Err(TensorError::Configuration(
                "sequence length must be at least 1".to_string(),
            ));
        }
        if seq_len > self.max_len() {
            return Err(TensorError::Configuration(format!(
                "sequence length {seq_len} exceeds positional table length {}",
                self.max_len()
            )));
        }
        Ok(())
    }

    /// Returns the first `seq_len` rows broadcast to `[batch, seq_len, E]`.
    pub fn lookup(&self, seq_len: usize, batch: usize) -> Result<Tensor<T, 3>> {
        self.check_len(seq_len)?;
        let e = self.embedding_dim();
        let rows = &self.table.data()[..seq_len * e];
        let mut data = Vec::with_capacity(batch * rows.len());
        for _ in 0..batch {
            data.extend_from_slice(rows);
        }
        Tensor::new(data, [batch, seq_len, e])
    }

    /// Adds the embeddings to `x: [B, L, E]` in place, without materializing
    /// the broadcast.
    pub fn add_to(&self, x: &mut Tensor<T, 3>) -> Result<()> {
        let [_, seq_len, e] = *x.shape();
        if e != self.embedding_dim() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.embedding_dim()],
                got: vec![e],
            });
        }
        self.check_len(seq_len)?;

        let rows = &self.table.data()[..seq_len * e];
        let add = |seq: &mut [T]| {
            for (v, &p) in seq.iter_mut().zip(rows) {
                *v += p;
            }
        };
        if x.size() < PARALLEL_THRESHOLD {
            x.data_mut().chunks_mut(seq_len * e).for_each(add);
        } else {
            x.data_mut().par_chunks_mut(seq_len * e).for_each(add);
        }
        Ok(())
    }
}
