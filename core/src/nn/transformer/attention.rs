//! Reference multi-head self-attention.
//!
//! Projects the input to queries, keys and values with three bias-free
//! linear layers, splits them into heads, computes the full score matrix
//! `softmax(Q K^T / sqrt(D))`, and mixes values with it:
//!
//! ```text
//! [B, L, E] --q/k/v proj--> [B, L, E] --reshape--> [B, L, H, D] --transpose(1, 2)--> [B, H, L, D]
//! scores = Q K^T * scale                                         [B, H, L, L]
//! scores[masked] = -inf; weights = softmax(scores)
//! out = weights V --transpose(1, 2)--> [B, L, H, D] --reshape--> [B, L, E] --o_proj--> [B, L, E]
//! ```

use super::mask::AttentionMask;
use crate::nn::dropout::Dropout;
use crate::nn::linear::Linear;
use crate::nn::module::{Module, Parameter, ParameterMut};
use crate::tensor::{PARALLEL_THRESHOLD, Result, Tensor, TensorElem, TensorError, scalar};
use num_traits::Float;
use rand::rngs::StdRng;
use rayon::prelude::*;

/// One multi-head self-attention implementation.
///
/// Both implementations share this interface so an encoder block can hold
/// either one behind a `Box<dyn AttentionKernel<T>>`.
pub trait AttentionKernel<T: TensorElem>: Module<T> {
    /// `x: [B, L, E]` to `[B, L, E]`. A `None` generator means inference.
    fn forward(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        rng: Option<&mut StdRng>,
    ) -> Result<Tensor<T, 3>>;

    fn num_heads(&self) -> usize;

    fn embedding_dim(&self) -> usize;

    /// Human-readable kernel name, used in logs.
    fn name(&self) -> &'static str;
}

/// Output of [`scaled_dot_product_attention`].
#[derive(Debug)]
pub struct AttentionOutput<T: TensorElem> {
    /// `[B, H, Lq, D]`
    pub output: Tensor<T, 4>,
    /// Softmax weights `[B, H, Lq, Lk]` before dropout, when requested.
    pub weights: Option<Tensor<T, 4>>,
    /// Number of `(batch, head, query)` rows with every key masked.
    pub masked_rows: usize,
}

/// Attention over already split heads with an explicit score matrix.
///
/// Rows in which every key is masked produce zero weights and therefore a
/// zero output.
#[allow(clippy::too_many_arguments)]
pub fn scaled_dot_product_attention<T: TensorElem + Float>(
    q: &Tensor<T, 4>,
    k: &Tensor<T, 4>,
    v: &Tensor<T, 4>,
    mask: Option<&AttentionMask>,
    scale: T,
    dropout: &Dropout,
    rng: Option<&mut StdRng>,
    return_weights: bool,
) -> Result<AttentionOutput<T>> {
    let [b, h, lq, d] = *q.shape();
    let lk = k.shape()[2];
    if let Some(mask) = mask {
        mask.check(b, h, lq, lk)?;
    }

    let q3 = q.clone().reshape([b * h, lq, d])?;
    let k3 = k.clone().reshape([b * h, lk, d])?;
    let v3 = v.clone().reshape([b * h, lk, d])?;

    let mut scores = q3.matmul_transposed(&k3)?;
    scores.map_inplace(|s| s * scale);

    if let Some(mask) = mask.filter(|_| scores.size() > 0) {
        let apply_mask = |(row, chunk): (usize, &mut [T])| {
            let (bh, qi) = (row / lq, row % lq);
            let (bi, hi) = (bh / h, bh % h);
            for (kj, s) in chunk.iter_mut().enumerate() {
                if mask.is_masked(bi, hi, qi, kj) {
                    *s = T::neg_infinity();
                }
            }
        };
        if scores.size() < PARALLEL_THRESHOLD {
            scores.data_mut().chunks_mut(lk).enumerate().for_each(apply_mask);
        } else {
            scores.data_mut().par_chunks_mut(lk).enumerate().for_each(apply_mask);
        }
    }

    let masked_rows = encoder_rs_kernels::cpu_softmax_rows(scores.data_mut(), lk)?;
    let weights = if return_weights {
        Some(scores.clone().reshape([b, h, lq, lk])?)
    } else {
        None
    };
    dropout.apply(&mut scores, rng)?;

    let output = scores.matmul(&v3)?.reshape([b, h, lq, d])?;
    Ok(AttentionOutput {
        output,
        weights,
        masked_rows,
    })
}

/// `1 / sqrt(head_dim)`.
pub(crate) fn attention_scale<T: TensorElem>(head_dim: usize) -> Result<T> {
    scalar(1.0 / (head_dim as f64).sqrt())
}

pub(crate) fn check_heads(embedding_dim: usize, num_heads: usize) -> Result<usize> {
    if num_heads == 0 || embedding_dim == 0 || embedding_dim % num_heads != 0 {
        return Err(TensorError::Configuration(format!(
            "embedding dim {embedding_dim} must be a non-zero multiple of num_heads {num_heads}"
        )));
    }
    Ok(embedding_dim / num_heads)
}

pub(crate) fn check_seq_len(seq_len: usize) -> Result<()> {
    if seq_len == 0 {
        return Err(TensorError::Configuration(
            "sequence length must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Multi-head attention with separate Q, K, V projections and an explicit
/// `[B, H, L, L]` score matrix.
#[derive(Debug, Clone)]
pub struct ReferenceAttention<T: TensorElem> {
    pub q_proj: Linear<T>,
    pub k_proj: Linear<T>,
    pub v_proj: Linear<T>,
    pub o_proj: Linear<T>,

    pub num_heads: usize,
    pub head_dim: usize,
    pub scaling: T,
    pub attn_dropout: Dropout,
}

impl<T: TensorElem + Float> ReferenceAttention<T> {
    /// Zero-initialized attention; weights come from an init pass or direct assignment.
    pub fn new(embedding_dim: usize, num_heads: usize, dropout: f64) -> Result<Self> {
        let head_dim = check_heads(embedding_dim, num_heads)?;
        let proj = || Linear::zeros(embedding_dim, embedding_dim, false);
        Ok(Self {
            q_proj: proj(),
            k_proj: proj(),
            v_proj: proj(),
            o_proj: proj(),
            num_heads,
            head_dim,
            scaling: attention_scale(head_dim)?,
            attn_dropout: Dropout::new(dropout)?,
        })
    }

    /// Builds attention from existing projections, each `[E, E]`.
    pub fn from_projections(
        num_heads: usize,
        q_proj: Linear<T>,
        k_proj: Linear<T>,
        v_proj: Linear<T>,
        o_proj: Linear<T>,
        dropout: f64,
    ) -> Result<Self> {
        let e = o_proj.out_features();
        for proj in [&q_proj, &k_proj, &v_proj, &o_proj] {
            if proj.weight.shape() != &[e, e] {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![e, e],
                    got: proj.weight.shape().to_vec(),
                });
            }
        }
        let head_dim = check_heads(e, num_heads)?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            head_dim,
            scaling: attention_scale(head_dim)?,
            attn_dropout: Dropout::new(dropout)?,
        })
    }

    fn heads(&self, x: Tensor<T, 3>) -> Result<Tensor<T, 4>> {
        let [b, l, _] = *x.shape();
        x.reshape([b, l, self.num_heads, self.head_dim])?
            .transpose_axes(1, 2)
    }

    /// Forward pass that also returns the attention weights `[B, H, L, L]`.
    pub fn forward_with_weights(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        rng: Option<&mut StdRng>,
    ) -> Result<(Tensor<T, 3>, Tensor<T, 4>)> {
        let (out, weights) = self.attend(x, mask, rng, true)?;
        let weights = weights.ok_or_else(|| {
            TensorError::Unsupported("attention weights were not recorded".to_string())
        })?;
        Ok((out, weights))
    }

    fn attend(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        rng: Option<&mut StdRng>,
        return_weights: bool,
    ) -> Result<(Tensor<T, 3>, Option<Tensor<T, 4>>)> {
        let [b, l, e] = *x.shape();
        if e != self.embedding_dim() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![b, l, self.embedding_dim()],
                got: x.shape().to_vec(),
            });
        }
        check_seq_len(l)?;

        let q = self.heads(self.q_proj.forward(x)?)?;
        let k = self.heads(self.k_proj.forward(x)?)?;
        let v = self.heads(self.v_proj.forward(x)?)?;

        let attn = scaled_dot_product_attention(
            &q,
            &k,
            &v,
            mask,
            self.scaling,
            &self.attn_dropout,
            rng,
            return_weights,
        )?;
        if attn.masked_rows > 0 {
            log::warn!(
                "{} attention rows had every key masked; their output was set to zero",
                attn.masked_rows
            );
        }

        let merged = attn.output.transpose_axes(1, 2)?.reshape([b, l, e])?;
        Ok((self.o_proj.forward(&merged)?, attn.weights))
    }
}

impl<T: TensorElem + Float> AttentionKernel<T> for ReferenceAttention<T> {
    fn forward(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        rng: Option<&mut StdRng>,
    ) -> Result<Tensor<T, 3>> {
        Ok(self.attend(x, mask, rng, false)?.0)
    }

    fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn embedding_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    fn name(&self) -> &'static str {
        "reference"
    }
}

impl<T: TensorElem> Module<T> for ReferenceAttention<T> {
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.o_proj]
            .into_iter()
            .flat_map(|p| p.parameters())
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        [
            &mut self.q_proj,
            &mut self.k_proj,
            &mut self.v_proj,
            &mut self.o_proj,
        ]
        .into_iter()
        .flat_map(|p| p.parameters_mut())
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::dropout::Mode;

    fn eye(n: usize) -> Linear<f64> {
        let mut w = Tensor::zeros([n, n]);
        for i in 0..n {
            w.data_mut()[i * n + i] = 1.0;
        }
        Linear::new(w, None).unwrap()
    }

    fn identity_attention(e: usize, heads: usize) -> ReferenceAttention<f64> {
        ReferenceAttention::from_projections(heads, eye(e), eye(e), eye(e), eye(e), 0.0).unwrap()
    }

    #[test]
    fn test_weights_rows_sum_to_one() -> Result<()> {
        let attn = identity_attention(4, 2);
        let x = Tensor::<f64, 3>::new((0..24).map(|i| (i as f64 * 0.3).cos()).collect(), [2, 3, 4])?;
        let (out, weights) = attn.forward_with_weights(&x, None, None)?;
        assert_eq!(out.shape(), &[2, 3, 4]);
        assert_eq!(weights.shape(), &[2, 2, 3, 3]);
        for row in weights.data().chunks(3) {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_masked_keys_get_zero_weight() -> Result<()> {
        let attn = identity_attention(4, 2);
        let x = Tensor::<f64, 3>::new((0..24).map(|i| i as f64 * 0.1).collect(), [2, 3, 4])?;
        let mask = AttentionMask::from_lengths(&[3, 2], 3)?;
        let (_, weights) = attn.forward_with_weights(&x, Some(&mask), None)?;

        // Batch 1, key 2 is padding for every head and query.
        for head in 0..2 {
            for q in 0..3 {
                let idx = ((2 + head) * 3 + q) * 3 + 2;
                assert_eq!(weights.data()[idx], 0.0);
            }
        }
        Ok(())
    }

    #[test]
    fn test_masked_key_values_do_not_leak() -> Result<()> {
        // Changing a masked key's embedding must not change any output.
        let attn = identity_attention(2, 1);
        let mask = AttentionMask::from_lengths(&[2], 3)?;
        let a = Tensor::<f64, 3>::new(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], [1, 3, 2])?;
        let mut b = a.clone();
        b.data_mut()[4] = 9.0;
        b.data_mut()[5] = -9.0;

        let out_a = attn.forward(&a, Some(&mask), None)?;
        let out_b = attn.forward(&b, Some(&mask), None)?;
        assert_eq!(&out_a.data()[..4], &out_b.data()[..4]);
        Ok(())
    }

    #[test]
    fn test_fully_masked_row_outputs_zero() -> Result<()> {
        let attn = identity_attention(2, 1);
        let x = Tensor::<f64, 3>::ones([1, 2, 2]);
        let mask = AttentionMask::new(vec![false, false, true, true], &[2, 2])?;
        let (out, weights) = attn.forward_with_weights(&x, Some(&mask), None)?;
        assert_eq!(&weights.data()[2..], &[0.0, 0.0]);
        assert_eq!(&out.data()[2..], &[0.0, 0.0]);
        assert!(out.data().iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_attention_dropout_changes_training_output_only() -> Result<()> {
        let mut attn = identity_attention(4, 2);
        attn.attn_dropout = Dropout::new(0.5)?;
        let x = Tensor::<f64, 3>::new((0..24).map(|i| (i as f64).sin()).collect(), [1, 6, 4])?;

        let eval_a = attn.forward(&x, None, None)?;
        let eval_b = attn.forward(&x, None, None)?;
        assert_eq!(eval_a, eval_b);

        let mode = Mode::Training { seed: 5 };
        let train_a = attn.forward(&x, None, mode.rng(0).as_mut())?;
        let train_b = attn.forward(&x, None, mode.rng(0).as_mut())?;
        assert_eq!(train_a, train_b);
        assert_ne!(train_a, eval_a);
        Ok(())
    }

    #[test]
    fn test_construction_errors() {
        assert!(ReferenceAttention::<f32>::new(6, 4, 0.1).is_err());
        assert!(ReferenceAttention::<f32>::new(8, 0, 0.1).is_err());
        assert!(ReferenceAttention::<f32>::new(8, 2, 1.5).is_err());
        let attn = ReferenceAttention::<f32>::new(8, 2, 0.1).unwrap();
        assert_eq!(attn.num_parameters(), 4 * 64);
        assert_eq!(attn.embedding_dim(), 8);
    }

    #[test]
    fn test_empty_sequence_is_rejected() {
        let attn = ReferenceAttention::<f32>::new(8, 2, 0.0).unwrap();
        let empty = Tensor::<f32, 3>::zeros([2, 0, 8]);
        assert!(matches!(
            attn.forward(&empty, None, None),
            Err(TensorError::Configuration(_))
        ));
    }
}
