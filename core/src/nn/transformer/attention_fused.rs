use super::attention::{
    AttentionKernel, ReferenceAttention, attention_scale, check_heads, check_seq_len,
    scaled_dot_product_attention,
};
use super::mask::AttentionMask;
use crate::kernels::attention::{flash_attention, merge_heads, split_heads, split_qkv};
use crate::nn::dropout::Dropout;
use crate::nn::linear::Linear;
use crate::nn::module::{Module, Parameter, ParameterMut};
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use rand::rngs::StdRng;

/// Multi-head self-attention with a fused QKV projection and a flash kernel.
///
/// # Optimizations
///
/// 1. **Fused projection**: one `[3E, E]` matmul instead of three `[E, E]` ones.
/// 2. **Fused head split**: reshape and transpose to `[B, H, L, D]` in a single copy.
/// 3. **Flash kernel**: softmax is computed online over key blocks, so memory
///    stays `O(L * D)` per head instead of `O(L^2)`.
///
/// The flash kernel has no dropout on attention weights. When attention
/// dropout is active (training with `p > 0`) the forward pass falls back to
/// the explicit-score algorithm for that call.
#[derive(Debug, Clone)]
pub struct FusedAttention<T: TensorElem> {
    /// `[3E, E]`, rows ordered q, k, v.
    pub qkv_proj: Linear<T>,
    pub o_proj: Linear<T>,

    pub num_heads: usize,
    pub head_dim: usize,
    pub scaling: T,
    pub attn_dropout: Dropout,
}

impl<T: TensorElem + Float> FusedAttention<T> {
    /// Zero-initialized attention; weights come from an init pass.
    pub fn new(embedding_dim: usize, num_heads: usize, dropout: f64) -> Result<Self> {
        let head_dim = check_heads(embedding_dim, num_heads)?;
        Ok(Self {
            qkv_proj: Linear::zeros(embedding_dim, 3 * embedding_dim, false),
            o_proj: Linear::zeros(embedding_dim, embedding_dim, false),
            num_heads,
            head_dim,
            scaling: attention_scale(head_dim)?,
            attn_dropout: Dropout::new(dropout)?,
        })
    }

    /// Fuses separate projections by stacking their weights `[Wq; Wk; Wv]`.
    pub fn from_projections(
        num_heads: usize,
        q_proj: &Linear<T>,
        k_proj: &Linear<T>,
        v_proj: &Linear<T>,
        o_proj: Linear<T>,
        dropout: f64,
    ) -> Result<Self> {
        let e = o_proj.out_features();
        let head_dim = check_heads(e, num_heads)?;
        let qkv_weight = Tensor::concat(&[
            q_proj.weight.clone(),
            k_proj.weight.clone(),
            v_proj.weight.clone(),
        ])?;
        if qkv_weight.shape() != &[3 * e, e] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![3 * e, e],
                got: qkv_weight.shape().to_vec(),
            });
        }

        let qkv_bias = match (&q_proj.bias, &k_proj.bias, &v_proj.bias) {
            (Some(qb), Some(kb), Some(vb)) => {
                Some(Tensor::concat(&[qb.clone(), kb.clone(), vb.clone()])?)
            }
            (None, None, None) => None,
            _ => {
                return Err(TensorError::Unsupported(
                    "q, k and v projections must all have a bias or none".to_string(),
                ));
            }
        };

        Ok(Self {
            qkv_proj: Linear::new(qkv_weight, qkv_bias)?,
            o_proj,
            num_heads,
            head_dim,
            scaling: attention_scale(head_dim)?,
            attn_dropout: Dropout::new(dropout)?,
        })
    }

    /// Copies the weights of a reference kernel, so both compute the same function.
    pub fn from_reference(reference: &ReferenceAttention<T>) -> Result<Self> {
        Self::from_projections(
            reference.num_heads,
            &reference.q_proj,
            &reference.k_proj,
            &reference.v_proj,
            reference.o_proj.clone(),
            reference.attn_dropout.p(),
        )
    }
}

impl<T: TensorElem + Float> AttentionKernel<T> for FusedAttention<T> {
    fn forward(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        rng: Option<&mut StdRng>,
    ) -> Result<Tensor<T, 3>> {
        let e = self.embedding_dim();
        if x.shape()[2] != e {
            return Err(TensorError::ShapeMismatch {
                expected: vec![e],
                got: vec![x.shape()[2]],
            });
        }
        check_seq_len(x.shape()[1])?;

        let qkv = self.qkv_proj.forward(x)?;
        let (q, k, v) = split_qkv(&qkv, e)?;
        let q = split_heads(&q, self.num_heads)?;
        let k = split_heads(&k, self.num_heads)?;
        let v = split_heads(&v, self.num_heads)?;

        let (merged, masked_rows) = if self.attn_dropout.is_active(rng.as_deref()) {
            let attn = scaled_dot_product_attention(
                &q,
                &k,
                &v,
                mask,
                self.scaling,
                &self.attn_dropout,
                rng,
                false,
            )?;
            (merge_heads(&attn.output)?, attn.masked_rows)
        } else {
            let flash = flash_attention(&q, &k, &v, mask, self.scaling)?;
            (flash.output, flash.masked_rows)
        };

        if masked_rows > 0 {
            log::warn!(
                "{masked_rows} attention rows had every key masked; their output was set to zero"
            );
        }
        self.o_proj.forward(&merged)
    }

    fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn embedding_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    fn name(&self) -> &'static str {
        "fused"
    }
}

impl<T: TensorElem> Module<T> for FusedAttention<T> {
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        let mut params = self.qkv_proj.parameters();
        params.extend(self.o_proj.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        let mut params = self.qkv_proj.parameters_mut();
        params.extend(self.o_proj.parameters_mut());
        params
    }
}
