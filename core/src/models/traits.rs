use crate::models::encoder::EncoderConfig;
use crate::nn::dropout::Mode;
use crate::nn::transformer::AttentionMask;
use crate::tensor::{Result, Tensor, TensorElem};

/// Common interface of everything that behaves like an encoder stack: the
/// plain stack, the optimized wrapper and its replicas.
///
/// Every implementation maps `[batch, seq_len, embedding_dim]` to a tensor of
/// the same shape.
pub trait Encoder<T: TensorElem>: Send + Sync {
    /// Forward pass with an explicit dropout mode.
    ///
    /// # Arguments
    ///
    /// * `x` - Embeddings of shape [batch, seq_len, embedding_dim].
    /// * `mask` - Optional boolean mask, `true` where a key must be ignored.
    /// * `mode` - [`Mode::Inference`], or [`Mode::Training`] with the seed of
    ///   every dropout mask drawn in this pass.
    fn forward_with_mode(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        mode: Mode,
    ) -> Result<Tensor<T, 3>>;

    /// Forward pass; `training` enables dropout with a fresh random seed.
    fn forward(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        training: bool,
    ) -> Result<Tensor<T, 3>> {
        self.forward_with_mode(x, mask, Mode::from_training(training))
    }

    fn config(&self) -> &EncoderConfig;
}
