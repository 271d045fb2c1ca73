//! Pre-norm transformer encoder.
//!
//! ```text
//! x: [B, L, E]
//!   + sinusoidal positions, dropout
//!   -> block 0 -> block 1 -> ... -> block N-1
//!
//! block(x):
//!   x1 = x  + dropout(attention(norm1(x), mask))
//!   x2 = x1 + dropout(feed_forward(norm2(x1)))
//! ```
//!
//! The attention kernel is chosen once at construction from
//! [`EncoderConfig::use_fused_attention`]; blocks only see the
//! [`AttentionKernel`] interface.

pub mod checkpoint;
pub mod config;
pub mod optimized;

pub use checkpoint::{ActivationStore, BlockActivations};
pub use config::EncoderConfig;
pub use optimized::OptimizedEncoder;

use crate::models::traits::Encoder;
use crate::nn::dropout::{Dropout, Mode};
use crate::nn::init::initialize;
use crate::nn::module::{Module, Parameter, ParameterMut};
use crate::nn::norm::LayerNorm;
use crate::nn::transformer::{
    AttentionKernel, AttentionMask, FeedForward, FusedAttention, ReferenceAttention,
    SinusoidalPositionalEmbedding,
};
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use rand::rngs::StdRng;

/// Generator stream of the dropout applied to the stack input. Block `i`
/// draws from stream `i + 1`.
pub(crate) const INPUT_STREAM: u64 = 0;

pub(crate) fn block_stream(index: usize) -> u64 {
    index as u64 + 1
}

#[derive(Debug)]
pub struct EncoderBlock<T: TensorElem> {
    pub norm1: LayerNorm<T>,
    pub attn: Box<dyn AttentionKernel<T>>,
    pub norm2: LayerNorm<T>,
    pub ffn: FeedForward<T>,
    pub dropout: Dropout,
}

impl<T: TensorElem + Float> EncoderBlock<T> {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let e = config.embedding_dim;
        let attn: Box<dyn AttentionKernel<T>> = if config.use_fused_attention {
            Box::new(FusedAttention::new(e, config.num_heads, config.dropout)?)
        } else {
            Box::new(ReferenceAttention::new(e, config.num_heads, config.dropout)?)
        };
        Self::with_attention(config, attn)
    }

    /// Builds a block around an existing attention kernel.
    pub fn with_attention(config: &EncoderConfig, attn: Box<dyn AttentionKernel<T>>) -> Result<Self> {
        let e = config.embedding_dim;
        if attn.embedding_dim() != e {
            return Err(TensorError::ShapeMismatch {
                expected: vec![e],
                got: vec![attn.embedding_dim()],
            });
        }
        Ok(Self {
            norm1: LayerNorm::with_features(e, config.layer_norm_eps)?,
            attn,
            norm2: LayerNorm::with_features(e, config.layer_norm_eps)?,
            ffn: FeedForward::new(e, config.dropout, config.gelu)?,
            dropout: Dropout::new(config.dropout)?,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        rng: Option<&mut StdRng>,
    ) -> Result<Tensor<T, 3>> {
        Ok(self.forward_recorded(x, mask, rng)?.output)
    }

    /// Forward pass that keeps every intermediate tensor.
    ///
    /// Draws from `rng` in a fixed order (attention weights, attention
    /// output, hidden layer, feed-forward output), so replaying with a
    /// generator in the same state reproduces the pass exactly.
    pub fn forward_recorded(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        mut rng: Option<&mut StdRng>,
    ) -> Result<BlockActivations<T>> {
        let norm1 = self.norm1.forward(x)?;
        let mut attention = self.attn.forward(&norm1, mask, rng.as_deref_mut())?;
        self.dropout.apply(&mut attention, rng.as_deref_mut())?;
        let residual = (x + &attention)?;

        let norm2 = self.norm2.forward(&residual)?;
        let hidden = self.ffn.hidden(&norm2, rng.as_deref_mut())?;
        let mut ff = self.ffn.fc2.forward(&hidden)?;
        self.dropout.apply(&mut ff, rng)?;
        let output = (&residual + &ff)?;

        Ok(BlockActivations {
            input: x.clone(),
            norm1,
            attention,
            residual,
            norm2,
            hidden,
            output,
        })
    }
}

impl<T: TensorElem> Module<T> for EncoderBlock<T> {
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        let mut params = self.norm1.parameters();
        params.extend(self.attn.parameters());
        params.extend(self.norm2.parameters());
        params.extend(self.ffn.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        let mut params = self.norm1.parameters_mut();
        params.extend(self.attn.parameters_mut());
        params.extend(self.norm2.parameters_mut());
        params.extend(self.ffn.parameters_mut());
        params
    }
}

/// Positional embedding, input dropout and `num_layers` encoder blocks.
///
/// [`EncoderStack::new`] leaves every weight at zero (norm scales at one), so
/// until weights are assigned or initialized the stack computes
/// `x + positions`. Use [`EncoderStack::initialized`] or
/// [`OptimizedEncoder`] for a stack with Xavier-initialized weights.
#[derive(Debug)]
pub struct EncoderStack<T: TensorElem> {
    config: EncoderConfig,
    pub positional: SinusoidalPositionalEmbedding<T>,
    pub input_dropout: Dropout,
    pub blocks: Vec<EncoderBlock<T>>,
}

impl<T: TensorElem + Float> EncoderStack<T> {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        config.validate()?;
        let blocks = (0..config.num_layers)
            .map(|_| EncoderBlock::new(&config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            positional: SinusoidalPositionalEmbedding::new(config.max_len, config.embedding_dim)?,
            input_dropout: Dropout::new(config.dropout)?,
            blocks,
            config,
        })
    }

    /// Builds the stack and runs the seeded init pass with
    /// [`EncoderConfig::init_seed`].
    pub fn initialized(config: EncoderConfig) -> Result<Self> {
        let seed = config.init_seed;
        let mut stack = Self::new(config)?;
        initialize(&mut stack, seed)?;
        Ok(stack)
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Name of the attention kernel the blocks run.
    pub fn attention_kernel(&self) -> &'static str {
        self.blocks.first().map_or("none", |b| b.attn.name())
    }

    /// Validates `x` and `mask`, adds positions and applies the input dropout.
    pub fn embed(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        mode: Mode,
    ) -> Result<Tensor<T, 3>> {
        self.check_input(x, mask)?;
        let mut h = x.clone();
        self.positional.add_to(&mut h)?;
        self.input_dropout.apply(&mut h, mode.rng(INPUT_STREAM).as_mut())?;
        Ok(h)
    }

    /// Runs block `index` with its own generator stream.
    pub fn run_block(
        &self,
        index: usize,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        mode: Mode,
    ) -> Result<BlockActivations<T>> {
        let block = self.blocks.get(index).ok_or_else(|| TensorError::IndexOutOfBounds {
            index: vec![index],
            shape: vec![self.blocks.len()],
        })?;
        block.forward_recorded(x, mask, mode.rng(block_stream(index)).as_mut())
    }

    /// Inference pass over the blocks only, skipping positions and input dropout.
    pub fn forward_without_positions(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
    ) -> Result<Tensor<T, 3>> {
        self.check_input(x, mask)?;
        self.blocks
            .iter()
            .try_fold(x.clone(), |h, block| block.forward(&h, mask, None))
    }

    /// Rejects a wrong width, a sequence length outside `1..=max_len`, or a
    /// mask that does not broadcast.
    pub(crate) fn check_input(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
    ) -> Result<()> {
        let [b, l, e] = *x.shape();
        if e != self.config.embedding_dim {
            return Err(TensorError::ShapeMismatch {
                expected: vec![b, l, self.config.embedding_dim],
                got: x.shape().to_vec(),
            });
        }
        if l == 0 {
            return Err(TensorError::Configuration(
                "sequence length must be at least 1".to_string(),
            ));
        }
        if l > self.positional.max_len() {
            return Err(TensorError::Configuration(format!(
                "sequence length {l} exceeds positional table length {}",
                self.positional.max_len()
            )));
        }
        if let Some(mask) = mask {
            mask.check(b, self.config.num_heads, l, l)?;
        }
        Ok(())
    }
}

impl<T: TensorElem + Float> Encoder<T> for EncoderStack<T> {
    fn forward_with_mode(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        mode: Mode,
    ) -> Result<Tensor<T, 3>> {
        let mut h = self.embed(x, mask, mode)?;
        for index in 0..self.blocks.len() {
            h = self.run_block(index, &h, mask, mode)?.output;
            log::trace!("encoder block {index} done, shape {:?}", h.shape());
        }
        Ok(h)
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }
}

impl<T: TensorElem> Module<T> for EncoderStack<T> {
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        self.blocks.iter().flat_map(|b| b.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        self.blocks.iter_mut().flat_map(|b| b.parameters_mut()).collect()
    }
}
