use super::{ActivationStore, EncoderConfig, EncoderStack};
use crate::models::traits::Encoder;
use crate::nn::dropout::Mode;
use crate::nn::init::initialize;
use crate::nn::module::{Module, Parameter, ParameterMut};
use crate::nn::transformer::AttentionMask;
use crate::tensor::{Result, Tensor, TensorElem};
use num_traits::Float;

/// An [`EncoderStack`] with initialized weights and activation recording.
///
/// Construction runs the weight-initialization pass exactly once, seeded by
/// [`EncoderConfig::init_seed`]: Xavier-uniform linear weights, zero biases,
/// unit norm scales. Two encoders built from the same config are identical.
///
/// ```rust
/// use encoder_rs::models::encoder::{EncoderConfig, OptimizedEncoder};
/// use encoder_rs::models::traits::Encoder;
/// use encoder_rs::tensor::Tensor;
///
/// let config = EncoderConfig::new(2, 2, 8, 0.1).with_fused_attention(true);
/// let encoder = OptimizedEncoder::<f32>::new(config).unwrap();
///
/// let x = Tensor::<f32, 3>::ones([2, 5, 8]);
/// let y = encoder.forward(&x, None, false).unwrap();
/// assert_eq!(y.shape(), &[2, 5, 8]);
/// ```
#[derive(Debug)]
pub struct OptimizedEncoder<T: TensorElem> {
    stack: EncoderStack<T>,
}

impl<T: TensorElem + Float> OptimizedEncoder<T> {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        let seed = config.init_seed;
        let mut stack = EncoderStack::new(config)?;
        let tensors = initialize(&mut stack, seed)?;
        let config = stack.config();
        log::debug!(
            "built encoder: {} layers, {} heads, dim {}, {} attention, checkpointing {}, {} parameters in {} tensors",
            config.num_layers,
            config.num_heads,
            config.embedding_dim,
            stack.attention_kernel(),
            config.use_checkpointing,
            stack.num_parameters(),
            tensors
        );
        Ok(Self { stack })
    }

    pub fn stack(&self) -> &EncoderStack<T> {
        &self.stack
    }

    /// Training forward pass that also returns the activations needed by a
    /// reverse pass. With checkpointing enabled only block inputs are kept.
    ///
    /// The output is identical with and without checkpointing.
    pub fn forward_train(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        seed: u64,
    ) -> Result<(Tensor<T, 3>, ActivationStore<T>)> {
        let mode = Mode::Training { seed };
        let mut h = self.stack.embed(x, mask, mode)?;

        if self.stack.config().use_checkpointing {
            let mut inputs = Vec::with_capacity(self.stack.num_layers());
            for index in 0..self.stack.num_layers() {
                let next = self.stack.run_block(index, &h, mask, mode)?.output;
                inputs.push(std::mem::replace(&mut h, next));
            }
            let store = ActivationStore::Checkpointed {
                inputs,
                mode,
                mask: mask.cloned(),
            };
            Ok((h, store))
        } else {
            let mut blocks = Vec::with_capacity(self.stack.num_layers());
            for index in 0..self.stack.num_layers() {
                let acts = self.stack.run_block(index, &h, mask, mode)?;
                h = acts.output.clone();
                blocks.push(acts);
            }
            Ok((h, ActivationStore::Full(blocks)))
        }
    }
}

impl<T: TensorElem + Float> Encoder<T> for OptimizedEncoder<T> {
    fn forward_with_mode(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        mode: Mode,
    ) -> Result<Tensor<T, 3>> {
        self.stack.forward_with_mode(x, mask, mode)
    }

    fn config(&self) -> &EncoderConfig {
        self.stack.config()
    }
}

impl<T: TensorElem> Module<T> for OptimizedEncoder<T> {
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        self.stack.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        self.stack.parameters_mut()
    }
}
