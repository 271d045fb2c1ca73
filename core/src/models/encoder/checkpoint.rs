//! Activation checkpointing.
//!
//! A training forward pass can keep every intermediate tensor of every block,
//! or keep only the block inputs and rebuild the intermediates on demand by
//! replaying the block with the same dropout stream.

use super::EncoderStack;
use crate::nn::dropout::Mode;
use crate::nn::transformer::AttentionMask;
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use std::borrow::Cow;

/// Every intermediate tensor of one encoder block forward.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockActivations<T: TensorElem> {
    pub input: Tensor<T, 3>,
    pub norm1: Tensor<T, 3>,
    /// Attention sub-layer output after dropout.
    pub attention: Tensor<T, 3>,
    /// `input + attention`
    pub residual: Tensor<T, 3>,
    pub norm2: Tensor<T, 3>,
    /// Feed-forward hidden layer `[B, L, 4E]` after GELU and dropout.
    pub hidden: Tensor<T, 3>,
    pub output: Tensor<T, 3>,
}

impl<T: TensorElem> BlockActivations<T> {
    pub fn num_elements(&self) -> usize {
        [
            &self.input,
            &self.norm1,
            &self.attention,
            &self.residual,
            &self.norm2,
            &self.hidden,
            &self.output,
        ]
        .iter()
        .map(|t| t.size())
        .sum()
    }
}

/// Activations kept by a training forward pass for a later reverse pass.
#[derive(Debug, Clone)]
pub enum ActivationStore<T: TensorElem> {
    /// All intermediates of every block.
    Full(Vec<BlockActivations<T>>),
    /// Block inputs only, plus what is needed to replay each block.
    Checkpointed {
        inputs: Vec<Tensor<T, 3>>,
        mode: Mode,
        mask: Option<AttentionMask>,
    },
}

impl<T: TensorElem + Float> ActivationStore<T> {
    pub fn num_blocks(&self) -> usize {
        match self {
            ActivationStore::Full(blocks) => blocks.len(),
            ActivationStore::Checkpointed { inputs, .. } => inputs.len(),
        }
    }

    pub fn is_checkpointed(&self) -> bool {
        matches!(self, ActivationStore::Checkpointed { .. })
    }

    /// Activations of block `index`, recomputed through `stack` if they were
    /// not retained. `stack` must be the one that produced the store.
    pub fn block<'a>(
        &'a self,
        index: usize,
        stack: &EncoderStack<T>,
    ) -> Result<Cow<'a, BlockActivations<T>>> {
        let out_of_bounds = || TensorError::IndexOutOfBounds {
            index: vec![index],
            shape: vec![self.num_blocks()],
        };
        match self {
            ActivationStore::Full(blocks) => {
                blocks.get(index).map(Cow::Borrowed).ok_or_else(out_of_bounds)
            }
            ActivationStore::Checkpointed { inputs, mode, mask } => {
                let input = inputs.get(index).ok_or_else(out_of_bounds)?;
                log::trace!("recomputing activations of block {index}");
                stack
                    .run_block(index, input, mask.as_ref(), *mode)
                    .map(Cow::Owned)
            }
        }
    }

    /// Number of scalars held by the store.
    pub fn retained_elements(&self) -> usize {
        match self {
            ActivationStore::Full(blocks) => blocks.iter().map(|b| b.num_elements()).sum(),
            ActivationStore::Checkpointed { inputs, .. } => inputs.iter().map(|t| t.size()).sum(),
        }
    }
}
