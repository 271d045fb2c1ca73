//! Dropout and the inference/training switch.
//!
//! Dropout is stochastic, so every random draw in this crate comes from a
//! [`StdRng`] derived from a [`Mode::Training`] seed and a *stream* number.
//! The same seed and stream always yield the same masks, which is what lets
//! activation checkpointing recompute a block bit-for-bit.

use crate::tensor::{PARALLEL_THRESHOLD, Result, Tensor, TensorElem, TensorError, scalar};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Whether a forward pass is deterministic or applies dropout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Dropout disabled; the forward pass is a pure function of its inputs.
    #[default]
    Inference,
    /// Dropout enabled, with masks drawn from `seed`.
    Training { seed: u64 },
}

impl Mode {
    /// Maps a plain training flag onto a mode, drawing a fresh seed for training.
    pub fn from_training(training: bool) -> Self {
        if training {
            Mode::Training {
                seed: rand::rng().random(),
            }
        } else {
            Mode::Inference
        }
    }

    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Training { .. })
    }

    /// Independent generator for one consumer (the input dropout, a block, ...).
    /// `None` in inference mode.
    pub fn rng(&self, stream: u64) -> Option<StdRng> {
        match *self {
            Mode::Inference => None,
            Mode::Training { seed } => Some(StdRng::seed_from_u64(derive_seed(seed, stream))),
        }
    }

    /// A training mode whose masks differ per worker but are still reproducible.
    pub fn for_worker(self, rank: usize) -> Self {
        match self {
            Mode::Inference => Mode::Inference,
            Mode::Training { seed } => Mode::Training {
                seed: derive_seed(seed, u64::MAX - rank as u64),
            },
        }
    }
}

/// SplitMix64 finalizer over `seed + stream * golden_gamma`.
pub fn derive_seed(seed: u64, stream: u64) -> u64 {
    let mut z = seed.wrapping_add(stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Inverted dropout: zeroes each element with probability `p` and scales the
/// survivors by `1 / (1 - p)`, so no rescaling is needed at inference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    p: f64,
}

impl Dropout {
    pub fn new(p: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(TensorError::Configuration(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }
        Ok(Self { p })
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    /// True if a forward with this generator would change its input.
    pub fn is_active(&self, rng: Option<&StdRng>) -> bool {
        rng.is_some() && self.p > 0.0
    }

    /// Applies dropout in place. A `None` generator means inference: no-op.
    pub fn apply<T: TensorElem, const RANK: usize>(
        &self,
        x: &mut Tensor<T, RANK>,
        rng: Option<&mut StdRng>,
    ) -> Result<()> {
        let Some(rng) = rng else {
            return Ok(());
        };
        if self.p == 0.0 {
            return Ok(());
        }

        let scale: T = scalar(1.0 / (1.0 - self.p))?;
        // Draw serially so the mask depends only on the generator state.
        let keep: Vec<bool> = (0..x.size()).map(|_| rng.random::<f64>() >= self.p).collect();

        let data = x.data_mut();
        if data.len() < PARALLEL_THRESHOLD {
            for (v, &k) in data.iter_mut().zip(&keep) {
                *v = if k { *v * scale } else { T::zero() };
            }
        } else {
            data.par_iter_mut().zip(keep.par_iter()).for_each(|(v, &k)| {
                *v = if k { *v * scale } else { T::zero() };
            });
        }
        Ok(())
    }

    /// Owned convenience wrapper around [`Dropout::apply`].
    pub fn forward<T: TensorElem, const RANK: usize>(
        &self,
        mut x: Tensor<T, RANK>,
        rng: Option<&mut StdRng>,
    ) -> Result<Tensor<T, RANK>> {
        self.apply(&mut x, rng)?;
        Ok(x)
    }
}
