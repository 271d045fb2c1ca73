use crate::nn::activation::{Activation, GeluApproximation};
use crate::nn::dropout::Dropout;
use crate::nn::linear::Linear;
use crate::nn::module::{Module, Parameter, ParameterMut};
use crate::tensor::{Result, Tensor, TensorElem};
use num_traits::Float;
use rand::rngs::StdRng;

/// Width multiplier of the hidden layer.
pub const EXPANSION: usize = 4;

/// Position-wise feed-forward network: `fc2(dropout(gelu(fc1(x))))`.
///
/// `fc1` maps `E -> 4E` and `fc2` maps `4E -> E`; both carry a bias.
#[derive(Debug, Clone)]
pub struct FeedForward<T: TensorElem> {
    pub fc1: Linear<T>,
    pub fc2: Linear<T>,
    pub activation: GeluApproximation,
    pub dropout: Dropout,
}

impl<T: TensorElem + Float> FeedForward<T> {
    pub fn new(embedding_dim: usize, dropout: f64, activation: GeluApproximation) -> Result<Self> {
        Ok(Self {
            fc1: Linear::zeros(embedding_dim, EXPANSION * embedding_dim, true),
            fc2: Linear::zeros(EXPANSION * embedding_dim, embedding_dim, true),
            activation,
            dropout: Dropout::new(dropout)?,
        })
    }

    pub fn forward(&self, x: &Tensor<T, 3>, rng: Option<&mut StdRng>) -> Result<Tensor<T, 3>> {
        self.fc2.forward(&self.hidden(x, rng)?)
    }

    /// The `[B, L, 4E]` activation fed to `fc2`, after GELU and dropout.
    pub fn hidden(&self, x: &Tensor<T, 3>, rng: Option<&mut StdRng>) -> Result<Tensor<T, 3>> {
        let mut hidden = self.fc1.forward(x)?;
        Activation::gelu_inplace(&mut hidden, self.activation);
        self.dropout.apply(&mut hidden, rng)?;
        Ok(hidden)
    }
}

impl<T: TensorElem> Module<T> for FeedForward<T> {
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        let mut params = self.fc1.parameters();
        params.extend(self.fc2.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        let mut params = self.fc1.parameters_mut();
        params.extend(self.fc2.parameters_mut());
        params
    }
}
