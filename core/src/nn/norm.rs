use super::module::{Module, ParamKind, Parameter, ParameterMut};
use crate::tensor::{PARALLEL_THRESHOLD, Result, Tensor, TensorElem, TensorError, scalar};
use num_traits::Float;
use rayon::prelude::*;

/// Layer Normalization over the last axis.
///
/// `y = (x - mean) / sqrt(var + eps) * gamma + beta`, with the biased
/// (population) variance.
#[derive(Debug, Clone)]
pub struct LayerNorm<T: TensorElem> {
    /// Scale (gamma), shape `[features]`.
    pub weight: Tensor<T, 1>,
    /// Shift (beta), shape `[features]`.
    pub bias: Tensor<T, 1>,
    pub eps: T,
}

impl<T: TensorElem + Float> LayerNorm<T> {
    pub fn new(weight: Tensor<T, 1>, bias: Tensor<T, 1>, eps: T) -> Result<Self> {
        if weight.shape() != bias.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: weight.shape().to_vec(),
                got: bias.shape().to_vec(),
            });
        }
        Ok(Self { weight, bias, eps })
    }

    /// Identity-initialized norm: gamma = 1, beta = 0.
    pub fn with_features(features: usize, eps: f64) -> Result<Self> {
        Self::new(Tensor::ones([features]), Tensor::zeros([features]), scalar(eps)?)
    }

    pub fn forward<const RANK: usize>(&self, x: &Tensor<T, RANK>) -> Result<Tensor<T, RANK>> {
        let last_dim = x.shape()[RANK - 1];
        if last_dim != self.weight.shape()[0] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.weight.shape()[0]],
                got: vec![last_dim],
            });
        }

        let mut out = Tensor::zeros(*x.shape());
        if out.size() == 0 {
            return Ok(out);
        }
        let n: T = scalar(last_dim as f64)?;
        let gamma = self.weight.data();
        let beta = self.bias.data();

        let normalize = |(out_row, in_row): (&mut [T], &[T])| {
            let mean = in_row.iter().fold(T::zero(), |acc, &v| acc + v) / n;
            let var = in_row
                .iter()
                .fold(T::zero(), |acc, &v| acc + (v - mean) * (v - mean))
                / n;
            let rstd = T::one() / (var + self.eps).sqrt();

            for (i, o) in out_row.iter_mut().enumerate() {
                *o = (in_row[i] - mean) * rstd * gamma[i] + beta[i];
            }
        };

        if out.size() < PARALLEL_THRESHOLD {
            out.data_mut()
                .chunks_mut(last_dim)
                .zip(x.data().chunks(last_dim))
                .for_each(normalize);
        } else {
            out.data_mut()
                .par_chunks_mut(last_dim)
                .zip(x.data().par_chunks(last_dim))
                .for_each(normalize);
        }

        Ok(out)
    }
}

impl<T: TensorElem> Module<T> for LayerNorm<T> {
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        vec![
            Parameter::new(ParamKind::NormScale, &self.weight),
            Parameter::new(ParamKind::NormBias, &self.bias),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        vec![
            ParameterMut::new(ParamKind::NormScale, &mut self.weight),
            ParameterMut::new(ParamKind::NormBias, &mut self.bias),
        ]
    }
}
