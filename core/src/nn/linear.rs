use super::module::{Module, ParamKind, Parameter, ParameterMut};
use crate::tensor::{PARALLEL_THRESHOLD, Result, Tensor, TensorElem, TensorError};
use rayon::prelude::*;

/// Trait to enforce allowed ranks for the Linear forward pass.
pub trait AllowedLinearRank<const N: usize> {}
impl AllowedLinearRank<2> for () {}
impl AllowedLinearRank<3> for () {}

/// Linear layer: `y = x W^T + b`.
///
/// Weights are stored `[out_features, in_features]`, so the forward pass is a
/// single `matmul_transposed` over the flattened leading axes.
///
/// ```rust
/// use encoder_rs::nn::Linear;
/// use encoder_rs::tensor::Tensor;
///
/// let layer = Linear::<f32>::new(Tensor::zeros([5, 10]), Some(Tensor::zeros([5]))).unwrap();
/// let y = layer.forward(&Tensor::<f32, 3>::ones([2, 4, 10])).unwrap();
/// assert_eq!(y.shape(), &[2, 4, 5]);
/// ```
#[derive(Debug, Clone)]
pub struct Linear<T: TensorElem> {
    /// Shape `[out_features, in_features]`.
    pub weight: Tensor<T, 2>,
    /// Shape `[out_features]`.
    pub bias: Option<Tensor<T, 1>>,
}

impl<T: TensorElem> Linear<T> {
    pub fn new(weight: Tensor<T, 2>, bias: Option<Tensor<T, 1>>) -> Result<Self> {
        if let Some(b) = &bias {
            if b.shape()[0] != weight.shape()[0] {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![weight.shape()[0]],
                    got: b.shape().to_vec(),
                });
            }
        }
        Ok(Self { weight, bias })
    }

    /// A zero-initialized layer; real values come from an init pass or a copy.
    pub fn zeros(in_features: usize, out_features: usize, bias: bool) -> Self {
        Self {
            weight: Tensor::zeros([out_features, in_features]),
            bias: bias.then(|| Tensor::zeros([out_features])),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Applies the layer to `[batch, in]` or `[batch, seq, in]` input.
    pub fn forward<const RANK: usize>(&self, x: &Tensor<T, RANK>) -> Result<Tensor<T, RANK>>
    where
        (): AllowedLinearRank<RANK>,
    {
        let in_features = self.in_features();
        let out_features = self.out_features();
        if x.shape()[RANK - 1] != in_features {
            return Err(TensorError::ShapeMismatch {
                expected: vec![in_features],
                got: vec![x.shape()[RANK - 1]],
            });
        }

        let rows = x.size() / in_features.max(1);
        let flat: Tensor<T, 2> = x.clone().reshape([rows, in_features])?;
        let mut out = flat.matmul_transposed(&self.weight)?;

        if let Some(bias) = &self.bias {
            let bias = bias.data();
            let add_bias = |row: &mut [T]| {
                for (o, &b) in row.iter_mut().zip(bias) {
                    *o += b;
                }
            };
            if out.size() < PARALLEL_THRESHOLD {
                out.data_mut().chunks_mut(out_features).for_each(add_bias);
            } else {
                out.data_mut().par_chunks_mut(out_features).for_each(add_bias);
            }
        }

        let mut out_shape = *x.shape();
        out_shape[RANK - 1] = out_features;
        out.reshape(out_shape)
    }
}

impl<T: TensorElem> Module<T> for Linear<T> {
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        let mut params = vec![Parameter::new(ParamKind::LinearWeight, &self.weight)];
        if let Some(b) = &self.bias {
            params.push(Parameter::new(ParamKind::LinearBias, b));
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        let mut params = vec![ParameterMut::new(ParamKind::LinearWeight, &mut self.weight)];
        if let Some(b) = &mut self.bias {
            params.push(ParameterMut::new(ParamKind::LinearBias, b));
        }
        params
    }
}
