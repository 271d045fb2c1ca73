use crate::tensor::{Tensor, TensorElem};
use std::fmt::Debug;

/// What role a parameter plays, which decides how it is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// A `[out, in]` linear weight matrix.
    LinearWeight,
    /// A `[out]` linear bias.
    LinearBias,
    /// A layer-norm scale (gamma).
    NormScale,
    /// A layer-norm shift (beta).
    NormBias,
}

/// Read-only view of one learnable tensor.
#[derive(Debug)]
pub struct Parameter<'a, T: TensorElem> {
    pub kind: ParamKind,
    pub shape: &'a [usize],
    pub data: &'a [T],
}

/// Mutable view of one learnable tensor.
#[derive(Debug)]
pub struct ParameterMut<'a, T: TensorElem> {
    pub kind: ParamKind,
    pub shape: Vec<usize>,
    pub data: &'a mut [T],
}

impl<'a, T: TensorElem> Parameter<'a, T> {
    pub fn new<const RANK: usize>(kind: ParamKind, tensor: &'a Tensor<T, RANK>) -> Self {
        Self {
            kind,
            shape: tensor.shape(),
            data: tensor.data(),
        }
    }
}

impl<'a, T: TensorElem> ParameterMut<'a, T> {
    pub fn new<const RANK: usize>(kind: ParamKind, tensor: &'a mut Tensor<T, RANK>) -> Self {
        let shape = tensor.shape().to_vec();
        Self {
            kind,
            shape,
            data: tensor.data_mut(),
        }
    }
}

/// Common interface of every layer.
///
/// Besides requiring `Send + Sync` (so a model can be shared by worker
/// threads) and `Debug`, a module enumerates its learnable tensors. Both
/// enumerations visit parameters in the same, deterministic order; weight
/// initialization and cross-worker parameter averaging rely on that.
pub trait Module<T: TensorElem>: Debug + Send + Sync {
    fn parameters(&self) -> Vec<Parameter<'_, T>>;

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>>;

    /// Total number of learnable scalars.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.data.len()).sum()
    }
}
