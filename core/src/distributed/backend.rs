use crate::tensor::{Result, Tensor, TensorElem, TensorError};

/// Abstraction for a collective communication backend.
///
/// Every worker of a group holds one backend value and calls the same
/// sequence of collectives; a collective returns once every worker has
/// contributed.
pub trait CollectiveBackend: Send + Sync {
    /// Returns the rank of the current worker.
    fn rank(&self) -> usize;

    /// Returns the total number of workers.
    fn world_size(&self) -> usize;

    /// Element-wise sum of `tensor` over all workers. Every worker receives
    /// the same result.
    fn all_reduce_sum<T: TensorElem>(&self, tensor: &Tensor<T, 2>) -> Result<Tensor<T, 2>>;

    /// Concatenates every worker's tensor along `dim` (0 or 1), in rank order.
    ///
    /// The contributions may differ in size along `dim` but must agree on the
    /// other axis.
    fn all_gather<T: TensorElem>(&self, tensor: &Tensor<T, 2>, dim: usize) -> Result<Tensor<T, 2>>;
}

pub(crate) fn check_gather_dim(dim: usize) -> Result<()> {
    if dim > 1 {
        return Err(TensorError::IndexOutOfBounds {
            index: vec![dim],
            shape: vec![2],
        });
    }
    Ok(())
}

/// A group of one. Collectives return their input.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl CollectiveBackend for LocalBackend {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum<T: TensorElem>(&self, tensor: &Tensor<T, 2>) -> Result<Tensor<T, 2>> {
        Ok(tensor.clone())
    }

    fn all_gather<T: TensorElem>(&self, tensor: &Tensor<T, 2>, dim: usize) -> Result<Tensor<T, 2>> {
        check_gather_dim(dim)?;
        Ok(tensor.clone())
    }
}
