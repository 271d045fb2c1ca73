//! Slice-level CPU kernels used by `encoder-rs`.
//!
//! Kernels operate on flat row-major buffers plus an explicit shape. They know
//! nothing about the tensor type that owns the buffer, which keeps this crate
//! free of circular dependencies and makes each routine easy to swap for a BLAS
//! call later.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_matmul;
pub mod cpu_softmax;
pub mod cpu_transpose;

pub use cpu_matmul::{cpu_matmul, cpu_matmul_transposed};
pub use cpu_softmax::cpu_softmax_rows;
pub use cpu_transpose::cpu_transpose;

/// Below this many output elements kernels run on the calling thread.
pub const PARALLEL_THRESHOLD: usize = 4096;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Buffer of length {len} does not match shape {shape:?}")]
    BufferLength { len: usize, shape: Vec<usize> },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

pub(crate) fn check_len<const RANK: usize>(data: &[impl Sized], shape: &[usize; RANK]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(KernelError::BufferLength {
            len: data.len(),
            shape: shape.to_vec(),
        });
    }
    Ok(())
}
