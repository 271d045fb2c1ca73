//! Core Tensor implementation.
//!
//! A [`Tensor`] is a dense, row-major, N-dimensional array whose rank is part
//! of its type. The encoder works almost entirely with three shapes:
//!
//! - `[B, L, E]`: a batch of `B` sequences of `L` tokens, each an `E`-wide embedding.
//! - `[B, H, L, D]`: the same batch split into `H` attention heads of width `D = E / H`.
//! - `[out, in]`: linear-layer weight matrices.
//!
//! ```rust
//! use encoder_rs::tensor::Tensor;
//!
//! let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
//! let tensor = Tensor::<f32, 2>::new(data, [2, 3]).unwrap();
//!
//! assert_eq!(tensor.shape(), &[2, 3]);
//! assert_eq!(tensor.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! ```
//!
//! Storage is always contiguous. Operations that permute axes
//! ([`Tensor::transpose_axes`]) physically move data rather than rewriting
//! strides, so every kernel can assume a flat row-major buffer.

use encoder_rs_kernels::KernelError;
use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod ops;

pub use ops::PARALLEL_THRESHOLD;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Communication failure: {0}")]
    Communication(String),
}

impl From<KernelError> for TensorError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::ShapeMismatch { expected, got } => {
                TensorError::ShapeMismatch { expected, got }
            }
            KernelError::BufferLength { len, shape } => TensorError::ShapeMismatch {
                expected: vec![shape.iter().product()],
                got: vec![len],
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for any type that can be stored in a Tensor.
pub trait TensorElem:
    Num
    + NumAssign
    + Copy
    + Clone
    + Debug
    + Send
    + Sync
    + FromPrimitive
    + ToPrimitive
    + PartialOrd
    + 'static
{
}

impl<T> TensorElem for T where
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
        + 'static
{
}

/// Converts an `f64` constant (a scale, an epsilon, an init bound) into `T`.
pub(crate) fn scalar<T: TensorElem>(value: f64) -> Result<T> {
    T::from_f64(value).ok_or_else(|| {
        TensorError::Unsupported(format!(
            "{value} is not representable as {}",
            std::any::type_name::<T>()
        ))
    })
}

#[derive(Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a tensor from a flat row-major buffer.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::ShapeMismatch`] if `data.len()` is not the
    /// product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
        })
    }

    pub fn full(shape: [usize; RANK], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![value; size],
        }
    }

    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::zero())
    }

    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::one())
    }

    /// Reinterprets the buffer under a new shape with the same element count.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK>> {
        let current_size = self.size();
        let new_size: usize = new_shape.iter().product();

        if current_size != new_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![current_size],
                got: vec![new_size],
            });
        }

        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: self.data,
        })
    }

    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub const fn size(&self) -> usize {
        let mut size = 1;
        let mut i = 0;
        while i < RANK {
            size *= self.shape[i];
            i += 1;
        }
        size
    }

    /// Returns `len` consecutive entries of the leading axis starting at `start`.
    ///
    /// Because storage is row-major this is a single contiguous copy.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        const { assert!(RANK >= 1, "narrow requires rank >= 1") };
        if start + len > self.shape[0] {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start + len],
                shape: self.shape.to_vec(),
            });
        }
        let row = self.strides[0];
        let mut shape = self.shape;
        shape[0] = len;
        Self::new(self.data[start * row..(start + len) * row].to_vec(), shape)
    }

    /// Concatenates tensors along the leading axis.
    ///
    /// All trailing dimensions must agree.
    pub fn concat(parts: &[Self]) -> Result<Self> {
        const { assert!(RANK >= 1, "concat requires rank >= 1") };
        let Some(first) = parts.first() else {
            return Err(TensorError::Unsupported(
                "concat of zero tensors".to_string(),
            ));
        };

        let mut shape = first.shape;
        shape[0] = 0;
        let mut data = Vec::with_capacity(parts.iter().map(Self::size).sum());
        for part in parts {
            if part.shape[1..] != first.shape[1..] {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape.to_vec(),
                    got: part.shape.to_vec(),
                });
            }
            shape[0] += part.shape[0];
            data.extend_from_slice(&part.data);
        }
        Self::new(data, shape)
    }
}

pub(crate) const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T, const RANK: usize> Debug for Tensor<T, RANK>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data_len", &self.data.len())
            .finish()
    }
}
