//! Tensor operations.
//!
//! Element-wise arithmetic, matrix products and axis permutations. Shapes must
//! match exactly for element-wise operations; there is no implicit
//! broadcasting. Work is split across threads with `rayon` once a tensor is
//! larger than [`PARALLEL_THRESHOLD`] elements, and runs serially below that.
//!
//! ```rust
//! use encoder_rs::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//!
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Result, Tensor, TensorElem, TensorError, compute_strides};

pub use encoder_rs_kernels::PARALLEL_THRESHOLD;
use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic trait (e.g., `Add`) for `&Tensor`.
///
/// Checks that shapes agree, then applies the operation element-wise.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                if out.data.len() < PARALLEL_THRESHOLD {
                    for ((o, a), b) in out.data.iter_mut().zip(&self.data).zip(&rhs.data) {
                        *o = a.$method(*b);
                    }
                } else {
                    out.data
                        .par_iter_mut()
                        .zip(self.data.par_iter())
                        .zip(rhs.data.par_iter())
                        .for_each(|((o, a), b)| *o = a.$method(*b));
                }

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies `f` element-wise, producing a new tensor of the same shape.
    ///
    /// ```rust
    /// use encoder_rs::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// assert_eq!(t.map(|x| x * x).data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = self.clone();
        out.map_inplace(f);
        out
    }

    /// Applies `f` to every element in place.
    pub fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(T) -> T + Sync + Send,
    {
        if self.data.len() < PARALLEL_THRESHOLD {
            self.data.iter_mut().for_each(|v| *v = f(*v));
        } else {
            self.data.par_iter_mut().for_each(|v| *v = f(*v));
        }
    }

    /// In-place element-wise addition, used for residual connections.
    pub fn add_assign(&mut self, rhs: &Self) -> Result<()> {
        if self.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }
        if self.data.len() < PARALLEL_THRESHOLD {
            for (o, r) in self.data.iter_mut().zip(&rhs.data) {
                *o += *r;
            }
        } else {
            self.data
                .par_iter_mut()
                .zip(rhs.data.par_iter())
                .for_each(|(o, r)| *o += *r);
        }
        Ok(())
    }

    /// Batched matrix multiplication over the last two axes.
    ///
    /// - Rank 2: `[M, K] x [K, N] -> [M, N]`
    /// - Rank 3: `[B, M, K] x [B, K, N] -> [B, M, N]`
    /// - Rank 4: `[B, H, M, K] x [B, H, K, N] -> [B, H, M, N]`
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };
        let out_data =
            encoder_rs_kernels::cpu_matmul(&self.data, &rhs.data, &self.shape, &rhs.shape)?;

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 1];
        Tensor::new(out_data, out_shape)
    }

    /// Batched `self x rhs^T` over the last two axes: `[..., M, K] x [..., N, K] -> [..., M, N]`.
    ///
    /// Linear layers store weights as `[out, in]` and attention scores are
    /// `Q K^T`; both are this product without a materialized transpose.
    pub fn matmul_transposed(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };
        let out_data = encoder_rs_kernels::cpu_matmul_transposed(
            &self.data,
            &rhs.data,
            &self.shape,
            &rhs.shape,
        )?;

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 2];
        Tensor::new(out_data, out_shape)
    }

    /// Swaps the last two axes.
    pub fn transpose(&self) -> Result<Self> {
        if RANK < 2 {
            return Err(TensorError::Unsupported(
                "Transpose requires rank >= 2".into(),
            ));
        }
        let out_data = encoder_rs_kernels::cpu_transpose(&self.data, &self.shape)?;
        let mut new_shape = self.shape;
        new_shape.swap(RANK - 1, RANK - 2);
        Tensor::new(out_data, new_shape)
    }

    /// Swaps two arbitrary axes, physically permuting the data.
    ///
    /// The multi-head split `[B, L, H, D] -> [B, H, L, D]` is `transpose_axes(1, 2)`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` if `ax1` or `ax2` is not an axis.
    pub fn transpose_axes(&self, ax1: usize, ax2: usize) -> Result<Self> {
        if ax1 >= RANK || ax2 >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![ax1, ax2],
                shape: self.shape.to_vec(),
            });
        }
        if ax1 == ax2 {
            return Ok(self.clone());
        }

        let mut new_shape = self.shape;
        new_shape.swap(ax1, ax2);
        let mut out = Tensor::zeros(new_shape);
        if out.data.is_empty() {
            return Ok(out);
        }

        // Input stride seen by each output axis.
        let mut mapped = self.strides;
        mapped.swap(ax1, ax2);
        let last = new_shape[RANK - 1];
        let input = &self.data;

        let fill_row = |(row, chunk): (usize, &mut [T])| {
            let mut rem = row;
            let mut base = 0;
            for d in (0..RANK - 1).rev() {
                base += (rem % new_shape[d]) * mapped[d];
                rem /= new_shape[d];
            }
            for (i, o) in chunk.iter_mut().enumerate() {
                *o = input[base + i * mapped[RANK - 1]];
            }
        };

        if out.data.len() < PARALLEL_THRESHOLD {
            out.data.chunks_mut(last).enumerate().for_each(fill_row);
        } else {
            out.data.par_chunks_mut(last).enumerate().for_each(fill_row);
        }

        debug_assert_eq!(out.strides, compute_strides(&new_shape));
        Ok(out)
    }
}
