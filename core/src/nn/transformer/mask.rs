//! Attention masks.
//!
//! A mask is a boolean tensor where `true` means **excluded**: the query at
//! that position may not attend to the key. It is stored in a 4-D shape
//! `[B, H, Lq, Lk]` in which any axis may be `1` and is then broadcast, so the
//! common cases stay small:
//!
//! | constructor                        | stored shape    |
//! |------------------------------------|-----------------|
//! | [`AttentionMask::causal`]          | `[1, 1, L, L]`  |
//! | [`AttentionMask::key_padding`]     | `[B, 1, 1, L]`  |
//! | [`AttentionMask::from_lengths`]    | `[B, 1, 1, L]`  |
//! | [`AttentionMask::new`] with rank 2 | `[1, 1, Lq, Lk]`|

use crate::tensor::{Result, TensorError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionMask {
    data: Vec<bool>,
    shape: [usize; 4],
    strides: [usize; 4],
}

impl AttentionMask {
    /// Builds a mask from a flat row-major buffer of rank 2 (`[Lq, Lk]`) or
    /// rank 4 (`[B|1, H|1, Lq|1, Lk|1]`).
    pub fn new(data: Vec<bool>, shape: &[usize]) -> Result<Self> {
        let shape4 = match *shape {
            [lq, lk] => [1, 1, lq, lk],
            [b, h, lq, lk] => [b, h, lq, lk],
            _ => {
                return Err(TensorError::Unsupported(format!(
                    "attention mask must have rank 2 or 4, got shape {shape:?}"
                )));
            }
        };
        let size: usize = shape4.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        // A broadcast axis contributes nothing to the offset.
        let mut strides = [0; 4];
        let mut stride = 1;
        for axis in (0..4).rev() {
            strides[axis] = if shape4[axis] == 1 { 0 } else { stride };
            stride *= shape4[axis];
        }

        Ok(Self {
            data,
            shape: shape4,
            strides,
        })
    }

    /// Key-padding mask from per-sequence flags, `padding[b][k] == true` marks
    /// key `k` of sequence `b` as padding.
    pub fn key_padding(padding: &[Vec<bool>]) -> Result<Self> {
        let seq_len = padding.first().map_or(0, Vec::len);
        if let Some(row) = padding.iter().find(|row| row.len() != seq_len) {
            return Err(TensorError::ShapeMismatch {
                expected: vec![seq_len],
                got: vec![row.len()],
            });
        }
        let data = padding.iter().flatten().copied().collect();
        Self::new(data, &[padding.len(), 1, 1, seq_len])
    }

    /// Key-padding mask for sequences of the given true lengths, right-padded
    /// to `seq_len`.
    pub fn from_lengths(lengths: &[usize], seq_len: usize) -> Result<Self> {
        if let Some(&len) = lengths.iter().find(|&&len| len > seq_len) {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![len],
                shape: vec![seq_len],
            });
        }
        let data = lengths
            .iter()
            .flat_map(|&len| (0..seq_len).map(move |k| k >= len))
            .collect();
        Self::new(data, &[lengths.len(), 1, 1, seq_len])
    }

    /// Excludes every key after the query position.
    pub fn causal(seq_len: usize) -> Self {
        let data: Vec<bool> = (0..seq_len)
            .flat_map(|q| (0..seq_len).map(move |k| k > q))
            .collect();
        let mut strides = [0, 0, seq_len, 1];
        if seq_len == 1 {
            strides = [0; 4];
        }
        Self {
            data,
            shape: [1, 1, seq_len, seq_len],
            strides,
        }
    }

    pub fn shape(&self) -> &[usize; 4] {
        &self.shape
    }

    /// Checks that the mask broadcasts to scores of shape `[b, h, lq, lk]`.
    pub fn check(&self, b: usize, h: usize, lq: usize, lk: usize) -> Result<()> {
        let target = [b, h, lq, lk];
        let ok = self
            .shape
            .iter()
            .zip(target.iter())
            .all(|(&m, &t)| m == t || m == 1);
        if ok {
            Ok(())
        } else {
            Err(TensorError::ShapeMismatch {
                expected: target.to_vec(),
                got: self.shape.to_vec(),
            })
        }
    }

    /// True if query `q` of (batch `b`, head `h`) may not see key `k`.
    ///
    /// Indices must already be within the checked target shape.
    #[inline]
    pub fn is_masked(&self, b: usize, h: usize, q: usize, k: usize) -> bool {
        let s = &self.strides;
        self.data[b * s[0] + h * s[1] + q * s[2] + k * s[3]]
    }

    /// True if every key is excluded for this query row.
    pub fn is_row_masked(&self, b: usize, h: usize, q: usize, lk: usize) -> bool {
        (0..lk).all(|k| self.is_masked(b, h, q, k))
    }

    /// Restricts the batch axis to `start..start + len`. Broadcast masks are
    /// returned unchanged.
    pub fn narrow_batch(&self, start: usize, len: usize) -> Result<Self> {
        if self.shape[0] == 1 {
            return Ok(self.clone());
        }
        if start + len > self.shape[0] {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start + len],
                shape: self.shape.to_vec(),
            });
        }
        let per_batch: usize = self.shape[1..].iter().product();
        let data = self.data[start * per_batch..(start + len) * per_batch].to_vec();
        let mut shape = self.shape;
        shape[0] = len;
        Self::new(data, &shape)
    }
}
