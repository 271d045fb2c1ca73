use crate::{KernelElem, KernelError, PARALLEL_THRESHOLD, Result};
use num_traits::Float;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-place, numerically stable softmax over consecutive rows of `row_len`.
///
/// Masked positions are expected to already hold `-inf`. A row in which every
/// position is `-inf` has no valid key to attend to; it is written as all
/// zeros instead of NaN. Returns the number of such rows.
pub fn cpu_softmax_rows<T>(data: &mut [T], row_len: usize) -> Result<usize>
where
    T: KernelElem + Float,
{
    if row_len == 0 {
        return Ok(0);
    }
    if data.len() % row_len != 0 {
        return Err(KernelError::BufferLength {
            len: data.len(),
            shape: vec![data.len() / row_len, row_len],
        });
    }

    let empty_rows = AtomicUsize::new(0);
    let normalize = |row: &mut [T]| {
        let max = row.iter().copied().fold(T::neg_infinity(), T::max);
        if max == T::neg_infinity() {
            row.iter_mut().for_each(|v| *v = T::zero());
            empty_rows.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut sum = T::zero();
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    };

    if data.len() < PARALLEL_THRESHOLD {
        data.chunks_mut(row_len).for_each(normalize);
    } else {
        data.par_chunks_mut(row_len).for_each(normalize);
    }

    Ok(empty_rows.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut data = vec![1.0f32, 2.0, 3.0, 0.0, 0.0, 0.0];
        let empty = cpu_softmax_rows(&mut data, 3).unwrap();
        assert_eq!(empty, 0);
        for row in data.chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert!((data[3] - 1.0 / 3.0).abs() < 1e-6);
        assert!(data[2] > data[1] && data[1] > data[0]);
    }

    #[test]
    fn test_softmax_is_shift_invariant() {
        let mut small = vec![0.1f64, 0.2, 0.3];
        let mut large = vec![1000.1f64, 1000.2, 1000.3];
        cpu_softmax_rows(&mut small, 3).unwrap();
        cpu_softmax_rows(&mut large, 3).unwrap();
        for (a, b) in small.iter().zip(&large) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_softmax_masked_positions_get_zero() {
        let ninf = f32::NEG_INFINITY;
        let mut data = vec![0.5f32, ninf, 0.5, ninf];
        cpu_softmax_rows(&mut data, 4).unwrap();
        assert_eq!(data[1], 0.0);
        assert_eq!(data[3], 0.0);
        assert!((data[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_fully_masked_row_is_zero() {
        let ninf = f32::NEG_INFINITY;
        let mut data = vec![ninf, ninf, 1.0, 1.0];
        let empty = cpu_softmax_rows(&mut data, 2).unwrap();
        assert_eq!(empty, 1);
        assert_eq!(&data[..2], &[0.0, 0.0]);
        assert!(data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_softmax_rejects_ragged_buffer() {
        let mut data = vec![1.0f32; 5];
        assert!(cpu_softmax_rows(&mut data, 2).is_err());
    }
}
