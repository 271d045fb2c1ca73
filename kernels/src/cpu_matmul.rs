use crate::{KernelElem, KernelError, PARALLEL_THRESHOLD, Result, check_len};
use rayon::prelude::*;

/// Batched matrix multiplication: `[..., M, K] x [..., K, N] -> [..., M, N]`.
///
/// The right-hand side is transposed once up front so the inner loop reads two
/// contiguous rows, then the work is handed to [`cpu_matmul_transposed`].
/// Leading (batch) axes must match exactly; there is no broadcasting.
pub fn cpu_matmul<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let k = lhs_shape[RANK - 1];
    if k != rhs_shape[RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[RANK - 2]],
        });
    }

    // rhs is [..., K, N]; the transposed kernel wants [..., N, K].
    let rhs_t_data = crate::cpu_transpose(rhs_data, rhs_shape)?;
    let mut rhs_t_shape = *rhs_shape;
    rhs_t_shape.swap(RANK - 2, RANK - 1);

    cpu_matmul_transposed(lhs_data, &rhs_t_data, lhs_shape, &rhs_t_shape)
}

/// Batched `lhs x rhs^T`: `[..., M, K] x [..., N, K] -> [..., M, N]`.
///
/// This is the shape linear layers (`x W^T`) and attention scores (`Q K^T`)
/// naturally come in, so neither needs a materialized transpose.
pub fn cpu_matmul_transposed<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    check_len(lhs_data, lhs_shape)?;
    check_len(rhs_data, rhs_shape)?;

    let m = lhs_shape[RANK - 2];
    let k = lhs_shape[RANK - 1];
    let n = rhs_shape[RANK - 2];

    if k != rhs_shape[RANK - 1] {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[RANK - 1]],
        });
    }
    if lhs_shape[..RANK - 2] != rhs_shape[..RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: lhs_shape[..RANK - 2].to_vec(),
            got: rhs_shape[..RANK - 2].to_vec(),
        });
    }

    let batch: usize = lhs_shape[..RANK - 2].iter().product();
    let mut out_data = vec![T::zero(); batch * m * n];
    if out_data.is_empty() {
        return Ok(out_data);
    }

    // One output row per task: (batch, row) flattened into `global_row`.
    let fill_row = |(global_row, out_row): (usize, &mut [T])| {
        let batch_idx = global_row / m;
        let a_start = global_row * k;
        let a_row = &lhs_data[a_start..a_start + k];
        let b_batch = batch_idx * n * k;

        for (col, out_elem) in out_row.iter_mut().enumerate() {
            let b_start = b_batch + col * k;
            let b_row = &rhs_data[b_start..b_start + k];
            let mut sum = T::zero();
            for (&a, &b) in a_row.iter().zip(b_row) {
                sum += a * b;
            }
            *out_elem = sum;
        }
    };

    if out_data.len() * k < PARALLEL_THRESHOLD {
        out_data.chunks_mut(n).enumerate().for_each(fill_row);
    } else {
        out_data.par_chunks_mut(n).enumerate().for_each(fill_row);
    }

    Ok(out_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_simple() {
        let a = vec![1.0, 2.0, 3.0, 4.0]; // 2x2
        let b = vec![5.0, 6.0, 7.0, 8.0]; // 2x2
        let result = cpu_matmul(&a, &b, &[2, 2], &[2, 2]).unwrap();
        // [1*5+2*7, 1*6+2*8] = [19, 22]
        // [3*5+4*7, 3*6+4*8] = [43, 50]
        assert_eq!(result, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_batch() {
        let a = vec![
            1.0, 0.0, 0.0, 1.0, // Identity
            2.0, 0.0, 0.0, 2.0, // Scaled Identity
        ];
        let b = vec![
            1.0, 2.0, 3.0, 4.0, // B1
            5.0, 6.0, 7.0, 8.0, // B2
        ];
        let result = cpu_matmul(&a, &b, &[2, 2, 2], &[2, 2, 2]).unwrap();
        assert_eq!(result, vec![1.0, 2.0, 3.0, 4.0, 10.0, 12.0, 14.0, 16.0]);
    }

    #[test]
    fn test_matmul_rectangular() {
        // [1, 3] x [3, 2]
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let result = cpu_matmul(&a, &b, &[1, 3], &[3, 2]).unwrap();
        assert_eq!(result, vec![4.0, 5.0]);
    }

    #[test]
    fn test_matmul_transposed_matches_matmul() {
        // x: [2, 3], w: [4, 3]  ->  x w^T: [2, 4]
        let x: Vec<f64> = (0..6).map(|v| v as f64 * 0.5).collect();
        let w: Vec<f64> = (0..12).map(|v| (v as f64 - 6.0) * 0.25).collect();
        let direct = cpu_matmul_transposed(&x, &w, &[2, 3], &[4, 3]).unwrap();

        let w_t = crate::cpu_transpose(&w, &[4, 3]).unwrap();
        let via_matmul = cpu_matmul(&x, &w_t, &[2, 3], &[3, 4]).unwrap();
        assert_eq!(direct, via_matmul);
    }

    #[test]
    fn test_matmul_parallel_path() {
        let n = 72;
        let a = vec![1.0f32; n * n];
        let b = vec![2.0f32; n * n];
        let result = cpu_matmul(&a, &b, &[n, n], &[n, n]).unwrap();
        assert!(result.iter().all(|&v| (v - 2.0 * n as f32).abs() < 1e-3));
    }

    #[test]
    fn test_matmul_shape_mismatch() {
        let a = vec![1.0; 4]; // 2x2
        let b = vec![1.0; 6]; // 3x2
        let err = cpu_matmul(&a, &b, &[2, 2], &[3, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_matmul_batch_mismatch() {
        let a = vec![1.0; 8];
        let b = vec![1.0; 12];
        let err = cpu_matmul_transposed(&a, &b, &[2, 2, 2], &[3, 2, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
