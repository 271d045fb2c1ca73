use crate::{KernelElem, PARALLEL_THRESHOLD, Result, check_len};
use rayon::prelude::*;

/// Swaps the last two axes of a row-major buffer.
///
/// The output is written row by row, so each worker owns one contiguous output
/// row and gathers a strided column of the input into it.
pub fn cpu_transpose<T, const RANK: usize>(data: &[T], shape: &[usize; RANK]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    check_len(data, shape)?;
    let m = shape[RANK - 2];
    let n = shape[RANK - 1];
    let mut out_data = vec![T::zero(); data.len()];
    if m == 0 || n == 0 {
        return Ok(out_data);
    }

    // Output is [Batch..., N, M], viewed as `batch * N` rows of length M.
    let fill_row = |(i, out_row): (usize, &mut [T])| {
        let batch_offset = (i / n) * m * n;
        let col = i % n;
        for (r, out_elem) in out_row.iter_mut().enumerate() {
            *out_elem = data[batch_offset + r * n + col];
        }
    };

    if out_data.len() < PARALLEL_THRESHOLD {
        out_data.chunks_mut(m).enumerate().for_each(fill_row);
    } else {
        out_data.par_chunks_mut(m).enumerate().for_each(fill_row);
    }

    Ok(out_data)
}
