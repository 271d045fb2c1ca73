use crate::nn::transformer::mask::AttentionMask;
use crate::tensor::{PARALLEL_THRESHOLD, Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Keys scored per step of the flash kernel.
pub const KEY_BLOCK: usize = 64;

pub type SplitQKVOutput<T> = (Tensor<T, 3>, Tensor<T, 3>, Tensor<T, 3>);

/// Splits a fused `[B, L, 3E]` projection into `q`, `k`, `v`, each `[B, L, E]`.
pub fn split_qkv<T: TensorElem>(qkv: &Tensor<T, 3>, embed_dim: usize) -> Result<SplitQKVOutput<T>> {
    let [b, l, total_dim] = *qkv.shape();
    if total_dim != 3 * embed_dim {
        return Err(TensorError::ShapeMismatch {
            expected: vec![3 * embed_dim],
            got: vec![total_dim],
        });
    }

    let mut q = Tensor::zeros([b, l, embed_dim]);
    let mut k = Tensor::zeros([b, l, embed_dim]);
    let mut v = Tensor::zeros([b, l, embed_dim]);
    if qkv.size() == 0 {
        return Ok((q, k, v));
    }

    let qkv_data = qkv.data();
    #[allow(clippy::type_complexity)]
    let split_fn = |(i, ((q_row, k_row), v_row)): (usize, ((&mut [T], &mut [T]), &mut [T]))| {
        let src = &qkv_data[i * total_dim..(i + 1) * total_dim];
        q_row.copy_from_slice(&src[..embed_dim]);
        k_row.copy_from_slice(&src[embed_dim..2 * embed_dim]);
        v_row.copy_from_slice(&src[2 * embed_dim..]);
    };

    if qkv.size() >= PARALLEL_THRESHOLD {
        q.data_mut()
            .par_chunks_mut(embed_dim)
            .zip(k.data_mut().par_chunks_mut(embed_dim))
            .zip(v.data_mut().par_chunks_mut(embed_dim))
            .enumerate()
            .for_each(split_fn);
    } else {
        q.data_mut()
            .chunks_mut(embed_dim)
            .zip(k.data_mut().chunks_mut(embed_dim))
            .zip(v.data_mut().chunks_mut(embed_dim))
            .enumerate()
            .for_each(split_fn);
    }

    Ok((q, k, v))
}

/// Fuses `[B, L, H*D] -> [B, L, H, D] -> [B, H, L, D]` into one copy.
pub fn split_heads<T: TensorElem>(x: &Tensor<T, 3>, num_heads: usize) -> Result<Tensor<T, 4>> {
    let [b, l, e] = *x.shape();
    if num_heads == 0 || e % num_heads != 0 {
        return Err(TensorError::Configuration(format!(
            "embedding dim {e} is not divisible into {num_heads} heads"
        )));
    }
    let d = e / num_heads;
    let mut out = Tensor::zeros([b, num_heads, l, d]);
    if out.size() == 0 {
        return Ok(out);
    }

    let x_data = x.data();
    let copy_head = |(i, out_head): (usize, &mut [T])| {
        let batch = i / num_heads;
        let head = i % num_heads;
        for t in 0..l {
            let src = batch * l * e + t * e + head * d;
            out_head[t * d..(t + 1) * d].copy_from_slice(&x_data[src..src + d]);
        }
    };

    if out.size() >= PARALLEL_THRESHOLD {
        out.data_mut().par_chunks_mut(l * d).enumerate().for_each(copy_head);
    } else {
        out.data_mut().chunks_mut(l * d).enumerate().for_each(copy_head);
    }
    Ok(out)
}

/// Inverse of [`split_heads`]: `[B, H, L, D] -> [B, L, H*D]`.
pub fn merge_heads<T: TensorElem>(x: &Tensor<T, 4>) -> Result<Tensor<T, 3>> {
    let [b, h, l, d] = *x.shape();
    let e = h * d;
    let mut out = Tensor::zeros([b, l, e]);
    if out.size() == 0 {
        return Ok(out);
    }

    let x_data = x.data();
    let gather_token = |(i, out_token): (usize, &mut [T])| {
        let batch = i / l;
        let t = i % l;
        for head in 0..h {
            let src = ((batch * h + head) * l + t) * d;
            out_token[head * d..(head + 1) * d].copy_from_slice(&x_data[src..src + d]);
        }
    };

    if out.size() >= PARALLEL_THRESHOLD {
        out.data_mut().par_chunks_mut(e).enumerate().for_each(gather_token);
    } else {
        out.data_mut().chunks_mut(e).enumerate().for_each(gather_token);
    }
    Ok(out)
}

/// Result of [`flash_attention`].
#[derive(Debug)]
pub struct FlashOutput<T: TensorElem> {
    /// `[B, Lq, H*D]`, ready for the output projection.
    pub output: Tensor<T, 3>,
    /// `(batch, head, query)` rows with no visible key; their output is zero.
    pub masked_rows: usize,
}

/// Memory-efficient attention.
///
/// Each query row walks the keys in blocks of [`KEY_BLOCK`], keeping a running
/// maximum `m`, normalizer `l` and weighted sum of values. When a block raises
/// the maximum, the previous `l` and sum are rescaled by `exp(m_old - m_new)`.
/// Peak scratch memory per row is one block of scores plus one `D`-vector; the
/// `[Lq, Lk]` score matrix is never built.
pub fn flash_attention<T: TensorElem + Float>(
    q: &Tensor<T, 4>,
    k: &Tensor<T, 4>,
    v: &Tensor<T, 4>,
    mask: Option<&AttentionMask>,
    scale: T,
) -> Result<FlashOutput<T>> {
    let [b, h, lq, d] = *q.shape();
    let lk = k.shape()[2];
    if k.shape() != v.shape() || k.shape()[0] != b || k.shape()[1] != h || k.shape()[3] != d {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, h, lk, d],
            got: v.shape().to_vec(),
        });
    }
    if let Some(mask) = mask {
        mask.check(b, h, lq, lk)?;
    }

    let mut output = Tensor::zeros([b, lq, h * d]);
    if output.size() == 0 {
        return Ok(FlashOutput {
            output,
            masked_rows: 0,
        });
    }

    let (q_data, k_data, v_data) = (q.data(), k.data(), v.data());
    let masked_rows = AtomicUsize::new(0);

    let attend_token = |(i, out_token): (usize, &mut [T])| {
        let batch = i / lq;
        let qi = i % lq;
        let mut scores = [T::zero(); KEY_BLOCK];
        let mut acc = vec![T::zero(); d];

        for head in 0..h {
            let bh = batch * h + head;
            let q_vec = &q_data[(bh * lq + qi) * d..(bh * lq + qi + 1) * d];
            let kv_base = bh * lk * d;

            let mut m = T::neg_infinity();
            let mut l = T::zero();
            acc.iter_mut().for_each(|a| *a = T::zero());

            for start in (0..lk).step_by(KEY_BLOCK) {
                let end = (start + KEY_BLOCK).min(lk);
                let mut block_max = T::neg_infinity();

                for (slot, kj) in scores.iter_mut().zip(start..end) {
                    if mask.is_some_and(|mk| mk.is_masked(batch, head, qi, kj)) {
                        *slot = T::neg_infinity();
                        continue;
                    }
                    let k_vec = &k_data[kv_base + kj * d..kv_base + (kj + 1) * d];
                    let dot = q_vec
                        .iter()
                        .zip(k_vec)
                        .fold(T::zero(), |s, (&a, &b)| s + a * b);
                    *slot = dot * scale;
                    block_max = block_max.max(*slot);
                }
                if block_max == T::neg_infinity() {
                    continue;
                }

                let m_new = m.max(block_max);
                let correction = (m - m_new).exp();
                l *= correction;
                acc.iter_mut().for_each(|a| *a *= correction);

                for (&s, kj) in scores.iter().zip(start..end) {
                    if s == T::neg_infinity() {
                        continue;
                    }
                    let p = (s - m_new).exp();
                    l += p;
                    let v_vec = &v_data[kv_base + kj * d..kv_base + (kj + 1) * d];
                    for (a, &vv) in acc.iter_mut().zip(v_vec) {
                        *a += p * vv;
                    }
                }
                m = m_new;
            }

            let out_head = &mut out_token[head * d..(head + 1) * d];
            if l == T::zero() {
                out_head.iter_mut().for_each(|o| *o = T::zero());
                masked_rows.fetch_add(1, Ordering::Relaxed);
            } else {
                for (o, &a) in out_head.iter_mut().zip(&acc) {
                    *o = a / l;
                }
            }
        }
    };

    if output.size() * lk >= PARALLEL_THRESHOLD {
        output
            .data_mut()
            .par_chunks_mut(h * d)
            .enumerate()
            .for_each(attend_token);
    } else {
        output
            .data_mut()
            .chunks_mut(h * d)
            .enumerate()
            .for_each(attend_token);
    }

    Ok(FlashOutput {
        output,
        masked_rows: masked_rows.into_inner(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor_seq<const R: usize>(shape: [usize; R]) -> Tensor<f32, R> {
        let size = shape.iter().product();
        let data = (0..size).map(|i| (i as f32 * 0.37).sin()).collect();
        Tensor::new(data, shape).unwrap()
    }

    #[test]
    fn test_split_qkv() -> Result<()> {
        // One token, E = 2: [q0 q1 k0 k1 v0 v1]
        let qkv = Tensor::<f32, 3>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [1, 1, 6])?;
        let (q, k, v) = split_qkv(&qkv, 2)?;
        assert_eq!(q.data(), &[1.0, 2.0]);
        assert_eq!(k.data(), &[3.0, 4.0]);
        assert_eq!(v.data(), &[5.0, 6.0]);
        assert!(split_qkv(&qkv, 3).is_err());
        Ok(())
    }

    #[test]
    fn test_split_heads_matches_reshape_transpose() -> Result<()> {
        let x = tensor_seq([2, 3, 8]);
        let fused = split_heads(&x, 4)?;
        let reference = x.clone().reshape([2, 3, 4, 2])?.transpose_axes(1, 2)?;
        assert_eq!(fused, reference);
        assert_eq!(merge_heads(&fused)?, x);
        assert!(split_heads(&x, 3).is_err());
        Ok(())
    }

    #[test]
    fn test_flash_single_key_returns_value() -> Result<()> {
        // With one key the softmax weight is 1, so the output is that value.
        let q = tensor_seq([1, 1, 2, 3]);
        let k = tensor_seq([1, 1, 1, 3]);
        let v = Tensor::<f32, 4>::new(vec![0.5, -1.0, 2.0], [1, 1, 1, 3])?;
        let out = flash_attention(&q, &k, &v, None, 0.5)?;
        assert_eq!(out.output.shape(), &[1, 2, 3]);
        for row in out.output.data().chunks(3) {
            for (a, b) in row.iter().zip(v.data()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn test_flash_matches_naive_softmax_across_blocks() -> Result<()> {
        // Lk spans several key blocks so the running rescale is exercised.
        let (b, h, lq, lk, d) = (1, 2, 3, KEY_BLOCK * 2 + 5, 4);
        let q = tensor_seq([b, h, lq, d]);
        let k = tensor_seq([b, h, lk, d]).map(|x| x * 3.0);
        let v = tensor_seq([b, h, lk, d]).map(|x| x + 1.0);
        let scale = 0.5f32;
        let out = flash_attention(&q, &k, &v, None, scale)?;

        for head in 0..h {
            for qi in 0..lq {
                let qv = &q.data()[((head * lq) + qi) * d..][..d];
                let scores: Vec<f64> = (0..lk)
                    .map(|kj| {
                        let kv = &k.data()[((head * lk) + kj) * d..][..d];
                        qv.iter().zip(kv).map(|(a, b)| (a * b) as f64).sum::<f64>() * scale as f64
                    })
                    .collect();
                let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
                let sum: f64 = exps.iter().sum();
                for c in 0..d {
                    let expected: f64 = (0..lk)
                        .map(|kj| exps[kj] / sum * v.data()[((head * lk) + kj) * d + c] as f64)
                        .sum();
                    let got = out.output.data()[qi * h * d + head * d + c] as f64;
                    assert!((got - expected).abs() < 1e-4, "{got} vs {expected}");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_flash_fully_masked_rows_are_zero() -> Result<()> {
        let q = tensor_seq([2, 1, 2, 2]);
        let k = tensor_seq([2, 1, 2, 2]);
        let v = Tensor::<f32, 4>::ones([2, 1, 2, 2]);
        let mask = AttentionMask::from_lengths(&[2, 0], 2)?;
        let out = flash_attention(&q, &k, &v, Some(&mask), 1.0)?;

        assert_eq!(out.masked_rows, 2);
        assert!(out.output.data()[..4].iter().all(|x| (x - 1.0).abs() < 1e-6));
        assert_eq!(&out.output.data()[4..], &[0.0; 4]);
        Ok(())
    }

    #[test]
    fn test_flash_rejects_bad_mask() {
        let q = tensor_seq([1, 1, 2, 2]);
        let mask = AttentionMask::causal(3);
        assert!(flash_attention(&q, &q, &q, Some(&mask), 1.0).is_err());
    }
}
