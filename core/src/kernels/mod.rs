//! Attention-specific kernels that operate on whole tensors.
//!
//! The generic slice kernels (matmul, transpose, row softmax) live in the
//! `encoder-rs-kernels` crate; the routines here know about heads and masks.

pub mod attention;
