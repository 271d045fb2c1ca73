//! # encoder-rs
//!
//! `encoder-rs` is a pure Rust, CPU-only transformer encoder: multi-head
//! self-attention with sinusoidal positions, pre-norm residual blocks, an
//! initialized and checkpointing wrapper, and data-parallel replication
//! across threads.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: dense row-major N-dimensional tensor.
//! - [`kernels`]: fused attention kernels (QKV split, head split/merge, flash attention).
//! - [`nn`]: layers (Linear, LayerNorm, GELU, Dropout) and transformer building blocks.
//! - [`models`]: the encoder stack and its optimized wrapper.
//! - [`distributed`]: collective backends and the replication factory.
//!
//! ## Example
//!
//! ```rust
//! use encoder_rs::models::encoder::{EncoderConfig, OptimizedEncoder};
//! use encoder_rs::models::traits::Encoder;
//! use encoder_rs::tensor::Tensor;
//!
//! let encoder = OptimizedEncoder::<f32>::new(EncoderConfig::new(2, 4, 32, 0.1)).unwrap();
//! let x = Tensor::<f32, 3>::ones([2, 10, 32]);
//!
//! let y = encoder.forward(&x, None, false).unwrap();
//! assert_eq!(y.shape(), x.shape());
//! ```

pub mod distributed;
pub mod kernels;
pub mod models;
pub mod nn;
pub mod tensor;

pub use models::encoder::{EncoderConfig, EncoderStack, OptimizedEncoder};
pub use models::traits::Encoder;
pub use nn::Mode;
pub use nn::transformer::AttentionMask;
pub use tensor::{Tensor, TensorElem, TensorError};
