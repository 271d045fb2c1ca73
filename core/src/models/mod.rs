//! Encoder models.
//!
//! - [`encoder::EncoderStack`]: positional embedding plus a stack of pre-norm
//!   encoder blocks, weights left at zero.
//! - [`encoder::OptimizedEncoder`]: the same stack with seeded
//!   initialization and activation checkpointing.
//!
//! Both implement [`traits::Encoder`].
//!
//! ```rust
//! use encoder_rs::models::encoder::{EncoderConfig, OptimizedEncoder};
//! use encoder_rs::models::traits::Encoder;
//! use encoder_rs::nn::transformer::AttentionMask;
//! use encoder_rs::tensor::Tensor;
//!
//! let config = EncoderConfig::new(2, 4, 16, 0.1);
//! let encoder = OptimizedEncoder::<f32>::new(config).unwrap();
//!
//! // Two sequences of length 6; the second has two padding positions.
//! let x = Tensor::<f32, 3>::ones([2, 6, 16]);
//! let mask = AttentionMask::from_lengths(&[6, 4], 6).unwrap();
//!
//! let y = encoder.forward(&x, Some(&mask), false).unwrap();
//! assert_eq!(y.shape(), &[2, 6, 16]);
//! ```

pub mod encoder;
pub mod traits;
