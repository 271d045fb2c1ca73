//! Transformer encoder building blocks.
//!
//! # Components
//!
//! - **Attention**: two interchangeable implementations of [`AttentionKernel`].
//!   - [`ReferenceAttention`]: separate Q/K/V projections and an explicit score matrix.
//!   - [`FusedAttention`]: one fused QKV projection and a flash kernel.
//! - **Masks**: [`AttentionMask`], boolean and broadcastable, `true` = excluded.
//! - **Positions**: [`SinusoidalPositionalEmbedding`], a fixed table.
//! - **Feed-forward**: [`FeedForward`], `E -> 4E -> E` with GELU.

pub mod attention;
pub mod attention_fused;
pub mod feed_forward;
pub mod mask;
pub mod positional;

pub use attention::{AttentionKernel, ReferenceAttention, scaled_dot_product_attention};
pub use attention_fused::FusedAttention;
pub use feed_forward::FeedForward;
pub use mask::AttentionMask;
pub use positional::SinusoidalPositionalEmbedding;
