use crate::nn::activation::GeluApproximation;
use crate::nn::transformer::positional::DEFAULT_MAX_LEN;
use crate::tensor::{Result, TensorError};
use serde::{Deserialize, Serialize};

/// Hyper-parameters of an encoder stack.
///
/// Missing fields fall back to [`EncoderConfig::base`] when deserializing.
///
/// ```rust
/// use encoder_rs::models::encoder::EncoderConfig;
///
/// let config = EncoderConfig::new(2, 4, 64, 0.0).with_fused_attention(true);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.head_dim(), 16);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub num_layers: usize,
    pub num_heads: usize,
    pub embedding_dim: usize,
    pub dropout: f64,
    pub max_len: usize,
    pub layer_norm_eps: f64,
    pub use_fused_attention: bool,
    pub use_checkpointing: bool,
    pub gelu: GeluApproximation,
    pub init_seed: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::base()
    }
}

impl EncoderConfig {
    pub fn new(num_layers: usize, num_heads: usize, embedding_dim: usize, dropout: f64) -> Self {
        Self {
            num_layers,
            num_heads,
            embedding_dim,
            dropout,
            max_len: DEFAULT_MAX_LEN,
            layer_norm_eps: 1e-5,
            use_fused_attention: false,
            use_checkpointing: false,
            gelu: GeluApproximation::Exact,
            init_seed: 0,
        }
    }

    /// 6 layers, 8 heads, width 512, dropout 0.1.
    pub fn base() -> Self {
        Self::new(6, 8, 512, 0.1)
    }

    /// 12 layers, 8 heads, width 512, activation checkpointing on.
    pub fn distributed() -> Self {
        Self::new(12, 8, 512, 0.1).with_checkpointing(true)
    }

    pub fn with_fused_attention(mut self, enabled: bool) -> Self {
        self.use_fused_attention = enabled;
        self
    }

    pub fn with_checkpointing(mut self, enabled: bool) -> Self {
        self.use_checkpointing = enabled;
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_layer_norm_eps(mut self, eps: f64) -> Self {
        self.layer_norm_eps = eps;
        self
    }

    pub fn with_gelu(mut self, gelu: GeluApproximation) -> Self {
        self.gelu = gelu;
        self
    }

    pub fn with_init_seed(mut self, seed: u64) -> Self {
        self.init_seed = seed;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.embedding_dim / self.num_heads.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(TensorError::Configuration(msg));
        if self.num_layers == 0 {
            return fail("num_layers must be at least 1".to_string());
        }
        if self.num_heads == 0 || self.embedding_dim == 0 {
            return fail(format!(
                "num_heads ({}) and embedding_dim ({}) must be non-zero",
                self.num_heads, self.embedding_dim
            ));
        }
        if self.embedding_dim % self.num_heads != 0 {
            return fail(format!(
                "embedding_dim {} is not divisible by num_heads {}",
                self.embedding_dim, self.num_heads
            ));
        }
        if self.embedding_dim % 2 != 0 {
            return fail(format!(
                "embedding_dim {} must be even for sinusoidal positions",
                self.embedding_dim
            ));
        }
        if self.max_len == 0 {
            return fail("max_len must be at least 1".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return fail(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if !(self.layer_norm_eps > 0.0) {
            return fail(format!(
                "layer_norm_eps must be positive, got {}",
                self.layer_norm_eps
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let base = EncoderConfig::base();
        assert_eq!((base.num_layers, base.num_heads, base.embedding_dim), (6, 8, 512));
        assert_eq!(base.dropout, 0.1);
        assert_eq!(base.max_len, 5000);
        assert!(!base.use_checkpointing);
        assert!(base.validate().is_ok());

        let dist = EncoderConfig::distributed();
        assert_eq!(dist.num_layers, 12);
        assert!(dist.use_checkpointing);
        assert!(dist.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let bad = [
            EncoderConfig::new(0, 2, 8, 0.1),
            EncoderConfig::new(1, 0, 8, 0.1),
            EncoderConfig::new(1, 2, 0, 0.1),
            EncoderConfig::new(1, 3, 8, 0.1),
            EncoderConfig::new(1, 3, 9, 0.1),
            EncoderConfig::new(1, 2, 8, 1.0),
            EncoderConfig::new(1, 2, 8, -0.5),
            EncoderConfig::new(1, 2, 8, 0.1).with_max_len(0),
            EncoderConfig::new(1, 2, 8, 0.1).with_layer_norm_eps(0.0),
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(TensorError::Configuration(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_serde_round_trip_with_defaults() {
        let config = EncoderConfig::new(2, 2, 8, 0.0)
            .with_fused_attention(true)
            .with_gelu(GeluApproximation::Tanh);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"gelu\":\"tanh\""));
        let back: EncoderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let partial: EncoderConfig =
            serde_json::from_str(r#"{"num_layers": 3, "use_fused_attention": true}"#).unwrap();
        assert_eq!(partial.num_layers, 3);
        assert_eq!(partial.embedding_dim, 512);
        assert!(partial.use_fused_attention);
    }
}
