//! Activation functions.
//!
//! The encoder's feed-forward network uses GELU. Two forms are provided:
//!
//! - **Exact**: $0.5 x (1 + \mathrm{erf}(x / \sqrt 2))$, evaluated with `libm::erf`.
//! - **Tanh**: $0.5 x (1 + \tanh[\sqrt{2/\pi} (x + 0.044715 x^3)])$, the cheaper
//!   approximation used by GPT-2 style models.
//!
//! Both are computed in `f64` and converted back to the tensor's element type.

use crate::tensor::{Tensor, TensorElem};
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Which GELU formula to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeluApproximation {
    #[default]
    Exact,
    Tanh,
}

fn to_f64<T: TensorElem + Float>(x: T) -> f64 {
    x.to_f64().unwrap_or(f64::NAN)
}

fn from_f64<T: TensorElem + Float>(x: f64) -> T {
    T::from_f64(x).unwrap_or_else(T::nan)
}

/// Exact GELU using the error function.
pub fn gelu<T: TensorElem + Float>(x: T) -> T {
    let v = to_f64(x);
    from_f64(0.5 * v * (1.0 + libm::erf(v / std::f64::consts::SQRT_2)))
}

/// Tanh approximation of GELU.
pub fn gelu_tanh<T: TensorElem + Float>(x: T) -> T {
    let v = to_f64(x);
    let sqrt_2_over_pi = (2.0 / std::f64::consts::PI).sqrt();
    let inner = sqrt_2_over_pi * (v + 0.044715 * v.powi(3));
    from_f64(0.5 * v * (1.0 + inner.tanh()))
}

/// Element-wise activations over tensors.
pub struct Activation;

impl Activation {
    pub fn gelu<const RANK: usize, T: TensorElem + Float>(
        x: &Tensor<T, RANK>,
        approximation: GeluApproximation,
    ) -> Tensor<T, RANK> {
        match approximation {
            GeluApproximation::Exact => x.map(gelu),
            GeluApproximation::Tanh => x.map(gelu_tanh),
        }
    }

    /// In-place variant, used on the feed-forward hidden layer.
    pub fn gelu_inplace<const RANK: usize, T: TensorElem + Float>(
        x: &mut Tensor<T, RANK>,
        approximation: GeluApproximation,
    ) {
        match approximation {
            GeluApproximation::Exact => x.map_inplace(gelu),
            GeluApproximation::Tanh => x.map_inplace(gelu_tanh),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gelu_exact_values() {
        assert_eq!(gelu(0.0f64), 0.0);
        // GELU(1) = Phi(1) = 0.841344746...
        assert!((gelu(1.0f64) - 0.841_344_746).abs() < 1e-8);
        // GELU(-1) = -1 * Phi(-1) = -0.158655254...
        assert!((gelu(-1.0f64) - -0.158_655_254).abs() < 1e-8);
    }

    #[test]
    fn test_gelu_tanh_close_to_exact() {
        // sqrt(2/pi) * (1 + 0.044715) = 0.83355, tanh = 0.6824
        assert!((gelu_tanh(1.0f32) - 0.8412).abs() < 1e-3);
        for i in -30..=30 {
            let x = i as f64 * 0.1;
            assert!((gelu(x) - gelu_tanh(x)).abs() < 1e-3);
        }
    }

    #[test]
    fn test_activation_on_tensor() {
        let mut t = Tensor::<f32, 1>::new(vec![0.0, 1.0], [2]).unwrap();
        let exact = Activation::gelu(&t, GeluApproximation::Exact);
        assert!((exact.data()[1] - 0.841_344_7).abs() < 1e-6);

        Activation::gelu_inplace(&mut t, GeluApproximation::Tanh);
        assert!((t.data()[1] - 0.8412).abs() < 1e-3);
    }

    #[test]
    fn test_approximation_serde_names() {
        assert_eq!(
            serde_json::to_string(&GeluApproximation::Tanh).unwrap(),
            "\"tanh\""
        );
        let parsed: GeluApproximation = serde_json::from_str("\"exact\"").unwrap();
        assert_eq!(parsed, GeluApproximation::Exact);
    }
}
