//! Parameter initialization.
//!
//! Linear weights get Xavier (Glorot) uniform values, biases and norm shifts
//! are zeroed, norm scales are set to one. Values are drawn from a seeded
//! [`StdRng`] in parameter order, so two modules of the same architecture
//! initialized with the same seed are identical.

use super::module::{Module, ParamKind, ParameterMut};
use crate::tensor::{Result, TensorElem, TensorError, scalar};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Bound of the Xavier uniform distribution: `sqrt(6 / (fan_in + fan_out))`.
pub fn xavier_bound(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}

/// Fills `data` (a `[fan_out, fan_in]` matrix) from `U(-a, a)` with the Xavier bound.
pub fn xavier_uniform<T: TensorElem>(
    data: &mut [T],
    fan_in: usize,
    fan_out: usize,
    rng: &mut StdRng,
) -> Result<()> {
    if fan_in + fan_out == 0 {
        return Err(TensorError::Configuration(
            "xavier init of a matrix with no fan".to_string(),
        ));
    }
    let bound = xavier_bound(fan_in, fan_out);
    for v in data.iter_mut() {
        *v = scalar(rng.random_range(-bound..bound))?;
    }
    Ok(())
}

fn init_parameter<T: TensorElem>(param: ParameterMut<'_, T>, rng: &mut StdRng) -> Result<()> {
    match param.kind {
        ParamKind::LinearWeight => {
            let [fan_out, fan_in] = <[usize; 2]>::try_from(param.shape.as_slice()).map_err(|_| {
                TensorError::ShapeMismatch {
                    expected: vec![2],
                    got: vec![param.shape.len()],
                }
            })?;
            xavier_uniform(param.data, fan_in, fan_out, rng)
        }
        ParamKind::LinearBias | ParamKind::NormBias => {
            param.data.fill(T::zero());
            Ok(())
        }
        ParamKind::NormScale => {
            param.data.fill(T::one());
            Ok(())
        }
    }
}

/// Runs the init pass over every parameter of `module`. Returns how many
/// tensors were initialized.
pub fn initialize<T, M>(module: &mut M, seed: u64) -> Result<usize>
where
    T: TensorElem,
    M: Module<T> + ?Sized,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let params = module.parameters_mut();
    let count = params.len();
    for param in params {
        init_parameter(param, &mut rng)?;
    }
    Ok(count)
}
