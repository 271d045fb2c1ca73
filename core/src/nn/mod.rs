//! Neural network layers and the parameter interface shared by every model.

pub mod activation;
pub mod dropout;
pub mod init;
pub mod linear;
pub mod module;
pub mod norm;
pub mod transformer;

pub use activation::{Activation, GeluApproximation};
pub use dropout::{Dropout, Mode};
pub use linear::{AllowedLinearRank, Linear};
pub use module::{Module, ParamKind, Parameter, ParameterMut};
pub use norm::LayerNorm;
