mod base;
mod differentiable;
mod mutation;
mod normalizer;
mod operation;
mod ops;
mod proxyless;
pub mod slicing;

pub use base::*;
pub use differentiable::*;
pub use mutation::*;
pub use normalizer::*;
pub use operation::*;
pub use ops::*;
pub use proxyless::*;
