pub mod base;
pub mod darts;
pub mod optimizer;
pub mod trainer;

pub use base::*;
pub use darts::*;
pub use optimizer::{Adam, ParamsAdam, StepLr};
pub use trainer::{training_loop, InterleavedTrainVal};
