pub mod choice;
mod error;
pub mod nn;
pub mod supermodule;

pub use error::*;
pub use nas_structs::choice::{ChoiceValue, ParameterSpec, Scalar};

#[macro_export]
macro_rules! kwargs {
    ( $( $key:expr => $value:expr ),* $(,)? ) => {{
        #[allow(unused_mut)]
        let mut kwargs = $crate::nn::Kwargs::new();
        $( kwargs.insert($key.to_string(), $crate::nn::Arg::from($value)); )*
        kwargs
    }};
}
