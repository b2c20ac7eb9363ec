use super::{functional, has_choice, resolve_arguments, uniform_var, ArgReader, Kwargs, Module, Traceable};
use crate::{kwargs, NasError, NasResult};
use candle_core::{Device, Tensor, Var};
use std::any::Any;

pub struct LinearParams {
    pub weight: Var,
    pub bias: Option<Var>,
}

impl LinearParams {
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        device: &Device,
    ) -> NasResult<Self> {
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        Ok(Self {
            weight: uniform_var(bound, &[out_features, in_features], device)?,
            bias: if bias {
                Some(uniform_var(bound, &[out_features], device)?)
            } else {
                None
            },
        })
    }

    pub fn named(&self) -> Vec<(String, Var)> {
        let mut params = vec![("weight".to_string(), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push(("bias".to_string(), bias.clone()));
        }
        params
    }
}

/// `y = x W^T + b`.
pub struct Linear {
    kwargs: Kwargs,
    device: Device,
    params: Option<LinearParams>,
}

impl Linear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        device: &Device,
    ) -> NasResult<Self> {
        Self::from_kwargs(
            kwargs! {
                "in_features" => in_features,
                "out_features" => out_features,
                "bias" => bias,
            },
            device,
        )
    }

    /// `None` while an argument is still a value choice.
    pub fn params(&self) -> Option<&LinearParams> {
        self.params.as_ref()
    }

    pub fn into_params(self) -> NasResult<LinearParams> {
        self.params.ok_or_else(|| NasError::UnresolvedChoice {
            module: Self::TYPE_NAME.to_string(),
        })
    }
}

impl Traceable for Linear {
    const TYPE_NAME: &'static str = "Linear";
    const REQUIRED_ARGUMENTS: &'static [&'static str] = &["in_features", "out_features"];

    fn default_arguments() -> Kwargs {
        kwargs! { "bias" => true }
    }

    fn from_kwargs(kwargs: Kwargs, device: &Device) -> NasResult<Self> {
        let resolved = resolve_arguments::<Self>(&kwargs)?;
        let params = if has_choice(&resolved) {
            None
        } else {
            let args = ArgReader::new(Self::TYPE_NAME, &resolved);
            Some(LinearParams::new(
                args.usize("in_features")?,
                args.usize("out_features")?,
                args.boolean("bias")?,
                device,
            )?)
        };
        Ok(Self {
            kwargs,
            device: device.clone(),
            params,
        })
    }

    fn trace_kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl Module for Linear {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor> {
        let params = self.params.as_ref().ok_or_else(|| NasError::UnresolvedChoice {
            module: Self::TYPE_NAME.to_string(),
        })?;
        functional::linear(
            xs,
            params.weight.as_tensor(),
            params.bias.as_ref().map(|b| b.as_tensor()),
        )
    }

    fn own_parameters(&self) -> Vec<(String, Var)> {
        self.params.as_ref().map(|p| p.named()).unwrap_or_default()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
