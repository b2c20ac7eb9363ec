use super::{functional, has_choice, resolve_arguments, ArgReader, Kwargs, Module, Traceable};
use crate::{kwargs, NasError, NasResult};
use candle_core::{DType, Device, Tensor, Var};
use std::any::Any;

pub struct BatchNormParams {
    pub weight: Option<Var>,
    pub bias: Option<Var>,
    pub running_mean: Option<Var>,
    pub running_var: Option<Var>,
}

impl BatchNormParams {
    pub fn new(
        num_features: usize,
        affine: bool,
        track_running_stats: bool,
        device: &Device,
    ) -> NasResult<Self> {
        let (weight, bias) = if affine {
            (
                Some(Var::ones(num_features, DType::F32, device)?),
                Some(Var::zeros(num_features, DType::F32, device)?),
            )
        } else {
            (None, None)
        };
        let (running_mean, running_var) = if track_running_stats {
            (
                Some(Var::zeros(num_features, DType::F32, device)?),
                Some(Var::ones(num_features, DType::F32, device)?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
        })
    }

    /// Affine parameters only. Running statistics are buffers, never optimized.
    pub fn named(&self) -> Vec<(String, Var)> {
        let mut params = Vec::new();
        if let Some(weight) = &self.weight {
            params.push(("weight".to_string(), weight.clone()));
        }
        if let Some(bias) = &self.bias {
            params.push(("bias".to_string(), bias.clone()));
        }
        params
    }
}

pub struct BatchNorm2d {
    kwargs: Kwargs,
    device: Device,
    eps: f64,
    momentum: f64,
    training: bool,
    params: Option<BatchNormParams>,
}

impl BatchNorm2d {
    pub fn new(num_features: usize, device: &Device) -> NasResult<Self> {
        Self::from_kwargs(kwargs! { "num_features" => num_features }, device)
    }

    pub fn params(&self) -> Option<&BatchNormParams> {
        self.params.as_ref()
    }

    pub fn into_params(self) -> NasResult<BatchNormParams> {
        self.params.ok_or_else(|| NasError::UnresolvedChoice {
            module: Self::TYPE_NAME.to_string(),
        })
    }
}

impl Traceable for BatchNorm2d {
    const TYPE_NAME: &'static str = "BatchNorm2d";
    const REQUIRED_ARGUMENTS: &'static [&'static str] = &["num_features"];

    fn default_arguments() -> Kwargs {
        kwargs! {
            "eps" => 1e-5,
            "momentum" => 0.1,
            "affine" => true,
            "track_running_stats" => true,
        }
    }

    fn from_kwargs(kwargs: Kwargs, device: &Device) -> NasResult<Self> {
        let resolved = resolve_arguments::<Self>(&kwargs)?;
        let args = ArgReader::new(Self::TYPE_NAME, &resolved);
        let (eps, momentum, params) = if has_choice(&resolved) {
            (0.0, 0.0, None)
        } else {
            (
                args.float("eps")?,
                args.float("momentum")?,
                Some(BatchNormParams::new(
                    args.usize("num_features")?,
                    args.boolean("affine")?,
                    args.boolean("track_running_stats")?,
                    device,
                )?),
            )
        };
        Ok(Self {
            kwargs,
            device: device.clone(),
            eps,
            momentum,
            training: true,
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

impl Module for BatchNorm2d {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor> {
        let params = self.params.as_ref().ok_or_else(|| NasError::UnresolvedChoice {
            module: Self::TYPE_NAME.to_string(),
        })?;
        let running = match (&params.running_mean, &params.running_var) {
            (Some(mean), Some(var)) => Some((mean.as_tensor(), var.as_tensor())),
            _ => None,
        };
        let (out, stats) = functional::batch_norm2d(
            xs,
            params.weight.as_ref().map(|w| w.as_tensor()),
            params.bias.as_ref().map(|b| b.as_tensor()),
            running,
            self.training,
            self.eps,
        )?;
        if let (Some(stats), Some(mean), Some(var)) =
            (stats, &params.running_mean, &params.running_var)
        {
            functional::update_running_stat(mean, &stats.mean, self.momentum)?;
            functional::update_running_stat(var, &stats.var, self.momentum)?;
        }
        Ok(out)
    }

    fn own_parameters(&self) -> Vec<(String, Var)> {
        self.params.as_ref().map(|p| p.named()).unwrap_or_default()
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
