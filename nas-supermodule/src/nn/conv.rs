use super::{
    functional::{self, Conv2dConfig},
    has_choice, resolve_arguments, uniform_var, ArgReader, Kwargs, Module, Traceable,
};
use crate::{kwargs, NasError, NasResult};
use candle_core::{Device, Tensor, Var};
use std::any::Any;

pub struct Conv2dParams {
    /// `(out_channels, in_channels / groups, kh, kw)`.
    pub weight: Var,
    pub bias: Option<Var>,
}

impl Conv2dParams {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        groups: usize,
        bias: bool,
        device: &Device,
    ) -> NasResult<Self> {
        let fan_in = (in_channels / groups) * kernel_size.0 * kernel_size.1;
        let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
        Ok(Self {
            weight: uniform_var(
                bound,
                &[out_channels, in_channels / groups, kernel_size.0, kernel_size.1],
                device,
            )?,
            bias: if bias {
                Some(uniform_var(bound, &[out_channels], device)?)
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

/// Reads the geometry of a convolution from resolved arguments.
pub(crate) fn read_conv_config(args: &ArgReader) -> NasResult<Conv2dConfig> {
    Ok(Conv2dConfig {
        stride: args.pair("stride")?,
        padding: args.pair("padding")?,
        dilation: args.pair("dilation")?,
        groups: args.usize("groups")?,
    })
}

pub struct Conv2d {
    kwargs: Kwargs,
    device: Device,
    config: Conv2dConfig,
    params: Option<Conv2dParams>,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv2dConfig,
        device: &Device,
    ) -> NasResult<Self> {
        Self::from_kwargs(
            kwargs! {
                "in_channels" => in_channels,
                "out_channels" => out_channels,
                "kernel_size" => kernel_size,
                "stride" => config.stride,
                "padding" => config.padding,
                "dilation" => config.dilation,
                "groups" => config.groups,
            },
            device,
        )
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    pub fn params(&self) -> Option<&Conv2dParams> {
        self.params.as_ref()
    }

    pub fn into_params(self) -> NasResult<Conv2dParams> {
        self.params.ok_or_else(|| NasError::UnresolvedChoice {
            module: Self::TYPE_NAME.to_string(),
        })
    }
}

impl Traceable for Conv2d {
    const TYPE_NAME: &'static str = "Conv2d";
    const REQUIRED_ARGUMENTS: &'static [&'static str] =
        &["in_channels", "out_channels", "kernel_size"];

    fn default_arguments() -> Kwargs {
        kwargs! {
            "stride" => 1usize,
            "padding" => 0usize,
            "dilation" => 1usize,
            "groups" => 1usize,
            "bias" => true,
            "padding_mode" => "zeros",
        }
    }

    fn from_kwargs(kwargs: Kwargs, device: &Device) -> NasResult<Self> {
        let resolved = resolve_arguments::<Self>(&kwargs)?;
        let args = ArgReader::new(Self::TYPE_NAME, &resolved);
        if args.text("padding_mode")? != "zeros" {
            return Err(NasError::InvalidArgument {
                operator: Self::TYPE_NAME.to_string(),
                argument: "padding_mode".to_string(),
                reason: "only zero padding is supported".to_string(),
            });
        }
        if has_choice(&resolved) {
            return Ok(Self {
                kwargs,
                device: device.clone(),
                config: Conv2dConfig::default(),
                params: None,
            });
        }
        let config = read_conv_config(&args)?;
        let in_channels = args.usize("in_channels")?;
        let out_channels = args.usize("out_channels")?;
        if config.groups == 0 || in_channels % config.groups != 0 || out_channels % config.groups != 0
        {
            return Err(NasError::InvalidArgument {
                operator: Self::TYPE_NAME.to_string(),
                argument: "groups".to_string(),
                reason: "in_channels and out_channels must be divisible by groups".to_string(),
            });
        }
        let params = Conv2dParams::new(
            in_channels,
            out_channels,
            args.pair("kernel_size")?,
            config.groups,
            args.boolean("bias")?,
            device,
        )?;
        Ok(Self {
            kwargs,
            device: device.clone(),
            config,
            params: Some(params),
        })
    }

    fn trace_kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl Module for Conv2d {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor> {
        let params = self.params.as_ref().ok_or_else(|| NasError::UnresolvedChoice {
            module: Self::TYPE_NAME.to_string(),
        })?;
        functional::conv2d(
            xs,
            params.weight.as_tensor(),
            params.bias.as_ref().map(|b| b.as_tensor()),
            &self.config,
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
