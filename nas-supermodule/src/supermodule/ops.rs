//! Mixed versions of the ordinary layers.
//!
//! Every operator keeps one superkernel built at the largest candidate size and slices
//! it per forward call. Channel-like axes keep their prefix, kernel axes keep their
//! centre.

use super::{
    hook,
    operation::{max_option, min_option, MixedOperation, MixedOperator, OperationArguments, SampledArguments},
    slicing::{weighted_slice, AxisSlice, MaybeWeighted},
    MutationHook,
};
use crate::{
    choice::ValueChoiceX,
    nn::{
        functional::{self, AttentionOptions, AttentionParameters, Conv2dConfig},
        split_attention_inputs, ArgReader, AttentionParams, BatchNorm2d, BatchNormParams, Conv2d,
        Conv2dParams, Kwargs, Linear, LinearParams, MultiheadAttention, Traceable,
    },
    NasError, NasResult,
};
use candle_core::{Device, Tensor, Var};
use nas_structs::choice::Scalar;

fn single_input<'a>(operator: &str, xs: &'a [Tensor]) -> NasResult<&'a Tensor> {
    match xs {
        [x] => Ok(x),
        _ => Err(NasError::InputArity {
            module: operator.to_string(),
            expected: 1,
            actual: xs.len(),
        }),
    }
}

fn slice_optional<T>(
    tensor: Option<&Var>,
    arg: &MaybeWeighted<T>,
    to_slices: impl Fn(&T) -> Vec<AxisSlice>,
) -> NasResult<Option<Tensor>> {
    tensor
        .map(|t| weighted_slice(t.as_tensor(), arg, &to_slices))
        .transpose()
}

/// Mixed `Linear`. Supports `in_features` and `out_features`.
pub struct MixedLinear {
    params: LinearParams,
}

impl MixedLinear {
    pub fn params(&self) -> &LinearParams {
        &self.params
    }
}

impl MixedOperator for MixedLinear {
    type Bound = Linear;

    const NAME: &'static str = "MixedLinear";
    const ARGUMENT_LIST: &'static [&'static str] = &["in_features", "out_features"];

    fn build(super_kwargs: &Kwargs, _arguments: &OperationArguments, device: &Device) -> NasResult<Self> {
        Ok(Self {
            params: Linear::from_kwargs(super_kwargs.clone(), device)?.into_params()?,
        })
    }

    fn forward_with_args(
        &self,
        args: &SampledArguments,
        xs: &[Tensor],
        _training: bool,
    ) -> NasResult<Tensor> {
        let xs = single_input(Self::NAME, xs)?;
        let in_features = args.usize_or_weighted("in_features")?;
        let out_features = args.usize_or_weighted("out_features")?;

        let weight = weighted_slice(self.params.weight.as_tensor(), &out_features, |&o| {
            vec![AxisSlice::prefix(0, o)]
        })?;
        let weight = weighted_slice(&weight, &in_features, |&i| vec![AxisSlice::prefix(1, i)])?;
        let bias = slice_optional(self.params.bias.as_ref(), &out_features, |&o| {
            vec![AxisSlice::prefix(0, o)]
        })?;
        functional::linear(xs, &weight, bias.as_ref())
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.params.named()
    }
}

/// Mixed `Conv2d`.
///
/// Supports every geometric argument, but `stride`, `dilation` and `groups` must be
/// sampled concretely. Input channels are sliced to `in_channels / groups`, so the
/// superkernel is built with the smallest `groups`. A kernel smaller than the
/// superkernel is its centre, rounding the offset down:
///
/// ```text
/// 5x5 super, 3x3 sampled -> rows/cols [1, 4)
/// 5x5 super, 2x2 sampled -> rows/cols [1, 3)
/// ```
///
/// When the kernel size is a distribution the superkernel's padding is used.
pub struct MixedConv2d {
    params: Conv2dParams,
    super_padding: (usize, usize),
}

impl MixedConv2d {
    pub fn params(&self) -> &Conv2dParams {
        &self.params
    }
}

impl MixedOperator for MixedConv2d {
    type Bound = Conv2d;

    const NAME: &'static str = "MixedConv2d";
    const ARGUMENT_LIST: &'static [&'static str] = &[
        "in_channels",
        "out_channels",
        "kernel_size",
        "stride",
        "padding",
        "dilation",
        "groups",
    ];

    fn super_init_argument(name: &str, expr: &ValueChoiceX) -> NasResult<Scalar> {
        match name {
            // smallest groups gives the widest kernel
            "groups" => min_option(expr),
            _ => max_option(expr),
        }
    }

    fn build(super_kwargs: &Kwargs, _arguments: &OperationArguments, device: &Device) -> NasResult<Self> {
        let conv = Conv2d::from_kwargs(super_kwargs.clone(), device)?;
        let super_padding = conv.config().padding;
        Ok(Self {
            params: conv.into_params()?,
            super_padding,
        })
    }

    fn forward_with_args(
        &self,
        args: &SampledArguments,
        xs: &[Tensor],
        _training: bool,
    ) -> NasResult<Tensor> {
        let xs = single_input(Self::NAME, xs)?;
        args.ensure_concrete(&["stride", "dilation", "groups"])?;
        let stride = args.concrete_pair("stride")?;
        let dilation = args.concrete_pair("dilation")?;
        let groups = args.concrete_usize("groups")?;
        if groups == 0 {
            return Err(NasError::InvalidArgument {
                operator: Self::NAME.to_string(),
                argument: "groups".to_string(),
                reason: "groups must be positive".to_string(),
            });
        }
        let in_channels = args.usize_or_weighted("in_channels")?;
        let out_channels = args.usize_or_weighted("out_channels")?;
        let kernel_size = args.pair_or_weighted("kernel_size")?;

        let padding = if kernel_size.is_weighted() {
            self.super_padding
        } else {
            match args.pair_or_weighted("padding")? {
                MaybeWeighted::Fixed(padding) => padding,
                MaybeWeighted::Weighted(_) => {
                    return Err(NasError::WeightedSamplingUnsupported {
                        operator: Self::NAME.to_string(),
                        argument: "padding".to_string(),
                    })
                }
            }
        };

        let weight = self.params.weight.as_tensor();
        let (_, _, max_kh, max_kw) = weight.dims4()?;
        let weight = weighted_slice(weight, &out_channels, |&o| vec![AxisSlice::prefix(0, o)])?;
        let weight = weighted_slice(&weight, &in_channels, |&i| {
            vec![AxisSlice::prefix(1, i / groups)]
        })?;
        let weight = weighted_slice(&weight, &kernel_size, |&(kh, kw)| {
            vec![AxisSlice::center(2, max_kh, kh), AxisSlice::center(3, max_kw, kw)]
        })?;
        let bias = slice_optional(self.params.bias.as_ref(), &out_channels, |&o| {
            vec![AxisSlice::prefix(0, o)]
        })?;

        let config = Conv2dConfig {
            stride,
            padding,
            dilation,
            groups,
        };
        functional::conv2d(xs, &weight, bias.as_ref(), &config)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.params.named()
    }
}

/// Mixed `BatchNorm2d`. Supports `num_features`, plus `eps` and `momentum` when sampled
/// concretely.
///
/// The prefix of the affine parameters and running statistics is used. Under a
/// distribution over `num_features` the full width is used.
pub struct MixedBatchNorm2d {
    params: BatchNormParams,
    num_features: usize,
}

impl MixedBatchNorm2d {
    pub fn params(&self) -> &BatchNormParams {
        &self.params
    }
}

impl MixedOperator for MixedBatchNorm2d {
    type Bound = BatchNorm2d;

    const NAME: &'static str = "MixedBatchNorm2d";
    const ARGUMENT_LIST: &'static [&'static str] = &["num_features", "eps", "momentum"];

    fn build(super_kwargs: &Kwargs, _arguments: &OperationArguments, device: &Device) -> NasResult<Self> {
        let num_features = ArgReader::new(Self::NAME, super_kwargs).usize("num_features")?;
        Ok(Self {
            params: BatchNorm2d::from_kwargs(super_kwargs.clone(), device)?.into_params()?,
            num_features,
        })
    }

    fn forward_with_args(
        &self,
        args: &SampledArguments,
        xs: &[Tensor],
        training: bool,
    ) -> NasResult<Tensor> {
        let xs = single_input(Self::NAME, xs)?;
        args.ensure_concrete(&["eps", "momentum"])?;
        let eps = args.concrete_float("eps")?;
        let momentum = args.concrete_float("momentum")?;
        let num_features = match args.usize_or_weighted("num_features")? {
            MaybeWeighted::Fixed(n) => n,
            MaybeWeighted::Weighted(_) => self.num_features,
        };
        let prefix = |var: &Option<Var>| -> NasResult<Option<Tensor>> {
            var.as_ref()
                .map(|v| v.narrow(0, 0, num_features))
                .transpose()
                .map_err(NasError::from)
        };
        let weight = prefix(&self.params.weight)?;
        let bias = prefix(&self.params.bias)?;
        let running_mean = prefix(&self.params.running_mean)?;
        let running_var = prefix(&self.params.running_var)?;
        let running = match (&running_mean, &running_var) {
            (Some(mean), Some(var)) => Some((mean, var)),
            _ => None,
        };

        let (out, stats) = functional::batch_norm2d(
            xs,
            weight.as_ref(),
            bias.as_ref(),
            running,
            training,
            eps,
        )?;
        if let (Some(stats), Some(mean), Some(var)) =
            (stats, &self.params.running_mean, &self.params.running_var)
        {
            functional::update_running_stat(mean, &stats.mean, momentum)?;
            functional::update_running_stat(var, &stats.var, momentum)?;
        }
        Ok(out)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.params.named()
    }
}

/// Mixed `MultiheadAttention`. Supports `embed_dim`, `kdim` and `vdim`, plus
/// `num_heads` and `dropout` when sampled concretely.
///
/// Q, K and V projections are sliced as three separate blocks, each keeping its first
/// `embed_dim` rows. Every candidate `embed_dim` must be divisible by every candidate
/// `num_heads`.
pub struct MixedMultiheadAttention {
    params: AttentionParams,
    add_zero_attn: bool,
    batch_first: bool,
}

impl MixedMultiheadAttention {
    pub fn params(&self) -> &AttentionParams {
        &self.params
    }
}

impl MixedOperator for MixedMultiheadAttention {
    type Bound = MultiheadAttention;

    const NAME: &'static str = "MixedMultiheadAttention";
    const ARGUMENT_LIST: &'static [&'static str] =
        &["embed_dim", "num_heads", "kdim", "vdim", "dropout"];

    fn build(super_kwargs: &Kwargs, arguments: &OperationArguments, device: &Device) -> NasResult<Self> {
        let mut params = MultiheadAttention::from_kwargs(super_kwargs.clone(), device)?.into_params()?;
        let args = ArgReader::new(Self::NAME, super_kwargs);
        let embed_dim = args.usize("embed_dim")?;
        let kdim = args.optional_usize("kdim")?;
        let vdim = args.optional_usize("vdim")?;

        // An explicit kdim/vdim that matches embed_dim only at the maximum still needs
        // its own projection once either side can shrink.
        let needs_separate = [("kdim", kdim), ("vdim", vdim)].iter().any(|(name, dim)| {
            *dim == Some(embed_dim)
                && (arguments.is_mutable(name) || arguments.is_mutable("embed_dim"))
        });
        if needs_separate {
            params.materialize_separate_projections(
                embed_dim,
                kdim.unwrap_or(embed_dim),
                vdim.unwrap_or(embed_dim),
                device,
            )?;
        }
        Ok(Self {
            params,
            add_zero_attn: args.boolean("add_zero_attn")?,
            batch_first: args.boolean("batch_first")?,
        })
    }

    fn forward_with_args(
        &self,
        args: &SampledArguments,
        xs: &[Tensor],
        training: bool,
    ) -> NasResult<Tensor> {
        let (query, key, value, mask) = split_attention_inputs(Self::NAME, xs)?;
        args.ensure_concrete(&["num_heads", "dropout"])?;
        let num_heads = args.concrete_usize("num_heads")?;
        let dropout = args.concrete_float("dropout")?;
        let embed_dim = args.usize_or_weighted("embed_dim")?;
        let kdim = args
            .optional_usize_or_weighted("kdim")?
            .unwrap_or_else(|| embed_dim.clone());
        let vdim = args
            .optional_usize_or_weighted("vdim")?
            .unwrap_or_else(|| embed_dim.clone());

        let rows = |t: &Tensor| weighted_slice(t, &embed_dim, |&e| vec![AxisSlice::prefix(0, e)]);
        let (q_proj, k_proj, v_proj) = self.params.projections()?;
        let q_proj = weighted_slice(&rows(&q_proj)?, &embed_dim, |&e| {
            vec![AxisSlice::prefix(1, e)]
        })?;
        let k_proj = weighted_slice(&rows(&k_proj)?, &kdim, |&k| vec![AxisSlice::prefix(1, k)])?;
        let v_proj = weighted_slice(&rows(&v_proj)?, &vdim, |&v| vec![AxisSlice::prefix(1, v)])?;
        let in_proj_bias = match self.params.in_biases()? {
            Some((q, k, v)) => Some((rows(&q)?, rows(&k)?, rows(&v)?)),
            None => None,
        };
        let last_axis = |var: Option<&Var>| {
            slice_optional(var, &embed_dim, |&e| vec![AxisSlice::prefix(2, e)])
        };
        let out_proj_weight = weighted_slice(self.params.out_proj_weight.as_tensor(), &embed_dim, |&e| {
            vec![AxisSlice::prefix(0, e), AxisSlice::prefix(1, e)]
        })?;
        let out_proj_bias = slice_optional(self.params.out_proj_bias.as_ref(), &embed_dim, |&e| {
            vec![AxisSlice::prefix(0, e)]
        })?;

        let params = AttentionParameters {
            q_proj,
            k_proj,
            v_proj,
            in_proj_bias,
            bias_k: last_axis(self.params.bias_k.as_ref())?,
            bias_v: last_axis(self.params.bias_v.as_ref())?,
            out_proj_weight,
            out_proj_bias,
        };
        let options = AttentionOptions {
            num_heads,
            dropout,
            add_zero_attn: self.add_zero_attn,
            batch_first: self.batch_first,
            training,
            need_weights: false,
        };
        let (out, _) = functional::multi_head_attention(
            &query,
            &key,
            &value,
            mask.as_ref(),
            &params,
            &options,
        )?;
        Ok(out)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.params.named()
    }
}

pub type MixedLinearOperation = MixedOperation<MixedLinear>;
pub type MixedConv2dOperation = MixedOperation<MixedConv2d>;
pub type MixedBatchNorm2dOperation = MixedOperation<MixedBatchNorm2d>;
pub type MixedMultiheadAttentionOperation = MixedOperation<MixedMultiheadAttention>;

/// Mutation hooks of every built-in mixed operation.
pub fn native_mixed_operations() -> Vec<Box<dyn MutationHook>> {
    vec![
        hook::<MixedLinearOperation>(),
        hook::<MixedConv2dOperation>(),
        hook::<MixedBatchNorm2dOperation>(),
        hook::<MixedMultiheadAttentionOperation>(),
    ]
}
