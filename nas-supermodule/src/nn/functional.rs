//! Tensor math shared by ordinary layers and their mixed counterparts. Every function
//! takes the tensors it needs explicitly, so sliced views of a superkernel can be fed
//! in exactly like the parameters of a freshly built layer.

use crate::{NasError, NasResult};
use candle_core::{Tensor, Var, D};

pub fn linear(xs: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> NasResult<Tensor> {
    let weight = weight.contiguous()?;
    let w = match *xs.dims() {
        [b1, b2, _, _] => weight.broadcast_left((b1, b2))?.t()?,
        [bsize, _, _] => weight.broadcast_left(bsize)?.t()?,
        _ => weight.t()?,
    };
    let out = xs.matmul(&w)?;
    match bias {
        Some(bias) => Ok(out.broadcast_add(bias)?),
        None => Ok(out),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
        }
    }
}

/// 2-D convolution over `(N, C, H, W)` input with a `(O, C / groups, KH, KW)` kernel.
///
/// Stride and dilation must be equal on both axes. Unequal padding is applied as
/// explicit zero padding before an unpadded convolution.
pub fn conv2d(
    xs: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    config: &Conv2dConfig,
) -> NasResult<Tensor> {
    for (argument, (a, b)) in [("stride", config.stride), ("dilation", config.dilation)] {
        if a != b {
            return Err(NasError::InvalidArgument {
                operator: "Conv2d".to_string(),
                argument: argument.to_string(),
                reason: format!("per-axis values must be equal, got ({}, {})", a, b),
            });
        }
    }
    let weight = weight.contiguous()?;
    let (ph, pw) = config.padding;
    let out = if ph == pw {
        xs.conv2d(&weight, ph, config.stride.0, config.dilation.0, config.groups)?
    } else {
        let padded = xs.pad_with_zeros(2, ph, ph)?.pad_with_zeros(3, pw, pw)?;
        padded.conv2d(&weight, 0, config.stride.0, config.dilation.0, config.groups)?
    };
    match bias {
        Some(bias) => {
            let channels = bias.dim(0)?;
            Ok(out.broadcast_add(&bias.reshape((1, channels, 1, 1))?)?)
        }
        None => Ok(out),
    }
}

/// Per-channel statistics of one training batch, detached from the graph.
#[derive(Clone, Debug)]
pub struct BatchStatistics {
    pub mean: Tensor,
    /// Unbiased variance, the estimate folded into running statistics.
    pub var: Tensor,
}

/// Batch normalization over `(N, C, H, W)` input.
///
/// With `running` set and `training` off, the running estimates normalize the input and
/// no statistics are returned. Otherwise the batch statistics are used and returned.
pub fn batch_norm2d(
    xs: &Tensor,
    weight: Option<&Tensor>,
    bias: Option<&Tensor>,
    running: Option<(&Tensor, &Tensor)>,
    training: bool,
    eps: f64,
) -> NasResult<(Tensor, Option<BatchStatistics>)> {
    let (n, c, h, w) = xs.dims4()?;
    let (mean, var, stats) = match running {
        Some((running_mean, running_var)) if !training => (
            running_mean.reshape((1, c, 1, 1))?,
            running_var.reshape((1, c, 1, 1))?,
            None,
        ),
        _ => {
            let mean = xs.mean_keepdim((0, 2, 3))?;
            let var = xs.broadcast_sub(&mean)?.sqr()?.mean_keepdim((0, 2, 3))?;
            let count = n * h * w;
            let correction = if count > 1 {
                count as f64 / (count - 1) as f64
            } else {
                1.0
            };
            let stats = BatchStatistics {
                mean: mean.flatten_all()?.detach(),
                var: var.affine(correction, 0.0)?.flatten_all()?.detach(),
            };
            (mean, var, Some(stats))
        }
    };
    let mut out = xs
        .broadcast_sub(&mean)?
        .broadcast_div(&var.affine(1.0, eps)?.sqrt()?)?;
    if let Some(weight) = weight {
        out = out.broadcast_mul(&weight.reshape((1, c, 1, 1))?)?;
    }
    if let Some(bias) = bias {
        out = out.broadcast_add(&bias.reshape((1, c, 1, 1))?)?;
    }
    Ok((out, stats))
}

/// Exponential moving update of the first `batch.dim(0)` entries of a running
/// statistic. Entries past that width are left untouched.
pub fn update_running_stat(running: &Var, batch: &Tensor, momentum: f64) -> NasResult<()> {
    let total = running.dim(0)?;
    let width = batch.dim(0)?;
    let prefix = running
        .narrow(0, 0, width)?
        .affine(1.0 - momentum, 0.0)?
        .add(&batch.affine(momentum, 0.0)?)?;
    let updated = if width < total {
        Tensor::cat(&[&prefix, &running.narrow(0, width, total - width)?], 0)?
    } else {
        prefix
    };
    running.set(&updated.detach())?;
    Ok(())
}

/// Projection tensors of one attention call. Q/K/V projections are always separate
/// here; packed in-projections are split by the caller.
#[derive(Clone, Debug)]
pub struct AttentionParameters {
    pub q_proj: Tensor,
    pub k_proj: Tensor,
    pub v_proj: Tensor,
    pub in_proj_bias: Option<(Tensor, Tensor, Tensor)>,
    pub bias_k: Option<Tensor>,
    pub bias_v: Option<Tensor>,
    pub out_proj_weight: Tensor,
    pub out_proj_bias: Option<Tensor>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttentionOptions {
    pub num_heads: usize,
    pub dropout: f64,
    pub add_zero_attn: bool,
    pub batch_first: bool,
    pub training: bool,
    pub need_weights: bool,
}

fn pad_mask(mask: Option<Tensor>) -> NasResult<Option<Tensor>> {
    match mask {
        Some(mask) => Ok(Some(mask.pad_with_zeros(D::Minus1, 0, 1)?)),
        None => Ok(None),
    }
}

/// Multi-head attention over `(L, N, E)` sequences (`(N, L, E)` when `batch_first`).
///
/// `attn_mask` is an additive float mask of shape `(L, S)` or `(N * num_heads, L, S)`.
/// Returns the attention output and, when requested, the attention weights averaged over
/// heads with shape `(N, L, S)`.
pub fn multi_head_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    attn_mask: Option<&Tensor>,
    params: &AttentionParameters,
    options: &AttentionOptions,
) -> NasResult<(Tensor, Option<Tensor>)> {
    let (query, key, value) = if options.batch_first {
        (
            query.transpose(0, 1)?.contiguous()?,
            key.transpose(0, 1)?.contiguous()?,
            value.transpose(0, 1)?.contiguous()?,
        )
    } else {
        (query.clone(), key.clone(), value.clone())
    };
    let (tgt_len, bsz, _) = query.dims3()?;
    let embed_dim = params.q_proj.dim(0)?;
    let num_heads = options.num_heads;
    if num_heads == 0 || embed_dim % num_heads != 0 {
        return Err(NasError::InvalidArgument {
            operator: "MultiheadAttention".to_string(),
            argument: "num_heads".to_string(),
            reason: format!(
                "embed_dim {} is not divisible by num_heads {}",
                embed_dim, num_heads
            ),
        });
    }
    let head_dim = embed_dim / num_heads;
    let (q_bias, k_bias, v_bias) = match &params.in_proj_bias {
        Some((q, k, v)) => (Some(q), Some(k), Some(v)),
        None => (None, None, None),
    };
    let q = linear(&query, &params.q_proj, q_bias)?;
    let mut k = linear(&key, &params.k_proj, k_bias)?;
    let mut v = linear(&value, &params.v_proj, v_bias)?;
    let mut mask = attn_mask.cloned();

    if let (Some(bias_k), Some(bias_v)) = (&params.bias_k, &params.bias_v) {
        let bias_k = bias_k.broadcast_as((1, bsz, embed_dim))?.contiguous()?;
        let bias_v = bias_v.broadcast_as((1, bsz, embed_dim))?.contiguous()?;
        k = Tensor::cat(&[&k, &bias_k], 0)?;
        v = Tensor::cat(&[&v, &bias_v], 0)?;
        mask = pad_mask(mask)?;
    }

    let q = q
        .affine((head_dim as f64).powf(-0.5), 0.0)?
        .contiguous()?
        .reshape((tgt_len, bsz * num_heads, head_dim))?
        .transpose(0, 1)?
        .contiguous()?;
    let src_len = k.dim(0)?;
    let mut k = k
        .contiguous()?
        .reshape((src_len, bsz * num_heads, head_dim))?
        .transpose(0, 1)?
        .contiguous()?;
    let mut v = v
        .contiguous()?
        .reshape((src_len, bsz * num_heads, head_dim))?
        .transpose(0, 1)?
        .contiguous()?;

    if options.add_zero_attn {
        let zeros = Tensor::zeros((bsz * num_heads, 1, head_dim), k.dtype(), k.device())?;
        k = Tensor::cat(&[&k, &zeros], 1)?;
        v = Tensor::cat(&[&v, &zeros], 1)?;
        mask = pad_mask(mask)?;
    }
    let src_len = k.dim(1)?;

    let mut scores = q.matmul(&k.transpose(1, 2)?.contiguous()?)?;
    if let Some(mask) = &mask {
        scores = scores.broadcast_add(mask)?;
    }
    let mut attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
    if options.training && options.dropout > 0.0 {
        attn = candle_nn::ops::dropout(&attn, options.dropout as f32)?;
    }

    let out = attn
        .matmul(&v)?
        .transpose(0, 1)?
        .contiguous()?
        .reshape((tgt_len, bsz, embed_dim))?;
    let out = linear(&out, &params.out_proj_weight, params.out_proj_bias.as_ref())?;
    let out = if options.batch_first {
        out.transpose(0, 1)?.contiguous()?
    } else {
        out
    };
    let weights = if options.need_weights {
        Some(
            attn.reshape((bsz, num_heads, tgt_len, src_len))?
                .mean(1)?,
        )
    } else {
        None
    };
    Ok((out, weights))
}
