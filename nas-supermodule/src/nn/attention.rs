use super::{
    functional::{self, AttentionOptions, AttentionParameters},
    has_choice, resolve_arguments, uniform_var, ArgReader, Kwargs, Module, Traceable,
};
use crate::{kwargs, NasError, NasResult};
use candle_core::{DType, Device, Tensor, Var};
use std::any::Any;

fn xavier_uniform(rows: usize, cols: usize, device: &Device) -> NasResult<Var> {
    let bound = (6.0 / (rows + cols).max(1) as f64).sqrt();
    uniform_var(bound, &[rows, cols], device)
}

/// Q/K/V input projection. Packed as one `(3E, E)` matrix while the three inputs share
/// `embed_dim`, separate otherwise.
pub enum InProjection {
    Packed(Var),
    Separate { q: Var, k: Var, v: Var },
}

pub struct AttentionParams {
    pub in_proj: InProjection,
    /// `(3E)`, laid out as q, k, v blocks.
    pub in_proj_bias: Option<Var>,
    pub bias_k: Option<Var>,
    pub bias_v: Option<Var>,
    pub out_proj_weight: Var,
    pub out_proj_bias: Option<Var>,
}

impl AttentionParams {
    pub fn new(
        embed_dim: usize,
        kdim: usize,
        vdim: usize,
        bias: bool,
        add_bias_kv: bool,
        device: &Device,
    ) -> NasResult<Self> {
        let in_proj = if kdim == embed_dim && vdim == embed_dim {
            InProjection::Packed(xavier_uniform(3 * embed_dim, embed_dim, device)?)
        } else {
            InProjection::Separate {
                q: xavier_uniform(embed_dim, embed_dim, device)?,
                k: xavier_uniform(embed_dim, kdim, device)?,
                v: xavier_uniform(embed_dim, vdim, device)?,
            }
        };
        let (in_proj_bias, out_proj_bias) = if bias {
            (
                Some(Var::zeros(3 * embed_dim, DType::F32, device)?),
                Some(Var::zeros(embed_dim, DType::F32, device)?),
            )
        } else {
            (None, None)
        };
        let (bias_k, bias_v) = if add_bias_kv {
            let bound = (6.0 / (2 * embed_dim).max(1) as f64).sqrt();
            (
                Some(uniform_var(bound, &[1, 1, embed_dim], device)?),
                Some(uniform_var(bound, &[1, 1, embed_dim], device)?),
            )
        } else {
            (None, None)
        };
        let out_bound = 1.0 / (embed_dim.max(1) as f64).sqrt();
        Ok(Self {
            in_proj,
            in_proj_bias,
            bias_k,
            bias_v,
            out_proj_weight: uniform_var(out_bound, &[embed_dim, embed_dim], device)?,
            out_proj_bias,
        })
    }

    pub fn is_packed(&self) -> bool {
        matches!(self.in_proj, InProjection::Packed(_))
    }

    /// Replaces a packed in-projection with freshly initialised separate Q/K/V
    /// projections. No-op when already separate.
    pub fn materialize_separate_projections(
        &mut self,
        embed_dim: usize,
        kdim: usize,
        vdim: usize,
        device: &Device,
    ) -> NasResult<()> {
        if self.is_packed() {
            self.in_proj = InProjection::Separate {
                q: xavier_uniform(embed_dim, embed_dim, device)?,
                k: xavier_uniform(embed_dim, kdim, device)?,
                v: xavier_uniform(embed_dim, vdim, device)?,
            };
        }
        Ok(())
    }

    /// Full-size Q/K/V projection matrices, splitting a packed projection into its
    /// three `embed_dim` row blocks.
    pub fn projections(&self) -> NasResult<(Tensor, Tensor, Tensor)> {
        match &self.in_proj {
            InProjection::Packed(w) => {
                let e = w.dim(1)?;
                Ok((w.narrow(0, 0, e)?, w.narrow(0, e, e)?, w.narrow(0, 2 * e, e)?))
            }
            InProjection::Separate { q, k, v } => Ok((
                q.as_tensor().clone(),
                k.as_tensor().clone(),
                v.as_tensor().clone(),
            )),
        }
    }

    pub fn in_biases(&self) -> NasResult<Option<(Tensor, Tensor, Tensor)>> {
        match &self.in_proj_bias {
            Some(b) => {
                let e = b.dim(0)? / 3;
                Ok(Some((b.narrow(0, 0, e)?, b.narrow(0, e, e)?, b.narrow(0, 2 * e, e)?)))
            }
            None => Ok(None),
        }
    }

    pub fn named(&self) -> Vec<(String, Var)> {
        let mut params = Vec::new();
        match &self.in_proj {
            InProjection::Packed(w) => params.push(("in_proj_weight".to_string(), w.clone())),
            InProjection::Separate { q, k, v } => {
                params.push(("q_proj_weight".to_string(), q.clone()));
                params.push(("k_proj_weight".to_string(), k.clone()));
                params.push(("v_proj_weight".to_string(), v.clone()));
            }
        }
        let optional = [
            ("in_proj_bias", &self.in_proj_bias),
            ("bias_k", &self.bias_k),
            ("bias_v", &self.bias_v),
        ];
        for (name, var) in optional {
            if let Some(var) = var {
                params.push((name.to_string(), var.clone()));
            }
        }
        params.push(("out_proj.weight".to_string(), self.out_proj_weight.clone()));
        if let Some(bias) = &self.out_proj_bias {
            params.push(("out_proj.bias".to_string(), bias.clone()));
        }
        params
    }

    fn full_size(&self) -> NasResult<AttentionParameters> {
        let (q_proj, k_proj, v_proj) = self.projections()?;
        Ok(AttentionParameters {
            q_proj,
            k_proj,
            v_proj,
            in_proj_bias: self.in_biases()?,
            bias_k: self.bias_k.as_ref().map(|b| b.as_tensor().clone()),
            bias_v: self.bias_v.as_ref().map(|b| b.as_tensor().clone()),
            out_proj_weight: self.out_proj_weight.as_tensor().clone(),
            out_proj_bias: self.out_proj_bias.as_ref().map(|b| b.as_tensor().clone()),
        })
    }
}

/// Splits attention inputs: `[query]` is self-attention, `[query, key, value]` and
/// `[query, key, value, attn_mask]` are the general forms.
pub(crate) fn split_attention_inputs(
    module: &str,
    xs: &[Tensor],
) -> NasResult<(Tensor, Tensor, Tensor, Option<Tensor>)> {
    match xs {
        [q] => Ok((q.clone(), q.clone(), q.clone(), None)),
        [q, k, v] => Ok((q.clone(), k.clone(), v.clone(), None)),
        [q, k, v, mask] => Ok((q.clone(), k.clone(), v.clone(), Some(mask.clone()))),
        _ => Err(NasError::InputArity {
            module: module.to_string(),
            expected: 3,
            actual: xs.len(),
        }),
    }
}

pub struct MultiheadAttention {
    kwargs: Kwargs,
    device: Device,
    options: AttentionOptions,
    params: Option<AttentionParams>,
}

impl MultiheadAttention {
    pub fn new(embed_dim: usize, num_heads: usize, device: &Device) -> NasResult<Self> {
        Self::from_kwargs(
            kwargs! {
                "embed_dim" => embed_dim,
                "num_heads" => num_heads,
            },
            device,
        )
    }

    pub fn params(&self) -> Option<&AttentionParams> {
        self.params.as_ref()
    }

    pub fn into_params(self) -> NasResult<AttentionParams> {
        self.params.ok_or_else(|| NasError::UnresolvedChoice {
            module: Self::TYPE_NAME.to_string(),
        })
    }

    pub fn forward_with_weights(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> NasResult<(Tensor, Option<Tensor>)> {
        let params = self.params.as_ref().ok_or_else(|| NasError::UnresolvedChoice {
            module: Self::TYPE_NAME.to_string(),
        })?;
        let options = AttentionOptions {
            need_weights: true,
            ..self.options
        };
        functional::multi_head_attention(
            query,
            key,
            value,
            attn_mask,
            &params.full_size()?,
            &options,
        )
    }
}

impl Traceable for MultiheadAttention {
    const TYPE_NAME: &'static str = "MultiheadAttention";
    const REQUIRED_ARGUMENTS: &'static [&'static str] = &["embed_dim", "num_heads"];

    fn default_arguments() -> Kwargs {
        kwargs! {
            "dropout" => 0.0,
            "bias" => true,
            "add_bias_kv" => false,
            "add_zero_attn" => false,
            "kdim" => None::<usize>,
            "vdim" => None::<usize>,
            "batch_first" => false,
        }
    }

    fn from_kwargs(kwargs: Kwargs, device: &Device) -> NasResult<Self> {
        let resolved = resolve_arguments::<Self>(&kwargs)?;
        let args = ArgReader::new(Self::TYPE_NAME, &resolved);
        let mut options = AttentionOptions {
            num_heads: 1,
            dropout: 0.0,
            add_zero_attn: args.boolean("add_zero_attn")?,
            batch_first: args.boolean("batch_first")?,
            training: true,
            need_weights: false,
        };
        let params = if has_choice(&resolved) {
            None
        } else {
            options.num_heads = args.usize("num_heads")?;
            options.dropout = args.float("dropout")?;
            let embed_dim = args.usize("embed_dim")?;
            Some(AttentionParams::new(
                embed_dim,
                args.optional_usize("kdim")?.unwrap_or(embed_dim),
                args.optional_usize("vdim")?.unwrap_or(embed_dim),
                args.boolean("bias")?,
                args.boolean("add_bias_kv")?,
                device,
            )?)
        };
        Ok(Self {
            kwargs,
            device: device.clone(),
            options,
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

impl Module for MultiheadAttention {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor> {
        self.forward_many(std::slice::from_ref(xs))
    }

    fn forward_many(&self, xs: &[Tensor]) -> NasResult<Tensor> {
        let (query, key, value, mask) = split_attention_inputs(Self::TYPE_NAME, xs)?;
        let params = self.params.as_ref().ok_or_else(|| NasError::UnresolvedChoice {
            module: Self::TYPE_NAME.to_string(),
        })?;
        let (out, _) = functional::multi_head_attention(
            &query,
            &key,
            &value,
            mask.as_ref(),
            &params.full_size()?,
            &self.options,
        )?;
        Ok(out)
    }

    fn own_parameters(&self) -> Vec<(String, Var)> {
        self.params.as_ref().map(|p| p.named()).unwrap_or_default()
    }

    fn set_training(&mut self, training: bool) {
        self.options.training = training;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
