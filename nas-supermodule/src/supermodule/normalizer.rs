use crate::NasResult;
use candle_core::{Tensor, D};
use std::fmt;

/// Turns architecture logits into mixing weights along the last dimension.
pub trait Normalizer: fmt::Debug {
    fn normalize(&self, logits: &Tensor) -> NasResult<Tensor>;

    fn set_temperature(&mut self, _temperature: f64) {}

    fn temperature(&self) -> Option<f64> {
        None
    }

    fn box_clone(&self) -> Box<dyn Normalizer>;
}

impl Clone for Box<dyn Normalizer> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Softmax;

impl Normalizer for Softmax {
    fn normalize(&self, logits: &Tensor) -> NasResult<Tensor> {
        Ok(candle_nn::ops::softmax(logits, D::Minus1)?)
    }

    fn box_clone(&self) -> Box<dyn Normalizer> {
        Box::new(*self)
    }
}

/// Gumbel-softmax relaxation: `softmax((logits + g) / tau)` with `g` drawn from
/// Gumbel(0, 1) on every call.
///
/// With `hard` set the forward value is the one-hot arg-max while gradients flow through
/// the soft sample.
#[derive(Clone, Copy, Debug)]
pub struct GumbelSoftmax {
    pub tau: f64,
    pub hard: bool,
}

impl Default for GumbelSoftmax {
    fn default() -> Self {
        Self {
            tau: 1.0,
            hard: false,
        }
    }
}

impl GumbelSoftmax {
    pub fn new(tau: f64, hard: bool) -> Self {
        Self { tau, hard }
    }
}

impl Normalizer for GumbelSoftmax {
    fn normalize(&self, logits: &Tensor) -> NasResult<Tensor> {
        let uniform = Tensor::rand(1e-10f32, 1.0 - 1e-7, logits.shape(), logits.device())?
            .to_dtype(logits.dtype())?;
        let gumbels = uniform.log()?.neg()?.log()?.neg()?;
        let y_soft = candle_nn::ops::softmax(
            &logits.add(&gumbels)?.affine(1.0 / self.tau, 0.0)?,
            D::Minus1,
        )?;
        if !self.hard {
            return Ok(y_soft);
        }
        let n = logits.dim(D::Minus1)?;
        let index = y_soft.argmax_keepdim(D::Minus1)?;
        let positions = Tensor::arange(0u32, n as u32, logits.device())?;
        let y_hard = index.broadcast_eq(&positions)?.to_dtype(y_soft.dtype())?;
        Ok(y_hard.sub(&y_soft.detach())?.add(&y_soft)?)
    }

    fn set_temperature(&mut self, temperature: f64) {
        self.tau = temperature;
    }

    fn temperature(&self) -> Option<f64> {
        Some(self.tau)
    }

    fn box_clone(&self) -> Box<dyn Normalizer> {
        Box::new(*self)
    }
}
