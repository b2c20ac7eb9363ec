use crate::{LrScheduler, WeightOptimizer};
use candle_core::{backprop::GradStore, Result, Var};
use candle_nn::Optimizer;
use nas_structs::config::DartsConfig;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// L2 penalty folded into the gradient before the moment updates.
    pub weight_decay: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl ParamsAdam {
    /// Settings of the optimizer that owns every architecture weight.
    pub fn architecture(config: &DartsConfig) -> Self {
        Self {
            lr: config.arc_learning_rate,
            beta1: config.arc_betas.0,
            beta2: config.arc_betas.1,
            eps: config.arc_eps,
            weight_decay: config.arc_weight_decay,
        }
    }
}

struct VarAdam {
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

/// Adam with coupled (L2) weight decay.
pub struct Adam {
    vars: Vec<VarAdam>,
    step_t: usize,
    params: ParamsAdam,
}

impl Adam {
    pub fn params(&self) -> &ParamsAdam {
        &self.params
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarAdam {
                    var,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let ParamsAdam {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let scale_m = 1.0 / (1.0 - beta1.powi(self.step_t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(self.step_t as i32));
        for state in &self.vars {
            let theta = state.var.as_tensor();
            let grad = match grads.get(theta) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = if weight_decay != 0.0 {
                (grad + (theta * weight_decay)?)?
            } else {
                grad.clone()
            };
            let m = ((state.first_moment.as_tensor() * beta1)? + (&grad * (1.0 - beta1))?)?;
            let v = ((state.second_moment.as_tensor() * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&m * scale_m)?;
            let v_hat = (&v * scale_v)?;
            let update = ((m_hat / (v_hat.sqrt()? + eps)?)? * lr)?;
            state.var.set(&(theta - update)?)?;
            state.first_moment.set(&m)?;
            state.second_moment.set(&v)?;
        }
        Ok(())
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` calls.
#[derive(Clone, Debug)]
pub struct StepLr {
    step_size: usize,
    gamma: f64,
    calls: usize,
}

impl StepLr {
    pub fn new(step_size: usize, gamma: f64) -> Self {
        Self {
            step_size: step_size.max(1),
            gamma,
            calls: 0,
        }
    }
}

impl LrScheduler for StepLr {
    fn step(&mut self, optimizer: &mut dyn WeightOptimizer) {
        self.calls += 1;
        if self.calls % self.step_size == 0 {
            optimizer.set_learning_rate(optimizer.learning_rate() * self.gamma);
        }
    }
}
