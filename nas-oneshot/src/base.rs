use anyhow::{anyhow, Result};
use candle_core::{backprop::GradStore, DType, Tensor, Var};
use candle_nn::Optimizer;
use nas_supermodule::nn::{named_parameters, Module};

/// A training batch together with a held-out batch for the architecture phase.
#[derive(Clone, Debug)]
pub struct PairedBatch<B> {
    pub train: B,
    pub val: B,
}

#[derive(Clone, Debug)]
pub struct StepOutput {
    pub loss: Tensor,
}

impl From<Tensor> for StepOutput {
    fn from(loss: Tensor) -> Self {
        Self { loss }
    }
}

/// The user's model and how it is trained. The search wraps it and drives both phases
/// through `training_step`.
pub trait TrainingModule {
    type Batch: Clone;

    fn model(&self) -> &dyn Module;

    fn model_mut(&mut self) -> &mut dyn Module;

    fn training_step(&mut self, batch: &Self::Batch, batch_idx: usize) -> Result<StepOutput>;

    /// Optimizers over `parameters`, the model weights with every architecture weight
    /// filtered out.
    fn configure_optimizers(&mut self, parameters: Vec<Var>) -> Result<OptimizerConfig>;

    fn on_epoch_start(&mut self, _epoch: usize) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _epoch: usize) -> Result<()> {
        Ok(())
    }
}

/// Object-safe view of a `candle_nn::Optimizer`.
pub trait WeightOptimizer {
    fn step(&mut self, grads: &GradStore) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

impl<O: Optimizer> WeightOptimizer for O {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        Ok(Optimizer::step(self, grads)?)
    }

    fn learning_rate(&self) -> f64 {
        Optimizer::learning_rate(self)
    }

    fn set_learning_rate(&mut self, lr: f64) {
        Optimizer::set_learning_rate(self, lr)
    }
}

pub trait LrScheduler {
    fn step(&mut self, optimizer: &mut dyn WeightOptimizer);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerInterval {
    Step,
    Epoch,
}

pub struct SchedulerConfig {
    pub scheduler: Box<dyn LrScheduler>,
    pub interval: SchedulerInterval,
    /// Advance once every `frequency` intervals.
    pub frequency: usize,
    /// Index of the optimizer the scheduler drives.
    pub optimizer: usize,
}

impl SchedulerConfig {
    pub fn new<S: LrScheduler + 'static>(scheduler: S) -> Self {
        Self {
            scheduler: Box::new(scheduler),
            interval: SchedulerInterval::Epoch,
            frequency: 1,
            optimizer: 0,
        }
    }

    pub fn with_interval(mut self, interval: SchedulerInterval) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_frequency(mut self, frequency: usize) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn for_optimizer(mut self, optimizer: usize) -> Self {
        self.optimizer = optimizer;
        self
    }
}

#[derive(Default)]
pub struct OptimizerConfig {
    pub optimizers: Vec<Box<dyn WeightOptimizer>>,
    pub schedulers: Vec<SchedulerConfig>,
}

impl OptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimizer<O: WeightOptimizer + 'static>(mut self, optimizer: O) -> Self {
        self.optimizers.push(Box::new(optimizer));
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        for optimizer in self.optimizers.iter_mut() {
            optimizer.step(grads)?;
        }
        Ok(())
    }

    /// Advances every scheduler of `interval` whose frequency divides `index + 1`.
    pub fn advance_schedulers(&mut self, interval: SchedulerInterval, index: usize) -> Result<()> {
        let num_optimizers = self.optimizers.len();
        for config in self.schedulers.iter_mut() {
            if config.interval != interval || (index + 1) % config.frequency.max(1) != 0 {
                continue;
            }
            let optimizer = self.optimizers.get_mut(config.optimizer).ok_or_else(|| {
                anyhow!(
                    "Scheduler drives optimizer {} but only {} are configured",
                    config.optimizer,
                    num_optimizers
                )
            })?;
            config.scheduler.step(optimizer.as_mut());
        }
        Ok(())
    }
}

/// Backward pass of `loss` keeping only the gradients of one parameter partition.
///
/// Gradients of the other partition are removed from the store. Gradients of tensors
/// that belong to neither (such as path gates) are kept for `finalize_grad`.
pub fn manual_backward(loss: &Tensor, root: &dyn Module, arch: bool) -> Result<GradStore> {
    let mut grads = loss.backward()?;
    for (_, var) in named_parameters(root, !arch) {
        grads.remove(var.as_tensor());
    }
    Ok(grads)
}

/// Scalar value of a loss tensor of any float dtype.
pub fn loss_value(loss: &Tensor) -> Result<f32> {
    Ok(loss.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?)
}

/// Parameters of one partition, de-duplicated by identity.
pub fn partition_vars(root: &dyn Module, arch: bool) -> Vec<Var> {
    named_parameters(root, arch)
        .into_iter()
        .map(|(_, var)| var)
        .collect()
}
