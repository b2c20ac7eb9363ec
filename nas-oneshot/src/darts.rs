use crate::{
    loss_value, manual_backward, partition_vars, Adam, OptimizerConfig, PairedBatch, ParamsAdam,
    SchedulerInterval, StepOutput, TrainingModule,
};
use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_nn::Optimizer;
use log::{debug, info, log_enabled, Level};
use nas_structs::config::{DartsConfig, GumbelDartsConfig};
use nas_supermodule::{
    nn::Module,
    supermodule::{
        export_all, finalize_grad_all, hook, native_mixed_operations, resample_all,
        search_space_spec_all, set_temperature_all, traverse_and_mutate_submodules, Decisions,
        DifferentiableMixedInput, DifferentiableMixedLayer, GumbelSoftmax,
        MixedOpDifferentiablePolicy, MutateKwargs, MutationHook, ProxylessMixedInput,
        ProxylessMixedLayer,
    },
    ParameterSpec,
};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, marker::PhantomData};

/// What distinguishes one member of the DARTS family: the surrogates it mutates into,
/// the normalizer it injects and how it adjusts architecture gradients.
pub trait DartsStrategy {
    const NAME: &'static str;

    type Config: Clone;

    fn from_hyperparameters(hyperparameters: &Option<Map<String, Value>>) -> Result<Self::Config>;

    fn darts_config(config: &Self::Config) -> &DartsConfig;

    fn default_mutation_hooks() -> Vec<Box<dyn MutationHook>>;

    fn mutate_kwargs(config: &Self::Config) -> MutateKwargs;

    fn finalize_grad(_model: &dyn Module, _grads: &mut GradStore) -> Result<()> {
        Ok(())
    }

    fn on_epoch_start(
        _model: &mut dyn Module,
        _config: &Self::Config,
        _epoch: usize,
        _max_epochs: usize,
    ) -> Result<()> {
        Ok(())
    }
}

fn differentiable_hooks() -> Vec<Box<dyn MutationHook>> {
    let mut hooks = vec![
        hook::<DifferentiableMixedLayer>(),
        hook::<DifferentiableMixedInput>(),
    ];
    hooks.extend(native_mixed_operations());
    hooks
}

/// First-order DARTS: softmax over architecture weights, every path runs.
pub struct Darts;

impl DartsStrategy for Darts {
    const NAME: &'static str = "darts";

    type Config = DartsConfig;

    fn from_hyperparameters(hyperparameters: &Option<Map<String, Value>>) -> Result<DartsConfig> {
        DartsConfig::from_hyperparameters(hyperparameters)
    }

    fn darts_config(config: &DartsConfig) -> &DartsConfig {
        config
    }

    fn default_mutation_hooks() -> Vec<Box<dyn MutationHook>> {
        differentiable_hooks()
    }

    fn mutate_kwargs(config: &DartsConfig) -> MutateKwargs {
        MutateKwargs::new(config.seed).with_mixed_op_sampling(MixedOpDifferentiablePolicy::factory)
    }
}

/// ProxylessNAS: one sampled path per forward, architecture gradient from binary gates.
/// Mixed operations are not searched.
pub struct Proxyless;

impl DartsStrategy for Proxyless {
    const NAME: &'static str = "proxyless";

    type Config = DartsConfig;

    fn from_hyperparameters(hyperparameters: &Option<Map<String, Value>>) -> Result<DartsConfig> {
        DartsConfig::from_hyperparameters(hyperparameters)
    }

    fn darts_config(config: &DartsConfig) -> &DartsConfig {
        config
    }

    fn default_mutation_hooks() -> Vec<Box<dyn MutationHook>> {
        vec![hook::<ProxylessMixedLayer>(), hook::<ProxylessMixedInput>()]
    }

    fn mutate_kwargs(config: &DartsConfig) -> MutateKwargs {
        MutateKwargs::new(config.seed)
    }

    fn finalize_grad(model: &dyn Module, grads: &mut GradStore) -> Result<()> {
        Ok(finalize_grad_all(model, grads)?)
    }
}

/// SNAS: DARTS with a Gumbel-softmax normalizer whose temperature may anneal per epoch.
pub struct GumbelDarts;

impl DartsStrategy for GumbelDarts {
    const NAME: &'static str = "gumbel_darts";

    type Config = GumbelDartsConfig;

    fn from_hyperparameters(
        hyperparameters: &Option<Map<String, Value>>,
    ) -> Result<GumbelDartsConfig> {
        GumbelDartsConfig::from_hyperparameters(hyperparameters)
    }

    fn darts_config(config: &GumbelDartsConfig) -> &DartsConfig {
        &config.darts
    }

    fn default_mutation_hooks() -> Vec<Box<dyn MutationHook>> {
        differentiable_hooks()
    }

    fn mutate_kwargs(config: &GumbelDartsConfig) -> MutateKwargs {
        MutateKwargs::new(config.darts.seed)
            .with_mixed_op_sampling(MixedOpDifferentiablePolicy::factory)
            .with_softmax(Box::new(GumbelSoftmax::new(config.gumbel_temperature, false)))
    }

    fn on_epoch_start(
        model: &mut dyn Module,
        config: &GumbelDartsConfig,
        epoch: usize,
        max_epochs: usize,
    ) -> Result<()> {
        let temperature = config.temperature_at(epoch, max_epochs);
        info!("Epoch {}: gumbel temperature {:.4}", epoch, temperature);
        Ok(set_temperature_all(model, temperature)?)
    }
}

/// A user training module whose choice points were replaced by surrogates, trained
/// with alternating architecture and weight phases.
pub struct OneShotModule<M: TrainingModule, S: DartsStrategy> {
    module: M,
    config: S::Config,
    architecture_optimizer: Adam,
    optimizers: OptimizerConfig,
    mutated: Vec<String>,
    _strategy: PhantomData<S>,
}

pub type DartsModule<M> = OneShotModule<M, Darts>;
pub type ProxylessModule<M> = OneShotModule<M, Proxyless>;
pub type GumbelDartsModule<M> = OneShotModule<M, GumbelDarts>;

impl<M: TrainingModule, S: DartsStrategy> OneShotModule<M, S> {
    pub fn new(module: M, config: S::Config) -> Result<Self> {
        Self::with_mutation_hooks(module, config, S::default_mutation_hooks())
    }

    pub fn from_hyperparameters(
        module: M,
        hyperparameters: &Option<Map<String, Value>>,
    ) -> Result<Self> {
        Self::new(module, S::from_hyperparameters(hyperparameters)?)
    }

    /// Mutates the model with `hooks`, then builds the architecture optimizer over every
    /// architecture weight and asks the user module for optimizers over the rest.
    pub fn with_mutation_hooks(
        mut module: M,
        config: S::Config,
        hooks: Vec<Box<dyn MutationHook>>,
    ) -> Result<Self> {
        let kwargs = S::mutate_kwargs(&config);
        let mutated = traverse_and_mutate_submodules(module.model_mut(), &hooks, &kwargs)?;
        let arch_vars = partition_vars(module.model(), true);
        info!(
            "{}: mutated {} modules, {} architecture tensors",
            S::NAME,
            mutated.len(),
            arch_vars.len()
        );
        let architecture_optimizer = Adam::new(
            arch_vars,
            ParamsAdam::architecture(S::darts_config(&config)),
        )?;
        let optimizers = module.configure_optimizers(partition_vars(module.model(), false))?;
        Ok(Self {
            module,
            config,
            architecture_optimizer,
            optimizers,
            mutated,
            _strategy: PhantomData,
        })
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn model(&self) -> &dyn Module {
        self.module.model()
    }

    pub fn config(&self) -> &S::Config {
        &self.config
    }

    /// Paths of the modules replaced by surrogates.
    pub fn mutated(&self) -> &[String] {
        &self.mutated
    }

    pub fn architecture_optimizer(&self) -> &Adam {
        &self.architecture_optimizer
    }

    pub fn optimizers(&self) -> &OptimizerConfig {
        &self.optimizers
    }

    pub fn resample(&mut self) -> Result<Decisions> {
        Ok(resample_all(self.module.model_mut())?)
    }

    /// One architecture step on `batch.val` followed by one weight step on `batch.train`.
    /// Returns the output of the weight phase.
    pub fn training_step(
        &mut self,
        batch: &PairedBatch<M::Batch>,
        batch_idx: usize,
    ) -> Result<StepOutput> {
        self.resample()?;
        let arch_loss = self.module.training_step(&batch.val, 2 * batch_idx)?.loss;
        let mut grads = manual_backward(&arch_loss, self.module.model(), true)?;
        S::finalize_grad(self.module.model(), &mut grads)?;
        Optimizer::step(&mut self.architecture_optimizer, &grads)?;

        self.resample()?;
        let output = self.module.training_step(&batch.train, 2 * batch_idx + 1)?;
        let grads = manual_backward(&output.loss, self.module.model(), false)?;
        self.optimizers.step(&grads)?;
        self.optimizers
            .advance_schedulers(SchedulerInterval::Step, batch_idx)?;

        if log_enabled!(Level::Debug) {
            debug!(
                "Batch {}: architecture loss {:.4}, weight loss {:.4}",
                batch_idx,
                loss_value(&arch_loss)?,
                loss_value(&output.loss)?
            );
        }
        Ok(output)
    }

    pub fn on_epoch_start(&mut self, epoch: usize, max_epochs: usize) -> Result<()> {
        S::on_epoch_start(self.module.model_mut(), &self.config, epoch, max_epochs)?;
        self.module.on_epoch_start(epoch)
    }

    pub fn on_epoch_end(&mut self, epoch: usize) -> Result<()> {
        self.optimizers
            .advance_schedulers(SchedulerInterval::Epoch, epoch)?;
        self.module.on_epoch_end(epoch)
    }

    /// The final decision for every label.
    pub fn export(&self) -> Result<Decisions> {
        Ok(export_all(self.module.model())?)
    }

    pub fn search_space_spec(&self) -> BTreeMap<String, ParameterSpec> {
        search_space_spec_all(self.module.model())
    }
}
