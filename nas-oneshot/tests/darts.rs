use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use candle_nn::Optimizer;
use nas_oneshot::{
    manual_backward, partition_vars, training_loop, DartsModule, GumbelDartsModule,
    InterleavedTrainVal, OptimizerConfig, PairedBatch, ProxylessModule, SchedulerConfig,
    SchedulerInterval, StepLr, StepOutput, TrainingModule,
};
use nas_structs::config::{DartsConfig, GumbelDartsConfig};
use nas_supermodule::{
    choice::{LayerChoice, ValueChoice},
    kwargs,
    nn::{Identity, Linear, Module, Sequential, Traceable},
    supermodule::{DifferentiableMixedLayer, ProxylessMixedLayer},
    ChoiceValue,
};
use serde_json::{json, Map, Value};

type Batch = (Tensor, Tensor);

struct ToyModule {
    model: Sequential,
    scheduler: Option<SchedulerConfig>,
    epochs_started: Vec<usize>,
}

impl ToyModule {
    fn new(device: &Device) -> Self {
        let model = Sequential::new()
            .add(LayerChoice::new(
                "op",
                vec![
                    Box::new(Linear::new(4, 4, true, device).unwrap()),
                    Box::new(Identity),
                ],
            ))
            .add(Linear::new(4, 1, true, device).unwrap());
        Self {
            model,
            scheduler: None,
            epochs_started: Vec::new(),
        }
    }

    fn with_width_choice(device: &Device) -> Self {
        let mut module = Self::new(device);
        module.model = Sequential::new()
            .add(
                Linear::from_kwargs(
                    kwargs! { "in_features" => 4usize, "out_features" => ValueChoice::new("w", [2, 4]) },
                    device,
                )
                .unwrap(),
            )
            .add(
                Linear::from_kwargs(
                    kwargs! { "in_features" => ValueChoice::new("w", [2, 4]), "out_features" => 1usize },
                    device,
                )
                .unwrap(),
            );
        module
    }
}

impl TrainingModule for ToyModule {
    type Batch = Batch;

    fn model(&self) -> &dyn Module {
        &self.model
    }

    fn model_mut(&mut self) -> &mut dyn Module {
        &mut self.model
    }

    fn training_step(&mut self, batch: &Batch, _batch_idx: usize) -> Result<StepOutput> {
        let (x, y) = batch;
        let out = self.model.forward(x)?;
        Ok(candle_nn::loss::mse(&out, y)?.into())
    }

    fn configure_optimizers(&mut self, parameters: Vec<Var>) -> Result<OptimizerConfig> {
        let mut config =
            OptimizerConfig::new().with_optimizer(candle_nn::SGD::new(parameters, 0.05)?);
        if let Some(scheduler) = self.scheduler.take() {
            config = config.with_scheduler(scheduler);
        }
        Ok(config)
    }

    fn on_epoch_start(&mut self, epoch: usize) -> Result<()> {
        self.epochs_started.push(epoch);
        Ok(())
    }
}

fn batch(device: &Device) -> Batch {
    let x = Tensor::randn(0f32, 1.0, (8, 4), device).unwrap();
    let y = Tensor::randn(0f32, 1.0, (8, 1), device).unwrap();
    (x, y)
}

fn values(vars: &[Var]) -> Vec<Vec<f32>> {
    vars.iter()
        .map(|v| v.flatten_all().unwrap().to_vec1::<f32>().unwrap())
        .collect()
}

#[test]
fn test_construction_partitions_parameters() {
    let device = Device::Cpu;
    let module = DartsModule::new(ToyModule::new(&device), DartsConfig::default()).unwrap();
    assert_eq!(module.mutated(), &["0".to_string()]);
    assert_eq!(module.architecture_optimizer().num_vars(), 1);
    assert_eq!(partition_vars(module.model(), false).len(), 4);
    assert_eq!(module.search_space_spec()["op"].size, 2);
}

#[test]
fn test_backward_is_isolated_per_partition() {
    let device = Device::Cpu;
    let module = DartsModule::new(ToyModule::new(&device), DartsConfig::default()).unwrap();
    let (x, y) = batch(&device);
    let loss = candle_nn::loss::mse(&module.model().forward(&x).unwrap(), &y).unwrap();

    let arch = partition_vars(module.model(), true);
    let weights = partition_vars(module.model(), false);

    let grads = manual_backward(&loss, module.model(), true).unwrap();
    assert!(arch.iter().all(|v| grads.get(v.as_tensor()).is_some()));
    assert!(weights.iter().all(|v| grads.get(v.as_tensor()).is_none()));

    let grads = manual_backward(&loss, module.model(), false).unwrap();
    assert!(arch.iter().all(|v| grads.get(v.as_tensor()).is_none()));
    assert!(weights.iter().all(|v| grads.get(v.as_tensor()).is_some()));
}

#[test]
fn test_training_step_updates_both_partitions() {
    let device = Device::Cpu;
    let mut module = DartsModule::new(ToyModule::new(&device), DartsConfig::default()).unwrap();
    let arch = partition_vars(module.model(), true);
    let weights = partition_vars(module.model(), false);
    let (arch_before, weights_before) = (values(&arch), values(&weights));

    let (train, val) = (batch(&device), batch(&device));
    module
        .training_step(&PairedBatch { train, val }, 0)
        .unwrap();
    assert_ne!(values(&arch), arch_before);
    assert_ne!(values(&weights), weights_before);
}

#[test]
fn test_mixed_operation_search() {
    let device = Device::Cpu;
    let mut module =
        DartsModule::new(ToyModule::with_width_choice(&device), DartsConfig::default()).unwrap();
    assert_eq!(module.mutated().len(), 2);
    assert_eq!(module.architecture_optimizer().num_vars(), 1);
    let (train, val) = (batch(&device), batch(&device));
    module
        .training_step(&PairedBatch { train, val }, 0)
        .unwrap();
    let exported = module.export().unwrap();
    assert!(matches!(exported["w"], ChoiceValue::Value(_)));
}

#[test]
fn test_export_is_stable() {
    let device = Device::Cpu;
    let module = DartsModule::new(ToyModule::new(&device), DartsConfig::default()).unwrap();
    let first = module.export().unwrap();
    assert_eq!(first, module.export().unwrap());
    let chosen = first["op"].as_name().unwrap();
    assert!(chosen == "0" || chosen == "1");
}

#[test]
fn test_proxyless_step() {
    let device = Device::Cpu;
    let mut module = ProxylessModule::new(ToyModule::new(&device), DartsConfig::default()).unwrap();
    assert_eq!(
        module.module().model.get(0).unwrap().type_name(),
        "ProxylessMixedLayer"
    );
    let arch = partition_vars(module.model(), true);
    let before = values(&arch);
    let (train, val) = (batch(&device), batch(&device));
    module
        .training_step(&PairedBatch { train, val }, 0)
        .unwrap();
    assert_ne!(values(&arch), before);

    let layer = module
        .module()
        .model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<ProxylessMixedLayer>()
        .unwrap();
    assert!(layer.sampled().is_some());
}

#[test]
fn test_proxyless_ignores_value_choices() {
    let device = Device::Cpu;
    let module =
        ProxylessModule::new(ToyModule::with_width_choice(&device), DartsConfig::default()).unwrap();
    assert!(module.mutated().is_empty());
}

#[test]
fn test_gumbel_temperature_annealing() {
    let device = Device::Cpu;
    let config = GumbelDartsConfig {
        use_temp_anneal: true,
        ..GumbelDartsConfig::default()
    };
    let mut module = GumbelDartsModule::new(ToyModule::new(&device), config).unwrap();
    let temperature = |module: &GumbelDartsModule<ToyModule>| {
        module
            .module()
            .model
            .get(0)
            .unwrap()
            .as_any()
            .downcast_ref::<DifferentiableMixedLayer>()
            .unwrap()
            .softmax()
            .temperature()
            .unwrap()
    };
    assert!((temperature(&module) - 1.0).abs() < 1e-9);

    module.on_epoch_start(5, 10).unwrap();
    assert!((temperature(&module) - 0.665).abs() < 1e-9);
    module.on_epoch_start(10, 10).unwrap();
    assert!((temperature(&module) - 0.33).abs() < 1e-9);
    assert_eq!(module.module().epochs_started, vec![5, 10]);
}

#[test]
fn test_from_hyperparameters() {
    let device = Device::Cpu;
    let hyperparameters: Option<Map<String, Value>> = match json!({ "arc_learning_rate": 0.01 }) {
        Value::Object(map) => Some(map),
        _ => None,
    };
    let module = DartsModule::from_hyperparameters(ToyModule::new(&device), &hyperparameters).unwrap();
    let params = module.architecture_optimizer().params();
    assert_eq!(params.lr, 0.01);
    assert_eq!(params.beta1, 0.5);
    assert_eq!(params.weight_decay, 1e-3);
    assert_eq!(module.architecture_optimizer().learning_rate(), 0.01);
}

#[test]
fn test_training_loop() {
    let device = Device::Cpu;
    let mut toy = ToyModule::new(&device);
    toy.scheduler = Some(
        SchedulerConfig::new(StepLr::new(2, 0.5)).with_interval(SchedulerInterval::Step),
    );
    let mut module = DartsModule::new(toy, DartsConfig::default()).unwrap();
    let data = InterleavedTrainVal::new(
        (0..3).map(|_| batch(&device)).collect(),
        (0..2).map(|_| batch(&device)).collect(),
    )
    .unwrap();
    assert_eq!(data.len(), 3);

    let losses = training_loop(&mut module, &data, 2).unwrap();
    assert_eq!(losses.len(), 2);
    assert!(losses.iter().all(|l| l.is_finite()));
    assert_eq!(module.module().epochs_started, vec![0, 1]);

    // six step calls halve the rate three times
    let lr = module.optimizers().optimizers[0].learning_rate();
    assert!((lr - 0.05 * 0.125).abs() < 1e-12);
}

#[test]
fn test_interleaved_cycles_shorter_list() {
    let data = InterleavedTrainVal::new(vec![1, 2, 3], vec![10]).unwrap();
    let pairs: Vec<(i32, i32)> = data.iter().map(|p| (p.train, p.val)).collect();
    assert_eq!(pairs, vec![(1, 10), (2, 10), (3, 10)]);
    assert!(InterleavedTrainVal::<i32>::new(vec![], vec![1]).is_err());
}
