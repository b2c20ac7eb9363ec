use candle_core::{DType, Device, Var};
use candle_nn::Optimizer;
use nas_oneshot::{
    Adam, LrScheduler, OptimizerConfig, ParamsAdam, SchedulerConfig, SchedulerInterval, StepLr,
};
use nas_structs::config::DartsConfig;

#[test]
fn test_adam_minimizes_quadratic() {
    let device = Device::Cpu;
    let x = Var::zeros(1, DType::F32, &device).unwrap();
    let mut adam = Adam::new(
        vec![x.clone()],
        ParamsAdam {
            lr: 0.1,
            ..ParamsAdam::default()
        },
    )
    .unwrap();
    for _ in 0..1000 {
        let loss = (x.as_tensor() - 3.0).unwrap().sqr().unwrap().sum_all().unwrap();
        adam.backward_step(&loss).unwrap();
    }
    let value = x.to_vec1::<f32>().unwrap()[0];
    assert!((value - 3.0).abs() < 0.1);
}

#[test]
fn test_adam_weight_decay_shrinks_without_signal() {
    let device = Device::Cpu;
    let x = Var::new(&[1f32, -1.0], &device).unwrap();
    let mut adam = Adam::new(
        vec![x.clone()],
        ParamsAdam {
            lr: 0.01,
            weight_decay: 1.0,
            ..ParamsAdam::default()
        },
    )
    .unwrap();
    // a loss that is flat in x still produces a zero gradient entry
    let loss = x.as_tensor().affine(0.0, 0.0).unwrap().sum_all().unwrap();
    adam.backward_step(&loss).unwrap();
    let values = x.to_vec1::<f32>().unwrap();
    assert!(values[0] < 1.0 && values[1] > -1.0);
}

#[test]
fn test_adam_skips_parameters_without_gradient() {
    let device = Device::Cpu;
    let used = Var::ones(2, DType::F32, &device).unwrap();
    let unused = Var::ones(2, DType::F32, &device).unwrap();
    let mut adam = Adam::new(vec![used.clone(), unused.clone()], ParamsAdam::default()).unwrap();
    let loss = used.as_tensor().sum_all().unwrap();
    adam.backward_step(&loss).unwrap();
    assert_eq!(unused.to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
    assert!(used.to_vec1::<f32>().unwrap()[0] < 1.0);
}

#[test]
fn test_architecture_params() {
    let params = ParamsAdam::architecture(&DartsConfig::default());
    assert_eq!(params.lr, 3e-4);
    assert_eq!((params.beta1, params.beta2), (0.5, 0.999));
    assert_eq!(params.weight_decay, 1e-3);
    assert_eq!(params.eps, 1e-8);
}

#[test]
fn test_step_lr() {
    let device = Device::Cpu;
    let mut sgd = candle_nn::SGD::new(vec![Var::zeros(1, DType::F32, &device).unwrap()], 1.0).unwrap();
    let mut scheduler = StepLr::new(3, 0.1);
    for _ in 0..2 {
        scheduler.step(&mut sgd);
    }
    assert_eq!(sgd.learning_rate(), 1.0);
    scheduler.step(&mut sgd);
    assert!((sgd.learning_rate() - 0.1).abs() < 1e-12);
}

#[test]
fn test_scheduler_frequency_and_interval() {
    let device = Device::Cpu;
    let sgd = candle_nn::SGD::new(vec![Var::zeros(1, DType::F32, &device).unwrap()], 1.0).unwrap();
    let mut config = OptimizerConfig::new().with_optimizer(sgd).with_scheduler(
        SchedulerConfig::new(StepLr::new(1, 0.5))
            .with_interval(SchedulerInterval::Epoch)
            .with_frequency(2),
    );
    for epoch in 0..4 {
        config
            .advance_schedulers(SchedulerInterval::Epoch, epoch)
            .unwrap();
        // step interval never fires an epoch scheduler
        config
            .advance_schedulers(SchedulerInterval::Step, epoch)
            .unwrap();
    }
    assert!((config.optimizers[0].learning_rate() - 0.25).abs() < 1e-12);
}

#[test]
fn test_scheduler_for_missing_optimizer() {
    let mut config = OptimizerConfig::new()
        .with_scheduler(SchedulerConfig::new(StepLr::new(1, 0.5)).for_optimizer(1));
    assert!(config
        .advance_schedulers(SchedulerInterval::Epoch, 0)
        .is_err());
}
