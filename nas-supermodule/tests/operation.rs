use candle_core::{DType, Device, Tensor};
use nas_supermodule::{
    choice::ValueChoice,
    kwargs,
    nn::{
        functional,
        named_parameters, Arg, BatchNorm2d, Conv2d, Linear, Module, MultiheadAttention, Sequential,
        Traceable,
    },
    supermodule::{
        export_all, native_mixed_operations, search_space_spec_all, traverse_and_mutate_submodules,
        MixedBatchNorm2dOperation, MixedConv2dOperation, MixedLinearOperation,
        MixedMultiheadAttentionOperation, MixedOpDifferentiablePolicy, MutateKwargs,
        OperationArguments, SampledArgument, SampledArguments,
    },
    ChoiceValue, NasError, Scalar,
};
use std::collections::BTreeMap;

fn differentiable_kwargs() -> MutateKwargs {
    MutateKwargs::new(0).with_mixed_op_sampling(MixedOpDifferentiablePolicy::factory)
}

fn mutate(model: &mut Sequential) -> Vec<String> {
    traverse_and_mutate_submodules(model, &native_mixed_operations(), &differentiable_kwargs()).unwrap()
}

/// Every argument as constructed, with `overrides` fixed to concrete values.
fn concrete_args(
    operator: &'static str,
    arguments: &OperationArguments,
    overrides: &[(&str, Arg)],
) -> SampledArguments {
    let mut values: BTreeMap<String, SampledArgument> = arguments
        .init_arguments
        .iter()
        .map(|(k, v)| (k.clone(), SampledArgument::Concrete(v.clone())))
        .collect();
    for (name, arg) in overrides {
        values.insert(name.to_string(), SampledArgument::Concrete(arg.clone()));
    }
    SampledArguments::new(operator, values)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

fn conv_model(device: &Device) -> Sequential {
    let kernel = ValueChoice::new("k", [3, 5]);
    let conv = Conv2d::from_kwargs(
        kwargs! {
            "in_channels" => 3usize,
            "out_channels" => ValueChoice::new("out", [16, 32]),
            "kernel_size" => kernel.clone(),
            "padding" => kernel / 2,
        },
        device,
    )
    .unwrap();
    Sequential::new().add(conv)
}

#[test]
fn test_mixed_conv_superkernel() {
    let device = Device::Cpu;
    let mut model = conv_model(&device);
    assert_eq!(mutate(&mut model), vec!["0".to_string()]);
    let op = model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<MixedConv2dOperation>()
        .unwrap();
    assert_eq!(op.operator().params().weight.dims(), &[32, 3, 5, 5]);
    assert_eq!(op.arguments().mutable_arguments.len(), 3);

    let arch: Vec<String> = named_parameters(&model, true).into_iter().map(|(n, _)| n).collect();
    assert_eq!(
        arch,
        vec!["0._arch_alpha.k".to_string(), "0._arch_alpha.out".to_string()]
    );
    let spec = search_space_spec_all(&model);
    assert_eq!(spec.keys().cloned().collect::<Vec<_>>(), vec!["k", "out"]);
}

#[test]
fn test_mixed_conv_weighted_forward() {
    let device = Device::Cpu;
    let mut model = conv_model(&device);
    mutate(&mut model);
    let x = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device).unwrap();
    let out = model.forward(&x).unwrap();
    assert_eq!(out.dims(), &[2, 32, 8, 8]);
}

#[test]
fn test_mixed_conv_concrete_forward_matches_plain_conv() {
    let device = Device::Cpu;
    let kernel = ValueChoice::new("k", [3, 5]);
    let conv = Conv2d::from_kwargs(
        kwargs! {
            "in_channels" => ValueChoice::new("in", [2, 3]),
            "out_channels" => ValueChoice::new("out", [16, 32]),
            "kernel_size" => kernel.clone(),
            "padding" => kernel / 2,
        },
        &device,
    )
    .unwrap();
    let mut model = Sequential::new().add(conv);
    mutate(&mut model);
    let op = model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<MixedConv2dOperation>()
        .unwrap();
    assert_eq!(op.operator().params().weight.dims(), &[32, 3, 5, 5]);
    let args = concrete_args(
        "MixedConv2d",
        op.arguments(),
        &[
            ("in_channels", Arg::from(2usize)),
            ("out_channels", Arg::from(16usize)),
            ("kernel_size", Arg::from(3usize)),
            ("padding", Arg::from(1usize)),
        ],
    );
    let x = Tensor::randn(0f32, 1.0, (1, 2, 6, 6), &device).unwrap();
    let out = op.forward_with_args(&args, &[x.clone()]).unwrap();
    assert_eq!(out.dims(), &[1, 16, 6, 6]);

    let plain = Conv2d::from_kwargs(
        kwargs! {
            "in_channels" => 2usize,
            "out_channels" => 16usize,
            "kernel_size" => 3usize,
            "padding" => 1usize,
        },
        &device,
    )
    .unwrap();
    let params = op.operator().params();
    // first 16 filters, first 2 input channels, centre 3x3 of the 5x5 kernel
    let weight = params
        .weight
        .narrow(0, 0, 16)
        .unwrap()
        .narrow(1, 0, 2)
        .unwrap()
        .narrow(2, 1, 3)
        .unwrap()
        .narrow(3, 1, 3)
        .unwrap();
    let bias = params.bias.as_ref().unwrap().narrow(0, 0, 16).unwrap();
    let plain_params = plain.params().unwrap();
    plain_params.weight.set(&weight.contiguous().unwrap()).unwrap();
    plain_params.bias.as_ref().unwrap().set(&bias.contiguous().unwrap()).unwrap();

    let expected = plain.forward(&x).unwrap();
    assert!(max_abs_diff(&out, &expected) < 1e-5);
}

#[test]
fn test_mixed_conv_rejects_weighted_groups() {
    let device = Device::Cpu;
    let conv = Conv2d::from_kwargs(
        kwargs! {
            "in_channels" => 4usize,
            "out_channels" => 4usize,
            "kernel_size" => 3usize,
            "groups" => ValueChoice::new("g", [1, 2]),
        },
        &device,
    )
    .unwrap();
    let mut model = Sequential::new().add(conv);
    mutate(&mut model);
    let op = model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<MixedConv2dOperation>()
        .unwrap();
    // smallest groups gives the widest superkernel
    assert_eq!(op.operator().params().weight.dims(), &[4, 4, 3, 3]);
    let x = Tensor::randn(0f32, 1.0, (1, 4, 5, 5), &device).unwrap();
    assert!(matches!(
        model.forward(&x),
        Err(NasError::WeightedSamplingUnsupported { .. })
    ));
}

fn linear_model(device: &Device) -> Sequential {
    let hidden = ValueChoice::new("h", [2, 4]);
    Sequential::new()
        .add(
            Linear::from_kwargs(
                kwargs! { "in_features" => 3usize, "out_features" => hidden.clone() },
                device,
            )
            .unwrap(),
        )
        .add(
            Linear::from_kwargs(
                kwargs! { "in_features" => hidden, "out_features" => 1usize },
                device,
            )
            .unwrap(),
        )
}

#[test]
fn test_mixed_linear_shares_label_across_layers() {
    let device = Device::Cpu;
    let mut model = linear_model(&device);
    assert_eq!(mutate(&mut model).len(), 2);
    let arch = named_parameters(&model, true);
    assert_eq!(arch.len(), 1);
    assert_eq!(arch[0].0, "0._arch_alpha.h");

    let x = Tensor::randn(0f32, 1.0, (5, 3), &device).unwrap();
    assert_eq!(model.forward(&x).unwrap().dims(), &[5, 1]);

    arch[0]
        .1
        .set(&Tensor::new(&[2f32, -2.0], &device).unwrap())
        .unwrap();
    let exported = export_all(&model).unwrap();
    assert_eq!(exported.len(), 1);
    assert_eq!(exported["h"], ChoiceValue::Value(Scalar::Int(2)));
}

#[test]
fn test_mixed_linear_concrete_forward() {
    let device = Device::Cpu;
    let mut model = linear_model(&device);
    mutate(&mut model);
    let op = model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<MixedLinearOperation>()
        .unwrap();
    let args = concrete_args("MixedLinear", op.arguments(), &[("out_features", Arg::from(2usize))]);
    let x = Tensor::randn(0f32, 1.0, (5, 3), &device).unwrap();
    let out = op.forward_with_args(&args, &[x.clone()]).unwrap();
    let params = op.operator().params();
    let expected = functional::linear(
        &x,
        &params.weight.narrow(0, 0, 2).unwrap(),
        Some(&params.bias.as_ref().unwrap().narrow(0, 0, 2).unwrap()),
    )
    .unwrap();
    assert!(max_abs_diff(&out, &expected) < 1e-5);
}

#[test]
fn test_unsupported_argument() {
    let device = Device::Cpu;
    let linear = Linear::from_kwargs(
        kwargs! {
            "in_features" => 3usize,
            "out_features" => 2usize,
            "bias" => ValueChoice::new("b", [0, 1]),
        },
        &device,
    )
    .unwrap();
    let mut model = Sequential::new().add(linear);
    let result =
        traverse_and_mutate_submodules(&mut model, &native_mixed_operations(), &differentiable_kwargs());
    assert!(matches!(result, Err(NasError::UnsupportedArgument { .. })));
}

#[test]
fn test_missing_sampling_policy() {
    let device = Device::Cpu;
    let mut model = linear_model(&device);
    let result =
        traverse_and_mutate_submodules(&mut model, &native_mixed_operations(), &MutateKwargs::new(0));
    assert!(matches!(result, Err(NasError::MissingSamplingPolicy { .. })));
}

#[test]
fn test_fixed_layers_are_left_alone() {
    let device = Device::Cpu;
    let mut model = Sequential::new().add(Linear::new(3, 2, true, &device).unwrap());
    assert!(mutate(&mut model).is_empty());
    assert!(model.get(0).unwrap().as_any().downcast_ref::<Linear>().is_some());
}

#[test]
fn test_mixed_batch_norm_prefix() {
    let device = Device::Cpu;
    let bn = BatchNorm2d::from_kwargs(
        kwargs! { "num_features" => ValueChoice::new("c", [2, 4]) },
        &device,
    )
    .unwrap();
    let mut model = Sequential::new().add(bn);
    mutate(&mut model);
    let op = model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<MixedBatchNorm2dOperation>()
        .unwrap();
    let x = (Tensor::randn(0f32, 1.0, (3, 2, 4, 4), &device).unwrap() + 5.0).unwrap();
    let args = concrete_args("MixedBatchNorm2d", op.arguments(), &[("num_features", Arg::from(2usize))]);
    let out = op.forward_with_args(&args, &[x]).unwrap();
    assert_eq!(out.dims(), &[3, 2, 4, 4]);

    let running_mean = op
        .operator()
        .params()
        .running_mean
        .as_ref()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert!(running_mean[0] > 0.1 && running_mean[1] > 0.1);
    assert_eq!(&running_mean[2..], &[0.0, 0.0]);

    // a distribution over widths normalizes at full width
    let wide = Tensor::randn(0f32, 1.0, (3, 4, 4, 4), &device).unwrap();
    assert_eq!(model.forward(&wide).unwrap().dims(), &[3, 4, 4, 4]);
}

#[test]
fn test_mixed_batch_norm_rejects_weighted_eps() {
    let device = Device::Cpu;
    let bn = BatchNorm2d::from_kwargs(
        kwargs! { "num_features" => 2usize, "eps" => ValueChoice::new("eps", [1e-5, 1e-3]) },
        &device,
    )
    .unwrap();
    let mut model = Sequential::new().add(bn);
    mutate(&mut model);
    let x = Tensor::zeros((1, 2, 2, 2), DType::F32, &device).unwrap();
    assert!(matches!(
        model.forward(&x),
        Err(NasError::WeightedSamplingUnsupported { .. })
    ));
}

#[test]
fn test_mixed_attention() {
    let device = Device::Cpu;
    let attention = MultiheadAttention::from_kwargs(
        kwargs! { "embed_dim" => ValueChoice::new("e", [4, 8]), "num_heads" => 2usize },
        &device,
    )
    .unwrap();
    let mut model = Sequential::new().add(attention);
    mutate(&mut model);

    let x = Tensor::randn(0f32, 1.0, (5, 2, 8), &device).unwrap();
    assert_eq!(model.forward(&x).unwrap().dims(), &[5, 2, 8]);

    let op = model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<MixedMultiheadAttentionOperation>()
        .unwrap();
    let args = concrete_args(
        "MixedMultiheadAttention",
        op.arguments(),
        &[("embed_dim", Arg::from(4usize))],
    );
    let small = Tensor::randn(0f32, 1.0, (5, 2, 4), &device).unwrap();
    let out = op
        .forward_with_args(&args, &[small.clone(), small.clone(), small])
        .unwrap();
    assert_eq!(out.dims(), &[5, 2, 4]);
}

#[test]
fn test_mixed_attention_separates_projections() {
    let device = Device::Cpu;
    let attention = MultiheadAttention::from_kwargs(
        kwargs! {
            "embed_dim" => ValueChoice::new("e", [4, 8]),
            "num_heads" => 2usize,
            "kdim" => 8usize,
            "vdim" => 8usize,
        },
        &device,
    )
    .unwrap();
    let mut model = Sequential::new().add(attention);
    mutate(&mut model);
    let op = model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<MixedMultiheadAttentionOperation>()
        .unwrap();
    assert!(!op.operator().params().is_packed());
    let names: Vec<String> = named_parameters(&model, false).into_iter().map(|(n, _)| n).collect();
    assert!(names.contains(&"0.k_proj_weight".to_string()));
}

#[test]
fn test_attention_weights_are_averaged_over_heads() {
    let device = Device::Cpu;
    let attention = MultiheadAttention::new(8, 2, &device).unwrap();
    let query = Tensor::randn(0f32, 1.0, (5, 2, 8), &device).unwrap();
    let memory = Tensor::randn(0f32, 1.0, (7, 2, 8), &device).unwrap();
    let (out, weights) = attention
        .forward_with_weights(&query, &memory, &memory, None)
        .unwrap();
    assert_eq!(out.dims(), &[5, 2, 8]);
    let weights = weights.unwrap();
    assert_eq!(weights.dims(), &[2, 5, 7]);
    let row_sums = weights.sum(2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(row_sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
}
