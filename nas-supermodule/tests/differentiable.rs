use candle_core::{Device, Tensor};
use nas_supermodule::{
    choice::{InputChoice, LayerChoice, Reduction, ValueChoice},
    kwargs,
    nn::{named_parameters, Identity, Linear, Module, Relu, Sequential, Traceable},
    supermodule::{
        argmax, export_all, hook, native_mixed_operations, search_space_spec_all, top_k_indices,
        traverse_and_mutate_submodules, DifferentiableMixedInput, DifferentiableMixedLayer, Memo,
        MixedOpDifferentiablePolicy, MutateKwargs, MutationHook,
    },
    ChoiceValue, NasError,
};

fn darts_hooks() -> Vec<Box<dyn MutationHook>> {
    vec![
        hook::<DifferentiableMixedLayer>(),
        hook::<DifferentiableMixedInput>(),
    ]
}

fn layer_choice_model(device: &Device) -> Sequential {
    Sequential::new().add(LayerChoice::new(
        "op",
        vec![
            Box::new(Linear::new(4, 4, true, device).unwrap()),
            Box::new(Identity),
            Box::new(Relu),
        ],
    ))
}

fn mixed_layer(model: &Sequential) -> &DifferentiableMixedLayer {
    model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<DifferentiableMixedLayer>()
        .unwrap()
}

#[test]
fn test_mutate_layer_choice() {
    let device = Device::Cpu;
    let mut model = layer_choice_model(&device);
    let mutated =
        traverse_and_mutate_submodules(&mut model, &darts_hooks(), &MutateKwargs::new(0)).unwrap();
    assert_eq!(mutated, vec!["0".to_string()]);

    let layer = mixed_layer(&model);
    assert_eq!(layer.op_names(), &["0", "1", "2"]);
    assert_eq!(layer.alpha().dims(), &[3]);

    let arch: Vec<String> = named_parameters(&model, true).into_iter().map(|(n, _)| n).collect();
    assert_eq!(arch, vec!["0._arch_alpha".to_string()]);
    let weights: Vec<String> = named_parameters(&model, false).into_iter().map(|(n, _)| n).collect();
    assert_eq!(weights, vec!["0.0.weight".to_string(), "0.0.bias".to_string()]);
}

#[test]
fn test_mixed_layer_forward_is_weighted_sum() {
    let device = Device::Cpu;
    let mut model = Sequential::new().add(LayerChoice::new(
        "op",
        vec![Box::new(Linear::new(4, 4, true, &device).unwrap()), Box::new(Identity)],
    ));
    traverse_and_mutate_submodules(&mut model, &darts_hooks(), &MutateKwargs::new(0)).unwrap();
    let layer = mixed_layer(&model);
    layer
        .alpha()
        .set(&Tensor::new(&[0f32, 3f32.ln()], &device).unwrap())
        .unwrap();

    let x = Tensor::randn(0f32, 1.0, (2, 4), &device).unwrap();
    let linear_out = layer.named_children()[0].1.forward(&x).unwrap();
    let expected = ((linear_out * 0.25).unwrap() + (&x * 0.75).unwrap()).unwrap();
    let out = model.forward(&x).unwrap();
    let diff = (out - expected)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(diff < 1e-5);
}

#[test]
fn test_mixed_layer_export_argmax() {
    let device = Device::Cpu;
    let mut model = layer_choice_model(&device);
    traverse_and_mutate_submodules(&mut model, &darts_hooks(), &MutateKwargs::new(0)).unwrap();
    mixed_layer(&model)
        .alpha()
        .set(&Tensor::new(&[0.1f32, 0.9, 0.5], &device).unwrap())
        .unwrap();
    let exported = export_all(&model).unwrap();
    assert_eq!(exported["op"], ChoiceValue::Name("1".to_string()));

    let spec = search_space_spec_all(&model);
    assert_eq!(spec["op"].size, 3);
    assert_eq!(spec["op"].values[2], ChoiceValue::Name("2".to_string()));
}

#[test]
fn test_named_candidates_are_exported_by_name() {
    let device = Device::Cpu;
    let mut model = Sequential::new().add(LayerChoice::named(
        "op",
        vec![
            ("skip", Box::new(Identity) as Box<dyn Module>),
            ("relu", Box::new(Relu) as Box<dyn Module>),
        ],
    ));
    traverse_and_mutate_submodules(&mut model, &darts_hooks(), &MutateKwargs::new(0)).unwrap();
    mixed_layer(&model)
        .alpha()
        .set(&Tensor::new(&[-1f32, 1.0], &device).unwrap())
        .unwrap();
    assert_eq!(
        export_all(&model).unwrap()["op"],
        ChoiceValue::Name("relu".to_string())
    );
}

#[test]
fn test_tied_labels_share_alpha() {
    let mut model = Sequential::new()
        .add(LayerChoice::new("op", vec![Box::new(Identity), Box::new(Relu)]))
        .add(LayerChoice::new("op", vec![Box::new(Relu), Box::new(Identity)]));
    traverse_and_mutate_submodules(&mut model, &darts_hooks(), &MutateKwargs::new(0)).unwrap();
    let alpha = |i: usize| {
        model
            .get(i)
            .unwrap()
            .as_any()
            .downcast_ref::<DifferentiableMixedLayer>()
            .unwrap()
            .alpha()
            .as_tensor()
            .id()
    };
    assert_eq!(alpha(0), alpha(1));
    // shared tensors are reported once
    assert_eq!(named_parameters(&model, true).len(), 1);
}

#[test]
fn test_tied_labels_with_different_sizes_fail() {
    let mut model = Sequential::new()
        .add(LayerChoice::new("op", vec![Box::new(Identity), Box::new(Relu)]))
        .add(LayerChoice::new(
            "op",
            vec![Box::new(Relu), Box::new(Identity), Box::new(Identity)],
        ));
    let result = traverse_and_mutate_submodules(&mut model, &darts_hooks(), &MutateKwargs::new(0));
    assert!(matches!(
        result,
        Err(NasError::AlphaSizeMismatch {
            expected: 2,
            actual: 3,
            ..
        })
    ));
}

#[test]
fn test_mixed_input_export_top_k() {
    let device = Device::Cpu;
    let mut model = Sequential::new().add(InputChoice::new("in", 3, Some(2)));
    traverse_and_mutate_submodules(&mut model, &darts_hooks(), &MutateKwargs::new(0)).unwrap();
    let input = model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<DifferentiableMixedInput>()
        .unwrap();
    assert_eq!(input.n_chosen(), 2);
    input
        .alpha()
        .set(&Tensor::new(&[0.5f32, -1.0, 2.0], &device).unwrap())
        .unwrap();
    assert_eq!(
        export_all(&model).unwrap()["in"],
        ChoiceValue::Indices(vec![0, 2])
    );
    assert_eq!(search_space_spec_all(&model)["in"].chosen_size, Some(2));

    let xs: Vec<Tensor> = (1..=3)
        .map(|i| Tensor::full(i as f32, (2, 2), &device).unwrap())
        .collect();
    let out = model.forward_many(&xs).unwrap();
    assert_eq!(out.dims(), &[2, 2]);
    assert!(model.forward_many(&xs[..2]).is_err());
}

#[test]
fn test_mixed_input_defaults_to_one_chosen() {
    let device = Device::Cpu;
    let mut model = Sequential::new().add(InputChoice::new("in", 2, None));
    traverse_and_mutate_submodules(&mut model, &darts_hooks(), &MutateKwargs::new(0)).unwrap();
    let input = model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<DifferentiableMixedInput>()
        .unwrap();
    assert_eq!(input.n_chosen(), 1);
    input
        .alpha()
        .set(&Tensor::new(&[0f32, 1.0], &device).unwrap())
        .unwrap();
    let exported = export_all(&model).unwrap();
    assert_eq!(exported["in"], ChoiceValue::Index(1));
    assert_eq!(exported["in"].as_index(), Some(1));
}

#[test]
fn test_concat_reduction_is_rejected() {
    let mut model =
        Sequential::new().add(InputChoice::new("in", 2, Some(1)).with_reduction(Reduction::Concat));
    let result = traverse_and_mutate_submodules(&mut model, &darts_hooks(), &MutateKwargs::new(0));
    assert!(matches!(result, Err(NasError::UnsupportedReduction { .. })));
}

#[test]
fn test_unmutated_choice_fails_at_forward() {
    let device = Device::Cpu;
    let model = layer_choice_model(&device);
    let x = Tensor::zeros((1, 4), candle_core::DType::F32, &device).unwrap();
    assert!(matches!(
        model.forward(&x),
        Err(NasError::UnresolvedChoice { .. })
    ));
}

#[test]
fn test_alpha_size_checked_on_construction() {
    let device = Device::Cpu;
    let alpha = candle_core::Var::zeros(3, candle_core::DType::F32, &device).unwrap();
    let result = DifferentiableMixedLayer::new(
        "op",
        vec![("0".to_string(), Box::new(Identity) as Box<dyn Module>)],
        alpha,
        Box::new(nas_supermodule::supermodule::Softmax),
    );
    assert!(matches!(result, Err(NasError::AlphaSizeMismatch { .. })));
}

#[test]
fn test_mixed_input_four_candidates_two_chosen() {
    let device = Device::Cpu;
    let mut model = Sequential::new().add(InputChoice::new("in", 4, Some(2)));
    traverse_and_mutate_submodules(&mut model, &darts_hooks(), &MutateKwargs::new(0)).unwrap();
    let input = model
        .get(0)
        .unwrap()
        .as_any()
        .downcast_ref::<DifferentiableMixedInput>()
        .unwrap();
    input
        .alpha()
        .set(&Tensor::new(&[0.1f32, 0.9, -0.3, 0.7], &device).unwrap())
        .unwrap();

    let supernet = model.get(0).unwrap().as_supernet().unwrap();
    let mut memo = Memo::new();
    let first = supernet.export(&mut memo).unwrap();
    assert_eq!(first["in"], ChoiceValue::Indices(vec![1, 3]));
    assert!(supernet.export(&mut memo).unwrap().is_empty());

    // the forward still mixes all four inputs
    let xs: Vec<Tensor> = (0..4)
        .map(|i| Tensor::full(i as f32, 3, &device).unwrap())
        .collect();
    let out = model.forward_many(&xs).unwrap().to_vec1::<f32>().unwrap();
    let weights = candle_nn::ops::softmax(input.alpha().as_tensor(), 0)
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    let expected: f32 = weights.iter().enumerate().map(|(i, w)| i as f32 * w).sum();
    assert!(out.iter().all(|v| (v - expected).abs() < 1e-5));
}

#[test]
fn test_repeated_export_with_shared_memo_is_empty() {
    let device = Device::Cpu;
    let mut model = layer_choice_model(&device);
    traverse_and_mutate_submodules(&mut model, &darts_hooks(), &MutateKwargs::new(0)).unwrap();
    let supernet = model.get(0).unwrap().as_supernet().unwrap();
    let mut memo = Memo::new();
    assert_eq!(supernet.export(&mut memo).unwrap().len(), 1);
    assert!(supernet.export(&mut memo).unwrap().is_empty());

    let linear = Linear::from_kwargs(
        kwargs! { "in_features" => 4usize, "out_features" => ValueChoice::new("h", [2, 4]) },
        &device,
    )
    .unwrap();
    let mut model = Sequential::new().add(linear);
    traverse_and_mutate_submodules(
        &mut model,
        &native_mixed_operations(),
        &MutateKwargs::new(0).with_mixed_op_sampling(MixedOpDifferentiablePolicy::factory),
    )
    .unwrap();
    let supernet = model.get(0).unwrap().as_supernet().unwrap();
    let mut memo = Memo::new();
    let first = supernet.export(&mut memo).unwrap();
    assert!(matches!(first["h"], ChoiceValue::Value(_)));
    assert!(supernet.export(&mut memo).unwrap().is_empty());
}

#[test]
fn test_argmax_and_top_k() {
    let device = Device::Cpu;
    let t = Tensor::new(&[0.1f32, 0.9, 0.5], &device).unwrap();
    assert_eq!(argmax(&t).unwrap(), 1);
    assert!(argmax(&Tensor::new(&[0f32; 0], &device).unwrap()).is_err());

    let t = Tensor::new(&[1f32, 3.0, 3.0, 0.0], &device).unwrap();
    assert_eq!(top_k_indices(&t, 2).unwrap(), vec![1, 2]);
    let ties = Tensor::new(&[0f32, 0.0, 0.0, 0.0], &device).unwrap();
    assert_eq!(top_k_indices(&ties, 2).unwrap(), vec![0, 1]);
}
