use candle_core::{Device, Tensor};
use nas_supermodule::{
    choice::{dedup_inner_choices, traverse_all_options, traverse_all_options_weighted, ValueChoice, ValueChoiceX},
    NasError, Scalar,
};
use std::collections::HashMap;

fn ints(values: &[i64]) -> Vec<Scalar> {
    values.iter().map(|&v| Scalar::Int(v)).collect()
}

#[test]
fn test_traverse_all_options() {
    let a = ValueChoice::new("a", [1, 2, 3]);
    assert_eq!(traverse_all_options(&(a.clone() * 2 + 1)).unwrap(), ints(&[3, 5, 7]));

    // one label used twice is one decision, not two
    let doubled = a.clone() + a.clone();
    assert_eq!(traverse_all_options(&doubled).unwrap(), ints(&[2, 4, 6]));

    let b = ValueChoice::new("b", [10, 20]);
    assert_eq!(
        traverse_all_options(&(a + b)).unwrap(),
        ints(&[11, 12, 13, 21, 22, 23])
    );
}

#[test]
fn test_floor_division_and_remainder() {
    let x = ValueChoice::new("x", [-7, 7]);
    assert_eq!(traverse_all_options(&(x.clone() / 2)).unwrap(), ints(&[-4, 3]));
    assert_eq!(traverse_all_options(&(x % 3)).unwrap(), ints(&[1, 2]));
}

#[test]
fn test_max_min_and_abs() {
    let a = ValueChoice::new("a", [1, 5]);
    assert_eq!(traverse_all_options(&a.clone().max(3)).unwrap(), ints(&[3, 5]));
    assert_eq!(traverse_all_options(&a.clone().min(3)).unwrap(), ints(&[1, 3]));
    assert_eq!(traverse_all_options(&(-a).abs()).unwrap(), ints(&[1, 5]));
}

#[test]
fn test_tuple_arithmetic() {
    let k = ValueChoice::new("k", [Scalar::from((3usize, 3usize)), Scalar::from((5usize, 3usize))]);
    assert_eq!(
        traverse_all_options(&(k / 2)).unwrap(),
        vec![Scalar::Tuple(vec![1, 1]), Scalar::Tuple(vec![2, 1])]
    );
}

#[test]
fn test_mixed_int_float() {
    let a = ValueChoice::new("a", [1, 2]);
    assert_eq!(
        traverse_all_options(&(a * 0.5)).unwrap(),
        vec![Scalar::Float(0.5), Scalar::Float(1.0)]
    );
}

#[test]
fn test_evaluate() {
    let expr: ValueChoiceX = ValueChoice::new("a", [4, 8]) * ValueChoice::new("b", [1, 2]);
    let values = HashMap::from([
        ("a".to_string(), Scalar::Int(8)),
        ("b".to_string(), Scalar::Int(2)),
    ]);
    assert_eq!(expr.evaluate(&values).unwrap(), Scalar::Int(16));
    assert!(expr.evaluate(&HashMap::new()).is_err());
    assert!(!expr.is_constant());
    assert!(ValueChoiceX::from(3).is_constant());
}

#[test]
fn test_traverse_weighted() {
    let device = Device::Cpu;
    let expr = ValueChoice::new("a", [1, 2]) + ValueChoice::new("b", [1, 2]);
    let weights = HashMap::from([
        ("a".to_string(), Tensor::new(&[0.25f32, 0.75], &device).unwrap()),
        ("b".to_string(), Tensor::new(&[0.5f32, 0.5], &device).unwrap()),
    ]);
    let options = traverse_all_options_weighted(&expr, &weights).unwrap();
    let values: Vec<Scalar> = options.iter().map(|(v, _)| v.clone()).collect();
    assert_eq!(values, ints(&[2, 3, 4]));
    let probs: Vec<f32> = options
        .iter()
        .map(|(_, w)| w.to_scalar::<f32>().unwrap())
        .collect();
    for (p, expected) in probs.iter().zip([0.125f32, 0.5, 0.375]) {
        assert!((p - expected).abs() < 1e-6);
    }
}

#[test]
fn test_traverse_weighted_missing_label() {
    let expr: ValueChoiceX = ValueChoice::new("a", [1, 2]).into();
    assert!(traverse_all_options_weighted(&expr, &HashMap::new()).is_err());
}

#[test]
fn test_dedup_inner_choices() {
    let a = ValueChoice::new("a", [16, 32]);
    let b = ValueChoice::new("b", [3, 5]);
    let exprs = vec![a.clone() * 2, a.expr(), b.clone() / 2, b.expr()];
    let spec = dedup_inner_choices(&exprs).unwrap();
    assert_eq!(spec.len(), 2);
    assert_eq!(spec["a"].size, 2);
    assert_eq!(spec["b"].values, vec![Scalar::Int(3).into(), Scalar::Int(5).into()]);
}

#[test]
fn test_dedup_label_conflict() {
    let exprs = vec![
        ValueChoice::new("a", [1, 2]).expr(),
        ValueChoice::new("a", [1, 3]).expr(),
    ];
    match dedup_inner_choices(&exprs) {
        Err(NasError::LabelConflict { label, .. }) => assert_eq!(label, "a"),
        other => panic!("expected a label conflict, got {:?}", other),
    }
}

#[test]
fn test_dedup_empty_candidates() {
    let exprs = vec![ValueChoice::new("e", Vec::<i64>::new()).expr()];
    assert!(matches!(
        dedup_inner_choices(&exprs),
        Err(NasError::EmptyCandidates { .. })
    ));
}

#[test]
fn test_display() {
    let expr = ValueChoice::new("a", [1, 2]) * 2;
    assert!(expr.to_string().contains('*'));
}
