//! Continuous relaxation of choice points: every candidate runs and the outputs are
//! mixed by normalized architecture weights.

use super::{
    argmax, resolve_alpha, top_k_indices, BaseSuperNetModule, Decisions, Memo,
    MixedOperationSamplingPolicy, MutateKwargs, Normalizer, OperationArguments, SampledArgument,
};
use crate::{
    choice::{traverse_all_options_weighted, InputChoice, LayerChoice, Reduction},
    nn::{Arg, Module, NamedModules},
    NasError, NasResult,
};
use candle_core::{Tensor, Var};
use log::warn;
use nas_structs::choice::{ChoiceValue, ParameterSpec};
use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
};

const ARCH_ALPHA: &str = "_arch_alpha";

/// `sum_i w_i * stacked[i]` with `w` broadcast over every trailing axis.
fn weighted_sum(stacked: &Tensor, weights: &Tensor) -> NasResult<Tensor> {
    let mut shape = vec![1usize; stacked.rank()];
    shape[0] = weights.elem_count();
    let weights = weights.to_dtype(stacked.dtype())?.reshape(shape)?;
    Ok(stacked.broadcast_mul(&weights)?.sum(0)?)
}

fn check_alpha_size(label: &str, alpha: &Var, expected: usize) -> NasResult<()> {
    let actual = alpha.elem_count();
    if actual != expected {
        return Err(NasError::AlphaSizeMismatch {
            label: label.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Weighted sum of every candidate of a layer choice (DARTS). All candidates must
/// produce the same shape.
pub struct DifferentiableMixedLayer {
    label: String,
    op_names: Vec<String>,
    candidates: Vec<Box<dyn Module>>,
    alpha: Var,
    softmax: Box<dyn Normalizer>,
}

impl DifferentiableMixedLayer {
    pub fn new(
        label: &str,
        paths: Vec<(String, Box<dyn Module>)>,
        alpha: Var,
        softmax: Box<dyn Normalizer>,
    ) -> NasResult<Self> {
        if paths.is_empty() {
            return Err(NasError::EmptyCandidates {
                label: label.to_string(),
            });
        }
        check_alpha_size(label, &alpha, paths.len())?;
        let (op_names, candidates) = paths.into_iter().unzip();
        Ok(Self {
            label: label.to_string(),
            op_names,
            candidates,
            alpha,
            softmax,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn op_names(&self) -> &[String] {
        &self.op_names
    }

    pub fn alpha(&self) -> &Var {
        &self.alpha
    }

    pub fn softmax(&self) -> &dyn Normalizer {
        self.softmax.as_ref()
    }
}

impl Module for DifferentiableMixedLayer {
    fn type_name(&self) -> &'static str {
        "DifferentiableMixedLayer"
    }

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor> {
        self.forward_many(std::slice::from_ref(xs))
    }

    fn forward_many(&self, xs: &[Tensor]) -> NasResult<Tensor> {
        let outputs = self
            .candidates
            .iter()
            .map(|op| op.forward_many(xs))
            .collect::<NasResult<Vec<_>>>()?;
        let stacked = Tensor::stack(&outputs, 0)?;
        weighted_sum(&stacked, &self.softmax.normalize(self.alpha.as_tensor())?)
    }

    fn named_children(&self) -> NamedModules<'_> {
        self.op_names
            .iter()
            .cloned()
            .zip(self.candidates.iter().map(|m| m.as_ref()))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<(String, &mut Box<dyn Module>)> {
        self.op_names.iter().cloned().zip(self.candidates.iter_mut()).collect()
    }

    fn own_parameters(&self) -> Vec<(String, Var)> {
        vec![(ARCH_ALPHA.to_string(), self.alpha.clone())]
    }

    fn is_arch_parameter(&self, name: &str) -> bool {
        name == ARCH_ALPHA
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn as_supernet(&self) -> Option<&dyn BaseSuperNetModule> {
        Some(self)
    }

    fn as_supernet_mut(&mut self) -> Option<&mut dyn BaseSuperNetModule> {
        Some(self)
    }
}

impl BaseSuperNetModule for DifferentiableMixedLayer {
    fn resample(&mut self, _memo: &mut Memo<ChoiceValue>) -> NasResult<Decisions> {
        Ok(Decisions::new())
    }

    /// The candidate with the largest logit.
    fn export(&self, memo: &mut Memo<ChoiceValue>) -> NasResult<Decisions> {
        let mut result = Decisions::new();
        if memo.contains(&self.label) {
            return Ok(result);
        }
        let chosen = ChoiceValue::Name(self.op_names[argmax(self.alpha.as_tensor())?].clone());
        memo.insert(&self.label, chosen.clone());
        result.insert(self.label.clone(), chosen);
        Ok(result)
    }

    fn search_space_spec(&self) -> BTreeMap<String, ParameterSpec> {
        let values = self
            .op_names
            .iter()
            .map(|name| ChoiceValue::Name(name.clone()))
            .collect();
        BTreeMap::from([(self.label.clone(), ParameterSpec::choice(&self.label, values))])
    }

    fn set_temperature(&mut self, temperature: f64) {
        self.softmax.set_temperature(temperature);
    }

    fn mutate(
        module: &mut Box<dyn Module>,
        _name: &str,
        memo: &mut Memo<Var>,
        kwargs: &MutateKwargs,
    ) -> NasResult<Option<Box<dyn Module>>> {
        let choice = match module.as_any_mut().downcast_mut::<LayerChoice>() {
            Some(choice) => choice,
            None => return Ok(None),
        };
        let alpha = resolve_alpha(&choice.label, choice.len(), memo, kwargs)?;
        let paths = std::mem::take(&mut choice.candidates);
        Ok(Some(Box::new(Self::new(
            &choice.label,
            paths,
            alpha,
            kwargs.softmax.clone(),
        )?)))
    }
}

/// Weighted sum of every candidate input of an input choice.
pub struct DifferentiableMixedInput {
    label: String,
    n_candidates: usize,
    n_chosen: usize,
    alpha: Var,
    softmax: Box<dyn Normalizer>,
}

impl DifferentiableMixedInput {
    /// `n_chosen` defaults to one, with a warning.
    pub fn new(
        label: &str,
        n_candidates: usize,
        n_chosen: Option<usize>,
        alpha: Var,
        softmax: Box<dyn Normalizer>,
    ) -> NasResult<Self> {
        check_alpha_size(label, &alpha, n_candidates)?;
        let n_chosen = n_chosen.unwrap_or_else(|| {
            warn!(
                "Differentiable search cannot keep a variable number of inputs for '{}', assuming one",
                label
            );
            1
        });
        Ok(Self {
            label: label.to_string(),
            n_candidates,
            n_chosen,
            alpha,
            softmax,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn n_chosen(&self) -> usize {
        self.n_chosen
    }

    pub fn alpha(&self) -> &Var {
        &self.alpha
    }
}

impl Module for DifferentiableMixedInput {
    fn type_name(&self) -> &'static str {
        "DifferentiableMixedInput"
    }

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor> {
        self.forward_many(std::slice::from_ref(xs))
    }

    fn forward_many(&self, xs: &[Tensor]) -> NasResult<Tensor> {
        if xs.len() != self.n_candidates {
            return Err(NasError::InputArity {
                module: self.type_name().to_string(),
                expected: self.n_candidates,
                actual: xs.len(),
            });
        }
        let stacked = Tensor::stack(xs, 0)?;
        weighted_sum(&stacked, &self.softmax.normalize(self.alpha.as_tensor())?)
    }

    fn own_parameters(&self) -> Vec<(String, Var)> {
        vec![(ARCH_ALPHA.to_string(), self.alpha.clone())]
    }

    fn is_arch_parameter(&self, name: &str) -> bool {
        name == ARCH_ALPHA
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn as_supernet(&self) -> Option<&dyn BaseSuperNetModule> {
        Some(self)
    }

    fn as_supernet_mut(&mut self) -> Option<&mut dyn BaseSuperNetModule> {
        Some(self)
    }
}

impl BaseSuperNetModule for DifferentiableMixedInput {
    fn resample(&mut self, _memo: &mut Memo<ChoiceValue>) -> NasResult<Decisions> {
        Ok(Decisions::new())
    }

    /// The `n_chosen` inputs with the largest logits, ascending. A single input is
    /// exported as a bare index.
    fn export(&self, memo: &mut Memo<ChoiceValue>) -> NasResult<Decisions> {
        let mut result = Decisions::new();
        if memo.contains(&self.label) {
            return Ok(result);
        }
        let chosen = match top_k_indices(self.alpha.as_tensor(), self.n_chosen)?.as_slice() {
            [index] => ChoiceValue::Index(*index),
            indices => ChoiceValue::Indices(indices.to_vec()),
        };
        memo.insert(&self.label, chosen.clone());
        result.insert(self.label.clone(), chosen);
        Ok(result)
    }

    fn search_space_spec(&self) -> BTreeMap<String, ParameterSpec> {
        let values = (0..self.n_candidates).map(ChoiceValue::Index).collect();
        BTreeMap::from([(
            self.label.clone(),
            ParameterSpec::choice(&self.label, values).with_chosen_size(self.n_chosen),
        )])
    }

    fn set_temperature(&mut self, temperature: f64) {
        self.softmax.set_temperature(temperature);
    }

    /// Applies to input choices reduced by sum or mean.
    fn mutate(
        module: &mut Box<dyn Module>,
        _name: &str,
        memo: &mut Memo<Var>,
        kwargs: &MutateKwargs,
    ) -> NasResult<Option<Box<dyn Module>>> {
        let choice = match module.as_any().downcast_ref::<InputChoice>() {
            Some(choice) => choice,
            None => return Ok(None),
        };
        if !matches!(choice.reduction, Reduction::Sum | Reduction::Mean) {
            return Err(NasError::UnsupportedReduction {
                reduction: choice.reduction.to_string(),
            });
        }
        let alpha = resolve_alpha(&choice.label, choice.n_candidates, memo, kwargs)?;
        Ok(Some(Box::new(Self::new(
            &choice.label,
            choice.n_candidates,
            choice.n_chosen,
            alpha,
            kwargs.softmax.clone(),
        )?)))
    }
}

/// Differentiable sampling inside a mixed operation: one logit vector per value-choice
/// label, and every mutable argument becomes a distribution over its values.
pub struct MixedOpDifferentiablePolicy {
    alphas: BTreeMap<String, Var>,
    softmax: Box<dyn Normalizer>,
}

impl MixedOpDifferentiablePolicy {
    pub fn new(
        arguments: &OperationArguments,
        memo: &mut Memo<Var>,
        kwargs: &MutateKwargs,
    ) -> NasResult<Self> {
        let mut alphas = BTreeMap::new();
        for (label, spec) in &arguments.space_spec {
            alphas.insert(label.clone(), resolve_alpha(label, spec.size, memo, kwargs)?);
        }
        Ok(Self {
            alphas,
            softmax: kwargs.softmax.clone(),
        })
    }

    /// Usable as `MutateKwargs::mixed_op_sampling`.
    pub fn factory(
        arguments: &OperationArguments,
        memo: &mut Memo<Var>,
        kwargs: &MutateKwargs,
    ) -> NasResult<Box<dyn MixedOperationSamplingPolicy>> {
        Ok(Box::new(Self::new(arguments, memo, kwargs)?))
    }
}

impl MixedOperationSamplingPolicy for MixedOpDifferentiablePolicy {
    fn resample(
        &mut self,
        _arguments: &OperationArguments,
        _memo: &mut Memo<ChoiceValue>,
    ) -> NasResult<Decisions> {
        Ok(Decisions::new())
    }

    /// Arg-max value of every label not yet in `memo`.
    fn export(
        &self,
        arguments: &OperationArguments,
        memo: &mut Memo<ChoiceValue>,
    ) -> NasResult<Decisions> {
        let mut result = Decisions::new();
        for (label, spec) in &arguments.space_spec {
            let alpha = match self.alphas.get(label) {
                Some(alpha) if !memo.contains(label) => alpha,
                _ => continue,
            };
            let chosen = spec.values[argmax(alpha.as_tensor())?].clone();
            memo.insert(label, chosen.clone());
            result.insert(label.clone(), chosen);
        }
        Ok(result)
    }

    fn forward_argument(
        &self,
        arguments: &OperationArguments,
        name: &str,
    ) -> NasResult<SampledArgument> {
        match arguments.mutable_arguments.get(name) {
            Some(expr) => {
                let weights = self
                    .alphas
                    .iter()
                    .map(|(label, alpha)| Ok((label.clone(), self.softmax.normalize(alpha.as_tensor())?)))
                    .collect::<NasResult<HashMap<_, _>>>()?;
                Ok(SampledArgument::Weighted(traverse_all_options_weighted(expr, &weights)?))
            }
            None => Ok(SampledArgument::Concrete(
                arguments.init_arguments.get(name).cloned().unwrap_or(Arg::None),
            )),
        }
    }

    fn arch_parameters(&self) -> Vec<(String, Var)> {
        self.alphas
            .iter()
            .map(|(label, alpha)| (label.clone(), alpha.clone()))
            .collect()
    }

    fn set_temperature(&mut self, temperature: f64) {
        self.softmax.set_temperature(temperature);
    }
}
