//! Single-path surrogates (ProxylessNAS): one candidate runs per forward, picked by a
//! hard sample from `softmax(alpha)`, and the architecture gradient is estimated from
//! the gradient of a unit gate placed on the sampled path.

use super::{
    argmax, resolve_alpha, top_k_indices, BaseSuperNetModule, Decisions, Memo, MutateKwargs,
};
use crate::{
    choice::{InputChoice, LayerChoice, Reduction},
    nn::{Module, NamedModules},
    NasError, NasResult,
};
use candle_core::{backprop::GradStore, DType, Tensor, Var, D};
use log::warn;
use nas_structs::choice::{ChoiceValue, ParameterSpec};
use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};
use std::{any::Any, cell::RefCell, collections::BTreeMap};

const ARCH_ALPHA: &str = "_arch_alpha";

fn probabilities(alpha: &Var) -> NasResult<Vec<f32>> {
    Ok(candle_nn::ops::softmax(alpha.as_tensor(), D::Minus1)?
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()?)
}

fn sample_index(rng: &mut StdRng, weights: &[f32]) -> NasResult<usize> {
    let dist = WeightedIndex::new(weights).map_err(|err| NasError::InvalidValueChoice {
        reason: format!("cannot sample from architecture weights: {}", err),
    })?;
    Ok(dist.sample(rng))
}

/// `n` distinct indices drawn proportionally to `weights`, ascending.
fn sample_without_replacement(rng: &mut StdRng, weights: &[f32], n: usize) -> NasResult<Vec<usize>> {
    let mut remaining = weights.to_vec();
    let mut chosen = Vec::with_capacity(n);
    for _ in 0..n.min(weights.len()) {
        let index = sample_index(rng, &remaining)?;
        remaining[index] = 0.0;
        chosen.push(index);
    }
    chosen.sort_unstable();
    Ok(chosen)
}

/// Unit scalar the sampled path is multiplied by. Its gradient is the signal the
/// architecture estimator consumes.
fn gate_on(xs: &Tensor) -> NasResult<Var> {
    Ok(Var::ones((), xs.dtype(), xs.device())?)
}

/// Injects `d alpha_i = sum_j dg_j * p_j * (delta_ij - p_i)` into `grads`, summing over
/// every gate used since the last resample. Gates that never ran contribute nothing.
fn inject_binary_gate_grad(
    alpha: &Var,
    gates: &RefCell<Vec<(usize, Var)>>,
    grads: &mut GradStore,
) -> NasResult<()> {
    let gates = std::mem::take(&mut *gates.borrow_mut());
    if gates.is_empty() {
        return Ok(());
    }
    let probs = probabilities(alpha)?;
    let mut d_alpha = vec![0f32; probs.len()];
    for (j, gate) in &gates {
        let dg = match grads.remove(gate.as_tensor()) {
            Some(dg) => dg.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?,
            None => continue,
        };
        for (i, d) in d_alpha.iter_mut().enumerate() {
            let delta = if i == *j { 1.0 } else { 0.0 };
            *d += dg * probs[*j] * (delta - probs[i]);
        }
    }
    let d_alpha = Tensor::from_vec(d_alpha, probs.len(), alpha.device())?.to_dtype(alpha.dtype())?;
    let total = match grads.remove(alpha.as_tensor()) {
        Some(existing) => existing.add(&d_alpha)?,
        None => d_alpha,
    };
    grads.insert(alpha.as_tensor(), total);
    Ok(())
}

/// Layer choice that runs one sampled candidate per forward. Gates are only placed in
/// training mode.
pub struct ProxylessMixedLayer {
    label: String,
    op_names: Vec<String>,
    candidates: Vec<Box<dyn Module>>,
    alpha: Var,
    rng: StdRng,
    sampled: Option<usize>,
    gates: RefCell<Vec<(usize, Var)>>,
    training: bool,
}

impl ProxylessMixedLayer {
    pub fn new(
        label: &str,
        paths: Vec<(String, Box<dyn Module>)>,
        alpha: Var,
        rng: StdRng,
    ) -> NasResult<Self> {
        if paths.is_empty() {
            return Err(NasError::EmptyCandidates {
                label: label.to_string(),
            });
        }
        if alpha.elem_count() != paths.len() {
            return Err(NasError::AlphaSizeMismatch {
                label: label.to_string(),
                expected: paths.len(),
                actual: alpha.elem_count(),
            });
        }
        let (op_names, candidates) = paths.into_iter().unzip();
        Ok(Self {
            label: label.to_string(),
            op_names,
            candidates,
            alpha,
            rng,
            sampled: None,
            gates: RefCell::new(Vec::new()),
            training: true,
        })
    }

    pub fn sampled(&self) -> Option<&str> {
        self.sampled.map(|i| self.op_names[i].as_str())
    }

    pub fn alpha(&self) -> &Var {
        &self.alpha
    }

    /// Gates recorded since the last resample or gradient injection.
    pub fn num_gates(&self) -> usize {
        self.gates.borrow().len()
    }
}

impl Module for ProxylessMixedLayer {
    fn type_name(&self) -> &'static str {
        "ProxylessMixedLayer"
    }

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor> {
        self.forward_many(std::slice::from_ref(xs))
    }

    fn forward_many(&self, xs: &[Tensor]) -> NasResult<Tensor> {
        let index = match self.sampled {
            Some(index) => index,
            None => argmax(self.alpha.as_tensor())?,
        };
        let out = self.candidates[index].forward_many(xs)?;
        if !self.training {
            return Ok(out);
        }
        let gate = gate_on(&out)?;
        let out = out.broadcast_mul(gate.as_tensor())?;
        self.gates.borrow_mut().push((index, gate));
        Ok(out)
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

    fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.gates.borrow_mut().clear();
        }
        for candidate in self.candidates.iter_mut() {
            candidate.set_training(training);
        }
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

impl BaseSuperNetModule for ProxylessMixedLayer {
    fn resample(&mut self, memo: &mut Memo<ChoiceValue>) -> NasResult<Decisions> {
        self.gates.borrow_mut().clear();
        let index = match memo.get(&self.label).and_then(ChoiceValue::as_name) {
            Some(name) => self
                .op_names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| NasError::InvalidValueChoice {
                    reason: format!("'{}' is not a candidate of '{}'", name, self.label),
                })?,
            None => {
                let probs = probabilities(&self.alpha)?;
                sample_index(&mut self.rng, &probs)?
            }
        };
        self.sampled = Some(index);
        let chosen = ChoiceValue::Name(self.op_names[index].clone());
        memo.insert(&self.label, chosen.clone());
        Ok(Decisions::from([(self.label.clone(), chosen)]))
    }

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

    fn finalize_grad(&self, grads: &mut GradStore) -> NasResult<()> {
        inject_binary_gate_grad(&self.alpha, &self.gates, grads)
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
            kwargs.fork_rng(),
        )?)))
    }
}

/// Input choice that keeps `n_chosen` sampled inputs per forward.
pub struct ProxylessMixedInput {
    label: String,
    n_candidates: usize,
    n_chosen: usize,
    reduction: Reduction,
    alpha: Var,
    rng: StdRng,
    sampled: Option<Vec<usize>>,
    gates: RefCell<Vec<(usize, Var)>>,
    training: bool,
}

impl ProxylessMixedInput {
    pub fn new(choice: &InputChoice, alpha: Var, rng: StdRng) -> NasResult<Self> {
        if !matches!(choice.reduction, Reduction::Sum | Reduction::Mean) {
            return Err(NasError::UnsupportedReduction {
                reduction: choice.reduction.to_string(),
            });
        }
        if alpha.elem_count() != choice.n_candidates {
            return Err(NasError::AlphaSizeMismatch {
                label: choice.label.clone(),
                expected: choice.n_candidates,
                actual: alpha.elem_count(),
            });
        }
        let n_chosen = choice.n_chosen.unwrap_or_else(|| {
            warn!(
                "Single-path search cannot keep a variable number of inputs for '{}', assuming one",
                choice.label
            );
            1
        });
        Ok(Self {
            label: choice.label.clone(),
            n_candidates: choice.n_candidates,
            n_chosen,
            reduction: choice.reduction,
            alpha,
            rng,
            sampled: None,
            gates: RefCell::new(Vec::new()),
            training: true,
        })
    }

    pub fn sampled(&self) -> Option<&[usize]> {
        self.sampled.as_deref()
    }

    pub fn alpha(&self) -> &Var {
        &self.alpha
    }

    pub fn num_gates(&self) -> usize {
        self.gates.borrow().len()
    }
}

impl Module for ProxylessMixedInput {
    fn type_name(&self) -> &'static str {
        "ProxylessMixedInput"
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
        let chosen = match &self.sampled {
            Some(chosen) => chosen.clone(),
            None => top_k_indices(self.alpha.as_tensor(), self.n_chosen)?,
        };
        let mut out: Option<Tensor> = None;
        let mut gates = self.gates.borrow_mut();
        for &index in &chosen {
            let term = if self.training {
                let gate = gate_on(&xs[index])?;
                let term = xs[index].broadcast_mul(gate.as_tensor())?;
                gates.push((index, gate));
                term
            } else {
                xs[index].clone()
            };
            out = Some(match out {
                Some(acc) => acc.add(&term)?,
                None => term,
            });
        }
        let out = out.ok_or_else(|| NasError::EmptyCandidates {
            label: self.label.clone(),
        })?;
        match self.reduction {
            Reduction::Mean => Ok(out.affine(1.0 / chosen.len() as f64, 0.0)?),
            _ => Ok(out),
        }
    }

    fn own_parameters(&self) -> Vec<(String, Var)> {
        vec![(ARCH_ALPHA.to_string(), self.alpha.clone())]
    }

    fn is_arch_parameter(&self, name: &str) -> bool {
        name == ARCH_ALPHA
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.gates.borrow_mut().clear();
        }
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

impl BaseSuperNetModule for ProxylessMixedInput {
    fn resample(&mut self, memo: &mut Memo<ChoiceValue>) -> NasResult<Decisions> {
        self.gates.borrow_mut().clear();
        let chosen = match memo.get(&self.label).and_then(ChoiceValue::as_indices) {
            Some(indices) => indices,
            None => {
                let probs = probabilities(&self.alpha)?;
                sample_without_replacement(&mut self.rng, &probs, self.n_chosen)?
            }
        };
        let value = match chosen.as_slice() {
            [index] => ChoiceValue::Index(*index),
            indices => ChoiceValue::Indices(indices.to_vec()),
        };
        self.sampled = Some(chosen);
        memo.insert(&self.label, value.clone());
        Ok(Decisions::from([(self.label.clone(), value)]))
    }

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

    fn finalize_grad(&self, grads: &mut GradStore) -> NasResult<()> {
        inject_binary_gate_grad(&self.alpha, &self.gates, grads)
    }

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
        let alpha = resolve_alpha(&choice.label, choice.n_candidates, memo, kwargs)?;
        Ok(Some(Box::new(Self::new(choice, alpha, kwargs.fork_rng())?)))
    }
}
