use super::MutateKwargs;
use crate::{
    nn::{named_modules, Module},
    NasError, NasResult,
};
use candle_core::{backprop::GradStore, Tensor, Var};
use nas_structs::choice::{ChoiceValue, ParameterSpec};
use std::collections::{BTreeMap, HashMap};

/// Decisions shared by every module during one mutation, resample or export pass.
///
/// Once a label is present, later modules carrying the same label reuse the entry
/// instead of deciding again.
#[derive(Clone, Debug)]
pub struct Memo<T> {
    entries: HashMap<String, T>,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> Memo<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, label: &str) -> Option<&T> {
        self.entries.get(label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.entries.contains_key(label)
    }

    pub fn insert(&mut self, label: &str, value: T) {
        self.entries.insert(label.to_string(), value);
    }

    pub fn extend<I: IntoIterator<Item = (String, T)>>(&mut self, entries: I) {
        self.entries.extend(entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Label to decision, as produced by `resample` and `export`.
pub type Decisions = BTreeMap<String, ChoiceValue>;

/// Capabilities shared by every weight-sharing surrogate.
pub trait BaseSuperNetModule: Module {
    /// Draws a new decision for every label not yet in `memo`. Purely differentiable
    /// modules return nothing.
    fn resample(&mut self, memo: &mut Memo<ChoiceValue>) -> NasResult<Decisions>;

    /// Deterministic final decision for every label not yet in `memo`, recorded there.
    fn export(&self, memo: &mut Memo<ChoiceValue>) -> NasResult<Decisions>;

    fn search_space_spec(&self) -> BTreeMap<String, ParameterSpec>;

    /// Adjusts gradients after the architecture backward pass.
    fn finalize_grad(&self, _grads: &mut GradStore) -> NasResult<()> {
        Ok(())
    }

    fn set_temperature(&mut self, _temperature: f64) {}

    /// Builds the surrogate for `module`, or `None` when this type does not apply.
    fn mutate(
        module: &mut Box<dyn Module>,
        name: &str,
        memo: &mut Memo<Var>,
        kwargs: &MutateKwargs,
    ) -> NasResult<Option<Box<dyn Module>>>
    where
        Self: Sized;
}

/// Every surrogate in the tree with its path, in pre-order.
pub fn supernet_modules(root: &dyn Module) -> Vec<(String, &dyn BaseSuperNetModule)> {
    named_modules(root)
        .into_iter()
        .filter_map(|(name, m)| m.as_supernet().map(|s| (name, s)))
        .collect()
}

pub fn for_each_supernet_module_mut(
    root: &mut dyn Module,
    f: &mut dyn FnMut(&mut dyn BaseSuperNetModule) -> NasResult<()>,
) -> NasResult<()> {
    if let Some(module) = root.as_supernet_mut() {
        f(module)?;
    }
    for (_, child) in root.children_mut() {
        for_each_supernet_module_mut(child.as_mut(), f)?;
    }
    Ok(())
}

pub fn resample_all(root: &mut dyn Module) -> NasResult<Decisions> {
    let mut memo = Memo::new();
    let mut result = Decisions::new();
    for_each_supernet_module_mut(root, &mut |module: &mut dyn BaseSuperNetModule| {
        result.extend(module.resample(&mut memo)?);
        Ok(())
    })?;
    Ok(result)
}

pub fn export_all(root: &dyn Module) -> NasResult<Decisions> {
    let mut memo = Memo::new();
    let mut result = Decisions::new();
    for (_, module) in supernet_modules(root) {
        result.extend(module.export(&mut memo)?);
    }
    Ok(result)
}

pub fn search_space_spec_all(root: &dyn Module) -> BTreeMap<String, ParameterSpec> {
    let mut result = BTreeMap::new();
    for (_, module) in supernet_modules(root) {
        result.extend(module.search_space_spec());
    }
    result
}

pub fn finalize_grad_all(root: &dyn Module, grads: &mut GradStore) -> NasResult<()> {
    for (_, module) in supernet_modules(root) {
        module.finalize_grad(grads)?;
    }
    Ok(())
}

pub fn set_temperature_all(root: &mut dyn Module, temperature: f64) -> NasResult<()> {
    for_each_supernet_module_mut(root, &mut |module: &mut dyn BaseSuperNetModule| {
        module.set_temperature(temperature);
        Ok(())
    })
}

/// Index of a maximum of a 1-D tensor.
pub fn argmax(t: &Tensor) -> NasResult<usize> {
    if t.elem_count() == 0 {
        return Err(NasError::InvalidValueChoice {
            reason: "argmax over an empty tensor".to_string(),
        });
    }
    Ok(t.flatten_all()?.argmax(0)?.to_scalar::<u32>()? as usize)
}

/// Indices of the `k` largest entries, returned ascending. Sorted on the host so ties
/// go to the lower index.
pub fn top_k_indices(t: &Tensor, k: usize) -> NasResult<Vec<usize>> {
    let values = t.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?;
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    order.truncate(k);
    order.sort_unstable();
    Ok(order)
}
