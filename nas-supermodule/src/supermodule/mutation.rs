use super::{BaseSuperNetModule, Memo, MixedOperationSamplingPolicy, Normalizer, OperationArguments, Softmax};
use crate::{
    nn::{join_name, Module},
    NasError, NasResult,
};
use candle_core::{Device, Tensor, Var};
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::cell::RefCell;

/// Builds the sampling policy of one mixed operation. Architecture weights it creates
/// must go through [`resolve_alpha`] so tied labels share them.
pub type PolicyFactory = fn(
    &OperationArguments,
    &mut Memo<Var>,
    &MutateKwargs,
) -> NasResult<Box<dyn MixedOperationSamplingPolicy>>;

/// Construction-time configuration handed to every mutation hook.
pub struct MutateKwargs {
    pub mixed_op_sampling: Option<PolicyFactory>,
    pub softmax: Box<dyn Normalizer>,
    pub device: Device,
    rng: RefCell<StdRng>,
}

impl MutateKwargs {
    pub fn new(seed: u64) -> Self {
        Self {
            mixed_op_sampling: None,
            softmax: Box::new(Softmax),
            device: Device::Cpu,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn with_mixed_op_sampling(mut self, factory: PolicyFactory) -> Self {
        self.mixed_op_sampling = Some(factory);
        self
    }

    pub fn with_softmax(mut self, softmax: Box<dyn Normalizer>) -> Self {
        self.softmax = softmax;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Fresh architecture weights, `N(0, 1) * 1e-3`.
    pub fn init_alpha(&self, size: usize) -> NasResult<Var> {
        let mut rng = self.rng.borrow_mut();
        let values: Vec<f32> = (0..size)
            .map(|_| rng.sample::<f32, _>(StandardNormal) * 1e-3)
            .collect();
        Ok(Var::from_tensor(&Tensor::from_vec(values, size, &self.device)?)?)
    }

    /// An independent generator for a module that samples on its own.
    pub fn fork_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.rng.borrow_mut().gen())
    }
}

impl Default for MutateKwargs {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Reuses the architecture weights recorded for `label`, or creates and records them.
pub fn resolve_alpha(
    label: &str,
    size: usize,
    memo: &mut Memo<Var>,
    kwargs: &MutateKwargs,
) -> NasResult<Var> {
    match memo.get(label) {
        Some(alpha) => {
            let expected = alpha.elem_count();
            if expected != size {
                return Err(NasError::AlphaSizeMismatch {
                    label: label.to_string(),
                    expected,
                    actual: size,
                });
            }
            Ok(alpha.clone())
        }
        None => {
            let alpha = kwargs.init_alpha(size)?;
            memo.insert(label, alpha.clone());
            Ok(alpha)
        }
    }
}

/// One entry of the prioritized hook list consulted for every module in the tree.
pub trait MutationHook {
    /// Returns the replacement for `module`, or `None` to let the next hook try.
    fn mutate(
        &self,
        module: &mut Box<dyn Module>,
        name: &str,
        memo: &mut Memo<Var>,
        kwargs: &MutateKwargs,
    ) -> NasResult<Option<Box<dyn Module>>>;
}

impl<F> MutationHook for F
where
    F: Fn(
        &mut Box<dyn Module>,
        &str,
        &mut Memo<Var>,
        &MutateKwargs,
    ) -> NasResult<Option<Box<dyn Module>>>,
{
    fn mutate(
        &self,
        module: &mut Box<dyn Module>,
        name: &str,
        memo: &mut Memo<Var>,
        kwargs: &MutateKwargs,
    ) -> NasResult<Option<Box<dyn Module>>> {
        self(module, name, memo, kwargs)
    }
}

/// The mutation hook of surrogate type `T`.
pub fn hook<T: BaseSuperNetModule>() -> Box<dyn MutationHook> {
    Box::new(T::mutate)
}

/// Replaces every child of `root` for which some hook produces a surrogate.
///
/// Hooks are tried in order and the first replacement wins. Traversal continues into
/// the replacement's children so that nested choices are mutated too. One memo is
/// shared by the whole pass. Returns the paths of replaced modules.
pub fn traverse_and_mutate_submodules(
    root: &mut dyn Module,
    hooks: &[Box<dyn MutationHook>],
    kwargs: &MutateKwargs,
) -> NasResult<Vec<String>> {
    let mut memo = Memo::new();
    let mut mutated = Vec::new();
    mutate_children(root, "", hooks, &mut memo, kwargs, &mut mutated)?;
    Ok(mutated)
}

fn mutate_children(
    module: &mut dyn Module,
    prefix: &str,
    hooks: &[Box<dyn MutationHook>],
    memo: &mut Memo<Var>,
    kwargs: &MutateKwargs,
    mutated: &mut Vec<String>,
) -> NasResult<()> {
    for (name, slot) in module.children_mut() {
        let path = join_name(prefix, &name);
        let mut replacement = None;
        for hook in hooks {
            if let Some(surrogate) = hook.mutate(slot, &name, memo, kwargs)? {
                replacement = Some(surrogate);
                break;
            }
        }
        if let Some(surrogate) = replacement {
            debug!("Mutated {} into {}", path, surrogate.type_name());
            *slot = surrogate;
            mutated.push(path.clone());
        }
        mutate_children(slot.as_mut(), &path, hooks, memo, kwargs, mutated)?;
    }
    Ok(())
}
