use super::{
    slicing::MaybeWeighted, BaseSuperNetModule, Decisions, Memo, MutateKwargs,
};
use crate::{
    choice::{dedup_inner_choices, traverse_all_options, ValueChoiceX},
    nn::{resolve_arguments, Arg, Kwargs, Module, Traceable},
    NasError, NasResult,
};
use candle_core::{backprop::GradStore, Device, Tensor, Var};
use nas_structs::choice::{ChoiceValue, ParameterSpec, Scalar};
use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
};

/// Name prefix of architecture weights owned by a mixed operation's sampling policy.
pub const ARCH_ALPHA_PREFIX: &str = "_arch_alpha.";

/// Constructor arguments of a layer being turned into a mixed operation.
#[derive(Clone, Debug)]
pub struct OperationArguments {
    /// Every argument with defaults filled in. Mutable ones still hold their choice.
    pub init_arguments: Kwargs,
    pub mutable_arguments: BTreeMap<String, ValueChoiceX>,
    /// Distinct leaf labels of all mutable arguments.
    pub space_spec: BTreeMap<String, ParameterSpec>,
}

impl OperationArguments {
    pub fn resolve<O: MixedOperator>(kwargs: &Kwargs) -> NasResult<Self> {
        let mut init_arguments = resolve_arguments::<O::Bound>(kwargs)?;
        let mut mutable_arguments = BTreeMap::new();
        for (name, arg) in init_arguments.iter_mut() {
            let expr = match arg {
                Arg::Choice(expr) => expr.clone(),
                _ => continue,
            };
            if expr.is_constant() {
                *arg = Arg::Value(expr.evaluate(&HashMap::new())?);
                continue;
            }
            if !O::ARGUMENT_LIST.contains(&name.as_str()) {
                return Err(NasError::UnsupportedArgument {
                    operator: O::NAME.to_string(),
                    argument: name.clone(),
                });
            }
            mutable_arguments.insert(name.clone(), expr);
        }
        let space_spec = dedup_inner_choices(mutable_arguments.values())?;
        Ok(Self {
            init_arguments,
            mutable_arguments,
            space_spec,
        })
    }

    pub fn is_mutable(&self, name: &str) -> bool {
        self.mutable_arguments.contains_key(name)
    }

    /// Arguments used to build the superkernel: each mutable argument replaced by the
    /// operator's safe maximal value.
    pub fn super_kwargs<O: MixedOperator>(&self) -> NasResult<Kwargs> {
        let mut kwargs = self.init_arguments.clone();
        for (name, expr) in &self.mutable_arguments {
            kwargs.insert(name.clone(), Arg::Value(O::super_init_argument(name, expr)?));
        }
        Ok(kwargs)
    }
}

/// Largest option of `expr`. Options mixing integers and pairs are maximised per axis.
pub fn max_option(expr: &ValueChoiceX) -> NasResult<Scalar> {
    let options = traverse_all_options(expr)?;
    if options.iter().any(Scalar::is_tuple) {
        let mut best: Option<(i64, i64)> = None;
        for option in &options {
            let (a, b) = option.as_pair().ok_or_else(|| NasError::InvalidValueChoice {
                reason: format!("expected an integer or a pair, got {}", option),
            })?;
            best = Some(match best {
                Some((x, y)) => (x.max(a), y.max(b)),
                None => (a, b),
            });
        }
        return best
            .map(Scalar::from)
            .ok_or_else(|| NasError::InvalidValueChoice {
                reason: format!("{} has no options", expr),
            });
    }
    options
        .last()
        .cloned()
        .ok_or_else(|| NasError::InvalidValueChoice {
            reason: format!("{} has no options", expr),
        })
}

pub fn min_option(expr: &ValueChoiceX) -> NasResult<Scalar> {
    traverse_all_options(expr)?
        .first()
        .cloned()
        .ok_or_else(|| NasError::InvalidValueChoice {
            reason: format!("{} has no options", expr),
        })
}

/// The value of one argument for one forward call.
#[derive(Clone, Debug)]
pub enum SampledArgument {
    Concrete(Arg),
    Weighted(Vec<(Scalar, Tensor)>),
}

/// Every argument of one forward call, with typed accessors that fail fast when an
/// argument cannot be used the way it was sampled.
pub struct SampledArguments {
    operator: &'static str,
    values: BTreeMap<String, SampledArgument>,
}

impl SampledArguments {
    pub fn new(operator: &'static str, values: BTreeMap<String, SampledArgument>) -> Self {
        Self { operator, values }
    }

    pub fn get(&self, name: &str) -> NasResult<&SampledArgument> {
        self.values.get(name).ok_or_else(|| NasError::MissingArgument {
            operator: self.operator.to_string(),
            argument: name.to_string(),
        })
    }

    pub fn is_weighted(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(SampledArgument::Weighted(_)))
    }

    /// Fails when any of `names` was sampled as a distribution.
    pub fn ensure_concrete(&self, names: &[&str]) -> NasResult<()> {
        match names.iter().find(|name| self.is_weighted(name)) {
            Some(name) => Err(NasError::WeightedSamplingUnsupported {
                operator: self.operator.to_string(),
                argument: name.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn invalid(&self, name: &str, expected: &str) -> NasError {
        NasError::InvalidArgument {
            operator: self.operator.to_string(),
            argument: name.to_string(),
            reason: format!("expected {}", expected),
        }
    }

    pub fn concrete(&self, name: &str) -> NasResult<&Arg> {
        match self.get(name)? {
            SampledArgument::Concrete(arg) => Ok(arg),
            SampledArgument::Weighted(_) => Err(NasError::WeightedSamplingUnsupported {
                operator: self.operator.to_string(),
                argument: name.to_string(),
            }),
        }
    }

    pub fn concrete_usize(&self, name: &str) -> NasResult<usize> {
        self.concrete(name)?
            .as_usize()
            .ok_or_else(|| self.invalid(name, "a non-negative integer"))
    }

    pub fn concrete_pair(&self, name: &str) -> NasResult<(usize, usize)> {
        self.concrete(name)?
            .as_pair()
            .ok_or_else(|| self.invalid(name, "an integer or a pair of integers"))
    }

    pub fn concrete_float(&self, name: &str) -> NasResult<f64> {
        self.concrete(name)?
            .as_float()
            .ok_or_else(|| self.invalid(name, "a number"))
    }

    fn weighted<T>(
        &self,
        name: &str,
        expected: &str,
        from_scalar: impl Fn(&Scalar) -> Option<T>,
        from_arg: impl Fn(&Arg) -> Option<T>,
    ) -> NasResult<MaybeWeighted<T>> {
        match self.get(name)? {
            SampledArgument::Concrete(arg) => from_arg(arg)
                .map(MaybeWeighted::Fixed)
                .ok_or_else(|| self.invalid(name, expected)),
            SampledArgument::Weighted(items) => items
                .iter()
                .map(|(v, w)| {
                    from_scalar(v)
                        .map(|v| (v, w.clone()))
                        .ok_or_else(|| self.invalid(name, expected))
                })
                .collect::<NasResult<Vec<_>>>()
                .map(MaybeWeighted::Weighted),
        }
    }

    pub fn usize_or_weighted(&self, name: &str) -> NasResult<MaybeWeighted<usize>> {
        self.weighted(name, "a non-negative integer", Scalar::as_usize, Arg::as_usize)
    }

    pub fn pair_or_weighted(&self, name: &str) -> NasResult<MaybeWeighted<(usize, usize)>> {
        let to_pair = |s: &Scalar| {
            let (a, b) = s.as_pair()?;
            Some((usize::try_from(a).ok()?, usize::try_from(b).ok()?))
        };
        self.weighted(name, "an integer or a pair of integers", to_pair, Arg::as_pair)
    }

    /// `None` when the argument was given as none (`kdim`, `vdim`).
    pub fn optional_usize_or_weighted(&self, name: &str) -> NasResult<Option<MaybeWeighted<usize>>> {
        match self.get(name)? {
            SampledArgument::Concrete(Arg::None) => Ok(None),
            _ => self.usize_or_weighted(name).map(Some),
        }
    }
}

/// Decides, per forward call, which argument values a mixed operation runs with.
///
/// The policy is handed the operation's arguments on every call and owns whatever
/// architecture weights it needs.
pub trait MixedOperationSamplingPolicy {
    fn resample(
        &mut self,
        arguments: &OperationArguments,
        memo: &mut Memo<ChoiceValue>,
    ) -> NasResult<Decisions>;

    fn export(
        &self,
        arguments: &OperationArguments,
        memo: &mut Memo<ChoiceValue>,
    ) -> NasResult<Decisions>;

    fn forward_argument(
        &self,
        arguments: &OperationArguments,
        name: &str,
    ) -> NasResult<SampledArgument>;

    /// Architecture weights keyed by label.
    fn arch_parameters(&self) -> Vec<(String, Var)>;

    fn finalize_grad(&self, _grads: &mut GradStore) -> NasResult<()> {
        Ok(())
    }

    fn set_temperature(&mut self, _temperature: f64) {}
}

/// Operator-specific half of a mixed operation: how to size the superkernel and how to
/// run a forward pass with sampled arguments.
pub trait MixedOperator: Sized + 'static {
    type Bound: Traceable;

    const NAME: &'static str;
    /// Arguments that may hold a value choice.
    const ARGUMENT_LIST: &'static [&'static str];

    /// Construction value for a mutable argument, large enough for every candidate.
    fn super_init_argument(_name: &str, expr: &ValueChoiceX) -> NasResult<Scalar> {
        max_option(expr)
    }

    fn build(super_kwargs: &Kwargs, arguments: &OperationArguments, device: &Device)
        -> NasResult<Self>;

    fn forward_with_args(
        &self,
        args: &SampledArguments,
        xs: &[Tensor],
        training: bool,
    ) -> NasResult<Tensor>;

    fn parameters(&self) -> Vec<(String, Var)>;
}

/// A layer with value-choice arguments turned into one superkernel plus a sampling
/// policy.
pub struct MixedOperation<O: MixedOperator> {
    arguments: OperationArguments,
    operator: O,
    sampling_policy: Box<dyn MixedOperationSamplingPolicy>,
    training: bool,
}

impl<O: MixedOperator> MixedOperation<O> {
    pub fn new(
        arguments: OperationArguments,
        operator: O,
        sampling_policy: Box<dyn MixedOperationSamplingPolicy>,
    ) -> Self {
        Self {
            arguments,
            operator,
            sampling_policy,
            training: true,
        }
    }

    pub fn operator(&self) -> &O {
        &self.operator
    }

    pub fn arguments(&self) -> &OperationArguments {
        &self.arguments
    }

    pub fn sampled_arguments(&self) -> NasResult<SampledArguments> {
        let mut values = BTreeMap::new();
        for (name, arg) in &self.arguments.init_arguments {
            let value = if self.arguments.is_mutable(name) {
                self.sampling_policy.forward_argument(&self.arguments, name)?
            } else {
                SampledArgument::Concrete(arg.clone())
            };
            values.insert(name.clone(), value);
        }
        Ok(SampledArguments::new(O::NAME, values))
    }

    /// Forward pass with explicitly chosen arguments, bypassing the policy.
    pub fn forward_with_args(&self, args: &SampledArguments, xs: &[Tensor]) -> NasResult<Tensor> {
        self.operator.forward_with_args(args, xs, self.training)
    }
}

impl<O: MixedOperator> Module for MixedOperation<O> {
    fn type_name(&self) -> &'static str {
        O::NAME
    }

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor> {
        self.forward_many(std::slice::from_ref(xs))
    }

    fn forward_many(&self, xs: &[Tensor]) -> NasResult<Tensor> {
        let args = self.sampled_arguments()?;
        self.operator.forward_with_args(&args, xs, self.training)
    }

    fn own_parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.operator.parameters();
        params.extend(
            self.sampling_policy
                .arch_parameters()
                .into_iter()
                .map(|(label, var)| (format!("{}{}", ARCH_ALPHA_PREFIX, label), var)),
        );
        params
    }

    fn is_arch_parameter(&self, name: &str) -> bool {
        name.starts_with(ARCH_ALPHA_PREFIX)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
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

impl<O: MixedOperator> BaseSuperNetModule for MixedOperation<O> {
    fn resample(&mut self, memo: &mut Memo<ChoiceValue>) -> NasResult<Decisions> {
        self.sampling_policy.resample(&self.arguments, memo)
    }

    fn export(&self, memo: &mut Memo<ChoiceValue>) -> NasResult<Decisions> {
        self.sampling_policy.export(&self.arguments, memo)
    }

    fn search_space_spec(&self) -> BTreeMap<String, ParameterSpec> {
        self.arguments.space_spec.clone()
    }

    fn finalize_grad(&self, grads: &mut GradStore) -> NasResult<()> {
        self.sampling_policy.finalize_grad(grads)
    }

    fn set_temperature(&mut self, temperature: f64) {
        self.sampling_policy.set_temperature(temperature);
    }

    /// Applies to instances of the bound layer type with at least one value-choice
    /// argument.
    fn mutate(
        module: &mut Box<dyn Module>,
        _name: &str,
        memo: &mut Memo<Var>,
        kwargs: &MutateKwargs,
    ) -> NasResult<Option<Box<dyn Module>>> {
        let bound = match module.as_any().downcast_ref::<O::Bound>() {
            Some(bound) => bound,
            None => return Ok(None),
        };
        let arguments = OperationArguments::resolve::<O>(bound.trace_kwargs())?;
        if arguments.mutable_arguments.is_empty() {
            return Ok(None);
        }
        let factory = kwargs
            .mixed_op_sampling
            .ok_or_else(|| NasError::MissingSamplingPolicy {
                operator: O::NAME.to_string(),
            })?;
        let super_kwargs = arguments.super_kwargs::<O>()?;
        let operator = O::build(&super_kwargs, &arguments, bound.device())?;
        let sampling_policy = factory(&arguments, memo, kwargs)?;
        Ok(Some(Box::new(MixedOperation::new(
            arguments,
            operator,
            sampling_policy,
        ))))
    }
}
