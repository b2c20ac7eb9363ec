mod attention;
mod batch_norm;
mod conv;
pub mod functional;
mod linear;

pub use attention::*;
pub use batch_norm::*;
pub use conv::*;
pub use linear::*;

use crate::{choice::ValueChoice, choice::ValueChoiceX, supermodule::BaseSuperNetModule};
use crate::{NasError, NasResult};
use candle_core::{Device, Tensor, Var};
use nas_structs::choice::Scalar;
use std::{
    any::Any,
    collections::{BTreeMap, HashMap, HashSet},
};

pub type NamedModules<'a> = Vec<(String, &'a dyn Module)>;

/// A node of the module graph.
///
/// Children are exposed twice: read-only for traversal and as mutable boxed slots so the
/// mutation engine can swap a child for its surrogate in place.
pub trait Module: Any {
    fn type_name(&self) -> &'static str;

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor>;

    fn forward_many(&self, xs: &[Tensor]) -> NasResult<Tensor> {
        match xs {
            [x] => self.forward(x),
            _ => Err(NasError::InputArity {
                module: self.type_name().to_string(),
                expected: 1,
                actual: xs.len(),
            }),
        }
    }

    fn named_children(&self) -> NamedModules<'_> {
        Vec::new()
    }

    fn children_mut(&mut self) -> Vec<(String, &mut Box<dyn Module>)> {
        Vec::new()
    }

    /// Learnable tensors owned directly by this module, children excluded.
    fn own_parameters(&self) -> Vec<(String, Var)> {
        Vec::new()
    }

    fn is_arch_parameter(&self, _name: &str) -> bool {
        false
    }

    fn set_training(&mut self, training: bool) {
        for (_, child) in self.children_mut() {
            child.set_training(training);
        }
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn as_supernet(&self) -> Option<&dyn BaseSuperNetModule> {
        None
    }

    fn as_supernet_mut(&mut self) -> Option<&mut dyn BaseSuperNetModule> {
        None
    }
}

pub(crate) fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn collect_parameters(
    module: &dyn Module,
    prefix: &str,
    arch: bool,
    seen: &mut HashSet<candle_core::TensorId>,
    out: &mut Vec<(String, Var)>,
) {
    for (name, var) in module.own_parameters() {
        if module.is_arch_parameter(&name) == arch && seen.insert(var.as_tensor().id()) {
            out.push((join_name(prefix, &name), var));
        }
    }
    for (name, child) in module.named_children() {
        collect_parameters(child, &join_name(prefix, &name), arch, seen, out);
    }
}

/// Parameters of the whole tree in one partition: architecture parameters when `arch`
/// is set, ordinary weights otherwise. Shared tensors are reported once, under the first
/// path that reaches them.
pub fn named_parameters(root: &dyn Module, arch: bool) -> Vec<(String, Var)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    collect_parameters(root, "", arch, &mut seen, &mut out);
    out
}

fn collect_modules<'a>(module: &'a dyn Module, prefix: String, out: &mut NamedModules<'a>) {
    let children = module.named_children();
    out.push((prefix.clone(), module));
    for (name, child) in children {
        collect_modules(child, join_name(&prefix, &name), out);
    }
}

/// Named modules of the tree in pre-order, the root included as `""`.
pub fn named_modules(root: &dyn Module) -> NamedModules<'_> {
    let mut out = Vec::new();
    collect_modules(root, String::new(), &mut out);
    out
}

/// A recorded constructor argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Value(Scalar),
    Bool(bool),
    Text(String),
    None,
    Choice(ValueChoiceX),
}

impl Arg {
    pub fn as_choice(&self) -> Option<&ValueChoiceX> {
        match self {
            Arg::Choice(expr) => Some(expr),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Arg::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        self.as_scalar().and_then(Scalar::as_usize)
    }

    pub fn as_pair(&self) -> Option<(usize, usize)> {
        let (a, b) = self.as_scalar().and_then(Scalar::as_pair)?;
        Some((usize::try_from(a).ok()?, usize::try_from(b).ok()?))
    }

    pub fn as_float(&self) -> Option<f64> {
        self.as_scalar().and_then(Scalar::as_float)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Arg::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Arg::None)
    }
}

impl From<Scalar> for Arg {
    fn from(v: Scalar) -> Self {
        Arg::Value(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Value(Scalar::Int(v))
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Value(Scalar::from(v))
    }
}

impl From<usize> for Arg {
    fn from(v: usize) -> Self {
        Arg::Value(Scalar::from(v))
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Value(Scalar::Float(v))
    }
}

impl From<(usize, usize)> for Arg {
    fn from(v: (usize, usize)) -> Self {
        Arg::Value(Scalar::from(v))
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Text(v.to_string())
    }
}

impl From<Option<usize>> for Arg {
    fn from(v: Option<usize>) -> Self {
        v.map_or(Arg::None, Arg::from)
    }
}

impl From<ValueChoice> for Arg {
    fn from(v: ValueChoice) -> Self {
        Arg::Choice(v.into())
    }
}

/// Expressions without any choice inside are folded to their value.
impl From<ValueChoiceX> for Arg {
    fn from(v: ValueChoiceX) -> Self {
        if v.is_constant() {
            if let Ok(value) = v.evaluate(&HashMap::new()) {
                return Arg::Value(value);
            }
        }
        Arg::Choice(v)
    }
}

pub type Kwargs = BTreeMap<String, Arg>;

/// A layer built from recorded keyword arguments, so that it can be rebuilt at a
/// different size.
pub trait Traceable: Module + Sized {
    const TYPE_NAME: &'static str;
    const REQUIRED_ARGUMENTS: &'static [&'static str];

    /// Every optional argument of the constructor with its default.
    fn default_arguments() -> Kwargs;

    fn from_kwargs(kwargs: Kwargs, device: &Device) -> NasResult<Self>;

    /// Arguments exactly as given at construction.
    fn trace_kwargs(&self) -> &Kwargs;

    fn device(&self) -> &Device;
}

/// Fills in defaults and checks that nothing is missing or unknown.
pub fn resolve_arguments<T: Traceable>(kwargs: &Kwargs) -> NasResult<Kwargs> {
    let mut resolved = T::default_arguments();
    for name in kwargs.keys() {
        if !resolved.contains_key(name) && !T::REQUIRED_ARGUMENTS.contains(&name.as_str()) {
            return Err(NasError::InvalidArgument {
                operator: T::TYPE_NAME.to_string(),
                argument: name.clone(),
                reason: "unexpected argument".to_string(),
            });
        }
    }
    for name in T::REQUIRED_ARGUMENTS {
        if !kwargs.contains_key(*name) {
            return Err(NasError::MissingArgument {
                operator: T::TYPE_NAME.to_string(),
                argument: name.to_string(),
            });
        }
    }
    resolved.extend(kwargs.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(resolved)
}

pub fn has_choice(kwargs: &Kwargs) -> bool {
    kwargs.values().any(|arg| arg.as_choice().is_some())
}

/// Typed access to resolved arguments, reporting the operator on failure.
pub struct ArgReader<'a> {
    operator: &'static str,
    kwargs: &'a Kwargs,
}

impl<'a> ArgReader<'a> {
    pub fn new(operator: &'static str, kwargs: &'a Kwargs) -> Self {
        Self { operator, kwargs }
    }

    fn get(&self, name: &str) -> NasResult<&'a Arg> {
        self.kwargs.get(name).ok_or_else(|| NasError::MissingArgument {
            operator: self.operator.to_string(),
            argument: name.to_string(),
        })
    }

    fn invalid(&self, name: &str, expected: &str) -> NasError {
        NasError::InvalidArgument {
            operator: self.operator.to_string(),
            argument: name.to_string(),
            reason: format!("expected {}", expected),
        }
    }

    pub fn usize(&self, name: &str) -> NasResult<usize> {
        self.get(name)?
            .as_usize()
            .ok_or_else(|| self.invalid(name, "a non-negative integer"))
    }

    pub fn optional_usize(&self, name: &str) -> NasResult<Option<usize>> {
        match self.get(name)? {
            Arg::None => Ok(None),
            arg => arg
                .as_usize()
                .map(Some)
                .ok_or_else(|| self.invalid(name, "a non-negative integer or none")),
        }
    }

    pub fn pair(&self, name: &str) -> NasResult<(usize, usize)> {
        self.get(name)?
            .as_pair()
            .ok_or_else(|| self.invalid(name, "an integer or a pair of integers"))
    }

    pub fn float(&self, name: &str) -> NasResult<f64> {
        self.get(name)?
            .as_float()
            .ok_or_else(|| self.invalid(name, "a number"))
    }

    pub fn boolean(&self, name: &str) -> NasResult<bool> {
        self.get(name)?
            .as_bool()
            .ok_or_else(|| self.invalid(name, "a boolean"))
    }

    pub fn text(&self, name: &str) -> NasResult<&'a str> {
        self.get(name)?
            .as_text()
            .ok_or_else(|| self.invalid(name, "a string"))
    }
}

/// Uniform in `[-bound, bound)`, the default initialisation of weights and biases.
pub(crate) fn uniform_var(bound: f64, shape: &[usize], device: &Device) -> NasResult<Var> {
    let t = Tensor::rand(-bound as f32, bound as f32, shape, device)?;
    Ok(Var::from_tensor(&t)?)
}

#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: Module>(mut self, layer: M) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn push(&mut self, layer: Box<dyn Module>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Module> {
        self.layers.get(index).map(|l| l.as_ref())
    }
}

impl Module for Sequential {
    fn type_name(&self) -> &'static str {
        "Sequential"
    }

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor> {
        self.forward_many(std::slice::from_ref(xs))
    }

    /// The first layer receives every input; the rest are chained.
    fn forward_many(&self, xs: &[Tensor]) -> NasResult<Tensor> {
        let mut layers = self.layers.iter();
        let mut out = match layers.next() {
            Some(first) => first.forward_many(xs)?,
            None => match xs {
                [x] => x.clone(),
                _ => {
                    return Err(NasError::InputArity {
                        module: self.type_name().to_string(),
                        expected: 1,
                        actual: xs.len(),
                    })
                }
            },
        };
        for layer in layers {
            out = layer.forward(&out)?;
        }
        Ok(out)
    }

    fn named_children(&self) -> NamedModules<'_> {
        self.layers
            .iter()
            .enumerate()
            .map(|(i, l)| (i.to_string(), l.as_ref()))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<(String, &mut Box<dyn Module>)> {
        self.layers
            .iter_mut()
            .enumerate()
            .map(|(i, l)| (i.to_string(), l))
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct Relu;

impl Module for Relu {
    fn type_name(&self) -> &'static str {
        "Relu"
    }

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor> {
        Ok(xs.relu()?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct Identity;

impl Module for Identity {
    fn type_name(&self) -> &'static str {
        "Identity"
    }

    fn forward(&self, xs: &Tensor) -> NasResult<Tensor> {
        Ok(xs.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
