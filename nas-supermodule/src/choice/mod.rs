mod value_choice;
pub use value_choice::*;

use crate::{
    nn::{Module, NamedModules},
    NasError, NasResult,
};
use candle_core::Tensor;
use std::{any::Any, fmt};

/// Choose exactly one of several candidate submodules.
pub struct LayerChoice {
    pub label: String,
    pub candidates: Vec<(String, Box<dyn Module>)>,
}

impl LayerChoice {
    /// Candidates are named by position: `"0"`, `"1"`, ...
    pub fn new(label: &str, candidates: Vec<Box<dyn Module>>) -> Self {
        Self {
            label: label.to_string(),
            candidates: candidates
                .into_iter()
                .enumerate()
                .map(|(i, m)| (i.to_string(), m))
                .collect(),
        }
    }

    pub fn named(label: &str, candidates: Vec<(&str, Box<dyn Module>)>) -> Self {
        Self {
            label: label.to_string(),
            candidates: candidates
                .into_iter()
                .map(|(name, m)| (name.to_string(), m))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.candidates.iter().map(|(n, _)| n.clone()).collect()
    }
}

impl Module for LayerChoice {
    fn type_name(&self) -> &'static str {
        "LayerChoice"
    }

    fn forward(&self, _xs: &Tensor) -> NasResult<Tensor> {
        Err(NasError::UnresolvedChoice {
            module: format!("LayerChoice '{}'", self.label),
        })
    }

    fn forward_many(&self, _xs: &[Tensor]) -> NasResult<Tensor> {
        Err(NasError::UnresolvedChoice {
            module: format!("LayerChoice '{}'", self.label),
        })
    }

    fn named_children(&self) -> NamedModules<'_> {
        self.candidates
            .iter()
            .map(|(n, m)| (n.clone(), m.as_ref()))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<(String, &mut Box<dyn Module>)> {
        self.candidates
            .iter_mut()
            .map(|(n, m)| (n.clone(), m))
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Mean,
    Concat,
    None,
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reduction::Sum => "sum",
            Reduction::Mean => "mean",
            Reduction::Concat => "concat",
            Reduction::None => "none",
        };
        write!(f, "{}", name)
    }
}

/// Choose `n_chosen` of `n_candidates` input tensors and reduce them.
#[derive(Clone, Debug)]
pub struct InputChoice {
    pub label: String,
    pub n_candidates: usize,
    pub n_chosen: Option<usize>,
    pub reduction: Reduction,
}

impl InputChoice {
    pub fn new(label: &str, n_candidates: usize, n_chosen: Option<usize>) -> Self {
        Self {
            label: label.to_string(),
            n_candidates,
            n_chosen,
            reduction: Reduction::Sum,
        }
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }
}

impl Module for InputChoice {
    fn type_name(&self) -> &'static str {
        "InputChoice"
    }

    fn forward(&self, _xs: &Tensor) -> NasResult<Tensor> {
        Err(NasError::UnresolvedChoice {
            module: format!("InputChoice '{}'", self.label),
        })
    }

    fn forward_many(&self, _xs: &[Tensor]) -> NasResult<Tensor> {
        Err(NasError::UnresolvedChoice {
            module: format!("InputChoice '{}'", self.label),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
