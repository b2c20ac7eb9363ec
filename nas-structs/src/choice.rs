use crate::serializable_struct_with_getters;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt};

/// A concrete value a value choice can take: an integer, a float or a tuple of integers
/// (kernel sizes, paddings).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Tuple(Vec<i64>),
}

impl Scalar {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        self.as_int().and_then(|v| usize::try_from(v).ok())
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            Scalar::Tuple(_) => None,
        }
    }

    /// Integers broadcast to `(v, v)`; two-element tuples are returned as is.
    pub fn as_pair(&self) -> Option<(i64, i64)> {
        match self {
            Scalar::Int(v) => Some((*v, *v)),
            Scalar::Tuple(v) if v.len() == 2 => Some((v[0], v[1])),
            _ => None,
        }
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Scalar::Tuple(_))
    }

    /// Total order used to sort candidate values: numbers compare numerically,
    /// tuples lexicographically, and every number sorts before every tuple.
    pub fn total_cmp(&self, other: &Scalar) -> Ordering {
        match (self, other) {
            (Scalar::Int(a), Scalar::Int(b)) => a.cmp(b),
            (Scalar::Tuple(a), Scalar::Tuple(b)) => a.cmp(b),
            (Scalar::Tuple(_), _) => Ordering::Greater,
            (_, Scalar::Tuple(_)) => Ordering::Less,
            (a, b) => {
                let a = a.as_float().unwrap_or(f64::NAN);
                let b = b.as_float().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Tuple(v) => {
                let items: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "({})", items.join(", "))
            }
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<usize> for Scalar {
    fn from(v: usize) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<(usize, usize)> for Scalar {
    fn from(v: (usize, usize)) -> Self {
        Scalar::Tuple(vec![v.0 as i64, v.1 as i64])
    }
}

impl From<(i64, i64)> for Scalar {
    fn from(v: (i64, i64)) -> Self {
        Scalar::Tuple(vec![v.0, v.1])
    }
}

/// One decision in an exported or resampled architecture.
///
/// Layer choices resolve to the chosen candidate's name, input choices to an index
/// (or a sorted list of indices when more than one input is kept) and value choices
/// to a concrete value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum ChoiceValue {
    Index(usize),
    Indices(Vec<usize>),
    Name(String),
    Value(Scalar),
}

impl ChoiceValue {
    pub fn as_index(&self) -> Option<usize> {
        match self {
            ChoiceValue::Index(i) => Some(*i),
            _ => None,
        }
    }

    /// Indices of an input choice, whether one or several were chosen.
    pub fn as_indices(&self) -> Option<Vec<usize>> {
        match self {
            ChoiceValue::Index(i) => Some(vec![*i]),
            ChoiceValue::Indices(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            ChoiceValue::Name(n) => Some(n.as_str()),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            ChoiceValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ChoiceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChoiceValue::Index(i) => write!(f, "{}", i),
            ChoiceValue::Indices(v) => write!(f, "{:?}", v),
            ChoiceValue::Name(n) => write!(f, "{}", n),
            ChoiceValue::Value(v) => write!(f, "{}", v),
        }
    }
}

impl From<Scalar> for ChoiceValue {
    fn from(v: Scalar) -> Self {
        ChoiceValue::Value(v)
    }
}

impl From<&str> for ChoiceValue {
    fn from(v: &str) -> Self {
        ChoiceValue::Name(v.to_string())
    }
}

serializable_struct_with_getters! {
    ParameterSpec {
        name: String,
        kind: String,
        values: Vec<ChoiceValue>,
        key: Vec<String>,
        categorical: bool,
        size: usize,
        chosen_size: Option<usize>,
    }
}

impl ParameterSpec {
    pub fn choice(label: &str, values: Vec<ChoiceValue>) -> Self {
        Self {
            name: label.to_string(),
            kind: "choice".to_string(),
            size: values.len(),
            values,
            key: vec![label.to_string()],
            categorical: true,
            chosen_size: None,
        }
    }

    pub fn with_chosen_size(mut self, chosen_size: usize) -> Self {
        self.chosen_size = Some(chosen_size);
        self
    }
}
