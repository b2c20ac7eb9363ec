use crate::{NasError, NasResult};
use candle_core::Tensor;
use nas_structs::choice::{ChoiceValue, ParameterSpec, Scalar};
use std::{
    collections::{BTreeMap, HashMap},
    fmt, ops,
};

/// A leaf value choice: one label and its finite candidate set.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueChoice {
    pub label: String,
    pub candidates: Vec<Scalar>,
}

impl ValueChoice {
    pub fn new<T, I>(label: &str, candidates: I) -> Self
    where
        T: Into<Scalar>,
        I: IntoIterator<Item = T>,
    {
        Self {
            label: label.to_string(),
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }

    pub fn expr(&self) -> ValueChoiceX {
        ValueChoiceX::Choice(self.clone())
    }

    pub fn spec(&self) -> ParameterSpec {
        ParameterSpec::choice(
            &self.label,
            self.candidates
                .iter()
                .cloned()
                .map(ChoiceValue::Value)
                .collect(),
        )
    }

    pub fn max(self, other: impl Into<ValueChoiceX>) -> ValueChoiceX {
        self.expr().max(other)
    }

    pub fn min(self, other: impl Into<ValueChoiceX>) -> ValueChoiceX {
        self.expr().min(other)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
    Rem,
    Max,
    Min,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Rem => "%",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
        };
        write!(f, "{}", symbol)
    }
}

/// Expression over value choices. Leaves are choices or constants.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueChoiceX {
    Choice(ValueChoice),
    Constant(Scalar),
    Unary(UnaryOp, Box<ValueChoiceX>),
    Binary(BinaryOp, Box<ValueChoiceX>, Box<ValueChoiceX>),
}

impl ValueChoiceX {
    /// Leaf choices in depth-first order. A label used twice appears twice.
    pub fn leaf_choices(&self) -> Vec<&ValueChoice> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, leaves: &mut Vec<&'a ValueChoice>) {
        match self {
            ValueChoiceX::Choice(choice) => leaves.push(choice),
            ValueChoiceX::Constant(_) => {}
            ValueChoiceX::Unary(_, operand) => operand.collect_leaves(leaves),
            ValueChoiceX::Binary(_, lhs, rhs) => {
                lhs.collect_leaves(leaves);
                rhs.collect_leaves(leaves);
            }
        }
    }

    pub fn is_constant(&self) -> bool {
        self.leaf_choices().is_empty()
    }

    /// Evaluates the expression with one concrete value per label.
    pub fn evaluate(&self, values: &HashMap<String, Scalar>) -> NasResult<Scalar> {
        match self {
            ValueChoiceX::Choice(choice) => {
                values
                    .get(&choice.label)
                    .cloned()
                    .ok_or_else(|| NasError::InvalidValueChoice {
                        reason: format!("no value bound to label '{}'", choice.label),
                    })
            }
            ValueChoiceX::Constant(value) => Ok(value.clone()),
            ValueChoiceX::Unary(op, operand) => apply_unary(*op, &operand.evaluate(values)?),
            ValueChoiceX::Binary(op, lhs, rhs) => {
                apply_binary(*op, &lhs.evaluate(values)?, &rhs.evaluate(values)?)
            }
        }
    }

    pub fn max(self, other: impl Into<ValueChoiceX>) -> ValueChoiceX {
        ValueChoiceX::Binary(BinaryOp::Max, Box::new(self), Box::new(other.into()))
    }

    pub fn min(self, other: impl Into<ValueChoiceX>) -> ValueChoiceX {
        ValueChoiceX::Binary(BinaryOp::Min, Box::new(self), Box::new(other.into()))
    }

    pub fn abs(self) -> ValueChoiceX {
        ValueChoiceX::Unary(UnaryOp::Abs, Box::new(self))
    }
}

impl fmt::Display for ValueChoiceX {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueChoiceX::Choice(choice) => write!(f, "{}", choice.label),
            ValueChoiceX::Constant(value) => write!(f, "{}", value),
            ValueChoiceX::Unary(UnaryOp::Neg, operand) => write!(f, "-({})", operand),
            ValueChoiceX::Unary(UnaryOp::Abs, operand) => write!(f, "abs({})", operand),
            ValueChoiceX::Binary(op @ (BinaryOp::Max | BinaryOp::Min), lhs, rhs) => {
                write!(f, "{}({}, {})", op, lhs, rhs)
            }
            ValueChoiceX::Binary(op, lhs, rhs) => write!(f, "({} {} {})", lhs, op, rhs),
        }
    }
}

impl From<ValueChoice> for ValueChoiceX {
    fn from(choice: ValueChoice) -> Self {
        ValueChoiceX::Choice(choice)
    }
}

impl From<Scalar> for ValueChoiceX {
    fn from(value: Scalar) -> Self {
        ValueChoiceX::Constant(value)
    }
}

impl From<i64> for ValueChoiceX {
    fn from(value: i64) -> Self {
        ValueChoiceX::Constant(Scalar::Int(value))
    }
}

impl From<i32> for ValueChoiceX {
    fn from(value: i32) -> Self {
        ValueChoiceX::Constant(Scalar::from(value))
    }
}

impl From<usize> for ValueChoiceX {
    fn from(value: usize) -> Self {
        ValueChoiceX::Constant(Scalar::from(value))
    }
}

impl From<f64> for ValueChoiceX {
    fn from(value: f64) -> Self {
        ValueChoiceX::Constant(Scalar::Float(value))
    }
}

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<T: Into<ValueChoiceX>> ops::$trait<T> for ValueChoiceX {
            type Output = ValueChoiceX;

            fn $method(self, rhs: T) -> ValueChoiceX {
                ValueChoiceX::Binary($op, Box::new(self), Box::new(rhs.into()))
            }
        }

        impl<T: Into<ValueChoiceX>> ops::$trait<T> for ValueChoice {
            type Output = ValueChoiceX;

            fn $method(self, rhs: T) -> ValueChoiceX {
                ValueChoiceX::Binary($op, Box::new(self.into()), Box::new(rhs.into()))
            }
        }
    };
}

impl_binary_operator!(Add, add, BinaryOp::Add);
impl_binary_operator!(Sub, sub, BinaryOp::Sub);
impl_binary_operator!(Mul, mul, BinaryOp::Mul);
// `/` is floor division, matching integer channel arithmetic.
impl_binary_operator!(Div, div, BinaryOp::FloorDiv);
impl_binary_operator!(Rem, rem, BinaryOp::Rem);

impl ops::Neg for ValueChoiceX {
    type Output = ValueChoiceX;

    fn neg(self) -> ValueChoiceX {
        ValueChoiceX::Unary(UnaryOp::Neg, Box::new(self))
    }
}

impl ops::Neg for ValueChoice {
    type Output = ValueChoiceX;

    fn neg(self) -> ValueChoiceX {
        -self.expr()
    }
}

fn floor_div_int(a: i64, b: i64) -> NasResult<i64> {
    if b == 0 {
        return Err(NasError::InvalidValueChoice {
            reason: "integer division by zero".to_string(),
        });
    }
    let q = a / b;
    Ok(if a % b != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    })
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> NasResult<i64> {
    Ok(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::FloorDiv => floor_div_int(a, b)?,
        BinaryOp::Rem => a - b * floor_div_int(a, b)?,
        BinaryOp::Max => a.max(b),
        BinaryOp::Min => a.min(b),
    })
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::FloorDiv => (a / b).floor(),
        BinaryOp::Rem => a - b * (a / b).floor(),
        BinaryOp::Max => a.max(b),
        BinaryOp::Min => a.min(b),
    }
}

fn apply_unary(op: UnaryOp, value: &Scalar) -> NasResult<Scalar> {
    Ok(match (op, value) {
        (UnaryOp::Neg, Scalar::Int(v)) => Scalar::Int(-v),
        (UnaryOp::Neg, Scalar::Float(v)) => Scalar::Float(-v),
        (UnaryOp::Neg, Scalar::Tuple(v)) => Scalar::Tuple(v.iter().map(|x| -x).collect()),
        (UnaryOp::Abs, Scalar::Int(v)) => Scalar::Int(v.abs()),
        (UnaryOp::Abs, Scalar::Float(v)) => Scalar::Float(v.abs()),
        (UnaryOp::Abs, Scalar::Tuple(v)) => Scalar::Tuple(v.iter().map(|x| x.abs()).collect()),
    })
}

fn apply_binary(op: BinaryOp, lhs: &Scalar, rhs: &Scalar) -> NasResult<Scalar> {
    if matches!(op, BinaryOp::Max | BinaryOp::Min) {
        let lhs_wins = match op {
            BinaryOp::Max => lhs.total_cmp(rhs).is_ge(),
            _ => lhs.total_cmp(rhs).is_le(),
        };
        return Ok(if lhs_wins { lhs.clone() } else { rhs.clone() });
    }
    match (lhs, rhs) {
        (Scalar::Int(a), Scalar::Int(b)) => Ok(Scalar::Int(int_op(op, *a, *b)?)),
        (Scalar::Tuple(a), Scalar::Int(b)) => Ok(Scalar::Tuple(
            a.iter()
                .map(|x| int_op(op, *x, *b))
                .collect::<NasResult<_>>()?,
        )),
        (Scalar::Int(a), Scalar::Tuple(b)) => Ok(Scalar::Tuple(
            b.iter()
                .map(|x| int_op(op, *a, *x))
                .collect::<NasResult<_>>()?,
        )),
        (Scalar::Tuple(a), Scalar::Tuple(b)) if a.len() == b.len() => Ok(Scalar::Tuple(
            a.iter()
                .zip(b)
                .map(|(x, y)| int_op(op, *x, *y))
                .collect::<NasResult<_>>()?,
        )),
        (a, b) => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => Ok(Scalar::Float(float_op(op, x, y))),
            _ => Err(NasError::InvalidValueChoice {
                reason: format!("cannot apply '{}' to {} and {}", op, a, b),
            }),
        },
    }
}

/// Every index combination of `sizes`, last axis varying fastest.
pub(crate) fn cartesian_product(sizes: &[usize]) -> Vec<Vec<usize>> {
    let mut combinations = vec![Vec::new()];
    for &size in sizes {
        combinations = combinations
            .into_iter()
            .flat_map(|prefix| {
                (0..size).map(move |i| {
                    let mut next = prefix.clone();
                    next.push(i);
                    next
                })
            })
            .collect();
    }
    combinations
}

/// Distinct leaf choices of `expr`, first occurrence wins.
fn distinct_leaves(expr: &ValueChoiceX) -> Vec<&ValueChoice> {
    let mut leaves: Vec<&ValueChoice> = Vec::new();
    for leaf in expr.leaf_choices() {
        if !leaves.iter().any(|l| l.label == leaf.label) {
            leaves.push(leaf);
        }
    }
    leaves
}

/// All values `expr` can take, sorted and de-duplicated.
pub fn traverse_all_options(expr: &ValueChoiceX) -> NasResult<Vec<Scalar>> {
    let leaves = distinct_leaves(expr);
    let sizes: Vec<usize> = leaves.iter().map(|l| l.candidates.len()).collect();
    let mut options: Vec<Scalar> = Vec::new();
    for combination in cartesian_product(&sizes) {
        let values = leaves
            .iter()
            .zip(&combination)
            .map(|(leaf, &i)| (leaf.label.clone(), leaf.candidates[i].clone()))
            .collect();
        let value = expr.evaluate(&values)?;
        if !options.contains(&value) {
            options.push(value);
        }
    }
    options.sort_by(|a, b| a.total_cmp(b));
    Ok(options)
}

/// All values `expr` can take with their joint probability.
///
/// `weights` maps every leaf label to a normalized 1-D weight tensor. The weight of one
/// combination is the product of its per-label weights; combinations that evaluate to the
/// same value have their weights summed. The result is sorted by value.
pub fn traverse_all_options_weighted(
    expr: &ValueChoiceX,
    weights: &HashMap<String, Tensor>,
) -> NasResult<Vec<(Scalar, Tensor)>> {
    let leaves = distinct_leaves(expr);
    let mut leaf_weights = Vec::with_capacity(leaves.len());
    for leaf in &leaves {
        let w = weights
            .get(&leaf.label)
            .ok_or_else(|| NasError::InvalidValueChoice {
                reason: format!("no weights for label '{}'", leaf.label),
            })?;
        leaf_weights.push(w);
    }
    let sizes: Vec<usize> = leaves.iter().map(|l| l.candidates.len()).collect();
    let mut options: Vec<(Scalar, Tensor)> = Vec::new();
    for combination in cartesian_product(&sizes) {
        let mut values = HashMap::new();
        let mut weight: Option<Tensor> = None;
        for ((leaf, w), &i) in leaves.iter().zip(&leaf_weights).zip(&combination) {
            values.insert(leaf.label.clone(), leaf.candidates[i].clone());
            let wi = w.get(i)?;
            weight = Some(match weight {
                Some(acc) => acc.mul(&wi)?,
                None => wi,
            });
        }
        let weight = match weight {
            Some(weight) => weight,
            None => continue,
        };
        let value = expr.evaluate(&values)?;
        match options.iter_mut().find(|(v, _)| *v == value) {
            Some((_, acc)) => *acc = acc.add(&weight)?,
            None => options.push((value, weight)),
        }
    }
    options.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(options)
}

/// Collects the distinct leaf choices of `exprs` into a search space keyed by label.
///
/// The same label must always carry the same candidates.
pub fn dedup_inner_choices<'a, I>(exprs: I) -> NasResult<BTreeMap<String, ParameterSpec>>
where
    I: IntoIterator<Item = &'a ValueChoiceX>,
{
    let mut found: BTreeMap<String, &ValueChoice> = BTreeMap::new();
    let leaves: Vec<&ValueChoice> = exprs
        .into_iter()
        .flat_map(|expr| expr.leaf_choices())
        .collect();
    for leaf in leaves {
        if leaf.candidates.is_empty() {
            return Err(NasError::EmptyCandidates {
                label: leaf.label.clone(),
            });
        }
        match found.get(&leaf.label) {
            Some(existing) if existing.candidates != leaf.candidates => {
                return Err(NasError::LabelConflict {
                    label: leaf.label.clone(),
                    existing: existing.candidates.iter().map(|c| c.to_string()).collect(),
                    incoming: leaf.candidates.iter().map(|c| c.to_string()).collect(),
                })
            }
            Some(_) => {}
            None => {
                found.insert(leaf.label.clone(), leaf);
            }
        }
    }
    Ok(found
        .into_iter()
        .map(|(label, choice)| (label, choice.spec()))
        .collect())
}
