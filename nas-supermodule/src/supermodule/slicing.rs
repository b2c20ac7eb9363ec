//! Slicing a superkernel down to one candidate, or to a weighted mixture of candidates.
//!
//! A weighted slice cuts one sub-tensor per distinct requested size, zero-pads each back
//! to a common shape at its original position inside the superkernel, and sums them
//! scaled by their weights.

use crate::{NasError, NasResult};
use candle_core::Tensor;

/// An argument value that is either fixed or a distribution over candidate values.
#[derive(Clone, Debug)]
pub enum MaybeWeighted<T> {
    Fixed(T),
    Weighted(Vec<(T, Tensor)>),
}

impl<T> MaybeWeighted<T> {
    pub fn is_weighted(&self) -> bool {
        matches!(self, MaybeWeighted::Weighted(_))
    }
}

/// The range `[start, start + len)` along `dim`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisSlice {
    pub dim: usize,
    pub start: usize,
    pub len: usize,
}

impl AxisSlice {
    pub fn prefix(dim: usize, len: usize) -> Self {
        Self { dim, start: 0, len }
    }

    pub fn range(dim: usize, start: usize, len: usize) -> Self {
        Self { dim, start, len }
    }

    /// Centre crop of `len` out of `full`, rounding the offset down.
    pub fn center(dim: usize, full: usize, len: usize) -> Self {
        Self {
            dim,
            start: full.saturating_sub(len) / 2,
            len,
        }
    }
}

pub fn slice_concrete(tensor: &Tensor, slices: &[AxisSlice]) -> NasResult<Tensor> {
    let mut out = tensor.clone();
    for s in slices {
        let size = out.dim(s.dim)?;
        if s.start + s.len > size {
            return Err(NasError::InvalidValueChoice {
                reason: format!(
                    "slice [{}, {}) exceeds size {} of dimension {}",
                    s.start,
                    s.start + s.len,
                    size,
                    s.dim
                ),
            });
        }
        if s.start != 0 || s.len != size {
            out = out.narrow(s.dim, s.start, s.len)?;
        }
    }
    Ok(out)
}

/// Per-dimension `(start, len)` placement of `slices` inside `dims`.
fn placement(dims: &[usize], slices: &[AxisSlice]) -> Vec<(usize, usize)> {
    let mut ranges: Vec<(usize, usize)> = dims.iter().map(|&d| (0, d)).collect();
    for s in slices {
        if let Some(range) = ranges.get_mut(s.dim) {
            *range = (range.0 + s.start, s.len);
        }
    }
    ranges
}

/// Slices `tensor` according to `arg`. Fixed values give an exact sub-tensor; a
/// distribution gives the weighted sum of every distinct slice, aligned at its original
/// position.
pub fn weighted_slice<T, F>(tensor: &Tensor, arg: &MaybeWeighted<T>, to_slices: F) -> NasResult<Tensor>
where
    F: Fn(&T) -> Vec<AxisSlice>,
{
    let items = match arg {
        MaybeWeighted::Fixed(v) => return slice_concrete(tensor, &to_slices(v)),
        MaybeWeighted::Weighted(items) => items,
    };

    let mut groups: Vec<(Vec<AxisSlice>, Tensor)> = Vec::new();
    for (value, weight) in items {
        let slices = to_slices(value);
        match groups.iter_mut().find(|(s, _)| *s == slices) {
            Some((_, acc)) => *acc = acc.add(weight)?,
            None => groups.push((slices, weight.clone())),
        }
    }

    let dims = tensor.dims().to_vec();
    let placements: Vec<Vec<(usize, usize)>> = groups
        .iter()
        .map(|(slices, _)| placement(&dims, slices))
        .collect();
    let bounds: Vec<(usize, usize)> = (0..dims.len())
        .map(|d| {
            let lo = placements.iter().map(|p| p[d].0).min().unwrap_or(0);
            let hi = placements
                .iter()
                .map(|p| p[d].0 + p[d].1)
                .max()
                .unwrap_or(dims[d]);
            (lo, hi)
        })
        .collect();

    let mut out: Option<Tensor> = None;
    for ((slices, weight), place) in groups.iter().zip(&placements) {
        let mut sub = slice_concrete(tensor, slices)?;
        for (d, ((start, len), (lo, hi))) in place.iter().zip(&bounds).enumerate() {
            let left = start - lo;
            let right = hi - start - len;
            if left > 0 || right > 0 {
                sub = sub.pad_with_zeros(d, left, right)?;
            }
        }
        let term = sub.broadcast_mul(&weight.to_dtype(sub.dtype())?)?;
        out = Some(match out {
            Some(acc) => acc.add(&term)?,
            None => term,
        });
    }
    out.ok_or_else(|| NasError::InvalidValueChoice {
        reason: "weighted slice over an empty distribution".to_string(),
    })
}
