//! Partial shapes for graph edges.

use crate::ir::Dimension;
use std::fmt;

pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().copied().product()
}

/// Shape of an edge: dynamic rank, or a list of (possibly dynamic) dims.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartialShape {
    DynamicRank,
    Ranked(Vec<Dimension>),
}

impl PartialShape {
    pub fn from_static(dims: &[usize]) -> Self {
        PartialShape::Ranked(dims.iter().map(|&d| Dimension::from(d)).collect())
    }

    /// `-1` entries become fully dynamic dimensions.
    pub fn from_i64(dims: &[i64]) -> Self {
        PartialShape::Ranked(dims.iter().map(|&d| Dimension::from(d)).collect())
    }

    /// Known rank with every dimension unknown.
    pub fn dynamic_of_rank(rank: usize) -> Self {
        PartialShape::Ranked(vec![Dimension::dynamic(); rank])
    }

    pub fn scalar() -> Self {
        PartialShape::Ranked(Vec::new())
    }

    pub fn rank(&self) -> Option<usize> {
        match self {
            PartialShape::DynamicRank => None,
            PartialShape::Ranked(d) => Some(d.len()),
        }
    }

    pub fn is_static(&self) -> bool {
        match self {
            PartialShape::DynamicRank => false,
            PartialShape::Ranked(d) => d.iter().all(Dimension::is_static),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        !self.is_static()
    }

    pub fn dims(&self) -> Option<&[Dimension]> {
        match self {
            PartialShape::DynamicRank => None,
            PartialShape::Ranked(d) => Some(d),
        }
    }

    pub fn dim(&self, axis: usize) -> Option<Dimension> {
        self.dims().and_then(|d| d.get(axis).copied())
    }

    /// Static shape, if every dimension is known.
    pub fn to_shape(&self) -> Option<Vec<usize>> {
        match self {
            PartialShape::DynamicRank => None,
            PartialShape::Ranked(d) => d
                .iter()
                .map(|dim| dim.get_length().map(|l| l as usize))
                .collect(),
        }
    }

    pub fn element_count(&self) -> Option<usize> {
        self.to_shape().map(|s| element_count(&s))
    }

    /// Upper bound on element count, used for dynamic allocations.
    pub fn max_element_count(&self) -> Option<usize> {
        match self {
            PartialShape::DynamicRank => None,
            PartialShape::Ranked(d) => d
                .iter()
                .map(|dim| dim.max_length().map(|l| l as usize))
                .try_fold(1usize, |acc, v| v.map(|v| acc.saturating_mul(v))),
        }
    }

    pub fn compatible(&self, other: &PartialShape) -> bool {
        self.merge(other).is_some()
    }

    /// Dimension-wise intersection; dynamic rank yields to the other side.
    pub fn merge(&self, other: &PartialShape) -> Option<PartialShape> {
        match (self, other) {
            (PartialShape::DynamicRank, s) | (s, PartialShape::DynamicRank) => Some(s.clone()),
            (PartialShape::Ranked(a), PartialShape::Ranked(b)) => {
                if a.len() != b.len() {
                    return None;
                }
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| x.merge(y))
                    .collect::<Option<Vec<_>>>()
                    .map(PartialShape::Ranked)
            }
        }
    }

    /// NumPy-style broadcast of two shapes.
    pub fn broadcast(&self, other: &PartialShape) -> Option<PartialShape> {
        let (a, b) = match (self, other) {
            (PartialShape::Ranked(a), PartialShape::Ranked(b)) => (a, b),
            _ => return Some(PartialShape::DynamicRank),
        };
        let rank = a.len().max(b.len());
        let mut out = Vec::with_capacity(rank);
        for i in 0..rank {
            let da = if i + a.len() >= rank {
                a[i + a.len() - rank]
            } else {
                Dimension::fixed(1)
            };
            let db = if i + b.len() >= rank {
                b[i + b.len() - rank]
            } else {
                Dimension::fixed(1)
            };
            out.push(da.broadcast_merge(&db)?);
        }
        Some(PartialShape::Ranked(out))
    }
}

impl From<Vec<Dimension>> for PartialShape {
    fn from(dims: Vec<Dimension>) -> Self {
        PartialShape::Ranked(dims)
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartialShape::DynamicRank => write!(f, "[...]"),
            PartialShape::Ranked(d) => {
                write!(f, "[")?;
                for (i, dim) in d.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", dim)?;
                }
                write!(f, "]")
            }
        }
    }
}
