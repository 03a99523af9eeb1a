//! Pattern trees for the matcher.
//!
//! A pattern is built bottom-up with [`PatternBuilder`]; each call returns a
//! [`PatternId`] that can be used as an input of later calls and, after a
//! match, as a key into the captures.

use crate::ir::{ElementType, Graph, OpKind, Output};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternId(pub(crate) usize);

/// Extra condition on a matched output.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&Graph, Output) -> bool + Send + Sync>);

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Graph, Output) -> bool + Send + Sync + 'static,
    {
        Predicate(Arc::new(f))
    }

    pub fn check(&self, graph: &Graph, output: Output) -> bool {
        (self.0)(graph, output)
    }

    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::new(move |g, o| self.check(g, o) && other.check(g, o))
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate")
    }
}

/// Element type of the output is one of `types`.
pub fn type_matches_any(types: &[ElementType]) -> Predicate {
    let types = types.to_vec();
    Predicate::new(move |g, o| g.element_type(o).map(|t| types.contains(&t)).unwrap_or(false))
}

/// The output has exactly `count` readers.
pub fn consumers_count(count: usize) -> Predicate {
    Predicate::new(move |g, o| g.consumers(o).len() == count)
}

/// The output has a known rank equal to `rank`.
pub fn rank_equals(rank: usize) -> Predicate {
    Predicate::new(move |g, o| g.output_desc(o).and_then(|d| d.shape.rank()) == Some(rank))
}

/// The output has a fully static shape.
pub fn has_static_shape() -> Predicate {
    Predicate::new(|g, o| g.output_desc(o).map(|d| d.is_static()).unwrap_or(false))
}

#[derive(Debug, Clone)]
pub(crate) enum PatternNode {
    /// Node of one of `kinds` whose inputs match `inputs` (any inputs when empty).
    Wrap {
        kinds: Vec<OpKind>,
        inputs: Vec<PatternId>,
        predicate: Option<Predicate>,
    },
    Any {
        predicate: Option<Predicate>,
    },
    Constant {
        predicate: Option<Predicate>,
    },
    Or {
        alternatives: Vec<PatternId>,
    },
    /// Node of one of `kinds` over `input`, or `input` alone.
    Optional {
        kinds: Vec<OpKind>,
        input: PatternId,
    },
}

#[derive(Debug, Clone)]
pub struct Pattern {
    pub(crate) nodes: Vec<PatternNode>,
    pub(crate) labels: Vec<String>,
    pub(crate) root: PatternId,
}

impl Pattern {
    pub fn root(&self) -> PatternId {
        self.root
    }

    pub fn label(&self, id: PatternId) -> &str {
        self.labels.get(id.0).map(String::as_str).unwrap_or("?")
    }

    /// Kinds a root node must have, if the root constrains them.
    pub fn root_kinds(&self) -> Option<Vec<OpKind>> {
        self.kinds_of(self.root)
    }

    fn kinds_of(&self, id: PatternId) -> Option<Vec<OpKind>> {
        match &self.nodes[id.0] {
            PatternNode::Wrap { kinds, .. } => Some(kinds.clone()),
            PatternNode::Constant { .. } => Some(vec![OpKind::Constant]),
            PatternNode::Any { .. } => None,
            PatternNode::Or { alternatives } => {
                let mut all = Vec::new();
                for alt in alternatives {
                    all.extend(self.kinds_of(*alt)?);
                }
                Some(all)
            }
            PatternNode::Optional { kinds, input } => {
                let mut all = kinds.clone();
                all.extend(self.kinds_of(*input)?);
                Some(all)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct PatternBuilder {
    nodes: Vec<PatternNode>,
    labels: Vec<String>,
}

impl PatternBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: PatternNode, label: String) -> PatternId {
        self.nodes.push(node);
        self.labels.push(label);
        PatternId(self.nodes.len() - 1)
    }

    fn kinds_label(kinds: &[OpKind]) -> String {
        kinds.iter().map(|k| k.name()).collect::<Vec<_>>().join("|")
    }

    pub fn wrap_type(&mut self, kinds: &[OpKind], inputs: &[PatternId]) -> PatternId {
        self.push(
            PatternNode::Wrap {
                kinds: kinds.to_vec(),
                inputs: inputs.to_vec(),
                predicate: None,
            },
            Self::kinds_label(kinds),
        )
    }

    pub fn wrap_type_with(&mut self, kinds: &[OpKind], inputs: &[PatternId], predicate: Predicate) -> PatternId {
        self.push(
            PatternNode::Wrap {
                kinds: kinds.to_vec(),
                inputs: inputs.to_vec(),
                predicate: Some(predicate),
            },
            Self::kinds_label(kinds),
        )
    }

    pub fn any_input(&mut self) -> PatternId {
        self.push(PatternNode::Any { predicate: None }, "any".to_string())
    }

    pub fn any_input_with(&mut self, predicate: Predicate) -> PatternId {
        self.push(
            PatternNode::Any {
                predicate: Some(predicate),
            },
            "any".to_string(),
        )
    }

    pub fn constant(&mut self) -> PatternId {
        self.push(PatternNode::Constant { predicate: None }, "Constant".to_string())
    }

    pub fn constant_with(&mut self, predicate: Predicate) -> PatternId {
        self.push(
            PatternNode::Constant {
                predicate: Some(predicate),
            },
            "Constant".to_string(),
        )
    }

    pub fn or_match(&mut self, alternatives: &[PatternId]) -> PatternId {
        let label = alternatives
            .iter()
            .map(|a| self.labels[a.0].clone())
            .collect::<Vec<_>>()
            .join(" or ");
        self.push(
            PatternNode::Or {
                alternatives: alternatives.to_vec(),
            },
            format!("({})", label),
        )
    }

    pub fn optional(&mut self, kinds: &[OpKind], input: PatternId) -> PatternId {
        self.push(
            PatternNode::Optional {
                kinds: kinds.to_vec(),
                input,
            },
            format!("optional {}", Self::kinds_label(kinds)),
        )
    }

    /// Rename a node for error messages and logs.
    pub fn label(&mut self, id: PatternId, label: &str) -> PatternId {
        if let Some(slot) = self.labels.get_mut(id.0) {
            *slot = label.to_string();
        }
        id
    }

    pub fn build(self, root: PatternId) -> Pattern {
        Pattern {
            nodes: self.nodes,
            labels: self.labels,
            root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_kinds() {
        let mut p = PatternBuilder::new();
        let x = p.any_input();
        let a = p.wrap_type(&[OpKind::Convolution], &[x, x]);
        let b = p.wrap_type(&[OpKind::GroupConvolution], &[x, x]);
        let root = p.or_match(&[a, b]);
        let pattern = p.build(root);
        assert_eq!(
            pattern.root_kinds(),
            Some(vec![OpKind::Convolution, OpKind::GroupConvolution])
        );
        assert_eq!(pattern.label(root), "(Convolution or GroupConvolution)");
    }

    #[test]
    fn test_any_root_has_no_kinds() {
        let mut p = PatternBuilder::new();
        let x = p.any_input();
        assert!(p.build(x).root_kinds().is_none());
    }
}
