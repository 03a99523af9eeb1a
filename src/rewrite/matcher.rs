//! Read-only pattern matching against a graph.

use super::pattern::{Pattern, PatternId, PatternNode};
use crate::error::{ForgeResult, GraphForgeError};
use crate::ir::{Graph, NodeId, OpKind, Output};
use std::collections::HashMap;
use tracing::trace;

/// Outputs bound to pattern nodes by a successful match.
#[derive(Debug, Clone, Default)]
pub struct Captures {
    pass: String,
    bound: HashMap<PatternId, Output>,
    labels: HashMap<PatternId, String>,
}

impl Captures {
    pub fn get(&self, id: PatternId) -> Option<Output> {
        self.bound.get(&id).copied()
    }

    pub fn contains(&self, id: PatternId) -> bool {
        self.bound.contains_key(&id)
    }

    pub fn node(&self, id: PatternId) -> Option<NodeId> {
        self.get(id).map(|o| o.node)
    }

    /// Bound output for `id`. A missing capture is a bug in the pass.
    pub fn require(&self, id: PatternId) -> ForgeResult<Output> {
        self.get(id).ok_or_else(|| GraphForgeError::PatternAssertion {
            pass: self.pass.clone(),
            capture: self
                .labels
                .get(&id)
                .cloned()
                .unwrap_or_else(|| format!("#{}", id.0)),
        })
    }

    pub fn require_node(&self, id: PatternId) -> ForgeResult<NodeId> {
        self.require(id).map(|o| o.node)
    }

    /// Distinct nodes touched by the match, in pattern order.
    pub fn matched_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<(PatternId, NodeId)> = self.bound.iter().map(|(p, o)| (*p, o.node)).collect();
        ids.sort();
        let mut nodes = Vec::new();
        for (_, id) in ids {
            if !nodes.contains(&id) {
                nodes.push(id);
            }
        }
        nodes
    }

    pub(crate) fn set_pass(&mut self, pass: &str) {
        self.pass = pass.to_string();
    }
}

pub struct Matcher<'p> {
    pattern: &'p Pattern,
}

impl<'p> Matcher<'p> {
    pub fn new(pattern: &'p Pattern) -> Self {
        Self { pattern }
    }

    /// Try to match the pattern root at `output`.
    pub fn match_output(&self, graph: &Graph, output: Output) -> Option<Captures> {
        let mut bound = HashMap::new();
        if self.match_at(graph, self.pattern.root, output, &mut bound) {
            trace!(root = %output.node, pattern = self.pattern.label(self.pattern.root), "pattern matched");
            let labels = (0..self.pattern.labels.len())
                .map(|i| (PatternId(i), self.pattern.labels[i].clone()))
                .collect();
            Some(Captures {
                pass: String::new(),
                bound,
                labels,
            })
        } else {
            None
        }
    }

    fn match_at(
        &self,
        graph: &Graph,
        id: PatternId,
        output: Output,
        bound: &mut HashMap<PatternId, Output>,
    ) -> bool {
        // A pattern node reached twice must bind the same output.
        if let Some(existing) = bound.get(&id) {
            return *existing == output;
        }
        let node = match graph.node(output.node) {
            Some(n) => n,
            None => return false,
        };
        match &self.pattern.nodes[id.0] {
            PatternNode::Any { predicate } => {
                if predicate.as_ref().map(|p| p.check(graph, output)).unwrap_or(true) {
                    bound.insert(id, output);
                    true
                } else {
                    false
                }
            }
            PatternNode::Constant { predicate } => {
                if node.kind() == OpKind::Constant
                    && predicate.as_ref().map(|p| p.check(graph, output)).unwrap_or(true)
                {
                    bound.insert(id, output);
                    true
                } else {
                    false
                }
            }
            PatternNode::Wrap {
                kinds,
                inputs,
                predicate,
            } => {
                if !kinds.contains(&node.kind()) {
                    return false;
                }
                if let Some(p) = predicate {
                    if !p.check(graph, output) {
                        return false;
                    }
                }
                if inputs.is_empty() {
                    bound.insert(id, output);
                    return true;
                }
                if inputs.len() != node.inputs.len() {
                    return false;
                }
                let orders: Vec<Vec<usize>> = if inputs.len() == 2 && is_commutative(node.kind()) {
                    vec![vec![0, 1], vec![1, 0]]
                } else {
                    vec![(0..inputs.len()).collect()]
                };
                for order in orders {
                    let mut trial = bound.clone();
                    trial.insert(id, output);
                    let ok = order
                        .iter()
                        .zip(inputs.iter())
                        .all(|(&actual, &pat)| self.match_at(graph, pat, node.inputs[actual], &mut trial));
                    if ok {
                        *bound = trial;
                        return true;
                    }
                }
                false
            }
            PatternNode::Or { alternatives } => {
                for alt in alternatives {
                    let mut trial = bound.clone();
                    if self.match_at(graph, *alt, output, &mut trial) {
                        trial.insert(id, output);
                        *bound = trial;
                        return true;
                    }
                }
                false
            }
            // Only the first input of the optional node is followed.
            PatternNode::Optional { kinds, input } => {
                if kinds.contains(&node.kind()) && !node.inputs.is_empty() {
                    let mut trial = bound.clone();
                    trial.insert(id, output);
                    if self.match_at(graph, *input, node.inputs[0], &mut trial) {
                        *bound = trial;
                        return true;
                    }
                }
                self.match_at(graph, *input, output, bound)
            }
        }
    }
}

fn is_commutative(kind: OpKind) -> bool {
    matches!(kind, OpKind::Add | OpKind::Multiply)
}
