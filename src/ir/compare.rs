//! Structural graph comparison.
//!
//! Walks two graphs from their results in lock step and reports the first
//! difference. Used by pass tests to compare a rewritten graph with a
//! hand-built reference.

use crate::ir::{Graph, NodeId, Op};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default)]
pub struct CompareOptions {
    /// Compare constant payloads value by value.
    pub const_values: bool,
    /// Compare runtime tags (provenance names are ignored).
    pub runtime_tags: bool,
    /// Compare friendly names.
    pub names: bool,
}

impl CompareOptions {
    pub fn strict() -> Self {
        Self {
            const_values: true,
            runtime_tags: true,
            names: false,
        }
    }
}

pub fn compare_graphs(actual: &Graph, expected: &Graph, options: CompareOptions) -> Result<(), String> {
    if actual.results().len() != expected.results().len() {
        return Err(format!(
            "result count differs: {} vs {}",
            actual.results().len(),
            expected.results().len()
        ));
    }
    if actual.parameters().len() != expected.parameters().len() {
        return Err(format!(
            "parameter count differs: {} vs {}",
            actual.parameters().len(),
            expected.parameters().len()
        ));
    }
    let mut visited = HashSet::new();
    for (a, e) in actual.results().iter().zip(expected.results().iter()) {
        compare_nodes(actual, *a, expected, *e, options, &mut visited)?;
    }
    Ok(())
}

fn compare_nodes(
    ga: &Graph,
    a: NodeId,
    ge: &Graph,
    e: NodeId,
    options: CompareOptions,
    visited: &mut HashSet<(NodeId, NodeId)>,
) -> Result<(), String> {
    if !visited.insert((a, e)) {
        return Ok(());
    }
    let na = ga.node(a).ok_or_else(|| format!("missing node {}", a))?;
    let ne = ge.node(e).ok_or_else(|| format!("missing node {}", e))?;
    let here = format!("'{}' vs '{}'", na.name, ne.name);

    if na.kind() != ne.kind() {
        return Err(format!("{}: kind {} vs {}", here, na.kind(), ne.kind()));
    }
    if options.names && na.name != ne.name {
        return Err(format!("{}: names differ", here));
    }
    match (&na.op, &ne.op) {
        (Op::Constant(ta), Op::Constant(te)) => {
            if ta.element_type() != te.element_type() || ta.shape() != te.shape() {
                return Err(format!("{}: constant {} vs {}", here, ta.desc(), te.desc()));
            }
            if options.const_values && ta.data() != te.data() {
                return Err(format!("{}: constant values differ", here));
            }
        }
        (oa, oe) => {
            if oa != oe {
                return Err(format!("{}: attributes differ ({:?} vs {:?})", here, oa, oe));
            }
        }
    }
    if na.outputs != ne.outputs {
        return Err(format!(
            "{}: outputs {:?} vs {:?}",
            here, na.outputs, ne.outputs
        ));
    }
    if options.runtime_tags && !na.rt_info.same_tags(&ne.rt_info) {
        return Err(format!(
            "{}: runtime tags {:?} vs {:?}",
            here,
            na.rt_info.tags().collect::<Vec<_>>(),
            ne.rt_info.tags().collect::<Vec<_>>()
        ));
    }
    if na.inputs.len() != ne.inputs.len() {
        return Err(format!(
            "{}: input count {} vs {}",
            here,
            na.inputs.len(),
            ne.inputs.len()
        ));
    }
    for (ia, ie) in na.inputs.iter().zip(ne.inputs.iter()) {
        if ia.index != ie.index {
            return Err(format!("{}: input port {} vs {}", here, ia.index, ie.index));
        }
        compare_nodes(ga, ia.node, ge, ie.node, options, visited)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElementType, PartialShape, RuntimeTag, Tensor};

    fn build(tag: bool, value: f32) -> Graph {
        let mut g = Graph::new();
        let p = g
            .add_parameter("p", ElementType::F32, PartialShape::from_static(&[2]))
            .unwrap();
        let c = g
            .add_constant("c", Tensor::filled(ElementType::F32, vec![2], value))
            .unwrap();
        let m = g.add_node("m", Op::Multiply, vec![p.into(), c.into()]).unwrap();
        if tag {
            g.enable_tag(m, RuntimeTag::Dequantization);
        }
        g.add_result("r", m.into()).unwrap();
        g
    }

    #[test]
    fn test_identical_graphs_match() {
        assert!(compare_graphs(&build(true, 1.0), &build(true, 1.0), CompareOptions::strict()).is_ok());
    }

    #[test]
    fn test_tags_and_values_are_checked() {
        let strict = CompareOptions::strict();
        assert!(compare_graphs(&build(true, 1.0), &build(false, 1.0), strict).is_err());
        assert!(compare_graphs(&build(true, 1.0), &build(true, 2.0), strict).is_err());
        let loose = CompareOptions::default();
        assert!(compare_graphs(&build(true, 1.0), &build(false, 2.0), loose).is_ok());
    }
}
