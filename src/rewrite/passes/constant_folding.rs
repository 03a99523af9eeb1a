//! Constant folding.
//!
//! Single-output nodes whose inputs are all Constants are evaluated with
//! the reference kernels and turned into Constants in place (same id, same
//! name). Nodes tagged `DisableConstantFolding` and Decompression Converts
//! are left alone.

use crate::error::ForgeResult;
use crate::ir::{Graph, NodeId, Op, OpKind, RtInfo, RuntimeTag, TagState, Tensor};
use crate::program::kernels::evaluate_op;
use crate::rewrite::{GraphPass, RewriteStats};
use tracing::{debug, trace};

#[derive(Debug, Clone, Default)]
pub struct ConstantFolding;

impl ConstantFolding {
    pub fn new() -> Self {
        Self
    }

    fn is_foldable(graph: &Graph, id: NodeId) -> bool {
        let Some(node) = graph.node(id) else {
            return false;
        };
        match node.kind() {
            OpKind::Parameter | OpKind::Constant | OpKind::Result => return false,
            OpKind::Convert if node.rt_info.is_enabled(RuntimeTag::Decompression) => return false,
            _ => {}
        }
        !node.rt_info.is_enabled(RuntimeTag::DisableConstantFolding)
            && node.outputs.len() == 1
            && !node.inputs.is_empty()
            && node
                .inputs
                .iter()
                .all(|o| graph.kind(o.node) == Some(OpKind::Constant))
    }

    /// Runtime info of the folded constant: the root's own, without
    /// `DisableConstantFolding`. From the inputs only explicit opt-outs are
    /// taken, plus `KeepConstPrecision` when the root just reshapes.
    fn folded_rt_info(graph: &Graph, id: NodeId) -> RtInfo {
        let Some(node) = graph.node(id) else {
            return RtInfo::new();
        };
        let shape_only = node.kind().is_shape_only();
        let mut merged = node.rt_info.without(&[RuntimeTag::DisableConstantFolding]);
        for input in &node.inputs {
            let Some(producer) = graph.node(input.node) else {
                continue;
            };
            for (tag, state) in producer.rt_info.tags() {
                if merged.state(tag).is_some() || tag == RuntimeTag::DisableConstantFolding {
                    continue;
                }
                match state {
                    TagState::Disabled => {
                        merged.disable(tag);
                    }
                    TagState::Enabled if tag == RuntimeTag::KeepConstPrecision && shape_only => {
                        merged.enable(tag);
                    }
                    TagState::Enabled => {}
                }
            }
            merged.add_fused_name(producer.name.clone());
        }
        merged
    }

    fn fold(graph: &mut Graph, id: NodeId) -> ForgeResult<bool> {
        let node = graph.try_node(id)?;
        let inputs: Vec<&Tensor> = node
            .inputs
            .iter()
            .filter_map(|o| graph.constant_value(*o))
            .collect();
        if inputs.len() != node.inputs.len() {
            return Ok(false);
        }
        let Some(mut values) = evaluate_op(&node.op, &inputs, &node.outputs)? else {
            return Ok(false);
        };
        let Some(value) = values.pop() else {
            return Ok(false);
        };
        let rt_info = Self::folded_rt_info(graph, id);
        trace!(node = %node.name, kind = %node.kind().name(), "folded");
        if let Some(node) = graph.node_mut(id) {
            node.outputs = vec![value.desc()];
            node.op = Op::Constant(value);
            node.inputs.clear();
            node.rt_info = rt_info;
        }
        Ok(true)
    }
}

impl GraphPass for ConstantFolding {
    fn name(&self) -> &'static str {
        "ConstantFolding"
    }

    #[tracing::instrument(skip_all)]
    fn run_on_graph(&self, graph: &mut Graph) -> ForgeResult<RewriteStats> {
        let mut stats = RewriteStats::default();
        for id in graph.topological_order()? {
            if !Self::is_foldable(graph, id) {
                continue;
            }
            stats.matches += 1;
            if Self::fold(graph, id)? {
                stats.applied += 1;
                stats.replaced += 1;
            }
        }
        stats.dead_removed = graph.remove_dead_nodes();
        debug!(folded = stats.applied, removed = stats.dead_removed, "constant folding done");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElementType, PartialShape};

    #[test]
    fn test_folds_chain_and_keeps_name() {
        let mut g = Graph::new();
        let a = g.add_constant("a", Tensor::filled(ElementType::F32, vec![2], 1.0)).unwrap();
        let b = g.add_constant("b", Tensor::filled(ElementType::F32, vec![2], 2.0)).unwrap();
        let add = g.add_node("add", Op::Add, vec![a.into(), b.into()]).unwrap();
        let mul = g.add_node("mul", Op::Multiply, vec![add.into(), b.into()]).unwrap();
        g.add_result("r", mul.into()).unwrap();

        let stats = ConstantFolding::new().run_on_graph(&mut g).unwrap();
        assert_eq!(stats.applied, 2);
        assert_eq!(g.kind(mul), Some(OpKind::Constant));
        assert_eq!(g.node(mul).unwrap().name, "mul");
        assert_eq!(g.constant_value(mul.into()).unwrap().data(), &[6.0, 6.0]);
        assert!(g.node(a).is_none());
    }

    #[test]
    fn test_disabled_and_decompression_nodes_survive() {
        let mut g = Graph::new();
        let w = g.add_constant("w", Tensor::filled(ElementType::U8, vec![2], 3.0)).unwrap();
        let cvt = g
            .add_node("cvt", Op::Convert { destination: ElementType::F32 }, vec![w.into()])
            .unwrap();
        g.enable_tag(cvt, RuntimeTag::DisableConstantFolding);
        let h = g.add_constant("h", Tensor::filled(ElementType::F16, vec![2], 1.0)).unwrap();
        let dec = g
            .add_node("dec", Op::Convert { destination: ElementType::F32 }, vec![h.into()])
            .unwrap();
        g.enable_tag(dec, RuntimeTag::Decompression);
        let x = g
            .add_parameter("x", ElementType::F32, PartialShape::from_static(&[2]))
            .unwrap();
        let add = g.add_node("add", Op::Add, vec![cvt.into(), dec.into()]).unwrap();
        let out = g.add_node("out", Op::Add, vec![add.into(), x.into()]).unwrap();
        g.add_result("r", out.into()).unwrap();

        let stats = ConstantFolding::new().run_on_graph(&mut g).unwrap();
        assert_eq!(stats.applied, 0);
        assert_eq!(g.kind(cvt), Some(OpKind::Convert));
        assert_eq!(g.kind(dec), Some(OpKind::Convert));
    }

    #[test]
    fn test_keep_const_precision_survives_reshape_only() {
        let mut g = Graph::new();
        let w = g.add_constant("w", Tensor::filled(ElementType::I8, vec![4], 1.0)).unwrap();
        g.enable_tag(w, RuntimeTag::KeepConstPrecision);
        let target = g
            .add_constant("target", Tensor::from_i64(ElementType::I64, vec![2], &[2, 2]).unwrap())
            .unwrap();
        let reshape = g
            .add_node("reshape", Op::Reshape { special_zero: false }, vec![w.into(), target.into()])
            .unwrap();
        let cvt = g
            .add_node("cvt", Op::Convert { destination: ElementType::F32 }, vec![reshape.into()])
            .unwrap();
        g.add_result("r", cvt.into()).unwrap();

        ConstantFolding::new().run_on_graph(&mut g).unwrap();
        // The Convert folds too, and drops the marker.
        assert_eq!(g.kind(cvt), Some(OpKind::Constant));
        assert!(!g.has_tag(cvt, RuntimeTag::KeepConstPrecision));
        assert!(g.node(reshape).is_none());
    }
}
