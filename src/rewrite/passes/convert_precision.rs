//! Whole-graph precision lowering (typically f32 -> f16).
//!
//! Constant-folds first, then lowers Parameters, Constants, Converts and
//! compressed convolution outputs of the source type. Nodes tagged
//! `DisableFp16Compression` keep the source type; with
//! `keep_precision_sensitive_in_fp32` so do the Add/Subtract/Multiply nodes
//! reading them, transitively. Converts are inserted on every edge that
//! crosses between the kept and the lowered region.

use super::ConstantFolding;
use crate::error::ForgeResult;
use crate::ir::{ElementType, Graph, NodeId, Op, OpKind, Output, RuntimeTag, TensorDesc};
use crate::rewrite::{GraphPass, RewriteStats};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct ConvertPrecision {
    from: ElementType,
    to: ElementType,
    keep_precision_sensitive_in_fp32: bool,
}

impl ConvertPrecision {
    pub fn new(from: ElementType, to: ElementType) -> Self {
        Self {
            from,
            to,
            keep_precision_sensitive_in_fp32: false,
        }
    }

    pub fn keep_precision_sensitive_in_fp32(mut self, keep: bool) -> Self {
        self.keep_precision_sensitive_in_fp32 = keep;
        self
    }

    fn kept_nodes(&self, graph: &Graph) -> HashSet<NodeId> {
        let mut kept: HashSet<NodeId> = graph
            .nodes()
            .filter(|n| n.rt_info.is_enabled(RuntimeTag::DisableFp16Compression))
            .map(|n| n.id)
            .collect();
        if self.keep_precision_sensitive_in_fp32 {
            let mut queue: VecDeque<NodeId> = kept.iter().copied().collect();
            while let Some(id) = queue.pop_front() {
                for consumer in graph.node_consumers(id) {
                    let arithmetic = graph
                        .kind(consumer)
                        .is_some_and(|k| k.is_elementwise_arithmetic());
                    if arithmetic && kept.insert(consumer) {
                        queue.push_back(consumer);
                    }
                }
            }
        }
        kept
    }

    /// Convert of `source` to `destination`, shared between readers.
    fn convert_of(
        &self,
        graph: &mut Graph,
        cache: &mut HashMap<(Output, ElementType), NodeId>,
        source: Output,
        destination: ElementType,
    ) -> ForgeResult<NodeId> {
        if let Some(id) = cache.get(&(source, destination)) {
            return Ok(*id);
        }
        let producer = graph.try_node(source.node)?.name.clone();
        let name = graph.unique_name(&format!("{}/convert_{}", producer, destination.name()));
        let id = graph.add_node(&name, Op::Convert { destination }, vec![source])?;
        if destination == self.from {
            graph.enable_tag(id, RuntimeTag::Decompression);
        }
        trace!(node = %name, "inserted precision convert");
        cache.insert((source, destination), id);
        Ok(id)
    }

    /// New op for a node leaving the kept region, or None to only re-infer.
    fn lowered_op(&self, graph: &Graph, id: NodeId, kept: &HashSet<NodeId>) -> Option<Op> {
        let node = graph.node(id)?;
        match &node.op {
            Op::Parameter(desc) if desc.element_type == self.from => {
                Some(Op::Parameter(TensorDesc::new(self.to, desc.shape.clone())))
            }
            Op::Constant(t) if t.element_type() == self.from => {
                let consumers = graph.node_consumers(id);
                let all_kept = !consumers.is_empty() && consumers.iter().all(|c| kept.contains(c));
                if node.rt_info.is_enabled(RuntimeTag::KeepConstPrecision) || all_kept {
                    None
                } else {
                    Some(Op::Constant(t.convert(self.to)))
                }
            }
            Op::Convert { destination } if *destination == self.from => {
                Some(Op::Convert { destination: self.to })
            }
            Op::ConvolutionCompressed(attrs) if attrs.output_type == Some(self.from) => {
                let mut attrs = attrs.clone();
                attrs.output_type = Some(self.to);
                Some(Op::ConvolutionCompressed(attrs))
            }
            op => Some(op.clone()),
        }
    }
}

impl GraphPass for ConvertPrecision {
    fn name(&self) -> &'static str {
        "ConvertPrecision"
    }

    #[tracing::instrument(skip_all, fields(from = %self.from, to = %self.to))]
    fn run_on_graph(&self, graph: &mut Graph) -> ForgeResult<RewriteStats> {
        let mut stats = ConstantFolding::new().run_on_graph(graph)?;
        let kept = self.kept_nodes(graph);
        let mut lowered: HashSet<NodeId> = HashSet::new();
        let mut cache = HashMap::new();

        for id in graph.topological_order()? {
            let node = graph.try_node(id)?;
            let inputs = node.inputs.clone();
            let is_kept = kept.contains(&id);
            let consumer_is_convert = node.kind() == OpKind::Convert;

            for (index, input) in inputs.into_iter().enumerate() {
                let Some(et) = graph.element_type(input) else {
                    continue;
                };
                let producer_kept = kept.contains(&input.node);
                let insert = if is_kept {
                    (et == self.to && lowered.contains(&input.node) && !producer_kept)
                        .then_some(self.from)
                } else {
                    let kcp = graph.has_tag(input.node, RuntimeTag::KeepConstPrecision)
                        && graph.kind(input.node) == Some(OpKind::Constant);
                    (et == self.from && (producer_kept || kcp) && !consumer_is_convert)
                        .then_some(self.to)
                };
                if let Some(destination) = insert {
                    let convert = self.convert_of(graph, &mut cache, input, destination)?;
                    graph.set_input(id, index, convert.into())?;
                    stats.replaced += 1;
                }
            }

            if is_kept {
                continue;
            }
            let before = graph.try_node(id)?.outputs.clone();
            if let Some(op) = self.lowered_op(graph, id, &kept) {
                graph.replace_op(id, op)?;
            }
            let changed = graph.try_node(id)?.outputs != before;
            if changed {
                lowered.insert(id);
                stats.applied += 1;
            }
        }
        stats.dead_removed += graph.remove_dead_nodes();
        debug!(
            kept = kept.len(),
            lowered = lowered.len(),
            converts = cache.len(),
            "precision conversion done"
        );
        Ok(stats)
    }
}
