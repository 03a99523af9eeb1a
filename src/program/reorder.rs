//! Build-time weight reorder.
//!
//! An implementation that wants its weights in another layout or gate order
//! describes that with a [`WeightsReorderPlan`]. The pass splices
//! `gate_split -> reorder` (or a lone `reorder`) between each weight producer
//! and the consumer, so the kernel receives ready-to-use weights.

use crate::config::CompileConfig;
use crate::error::ForgeResult;
use crate::internal_error;
use crate::ir::{Dimension, PartialShape};
use crate::program::primitive::{LstmWeightsOrder, PortRef, Primitive, ProgramNode};
use crate::registry::{BackendKind, Format, ImplContext, ImplementationDescriptor, LayoutDesc};
use std::fmt;
use tracing::{debug, info};

/// One weight input to rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightsReorderParams {
    pub input_index: usize,
    pub source: LayoutDesc,
    pub target: LayoutDesc,
    pub source_order: Option<LstmWeightsOrder>,
    pub target_order: Option<LstmWeightsOrder>,
    pub grouped: bool,
    /// Permute gate blocks before the layout change.
    pub split: bool,
}

impl WeightsReorderParams {
    pub fn needs_layout_change(&self) -> bool {
        self.source.format != self.target.format
            || self.source.element_type != self.target.element_type
            || self.source.shape != self.target.shape
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightsReorderPlan {
    pub params: Vec<WeightsReorderParams>,
    /// Gate order the consumer runs with once its weights are reordered.
    pub consumer_order: Option<LstmWeightsOrder>,
}

impl WeightsReorderPlan {
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Why a node's weights were left for the kernel to reorder at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    DynamicReorderDisabled,
    InternalProgram,
    OneDnnPreferred,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::DynamicReorderDisabled => "build-time reorder disabled for dynamic nodes",
            SkipReason::InternalProgram => "internal program",
            SkipReason::OneDnnPreferred => "oneDNN is the preferred backend",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorderDecision {
    Applied { inserted: usize },
    Skipped(SkipReason),
}

/// Ask the chosen implementation whether `node` needs its weights reordered.
pub fn plan_reorder(node: &ProgramNode, implementation: &ImplementationDescriptor) -> Option<WeightsReorderPlan> {
    implementation
        .weights_reorder
        .and_then(|plan| plan(node))
        .filter(|plan| !plan.is_empty())
}

/// `[dirs, gates * hidden, cols]` as `[1, dirs, cols, gates, hidden]`.
pub fn ldigo_shape(shape: &PartialShape, gates: usize) -> PartialShape {
    match shape.dims() {
        Some([dirs, rows, cols]) => {
            let hidden = rows.floor_div(gates as i64);
            PartialShape::from(vec![
                Dimension::fixed(1),
                dirs.clone(),
                cols.clone(),
                Dimension::fixed(gates as i64),
                hidden,
            ])
        }
        _ => shape.clone(),
    }
}

/// Plan for recurrent sequence weights (W, R at `weights`, bias at `bias`):
/// gate blocks to `target_order`, W and R to ldigo, bias kept plain.
pub fn recurrent_weights_plan(
    node: &ProgramNode,
    current: LstmWeightsOrder,
    target_order: LstmWeightsOrder,
    weights: [usize; 2],
    bias: usize,
) -> Option<WeightsReorderPlan> {
    let split = current != target_order;
    let mut params = Vec::new();
    for index in weights {
        let source = node.input_layouts.get(index)?.clone();
        if source.format == Format::Ldigo {
            continue;
        }
        let target = LayoutDesc::new(source.element_type, Format::Ldigo, ldigo_shape(&source.shape, 4));
        params.push(WeightsReorderParams {
            input_index: index,
            source,
            target,
            source_order: Some(current),
            target_order: Some(target_order),
            grouped: false,
            split,
        });
    }
    if split {
        let source = node.input_layouts.get(bias)?.clone();
        params.push(WeightsReorderParams {
            input_index: bias,
            target: source.with_format(Format::Bfyx),
            source,
            source_order: Some(current),
            target_order: Some(target_order),
            grouped: false,
            split,
        });
    }
    Some(WeightsReorderPlan {
        params,
        consumer_order: Some(target_order),
    })
}

/// Decide whether a dynamic node may be reordered at build time.
fn skip_reason(node: &ProgramNode, config: &CompileConfig, ctx: &ImplContext) -> Option<SkipReason> {
    if !node.is_dynamic() {
        return None;
    }
    if config.disable_build_time_weight_reorder_for_dynamic_nodes {
        Some(SkipReason::DynamicReorderDisabled)
    } else if config.is_internal_program {
        Some(SkipReason::InternalProgram)
    } else if ctx.preferred_backend == BackendKind::OneDnn {
        Some(SkipReason::OneDnnPreferred)
    } else {
        None
    }
}

/// A node with its selected implementation, in processing order.
#[derive(Debug, Clone)]
pub struct SelectedNode<'r> {
    pub node: ProgramNode,
    pub implementation: &'r ImplementationDescriptor,
}

/// Outcome of the pass for the whole program.
#[derive(Debug, Default)]
pub struct ReorderReport {
    pub decisions: Vec<(String, ReorderDecision)>,
    /// New position of every node that went into the pass.
    pub positions: Vec<usize>,
}

impl ReorderReport {
    /// Position after the pass of the node that was at `index` before it.
    pub fn position(&self, index: usize) -> usize {
        self.positions.get(index).copied().unwrap_or(index)
    }

    pub fn inserted(&self) -> usize {
        self.decisions
            .iter()
            .map(|(_, d)| match d {
                ReorderDecision::Applied { inserted } => *inserted,
                ReorderDecision::Skipped(_) => 0,
            })
            .sum()
    }

    pub fn skipped(&self) -> usize {
        self.decisions
            .iter()
            .filter(|(_, d)| matches!(d, ReorderDecision::Skipped(_)))
            .count()
    }
}

/// Walk `nodes` in processing order and splice weight reorders in front of
/// every consumer whose implementation asks for them. `select` picks the
/// implementation for each inserted primitive.
pub fn run_reorder_pass<'r, S>(
    nodes: Vec<SelectedNode<'r>>,
    config: &CompileConfig,
    ctx: &ImplContext,
    mut select: S,
) -> ForgeResult<(Vec<SelectedNode<'r>>, ReorderReport)>
where
    S: FnMut(&ProgramNode) -> ForgeResult<&'r ImplementationDescriptor>,
{
    let mut report = ReorderReport::default();
    let mut out: Vec<SelectedNode<'r>> = Vec::with_capacity(nodes.len());
    let mut remap: Vec<usize> = Vec::with_capacity(nodes.len());
    let map_port = |remap: &[usize], port: PortRef| -> ForgeResult<PortRef> {
        remap
            .get(port.node)
            .map(|n| PortRef::new(*n, port.port))
            .ok_or_else(|| internal_error!("reorder pass: input {} not yet placed", port.node))
    };

    for selected in nodes {
        let SelectedNode { mut node, implementation } = selected;
        for input in node.inputs.iter_mut() {
            *input = map_port(&remap, *input)?;
        }
        for dep in node.dependencies.iter_mut() {
            *dep = *remap
                .get(*dep)
                .ok_or_else(|| internal_error!("reorder pass: dependency {} not yet placed", dep))?;
        }

        if let Some(plan) = plan_reorder(&node, implementation) {
            if let Some(reason) = skip_reason(&node, config, ctx) {
                debug!(node = %node.id, %reason, "weights reorder skipped");
                report.decisions.push((node.id.clone(), ReorderDecision::Skipped(reason)));
            } else {
                let original_outputs = node.output_layouts.clone();
                let mut inserted = 0;
                for params in &plan.params {
                    let mut port = *node
                        .inputs
                        .get(params.input_index)
                        .ok_or_else(|| internal_error!("{} has no weight input {}", node.id, params.input_index))?;
                    let mut layout = params.source.clone();
                    if params.split {
                        if let (Some(from), Some(to)) = (params.source_order, params.target_order) {
                            let mut split = ProgramNode::new(
                                format!("{}_weights{}_gate_split", node.id, params.input_index),
                                Primitive::GateSplit { from, to },
                                vec![port],
                                vec![layout.clone()],
                            );
                            split.input_layouts = vec![layout.clone()];
                            split.constant_inputs = vec![true];
                            split.origin = node.origin;
                            let implementation = select(&split)?;
                            out.push(SelectedNode { node: split, implementation });
                            port = PortRef::new(out.len() - 1, 0);
                            inserted += 1;
                        }
                    }
                    if params.needs_layout_change() {
                        let mut reorder = ProgramNode::new(
                            format!("{}_weights{}_reorder", node.id, params.input_index),
                            Primitive::Reorder,
                            vec![port],
                            vec![params.target.clone()],
                        );
                        reorder.input_layouts = vec![layout];
                        reorder.constant_inputs = vec![true];
                        reorder.origin = node.origin;
                        let implementation = select(&reorder)?;
                        out.push(SelectedNode { node: reorder, implementation });
                        port = PortRef::new(out.len() - 1, 0);
                        layout = params.target.clone();
                        inserted += 1;
                    }
                    node.inputs[params.input_index] = port;
                    if let Some(slot) = node.input_layouts.get_mut(params.input_index) {
                        *slot = layout;
                    }
                }
                if let Some(order) = plan.consumer_order {
                    if let Primitive::LstmSeq { order: current, .. } | Primitive::LstmCell { order: current, .. } =
                        &mut node.primitive
                    {
                        *current = order;
                    }
                }
                node.output_layouts = original_outputs;
                debug!(node = %node.id, inserted, "weights reordered at build time");
                report
                    .decisions
                    .push((node.id.clone(), ReorderDecision::Applied { inserted }));
            }
        }
        out.push(SelectedNode { node, implementation });
        remap.push(out.len() - 1);
    }
    if !report.decisions.is_empty() {
        info!(inserted = report.inserted(), skipped = report.skipped(), "weight reorder pass done");
    }
    report.positions = remap;
    Ok((out, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElementType, RecurrentDirection, RecurrentAttrs, SequenceAttrs};

    fn lstm_node(dynamic: bool) -> ProgramNode {
        let plain = |dims: &[usize]| LayoutDesc::new(ElementType::F32, Format::Bfyx, PartialShape::from_static(dims));
        let seq = SequenceAttrs {
            cell: RecurrentAttrs::lstm(2),
            direction: RecurrentDirection::Forward,
        };
        let x = if dynamic {
            LayoutDesc::new(ElementType::F32, Format::Bfyx, PartialShape::dynamic_of_rank(3))
        } else {
            plain(&[1, 3, 4])
        };
        let mut node = ProgramNode::new(
            "lstm",
            Primitive::LstmSeq {
                seq,
                order: LstmWeightsOrder::Fizo,
            },
            (0..7).map(|i| PortRef::new(i, 0)).collect(),
            vec![plain(&[1, 1, 3, 2]), plain(&[1, 1, 2]), plain(&[1, 1, 2])],
        );
        node.input_layouts = vec![
            x,
            plain(&[1, 1, 2]),
            plain(&[1, 1, 2]),
            LayoutDesc::new(ElementType::I32, Format::Bfyx, PartialShape::from_static(&[1])),
            plain(&[1, 8, 4]),
            plain(&[1, 8, 2]),
            plain(&[1, 8]),
        ];
        node
    }

    #[test]
    fn test_recurrent_plan_targets_ldigo() {
        let node = lstm_node(false);
        let plan = recurrent_weights_plan(&node, LstmWeightsOrder::Fizo, LstmWeightsOrder::Izof, [4, 5], 6).unwrap();
        assert_eq!(plan.params.len(), 3);
        assert_eq!(plan.params[0].target.format, Format::Ldigo);
        assert_eq!(plan.params[0].target.static_dims(), Some(vec![1, 1, 4, 4, 2]));
        assert!(plan.params.iter().all(|p| p.split));
        assert!(!plan.params[2].needs_layout_change());
        assert_eq!(plan.consumer_order, Some(LstmWeightsOrder::Izof));
    }

    #[test]
    fn test_dynamic_node_skip_reasons() {
        let node = lstm_node(true);
        let ctx = ImplContext::default();
        let config = CompileConfig::default().with_disable_build_time_weight_reorder_for_dynamic_nodes(true);
        assert_eq!(skip_reason(&node, &config, &ctx), Some(SkipReason::DynamicReorderDisabled));
        let config = CompileConfig::default().with_is_internal_program(true);
        assert_eq!(skip_reason(&node, &config, &ctx), Some(SkipReason::InternalProgram));
        assert_eq!(skip_reason(&node, &CompileConfig::default(), &ctx), None);
        assert_eq!(skip_reason(&lstm_node(false), &config, &ctx), None);
    }
}
