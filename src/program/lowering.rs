//! Graph to primitive lowering.
//!
//! Walks the graph in topological order and emits [`ProgramNode`]s in
//! processing order. Most operators map to a single primitive. Recurrent
//! operators either stay fused or are unrolled into
//! `fully_connected -> crop -> lstm_cell -> mutable_data` chains by
//! [`RecurrentLowering`].

use crate::config::CompileConfig;
use crate::error::ForgeResult;
use crate::internal_error;
use crate::ir::{
    Dimension, Graph, Node, NodeId, Op, Output, PartialShape, RecurrentAttrs, RecurrentDirection,
    SequenceAttrs, Tensor, TensorDesc,
};
use crate::program::primitive::{EltwiseMode, LstmWeightsOrder, PortRef, Primitive, ProgramNode};
use crate::registry::{Format, LayoutDesc};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Named program input (a graph Parameter).
#[derive(Debug, Clone)]
pub struct LoweredInput {
    pub name: String,
    pub node: usize,
}

/// Named program output (a graph Result) with the Result's descriptor.
#[derive(Debug, Clone)]
pub struct LoweredOutput {
    pub name: String,
    pub port: PortRef,
    pub layout: LayoutDesc,
}

#[derive(Debug, Clone, Default)]
pub struct LoweredProgram {
    pub nodes: Vec<ProgramNode>,
    pub inputs: Vec<LoweredInput>,
    pub outputs: Vec<LoweredOutput>,
}

/// Shape of one unrolled LSTM: which way time runs, the rank of the
/// per-step hidden output and the format its buffers use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurrentLowering {
    pub direction: RecurrentDirection,
    /// 2 for a standalone cell (`[b, h]`), 4 for sequence steps
    /// (`[b, 1, 1, h]`).
    pub rank: usize,
    pub format: Format,
}

impl RecurrentLowering {
    pub fn cell() -> Self {
        Self {
            direction: RecurrentDirection::Forward,
            rank: 2,
            format: Format::Bfyx,
        }
    }

    pub fn sequence_step(direction: RecurrentDirection) -> Self {
        Self {
            direction,
            rank: 4,
            format: Format::default_for_rank(4),
        }
    }

    /// Time index processed at step `i` of `len`.
    pub fn time_index(&self, i: usize, len: usize) -> usize {
        match self.direction {
            RecurrentDirection::Reverse => len - 1 - i,
            _ => i,
        }
    }

    fn hidden_layout(&self, desc: &TensorDesc, batch: &Dimension, hidden: usize) -> LayoutDesc {
        let mut dims = vec![batch.clone()];
        dims.extend(std::iter::repeat(Dimension::fixed(1)).take(self.rank.saturating_sub(2)));
        dims.push(Dimension::fixed(hidden as i64));
        LayoutDesc::new(desc.element_type, self.format, PartialShape::from(dims))
    }

    fn cell_layout(&self, desc: &TensorDesc, batch: &Dimension, hidden: usize) -> LayoutDesc {
        let mut dims = vec![batch.clone()];
        dims.extend(std::iter::repeat(Dimension::fixed(1)).take(self.rank.saturating_sub(3)));
        dims.push(Dimension::fixed(hidden as i64));
        let rank = dims.len();
        LayoutDesc::new(desc.element_type, Format::default_for_rank(rank), PartialShape::from(dims))
    }

    fn step_names(&self, base: &str, i: usize, last: bool) -> (String, String, String) {
        if self.rank == 2 {
            return (
                format!("{}_md_write.1", base),
                format!("{}.out0", base),
                format!("{}.out1", base),
            );
        }
        let buffer = format!("{}{}_md_write.1", base, i);
        if last {
            (buffer, format!("{}.out1", base), format!("{}.out2", base))
        } else {
            (buffer, format!("{}{}.out0", base, i), format!("{}{}.out1", base, i))
        }
    }
}

/// Hidden and cell state after one unrolled step.
#[derive(Debug, Clone, Copy)]
struct StepState {
    hidden: PortRef,
    cell: PortRef,
}

struct Lowerer<'a> {
    graph: &'a Graph,
    config: &'a CompileConfig,
    program: LoweredProgram,
    ports: HashMap<Output, PortRef>,
}

impl<'a> Lowerer<'a> {
    fn add(
        &mut self,
        id: impl Into<String>,
        primitive: Primitive,
        inputs: Vec<PortRef>,
        outputs: Vec<LayoutDesc>,
        origin: NodeId,
    ) -> usize {
        let mut node = ProgramNode::new(id, primitive, inputs, outputs);
        node.origin = Some(origin);
        trace!(id = %node.id, kind = %node.kind(), "lowered primitive");
        self.program.nodes.push(node);
        self.program.nodes.len() - 1
    }

    fn port(&self, output: Output) -> ForgeResult<PortRef> {
        self.ports
            .get(&output)
            .copied()
            .ok_or_else(|| internal_error!("{}:{} was not lowered before its reader", output.node, output.index))
    }

    fn input_ports(&self, node: &Node) -> ForgeResult<Vec<PortRef>> {
        node.inputs.iter().map(|o| self.port(*o)).collect()
    }

    fn layout(&self, port: PortRef) -> ForgeResult<LayoutDesc> {
        self.program
            .nodes
            .get(port.node)
            .and_then(|n| n.output_layouts.get(port.port))
            .cloned()
            .ok_or_else(|| internal_error!("no layout for port {}:{}", port.node, port.port))
    }

    fn map_outputs(&mut self, node: &Node, index: usize) {
        for port in 0..node.outputs.len() {
            self.ports.insert(node.id.out(port), PortRef::new(index, port));
        }
    }

    fn single(&mut self, node: &Node, primitive: Primitive) -> ForgeResult<()> {
        let inputs = self.input_ports(node)?;
        let outputs = node.outputs.iter().map(LayoutDesc::from_desc).collect();
        let index = self.add(node.name.clone(), primitive, inputs, outputs, node.id);
        self.map_outputs(node, index);
        Ok(())
    }

    fn crop(&mut self, id: String, input: PortRef, axis: usize, offset: usize, size: usize, origin: NodeId) -> ForgeResult<PortRef> {
        let layout = self.layout(input)?;
        let mut dims = layout
            .shape
            .dims()
            .map(<[Dimension]>::to_vec)
            .ok_or_else(|| internal_error!("crop {} of a dynamic-rank input", id))?;
        if axis >= dims.len() {
            return Err(internal_error!("crop {} axis {} out of rank {}", id, axis, dims.len()));
        }
        dims[axis] = Dimension::fixed(size as i64);
        let out = layout.with_shape(PartialShape::from(dims));
        let index = self.add(id, Primitive::Crop { axis, offset, size }, vec![input], vec![out], origin);
        Ok(PortRef::new(index, 0))
    }

    fn concat(&mut self, id: String, inputs: Vec<PortRef>, axis: usize, origin: NodeId) -> ForgeResult<PortRef> {
        let first = self.layout(*inputs.first().ok_or_else(|| internal_error!("{} has nothing to concatenate", id))?)?;
        let mut dims = first
            .shape
            .dims()
            .map(<[Dimension]>::to_vec)
            .ok_or_else(|| internal_error!("concatenation {} of a dynamic-rank input", id))?;
        let mut total = Dimension::fixed(0);
        for port in &inputs {
            let layout = self.layout(*port)?;
            let dim = layout
                .shape
                .dim(axis)
                .ok_or_else(|| internal_error!("{} input has no axis {}", id, axis))?;
            total = total.add(&dim);
        }
        dims[axis] = total;
        let out = first.with_shape(PartialShape::from(dims));
        let index = self.add(id, Primitive::Concatenation { axis }, inputs, vec![out], origin);
        Ok(PortRef::new(index, 0))
    }

    /// Emit one `mutable_data` buffer, `lstm_cell` and `mutable_data` reader
    /// per projection. Returns the state after every step, in step order.
    #[allow(clippy::too_many_arguments)]
    fn unroll_lstm(
        &mut self,
        lowering: RecurrentLowering,
        base: &str,
        projections: &[PortRef],
        initial: StepState,
        recurrent: PortRef,
        cell: &RecurrentAttrs,
        desc: &TensorDesc,
        batch: &Dimension,
        origin: NodeId,
    ) -> Vec<StepState> {
        let h_layout = lowering.hidden_layout(desc, batch, cell.hidden_size);
        let c_layout = lowering.cell_layout(desc, batch, cell.hidden_size);
        let mut state = initial;
        let mut states = Vec::with_capacity(projections.len());
        for (i, projection) in projections.iter().enumerate() {
            let (buffer_id, cell_id, reader_id) = lowering.step_names(base, i, i + 1 == projections.len());
            let buffer = self.add(buffer_id, Primitive::MutableData, Vec::new(), vec![c_layout.clone()], origin);
            let step = self.add(
                cell_id,
                Primitive::LstmCell {
                    cell: cell.clone(),
                    order: LstmWeightsOrder::Fizo,
                },
                vec![*projection, state.hidden, state.cell, recurrent],
                vec![h_layout.clone()],
                origin,
            );
            self.program.nodes[step].dependencies = vec![buffer];
            let reader = self.add(
                reader_id,
                Primitive::MutableData,
                vec![PortRef::new(step, 0)],
                vec![c_layout.clone()],
                origin,
            );
            self.program.nodes[reader].dependencies = vec![buffer];
            state = StepState {
                hidden: PortRef::new(step, 0),
                cell: PortRef::new(reader, 0),
            };
            states.push(state);
        }
        states
    }

    fn lower_lstm_cell(&mut self, node: &Node, attrs: &RecurrentAttrs) -> ForgeResult<()> {
        let ports = self.input_ports(node)?;
        let [x, h, c, w, r, b] = ports[..] else {
            return Err(internal_error!("{} expects 6 inputs", node.name));
        };
        let desc = node
            .outputs
            .first()
            .ok_or_else(|| internal_error!("{} has no outputs", node.name))?;
        let batch = desc.shape.dim(0).unwrap_or_else(Dimension::dynamic);
        let projected = TensorDesc::new(
            desc.element_type,
            PartialShape::from(vec![batch.clone(), Dimension::fixed(4 * attrs.hidden_size as i64)]),
        );
        let fc = self.add(
            format!("{}_fully_connected", node.name),
            Primitive::FullyConnected,
            vec![x, w, b],
            vec![LayoutDesc::from_desc(&projected)],
            node.id,
        );
        let states = self.unroll_lstm(
            RecurrentLowering::cell(),
            &node.name,
            &[PortRef::new(fc, 0)],
            StepState { hidden: h, cell: c },
            r,
            attrs,
            desc,
            &batch,
            node.id,
        );
        let last = *states
            .last()
            .ok_or_else(|| internal_error!("{} unrolled to nothing", node.name))?;
        self.ports.insert(node.id.out(0), last.hidden);
        self.ports.insert(node.id.out(1), last.cell);
        Ok(())
    }

    fn lower_lstm_sequence(&mut self, node: &Node, attrs: &SequenceAttrs) -> ForgeResult<()> {
        let x_desc = self
            .graph
            .output_desc(node.inputs[0])
            .ok_or_else(|| internal_error!("{} input is gone", node.name))?;
        // Unrolling needs a static input so every step buffer has a size, and
        // runs every step for every batch entry, so it is only taken when the
        // sequence lengths are a constant covering the full time axis.
        let full_length = |steps: usize| {
            node.inputs
                .get(3)
                .and_then(|lengths| self.graph.constant_value(*lengths))
                .map(|lengths| lengths.as_i64_vec().iter().all(|l| *l == steps as i64))
                .unwrap_or(false)
        };
        let seq_len = match x_desc.shape.to_shape() {
            Some(dims)
                if !self.config.allow_new_shape_infer && dims.len() == 3 && dims[1] > 0 && full_length(dims[1]) =>
            {
                dims[1]
            }
            _ => {
                debug!(node = %node.name, "fused lstm_seq");
                return self.single(
                    node,
                    Primitive::LstmSeq {
                        seq: attrs.clone(),
                        order: LstmWeightsOrder::Fizo,
                    },
                );
            }
        };
        debug!(node = %node.name, steps = seq_len, "unrolling lstm sequence");

        let ports = self.input_ports(node)?;
        let [x, h0, c0, _lengths, w, r, b] = ports[..] else {
            return Err(internal_error!("{} expects 7 inputs", node.name));
        };
        let desc = node
            .outputs
            .first()
            .ok_or_else(|| internal_error!("{} has no outputs", node.name))?
            .clone();
        let batch = x_desc.shape.dim(0).unwrap_or_else(Dimension::dynamic);
        let hidden = attrs.cell.hidden_size;
        let dirs = attrs.direction.num_directions();

        let mut per_direction = Vec::with_capacity(dirs);
        for d in 0..dirs {
            let (base, direction) = match attrs.direction {
                RecurrentDirection::Bidirectional => (
                    format!("{}_dir{}", node.name, d),
                    if d == 0 {
                        RecurrentDirection::Forward
                    } else {
                        RecurrentDirection::Reverse
                    },
                ),
                direction => (node.name.clone(), direction),
            };
            let (w_d, r_d, b_d, h_d, c_d) = if dirs > 1 {
                (
                    self.crop(format!("{}_W", base), w, 0, d, 1, node.id)?,
                    self.crop(format!("{}_R", base), r, 0, d, 1, node.id)?,
                    self.crop(format!("{}_B", base), b, 0, d, 1, node.id)?,
                    self.crop(format!("{}_H0", base), h0, 1, d, 1, node.id)?,
                    self.crop(format!("{}_C0", base), c0, 1, d, 1, node.id)?,
                )
            } else {
                (w, r, b, h0, c0)
            };
            let projected = TensorDesc::new(
                desc.element_type,
                PartialShape::from(vec![
                    batch.clone(),
                    Dimension::fixed(seq_len as i64),
                    Dimension::fixed(4 * hidden as i64),
                ]),
            );
            let fc = self.add(
                format!("{}_fully_connected", base),
                Primitive::FullyConnected,
                vec![x, w_d, b_d],
                vec![LayoutDesc::from_desc(&projected)],
                node.id,
            );
            let lowering = RecurrentLowering::sequence_step(direction);
            let mut projections = Vec::with_capacity(seq_len);
            for i in 0..seq_len {
                let t = lowering.time_index(i, seq_len);
                projections.push(self.crop(format!("{}{}_input", base, i), PortRef::new(fc, 0), 1, t, 1, node.id)?);
            }
            let states = self.unroll_lstm(
                lowering,
                &base,
                &projections,
                StepState { hidden: h_d, cell: c_d },
                r_d,
                &attrs.cell,
                &desc,
                &batch,
                node.id,
            );
            let last = *states
                .last()
                .ok_or_else(|| internal_error!("{} unrolled to nothing", node.name))?;
            let mut hidden_steps: Vec<PortRef> = states.iter().map(|s| s.hidden).collect();
            if direction == RecurrentDirection::Reverse {
                hidden_steps.reverse();
            }
            let y = self.concat(format!("{}.out0", base), hidden_steps, 2, node.id)?;
            per_direction.push((y, last));
        }

        let (y, ho, co) = match per_direction.as_slice() {
            [(y, last)] => (*y, last.hidden, last.cell),
            _ => {
                let ys = per_direction.iter().map(|(y, _)| *y).collect();
                let hs = per_direction.iter().map(|(_, s)| s.hidden).collect();
                let cs = per_direction.iter().map(|(_, s)| s.cell).collect();
                (
                    self.concat(format!("{}.out0", node.name), ys, 1, node.id)?,
                    self.concat(format!("{}.out1", node.name), hs, 1, node.id)?,
                    self.concat(format!("{}.out2", node.name), cs, 1, node.id)?,
                )
            }
        };
        self.ports.insert(node.id.out(0), y);
        self.ports.insert(node.id.out(1), ho);
        self.ports.insert(node.id.out(2), co);
        Ok(())
    }

    fn lower(&mut self, id: NodeId) -> ForgeResult<()> {
        let graph = self.graph;
        let node = graph.try_node(id)?;
        match &node.op {
            Op::Parameter(_) => {
                self.single(node, Primitive::Input)?;
                let index = self.program.nodes.len() - 1;
                self.program.inputs.push(LoweredInput {
                    name: node.name.clone(),
                    node: index,
                });
            }
            Op::Constant(t) => self.single(node, Primitive::Data(t.clone()))?,
            Op::Result => {
                let source = node
                    .input(0)
                    .ok_or_else(|| internal_error!("result {} has no input", node.name))?;
                let port = self.port(source)?;
                let desc = node
                    .outputs
                    .first()
                    .ok_or_else(|| internal_error!("result {} has no descriptor", node.name))?;
                self.program.outputs.push(LoweredOutput {
                    name: node.name.clone(),
                    port,
                    layout: LayoutDesc::from_desc(desc),
                });
            }
            Op::Convert { destination } => self.single(
                node,
                Primitive::Convert {
                    destination: *destination,
                },
            )?,
            Op::Add => self.single(node, Primitive::Eltwise(EltwiseMode::Sum))?,
            Op::Subtract => self.single(node, Primitive::Eltwise(EltwiseMode::Sub))?,
            Op::Multiply => self.single(node, Primitive::Eltwise(EltwiseMode::Prod))?,
            Op::Clamp { min, max } => self.single(node, Primitive::Clamp { min: *min, max: *max })?,
            Op::Reshape { special_zero } => self.single(
                node,
                Primitive::Reshape {
                    special_zero: *special_zero,
                },
            )?,
            Op::Gather { batch_dims } => self.single(
                node,
                Primitive::Gather {
                    batch_dims: *batch_dims,
                },
            )?,
            Op::Concat { axis } => {
                let rank = node
                    .outputs
                    .first()
                    .and_then(|d| d.shape.rank())
                    .ok_or_else(|| internal_error!("concat {} needs a known rank", node.name))?;
                let axis = if *axis < 0 { *axis + rank as i64 } else { *axis };
                if axis < 0 || axis as usize >= rank {
                    return Err(internal_error!("concat {} axis out of range", node.name));
                }
                self.single(node, Primitive::Concatenation { axis: axis as usize })?
            }
            Op::Stft { transpose_frames } => self.single(
                node,
                Primitive::Stft {
                    transpose_frames: *transpose_frames,
                },
            )?,
            Op::Convolution(attrs) | Op::GroupConvolution(attrs) => self.single(
                node,
                Primitive::Convolution {
                    attrs: attrs.clone(),
                    grouped: matches!(node.op, Op::GroupConvolution(_)),
                    compressed: false,
                    output_type: None,
                },
            )?,
            Op::ConvolutionCompressed(attrs) => self.single(
                node,
                Primitive::Convolution {
                    attrs: attrs.conv.clone(),
                    grouped: attrs.has_groups(),
                    compressed: true,
                    output_type: attrs.output_type,
                },
            )?,
            Op::LstmCell(attrs) => self.lower_lstm_cell(node, attrs)?,
            Op::LstmSequence(attrs) => self.lower_lstm_sequence(node, attrs)?,
            Op::GruSequence(attrs) => self.single(node, Primitive::GruSeq(attrs.clone()))?,
        }
        Ok(())
    }
}

/// Lower `graph` visiting nodes in `order`.
pub fn lower_graph(graph: &Graph, order: &[NodeId], config: &CompileConfig) -> ForgeResult<LoweredProgram> {
    let mut lowerer = Lowerer {
        graph,
        config,
        program: LoweredProgram::default(),
        ports: HashMap::new(),
    };
    for id in order {
        lowerer.lower(*id)?;
    }
    Ok(lowerer.program)
}

/// Constant payload of a lowered node, if any.
pub fn constant_data(node: &ProgramNode) -> Option<&Tensor> {
    match &node.primitive {
        Primitive::Data(t) => Some(t),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ElementType;

    #[test]
    fn test_time_index() {
        let fwd = RecurrentLowering::sequence_step(RecurrentDirection::Forward);
        let rev = RecurrentLowering::sequence_step(RecurrentDirection::Reverse);
        assert_eq!((0..3).map(|i| fwd.time_index(i, 3)).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!((0..3).map(|i| rev.time_index(i, 3)).collect::<Vec<_>>(), vec![2, 1, 0]);
    }

    #[test]
    fn test_step_names() {
        let seq = RecurrentLowering::sequence_step(RecurrentDirection::Forward);
        assert_eq!(
            seq.step_names("lstm", 0, false),
            ("lstm0_md_write.1".to_string(), "lstm0.out0".to_string(), "lstm0.out1".to_string())
        );
        assert_eq!(
            seq.step_names("lstm", 2, true),
            ("lstm2_md_write.1".to_string(), "lstm.out1".to_string(), "lstm.out2".to_string())
        );
        let cell = RecurrentLowering::cell();
        assert_eq!(cell.step_names("c", 0, true).0, "c_md_write.1");
    }

    #[test]
    fn test_state_layouts_follow_rank() {
        let desc = TensorDesc::with_static(ElementType::F32, &[2, 5]);
        let seq = RecurrentLowering::sequence_step(RecurrentDirection::Forward);
        let batch = Dimension::fixed(2);
        assert_eq!(seq.hidden_layout(&desc, &batch, 5).static_dims(), Some(vec![2, 1, 1, 5]));
        assert_eq!(seq.cell_layout(&desc, &batch, 5).static_dims(), Some(vec![2, 1, 5]));
        let cell = RecurrentLowering::cell();
        assert_eq!(cell.hidden_layout(&desc, &batch, 5).static_dims(), Some(vec![2, 5]));
    }
}
