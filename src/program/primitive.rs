//! Lowered primitives.
//!
//! A graph node lowers to one or more [`ProgramNode`]s. Each carries a
//! [`Primitive`] (kind plus attributes), its input ports and its output
//! layouts. Formats are filled in by implementation selection.

use crate::ir::{
    ConvolutionAttrs, ElementType, GruSequenceAttrs, NodeId, RecurrentAttrs, SequenceAttrs, Tensor,
};
use crate::registry::LayoutDesc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registry key of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Input,
    Data,
    Convert,
    Eltwise,
    Clamp,
    Reshape,
    Gather,
    Concatenation,
    Crop,
    FullyConnected,
    Stft,
    Convolution,
    LstmCell,
    LstmSeq,
    GruSeq,
    MutableData,
    Reorder,
    GateSplit,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 18] = [
        PrimitiveKind::Input,
        PrimitiveKind::Data,
        PrimitiveKind::Convert,
        PrimitiveKind::Eltwise,
        PrimitiveKind::Clamp,
        PrimitiveKind::Reshape,
        PrimitiveKind::Gather,
        PrimitiveKind::Concatenation,
        PrimitiveKind::Crop,
        PrimitiveKind::FullyConnected,
        PrimitiveKind::Stft,
        PrimitiveKind::Convolution,
        PrimitiveKind::LstmCell,
        PrimitiveKind::LstmSeq,
        PrimitiveKind::GruSeq,
        PrimitiveKind::MutableData,
        PrimitiveKind::Reorder,
        PrimitiveKind::GateSplit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveKind::Input => "input",
            PrimitiveKind::Data => "data",
            PrimitiveKind::Convert => "convert",
            PrimitiveKind::Eltwise => "eltwise",
            PrimitiveKind::Clamp => "clamp",
            PrimitiveKind::Reshape => "reshape",
            PrimitiveKind::Gather => "gather",
            PrimitiveKind::Concatenation => "concatenation",
            PrimitiveKind::Crop => "crop",
            PrimitiveKind::FullyConnected => "fully_connected",
            PrimitiveKind::Stft => "stft",
            PrimitiveKind::Convolution => "convolution",
            PrimitiveKind::LstmCell => "lstm_cell",
            PrimitiveKind::LstmSeq => "lstm_seq",
            PrimitiveKind::GruSeq => "gru_seq",
            PrimitiveKind::MutableData => "mutable_data",
            PrimitiveKind::Reorder => "reorder",
            PrimitiveKind::GateSplit => "gate_split",
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EltwiseMode {
    Sum,
    Sub,
    Prod,
}

impl EltwiseMode {
    pub fn apply(&self, a: f32, b: f32) -> f32 {
        match self {
            EltwiseMode::Sum => a + b,
            EltwiseMode::Sub => a - b,
            EltwiseMode::Prod => a * b,
        }
    }

    pub fn to_tag(&self) -> u8 {
        match self {
            EltwiseMode::Sum => 0,
            EltwiseMode::Sub => 1,
            EltwiseMode::Prod => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(EltwiseMode::Sum),
            1 => Some(EltwiseMode::Sub),
            2 => Some(EltwiseMode::Prod),
            _ => None,
        }
    }
}

/// Gate block order of LSTM weights, recurrent weights and biases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LstmWeightsOrder {
    /// ONNX.
    Iofz,
    /// Caffe.
    Ifoz,
    /// PyTorch.
    Izof,
    /// Graph IR order.
    Fizo,
}

impl LstmWeightsOrder {
    /// Block positions of the input, output, forget and cell (`z`) gates.
    pub fn gate_offsets(&self) -> [usize; 4] {
        match self {
            LstmWeightsOrder::Iofz => [0, 1, 2, 3],
            LstmWeightsOrder::Ifoz => [0, 2, 1, 3],
            LstmWeightsOrder::Izof => [0, 3, 1, 2],
            LstmWeightsOrder::Fizo => [1, 3, 0, 2],
        }
    }

    /// For each block position of `self`, the block position of the same
    /// gate in `source`.
    pub fn source_blocks(&self, source: LstmWeightsOrder) -> [usize; 4] {
        let to = self.gate_offsets();
        let from = source.gate_offsets();
        let mut blocks = [0; 4];
        for gate in 0..4 {
            blocks[to[gate]] = from[gate];
        }
        blocks
    }

    pub fn name(&self) -> &'static str {
        match self {
            LstmWeightsOrder::Iofz => "iofz",
            LstmWeightsOrder::Ifoz => "ifoz",
            LstmWeightsOrder::Izof => "izof",
            LstmWeightsOrder::Fizo => "fizo",
        }
    }

    pub fn to_tag(&self) -> u8 {
        match self {
            LstmWeightsOrder::Iofz => 0,
            LstmWeightsOrder::Ifoz => 1,
            LstmWeightsOrder::Izof => 2,
            LstmWeightsOrder::Fizo => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(LstmWeightsOrder::Iofz),
            1 => Some(LstmWeightsOrder::Ifoz),
            2 => Some(LstmWeightsOrder::Izof),
            3 => Some(LstmWeightsOrder::Fizo),
            _ => None,
        }
    }
}

/// Primitive kind with attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Input,
    Data(Tensor),
    Convert {
        destination: ElementType,
    },
    Eltwise(EltwiseMode),
    Clamp {
        min: f32,
        max: f32,
    },
    /// Inputs: data, target shape.
    Reshape {
        special_zero: bool,
    },
    /// Inputs: data, indices, axis.
    Gather {
        batch_dims: i64,
    },
    Concatenation {
        axis: usize,
    },
    Crop {
        axis: usize,
        offset: usize,
        size: usize,
    },
    /// Inputs: data `[.., in]`, weights `[.., out, in]`, optional bias.
    FullyConnected,
    Stft {
        transpose_frames: bool,
    },
    /// Inputs: data, weights, then scale and zero point when compressed.
    Convolution {
        attrs: ConvolutionAttrs,
        grouped: bool,
        compressed: bool,
        output_type: Option<ElementType>,
    },
    /// Inputs: projected input `[b, 4h]`, hidden, cell, recurrent weights.
    /// The new cell state is written to dependency 0.
    LstmCell {
        cell: RecurrentAttrs,
        order: LstmWeightsOrder,
    },
    /// Inputs: X, H0, C0, sequence lengths, W, R, B.
    LstmSeq {
        seq: SequenceAttrs,
        order: LstmWeightsOrder,
    },
    /// Inputs: X, H0, sequence lengths, W, R, B (gate order zrh).
    GruSeq(GruSequenceAttrs),
    /// Shared mutable buffer. Reads (or writes) dependency 0.
    MutableData,
    /// Layout change to the output layout.
    Reorder,
    /// Gate-block permutation along axis 1 (`[dirs, 4 * hidden, ..]`).
    GateSplit {
        from: LstmWeightsOrder,
        to: LstmWeightsOrder,
    },
}

impl Primitive {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Primitive::Input => PrimitiveKind::Input,
            Primitive::Data(_) => PrimitiveKind::Data,
            Primitive::Convert { .. } => PrimitiveKind::Convert,
            Primitive::Eltwise(_) => PrimitiveKind::Eltwise,
            Primitive::Clamp { .. } => PrimitiveKind::Clamp,
            Primitive::Reshape { .. } => PrimitiveKind::Reshape,
            Primitive::Gather { .. } => PrimitiveKind::Gather,
            Primitive::Concatenation { .. } => PrimitiveKind::Concatenation,
            Primitive::Crop { .. } => PrimitiveKind::Crop,
            Primitive::FullyConnected => PrimitiveKind::FullyConnected,
            Primitive::Stft { .. } => PrimitiveKind::Stft,
            Primitive::Convolution { .. } => PrimitiveKind::Convolution,
            Primitive::LstmCell { .. } => PrimitiveKind::LstmCell,
            Primitive::LstmSeq { .. } => PrimitiveKind::LstmSeq,
            Primitive::GruSeq(_) => PrimitiveKind::GruSeq,
            Primitive::MutableData => PrimitiveKind::MutableData,
            Primitive::Reorder => PrimitiveKind::Reorder,
            Primitive::GateSplit { .. } => PrimitiveKind::GateSplit,
        }
    }

    /// Clip threshold of recurrent primitives, zero otherwise.
    pub fn clip(&self) -> f32 {
        self.recurrent_attrs().map_or(0.0, |cell| cell.clip)
    }

    pub fn recurrent_attrs(&self) -> Option<&RecurrentAttrs> {
        match self {
            Primitive::LstmCell { cell, .. } => Some(cell),
            Primitive::LstmSeq { seq, .. } => Some(&seq.cell),
            Primitive::GruSeq(attrs) => Some(&attrs.seq.cell),
            _ => None,
        }
    }
}

/// Output port of a program node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: usize,
    pub port: usize,
}

impl PortRef {
    pub fn new(node: usize, port: usize) -> Self {
        Self { node, port }
    }
}

/// One lowered primitive before instantiation.
#[derive(Debug, Clone)]
pub struct ProgramNode {
    pub id: String,
    pub primitive: Primitive,
    pub inputs: Vec<PortRef>,
    /// Mutable buffers (MutableData nodes) this primitive reads or writes.
    pub dependencies: Vec<usize>,
    pub input_layouts: Vec<LayoutDesc>,
    pub output_layouts: Vec<LayoutDesc>,
    pub constant_inputs: Vec<bool>,
    pub origin: Option<NodeId>,
}

impl ProgramNode {
    pub fn new(id: impl Into<String>, primitive: Primitive, inputs: Vec<PortRef>, outputs: Vec<LayoutDesc>) -> Self {
        Self {
            id: id.into(),
            primitive,
            inputs,
            dependencies: Vec::new(),
            input_layouts: Vec::new(),
            output_layouts: outputs,
            constant_inputs: Vec::new(),
            origin: None,
        }
    }

    pub fn kind(&self) -> PrimitiveKind {
        self.primitive.kind()
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.primitive, Primitive::Data(_))
    }

    /// Any input or output layout has a dynamic dimension.
    pub fn is_dynamic(&self) -> bool {
        self.input_layouts
            .iter()
            .chain(self.output_layouts.iter())
            .any(|l| !l.is_static())
    }

    pub fn input_is_constant(&self, index: usize) -> bool {
        self.constant_inputs.get(index).copied().unwrap_or(false)
    }
}
