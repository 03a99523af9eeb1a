//! Supported graph operations.
//!
//! Each operator kind is a variant of [`Op`] with its own attribute payload.
//! [`OpKind`] is the payload-free tag used by patterns and the registry.

use crate::ir::{ElementType, Tensor, TensorDesc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Parameter,
    Constant,
    Result,
    Convert,
    Add,
    Subtract,
    Multiply,
    Clamp,
    Reshape,
    Gather,
    Concat,
    Stft,
    Convolution,
    GroupConvolution,
    ConvolutionCompressed,
    LstmCell,
    LstmSequence,
    GruSequence,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Parameter => "Parameter",
            OpKind::Constant => "Constant",
            OpKind::Result => "Result",
            OpKind::Convert => "Convert",
            OpKind::Add => "Add",
            OpKind::Subtract => "Subtract",
            OpKind::Multiply => "Multiply",
            OpKind::Clamp => "Clamp",
            OpKind::Reshape => "Reshape",
            OpKind::Gather => "Gather",
            OpKind::Concat => "Concat",
            OpKind::Stft => "STFT",
            OpKind::Convolution => "Convolution",
            OpKind::GroupConvolution => "GroupConvolution",
            OpKind::ConvolutionCompressed => "ConvolutionCompressed",
            OpKind::LstmCell => "LSTMCell",
            OpKind::LstmSequence => "LSTMSequence",
            OpKind::GruSequence => "GRUSequence",
        }
    }

    pub fn is_elementwise_arithmetic(&self) -> bool {
        matches!(self, OpKind::Add | OpKind::Subtract | OpKind::Multiply)
    }

    /// Ops that only rearrange data and never change values.
    pub fn is_shape_only(&self) -> bool {
        matches!(self, OpKind::Reshape)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PadType {
    #[default]
    Explicit,
    SameUpper,
    SameLower,
    Valid,
}

impl PadType {
    pub fn to_tag(&self) -> u8 {
        match self {
            PadType::Explicit => 0,
            PadType::SameUpper => 1,
            PadType::SameLower => 2,
            PadType::Valid => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PadType::Explicit),
            1 => Some(PadType::SameUpper),
            2 => Some(PadType::SameLower),
            3 => Some(PadType::Valid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvolutionAttrs {
    pub strides: Vec<usize>,
    pub pads_begin: Vec<i64>,
    pub pads_end: Vec<i64>,
    pub dilations: Vec<usize>,
    pub auto_pad: PadType,
}

impl ConvolutionAttrs {
    /// Unit strides/dilations and zero pads for `spatial` dims.
    pub fn unit(spatial: usize) -> Self {
        Self {
            strides: vec![1; spatial],
            pads_begin: vec![0; spatial],
            pads_end: vec![0; spatial],
            dilations: vec![1; spatial],
            auto_pad: PadType::Explicit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompressedConvolutionAttrs {
    pub conv: ConvolutionAttrs,
    /// Zero for ungrouped convolution, the group count otherwise.
    pub groups: i64,
    pub output_type: Option<ElementType>,
}

impl CompressedConvolutionAttrs {
    pub fn has_groups(&self) -> bool {
        self.groups > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecurrentActivation {
    Sigmoid,
    Tanh,
    Relu,
}

impl RecurrentActivation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sigmoid" => Some(RecurrentActivation::Sigmoid),
            "tanh" => Some(RecurrentActivation::Tanh),
            "relu" => Some(RecurrentActivation::Relu),
            _ => None,
        }
    }

    pub fn to_tag(&self) -> u8 {
        match self {
            RecurrentActivation::Sigmoid => 0,
            RecurrentActivation::Tanh => 1,
            RecurrentActivation::Relu => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(RecurrentActivation::Sigmoid),
            1 => Some(RecurrentActivation::Tanh),
            2 => Some(RecurrentActivation::Relu),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecurrentDirection {
    Forward,
    Reverse,
    Bidirectional,
}

impl RecurrentDirection {
    pub fn num_directions(&self) -> usize {
        match self {
            RecurrentDirection::Bidirectional => 2,
            _ => 1,
        }
    }

    pub fn to_tag(&self) -> u8 {
        match self {
            RecurrentDirection::Forward => 0,
            RecurrentDirection::Reverse => 1,
            RecurrentDirection::Bidirectional => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(RecurrentDirection::Forward),
            1 => Some(RecurrentDirection::Reverse),
            2 => Some(RecurrentDirection::Bidirectional),
            _ => None,
        }
    }
}

/// Attributes shared by recurrent cells and sequences.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentAttrs {
    pub hidden_size: usize,
    pub activations: Vec<RecurrentActivation>,
    pub activations_alpha: Vec<f32>,
    pub activations_beta: Vec<f32>,
    /// Zero disables clipping.
    pub clip: f32,
}

impl RecurrentAttrs {
    pub fn lstm(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            activations: vec![
                RecurrentActivation::Sigmoid,
                RecurrentActivation::Tanh,
                RecurrentActivation::Tanh,
            ],
            activations_alpha: Vec::new(),
            activations_beta: Vec::new(),
            clip: 0.0,
        }
    }

    pub fn gru(hidden_size: usize) -> Self {
        Self {
            activations: vec![RecurrentActivation::Sigmoid, RecurrentActivation::Tanh],
            ..Self::lstm(hidden_size)
        }
    }

    pub fn with_clip(mut self, clip: f32) -> Self {
        self.clip = clip;
        self
    }

    pub fn with_activations(mut self, activations: Vec<RecurrentActivation>) -> Self {
        self.activations = activations;
        self
    }

    /// sigmoid, tanh, tanh without alpha/beta.
    pub fn has_default_lstm_activations(&self) -> bool {
        self.activations
            == [
                RecurrentActivation::Sigmoid,
                RecurrentActivation::Tanh,
                RecurrentActivation::Tanh,
            ]
            && self.activations_alpha.iter().all(|a| *a == 0.0)
            && self.activations_beta.iter().all(|b| *b == 0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceAttrs {
    pub cell: RecurrentAttrs,
    pub direction: RecurrentDirection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GruSequenceAttrs {
    pub seq: SequenceAttrs,
    pub linear_before_reset: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Parameter(TensorDesc),
    Constant(Tensor),
    Result,
    Convert { destination: ElementType },
    Add,
    Subtract,
    Multiply,
    Clamp { min: f32, max: f32 },
    Reshape { special_zero: bool },
    Gather { batch_dims: i64 },
    Concat { axis: i64 },
    Stft { transpose_frames: bool },
    Convolution(ConvolutionAttrs),
    GroupConvolution(ConvolutionAttrs),
    ConvolutionCompressed(CompressedConvolutionAttrs),
    LstmCell(RecurrentAttrs),
    LstmSequence(SequenceAttrs),
    GruSequence(GruSequenceAttrs),
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Parameter(_) => OpKind::Parameter,
            Op::Constant(_) => OpKind::Constant,
            Op::Result => OpKind::Result,
            Op::Convert { .. } => OpKind::Convert,
            Op::Add => OpKind::Add,
            Op::Subtract => OpKind::Subtract,
            Op::Multiply => OpKind::Multiply,
            Op::Clamp { .. } => OpKind::Clamp,
            Op::Reshape { .. } => OpKind::Reshape,
            Op::Gather { .. } => OpKind::Gather,
            Op::Concat { .. } => OpKind::Concat,
            Op::Stft { .. } => OpKind::Stft,
            Op::Convolution(_) => OpKind::Convolution,
            Op::GroupConvolution(_) => OpKind::GroupConvolution,
            Op::ConvolutionCompressed(_) => OpKind::ConvolutionCompressed,
            Op::LstmCell(_) => OpKind::LstmCell,
            Op::LstmSequence(_) => OpKind::LstmSequence,
            Op::GruSequence(_) => OpKind::GruSequence,
        }
    }

    pub fn as_constant(&self) -> Option<&Tensor> {
        match self {
            Op::Constant(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Op::Constant(_))
    }
}
