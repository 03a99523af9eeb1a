//! Graph IR: element types, interval shapes, operators, runtime tags and the
//! arena graph that rewrite passes mutate.

pub mod compare;
pub mod dimension;
pub mod element;
pub mod graph;
pub mod op;
pub mod rt_info;
pub mod shape;
pub mod tensor;

pub use compare::{compare_graphs, CompareOptions};
pub use dimension::Dimension;
pub use element::ElementType;
pub use graph::{Graph, Node, NodeId, Output};
pub use op::{
    CompressedConvolutionAttrs, ConvolutionAttrs, GruSequenceAttrs, Op, OpKind, PadType,
    RecurrentActivation, RecurrentAttrs, RecurrentDirection, SequenceAttrs,
};
pub use rt_info::{RtInfo, RuntimeTag, TagState};
pub use shape::PartialShape;
pub use tensor::{Tensor, TensorDesc};
