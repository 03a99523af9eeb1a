//! Shape inference engine.
//!
//! `infer` maps an operator, its input descriptors and whatever constant
//! inputs are available to the output descriptors. It is a pure function:
//! the same inputs always give the same outputs. When a parameter that would
//! fix a dimension is not constant, the affected dimensions come back
//! dynamic instead of failing.

pub mod common;
pub mod convolution;
pub mod recurrent;
pub mod stft;

use crate::error::ForgeResult;
use crate::ir::{Op, Tensor, TensorDesc};
use crate::shape_error;

/// Read access to constant-folded input values.
pub trait ConstantAccessor {
    fn constant(&self, input: usize) -> Option<&Tensor>;
}

/// Accessor for callers that have no constants at hand.
pub struct NoConstants;

impl ConstantAccessor for NoConstants {
    fn constant(&self, _input: usize) -> Option<&Tensor> {
        None
    }
}

/// Accessor over an explicit list of optional constants.
pub struct ConstantList<'a>(pub &'a [Option<&'a Tensor>]);

impl ConstantAccessor for ConstantList<'_> {
    fn constant(&self, input: usize) -> Option<&Tensor> {
        self.0.get(input).copied().flatten()
    }
}

pub fn infer(
    node: &str,
    op: &Op,
    inputs: &[TensorDesc],
    constants: &dyn ConstantAccessor,
) -> ForgeResult<Vec<TensorDesc>> {
    match op {
        Op::Parameter(desc) => {
            expect_inputs(node, inputs, 0)?;
            Ok(vec![desc.clone()])
        }
        Op::Constant(tensor) => {
            expect_inputs(node, inputs, 0)?;
            Ok(vec![tensor.desc()])
        }
        Op::Result => {
            expect_inputs(node, inputs, 1)?;
            Ok(vec![inputs[0].clone()])
        }
        Op::Convert { destination } => {
            expect_inputs(node, inputs, 1)?;
            Ok(vec![TensorDesc::new(*destination, inputs[0].shape.clone())])
        }
        Op::Add | Op::Subtract | Op::Multiply => common::infer_eltwise(node, inputs),
        Op::Clamp { min, max } => common::infer_clamp(node, inputs, *min, *max),
        Op::Reshape { special_zero } => common::infer_reshape(node, inputs, constants, *special_zero),
        Op::Gather { batch_dims } => common::infer_gather(node, inputs, constants, *batch_dims),
        Op::Concat { axis } => common::infer_concat(node, inputs, *axis),
        Op::Stft { transpose_frames } => stft::infer_stft(node, inputs, constants, *transpose_frames),
        Op::Convolution(attrs) => convolution::infer_convolution(node, inputs, attrs),
        Op::GroupConvolution(attrs) => convolution::infer_group_convolution(node, inputs, attrs),
        Op::ConvolutionCompressed(attrs) => convolution::infer_compressed(node, inputs, attrs),
        Op::LstmCell(attrs) => recurrent::infer_lstm_cell(node, inputs, attrs),
        Op::LstmSequence(attrs) => recurrent::infer_lstm_sequence(node, inputs, attrs),
        Op::GruSequence(attrs) => recurrent::infer_gru_sequence(node, inputs, attrs),
    }
}

pub(crate) fn expect_inputs(node: &str, inputs: &[TensorDesc], count: usize) -> ForgeResult<()> {
    if inputs.len() != count {
        return Err(shape_error!(
            node,
            "expected {} inputs, got {}",
            count,
            inputs.len()
        ));
    }
    Ok(())
}

/// Check a known rank; dynamic rank always passes.
pub(crate) fn expect_rank(node: &str, what: &str, desc: &TensorDesc, rank: usize) -> ForgeResult<()> {
    match desc.shape.rank() {
        Some(r) if r != rank => Err(shape_error!(
            node,
            "{} must have rank {}, got {}",
            what,
            rank,
            desc.shape
        )),
        _ => Ok(()),
    }
}
