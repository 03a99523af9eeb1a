//! Reference kernels.
//!
//! Host `f32` math standing in for device kernels. Every implementation
//! descriptor points at [`execute_reference`]; constant folding uses
//! [`evaluate_op`] on graph operators directly.

pub mod basic;
pub mod convolution;
pub mod recurrent;
pub mod stft;

use crate::error::ForgeResult;
use crate::execution_error;
use crate::ir::{ElementType, Op, Tensor, TensorDesc};
use crate::program::primitive::{EltwiseMode, LstmWeightsOrder, Primitive};
use crate::registry::{Format, LayoutDesc};

/// Buffers handed to a kernel.
pub struct KernelArgs<'a> {
    pub inputs: Vec<&'a Tensor>,
    pub dependencies: Vec<&'a Tensor>,
    pub input_layouts: &'a [LayoutDesc],
    pub output_layouts: &'a [LayoutDesc],
}

impl<'a> KernelArgs<'a> {
    fn input(&self, index: usize) -> ForgeResult<&'a Tensor> {
        self.inputs
            .get(index)
            .copied()
            .ok_or_else(|| execution_error!("kernel input {} missing", index))
    }

    fn optional_input(&self, index: usize) -> Option<&'a Tensor> {
        self.inputs.get(index).copied()
    }

    fn output_type(&self, index: usize, fallback: ElementType) -> ElementType {
        self.output_layouts
            .get(index)
            .map(|l| l.element_type)
            .filter(|t| !t.is_dynamic())
            .unwrap_or(fallback)
    }

    fn input_format(&self, index: usize) -> Format {
        self.input_layouts
            .get(index)
            .map(|l| l.format)
            .unwrap_or(Format::Any)
    }

    /// Output shape from the layout when static, else the given shape.
    fn output_shape(&self, index: usize, computed: &[usize]) -> Vec<usize> {
        match self.output_layouts.get(index).and_then(|l| l.static_dims()) {
            Some(dims) if dims.iter().product::<usize>() == computed.iter().product::<usize>() => dims,
            _ => computed.to_vec(),
        }
    }
}

/// Kernel results: fresh outputs plus new contents for mutable
/// dependencies.
#[derive(Debug, Default)]
pub struct KernelOutputs {
    pub outputs: Vec<Tensor>,
    pub dependencies: Vec<Tensor>,
}

impl KernelOutputs {
    fn single(tensor: Tensor) -> Self {
        Self {
            outputs: vec![tensor],
            dependencies: Vec::new(),
        }
    }
}

pub type KernelFn = fn(&Primitive, &KernelArgs<'_>) -> ForgeResult<KernelOutputs>;

fn scalar_usize(t: &Tensor, what: &str) -> ForgeResult<usize> {
    t.scalar_value()
        .filter(|v| *v >= 0.0)
        .map(|v| v as usize)
        .ok_or_else(|| execution_error!("{} must be a non-negative scalar", what))
}

fn scalar_i64(t: &Tensor, what: &str) -> ForgeResult<i64> {
    t.scalar_value()
        .map(|v| v as i64)
        .ok_or_else(|| execution_error!("{} must be a scalar", what))
}

pub fn execute_reference(primitive: &Primitive, args: &KernelArgs<'_>) -> ForgeResult<KernelOutputs> {
    let out = match primitive {
        Primitive::Input | Primitive::Data(_) => {
            return Err(execution_error!("{} has no kernel", primitive.kind()));
        }
        Primitive::Convert { destination } => args.input(0)?.convert(*destination),
        Primitive::Eltwise(mode) => {
            let a = args.input(0)?;
            basic::eltwise(*mode, a, args.input(1)?, args.output_type(0, a.element_type()))?
        }
        Primitive::Clamp { min, max } => basic::clamp(args.input(0)?, *min, *max)?,
        Primitive::Reshape { special_zero } => {
            basic::reshape(args.input(0)?, args.input(1)?, *special_zero)?
        }
        Primitive::Gather { batch_dims } => {
            let axis = scalar_i64(args.input(2)?, "gather axis")?;
            basic::gather(args.input(0)?, args.input(1)?, axis, *batch_dims)?
        }
        Primitive::Concatenation { axis } => basic::concat(&args.inputs, *axis)?,
        Primitive::Crop { axis, offset, size } => basic::crop(args.input(0)?, *axis, *offset, *size)?,
        Primitive::FullyConnected => {
            let x = args.input(0)?;
            let fc = basic::fully_connected(
                x,
                args.input(1)?,
                args.optional_input(2),
                args.output_type(0, x.element_type()),
            )?;
            let shape = args.output_shape(0, fc.shape());
            fc.reshaped(shape)?
        }
        Primitive::Stft { transpose_frames } => stft::stft(
            args.input(0)?,
            args.input(1)?,
            scalar_usize(args.input(2)?, "frame size")?,
            scalar_usize(args.input(3)?, "frame step")?,
            *transpose_frames,
            args.output_type(0, ElementType::F32),
        )?,
        Primitive::Convolution {
            attrs,
            grouped,
            compressed,
            output_type,
        } => {
            let data = args.input(0)?;
            let out_type = output_type.unwrap_or_else(|| args.output_type(0, ElementType::F32));
            if *compressed {
                let weights = convolution::dequantize(args.input(1)?, args.input(2)?, args.optional_input(3))?;
                convolution::convolution(data, &weights, attrs, *grouped, out_type)?
            } else {
                convolution::convolution(data, args.input(1)?, attrs, *grouped, out_type)?
            }
        }
        Primitive::LstmCell { cell, order } => {
            let h = args.input(1)?;
            let (h_next, c_next) = recurrent::lstm_cell(
                args.input(0)?,
                h,
                args.input(2)?,
                args.input(3)?,
                args.input_format(3) == Format::Ldigo,
                cell,
                *order,
            )?;
            let out_type = args.output_type(0, h.element_type());
            let h_shape = args.output_shape(0, &[h_next.len() / cell.hidden_size.max(1), cell.hidden_size]);
            let c_shape = match args.dependencies.first() {
                Some(dep) if dep.len() == c_next.len() => dep.shape().to_vec(),
                _ => vec![c_next.len() / cell.hidden_size.max(1), cell.hidden_size],
            };
            let c_type = args.dependencies.first().map(|d| d.element_type()).unwrap_or(out_type);
            let c_tensor = Tensor::new(c_type, c_shape, c_next)?;
            let h_tensor = Tensor::new(out_type, h_shape, h_next)?;
            return Ok(if args.dependencies.is_empty() {
                KernelOutputs {
                    outputs: vec![h_tensor, c_tensor],
                    dependencies: Vec::new(),
                }
            } else {
                KernelOutputs {
                    outputs: vec![h_tensor],
                    dependencies: vec![c_tensor],
                }
            });
        }
        Primitive::LstmSeq { seq, order } => {
            let x = args.input(0)?;
            let outputs = recurrent::lstm_sequence(
                x,
                args.input(1)?,
                args.input(2)?,
                args.optional_input(3),
                args.input(4)?,
                args.input(5)?,
                args.input(6)?,
                args.input_format(4) == Format::Ldigo,
                seq,
                *order,
                args.output_type(0, x.element_type()),
            )?;
            return Ok(KernelOutputs {
                outputs,
                dependencies: Vec::new(),
            });
        }
        Primitive::GruSeq(attrs) => {
            let x = args.input(0)?;
            let outputs = recurrent::gru_sequence(
                x,
                args.input(1)?,
                args.optional_input(2),
                args.input(3)?,
                args.input(4)?,
                args.input(5)?,
                attrs,
                args.output_type(0, x.element_type()),
            )?;
            return Ok(KernelOutputs {
                outputs,
                dependencies: Vec::new(),
            });
        }
        Primitive::MutableData => args
            .dependencies
            .first()
            .map(|t| (*t).clone())
            .ok_or_else(|| execution_error!("mutable_data without a shared buffer"))?,
        Primitive::Reorder => {
            let input = args.input(0)?;
            let target = args
                .output_layouts
                .first()
                .ok_or_else(|| execution_error!("reorder without an output layout"))?;
            if target.format == Format::Ldigo && args.input_format(0) != Format::Ldigo {
                basic::to_ldigo(input, 4, target.element_type)?
            } else {
                input.convert(target.element_type)
            }
        }
        Primitive::GateSplit { from, to } => basic::gate_split(args.input(0)?, *from, *to)?,
    };
    Ok(KernelOutputs::single(out))
}

fn eltwise_mode(op: &Op) -> Option<EltwiseMode> {
    match op {
        Op::Add => Some(EltwiseMode::Sum),
        Op::Subtract => Some(EltwiseMode::Sub),
        Op::Multiply => Some(EltwiseMode::Prod),
        _ => None,
    }
}

/// Evaluate a graph operator on constant inputs.
///
/// Returns `Ok(None)` for operators that are never folded (sources and
/// sinks).
pub fn evaluate_op(op: &Op, inputs: &[&Tensor], outputs: &[TensorDesc]) -> ForgeResult<Option<Vec<Tensor>>> {
    let out_type = |i: usize, fallback: ElementType| {
        outputs
            .get(i)
            .map(|d| d.element_type)
            .filter(|t| !t.is_dynamic())
            .unwrap_or(fallback)
    };
    let input = |i: usize| {
        inputs
            .get(i)
            .copied()
            .ok_or_else(|| execution_error!("constant input {} missing", i))
    };
    let single = |t: Tensor| Ok(Some(vec![t]));
    match op {
        Op::Parameter(_) | Op::Constant(_) | Op::Result => Ok(None),
        Op::Convert { destination } => single(input(0)?.convert(*destination)),
        Op::Add | Op::Subtract | Op::Multiply => {
            let mode = eltwise_mode(op).ok_or_else(|| execution_error!("not an eltwise op"))?;
            let a = input(0)?;
            single(basic::eltwise(mode, a, input(1)?, out_type(0, a.element_type()))?)
        }
        Op::Clamp { min, max } => single(basic::clamp(input(0)?, *min, *max)?),
        Op::Reshape { special_zero } => single(basic::reshape(input(0)?, input(1)?, *special_zero)?),
        Op::Gather { batch_dims } => {
            let axis = scalar_i64(input(2)?, "gather axis")?;
            single(basic::gather(input(0)?, input(1)?, axis, *batch_dims)?)
        }
        Op::Concat { axis } => {
            let rank = input(0)?.shape().len() as i64;
            let axis = if *axis < 0 { axis + rank } else { *axis };
            if axis < 0 {
                return Err(execution_error!("concat axis out of range"));
            }
            single(basic::concat(inputs, axis as usize)?)
        }
        Op::Stft { transpose_frames } => single(stft::stft(
            input(0)?,
            input(1)?,
            scalar_usize(input(2)?, "frame size")?,
            scalar_usize(input(3)?, "frame step")?,
            *transpose_frames,
            out_type(0, ElementType::F32),
        )?),
        Op::Convolution(attrs) => single(convolution::convolution(
            input(0)?,
            input(1)?,
            attrs,
            false,
            out_type(0, ElementType::F32),
        )?),
        Op::GroupConvolution(attrs) => single(convolution::convolution(
            input(0)?,
            input(1)?,
            attrs,
            true,
            out_type(0, ElementType::F32),
        )?),
        Op::ConvolutionCompressed(attrs) => {
            let weights = convolution::dequantize(input(1)?, input(2)?, inputs.get(3).copied())?;
            single(convolution::convolution(
                input(0)?,
                &weights,
                &attrs.conv,
                attrs.has_groups(),
                out_type(0, ElementType::F32),
            )?)
        }
        Op::LstmCell(attrs) => {
            // X, H, C, W, R, B with weights [4h, in].
            let x = input(0)?;
            let proj = basic::fully_connected(x, input(3)?, Some(input(5)?), ElementType::F32)?;
            let (h, c) = recurrent::lstm_cell(
                &proj,
                input(1)?,
                input(2)?,
                input(4)?,
                false,
                attrs,
                LstmWeightsOrder::Fizo,
            )?;
            let shape = input(1)?.shape().to_vec();
            let et = out_type(0, x.element_type());
            Ok(Some(vec![
                Tensor::new(et, shape.clone(), h)?,
                Tensor::new(et, shape, c)?,
            ]))
        }
        Op::LstmSequence(attrs) => Ok(Some(recurrent::lstm_sequence(
            input(0)?,
            input(1)?,
            input(2)?,
            inputs.get(3).copied(),
            input(4)?,
            input(5)?,
            input(6)?,
            false,
            attrs,
            LstmWeightsOrder::Fizo,
            out_type(0, ElementType::F32),
        )?)),
        Op::GruSequence(attrs) => Ok(Some(recurrent::gru_sequence(
            input(0)?,
            input(1)?,
            inputs.get(2).copied(),
            input(3)?,
            input(4)?,
            input(5)?,
            attrs,
            out_type(0, ElementType::F32),
        )?)),
    }
}
