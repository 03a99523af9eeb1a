//! Little-endian codec for compiled programs.
//!
//! Layout of a blob:
//!
//! ```text
//! u32 magic "GFPC" | u32 version | str device signature | u64 graph fingerprint
//! u64 skipped reorders
//! u64 buffer count   { u8 kind | layout | u8 has_data [tensor] }
//! u64 instance count { str id | primitive | str implementation
//!                      layouts in | layouts out | handles in | handles out
//!                      handles deps | u64 len blob }
//! u64 input count    { str name | u64 handle | layout }
//! u64 output count   { str name | u64 handle | layout }
//! ```
//!
//! Strings and byte blobs are `u64` length-prefixed. Malformed data and
//! truncated blobs decode to `CacheMismatch`.

use crate::error::{ForgeResult, GraphForgeError};
use crate::ir::{
    ConvolutionAttrs, Dimension, ElementType, GruSequenceAttrs, PadType, PartialShape, RecurrentActivation,
    RecurrentAttrs, RecurrentDirection, SequenceAttrs, Tensor,
};
use crate::program::memory::{BufferInfo, BufferKind, MemoryHandle};
use crate::program::primitive::{EltwiseMode, LstmWeightsOrder, Primitive, PrimitiveKind};
use crate::registry::{Format, LayoutDesc};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// "GFPC" read as a little-endian `u32`.
pub const MAGIC: u32 = 0x4350_4647;
pub const VERSION: u32 = 1;

const NONE_TAG: u8 = 0xff;
/// Longest string or blob accepted when decoding.
const MAX_LEN: u64 = 1 << 32;

fn mismatch(what: impl Into<String>) -> GraphForgeError {
    GraphForgeError::CacheMismatch(what.into())
}

/// Truncation means a stale or corrupt blob, not an I/O failure.
pub(crate) fn read_error(err: io::Error) -> GraphForgeError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        mismatch("blob is truncated")
    } else {
        GraphForgeError::Io(err)
    }
}

pub(crate) struct Encoder<W: Write> {
    out: W,
}

impl<W: Write> Encoder<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn u8(&mut self, v: u8) -> ForgeResult<()> {
        Ok(self.out.write_u8(v)?)
    }

    pub fn u32(&mut self, v: u32) -> ForgeResult<()> {
        Ok(self.out.write_u32::<LittleEndian>(v)?)
    }

    pub fn u64(&mut self, v: u64) -> ForgeResult<()> {
        Ok(self.out.write_u64::<LittleEndian>(v)?)
    }

    pub fn usize(&mut self, v: usize) -> ForgeResult<()> {
        self.u64(v as u64)
    }

    pub fn i64(&mut self, v: i64) -> ForgeResult<()> {
        Ok(self.out.write_i64::<LittleEndian>(v)?)
    }

    pub fn f32(&mut self, v: f32) -> ForgeResult<()> {
        Ok(self.out.write_f32::<LittleEndian>(v)?)
    }

    pub fn bool(&mut self, v: bool) -> ForgeResult<()> {
        self.u8(v as u8)
    }

    pub fn bytes(&mut self, v: &[u8]) -> ForgeResult<()> {
        self.usize(v.len())?;
        Ok(self.out.write_all(v)?)
    }

    pub fn str(&mut self, v: &str) -> ForgeResult<()> {
        self.bytes(v.as_bytes())
    }

    pub fn shape(&mut self, shape: &PartialShape) -> ForgeResult<()> {
        match shape.dims() {
            None => self.u8(0),
            Some(dims) => {
                self.u8(1)?;
                self.usize(dims.len())?;
                for dim in dims {
                    self.i64(dim.min_length())?;
                    self.i64(dim.max_length().unwrap_or(-1))?;
                }
                Ok(())
            }
        }
    }

    pub fn layout(&mut self, layout: &LayoutDesc) -> ForgeResult<()> {
        self.u8(layout.element_type.to_tag())?;
        self.u8(layout.format.to_tag())?;
        self.shape(&layout.shape)
    }

    pub fn layouts(&mut self, layouts: &[LayoutDesc]) -> ForgeResult<()> {
        self.usize(layouts.len())?;
        layouts.iter().try_for_each(|l| self.layout(l))
    }

    pub fn handles(&mut self, handles: &[MemoryHandle]) -> ForgeResult<()> {
        self.usize(handles.len())?;
        handles.iter().try_for_each(|h| self.usize(h.index()))
    }

    pub fn tensor(&mut self, tensor: &Tensor) -> ForgeResult<()> {
        self.u8(tensor.element_type().to_tag())?;
        self.usize(tensor.shape().len())?;
        for dim in tensor.shape() {
            self.usize(*dim)?;
        }
        self.usize(tensor.len())?;
        tensor.data().iter().try_for_each(|v| self.f32(*v))
    }

    pub fn buffer(&mut self, buffer: &BufferInfo) -> ForgeResult<()> {
        self.u8(buffer.kind.to_tag())?;
        self.layout(&buffer.layout)?;
        match &buffer.data {
            Some(t) => {
                self.u8(1)?;
                self.tensor(t)
            }
            None => self.u8(0),
        }
    }

    fn element_type_opt(&mut self, et: Option<ElementType>) -> ForgeResult<()> {
        self.u8(et.map(|e| e.to_tag()).unwrap_or(NONE_TAG))
    }

    fn convolution(&mut self, attrs: &ConvolutionAttrs) -> ForgeResult<()> {
        self.usize(attrs.strides.len())?;
        attrs.strides.iter().try_for_each(|v| self.usize(*v))?;
        self.usize(attrs.pads_begin.len())?;
        attrs.pads_begin.iter().try_for_each(|v| self.i64(*v))?;
        self.usize(attrs.pads_end.len())?;
        attrs.pads_end.iter().try_for_each(|v| self.i64(*v))?;
        self.usize(attrs.dilations.len())?;
        attrs.dilations.iter().try_for_each(|v| self.usize(*v))?;
        self.u8(attrs.auto_pad.to_tag())
    }

    fn recurrent(&mut self, attrs: &RecurrentAttrs) -> ForgeResult<()> {
        self.usize(attrs.hidden_size)?;
        self.usize(attrs.activations.len())?;
        attrs.activations.iter().try_for_each(|a| self.u8(a.to_tag()))?;
        self.usize(attrs.activations_alpha.len())?;
        attrs.activations_alpha.iter().try_for_each(|v| self.f32(*v))?;
        self.usize(attrs.activations_beta.len())?;
        attrs.activations_beta.iter().try_for_each(|v| self.f32(*v))?;
        self.f32(attrs.clip)
    }

    fn sequence(&mut self, attrs: &SequenceAttrs) -> ForgeResult<()> {
        self.recurrent(&attrs.cell)?;
        self.u8(attrs.direction.to_tag())
    }

    pub fn primitive(&mut self, primitive: &Primitive) -> ForgeResult<()> {
        self.u8(kind_tag(primitive.kind()))?;
        match primitive {
            Primitive::Input
            | Primitive::FullyConnected
            | Primitive::MutableData
            | Primitive::Reorder => Ok(()),
            Primitive::Data(t) => self.tensor(t),
            Primitive::Convert { destination } => self.u8(destination.to_tag()),
            Primitive::Eltwise(mode) => self.u8(mode.to_tag()),
            Primitive::Clamp { min, max } => {
                self.f32(*min)?;
                self.f32(*max)
            }
            Primitive::Reshape { special_zero } => self.bool(*special_zero),
            Primitive::Gather { batch_dims } => self.i64(*batch_dims),
            Primitive::Concatenation { axis } => self.usize(*axis),
            Primitive::Crop { axis, offset, size } => {
                self.usize(*axis)?;
                self.usize(*offset)?;
                self.usize(*size)
            }
            Primitive::Stft { transpose_frames } => self.bool(*transpose_frames),
            Primitive::Convolution {
                attrs,
                grouped,
                compressed,
                output_type,
            } => {
                self.convolution(attrs)?;
                self.bool(*grouped)?;
                self.bool(*compressed)?;
                self.element_type_opt(*output_type)
            }
            Primitive::LstmCell { cell, order } => {
                self.recurrent(cell)?;
                self.u8(order.to_tag())
            }
            Primitive::LstmSeq { seq, order } => {
                self.sequence(seq)?;
                self.u8(order.to_tag())
            }
            Primitive::GruSeq(attrs) => {
                self.sequence(&attrs.seq)?;
                self.bool(attrs.linear_before_reset)
            }
            Primitive::GateSplit { from, to } => {
                self.u8(from.to_tag())?;
                self.u8(to.to_tag())
            }
        }
    }

    pub fn finish(mut self) -> ForgeResult<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

fn kind_tag(kind: PrimitiveKind) -> u8 {
    PrimitiveKind::ALL.iter().position(|k| *k == kind).unwrap_or(0) as u8
}

pub(crate) struct Decoder<R: Read> {
    input: R,
}

impl<R: Read> Decoder<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    pub fn u8(&mut self) -> ForgeResult<u8> {
        self.input.read_u8().map_err(read_error)
    }

    pub fn u32(&mut self) -> ForgeResult<u32> {
        self.input.read_u32::<LittleEndian>().map_err(read_error)
    }

    pub fn u64(&mut self) -> ForgeResult<u64> {
        self.input.read_u64::<LittleEndian>().map_err(read_error)
    }

    pub fn usize(&mut self) -> ForgeResult<usize> {
        let v = self.u64()?;
        usize::try_from(v).map_err(|_| mismatch(format!("value {} does not fit in usize", v)))
    }

    /// A count or length, bounded so a corrupt prefix cannot request an
    /// absurd allocation.
    pub fn len(&mut self) -> ForgeResult<usize> {
        let v = self.u64()?;
        if v > MAX_LEN {
            return Err(mismatch(format!("length {} is out of range", v)));
        }
        Ok(v as usize)
    }

    pub fn i64(&mut self) -> ForgeResult<i64> {
        self.input.read_i64::<LittleEndian>().map_err(read_error)
    }

    pub fn f32(&mut self) -> ForgeResult<f32> {
        self.input.read_f32::<LittleEndian>().map_err(read_error)
    }

    pub fn bool(&mut self) -> ForgeResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(mismatch(format!("invalid bool {}", other))),
        }
    }

    pub fn bytes(&mut self) -> ForgeResult<Vec<u8>> {
        let len = self.len()?;
        // Grow with the data actually present, never with the claimed length.
        let mut buf = Vec::new();
        (&mut self.input)
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(read_error)?;
        if buf.len() != len {
            return Err(mismatch("blob is truncated"));
        }
        Ok(buf)
    }

    pub fn string(&mut self) -> ForgeResult<String> {
        String::from_utf8(self.bytes()?).map_err(|_| mismatch("string is not utf-8"))
    }

    fn tag<T>(&mut self, what: &str, decode: impl FnOnce(u8) -> Option<T>) -> ForgeResult<T> {
        let tag = self.u8()?;
        decode(tag).ok_or_else(|| mismatch(format!("unknown {} tag {}", what, tag)))
    }

    fn vec<T>(&mut self, mut item: impl FnMut(&mut Self) -> ForgeResult<T>) -> ForgeResult<Vec<T>> {
        let len = self.len()?;
        (0..len).map(|_| item(self)).collect()
    }

    pub fn element_type(&mut self) -> ForgeResult<ElementType> {
        self.tag("element type", ElementType::from_tag)
    }

    pub fn shape(&mut self) -> ForgeResult<PartialShape> {
        if !self.bool()? {
            return Ok(PartialShape::DynamicRank);
        }
        let dims = self.vec(|d| {
            let min = d.i64()?;
            let max = d.i64()?;
            Ok(if max < 0 {
                Dimension::at_least(min)
            } else {
                Dimension::bounded(min, max)
            })
        })?;
        Ok(PartialShape::from(dims))
    }

    pub fn layout(&mut self) -> ForgeResult<LayoutDesc> {
        let element_type = self.element_type()?;
        let format = self.tag("format", Format::from_tag)?;
        let shape = self.shape()?;
        Ok(LayoutDesc::new(element_type, format, shape))
    }

    pub fn layouts(&mut self) -> ForgeResult<Vec<LayoutDesc>> {
        self.vec(Self::layout)
    }

    pub fn handle(&mut self) -> ForgeResult<MemoryHandle> {
        Ok(MemoryHandle(self.usize()?))
    }

    pub fn handles(&mut self) -> ForgeResult<Vec<MemoryHandle>> {
        self.vec(Self::handle)
    }

    pub fn tensor(&mut self) -> ForgeResult<Tensor> {
        let element_type = self.element_type()?;
        let shape: Vec<usize> = self.vec(Self::usize)?;
        let data = self.vec(Self::f32)?;
        let elements = shape.iter().try_fold(1usize, |n, d| n.checked_mul(*d));
        if elements != Some(data.len()) {
            return Err(mismatch(format!(
                "constant of shape {:?} holds {} values",
                shape,
                data.len()
            )));
        }
        Tensor::new(element_type, shape, data).map_err(|e| mismatch(format!("bad constant: {}", e)))
    }

    pub fn buffer(&mut self) -> ForgeResult<BufferInfo> {
        let kind = self.tag("buffer kind", BufferKind::from_tag)?;
        let layout = self.layout()?;
        let data = if self.bool()? { Some(self.tensor()?) } else { None };
        Ok(BufferInfo { layout, kind, data })
    }

    fn element_type_opt(&mut self) -> ForgeResult<Option<ElementType>> {
        match self.u8()? {
            NONE_TAG => Ok(None),
            tag => ElementType::from_tag(tag)
                .map(Some)
                .ok_or_else(|| mismatch(format!("unknown element type tag {}", tag))),
        }
    }

    fn convolution(&mut self) -> ForgeResult<ConvolutionAttrs> {
        Ok(ConvolutionAttrs {
            strides: self.vec(Self::usize)?,
            pads_begin: self.vec(Self::i64)?,
            pads_end: self.vec(Self::i64)?,
            dilations: self.vec(Self::usize)?,
            auto_pad: self.tag("pad type", PadType::from_tag)?,
        })
    }

    fn recurrent(&mut self) -> ForgeResult<RecurrentAttrs> {
        Ok(RecurrentAttrs {
            hidden_size: self.usize()?,
            activations: self.vec(|d| d.tag("activation", RecurrentActivation::from_tag))?,
            activations_alpha: self.vec(Self::f32)?,
            activations_beta: self.vec(Self::f32)?,
            clip: self.f32()?,
        })
    }

    fn sequence(&mut self) -> ForgeResult<SequenceAttrs> {
        Ok(SequenceAttrs {
            cell: self.recurrent()?,
            direction: self.tag("direction", RecurrentDirection::from_tag)?,
        })
    }

    fn order(&mut self) -> ForgeResult<LstmWeightsOrder> {
        self.tag("gate order", LstmWeightsOrder::from_tag)
    }

    pub fn primitive(&mut self) -> ForgeResult<Primitive> {
        let kind = self.tag("primitive", |t| PrimitiveKind::ALL.get(t as usize).copied())?;
        Ok(match kind {
            PrimitiveKind::Input => Primitive::Input,
            PrimitiveKind::FullyConnected => Primitive::FullyConnected,
            PrimitiveKind::MutableData => Primitive::MutableData,
            PrimitiveKind::Reorder => Primitive::Reorder,
            PrimitiveKind::Data => Primitive::Data(self.tensor()?),
            PrimitiveKind::Convert => Primitive::Convert {
                destination: self.element_type()?,
            },
            PrimitiveKind::Eltwise => Primitive::Eltwise(self.tag("eltwise mode", EltwiseMode::from_tag)?),
            PrimitiveKind::Clamp => Primitive::Clamp {
                min: self.f32()?,
                max: self.f32()?,
            },
            PrimitiveKind::Reshape => Primitive::Reshape {
                special_zero: self.bool()?,
            },
            PrimitiveKind::Gather => Primitive::Gather {
                batch_dims: self.i64()?,
            },
            PrimitiveKind::Concatenation => Primitive::Concatenation { axis: self.usize()? },
            PrimitiveKind::Crop => Primitive::Crop {
                axis: self.usize()?,
                offset: self.usize()?,
                size: self.usize()?,
            },
            PrimitiveKind::Stft => Primitive::Stft {
                transpose_frames: self.bool()?,
            },
            PrimitiveKind::Convolution => Primitive::Convolution {
                attrs: self.convolution()?,
                grouped: self.bool()?,
                compressed: self.bool()?,
                output_type: self.element_type_opt()?,
            },
            PrimitiveKind::LstmCell => Primitive::LstmCell {
                cell: self.recurrent()?,
                order: self.order()?,
            },
            PrimitiveKind::LstmSeq => Primitive::LstmSeq {
                seq: self.sequence()?,
                order: self.order()?,
            },
            PrimitiveKind::GruSeq => Primitive::GruSeq(GruSequenceAttrs {
                seq: self.sequence()?,
                linear_before_reset: self.bool()?,
            }),
            PrimitiveKind::GateSplit => Primitive::GateSplit {
                from: self.order()?,
                to: self.order()?,
            },
        })
    }
}
