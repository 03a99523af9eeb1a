//! Data-movement and elementwise reference kernels.

use crate::error::ForgeResult;
use crate::execution_error;
use crate::ir::{shape::element_count, ElementType, Tensor};
use crate::program::primitive::{EltwiseMode, LstmWeightsOrder};

/// NumPy broadcast of two static shapes.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> ForgeResult<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(execution_error!("cannot broadcast {:?} with {:?}", a, b)),
        };
    }
    Ok(out)
}

/// Row-major strides of `shape` aligned to `out` rank, zero on broadcast
/// axes.
fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let rank = out.len();
    let mut strides = vec![0; rank];
    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        let axis = i + rank - shape.len();
        strides[axis] = if shape[i] == 1 && out[axis] != 1 { 0 } else { stride };
        stride *= shape[i];
    }
    strides
}

/// Expand `input` to `shape` (which must be a broadcast of it).
pub fn broadcast_to(input: &Tensor, shape: &[usize]) -> ForgeResult<Vec<f32>> {
    let strides = broadcast_strides(input.shape(), shape);
    let count = element_count(shape);
    let data = input.data();
    let mut out = Vec::with_capacity(count);
    let mut index = vec![0usize; shape.len()];
    for _ in 0..count {
        let offset: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
        let value = data
            .get(offset)
            .copied()
            .ok_or_else(|| execution_error!("broadcast of {:?} to {:?} out of range", input.shape(), shape))?;
        out.push(value);
        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Ok(out)
}

pub fn eltwise(mode: EltwiseMode, a: &Tensor, b: &Tensor, output_type: ElementType) -> ForgeResult<Tensor> {
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let lhs = broadcast_to(a, &shape)?;
    let rhs = broadcast_to(b, &shape)?;
    let data = lhs.iter().zip(&rhs).map(|(x, y)| mode.apply(*x, *y)).collect();
    Tensor::new(output_type, shape, data)
}

pub fn clamp(input: &Tensor, min: f32, max: f32) -> ForgeResult<Tensor> {
    let data = input.data().iter().map(|v| v.clamp(min, max)).collect();
    Tensor::new(input.element_type(), input.shape().to_vec(), data)
}

/// Resolve a reshape target against the input shape.
pub fn reshape_target(input: &[usize], target: &[i64], special_zero: bool) -> ForgeResult<Vec<usize>> {
    let mut out = Vec::with_capacity(target.len());
    let mut infer_at = None;
    for (i, &t) in target.iter().enumerate() {
        match t {
            -1 if infer_at.is_none() => {
                infer_at = Some(i);
                out.push(1);
            }
            0 if special_zero => out.push(
                *input
                    .get(i)
                    .ok_or_else(|| execution_error!("reshape: no input dim {} for special zero", i))?,
            ),
            t if t >= 0 => out.push(t as usize),
            _ => return Err(execution_error!("reshape: invalid target {:?}", target)),
        }
    }
    let total = element_count(input);
    if let Some(at) = infer_at {
        let known = element_count(&out);
        if known == 0 || total % known != 0 {
            return Err(execution_error!("reshape: cannot infer -1 in {:?} from {:?}", target, input));
        }
        out[at] = total / known;
    }
    if element_count(&out) != total {
        return Err(execution_error!("reshape: {:?} does not match {:?}", target, input));
    }
    Ok(out)
}

pub fn reshape(input: &Tensor, target: &Tensor, special_zero: bool) -> ForgeResult<Tensor> {
    let shape = reshape_target(input.shape(), &target.as_i64_vec(), special_zero)?;
    input.reshaped(shape)
}

pub fn gather(data: &Tensor, indices: &Tensor, axis: i64, batch_dims: i64) -> ForgeResult<Tensor> {
    let rank = data.shape().len() as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    if axis < 0 || axis >= rank {
        return Err(execution_error!("gather: axis {} out of range for rank {}", axis, rank));
    }
    let axis = axis as usize;
    let batch = if batch_dims < 0 {
        (batch_dims + indices.shape().len() as i64).max(0) as usize
    } else {
        batch_dims as usize
    };
    if batch > axis {
        return Err(execution_error!("gather: batch_dims {} exceeds axis {}", batch, axis));
    }
    let dshape = data.shape();
    let outer: usize = dshape[..batch].iter().product();
    let mid: usize = dshape[batch..axis].iter().product();
    let axis_len = dshape[axis];
    let inner: usize = dshape[axis + 1..].iter().product();
    let per_batch: usize = indices.shape()[batch.min(indices.shape().len())..].iter().product();

    let mut out = Vec::with_capacity(outer * mid * per_batch * inner);
    for b in 0..outer {
        for m in 0..mid {
            for j in 0..per_batch {
                let raw = indices.data()[b * per_batch + j] as i64;
                let index = if raw < 0 { raw + axis_len as i64 } else { raw };
                if index < 0 || index as usize >= axis_len {
                    return Err(execution_error!("gather: index {} out of range {}", raw, axis_len));
                }
                let base = ((b * mid + m) * axis_len + index as usize) * inner;
                out.extend_from_slice(&data.data()[base..base + inner]);
            }
        }
    }
    let mut shape: Vec<usize> = dshape[..axis].to_vec();
    shape.extend_from_slice(&indices.shape()[batch.min(indices.shape().len())..]);
    shape.extend_from_slice(&dshape[axis + 1..]);
    Tensor::new(data.element_type(), shape, out)
}

pub fn concat(inputs: &[&Tensor], axis: usize) -> ForgeResult<Tensor> {
    let first = inputs
        .first()
        .ok_or_else(|| execution_error!("concatenation without inputs"))?;
    let rank = first.shape().len();
    if axis >= rank {
        return Err(execution_error!("concatenation axis {} out of range for rank {}", axis, rank));
    }
    for t in inputs {
        let same = t.shape().len() == rank
            && (0..rank).all(|i| i == axis || t.shape()[i] == first.shape()[i]);
        if !same {
            return Err(execution_error!(
                "concatenation of {:?} and {:?} on axis {}",
                first.shape(),
                t.shape(),
                axis
            ));
        }
    }
    let outer: usize = first.shape()[..axis].iter().product();
    let inner: usize = first.shape()[axis + 1..].iter().product();
    let mut shape = first.shape().to_vec();
    shape[axis] = inputs.iter().map(|t| t.shape().get(axis).copied().unwrap_or(0)).sum();
    let mut out = Vec::with_capacity(element_count(&shape));
    for o in 0..outer {
        for t in inputs {
            let chunk = t.shape()[axis] * inner;
            out.extend_from_slice(&t.data()[o * chunk..(o + 1) * chunk]);
        }
    }
    Tensor::new(first.element_type(), shape, out)
}

pub fn crop(input: &Tensor, axis: usize, offset: usize, size: usize) -> ForgeResult<Tensor> {
    let shape = input.shape();
    if axis >= shape.len() || offset + size > shape[axis] {
        return Err(execution_error!(
            "crop [{}, {}) on axis {} exceeds {:?}",
            offset,
            offset + size,
            axis,
            shape
        ));
    }
    let outer: usize = shape[..axis].iter().product();
    let inner: usize = shape[axis + 1..].iter().product();
    let mut out = Vec::with_capacity(outer * size * inner);
    for o in 0..outer {
        let base = (o * shape[axis] + offset) * inner;
        out.extend_from_slice(&input.data()[base..base + size * inner]);
    }
    let mut out_shape = shape.to_vec();
    out_shape[axis] = size;
    Tensor::new(input.element_type(), out_shape, out)
}

/// Dot product in ascending index order starting from zero. Every
/// projection in the crate goes through here so fused and unrolled
/// recurrent lowerings agree to the bit.
#[inline]
pub(crate) fn dot<F: Fn(usize) -> f32>(x: &[f32], weight: F) -> f32 {
    let mut acc = 0.0f32;
    for (j, v) in x.iter().enumerate() {
        acc += weight(j) * v;
    }
    acc
}

/// `x [.., in] * w[out, in]^T + bias`.
pub fn fully_connected(x: &Tensor, w: &Tensor, bias: Option<&Tensor>, output_type: ElementType) -> ForgeResult<Tensor> {
    let cols = *x
        .shape()
        .last()
        .ok_or_else(|| execution_error!("fully_connected input is a scalar"))?;
    if cols == 0 || w.len() % cols != 0 {
        return Err(execution_error!(
            "fully_connected weights {:?} do not match input {:?}",
            w.shape(),
            x.shape()
        ));
    }
    let rows = w.len() / cols;
    if let Some(b) = bias {
        if b.len() != rows {
            return Err(execution_error!("fully_connected bias has {} values, need {}", b.len(), rows));
        }
    }
    let batch = x.len() / cols;
    let mut out = Vec::with_capacity(batch * rows);
    for n in 0..batch {
        let row = &x.data()[n * cols..(n + 1) * cols];
        for r in 0..rows {
            let mut acc = dot(row, |j| w.data()[r * cols + j]);
            if let Some(b) = bias {
                acc += b.data()[r];
            }
            out.push(acc);
        }
    }
    let mut shape = x.shape()[..x.shape().len() - 1].to_vec();
    shape.push(rows);
    Tensor::new(output_type, shape, out)
}

/// Permute gate blocks along axis 1 of `[dirs, 4 * hidden, ..]`.
pub fn gate_split(input: &Tensor, from: LstmWeightsOrder, to: LstmWeightsOrder) -> ForgeResult<Tensor> {
    let shape = input.shape();
    if shape.len() < 2 || shape[1] % 4 != 0 {
        return Err(execution_error!("gate_split needs [dirs, 4 * hidden, ..], got {:?}", shape));
    }
    let dirs = shape[0];
    let block = shape[1] / 4 * shape[2..].iter().product::<usize>();
    let blocks = to.source_blocks(from);
    let mut out = Vec::with_capacity(input.len());
    for d in 0..dirs {
        let base = d * 4 * block;
        for src in blocks {
            let start = base + src * block;
            out.extend_from_slice(&input.data()[start..start + block]);
        }
    }
    Tensor::new(input.element_type(), shape.to_vec(), out)
}

/// `[dirs, gates * hidden, cols]` to `[1, dirs, cols, gates, hidden]`.
pub fn to_ldigo(input: &Tensor, gates: usize, output_type: ElementType) -> ForgeResult<Tensor> {
    let shape = input.shape();
    if shape.len() != 3 || shape[1] % gates != 0 {
        return Err(execution_error!("ldigo reorder needs [dirs, {} * hidden, cols], got {:?}", gates, shape));
    }
    let (dirs, rows, cols) = (shape[0], shape[1], shape[2]);
    let hidden = rows / gates;
    let mut out = vec![0.0; input.len()];
    for d in 0..dirs {
        for r in 0..rows {
            let (g, k) = (r / hidden, r % hidden);
            for c in 0..cols {
                out[((d * cols + c) * gates + g) * hidden + k] = input.data()[(d * rows + r) * cols + c];
            }
        }
    }
    Tensor::new(output_type, vec![1, dirs, cols, gates, hidden], out)
}
