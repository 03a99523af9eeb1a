//! Shape rules for the small operators: elementwise arithmetic, clamp,
//! reshape, gather and concat.

use super::{expect_inputs, expect_rank, ConstantAccessor};
use crate::error::ForgeResult;
use crate::ir::{Dimension, ElementType, PartialShape, TensorDesc};
use crate::shape_error;

pub fn infer_eltwise(node: &str, inputs: &[TensorDesc]) -> ForgeResult<Vec<TensorDesc>> {
    expect_inputs(node, inputs, 2)?;
    let et = ElementType::merge(inputs[0].element_type, inputs[1].element_type).ok_or_else(|| {
        shape_error!(
            node,
            "element types {} and {} do not match",
            inputs[0].element_type,
            inputs[1].element_type
        )
    })?;
    let shape = inputs[0].shape.broadcast(&inputs[1].shape).ok_or_else(|| {
        shape_error!(
            node,
            "shapes {} and {} are not broadcastable",
            inputs[0].shape,
            inputs[1].shape
        )
    })?;
    Ok(vec![TensorDesc::new(et, shape)])
}

pub fn infer_clamp(node: &str, inputs: &[TensorDesc], min: f32, max: f32) -> ForgeResult<Vec<TensorDesc>> {
    expect_inputs(node, inputs, 1)?;
    if min > max {
        return Err(shape_error!(node, "clamp min {} exceeds max {}", min, max));
    }
    Ok(vec![inputs[0].clone()])
}

pub fn infer_reshape(
    node: &str,
    inputs: &[TensorDesc],
    constants: &dyn ConstantAccessor,
    special_zero: bool,
) -> ForgeResult<Vec<TensorDesc>> {
    expect_inputs(node, inputs, 2)?;
    expect_rank(node, "target shape", &inputs[1], 1)?;
    let et = inputs[0].element_type;

    let target = match constants.constant(1) {
        Some(t) => t.as_i64_vec(),
        None => {
            let shape = match inputs[1].shape.dim(0).and_then(|d| d.get_length()) {
                Some(rank) => PartialShape::dynamic_of_rank(rank as usize),
                None => PartialShape::DynamicRank,
            };
            return Ok(vec![TensorDesc::new(et, shape)]);
        }
    };

    let input_dims = inputs[0].shape.dims();
    let mut dims = Vec::with_capacity(target.len());
    let mut infer_at = None;
    for (i, &value) in target.iter().enumerate() {
        match value {
            -1 => {
                if infer_at.is_some() {
                    return Err(shape_error!(node, "more than one -1 in target shape {:?}", target));
                }
                infer_at = Some(i);
                dims.push(Dimension::dynamic());
            }
            0 if special_zero => {
                let copied = input_dims
                    .map(|d| {
                        d.get(i).copied().ok_or_else(|| {
                            shape_error!(node, "special zero at {} exceeds input rank", i)
                        })
                    })
                    .transpose()?
                    .unwrap_or_else(Dimension::dynamic);
                dims.push(copied);
            }
            v if v < -1 => {
                return Err(shape_error!(node, "invalid target dimension {}", v));
            }
            v => dims.push(Dimension::fixed(v)),
        }
    }

    let input_count = inputs[0].shape.element_count();
    match (infer_at, input_count) {
        (Some(at), Some(total)) => {
            let known: Option<i64> = dims
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != at)
                .map(|(_, d)| d.get_length())
                .product();
            if let Some(known) = known {
                if known == 0 || total as i64 % known != 0 {
                    return Err(shape_error!(
                        node,
                        "cannot reshape {} into {:?}",
                        inputs[0].shape,
                        target
                    ));
                }
                dims[at] = Dimension::fixed(total as i64 / known);
            }
        }
        (None, Some(total)) => {
            let out: Option<i64> = dims.iter().map(|d| d.get_length()).product();
            if let Some(out) = out {
                if out as usize != total {
                    return Err(shape_error!(
                        node,
                        "cannot reshape {} ({} elements) into {:?}",
                        inputs[0].shape,
                        total,
                        target
                    ));
                }
            }
        }
        _ => {}
    }
    Ok(vec![TensorDesc::new(et, PartialShape::Ranked(dims))])
}

pub(crate) fn normalize_axis(node: &str, axis: i64, rank: usize) -> ForgeResult<usize> {
    let r = rank as i64;
    let normalized = if axis < 0 { axis + r } else { axis };
    if normalized < 0 || normalized >= r.max(1) {
        return Err(shape_error!(node, "axis {} out of range for rank {}", axis, rank));
    }
    Ok(normalized as usize)
}

pub fn infer_gather(
    node: &str,
    inputs: &[TensorDesc],
    constants: &dyn ConstantAccessor,
    batch_dims: i64,
) -> ForgeResult<Vec<TensorDesc>> {
    expect_inputs(node, inputs, 3)?;
    let et = inputs[0].element_type;
    let idx_type = inputs[1].element_type;
    if !(idx_type.is_integral() || idx_type.is_dynamic()) {
        return Err(shape_error!(node, "indices must be integral, got {}", idx_type));
    }
    let axis = match constants.constant(2).and_then(|t| t.scalar_value()) {
        Some(a) => a as i64,
        None => return Ok(vec![TensorDesc::new(et, PartialShape::DynamicRank)]),
    };
    let (data, indices) = match (inputs[0].shape.dims(), inputs[1].shape.dims()) {
        (Some(d), Some(i)) => (d, i),
        _ => return Ok(vec![TensorDesc::new(et, PartialShape::DynamicRank)]),
    };
    let axis = normalize_axis(node, axis, data.len())?;
    let batch = if batch_dims < 0 {
        batch_dims + indices.len() as i64
    } else {
        batch_dims
    };
    if batch < 0 || batch as usize > axis || batch as usize > indices.len() {
        return Err(shape_error!(
            node,
            "batch_dims {} invalid for axis {} and indices rank {}",
            batch_dims,
            axis,
            indices.len()
        ));
    }
    let batch = batch as usize;
    let mut out = Vec::new();
    out.extend_from_slice(&data[..axis]);
    out.extend_from_slice(&indices[batch..]);
    out.extend_from_slice(&data[axis + 1..]);
    Ok(vec![TensorDesc::new(et, PartialShape::Ranked(out))])
}

pub fn infer_concat(node: &str, inputs: &[TensorDesc], axis: i64) -> ForgeResult<Vec<TensorDesc>> {
    if inputs.is_empty() {
        return Err(shape_error!(node, "concat needs at least one input"));
    }
    let mut et = ElementType::Dynamic;
    for input in inputs {
        et = ElementType::merge(et, input.element_type).ok_or_else(|| {
            shape_error!(node, "mixed element types in concat")
        })?;
    }
    let rank = match inputs.iter().find_map(|i| i.shape.rank()) {
        Some(r) => r,
        None => return Ok(vec![TensorDesc::new(et, PartialShape::DynamicRank)]),
    };
    let axis = normalize_axis(node, axis, rank)?;
    let mut out: Option<Vec<Dimension>> = None;
    for input in inputs {
        let dims = match input.shape.dims() {
            Some(d) => d,
            None => {
                let mut widened = out.unwrap_or_else(|| vec![Dimension::dynamic(); rank]);
                widened[axis] = Dimension::dynamic();
                out = Some(widened);
                continue;
            }
        };
        if dims.len() != rank {
            return Err(shape_error!(node, "concat inputs have ranks {} and {}", rank, dims.len()));
        }
        out = Some(match out {
            None => dims.to_vec(),
            Some(acc) => {
                let mut next = Vec::with_capacity(rank);
                for (i, (a, b)) in acc.iter().zip(dims.iter()).enumerate() {
                    if i == axis {
                        next.push(a.add(b));
                    } else {
                        next.push(a.merge(b).ok_or_else(|| {
                            shape_error!(node, "concat dimension {} mismatch: {} vs {}", i, a, b)
                        })?);
                    }
                }
                next
            }
        });
    }
    let dims = out.unwrap_or_else(|| vec![Dimension::dynamic(); rank]);
    Ok(vec![TensorDesc::new(et, PartialShape::Ranked(dims))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Tensor;
    use crate::shape_infer::{ConstantList, NoConstants};

    fn f32s(dims: &[usize]) -> TensorDesc {
        TensorDesc::with_static(ElementType::F32, dims)
    }

    #[test]
    fn test_reshape_with_minus_one_and_zero() {
        let target = Tensor::from_i64(ElementType::I64, vec![3], &[0, -1, 2]).unwrap();
        let consts = [None, Some(&target)];
        let out = infer_reshape(
            "r",
            &[f32s(&[4, 6, 2]), TensorDesc::with_static(ElementType::I64, &[3])],
            &ConstantList(&consts),
            true,
        )
        .unwrap();
        assert_eq!(out[0].shape, PartialShape::from_static(&[4, 6, 2]));
    }

    #[test]
    fn test_reshape_without_constant_keeps_rank() {
        let out = infer_reshape(
            "r",
            &[f32s(&[27]), TensorDesc::with_static(ElementType::I64, &[3])],
            &NoConstants,
            false,
        )
        .unwrap();
        assert_eq!(out[0].shape, PartialShape::dynamic_of_rank(3));
    }

    #[test]
    fn test_reshape_element_mismatch() {
        let target = Tensor::from_i64(ElementType::I64, vec![2], &[5, 5]).unwrap();
        let consts = [None, Some(&target)];
        assert!(infer_reshape(
            "r",
            &[f32s(&[27]), TensorDesc::with_static(ElementType::I64, &[2])],
            &ConstantList(&consts),
            false
        )
        .is_err());
    }

    #[test]
    fn test_gather_shape() {
        let axis = Tensor::scalar(ElementType::I64, 0.0);
        let consts = [None, None, Some(&axis)];
        let out = infer_gather(
            "g",
            &[
                f32s(&[4, 8]),
                TensorDesc::with_static(ElementType::U4, &[3]),
                TensorDesc::with_static(ElementType::I64, &[]),
            ],
            &ConstantList(&consts),
            0,
        )
        .unwrap();
        assert_eq!(out[0].shape, PartialShape::from_static(&[3, 8]));
    }

    #[test]
    fn test_concat_sums_axis() {
        let out = infer_concat("c", &[f32s(&[2, 1, 3]), f32s(&[2, 4, 3])], 1).unwrap();
        assert_eq!(out[0].shape, PartialShape::from_static(&[2, 5, 3]));
        assert!(infer_concat("c", &[f32s(&[2, 1, 3]), f32s(&[3, 4, 3])], 1).is_err());
    }

    #[test]
    fn test_eltwise_type_mismatch() {
        let err = infer_eltwise(
            "e",
            &[f32s(&[2]), TensorDesc::with_static(ElementType::F16, &[2])],
        )
        .unwrap_err();
        assert!(err.to_string().contains("element types"));
    }
}
