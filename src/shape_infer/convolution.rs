//! Convolution shape rules (plain, grouped and compressed-weight).

use super::expect_inputs;
use crate::error::ForgeResult;
use crate::ir::{
    CompressedConvolutionAttrs, ConvolutionAttrs, Dimension, ElementType, PadType, PartialShape,
    TensorDesc,
};
use crate::shape_error;

/// Output length of one spatial axis.
fn spatial_output(
    node: &str,
    input: Dimension,
    kernel: Dimension,
    axis: usize,
    attrs: &ConvolutionAttrs,
) -> ForgeResult<Dimension> {
    let stride = attrs.strides[axis] as i64;
    let dilation = attrs.dilations[axis] as i64;
    if stride == 0 || dilation == 0 {
        return Err(shape_error!(node, "strides and dilations must be positive"));
    }
    match attrs.auto_pad {
        PadType::SameUpper | PadType::SameLower => {
            return Ok(input.add_scalar(stride - 1).floor_div(stride));
        }
        PadType::Valid | PadType::Explicit => {}
    }
    let (pad_begin, pad_end) = if attrs.auto_pad == PadType::Valid {
        (0, 0)
    } else {
        (attrs.pads_begin[axis], attrs.pads_end[axis])
    };
    let k = match kernel.get_length() {
        Some(k) => k,
        None => return Ok(Dimension::dynamic()),
    };
    let effective_kernel = dilation * (k - 1) + 1;
    let padded = input.add_scalar(pad_begin + pad_end);
    if let Some(len) = padded.get_length() {
        if len < effective_kernel {
            return Err(shape_error!(
                node,
                "padded input {} is smaller than dilated kernel {} on spatial axis {}",
                len,
                effective_kernel,
                axis
            ));
        }
    }
    Ok(padded
        .add_scalar(-effective_kernel)
        .floor_div(stride)
        .add_scalar(1))
}

fn check_attrs(node: &str, attrs: &ConvolutionAttrs, spatial: usize) -> ForgeResult<()> {
    let explicit = attrs.auto_pad == PadType::Explicit;
    if attrs.strides.len() != spatial
        || attrs.dilations.len() != spatial
        || (explicit && (attrs.pads_begin.len() != spatial || attrs.pads_end.len() != spatial))
    {
        return Err(shape_error!(
            node,
            "convolution attributes do not cover {} spatial axes",
            spatial
        ));
    }
    Ok(())
}

/// Shared rule. `filter_dims` are normalised to `[out_channels, in_channels, k...]`.
fn infer_common(
    node: &str,
    data: &TensorDesc,
    out_channels: Dimension,
    in_channels: Dimension,
    kernel: &[Dimension],
    attrs: &ConvolutionAttrs,
    element_type: ElementType,
) -> ForgeResult<TensorDesc> {
    let data_dims = match data.shape.dims() {
        Some(d) => d,
        None => return Ok(TensorDesc::new(element_type, PartialShape::DynamicRank)),
    };
    if data_dims.len() < 3 {
        return Err(shape_error!(node, "data rank must be at least 3, got {}", data.shape));
    }
    let spatial = data_dims.len() - 2;
    if kernel.len() != spatial {
        return Err(shape_error!(
            node,
            "filter has {} spatial axes, data has {}",
            kernel.len(),
            spatial
        ));
    }
    check_attrs(node, attrs, spatial)?;
    if !data_dims[1].compatible(&in_channels) {
        return Err(shape_error!(
            node,
            "data channels {} do not match filter channels {}",
            data_dims[1],
            in_channels
        ));
    }
    let mut dims = vec![data_dims[0], out_channels];
    for axis in 0..spatial {
        dims.push(spatial_output(node, data_dims[axis + 2], kernel[axis], axis, attrs)?);
    }
    Ok(TensorDesc::new(element_type, PartialShape::Ranked(dims)))
}

fn merged_type(node: &str, a: ElementType, b: ElementType) -> ForgeResult<ElementType> {
    ElementType::merge(a, b)
        .ok_or_else(|| shape_error!(node, "data type {} and filter type {} differ", a, b))
}

pub fn infer_convolution(
    node: &str,
    inputs: &[TensorDesc],
    attrs: &ConvolutionAttrs,
) -> ForgeResult<Vec<TensorDesc>> {
    expect_inputs(node, inputs, 2)?;
    let et = merged_type(node, inputs[0].element_type, inputs[1].element_type)?;
    let filter = match inputs[1].shape.dims() {
        Some(f) => f,
        None => return Ok(vec![TensorDesc::new(et, PartialShape::DynamicRank)]),
    };
    if filter.len() < 3 {
        return Err(shape_error!(node, "filter rank must be at least 3"));
    }
    Ok(vec![infer_common(
        node, &inputs[0], filter[0], filter[1], &filter[2..], attrs, et,
    )?])
}

/// Filters are `[groups, out/groups, in/groups, k...]`.
fn grouped_filter(node: &str, filter: &[Dimension]) -> ForgeResult<(Dimension, Dimension, Vec<Dimension>)> {
    if filter.len() < 4 {
        return Err(shape_error!(node, "grouped filter rank must be at least 4"));
    }
    let groups = filter[0];
    Ok((
        groups.mul(&filter[1]),
        groups.mul(&filter[2]),
        filter[3..].to_vec(),
    ))
}

pub fn infer_group_convolution(
    node: &str,
    inputs: &[TensorDesc],
    attrs: &ConvolutionAttrs,
) -> ForgeResult<Vec<TensorDesc>> {
    expect_inputs(node, inputs, 2)?;
    let et = merged_type(node, inputs[0].element_type, inputs[1].element_type)?;
    let filter = match inputs[1].shape.dims() {
        Some(f) => f,
        None => return Ok(vec![TensorDesc::new(et, PartialShape::DynamicRank)]),
    };
    let (out_channels, in_channels, kernel) = grouped_filter(node, filter)?;
    Ok(vec![infer_common(
        node, &inputs[0], out_channels, in_channels, &kernel, attrs, et,
    )?])
}

/// Inputs are `(data, weights, scale[, zero_point])`.
pub fn infer_compressed(
    node: &str,
    inputs: &[TensorDesc],
    attrs: &CompressedConvolutionAttrs,
) -> ForgeResult<Vec<TensorDesc>> {
    if inputs.len() != 3 && inputs.len() != 4 {
        return Err(shape_error!(node, "expected 3 or 4 inputs, got {}", inputs.len()));
    }
    let data_type = inputs[0].element_type;
    let et = match attrs.output_type {
        Some(t) => t,
        None => match ElementType::merge(data_type, inputs[1].element_type) {
            Some(t) if t.is_real() => t,
            _ if data_type.is_real() => data_type,
            _ => ElementType::F32,
        },
    };
    let filter = match inputs[1].shape.dims() {
        Some(f) => f,
        None => return Ok(vec![TensorDesc::new(et, PartialShape::DynamicRank)]),
    };
    let out = if attrs.has_groups() {
        let (out_channels, in_channels, kernel) = grouped_filter(node, filter)?;
        if !filter[0].compatible(&Dimension::fixed(attrs.groups)) {
            return Err(shape_error!(
                node,
                "filter groups {} differ from attribute {}",
                filter[0],
                attrs.groups
            ));
        }
        infer_common(node, &inputs[0], out_channels, in_channels, &kernel, &attrs.conv, et)?
    } else {
        if filter.len() < 3 {
            return Err(shape_error!(node, "filter rank must be at least 3"));
        }
        infer_common(node, &inputs[0], filter[0], filter[1], &filter[2..], &attrs.conv, et)?
    };
    Ok(vec![out])
}
