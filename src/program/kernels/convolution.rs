//! Direct N-d convolution.

use super::basic::{broadcast_shape, broadcast_to};
use crate::error::ForgeResult;
use crate::execution_error;
use crate::ir::{ConvolutionAttrs, ElementType, PadType, Tensor};

/// Begin/end padding per spatial axis after auto-pad resolution.
pub fn resolve_pads(
    attrs: &ConvolutionAttrs,
    input: &[usize],
    kernel: &[usize],
) -> (Vec<usize>, Vec<usize>) {
    let spatial = input.len();
    let mut begin = vec![0; spatial];
    let mut end = vec![0; spatial];
    for i in 0..spatial {
        let stride = attrs.strides.get(i).copied().unwrap_or(1).max(1);
        let dilation = attrs.dilations.get(i).copied().unwrap_or(1).max(1);
        let effective = (kernel[i].saturating_sub(1)) * dilation + 1;
        match attrs.auto_pad {
            PadType::Explicit => {
                begin[i] = attrs.pads_begin.get(i).copied().unwrap_or(0).max(0) as usize;
                end[i] = attrs.pads_end.get(i).copied().unwrap_or(0).max(0) as usize;
            }
            PadType::Valid => {}
            PadType::SameUpper | PadType::SameLower => {
                let out = (input[i] + stride - 1) / stride;
                let total = ((out.max(1) - 1) * stride + effective).saturating_sub(input[i]);
                let (small, large) = (total / 2, total - total / 2);
                if attrs.auto_pad == PadType::SameUpper {
                    begin[i] = small;
                    end[i] = large;
                } else {
                    begin[i] = large;
                    end[i] = small;
                }
            }
        }
    }
    (begin, end)
}

/// `(weights - zero_point) * scale`, broadcast onto the weights shape.
pub fn dequantize(weights: &Tensor, scale: &Tensor, zero_point: Option<&Tensor>) -> ForgeResult<Tensor> {
    let shape = weights.shape().to_vec();
    let check = |t: &Tensor| -> ForgeResult<()> {
        if broadcast_shape(&shape, t.shape())? != shape {
            return Err(execution_error!(
                "dequantization parameter {:?} does not broadcast to weights {:?}",
                t.shape(),
                shape
            ));
        }
        Ok(())
    };
    check(scale)?;
    let scale = broadcast_to(scale, &shape)?;
    let zp = match zero_point {
        Some(zp) => {
            check(zp)?;
            Some(broadcast_to(zp, &shape)?)
        }
        None => None,
    };
    let data = weights
        .data()
        .iter()
        .enumerate()
        .map(|(i, w)| {
            let shifted = match &zp {
                Some(zp) => w - zp[i],
                None => *w,
            };
            shifted * scale[i]
        })
        .collect();
    Tensor::new(ElementType::F32, shape, data)
}

/// Convolution over `data [N, C, spatial..]`.
///
/// Ungrouped filters are `[O, C, k..]`; grouped filters are
/// `[G, O/G, C/G, k..]`.
pub fn convolution(
    data: &Tensor,
    filter: &Tensor,
    attrs: &ConvolutionAttrs,
    grouped: bool,
    output_type: ElementType,
) -> ForgeResult<Tensor> {
    let dshape = data.shape();
    let fshape = filter.shape();
    if dshape.len() < 3 {
        return Err(execution_error!("convolution data rank {} < 3", dshape.len()));
    }
    let spatial = dshape.len() - 2;
    let (groups, out_per_group, in_per_group, kernel) = if grouped {
        if fshape.len() != spatial + 3 {
            return Err(execution_error!("grouped filter {:?} for data {:?}", fshape, dshape));
        }
        (fshape[0], fshape[1], fshape[2], fshape[3..].to_vec())
    } else {
        if fshape.len() != spatial + 2 {
            return Err(execution_error!("filter {:?} for data {:?}", fshape, dshape));
        }
        (1, fshape[0], fshape[1], fshape[2..].to_vec())
    };
    let (batch, channels) = (dshape[0], dshape[1]);
    if groups == 0 || channels != groups * in_per_group {
        return Err(execution_error!(
            "convolution: {} input channels, filter expects {} x {}",
            channels,
            groups,
            in_per_group
        ));
    }
    let input = &dshape[2..];
    let (pads_begin, pads_end) = resolve_pads(attrs, input, &kernel);
    let strides: Vec<usize> = (0..spatial).map(|i| attrs.strides.get(i).copied().unwrap_or(1).max(1)).collect();
    let dilations: Vec<usize> = (0..spatial).map(|i| attrs.dilations.get(i).copied().unwrap_or(1).max(1)).collect();
    let mut output = Vec::with_capacity(spatial);
    for i in 0..spatial {
        let padded = input[i] + pads_begin[i] + pads_end[i];
        let effective = (kernel[i].saturating_sub(1)) * dilations[i] + 1;
        if padded < effective {
            return Err(execution_error!("convolution kernel {:?} larger than padded input", kernel));
        }
        output.push((padded - effective) / strides[i] + 1);
    }

    let out_channels = groups * out_per_group;
    let out_spatial: usize = output.iter().product();
    let in_spatial: usize = input.iter().product();
    let kernel_size: usize = kernel.iter().product();
    let mut out = vec![0.0f32; batch * out_channels * out_spatial];

    let mut out_pos = vec![0usize; spatial];
    let mut k_pos = vec![0usize; spatial];
    for n in 0..batch {
        for g in 0..groups {
            for oc in 0..out_per_group {
                let o = g * out_per_group + oc;
                for flat in 0..out_spatial {
                    unravel(flat, &output, &mut out_pos);
                    let mut acc = 0.0f32;
                    for ic in 0..in_per_group {
                        let c = g * in_per_group + ic;
                        let filter_base = ((g * out_per_group + oc) * in_per_group + ic) * kernel_size;
                        'taps: for kflat in 0..kernel_size {
                            unravel(kflat, &kernel, &mut k_pos);
                            let mut offset = 0usize;
                            for i in 0..spatial {
                                let pos = (out_pos[i] * strides[i] + k_pos[i] * dilations[i]) as isize
                                    - pads_begin[i] as isize;
                                if pos < 0 || pos as usize >= input[i] {
                                    continue 'taps;
                                }
                                offset = offset * input[i] + pos as usize;
                            }
                            let x = data.data()[(n * channels + c) * in_spatial + offset];
                            acc += x * filter.data()[filter_base + kflat];
                        }
                    }
                    out[(n * out_channels + o) * out_spatial + flat] = acc;
                }
            }
        }
    }
    let mut shape = vec![batch, out_channels];
    shape.extend(output);
    Tensor::new(output_type, shape, out)
}

fn unravel(mut flat: usize, dims: &[usize], pos: &mut [usize]) {
    for i in (0..dims.len()).rev() {
        pos[i] = flat % dims[i].max(1);
        flat /= dims[i].max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_kernel() {
        let data = Tensor::new(ElementType::F32, vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let filter = Tensor::filled(ElementType::F32, vec![1, 1, 1, 1], 2.0);
        let out = convolution(&data, &filter, &ConvolutionAttrs::unit(2), false, ElementType::F32).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        assert_eq!(out.data(), &[2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_same_upper_keeps_spatial_size() {
        let data = Tensor::filled(ElementType::F32, vec![1, 1, 3, 3], 1.0);
        let filter = Tensor::filled(ElementType::F32, vec![1, 1, 3, 3], 1.0);
        let attrs = ConvolutionAttrs {
            auto_pad: PadType::SameUpper,
            ..ConvolutionAttrs::unit(2)
        };
        let out = convolution(&data, &filter, &attrs, false, ElementType::F32).unwrap();
        assert_eq!(out.shape(), &[1, 1, 3, 3]);
        // Corner sees 2x2 ones, centre sees all nine.
        assert_eq!(out.data()[0], 4.0);
        assert_eq!(out.data()[4], 9.0);
    }

    #[test]
    fn test_grouped_depthwise() {
        let data = Tensor::new(ElementType::F32, vec![1, 2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let filter = Tensor::new(ElementType::F32, vec![2, 1, 1, 1, 1], vec![10.0, 100.0]).unwrap();
        let out = convolution(&data, &filter, &ConvolutionAttrs::unit(2), true, ElementType::F32).unwrap();
        assert_eq!(out.data(), &[10.0, 20.0, 300.0, 400.0]);
    }

    #[test]
    fn test_dequantize_per_channel() {
        let w = Tensor::new(ElementType::U8, vec![2, 1, 1, 1], vec![10.0, 20.0]).unwrap();
        let scale = Tensor::new(ElementType::F32, vec![2, 1, 1, 1], vec![0.5, 0.25]).unwrap();
        let zp = Tensor::scalar(ElementType::U8, 2.0);
        let out = dequantize(&w, &scale, Some(&zp)).unwrap();
        assert_eq!(out.data(), &[4.0, 4.5]);
    }
}
