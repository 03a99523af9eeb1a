//! Short-time Fourier transform shape rule.
//!
//! Inputs: signal `[batch, signal_len]`, window `[window_len]`, and scalar
//! `frame_size` and `frame_step`. Output is `[batch, frames, fft, 2]`, or
//! `[batch, fft, frames, 2]` when `transpose_frames` is set.

use super::{expect_inputs, expect_rank, ConstantAccessor};
use crate::error::ForgeResult;
use crate::ir::{Dimension, PartialShape, TensorDesc};
use crate::shape_error;

pub fn infer_stft(
    node: &str,
    inputs: &[TensorDesc],
    constants: &dyn ConstantAccessor,
    transpose_frames: bool,
) -> ForgeResult<Vec<TensorDesc>> {
    expect_inputs(node, inputs, 4)?;
    let (signal, window, frame_size_desc, frame_step_desc) =
        (&inputs[0], &inputs[1], &inputs[2], &inputs[3]);
    expect_rank(node, "signal", signal, 2)?;
    expect_rank(node, "window", window, 1)?;
    expect_rank(node, "frame_size", frame_size_desc, 0)?;
    expect_rank(node, "frame_step", frame_step_desc, 0)?;

    let et = signal.element_type;
    let signal_dims = match signal.shape.dims() {
        Some(d) => d,
        None => return Ok(vec![signal.clone()]),
    };
    let batch = signal_dims[0];
    let signal_len = signal_dims[1];

    let frame_size = constants.constant(2).and_then(|t| t.scalar_value());
    let frame_step = constants.constant(3).and_then(|t| t.scalar_value());
    let (frame_size, frame_step) = match (frame_size, frame_step) {
        (Some(size), Some(step)) => (size as i64, step as i64),
        _ => {
            let shape = PartialShape::Ranked(vec![
                batch,
                Dimension::dynamic(),
                Dimension::dynamic(),
                Dimension::fixed(2),
            ]);
            return Ok(vec![TensorDesc::new(et, shape)]);
        }
    };

    let upper = signal_len.max_length();
    // The frame must be strictly shorter than the longest possible signal.
    if frame_size <= 0 || upper.map(|u| frame_size >= u).unwrap_or(false) {
        return Err(shape_error!(
            node,
            "frame_size {} must be in (0, {})",
            frame_size,
            signal_len
        ));
    }
    if frame_step <= 0 {
        return Err(shape_error!(node, "frame_step {} must be positive", frame_step));
    }
    if let Some(window_len) = window.shape.dim(0).and_then(|d| d.get_length()) {
        if window_len <= 0 || window_len > frame_size {
            return Err(shape_error!(
                node,
                "window length {} must be in (0, frame_size {}]",
                window_len,
                frame_size
            ));
        }
    }

    let fft = Dimension::fixed(frame_size / 2 + 1);
    let frames = signal_len
        .saturating_sub(&Dimension::fixed(frame_size))
        .floor_div(frame_step)
        .add_scalar(1);
    let dims = if transpose_frames {
        vec![batch, fft, frames, Dimension::fixed(2)]
    } else {
        vec![batch, frames, fft, Dimension::fixed(2)]
    };
    Ok(vec![TensorDesc::new(et, PartialShape::Ranked(dims))])
}
