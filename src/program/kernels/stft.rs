//! Short-time Fourier transform.

use crate::error::ForgeResult;
use crate::execution_error;
use crate::ir::{ElementType, Tensor};
use std::f64::consts::PI;

/// `signal [batch, len]`, `window [w]` with `w <= frame_size`.
///
/// The window is centred in the frame and zero padded. Output is
/// `[batch, frames, frame_size / 2 + 1, 2]` (real, imaginary), or
/// `[batch, bins, frames, 2]` with `transpose_frames`.
pub fn stft(
    signal: &Tensor,
    window: &Tensor,
    frame_size: usize,
    frame_step: usize,
    transpose_frames: bool,
    output_type: ElementType,
) -> ForgeResult<Tensor> {
    let shape = signal.shape();
    if shape.len() != 2 {
        return Err(execution_error!("stft signal must be [batch, length], got {:?}", shape));
    }
    let (batch, len) = (shape[0], shape[1]);
    if frame_size == 0 || frame_size > len || frame_step == 0 {
        return Err(execution_error!(
            "stft frame size {} / step {} invalid for length {}",
            frame_size,
            frame_step,
            len
        ));
    }
    let wlen = window.len();
    if wlen == 0 || wlen > frame_size {
        return Err(execution_error!("stft window of {} for frame size {}", wlen, frame_size));
    }
    let mut padded_window = vec![0.0f64; frame_size];
    let left = (frame_size - wlen) / 2;
    for (i, w) in window.data().iter().enumerate() {
        padded_window[left + i] = *w as f64;
    }

    let frames = (len - frame_size) / frame_step + 1;
    let bins = frame_size / 2 + 1;
    let mut out = vec![0.0f32; batch * frames * bins * 2];
    for b in 0..batch {
        let row = &signal.data()[b * len..(b + 1) * len];
        for fr in 0..frames {
            let start = fr * frame_step;
            for k in 0..bins {
                let (mut re, mut im) = (0.0f64, 0.0f64);
                for n in 0..frame_size {
                    let v = row[start + n] as f64 * padded_window[n];
                    let angle = 2.0 * PI * (k * n) as f64 / frame_size as f64;
                    re += v * angle.cos();
                    im -= v * angle.sin();
                }
                let at = if transpose_frames {
                    ((b * bins + k) * frames + fr) * 2
                } else {
                    ((b * frames + fr) * bins + k) * 2
                };
                out[at] = re as f32;
                out[at + 1] = im as f32;
            }
        }
    }
    let out_shape = if transpose_frames {
        vec![batch, bins, frames, 2]
    } else {
        vec![batch, frames, bins, 2]
    };
    Tensor::new(output_type, out_shape, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_signal_has_only_dc() {
        let signal = Tensor::filled(ElementType::F32, vec![1, 8], 1.0);
        let window = Tensor::filled(ElementType::F32, vec![4], 1.0);
        let out = stft(&signal, &window, 4, 2, false, ElementType::F32).unwrap();
        assert_eq!(out.shape(), &[1, 3, 3, 2]);
        assert!((out.data()[0] - 4.0).abs() < 1e-5);
        for v in &out.data()[2..6] {
            assert!(v.abs() < 1e-5);
        }
    }

    #[test]
    fn test_transposed_layout() {
        let signal = Tensor::new(ElementType::F32, vec![1, 18], (0..18).map(|v| v as f32).collect()).unwrap();
        let window = Tensor::filled(ElementType::F32, vec![4], 1.0);
        let plain = stft(&signal, &window, 4, 2, false, ElementType::F32).unwrap();
        let transposed = stft(&signal, &window, 4, 2, true, ElementType::F32).unwrap();
        assert_eq!(plain.shape(), &[1, 8, 3, 2]);
        assert_eq!(transposed.shape(), &[1, 3, 8, 2]);
        // Frame 5, bin 1.
        let a = ((5 * 3) + 1) * 2;
        let b = (8 + 5) * 2;
        assert_eq!(plain.data()[a], transposed.data()[b]);
    }
}
