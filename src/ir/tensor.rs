//! Tensor descriptors and host tensor data.

use crate::error::ForgeResult;
use crate::graph_error;
use crate::ir::{shape::element_count, ElementType, PartialShape};
use half::{bf16, f16};
use std::fmt;

/// Element type and partial shape of one node output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    pub element_type: ElementType,
    pub shape: PartialShape,
}

impl TensorDesc {
    pub fn new(element_type: ElementType, shape: PartialShape) -> Self {
        Self {
            element_type,
            shape,
        }
    }

    pub fn with_static(element_type: ElementType, dims: &[usize]) -> Self {
        Self::new(element_type, PartialShape::from_static(dims))
    }

    pub fn is_static(&self) -> bool {
        self.shape.is_static()
    }

    /// Packed byte size, if the shape is static.
    pub fn byte_size(&self) -> Option<usize> {
        self.shape
            .element_count()
            .map(|n| self.element_type.byte_size(n))
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.element_type, self.shape)
    }
}

/// Dense host tensor.
///
/// Values are held as `f32` and normalised to the element type on
/// construction: integers are truncated and saturated, `f16`/`bf16` are
/// rounded through `half`. Integral values are exact up to 2^24.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    element_type: ElementType,
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(element_type: ElementType, shape: Vec<usize>, data: Vec<f32>) -> ForgeResult<Self> {
        let expected = element_count(&shape);
        if data.len() != expected {
            return Err(graph_error!(
                "tensor data has {} values, shape {:?} needs {}",
                data.len(),
                shape,
                expected
            ));
        }
        let data = data
            .into_iter()
            .map(|v| normalize(element_type, v))
            .collect();
        Ok(Self {
            element_type,
            shape,
            data,
        })
    }

    pub fn filled(element_type: ElementType, shape: Vec<usize>, value: f32) -> Self {
        let count = element_count(&shape);
        Self {
            element_type,
            shape,
            data: vec![normalize(element_type, value); count],
        }
    }

    pub fn scalar(element_type: ElementType, value: f32) -> Self {
        Self::filled(element_type, Vec::new(), value)
    }

    pub fn from_i64(element_type: ElementType, shape: Vec<usize>, values: &[i64]) -> ForgeResult<Self> {
        Self::new(element_type, shape, values.iter().map(|&v| v as f32).collect())
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn desc(&self) -> TensorDesc {
        TensorDesc::with_static(self.element_type, &self.shape)
    }

    pub fn byte_size(&self) -> usize {
        self.element_type.byte_size(self.data.len())
    }

    pub fn as_i64_vec(&self) -> Vec<i64> {
        self.data.iter().map(|&v| v as i64).collect()
    }

    /// Single value of a scalar or one-element tensor.
    pub fn scalar_value(&self) -> Option<f32> {
        if self.data.len() == 1 {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// Same data, different shape (element count must match).
    pub fn reshaped(&self, shape: Vec<usize>) -> ForgeResult<Self> {
        if element_count(&shape) != self.data.len() {
            return Err(graph_error!(
                "cannot reshape {:?} into {:?}",
                self.shape,
                shape
            ));
        }
        Ok(Self {
            element_type: self.element_type,
            shape,
            data: self.data.clone(),
        })
    }

    /// Value conversion with destination-type rounding and saturation.
    pub fn convert(&self, destination: ElementType) -> Self {
        Self {
            element_type: destination,
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .map(|&v| normalize(destination, v))
                .collect(),
        }
    }

    /// Feed element type, shape and value bits into `state`.
    pub fn hash_bits<H: std::hash::Hasher>(&self, state: &mut H) {
        use std::hash::Hash;
        self.element_type.hash(state);
        self.shape.hash(state);
        for v in &self.data {
            v.to_bits().hash(state);
        }
    }

    /// Bitwise equality of values, used by cache round-trip checks.
    pub fn bit_equal(&self, other: &Tensor) -> bool {
        self.element_type == other.element_type
            && self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

fn normalize(element_type: ElementType, value: f32) -> f32 {
    match element_type {
        ElementType::F32 | ElementType::Dynamic => value,
        ElementType::F16 => f16::from_f32(value).to_f32(),
        ElementType::Bf16 => bf16::from_f32(value).to_f32(),
        ElementType::F8e4m3 => {
            // e4m3 keeps three mantissa bits; saturate at +-448.
            let clamped = value.clamp(-448.0, 448.0);
            if clamped == 0.0 || !clamped.is_finite() {
                clamped
            } else {
                let exp = clamped.abs().log2().floor();
                let step = 2f32.powf(exp - 3.0);
                (clamped / step).round() * step
            }
        }
        ElementType::Boolean => {
            if value != 0.0 {
                1.0
            } else {
                0.0
            }
        }
        other => match other.integral_range() {
            Some((lo, hi)) => {
                let v = value.trunc() as f64;
                v.clamp(lo, hi) as f32
            }
            None => value,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_element_count() {
        assert!(Tensor::new(ElementType::F32, vec![2, 2], vec![1.0; 3]).is_err());
        assert!(Tensor::new(ElementType::F32, vec![2, 2], vec![1.0; 4]).is_ok());
    }

    #[test]
    fn test_integral_saturation() {
        let t = Tensor::new(ElementType::I8, vec![3], vec![-300.0, 2.7, 500.0]).unwrap();
        assert_eq!(t.data(), &[-128.0, 2.0, 127.0]);
        let u4 = t.convert(ElementType::U4);
        assert_eq!(u4.data(), &[0.0, 2.0, 15.0]);
    }

    #[test]
    fn test_f16_rounding() {
        let t = Tensor::scalar(ElementType::F32, 0.2);
        let h = t.convert(ElementType::F16);
        assert_eq!(h.data()[0], f16::from_f32(0.2).to_f32());
        assert_ne!(h.data()[0], 0.2f32);
    }

    #[test]
    fn test_desc_and_bytes() {
        let t = Tensor::filled(ElementType::U4, vec![27], 1.0);
        assert_eq!(t.byte_size(), 14);
        assert_eq!(t.desc(), TensorDesc::with_static(ElementType::U4, &[27]));
    }
}
