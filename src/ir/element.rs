//! Element types carried on graph edges and constants.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Boolean,
    F32,
    F16,
    Bf16,
    F8e4m3,
    I64,
    I32,
    I8,
    U16,
    U8,
    I4,
    U4,
    /// Not yet known; merges with anything.
    Dynamic,
}

impl ElementType {
    pub const ALL: [ElementType; 13] = [
        ElementType::Boolean,
        ElementType::F32,
        ElementType::F16,
        ElementType::Bf16,
        ElementType::F8e4m3,
        ElementType::I64,
        ElementType::I32,
        ElementType::I8,
        ElementType::U16,
        ElementType::U8,
        ElementType::I4,
        ElementType::U4,
        ElementType::Dynamic,
    ];

    pub fn bitwidth(&self) -> usize {
        match self {
            ElementType::Boolean => 8,
            ElementType::F32 | ElementType::I32 => 32,
            ElementType::F16 | ElementType::Bf16 | ElementType::U16 => 16,
            ElementType::F8e4m3 | ElementType::I8 | ElementType::U8 => 8,
            ElementType::I64 => 64,
            ElementType::I4 | ElementType::U4 => 4,
            ElementType::Dynamic => 0,
        }
    }

    /// Bytes needed to store `count` packed elements.
    pub fn byte_size(&self, count: usize) -> usize {
        (count.saturating_mul(self.bitwidth()) + 7) / 8
    }

    pub fn is_real(&self) -> bool {
        matches!(
            self,
            ElementType::F32 | ElementType::F16 | ElementType::Bf16 | ElementType::F8e4m3
        )
    }

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            ElementType::I64
                | ElementType::I32
                | ElementType::I8
                | ElementType::U16
                | ElementType::U8
                | ElementType::I4
                | ElementType::U4
                | ElementType::Boolean
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ElementType::I64 | ElementType::I32 | ElementType::I8 | ElementType::I4
        ) || self.is_real()
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, ElementType::Dynamic)
    }

    /// Inclusive value range for integral types.
    pub fn integral_range(&self) -> Option<(f64, f64)> {
        match self {
            ElementType::Boolean => Some((0.0, 1.0)),
            ElementType::I64 => Some((i64::MIN as f64, i64::MAX as f64)),
            ElementType::I32 => Some((i32::MIN as f64, i32::MAX as f64)),
            ElementType::I8 => Some((-128.0, 127.0)),
            ElementType::U16 => Some((0.0, u16::MAX as f64)),
            ElementType::U8 => Some((0.0, 255.0)),
            ElementType::I4 => Some((-8.0, 7.0)),
            ElementType::U4 => Some((0.0, 15.0)),
            _ => None,
        }
    }

    /// Merge two element types the way edge validation does: a dynamic
    /// type yields to the other, otherwise both must agree.
    pub fn merge(a: ElementType, b: ElementType) -> Option<ElementType> {
        match (a, b) {
            (ElementType::Dynamic, other) | (other, ElementType::Dynamic) => Some(other),
            (x, y) if x == y => Some(x),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ElementType::Boolean => "boolean",
            ElementType::F32 => "f32",
            ElementType::F16 => "f16",
            ElementType::Bf16 => "bf16",
            ElementType::F8e4m3 => "f8e4m3",
            ElementType::I64 => "i64",
            ElementType::I32 => "i32",
            ElementType::I8 => "i8",
            ElementType::U16 => "u16",
            ElementType::U8 => "u8",
            ElementType::I4 => "i4",
            ElementType::U4 => "u4",
            ElementType::Dynamic => "dynamic",
        }
    }

    /// Stable tag used by the program cache.
    pub fn to_tag(&self) -> u8 {
        match self {
            ElementType::Boolean => 0,
            ElementType::F32 => 1,
            ElementType::F16 => 2,
            ElementType::Bf16 => 3,
            ElementType::F8e4m3 => 4,
            ElementType::I64 => 5,
            ElementType::I32 => 6,
            ElementType::I8 => 7,
            ElementType::U16 => 8,
            ElementType::U8 => 9,
            ElementType::I4 => 10,
            ElementType::U4 => 11,
            ElementType::Dynamic => 255,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        ElementType::ALL.iter().copied().find(|t| t.to_tag() == tag)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_byte_size() {
        assert_eq!(ElementType::U4.byte_size(27), 14);
        assert_eq!(ElementType::F16.byte_size(3), 6);
        assert_eq!(ElementType::I64.byte_size(2), 16);
    }

    #[test]
    fn test_merge_prefers_static() {
        assert_eq!(
            ElementType::merge(ElementType::Dynamic, ElementType::F16),
            Some(ElementType::F16)
        );
        assert_eq!(ElementType::merge(ElementType::F32, ElementType::F16), None);
    }

    #[test]
    fn test_tags_roundtrip_for_all_types() {
        for et in ElementType::ALL {
            assert_eq!(ElementType::from_tag(et.to_tag()), Some(et));
        }
        assert_eq!(ElementType::from_tag(42), None);
    }
}
