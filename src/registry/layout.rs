//! Layout descriptors: element type, format and shape of a buffer.

use super::format::Format;
use crate::ir::{ElementType, PartialShape, TensorDesc};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutDesc {
    pub element_type: ElementType,
    pub format: Format,
    pub shape: PartialShape,
}

impl LayoutDesc {
    pub fn new(element_type: ElementType, format: Format, shape: PartialShape) -> Self {
        Self {
            element_type,
            format,
            shape,
        }
    }

    /// Layout of a tensor descriptor in the plain format for its rank.
    pub fn from_desc(desc: &TensorDesc) -> Self {
        let format = match desc.shape.rank() {
            Some(rank) => Format::default_for_rank(rank),
            None => Format::Any,
        };
        Self::new(desc.element_type, format, desc.shape.clone())
    }

    pub fn with_format(&self, format: Format) -> Self {
        Self {
            format,
            ..self.clone()
        }
    }

    pub fn with_shape(&self, shape: PartialShape) -> Self {
        Self {
            shape,
            ..self.clone()
        }
    }

    pub fn is_static(&self) -> bool {
        self.shape.is_static()
    }

    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.shape.to_shape()
    }

    /// Bytes needed at the upper bound of every dimension, `None` when a
    /// dimension is unbounded.
    pub fn max_byte_size(&self) -> Option<usize> {
        self.shape
            .max_element_count()
            .map(|count| self.element_type.byte_size(count))
    }

    pub fn desc(&self) -> TensorDesc {
        TensorDesc::new(self.element_type, self.shape.clone())
    }
}

impl fmt::Display for LayoutDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.element_type.name(), self.format, self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Dimension;

    #[test]
    fn test_from_desc_picks_rank_format() {
        let desc = TensorDesc::with_static(ElementType::F32, &[1, 2, 3, 4, 5]);
        assert_eq!(LayoutDesc::from_desc(&desc).format, Format::Bfzyx);
        let dynamic = TensorDesc::new(ElementType::F32, PartialShape::DynamicRank);
        assert_eq!(LayoutDesc::from_desc(&dynamic).format, Format::Any);
    }

    #[test]
    fn test_max_byte_size_uses_upper_bounds() {
        let layout = LayoutDesc::new(
            ElementType::F16,
            Format::Bfyx,
            PartialShape::Ranked(vec![Dimension::fixed(2), Dimension::bounded(1, 8)]),
        );
        assert_eq!(layout.max_byte_size(), Some(32));
        let open = layout.with_shape(PartialShape::Ranked(vec![Dimension::dynamic()]));
        assert_eq!(open.max_byte_size(), None);
    }
}
