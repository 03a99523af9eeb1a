//! Program memory pool.
//!
//! Every primitive output gets a [`MemoryHandle`] into the pool. Constants
//! are immutable buffers filled at build time; mutable-data buffers are
//! shared between the primitive that writes them and every reader, so the
//! readers alias one handle instead of owning a copy.

use crate::error::ForgeResult;
use crate::execution_error;
use crate::ir::Tensor;
use crate::registry::LayoutDesc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryHandle(pub(crate) usize);

impl MemoryHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Filled from a program input on every execution.
    Input,
    /// Immutable data uploaded once.
    Constant,
    /// Written by exactly one primitive per execution.
    Intermediate,
    /// Mutable state shared by a writer and its `mutable_data` readers.
    Shared,
}

impl BufferKind {
    pub fn to_tag(&self) -> u8 {
        match self {
            BufferKind::Input => 0,
            BufferKind::Constant => 1,
            BufferKind::Intermediate => 2,
            BufferKind::Shared => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(BufferKind::Input),
            1 => Some(BufferKind::Constant),
            2 => Some(BufferKind::Intermediate),
            3 => Some(BufferKind::Shared),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferInfo {
    pub layout: LayoutDesc,
    pub kind: BufferKind,
    /// Contents of constant buffers.
    pub data: Option<Tensor>,
}

/// Host and device bytes a program needs at its upper bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryEstimate {
    pub host_bytes: usize,
    pub device_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryPool {
    buffers: Vec<BufferInfo>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, layout: LayoutDesc, kind: BufferKind) -> MemoryHandle {
        self.buffers.push(BufferInfo {
            layout,
            kind,
            data: None,
        });
        MemoryHandle(self.buffers.len() - 1)
    }

    pub fn allocate_constant(&mut self, layout: LayoutDesc, data: Tensor) -> MemoryHandle {
        self.buffers.push(BufferInfo {
            layout,
            kind: BufferKind::Constant,
            data: Some(data),
        });
        MemoryHandle(self.buffers.len() - 1)
    }

    pub(crate) fn push(&mut self, info: BufferInfo) -> MemoryHandle {
        self.buffers.push(info);
        MemoryHandle(self.buffers.len() - 1)
    }

    pub fn get(&self, handle: MemoryHandle) -> ForgeResult<&BufferInfo> {
        self.buffers
            .get(handle.0)
            .ok_or_else(|| execution_error!("{} is not allocated", handle))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MemoryHandle, &BufferInfo)> {
        self.buffers
            .iter()
            .enumerate()
            .map(|(i, b)| (MemoryHandle(i), b))
    }

    /// Constants count on both sides (host copy plus device upload). Other
    /// buffers count at their dimension bounds; an unbounded dimension
    /// counts as zero.
    pub fn estimate(&self) -> MemoryEstimate {
        let mut estimate = MemoryEstimate::default();
        for buffer in &self.buffers {
            let bytes = match &buffer.data {
                Some(t) => t.byte_size(),
                None => buffer.layout.max_byte_size().unwrap_or(0),
            };
            if buffer.kind == BufferKind::Constant {
                estimate.host_bytes += bytes;
            }
            estimate.device_bytes += bytes;
        }
        estimate
    }

    /// Fresh per-execution storage: constants filled, shared buffers
    /// zeroed when their shape is static.
    pub fn instantiate(&self) -> Vec<Option<Tensor>> {
        self.buffers
            .iter()
            .map(|b| match (&b.kind, &b.data) {
                (_, Some(t)) => Some(t.clone()),
                (BufferKind::Shared, None) => b
                    .layout
                    .static_dims()
                    .map(|dims| Tensor::filled(b.layout.element_type, dims, 0.0)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Dimension, ElementType, PartialShape};
    use crate::registry::Format;

    #[test]
    fn test_estimate_counts_bounds() {
        let mut pool = MemoryPool::new();
        let constant = Tensor::filled(ElementType::F32, vec![4], 1.0);
        pool.allocate_constant(LayoutDesc::from_desc(&constant.desc()), constant);
        let bounded = PartialShape::from(vec![Dimension::fixed(2), Dimension::bounded(1, 8)]);
        pool.allocate(LayoutDesc::new(ElementType::F16, Format::Bfyx, bounded), BufferKind::Intermediate);
        let unbounded = PartialShape::from(vec![Dimension::dynamic()]);
        pool.allocate(LayoutDesc::new(ElementType::F32, Format::Bfyx, unbounded), BufferKind::Intermediate);

        let estimate = pool.estimate();
        assert_eq!(estimate.host_bytes, 16);
        assert_eq!(estimate.device_bytes, 16 + 32);
    }

    #[test]
    fn test_instantiate_zeroes_shared_buffers() {
        let mut pool = MemoryPool::new();
        let layout = LayoutDesc::new(ElementType::F32, Format::Bfyx, PartialShape::from_static(&[1, 2]));
        let shared = pool.allocate(layout.clone(), BufferKind::Shared);
        let input = pool.allocate(layout, BufferKind::Input);
        let storage = pool.instantiate();
        assert_eq!(storage[shared.index()].as_ref().unwrap().data(), &[0.0, 0.0]);
        assert!(storage[input.index()].is_none());
    }
}
