//! Executable programs.
//!
//! A [`Program`] is the compiled form of a graph: primitive instances in
//! processing order, each bound to a selected implementation, a kernel
//! blob and handles into a [`MemoryPool`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use graphforge::program::ProgramBuilder;
//!
//! let program = ProgramBuilder::new(&registry, &config).build(&graph)?;
//! let results = program.execute(&inputs)?;
//! let (host, device) = program.estimated_device_mem_usage();
//! ```

pub mod builder;
pub mod executor;
pub mod kernels;
pub mod lowering;
pub mod memory;
pub mod primitive;
pub mod reorder;

pub use builder::ProgramBuilder;
pub use memory::{BufferKind, MemoryEstimate, MemoryHandle, MemoryPool};
pub use primitive::{EltwiseMode, LstmWeightsOrder, Primitive, PrimitiveKind, ProgramNode};
pub use reorder::{ReorderDecision, SkipReason};

use crate::error::ForgeResult;
use crate::ir::Tensor;
use crate::program::kernels::KernelFn;
use crate::registry::LayoutDesc;
use std::collections::BTreeMap;

/// One primitive bound to its implementation and memory.
#[derive(Debug, Clone)]
pub struct PrimitiveInstance {
    pub id: String,
    pub primitive: Primitive,
    pub implementation: String,
    pub kernel: KernelFn,
    pub input_layouts: Vec<LayoutDesc>,
    pub output_layouts: Vec<LayoutDesc>,
    pub inputs: Vec<MemoryHandle>,
    pub outputs: Vec<MemoryHandle>,
    pub dependencies: Vec<MemoryHandle>,
    pub kernel_blob: Vec<u8>,
}

impl PrimitiveInstance {
    pub fn kind(&self) -> PrimitiveKind {
        self.primitive.kind()
    }
}

/// Named program input or output bound to a buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramPort {
    pub name: String,
    pub handle: MemoryHandle,
    pub layout: LayoutDesc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramStats {
    pub primitives: BTreeMap<PrimitiveKind, usize>,
    pub reorders_inserted: usize,
    pub reorders_skipped: usize,
    pub memory: MemoryEstimate,
}

impl ProgramStats {
    pub(crate) fn collect(instances: &[PrimitiveInstance], pool: &MemoryPool, skipped: usize) -> Self {
        let mut primitives = BTreeMap::new();
        for instance in instances {
            *primitives.entry(instance.kind()).or_insert(0) += 1;
        }
        let reorders_inserted = instances
            .iter()
            .filter(|i| matches!(i.kind(), PrimitiveKind::Reorder | PrimitiveKind::GateSplit))
            .count();
        Self {
            primitives,
            reorders_inserted,
            reorders_skipped: skipped,
            memory: pool.estimate(),
        }
    }

    pub fn count(&self, kind: PrimitiveKind) -> usize {
        self.primitives.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) instances: Vec<PrimitiveInstance>,
    pub(crate) pool: MemoryPool,
    pub(crate) inputs: Vec<ProgramPort>,
    pub(crate) outputs: Vec<ProgramPort>,
    pub(crate) device_signature: String,
    pub(crate) graph_fingerprint: u64,
    pub(crate) stats: ProgramStats,
    pub(crate) reorder_decisions: Vec<(String, ReorderDecision)>,
}

impl Program {
    /// Instances in processing order.
    pub fn instances(&self) -> &[PrimitiveInstance] {
        &self.instances
    }

    pub fn find_instance(&self, id: &str) -> Option<&PrimitiveInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn instances_of(&self, kind: PrimitiveKind) -> impl Iterator<Item = &PrimitiveInstance> {
        self.instances.iter().filter(move |i| i.kind() == kind)
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn inputs(&self) -> &[ProgramPort] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ProgramPort] {
        &self.outputs
    }

    pub fn device_signature(&self) -> &str {
        &self.device_signature
    }

    pub fn graph_fingerprint(&self) -> u64 {
        self.graph_fingerprint
    }

    pub fn stats(&self) -> &ProgramStats {
        &self.stats
    }

    /// Build-time weight reorder decisions. Empty for programs loaded from
    /// a cache.
    pub fn reorder_decisions(&self) -> &[(String, ReorderDecision)] {
        &self.reorder_decisions
    }

    /// `(host, device)` bytes at the upper bounds of every buffer.
    pub fn estimated_device_mem_usage(&self) -> (usize, usize) {
        let estimate = self.pool.estimate();
        (estimate.host_bytes, estimate.device_bytes)
    }

    pub fn execute(&self, inputs: &BTreeMap<String, Tensor>) -> ForgeResult<BTreeMap<String, Tensor>> {
        executor::execute(self, inputs)
    }
}
