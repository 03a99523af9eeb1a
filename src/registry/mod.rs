//! Implementation registry.
//!
//! Maps each primitive kind to an ordered list of candidate
//! implementations. Selection walks the list, lets each candidate decline
//! with `UnsupportedConfiguration`, and falls back to the kind's universal
//! implementation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use graphforge::registry::{ImplContext, ImplementationRegistry};
//!
//! let registry = ImplementationRegistry::with_defaults();
//! let chosen = registry.select(&node, &ImplContext::new(device))?;
//! println!("{} runs on {}", node.id, chosen.name);
//! ```

pub mod descriptor;
pub mod device;
pub mod format;
mod impls;
pub mod layout;

pub use descriptor::{
    BackendKind, FormatsFn, ImplPriority, ImplementationDescriptor, ShapeSupport, ValidateFn,
    WeightsReorderFn,
};
pub use device::{DeviceInfo, ImplContext};
pub use format::Format;
pub use layout::LayoutDesc;

use crate::error::{ForgeResult, GraphForgeError};
use crate::internal_error;
use crate::program::primitive::{PrimitiveKind, ProgramNode};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Explicit registry instance; nothing is global.
#[derive(Debug, Clone, Default)]
pub struct ImplementationRegistry {
    table: BTreeMap<PrimitiveKind, Vec<ImplementationDescriptor>>,
}

impl ImplementationRegistry {
    /// Empty registry, for tests that register their own candidates.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        impls::register_defaults(&mut registry);
        registry
    }

    pub fn register(&mut self, descriptor: ImplementationDescriptor) -> &mut Self {
        self.table.entry(descriptor.kind).or_default().push(descriptor);
        self
    }

    /// Candidates for `kind` in registration order.
    pub fn get_implementations(&self, kind: PrimitiveKind) -> &[ImplementationDescriptor] {
        self.table.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find(&self, name: &str) -> Option<&ImplementationDescriptor> {
        self.table.values().flatten().find(|d| d.name == name)
    }

    pub fn kinds(&self) -> impl Iterator<Item = PrimitiveKind> + '_ {
        self.table.keys().copied()
    }

    /// First candidate that accepts `node`, normal priority before
    /// `DontUseIfHaveSomethingElse`. When every candidate declines, the
    /// kind's universal fallback is returned.
    pub fn select(&self, node: &ProgramNode, ctx: &ImplContext) -> ForgeResult<&ImplementationDescriptor> {
        let kind = node.kind();
        let candidates = self.get_implementations(kind);
        let mut ordered: Vec<&ImplementationDescriptor> = candidates.iter().collect();
        ordered.sort_by_key(|d| d.priority);

        for candidate in ordered {
            match candidate.check(node, ctx) {
                Ok(()) => {
                    debug!(node = %node.id, implementation = candidate.name, "implementation selected");
                    return Ok(candidate);
                }
                Err(err) if err.is_recoverable() => {
                    trace!(node = %node.id, implementation = candidate.name, reason = %err, "candidate declined");
                }
                Err(err) => return Err(err),
            }
        }

        match candidates.iter().rev().find(|d| d.universal) {
            Some(fallback) => {
                warn!(node = %node.id, implementation = fallback.name, "no candidate validated, using universal fallback");
                Ok(fallback)
            }
            None => Err(GraphForgeError::NoImplementation {
                kind: kind.name().to_string(),
                node: node.id.clone(),
            }),
        }
    }

    /// Selected implementation's formats for `node`'s inputs and outputs.
    pub fn query_formats(
        &self,
        node: &ProgramNode,
        ctx: &ImplContext,
    ) -> ForgeResult<(Vec<Format>, Vec<Format>)> {
        Ok(self.select(node, ctx)?.query_formats(node, ctx))
    }

    /// Every registered kind must end with a universal fallback.
    pub fn verify(&self) -> ForgeResult<()> {
        for (kind, candidates) in &self.table {
            match candidates.last() {
                Some(last) if last.universal => {}
                _ => {
                    return Err(internal_error!(
                        "implementations of {} do not end with a universal fallback",
                        kind
                    ))
                }
            }
        }
        Ok(())
    }
}
