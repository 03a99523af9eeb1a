//! GraphForge - graph compiler for accelerator inference
//!
//! Takes a computation graph of typed operators, rewrites it (dequantization
//! marking, compressed convolution fusion, constant folding, precision
//! conversion), infers interval shapes, lowers it to primitives, selects an
//! implementation per primitive, splices build-time weight reorders and
//! produces an executable, serializable [`Program`].

#![allow(clippy::too_many_arguments)] // Recurrent kernels take many tensors
#![allow(clippy::needless_range_loop)] // Index loops mirror the tensor math
#![allow(clippy::type_complexity)] // Pass and selection callbacks
#![allow(clippy::collapsible_if)] // Sometimes clearer for control flow
#![allow(clippy::len_without_is_empty)] // Decoder::len reads a length prefix

pub mod config;
pub mod error;
pub mod ir;
pub mod logging;
pub mod program;
pub mod registry;
pub mod rewrite;
pub mod serialize;
pub mod shape_infer;

pub use config::CompileConfig;
pub use error::{ErrorCategory, ForgeResult, GraphForgeError};
pub use ir::{ElementType, Graph, NodeId, Op, Output, PartialShape, Tensor, TensorDesc};
pub use program::{Program, ProgramBuilder};
pub use registry::{DeviceInfo, ImplementationRegistry};
pub use rewrite::passes::standard_pipeline;

/// Run the standard rewrite pipeline on `graph` and build a program.
pub fn compile(
    graph: &mut Graph,
    registry: &ImplementationRegistry,
    config: &CompileConfig,
) -> ForgeResult<Program> {
    standard_pipeline(config).run(graph)?;
    ProgramBuilder::new(registry, config).build(graph)
}
