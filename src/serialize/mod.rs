//! Compiled program serialization.
//!
//! A program is written with its memory pool, every instance's primitive,
//! layouts, handles and kernel blob. Loading rebinds each instance to the
//! implementation of the same name in the caller's registry and rejects
//! blobs from another format version or another device with
//! `CacheMismatch`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use graphforge::serialize;
//!
//! let mut blob = Vec::new();
//! serialize::serialize(&program, &mut blob)?;
//! let loaded = serialize::deserialize(blob.as_slice(), &registry, &config)?;
//! ```

pub mod binary;
pub mod cache;

pub use cache::ProgramCache;

use crate::config::CompileConfig;
use crate::error::{io_context, ForgeResult, GraphForgeError};
use crate::ir::Graph;
use crate::program::builder::compile_kernel;
use crate::program::memory::{MemoryHandle, MemoryPool};
use crate::program::{PrimitiveInstance, Program, ProgramPort, ProgramStats};
use crate::registry::{ImplementationRegistry, LayoutDesc};
use binary::{Decoder, Encoder, MAGIC, VERSION};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info};

fn mismatch(what: impl Into<String>) -> GraphForgeError {
    GraphForgeError::CacheMismatch(what.into())
}

fn write_ports<W: Write>(enc: &mut Encoder<W>, ports: &[ProgramPort]) -> ForgeResult<()> {
    enc.usize(ports.len())?;
    for port in ports {
        enc.str(&port.name)?;
        enc.usize(port.handle.index())?;
        enc.layout(&port.layout)?;
    }
    Ok(())
}

fn read_ports<R: Read>(dec: &mut Decoder<R>) -> ForgeResult<Vec<ProgramPort>> {
    let count = dec.len()?;
    (0..count)
        .map(|_| -> ForgeResult<ProgramPort> {
            Ok(ProgramPort {
                name: dec.string()?,
                handle: dec.handle()?,
                layout: dec.layout()?,
            })
        })
        .collect()
}

/// Write `program` to `out`.
pub fn serialize<W: Write>(program: &Program, out: W) -> ForgeResult<()> {
    let mut enc = Encoder::new(out);
    enc.u32(MAGIC)?;
    enc.u32(VERSION)?;
    enc.str(program.device_signature())?;
    enc.u64(program.graph_fingerprint())?;
    enc.usize(program.stats().reorders_skipped)?;

    enc.usize(program.pool().len())?;
    for (_, buffer) in program.pool().iter() {
        enc.buffer(buffer)?;
    }

    enc.usize(program.instances().len())?;
    for instance in program.instances() {
        enc.str(&instance.id)?;
        enc.primitive(&instance.primitive)?;
        enc.str(&instance.implementation)?;
        enc.layouts(&instance.input_layouts)?;
        enc.layouts(&instance.output_layouts)?;
        enc.handles(&instance.inputs)?;
        enc.handles(&instance.outputs)?;
        enc.handles(&instance.dependencies)?;
        enc.bytes(&instance.kernel_blob)?;
    }

    write_ports(&mut enc, program.inputs())?;
    write_ports(&mut enc, program.outputs())?;
    enc.finish()?;
    debug!(instances = program.instances().len(), "program serialized");
    Ok(())
}

/// Same element type and shape; formats are declarative and may differ
/// between a buffer and the view a consumer takes of it.
fn same_buffer(a: &LayoutDesc, b: &LayoutDesc) -> bool {
    a.element_type == b.element_type && a.shape == b.shape
}

fn check_handles(
    pool: &MemoryPool,
    id: &str,
    what: &str,
    handles: &[MemoryHandle],
    layouts: Option<&[LayoutDesc]>,
) -> ForgeResult<()> {
    for (i, handle) in handles.iter().enumerate() {
        let buffer = pool
            .get(*handle)
            .map_err(|_| mismatch(format!("{} {} {} refers to missing {}", id, what, i, handle)))?;
        if let Some(layout) = layouts.and_then(|l| l.get(i)) {
            if !same_buffer(layout, &buffer.layout) {
                return Err(mismatch(format!(
                    "{} {} {} expects {} but {} holds {}",
                    id, what, i, layout, handle, buffer.layout
                )));
            }
        }
    }
    Ok(())
}

/// Read a program written by [`serialize`] and bind it to `registry`.
pub fn deserialize<R: Read>(input: R, registry: &ImplementationRegistry, config: &CompileConfig) -> ForgeResult<Program> {
    let mut dec = Decoder::new(input);
    let magic = dec.u32()?;
    if magic != MAGIC {
        return Err(mismatch(format!("bad magic {:#010x}", magic)));
    }
    let version = dec.u32()?;
    if version != VERSION {
        return Err(mismatch(format!("format version {} (expected {})", version, VERSION)));
    }
    let device_signature = dec.string()?;
    let expected = config.device.signature();
    if device_signature != expected {
        return Err(mismatch(format!(
            "compiled for device {} but target is {}",
            device_signature, expected
        )));
    }
    let graph_fingerprint = dec.u64()?;
    let reorders_skipped = dec.usize()?;

    let mut pool = MemoryPool::new();
    let buffers = dec.len()?;
    for _ in 0..buffers {
        pool.push(dec.buffer()?);
    }

    let count = dec.len()?;
    let mut instances = Vec::new();
    let mut recompiled = 0usize;
    for _ in 0..count {
        let id = dec.string()?;
        let primitive = dec.primitive()?;
        let implementation = dec.string()?;
        let input_layouts = dec.layouts()?;
        let output_layouts = dec.layouts()?;
        let inputs = dec.handles()?;
        let outputs = dec.handles()?;
        let dependencies = dec.handles()?;
        let mut kernel_blob = dec.bytes()?;

        let descriptor = registry
            .find(&implementation)
            .ok_or_else(|| mismatch(format!("{} uses unknown implementation {}", id, implementation)))?;
        if descriptor.kind != primitive.kind() {
            return Err(mismatch(format!(
                "{} is a {} but {} implements {}",
                id,
                primitive.kind(),
                implementation,
                descriptor.kind
            )));
        }
        if input_layouts.len() != inputs.len() || output_layouts.len() != outputs.len() {
            return Err(mismatch(format!("{} has layouts for a different port count", id)));
        }
        check_handles(&pool, &id, "input", &inputs, Some(&input_layouts))?;
        check_handles(&pool, &id, "output", &outputs, Some(&output_layouts))?;
        check_handles(&pool, &id, "dependency", &dependencies, None)?;

        if kernel_blob.is_empty() {
            kernel_blob = compile_kernel(descriptor.name, primitive.kind().name(), &input_layouts, &output_layouts);
            recompiled += 1;
        }
        instances.push(PrimitiveInstance {
            id,
            primitive,
            implementation,
            kernel: descriptor.kernel,
            input_layouts,
            output_layouts,
            inputs,
            outputs,
            dependencies,
            kernel_blob,
        });
    }

    let inputs = read_ports(&mut dec)?;
    let outputs = read_ports(&mut dec)?;
    for port in inputs.iter().chain(outputs.iter()) {
        pool.get(port.handle)
            .map_err(|_| mismatch(format!("port {} refers to missing {}", port.name, port.handle)))?;
    }

    let stats = ProgramStats::collect(&instances, &pool, reorders_skipped);
    info!(instances = instances.len(), recompiled, "program loaded");
    Ok(Program {
        instances,
        pool,
        inputs,
        outputs,
        device_signature,
        graph_fingerprint,
        stats,
        reorder_decisions: Vec::new(),
    })
}

/// [`deserialize`], additionally requiring the program to have been built
/// from a graph with the same fingerprint as `graph`.
pub fn deserialize_for_graph<R: Read>(
    input: R,
    registry: &ImplementationRegistry,
    config: &CompileConfig,
    graph: &Graph,
) -> ForgeResult<Program> {
    let program = deserialize(input, registry, config)?;
    let expected = graph.fingerprint();
    if program.graph_fingerprint() != expected {
        return Err(mismatch(format!(
            "built from graph {:016x}, expected {:016x}",
            program.graph_fingerprint(),
            expected
        )));
    }
    Ok(program)
}

pub fn save_to_file(program: &Program, path: impl AsRef<Path>) -> ForgeResult<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| io_context(e, &format!("creating {}", path.display())))?;
    serialize(program, BufWriter::new(file))
}

pub fn load_from_file(
    path: impl AsRef<Path>,
    registry: &ImplementationRegistry,
    config: &CompileConfig,
) -> ForgeResult<Program> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| io_context(e, &format!("opening {}", path.display())))?;
    deserialize(BufReader::new(file), registry, config)
}
