//! Program construction.
//!
//! `graph -> lowering -> implementation selection -> weight reorder ->
//! memory assignment -> kernel compilation`. Each stage runs once over the
//! nodes in processing order.

use crate::config::CompileConfig;
use crate::error::ForgeResult;
use crate::internal_error;
use crate::ir::Graph;
use crate::program::lowering::{self, LoweredProgram};
use crate::program::memory::{BufferKind, MemoryHandle, MemoryPool};
use crate::program::primitive::{Primitive, ProgramNode};
use crate::program::reorder::{run_reorder_pass, ReorderReport, SelectedNode};
use crate::program::{PrimitiveInstance, Program, ProgramPort, ProgramStats};
use crate::registry::{Format, ImplContext, ImplementationDescriptor, ImplementationRegistry, LayoutDesc};
use std::time::Instant;
use tracing::{debug, info};

/// Kernel blob for one instance. Deterministic in the implementation name
/// and the layouts it was built for, so a cache can recompile a missing
/// blob and get the same bytes.
pub fn compile_kernel(implementation: &str, node_kind: &str, inputs: &[LayoutDesc], outputs: &[LayoutDesc]) -> Vec<u8> {
    let join = |layouts: &[LayoutDesc]| layouts.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(",");
    format!("{}|{}|{}->{}", implementation, node_kind, join(inputs), join(outputs)).into_bytes()
}

/// Every input and dependency must come from an earlier node.
pub fn verify_processing_order<'n, I>(nodes: I) -> ForgeResult<()>
where
    I: IntoIterator<Item = &'n ProgramNode>,
{
    for (index, node) in nodes.into_iter().enumerate() {
        if let Some(input) = node.inputs.iter().find(|p| p.node >= index) {
            return Err(internal_error!(
                "{} at position {} reads position {} which is not processed before it",
                node.id,
                index,
                input.node
            ));
        }
        if let Some(dep) = node.dependencies.iter().find(|d| **d >= index) {
            return Err(internal_error!("{} depends on later position {}", node.id, dep));
        }
    }
    Ok(())
}

fn apply_formats(layouts: &mut [LayoutDesc], formats: &[Format]) {
    for (layout, format) in layouts.iter_mut().zip(formats) {
        if *format != Format::Any {
            layout.format = *format;
        }
    }
}

pub struct ProgramBuilder<'a> {
    registry: &'a ImplementationRegistry,
    config: &'a CompileConfig,
    ctx: ImplContext,
}

impl<'a> ProgramBuilder<'a> {
    pub fn new(registry: &'a ImplementationRegistry, config: &'a CompileConfig) -> Self {
        Self {
            registry,
            config,
            ctx: ImplContext::new(config.device.clone()),
        }
    }

    pub fn context(&self) -> &ImplContext {
        &self.ctx
    }

    /// Fill input layouts from producers, pick an implementation and apply
    /// its preferred formats.
    fn select_all(&self, nodes: Vec<ProgramNode>) -> ForgeResult<Vec<SelectedNode<'a>>> {
        let mut selected: Vec<SelectedNode<'a>> = Vec::with_capacity(nodes.len());
        for mut node in nodes {
            let mut layouts = Vec::with_capacity(node.inputs.len());
            let mut constants = Vec::with_capacity(node.inputs.len());
            for input in &node.inputs {
                let producer = &selected
                    .get(input.node)
                    .ok_or_else(|| internal_error!("{} reads unprocessed node {}", node.id, input.node))?
                    .node;
                let layout = producer
                    .output_layouts
                    .get(input.port)
                    .ok_or_else(|| internal_error!("{} has no output {}", producer.id, input.port))?;
                layouts.push(layout.clone());
                constants.push(producer.is_constant());
            }
            node.input_layouts = layouts;
            node.constant_inputs = constants;

            let registry: &'a ImplementationRegistry = self.registry;
            let implementation = registry.select(&node, &self.ctx)?;
            let (inputs, outputs) = implementation.query_formats(&node, &self.ctx);
            apply_formats(&mut node.input_layouts, &inputs);
            apply_formats(&mut node.output_layouts, &outputs);
            selected.push(SelectedNode { node, implementation });
        }
        Ok(selected)
    }

    fn assign_memory(nodes: &[SelectedNode<'a>]) -> ForgeResult<(MemoryPool, Vec<Vec<MemoryHandle>>)> {
        let mut pool = MemoryPool::new();
        let mut handles: Vec<Vec<MemoryHandle>> = Vec::with_capacity(nodes.len());
        for SelectedNode { node, .. } in nodes {
            let outputs = match &node.primitive {
                Primitive::Data(tensor) => {
                    let layout = node
                        .output_layouts
                        .first()
                        .cloned()
                        .unwrap_or_else(|| LayoutDesc::from_desc(&tensor.desc()));
                    vec![pool.allocate_constant(layout, tensor.clone())]
                }
                Primitive::MutableData if !node.dependencies.is_empty() => {
                    let buffer = node.dependencies[0];
                    let handle = handles
                        .get(buffer)
                        .and_then(|h| h.first())
                        .copied()
                        .ok_or_else(|| internal_error!("{} aliases unallocated buffer {}", node.id, buffer))?;
                    vec![handle]
                }
                Primitive::MutableData => node
                    .output_layouts
                    .iter()
                    .map(|l| pool.allocate(l.clone(), BufferKind::Shared))
                    .collect(),
                Primitive::Input => node
                    .output_layouts
                    .iter()
                    .map(|l| pool.allocate(l.clone(), BufferKind::Input))
                    .collect(),
                _ => node
                    .output_layouts
                    .iter()
                    .map(|l| pool.allocate(l.clone(), BufferKind::Intermediate))
                    .collect(),
            };
            handles.push(outputs);
        }
        Ok((pool, handles))
    }

    fn instantiate(
        nodes: Vec<SelectedNode<'a>>,
        handles: &[Vec<MemoryHandle>],
    ) -> ForgeResult<Vec<PrimitiveInstance>> {
        let lookup = |node: usize, port: usize| -> ForgeResult<MemoryHandle> {
            handles
                .get(node)
                .and_then(|h| h.get(port))
                .copied()
                .ok_or_else(|| internal_error!("no buffer for port {}:{}", node, port))
        };
        nodes
            .into_iter()
            .enumerate()
            .map(|(index, SelectedNode { node, implementation })| -> ForgeResult<PrimitiveInstance> {
                let inputs = node
                    .inputs
                    .iter()
                    .map(|p| lookup(p.node, p.port))
                    .collect::<ForgeResult<Vec<_>>>()?;
                let dependencies = node
                    .dependencies
                    .iter()
                    .map(|d| lookup(*d, 0))
                    .collect::<ForgeResult<Vec<_>>>()?;
                let outputs = handles
                    .get(index)
                    .cloned()
                    .ok_or_else(|| internal_error!("{} has no buffers", node.id))?;
                Ok(Self::bind(node, implementation, inputs, outputs, dependencies))
            })
            .collect()
    }

    fn bind(
        node: ProgramNode,
        implementation: &ImplementationDescriptor,
        inputs: Vec<MemoryHandle>,
        outputs: Vec<MemoryHandle>,
        dependencies: Vec<MemoryHandle>,
    ) -> PrimitiveInstance {
        let kernel_blob = compile_kernel(
            implementation.name,
            node.kind().name(),
            &node.input_layouts,
            &node.output_layouts,
        );
        PrimitiveInstance {
            id: node.id,
            primitive: node.primitive,
            implementation: implementation.name.to_string(),
            kernel: implementation.kernel,
            input_layouts: node.input_layouts,
            output_layouts: node.output_layouts,
            inputs,
            outputs,
            dependencies,
            kernel_blob,
        }
    }

    #[tracing::instrument(skip_all, fields(graph_nodes = graph.len()))]
    pub fn build(&self, graph: &Graph) -> ForgeResult<Program> {
        let start = Instant::now();
        let order = graph
            .topological_order()
            .map_err(|e| internal_error!("graph cannot be ordered: {}", e))?;
        let LoweredProgram { nodes, inputs, outputs } = lowering::lower_graph(graph, &order, self.config)?;
        verify_processing_order(&nodes)?;
        debug!(primitives = nodes.len(), "graph lowered");

        let selected = self.select_all(nodes)?;
        let (selected, report) = if self.config.optimize_data {
            let registry: &'a ImplementationRegistry = self.registry;
            let ctx = &self.ctx;
            run_reorder_pass(selected, self.config, ctx, |node| registry.select(node, ctx))?
        } else {
            (selected, ReorderReport::default())
        };
        verify_processing_order(selected.iter().map(|s| &s.node))?;

        let input_positions: Vec<usize> = inputs.iter().map(|i| report.position(i.node)).collect();
        let output_positions: Vec<(usize, usize)> = outputs
            .iter()
            .map(|o| (report.position(o.port.node), o.port.port))
            .collect();

        let (pool, handles) = Self::assign_memory(&selected)?;
        let program_inputs = inputs
            .iter()
            .zip(&input_positions)
            .map(|(input, pos)| -> ForgeResult<ProgramPort> {
                let handle = handles
                    .get(*pos)
                    .and_then(|h| h.first())
                    .copied()
                    .ok_or_else(|| internal_error!("input {} has no buffer", input.name))?;
                Ok(ProgramPort {
                    name: input.name.clone(),
                    handle,
                    layout: pool.get(handle)?.layout.clone(),
                })
            })
            .collect::<ForgeResult<Vec<_>>>()?;
        let program_outputs = outputs
            .iter()
            .zip(&output_positions)
            .map(|(output, (pos, port))| -> ForgeResult<ProgramPort> {
                let handle = handles
                    .get(*pos)
                    .and_then(|h| h.get(*port))
                    .copied()
                    .ok_or_else(|| internal_error!("result {} has no buffer", output.name))?;
                Ok(ProgramPort {
                    name: output.name.clone(),
                    handle,
                    layout: output.layout.clone(),
                })
            })
            .collect::<ForgeResult<Vec<_>>>()?;

        let instances = Self::instantiate(selected, &handles)?;
        let stats = ProgramStats::collect(&instances, &pool, report.skipped());
        let program = Program {
            instances,
            pool,
            inputs: program_inputs,
            outputs: program_outputs,
            device_signature: self.config.device.signature(),
            graph_fingerprint: graph.fingerprint(),
            stats,
            reorder_decisions: report.decisions,
        };
        info!(
            primitives = program.instances.len(),
            buffers = program.pool.len(),
            reorders = program.stats.reorders_inserted,
            elapsed_us = start.elapsed().as_micros() as u64,
            "program built"
        );
        Ok(program)
    }
}
