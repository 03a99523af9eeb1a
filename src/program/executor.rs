//! Program execution.
//!
//! Runs every instance in processing order against a fresh copy of the
//! memory pool. Mutable-data buffers keep their contents across the steps
//! of one execution and start zeroed on the next.

use crate::error::ForgeResult;
use crate::execution_error;
use crate::ir::Tensor;
use crate::program::kernels::KernelArgs;
use crate::program::memory::MemoryHandle;
use crate::program::primitive::Primitive;
use crate::program::{PrimitiveInstance, Program};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, trace};

type Storage = Vec<Option<Tensor>>;

fn read<'a>(storage: &'a Storage, handle: MemoryHandle, instance: &PrimitiveInstance) -> ForgeResult<&'a Tensor> {
    storage
        .get(handle.index())
        .and_then(Option::as_ref)
        .ok_or_else(|| execution_error!("{} reads {} before it is written", instance.id, handle))
}

fn write(storage: &mut Storage, handle: MemoryHandle, tensor: Tensor) -> ForgeResult<()> {
    let slot = storage
        .get_mut(handle.index())
        .ok_or_else(|| execution_error!("{} is outside the memory pool", handle))?;
    *slot = Some(tensor);
    Ok(())
}

fn bind_input(program: &Program, storage: &mut Storage, inputs: &BTreeMap<String, Tensor>) -> ForgeResult<()> {
    for input in program.inputs() {
        let tensor = inputs
            .get(&input.name)
            .ok_or_else(|| execution_error!("missing input '{}'", input.name))?;
        if let Some(dims) = input.layout.static_dims() {
            if dims.iter().product::<usize>() != tensor.len() {
                return Err(execution_error!(
                    "input '{}' has shape {:?}, expected {:?}",
                    input.name,
                    tensor.shape(),
                    dims
                ));
            }
        }
        let tensor = if input.layout.element_type.is_dynamic() || input.layout.element_type == tensor.element_type() {
            tensor.clone()
        } else {
            tensor.convert(input.layout.element_type)
        };
        write(storage, input.handle, tensor)?;
    }
    Ok(())
}

fn run_instance(instance: &PrimitiveInstance, storage: &mut Storage) -> ForgeResult<()> {
    let outputs = {
        let inputs = instance
            .inputs
            .iter()
            .map(|h| read(storage, *h, instance))
            .collect::<ForgeResult<Vec<_>>>()?;
        // A shared buffer with a dynamic shape has no storage until its
        // writer first runs; the kernel then returns the state as an extra
        // output.
        let dependencies = instance
            .dependencies
            .iter()
            .filter_map(|h| storage.get(h.index()).and_then(Option::as_ref))
            .collect::<Vec<_>>();
        let args = KernelArgs {
            inputs,
            dependencies,
            input_layouts: &instance.input_layouts,
            output_layouts: &instance.output_layouts,
        };
        (instance.kernel)(&instance.primitive, &args)?
    };
    if outputs.outputs.len() < instance.outputs.len() {
        return Err(execution_error!(
            "{} produced {} outputs, expected {}",
            instance.id,
            outputs.outputs.len(),
            instance.outputs.len()
        ));
    }
    let mut produced = outputs.outputs;
    let extra = produced.split_off(instance.outputs.len());
    let state = if outputs.dependencies.is_empty() {
        extra
    } else {
        outputs.dependencies
    };
    for (handle, tensor) in instance.outputs.iter().zip(produced) {
        write(storage, *handle, tensor)?;
    }
    for (handle, tensor) in instance.dependencies.iter().zip(state) {
        write(storage, *handle, tensor)?;
    }
    Ok(())
}

/// Whether the instance only names a buffer and has nothing to run.
fn is_passive(instance: &PrimitiveInstance) -> bool {
    match instance.primitive {
        Primitive::Input | Primitive::Data(_) => true,
        Primitive::MutableData => instance.dependencies.is_empty(),
        _ => false,
    }
}

/// Execute `program` with tensors keyed by parameter name. Returns the
/// results keyed by result name.
#[tracing::instrument(skip_all, fields(instances = program.instances().len()))]
pub fn execute(program: &Program, inputs: &BTreeMap<String, Tensor>) -> ForgeResult<BTreeMap<String, Tensor>> {
    let start = Instant::now();
    let mut storage = program.pool().instantiate();
    bind_input(program, &mut storage, inputs)?;

    for instance in program.instances() {
        if is_passive(instance) {
            continue;
        }
        trace!(id = %instance.id, implementation = %instance.implementation, "running primitive");
        run_instance(instance, &mut storage)?;
    }

    let mut results = BTreeMap::new();
    for output in program.outputs() {
        let tensor = storage
            .get(output.handle.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| execution_error!("result '{}' was never written", output.name))?;
        let tensor = match output.layout.static_dims() {
            Some(dims) if dims.iter().product::<usize>() == tensor.len() && dims != tensor.shape() => {
                tensor.reshaped(dims)?
            }
            _ => tensor.clone(),
        };
        results.insert(output.name.clone(), tensor);
    }
    debug!(elapsed_us = start.elapsed().as_micros() as u64, "program executed");
    Ok(results)
}
