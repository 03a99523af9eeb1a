//! Default implementation table.
//!
//! oneDNN candidates are registered ahead of the OCL reference kernels; every
//! kind ends with a universal OCL fallback.

mod convolution;
mod generic;
mod recurrent;

use super::ImplementationRegistry;

pub(crate) fn register_defaults(registry: &mut ImplementationRegistry) {
    recurrent::register(registry);
    convolution::register(registry);
    generic::register(registry);
}
