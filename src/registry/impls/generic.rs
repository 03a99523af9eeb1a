use crate::program::kernels::execute_reference;
use crate::program::primitive::PrimitiveKind;
use crate::registry::{BackendKind, ImplementationDescriptor, ImplementationRegistry};

const GENERIC: [(PrimitiveKind, &str); 14] = [
    (PrimitiveKind::Input, "ocl::input_ref"),
    (PrimitiveKind::Data, "ocl::data_ref"),
    (PrimitiveKind::Convert, "ocl::convert_ref"),
    (PrimitiveKind::Eltwise, "ocl::eltwise_ref"),
    (PrimitiveKind::Clamp, "ocl::clamp_ref"),
    (PrimitiveKind::Reshape, "ocl::reshape_ref"),
    (PrimitiveKind::Gather, "ocl::gather_ref"),
    (PrimitiveKind::Concatenation, "ocl::concatenation_ref"),
    (PrimitiveKind::Crop, "ocl::crop_ref"),
    (PrimitiveKind::FullyConnected, "ocl::fully_connected_ref"),
    (PrimitiveKind::Stft, "ocl::stft_ref"),
    (PrimitiveKind::MutableData, "ocl::mutable_data_ref"),
    (PrimitiveKind::Reorder, "ocl::reorder_ref"),
    (PrimitiveKind::GateSplit, "ocl::gate_split_ref"),
];

pub(super) fn register(registry: &mut ImplementationRegistry) {
    for (kind, name) in GENERIC {
        registry.register(ImplementationDescriptor::new(name, kind, BackendKind::Ocl, execute_reference).universal());
    }
}
