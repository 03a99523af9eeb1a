use crate::error::{ForgeResult, GraphForgeError};
use crate::ir::ElementType;
use crate::program::kernels::execute_reference;
use crate::program::primitive::{Primitive, PrimitiveKind, ProgramNode};
use crate::registry::{BackendKind, ImplContext, ImplementationDescriptor, ImplementationRegistry, ShapeSupport};

const ONEDNN_CONV: &str = "onednn::convolution";

fn validate_onednn_convolution(node: &ProgramNode, ctx: &ImplContext) -> ForgeResult<()> {
    if !ctx.device.supports_immad {
        return Err(GraphForgeError::unsupported(ONEDNN_CONV, "device has no immad support"));
    }
    match &node.primitive {
        Primitive::Convolution {
            compressed: true,
            grouped: true,
            ..
        } => Err(GraphForgeError::unsupported(
            ONEDNN_CONV,
            "compressed weights with groups",
        )),
        _ => Ok(()),
    }
}

pub(super) fn register(registry: &mut ImplementationRegistry) {
    registry
        .register(
            ImplementationDescriptor::new(ONEDNN_CONV, PrimitiveKind::Convolution, BackendKind::OneDnn, execute_reference)
                .shape_support(ShapeSupport::StaticOnly)
                .input_types(&[ElementType::F16, ElementType::F32, ElementType::U8, ElementType::I8])
                .validate_with(validate_onednn_convolution),
        )
        .register(
            ImplementationDescriptor::new(
                "ocl::convolution_ref",
                PrimitiveKind::Convolution,
                BackendKind::Ocl,
                execute_reference,
            )
            .universal(),
        );
}
