use crate::error::{ForgeResult, GraphForgeError};
use crate::ir::ElementType;
use crate::program::kernels::execute_reference;
use crate::program::primitive::{LstmWeightsOrder, Primitive, PrimitiveKind, ProgramNode};
use crate::program::reorder::{recurrent_weights_plan, WeightsReorderPlan};
use crate::registry::{
    BackendKind, Format, ImplContext, ImplPriority, ImplementationDescriptor, ImplementationRegistry,
    ShapeSupport,
};

const ONEDNN_LSTM: &str = "onednn::lstm_seq";

fn validate_onednn_lstm(node: &ProgramNode, ctx: &ImplContext) -> ForgeResult<()> {
    if !ctx.device.supports_immad {
        return Err(GraphForgeError::unsupported(ONEDNN_LSTM, "device has no immad support"));
    }
    let clip = node.primitive.clip();
    if clip != 0.0 {
        return Err(GraphForgeError::unsupported(ONEDNN_LSTM, format!("clip {} is not supported", clip)));
    }
    match node.primitive.recurrent_attrs() {
        Some(cell) if !cell.has_default_lstm_activations() => Err(GraphForgeError::unsupported(
            ONEDNN_LSTM,
            format!("activations {:?} are not supported", cell.activations),
        )),
        _ => Ok(()),
    }
}

fn onednn_lstm_formats(node: &ProgramNode, _ctx: &ImplContext) -> (Vec<Format>, Vec<Format>) {
    let inputs = vec![Format::Bfyx; node.input_layouts.len()];
    let outputs = [Format::Ybfx, Format::Fbyx, Format::Fbyx]
        .into_iter()
        .take(node.output_layouts.len())
        .collect();
    (inputs, outputs)
}

fn onednn_lstm_weights(node: &ProgramNode) -> Option<WeightsReorderPlan> {
    match &node.primitive {
        Primitive::LstmSeq { order, .. } => {
            recurrent_weights_plan(node, *order, LstmWeightsOrder::Izof, [4, 5], 6)
        }
        _ => None,
    }
}

pub(super) fn register(registry: &mut ImplementationRegistry) {
    registry
        .register(
            ImplementationDescriptor::new(ONEDNN_LSTM, PrimitiveKind::LstmSeq, BackendKind::OneDnn, execute_reference)
                .shape_support(ShapeSupport::StaticOnly)
                .input_types(&[
                    ElementType::F32,
                    ElementType::F16,
                    ElementType::U8,
                    ElementType::I8,
                    ElementType::I32,
                ])
                .validate_with(validate_onednn_lstm)
                .formats_with(onednn_lstm_formats)
                .weights_reorder_with(onednn_lstm_weights),
        )
        .register(
            ImplementationDescriptor::new(
                "ocl::lstm_seq_ref",
                PrimitiveKind::LstmSeq,
                BackendKind::Ocl,
                execute_reference,
            )
            .universal(),
        )
        .register(
            ImplementationDescriptor::new(
                "ocl::lstm_cell_ref",
                PrimitiveKind::LstmCell,
                BackendKind::Ocl,
                execute_reference,
            )
            .universal(),
        )
        .register(
            ImplementationDescriptor::new("ocl::gru_seq_ref", PrimitiveKind::GruSeq, BackendKind::Ocl, execute_reference)
                .input_types(&[ElementType::I32, ElementType::F16, ElementType::F32])
                .output_types(&[ElementType::F16, ElementType::F32])
                .priority(ImplPriority::DontUseIfHaveSomethingElse)
                .universal(),
        );
}
