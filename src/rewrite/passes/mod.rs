//! Rewrite passes and the standard pipeline.

pub mod compressed_convolution;
pub mod constant_folding;
pub mod convert_precision;
pub mod gather_subgraph;
pub mod keep_const_precision;
pub mod keep_dequantization_precision;
pub mod mark_dequantization;

pub use compressed_convolution::ConvertConvolutionToCompressed;
pub use constant_folding::ConstantFolding;
pub use convert_precision::ConvertPrecision;
pub use gather_subgraph::MarkGatherSubgraph;
pub use keep_const_precision::KeepConstPrecision;
pub use keep_dequantization_precision::KeepDequantizationPrecision;
pub use mark_dequantization::MarkDequantization;

use crate::config::CompileConfig;
use crate::ir::{ElementType, Graph, OpKind, Output};
use crate::rewrite::PassManager;

/// Element types gathered from reduced-precision tables.
pub const GATHER_DATA_TYPES: [ElementType; 3] = [ElementType::F8e4m3, ElementType::F16, ElementType::Bf16];
pub const GATHER_INDICES_TYPES: [ElementType; 2] = [ElementType::U4, ElementType::U8];

/// Fixed compile-time pass order.
pub fn standard_pipeline(config: &CompileConfig) -> PassManager {
    let types = &config.compressed_weight_types;
    let fold = config.fold_dequantization_subtract;
    let mut manager = PassManager::new();
    manager
        .register(MarkDequantization::new(types, fold))
        .register(KeepConstPrecision::new(types, fold))
        .register(MarkGatherSubgraph::new(&GATHER_DATA_TYPES, &GATHER_INDICES_TYPES))
        .register(ConvertConvolutionToCompressed::new())
        .register(ConstantFolding::new());
    if config.enable_fp16_compression {
        manager.register(ConvertPrecision::new(ElementType::F32, ElementType::F16).keep_precision_sensitive_in_fp32(true));
    }
    manager
}

/// Walk up through shape-only ops (data input only). Returns the first
/// output that is not produced by a shape-only op and the number of hops.
pub(crate) fn skip_shape_only(graph: &Graph, mut output: Output) -> (Output, usize) {
    let mut hops = 0;
    while let Some(node) = graph.node(output.node) {
        if !node.kind().is_shape_only() {
            break;
        }
        match node.input(0) {
            Some(input) => {
                output = input;
                hops += 1;
            }
            None => break,
        }
    }
    (output, hops)
}

pub(crate) fn is_kind(graph: &Graph, output: Output, kind: OpKind) -> bool {
    graph.kind(output.node) == Some(kind)
}
