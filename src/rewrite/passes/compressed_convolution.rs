//! Fuses dequantized convolution weights into `ConvolutionCompressed`.
//!
//! ```text
//! Constant(u8|i8|u4|i4) -> Convert -> [Subtract(., zp)] -> Multiply(., Constant scale)
//!     -> Convolution | GroupConvolution(data, .)
//! ```
//! becomes `ConvolutionCompressed(data, weights, scale[, zp])`.

use crate::error::ForgeResult;
use crate::ir::{CompressedConvolutionAttrs, ElementType, Graph, Op, OpKind, Output, RuntimeTag};
use crate::rewrite::{
    copy_runtime_info, type_matches_any, Captures, GraphPass, GraphRewrite, PatternBuilder,
    Predicate, RewriteContext, RewriteStats,
};
use tracing::debug;

pub const COMPRESSED_WEIGHT_TYPES: [ElementType; 4] =
    [ElementType::U8, ElementType::I8, ElementType::U4, ElementType::I4];

#[derive(Debug, Clone, Default)]
pub struct ConvertConvolutionToCompressed;

impl ConvertConvolutionToCompressed {
    pub fn new() -> Self {
        Self
    }

    pub fn rewrite(&self) -> GraphRewrite {
        let mut p = PatternBuilder::new();
        let weights = p.constant_with(type_matches_any(&COMPRESSED_WEIGHT_TYPES));
        let weights = p.label(weights, "weights");
        let convert = p.wrap_type(&[OpKind::Convert], &[weights]);
        let constant_path = Predicate::new(|g, o| g.is_on_constant_path(o));
        let zero_point = p.any_input_with(constant_path);
        let zero_point = p.label(zero_point, "zero point");
        let subtract = p.wrap_type(&[OpKind::Subtract], &[convert, zero_point]);
        let dequantized = p.or_match(&[subtract, convert]);
        let scale = p.constant();
        let scale = p.label(scale, "scale");
        let multiply = p.wrap_type(&[OpKind::Multiply], &[dequantized, scale]);
        let data = p.any_input();
        let conv = p.wrap_type(&[OpKind::Convolution, OpKind::GroupConvolution], &[data, multiply]);
        let pattern = p.build(conv);

        let mut rewrite = GraphRewrite::new();
        rewrite.register_pass(
            "convert_convolution_to_compressed",
            pattern,
            move |ctx: &mut RewriteContext<'_>, captures: &Captures| {
                let conv_id = captures.require_node(conv)?;
                let weights_out = captures.require(weights)?;
                let graph = ctx.graph_mut();
                let conv_node = graph.try_node(conv_id)?;
                let (attrs, grouped) = match &conv_node.op {
                    Op::Convolution(a) => (a.clone(), false),
                    Op::GroupConvolution(a) => (a.clone(), true),
                    _ => return Ok(false),
                };
                let groups = if grouped {
                    let shape = graph
                        .output_desc(weights_out)
                        .map(|d| d.shape.clone())
                        .unwrap_or(crate::ir::PartialShape::DynamicRank);
                    match shape.dim(0).and_then(|d| d.get_length()) {
                        Some(g) => g,
                        None => return Ok(false),
                    }
                } else {
                    0
                };
                let name = conv_node.name.clone();
                let output_type = conv_node.outputs.first().map(|d| d.element_type);

                let mut inputs: Vec<Output> = vec![
                    captures.require(data)?,
                    weights_out,
                    captures.require(scale)?,
                ];
                if captures.contains(subtract) {
                    inputs.push(captures.require(zero_point)?);
                }
                let compressed = graph.add_node(
                    &name,
                    Op::ConvolutionCompressed(CompressedConvolutionAttrs {
                        conv: attrs,
                        groups,
                        output_type,
                    }),
                    inputs,
                )?;
                let mut sources = vec![conv_id, captures.require_node(multiply)?, captures.require_node(convert)?];
                if let Some(sub) = captures.node(subtract) {
                    sources.push(sub);
                }
                copy_runtime_info(graph, &sources, &[compressed]);
                // The weights now feed the kernel directly.
                graph.enable_tag(weights_out.node, RuntimeTag::KeepConstPrecision);
                debug!(conv = %name, groups, "fused compressed convolution");
                ctx.replace_root(compressed);
                Ok(true)
            },
        );
        rewrite
    }
}

impl GraphPass for ConvertConvolutionToCompressed {
    fn name(&self) -> &'static str {
        "ConvertConvolutionToCompressed"
    }

    #[tracing::instrument(skip_all)]
    fn run_on_graph(&self, graph: &mut Graph) -> ForgeResult<RewriteStats> {
        self.rewrite().run(graph)
    }
}
