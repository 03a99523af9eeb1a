//! Marks dequantization subgraphs.
//!
//! Matches `Convert(x) -> [Subtract(., zero_point)] -> Multiply(., scale)`
//! where `x` has one of the low-precision types. The scale may sit on
//! either Multiply input.

use super::{is_kind, skip_shape_only};
use crate::error::ForgeResult;
use crate::ir::{ElementType, Graph, OpKind, RuntimeTag};
use crate::rewrite::{
    type_matches_any, Captures, GraphPass, GraphRewrite, PatternBuilder, PatternId, RewriteContext,
    RewriteStats,
};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct MarkDequantization {
    types: Vec<ElementType>,
    fold_subtract_const: bool,
}

impl MarkDequantization {
    pub fn new(types: &[ElementType], fold_subtract_const: bool) -> Self {
        Self {
            types: types.to_vec(),
            fold_subtract_const,
        }
    }

    pub fn rewrite(&self) -> GraphRewrite {
        let mut p = PatternBuilder::new();
        let input = p.any_input_with(type_matches_any(&self.types));
        let input = p.label(input, "low-precision input");
        let convert = p.wrap_type(&[OpKind::Convert], &[input]);
        let zero_point = p.any_input();
        let subtract = p.wrap_type(&[OpKind::Subtract], &[convert, zero_point]);
        let data = p.or_match(&[subtract, convert]);
        let scale = p.any_input();
        let scale = p.label(scale, "scale");
        let multiply = p.wrap_type(&[OpKind::Multiply], &[data, scale]);
        let pattern = p.build(multiply);

        let fold = self.fold_subtract_const;
        let mut rewrite = GraphRewrite::new();
        rewrite.register_pass(
            "mark_dequantization",
            pattern,
            move |ctx: &mut RewriteContext<'_>, captures: &Captures| {
                let graph = ctx.graph_mut();
                let mut changed = false;

                let multiply = captures.require_node(multiply)?;
                changed |= graph.enable_tag(multiply, RuntimeTag::Dequantization);

                let convert = captures.require_node(convert)?;
                if graph.is_on_constant_path(captures.require(input)?) {
                    changed |= graph.enable_tag(convert, RuntimeTag::DisableConstantFolding);
                }

                if let Some(sub) = captures.node(subtract) {
                    changed |= graph.enable_tag(sub, RuntimeTag::Dequantization);
                    if !fold {
                        let (zp, _) = skip_shape_only(graph, captures.require(zero_point)?);
                        if is_kind(graph, zp, OpKind::Convert) {
                            changed |= graph.enable_tag(zp.node, RuntimeTag::DisableConstantFolding);
                        }
                    }
                }

                changed |= opt_out_scale(graph, captures, scale)?;
                trace!(multiply = %multiply, changed, "dequantization subgraph");
                Ok(changed)
            },
        );
        rewrite
    }
}

/// A scale reached through shape-only ops must not keep its storage
/// precision: its reshaped copy is what the kernel reads.
fn opt_out_scale(graph: &mut Graph, captures: &Captures, scale: PatternId) -> ForgeResult<bool> {
    let (source, hops) = skip_shape_only(graph, captures.require(scale)?);
    if hops > 0 && is_kind(graph, source, OpKind::Constant) {
        return Ok(graph.disable_tag(source.node, RuntimeTag::KeepConstPrecision));
    }
    Ok(false)
}

impl GraphPass for MarkDequantization {
    fn name(&self) -> &'static str {
        "MarkDequantization"
    }

    #[tracing::instrument(skip_all, fields(types = ?self.types))]
    fn run_on_graph(&self, graph: &mut Graph) -> ForgeResult<RewriteStats> {
        self.rewrite().run(graph)
    }
}
