//! Keeps the storage precision of dequantized constant weights.
//!
//! Runs after [`MarkDequantization`](super::MarkDequantization): a
//! dequantization Multiply whose data Convert reads a low-precision
//! Constant (optionally through Reshape) gets that Constant, and its
//! zero-point Constant, tagged `KeepConstPrecision`.

use crate::error::ForgeResult;
use crate::ir::{ElementType, Graph, OpKind, RuntimeTag};
use crate::rewrite::{
    type_matches_any, Captures, GraphPass, GraphRewrite, PatternBuilder, Predicate,
    RewriteContext, RewriteStats,
};

#[derive(Debug, Clone)]
pub struct KeepConstPrecision {
    types: Vec<ElementType>,
    fold_subtract_const: bool,
}

impl KeepConstPrecision {
    pub fn new(types: &[ElementType], fold_subtract_const: bool) -> Self {
        Self {
            types: types.to_vec(),
            fold_subtract_const,
        }
    }

    pub fn rewrite(&self) -> GraphRewrite {
        let mut p = PatternBuilder::new();
        let weights = p.constant_with(type_matches_any(&self.types));
        let weights = p.label(weights, "weights");
        let weights_reshaped = p.optional(&[OpKind::Reshape], weights);
        let convert = p.wrap_type(&[OpKind::Convert], &[weights_reshaped]);

        let zp_const = p.constant();
        let zp_const = p.label(zp_const, "zero point");
        let zp_reshaped = p.optional(&[OpKind::Reshape], zp_const);
        let zp_convert = p.wrap_type(&[OpKind::Convert], &[zp_reshaped]);
        let zp_converted = p.optional(&[OpKind::Reshape], zp_convert);
        let zp_other = p.any_input();
        let zero_point = p.or_match(&[zp_converted, zp_other]);

        let subtract = p.wrap_type(&[OpKind::Subtract], &[convert, zero_point]);
        let data = p.or_match(&[subtract, convert]);
        let scale = p.any_input();
        let is_dequantization = Predicate::new(|g, o| g.has_tag(o.node, RuntimeTag::Dequantization));
        let multiply = p.wrap_type_with(&[OpKind::Multiply], &[data, scale], is_dequantization);
        let pattern = p.build(multiply);

        let types = self.types.clone();
        let fold = self.fold_subtract_const;
        let mut rewrite = GraphRewrite::new();
        rewrite.register_pass(
            "keep_const_precision",
            pattern,
            move |ctx: &mut RewriteContext<'_>, captures: &Captures| {
                let graph = ctx.graph_mut();
                let mut changed = graph.enable_tag(captures.require_node(weights)?, RuntimeTag::KeepConstPrecision);
                if !fold {
                    if let Some(zp) = captures.get(zp_const) {
                        let allowed = graph.element_type(zp).map(|t| types.contains(&t)).unwrap_or(false);
                        if allowed {
                            changed |= graph.enable_tag(zp.node, RuntimeTag::KeepConstPrecision);
                        }
                    }
                }
                Ok(changed)
            },
        );
        rewrite
    }
}

impl GraphPass for KeepConstPrecision {
    fn name(&self) -> &'static str {
        "KeepConstPrecision"
    }

    #[tracing::instrument(skip_all, fields(types = ?self.types))]
    fn run_on_graph(&self, graph: &mut Graph) -> ForgeResult<RewriteStats> {
        self.rewrite().run(graph)
    }
}
