//! Marks compressed-table Gather subgraphs.
//!
//! `Gather([Convert](data const), [Convert](indices), axis)` with at least
//! one Convert present keeps both sources in their storage precision and
//! stops constant folding from materialising the decompressed table.

use crate::error::ForgeResult;
use crate::ir::{ElementType, Graph, OpKind, RuntimeTag};
use crate::rewrite::{
    type_matches_any, Captures, GraphPass, GraphRewrite, PatternBuilder, Predicate,
    RewriteContext, RewriteStats,
};

#[derive(Debug, Clone)]
pub struct MarkGatherSubgraph {
    data_types: Vec<ElementType>,
    indices_types: Vec<ElementType>,
}

impl MarkGatherSubgraph {
    pub fn new(data_types: &[ElementType], indices_types: &[ElementType]) -> Self {
        Self {
            data_types: data_types.to_vec(),
            indices_types: indices_types.to_vec(),
        }
    }

    pub fn rewrite(&self) -> GraphRewrite {
        let mut p = PatternBuilder::new();
        let data = p.constant_with(type_matches_any(&self.data_types));
        let data = p.label(data, "data");
        let data_convert = p.optional(&[OpKind::Convert], data);

        let const_or_param = Predicate::new(|g, o| {
            matches!(g.kind(o.node), Some(OpKind::Constant) | Some(OpKind::Parameter))
        });
        let indices = p.any_input_with(type_matches_any(&self.indices_types).and(const_or_param));
        let indices = p.label(indices, "indices");
        let indices_convert = p.optional(&[OpKind::Convert], indices);

        let axis = p.constant();
        let gather = p.wrap_type(&[OpKind::Gather], &[data_convert, indices_convert, axis]);
        let pattern = p.build(gather);

        let mut rewrite = GraphRewrite::new();
        rewrite.register_pass(
            "mark_gather_subgraph",
            pattern,
            move |ctx: &mut RewriteContext<'_>, captures: &Captures| {
                let converts: Vec<_> = [data_convert, indices_convert]
                    .iter()
                    .filter_map(|id| captures.node(*id))
                    .collect();
                if converts.is_empty() {
                    return Ok(false);
                }
                let graph = ctx.graph_mut();
                let mut changed = false;
                changed |= graph.enable_tag(captures.require_node(data)?, RuntimeTag::KeepConstPrecision);
                changed |= graph.enable_tag(captures.require_node(indices)?, RuntimeTag::KeepConstPrecision);
                for convert in converts {
                    changed |= graph.enable_tag(convert, RuntimeTag::DisableConstantFolding);
                }
                changed |= graph.enable_tag(captures.require_node(gather)?, RuntimeTag::DisableConstantFolding);
                Ok(changed)
            },
        );
        rewrite
    }
}

impl GraphPass for MarkGatherSubgraph {
    fn name(&self) -> &'static str {
        "MarkGatherSubgraph"
    }

    #[tracing::instrument(skip_all)]
    fn run_on_graph(&self, graph: &mut Graph) -> ForgeResult<RewriteStats> {
        self.rewrite().run(graph)
    }
}
