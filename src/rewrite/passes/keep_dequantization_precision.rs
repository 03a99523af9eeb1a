//! Keeps fully constant dequantization chains in f32.
//!
//! `Constant -> Convert -> Subtract(., Convert(Constant)) -> Multiply(., scale)`
//! with a constant scale is marked `DisableFp16Compression` so a later
//! precision conversion leaves the arithmetic in f32. With
//! `add_precision_sensitive_convert` an explicit `Convert(f16)` is placed
//! after the Multiply; its readers see f16 until the graph is re-inferred by
//! [`ConvertPrecision`](super::ConvertPrecision).

use crate::error::ForgeResult;
use crate::ir::{ElementType, Graph, Op, OpKind, RuntimeTag};
use crate::rewrite::{
    type_matches_any, Captures, GraphPass, GraphRewrite, PatternBuilder, RewriteContext,
    RewriteStats,
};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct KeepDequantizationPrecision {
    types: Vec<ElementType>,
    add_precision_sensitive_convert: bool,
}

impl KeepDequantizationPrecision {
    pub fn new(types: &[ElementType], add_precision_sensitive_convert: bool) -> Self {
        Self {
            types: types.to_vec(),
            add_precision_sensitive_convert,
        }
    }

    pub fn rewrite(&self) -> GraphRewrite {
        let mut p = PatternBuilder::new();
        let weights = p.constant_with(type_matches_any(&self.types));
        let convert = p.wrap_type(&[OpKind::Convert], &[weights]);
        let zp = p.constant();
        let zp_convert = p.wrap_type(&[OpKind::Convert], &[zp]);
        let subtract = p.wrap_type(&[OpKind::Subtract], &[convert, zp_convert]);
        let scale = p.any_input();
        let scale = p.label(scale, "scale");
        let multiply = p.wrap_type(&[OpKind::Multiply], &[subtract, scale]);
        let pattern = p.build(multiply);

        let add_convert = self.add_precision_sensitive_convert;
        let mut rewrite = GraphRewrite::new();
        rewrite.register_pass(
            "keep_dequantization_precision",
            pattern,
            move |ctx: &mut RewriteContext<'_>, captures: &Captures| {
                let graph = ctx.graph_mut();
                if !graph.is_on_constant_path(captures.require(scale)?) {
                    return Ok(false);
                }
                let multiply = captures.require_node(multiply)?;
                let mut changed = false;
                for id in [convert, zp_convert, subtract] {
                    changed |= graph.enable_tag(captures.require_node(id)?, RuntimeTag::DisableFp16Compression);
                }
                changed |= graph.enable_tag(multiply, RuntimeTag::DisableFp16Compression);
                if add_convert {
                    changed |= insert_output_convert(graph, multiply)?;
                }
                Ok(changed)
            },
        );
        rewrite
    }
}

/// Put `Convert(f16)` between `multiply` and its readers unless one is
/// already the only reader.
fn insert_output_convert(graph: &mut Graph, multiply: crate::ir::NodeId) -> ForgeResult<bool> {
    let consumers = graph.consumers(multiply.into());
    let already = consumers.len() == 1
        && matches!(
            graph.node(consumers[0].0).map(|n| &n.op),
            Some(Op::Convert { destination: ElementType::F16 })
        );
    if already {
        return Ok(false);
    }
    let name = graph.try_node(multiply)?.name.clone();
    let convert_name = graph.unique_name(&format!("{}/convert_f16", name));
    let convert = graph.add_node(
        &convert_name,
        Op::Convert { destination: ElementType::F16 },
        vec![multiply.into()],
    )?;
    let moved = graph.replace_output_uses(multiply.into(), convert.into())?;
    // Readers now see f16; their descriptors follow.
    graph.revalidate()?;
    debug!(node = %name, moved, "inserted precision sensitive convert");
    Ok(true)
}

impl GraphPass for KeepDequantizationPrecision {
    fn name(&self) -> &'static str {
        "KeepDequantizationPrecision"
    }

    #[tracing::instrument(skip_all, fields(types = ?self.types))]
    fn run_on_graph(&self, graph: &mut Graph) -> ForgeResult<RewriteStats> {
        self.rewrite().run(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{PartialShape, Tensor};

    fn chain(scale_is_parameter: bool) -> (Graph, crate::ir::NodeId) {
        let mut g = Graph::new();
        let w = g
            .add_constant("w", Tensor::filled(ElementType::U8, vec![2, 2], 7.0))
            .unwrap();
        let cvt = g
            .add_node("cvt", Op::Convert { destination: ElementType::F32 }, vec![w.into()])
            .unwrap();
        let zp = g
            .add_constant("zp", Tensor::scalar(ElementType::U8, 3.0))
            .unwrap();
        let zp_cvt = g
            .add_node("zp_cvt", Op::Convert { destination: ElementType::F32 }, vec![zp.into()])
            .unwrap();
        let sub = g
            .add_node("sub", Op::Subtract, vec![cvt.into(), zp_cvt.into()])
            .unwrap();
        let scale = if scale_is_parameter {
            g.add_parameter("scale", ElementType::F32, PartialShape::from_static(&[1]))
                .unwrap()
        } else {
            g.add_constant("scale", Tensor::scalar(ElementType::F32, 0.25))
                .unwrap()
        };
        let mul = g.add_node("mul", Op::Multiply, vec![sub.into(), scale.into()]).unwrap();
        g.add_result("r", mul.into()).unwrap();
        (g, mul)
    }

    #[test]
    fn test_marks_constant_chain() {
        let (mut g, mul) = chain(false);
        KeepDequantizationPrecision::new(&[ElementType::U8], false)
            .run_on_graph(&mut g)
            .unwrap();
        for name in ["cvt", "zp_cvt", "sub", "mul"] {
            let id = g.find_by_name(name).unwrap();
            assert!(g.has_tag(id, RuntimeTag::DisableFp16Compression), "{}", name);
        }
        assert!(g.has_tag(mul, RuntimeTag::DisableFp16Compression));
    }

    #[test]
    fn test_parameter_scale_is_left_alone() {
        let (mut g, mul) = chain(true);
        let stats = KeepDequantizationPrecision::new(&[ElementType::U8], true)
            .run_on_graph(&mut g)
            .unwrap();
        assert_eq!(stats.applied, 0);
        assert!(g.node(mul).unwrap().rt_info.is_empty());
    }

    #[test]
    fn test_convert_inserted_once() {
        let (mut g, mul) = chain(false);
        let pass = KeepDequantizationPrecision::new(&[ElementType::U8], true);
        pass.run_on_graph(&mut g).unwrap();
        pass.run_on_graph(&mut g).unwrap();
        let readers = g.node_consumers(mul);
        assert_eq!(readers.len(), 1);
        assert_eq!(g.kind(readers[0]), Some(OpKind::Convert));
        assert_eq!(g.count_kind(OpKind::Convert), 3);
    }

    #[test]
    fn test_readers_see_converted_type() {
        let (mut g, mul) = chain(false);
        let clamp = g
            .add_node("clamp", Op::Clamp { min: 0.0, max: 6.0 }, vec![mul.into()])
            .unwrap();
        g.add_result("clamped", clamp.into()).unwrap();
        assert_eq!(g.output_desc(clamp.into()).unwrap().element_type, ElementType::F32);

        KeepDequantizationPrecision::new(&[ElementType::U8], true)
            .run_on_graph(&mut g)
            .unwrap();
        assert_eq!(g.output_desc(clamp.into()).unwrap().element_type, ElementType::F16);
        assert_eq!(g.output_desc(mul.into()).unwrap().element_type, ElementType::F32);
        let result = g.find_by_name("clamped").unwrap();
        assert_eq!(g.output_desc(result.into()).unwrap().element_type, ElementType::F16);
    }
}
