//! Implementation descriptors.
//!
//! A descriptor is one candidate way to run a primitive kind: which backend
//! it belongs to, which shapes and element types it accepts, an optional
//! validation hook, the formats it wants, and whether its weights need a
//! build-time reorder.

use super::device::ImplContext;
use super::format::Format;
use crate::error::{ForgeResult, GraphForgeError};
use crate::ir::ElementType;
use crate::program::kernels::KernelFn;
use crate::program::primitive::{PrimitiveKind, ProgramNode};
use crate::program::reorder::WeightsReorderPlan;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    OneDnn,
    Ocl,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::OneDnn => "onednn",
            BackendKind::Ocl => "ocl",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeSupport {
    StaticOnly,
    DynamicOnly,
    Any,
}

impl ShapeSupport {
    pub fn accepts(&self, dynamic: bool) -> bool {
        match self {
            ShapeSupport::StaticOnly => !dynamic,
            ShapeSupport::DynamicOnly => dynamic,
            ShapeSupport::Any => true,
        }
    }
}

/// Candidates with `DontUseIfHaveSomethingElse` are tried after every
/// normal candidate of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImplPriority {
    Normal,
    DontUseIfHaveSomethingElse,
}

pub type ValidateFn = fn(&ProgramNode, &ImplContext) -> ForgeResult<()>;
pub type FormatsFn = fn(&ProgramNode, &ImplContext) -> (Vec<Format>, Vec<Format>);
pub type WeightsReorderFn = fn(&ProgramNode) -> Option<WeightsReorderPlan>;

#[derive(Clone)]
pub struct ImplementationDescriptor {
    pub name: &'static str,
    pub kind: PrimitiveKind,
    pub backend: BackendKind,
    pub shape_support: ShapeSupport,
    pub priority: ImplPriority,
    /// Accepted input element types; empty accepts all.
    pub input_types: Vec<ElementType>,
    /// Accepted output element types; empty accepts all.
    pub output_types: Vec<ElementType>,
    /// Fallback that must come last for its kind.
    pub universal: bool,
    pub validate: Option<ValidateFn>,
    pub formats: Option<FormatsFn>,
    pub weights_reorder: Option<WeightsReorderFn>,
    pub kernel: KernelFn,
}

impl fmt::Debug for ImplementationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplementationDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("backend", &self.backend)
            .field("shape_support", &self.shape_support)
            .field("priority", &self.priority)
            .field("universal", &self.universal)
            .finish()
    }
}

impl ImplementationDescriptor {
    pub fn new(name: &'static str, kind: PrimitiveKind, backend: BackendKind, kernel: KernelFn) -> Self {
        Self {
            name,
            kind,
            backend,
            shape_support: ShapeSupport::Any,
            priority: ImplPriority::Normal,
            input_types: Vec::new(),
            output_types: Vec::new(),
            universal: false,
            validate: None,
            formats: None,
            weights_reorder: None,
            kernel,
        }
    }

    pub fn shape_support(mut self, support: ShapeSupport) -> Self {
        self.shape_support = support;
        self
    }

    pub fn priority(mut self, priority: ImplPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn input_types(mut self, types: &[ElementType]) -> Self {
        self.input_types = types.to_vec();
        self
    }

    pub fn output_types(mut self, types: &[ElementType]) -> Self {
        self.output_types = types.to_vec();
        self
    }

    pub fn universal(mut self) -> Self {
        self.universal = true;
        self
    }

    pub fn validate_with(mut self, validate: ValidateFn) -> Self {
        self.validate = Some(validate);
        self
    }

    pub fn formats_with(mut self, formats: FormatsFn) -> Self {
        self.formats = Some(formats);
        self
    }

    pub fn weights_reorder_with(mut self, reorder: WeightsReorderFn) -> Self {
        self.weights_reorder = Some(reorder);
        self
    }

    fn decline(&self, reason: impl Into<String>) -> GraphForgeError {
        GraphForgeError::unsupported(self.name, reason)
    }

    /// Shape support, element types, then the validation hook. A decline is
    /// an `UnsupportedConfiguration` error.
    pub fn check(&self, node: &ProgramNode, ctx: &ImplContext) -> ForgeResult<()> {
        if !self.shape_support.accepts(node.is_dynamic()) {
            return Err(self.decline(format!("{:?} shapes required", self.shape_support)));
        }
        if !self.input_types.is_empty() {
            if let Some(layout) = node
                .input_layouts
                .iter()
                .find(|l| !self.input_types.contains(&l.element_type))
            {
                return Err(self.decline(format!("input type {} not accepted", layout.element_type)));
            }
        }
        if !self.output_types.is_empty() {
            if let Some(layout) = node
                .output_layouts
                .iter()
                .find(|l| !self.output_types.contains(&l.element_type))
            {
                return Err(self.decline(format!("output type {} not accepted", layout.element_type)));
            }
        }
        match self.validate {
            Some(validate) => validate(node, ctx),
            None => Ok(()),
        }
    }

    /// Formats for every input and output. Without a hook, non-constant
    /// inputs and all outputs take the plain format for their rank and
    /// constants stay `Any`.
    pub fn query_formats(&self, node: &ProgramNode, ctx: &ImplContext) -> (Vec<Format>, Vec<Format>) {
        if let Some(formats) = self.formats {
            return formats(node, ctx);
        }
        let plain = |rank: Option<usize>| rank.map(Format::default_for_rank).unwrap_or(Format::Any);
        let inputs = node
            .input_layouts
            .iter()
            .enumerate()
            .map(|(i, l)| {
                if node.input_is_constant(i) {
                    Format::Any
                } else {
                    plain(l.shape.rank())
                }
            })
            .collect();
        let outputs = node.output_layouts.iter().map(|l| plain(l.shape.rank())).collect();
        (inputs, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::PartialShape;
    use crate::program::kernels::execute_reference;
    use crate::program::primitive::Primitive;
    use crate::registry::LayoutDesc;

    fn clamp_node(et: ElementType) -> ProgramNode {
        let layout = LayoutDesc::new(et, Format::Bfyx, PartialShape::from_static(&[1, 4]));
        let mut node = ProgramNode::new(
            "clamp",
            Primitive::Clamp { min: 0.0, max: 1.0 },
            Vec::new(),
            vec![layout.clone()],
        );
        node.input_layouts = vec![layout];
        node
    }

    #[test]
    fn test_check_rejects_input_type() {
        let desc = ImplementationDescriptor::new("ocl::clamp_ref", PrimitiveKind::Clamp, BackendKind::Ocl, execute_reference)
            .input_types(&[ElementType::F32]);
        let ctx = ImplContext::default();
        assert!(desc.check(&clamp_node(ElementType::F32), &ctx).is_ok());
        let err = desc.check(&clamp_node(ElementType::I8), &ctx).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_default_formats_leave_constants_any() {
        let desc = ImplementationDescriptor::new("ocl::clamp_ref", PrimitiveKind::Clamp, BackendKind::Ocl, execute_reference);
        let mut node = clamp_node(ElementType::F32);
        node.constant_inputs = vec![true];
        let (inputs, outputs) = desc.query_formats(&node, &ImplContext::default());
        assert_eq!(inputs, vec![Format::Any]);
        assert_eq!(outputs, vec![Format::Bfyx]);
    }

    #[test]
    fn test_static_only_declines_dynamic() {
        let desc = ImplementationDescriptor::new("x", PrimitiveKind::Clamp, BackendKind::OneDnn, execute_reference)
            .shape_support(ShapeSupport::StaticOnly);
        let mut node = clamp_node(ElementType::F32);
        node.output_layouts[0].shape = PartialShape::dynamic_of_rank(2);
        assert!(desc.check(&node, &ImplContext::default()).is_err());
    }
}
