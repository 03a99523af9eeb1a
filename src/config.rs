//! Compile configuration
//!
//! [`CompileConfig`] drives the rewrite pipeline, recurrent lowering,
//! implementation selection and the weight reorder pass. It can be built
//! in code with the `with_*` setters or read from JSON.

use crate::error::{io_context, ForgeResult};
use crate::ir::ElementType;
use crate::registry::DeviceInfo;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for one program build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Target device capabilities
    pub device: DeviceInfo,

    /// Lower LSTM sequences to one fused primitive instead of unrolled cells
    pub allow_new_shape_infer: bool,

    /// Run build-time weight reorders
    pub optimize_data: bool,

    /// Leave weights of dynamic nodes for the kernel to reorder at run time
    pub disable_build_time_weight_reorder_for_dynamic_nodes: bool,

    /// Program built internally by another program (no weight reorders)
    pub is_internal_program: bool,

    /// Let constant folding consume the zero-point Subtract of dequantization
    pub fold_dequantization_subtract: bool,

    /// Storage types recognised as compressed weights
    pub compressed_weight_types: Vec<ElementType>,

    /// Run f32 -> f16 precision conversion after the rewrite pipeline
    pub enable_fp16_compression: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        CompileConfig {
            device: DeviceInfo::default(),
            allow_new_shape_infer: true,
            optimize_data: true,
            disable_build_time_weight_reorder_for_dynamic_nodes: false,
            is_internal_program: false,
            fold_dequantization_subtract: false,
            compressed_weight_types: vec![
                ElementType::U8,
                ElementType::I8,
                ElementType::U4,
                ElementType::I4,
            ],
            enable_fp16_compression: false,
        }
    }
}

impl CompileConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> ForgeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> ForgeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| io_context(e, &format!("reading config {}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> ForgeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Set the target device
    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }

    /// Choose fused (true) or unrolled (false) LSTM sequence lowering
    pub fn with_allow_new_shape_infer(mut self, allow: bool) -> Self {
        self.allow_new_shape_infer = allow;
        self
    }

    pub fn with_optimize_data(mut self, optimize_data: bool) -> Self {
        self.optimize_data = optimize_data;
        self
    }

    pub fn with_disable_build_time_weight_reorder_for_dynamic_nodes(mut self, disable: bool) -> Self {
        self.disable_build_time_weight_reorder_for_dynamic_nodes = disable;
        self
    }

    pub fn with_is_internal_program(mut self, internal: bool) -> Self {
        self.is_internal_program = internal;
        self
    }

    pub fn with_fold_dequantization_subtract(mut self, fold: bool) -> Self {
        self.fold_dequantization_subtract = fold;
        self
    }

    pub fn with_compressed_weight_types(mut self, types: &[ElementType]) -> Self {
        self.compressed_weight_types = types.to_vec();
        self
    }

    pub fn with_fp16_compression(mut self, enable: bool) -> Self {
        self.enable_fp16_compression = enable;
        self
    }
}
