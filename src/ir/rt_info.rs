//! Runtime tags attached to graph nodes.
//!
//! Tags are markers that rewrite passes set and later passes (constant
//! folding, precision conversion, program building) read. Keys are the closed
//! [`RuntimeTag`] enum. A tag is either enabled or explicitly disabled; the
//! explicit disabled state lets a pass veto a later pass without removing
//! anything.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuntimeTag {
    /// Node belongs to a dequantization chain (Subtract/Multiply).
    Dequantization,
    /// Constant folding must not evaluate this node.
    DisableConstantFolding,
    /// Constant keeps its storage precision through precision conversion.
    KeepConstPrecision,
    /// Node stays in full precision during f32 -> f16 conversion.
    DisableFp16Compression,
    /// Convert that decompresses reduced-precision storage.
    Decompression,
}

impl RuntimeTag {
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeTag::Dequantization => "dequantization_node",
            RuntimeTag::DisableConstantFolding => "disable_const_folding",
            RuntimeTag::KeepConstPrecision => "keep_const_precision",
            RuntimeTag::DisableFp16Compression => "disable_fp16_compression",
            RuntimeTag::Decompression => "decompression",
        }
    }

    /// Whether the tag follows a node into its replacements. Markers that
    /// describe one concrete node stay on that node.
    pub fn is_copyable(&self) -> bool {
        matches!(self, RuntimeTag::DisableFp16Compression)
    }
}

impl fmt::Display for RuntimeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagState {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtInfo {
    tags: BTreeMap<RuntimeTag, TagState>,
    fused_names: BTreeSet<String>,
}

impl RtInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable `tag`. Returns false when it was already enabled.
    pub fn enable(&mut self, tag: RuntimeTag) -> bool {
        self.tags.insert(tag, TagState::Enabled) != Some(TagState::Enabled)
    }

    /// Record an explicit opt-out. Returns false when nothing changed.
    pub fn disable(&mut self, tag: RuntimeTag) -> bool {
        self.tags.insert(tag, TagState::Disabled) != Some(TagState::Disabled)
    }

    pub fn state(&self, tag: RuntimeTag) -> Option<TagState> {
        self.tags.get(&tag).copied()
    }

    pub fn is_enabled(&self, tag: RuntimeTag) -> bool {
        self.state(tag) == Some(TagState::Enabled)
    }

    pub fn is_disabled(&self, tag: RuntimeTag) -> bool {
        self.state(tag) == Some(TagState::Disabled)
    }

    pub fn tags(&self) -> impl Iterator<Item = (RuntimeTag, TagState)> + '_ {
        self.tags.iter().map(|(k, v)| (*k, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn fused_names(&self) -> &BTreeSet<String> {
        &self.fused_names
    }

    pub fn add_fused_name(&mut self, name: impl Into<String>) {
        self.fused_names.insert(name.into());
    }

    /// Union of `other` into `self`. Existing entries win, so a disabled
    /// marker is never flipped by a copy.
    pub fn merge_from(&mut self, other: &RtInfo) {
        for (tag, state) in other.tags() {
            self.tags.entry(tag).or_insert(state);
        }
        self.fused_names.extend(other.fused_names.iter().cloned());
    }

    /// Copy without the listed tags.
    pub fn without(&self, excluded: &[RuntimeTag]) -> RtInfo {
        RtInfo {
            tags: self
                .tags
                .iter()
                .filter(|(k, _)| !excluded.contains(k))
                .map(|(k, v)| (*k, *v))
                .collect(),
            fused_names: self.fused_names.clone(),
        }
    }

    /// Tag-only comparison (provenance ignored).
    pub fn same_tags(&self, other: &RtInfo) -> bool {
        self.tags == other.tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_is_idempotent() {
        let mut rt = RtInfo::new();
        assert!(rt.enable(RuntimeTag::Dequantization));
        assert!(!rt.enable(RuntimeTag::Dequantization));
        assert!(rt.is_enabled(RuntimeTag::Dequantization));
    }

    #[test]
    fn test_disable_is_explicit_state() {
        let mut rt = RtInfo::new();
        assert!(rt.disable(RuntimeTag::KeepConstPrecision));
        assert!(!rt.is_enabled(RuntimeTag::KeepConstPrecision));
        assert!(rt.is_disabled(RuntimeTag::KeepConstPrecision));
        assert!(!rt.disable(RuntimeTag::KeepConstPrecision));
    }

    #[test]
    fn test_merge_keeps_existing_state() {
        let mut a = RtInfo::new();
        a.disable(RuntimeTag::KeepConstPrecision);
        let mut b = RtInfo::new();
        b.enable(RuntimeTag::KeepConstPrecision);
        b.enable(RuntimeTag::Dequantization);
        b.add_fused_name("mul");
        a.merge_from(&b);
        assert!(a.is_disabled(RuntimeTag::KeepConstPrecision));
        assert!(a.is_enabled(RuntimeTag::Dequantization));
        assert!(a.fused_names().contains("mul"));
    }

    #[test]
    fn test_without_filters() {
        let mut a = RtInfo::new();
        a.enable(RuntimeTag::DisableConstantFolding);
        a.enable(RuntimeTag::DisableFp16Compression);
        let b = a.without(&[RuntimeTag::DisableConstantFolding]);
        assert!(!b.is_enabled(RuntimeTag::DisableConstantFolding));
        assert!(b.is_enabled(RuntimeTag::DisableFp16Compression));
    }
}
