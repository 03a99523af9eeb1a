//! Pattern-matching graph rewriter.
//!
//! - [`pattern`]: composable pattern trees
//! - [`matcher`]: read-only matching and captures
//! - [`manager`]: `GraphRewrite` driver and `PassManager` pipelines
//! - [`passes`]: the compiler's rewrite passes

pub mod manager;
pub mod matcher;
pub mod passes;
pub mod pattern;

pub use manager::{
    copy_runtime_info, GraphPass, GraphRewrite, PassManager, RewriteContext, RewriteStats,
};
pub use matcher::{Captures, Matcher};
pub use pattern::{
    consumers_count, has_static_shape, rank_equals, type_matches_any, Pattern, PatternBuilder,
    PatternId, Predicate,
};
