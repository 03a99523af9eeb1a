//! Unified error handling for graphforge
//!
//! Every fallible stage of the compiler (shape inference, rewriting,
//! implementation selection, program building, cache loading) reports a
//! [`GraphForgeError`]. Errors are categorised so callers can decide between:
//! - User errors (the graph handed in is invalid)
//! - Recoverable errors (a candidate implementation declined, try the next)
//! - Internal errors (a pass or pattern bug)
//! - Cache errors (a persisted program no longer matches, rebuild it)
//! - Backend errors (no implementation can run a node)

use std::fmt;

/// Unified error type for graphforge
#[derive(Debug, thiserror::Error)]
pub enum GraphForgeError {
    // ========== Graph / Shape Errors ==========
    /// Invalid or incompatible shapes
    #[error("Shape error in {node}: {message}")]
    Shape { node: String, message: String },

    /// Structurally invalid graph (dangling edge, bad output index, ...)
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    // ========== Rewriter Errors ==========
    /// A pattern callback asked for a capture the pattern never bound
    #[error("Pattern assertion failed in {pass}: missing capture '{capture}'")]
    PatternAssertion { pass: String, capture: String },

    // ========== Registry Errors ==========
    /// No registered implementation validates a node
    #[error("No implementation for {kind} node '{node}'")]
    NoImplementation { kind: String, node: String },

    /// A candidate implementation does not support the requested configuration
    #[error("Unsupported configuration for {implementation}: {reason}")]
    UnsupportedConfiguration {
        implementation: String,
        reason: String,
    },

    // ========== Cache Errors ==========
    /// Serialized program metadata disagrees with the current graph or device
    #[error("Program cache mismatch: {0}")]
    CacheMismatch(String),

    // ========== Execution Errors ==========
    /// Reference execution failed (missing input, bad buffer, ...)
    #[error("Execution failed: {0}")]
    Execution(String),

    // ========== I/O Errors ==========
    /// File or stream I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Internal consistency violation (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl GraphForgeError {
    /// Categorize the error for handling decisions
    ///
    /// # Examples
    /// ```ignore
    /// match error.category() {
    ///     ErrorCategory::Recoverable => try_next_candidate(),
    ///     ErrorCategory::Cache => rebuild_program(),
    ///     _ => return Err(error),
    /// }
    /// ```
    pub fn category(&self) -> ErrorCategory {
        match self {
            GraphForgeError::Shape { .. }
            | GraphForgeError::InvalidGraph(_)
            | GraphForgeError::InvalidConfiguration(_) => ErrorCategory::User,

            GraphForgeError::UnsupportedConfiguration { .. } => ErrorCategory::Recoverable,

            GraphForgeError::CacheMismatch(_) | GraphForgeError::Io(_) => ErrorCategory::Cache,

            GraphForgeError::NoImplementation { .. } | GraphForgeError::Execution(_) => {
                ErrorCategory::Backend
            }

            GraphForgeError::PatternAssertion { .. } | GraphForgeError::InternalError(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Whether the caller may fall back to another candidate and carry on
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Recoverable)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }

    /// Convenience constructor for shape errors
    pub fn shape(node: impl Into<String>, message: impl Into<String>) -> Self {
        GraphForgeError::Shape {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for declined implementation candidates
    pub fn unsupported(implementation: impl Into<String>, reason: impl Into<String>) -> Self {
        GraphForgeError::UnsupportedConfiguration {
            implementation: implementation.into(),
            reason: reason.into(),
        }
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The input graph or configuration is invalid
    User,
    /// A candidate declined; selection continues with the next one
    Recoverable,
    /// Bug in a pass, pattern or builder
    Internal,
    /// Persisted program must be discarded and rebuilt
    Cache,
    /// No implementation could run the node
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Cache => write!(f, "Cache"),
            ErrorCategory::Backend => write!(f, "Backend"),
        }
    }
}

impl From<serde_json::Error> for GraphForgeError {
    fn from(err: serde_json::Error) -> Self {
        GraphForgeError::InvalidConfiguration(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type ForgeResult<T> = std::result::Result<T, GraphForgeError>;

// ========== Helper Macros ==========

/// Create a shape error for a named node
///
/// # Examples
/// ```ignore
/// return Err(shape_error!(name, "expected rank 2, got {}", rank));
/// ```
#[macro_export]
macro_rules! shape_error {
    ($node:expr, $msg:expr) => {
        $crate::error::GraphForgeError::shape($node.to_string(), $msg.to_string())
    };
    ($node:expr, $fmt:expr, $($arg:tt)*) => {
        $crate::error::GraphForgeError::shape($node.to_string(), format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::GraphForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::GraphForgeError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Create an invalid-graph error with context
#[macro_export]
macro_rules! graph_error {
    ($msg:expr) => {
        $crate::error::GraphForgeError::InvalidGraph($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::GraphForgeError::InvalidGraph(format!($fmt, $($arg)*))
    };
}

/// Fail a pass when a pattern invariant does not hold
///
/// # Examples
/// ```ignore
/// pattern_assert!(captures.contains(scale), "mark_dequantization", "scale");
/// ```
#[macro_export]
macro_rules! pattern_assert {
    ($cond:expr, $pass:expr, $capture:expr) => {
        if !$cond {
            return Err($crate::error::GraphForgeError::PatternAssertion {
                pass: $pass.to_string(),
                capture: $capture.to_string(),
            });
        }
    };
}

/// Create an execution error with context
#[macro_export]
macro_rules! execution_error {
    ($msg:expr) => {
        $crate::error::GraphForgeError::Execution($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::GraphForgeError::Execution(format!($fmt, $($arg)*))
    };
}

/// Wrap an IO error with context
pub fn io_context(err: std::io::Error, msg: &str) -> GraphForgeError {
    GraphForgeError::Io(std::io::Error::new(err.kind(), format!("{}: {}", msg, err)))
}
