//! Error Handling
//!
//! This module provides the error types for the analyzer using `thiserror`.
//! Fatal conditions bubble up as typed failures and terminate the process
//! with a distinct exit code per kind; recoverable conditions are surfaced
//! as log records at their origin.
//!
//! # Error Categories
//! - **Decode errors**: unknown or malformed instruction encodings
//! - **Parse errors**: dump-file structure violations, parser state drift
//! - **Graph errors**: recursion during inlining, unpaired call/return points
//! - **Solver errors**: LP infeasibility, missing solver binary
//! - **Export errors**: WC-path traversal failures

use thiserror::Error;

/// Analyzer error types.
///
/// Uses `thiserror` for zero-cost error handling with detailed error messages.
/// Each variant maps to a distinct process exit code via [`AnalyzerError::exit_code`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerError {
    /// Instruction decoding error.
    ///
    /// Occurs when an opcode cannot be classified (unknown encoding, malformed dump).
    /// Malformed dumps must not be silently reclassified as arithmetic.
    #[error("Instruction decode error at 0x{address:08X}: {opcode}")]
    DecodeError { address: u32, opcode: String },

    /// Dump parsing error.
    ///
    /// Occurs when the dump file structure is invalid (missing entry label,
    /// instructions outside any basic block, unsealed function CFG).
    #[error("Dump parse error: {0}")]
    ParseError(String),

    /// Recursion detected during inlining.
    ///
    /// The super graph cannot represent recursive call cycles.
    #[error("Recursion detected while inlining: {cycle}")]
    RecursionError { cycle: String },

    /// Graph structure error.
    ///
    /// Occurs when a structural invariant is violated (unpaired return point,
    /// missing loop injecting edge, entry/exit not found).
    #[error("Graph error: {0}")]
    GraphError(String),

    /// Flow fact file error.
    #[error("Flow fact error: {0}")]
    FlowFactError(String),

    /// LP generation or solving error.
    ///
    /// Occurs when the LP solver cannot be located or invoked, or when the
    /// solution is infeasible/unbounded with no fallback.
    #[error("LP solver error: {0}")]
    SolverError(String),

    /// WC-path export error.
    ///
    /// Occurs when the activation-annotated graph cannot be traversed.
    #[error("WC-path export error: {0}")]
    ExportError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AnalyzerError {
    /// Process exit code for this error kind.
    ///
    /// 0 is success; every fatal kind gets its own non-zero code so callers
    /// and test harnesses can distinguish failure causes.
    pub fn exit_code(&self) -> i32 {
        match self {
            AnalyzerError::DecodeError { .. } => 2,
            AnalyzerError::ParseError(_) => 3,
            AnalyzerError::RecursionError { .. } => 4,
            AnalyzerError::GraphError(_) => 5,
            AnalyzerError::FlowFactError(_) => 6,
            AnalyzerError::SolverError(_) => 7,
            AnalyzerError::ExportError(_) => 8,
            AnalyzerError::ConfigError(_) => 9,
        }
    }
}

impl From<std::io::Error> for AnalyzerError {
    #[cold] // Error paths are cold
    fn from(err: std::io::Error) -> Self {
        AnalyzerError::ParseError(format!("IO error: {}", err))
    }
}

/// Result alias used throughout the analyzer core.
pub type Result<T> = std::result::Result<T, AnalyzerError>;
