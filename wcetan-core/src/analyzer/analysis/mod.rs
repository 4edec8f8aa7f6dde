//! Analysis Module
//!
//! Graph construction and transformation: per-function CFG assembly, the
//! inlined super graph, context-sensitive loop and path queries, the VIVU
//! transform into the memory state graph, and its expansion back into an
//! annotated control flow graph for the ILP and the path export.

pub mod cfg_builder;
pub mod context;
pub mod graph;
pub mod loop_helper;
pub mod msg_expand;
pub mod super_graph;
pub mod vivu;

// Re-export commonly used types
pub use cfg_builder::{AddrLabel, CfgBuilder, FunctionCfg};
pub use context::ContextStack;
pub use graph::{ControlFlowGraph, EdgeKind, MemoryStateGraph, NodeId, NodeKind};
pub use loop_helper::LoopHelper;
pub use msg_expand::{expand_msg, ExpandedGraph};
pub use super_graph::{build_super_graph, ParsedFunction, Program, SuperGraph};
pub use vivu::{build_vivu_graph, VivuGraph};
