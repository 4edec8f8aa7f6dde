//! Graph Structures
//!
//! This module provides the arena-backed graph representation shared by the
//! per-function CFGs and the inlined super graph, plus the memory state
//! graph produced by the VIVU transform.
//!
//! # Memory Layout
//! - Each graph owns a contiguous `Vec` of nodes and a `Vec` of edges
//! - Handles are `u32` indices; cross-graph references (MSG → SCFG) are
//!   plain node indices resolved through the owning graph
//! - `NodeKind`/`EdgeKind` use `#[repr(u8)]` to save 3 bytes per record
//! - Per-node edge lists use `SmallVec<[u32; 2]>` (most nodes have ≤2)
//!
//! # Mutation discipline
//! Each graph has two phases: build (exclusive writer through the builder
//! types) and annotate (exclusive writer of the cost/flow/activation edge
//! attributes). Readers only see sealed graphs.

use smallvec::SmallVec;
use std::fmt;

/// Node handle within one graph.
pub type NodeId = u32;
/// Edge handle within one graph.
pub type EdgeId = u32;

/// Sentinel for unresolved addresses (unknown indirect targets).
pub const UNKNOWN_ADDR: u32 = 0xffff_ffff;

/// Node kinds of the control flow graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeKind {
    /// Function (or super graph) entry.
    Entry = 0,
    /// Function (or super graph) exit.
    Exit = 1,
    /// Maximal straight-line instruction sequence.
    BasicBlock = 2,
    /// Unsplit call site (pre-inlining only).
    CallSite = 3,
    /// Call half of a split call site.
    CallPoint = 4,
    /// Return half of a split call site.
    ReturnPoint = 5,
    /// Target of an unresolved indirect branch.
    UnknownJumpTarget = 6,
    /// Topological join of the flows leaving a peeled first loop iteration.
    FlowJoinNode = 7,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Entry => "Entry",
            NodeKind::Exit => "Exit",
            NodeKind::BasicBlock => "BasicBlock",
            NodeKind::CallSite => "CallSite",
            NodeKind::CallPoint => "CallPoint",
            NodeKind::ReturnPoint => "ReturnPoint",
            NodeKind::UnknownJumpTarget => "UnknownJumpTarget",
            NodeKind::FlowJoinNode => "FlowJoinNode",
        };
        write!(f, "{}", s)
    }
}

/// Edge kinds of the control flow graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EdgeKind {
    /// Fallthrough to the immediately following address.
    ForwardStep = 0,
    /// Address-increasing branch.
    ForwardJump = 1,
    /// Address-decreasing branch.
    BackwardJump = 2,
    /// Graph plumbing: entry→first BB, last BB→exit, call/return wiring.
    Meta = 3,
    /// Back edge of a peeled first iteration, redirected forward to the
    /// flow join node of the rest of the iterations.
    ForwardStepUnroll = 4,
    /// Optional back arc from exit to entry.
    InductingBackEdge = 5,
}

/// Node record.
///
/// Basic blocks keep their dump text verbatim in `code` (one line per
/// instruction) so that a later rewriting stage can re-emit it.
#[derive(Debug, Clone)]
pub struct CfgNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Start address of the block; `UNKNOWN_ADDR` for synthetic nodes.
    pub start_addr: u32,
    /// End address; for call/return points this is the *context address*
    /// (the end address of the calling basic block) that pairs them.
    pub end_addr: u32,
    /// Display label (address string, function entry/exit marker, ...).
    pub label: String,
    /// Callee address for call-site/call-point/return-point nodes.
    pub call_target: u32,
    /// Verbatim dump lines of the block, newline separated.
    pub code: String,
    /// Block size in bytes.
    pub size: u32,
    /// Number of instructions in the block.
    pub instr_count: u32,
    /// Inlining context id (stamped on the expanded graph).
    pub context_id: u32,
    /// Outgoing edge ids.
    pub out_edges: SmallVec<[EdgeId; 2]>,
    /// Incoming edge ids.
    pub in_edges: SmallVec<[EdgeId; 2]>,
}

/// Edge record with the annotation slots written by the cost engine and
/// the ILP result mapping.
#[derive(Debug, Clone)]
pub struct CfgEdge {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
    /// Maximum traversal count per run; −1 = unknown.
    pub circulation: i64,
    /// Cost selected for the configured memory mode.
    pub cost: u32,
    pub cost_onchip: u32,
    pub cost_offchip: u32,
    /// Off-chip minus on-chip penalty for non-assigned blocks.
    pub mem_penalty: u32,
    /// Traversal count on the worst-case path (ILP result).
    pub activation: u64,
}

/// Arena control flow graph.
///
/// Used both for per-function CFGs and for the inlined super graph; the
/// super graph is simply a CFG whose call sites have been split into
/// `CallPoint`/`ReturnPoint` pairs.
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    pub nodes: Vec<CfgNode>,
    pub edges: Vec<CfgEdge>,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with the given kind and addresses; remaining attributes
    /// start empty and are filled by the builders.
    pub fn add_node(&mut self, kind: NodeKind, start_addr: u32, end_addr: u32) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(CfgNode {
            id,
            kind,
            start_addr,
            end_addr,
            label: String::new(),
            call_target: UNKNOWN_ADDR,
            code: String::new(),
            size: 0,
            instr_count: 0,
            context_id: 0,
            out_edges: SmallVec::new(),
            in_edges: SmallVec::new(),
        });
        id
    }

    /// Add an edge and register it in both endpoint edge lists.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) -> EdgeId {
        let id = self.edges.len() as EdgeId;
        self.edges.push(CfgEdge {
            id,
            from,
            to,
            kind,
            circulation: -1,
            cost: 0,
            cost_onchip: 0,
            cost_offchip: 0,
            mem_penalty: 0,
            activation: 0,
        });
        self.nodes[from as usize].out_edges.push(id);
        self.nodes[to as usize].in_edges.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> &CfgNode {
        &self.nodes[id as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut CfgNode {
        &mut self.nodes[id as usize]
    }

    pub fn edge(&self, id: EdgeId) -> &CfgEdge {
        &self.edges[id as usize]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut CfgEdge {
        &mut self.edges[id as usize]
    }

    /// Iterate the outgoing edges of a node.
    pub fn out_edges(&self, id: NodeId) -> impl Iterator<Item = &CfgEdge> {
        self.nodes[id as usize]
            .out_edges
            .iter()
            .map(move |&e| &self.edges[e as usize])
    }

    /// Iterate the incoming edges of a node.
    pub fn in_edges(&self, id: NodeId) -> impl Iterator<Item = &CfgEdge> {
        self.nodes[id as usize]
            .in_edges
            .iter()
            .map(move |&e| &self.edges[e as usize])
    }

    pub fn out_degree(&self, id: NodeId) -> usize {
        self.nodes[id as usize].out_edges.len()
    }

    pub fn in_degree(&self, id: NodeId) -> usize {
        self.nodes[id as usize].in_edges.len()
    }

    /// Find the unique node of the given kind, if present.
    pub fn find_node_of_kind(&self, kind: NodeKind) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.kind == kind).map(|n| n.id)
    }

    /// Number of incoming `BackwardJump` edges of a node.
    pub fn back_edge_in_degree(&self, id: NodeId) -> u32 {
        self.in_edges(id)
            .filter(|e| e.kind == EdgeKind::BackwardJump)
            .count() as u32
    }

    /// Move an edge to leave a different source node, keeping its id and
    /// target stable.
    ///
    /// Used when a call site is split and its out edges move to the fresh
    /// return point.
    pub fn redirect_edge_source(&mut self, eid: EdgeId, new_from: NodeId) {
        let old_from = self.edges[eid as usize].from;
        self.nodes[old_from as usize]
            .out_edges
            .retain(|&mut e| e != eid);
        self.edges[eid as usize].from = new_from;
        self.nodes[new_from as usize].out_edges.push(eid);
    }
}

/// Memory state graph node.
///
/// Every node mirrors exactly one super-graph node (`mapped`), except the
/// purely topological flow join nodes which mirror none.
#[derive(Debug, Clone)]
pub struct MsgNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// The mirrored SCFG node; `None` only for `FlowJoinNode`s.
    pub mapped: Option<NodeId>,
    /// Inlining context id distinguishing callee copies.
    pub context_id: u32,
    pub out_edges: SmallVec<[EdgeId; 2]>,
    pub in_edges: SmallVec<[EdgeId; 2]>,
}

/// Memory state graph edge, carrying the VIVU-adjusted flow value.
#[derive(Debug, Clone)]
pub struct MsgEdge {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
    /// Flow (circulation) after VIVU adjustment; −1 = unknown.
    pub flow: i64,
}

/// VIVU-transformed memory state graph.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateGraph {
    pub nodes: Vec<MsgNode>,
    pub edges: Vec<MsgEdge>,
}

impl MemoryStateGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, kind: NodeKind, mapped: Option<NodeId>) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(MsgNode {
            id,
            kind,
            mapped,
            context_id: 0,
            out_edges: SmallVec::new(),
            in_edges: SmallVec::new(),
        });
        id
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind, flow: i64) -> EdgeId {
        let id = self.edges.len() as EdgeId;
        self.edges.push(MsgEdge {
            id,
            from,
            to,
            kind,
            flow,
        });
        self.nodes[from as usize].out_edges.push(id);
        self.nodes[to as usize].in_edges.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> &MsgNode {
        &self.nodes[id as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut MsgNode {
        &mut self.nodes[id as usize]
    }

    pub fn edge(&self, id: EdgeId) -> &MsgEdge {
        &self.edges[id as usize]
    }

    pub fn out_edges(&self, id: NodeId) -> impl Iterator<Item = &MsgEdge> {
        self.nodes[id as usize]
            .out_edges
            .iter()
            .map(move |&e| &self.edges[e as usize])
    }

    pub fn in_edges(&self, id: NodeId) -> impl Iterator<Item = &MsgEdge> {
        self.nodes[id as usize]
            .in_edges
            .iter()
            .map(move |&e| &self.edges[e as usize])
    }

    pub fn in_degree(&self, id: NodeId) -> usize {
        self.nodes[id as usize].in_edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_register_in_both_endpoints() {
        let mut g = ControlFlowGraph::new();
        let a = g.add_node(NodeKind::BasicBlock, 0x100, 0x102);
        let b = g.add_node(NodeKind::BasicBlock, 0x104, 0x106);
        let e = g.add_edge(a, b, EdgeKind::ForwardStep);
        assert_eq!(g.out_degree(a), 1);
        assert_eq!(g.in_degree(b), 1);
        assert_eq!(g.edge(e).from, a);
        assert_eq!(g.edge(e).to, b);
        assert_eq!(g.edge(e).circulation, -1);
    }

    #[test]
    fn redirecting_an_edge_moves_it_between_sources() {
        let mut g = ControlFlowGraph::new();
        let a = g.add_node(NodeKind::CallSite, 0x100, 0x102);
        let b = g.add_node(NodeKind::BasicBlock, 0x104, 0x106);
        let r = g.add_node(NodeKind::ReturnPoint, UNKNOWN_ADDR, 0x102);
        let e = g.add_edge(a, b, EdgeKind::ForwardStep);
        g.redirect_edge_source(e, r);
        assert_eq!(g.out_degree(a), 0);
        assert_eq!(g.out_degree(r), 1);
        assert_eq!(g.edge(e).from, r);
        assert_eq!(g.in_degree(b), 1);
    }

    #[test]
    fn msg_flow_join_maps_to_nothing() {
        let mut m = MemoryStateGraph::new();
        let j = m.add_node(NodeKind::FlowJoinNode, None);
        assert!(m.node(j).mapped.is_none());
    }
}
