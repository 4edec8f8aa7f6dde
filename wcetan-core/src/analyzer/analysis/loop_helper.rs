//! Loop & Path Helper
//!
//! Context-sensitive reachability on the super graph. The searches respect
//! calling contexts: an in-edge into a `ReturnPoint` from a call point whose
//! context address differs from the active context is ignored, so paths
//! that leave a function through one call site and re-enter through another
//! are never found. Two visits to the same node under different context
//! stacks are distinct and both explored.
//!
//! The helper answers the four questions loop processing needs:
//! - is an edge a loop-causing back edge,
//! - what is the injecting edge of a loop,
//! - is a node on some path between two nodes at the same stack level,
//! - what is the maximum iteration count of a loop.

use bitvec::prelude::*;

use crate::analyzer::analysis::context::ContextStack;
use crate::analyzer::analysis::graph::{ControlFlowGraph, EdgeId, EdgeKind, NodeId, NodeKind};

/// Search direction over the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Along out-edges (successor search).
    Forward,
    /// Against in-edges (predecessor search); call/return roles mirror.
    Backward,
}

impl Direction {
    /// Node kind that enters a callee in this direction (pushes context).
    fn descend_kind(self) -> NodeKind {
        match self {
            Direction::Forward => NodeKind::CallPoint,
            Direction::Backward => NodeKind::ReturnPoint,
        }
    }

    /// Node kind that leaves a callee in this direction (pops context).
    fn ascend_kind(self) -> NodeKind {
        match self {
            Direction::Forward => NodeKind::ReturnPoint,
            Direction::Backward => NodeKind::CallPoint,
        }
    }
}

/// Context-sensitive loop and path queries over one graph.
pub struct LoopHelper<'g> {
    graph: &'g ControlFlowGraph,
    entry: NodeId,
    exit: NodeId,
}

impl<'g> LoopHelper<'g> {
    pub fn new(graph: &'g ControlFlowGraph, entry: NodeId, exit: NodeId) -> Self {
        Self { graph, entry, exit }
    }

    /// Maximum iteration count of the loop closed by `back_edge`, read from
    /// the circulation of its injecting edge. −1 when unknown.
    pub fn loop_bound(&self, loop_head: NodeId, back_edge: EdgeId) -> i64 {
        let bound = match self.injecting_edge(loop_head, back_edge) {
            Some(inj) => self.graph.edge(inj).circulation,
            None => -1,
        };
        log::debug!(
            "loop bound for head {} ({}): {}",
            loop_head,
            self.graph.node(loop_head).label,
            bound
        );
        bound
    }

    /// True iff the target of the back edge reaches its source again using
    /// only forward/meta edges and non-loop-causing back edges.
    pub fn is_loop_causing_back_edge(&self, back_edge: EdgeId) -> bool {
        let e = self.graph.edge(back_edge);
        let connected = self.is_connected(e.to, e.from);
        log::debug!(
            "back edge {} -> {} {} a loop",
            self.graph.node(e.from).label,
            self.graph.node(e.to).label,
            if connected { "causes" } else { "does not cause" }
        );
        connected
    }

    /// The injecting edge of the loop with the given head and back edge:
    /// the forward/meta edge by which control first enters the loop body.
    pub fn injecting_edge(&self, loop_head: NodeId, back_edge: EdgeId) -> Option<EdgeId> {
        let e = self.graph.edge(back_edge);
        let path = self.path_between(e.to, e.from);
        let result = self.injecting_edge_for_path(&path);
        if result.is_none() {
            log::warn!(
                "no injecting edge found for loop head {} ({})",
                loop_head,
                self.graph.node(loop_head).label
            );
        }
        result
    }

    /// True if the two nodes are connected by a context-valid path of
    /// forward/meta edges.
    pub fn is_connected(&self, start: NodeId, end: NodeId) -> bool {
        !self.path_between(start, end).is_empty()
    }

    /// True if `node` lies on some path from `begin` to `end`.
    ///
    /// `same_stack_level` requires all three nodes in the same function.
    /// The search uses `end` as barrier for the predecessor half and
    /// `begin` for the successor half, so it can never leave the region
    /// through one call site and re-enter through another.
    pub fn is_node_on_path(
        &self,
        node: NodeId,
        begin: NodeId,
        end: NodeId,
        same_stack_level: bool,
    ) -> bool {
        if node == begin || node == end {
            return true;
        }
        if begin == end {
            return false;
        }
        let is_pred = self.search(Direction::Backward, begin, node, end, true, same_stack_level);
        let is_succ = self.search(Direction::Forward, end, node, begin, true, same_stack_level);
        is_pred && is_succ
    }

    /// True if `predecessor` can reach `node` going forward (i.e. it lies
    /// behind `node` against the edges). Barrier defaults to the graph exit,
    /// which cannot precede anything.
    pub fn is_predecessor(
        &self,
        predecessor: NodeId,
        node: NodeId,
        consider_context: bool,
        same_stack_level: bool,
    ) -> bool {
        self.search(
            Direction::Backward,
            predecessor,
            node,
            self.exit,
            consider_context,
            same_stack_level,
        )
    }

    /// True if `successor` is reachable from `node`. Barrier defaults to
    /// the graph entry, which cannot succeed anything.
    pub fn is_successor(
        &self,
        successor: NodeId,
        node: NodeId,
        consider_context: bool,
        same_stack_level: bool,
    ) -> bool {
        self.search(
            Direction::Forward,
            successor,
            node,
            self.entry,
            consider_context,
            same_stack_level,
        )
    }

    /// One context-valid path from `start` to `end` along ForwardStep,
    /// ForwardJump and Meta edges, including both endpoints. Empty when no
    /// path exists; a single node when `start == end`.
    pub fn path_between(&self, start: NodeId, end: NodeId) -> Vec<NodeId> {
        let mut path: Vec<NodeId> = Vec::new();

        if start == end {
            path.push(start);
            return path;
        }

        let mut processing: Vec<NodeId> = vec![start];
        let mut processed: BitVec<u32> = bitvec![u32, Lsb0; 0; self.graph.nodes.len()];
        let mut function_stack: Vec<NodeId> = Vec::new();

        while let Some(&actual) = processing.last() {
            if processed[actual as usize] {
                // dead end: retract the node from the active path
                processing.pop();
                path.pop();
                match self.graph.node(actual).kind {
                    NodeKind::CallPoint => {
                        function_stack.pop();
                    }
                    NodeKind::ReturnPoint => {
                        function_stack.push(actual);
                    }
                    _ => {}
                }
                continue;
            }

            if path.last() != Some(&actual) {
                path.push(actual);
            }

            match self.graph.node(actual).kind {
                NodeKind::CallPoint => function_stack.push(actual),
                NodeKind::ReturnPoint => {
                    if function_stack.pop().is_none() {
                        // leaving the initial function upwards; tolerated,
                        // mismatches are filtered at the out-edge check
                    }
                }
                _ => {}
            }

            let mut unhandled_edge = false;
            let out_ids: Vec<EdgeId> = self.graph.nodes[actual as usize].out_edges.to_vec();
            for eid in out_ids {
                let e = self.graph.edge(eid);
                if !matches!(
                    e.kind,
                    EdgeKind::ForwardStep | EdgeKind::ForwardJump | EdgeKind::Meta
                ) {
                    continue;
                }
                let tgt = e.to;
                if tgt == end {
                    if !function_stack.is_empty() {
                        log::warn!("path endpoints are not on the same stack level");
                    }
                    path.push(tgt);
                    return path;
                }
                if processed[tgt as usize] {
                    continue;
                }
                // a return point reached under the wrong call context is
                // not a real successor
                if self.graph.node(tgt).kind == NodeKind::ReturnPoint {
                    if let Some(&top) = function_stack.last() {
                        if self.graph.node(top).end_addr != self.graph.node(tgt).end_addr {
                            continue;
                        }
                    }
                }
                processing.push(tgt);
                unhandled_edge = true;
            }
            if !unhandled_edge {
                processed.set(actual as usize, true);
            }
        }
        Vec::new()
    }

    /// Locate the injecting edge of a loop-body path (head first, tail
    /// last): an in-edge at stack level zero whose source is neither on the
    /// path nor on any other path between head and tail. Candidates with a
    /// known circulation win over unconstrained ones (multi-entry loops).
    fn injecting_edge_for_path(&self, path: &[NodeId]) -> Option<EdgeId> {
        if path.is_empty() {
            return None;
        }
        let mut context = ContextStack::new();
        let mut fallback: Option<EdgeId> = None;

        for &actual in path.iter().rev() {
            match self.graph.node(actual).kind {
                NodeKind::ReturnPoint => context.push(self.graph.node(actual).end_addr),
                NodeKind::CallPoint => {
                    context.pop();
                }
                _ => {}
            }
            if context.top() != 0 {
                continue;
            }
            let in_ids: Vec<EdgeId> = self.graph.nodes[actual as usize].in_edges.to_vec();
            for eid in in_ids {
                let e = self.graph.edge(eid);
                if !matches!(
                    e.kind,
                    EdgeKind::ForwardStep | EdgeKind::ForwardJump | EdgeKind::Meta
                ) {
                    continue;
                }
                let src = e.from;
                if path.contains(&src) {
                    continue;
                }
                if self.is_node_on_path(src, path[0], *path.last().unwrap(), true) {
                    continue;
                }
                // a valid circulation identifies the true entry among
                // multiple candidates
                if e.circulation != -1 {
                    log::debug!(
                        "injecting edge {} -> {} verified by loop constraint {}",
                        self.graph.node(src).label,
                        self.graph.node(actual).label,
                        e.circulation
                    );
                    return Some(eid);
                }
                if fallback.is_none() {
                    fallback = Some(eid);
                }
            }
        }
        fallback
    }

    /// Worklist search for `wanted` starting at `from`, moving in the given
    /// direction. The visited set is keyed by `(node, context stack)`; the
    /// barrier node is never traversed.
    fn search(
        &self,
        direction: Direction,
        wanted: NodeId,
        from: NodeId,
        barrier: NodeId,
        consider_context: bool,
        same_stack_level: bool,
    ) -> bool {
        let descend = direction.descend_kind();
        let ascend = direction.ascend_kind();

        let mut processing: Vec<NodeId> = vec![from];
        let mut processed: Vec<(NodeId, ContextStack)> = Vec::new();
        let mut context = ContextStack::new();

        let already_processed = |processed: &[(NodeId, ContextStack)],
                                 node: NodeId,
                                 ctx: &ContextStack| {
            processed
                .iter()
                .any(|(n, c)| *n == node && (!consider_context || c == ctx))
        };

        while let Some(&actual) = processing.last() {
            let actual_kind = self.graph.node(actual).kind;
            let actual_end = self.graph.node(actual).end_addr;

            let mut chk_ctx = context.clone();
            if actual_kind == descend {
                chk_ctx.pop();
            }

            if already_processed(&processed, actual, &chk_ctx) {
                processing.pop();
                // undo the context adjustment this node applied
                if actual_kind == descend {
                    context.pop();
                } else if actual_kind == ascend {
                    context.push(actual_end);
                }
                continue;
            }

            if actual_kind == descend {
                if context.top() != actual_end {
                    context.push(actual_end);
                }
            } else if actual_kind == ascend && context.top() == actual_end {
                if context.is_empty() {
                    log::warn!("context stack underflow at node {}", actual);
                } else {
                    context.pop();
                }
            }

            let mut unhandled_edge = false;
            let edge_ids: Vec<EdgeId> = match direction {
                Direction::Forward => self.graph.nodes[actual as usize].out_edges.to_vec(),
                Direction::Backward => self.graph.nodes[actual as usize].in_edges.to_vec(),
            };
            for eid in edge_ids {
                let e = self.graph.edge(eid);
                let admissible = matches!(
                    e.kind,
                    EdgeKind::ForwardStep | EdgeKind::ForwardJump | EdgeKind::Meta
                ) || (e.kind == EdgeKind::BackwardJump
                    && !self.is_loop_causing_back_edge(eid));
                if !admissible {
                    continue;
                }
                let neighbor = match direction {
                    Direction::Forward => e.to,
                    Direction::Backward => e.from,
                };
                if neighbor == wanted && (!same_stack_level || context.is_empty()) {
                    return true;
                }
                let neighbor_kind = self.graph.node(neighbor).kind;
                let neighbor_end = self.graph.node(neighbor).end_addr;

                let mut neighbor_ctx = context.clone();
                if neighbor_kind == ascend {
                    neighbor_ctx.pop();
                }
                if already_processed(&processed, neighbor, &neighbor_ctx) {
                    continue;
                }
                // a call/return point with a context that does not match
                // the active one closes an impossible path
                if neighbor_kind == ascend
                    && (context.is_empty() || context.top() != neighbor_end)
                {
                    continue;
                }
                if neighbor == barrier {
                    continue;
                }
                processing.push(neighbor);
                unhandled_edge = true;
            }

            if !unhandled_edge {
                let mut record_ctx = context.clone();
                if actual_kind == descend {
                    record_ctx.pop();
                }
                processed.push((actual, record_ctx));
            }
        }
        false
    }
}
