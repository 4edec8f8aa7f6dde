//! VIVU Transform
//!
//! Builds the memory state graph (MSG) from the super graph by virtual
//! inlining and virtual unrolling: every call site gets its own callee copy
//! stamped with a fresh context id, and the first iteration of every loop
//! with a known positive bound is peeled off so that later must/may
//! analyses become single-iteration problems.
//!
//! Back edges of the peeled first iteration are converted into
//! `ForwardStepUnroll` edges that meet in a `FlowJoinNode`; the join node
//! has a single `Meta` edge into the head of the rest-of-iterations copy,
//! and all iteration flow accounting lives on that edge.

use std::collections::HashMap;

use crate::analyzer::analysis::graph::{
    ControlFlowGraph, EdgeId, EdgeKind, MemoryStateGraph, NodeId, NodeKind,
};
use crate::analyzer::analysis::loop_helper::LoopHelper;
use crate::analyzer::analysis::super_graph::SuperGraph;
use crate::analyzer::error::{AnalyzerError, Result};

/// MSG bundled with its entry/exit nodes.
#[derive(Debug, Clone)]
pub struct VivuGraph {
    pub msg: MemoryStateGraph,
    pub entry: NodeId,
    pub exit: NodeId,
}

/// Loop head with the precipitant loop exits registered for it so far.
///
/// A precipitant exit is an interim jump back to the loop head (a continue
/// statement); only the last unhandled back edge of a head triggers the
/// peel, the registered ones are joined to the rest-head's flow join node.
struct LoopExits {
    loop_head: NodeId,
    exits: Vec<NodeId>,
}

pub struct VivuTransformer<'g> {
    scfg: &'g ControlFlowGraph,
    cfg_entry: NodeId,
    cfg_exit: NodeId,
    msg: MemoryStateGraph,
    msg_entry: NodeId,
    msg_exit: NodeId,
    /// Instantiation counter per context address, kept for diagnostics.
    context_visits: HashMap<u32, u32>,
    /// Globally fresh context id source; 0 is the root context.
    next_context_id: u32,
}

impl<'g> VivuTransformer<'g> {
    pub fn new(super_graph: &'g SuperGraph) -> Self {
        Self {
            scfg: &super_graph.graph,
            cfg_entry: super_graph.entry,
            cfg_exit: super_graph.exit,
            msg: MemoryStateGraph::new(),
            msg_entry: 0,
            msg_exit: 0,
            context_visits: HashMap::new(),
            next_context_id: 1,
        }
    }

    /// Build the MSG for the whole super graph.
    pub fn transform(mut self) -> Result<VivuGraph> {
        if self.scfg.node(self.cfg_entry).kind != NodeKind::Entry {
            return Err(AnalyzerError::GraphError(
                "super graph entry node has wrong kind".to_string(),
            ));
        }
        if self.scfg.node(self.cfg_exit).kind != NodeKind::Exit {
            return Err(AnalyzerError::GraphError(
                "super graph exit node has wrong kind".to_string(),
            ));
        }
        self.msg_entry = self.msg.add_node(NodeKind::Entry, Some(self.cfg_entry));
        self.msg_exit = self.msg.add_node(NodeKind::Exit, Some(self.cfg_exit));

        let end = self.build_region((self.cfg_entry, self.msg_entry), self.cfg_exit, 0)?;
        if end != self.msg_exit {
            return Err(AnalyzerError::GraphError(
                "virtual unrolling did not terminate at the super graph exit".to_string(),
            ));
        }

        Ok(VivuGraph {
            entry: self.msg_entry,
            exit: self.msg_exit,
            msg: self.msg,
        })
    }

    /// Mirror one sequential region from `start` to `end` into the MSG.
    ///
    /// Loops inside the region are unrolled by stripping off the first
    /// iteration (already mirrored when the back edge is found) and calling
    /// this function recursively for the rest of the iterations; call
    /// points recurse into their callee bounded by its entry/exit pair.
    ///
    /// Returns the MSG node corresponding to `end`.
    fn build_region(
        &mut self,
        start: (NodeId, NodeId),
        end: NodeId,
        ctx: u32,
    ) -> Result<NodeId> {
        let helper = LoopHelper::new(self.scfg, self.cfg_entry, self.cfg_exit);
        let mut processing: Vec<(NodeId, NodeId)> = vec![start];
        let mut processed: Vec<NodeId> = Vec::new();
        let mut loop_exits: Vec<LoopExits> = Vec::new();
        let mut region_map: HashMap<NodeId, NodeId> = HashMap::new();
        let mut msg_end = start.1;

        region_map.insert(start.0, start.1);

        log::debug!(
            "mirroring region {} -> {} (ctx {})",
            self.scfg.node(start.0).label,
            self.scfg.node(end).label,
            ctx
        );

        while let Some((actual_cfg, actual_msg)) = processing.pop() {
            if processed.contains(&actual_cfg) {
                continue;
            }
            processed.push(actual_cfg);

            if actual_cfg == end {
                msg_end = actual_msg;
                log::debug!("found region end {}", self.scfg.node(end).label);
                continue;
            }

            if self.scfg.node(actual_cfg).kind == NodeKind::CallPoint {
                let return_pair = self.mirror_call(actual_cfg, actual_msg)?;
                processing.push(return_pair);
                continue;
            }

            // handle all back edges of the node first, peeling the loop the
            // last unhandled one closes
            let mut found_bw = false;
            let mut msg_return = actual_msg;
            let out_ids: Vec<EdgeId> = self.scfg.nodes[actual_cfg as usize].out_edges.to_vec();

            for &eid in &out_ids {
                let e = self.scfg.edge(eid);
                if e.kind != EdgeKind::BackwardJump {
                    continue;
                }
                let loop_head = e.to;
                if loop_head == start.0 {
                    // the back edge of the region's own loop; the caller
                    // wires it after this region returns
                    continue;
                }
                if !helper.is_loop_causing_back_edge(eid) {
                    continue;
                }
                if helper.loop_bound(loop_head, eid) <= 0 {
                    continue;
                }

                if !self.is_last_unhandled_loop_edge(&loop_exits, loop_head) {
                    log::debug!(
                        "registering precipitant exit of loop head {} from {}",
                        self.scfg.node(loop_head).label,
                        self.scfg.node(actual_cfg).label
                    );
                    Self::register_loop_exit(&mut loop_exits, actual_msg, loop_head);
                    continue;
                }

                log::debug!(
                    "peeling loop at head {} (back edge from {})",
                    self.scfg.node(loop_head).label,
                    self.scfg.node(actual_cfg).label
                );
                found_bw = true;

                let injecting = helper.injecting_edge(loop_head, eid).ok_or_else(|| {
                    AnalyzerError::GraphError(format!(
                        "loop at {} has a bound but no injecting edge",
                        self.scfg.node(loop_head).label
                    ))
                })?;

                // the back edge becomes a ForwardStepUnroll into the rest
                // of the iterations
                let rest_head = self.add_msg_vertex(
                    (actual_cfg, actual_msg),
                    loop_head,
                    None,
                    EdgeKind::ForwardStepUnroll,
                    injecting,
                    ctx,
                )?;

                // redirect the registered precipitant exits of the first
                // iteration to the same flow join node
                let join = self.flow_join_node_of(rest_head)?;
                self.add_unroll_edges_for_head(&mut loop_exits, loop_head, join);

                msg_return = self.build_region((loop_head, rest_head), actual_cfg, ctx)?;

                // back edge of the rest of the iterations, kept for flow
                // analysis
                let circ = self.scfg.edge(eid).circulation;
                self.msg
                    .add_edge(msg_return, rest_head, EdgeKind::BackwardJump, circ);
            }

            // mirror the forward out-edges
            for &eid in &out_ids {
                let e = self.scfg.edge(eid);
                let target_cfg = e.to;
                let etype = e.kind;

                // skip nodes that are not part of this region
                let node_connected = if self.cfg_exit != end && self.cfg_entry != start.0 {
                    helper.is_node_on_path(target_cfg, start.0, end, false)
                } else {
                    true
                };
                if !node_connected {
                    log::debug!(
                        "target {} is not on the region path, skipping",
                        self.scfg.node(target_cfg).label
                    );
                    continue;
                }

                let forward_like = matches!(
                    etype,
                    EdgeKind::ForwardStep | EdgeKind::ForwardJump | EdgeKind::Meta
                ) || (etype == EdgeKind::BackwardJump
                    && !helper.is_loop_causing_back_edge(eid));

                if forward_like {
                    // return points are mirrored when their call point is
                    if self.scfg.node(target_cfg).kind == NodeKind::ReturnPoint {
                        continue;
                    }
                    let source_msg = if found_bw { msg_return } else { actual_msg };
                    let new_msg = self.add_msg_vertex(
                        (actual_cfg, source_msg),
                        target_cfg,
                        Some(&mut region_map),
                        etype,
                        eid,
                        ctx,
                    )?;
                    processing.push((target_cfg, new_msg));
                } else if etype == EdgeKind::BackwardJump {
                    if target_cfg == start.0 {
                        if actual_cfg != end {
                            // secondary back edge inside the rest of the
                            // iterations
                            self.msg
                                .add_edge(actual_msg, start.1, EdgeKind::BackwardJump, -1);
                        }
                    } else if helper.is_loop_causing_back_edge(eid)
                        && helper.loop_bound(target_cfg, eid) <= 0
                    {
                        // unknown bound: the loop stays rolled and the back
                        // edge stays unconstrained; the ILP reports the
                        // resulting unbounded problem instead of guessing
                        log::warn!(
                            "loop at {} has no known bound, keeping unconstrained back edge",
                            self.scfg.node(target_cfg).label
                        );
                        self.add_msg_vertex(
                            (actual_cfg, actual_msg),
                            target_cfg,
                            Some(&mut region_map),
                            EdgeKind::BackwardJump,
                            eid,
                            ctx,
                        )?;
                    }
                }
            }
        }

        Ok(msg_end)
    }

    /// Mirror a call point: recurse into the callee body with a fresh
    /// context id and return the (return point, msg return point) pair to
    /// continue from.
    fn mirror_call(&mut self, call_point: NodeId, call_msg: NodeId) -> Result<(NodeId, NodeId)> {
        let context_addr = self.scfg.node(call_point).end_addr;

        // the unique return point sharing the context address
        let return_point = self
            .scfg
            .nodes
            .iter()
            .find(|n| n.kind == NodeKind::ReturnPoint && n.end_addr == context_addr)
            .map(|n| n.id)
            .ok_or_else(|| {
                AnalyzerError::GraphError(format!(
                    "call point 0x{:x} has no paired return point",
                    context_addr
                ))
            })?;

        let context_id = self.next_context_id;
        self.next_context_id += 1;
        let visit = self.context_visits.entry(context_addr).or_insert(0);
        *visit += 1;

        log::debug!(
            "inlining call context 0x{:x} as context id {} (visit {})",
            context_addr,
            context_id,
            visit
        );

        // callee exit: single in-edge of the return point
        if self.scfg.in_degree(return_point) != 1 {
            return Err(AnalyzerError::GraphError(format!(
                "return point 0x{:x} must have exactly one in-edge",
                context_addr
            )));
        }
        let return_in = self.scfg.in_edges(return_point).next().map(|e| e.id);
        let return_in = return_in.ok_or_else(|| {
            AnalyzerError::GraphError("return point in-edge vanished".to_string())
        })?;
        let callee_exit = self.scfg.edge(return_in).from;

        // callee entry: single out-edge of the call point
        if self.scfg.out_degree(call_point) != 1 {
            return Err(AnalyzerError::GraphError(format!(
                "call point 0x{:x} must have exactly one out-edge",
                context_addr
            )));
        }
        let call_out = self.scfg.out_edges(call_point).next().map(|e| e.id);
        let call_out = call_out
            .ok_or_else(|| AnalyzerError::GraphError("call point out-edge vanished".to_string()))?;
        let callee_entry = self.scfg.edge(call_out).to;

        let entry_msg = self.add_msg_vertex(
            (call_point, call_msg),
            callee_entry,
            None,
            self.scfg.edge(call_out).kind,
            call_out,
            context_id,
        )?;

        let exit_msg = self.build_region((callee_entry, entry_msg), callee_exit, context_id)?;

        let return_msg = self.add_msg_vertex(
            (callee_exit, exit_msg),
            return_point,
            None,
            self.scfg.edge(return_in).kind,
            return_in,
            context_id,
        )?;

        // the call/return pair carries the context id of the inlined copy
        self.msg.node_mut(call_msg).context_id = context_id;
        self.msg.node_mut(return_msg).context_id = context_id;

        Ok((return_point, return_msg))
    }

    /// Add (or merge) the MSG mirror of `target` and connect it from the
    /// source pair.
    ///
    /// For `ForwardStepUnroll` the connection runs through a fresh
    /// `FlowJoinNode`: source → join (`ForwardStepUnroll`, flow −1) and
    /// join → target (`Meta`) carrying the remaining iterations
    /// (`circulation − 1` of the injecting edge). All other kinds connect
    /// directly; positive circulations are forced to 1 because everything
    /// outside a rest-of-iterations copy belongs to a first iteration.
    fn add_msg_vertex(
        &mut self,
        source: (NodeId, NodeId),
        target: NodeId,
        region_map: Option<&mut HashMap<NodeId, NodeId>>,
        original_kind: EdgeKind,
        corresponding_edge: EdgeId,
        ctx: u32,
    ) -> Result<NodeId> {
        let new_msg = if target == self.cfg_exit {
            self.msg_exit
        } else {
            let kind = self.scfg.node(target).kind;
            match region_map {
                None => {
                    let id = self.msg.add_node(kind, Some(target));
                    self.msg.node_mut(id).context_id = ctx;
                    id
                }
                Some(map) => match map.get(&target) {
                    Some(&existing) => existing,
                    None => {
                        let id = self.msg.add_node(kind, Some(target));
                        self.msg.node_mut(id).context_id = ctx;
                        map.insert(target, id);
                        id
                    }
                },
            }
        };

        let circulation = self.scfg.edge(corresponding_edge).circulation;

        if original_kind == EdgeKind::ForwardStepUnroll {
            let join = self.msg.add_node(NodeKind::FlowJoinNode, None);
            self.msg.node_mut(join).context_id = ctx;

            self.msg
                .add_edge(source.1, join, EdgeKind::ForwardStepUnroll, -1);

            // the rest of the iterations carry the injecting flow minus the
            // peeled first one
            let rest_flow = if circulation > 0 {
                circulation - 1
            } else {
                circulation
            };
            self.msg.add_edge(join, new_msg, EdgeKind::Meta, rest_flow);
        } else {
            let flow = if circulation > 0 { 1 } else { circulation };
            self.msg.add_edge(source.1, new_msg, original_kind, flow);
        }

        Ok(new_msg)
    }

    /// The flow join node feeding a rest-of-iterations loop head.
    fn flow_join_node_of(&self, rest_head: NodeId) -> Result<NodeId> {
        if self.msg.in_degree(rest_head) != 1 {
            return Err(AnalyzerError::GraphError(
                "rest-iteration head must have exactly the join in-edge".to_string(),
            ));
        }
        let join = self
            .msg
            .in_edges(rest_head)
            .next()
            .map(|e| e.from)
            .ok_or_else(|| AnalyzerError::GraphError("join edge vanished".to_string()))?;
        if self.msg.node(join).kind != NodeKind::FlowJoinNode {
            return Err(AnalyzerError::GraphError(
                "rest-iteration head is not fed by a flow join node".to_string(),
            ));
        }
        Ok(join)
    }

    /// True when only one back edge of the head is still unregistered; that
    /// last edge triggers the peel.
    fn is_last_unhandled_loop_edge(&self, loop_exits: &[LoopExits], loop_head: NodeId) -> bool {
        let handled = loop_exits
            .iter()
            .find(|l| l.loop_head == loop_head)
            .map_or(0, |l| l.exits.len() as u32);
        self.scfg.back_edge_in_degree(loop_head) == 1 + handled
    }

    fn register_loop_exit(loop_exits: &mut Vec<LoopExits>, exit_msg: NodeId, loop_head: NodeId) {
        if let Some(entry) = loop_exits.iter_mut().find(|l| l.loop_head == loop_head) {
            if !entry.exits.contains(&exit_msg) {
                entry.exits.push(exit_msg);
            }
            return;
        }
        loop_exits.push(LoopExits {
            loop_head,
            exits: vec![exit_msg],
        });
    }

    /// Connect every registered precipitant exit of the peeled first
    /// iteration to the flow join node.
    fn add_unroll_edges_for_head(
        &mut self,
        loop_exits: &mut Vec<LoopExits>,
        loop_head: NodeId,
        join: NodeId,
    ) {
        if let Some(entry) = loop_exits.iter().find(|l| l.loop_head == loop_head) {
            for &exit_msg in &entry.exits {
                self.msg
                    .add_edge(exit_msg, join, EdgeKind::ForwardStepUnroll, -1);
            }
        }
        loop_exits.retain(|l| l.loop_head != loop_head);
    }
}

/// Convenience wrapper: transform a super graph into its MSG.
pub fn build_vivu_graph(super_graph: &SuperGraph) -> Result<VivuGraph> {
    VivuTransformer::new(super_graph).transform()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analysis::graph::ControlFlowGraph;

    /// entry -> pre -> head -> tail -> (back to head | post) -> exit,
    /// injecting edge circulation 10.
    fn loop_super_graph() -> SuperGraph {
        let mut g = ControlFlowGraph::new();
        let entry = g.add_node(NodeKind::Entry, 0, 0);
        let pre = g.add_node(NodeKind::BasicBlock, 0x100, 0x102);
        let head = g.add_node(NodeKind::BasicBlock, 0x104, 0x106);
        let tail = g.add_node(NodeKind::BasicBlock, 0x108, 0x10a);
        let post = g.add_node(NodeKind::BasicBlock, 0x10c, 0x10e);
        let exit = g.add_node(NodeKind::Exit, !0, !0);
        g.node_mut(entry).label = "<SUPER_ENTRY>".into();
        g.node_mut(exit).label = "<SUPER_EXIT>".into();

        g.add_edge(entry, pre, EdgeKind::Meta);
        let inj = g.add_edge(pre, head, EdgeKind::ForwardStep);
        g.edge_mut(inj).circulation = 10;
        g.add_edge(head, tail, EdgeKind::ForwardStep);
        g.add_edge(tail, head, EdgeKind::BackwardJump);
        g.add_edge(tail, post, EdgeKind::ForwardStep);
        g.add_edge(post, exit, EdgeKind::Meta);

        SuperGraph {
            graph: g,
            entry,
            exit,
        }
    }

    #[test]
    fn peels_first_iteration_of_bounded_loop() {
        let sg = loop_super_graph();
        let vivu = build_vivu_graph(&sg).unwrap();
        let msg = &vivu.msg;

        // exactly one flow join node
        let joins: Vec<_> = msg
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::FlowJoinNode)
            .collect();
        assert_eq!(joins.len(), 1);
        let join = joins[0];
        assert!(join.mapped.is_none());

        // the join collects the first iteration and feeds the rest head
        // with flow bound - 1
        let meta_out: Vec<_> = msg.out_edges(join.id).collect();
        assert_eq!(meta_out.len(), 1);
        assert_eq!(meta_out[0].kind, EdgeKind::Meta);
        assert_eq!(meta_out[0].flow, 9);

        let unroll_in: Vec<_> = msg.in_edges(join.id).collect();
        assert_eq!(unroll_in.len(), 1);
        assert_eq!(unroll_in[0].kind, EdgeKind::ForwardStepUnroll);

        // the head appears twice: first iteration and rest of iterations
        let head_copies = msg
            .nodes
            .iter()
            .filter(|n|

                n.mapped
                    .map(|m| sg.graph.node(m).start_addr == 0x104)
                    .unwrap_or(false)
            )
            .count();
        assert_eq!(head_copies, 2);

        // the rest of the iterations keeps its back edge
        let back_edges = msg
            .edges
            .iter()
            .filter(|e| e.kind == EdgeKind::BackwardJump)
            .count();
        assert_eq!(back_edges, 1);
    }

    #[test]
    fn first_iteration_entering_flow_is_one() {
        let sg = loop_super_graph();
        let vivu = build_vivu_graph(&sg).unwrap();
        // the mirrored injecting edge (pre -> first head copy) is forced to
        // flow 1
        let forced: Vec<_> = vivu
            .msg
            .edges
            .iter()
            .filter(|e| e.flow == 1)
            .collect();
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].kind, EdgeKind::ForwardStep);
    }

    #[test]
    fn every_msg_node_maps_to_scfg_or_is_join() {
        let sg = loop_super_graph();
        let vivu = build_vivu_graph(&sg).unwrap();
        for node in &vivu.msg.nodes {
            match node.kind {
                NodeKind::FlowJoinNode => assert!(node.mapped.is_none()),
                _ => assert!(node.mapped.is_some()),
            }
        }
    }

    #[test]
    fn unbounded_loop_keeps_rolled_back_edge() {
        let mut sg = loop_super_graph();
        // erase the flow fact
        for e in sg.graph.edges.iter_mut() {
            e.circulation = -1;
        }
        let vivu = build_vivu_graph(&sg).unwrap();
        // no peeling happened
        assert!(vivu
            .msg
            .nodes
            .iter()
            .all(|n| n.kind != NodeKind::FlowJoinNode));
        // the back edge survives unconstrained
        let back: Vec<_> = vivu
            .msg
            .edges
            .iter()
            .filter(|e| e.kind == EdgeKind::BackwardJump)
            .collect();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].flow, -1);
    }
}
