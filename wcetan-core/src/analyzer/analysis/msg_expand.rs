//! MSG Expansion
//!
//! Rebuilds a control flow graph with the *structure* of the memory state
//! graph and the *properties* of the reference super graph: one expanded
//! node per MSG node carrying the block payload of its mirrored SCFG node,
//! one expanded edge per MSG edge carrying the cycle costs of the matching
//! SCFG edge and the flow value VIVU computed.
//!
//! The ILP generator and the WC-path exporter operate on this expanded
//! graph, so loop peelings and call contexts are already materialized for
//! them.

use std::collections::HashMap;

use crate::analyzer::analysis::graph::{
    ControlFlowGraph, EdgeKind, NodeId, NodeKind, UNKNOWN_ADDR,
};
use crate::analyzer::analysis::super_graph::SuperGraph;
use crate::analyzer::analysis::vivu::VivuGraph;
use crate::analyzer::error::{AnalyzerError, Result};

/// Expanded (context- and iteration-explicit) graph with entry/exit.
#[derive(Debug, Clone)]
pub struct ExpandedGraph {
    pub graph: ControlFlowGraph,
    pub entry: NodeId,
    pub exit: NodeId,
}

/// Expand the MSG against its reference super graph.
pub fn expand_msg(super_graph: &SuperGraph, vivu: &VivuGraph) -> Result<ExpandedGraph> {
    let scfg = &super_graph.graph;
    let msg = &vivu.msg;

    let mut graph = ControlFlowGraph::new();
    // the mapping is bijective: every MSG node yields exactly one expanded
    // node
    let mut node_map: HashMap<NodeId, NodeId> = HashMap::new();

    for msg_node in &msg.nodes {
        let new_id = match msg_node.mapped {
            Some(scfg_id) => {
                let src = scfg.node(scfg_id);
                let id = graph.add_node(src.kind, src.start_addr, src.end_addr);
                let node = graph.node_mut(id);
                node.label = src.label.clone();
                node.call_target = src.call_target;
                node.code = src.code.clone();
                node.size = src.size;
                node.instr_count = src.instr_count;
                id
            }
            None => {
                if msg_node.kind != NodeKind::FlowJoinNode {
                    return Err(AnalyzerError::GraphError(format!(
                        "unmapped msg node {} is not a flow join node",
                        msg_node.id
                    )));
                }
                let id = graph.add_node(NodeKind::FlowJoinNode, UNKNOWN_ADDR, UNKNOWN_ADDR);
                graph.node_mut(id).label = "Meta Flow Join Node".to_string();
                id
            }
        };
        graph.node_mut(new_id).context_id = msg_node.context_id;
        node_map.insert(msg_node.id, new_id);
    }

    for msg_edge in &msg.edges {
        let from = node_map[&msg_edge.from];
        let to = node_map[&msg_edge.to];
        let eid = graph.add_edge(from, to, msg_edge.kind);
        graph.edge_mut(eid).circulation = msg_edge.flow;

        // the costs come from the super graph edge this msg edge mirrors
        let reference = reference_scfg_edge(scfg, msg, msg_edge.from, msg_edge.to);
        if let Some(ref_eid) = reference {
            let src = scfg.edge(ref_eid);
            let e = graph.edge_mut(eid);
            e.cost = src.cost;
            e.cost_onchip = src.cost_onchip;
            e.cost_offchip = src.cost_offchip;
            e.mem_penalty = src.mem_penalty;
        }
    }

    let entry = node_map[&vivu.entry];
    let exit = node_map[&vivu.exit];
    Ok(ExpandedGraph { graph, entry, exit })
}

/// The SCFG edge an MSG edge mirrors.
///
/// Direct mirrors connect two mapped nodes; an edge into a flow join node
/// mirrors the original back edge to the loop head behind the join; the
/// join's own meta edge has no counterpart (it carries flow only).
fn reference_scfg_edge(
    scfg: &ControlFlowGraph,
    msg: &crate::analyzer::analysis::graph::MemoryStateGraph,
    msg_from: NodeId,
    msg_to: NodeId,
) -> Option<crate::analyzer::analysis::graph::EdgeId> {
    let from_mapped = msg.node(msg_from).mapped;
    let to_mapped = msg.node(msg_to).mapped;

    match (from_mapped, to_mapped) {
        (Some(u), Some(v)) => scfg.out_edges(u).find(|e| e.to == v).map(|e| e.id),
        (Some(u), None) => {
            // edge into a flow join node: the loop head sits behind the
            // join's single meta out-edge
            let head = msg
                .out_edges(msg_to)
                .find(|e| e.kind == EdgeKind::Meta)
                .and_then(|e| msg.node(e.to).mapped)?;
            scfg.out_edges(u)
                .find(|e| e.to == head && e.kind == EdgeKind::BackwardJump)
                .map(|e| e.id)
        }
        _ => None,
    }
}
