//! Per-Function CFG Assembly
//!
//! The dump parser feeds finished basic blocks into a [`CfgBuilder`], one
//! builder per function. The builder wires fallthrough/jump/call edges by
//! address relation, tracks jump targets that have been referenced but not
//! yet defined (the incomplete list), and seals the graph once every
//! referenced target has materialized and the exit node is reachable.

use std::collections::HashMap;

use crate::analyzer::analysis::graph::{
    ControlFlowGraph, EdgeKind, NodeId, NodeKind, UNKNOWN_ADDR,
};
use crate::analyzer::error::{AnalyzerError, Result};

/// A function address together with its dump label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrLabel {
    pub address: u32,
    pub label: String,
}

/// A call-site node together with the callee it names.
#[derive(Debug, Clone)]
pub struct CallSiteRef {
    pub address: u32,
    pub label: String,
    pub node: NodeId,
}

/// Sealed per-function control flow graph.
#[derive(Debug, Clone)]
pub struct FunctionCfg {
    pub graph: ControlFlowGraph,
    pub entry: NodeId,
    pub exit: NodeId,
    /// Functions this one calls, deduplicated.
    pub call_targets: Vec<AddrLabel>,
    /// Call-site nodes in graph order.
    pub call_sites: Vec<CallSiteRef>,
    pub code_size: u32,
}

/// Builder that accumulates basic blocks into a function CFG.
pub struct CfgBuilder {
    graph: ControlFlowGraph,
    entry: NodeId,
    exit: NodeId,
    addr_map: HashMap<u32, NodeId>,
    /// Addresses referenced as targets but not yet defined as blocks.
    incomplete: Vec<u32>,
    call_sites: Vec<CallSiteRef>,
    call_targets: Vec<AddrLabel>,
    call_counts: HashMap<u32, u32>,
    code_size: u32,
    entry_connected: bool,
}

impl Default for CfgBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CfgBuilder {
    pub fn new() -> Self {
        let mut graph = ControlFlowGraph::new();
        let entry = graph.add_node(NodeKind::Entry, 0x0000_0000, 0x0000_0000);
        graph.node_mut(entry).label = "<ENTRY>".to_string();
        let exit = graph.add_node(NodeKind::Exit, UNKNOWN_ADDR, UNKNOWN_ADDR);
        graph.node_mut(exit).label = "<EXIT>".to_string();
        Self {
            graph,
            entry,
            exit,
            addr_map: HashMap::new(),
            incomplete: Vec::new(),
            call_sites: Vec::new(),
            call_targets: Vec::new(),
            call_counts: HashMap::new(),
            code_size: 0,
            entry_connected: false,
        }
    }

    /// Add a block with one successor address (fallthrough or direct jump).
    ///
    /// The edge kind is derived from the address relation: equal to the end
    /// of the block → `ForwardStep`, increasing → `ForwardJump`, decreasing
    /// → `BackwardJump`.
    pub fn add_block(
        &mut self,
        start_addr: u32,
        end_addr: u32,
        next_addr: u32,
        code: &str,
        size: u32,
        instr_count: u32,
    ) {
        let u = self.set_source_bb(start_addr, end_addr, code, size, instr_count);
        let v = self.get_target_bb(next_addr);
        let kind = Self::jump_edge_kind(start_addr + size, next_addr);
        log::debug!(
            "edge 0x{:x} -> 0x{:x} ({:?})",
            start_addr,
            next_addr,
            kind
        );
        self.graph.add_edge(u, v, kind);
    }

    /// Add a block ending in an indirect jump with a set of hinted targets.
    pub fn add_block_multi(
        &mut self,
        start_addr: u32,
        end_addr: u32,
        next_addrs: &[u32],
        code: &str,
        size: u32,
        instr_count: u32,
    ) {
        let u = self.set_source_bb(start_addr, end_addr, code, size, instr_count);
        for &next_addr in next_addrs {
            let v = self.get_target_bb(next_addr);
            let kind = if start_addr + size <= next_addr {
                EdgeKind::ForwardJump
            } else {
                EdgeKind::BackwardJump
            };
            self.graph.add_edge(u, v, kind);
        }
    }

    /// Add a block ending in a conditional branch: a fallthrough successor
    /// and one (or, for hinted indirect conditionals, several) jump targets.
    pub fn add_cond_block(
        &mut self,
        start_addr: u32,
        end_addr: u32,
        next_addr: u32,
        jump_addrs: &[u32],
        code: &str,
        size: u32,
        instr_count: u32,
    ) {
        let u = self.set_source_bb(start_addr, end_addr, code, size, instr_count);
        let v = self.get_target_bb(next_addr);
        self.graph.add_edge(u, v, EdgeKind::ForwardStep);
        for &jump_addr in jump_addrs {
            let w = self.get_target_bb(jump_addr);
            let kind = if end_addr < jump_addr {
                EdgeKind::ForwardJump
            } else {
                EdgeKind::BackwardJump
            };
            log::debug!(
                "cond edge 0x{:x} -> 0x{:x} ({:?})",
                start_addr,
                jump_addr,
                kind
            );
            self.graph.add_edge(u, w, kind);
        }
    }

    /// Add a block terminated by a return instruction; connects to the
    /// function exit.
    pub fn add_return_block(
        &mut self,
        start_addr: u32,
        end_addr: u32,
        code: &str,
        size: u32,
        instr_count: u32,
    ) {
        let u = self.set_source_bb(start_addr, end_addr, code, size, instr_count);
        let exit = self.exit;
        self.graph.add_edge(u, exit, EdgeKind::Meta);
    }

    /// Add a block terminated by calls to the given targets.
    ///
    /// Each target becomes its own `CallSite` node between the block and
    /// its fallthrough successor; the split into call/return points happens
    /// during super graph construction.
    pub fn add_call_block(
        &mut self,
        start_addr: u32,
        end_addr: u32,
        next_addr: u32,
        code: &str,
        size: u32,
        instr_count: u32,
        targets: &[AddrLabel],
    ) {
        let u = self.set_source_bb(start_addr, end_addr, code, size, instr_count);
        let v = self.get_target_bb(next_addr);

        for target in targets {
            if target.address == UNKNOWN_ADDR {
                // indirect call with no hints: keep the fallthrough, omit
                // the call site
                log::debug!(
                    "call at 0x{:x} has no resolvable target, omitting call site",
                    start_addr
                );
                self.graph.add_edge(u, v, EdgeKind::ForwardStep);
                continue;
            }
            let w = self
                .graph
                .add_node(NodeKind::CallSite, 0x0000_0000, end_addr);
            self.graph.node_mut(w).label = format!("<CALLSITE: {}>", target.label);
            self.graph.node_mut(w).call_target = target.address;
            self.call_sites.push(CallSiteRef {
                address: target.address,
                label: target.label.clone(),
                node: w,
            });

            self.graph.add_edge(u, w, EdgeKind::ForwardJump);
            self.graph.add_edge(w, v, EdgeKind::Meta);
            self.add_call_target(target);
        }
    }

    /// True once every referenced jump target has been defined and the exit
    /// node is connected.
    pub fn is_finished(&self) -> bool {
        if self.incomplete.is_empty() && self.graph.in_degree(self.exit) != 0 {
            true
        } else {
            log::debug!(
                "incomplete targets: {:?}, exit in-degree: {}",
                self.incomplete
                    .iter()
                    .map(|a| format!("0x{:x}", a))
                    .collect::<Vec<_>>(),
                self.graph.in_degree(self.exit)
            );
            false
        }
    }

    /// Seal the builder into a read-only function CFG.
    pub fn finish(self, function: &AddrLabel) -> Result<FunctionCfg> {
        if !self.is_finished() {
            return Err(AnalyzerError::ParseError(format!(
                "function {} at 0x{:x} has unresolved targets or no return path",
                function.label, function.address
            )));
        }
        Ok(FunctionCfg {
            graph: self.graph,
            entry: self.entry,
            exit: self.exit,
            call_targets: self.call_targets,
            call_sites: self.call_sites,
            code_size: self.code_size,
        })
    }

    /// Number of call sites referencing the given function address.
    pub fn call_site_count(&self, funct_address: u32) -> u32 {
        self.call_counts.get(&funct_address).copied().unwrap_or(0)
    }

    fn jump_edge_kind(next_sequential: u32, target: u32) -> EdgeKind {
        use std::cmp::Ordering;
        match next_sequential.cmp(&target) {
            Ordering::Equal => EdgeKind::ForwardStep,
            Ordering::Less => EdgeKind::ForwardJump,
            Ordering::Greater => EdgeKind::BackwardJump,
        }
    }

    /// Find or create the block node for `start_addr` and fill its payload.
    ///
    /// The first block with no in-edges becomes the function entry; later
    /// in-edge-free blocks may be dead code or get connected by a back jump,
    /// and a function has exactly one entry.
    fn set_source_bb(
        &mut self,
        start_addr: u32,
        end_addr: u32,
        code: &str,
        size: u32,
        instr_count: u32,
    ) -> NodeId {
        let u = match self.addr_map.get(&start_addr) {
            Some(&existing) => {
                self.incomplete.retain(|&a| a != start_addr);
                existing
            }
            None => {
                let fresh = self
                    .graph
                    .add_node(NodeKind::BasicBlock, start_addr, end_addr);
                self.addr_map.insert(start_addr, fresh);
                fresh
            }
        };

        if self.graph.in_degree(u) == 0 && !self.entry_connected {
            let entry = self.entry;
            self.graph.add_edge(entry, u, EdgeKind::Meta);
            self.graph.node_mut(entry).call_target = start_addr;
            self.entry_connected = true;
        }

        let node = self.graph.node_mut(u);
        node.kind = NodeKind::BasicBlock;
        node.start_addr = start_addr;
        node.end_addr = end_addr;
        node.label = format!("0x{:x}", start_addr);
        node.code = code.to_string();
        node.size = size;
        node.instr_count = instr_count;

        self.code_size += size;
        u
    }

    /// Find or create the target node for a jump; unknown addresses get an
    /// `UnknownJumpTarget` node and do not enter the incomplete list.
    fn get_target_bb(&mut self, target_addr: u32) -> NodeId {
        if let Some(&v) = self.addr_map.get(&target_addr) {
            return v;
        }
        let kind = if target_addr == UNKNOWN_ADDR {
            NodeKind::UnknownJumpTarget
        } else {
            NodeKind::BasicBlock
        };
        let v = self.graph.add_node(kind, target_addr, target_addr);
        self.graph.node_mut(v).label = if target_addr == UNKNOWN_ADDR {
            "<UNKNOWN>".to_string()
        } else {
            format!("0x{:x}", target_addr)
        };
        self.addr_map.insert(target_addr, v);
        if target_addr != UNKNOWN_ADDR {
            self.incomplete.push(target_addr);
        }
        v
    }

    fn add_call_target(&mut self, target: &AddrLabel) {
        if let Some(count) = self.call_counts.get_mut(&target.address) {
            *count += 1;
            return;
        }
        self.call_targets.push(target.clone());
        self.call_counts.insert(target.address, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(addr: u32, name: &str) -> AddrLabel {
        AddrLabel {
            address: addr,
            label: name.to_string(),
        }
    }

    #[test]
    fn straight_line_function_seals() {
        let mut b = CfgBuilder::new();
        b.add_block(0x100, 0x106, 0x108, "code", 8, 4);
        b.add_return_block(0x108, 0x108, "4770\tbx lr", 2, 1);
        assert!(b.is_finished());
        let cfg = b.finish(&label(0x100, "main")).unwrap();
        assert_eq!(cfg.graph.in_degree(cfg.exit), 1);
        assert_eq!(cfg.code_size, 10);
    }

    #[test]
    fn unresolved_forward_target_blocks_sealing() {
        let mut b = CfgBuilder::new();
        b.add_block(0x100, 0x102, 0x200, "code", 4, 2);
        assert!(!b.is_finished());
        assert!(b.finish(&label(0x100, "f")).is_err());
    }

    #[test]
    fn cond_block_gets_step_and_jump_edges() {
        let mut b = CfgBuilder::new();
        b.add_cond_block(0x100, 0x102, 0x104, &[0x100], "code", 4, 2);
        b.add_return_block(0x104, 0x104, "ret", 2, 1);
        let cfg = b.finish(&label(0x100, "loopy")).unwrap();
        let head = cfg.graph.nodes.iter().find(|n| n.start_addr == 0x100).unwrap();
        let kinds: Vec<EdgeKind> = cfg.graph.out_edges(head.id).map(|e| e.kind).collect();
        assert!(kinds.contains(&EdgeKind::ForwardStep));
        assert!(kinds.contains(&EdgeKind::BackwardJump));
    }

    #[test]
    fn call_block_records_site_and_target() {
        let mut b = CfgBuilder::new();
        b.add_call_block(0x100, 0x102, 0x106, "code", 6, 2, &[label(0x400, "callee")]);
        b.add_return_block(0x106, 0x106, "ret", 2, 1);
        let cfg = b.finish(&label(0x100, "caller")).unwrap();
        assert_eq!(cfg.call_sites.len(), 1);
        assert_eq!(cfg.call_targets, vec![label(0x400, "callee")]);
        let site = cfg.graph.node(cfg.call_sites[0].node);
        assert_eq!(site.kind, NodeKind::CallSite);
        // the context address pairs call and return halves later on
        assert_eq!(site.end_addr, 0x102);
        assert_eq!(site.call_target, 0x400);
    }

    #[test]
    fn unknown_jump_target_is_recoverable() {
        let mut b = CfgBuilder::new();
        b.add_block_multi(0x100, 0x102, &[UNKNOWN_ADDR], "code", 4, 2);
        b.add_return_block(0x104, 0x104, "ret", 2, 1);
        assert!(b.is_finished());
        let cfg = b.finish(&label(0x100, "f")).unwrap();
        assert!(cfg
            .graph
            .nodes
            .iter()
            .any(|n| n.kind == NodeKind::UnknownJumpTarget));
    }
}
