//! Super Graph Construction
//!
//! Builds the whole-program super control flow graph (SCFG) by inlining
//! every function CFG at every one of its call sites. Distinct call sites
//! of the same function share one inlined body copy in the SCFG; the VIVU
//! transform later duplicates it per calling context.
//!
//! Each `CallSite` node is split into a `CallPoint`/`ReturnPoint` pair
//! around the callee: the call point keeps the site's outgoing wiring to
//! the callee entry, the return point inherits the site's former out-edges.
//! The pair shares the *context address* (the end address of the calling
//! basic block), which is unique within the SCFG and lets the loop helper
//! match returns to calls during context-sensitive searches.
//!
//! Recursion is not representable and is rejected before any inlining
//! happens, naming the offending cycle.

use std::collections::HashMap;

use crate::analyzer::analysis::cfg_builder::{AddrLabel, FunctionCfg};
use crate::analyzer::analysis::graph::{
    ControlFlowGraph, EdgeKind, NodeId, NodeKind, UNKNOWN_ADDR,
};
use crate::analyzer::error::{AnalyzerError, Result};

/// A parsed function: its label and sealed CFG.
#[derive(Debug, Clone)]
pub struct ParsedFunction {
    pub address: u32,
    pub name: String,
    pub cfg: FunctionCfg,
}

/// The parser's output: the entry function plus every reachable function.
#[derive(Debug, Clone)]
pub struct Program {
    pub entry_function: AddrLabel,
    pub functions: Vec<ParsedFunction>,
}

impl Program {
    pub fn function(&self, address: u32) -> Option<&ParsedFunction> {
        self.functions.iter().find(|f| f.address == address)
    }
}

/// Inlined whole-program graph.
#[derive(Debug, Clone)]
pub struct SuperGraph {
    pub graph: ControlFlowGraph,
    pub entry: NodeId,
    pub exit: NodeId,
}

/// Pending call site inside the growing SCFG.
struct PendingSite {
    node: NodeId,
    callee: u32,
}

/// Build the SCFG for a program.
///
/// Functions are inserted leaves-first along the call graph; a call site is
/// split as soon as its callee body is present. Any call cycle is a hard
/// error.
pub fn build_super_graph(program: &Program) -> Result<SuperGraph> {
    check_for_recursion(program)?;

    let entry_fn = program
        .function(program.entry_function.address)
        .ok_or_else(|| {
            AnalyzerError::GraphError(format!(
                "entry function {} not parsed",
                program.entry_function.label
            ))
        })?;

    // the entry function's CFG seeds the super graph; node ids correspond
    let mut graph = entry_fn.cfg.graph.clone();
    let entry = entry_fn.cfg.entry;
    let exit = entry_fn.cfg.exit;
    graph.node_mut(entry).label = "<SUPER_ENTRY>".to_string();
    graph.node_mut(exit).label = "<SUPER_EXIT>".to_string();

    let mut pending: Vec<PendingSite> = entry_fn
        .cfg
        .call_sites
        .iter()
        .map(|s| PendingSite {
            node: s.node,
            callee: s.address,
        })
        .collect();

    // entry/exit nodes of every inlined callee body
    let mut inlined: HashMap<u32, (NodeId, NodeId)> = HashMap::new();

    for function in insertion_order(program) {
        if function.address == program.entry_function.address {
            continue;
        }
        if inlined.contains_key(&function.address) {
            continue;
        }
        log::debug!(
            "inlining function {} at 0x{:x}",
            function.name,
            function.address
        );
        let (callee_entry, callee_exit, mut sites) = append_function(&mut graph, function);
        graph.node_mut(callee_entry).label = format!("<ENTRY: {}>", function.name);
        graph.node_mut(callee_exit).label = format!("<EXIT: {}>", function.name);
        inlined.insert(function.address, (callee_entry, callee_exit));
        pending.append(&mut sites);

        // split every site whose callee body is now present
        let mut still_pending = Vec::new();
        for site in pending {
            match inlined.get(&site.callee) {
                Some(&(ce, cx)) => split_call_site(&mut graph, site.node, ce, cx)?,
                None => still_pending.push(site),
            }
        }
        pending = still_pending;
    }

    if !pending.is_empty() {
        let leftovers: Vec<String> = pending
            .iter()
            .map(|s| format!("0x{:x}", s.callee))
            .collect();
        log::error!("call sites left after inlining: {}", leftovers.join(", "));
        return Err(AnalyzerError::RecursionError {
            cycle: leftovers.join(" -> "),
        });
    }

    Ok(SuperGraph { graph, entry, exit })
}

/// Reject call graphs with cycles, naming one offending cycle.
///
/// Depth-first walk over the call graph with an explicit inlining stack;
/// a call target already on the stack closes a cycle.
fn check_for_recursion(program: &Program) -> Result<()> {
    let mut done: Vec<u32> = Vec::new();

    fn visit(
        program: &Program,
        address: u32,
        stack: &mut Vec<(u32, String)>,
        done: &mut Vec<u32>,
    ) -> Result<()> {
        if done.contains(&address) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|&(a, _)| a == address) {
            let mut names: Vec<String> = stack[pos..].iter().map(|(_, n)| n.clone()).collect();
            names.push(stack[pos].1.clone());
            return Err(AnalyzerError::RecursionError {
                cycle: names.join(" -> "),
            });
        }
        let function = match program.function(address) {
            Some(f) => f,
            None => return Ok(()), // unparsed target, reported elsewhere
        };
        stack.push((address, function.name.clone()));
        for target in &function.cfg.call_targets {
            if target.address != UNKNOWN_ADDR {
                visit(program, target.address, stack, done)?;
            }
        }
        stack.pop();
        done.push(address);
        Ok(())
    }

    let mut stack = Vec::new();
    visit(
        program,
        program.entry_function.address,
        &mut stack,
        &mut done,
    )
}

/// Insertion order: callees before callers (leaves first).
fn insertion_order(program: &Program) -> Vec<&ParsedFunction> {
    let mut order: Vec<&ParsedFunction> = Vec::new();
    let mut visited: Vec<u32> = Vec::new();

    fn visit<'a>(
        program: &'a Program,
        address: u32,
        visited: &mut Vec<u32>,
        order: &mut Vec<&'a ParsedFunction>,
    ) {
        if visited.contains(&address) {
            return;
        }
        visited.push(address);
        if let Some(function) = program.function(address) {
            for target in &function.cfg.call_targets {
                visit(program, target.address, visited, order);
            }
            order.push(function);
        }
    }

    visit(
        program,
        program.entry_function.address,
        &mut visited,
        &mut order,
    );
    order
}

/// Clone a function CFG into the super graph arena.
///
/// Returns the cloned entry/exit ids and the function's call sites with
/// their translated node ids.
fn append_function(
    graph: &mut ControlFlowGraph,
    function: &ParsedFunction,
) -> (NodeId, NodeId, Vec<PendingSite>) {
    let node_offset = graph.nodes.len() as NodeId;
    let edge_offset = graph.edges.len() as NodeId;
    let src = &function.cfg.graph;

    for node in &src.nodes {
        let mut cloned = node.clone();
        cloned.id += node_offset;
        for e in cloned.out_edges.iter_mut() {
            *e += edge_offset;
        }
        for e in cloned.in_edges.iter_mut() {
            *e += edge_offset;
        }
        graph.nodes.push(cloned);
    }
    for edge in &src.edges {
        let mut cloned = edge.clone();
        cloned.id += edge_offset;
        cloned.from += node_offset;
        cloned.to += node_offset;
        graph.edges.push(cloned);
    }

    let sites = function
        .cfg
        .call_sites
        .iter()
        .map(|s| PendingSite {
            node: s.node + node_offset,
            callee: s.address,
        })
        .collect();

    (
        function.cfg.entry + node_offset,
        function.cfg.exit + node_offset,
        sites,
    )
}

/// Split a `CallSite` node into a `CallPoint`/`ReturnPoint` pair around the
/// inlined callee body.
fn split_call_site(
    graph: &mut ControlFlowGraph,
    site: NodeId,
    callee_entry: NodeId,
    callee_exit: NodeId,
) -> Result<()> {
    if graph.node(site).kind != NodeKind::CallSite {
        return Err(AnalyzerError::GraphError(format!(
            "node {} is not a call site (found {})",
            site,
            graph.node(site).kind
        )));
    }
    let context_addr = graph.node(site).end_addr;
    let call_addr = graph.node(site).call_target;

    {
        let node = graph.node_mut(site);
        node.kind = NodeKind::CallPoint;
        node.label = format!("Call Point (0x{:x})", context_addr);
    }

    let return_point = graph.add_node(NodeKind::ReturnPoint, UNKNOWN_ADDR, context_addr);
    {
        let node = graph.node_mut(return_point);
        node.label = format!("Return Point (0x{:x})", context_addr);
        node.call_target = call_addr;
    }

    // the site's former out-edges leave the return point instead
    let out_edges: Vec<u32> = graph.nodes[site as usize].out_edges.to_vec();
    for eid in out_edges {
        graph.redirect_edge_source(eid, return_point);
    }

    graph.add_edge(site, callee_entry, EdgeKind::Meta);
    graph.add_edge(callee_exit, return_point, EdgeKind::Meta);

    log::debug!(
        "split call site {} (context 0x{:x}) around callee 0x{:x}",
        site,
        context_addr,
        call_addr
    );
    Ok(())
}
