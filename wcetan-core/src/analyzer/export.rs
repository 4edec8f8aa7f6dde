//! WC-Path Export
//!
//! The ILP marks the worst-case path by writing activation counts onto the
//! edges of the expanded graph. The exporter replays that path: it follows
//! activated edges, unrolls loops by their bounds, and matches returns to
//! calls through a context stack, producing a human-readable trace, a
//! per-block execution histogram, and instruction statistics.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::analyzer::analysis::context::ContextStack;
use crate::analyzer::analysis::graph::{EdgeKind, NodeId, NodeKind};
use crate::analyzer::analysis::loop_helper::LoopHelper;
use crate::analyzer::analysis::msg_expand::ExpandedGraph;
use crate::analyzer::decoder::{self, InstrClass};
use crate::analyzer::error::{AnalyzerError, Result};
use crate::analyzer::parser::DumpLineTokenizer;

/// Instruction counts by class over the worst-case path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstrStats {
    pub instructions: u64,
    pub arithmetic: u64,
    pub branches: u64,
    pub cond_branches: u64,
    pub calls: u64,
    pub returns: u64,
    pub loads: u64,
    pub stores: u64,
    pub sync: u64,
    pub debug: u64,
    pub other: u64,
    pub unknown: u64,
}

/// Rendered worst-case path.
#[derive(Debug, Clone)]
pub struct WcPathTrace {
    /// One `; Node: ...` line per node, `<addr> "<mnemonic>"` per
    /// instruction of a basic block.
    pub trace: String,
    pub stats: InstrStats,
    /// True when the path crosses an unresolved indirect branch; the trace
    /// is still complete, but the bound should be treated with suspicion.
    pub crossed_unknown_target: bool,
}

/// Replays and renders the worst-case path of an activation-annotated
/// expanded graph.
pub struct WcPathExporter<'g> {
    expanded: &'g ExpandedGraph,
    tokenizer: DumpLineTokenizer,
}

impl<'g> WcPathExporter<'g> {
    pub fn new(expanded: &'g ExpandedGraph) -> Self {
        Self {
            expanded,
            tokenizer: DumpLineTokenizer::new(),
        }
    }

    /// Replay the WC-path, returning the trace text and the instruction
    /// statistics.
    ///
    /// An `UnknownJumpTarget` node on the path is reported as a warning
    /// but the export completes.
    pub fn traverse_wc_path(&self) -> Result<WcPathTrace> {
        let mut trace = String::new();
        let mut stats = InstrStats::default();
        let mut context = ContextStack::new();
        let mut crossed_unknown = false;
        self.traverse_sequential(
            self.expanded.entry,
            self.expanded.exit,
            1,
            &mut context,
            &mut trace,
            &mut stats,
            &mut crossed_unknown,
        )?;
        self.print_node(self.expanded.exit, &mut trace, &mut stats);
        Ok(WcPathTrace {
            trace,
            stats,
            crossed_unknown_target: crossed_unknown,
        })
    }

    /// Per-block execution histogram: activations summed per distinct
    /// block start address, over all contexts and loop peelings.
    pub fn histogram(&self) -> String {
        let graph = &self.expanded.graph;
        let mut counts: BTreeMap<u32, u64> = BTreeMap::new();
        for node in &graph.nodes {
            if node.kind != NodeKind::BasicBlock {
                continue;
            }
            let executed: u64 = graph.out_edges(node.id).map(|e| e.activation).sum();
            *counts.entry(node.start_addr).or_insert(0) += executed;
        }
        let mut out = String::new();
        for (addr, count) in counts {
            let _ = writeln!(out, "0x{:x}\t{}", addr, count);
        }
        out
    }

    /// Walk one sequential stretch of the path `count` times.
    ///
    /// At a node with both an activated forward and an activated back edge
    /// a loop was entered: its body (already printed once on the way here)
    /// is replayed `bound − 1` more times before the forward edge is taken.
    /// At an `Exit` node the forward edge into the return point matching
    /// the top of the context stack is the only valid continuation.
    #[allow(clippy::too_many_arguments)]
    fn traverse_sequential(
        &self,
        start: NodeId,
        end: NodeId,
        count: u64,
        context: &mut ContextStack,
        trace: &mut String,
        stats: &mut InstrStats,
        crossed_unknown: &mut bool,
    ) -> Result<()> {
        let graph = &self.expanded.graph;
        let helper = LoopHelper::new(graph, self.expanded.entry, self.expanded.exit);

        for iteration in 0..count {
            let mut v = start;
            log::debug!("wc-path pass {}/{} from node {}", iteration + 1, count, start);

            while v != end {
                if graph.node(v).kind == NodeKind::CallPoint {
                    context.push(graph.node(v).end_addr);
                }
                if graph.node(v).kind == NodeKind::UnknownJumpTarget {
                    log::warn!(
                        "the worst-case path crosses an unresolved indirect branch at node {}",
                        v
                    );
                    *crossed_unknown = true;
                }

                self.print_node(v, trace, stats);

                let mut forward_edge: Option<u32> = None;
                let mut back_edge: Option<u32> = None;

                for e in graph.out_edges(v) {
                    if e.activation == 0 {
                        continue;
                    }
                    if e.kind == EdgeKind::BackwardJump {
                        if e.to != start {
                            if back_edge.is_some() {
                                log::error!(
                                    "multiple activated back edges at node {}; dynamic worst-case paths are not supported",
                                    v
                                );
                            }
                            back_edge = Some(e.id);
                        }
                    } else if graph.node(v).kind == NodeKind::Exit {
                        // leaving a function: only the return point of the
                        // active call context continues the path
                        if graph.node(e.to).end_addr == context.top() {
                            forward_edge = Some(e.id);
                        }
                    } else {
                        if forward_edge.is_some() {
                            log::error!(
                                "multiple activated forward edges at node {}; dynamic worst-case paths are not supported",
                                v
                            );
                        }
                        forward_edge = Some(e.id);
                    }
                }

                if graph.node(v).kind == NodeKind::Exit && forward_edge.is_some() {
                    context.pop();
                }

                match (forward_edge, back_edge) {
                    (Some(fw), Some(bw)) => {
                        let head = graph.edge(bw).to;
                        let bound = helper.loop_bound(head, bw);
                        if bound > 1 {
                            log::debug!(
                                "replaying loop body {} -> {} another {} times",
                                head,
                                v,
                                bound - 1
                            );
                            self.traverse_sequential(
                                head,
                                v,
                                (bound - 1) as u64,
                                context,
                                trace,
                                stats,
                                crossed_unknown,
                            )?;
                        } else if bound < 0 {
                            log::error!(
                                "activated loop at node {} has no bound; skipping its replay",
                                head
                            );
                        }
                        v = graph.edge(fw).to;
                    }
                    (Some(fw), None) => {
                        v = graph.edge(fw).to;
                    }
                    (None, Some(bw)) => {
                        v = graph.edge(bw).to;
                    }
                    (None, None) => {
                        return Err(AnalyzerError::ExportError(format!(
                            "no activated edge leaves node {} ({}); was the graph annotated?",
                            v,
                            graph.node(v).label
                        )));
                    }
                }
            }

            if end != self.expanded.exit {
                self.print_node(end, trace, stats);
            }
        }
        Ok(())
    }

    /// Append one node (and, for basic blocks, its instructions) to the
    /// trace, counting instruction classes as we go.
    fn print_node(&self, v: NodeId, trace: &mut String, stats: &mut InstrStats) {
        let node = self.expanded.graph.node(v);
        let _ = writeln!(
            trace,
            "; Node: {} Type: {} Name: {}",
            v, node.kind, node.label
        );
        if node.kind != NodeKind::BasicBlock {
            return;
        }
        for line in node.code.lines() {
            if !self.tokenizer.is_code_line(line) {
                continue;
            }
            if let (Some(addr), Some(mnemonic)) = (
                self.tokenizer.addr_from_code_line(line),
                self.tokenizer.mnemonic_from_code_line(line),
            ) {
                let _ = writeln!(trace, "{:x} \"{}\"", addr, mnemonic);
            }
            if let Some(opcode) = self.tokenizer.opcode_from_code_line(line) {
                Self::count_instruction(stats, &opcode);
            }
        }
    }

    fn count_instruction(stats: &mut InstrStats, opcode: &str) {
        stats.instructions += 1;
        let class = if decoder::is_return(opcode) {
            InstrClass::Return
        } else {
            decoder::classify(opcode).class()
        };
        match class {
            InstrClass::Arithmetic => stats.arithmetic += 1,
            InstrClass::Load | InstrClass::MultiLoad => stats.loads += 1,
            InstrClass::Store | InstrClass::MultiStore => stats.stores += 1,
            InstrClass::BranchUncond | InstrClass::IndirectBranch => stats.branches += 1,
            InstrClass::BranchCond => stats.cond_branches += 1,
            InstrClass::Call | InstrClass::IndirectCall => stats.calls += 1,
            InstrClass::Return => stats.returns += 1,
            InstrClass::Barrier => stats.sync += 1,
            InstrClass::Debug => stats.debug += 1,
            InstrClass::System => stats.other += 1,
            InstrClass::Unknown => stats.unknown += 1,
        }
    }
}
