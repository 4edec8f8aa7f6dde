//! Analysis Pipeline
//!
//! Orchestrates the complete WCET analysis: dump parsing, super graph
//! construction, flow fact annotation, cycle cost assignment, the VIVU
//! transform, ILP solving, the optional scratchpad assignment loop, and
//! the WC-path export.
//!
//! # Pipeline Stages
//! 1. **Parse**: disassembly dump → per-function CFGs
//! 2. **Inline**: CFGs → super graph (recursion rejected)
//! 3. **Flow facts**: loop bounds annotated onto the super graph
//! 4. **Cost**: per-edge cycle costs from the pipeline/fetch model
//! 5. **VIVU**: super graph → memory state graph → expanded graph
//! 6. **ILP**: IPET over the expanded graph → WCET + activations
//! 7. *(optional)* **Scratchpad**: assignment ILP, then re-run 4–6 under
//!    the assignment
//! 8. **Export**: WC-path trace + histogram

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::analyzer::analysis::msg_expand::{expand_msg, ExpandedGraph};
use crate::analyzer::analysis::super_graph::{build_super_graph, SuperGraph};
use crate::analyzer::analysis::vivu::build_vivu_graph;
use crate::analyzer::config::{ArchConfig, MemoryMode};
use crate::analyzer::error::Result;
use crate::analyzer::export::{InstrStats, WcPathExporter};
use crate::analyzer::flow_facts::FlowFacts;
use crate::analyzer::ilp::{IpetGenerator, LpSolver, SolutionKind, WcetResult};
use crate::analyzer::optimizer::SispOptimizer;
use crate::analyzer::parser::DumpParser;
use crate::analyzer::timing::annotate_edge_costs;

/// Everything one analysis run needs.
#[derive(Debug, Clone)]
pub struct PipelineInput {
    pub dump_text: String,
    pub flow_fact_text: Option<String>,
    pub entry_label: String,
    pub config: ArchConfig,
    pub memory_mode: MemoryMode,
    /// Scratchpad capacity in bytes; enables the assignment loop.
    pub scratchpad_capacity: Option<u32>,
    /// Directory for LP files and other intermediate artifacts.
    pub work_dir: PathBuf,
    /// Override for the lp_solve binary location.
    pub solver_path: Option<PathBuf>,
}

/// Machine-readable result of one run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisStats {
    pub functions: usize,
    pub scfg_nodes: usize,
    pub scfg_edges: usize,
    pub expanded_nodes: usize,
    pub expanded_edges: usize,
}

/// Outcome of one analysis run.
#[derive(Debug)]
pub struct AnalysisReport {
    pub wcet: WcetResult,
    pub wc_path_trace: String,
    pub wc_histogram: String,
    pub instr_stats: InstrStats,
    /// True when the worst-case path crosses an unresolved indirect
    /// branch; callers should exit non-zero.
    pub unresolved_branch_on_path: bool,
    pub assigned_blocks: Vec<u32>,
    pub scratchpad_used_size: u32,
    pub stats: AnalysisStats,
}

pub struct AnalysisPipeline;

impl AnalysisPipeline {
    /// Run the complete analysis.
    pub fn run(input: &PipelineInput) -> Result<AnalysisReport> {
        input.config.validate()?;

        log::info!("step 1: parsing dump ({} bytes)", input.dump_text.len());
        let program = DumpParser::new(&input.dump_text, &input.entry_label).parse()?;

        log::info!("step 2: building super graph from {} functions", program.functions.len());
        let mut super_graph = build_super_graph(&program)?;

        log::info!("step 3: annotating flow facts");
        let facts = match &input.flow_fact_text {
            Some(text) => FlowFacts::from_text(text)?,
            None => FlowFacts::new(),
        };
        if facts.is_empty() {
            log::warn!("no flow facts given; loops will stay unbounded");
        }
        facts.annotate(&mut super_graph.graph);

        let solver = Self::solver(input);

        let mut assigned: HashSet<u32> = HashSet::new();
        let mut scratchpad_used: u32 = 0;

        if let Some(capacity) = input.scratchpad_capacity {
            log::info!("step 4a: sizing scratchpad assignment for {} bytes", capacity);
            // the assignment decision needs worst-case activation counts,
            // so a first analysis round runs everything off-chip
            let mut probe =
                Self::analyze_round(&mut super_graph, &input.config, MemoryMode::NoMem, &HashSet::new())?;
            let probe_result = IpetGenerator::compute_wcet(
                &mut probe,
                &solver,
                &input.work_dir.join("wcet_probe.lp"),
            )?;
            log::info!(
                "off-chip probe bound: {} cycles ({:?})",
                probe_result.wcet,
                probe_result.kind
            );

            let activations = Self::activation_histogram(&probe);
            let mut optimizer =
                SispOptimizer::new(&super_graph.graph, &input.config, activations);
            optimizer.set_size(capacity);
            let assignment = optimizer
                .compute_assignment(&solver, &input.work_dir.join("bb_assignment.lp"))?;
            log::info!(
                "scratchpad assignment: {:?}, {} blocks, {} bytes used",
                assignment.solution_kind,
                assignment.assigned_block_addrs.len(),
                assignment.used_size
            );
            assigned = assignment.assigned_block_addrs.iter().copied().collect();
            scratchpad_used = assignment.used_size;
        }

        log::info!("step 4: assigning cycle costs ({:?})", input.memory_mode);
        let mut expanded =
            Self::analyze_round(&mut super_graph, &input.config, input.memory_mode, &assigned)?;

        log::info!("step 6: solving the WCET ILP");
        let wcet =
            IpetGenerator::compute_wcet(&mut expanded, &solver, &input.work_dir.join("wcet.lp"))?;
        log::info!("WCET bound: {} cycles ({:?})", wcet.wcet, wcet.kind);

        log::info!("step 7: exporting the worst-case path");
        let exporter = WcPathExporter::new(&expanded);
        let (trace, histogram) = if matches!(
            wcet.kind,
            SolutionKind::Optimal | SolutionKind::SubOptimal
        ) {
            let path = exporter.traverse_wc_path()?;
            let histogram = exporter.histogram();
            (Some(path), histogram)
        } else {
            (None, String::new())
        };

        let (wc_path_trace, instr_stats, unresolved) = match trace {
            Some(p) => (p.trace, p.stats, p.crossed_unknown_target),
            None => (String::new(), InstrStats::default(), false),
        };

        Ok(AnalysisReport {
            wcet,
            wc_path_trace,
            wc_histogram: histogram,
            instr_stats,
            unresolved_branch_on_path: unresolved,
            assigned_blocks: assigned.into_iter().collect(),
            scratchpad_used_size: scratchpad_used,
            stats: AnalysisStats {
                functions: program.functions.len(),
                scfg_nodes: super_graph.graph.nodes.len(),
                scfg_edges: super_graph.graph.edges.len(),
                expanded_nodes: expanded.graph.nodes.len(),
                expanded_edges: expanded.graph.edges.len(),
            },
        })
    }

    /// Cost annotation + VIVU + expansion for one memory configuration.
    fn analyze_round(
        super_graph: &mut SuperGraph,
        config: &ArchConfig,
        mode: MemoryMode,
        assigned: &HashSet<u32>,
    ) -> Result<ExpandedGraph> {
        annotate_edge_costs(&mut super_graph.graph, config, mode, assigned);
        let vivu = build_vivu_graph(super_graph)?;
        expand_msg(super_graph, &vivu)
    }

    /// Worst-case execution counts per block address, summed over contexts.
    fn activation_histogram(expanded: &ExpandedGraph) -> HashMap<u32, u64> {
        let mut histogram: HashMap<u32, u64> = HashMap::new();
        for node in &expanded.graph.nodes {
            if node.kind != crate::analyzer::analysis::graph::NodeKind::BasicBlock {
                continue;
            }
            let executed: u64 = expanded
                .graph
                .out_edges(node.id)
                .map(|e| e.activation)
                .sum();
            *histogram.entry(node.start_addr).or_insert(0) += executed;
        }
        histogram
    }

    fn solver(input: &PipelineInput) -> LpSolver {
        let mut solver = LpSolver::new(&input.config.lp_solve_parameters);
        if let Some(path) = &input.solver_path {
            solver = solver.with_solver_path(path.clone());
        }
        solver
    }
}
