//! End-to-end WCET scenarios: cost computation, ILP structure, and
//! worst-case path replay, driven from dump fixtures.

#[path = "utils.rs"]
mod utils;

use std::collections::HashSet;

use wcetan_core::analyzer::analysis::graph::{EdgeKind, NodeKind};
use wcetan_core::analyzer::analysis::msg_expand::{expand_msg, ExpandedGraph};
use wcetan_core::analyzer::analysis::super_graph::build_super_graph;
use wcetan_core::analyzer::analysis::vivu::build_vivu_graph;
use wcetan_core::analyzer::config::{ArchConfig, MemoryMode};
use wcetan_core::analyzer::export::WcPathExporter;
use wcetan_core::analyzer::flow_facts::FlowFacts;
use wcetan_core::analyzer::ilp::IpetGenerator;
use wcetan_core::analyzer::timing::{annotate_edge_costs, CoreTiming};

/// Build the annotated expanded graph for a dump fixture.
fn expanded_for(dump: &str, facts: Option<&str>, mode: MemoryMode) -> ExpandedGraph {
    let program = utils::parse(dump, "main");
    let mut sg = build_super_graph(&program).unwrap();
    if let Some(text) = facts {
        FlowFacts::from_text(text).unwrap().annotate(&mut sg.graph);
    }
    let config = ArchConfig::default();
    annotate_edge_costs(&mut sg.graph, &config, mode, &HashSet::new());
    let vivu = build_vivu_graph(&sg).unwrap();
    expand_msg(&sg, &vivu).unwrap()
}

/// Walk the expanded graph along the unique forward path, assigning the
/// given activation to loop back edges and 1 elsewhere; returns the
/// objective value of that assignment.
fn objective(expanded: &ExpandedGraph) -> u64 {
    expanded
        .graph
        .edges
        .iter()
        .map(|e| (u64::from(e.cost) + u64::from(e.mem_penalty)) * e.activation)
        .sum()
}

#[test]
fn straight_line_block_cost_matches_fetch_formula() {
    // four aligned 16-bit arithmetic instructions: cost is
    // 4 * (1 + arith) plus ceil(8 bytes / fetch word) fetches
    let config = ArchConfig::default();
    let timing = CoreTiming::new(&config, true);
    let code = "\
       0:\t2001      \tmovs\tr0, #1
       2:\t3001      \tadds\tr0, #1
       4:\t2102      \tmovs\tr1, #2
       6:\t1840      \tadds\tr0, r0, r1
";
    let cycles = timing.cycles_for_block_exit_sensitive(code, false);
    let fetch_word = config.fetch_bandwidth_bits / 8;
    let expected = 4 * (1 + config.arith_latency)
        + (8u32).div_ceil(fetch_word) * config.fetch_latency_onchip;
    assert_eq!(cycles.forward_step, expected);
    assert_eq!(cycles.jump, expected);
}

#[test]
fn loop_wcet_is_first_iteration_plus_rest() {
    let mut expanded = expanded_for(utils::LOOP_DUMP, Some(utils::LOOP_FLOW_FACTS), MemoryMode::NoMem);

    // reproduce the solver's optimal activation assignment by hand: one
    // run through the program, the loop body 10 times (1 peeled + 9 rest)
    for eid in 0..expanded.graph.edges.len() as u32 {
        let kind = expanded.graph.edge(eid).kind;
        expanded.graph.edge_mut(eid).activation = match kind {
            EdgeKind::BackwardJump => 8,
            _ => 1,
        };
    }

    // per-block costs under the same model
    let config = ArchConfig::default();
    let offchip = CoreTiming::new(&config, false);
    let program = utils::parse(utils::LOOP_DUMP, "main");
    let f = program.function(0x100).unwrap();
    let pre = f.cfg.graph.node(utils::block_at(&f.cfg.graph, 0x100)).code.clone();
    let body = f.cfg.graph.node(utils::block_at(&f.cfg.graph, 0x104)).code.clone();
    let ret = f.cfg.graph.node(utils::block_at(&f.cfg.graph, 0x10a)).code.clone();

    let pre_cost = offchip.cycles_for_block_exit_sensitive(&pre, false);
    let body_cost = offchip.cycles_for_block_exit_sensitive(&body, false);
    let ret_cost = offchip.cycles_for_block_exit_sensitive(&ret, true);

    // 9 taken back branches, one fallthrough exit
    let expected = pre_cost.forward_step + 9 * body_cost.jump + body_cost.forward_step
        + ret_cost.forward_step;
    assert_eq!(objective(&expanded), u64::from(expected));
}

#[test]
fn taken_branch_cost_lands_on_jump_edges() {
    let expanded = expanded_for(utils::LOOP_DUMP, Some(utils::LOOP_FLOW_FACTS), MemoryMode::NoMem);
    let graph = &expanded.graph;

    // the rest-iteration back edge prices the taken branch, the loop exit
    // the fallthrough; on the worst-case path the difference multiplies
    // with the iteration count
    let back = graph
        .edges
        .iter()
        .find(|e| e.kind == EdgeKind::BackwardJump)
        .unwrap();
    let exit_step = graph
        .edges
        .iter()
        .find(|e| {
            e.kind == EdgeKind::ForwardStep && graph.node(e.from).start_addr == 0x104
        })
        .unwrap();
    assert!(back.cost > exit_step.cost);

    let config = ArchConfig::default();
    assert_eq!(
        back.cost - exit_step.cost,
        config.cond_branch_taken_latency - config.cond_branch_not_taken_latency
    );
}

#[test]
fn ilp_has_flow_conservation_for_every_interior_node() {
    let expanded = expanded_for(utils::LOOP_DUMP, Some(utils::LOOP_FLOW_FACTS), MemoryMode::NoMem);
    let lp = IpetGenerator::generate_lp(&expanded);

    // one constraint line mentioning each interior node's edges; spot
    // check the join node: its unroll in-edge equals its meta out-edge
    let join = expanded
        .graph
        .nodes
        .iter()
        .find(|n| n.kind == NodeKind::FlowJoinNode)
        .unwrap();
    let fsu = join.in_edges[0];
    let meta = join.out_edges[0];
    assert!(lp.contains(&format!("e{} - e{} = 0;", fsu, meta)));

    // the back edge is bounded relative to the rest-iteration entry
    let back = expanded
        .graph
        .edges
        .iter()
        .find(|e| e.kind == EdgeKind::BackwardJump)
        .unwrap();
    assert!(lp.contains(&format!("e{} - 8 e{} <= 0;", back.id, meta)));

    // exactly one program run
    let entry_edge = expanded.graph.nodes[expanded.entry as usize].out_edges[0];
    assert!(lp.contains(&format!("e{} = 1;", entry_edge)));
}

#[test]
fn wc_path_replay_matches_activation_counts() {
    let mut expanded = expanded_for(utils::LOOP_DUMP, Some(utils::LOOP_FLOW_FACTS), MemoryMode::NoMem);
    for eid in 0..expanded.graph.edges.len() as u32 {
        let kind = expanded.graph.edge(eid).kind;
        expanded.graph.edge_mut(eid).activation = match kind {
            EdgeKind::BackwardJump => 8,
            _ => 1,
        };
    }

    let exporter = WcPathExporter::new(&expanded);
    let path = exporter.traverse_wc_path().unwrap();
    assert!(!path.crossed_unknown_target);

    // the body block is visited once per execution: 10 times in total
    let body_visits = path
        .trace
        .matches("Name: 0x104")
        .count();
    assert_eq!(body_visits, 10);

    // the histogram agrees, summing both body copies
    let hist = exporter.histogram();
    assert!(hist.contains("0x104\t10"));
    assert!(hist.contains("0x100\t1"));
}

#[test]
fn callee_cost_scales_with_both_call_sites() {
    let expanded = expanded_for(utils::TWO_CALLS_DUMP, None, MemoryMode::NoMem);
    let graph = &expanded.graph;

    // the leaf body exists twice; both copies carry the same cost, so a
    // change of the callee's cost moves the bound once per activated site
    let leaf_edges: Vec<_> = graph
        .edges
        .iter()
        .filter(|e| graph.node(e.from).start_addr == 0x110)
        .collect();
    assert_eq!(leaf_edges.len(), 2);
    assert_eq!(leaf_edges[0].cost, leaf_edges[1].cost);
    assert!(leaf_edges[0].cost > 0);

    let lp = IpetGenerator::generate_lp(&expanded);
    for e in leaf_edges {
        assert!(lp.contains(&format!("{} e{}", e.cost, e.id)));
    }
}

#[test]
fn unknown_target_off_the_path_leaves_the_bound_alone() {
    let mut expanded = expanded_for(utils::UNKNOWN_TARGET_DUMP, None, MemoryMode::NoMem);
    let graph = &expanded.graph;

    // the LP forbids any flow into the dead end
    let unknown = graph
        .nodes
        .iter()
        .find(|n| n.kind == NodeKind::UnknownJumpTarget)
        .unwrap();
    let dead_in = unknown.in_edges[0];
    let lp = IpetGenerator::generate_lp(&expanded);
    assert!(lp.contains(&format!("e{} = 0;", dead_in)));

    // activate the feasible path: taken branch around the indirect jump
    let cond_block = utils::block_at(&expanded.graph, 0x100);
    let taken: Vec<u32> = expanded
        .graph
        .out_edges(cond_block)
        .filter(|e| e.kind == EdgeKind::ForwardJump)
        .map(|e| e.id)
        .collect();
    let entry_edge = expanded.graph.nodes[expanded.entry as usize].out_edges[0];
    let ret_block = utils::block_at(&expanded.graph, 0x108);
    let ret_edge = expanded.graph.nodes[ret_block as usize].out_edges[0];
    for eid in taken.into_iter().chain([entry_edge, ret_edge]) {
        expanded.graph.edge_mut(eid).activation = 1;
    }

    let exporter = WcPathExporter::new(&expanded);
    let path = exporter.traverse_wc_path().unwrap();
    assert!(!path.crossed_unknown_target);
    assert!(path.trace.contains("Name: 0x108"));
    assert!(!path.trace.contains("Name: <UNKNOWN>"));
}

#[test]
fn onchip_assignment_reduces_effective_cost() {
    let program = utils::parse(utils::STRAIGHT_DUMP, "main");
    let mut sg = build_super_graph(&program).unwrap();
    let config = ArchConfig::default();

    // off-chip pricing
    annotate_edge_costs(&mut sg.graph, &config, MemoryMode::NoMem, &HashSet::new());
    let off_cost: u32 = sg.graph.edges.iter().map(|e| e.cost).sum();

    // everything assigned: on-chip pricing, no penalties
    let assigned: HashSet<u32> = sg
        .graph
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::BasicBlock)
        .map(|n| n.start_addr)
        .collect();
    annotate_edge_costs(&mut sg.graph, &config, MemoryMode::StaticSisp, &assigned);
    let on_cost: u32 = sg.graph.edges.iter().map(|e| e.cost + e.mem_penalty).sum();
    assert!(on_cost < off_cost);

    // nothing assigned: penalties restore the off-chip price
    annotate_edge_costs(&mut sg.graph, &config, MemoryMode::StaticSisp, &HashSet::new());
    let penalized: u32 = sg.graph.edges.iter().map(|e| e.cost + e.mem_penalty).sum();
    assert_eq!(penalized, off_cost);
}
