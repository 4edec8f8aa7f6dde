//! Test Utilities
//!
//! Dump fixtures and helpers shared by the integration tests.

use wcetan_core::analyzer::analysis::graph::{ControlFlowGraph, NodeId, NodeKind};
use wcetan_core::analyzer::analysis::super_graph::Program;
use wcetan_core::analyzer::parser::DumpParser;

/// Straight-line function: four aligned 16-bit arithmetic instructions
/// followed by a return.
pub const STRAIGHT_DUMP: &str = "\
00000000 <main>:
       0:\t2001      \tmovs\tr0, #1
       2:\t3001      \tadds\tr0, #1
       4:\t2102      \tmovs\tr1, #2
       6:\t1840      \tadds\tr0, r0, r1
       8:\t4770      \tbx\tlr
";

/// Counted loop: pre-block, single-block body with a conditional back
/// edge, and a return block.
pub const LOOP_DUMP: &str = "\
00000100 <main>:
     100:\t2000      \tmovs\tr0, #0
     102:\t2100      \tmovs\tr1, #0
     104:\t1840      \tadds\tr0, r0, r1
     106:\t3901      \tsubs\tr1, #1
     108:\td1fc      \tbne.n\t104 <main+0x4>
     10a:\t4770      \tbx\tlr
";

/// Flow fact bounding the loop of [`LOOP_DUMP`] to 10 body executions.
pub const LOOP_FLOW_FACTS: &str = "0x100 0x104 10\n";

/// A leaf function called from two distinct sites.
pub const TWO_CALLS_DUMP: &str = "\
00000100 <main>:
     100:\tb510      \tpush\t{r4, lr}
     102:\tf000 f805 \tbl\t110 <leaf>
     106:\t2001      \tmovs\tr0, #1
     108:\tf000 f802 \tbl\t110 <leaf>
     10c:\tbd10      \tpop\t{r4, pc}

00000110 <leaf>:
     110:\t2001      \tmovs\tr0, #1
     112:\t4770      \tbx\tlr
";

/// A conditional branch around an unresolved indirect jump; the indirect
/// branch is off the feasible worst-case path.
pub const UNKNOWN_TARGET_DUMP: &str = "\
00000100 <main>:
     100:\t2800      \tcmp\tr0, #0
     102:\td001      \tbeq.n\t108 <main+0x8>
     104:\t469f      \tmov\tpc, r3
     106:\t2001      \tmovs\tr0, #1
     108:\t4770      \tbx\tlr
";

/// Parse a dump fixture, panicking on failure.
pub fn parse(dump: &str, entry: &str) -> Program {
    DumpParser::new(dump, entry)
        .parse()
        .expect("fixture dump must parse")
}

/// The basic block starting at the given address, in any graph.
pub fn block_at(graph: &ControlFlowGraph, addr: u32) -> NodeId {
    graph
        .nodes
        .iter()
        .find(|n| n.kind == NodeKind::BasicBlock && n.start_addr == addr)
        .map(|n| n.id)
        .unwrap_or_else(|| panic!("no basic block at 0x{:x}", addr))
}
