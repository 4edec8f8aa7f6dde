//! Flow Fact Reader
//!
//! Flow facts bound loop iteration counts. The file maps an edge, given as
//! source and target basic-block addresses, to its circulation (the maximum
//! number of traversals per program run). Facts are attached to the
//! loop-injecting edge of each loop; edges without a fact keep the unknown
//! circulation −1.
//!
//! File format, line oriented:
//!
//! ```text
//! # comment
//! 0x0100 0x0104 10
//! ```

use std::collections::HashMap;

use crate::analyzer::analysis::graph::ControlFlowGraph;
use crate::analyzer::error::{AnalyzerError, Result};

/// One flow fact: edge endpoints by block start address, plus the bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowFact {
    pub source_addr: u32,
    pub target_addr: u32,
    pub max_iterations: i64,
}

/// Parsed flow-fact file.
#[derive(Debug, Clone, Default)]
pub struct FlowFacts {
    facts: HashMap<(u32, u32), i64>,
}

impl FlowFacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the textual flow-fact format.
    pub fn from_text(text: &str) -> Result<Self> {
        let mut facts = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(AnalyzerError::FlowFactError(format!(
                    "line {}: expected '<source> <target> <bound>', got '{}'",
                    lineno + 1,
                    line
                )));
            }
            let source = parse_addr(fields[0], lineno)?;
            let target = parse_addr(fields[1], lineno)?;
            let bound: i64 = fields[2].parse().map_err(|_| {
                AnalyzerError::FlowFactError(format!(
                    "line {}: invalid bound '{}'",
                    lineno + 1,
                    fields[2]
                ))
            })?;
            if bound < 0 {
                return Err(AnalyzerError::FlowFactError(format!(
                    "line {}: bound must be non-negative",
                    lineno + 1
                )));
            }
            facts.insert((source, target), bound);
        }
        Ok(Self { facts })
    }

    pub fn insert(&mut self, source_addr: u32, target_addr: u32, max_iterations: i64) {
        self.facts.insert((source_addr, target_addr), max_iterations);
    }

    /// Circulation for the edge, −1 when unconstrained.
    pub fn circulation(&self, source_addr: u32, target_addr: u32) -> i64 {
        self.facts
            .get(&(source_addr, target_addr))
            .copied()
            .unwrap_or(-1)
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Stamp the circulations onto the matching graph edges.
    ///
    /// Matching is by block start address on both endpoints; a fact that
    /// matches no edge is reported as a warning, not an error.
    pub fn annotate(&self, graph: &mut ControlFlowGraph) {
        for (&(source, target), &bound) in &self.facts {
            let mut matched = false;
            for eid in 0..graph.edges.len() {
                let from = graph.edges[eid].from;
                let to = graph.edges[eid].to;
                if graph.node(from).start_addr == source && graph.node(to).start_addr == target {
                    graph.edges[eid].circulation = bound;
                    matched = true;
                }
            }
            if !matched {
                log::warn!(
                    "flow fact 0x{:x} -> 0x{:x} matches no edge in the graph",
                    source,
                    target
                );
            } else {
                log::debug!(
                    "flow fact 0x{:x} -> 0x{:x} bound {} annotated",
                    source,
                    target,
                    bound
                );
            }
        }
    }
}

fn parse_addr(field: &str, lineno: usize) -> Result<u32> {
    let stripped = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    u32::from_str_radix(stripped, 16).map_err(|_| {
        AnalyzerError::FlowFactError(format!("line {}: invalid address '{}'", lineno + 1, field))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analysis::graph::{EdgeKind, NodeKind};

    #[test]
    fn parses_facts_and_defaults_to_unknown() {
        let facts = FlowFacts::from_text("# loops\n0x100 0x104 10\n").unwrap();
        assert_eq!(facts.circulation(0x100, 0x104), 10);
        assert_eq!(facts.circulation(0x100, 0x108), -1);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(FlowFacts::from_text("0x100 0x104").is_err());
        assert!(FlowFacts::from_text("0x100 0x104 many").is_err());
        assert!(FlowFacts::from_text("0x100 0x104 -2").is_err());
    }

    #[test]
    fn annotates_matching_edges() {
        let mut g = ControlFlowGraph::new();
        let a = g.add_node(NodeKind::BasicBlock, 0x100, 0x102);
        let b = g.add_node(NodeKind::BasicBlock, 0x104, 0x106);
        let e = g.add_edge(a, b, EdgeKind::ForwardStep);

        let facts = FlowFacts::from_text("0x100 0x104 7\n").unwrap();
        let mut g2 = g.clone();
        facts.annotate(&mut g2);
        assert_eq!(g2.edge(e).circulation, 7);
    }
}
