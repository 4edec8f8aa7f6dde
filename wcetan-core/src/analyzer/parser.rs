//! Dump Parser
//!
//! Turns a disassembly listing into per-function CFGs. The listing is
//! line-oriented with three relevant shapes:
//!
//! - label line: `<address-hex> <LABEL>:`
//! - code line: `<address-hex>:\t<opcode-halfwords>\t<mnemonic+operands>`
//! - memory hole: a line of `...`
//!
//! Parsing is two-pass: the first pass collects all function labels and
//! direct jump targets (block boundaries), the second builds one CFG per
//! reachable function, starting from the configured entry label and
//! following call targets.
//!
//! Memory holes inside a function are bridged with 2-byte no-ops so block
//! address ranges stay contiguous. `.word` data directives discard the
//! accumulating block as dead-code alignment padding.

use std::collections::HashMap;

use regex::Regex;

use crate::analyzer::analysis::cfg_builder::{AddrLabel, CfgBuilder};
use crate::analyzer::analysis::graph::UNKNOWN_ADDR;
use crate::analyzer::analysis::super_graph::{ParsedFunction, Program};
use crate::analyzer::decoder::{self, ThumbOp};
use crate::analyzer::error::{AnalyzerError, Result};

/// Everything after this marker is data, not code.
const END_OF_CODE: &str = "Disassembly of section .rodata:";

/// Tokenizer for single dump lines.
///
/// The regular expressions are compiled once per parser; the tokenizer is
/// also used by the cost engine and the WC-path exporter to walk the
/// verbatim block text stored on basic blocks.
pub struct DumpLineTokenizer {
    re_label: Regex,
    re_code: Regex,
    re_hole: Regex,
}

impl Default for DumpLineTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpLineTokenizer {
    pub fn new() -> Self {
        Self {
            re_label: Regex::new(r"^([0-9a-fA-F]{4,8})\s+<([^>]+)>:\s*$").unwrap(),
            re_code: Regex::new(
                r"^\s*([0-9a-fA-F]{1,8}):\s+((?:[0-9a-fA-F]{4}[ \t]+)*[0-9a-fA-F]{4,8})[ \t]*(.*)$",
            )
            .unwrap(),
            re_hole: Regex::new(r"^\s*\.\.\.\s*$").unwrap(),
        }
    }

    pub fn is_label_line(&self, line: &str) -> bool {
        self.re_label.is_match(line)
    }

    pub fn is_code_line(&self, line: &str) -> bool {
        self.re_code.is_match(line)
    }

    pub fn is_memory_hole(&self, line: &str) -> bool {
        self.re_hole.is_match(line)
    }

    /// Address and label of a label line.
    pub fn addr_and_label(&self, line: &str) -> Option<AddrLabel> {
        let caps = self.re_label.captures(line)?;
        let address = u32::from_str_radix(&caps[1], 16).ok()?;
        Some(AddrLabel {
            address,
            label: caps[2].to_string(),
        })
    }

    /// Address of a code line.
    pub fn addr_from_code_line(&self, line: &str) -> Option<u32> {
        let caps = self.re_code.captures(line)?;
        u32::from_str_radix(&caps[1], 16).ok()
    }

    /// Opcode halfwords of a code line, compacted to a plain hex string.
    pub fn opcode_from_code_line(&self, line: &str) -> Option<String> {
        let caps = self.re_code.captures(line)?;
        Some(caps[2].chars().filter(|c| !c.is_whitespace()).collect())
    }

    /// Mnemonic and operand text of a code line.
    pub fn mnemonic_from_code_line(&self, line: &str) -> Option<String> {
        let caps = self.re_code.captures(line)?;
        Some(caps[3].trim().to_string())
    }

    /// True for `.word` data directives embedded in the code stream.
    pub fn is_word_directive(&self, line: &str) -> bool {
        self.mnemonic_from_code_line(line)
            .map(|m| m.starts_with(".word"))
            .unwrap_or(false)
    }

    /// Render a synthetic code line (used to bridge memory holes).
    pub fn assemble_code_line(&self, address: u32, opcode: &str, comment: &str) -> String {
        format!("{:8x}:\t{}      \t{}", address, opcode, comment)
    }
}

/// Two-pass parser over one disassembly dump.
pub struct DumpParser {
    lines: Vec<String>,
    tokenizer: DumpLineTokenizer,
    entry_label: String,
    labels: Vec<AddrLabel>,
    jump_targets: Vec<u32>,
    /// Plausible targets for unresolved indirect jumps, keyed by block
    /// start address.
    jump_hints: HashMap<u32, Vec<u32>>,
    /// Plausible callees for unresolved indirect calls, keyed by call
    /// instruction address.
    call_hints: HashMap<u32, Vec<AddrLabel>>,
}

impl DumpParser {
    pub fn new(dump_text: &str, entry_label: &str) -> Self {
        Self {
            lines: dump_text.lines().map(|l| l.to_string()).collect(),
            tokenizer: DumpLineTokenizer::new(),
            entry_label: entry_label.to_string(),
            labels: Vec::new(),
            jump_targets: Vec::new(),
            jump_hints: HashMap::new(),
            call_hints: HashMap::new(),
        }
    }

    pub fn with_jump_hints(mut self, hints: HashMap<u32, Vec<u32>>) -> Self {
        self.jump_hints = hints;
        self
    }

    pub fn with_call_hints(mut self, hints: HashMap<u32, Vec<AddrLabel>>) -> Self {
        self.call_hints = hints;
        self
    }

    /// Parse the dump into the program's per-function CFGs.
    pub fn parse(mut self) -> Result<Program> {
        self.extract_labels()?;

        let entry_function = self
            .labels
            .iter()
            .find(|l| l.label == self.entry_label)
            .cloned()
            .ok_or_else(|| {
                AnalyzerError::ParseError(format!(
                    "entry label {} not found in dump",
                    self.entry_label
                ))
            })?;

        log::info!(
            "found {} labels and {} jump targets, entry {} at 0x{:x}",
            self.labels.len(),
            self.jump_targets.len(),
            entry_function.label,
            entry_function.address
        );

        let mut functions: Vec<ParsedFunction> = Vec::new();
        let mut worklist: Vec<AddrLabel> = vec![entry_function.clone()];
        let mut processed: Vec<u32> = Vec::new();

        while let Some(actual) = worklist.pop() {
            if processed.contains(&actual.address) || actual.address == UNKNOWN_ADDR {
                continue;
            }
            processed.push(actual.address);

            log::info!("creating cfg for {} at 0x{:x}", actual.label, actual.address);
            let cfg = self.parse_function(&actual)?;

            for target in &cfg.call_targets {
                if target.address != UNKNOWN_ADDR && !processed.contains(&target.address) {
                    log::debug!(
                        "queueing called label {} at 0x{:x}",
                        target.label,
                        target.address
                    );
                    worklist.push(target.clone());
                }
            }
            functions.push(ParsedFunction {
                address: actual.address,
                name: actual.label.clone(),
                cfg,
            });
        }

        Ok(Program {
            entry_function,
            functions,
        })
    }

    /// First pass: collect labels and every statically resolvable jump
    /// target (block boundaries for the second pass).
    fn extract_labels(&mut self) -> Result<()> {
        for line in &self.lines {
            if line == END_OF_CODE {
                break;
            }
            if self.tokenizer.is_code_line(line) {
                let opcode = match self.tokenizer.opcode_from_code_line(line) {
                    Some(o) => o,
                    None => continue,
                };
                if self.tokenizer.is_word_directive(line) {
                    continue;
                }
                let curr_addr = self.tokenizer.addr_from_code_line(line).unwrap_or(0);
                if decoder::classify(&opcode).is_branch() {
                    if let Some(target) = decoder::jump_target(&opcode, curr_addr) {
                        self.jump_targets.push(target);
                    }
                }
            } else if self.tokenizer.is_label_line(line) {
                if let Some(label) = self.tokenizer.addr_and_label(line) {
                    log::debug!("label {} at 0x{:x}", label.label, label.address);
                    self.labels.push(label);
                }
            }
        }
        Ok(())
    }

    /// Second pass: build the CFG of one function.
    fn parse_function(&self, function: &AddrLabel) -> Result<crate::analyzer::analysis::cfg_builder::FunctionCfg> {
        let mut builder = CfgBuilder::new();

        let start_line = self
            .lines
            .iter()
            .position(|l| {
                self.tokenizer
                    .addr_and_label(l)
                    .map(|al| al.address == function.address)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                AnalyzerError::ParseError(format!(
                    "no label line for function {} at 0x{:x}",
                    function.label, function.address
                ))
            })?;

        let mut in_bb = false;
        let mut bb_code = String::new();
        let mut bb_start: u32 = 0;
        let mut bb_size: u32 = 0;
        let mut bb_instrs: u32 = 0;
        let mut next_instr_address: u32 = 0;
        let mut hole_start: u32 = 0;
        let mut hole_pending = false;
        let mut finished = false;

        for line in &self.lines[start_line..] {
            if finished {
                break;
            }
            if line == END_OF_CODE {
                break;
            }
            if self.tokenizer.is_code_line(line) {
                if self.tokenizer.is_word_directive(line) {
                    // alignment padding: throw away whatever was
                    // accumulating, the next real instruction opens a
                    // fresh block
                    if in_bb {
                        log::debug!(
                            "discarding block at 0x{:x} interrupted by .word data",
                            bb_start
                        );
                    }
                    in_bb = false;
                    bb_code.clear();
                    bb_size = 0;
                    bb_instrs = 0;
                    if let (Some(addr), Some(op)) = (
                        self.tokenizer.addr_from_code_line(line),
                        self.tokenizer.opcode_from_code_line(line),
                    ) {
                        next_instr_address = addr + (op.len() as u32 / 2);
                    }
                    continue;
                }

                let opcode = self
                    .tokenizer
                    .opcode_from_code_line(line)
                    .ok_or_else(|| AnalyzerError::ParseError(format!("bad code line: {}", line)))?;
                let curr_addr = self
                    .tokenizer
                    .addr_from_code_line(line)
                    .ok_or_else(|| AnalyzerError::ParseError(format!("bad code line: {}", line)))?;
                let op = decoder::classify_checked(&opcode, curr_addr)?;
                let op_length = decoder::instruction_length(&opcode);
                next_instr_address = curr_addr + op_length;

                let is_jump_target = self.jump_targets.contains(&next_instr_address);

                if !in_bb {
                    in_bb = true;
                    bb_start = if hole_pending { hole_start } else { curr_addr };
                }

                if hole_pending {
                    self.bridge_hole(&mut bb_code, &mut bb_size, &mut bb_instrs, hole_start, curr_addr)?;
                    hole_pending = false;
                }

                bb_code.push_str(line);
                bb_code.push('\n');
                bb_size += op_length;
                bb_instrs += 1;

                let mnemonic = self
                    .tokenizer
                    .mnemonic_from_code_line(line)
                    .unwrap_or_default();
                let is_return = Self::is_return_instr(op, &opcode, &mnemonic);
                let is_branch = op.is_branch() || is_return;

                if is_branch || is_jump_target {
                    if is_return {
                        log::debug!("block 0x{:x} ends on return", bb_start);
                        builder.add_return_block(bb_start, curr_addr, &bb_code, bb_size, bb_instrs);
                        finished = builder.is_finished();
                    } else if op.is_cond_branch() {
                        log::debug!("block 0x{:x} ends on conditional branch", bb_start);
                        match decoder::jump_target(&opcode, curr_addr) {
                            Some(target) => builder.add_cond_block(
                                bb_start,
                                curr_addr,
                                next_instr_address,
                                &[target],
                                &bb_code,
                                bb_size,
                                bb_instrs,
                            ),
                            None => {
                                log::warn!(
                                    "in {} (0x{:x}): conditional jump target unresolved, using unknown target",
                                    function.label,
                                    function.address
                                );
                                let hints = self.jump_hints.get(&bb_start).cloned();
                                let targets = hints.unwrap_or_else(|| vec![UNKNOWN_ADDR]);
                                builder.add_cond_block(
                                    bb_start,
                                    curr_addr,
                                    next_instr_address,
                                    &targets,
                                    &bb_code,
                                    bb_size,
                                    bb_instrs,
                                );
                            }
                        }
                        finished = builder.is_finished();
                    } else if op.is_call() {
                        log::debug!("block 0x{:x} ends on call", bb_start);
                        let targets = match decoder::jump_target(&opcode, curr_addr) {
                            Some(target) => vec![self.label_for_addr(target)],
                            None => {
                                let hinted = self.call_hints.get(&curr_addr).cloned();
                                hinted.unwrap_or_else(|| {
                                    log::warn!(
                                        "in {} (0x{:x}): call target unresolved, omitting call site",
                                        function.label,
                                        function.address
                                    );
                                    vec![AddrLabel {
                                        address: UNKNOWN_ADDR,
                                        label: "NOLABEL".to_string(),
                                    }]
                                })
                            }
                        };
                        builder.add_call_block(
                            bb_start,
                            curr_addr,
                            next_instr_address,
                            &bb_code,
                            bb_size,
                            bb_instrs,
                            &targets,
                        );
                        finished = builder.is_finished();
                    } else if is_branch {
                        log::debug!("block 0x{:x} ends on unconditional branch", bb_start);
                        match decoder::jump_target(&opcode, curr_addr) {
                            Some(target) => builder.add_block(
                                bb_start, curr_addr, target, &bb_code, bb_size, bb_instrs,
                            ),
                            None => {
                                let hints = self.jump_hints.get(&bb_start).cloned();
                                match hints {
                                    Some(targets) if !targets.is_empty() => {
                                        for t in &targets {
                                            log::info!(
                                                "indirect jump at 0x{:x} may target 0x{:x}",
                                                curr_addr,
                                                t
                                            );
                                        }
                                        builder.add_block_multi(
                                            bb_start, curr_addr, &targets, &bb_code, bb_size,
                                            bb_instrs,
                                        );
                                    }
                                    _ => {
                                        log::warn!(
                                            "in {} (0x{:x}): jump target unresolved, using unknown target",
                                            function.label,
                                            function.address
                                        );
                                        builder.add_block(
                                            bb_start,
                                            curr_addr,
                                            UNKNOWN_ADDR,
                                            &bb_code,
                                            bb_size,
                                            bb_instrs,
                                        );
                                    }
                                }
                            }
                        }
                        finished = builder.is_finished();
                    } else {
                        // the next address is a jump target: split here
                        log::debug!("block 0x{:x} ends before jump target", bb_start);
                        builder.add_block(
                            bb_start,
                            curr_addr,
                            next_instr_address,
                            &bb_code,
                            bb_size,
                            bb_instrs,
                        );
                    }
                    bb_code.clear();
                    bb_size = 0;
                    bb_instrs = 0;
                    in_bb = false;
                }
            } else if self.tokenizer.is_memory_hole(line) {
                log::debug!(
                    "memory hole detected, bridge starts at 0x{:x}",
                    next_instr_address
                );
                hole_start = next_instr_address;
                hole_pending = true;
            }
        }

        builder.finish(function)
    }

    /// Fill a linker gap with 2-byte no-ops so the block stays contiguous.
    fn bridge_hole(
        &self,
        bb_code: &mut String,
        bb_size: &mut u32,
        bb_instrs: &mut u32,
        hole_start: u32,
        resume_addr: u32,
    ) -> Result<()> {
        if resume_addr < hole_start || (resume_addr - hole_start) % 2 != 0 {
            return Err(AnalyzerError::ParseError(format!(
                "unbridgeable memory hole from 0x{:x} to 0x{:x}",
                hole_start, resume_addr
            )));
        }
        let needed = (resume_addr - hole_start) / 2;
        log::debug!(
            "bridging memory hole 0x{:x}..0x{:x} with {} no-ops",
            hole_start,
            resume_addr,
            needed
        );
        for i in 0..needed {
            let line = self.tokenizer.assemble_code_line(
                hole_start + 2 * i,
                "bf00",
                "nop ; bridges memory hole",
            );
            bb_code.push_str(&line);
            bb_code.push('\n');
            *bb_size += 2;
            *bb_instrs += 1;
        }
        Ok(())
    }

    /// Return detection: a pop that writes the PC, or a BX through the
    /// link register. A BX through any other register is an indirect jump.
    fn is_return_instr(op: ThumbOp, opcode: &str, mnemonic: &str) -> bool {
        match op {
            ThumbOp::Pop => decoder::pc_in_register_list(opcode),
            ThumbOp::Bx => mnemonic.contains("lr"),
            _ => false,
        }
    }

    fn label_for_addr(&self, address: u32) -> AddrLabel {
        match self.labels.iter().find(|l| l.address == address) {
            Some(l) => l.clone(),
            None => {
                log::warn!("no label found for call target 0x{:x}", address);
                AddrLabel {
                    address: UNKNOWN_ADDR,
                    label: "LABELNOTFOUND".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analysis::graph::NodeKind;

    const LEAF_DUMP: &str = "\
00000100 <main>:
     100:\t2001      \tmovs\tr0, #1
     102:\t2102      \tmovs\tr1, #2
     104:\t4770      \tbx\tlr
";

    #[test]
    fn tokenizer_classifies_lines() {
        let t = DumpLineTokenizer::new();
        assert!(t.is_label_line("00000100 <main>:"));
        assert!(!t.is_code_line("00000100 <main>:"));
        assert!(t.is_code_line("     100:\t2001      \tmovs\tr0, #1"));
        assert!(t.is_code_line("     102:\tf000 f801 \tbl\t108 <leaf>"));
        assert!(t.is_memory_hole("\t..."));
        assert_eq!(
            t.addr_from_code_line("     100:\t2001      \tmovs\tr0, #1"),
            Some(0x100)
        );
        assert_eq!(
            t.opcode_from_code_line("     102:\tf000 f801 \tbl\t108 <leaf>"),
            Some("f000f801".to_string())
        );
        assert_eq!(
            t.mnemonic_from_code_line("     100:\t2001      \tmovs\tr0, #1"),
            Some("movs\tr0, #1".to_string())
        );
        let al = t.addr_and_label("00000108 <leaf>:").unwrap();
        assert_eq!(al.address, 0x108);
        assert_eq!(al.label, "leaf");
    }

    #[test]
    fn parses_straight_line_function() {
        let program = DumpParser::new(LEAF_DUMP, "main").parse().unwrap();
        assert_eq!(program.functions.len(), 1);
        let main = &program.functions[0];
        assert_eq!(main.name, "main");
        let bbs: Vec<_> = main
            .cfg
            .graph
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::BasicBlock)
            .collect();
        assert_eq!(bbs.len(), 1);
        assert_eq!(bbs[0].start_addr, 0x100);
        assert_eq!(bbs[0].end_addr, 0x104);
        assert_eq!(bbs[0].size, 6);
        assert_eq!(bbs[0].instr_count, 3);
    }

    #[test]
    fn parses_call_and_follows_callee() {
        let dump = "\
00000100 <main>:
     100:\tb510      \tpush\t{r4, lr}
     102:\tf000 f801 \tbl\t108 <leaf>
     106:\tbd10      \tpop\t{r4, pc}

00000108 <leaf>:
     108:\t2001      \tmovs\tr0, #1
     10a:\t4770      \tbx\tlr
";
        let program = DumpParser::new(dump, "main").parse().unwrap();
        assert_eq!(program.functions.len(), 2);
        let main = program.function(0x100).unwrap();
        assert_eq!(main.cfg.call_targets.len(), 1);
        assert_eq!(main.cfg.call_targets[0].address, 0x108);
        assert!(program.function(0x108).is_some());
    }

    #[test]
    fn splits_block_at_backward_branch_target() {
        // 100: head, 104: tail with loop back to 100, 106: exit path
        let dump = "\
00000100 <spin>:
     100:\t2001      \tmovs\tr0, #1
     102:\t2102      \tmovs\tr1, #2
     104:\td1fc      \tbne.n\t100 <spin>
     106:\t4770      \tbx\tlr
";
        let program = DumpParser::new(dump, "spin").parse().unwrap();
        let f = program.function(0x100).unwrap();
        let head = f
            .cfg
            .graph
            .nodes
            .iter()
            .find(|n| n.kind == NodeKind::BasicBlock && n.start_addr == 0x100)
            .unwrap();
        // the conditional branch block carries both a fallthrough and the
        // back jump
        let tail_edges: Vec<_> = f.cfg.graph.out_edges(head.id).collect();
        assert_eq!(tail_edges.len(), 2);
    }

    #[test]
    fn bridges_memory_holes_with_nops() {
        let dump = "\
00000100 <main>:
     100:\t2001      \tmovs\tr0, #1
\t...
     108:\t4770      \tbx\tlr
";
        let program = DumpParser::new(dump, "main").parse().unwrap();
        let f = program.function(0x100).unwrap();
        let bb = f
            .cfg
            .graph
            .nodes
            .iter()
            .find(|n| n.kind == NodeKind::BasicBlock)
            .unwrap();
        // 2 real instructions + 3 bridging no-ops (0x102, 0x104, 0x106)
        assert_eq!(bb.instr_count, 5);
        assert_eq!(bb.size, 10);
        assert_eq!(bb.start_addr, 0x100);
        assert_eq!(bb.end_addr, 0x108);
    }

    #[test]
    fn word_directive_discards_accumulating_block() {
        let dump = "\
00000100 <main>:
     100:\t2001      \tmovs\tr0, #1
     102:\t00000000 \t.word\t0x00000000
     106:\t2001      \tmovs\tr0, #1
     108:\t4770      \tbx\tlr
";
        let program = DumpParser::new(dump, "main").parse().unwrap();
        let f = program.function(0x100).unwrap();
        let bbs: Vec<_> = f
            .cfg
            .graph
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::BasicBlock)
            .collect();
        // only the block after the data directive survives
        assert_eq!(bbs.len(), 1);
        assert_eq!(bbs[0].start_addr, 0x106);
    }

    #[test]
    fn missing_entry_label_is_fatal() {
        let err = DumpParser::new(LEAF_DUMP, "nosuch").parse().unwrap_err();
        assert!(matches!(err, AnalyzerError::ParseError(_)));
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let dump = "\
00000100 <main>:
     100:\tffff      \t.insn\t0xffff
";
        let err = DumpParser::new(dump, "main").parse().unwrap_err();
        assert!(matches!(err, AnalyzerError::DecodeError { .. }));
    }
}
