//! Cost Engine
//!
//! Computes per-basic-block cycle counts under the in-order pipeline and
//! fetch model of the analyzed core, and assigns them to graph edges.
//!
//! The fetch buffer is the only carrier of temporal information between
//! instructions: it counts the unconsumed bytes available to the decoder.
//! Fetches are charged whenever the buffer cannot satisfy the decoder;
//! a 32-bit instruction at an unaligned address needs two fetches and
//! leaves an extra halfword buffered for the next instruction.
//!
//! Two entry points exist: the exit-sensitive one (default) splits the
//! conditional-branch latency between the fallthrough and taken costs,
//! the insensitive one charges the worse of the two to both.

use std::collections::HashSet;

use crate::analyzer::config::{ArchConfig, MemoryMode};
use crate::analyzer::decoder::{self, ThumbOp};
use crate::analyzer::analysis::graph::{ControlFlowGraph, EdgeKind, NodeKind};
use crate::analyzer::parser::DumpLineTokenizer;

/// Cycle counts for one block, split by how the block is left.
///
/// Only a conditional branch at the block tail makes the two differ; for
/// every other terminator both carry the same sum, so it is safe to
/// compute both even when one of the edges does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cycles {
    pub forward_step: u32,
    pub jump: u32,
}

/// Deterministic per-block timing for one memory kind.
pub struct CoreTiming<'c> {
    config: &'c ArchConfig,
    onchip: bool,
    tokenizer: DumpLineTokenizer,
}

impl<'c> CoreTiming<'c> {
    pub fn new(config: &'c ArchConfig, onchip: bool) -> Self {
        Self {
            config,
            onchip,
            tokenizer: DumpLineTokenizer::new(),
        }
    }

    /// Cycle count with the conditional-branch worst case charged to both
    /// outputs.
    pub fn cycles_for_block(&self, code: &str, entered_by_fallthrough: bool) -> Cycles {
        let mut cycles: u32 = 0;
        let mut fetch_buffer: u32 = 0;
        let mut first = true;

        for (addr, opcode) in self.code_lines(code) {
            if first && entered_by_fallthrough {
                fetch_buffer = self.initial_fetch_buffer(addr);
            }
            first = false;
            let length = decoder::instruction_length(&opcode);
            cycles += self.fetch_latency(addr, length, &mut fetch_buffer);

            let op = decoder::classify(&opcode);
            cycles += match op {
                ThumbOp::BranchCond => {
                    let taken = self.config.cond_branch_latency(true);
                    let not_taken = self.config.cond_branch_latency(false);
                    1 + taken.max(not_taken)
                }
                _ => 1 + self.class_latency(op, &opcode),
            };
        }

        Cycles {
            forward_step: cycles,
            jump: cycles,
        }
    }

    /// Cycle count with separate fallthrough/taken results for a
    /// conditional branch at the block tail.
    pub fn cycles_for_block_exit_sensitive(
        &self,
        code: &str,
        entered_by_fallthrough: bool,
    ) -> Cycles {
        let mut out = Cycles::default();
        let mut fetch_buffer: u32 = 0;
        let mut first = true;

        for (addr, opcode) in self.code_lines(code) {
            if first && entered_by_fallthrough {
                fetch_buffer = self.initial_fetch_buffer(addr);
            }
            first = false;

            let length = decoder::instruction_length(&opcode);
            let fetch = self.fetch_latency(addr, length, &mut fetch_buffer);
            out.forward_step += fetch;
            out.jump += fetch;

            let op = decoder::classify(&opcode);
            match op {
                ThumbOp::BranchCond => {
                    out.forward_step += 1 + self.config.cond_branch_latency(false);
                    out.jump += 1 + self.config.cond_branch_latency(true);
                }
                _ => {
                    let lat = 1 + self.class_latency(op, &opcode);
                    out.forward_step += lat;
                    out.jump += lat;
                }
            }
        }

        out
    }

    /// Extra latency of one instruction beyond the issue cycle.
    fn class_latency(&self, op: ThumbOp, opcode: &str) -> u32 {
        let c = self.config;
        match op {
            ThumbOp::MulReg => c.mult_latency,
            ThumbOp::MrsReg => c.mrs_latency,
            ThumbOp::MsrReg => c.msr_latency,
            ThumbOp::Branch => c.uncond_branch_latency,
            ThumbOp::BranchLink => c.call_latency,
            ThumbOp::Bx => c.bx_latency,
            ThumbOp::Blx => c.blx_latency,
            ThumbOp::LdrLit
            | ThumbOp::LdrsbReg
            | ThumbOp::LdrReg
            | ThumbOp::LdrhReg
            | ThumbOp::LdrbReg
            | ThumbOp::LdrshReg
            | ThumbOp::LdrImm
            | ThumbOp::LdrbImm
            | ThumbOp::LdrhImm => c.load_latency(self.onchip),
            ThumbOp::Ldm => decoder::register_count(opcode) * c.load_latency(self.onchip),
            ThumbOp::Pop => {
                let mut lat = decoder::register_count(opcode) * c.load_latency(self.onchip);
                if decoder::pc_in_register_list(opcode) {
                    lat += c.pop_return_extra_latency;
                }
                lat
            }
            ThumbOp::StrReg
            | ThumbOp::StrhReg
            | ThumbOp::StrbReg
            | ThumbOp::StrImm
            | ThumbOp::StrbImm
            | ThumbOp::StrhImm => c.store_latency(self.onchip),
            ThumbOp::Stm | ThumbOp::Push => {
                decoder::register_count(opcode) * c.store_latency(self.onchip)
            }
            ThumbOp::Dsb => c.dsb_latency,
            ThumbOp::Dmb => c.dmb_latency,
            ThumbOp::Isb => c.isb_latency,
            // all other instructions have the latency of arithmetic ops
            _ => c.arith_latency,
        }
    }

    /// Fetch latency of one instruction, updating the buffer state.
    fn fetch_latency(&self, address: u32, length: u32, buffered_bytes: &mut u32) -> u32 {
        let fetch_bytes = self.config.fetch_bandwidth_bits / 8;
        let latency_per_fetch = self.config.fetch_latency(self.onchip);
        let mut latency: u32 = 0;

        match length {
            2 => {
                if length <= *buffered_bytes {
                    *buffered_bytes -= length;
                } else if address & 3 != 0 {
                    // unaligned: the lower half of the fetch word is behind
                    // us, only the upper half lands in the buffer
                    latency = latency_per_fetch;
                    *buffered_bytes += fetch_bytes / 2;
                    *buffered_bytes -= length;
                } else {
                    latency = latency_per_fetch;
                    *buffered_bytes += fetch_bytes;
                    *buffered_bytes -= length;
                }
            }
            4 => {
                if length <= *buffered_bytes {
                    *buffered_bytes -= length;
                } else if length - 2 <= *buffered_bytes {
                    // first half already buffered; the fetch for the second
                    // half also buffers 16 bit of the next instruction
                    latency = latency_per_fetch;
                    *buffered_bytes += fetch_bytes;
                    *buffered_bytes -= length;
                } else if address & 3 != 0 {
                    // unaligned 32-bit instruction: two fetches, the second
                    // leaves a halfword for the next instruction
                    latency = 2 * latency_per_fetch;
                    *buffered_bytes += fetch_bytes / 2 + fetch_bytes;
                    *buffered_bytes -= length;
                } else {
                    latency = latency_per_fetch;
                    *buffered_bytes += fetch_bytes;
                    *buffered_bytes -= length;
                }
            }
            _ => {
                log::error!("instruction at 0x{:08x} has invalid length {}", address, length);
            }
        }

        latency
    }

    /// Buffer contents inherited from the preceding block.
    ///
    /// A block starting unaligned to the fetch word inherits the upper
    /// halfword of the previous fetch; an aligned block starts cold.
    fn initial_fetch_buffer(&self, address: u32) -> u32 {
        if address & 3 != 0 {
            self.config.fetch_bandwidth_bits / 8 / 2
        } else {
            0
        }
    }

    /// Iterate the `(address, opcode)` pairs of the block's code lines.
    fn code_lines<'a>(&'a self, code: &'a str) -> impl Iterator<Item = (u32, String)> + 'a {
        code.lines().filter_map(move |line| {
            if !self.tokenizer.is_code_line(line) {
                return None;
            }
            let addr = self.tokenizer.addr_from_code_line(line)?;
            let opcode = self.tokenizer.opcode_from_code_line(line)?;
            Some((addr, opcode))
        })
    }
}

/// Annotate every edge of the graph with its cycle cost per §the
/// configured memory mode.
///
/// For each basic block the on-chip and off-chip costs are computed once;
/// each out-edge then receives the cost matching how the block is left
/// (fallthrough/meta → `forward_step`, any jump → `jump`) and the memory
/// penalty of the block under a static scratchpad assignment.
pub fn annotate_edge_costs(
    graph: &mut ControlFlowGraph,
    config: &ArchConfig,
    mode: MemoryMode,
    assigned_blocks: &HashSet<u32>,
) {
    let onchip = CoreTiming::new(config, true);
    let offchip = CoreTiming::new(config, false);

    for node_id in 0..graph.nodes.len() as u32 {
        if graph.node(node_id).kind != NodeKind::BasicBlock {
            continue;
        }

        // the fetch buffer survives the block boundary only when every way
        // into the block is a fallthrough
        let entered_by_fallthrough = graph.in_degree(node_id) > 0
            && graph
                .in_edges(node_id)
                .all(|e| e.kind == EdgeKind::ForwardStep);

        let code = graph.node(node_id).code.clone();
        let (on, off) = if config.exit_sensitive_costs {
            (
                onchip.cycles_for_block_exit_sensitive(&code, entered_by_fallthrough),
                offchip.cycles_for_block_exit_sensitive(&code, entered_by_fallthrough),
            )
        } else {
            (
                onchip.cycles_for_block(&code, entered_by_fallthrough),
                offchip.cycles_for_block(&code, entered_by_fallthrough),
            )
        };

        let is_assigned = assigned_blocks.contains(&graph.node(node_id).start_addr);
        let out_ids: Vec<u32> = graph.nodes[node_id as usize].out_edges.to_vec();
        for eid in out_ids {
            let kind = graph.edge(eid).kind;
            let (on_cost, off_cost) = match kind {
                EdgeKind::ForwardStep | EdgeKind::Meta => (on.forward_step, off.forward_step),
                _ => (on.jump, off.jump),
            };
            let e = graph.edge_mut(eid);
            e.cost_onchip = on_cost;
            e.cost_offchip = off_cost;
            match mode {
                MemoryMode::NoMem => {
                    e.cost = off_cost;
                    e.mem_penalty = 0;
                }
                MemoryMode::StaticSisp => {
                    e.cost = on_cost;
                    e.mem_penalty = if is_assigned {
                        0
                    } else {
                        off_cost.saturating_sub(on_cost)
                    };
                }
                MemoryMode::DynamicSisp => {
                    // penalties for dynamic scratchpads come from a data
                    // flow analysis after graph creation
                    e.cost = on_cost;
                    e.mem_penalty = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_line(addr: u32, opcode: &str, mnemonic: &str) -> String {
        format!("{:8x}:\t{}      \t{}\n", addr, opcode, mnemonic)
    }

    fn default_config() -> ArchConfig {
        ArchConfig::default()
    }

    #[test]
    fn aligned_two_byte_block_fetch_round_trip() {
        // n aligned 16-bit instructions starting aligned: total fetch
        // latency is ceil(2n / (W/8)) * L
        let cfg = default_config();
        let timing = CoreTiming::new(&cfg, true);
        for n in 1..=8u32 {
            let mut code = String::new();
            for i in 0..n {
                code.push_str(&code_line(0x1000 + 2 * i, "2001", "movs r0, #1"));
            }
            let got = timing.cycles_for_block(&code, false);
            let fetch = ((2 * n + 3) / 4) * cfg.fetch_latency_onchip;
            let expect = n * (1 + cfg.arith_latency) + fetch;
            assert_eq!(got.forward_step, expect, "n = {}", n);
            assert_eq!(got.jump, expect, "n = {}", n);
        }
    }

    #[test]
    fn unaligned_32bit_instruction_needs_two_fetches() {
        let cfg = default_config();
        let timing = CoreTiming::new(&cfg, true);
        // bl at an address with addr & 3 == 2, cold buffer
        let code = code_line(0x1002, "f000f801", "bl 0x1008");
        let got = timing.cycles_for_block(&code, false);
        let expect = 2 * cfg.fetch_latency_onchip + 1 + cfg.call_latency;
        assert_eq!(got.forward_step, expect);
    }

    #[test]
    fn conditional_branch_splits_costs_only_when_exit_sensitive() {
        let cfg = default_config();
        let timing = CoreTiming::new(&cfg, true);
        let code = code_line(0x1000, "d001", "beq.n 0x1006");

        let sensitive = timing.cycles_for_block_exit_sensitive(&code, false);
        assert_eq!(
            sensitive.jump - sensitive.forward_step,
            cfg.cond_branch_taken_latency - cfg.cond_branch_not_taken_latency
        );

        let insensitive = timing.cycles_for_block(&code, false);
        assert_eq!(insensitive.forward_step, insensitive.jump);
        assert_eq!(insensitive.jump, sensitive.jump);
    }

    #[test]
    fn pop_with_pc_charges_return_extra() {
        let cfg = default_config();
        let timing = CoreTiming::new(&cfg, true);
        let plain = timing.cycles_for_block(&code_line(0x1000, "bc10", "pop {r4}"), false);
        let ret = timing.cycles_for_block(&code_line(0x1000, "bd10", "pop {r4, pc}"), false);
        // one more register moved plus the return refill
        let delta = cfg.load_latency_onchip + cfg.pop_return_extra_latency;
        assert_eq!(ret.forward_step - plain.forward_step, delta);
    }

    #[test]
    fn onchip_cost_never_exceeds_offchip() {
        let cfg = default_config();
        let on = CoreTiming::new(&cfg, true);
        let off = CoreTiming::new(&cfg, false);
        let mut code = String::new();
        code.push_str(&code_line(0x1000, "b510", "push {r4, lr}"));
        code.push_str(&code_line(0x1002, "6800", "ldr r0, [r0, #0]"));
        code.push_str(&code_line(0x1004, "6001", "str r1, [r0, #0]"));
        code.push_str(&code_line(0x1006, "bd10", "pop {r4, pc}"));
        let c_on = on.cycles_for_block(&code, false);
        let c_off = off.cycles_for_block(&code, false);
        assert!(c_on.forward_step <= c_off.forward_step);
        assert!(c_on.jump <= c_off.jump);
    }

    #[test]
    fn fallthrough_entry_inherits_half_fetch_word() {
        let cfg = default_config();
        let timing = CoreTiming::new(&cfg, true);
        // single 16-bit instruction at an unaligned address
        let code = code_line(0x1002, "2001", "movs r0, #1");
        let cold = timing.cycles_for_block(&code, false);
        let warm = timing.cycles_for_block(&code, true);
        // the inherited halfword saves one fetch
        assert_eq!(cold.forward_step - warm.forward_step, cfg.fetch_latency_onchip);
    }
}
