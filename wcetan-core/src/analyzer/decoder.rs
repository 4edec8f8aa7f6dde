//! ARMv6-M Instruction Classifier
//!
//! This module decodes ARMv6-M Thumb instructions from their opcode hex
//! strings as they appear in a disassembly dump. It provides the abstract
//! instruction class, the encoding length, direct branch targets, register
//! lists of multi-register memory operations, and the displacement category
//! used by the scratchpad optimizer to price short-to-long jump widening.
//!
//! # Decoding Algorithm
//! The decoder uses a two-stage approach:
//! 1. Determine the encoding length from the top 5 bits of the first
//!    halfword (`0b11101/0b11110/0b11111` introduce a 32-bit encoding)
//! 2. Dispatch on the primary opcode field (bits 11-15 for 16-bit
//!    encodings; the `MSR/MRS/barrier/BL` subset for 32-bit encodings)
//!
//! # Failure model
//! Unrecognized encodings map to [`ThumbOp::Unknown`]. Callers that require
//! classification use [`classify_checked`], which turns `Unknown` into a
//! fatal [`AnalyzerError::DecodeError`] — a malformed dump must never be
//! silently reclassified as arithmetic.

use crate::analyzer::config::DisplacementCategory;
use crate::analyzer::error::{AnalyzerError, Result};

/// ARMv6-M Thumb operations.
///
/// One variant per architecturally distinct operation, following the
/// Thumb-1 encoding tables plus the 32-bit subset ARMv6-M supports
/// (BL, MSR, MRS and the barriers).
///
/// Uses `#[repr(u8)]` to reduce size from the default enum size to 1 byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThumbOp {
    LslImm,
    LsrImm,
    AsrImm,
    AddReg,
    SubReg,
    AddImm3,
    SubImm3,
    MovImm,
    CmpImm,
    AddImm8,
    SubImm8,
    AndReg,
    EorReg,
    LslReg,
    LsrReg,
    AsrReg,
    AdcReg,
    SbcReg,
    RorReg,
    TstReg,
    RsbImm,
    CmpReg,
    CmnReg,
    OrrReg,
    MulReg,
    BicReg,
    MvnReg,
    MovReg,
    Bx,
    Blx,
    LdrLit,
    StrReg,
    StrhReg,
    StrbReg,
    LdrsbReg,
    LdrReg,
    LdrhReg,
    LdrbReg,
    LdrshReg,
    StrImm,
    LdrImm,
    StrbImm,
    LdrbImm,
    StrhImm,
    LdrhImm,
    AdrImm,
    AddSpImm,
    SubSpImm,
    Sxth,
    Sxtb,
    Uxth,
    Uxtb,
    Push,
    Cps,
    Rev,
    Rev16,
    Revsh,
    Pop,
    Bkpt,
    Nop,
    Yield,
    Wfe,
    Wfi,
    Sev,
    Stm,
    Ldm,
    BranchCond,
    Udf,
    Svc,
    Branch,
    MsrReg,
    MrsReg,
    BranchLink,
    Dsb,
    Dmb,
    Isb,
    Unknown,
}

/// Coarse instruction classes used for WC-path statistics and export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstrClass {
    Arithmetic = 0,
    Load = 1,
    Store = 2,
    MultiLoad = 3,
    MultiStore = 4,
    BranchUncond = 5,
    BranchCond = 6,
    Call = 7,
    IndirectBranch = 8,
    IndirectCall = 9,
    Return = 10,
    Barrier = 11,
    System = 12,
    Debug = 13,
    Unknown = 14,
}

impl ThumbOp {
    /// Coarse class of this operation.
    pub fn class(self) -> InstrClass {
        use ThumbOp::*;
        match self {
            LdrLit | LdrsbReg | LdrReg | LdrhReg | LdrbReg | LdrshReg | LdrImm | LdrbImm
            | LdrhImm => InstrClass::Load,
            StrReg | StrhReg | StrbReg | StrImm | StrbImm | StrhImm => InstrClass::Store,
            Ldm | Pop => InstrClass::MultiLoad,
            Stm | Push => InstrClass::MultiStore,
            Branch => InstrClass::BranchUncond,
            BranchCond => InstrClass::BranchCond,
            BranchLink => InstrClass::Call,
            Bx => InstrClass::IndirectBranch,
            Blx => InstrClass::IndirectCall,
            Dsb | Dmb | Isb => InstrClass::Barrier,
            MsrReg | MrsReg | Cps | Nop | Yield | Wfe | Wfi | Sev | Svc => InstrClass::System,
            Bkpt | Udf => InstrClass::Debug,
            Unknown => InstrClass::Unknown,
            _ => InstrClass::Arithmetic,
        }
    }

    /// True for any instruction that may redirect control flow.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            ThumbOp::Branch
                | ThumbOp::BranchCond
                | ThumbOp::BranchLink
                | ThumbOp::Bx
                | ThumbOp::Blx
        )
    }

    pub fn is_cond_branch(self) -> bool {
        self == ThumbOp::BranchCond
    }

    pub fn is_call(self) -> bool {
        matches!(self, ThumbOp::BranchLink | ThumbOp::Blx)
    }
}

/// Parse an opcode hex string (whitespace tolerated) into its integer value.
fn opcode_value(opcode: &str) -> Option<u32> {
    let compact: String = opcode.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() || compact.len() > 8 {
        return None;
    }
    u32::from_str_radix(&compact, 16).ok()
}

/// Determine if the given first halfword introduces a 32-bit encoding.
///
/// 32-bit iff the top 5 bits are `0b11101`, `0b11110` or `0b11111`.
fn is_32bit_halfword(halfword: u16) -> bool {
    matches!(halfword >> 11, 0x1d | 0x1e | 0x1f)
}

/// Determine if the given opcode string describes a 32-bit instruction.
pub fn is_32bit(opcode: &str) -> bool {
    match opcode_value(opcode) {
        Some(v) => {
            let halfword = if v > 0xffff { (v >> 16) as u16 } else { v as u16 };
            is_32bit_halfword(halfword)
        }
        None => false,
    }
}

/// Length of the instruction in bytes (2 or 4).
pub fn instruction_length(opcode: &str) -> u32 {
    if is_32bit(opcode) {
        4
    } else {
        2
    }
}

/// Classify an instruction from its opcode hex string.
///
/// Unrecognized or unparsable encodings yield [`ThumbOp::Unknown`].
pub fn classify(opcode: &str) -> ThumbOp {
    let value = match opcode_value(opcode) {
        Some(v) => v,
        None => return ThumbOp::Unknown,
    };
    if is_32bit(opcode) {
        classify_32bit(value)
    } else {
        classify_16bit(value as u16)
    }
}

/// Classify an instruction, failing loudly on unknown encodings.
pub fn classify_checked(opcode: &str, address: u32) -> Result<ThumbOp> {
    match classify(opcode) {
        ThumbOp::Unknown => Err(AnalyzerError::DecodeError {
            address,
            opcode: opcode.to_string(),
        }),
        op => Ok(op),
    }
}

/// Decode a 16-bit Thumb instruction.
///
/// Dispatches on bits 11-15, then on the secondary fields the respective
/// encoding group defines.
fn classify_16bit(instr: u16) -> ThumbOp {
    log::trace!("classifying 16-bit instr: 0x{:04x}", instr);

    match (instr >> 11) & 0x1f {
        0x00 => ThumbOp::LslImm,
        0x01 => ThumbOp::LsrImm,
        0x02 => ThumbOp::AsrImm,
        // add/sub register and 3-bit immediate forms
        0x03 => match (instr >> 9) & 0x3 {
            0x0 => ThumbOp::AddReg, // encoding T1
            0x1 => ThumbOp::SubReg,
            0x2 => ThumbOp::AddImm3,
            _ => ThumbOp::SubImm3,
        },
        0x04 => ThumbOp::MovImm,
        0x05 => ThumbOp::CmpImm,
        0x06 => ThumbOp::AddImm8,
        0x07 => ThumbOp::SubImm8,
        0x08 => {
            if (instr >> 10) & 0x1 == 0 {
                // data processing, secondary opcode in bits 6-9
                match (instr >> 6) & 0xf {
                    0x0 => ThumbOp::AndReg,
                    0x1 => ThumbOp::EorReg,
                    0x2 => ThumbOp::LslReg,
                    0x3 => ThumbOp::LsrReg,
                    0x4 => ThumbOp::AsrReg,
                    0x5 => ThumbOp::AdcReg,
                    0x6 => ThumbOp::SbcReg,
                    0x7 => ThumbOp::RorReg,
                    0x8 => ThumbOp::TstReg,
                    0x9 => ThumbOp::RsbImm,
                    0xa => ThumbOp::CmpReg, // encoding T1
                    0xb => ThumbOp::CmnReg,
                    0xc => ThumbOp::OrrReg,
                    0xd => ThumbOp::MulReg,
                    0xe => ThumbOp::BicReg,
                    _ => ThumbOp::MvnReg,
                }
            } else {
                // special data instructions and branch-and-exchange
                match (instr >> 8) & 0x3 {
                    0x0 => ThumbOp::AddReg, // encoding T2
                    0x1 => {
                        if (instr >> 6) & 0x3 != 0 {
                            ThumbOp::CmpReg // encoding T2
                        } else {
                            ThumbOp::Unknown
                        }
                    }
                    0x2 => {
                        // a MOV with the PC as destination is an indirect jump
                        if mov_writes_pc(instr) {
                            ThumbOp::Bx
                        } else {
                            ThumbOp::MovReg
                        }
                    }
                    _ => {
                        if (instr >> 7) & 0x1 == 0 {
                            ThumbOp::Bx
                        } else {
                            ThumbOp::Blx
                        }
                    }
                }
            }
        }
        0x09 => ThumbOp::LdrLit,
        // load/store register offset, group 1
        0x0a => match (instr >> 9) & 0x3 {
            0x0 => ThumbOp::StrReg,
            0x1 => ThumbOp::StrhReg,
            0x2 => ThumbOp::StrbReg,
            _ => ThumbOp::LdrsbReg,
        },
        // load/store register offset, group 2
        0x0b => match (instr >> 9) & 0x3 {
            0x0 => ThumbOp::LdrReg,
            0x1 => ThumbOp::LdrhReg,
            0x2 => ThumbOp::LdrbReg,
            _ => ThumbOp::LdrshReg,
        },
        0x0c => ThumbOp::StrImm, // encoding T1
        0x0d => ThumbOp::LdrImm, // encoding T1
        0x0e => ThumbOp::StrbImm,
        0x0f => ThumbOp::LdrbImm,
        0x10 => ThumbOp::StrhImm,
        0x11 => ThumbOp::LdrhImm,
        0x12 => ThumbOp::StrImm, // encoding T2 (SP-relative)
        0x13 => ThumbOp::LdrImm, // encoding T2 (SP-relative)
        0x14 => ThumbOp::AdrImm,
        0x15 => ThumbOp::AddSpImm, // encoding T1
        0x16 => {
            if (instr >> 10) & 0x1 == 0 {
                match (instr >> 6) & 0xf {
                    0x0 | 0x1 => ThumbOp::AddSpImm, // encoding T2
                    0x2 | 0x3 => ThumbOp::SubSpImm,
                    0x8 => ThumbOp::Sxth,
                    0x9 => ThumbOp::Sxtb,
                    0xa => ThumbOp::Uxth,
                    0xb => ThumbOp::Uxtb,
                    _ => ThumbOp::Unknown,
                }
            } else if (instr >> 9) & 0x1 == 0 {
                ThumbOp::Push
            } else if (instr >> 5) & 0xf == 0x3 {
                ThumbOp::Cps
            } else {
                ThumbOp::Unknown
            }
        }
        0x17 => {
            if (instr >> 10) & 0x1 == 0 {
                match (instr >> 6) & 0xf {
                    0x8 => ThumbOp::Rev,
                    0x9 => ThumbOp::Rev16,
                    0xb => ThumbOp::Revsh,
                    _ => ThumbOp::Unknown,
                }
            } else if (instr >> 9) & 0x1 == 0 {
                ThumbOp::Pop
            } else if (instr >> 8) & 0x1 == 0 {
                ThumbOp::Bkpt
            } else {
                // hint instructions, opA in bits 4-7
                match (instr >> 4) & 0xf {
                    0x0 => ThumbOp::Nop,
                    0x1 => ThumbOp::Yield,
                    0x2 => ThumbOp::Wfe,
                    0x3 => ThumbOp::Wfi,
                    0x4 => ThumbOp::Sev,
                    _ => ThumbOp::Unknown,
                }
            }
        }
        0x18 => ThumbOp::Stm,
        0x19 => ThumbOp::Ldm,
        0x1a | 0x1b => {
            // conditional branch, with the cond=0b111x slots holding UDF/SVC
            if (instr >> 9) & 0x7 != 0x7 {
                ThumbOp::BranchCond
            } else if (instr >> 8) & 0x1 == 0 {
                ThumbOp::Udf
            } else {
                ThumbOp::Svc
            }
        }
        0x1c => ThumbOp::Branch,
        // 0x1d-0x1f introduce 32-bit encodings and must not reach here
        _ => ThumbOp::Unknown,
    }
}

/// Decode the 32-bit subset ARMv6-M supports: BL, MSR, MRS, DSB/DMB/ISB
/// and the permanently-undefined UDF.W slot.
fn classify_32bit(instr: u32) -> ThumbOp {
    log::trace!("classifying 32-bit instr: 0x{:08x}", instr);

    if (instr >> 27) & 0x3 == 2 && (instr >> 15) & 0x1 == 1 {
        if (instr >> 12) & 0x5 == 0x0 {
            if (instr >> 20) & 0x3e == 0x38 {
                ThumbOp::MsrReg
            } else if (instr >> 20) & 0x3f == 0x3b {
                match (instr >> 4) & 0xf {
                    0x4 => ThumbOp::Dsb,
                    0x5 => ThumbOp::Dmb,
                    0x6 => ThumbOp::Isb,
                    _ => ThumbOp::Unknown,
                }
            } else if (instr >> 20) & 0x3e == 0x3e {
                ThumbOp::MrsReg
            } else if (instr >> 12) & 0x7 == 0x2 && (instr >> 20) & 0x7f == 0x7f {
                ThumbOp::Udf
            } else {
                ThumbOp::Unknown
            }
        } else if (instr >> 12) & 0x5 == 0x5 {
            ThumbOp::BranchLink
        } else {
            ThumbOp::Unknown
        }
    } else {
        ThumbOp::Unknown
    }
}

/// True when a `MOV (register)` encoding T1 writes the PC, making it an
/// indirect jump.
fn mov_writes_pc(instr: u16) -> bool {
    // Rd consists of bit 7 and bits 0-2
    (instr & 0x87) == 0x87
}

/// 11-bit sign-extended immediate of the unconditional branch encoding.
fn imm11_signed(instr: u16) -> i32 {
    (((instr & 0x7ff) as i32) << 21) >> 21
}

/// 8-bit sign-extended immediate of the conditional branch encoding.
fn imm8_signed(instr: u16) -> i32 {
    (((instr & 0xff) as i32) << 24) >> 24
}

/// Displacement of the 32-bit BL encoding.
///
/// `I1 = NOT(J1 EOR S); I2 = NOT(J2 EOR S);`
/// `imm32 = SignExtend(S:I1:I2:imm10:imm11:'0', 32)`
fn bl_displacement(instr: u32) -> i32 {
    let s = (instr >> 26) & 0x1;
    let j1 = (instr >> 13) & 0x1;
    let j2 = (instr >> 11) & 0x1;
    let imm10 = (instr >> 16) & 0x3ff;
    let imm11 = instr & 0x7ff;

    let i1 = (!(j1 ^ s)) & 1;
    let i2 = (!(j2 ^ s)) & 1;

    let disp = ((s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1)) as i32;

    // sign extend from 25 bits
    (disp << 7) >> 7
}

/// Target address of a direct branch, if the instruction has one.
///
/// `Some` only for the direct forms B, Bcond and BL; indirect branches and
/// returns cannot be resolved statically.
pub fn jump_target(opcode: &str, address: u32) -> Option<u32> {
    let value = opcode_value(opcode)?;
    match classify(opcode) {
        ThumbOp::Branch => {
            let target = address
                .wrapping_add(4)
                .wrapping_add((2 * imm11_signed(value as u16)) as u32);
            log::debug!("B at 0x{:08x} targets 0x{:08x}", address, target);
            Some(target)
        }
        ThumbOp::BranchCond => {
            let target = address
                .wrapping_add(4)
                .wrapping_add((2 * imm8_signed(value as u16)) as u32);
            log::debug!("Bcond at 0x{:08x} targets 0x{:08x}", address, target);
            Some(target)
        }
        ThumbOp::BranchLink => {
            let target = address
                .wrapping_add(4)
                .wrapping_add(bl_displacement(value) as u32);
            log::debug!("BL at 0x{:08x} targets 0x{:08x}", address, target);
            Some(target)
        }
        _ => None,
    }
}

/// Displacement size class of a control-flow instruction.
///
/// Non-control-flow instructions report [`DisplacementCategory::None`].
pub fn displacement_category(opcode: &str) -> DisplacementCategory {
    match classify(opcode) {
        ThumbOp::Branch | ThumbOp::BranchCond => DisplacementCategory::Short,
        ThumbOp::BranchLink => DisplacementCategory::Long,
        ThumbOp::Bx | ThumbOp::Blx => DisplacementCategory::Indirect,
        ThumbOp::Pop if pc_in_register_list(opcode) => DisplacementCategory::Indirect,
        _ => DisplacementCategory::None,
    }
}

/// True for instructions carrying a register list field (PUSH/POP/STM/LDM).
pub fn has_register_list(opcode: &str) -> bool {
    matches!(
        classify(opcode),
        ThumbOp::Push | ThumbOp::Pop | ThumbOp::Stm | ThumbOp::Ldm
    )
}

/// Registers selected by the register list field, as register numbers.
///
/// Only PUSH/POP/STM/LDM carry a register list; for PUSH bit 8 selects LR,
/// for POP it selects PC.
pub fn register_list(opcode: &str) -> Option<Vec<u8>> {
    let op = classify(opcode);
    if !matches!(op, ThumbOp::Push | ThumbOp::Pop | ThumbOp::Stm | ThumbOp::Ldm) {
        return None;
    }
    let instr = opcode_value(opcode)? as u16;

    let mut regs: Vec<u8> = Vec::new();
    for i in 0..8u8 {
        if (instr >> i) & 0x1 == 1 {
            regs.push(i);
        }
    }
    if (instr >> 8) & 0x1 == 1 {
        match op {
            ThumbOp::Push => regs.push(14), // LR
            ThumbOp::Pop => regs.push(15),  // PC
            _ => {}
        }
    }
    Some(regs)
}

/// Number of registers moved by a multi-register memory operation.
pub fn register_count(opcode: &str) -> u32 {
    register_list(opcode).map_or(0, |r| r.len() as u32)
}

/// True when a POP writes the PC, i.e. the instruction is a return.
pub fn pc_in_register_list(opcode: &str) -> bool {
    if classify(opcode) != ThumbOp::Pop {
        return false;
    }
    match opcode_value(opcode) {
        Some(v) => (v >> 8) & 0x1 == 1,
        None => false,
    }
}

/// True when a PUSH saves the LR (function prologue pattern).
pub fn lr_in_register_list(opcode: &str) -> bool {
    if classify(opcode) != ThumbOp::Push {
        return false;
    }
    match opcode_value(opcode) {
        Some(v) => (v >> 8) & 0x1 == 1,
        None => false,
    }
}

/// True when the instruction terminates a function (pop into PC, or BX).
pub fn is_return(opcode: &str) -> bool {
    match classify(opcode) {
        ThumbOp::Pop => pc_in_register_list(opcode),
        ThumbOp::Bx => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_basic_alu_ops() {
        // movs r0, #1 -> 0x2001
        assert_eq!(classify("2001"), ThumbOp::MovImm);
        // adds r0, r1, r2 -> 0x1888
        assert_eq!(classify("1888"), ThumbOp::AddReg);
        // muls r0, r1 -> 0x4348
        assert_eq!(classify("4348"), ThumbOp::MulReg);
    }

    #[test]
    fn classifies_control_flow() {
        // b.n -> 0xe7fe (branch to self)
        assert_eq!(classify("e7fe"), ThumbOp::Branch);
        // beq.n -> 0xd0fe
        assert_eq!(classify("d0fe"), ThumbOp::BranchCond);
        // bx lr -> 0x4770
        assert_eq!(classify("4770"), ThumbOp::Bx);
        // blx r3 -> 0x4798
        assert_eq!(classify("4798"), ThumbOp::Blx);
        // bl -> 0xf000f801
        assert_eq!(classify("f000f801"), ThumbOp::BranchLink);
    }

    #[test]
    fn mov_pc_is_indirect_jump() {
        // mov pc, r3 -> 0x469f
        assert_eq!(classify("469f"), ThumbOp::Bx);
        // mov r0, r1 -> 0x4608
        assert_eq!(classify("4608"), ThumbOp::MovReg);
    }

    #[test]
    fn classifies_barriers_and_system() {
        // dsb sy -> 0xf3bf8f4f
        assert_eq!(classify("f3bf8f4f"), ThumbOp::Dsb);
        // dmb sy -> 0xf3bf8f5f
        assert_eq!(classify("f3bf8f5f"), ThumbOp::Dmb);
        // isb sy -> 0xf3bf8f6f
        assert_eq!(classify("f3bf8f6f"), ThumbOp::Isb);
        // nop -> 0xbf00
        assert_eq!(classify("bf00"), ThumbOp::Nop);
    }

    #[test]
    fn length_follows_leading_halfword() {
        assert_eq!(instruction_length("2001"), 2);
        assert_eq!(instruction_length("f000f801"), 4);
        assert_eq!(instruction_length("f3bf8f4f"), 4);
        assert!(is_32bit("f7ff fffe"));
    }

    #[test]
    fn branch_targets() {
        // b.n to self: imm11 = -2 (0x7fe), target = addr + 4 - 4 = addr
        assert_eq!(jump_target("e7fe", 0x100), Some(0x100));
        // beq.n forward: imm8 = 1 -> addr + 4 + 2
        assert_eq!(jump_target("d001", 0x100), Some(0x106));
        // bl forward: imm10 = 0, imm11 = 1, S=0, J1=J2=1 -> +2
        assert_eq!(jump_target("f000f801", 0x100), Some(0x106));
        // bl backward to self: f7ff fffe -> addr + 4 - 4
        assert_eq!(jump_target("f7fffffe", 0x200), Some(0x200));
        // indirect branches have no static target
        assert_eq!(jump_target("4770", 0x100), None);
    }

    #[test]
    fn register_lists() {
        // push {r4, lr} -> 0xb510
        assert_eq!(register_list("b510"), Some(vec![4, 14]));
        assert!(lr_in_register_list("b510"));
        assert_eq!(register_count("b510"), 2);
        // pop {r4, pc} -> 0xbd10
        assert_eq!(register_list("bd10"), Some(vec![4, 15]));
        assert!(pc_in_register_list("bd10"));
        assert!(is_return("bd10"));
        // pop {r4} -> 0xbc10 is not a return
        assert!(!is_return("bc10"));
        // arithmetic has no register list
        assert_eq!(register_list("2001"), None);
    }

    #[test]
    fn displacement_categories() {
        assert_eq!(displacement_category("e7fe"), DisplacementCategory::Short);
        assert_eq!(displacement_category("d0fe"), DisplacementCategory::Short);
        assert_eq!(
            displacement_category("f000f801"),
            DisplacementCategory::Long
        );
        assert_eq!(displacement_category("4770"), DisplacementCategory::Indirect);
        assert_eq!(displacement_category("bd10"), DisplacementCategory::Indirect);
        assert_eq!(displacement_category("2001"), DisplacementCategory::None);
    }

    #[test]
    fn unknown_encoding_is_fatal_when_checked() {
        let err = classify_checked("ffff0000", 0x1234).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
