//! WCETAN core library
//!
//! Static worst-case execution time (WCET) analysis for ARMv6-M binaries.
//! The core turns a disassembly dump and a flow-fact file into a safe cycle
//! bound, the worst-case path, and optionally an instruction scratchpad
//! assignment that minimizes that bound.

pub mod analyzer;
