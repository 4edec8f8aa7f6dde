//! Architecture Configuration
//!
//! This module provides the immutable process-wide configuration of the
//! analyzed core: the fetch model, the per-class instruction latencies used
//! by the cost engine, and the size-penalty table used by the scratchpad
//! optimizer when short branches have to be widened.
//!
//! The configuration is a plain serde record loaded once at program start
//! and shared by reference; there are no hidden mutable statics.

use serde::{Deserialize, Serialize};

use crate::analyzer::error::{AnalyzerError, Result};

/// Memory configuration under which costs are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryMode {
    /// No scratchpad: every block is priced with its off-chip cost.
    NoMem,
    /// Static basic-block scratchpad: assigned blocks are on-chip, the
    /// others carry the off-chip minus on-chip penalty.
    StaticSisp,
    /// Dynamic scratchpad: blocks are priced on-chip; penalties are filled
    /// in by a separate data flow analysis after graph creation.
    DynamicSisp,
}

/// Displacement size class of a branch instruction.
///
/// Controls whether widening a short branch to a long encoding is required
/// when its target is not co-located in the scratchpad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisplacementCategory {
    /// Not a control-flow instruction.
    None = 0,
    /// Short displacement field (16-bit B/Bcond encodings).
    Short = 1,
    /// Long displacement field (32-bit BL encoding).
    Long = 2,
    /// Register-indirect target, no displacement field to widen.
    Indirect = 3,
}

/// How two basic blocks are connected, for size-penalty accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionType {
    /// Fallthrough to the immediately following address.
    ContinuousAddressing = 0,
    /// Direct jump edge.
    Jump = 1,
    /// Call edge into a function entry.
    Call = 2,
    /// Return edge; never penalized.
    Return = 3,
    /// Anything else (exit edges).
    Unknown = 4,
}

/// Architecture configuration record.
///
/// All latencies are the extra cycles added on top of the canonical issue
/// cycle of 1. Load/store/fetch latencies are split by memory kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchConfig {
    /// Fetch bandwidth in bits. Only 32 is currently supported by the
    /// fetch-buffer model.
    pub fetch_bandwidth_bits: u32,
    /// Fetch latency in cycles when fetching from on-chip memory.
    pub fetch_latency_onchip: u32,
    /// Fetch latency in cycles when fetching from off-chip memory.
    pub fetch_latency_offchip: u32,

    pub arith_latency: u32,
    pub mult_latency: u32,
    pub load_latency_onchip: u32,
    pub load_latency_offchip: u32,
    pub store_latency_onchip: u32,
    pub store_latency_offchip: u32,
    /// Extra cycles for a pop that writes the PC (pipeline refill on return).
    pub pop_return_extra_latency: u32,
    pub uncond_branch_latency: u32,
    pub cond_branch_taken_latency: u32,
    pub cond_branch_not_taken_latency: u32,
    pub call_latency: u32,
    pub bx_latency: u32,
    pub blx_latency: u32,
    pub msr_latency: u32,
    pub mrs_latency: u32,
    pub dsb_latency: u32,
    pub dmb_latency: u32,
    pub isb_latency: u32,

    /// Bytes added when a connecting jump must be inserted to preserve a
    /// fallthrough across a scratchpad boundary.
    pub size_penalty_connecting_jump: u32,
    /// Bytes added when a short direct jump is widened to the long encoding.
    pub size_penalty_jump_widening: u32,
    /// Bytes added when a short direct call is widened to the long encoding.
    pub size_penalty_call_widening: u32,

    /// Select the exit-sensitive cost engine entry point (default). The
    /// insensitive one charges the worst of both branch outcomes to both
    /// edge costs.
    pub exit_sensitive_costs: bool,

    /// Extra parameters passed to the external lp_solve invocation.
    pub lp_solve_parameters: Vec<String>,
}

impl Default for ArchConfig {
    fn default() -> Self {
        Self {
            fetch_bandwidth_bits: 32,
            fetch_latency_onchip: 1,
            fetch_latency_offchip: 2,
            arith_latency: 0,
            mult_latency: 0,
            load_latency_onchip: 1,
            load_latency_offchip: 2,
            store_latency_onchip: 1,
            store_latency_offchip: 2,
            pop_return_extra_latency: 3,
            uncond_branch_latency: 2,
            cond_branch_taken_latency: 2,
            cond_branch_not_taken_latency: 0,
            call_latency: 3,
            bx_latency: 2,
            blx_latency: 2,
            msr_latency: 3,
            mrs_latency: 3,
            dsb_latency: 3,
            dmb_latency: 3,
            isb_latency: 3,
            size_penalty_connecting_jump: 2,
            size_penalty_jump_widening: 2,
            size_penalty_call_widening: 2,
            exit_sensitive_costs: true,
            lp_solve_parameters: Vec::new(),
        }
    }
}

impl ArchConfig {
    /// Load a configuration from a JSON file, falling back to defaults for
    /// absent fields.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: ArchConfig = serde_json::from_str(json)
            .map_err(|e| AnalyzerError::ConfigError(format!("invalid config JSON: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the invariants the fetch model depends on.
    pub fn validate(&self) -> Result<()> {
        if self.fetch_bandwidth_bits != 32 {
            return Err(AnalyzerError::ConfigError(format!(
                "unsupported fetch bandwidth: {} bits (only 32 is supported)",
                self.fetch_bandwidth_bits
            )));
        }
        Ok(())
    }

    /// Fetch latency for the given memory kind.
    pub fn fetch_latency(&self, onchip: bool) -> u32 {
        if onchip {
            self.fetch_latency_onchip
        } else {
            self.fetch_latency_offchip
        }
    }

    pub fn load_latency(&self, onchip: bool) -> u32 {
        if onchip {
            self.load_latency_onchip
        } else {
            self.load_latency_offchip
        }
    }

    pub fn store_latency(&self, onchip: bool) -> u32 {
        if onchip {
            self.store_latency_onchip
        } else {
            self.store_latency_offchip
        }
    }

    pub fn cond_branch_latency(&self, taken: bool) -> u32 {
        if taken {
            self.cond_branch_taken_latency
        } else {
            self.cond_branch_not_taken_latency
        }
    }

    /// Size penalty in bytes for an assigned block whose successor along the
    /// given connection is not co-located.
    ///
    /// Indirect displacements carry no widenable field and cost nothing
    /// (see DESIGN.md, Open Question 2).
    pub fn size_penalty(
        &self,
        connection: ConnectionType,
        displacement: DisplacementCategory,
    ) -> u32 {
        match connection {
            ConnectionType::ContinuousAddressing => self.size_penalty_connecting_jump,
            ConnectionType::Jump => match displacement {
                DisplacementCategory::Short => self.size_penalty_jump_widening,
                _ => 0,
            },
            ConnectionType::Call => match displacement {
                DisplacementCategory::Short => self.size_penalty_call_widening,
                _ => 0,
            },
            ConnectionType::Return | ConnectionType::Unknown => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ArchConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.exit_sensitive_costs);
    }

    #[test]
    fn rejects_unsupported_fetch_width() {
        let cfg = ArchConfig {
            fetch_bandwidth_bits: 64,
            ..ArchConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_partial_json() {
        let cfg = ArchConfig::from_json(r#"{"fetch_latency_offchip": 5}"#).unwrap();
        assert_eq!(cfg.fetch_latency_offchip, 5);
        assert_eq!(cfg.fetch_latency_onchip, 1);
    }

    #[test]
    fn indirect_displacement_has_no_size_penalty() {
        let cfg = ArchConfig::default();
        assert_eq!(
            cfg.size_penalty(ConnectionType::Jump, DisplacementCategory::Indirect),
            0
        );
        assert_eq!(
            cfg.size_penalty(ConnectionType::ContinuousAddressing, DisplacementCategory::None),
            cfg.size_penalty_connecting_jump
        );
    }
}
