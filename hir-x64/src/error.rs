//! Error taxonomy for the lowering pass and the runtime surface it calls.

use crate::hir::{LabelId, Opcode};
use thiserror::Error;

/// Why a function failed to lower.
///
/// Every variant aborts the current compilation unit only; previously
/// compiled functions and the shared lowering table are unaffected.
#[derive(Debug, Error)]
pub enum LoweringError {
    /// No emission path exists for this opcode/signature combination.
    #[error("unimplemented opcode {opcode} for signature {signature}")]
    UnimplementedOpcode { opcode: Opcode, signature: String },

    /// An operand type falls outside the class the opcode is defined over.
    /// Indicates a defect in whatever produced the HIR.
    #[error("invalid operand type for {opcode}: {detail}")]
    InvalidOperandType { opcode: Opcode, detail: String },

    /// The register allocator could not bind an operand.
    #[error("register allocation failed: {0}")]
    RegisterAllocation(String),

    /// A guest call target could not be resolved to native code.
    #[error("guest call resolution failed: {0}")]
    GuestCallResolution(#[from] ResolveError),

    /// Lane ordering of this path has not been checked against hardware and
    /// the configuration does not allow unverified sequences.
    #[error("{opcode} lane ordering is unverified: {detail}")]
    UnverifiedSequence { opcode: Opcode, detail: String },

    #[error("branch to unknown label {0}")]
    UnknownLabel(LabelId),

    #[error("assembler error: {0}")]
    Assembler(String),
}

impl LoweringError {
    /// True when the caller can reasonably fall back to another execution
    /// strategy (e.g. an interpreter) for this function.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LoweringError::UnimplementedOpcode { .. } | LoweringError::UnverifiedSequence { .. }
        )
    }

    pub(crate) fn invalid(opcode: Opcode, detail: impl Into<String>) -> Self {
        LoweringError::InvalidOperandType {
            opcode,
            detail: detail.into(),
        }
    }

    pub(crate) fn unimplemented(opcode: Opcode, signature: impl Into<String>) -> Self {
        LoweringError::UnimplementedOpcode {
            opcode,
            signature: signature.into(),
        }
    }
}

/// Failure to turn a guest call target into a native entry point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no guest function at address {0:#x}")]
    InvalidAddress(u64),

    #[error("symbol {name} at {address:#x} has no native entry")]
    Unresolved { name: String, address: u64 },

    #[error("compiling guest function at {address:#x} failed: {reason}")]
    CompileFailed { address: u64, reason: String },
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}
