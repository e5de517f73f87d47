//! x86-64 instruction lowering for a dynamic binary translator.
//!
//! Guest code arrives as typed HIR ([`hir::HirFunction`]); the
//! [`lowering::Compiler`] selects an emission path per instruction from the
//! shared [`lowering::LoweringTable`] and produces an executable
//! [`lowering::CompiledFunction`]. Generated code calls back into a
//! [`runtime::GuestRuntime`] for guest calls, MMIO and tracing.

pub mod config;
pub mod error;
pub mod hir;
pub mod lowering;
pub mod runtime;
pub mod x64;

pub use config::LoweringConfig;
pub use error::{ConfigError, LoweringError, ResolveError};
pub use hir::{FunctionBuilder, HirFunction, Opcode, TypeName};
pub use lowering::{CompiledFunction, Compiler, LoweringStats, LoweringTable};
pub use runtime::{FunctionResolver, GuestFault, GuestRuntime, StaticResolver};

// ═══════════════════════════════════════════════════════════════════════════
// Convenience
// ═══════════════════════════════════════════════════════════════════════════

/// Compile one function with a fresh table.
pub fn compile(
    func: &HirFunction,
    runtime: std::sync::Arc<GuestRuntime>,
    config: LoweringConfig,
) -> Result<CompiledFunction, LoweringError> {
    let table = std::sync::Arc::new(LoweringTable::new());
    Compiler::new(table, runtime, config).compile(func)
}
