//! x86-64 code generation.
//!
//! ## Architecture
//!
//! [`X64Emitter`] wraps the dynasm assembler for one compilation unit. Each
//! emission path opens an [`OpScope`] to bind its operands through the
//! [`RegisterAllocator`], emits native instructions and ends the scope.
//! Calls, tracer hooks and vector helpers are emitter extensions in their
//! own modules.
//!
//! Generated functions follow the System V ABI:
//! `extern "sysv64" fn(context: *mut u8, membase: *mut u8)`.

pub mod calls;
pub mod emitter;
pub mod frame;
pub mod helpers;
pub mod lanes;
pub mod regalloc;
pub mod regs;
pub mod scope;
pub mod tracers;

pub use emitter::X64Emitter;
pub use frame::FrameLayout;
pub use regalloc::{Home, LinearScanAllocator, RegisterAllocator, Role};
pub use scope::OpScope;
