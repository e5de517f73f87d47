//! High-level IR consumed by the lowering pass.
//!
//! A [`HirFunction`] owns a value arena, labels, symbols and an ordered list
//! of [`Block`]s. Instructions refer to values by [`ValueId`]; nothing in the
//! IR points at host registers, which are assigned during lowering.

pub mod builder;
pub mod function;
pub mod instr;
pub mod opcode;
pub mod types;

pub use builder::FunctionBuilder;
pub use function::{Block, ExternHandler, ExternShim, FunctionSymbol, HirFunction, SymbolKind};
pub use instr::{Instr, InstrRef, LabelId, Operand, SymbolId, Value, ValueId};
pub use opcode::{flags, Opcode};
pub use types::{Constant, TypeClass, TypeName, Vec128, Width};
