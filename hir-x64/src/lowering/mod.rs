//! HIR to x86-64 lowering.
//!
//! ## Pipeline
//!
//! For each instruction the [`Compiler`] looks up the opcode's
//! [`TableEntry`], checks the operand class, lets the matcher pick the first
//! [`Rule`] whose [`Shape`] fits and runs its emission path. Paths live in
//! [`sequences`], grouped by opcode family.

pub mod compiler;
pub mod matcher;
pub mod sequences;
pub mod table;

pub use compiler::{CompiledFunction, Compiler, LoweringStats, SourceMapEntry};
pub use matcher::{signature, Pat, Shape};
pub use table::{EmitFn, Flow, LoweringTable, Rule, TableEntry};
