//! Opcode to emission-rule table.
//!
//! Built once by [`LoweringTable::new`] and shared read-only between
//! compilers through an `Arc`.

use super::matcher::{primary_class, signature, Shape};
use super::sequences;
use crate::error::LoweringError;
use crate::hir::{HirFunction, Instr, Opcode, TypeClass};
use crate::x64::X64Emitter;

/// How far the dispatcher advances after a rule runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the next instruction.
    Next,
    /// The rule also consumed the following `n` instructions.
    Skip(usize),
}

/// Emission path for one instruction.
pub type EmitFn = fn(&mut X64Emitter<'_>, &Instr) -> Result<Flow, LoweringError>;

#[derive(Clone, Copy)]
pub struct Rule {
    pub shape: Shape,
    /// Name reported in trace logs and tests.
    pub name: &'static str,
    pub emit: EmitFn,
}

impl Rule {
    pub const fn new(shape: Shape, name: &'static str, emit: EmitFn) -> Self {
        Self { shape, name, emit }
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("shape", &self.shape)
            .field("name", &self.name)
            .finish()
    }
}

/// Operand classes an opcode is defined over, plus its ordered rules.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub accepts: &'static [TypeClass],
    pub rules: Vec<Rule>,
}

pub const INT: &[TypeClass] = &[TypeClass::Int];
pub const FLOAT: &[TypeClass] = &[TypeClass::Float];
pub const VEC: &[TypeClass] = &[TypeClass::Vec];
pub const FLOAT_VEC: &[TypeClass] = &[TypeClass::Float, TypeClass::Vec];
pub const ALL: &[TypeClass] = &[TypeClass::Int, TypeClass::Float, TypeClass::Vec];

impl TableEntry {
    /// Pick the rule for `instr`.
    pub fn select(&self, func: &HirFunction, instr: &Instr) -> Result<&Rule, LoweringError> {
        if let Some(class) = primary_class(func, instr) {
            if !self.accepts.contains(&class) {
                return Err(LoweringError::invalid(
                    instr.opcode,
                    format!("{class:?} operands in {}", signature(func, instr)),
                ));
            }
        }
        self.rules
            .iter()
            .find(|rule| rule.shape.matches(func, instr))
            .ok_or_else(|| LoweringError::unimplemented(instr.opcode, signature(func, instr)))
    }
}

/// Immutable mapping from every supported opcode to its entry.
pub struct LoweringTable {
    entries: Vec<Option<TableEntry>>,
}

impl LoweringTable {
    pub fn new() -> Self {
        let mut table = Self {
            entries: vec![None; Opcode::COUNT],
        };
        sequences::register(&mut table);
        log::debug!(
            "[LOWER] Lowering table ready: {} of {} opcodes, {} rules",
            table.entries.iter().flatten().count(),
            Opcode::COUNT,
            table.entries.iter().flatten().map(|e| e.rules.len()).sum::<usize>()
        );
        table
    }

    pub fn entry(&self, opcode: Opcode) -> Option<&TableEntry> {
        self.entries.get(opcode.index()).and_then(Option::as_ref)
    }

    /// Opcodes with an entry, in declaration order.
    pub fn opcodes(&self) -> impl Iterator<Item = Opcode> + '_ {
        Opcode::ALL.iter().copied().filter(|&op| self.entry(op).is_some())
    }

    pub(crate) fn add(&mut self, opcode: Opcode, accepts: &'static [TypeClass], rules: Vec<Rule>) {
        debug_assert!(self.entries[opcode.index()].is_none(), "{opcode} registered twice");
        self.entries[opcode.index()] = Some(TableEntry { accepts, rules });
    }
}

impl Default for LoweringTable {
    fn default() -> Self {
        Self::new()
    }
}
