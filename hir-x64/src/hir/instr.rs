//! Instructions, operands and value references.

use super::opcode::Opcode;
use super::types::{Constant, TypeName};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a value in its function's value arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueId(pub u32);

/// Index of a label in its function's label table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelId(pub u32);

/// Index of a function symbol in its function's symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label{}", self.0)
    }
}

/// A typed HIR value: either a constant or a live value assigned a home by
/// the register allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub id: ValueId,
    #[serde(rename = "type")]
    pub ty: TypeName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<Constant>,
}

impl Value {
    pub fn is_constant(&self) -> bool {
        self.constant.is_some()
    }
}

/// Source operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operand {
    #[default]
    None,
    Value(ValueId),
    /// Immediate offset, mask or string-table index.
    Offset(u64),
    Label(LabelId),
    Symbol(SymbolId),
}

/// One HIR instruction. Immutable once its block is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instr {
    pub opcode: Opcode,
    #[serde(default)]
    pub flags: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<ValueId>,
    #[serde(default)]
    pub src: [Operand; 3],
}

impl Instr {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            flags: 0,
            dest: None,
            src: [Operand::None; 3],
        }
    }

    pub fn with_dest(mut self, dest: ValueId) -> Self {
        self.dest = Some(dest);
        self
    }

    pub fn with_src(mut self, slot: usize, operand: Operand) -> Self {
        self.src[slot] = operand;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Value held in source slot `slot`, if that slot holds one.
    pub fn src_value(&self, slot: usize) -> Option<ValueId> {
        match self.src.get(slot) {
            Some(Operand::Value(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn src_offset(&self, slot: usize) -> Option<u64> {
        match self.src.get(slot) {
            Some(Operand::Offset(o)) => Some(*o),
            _ => None,
        }
    }

    pub fn src_label(&self, slot: usize) -> Option<LabelId> {
        match self.src.get(slot) {
            Some(Operand::Label(l)) => Some(*l),
            _ => None,
        }
    }

    pub fn src_symbol(&self, slot: usize) -> Option<SymbolId> {
        match self.src.get(slot) {
            Some(Operand::Symbol(s)) => Some(*s),
            _ => None,
        }
    }

    /// Every value this instruction reads.
    pub fn used_values(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.src.iter().filter_map(|op| match op {
            Operand::Value(v) => Some(*v),
            _ => None,
        })
    }
}

/// Position of an instruction inside a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrRef {
    pub block: usize,
    pub index: usize,
}

impl From<ValueId> for Operand {
    fn from(v: ValueId) -> Self {
        Operand::Value(v)
    }
}

impl From<LabelId> for Operand {
    fn from(l: LabelId) -> Self {
        Operand::Label(l)
    }
}

impl From<SymbolId> for Operand {
    fn from(s: SymbolId) -> Self {
        Operand::Symbol(s)
    }
}
