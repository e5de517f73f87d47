//! Type-signature matching.
//!
//! A [`Shape`] constrains the destination and the three source slots of an
//! instruction. Rules are tried in table order and the first matching shape
//! wins, so narrow shapes (constant operands, specific widths) are listed
//! before generic ones.

use crate::hir::{HirFunction, Instr, Operand, TypeClass, TypeName, Value};
use std::fmt::Write;

/// Constraint on one operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pat {
    /// No value in this slot.
    Absent,
    /// Anything, including offsets, labels and symbols.
    Any,
    /// Live (non-constant) value of the type.
    Ty(TypeName),
    /// Constant of the type.
    Const(TypeName),
    /// Live value or constant of the type.
    Val(TypeName),
    Int,
    Float,
    Vec,
    IntConst,
    FloatConst,
    VecConst,
}

/// Resolved view of one operand slot.
#[derive(Clone, Copy)]
enum Slot<'f> {
    Empty,
    Value(&'f Value),
    /// Refers to a value missing from the arena.
    Dangling,
}

impl Pat {
    fn accepts(self, slot: Slot<'_>) -> bool {
        let value = match slot {
            Slot::Empty => return matches!(self, Pat::Absent | Pat::Any),
            Slot::Dangling => return self == Pat::Any,
            Slot::Value(v) => v,
        };
        // booleans share every Int8 path
        let ty = value.ty.storage();
        let constant = value.is_constant();
        match self {
            Pat::Absent => false,
            Pat::Any => true,
            Pat::Ty(t) => !constant && ty == t.storage(),
            Pat::Const(t) => constant && ty == t.storage(),
            Pat::Val(t) => ty == t.storage(),
            Pat::Int => ty.is_int(),
            Pat::Float => ty.is_float(),
            Pat::Vec => ty.is_vec(),
            Pat::IntConst => constant && ty.is_int(),
            Pat::FloatConst => constant && ty.is_float(),
            Pat::VecConst => constant && ty.is_vec(),
        }
    }
}

/// Operand constraints for dest, src1, src2 and src3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub dest: Pat,
    pub src: [Pat; 3],
}

impl Shape {
    pub const fn new(dest: Pat, src1: Pat, src2: Pat, src3: Pat) -> Self {
        Self {
            dest,
            src: [src1, src2, src3],
        }
    }

    /// Matches every instruction.
    pub const fn any() -> Self {
        Self::new(Pat::Any, Pat::Any, Pat::Any, Pat::Any)
    }

    pub const fn unary(dest: Pat, src1: Pat) -> Self {
        Self::new(dest, src1, Pat::Any, Pat::Any)
    }

    pub const fn binary(dest: Pat, src1: Pat, src2: Pat) -> Self {
        Self::new(dest, src1, src2, Pat::Any)
    }

    pub fn matches(&self, func: &HirFunction, instr: &Instr) -> bool {
        let dest = match instr.dest {
            None => Slot::Empty,
            Some(id) => func.value(id).map_or(Slot::Dangling, Slot::Value),
        };
        self.dest.accepts(dest)
            && self
                .src
                .iter()
                .zip(instr.src.iter())
                .all(|(pat, operand)| pat.accepts(slot(func, operand)))
    }
}

fn slot<'f>(func: &'f HirFunction, operand: &Operand) -> Slot<'f> {
    match operand {
        Operand::Value(id) => func.value(*id).map_or(Slot::Dangling, Slot::Value),
        _ => Slot::Empty,
    }
}

/// Class of the operand the lowering table checks first: the destination,
/// or src1 for instructions without one.
pub fn primary_class(func: &HirFunction, instr: &Instr) -> Option<TypeClass> {
    instr
        .dest
        .or_else(|| instr.src_value(0))
        .and_then(|id| func.value(id))
        .map(|v| v.ty.class())
}

/// Render an instruction's signature, e.g. `i32 <- i32, const i32`.
pub fn signature(func: &HirFunction, instr: &Instr) -> String {
    let render = |id| match func.value(id) {
        Some(v) if v.is_constant() => format!("const {}", v.ty),
        Some(v) => v.ty.to_string(),
        None => format!("?{id}"),
    };
    let mut out = instr.dest.map_or_else(|| "void".to_string(), render);
    out.push_str(" <-");
    let mut first = true;
    for operand in &instr.src {
        let part = match *operand {
            Operand::None => continue,
            Operand::Value(id) => render(id),
            Operand::Offset(_) => "offset".to_string(),
            Operand::Label(_) => "label".to_string(),
            Operand::Symbol(_) => "symbol".to_string(),
        };
        let _ = write!(out, "{}{}", if first { " " } else { ", " }, part);
        first = false;
    }
    out
}
