//! Selection, boolean tests, scalar and vector comparisons.
//!
//! Scalar comparisons produce a 0/1 byte. An integer comparison whose only
//! use is the immediately following BRANCH_TRUE/BRANCH_FALSE is fused into a
//! `cmp; jcc` pair and the branch is consumed.

use super::{dest, element, imm32, src, width, I16, I32, I8};
use crate::error::LoweringError;
use crate::hir::{flags, Instr, Opcode, TypeName, ValueId, Width};
use crate::lowering::matcher::Pat::{self, Any, Float, Int};
use crate::lowering::matcher::Shape;
use crate::lowering::table::{Flow, LoweringTable, Rule, ALL, INT, VEC};
use crate::x64::X64Emitter;
use dynasmrt::{dynasm, DynamicLabel, DynasmApi, DynasmLabelApi};

pub(super) fn register(table: &mut LoweringTable) {
    table.add(
        Opcode::Max,
        ALL,
        vec![
            Rule::new(Shape::binary(Int, Int, Int), "cmp; cmov", max),
            Rule::new(Shape::binary(Float, Float, Float), "maxs*", max),
            Rule::new(Shape::binary(Pat::Vec, Pat::Vec, Pat::Vec), "maxps", max),
        ],
    );
    table.add(
        Opcode::Min,
        ALL,
        vec![
            Rule::new(Shape::binary(Int, Int, Int), "cmp; cmov", min),
            Rule::new(Shape::binary(Float, Float, Float), "mins*", min),
            Rule::new(Shape::binary(Pat::Vec, Pat::Vec, Pat::Vec), "minps", min),
        ],
    );
    table.add(
        Opcode::Select,
        ALL,
        vec![
            Rule::new(Shape::new(Int, Int, Int, Int), "test; cmovnz", select),
            Rule::new(Shape::new(Float, Int, Float, Float), "test; jz", select),
            Rule::new(Shape::new(Pat::Vec, Int, Pat::Vec, Pat::Vec), "test; jz", select),
        ],
    );
    table.add(
        Opcode::IsTrue,
        INT,
        vec![
            Rule::new(Shape::unary(Int, Int), "test; setnz", is_true),
            Rule::new(Shape::unary(Int, Pat::Vec), "ptest; setnz", is_true),
        ],
    );
    table.add(
        Opcode::IsFalse,
        INT,
        vec![
            Rule::new(Shape::unary(Int, Int), "test; setz", is_false),
            Rule::new(Shape::unary(Int, Pat::Vec), "ptest; setz", is_false),
        ],
    );

    for (opcode, float) in [
        (Opcode::CompareEq, true),
        (Opcode::CompareNe, true),
        (Opcode::CompareSlt, true),
        (Opcode::CompareSle, true),
        (Opcode::CompareSgt, true),
        (Opcode::CompareSge, true),
        (Opcode::CompareUlt, false),
        (Opcode::CompareUle, false),
        (Opcode::CompareUgt, false),
        (Opcode::CompareUge, false),
    ] {
        let mut rules = vec![Rule::new(Shape::binary(Int, Int, Int), "cmp; setcc", compare_int)];
        if float {
            rules.push(Rule::new(Shape::binary(Int, Float, Float), "comis*; setcc", compare_float));
        }
        table.add(opcode, INT, rules);
    }

    table.add(
        Opcode::DidCarry,
        INT,
        vec![Rule::new(Shape::unary(Int, Any), "setc", did_carry)],
    );
    table.add(
        Opcode::DidOverflow,
        INT,
        vec![Rule::new(Shape::unary(Int, Any), "seto", did_overflow)],
    );

    for opcode in [
        Opcode::VectorCompareEq,
        Opcode::VectorCompareSgt,
        Opcode::VectorCompareSge,
        Opcode::VectorCompareUgt,
        Opcode::VectorCompareUge,
    ] {
        table.add(
            opcode,
            VEC,
            vec![Rule::new(
                Shape::binary(Pat::Vec, Pat::Vec, Pat::Vec),
                "pcmp*/cmpps",
                vector_compare,
            )],
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Conditions
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cond {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl Cond {
    fn of(opcode: Opcode) -> Option<Cond> {
        Some(match opcode {
            Opcode::CompareEq => Cond::Eq,
            Opcode::CompareNe => Cond::Ne,
            Opcode::CompareSlt => Cond::Slt,
            Opcode::CompareSle => Cond::Sle,
            Opcode::CompareSgt => Cond::Sgt,
            Opcode::CompareSge => Cond::Sge,
            Opcode::CompareUlt => Cond::Ult,
            Opcode::CompareUle => Cond::Ule,
            Opcode::CompareUgt => Cond::Ugt,
            Opcode::CompareUge => Cond::Uge,
            _ => return None,
        })
    }

    fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Slt => Cond::Sge,
            Cond::Sle => Cond::Sgt,
            Cond::Sgt => Cond::Sle,
            Cond::Sge => Cond::Slt,
            Cond::Ult => Cond::Uge,
            Cond::Ule => Cond::Ugt,
            Cond::Ugt => Cond::Ule,
            Cond::Uge => Cond::Ult,
        }
    }

    fn set(self, e: &mut X64Emitter<'_>, d: u8) {
        match self {
            Cond::Eq => dynasm!(e.ops ; sete Rb(d)),
            Cond::Ne => dynasm!(e.ops ; setne Rb(d)),
            Cond::Slt => dynasm!(e.ops ; setl Rb(d)),
            Cond::Sle => dynasm!(e.ops ; setle Rb(d)),
            Cond::Sgt => dynasm!(e.ops ; setg Rb(d)),
            Cond::Sge => dynasm!(e.ops ; setge Rb(d)),
            Cond::Ult => dynasm!(e.ops ; setb Rb(d)),
            Cond::Ule => dynasm!(e.ops ; setbe Rb(d)),
            Cond::Ugt => dynasm!(e.ops ; seta Rb(d)),
            Cond::Uge => dynasm!(e.ops ; setae Rb(d)),
        }
    }

    fn jump(self, e: &mut X64Emitter<'_>, label: DynamicLabel) {
        match self {
            Cond::Eq => dynasm!(e.ops ; je =>label),
            Cond::Ne => dynasm!(e.ops ; jne =>label),
            Cond::Slt => dynasm!(e.ops ; jl =>label),
            Cond::Sle => dynasm!(e.ops ; jle =>label),
            Cond::Sgt => dynasm!(e.ops ; jg =>label),
            Cond::Sge => dynasm!(e.ops ; jge =>label),
            Cond::Ult => dynasm!(e.ops ; jb =>label),
            Cond::Ule => dynasm!(e.ops ; jbe =>label),
            Cond::Ugt => dynasm!(e.ops ; ja =>label),
            Cond::Uge => dynasm!(e.ops ; jae =>label),
        }
    }
}

fn condition(i: &Instr) -> Result<Cond, LoweringError> {
    Cond::of(i.opcode).ok_or_else(|| LoweringError::invalid(i.opcode, "not a comparison"))
}

/// `cmp a, b` at the operands' width, with an immediate when b allows it.
fn emit_cmp(e: &mut X64Emitter<'_>, i: &Instr, a: ValueId, b: ValueId) -> Result<(), LoweringError> {
    let w = width(e, i, a)?;
    let imm = imm32(e, b);
    let mut s = e.scope(i.opcode);
    let ra = s.src(a)?;
    match imm {
        Some(imm) => int_ri!(s, w, cmp, ra, imm),
        None => {
            let rb = s.src(b)?;
            int_rr!(s, w, cmp, ra, rb);
        }
    }
    s.end()
}

/// The branch consuming `value`, when it is the next instruction and the
/// only reader.
fn fusable_branch<'a>(e: &X64Emitter<'a>, value: ValueId) -> Option<&'a Instr> {
    let next = e.next_instr()?;
    let reads = matches!(next.opcode, Opcode::BranchTrue | Opcode::BranchFalse)
        && next.src_value(0) == Some(value);
    (reads && e.use_count(value) == 1).then_some(next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Scalar comparisons
// ═══════════════════════════════════════════════════════════════════════════

fn compare_int(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let cond = condition(i)?;
    let value = dest(i)?;
    let (a, b) = (src(i, 0)?, src(i, 1)?);

    if let Some(branch) = fusable_branch(e, value) {
        let target = branch
            .src_label(1)
            .ok_or_else(|| LoweringError::invalid(branch.opcode, "src2 is not a label"))?;
        let label = e.label(target)?;
        emit_cmp(e, i, a, b)?;
        let taken = if branch.opcode == Opcode::BranchTrue {
            cond
        } else {
            cond.negate()
        };
        taken.jump(e, label);
        return Ok(Flow::Skip(1));
    }

    let w = width(e, i, a)?;
    let imm = imm32(e, b);
    let mut s = e.scope(i.opcode);
    let ra = s.src(a)?;
    let rb = match imm {
        Some(_) => None,
        None => Some(s.src(b)?),
    };
    let d = s.dest(value)?;
    match (rb, imm) {
        (Some(rb), _) => int_rr!(s, w, cmp, ra, rb),
        (None, Some(imm)) => int_ri!(s, w, cmp, ra, imm),
        (None, None) => return Err(LoweringError::invalid(i.opcode, "missing src2")),
    }
    cond.set(&mut s, d);
    s.end()?;
    Ok(Flow::Next)
}

/// Ordered float comparison: every condition is false when either operand
/// is NaN, except NE which is true.
fn compare_float(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let cond = condition(i)?;
    let double = e.value_type(src(i, 0)?)? == TypeName::Float64;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let b = s.src(src(i, 1)?)?;
    let d = s.dest(dest(i)?)?;

    // below/below-equal are true on unordered, so those compare swapped
    let (x, y) = match cond {
        Cond::Slt | Cond::Sle => (b, a),
        _ => (a, b),
    };
    if double {
        dynasm!(s.ops ; ucomisd Rx(x), Rx(y));
    } else {
        dynasm!(s.ops ; ucomiss Rx(x), Rx(y));
    }
    match cond {
        Cond::Eq => dynasm!(s.ops
            ; sete Rb(d)
            ; setnp al
            ; and Rb(d), al
        ),
        Cond::Ne => dynasm!(s.ops
            ; setne Rb(d)
            ; setp al
            ; or Rb(d), al
        ),
        Cond::Sgt | Cond::Slt => dynasm!(s.ops ; seta Rb(d)),
        Cond::Sge | Cond::Sle => dynasm!(s.ops ; setae Rb(d)),
        _ => return Err(LoweringError::invalid(i.opcode, "unsigned float comparison")),
    }
    s.end()?;
    Ok(Flow::Next)
}

fn did_carry(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let mut s = e.scope(i.opcode);
    let d = s.dest(dest(i)?)?;
    dynasm!(s.ops ; setc Rb(d));
    s.end()?;
    Ok(Flow::Next)
}

fn did_overflow(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let mut s = e.scope(i.opcode);
    let d = s.dest(dest(i)?)?;
    dynasm!(s.ops ; seto Rb(d));
    s.end()?;
    Ok(Flow::Next)
}

fn is_true(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    test_value(e, i, true)
}

fn is_false(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    test_value(e, i, false)
}

/// `dest = (src != 0) == when`. Vectors are non-zero when any bit is set.
fn test_value(e: &mut X64Emitter<'_>, i: &Instr, when: bool) -> Result<Flow, LoweringError> {
    let value = src(i, 0)?;
    let ty = e.value_type(value)?;
    let mut s = e.scope(i.opcode);
    let v = s.src(value)?;
    let d = s.dest(dest(i)?)?;
    match ty.width() {
        Some(w) => int_rr!(s, w, test, v, v),
        None => dynasm!(s.ops ; ptest Rx(v), Rx(v)),
    }
    if when {
        dynasm!(s.ops ; setnz Rb(d));
    } else {
        dynasm!(s.ops ; setz Rb(d));
    }
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Selection
// ═══════════════════════════════════════════════════════════════════════════

fn max(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    min_max(e, i, true)
}

fn min(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    min_max(e, i, false)
}

/// Integer forms honor ARITHMETIC_UNSIGNED. Float forms return src2 when
/// either operand is NaN.
fn min_max(e: &mut X64Emitter<'_>, i: &Instr, max: bool) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let ty = e.value_type(value)?;
    let unsigned = flags::is_unsigned(i.flags);
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let b = s.src(src(i, 1)?)?;
    let d = s.dest(value)?;
    match ty {
        TypeName::Float32 | TypeName::Float64 | TypeName::Vec128 => {
            dynasm!(s.ops ; movaps Rx(d), Rx(a));
            match (ty, max) {
                (TypeName::Float32, true) => dynasm!(s.ops ; maxss Rx(d), Rx(b)),
                (TypeName::Float32, false) => dynasm!(s.ops ; minss Rx(d), Rx(b)),
                (TypeName::Float64, true) => dynasm!(s.ops ; maxsd Rx(d), Rx(b)),
                (TypeName::Float64, false) => dynasm!(s.ops ; minsd Rx(d), Rx(b)),
                (_, true) => dynasm!(s.ops ; maxps Rx(d), Rx(b)),
                (_, false) => dynasm!(s.ops ; minps Rx(d), Rx(b)),
            }
        }
        _ => {
            let w = ty
                .width()
                .ok_or_else(|| LoweringError::invalid(i.opcode, format!("{ty} operands")))?;
            int_rr!(s, w, cmp, a, b);
            // cmov has no byte form; the low byte is all that matters
            dynasm!(s.ops ; mov Rq(d), Rq(a));
            match (max, unsigned) {
                (true, false) => dynasm!(s.ops ; cmovl Rq(d), Rq(b)),
                (true, true) => dynasm!(s.ops ; cmovb Rq(d), Rq(b)),
                (false, false) => dynasm!(s.ops ; cmovg Rq(d), Rq(b)),
                (false, true) => dynasm!(s.ops ; cmova Rq(d), Rq(b)),
            }
        }
    }
    s.end()?;
    Ok(Flow::Next)
}

/// `dest = src1 ? src2 : src3`.
fn select(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let cond = src(i, 0)?;
    let (if_true, if_false) = (src(i, 1)?, src(i, 2)?);
    let ty = e.value_type(value)?;
    let cw = width(e, i, cond)?;

    if let Some(c) = e.constant(cond) {
        let chosen = if c.is_zero() { if_false } else { if_true };
        let mut s = e.scope(i.opcode);
        let v = s.src(chosen)?;
        let d = s.dest(value)?;
        match ty.width() {
            Some(_) => dynasm!(s.ops ; mov Rq(d), Rq(v)),
            None => dynasm!(s.ops ; movaps Rx(d), Rx(v)),
        }
        s.end()?;
        return Ok(Flow::Next);
    }

    let mut s = e.scope(i.opcode);
    let c = s.src(cond)?;
    let t = s.src(if_true)?;
    let f = s.src(if_false)?;
    let d = s.dest(value)?;
    int_rr!(s, cw, test, c, c);
    match ty.width() {
        Some(_) => dynasm!(s.ops
            ; mov Rq(d), Rq(f)
            ; cmovnz Rq(d), Rq(t)
        ),
        None => {
            let done = s.ops.new_dynamic_label();
            dynasm!(s.ops
                ; movaps Rx(d), Rx(f)
                ; jz =>done
                ; movaps Rx(d), Rx(t)
            );
            s.bind_label(done);
        }
    }
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Vector comparisons
// ═══════════════════════════════════════════════════════════════════════════

/// Element-wise comparison yielding all-ones lanes where it holds. The
/// element type comes from the flags; float elements support EQ, SGT and
/// SGE only.
fn vector_compare(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let elem = element(i)?;
    let op = i.opcode;
    let mut s = e.scope(op);
    let a = s.src(src(i, 0)?)?;
    let b = s.src(src(i, 1)?)?;
    let d = s.dest(dest(i)?)?;

    if elem == TypeName::Float32 {
        match op {
            Opcode::VectorCompareEq => dynasm!(s.ops
                ; movaps Rx(d), Rx(a)
                ; cmpps Rx(d), Rx(b), 0
            ),
            Opcode::VectorCompareSgt => dynasm!(s.ops
                ; movaps Rx(d), Rx(b)
                ; cmpps Rx(d), Rx(a), 1
            ),
            Opcode::VectorCompareSge => dynasm!(s.ops
                ; movaps Rx(d), Rx(b)
                ; cmpps Rx(d), Rx(a), 2
            ),
            _ => return Err(LoweringError::invalid(op, "unsigned float lanes")),
        }
        s.end()?;
        return Ok(Flow::Next);
    }

    let w = match elem {
        I8 => Width::B8,
        I16 => Width::B16,
        I32 => Width::B32,
        other => return Err(LoweringError::invalid(op, format!("{other} lanes"))),
    };
    match op {
        Opcode::VectorCompareEq => {
            dynasm!(s.ops ; movaps Rx(d), Rx(a));
            pcmpeq(&mut s, w, d, b);
        }
        Opcode::VectorCompareSgt => {
            dynasm!(s.ops ; movaps Rx(d), Rx(a));
            pcmpgt(&mut s, w, d, b);
        }
        Opcode::VectorCompareSge => {
            dynasm!(s.ops
                ; movaps Rx(d), Rx(a)
                ; movaps xmm0, Rx(a)
            );
            pcmpgt(&mut s, w, d, b);
            pcmpeq(&mut s, w, 0, b);
            dynasm!(s.ops ; por Rx(d), xmm0);
        }
        Opcode::VectorCompareUge => {
            // a >= b  <=>  maxu(a, b) == a
            dynasm!(s.ops ; movaps Rx(d), Rx(a));
            pmaxu(&mut s, w, d, b);
            pcmpeq(&mut s, w, d, a);
        }
        _ => {
            // a > b  <=>  !(maxu(b, a) == b)
            dynasm!(s.ops ; movaps xmm0, Rx(b));
            pmaxu(&mut s, w, 0, a);
            pcmpeq(&mut s, w, 0, b);
            dynasm!(s.ops
                ; pcmpeqd Rx(d), Rx(d)
                ; pxor Rx(d), xmm0
            );
        }
    }
    s.end()?;
    Ok(Flow::Next)
}

fn pcmpeq(e: &mut X64Emitter<'_>, w: Width, d: u8, s: u8) {
    match w {
        Width::B8 => dynasm!(e.ops ; pcmpeqb Rx(d), Rx(s)),
        Width::B16 => dynasm!(e.ops ; pcmpeqw Rx(d), Rx(s)),
        _ => dynasm!(e.ops ; pcmpeqd Rx(d), Rx(s)),
    }
}

fn pcmpgt(e: &mut X64Emitter<'_>, w: Width, d: u8, s: u8) {
    match w {
        Width::B8 => dynasm!(e.ops ; pcmpgtb Rx(d), Rx(s)),
        Width::B16 => dynasm!(e.ops ; pcmpgtw Rx(d), Rx(s)),
        _ => dynasm!(e.ops ; pcmpgtd Rx(d), Rx(s)),
    }
}

fn pmaxu(e: &mut X64Emitter<'_>, w: Width, d: u8, s: u8) {
    match w {
        Width::B8 => dynasm!(e.ops ; pmaxub Rx(d), Rx(s)),
        Width::B16 => dynasm!(e.ops ; pmaxuw Rx(d), Rx(s)),
        _ => dynasm!(e.ops ; pmaxud Rx(d), Rx(s)),
    }
}
