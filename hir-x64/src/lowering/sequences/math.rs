//! Integer, scalar float and packed float arithmetic.
//!
//! Integer paths compute `dest = src1; dest op= src2` at the destination
//! width, so the host flags after ADD and SUB are the guest-visible
//! DID_CARRY/DID_OVERFLOW state. Wide multiply and divide go through the
//! fixed rax/rdx pair.

use super::{call_helper, dest, element, imm32, require_unverified, src, width, HelperArg, I16, I32, I8};
use crate::error::LoweringError;
use crate::hir::{flags, Instr, Opcode, TypeName, Width};
use crate::lowering::matcher::{signature, Pat::{self, Float, Int}, Shape};
use crate::lowering::table::{Flow, LoweringTable, Rule, ALL, FLOAT, FLOAT_VEC, INT, VEC};
use crate::x64::{helpers, lanes, X64Emitter};
use dynasmrt::{dynasm, DynasmApi, DynasmLabelApi};

pub(super) fn register(table: &mut LoweringTable) {
    for (opcode, name) in [
        (Opcode::Add, "add"),
        (Opcode::Sub, "sub"),
        (Opcode::Mul, "imul"),
    ] {
        table.add(
            opcode,
            ALL,
            vec![
                Rule::new(Shape::binary(Int, Int, Int), name, arithmetic),
                Rule::new(Shape::binary(Float, Float, Float), name, arithmetic),
                Rule::new(Shape::binary(Pat::Vec, Pat::Vec, Pat::Vec), name, arithmetic),
            ],
        );
    }
    table.add(
        Opcode::AddCarry,
        INT,
        vec![Rule::new(Shape::new(Int, Int, Int, Int), "bt; adc", add_carry)],
    );
    table.add(
        Opcode::VectorAdd,
        VEC,
        vec![Rule::new(Shape::binary(Pat::Vec, Pat::Vec, Pat::Vec), "padd*/addps", vector_add)],
    );
    table.add(
        Opcode::MulHi,
        INT,
        vec![Rule::new(Shape::binary(Int, Int, Int), "mul rdx:rax", mul_hi)],
    );
    table.add(
        Opcode::Div,
        ALL,
        vec![
            Rule::new(Shape::binary(Int, Int, Int), "div rdx:rax", div),
            Rule::new(Shape::binary(Float, Float, Float), "divs*", arithmetic),
            Rule::new(Shape::binary(Pat::Vec, Pat::Vec, Pat::Vec), "divps", arithmetic),
        ],
    );
    for opcode in [Opcode::MulAdd, Opcode::MulSub] {
        table.add(
            opcode,
            ALL,
            vec![
                Rule::new(Shape::new(Int, Int, Int, Int), "imul; add", mul_add),
                Rule::new(Shape::new(Float, Float, Float, Float), "mul; add", mul_add),
                Rule::new(Shape::new(Pat::Vec, Pat::Vec, Pat::Vec, Pat::Vec), "mulps; addps", mul_add),
            ],
        );
    }

    table.add(
        Opcode::Neg,
        ALL,
        vec![
            Rule::new(Shape::unary(Int, Int), "neg", neg),
            Rule::new(Shape::unary(Float, Float), "xorp* sign", neg),
            Rule::new(Shape::unary(Pat::Vec, Pat::Vec), "xorps sign", neg),
        ],
    );
    table.add(
        Opcode::Abs,
        ALL,
        vec![
            Rule::new(Shape::unary(Int, Int), "neg; cmovs", abs),
            Rule::new(Shape::unary(Float, Float), "andp* ~sign", abs),
            Rule::new(Shape::unary(Pat::Vec, Pat::Vec), "andps ~sign", abs),
        ],
    );
    table.add(
        Opcode::Sqrt,
        FLOAT_VEC,
        vec![
            Rule::new(Shape::unary(Float, Float), "sqrts*", sqrt),
            Rule::new(Shape::unary(Pat::Vec, Pat::Vec), "sqrtps", sqrt),
        ],
    );
    table.add(
        Opcode::Rsqrt,
        FLOAT_VEC,
        vec![
            Rule::new(Shape::unary(Float, Float), "rsqrtss", rsqrt),
            Rule::new(Shape::unary(Pat::Vec, Pat::Vec), "rsqrtps", rsqrt),
        ],
    );
    table.add(
        Opcode::Pow2,
        FLOAT_VEC,
        vec![
            Rule::new(Shape::unary(Float, Float), "call exp2", pow2),
            Rule::new(Shape::unary(Pat::Vec, Pat::Vec), "call exp2 x4", pow2),
        ],
    );
    table.add(
        Opcode::Log2,
        FLOAT_VEC,
        vec![
            Rule::new(Shape::unary(Float, Float), "call log2", log2),
            Rule::new(Shape::unary(Pat::Vec, Pat::Vec), "call log2 x4", log2),
        ],
    );
    table.add(
        Opcode::DotProduct3,
        FLOAT,
        vec![Rule::new(Shape::binary(Float, Pat::Vec, Pat::Vec), "dpps xyz", dot_product)],
    );
    table.add(
        Opcode::DotProduct4,
        FLOAT,
        vec![Rule::new(Shape::binary(Float, Pat::Vec, Pat::Vec), "dpps xyzw", dot_product)],
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared forms
// ═══════════════════════════════════════════════════════════════════════════

/// Second operand of a two-address integer instruction.
#[derive(Debug, Clone, Copy)]
pub(super) enum Rhs {
    Reg(u8),
    Imm(i32),
}

/// Two-address integer ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Alu {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

impl Alu {
    fn emit(self, e: &mut X64Emitter<'_>, w: Width, d: u8, rhs: Rhs) {
        match (self, rhs) {
            (Alu::Add, Rhs::Reg(r)) => int_rr!(e, w, add, d, r),
            (Alu::Add, Rhs::Imm(x)) => int_ri!(e, w, add, d, x),
            (Alu::Sub, Rhs::Reg(r)) => int_rr!(e, w, sub, d, r),
            (Alu::Sub, Rhs::Imm(x)) => int_ri!(e, w, sub, d, x),
            (Alu::And, Rhs::Reg(r)) => int_rr!(e, w, and, d, r),
            (Alu::And, Rhs::Imm(x)) => int_ri!(e, w, and, d, x),
            (Alu::Or, Rhs::Reg(r)) => int_rr!(e, w, or, d, r),
            (Alu::Or, Rhs::Imm(x)) => int_ri!(e, w, or, d, x),
            (Alu::Xor, Rhs::Reg(r)) => int_rr!(e, w, xor, d, r),
            (Alu::Xor, Rhs::Imm(x)) => int_ri!(e, w, xor, d, x),
            // no byte form; the low bits of a wider product are the same
            (Alu::Mul, Rhs::Reg(r)) if w == Width::B64 => dynasm!(e.ops ; imul Rq(d), Rq(r)),
            (Alu::Mul, Rhs::Reg(r)) => dynasm!(e.ops ; imul Rd(d), Rd(r)),
            (Alu::Mul, Rhs::Imm(x)) if w == Width::B64 => dynasm!(e.ops ; imul Rq(d), Rq(d), x),
            (Alu::Mul, Rhs::Imm(x)) => dynasm!(e.ops ; imul Rd(d), Rd(d), x),
        }
    }
}

/// `dest = src1 op src2`, with src2 as an immediate when it fits.
pub(super) fn int_alu(e: &mut X64Emitter<'_>, i: &Instr, op: Alu) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let w = width(e, i, value)?;
    let (a, b) = (src(i, 0)?, src(i, 1)?);
    let imm = imm32(e, b);
    let mut s = e.scope(i.opcode);
    let ra = s.src(a)?;
    let rhs = match imm {
        Some(x) => Rhs::Imm(x),
        None => Rhs::Reg(s.src(b)?),
    };
    let d = s.dest(value)?;
    dynasm!(s.ops ; mov Rq(d), Rq(ra));
    op.emit(&mut s, w, d, rhs);
    s.end()?;
    Ok(Flow::Next)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fp {
    Add,
    Sub,
    Mul,
    Div,
}

/// `d op= s` for a scalar or packed float type.
fn fp_op(e: &mut X64Emitter<'_>, ty: TypeName, op: Fp, d: u8, s: u8) {
    match (ty, op) {
        (TypeName::Float32, Fp::Add) => dynasm!(e.ops ; addss Rx(d), Rx(s)),
        (TypeName::Float32, Fp::Sub) => dynasm!(e.ops ; subss Rx(d), Rx(s)),
        (TypeName::Float32, Fp::Mul) => dynasm!(e.ops ; mulss Rx(d), Rx(s)),
        (TypeName::Float32, Fp::Div) => dynasm!(e.ops ; divss Rx(d), Rx(s)),
        (TypeName::Float64, Fp::Add) => dynasm!(e.ops ; addsd Rx(d), Rx(s)),
        (TypeName::Float64, Fp::Sub) => dynasm!(e.ops ; subsd Rx(d), Rx(s)),
        (TypeName::Float64, Fp::Mul) => dynasm!(e.ops ; mulsd Rx(d), Rx(s)),
        (TypeName::Float64, Fp::Div) => dynasm!(e.ops ; divsd Rx(d), Rx(s)),
        (_, Fp::Add) => dynasm!(e.ops ; addps Rx(d), Rx(s)),
        (_, Fp::Sub) => dynasm!(e.ops ; subps Rx(d), Rx(s)),
        (_, Fp::Mul) => dynasm!(e.ops ; mulps Rx(d), Rx(s)),
        (_, Fp::Div) => dynasm!(e.ops ; divps Rx(d), Rx(s)),
    }
}

fn fp_binary(e: &mut X64Emitter<'_>, i: &Instr, op: Fp) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let ty = e.value_type(value)?;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let b = s.src(src(i, 1)?)?;
    let d = s.dest(value)?;
    dynasm!(s.ops ; movaps Rx(d), Rx(a));
    fp_op(&mut s, ty, op, d, b);
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Add, subtract, multiply
// ═══════════════════════════════════════════════════════════════════════════

fn arithmetic(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let is_int = e.value_type(dest(i)?)?.is_int();
    match (i.opcode, is_int) {
        (Opcode::Add, true) => int_alu(e, i, Alu::Add),
        (Opcode::Sub, true) => int_alu(e, i, Alu::Sub),
        (Opcode::Mul, true) => int_alu(e, i, Alu::Mul),
        (Opcode::Add, false) => fp_binary(e, i, Fp::Add),
        (Opcode::Sub, false) => fp_binary(e, i, Fp::Sub),
        (Opcode::Mul, false) => fp_binary(e, i, Fp::Mul),
        (Opcode::Div, false) => fp_binary(e, i, Fp::Div),
        (op, _) => Err(LoweringError::invalid(op, "not an arithmetic opcode")),
    }
}

/// `dest = src1 + src2 + (src3 & 1)`.
fn add_carry(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let w = width(e, i, value)?;
    let b = src(i, 1)?;
    let imm = imm32(e, b);
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let carry = s.src(src(i, 2)?)?;
    let rhs = match imm {
        Some(x) => Rhs::Imm(x),
        None => Rhs::Reg(s.src(b)?),
    };
    let d = s.dest(value)?;
    dynasm!(s.ops
        ; mov Rq(d), Rq(a)
        ; bt Rd(carry), 0
    );
    match rhs {
        Rhs::Reg(r) => int_rr!(s, w, adc, d, r),
        Rhs::Imm(x) => int_ri!(s, w, adc, d, x),
    }
    s.end()?;
    Ok(Flow::Next)
}

/// Element-wise add. Integer elements honor ARITHMETIC_SATURATE, signed or
/// unsigned; saturating 32-bit lanes have no SSE form.
fn vector_add(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let elem = element(i)?;
    let saturate = flags::is_saturate(i.flags);
    let unsigned = flags::is_unsigned(i.flags);
    if saturate && elem == I32 {
        return Err(LoweringError::unimplemented(
            i.opcode,
            format!("{} (saturating i32 lanes)", signature(e.func(), i)),
        ));
    }
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let b = s.src(src(i, 1)?)?;
    let d = s.dest(dest(i)?)?;
    dynasm!(s.ops ; movaps Rx(d), Rx(a));
    match (elem, saturate, unsigned) {
        (I8, false, _) => dynasm!(s.ops ; paddb Rx(d), Rx(b)),
        (I8, true, false) => dynasm!(s.ops ; paddsb Rx(d), Rx(b)),
        (I8, true, true) => dynasm!(s.ops ; paddusb Rx(d), Rx(b)),
        (I16, false, _) => dynasm!(s.ops ; paddw Rx(d), Rx(b)),
        (I16, true, false) => dynasm!(s.ops ; paddsw Rx(d), Rx(b)),
        (I16, true, true) => dynasm!(s.ops ; paddusw Rx(d), Rx(b)),
        (I32, _, _) => dynasm!(s.ops ; paddd Rx(d), Rx(b)),
        (TypeName::Float32, _, _) => dynasm!(s.ops ; addps Rx(d), Rx(b)),
        (other, _, _) => return Err(LoweringError::invalid(i.opcode, format!("{other} lanes"))),
    }
    s.end()?;
    Ok(Flow::Next)
}

/// High half of the double-width product.
fn mul_hi(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let w = width(e, i, value)?;
    let unsigned = flags::is_unsigned(i.flags);
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let b = s.src(src(i, 1)?)?;
    let d = s.dest(value)?;
    match (w, unsigned) {
        // byte multiplies leave the high half in ah; widen instead
        (Width::B8, false) => dynasm!(s.ops
            ; movsx eax, Rb(a)
            ; movsx edx, Rb(b)
            ; imul eax, edx
            ; sar eax, 8
            ; mov Rd(d), eax
        ),
        (Width::B8, true) => dynasm!(s.ops
            ; movzx eax, Rb(a)
            ; movzx edx, Rb(b)
            ; imul eax, edx
            ; shr eax, 8
            ; mov Rd(d), eax
        ),
        (Width::B16, false) => dynasm!(s.ops ; mov ax, Rw(a) ; imul Rw(b) ; mov Rd(d), edx),
        (Width::B16, true) => dynasm!(s.ops ; mov ax, Rw(a) ; mul Rw(b) ; mov Rd(d), edx),
        (Width::B32, false) => dynasm!(s.ops ; mov eax, Rd(a) ; imul Rd(b) ; mov Rd(d), edx),
        (Width::B32, true) => dynasm!(s.ops ; mov eax, Rd(a) ; mul Rd(b) ; mov Rd(d), edx),
        (Width::B64, false) => dynasm!(s.ops ; mov rax, Rq(a) ; imul Rq(b) ; mov Rq(d), rdx),
        (Width::B64, true) => dynasm!(s.ops ; mov rax, Rq(a) ; mul Rq(b) ; mov Rq(d), rdx),
    }
    s.end()?;
    Ok(Flow::Next)
}

/// Integer quotient, truncated toward zero. A zero divisor yields 0 and the
/// signed `MIN / -1` case wraps to `MIN`, where the host would fault.
fn div(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let w = width(e, i, value)?;
    let unsigned = flags::is_unsigned(i.flags);
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let b = s.src(src(i, 1)?)?;
    let d = s.dest(value)?;

    let zero = s.ops.new_dynamic_label();
    let done = s.ops.new_dynamic_label();
    int_rr!(s, w, test, b, b);
    dynasm!(s.ops ; jz =>zero);
    if !unsigned {
        let divide = s.ops.new_dynamic_label();
        int_ri!(s, w, cmp, b, -1);
        dynasm!(s.ops ; jne =>divide ; mov Rq(d), Rq(a));
        int_r!(s, w, neg, d);
        dynasm!(s.ops ; jmp =>done);
        s.bind_label(divide);
    }
    match (w, unsigned) {
        (Width::B8, false) => dynasm!(s.ops ; mov al, Rb(a) ; cbw ; idiv Rb(b)),
        (Width::B8, true) => dynasm!(s.ops ; movzx eax, Rb(a) ; div Rb(b)),
        (Width::B16, false) => dynasm!(s.ops ; mov ax, Rw(a) ; cwd ; idiv Rw(b)),
        (Width::B16, true) => dynasm!(s.ops ; mov ax, Rw(a) ; xor edx, edx ; div Rw(b)),
        (Width::B32, false) => dynasm!(s.ops ; mov eax, Rd(a) ; cdq ; idiv Rd(b)),
        (Width::B32, true) => dynasm!(s.ops ; mov eax, Rd(a) ; xor edx, edx ; div Rd(b)),
        (Width::B64, false) => dynasm!(s.ops ; mov rax, Rq(a) ; cqo ; idiv Rq(b)),
        (Width::B64, true) => dynasm!(s.ops ; mov rax, Rq(a) ; xor edx, edx ; div Rq(b)),
    }
    dynasm!(s.ops
        ; mov Rq(d), rax
        ; jmp =>done
        ;=>zero
        ; xor Rd(d), Rd(d)
        ;=>done
    );
    s.end()?;
    Ok(Flow::Next)
}

/// `dest = src1 * src2 ± src3`, rounded after each step.
fn mul_add(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let ty = e.value_type(value)?;
    let sub = i.opcode == Opcode::MulSub;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let b = s.src(src(i, 1)?)?;
    let c = s.src(src(i, 2)?)?;
    let d = s.dest(value)?;
    match ty.width() {
        Some(w) => {
            dynasm!(s.ops ; mov Rq(d), Rq(a));
            Alu::Mul.emit(&mut s, w, d, Rhs::Reg(b));
            let op = if sub { Alu::Sub } else { Alu::Add };
            op.emit(&mut s, w, d, Rhs::Reg(c));
        }
        None => {
            dynasm!(s.ops ; movaps Rx(d), Rx(a));
            fp_op(&mut s, ty, Fp::Mul, d, b);
            fp_op(&mut s, ty, if sub { Fp::Sub } else { Fp::Add }, d, c);
        }
    }
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Unary
// ═══════════════════════════════════════════════════════════════════════════

/// xmm0 = per-element sign bits (`sign`) or everything but them.
fn sign_mask(e: &mut X64Emitter<'_>, ty: TypeName, sign: bool) {
    match (ty, sign) {
        (TypeName::Float32, true) => dynasm!(e.ops ; mov eax, 0x8000_0000u32 as i32 ; movd xmm0, eax),
        (TypeName::Float32, false) => dynasm!(e.ops ; mov eax, 0x7FFF_FFFF ; movd xmm0, eax),
        (TypeName::Float64, true) => dynasm!(e.ops ; mov rax, QWORD i64::MIN ; movq xmm0, rax),
        (TypeName::Float64, false) => dynasm!(e.ops ; mov rax, QWORD i64::MAX ; movq xmm0, rax),
        (_, true) => dynasm!(e.ops ; pcmpeqd xmm0, xmm0 ; pslld xmm0, 31),
        (_, false) => dynasm!(e.ops ; pcmpeqd xmm0, xmm0 ; psrld xmm0, 1),
    }
}

fn neg(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let ty = e.value_type(value)?;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(value)?;
    match ty.width() {
        Some(w) => {
            dynasm!(s.ops ; mov Rq(d), Rq(a));
            int_r!(s, w, neg, d);
        }
        None => {
            sign_mask(&mut s, ty, true);
            dynasm!(s.ops
                ; movaps Rx(d), Rx(a)
                ; xorps Rx(d), xmm0
            );
        }
    }
    s.end()?;
    Ok(Flow::Next)
}

/// Integer MIN stays MIN.
fn abs(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let ty = e.value_type(value)?;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(value)?;
    match ty.width() {
        Some(w) => {
            dynasm!(s.ops ; mov Rq(d), Rq(a));
            int_r!(s, w, neg, d);
            dynasm!(s.ops ; cmovs Rq(d), Rq(a));
        }
        None => {
            sign_mask(&mut s, ty, false);
            dynasm!(s.ops
                ; movaps Rx(d), Rx(a)
                ; andps Rx(d), xmm0
            );
        }
    }
    s.end()?;
    Ok(Flow::Next)
}

fn sqrt(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let ty = e.value_type(value)?;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(value)?;
    match ty {
        TypeName::Float32 => dynasm!(s.ops ; sqrtss Rx(d), Rx(a)),
        TypeName::Float64 => dynasm!(s.ops ; sqrtsd Rx(d), Rx(a)),
        _ => dynasm!(s.ops ; sqrtps Rx(d), Rx(a)),
    }
    s.end()?;
    Ok(Flow::Next)
}

/// Hardware estimate (about 12 bits); f64 goes through single precision.
fn rsqrt(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let ty = e.value_type(value)?;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(value)?;
    match ty {
        TypeName::Float32 => dynasm!(s.ops ; rsqrtss Rx(d), Rx(a)),
        TypeName::Float64 => dynasm!(s.ops
            ; cvtsd2ss Rx(d), Rx(a)
            ; rsqrtss Rx(d), Rx(d)
            ; cvtss2sd Rx(d), Rx(d)
        ),
        _ => dynasm!(s.ops ; rsqrtps Rx(d), Rx(a)),
    }
    s.end()?;
    Ok(Flow::Next)
}

/// Scalar helper taking and returning its value in xmm0.
fn call_scalar(e: &mut X64Emitter<'_>, i: &Instr, helper: u64) -> Result<Flow, LoweringError> {
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    dynasm!(s.ops ; movaps xmm0, Rx(a));
    s.end()?;
    e.call_native(helper);
    let mut s = e.scope(i.opcode);
    let d = s.dest(dest(i)?)?;
    dynasm!(s.ops ; movaps Rx(d), xmm0);
    s.end()?;
    Ok(Flow::Next)
}

fn pow2(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    match e.value_type(dest(i)?)? {
        TypeName::Float32 => call_scalar(e, i, helpers::pow2_f32 as usize as u64),
        TypeName::Float64 => call_scalar(e, i, helpers::pow2_f64 as usize as u64),
        _ => {
            let a = src(i, 0)?;
            call_helper(e, i, helpers::pow2_v128_thunk as usize as u64, &[HelperArg::Vector(a)])?;
            Ok(Flow::Next)
        }
    }
}

fn log2(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    match e.value_type(dest(i)?)? {
        TypeName::Float32 => call_scalar(e, i, helpers::log2_f32 as usize as u64),
        TypeName::Float64 => call_scalar(e, i, helpers::log2_f64 as usize as u64),
        _ => {
            let a = src(i, 0)?;
            call_helper(e, i, helpers::log2_v128_thunk as usize as u64, &[HelperArg::Vector(a)])?;
            Ok(Flow::Next)
        }
    }
}

/// dpps over logical x, y, z (and w), summed into the scalar result.
fn dot_product(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    require_unverified(e, i, "dpps lane mask against guest xyzw order")?;
    let lanes = if i.opcode == Opcode::DotProduct3 { 0b0111 } else { 0b1111 };
    let imm = lanes::dot_product_immediate(lanes) as i8;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let b = s.src(src(i, 1)?)?;
    let d = s.dest(dest(i)?)?;
    dynasm!(s.ops
        ; movaps Rx(d), Rx(a)
        ; dpps Rx(d), Rx(b), imm
    );
    s.end()?;
    Ok(Flow::Next)
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::super::testing::Arg::{Const, Live, Vec as V};
    use super::super::testing::*;
    use crate::config::LoweringConfig;
    use crate::error::LoweringError;
    use crate::hir::{flags, Constant, FunctionBuilder, Opcode, TypeName, Vec128};
    use crate::runtime::GuestRuntime;

    const I8: TypeName = TypeName::Int8;
    const I16: TypeName = TypeName::Int16;
    const I32: TypeName = TypeName::Int32;
    const I64: TypeName = TypeName::Int64;
    const F32: TypeName = TypeName::Float32;
    const F64: TypeName = TypeName::Float64;
    const V128: TypeName = TypeName::Vec128;

    const UNSIGNED: u32 = flags::ARITHMETIC_UNSIGNED;

    fn i32_op(opcode: Opcode, flags: u32, a: i32, b: i32) -> i32 {
        eval_scalar(opcode, flags, I32, &[Live(I32, a as u32 as u64), Live(I32, b as u32 as u64)]) as u32 as i32
    }

    fn f64_op(opcode: Opcode, a: f64, b: f64) -> f64 {
        f64::from_bits(eval_scalar(opcode, 0, F64, &[Live(F64, a.to_bits()), Live(F64, b.to_bits())]))
    }

    fn f32_lanes(v: [f32; 4]) -> super::super::testing::Arg {
        V(Vec128::from_f32_lanes(v))
    }

    #[test]
    fn test_int32_arithmetic_round_trip() {
        assert_eq!(i32_op(Opcode::Add, 0, i32::MAX, 1), i32::MIN);
        assert_eq!(i32_op(Opcode::Sub, 0, 3, 10), -7);
        assert_eq!(i32_op(Opcode::Mul, 0, -6, 7), -42);
        assert_eq!(i32_op(Opcode::Mul, UNSIGNED, -6, 7), -42);
        assert_eq!(i32_op(Opcode::Div, 0, -7, 2), -3);
        assert_eq!(i32_op(Opcode::Div, UNSIGNED, -7, 2), ((-7i32 as u32) / 2) as i32);
        assert_eq!(i32_op(Opcode::Div, 0, 9, 0), 0);
        assert_eq!(i32_op(Opcode::Div, UNSIGNED, 9, 0), 0);
        assert_eq!(i32_op(Opcode::Div, 0, i32::MIN, -1), i32::MIN);
        assert_eq!(i32_op(Opcode::Div, 0, 100, -1), -100);
    }

    #[test]
    fn test_wide_multiply_high_half() {
        assert_eq!(i32_op(Opcode::MulHi, 0, -2, 3), -1);
        assert_eq!(i32_op(Opcode::MulHi, UNSIGNED, -2, 3), 2);
        assert_eq!(i32_op(Opcode::MulHi, 0, 0x4000_0000, 8), 2);

        let a = 0xFFFF_FFFF_FFFF_FFFFu64;
        let hi = eval_scalar(Opcode::MulHi, UNSIGNED, I64, &[Live(I64, a), Live(I64, a)]);
        assert_eq!(hi, a - 1);
        let hi = eval_scalar(Opcode::MulHi, 0, I64, &[Live(I64, a), Live(I64, a)]);
        assert_eq!(hi, 0);

        assert_eq!(eval_scalar(Opcode::MulHi, 0, I8, &[Live(I8, 0x80), Live(I8, 0x02)]), 0xFF);
        assert_eq!(eval_scalar(Opcode::MulHi, UNSIGNED, I8, &[Live(I8, 0x80), Live(I8, 0x02)]), 0x01);
        assert_eq!(eval_scalar(Opcode::MulHi, UNSIGNED, I16, &[Live(I16, 0xFFFF), Live(I16, 0xFFFF)]), 0xFFFE);
    }

    #[test]
    fn test_narrow_divide() {
        assert_eq!(eval_scalar(Opcode::Div, 0, I8, &[Live(I8, 0xF9), Live(I8, 2)]), 0xFD);
        assert_eq!(eval_scalar(Opcode::Div, UNSIGNED, I8, &[Live(I8, 0xF9), Live(I8, 2)]), 0x7C);
        assert_eq!(eval_scalar(Opcode::Div, 0, I16, &[Live(I16, 0x8000), Live(I16, 0xFFFF)]), 0x8000);
        let q = eval_scalar(Opcode::Div, UNSIGNED, I64, &[Live(I64, u64::MAX), Live(I64, 16)]);
        assert_eq!(q, u64::MAX / 16);
    }

    #[test]
    fn test_immediate_operands() {
        let r = eval_scalar(Opcode::Add, 0, I64, &[Live(I64, 40), Const(Constant::Int64(2))]);
        assert_eq!(r, 42);
        let r = eval_scalar(Opcode::Sub, 0, I16, &[Live(I16, 1), Const(Constant::Int16(2))]);
        assert_eq!(r, 0xFFFF);
        let r = eval_scalar(Opcode::Mul, 0, I64, &[Live(I64, 1 << 33), Const(Constant::Int64(-3))]);
        assert_eq!(r, (-(3i64 << 33)) as u64);
        let wide = 0x1234_5678_9ABCi64;
        let r = eval_scalar(Opcode::Add, 0, I64, &[Live(I64, 1), Const(Constant::Int64(wide))]);
        assert_eq!(r, wide as u64 + 1);
    }

    #[test]
    fn test_add_carry() {
        let r = eval_scalar(
            Opcode::AddCarry,
            0,
            I32,
            &[Live(I32, 5), Live(I32, 6), Live(I8, 1)],
        );
        assert_eq!(r, 12);
        let r = eval_scalar(
            Opcode::AddCarry,
            0,
            I32,
            &[Live(I32, 5), Const(Constant::Int32(6)), Live(I8, 0)],
        );
        assert_eq!(r, 11);
    }

    #[test]
    fn test_float_arithmetic() {
        assert_eq!(f64_op(Opcode::Add, 1.5, 2.25), 3.75);
        assert_eq!(f64_op(Opcode::Sub, 1.5, 2.25), -0.75);
        assert_eq!(f64_op(Opcode::Mul, -1.5, 4.0), -6.0);
        assert_eq!(f64_op(Opcode::Div, 1.0, 8.0), 0.125);
        assert!(f64_op(Opcode::Div, 0.0, 0.0).is_nan());

        let r = eval_scalar(
            Opcode::Div,
            0,
            F32,
            &[Live(F32, 3.0f32.to_bits() as u64), Const(Constant::Float32(2.0))],
        );
        assert_eq!(f32::from_bits(r as u32), 1.5);

        let v = eval(
            Opcode::Mul,
            0,
            V128,
            &[f32_lanes([1.0, 2.0, 3.0, 4.0]), f32_lanes([2.0, 2.0, 0.5, -1.0])],
        );
        assert_eq!(v.f32_lanes(), [2.0, 4.0, 1.5, -4.0]);
    }

    #[test]
    fn test_mul_add_and_sub() {
        let args = |c: f64| {
            [
                Live(F64, 3.0f64.to_bits()),
                Live(F64, 4.0f64.to_bits()),
                Live(F64, c.to_bits()),
            ]
        };
        assert_eq!(f64::from_bits(eval_scalar(Opcode::MulAdd, 0, F64, &args(0.5))), 12.5);
        assert_eq!(f64::from_bits(eval_scalar(Opcode::MulSub, 0, F64, &args(0.5))), 11.5);
        let r = eval_scalar(
            Opcode::MulAdd,
            0,
            I32,
            &[Live(I32, 6), Live(I32, 7), Live(I32, 100)],
        );
        assert_eq!(r, 142);
        let v = eval(
            Opcode::MulSub,
            0,
            V128,
            &[
                f32_lanes([1.0, 2.0, 3.0, 4.0]),
                f32_lanes([2.0; 4]),
                f32_lanes([1.0; 4]),
            ],
        );
        assert_eq!(v.f32_lanes(), [1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_neg_abs() {
        assert_eq!(eval_scalar(Opcode::Neg, 0, I32, &[Live(I32, 5)]) as u32 as i32, -5);
        let abs = |x: i32| eval_scalar(Opcode::Abs, 0, I32, &[Live(I32, x as u32 as u64)]) as u32 as i32;
        assert_eq!(abs(-9), 9);
        assert_eq!(abs(9), 9);
        assert_eq!(abs(0), 0);
        assert_eq!(abs(i32::MIN), i32::MIN);
        assert_eq!(eval_scalar(Opcode::Abs, 0, I8, &[Live(I8, 0xFE)]), 2);

        let f = eval_scalar(Opcode::Neg, 0, F64, &[Live(F64, 2.0f64.to_bits())]);
        assert_eq!(f64::from_bits(f), -2.0);
        let f = eval_scalar(Opcode::Abs, 0, F32, &[Live(F32, (-2.5f32).to_bits() as u64)]);
        assert_eq!(f32::from_bits(f as u32), 2.5);
        let v = eval(Opcode::Neg, 0, V128, &[f32_lanes([1.0, -2.0, 0.0, 4.0])]);
        assert_eq!(v.lanes(), Vec128::from_f32_lanes([-1.0, 2.0, -0.0, -4.0]).lanes());
        let v = eval(Opcode::Abs, 0, V128, &[f32_lanes([1.0, -2.0, -0.0, -4.0])]);
        assert_eq!(v.f32_lanes(), [1.0, 2.0, 0.0, 4.0]);
    }

    #[test]
    fn test_sqrt_rsqrt() {
        let f = eval_scalar(Opcode::Sqrt, 0, F64, &[Live(F64, 2.0f64.to_bits())]);
        assert_eq!(f64::from_bits(f), 2.0f64.sqrt());
        let v = eval(Opcode::Sqrt, 0, V128, &[f32_lanes([4.0, 9.0, 16.0, 0.25])]);
        assert_eq!(v.f32_lanes(), [2.0, 3.0, 4.0, 0.5]);

        let r = eval_scalar(Opcode::Rsqrt, 0, F32, &[Live(F32, 4.0f32.to_bits() as u64)]);
        assert!((f32::from_bits(r as u32) - 0.5).abs() < 1e-3);
        let r = eval_scalar(Opcode::Rsqrt, 0, F64, &[Live(F64, 16.0f64.to_bits())]);
        assert!((f64::from_bits(r) - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_pow2_log2_helpers() {
        let r = eval_scalar(Opcode::Pow2, 0, F32, &[Live(F32, 3.0f32.to_bits() as u64)]);
        assert_eq!(f32::from_bits(r as u32), 8.0);
        let r = eval_scalar(Opcode::Log2, 0, F64, &[Live(F64, 1024.0f64.to_bits())]);
        assert_eq!(f64::from_bits(r), 10.0);
        let v = eval(Opcode::Pow2, 0, V128, &[f32_lanes([0.0, 1.0, 2.0, -1.0])]);
        assert_eq!(v.f32_lanes(), [1.0, 2.0, 4.0, 0.5]);
        let v = eval(Opcode::Log2, 0, V128, &[f32_lanes([1.0, 2.0, 8.0, 0.25])]);
        assert_eq!(v.f32_lanes(), [0.0, 1.0, 3.0, -2.0]);
    }

    #[test]
    fn test_pow2_keeps_live_values() {
        // operands live across the helper call must survive it
        let mut b = FunctionBuilder::new("pow2_live");
        let x = b.load_context(0, F64);
        let k = b.load_context(8, I64);
        let p = b.unary(Opcode::Pow2, x);
        let sum = b.binary(Opcode::Add, p, x);
        b.store_context(16, sum);
        b.store_context(24, k);
        b.ret();
        let mut ctx = vec![0u8; 32];
        ctx_write(&mut ctx, 0, 8, 2.0f64.to_bits());
        ctx_write(&mut ctx, 8, 8, 0xDEAD_BEEF_0000_0001);
        run(&b.finish(), &mut ctx, &mut []);
        assert_eq!(f64::from_bits(ctx_read(&ctx, 16, 8)), 6.0);
        assert_eq!(ctx_read(&ctx, 24, 8), 0xDEAD_BEEF_0000_0001);
    }

    #[test]
    fn test_vector_add_elements() {
        let bytes = |v: u8| Vec128::from_bytes([v; 16]);
        let sat = flags::ARITHMETIC_SATURATE;
        let r = eval(Opcode::VectorAdd, flags::vector(I8, 0), V128, &[V(bytes(0x70)), V(bytes(0x20))]);
        assert_eq!(r, bytes(0x90));
        let r = eval(Opcode::VectorAdd, flags::vector(I8, sat), V128, &[V(bytes(0x70)), V(bytes(0x20))]);
        assert_eq!(r, bytes(0x7F));
        let r = eval(
            Opcode::VectorAdd,
            flags::vector(I8, sat | UNSIGNED),
            V128,
            &[V(bytes(0xF0)), V(bytes(0x20))],
        );
        assert_eq!(r, bytes(0xFF));
        let a = Vec128::from_lanes([1, 2, 3, u32::MAX]);
        let r = eval(Opcode::VectorAdd, flags::vector(I32, 0), V128, &[V(a), V(a)]);
        assert_eq!(r.lanes(), [2, 4, 6, u32::MAX - 1]);
        let r = eval(
            Opcode::VectorAdd,
            flags::vector(F32, 0),
            V128,
            &[f32_lanes([1.0, 2.0, 3.0, 4.0]), f32_lanes([0.5; 4])],
        );
        assert_eq!(r.f32_lanes(), [1.5, 2.5, 3.5, 4.5]);
    }

    #[test]
    fn test_saturating_i32_lanes_are_unimplemented() {
        let mut b = FunctionBuilder::new("sat32");
        let x = b.load_context(0, V128);
        let r = b.binary_flags(Opcode::VectorAdd, x, x, flags::vector(I32, flags::ARITHMETIC_SATURATE));
        b.store_context(16, r);
        b.ret();
        match try_compile(&b.finish()) {
            Err(e @ LoweringError::UnimplementedOpcode { .. }) => assert!(e.is_recoverable()),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn dot(opcode: Opcode, config: LoweringConfig) -> Result<f32, LoweringError> {
        let mut b = FunctionBuilder::new("dot");
        let x = b.load_context(0, V128);
        let y = b.load_context(16, V128);
        let r = b.op(opcode, F32, &[x.into(), y.into()], 0);
        b.store_context(32, r);
        b.ret();
        let compiled = compile_with(&b.finish(), config, GuestRuntime::standalone())?;
        let mut ctx = vec![0u8; 48];
        ctx_write_vec(&mut ctx, 0, Vec128::from_f32_lanes([1.0, 2.0, 3.0, 4.0]));
        ctx_write_vec(&mut ctx, 16, Vec128::from_f32_lanes([5.0, 6.0, 7.0, 8.0]));
        run_compiled(&compiled, &mut ctx, &mut []);
        Ok(f32::from_bits(ctx_read(&ctx, 32, 4) as u32))
    }

    #[test]
    fn test_dot_products() {
        assert_eq!(dot(Opcode::DotProduct3, test_config()).unwrap(), 38.0);
        assert_eq!(dot(Opcode::DotProduct4, test_config()).unwrap(), 70.0);
    }

    #[test]
    fn test_dot_product_requires_opt_in() {
        match dot(Opcode::DotProduct3, LoweringConfig::default()) {
            Err(LoweringError::UnverifiedSequence { opcode, .. }) => assert_eq!(opcode, Opcode::DotProduct3),
            other => panic!("unexpected {other:?}"),
        }
    }
}
