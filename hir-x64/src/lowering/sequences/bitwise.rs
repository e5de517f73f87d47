//! Logic, shifts, rotates, byte swaps and leading-zero counts.
//!
//! Scalar shift counts go through cl and are masked the way the host masks
//! them: 6 bits for 64-bit operands and 5 bits otherwise, so a count of 33
//! shifts an i32 by 1 rather than clearing it.

use super::math::{int_alu, Alu};
use super::{call_helper, dest, element, src, width, HelperArg, I16, I32, I64, I8};
use crate::error::LoweringError;
use crate::hir::{Instr, Opcode, TypeName, Vec128, Width};
use crate::lowering::matcher::{Pat::{self, Float, Int}, Shape};
use crate::lowering::table::{Flow, LoweringTable, Rule, ALL, INT, VEC};
use crate::x64::helpers::{self, ShiftKind};
use crate::x64::{lanes, X64Emitter};
use dynasmrt::{dynasm, DynasmApi};

pub(super) fn register(table: &mut LoweringTable) {
    for (opcode, int, vec) in [
        (Opcode::And, "and", "pand"),
        (Opcode::Or, "or", "por"),
        (Opcode::Xor, "xor", "pxor"),
    ] {
        table.add(
            opcode,
            ALL,
            vec![
                Rule::new(Shape::binary(Int, Int, Int), int, logic),
                Rule::new(Shape::binary(Float, Float, Float), vec, logic),
                Rule::new(Shape::binary(Pat::Vec, Pat::Vec, Pat::Vec), vec, logic),
            ],
        );
    }
    table.add(
        Opcode::Not,
        ALL,
        vec![
            Rule::new(Shape::unary(Int, Int), "not", not),
            Rule::new(Shape::unary(Pat::Vec, Pat::Vec), "pxor ones", not),
        ],
    );
    for (opcode, name) in [
        (Opcode::Shl, "shl"),
        (Opcode::Shr, "shr"),
        (Opcode::Sha, "sar"),
        (Opcode::RotateLeft, "rol"),
    ] {
        table.add(
            opcode,
            INT,
            vec![
                Rule::new(Shape::binary(Int, Int, Pat::IntConst), name, shift),
                Rule::new(Shape::binary(Int, Int, Int), name, shift),
            ],
        );
    }
    for opcode in [Opcode::VectorShl, Opcode::VectorShr, Opcode::VectorSha] {
        table.add(
            opcode,
            VEC,
            vec![
                Rule::new(Shape::binary(Pat::Vec, Pat::Vec, Pat::VecConst), "ps*l imm", vector_shift),
                Rule::new(Shape::binary(Pat::Vec, Pat::Vec, Pat::Vec), "call shift", vector_shift),
            ],
        );
    }
    table.add(
        Opcode::ByteSwap,
        ALL,
        vec![
            Rule::new(Shape::unary(Pat::Ty(I16), Pat::Val(I16)), "rol 8", byte_swap),
            Rule::new(Shape::unary(Pat::Ty(I32), Pat::Val(I32)), "bswap", byte_swap),
            Rule::new(Shape::unary(Pat::Ty(I64), Pat::Val(I64)), "bswap", byte_swap),
            Rule::new(Shape::unary(Pat::Vec, Pat::Vec), "pshufd 0x1b", byte_swap),
        ],
    );
    table.add(
        Opcode::Cntlz,
        INT,
        vec![Rule::new(Shape::unary(Int, Int), "bsr; cmovz", cntlz)],
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Logic
// ═══════════════════════════════════════════════════════════════════════════

fn logic(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let ty = e.value_type(value)?;
    if ty.is_int() {
        let op = match i.opcode {
            Opcode::And => Alu::And,
            Opcode::Or => Alu::Or,
            _ => Alu::Xor,
        };
        return int_alu(e, i, op);
    }
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let b = s.src(src(i, 1)?)?;
    let d = s.dest(value)?;
    dynasm!(s.ops ; movaps Rx(d), Rx(a));
    match (i.opcode, ty.is_vec()) {
        (Opcode::And, true) => dynasm!(s.ops ; pand Rx(d), Rx(b)),
        (Opcode::Or, true) => dynasm!(s.ops ; por Rx(d), Rx(b)),
        (_, true) => dynasm!(s.ops ; pxor Rx(d), Rx(b)),
        (Opcode::And, false) => dynasm!(s.ops ; andps Rx(d), Rx(b)),
        (Opcode::Or, false) => dynasm!(s.ops ; orps Rx(d), Rx(b)),
        (_, false) => dynasm!(s.ops ; xorps Rx(d), Rx(b)),
    }
    s.end()?;
    Ok(Flow::Next)
}

fn not(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let w = e.value_type(value)?.width();
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(value)?;
    match w {
        Some(w) => {
            dynasm!(s.ops ; mov Rq(d), Rq(a));
            int_r!(s, w, not, d);
        }
        None => dynasm!(s.ops
            ; pcmpeqd xmm0, xmm0
            ; movaps Rx(d), Rx(a)
            ; pxor Rx(d), xmm0
        ),
    }
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Scalar shifts and rotates
// ═══════════════════════════════════════════════════════════════════════════

macro_rules! shift_cl {
    ($e:ident, $w:expr, $mn:ident, $d:expr) => {
        match $w {
            Width::B8 => dynasm!($e.ops ; $mn Rb($d), cl),
            Width::B16 => dynasm!($e.ops ; $mn Rw($d), cl),
            Width::B32 => dynasm!($e.ops ; $mn Rd($d), cl),
            Width::B64 => dynasm!($e.ops ; $mn Rq($d), cl),
        }
    };
}

/// Shift or rotate by an imm8 count at width `$w`.
macro_rules! shift_imm {
    ($e:ident, $w:expr, $mn:ident, $d:expr, $imm:expr) => {
        match $w {
            Width::B8 => dynasm!($e.ops ; $mn Rb($d), $imm),
            Width::B16 => dynasm!($e.ops ; $mn Rw($d), $imm),
            Width::B32 => dynasm!($e.ops ; $mn Rd($d), $imm),
            Width::B64 => dynasm!($e.ops ; $mn Rq($d), $imm),
        }
    };
}

fn shift(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let w = width(e, i, value)?;
    let count = src(i, 1)?;
    let imm = e.constant(count).map(|c| c.bits() as u8);
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let n = match imm {
        Some(_) => None,
        None => Some(s.src(count)?),
    };
    let d = s.dest(value)?;
    dynasm!(s.ops ; mov Rq(d), Rq(a));
    match (n, imm) {
        (Some(n), _) => {
            dynasm!(s.ops ; mov ecx, Rd(n));
            match i.opcode {
                Opcode::Shl => shift_cl!(s, w, shl, d),
                Opcode::Shr => shift_cl!(s, w, shr, d),
                Opcode::Sha => shift_cl!(s, w, sar, d),
                _ => shift_cl!(s, w, rol, d),
            }
        }
        (None, Some(x)) => {
            // the encoded count is masked by hardware like cl
            let x = x as i8;
            match i.opcode {
                Opcode::Shl => shift_imm!(s, w, shl, d, x),
                Opcode::Shr => shift_imm!(s, w, shr, d, x),
                Opcode::Sha => shift_imm!(s, w, sar, d, x),
                _ => shift_imm!(s, w, rol, d, x),
            }
        }
        (None, None) => return Err(LoweringError::invalid(i.opcode, "missing shift count")),
    }
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Vector shifts
// ═══════════════════════════════════════════════════════════════════════════

/// Count shared by every element of `v`, if they all agree.
fn uniform_count(v: Vec128, element: TypeName) -> Option<u8> {
    let size = element.size();
    let bytes = v.to_bytes();
    let first = &bytes[..size];
    if bytes.chunks(size).all(|c| c == first) {
        Some((first[0] as u32 % element.bits()) as u8)
    } else {
        None
    }
}

fn vector_shift(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let elem = element(i)?;
    if ![I8, I16, I32].contains(&elem) {
        return Err(LoweringError::invalid(i.opcode, format!("{elem} lanes")));
    }
    let kind = match i.opcode {
        Opcode::VectorShl => ShiftKind::Shl,
        Opcode::VectorShr => ShiftKind::Shr,
        _ => ShiftKind::Sha,
    };
    let (a, b) = (src(i, 0)?, src(i, 1)?);
    let uniform = e
        .constant(b)
        .and_then(|c| c.as_vec128())
        .filter(|_| elem != I8)
        .and_then(|v| uniform_count(v, elem));

    let Some(n) = uniform else {
        let control = helpers::shift_control(kind, elem);
        call_helper(
            e,
            i,
            helpers::vector_shift_thunk as usize as u64,
            &[HelperArg::Vector(a), HelperArg::Vector(b), HelperArg::Imm(control)],
        )?;
        return Ok(Flow::Next);
    };

    let n = n as i8;
    let mut s = e.scope(i.opcode);
    let ra = s.src(a)?;
    let d = s.dest(dest(i)?)?;
    dynasm!(s.ops ; movaps Rx(d), Rx(ra));
    match (kind, elem == I16) {
        (ShiftKind::Shl, true) => dynasm!(s.ops ; psllw Rx(d), n),
        (ShiftKind::Shr, true) => dynasm!(s.ops ; psrlw Rx(d), n),
        (ShiftKind::Sha, true) => dynasm!(s.ops ; psraw Rx(d), n),
        (ShiftKind::Shl, false) => dynasm!(s.ops ; pslld Rx(d), n),
        (ShiftKind::Shr, false) => dynasm!(s.ops ; psrld Rx(d), n),
        (ShiftKind::Sha, false) => dynasm!(s.ops ; psrad Rx(d), n),
    }
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Byte swap and leading zeros
// ═══════════════════════════════════════════════════════════════════════════

/// Vec128 swaps reverse the four lanes.
fn byte_swap(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let ty = e.value_type(value)?;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(value)?;
    match ty.width() {
        Some(Width::B16) => dynasm!(s.ops ; mov Rq(d), Rq(a) ; rol Rw(d), 8),
        Some(Width::B32) => dynasm!(s.ops ; mov Rq(d), Rq(a) ; bswap Rd(d)),
        Some(Width::B64) => dynasm!(s.ops ; mov Rq(d), Rq(a) ; bswap Rq(d)),
        Some(Width::B8) => return Err(LoweringError::invalid(i.opcode, "byte swap of i8")),
        None => dynasm!(s.ops ; pshufd Rx(d), Rx(a), lanes::REVERSE_DWORDS as i8),
    }
    s.end()?;
    Ok(Flow::Next)
}

/// Leading zero count as i8. bsr finds the top set bit; a zero input
/// selects `2w - 1`, which the final xor turns into `w`.
fn cntlz(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let a = src(i, 0)?;
    let w = width(e, i, a)?;
    let bits = w.bits() as i32;
    let mut s = e.scope(i.opcode);
    let ra = s.src(a)?;
    let d = s.dest(dest(i)?)?;
    match w {
        Width::B8 => dynasm!(s.ops ; movzx Rd(d), Rb(ra) ; bsr Rd(d), Rd(d)),
        Width::B16 => dynasm!(s.ops ; movzx Rd(d), Rw(ra) ; bsr Rd(d), Rd(d)),
        Width::B32 => dynasm!(s.ops ; bsr Rd(d), Rd(ra)),
        Width::B64 => dynasm!(s.ops ; bsr Rq(d), Rq(ra)),
    }
    dynasm!(s.ops
        ; mov eax, 2 * bits - 1
        ; cmovz Rd(d), eax
        ; xor Rd(d), bits - 1
    );
    s.end()?;
    Ok(Flow::Next)
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::super::testing::Arg::{Const, Live, Vec as V};
    use super::super::testing::*;
    use crate::hir::{flags, Constant, Opcode, TypeName, Vec128};

    const I8: TypeName = TypeName::Int8;
    const I16: TypeName = TypeName::Int16;
    const I32: TypeName = TypeName::Int32;
    const I64: TypeName = TypeName::Int64;
    const V128: TypeName = TypeName::Vec128;

    fn shift(opcode: Opcode, ty: TypeName, x: u64, n: u8) -> u64 {
        eval_scalar(opcode, 0, ty, &[Live(ty, x), Live(I8, n as u64)])
    }

    fn shift_imm(opcode: Opcode, ty: TypeName, x: u64, n: u8) -> u64 {
        eval_scalar(opcode, 0, ty, &[Live(ty, x), Const(Constant::Int8(n as i8))])
    }

    #[test]
    fn test_logic_ops() {
        let r = eval_scalar(Opcode::And, 0, I32, &[Live(I32, 0xF0F0), Live(I32, 0xFF00)]);
        assert_eq!(r, 0xF000);
        let r = eval_scalar(Opcode::Or, 0, I64, &[Live(I64, 1 << 40), Const(Constant::Int64(3))]);
        assert_eq!(r, (1 << 40) | 3);
        let r = eval_scalar(Opcode::Xor, 0, I8, &[Live(I8, 0xAA), Const(Constant::Int8(-1))]);
        assert_eq!(r, 0x55);
        let r = eval_scalar(Opcode::Not, 0, I16, &[Live(I16, 0x00FF)]);
        assert_eq!(r, 0xFF00);

        let a = Vec128::from_lanes([0xFF, 0xF0, 0x0F, 0]);
        let b = Vec128::from_lanes([0x0F; 4]);
        assert_eq!(eval(Opcode::And, 0, V128, &[V(a), V(b)]).lanes(), [0x0F, 0, 0x0F, 0]);
        assert_eq!(eval(Opcode::Or, 0, V128, &[V(a), V(b)]).lanes(), [0xFF, 0xFF, 0x0F, 0x0F]);
        assert_eq!(eval(Opcode::Xor, 0, V128, &[V(a), V(b)]).lanes(), [0xF0, 0xFF, 0, 0x0F]);
        let r = eval(Opcode::Not, 0, V128, &[V(a)]);
        assert_eq!(r.lanes(), [!0xFF, !0xF0, !0x0F, u32::MAX]);
    }

    #[test]
    fn test_shift_count_masking() {
        // register counts
        assert_eq!(shift(Opcode::Shl, I32, 1, 33), 2);
        assert_eq!(shift(Opcode::Shl, I64, 1, 65), 2);
        assert_eq!(shift(Opcode::Shl, I64, 1, 40), 1 << 40);
        assert_eq!(shift(Opcode::Shr, I32, 0x8000_0000, 32), 0x8000_0000);
        assert_eq!(shift(Opcode::Sha, I32, 0x8000_0000, 31), 0xFFFF_FFFF);
        assert_eq!(shift(Opcode::Sha, I64, u64::MAX << 4, 68), u64::MAX);
        // narrow operands still mask to 5 bits
        assert_eq!(shift(Opcode::Shl, I8, 1, 9), 0);
        assert_eq!(shift(Opcode::Shl, I8, 1, 33), 2);
        assert_eq!(shift(Opcode::Shr, I16, 0x8000, 15), 1);
        // immediate counts
        assert_eq!(shift_imm(Opcode::Shl, I32, 1, 33), 2);
        assert_eq!(shift_imm(Opcode::Shr, I64, 1 << 63, 63), 1);
        assert_eq!(shift_imm(Opcode::Sha, I16, 0x8000, 4), 0xF800);
    }

    #[test]
    fn test_rotate_left() {
        assert_eq!(shift(Opcode::RotateLeft, I32, 0x8000_0001, 1), 3);
        assert_eq!(shift_imm(Opcode::RotateLeft, I8, 0x81, 4), 0x18);
        assert_eq!(shift(Opcode::RotateLeft, I64, 0x1234, 64), 0x1234);
    }

    #[test]
    fn test_byte_swap() {
        assert_eq!(eval_scalar(Opcode::ByteSwap, 0, I32, &[Live(I32, 0x1234_5678)]), 0x7856_3412);
        assert_eq!(eval_scalar(Opcode::ByteSwap, 0, I16, &[Live(I16, 0xABCD)]), 0xCDAB);
        assert_eq!(
            eval_scalar(Opcode::ByteSwap, 0, I64, &[Live(I64, 0x0102_0304_0506_0708)]),
            0x0807_0605_0403_0201
        );
        let v = eval(Opcode::ByteSwap, 0, V128, &[V(Vec128::from_lanes([1, 2, 3, 4]))]);
        assert_eq!(v.lanes(), [4, 3, 2, 1]);
    }

    #[test]
    fn test_byte_swap_of_constant() {
        let r = eval_scalar(Opcode::ByteSwap, 0, I32, &[Const(Constant::Int32(0x1234_5678))]);
        assert_eq!(r, 0x7856_3412);
        let r = eval_scalar(Opcode::ByteSwap, 0, I16, &[Const(Constant::Int16(0x1234))]);
        assert_eq!(r, 0x3412);
        let r = eval_scalar(Opcode::ByteSwap, 0, I64, &[Const(Constant::Int64(0x0102_0304_0506_0708))]);
        assert_eq!(r, 0x0807_0605_0403_0201);
    }

    #[test]
    fn test_cntlz_widths() {
        for ty in [I8, I16, I32, I64] {
            let r = eval_scalar(Opcode::Cntlz, 0, I8, &[Live(ty, 0)]);
            assert_eq!(r, ty.bits() as u64, "{ty}");
            let r = eval_scalar(Opcode::Cntlz, 0, I8, &[Live(ty, 1)]);
            assert_eq!(r, ty.bits() as u64 - 1, "{ty}");
        }
        assert_eq!(eval_scalar(Opcode::Cntlz, 0, I8, &[Live(I8, 0x80)]), 0);
        assert_eq!(eval_scalar(Opcode::Cntlz, 0, I8, &[Live(I32, 0x0001_0000)]), 15);
        assert_eq!(eval_scalar(Opcode::Cntlz, 0, I8, &[Live(I64, 1 << 40)]), 23);
    }

    #[test]
    fn test_vector_shifts() {
        let x = Vec128::from_lanes([1, 0x8000_0000, 0xF0, 3]);
        let counts = Vec128::from_lanes([1, 31, 36, 0]);
        let r = eval(Opcode::VectorShl, flags::vector(I32, 0), V128, &[V(x), V(counts)]);
        assert_eq!(r.lanes(), [2, 0, 0xF00, 3]);
        let r = eval(Opcode::VectorSha, flags::vector(I32, 0), V128, &[V(x), V(counts)]);
        assert_eq!(r.lanes(), [0, u32::MAX, 0xF, 3]);

        let r = eval(
            Opcode::VectorShr,
            flags::vector(I32, 0),
            V128,
            &[V(x), Const(Constant::Vec128(Vec128::splat(4)))],
        );
        assert_eq!(r.lanes(), [0, 0x0800_0000, 0xF, 0]);
        let halves = |lo: u8, hi: u8| Vec128::from_bytes(std::array::from_fn(|i| if i % 2 == 0 { lo } else { hi }));
        let r = eval(
            Opcode::VectorSha,
            flags::vector(I16, 0),
            V128,
            &[V(halves(0x00, 0x80)), Const(Constant::Vec128(halves(1, 0)))],
        );
        assert_eq!(r, halves(0x00, 0xC0));

        let bytes = Vec128::from_bytes([0x81; 16]);
        let r = eval(Opcode::VectorShl, flags::vector(I8, 0), V128, &[V(bytes), V(Vec128::from_bytes([9; 16]))]);
        assert_eq!(r, Vec128::from_bytes([0x02; 16]));
    }
}
