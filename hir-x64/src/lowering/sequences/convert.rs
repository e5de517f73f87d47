//! Moves, extensions, truncations and numeric conversions.

use super::{call_helper, dest, src, width, HelperArg, F32, F64, I16, I32, I64, I8, V128};
use crate::error::LoweringError;
use crate::hir::{flags, Instr, Opcode, TypeName, Width};
use crate::lowering::matcher::Pat::{self, Float, Int, Ty, Val};
use crate::lowering::matcher::Shape;
use crate::lowering::table::{Flow, LoweringTable, Rule, ALL, FLOAT_VEC, INT, VEC};
use crate::x64::helpers;
use crate::x64::X64Emitter;
use dynasmrt::{dynasm, DynasmApi};

pub(super) fn register(table: &mut LoweringTable) {
    table.add(
        Opcode::Assign,
        ALL,
        vec![
            Rule::new(Shape::unary(Int, Int), "mov", assign_int),
            Rule::new(Shape::unary(Float, Float), "movaps", assign_xmm),
            Rule::new(Shape::unary(Pat::Vec, Pat::Vec), "movaps", assign_xmm),
        ],
    );
    table.add(
        Opcode::Cast,
        ALL,
        vec![
            Rule::new(Shape::unary(Ty(I32), Val(F32)), "movd r32, xmm", cast_to_int),
            Rule::new(Shape::unary(Ty(I64), Val(F64)), "movq r64, xmm", cast_to_int),
            Rule::new(Shape::unary(Ty(F32), Val(I32)), "movd xmm, r32", cast_to_float),
            Rule::new(Shape::unary(Ty(F64), Val(I64)), "movq xmm, r64", cast_to_float),
            Rule::new(Shape::unary(Int, Int), "mov", assign_int),
            Rule::new(Shape::unary(Pat::Vec, Pat::Vec), "movaps", assign_xmm),
        ],
    );

    table.add(
        Opcode::ZeroExtend,
        INT,
        vec![
            Rule::new(Shape::unary(Ty(I16), Val(I8)), "movzx r16, r8", zero_extend),
            Rule::new(Shape::unary(Ty(I32), Val(I8)), "movzx r32, r8", zero_extend),
            Rule::new(Shape::unary(Ty(I32), Val(I16)), "movzx r32, r16", zero_extend),
            Rule::new(Shape::unary(Ty(I64), Val(I8)), "movzx r64, r8", zero_extend),
            Rule::new(Shape::unary(Ty(I64), Val(I16)), "movzx r64, r16", zero_extend),
            Rule::new(Shape::unary(Ty(I64), Val(I32)), "mov r32, r32", zero_extend),
        ],
    );
    table.add(
        Opcode::SignExtend,
        INT,
        vec![
            Rule::new(Shape::unary(Ty(I16), Val(I8)), "movsx r16, r8", sign_extend),
            Rule::new(Shape::unary(Ty(I32), Val(I8)), "movsx r32, r8", sign_extend),
            Rule::new(Shape::unary(Ty(I32), Val(I16)), "movsx r32, r16", sign_extend),
            Rule::new(Shape::unary(Ty(I64), Val(I8)), "movsx r64, r8", sign_extend),
            Rule::new(Shape::unary(Ty(I64), Val(I16)), "movsx r64, r16", sign_extend),
            Rule::new(Shape::unary(Ty(I64), Val(I32)), "movsxd r64, r32", sign_extend),
        ],
    );
    table.add(
        Opcode::Truncate,
        INT,
        vec![
            Rule::new(Shape::unary(Ty(I8), Val(I16)), "mov r8, r16", truncate),
            Rule::new(Shape::unary(Ty(I8), Val(I32)), "mov r8, r32", truncate),
            Rule::new(Shape::unary(Ty(I8), Val(I64)), "mov r8, r64", truncate),
            Rule::new(Shape::unary(Ty(I16), Val(I32)), "mov r16, r32", truncate),
            Rule::new(Shape::unary(Ty(I16), Val(I64)), "mov r16, r64", truncate),
            Rule::new(Shape::unary(Ty(I32), Val(I64)), "mov r32, r64", truncate),
        ],
    );

    table.add(
        Opcode::Convert,
        ALL,
        vec![
            Rule::new(Shape::unary(Ty(F64), Val(F32)), "cvtss2sd", convert_float),
            Rule::new(Shape::unary(Ty(F32), Val(F64)), "cvtsd2ss", convert_float),
            Rule::new(Shape::unary(Float, Int), "cvtsi2s*", convert_int_to_float),
            Rule::new(Shape::unary(Int, Float), "cvtts*2si", convert_float_to_int),
        ],
    );
    table.add(
        Opcode::Round,
        FLOAT_VEC,
        vec![
            Rule::new(Shape::unary(Ty(F32), Val(F32)), "roundss", round),
            Rule::new(Shape::unary(Ty(F64), Val(F64)), "roundsd", round),
            Rule::new(Shape::unary(Ty(V128), Val(V128)), "roundps", round),
        ],
    );
    table.add(
        Opcode::VectorConvertI2F,
        VEC,
        vec![Rule::new(Shape::unary(Ty(V128), Val(V128)), "cvtdq2ps", vector_i2f)],
    );
    table.add(
        Opcode::VectorConvertF2I,
        VEC,
        vec![Rule::new(Shape::unary(Ty(V128), Val(V128)), "cvttps2dq", vector_f2i)],
    );
}

/// roundss/roundsd/roundps immediate for a ROUND_* flag, with the
/// precision exception suppressed.
fn round_immediate(round_flags: u32) -> i8 {
    let mode = match round_flags & flags::ROUND_MASK {
        flags::ROUND_TO_NEAREST => 0,
        flags::ROUND_TO_MINUS_INFINITY => 1,
        flags::ROUND_TO_POSITIVE_INFINITY => 2,
        _ => 3,
    };
    mode | 0x8
}

// ═══════════════════════════════════════════════════════════════════════════
// Moves
// ═══════════════════════════════════════════════════════════════════════════

fn assign_int(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    dynasm!(s.ops ; mov Rq(d), Rq(a));
    s.end()?;
    Ok(Flow::Next)
}

fn assign_xmm(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    dynasm!(s.ops ; movaps Rx(d), Rx(a));
    s.end()?;
    Ok(Flow::Next)
}

fn cast_to_int(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let wide = e.value_type(dest(i)?)? == I64;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    if wide {
        dynasm!(s.ops ; movq Rq(d), Rx(a));
    } else {
        dynasm!(s.ops ; movd Rd(d), Rx(a));
    }
    s.end()?;
    Ok(Flow::Next)
}

fn cast_to_float(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let wide = e.value_type(dest(i)?)? == F64;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    if wide {
        dynasm!(s.ops ; movq Rx(d), Rq(a));
    } else {
        dynasm!(s.ops ; movd Rx(d), Rd(a));
    }
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Width changes
// ═══════════════════════════════════════════════════════════════════════════

fn zero_extend(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let from = width(e, i, src(i, 0)?)?;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    // 32-bit writes clear bits 32-63, so every form yields a full zero
    // extension regardless of the destination width
    match from {
        Width::B8 => dynasm!(s.ops ; movzx Rd(d), Rb(a)),
        Width::B16 => dynasm!(s.ops ; movzx Rd(d), Rw(a)),
        Width::B32 | Width::B64 => dynasm!(s.ops ; mov Rd(d), Rd(a)),
    }
    s.end()?;
    Ok(Flow::Next)
}

fn sign_extend(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let from = width(e, i, src(i, 0)?)?;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    match from {
        Width::B8 => dynasm!(s.ops ; movsx Rq(d), Rb(a)),
        Width::B16 => dynasm!(s.ops ; movsx Rq(d), Rw(a)),
        Width::B32 => dynasm!(s.ops ; movsxd Rq(d), Rd(a)),
        Width::B64 => dynasm!(s.ops ; mov Rq(d), Rq(a)),
    }
    s.end()?;
    Ok(Flow::Next)
}

fn truncate(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let to = width(e, i, dest(i)?)?;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    int_rr!(s, to, mov, d, a);
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Numeric conversions
// ═══════════════════════════════════════════════════════════════════════════

fn convert_float(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let to_double = e.value_type(dest(i)?)? == F64;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    if to_double {
        dynasm!(s.ops ; cvtss2sd Rx(d), Rx(a));
    } else {
        dynasm!(s.ops ; cvtsd2ss Rx(d), Rx(a));
    }
    s.end()?;
    Ok(Flow::Next)
}

/// Signed integer to float. The source is sign-extended to 64 bits in rax
/// first so every width shares the 64-bit form.
fn convert_int_to_float(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let from = width(e, i, src(i, 0)?)?;
    let to_double = e.value_type(dest(i)?)? == F64;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    match from {
        Width::B8 => dynasm!(s.ops ; movsx rax, Rb(a)),
        Width::B16 => dynasm!(s.ops ; movsx rax, Rw(a)),
        Width::B32 => dynasm!(s.ops ; movsxd rax, Rd(a)),
        Width::B64 => dynasm!(s.ops ; mov rax, Rq(a)),
    }
    dynasm!(s.ops ; xorps Rx(d), Rx(d));
    if to_double {
        dynasm!(s.ops ; cvtsi2sd Rx(d), rax);
    } else {
        dynasm!(s.ops ; cvtsi2ss Rx(d), rax);
    }
    s.end()?;
    Ok(Flow::Next)
}

/// Float to signed integer using the flag's rounding mode. Results
/// narrower than 32 bits keep the low bits of the 32-bit conversion.
fn convert_float_to_int(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let to = width(e, i, dest(i)?)?;
    let double = e.value_type(src(i, 0)?)? == F64;
    let mode = i.flags & flags::ROUND_MASK;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    let imm = round_immediate(mode);
    match (double, mode == flags::ROUND_TO_ZERO) {
        (false, true) => dynasm!(s.ops ; movaps xmm0, Rx(a)),
        (true, true) => dynasm!(s.ops ; movapd xmm0, Rx(a)),
        (false, false) => dynasm!(s.ops ; roundss xmm0, Rx(a), imm),
        (true, false) => dynasm!(s.ops ; roundsd xmm0, Rx(a), imm),
    }
    match (double, to == Width::B64) {
        (false, false) => dynasm!(s.ops ; cvttss2si Rd(d), xmm0),
        (false, true) => dynasm!(s.ops ; cvttss2si Rq(d), xmm0),
        (true, false) => dynasm!(s.ops ; cvttsd2si Rd(d), xmm0),
        (true, true) => dynasm!(s.ops ; cvttsd2si Rq(d), xmm0),
    }
    s.end()?;
    Ok(Flow::Next)
}

fn round(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let ty = e.value_type(dest(i)?)?;
    let imm = round_immediate(i.flags);
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    match ty {
        TypeName::Float32 => dynasm!(s.ops ; roundss Rx(d), Rx(a), imm),
        TypeName::Float64 => dynasm!(s.ops ; roundsd Rx(d), Rx(a), imm),
        _ => dynasm!(s.ops ; roundps Rx(d), Rx(a), imm),
    }
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Vector conversions
// ═══════════════════════════════════════════════════════════════════════════

/// 2^16 as an f32 bit pattern.
const F32_65536: i32 = 0x4780_0000;

fn vector_i2f(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let unsigned = flags::is_unsigned(i.flags);
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    if unsigned {
        // hi16 * 65536 + lo16; both halves convert exactly
        dynasm!(s.ops
            ; movaps xmm0, Rx(a)
            ; psrld xmm0, 16
            ; cvtdq2ps xmm0, xmm0
            ; mov eax, F32_65536
            ; movd Rx(d), eax
            ; pshufd Rx(d), Rx(d), 0
            ; mulps xmm0, Rx(d)
            ; movaps Rx(d), Rx(a)
            ; pslld Rx(d), 16
            ; psrld Rx(d), 16
            ; cvtdq2ps Rx(d), Rx(d)
            ; addps Rx(d), xmm0
        );
    } else {
        dynasm!(s.ops ; cvtdq2ps Rx(d), Rx(a));
    }
    s.end()?;
    Ok(Flow::Next)
}

/// Plain signed conversion truncates inline; saturating or unsigned
/// conversions go through a helper.
fn vector_f2i(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    if flags::is_unsigned(i.flags) || flags::is_saturate(i.flags) {
        let thunk = helpers::vector_f2i_thunk as usize as u64;
        call_helper(
            e,
            i,
            thunk,
            &[HelperArg::Vector(src(i, 0)?), HelperArg::Imm(i.flags as u64)],
        )?;
        return Ok(Flow::Next);
    }
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    dynasm!(s.ops ; cvttps2dq Rx(d), Rx(a));
    s.end()?;
    Ok(Flow::Next)
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::super::testing::{eval, eval_scalar, try_compile, Arg};
    use crate::error::LoweringError;
    use crate::hir::{flags, Constant, FunctionBuilder, Opcode, TypeName, Vec128};

    use Arg::{Const, Live};
    use TypeName::{Float32 as F32, Float64 as F64, Int16 as I16, Int32 as I32, Int64 as I64, Int8 as I8};

    fn f64_bits(x: f64) -> u64 {
        x.to_bits()
    }

    #[test]
    fn test_extend_forms_per_width() {
        assert_eq!(eval_scalar(Opcode::ZeroExtend, 0, I64, &[Live(I8, 0xF0)]), 0xF0);
        assert_eq!(eval_scalar(Opcode::ZeroExtend, 0, I32, &[Live(I16, 0x8001)]), 0x8001);
        assert_eq!(eval_scalar(Opcode::ZeroExtend, 0, I64, &[Live(I32, 0xFFFF_FFFF)]), 0xFFFF_FFFF);
        assert_eq!(eval_scalar(Opcode::SignExtend, 0, I64, &[Live(I8, 0xF0)]), 0xFFFF_FFFF_FFFF_FFF0);
        assert_eq!(eval_scalar(Opcode::SignExtend, 0, I16, &[Live(I8, 0x80)]), 0xFF80);
        assert_eq!(
            eval_scalar(Opcode::SignExtend, 0, I64, &[Live(I32, 0x8000_0000)]),
            0xFFFF_FFFF_8000_0000
        );
        assert_eq!(eval_scalar(Opcode::SignExtend, 0, I32, &[Const(Constant::Int16(-3))]), (-3i32) as u32 as u64);
    }

    #[test]
    fn test_truncate_keeps_low_bits() {
        let x = 0x1122_3344_5566_7788;
        assert_eq!(eval_scalar(Opcode::Truncate, 0, I16, &[Live(I64, x)]), 0x7788);
        assert_eq!(eval_scalar(Opcode::Truncate, 0, I8, &[Live(I32, 0x1234_56AB)]), 0xAB);
        assert_eq!(eval_scalar(Opcode::Truncate, 0, I32, &[Live(I64, x)]), 0x5566_7788);
    }

    #[test]
    fn test_extend_to_narrower_is_unimplemented() {
        let mut b = FunctionBuilder::new("bad_extend");
        let x = b.load_context(0, TypeName::Int64);
        let y = b.convert(Opcode::ZeroExtend, x, TypeName::Int8);
        b.store_context(8, y);
        b.ret();
        let err = try_compile(&b.finish()).unwrap_err();
        match err {
            LoweringError::UnimplementedOpcode { opcode, signature } => {
                assert_eq!(opcode, Opcode::ZeroExtend);
                assert_eq!(signature, "i8 <- i64");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_int_float_conversions() {
        let r = eval_scalar(Opcode::Convert, 0, F64, &[Live(I32, (-7i32) as u32 as u64)]);
        assert_eq!(r, f64_bits(-7.0));
        let r = eval_scalar(Opcode::Convert, 0, F32, &[Live(I8, 0xFE)]);
        assert_eq!(r, (-2.0f32).to_bits() as u64);

        let conv = |x: f64, mode| {
            eval_scalar(Opcode::Convert, mode, I32, &[Live(F64, f64_bits(x))]) as u32 as i32
        };
        assert_eq!(conv(-2.7, flags::ROUND_TO_ZERO), -2);
        assert_eq!(conv(2.5, flags::ROUND_TO_NEAREST), 2);
        assert_eq!(conv(-2.2, flags::ROUND_TO_MINUS_INFINITY), -3);
        assert_eq!(conv(2.2, flags::ROUND_TO_POSITIVE_INFINITY), 3);

        let big = eval_scalar(Opcode::Convert, 0, I64, &[Live(F32, ((1u64 << 40) as f32).to_bits() as u64)]);
        assert_eq!(big, 1 << 40);
    }

    #[test]
    fn test_float_width_conversions() {
        let r = eval_scalar(Opcode::Convert, 0, F64, &[Live(F32, 1.5f32.to_bits() as u64)]);
        assert_eq!(r, f64_bits(1.5));
        let r = eval_scalar(Opcode::Convert, 0, F32, &[Live(F64, f64_bits(0.25))]);
        assert_eq!(r, 0.25f32.to_bits() as u64);
    }

    #[test]
    fn test_cast_reinterprets_bits() {
        assert_eq!(eval_scalar(Opcode::Cast, 0, I32, &[Live(F32, 0x3F80_0000)]), 0x3F80_0000);
        let r = eval_scalar(Opcode::Cast, 0, F64, &[Const(Constant::Int64(0x4000_0000_0000_0000))]);
        assert_eq!(f64::from_bits(r), 2.0);
    }

    #[test]
    fn test_round_modes() {
        let round = |x: f64, mode| f64::from_bits(eval_scalar(Opcode::Round, mode, F64, &[Live(F64, f64_bits(x))]));
        assert_eq!(round(1.1, flags::ROUND_TO_POSITIVE_INFINITY), 2.0);
        assert_eq!(round(-1.1, flags::ROUND_TO_ZERO), -1.0);
        assert_eq!(round(3.5, flags::ROUND_TO_NEAREST), 4.0);

        let v = Vec128::from_f32_lanes([1.5, -1.5, 2.7, -0.2]);
        let r = eval(Opcode::Round, flags::ROUND_TO_MINUS_INFINITY, TypeName::Vec128, &[Arg::Vec(v)]);
        assert_eq!(r.f32_lanes(), [1.0, -2.0, 2.0, -1.0]);
    }

    #[test]
    fn test_vector_int_float_conversions() {
        let ints = Vec128::from_lanes([(-1i32) as u32, 2, 0xFFFF_FFFF, 0x8000_0000]);
        let signed = eval(Opcode::VectorConvertI2F, 0, TypeName::Vec128, &[Arg::Vec(ints)]);
        assert_eq!(signed.f32_lanes(), [-1.0, 2.0, -1.0, -2147483648.0]);
        let unsigned = eval(
            Opcode::VectorConvertI2F,
            flags::ARITHMETIC_UNSIGNED,
            TypeName::Vec128,
            &[Arg::Vec(ints)],
        );
        assert_eq!(unsigned.f32_lanes(), [4294967296.0, 2.0, 4294967296.0, 2147483648.0]);

        let floats = Vec128::from_f32_lanes([1.9, -1.9, 3e9, f32::NAN]);
        let plain = eval(Opcode::VectorConvertF2I, 0, TypeName::Vec128, &[Arg::Vec(floats)]);
        assert_eq!(plain.lanes(), [1, (-1i32) as u32, 0x8000_0000, 0x8000_0000]);
        let saturated = eval(
            Opcode::VectorConvertF2I,
            flags::ARITHMETIC_SATURATE,
            TypeName::Vec128,
            &[Arg::Vec(floats)],
        );
        assert_eq!(saturated.lanes(), [1, (-1i32) as u32, i32::MAX as u32, 0]);
    }
}
