//! Lane movement: insert, extract, splat, swizzle, permute, pack.
//!
//! Indices and masks arrive in logical order and are mapped to physical
//! lanes with [`lanes`]. A variable lane index goes through a frame temp,
//! indexed by `count - 1 - (index % count)`.

use super::{call_helper, dest, offset, require_unverified, src, HelperArg, F32, I16, I32, I8};
use crate::error::LoweringError;
use crate::hir::{flags, Constant, Instr, Opcode, TypeName};
use crate::lowering::matcher::{Pat::{self, Any, Int, IntConst}, Shape};
use crate::lowering::table::{Flow, LoweringTable, Rule, ALL, VEC};
use crate::x64::{helpers, lanes, FrameLayout, X64Emitter};
use dynasmrt::{dynasm, DynasmApi};

pub(super) fn register(table: &mut LoweringTable) {
    table.add(
        Opcode::Insert,
        VEC,
        vec![
            Rule::new(Shape::new(Pat::Vec, Pat::Vec, IntConst, Any), "pinsr*", insert),
            Rule::new(Shape::new(Pat::Vec, Pat::Vec, Int, Any), "store lane", insert),
        ],
    );
    table.add(
        Opcode::Extract,
        ALL,
        vec![
            Rule::new(Shape::binary(Any, Pat::Vec, IntConst), "pextr*", extract),
            Rule::new(Shape::binary(Any, Pat::Vec, Int), "load lane", extract),
        ],
    );
    table.add(
        Opcode::Splat,
        VEC,
        vec![
            Rule::new(Shape::unary(Pat::Vec, Int), "movd; pshuf*", splat),
            Rule::new(Shape::unary(Pat::Vec, Pat::Float), "shufps 0", splat),
        ],
    );
    table.add(
        Opcode::Swizzle,
        VEC,
        vec![Rule::new(Shape::binary(Pat::Vec, Pat::Vec, Any), "pshufd", swizzle)],
    );
    table.add(
        Opcode::Permute,
        VEC,
        vec![
            Rule::new(Shape::new(Pat::Vec, Int, Pat::Vec, Pat::Vec), "call permute words", permute),
            Rule::new(Shape::new(Pat::Vec, Pat::Vec, Pat::Vec, Pat::Vec), "call permute bytes", permute),
        ],
    );
    table.add(
        Opcode::Pack,
        VEC,
        vec![Rule::new(Shape::new(Pat::Vec, Pat::Vec, Any, Pat::Absent), "call pack", pack)],
    );
    table.add(
        Opcode::Unpack,
        VEC,
        vec![Rule::new(Shape::unary(Pat::Vec, Pat::Vec), "call unpack", unpack)],
    );
    for opcode in [Opcode::LoadVectorShl, Opcode::LoadVectorShr] {
        table.add(
            opcode,
            VEC,
            vec![
                Rule::new(Shape::unary(Pat::Vec, IntConst), "constant control", load_vector_shift),
                Rule::new(Shape::unary(Pat::Vec, Int), "call control", load_vector_shift),
            ],
        );
    }
}

/// Element type moved by INSERT/EXTRACT.
fn lane_type(i: &Instr, ty: TypeName) -> Result<TypeName, LoweringError> {
    match ty.storage() {
        t @ (I8 | I16 | I32 | F32) => Ok(t),
        other => Err(LoweringError::invalid(i.opcode, format!("{other} lane"))),
    }
}

/// eax = physical lane of the logical index held in `index`.
fn physical_index(e: &mut X64Emitter<'_>, index: u8, count: i32) {
    dynasm!(e.ops
        ; mov eax, Rd(index)
        ; and eax, count - 1
        ; xor eax, count - 1
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Insert / extract
// ═══════════════════════════════════════════════════════════════════════════

fn insert(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let (v, index, value) = (src(i, 0)?, src(i, 1)?, src(i, 2)?);
    let elem = lane_type(i, e.value_type(value)?)?;
    let size = elem.size();
    let fixed = e
        .constant(index)
        .map(|c| lanes::physical_lane(c.bits() as u8, size) as i8);
    let temp = FrameLayout::temp(0);

    let mut s = e.scope(i.opcode);
    let a = s.src(v)?;
    let x = s.src(value)?;
    let n = match fixed {
        Some(_) => None,
        None => Some(s.src(index)?),
    };
    let d = s.dest(dest(i)?)?;
    match (fixed, n) {
        (Some(lane), _) => {
            dynasm!(s.ops ; movaps Rx(d), Rx(a));
            match elem {
                I8 => dynasm!(s.ops ; pinsrb Rx(d), Rd(x), lane),
                I16 => dynasm!(s.ops ; pinsrw Rx(d), Rd(x), lane),
                I32 => dynasm!(s.ops ; pinsrd Rx(d), Rd(x), lane),
                _ => dynasm!(s.ops ; insertps Rx(d), Rx(x), lane << 4),
            }
        }
        (None, Some(n)) => {
            physical_index(&mut s, n, (16 / size) as i32);
            dynasm!(s.ops ; movups [rsp + temp], Rx(a));
            match elem {
                I8 => dynasm!(s.ops ; mov BYTE [rsp + rax + temp], Rb(x)),
                I16 => dynasm!(s.ops ; mov WORD [rsp + rax * 2 + temp], Rw(x)),
                I32 => dynasm!(s.ops ; mov DWORD [rsp + rax * 4 + temp], Rd(x)),
                _ => dynasm!(s.ops ; movss DWORD [rsp + rax * 4 + temp], Rx(x)),
            }
            dynasm!(s.ops ; movups Rx(d), [rsp + temp]);
        }
        (None, None) => return Err(LoweringError::invalid(i.opcode, "missing lane index")),
    }
    s.end()?;
    Ok(Flow::Next)
}

fn extract(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let (v, index) = (src(i, 0)?, src(i, 1)?);
    let elem = lane_type(i, e.value_type(value)?)?;
    let size = elem.size();
    let fixed = e
        .constant(index)
        .map(|c| lanes::physical_lane(c.bits() as u8, size) as i8);
    let temp = FrameLayout::temp(0);

    let mut s = e.scope(i.opcode);
    let a = s.src(v)?;
    let n = match fixed {
        Some(_) => None,
        None => Some(s.src(index)?),
    };
    let d = s.dest(value)?;
    match (fixed, n) {
        (Some(lane), _) => match elem {
            I8 => dynasm!(s.ops ; pextrb Rd(d), Rx(a), lane),
            I16 => dynasm!(s.ops ; pextrw Rd(d), Rx(a), lane),
            I32 => dynasm!(s.ops ; pextrd Rd(d), Rx(a), lane),
            _ => dynasm!(s.ops ; pshufd Rx(d), Rx(a), lane),
        },
        (None, Some(n)) => {
            physical_index(&mut s, n, (16 / size) as i32);
            dynasm!(s.ops ; movups [rsp + temp], Rx(a));
            match elem {
                I8 => dynasm!(s.ops ; movzx Rd(d), BYTE [rsp + rax + temp]),
                I16 => dynasm!(s.ops ; movzx Rd(d), WORD [rsp + rax * 2 + temp]),
                I32 => dynasm!(s.ops ; mov Rd(d), DWORD [rsp + rax * 4 + temp]),
                _ => dynasm!(s.ops ; movss Rx(d), DWORD [rsp + rax * 4 + temp]),
            }
        }
        (None, None) => return Err(LoweringError::invalid(i.opcode, "missing lane index")),
    }
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Splat / swizzle
// ═══════════════════════════════════════════════════════════════════════════

fn splat(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let a = src(i, 0)?;
    let ty = e.value_type(a)?.storage();
    let mut s = e.scope(i.opcode);
    let r = s.src(a)?;
    let d = s.dest(dest(i)?)?;
    match ty {
        I8 => dynasm!(s.ops
            ; movd Rx(d), Rd(r)
            ; pxor xmm0, xmm0
            ; pshufb Rx(d), xmm0
        ),
        I16 => dynasm!(s.ops
            ; movd Rx(d), Rd(r)
            ; punpcklwd Rx(d), Rx(d)
            ; pshufd Rx(d), Rx(d), 0
        ),
        I32 => dynasm!(s.ops
            ; movd Rx(d), Rd(r)
            ; pshufd Rx(d), Rx(d), 0
        ),
        F32 => dynasm!(s.ops
            ; movaps Rx(d), Rx(r)
            ; shufps Rx(d), Rx(d), 0
        ),
        other => return Err(LoweringError::invalid(i.opcode, format!("cannot splat {other}"))),
    }
    s.end()?;
    Ok(Flow::Next)
}

/// src2 is a logical mask, two bits per destination lane, x lowest.
fn swizzle(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let mask = offset(i, 1)?;
    let imm = lanes::swizzle_immediate(mask as u8) as i8;
    let mut s = e.scope(i.opcode);
    let a = s.src(src(i, 0)?)?;
    let d = s.dest(dest(i)?)?;
    dynasm!(s.ops ; pshufd Rx(d), Rx(a), imm);
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Helper-backed
// ═══════════════════════════════════════════════════════════════════════════

/// An integer control picks whole 32-bit lanes; a vector control picks
/// bytes of the 32-byte concatenation.
fn permute(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let (control, a, b) = (src(i, 0)?, src(i, 1)?, src(i, 2)?);
    if e.value_type(control)?.is_int() {
        call_helper(
            e,
            i,
            helpers::permute_words_thunk as usize as u64,
            &[HelperArg::Int(control), HelperArg::Vector(a), HelperArg::Vector(b)],
        )?;
    } else {
        call_helper(
            e,
            i,
            helpers::permute_bytes_thunk as usize as u64,
            &[HelperArg::Vector(control), HelperArg::Vector(a), HelperArg::Vector(b)],
        )?;
    }
    Ok(Flow::Next)
}

fn pack_format(i: &Instr) -> Result<u64, LoweringError> {
    if i.flags > flags::PACK_TYPE_S16_IN_32_HI {
        return Err(LoweringError::invalid(i.opcode, format!("pack format {}", i.flags)));
    }
    Ok(i.flags as u64)
}

/// The saturating formats narrow src1 and src2 together; the others only
/// read src1.
fn pack(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    require_unverified(e, i, "pack lane placement")?;
    let format = pack_format(i)?;
    let a = src(i, 0)?;
    let b = i.src_value(1).unwrap_or(a);
    call_helper(
        e,
        i,
        helpers::pack_thunk as usize as u64,
        &[HelperArg::Vector(a), HelperArg::Vector(b), HelperArg::Imm(format)],
    )?;
    Ok(Flow::Next)
}

fn unpack(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    require_unverified(e, i, "unpack lane placement")?;
    let format = pack_format(i)?;
    let a = src(i, 0)?;
    call_helper(
        e,
        i,
        helpers::unpack_thunk as usize as u64,
        &[HelperArg::Vector(a), HelperArg::Imm(format)],
    )?;
    Ok(Flow::Next)
}

/// PERMUTE control for a 16-byte shift of a 32-byte concatenation. A
/// constant amount is folded into a vector constant.
fn load_vector_shift(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let left = i.opcode == Opcode::LoadVectorShl;
    let amount = src(i, 0)?;
    if let Some(c) = e.constant(amount) {
        let sh = c.bits() as u8;
        let control = if left {
            helpers::load_vector_shl(sh)
        } else {
            helpers::load_vector_shr(sh)
        };
        let mut s = e.scope(i.opcode);
        let d = s.dest(dest(i)?)?;
        s.load_constant_xmm(d, &Constant::Vec128(control));
        s.end()?;
        return Ok(Flow::Next);
    }
    let helper = if left {
        helpers::load_vector_shl_thunk as usize as u64
    } else {
        helpers::load_vector_shr_thunk as usize as u64
    };
    call_helper(e, i, helper, &[HelperArg::Int(amount)])?;
    Ok(Flow::Next)
}
