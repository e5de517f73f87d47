//! Emission paths, grouped by opcode family.
//!
//! Every path follows the same protocol: open a scope, bind the destination
//! and all sources, then emit. Binding comes first because materializing a
//! constant source clobbers rax and xmm0. Paths may assume a destination
//! never shares a register with a source of the same instruction.
//!
//! Narrow integer values (i8, i16, i32) live in 64-bit registers with
//! undefined upper bits; paths that depend on them extend explicitly.

/// Integer register-register instruction at width `$w`.
macro_rules! int_rr {
    ($e:ident, $w:expr, $mn:ident, $d:expr, $s:expr) => {
        match $w {
            Width::B8 => dynasm!($e.ops ; $mn Rb($d), Rb($s)),
            Width::B16 => dynasm!($e.ops ; $mn Rw($d), Rw($s)),
            Width::B32 => dynasm!($e.ops ; $mn Rd($d), Rd($s)),
            Width::B64 => dynasm!($e.ops ; $mn Rq($d), Rq($s)),
        }
    };
}

/// Integer register-immediate instruction; the immediate is truncated to
/// the width (sign-extended imm32 for 64-bit).
macro_rules! int_ri {
    ($e:ident, $w:expr, $mn:ident, $d:expr, $imm:expr) => {
        match $w {
            Width::B8 => dynasm!($e.ops ; $mn Rb($d), $imm as i8),
            Width::B16 => dynasm!($e.ops ; $mn Rw($d), $imm as i16),
            Width::B32 => dynasm!($e.ops ; $mn Rd($d), $imm as i32),
            Width::B64 => dynasm!($e.ops ; $mn Rq($d), $imm as i32),
        }
    };
}

/// Single-operand integer instruction.
macro_rules! int_r {
    ($e:ident, $w:expr, $mn:ident, $r:expr) => {
        match $w {
            Width::B8 => dynasm!($e.ops ; $mn Rb($r)),
            Width::B16 => dynasm!($e.ops ; $mn Rw($r)),
            Width::B32 => dynasm!($e.ops ; $mn Rd($r)),
            Width::B64 => dynasm!($e.ops ; $mn Rq($r)),
        }
    };
}

pub mod bitwise;
pub mod compare;
pub mod control;
pub mod convert;
pub mod math;
pub mod memory;
pub mod vector;

use super::table::LoweringTable;
use crate::error::LoweringError;
use crate::hir::{flags, Instr, TypeName, ValueId, Width};
use crate::x64::regs;
use crate::x64::{FrameLayout, X64Emitter};
use dynasmrt::{dynasm, DynasmApi};

pub(crate) const I8: TypeName = TypeName::Int8;
pub(crate) const I16: TypeName = TypeName::Int16;
pub(crate) const I32: TypeName = TypeName::Int32;
pub(crate) const I64: TypeName = TypeName::Int64;
pub(crate) const F32: TypeName = TypeName::Float32;
pub(crate) const F64: TypeName = TypeName::Float64;
pub(crate) const V128: TypeName = TypeName::Vec128;

/// Fill `table` with every family's rules.
pub(crate) fn register(table: &mut LoweringTable) {
    control::register(table);
    convert::register(table);
    memory::register(table);
    compare::register(table);
    math::register(table);
    bitwise::register(table);
    vector::register(table);
}

// ═══════════════════════════════════════════════════════════════════════════
// Operand helpers
// ═══════════════════════════════════════════════════════════════════════════

pub(crate) fn dest(i: &Instr) -> Result<ValueId, LoweringError> {
    i.dest
        .ok_or_else(|| LoweringError::invalid(i.opcode, "missing destination"))
}

pub(crate) fn src(i: &Instr, slot: usize) -> Result<ValueId, LoweringError> {
    i.src_value(slot)
        .ok_or_else(|| LoweringError::invalid(i.opcode, format!("src{} is not a value", slot + 1)))
}

pub(crate) fn offset(i: &Instr, slot: usize) -> Result<u64, LoweringError> {
    i.src_offset(slot)
        .ok_or_else(|| LoweringError::invalid(i.opcode, format!("src{} is not an offset", slot + 1)))
}

/// Integer width of `v`.
pub(crate) fn width(e: &X64Emitter<'_>, i: &Instr, v: ValueId) -> Result<Width, LoweringError> {
    let ty = e.value_type(v)?;
    ty.width()
        .ok_or_else(|| LoweringError::invalid(i.opcode, format!("{v} is {ty}, expected an integer")))
}

/// Constant `v` as a sign-extended imm32, when it fits.
pub(crate) fn imm32(e: &X64Emitter<'_>, v: ValueId) -> Option<i32> {
    e.constant(v)
        .and_then(|c| c.as_i64())
        .and_then(|x| i32::try_from(x).ok())
}

/// Vector element type carried in the flags.
pub(crate) fn element(i: &Instr) -> Result<TypeName, LoweringError> {
    flags::element(i.flags)
        .ok_or_else(|| LoweringError::invalid(i.opcode, format!("bad element tag {:#x}", i.flags)))
}

/// Refuse a path whose lane ordering has not been checked on hardware
/// unless the configuration opts in.
pub(crate) fn require_unverified(e: &X64Emitter<'_>, i: &Instr, detail: &str) -> Result<(), LoweringError> {
    if e.config().unverified_lane_order {
        Ok(())
    } else {
        Err(LoweringError::UnverifiedSequence {
            opcode: i.opcode,
            detail: detail.to_string(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Helper calls
// ═══════════════════════════════════════════════════════════════════════════

/// Argument of an out-of-line helper.
#[derive(Debug, Clone, Copy)]
pub(crate) enum HelperArg {
    /// Vector value, passed by pointer to a frame temp.
    Vector(ValueId),
    /// Integer value, passed in a register.
    Int(ValueId),
    Imm(u64),
}

/// Argument registers after the output pointer in rdi.
const HELPER_ARGS: [u8; 3] = [regs::RSI, regs::RDX, regs::RCX];

/// `helper(&out, args...)` with the 16-byte result written to the
/// destination. Operands are parked in frame temps before the call, since
/// the call clobbers every scope register.
pub(crate) fn call_helper(
    e: &mut X64Emitter<'_>,
    i: &Instr,
    helper: u64,
    args: &[HelperArg],
) -> Result<(), LoweringError> {
    if args.len() > HELPER_ARGS.len() {
        return Err(LoweringError::invalid(i.opcode, "too many helper arguments"));
    }
    let d = dest(i)?;
    let mut s = e.scope(i.opcode);
    for (n, arg) in args.iter().enumerate() {
        let temp = FrameLayout::temp(n + 1);
        match *arg {
            HelperArg::Vector(v) => {
                let r = s.src(v)?;
                dynasm!(s.ops ; movups [rsp + temp], Rx(r));
            }
            HelperArg::Int(v) => {
                let r = s.src(v)?;
                dynasm!(s.ops ; mov QWORD [rsp + temp], Rq(r));
            }
            HelperArg::Imm(_) => {}
        }
    }
    s.end()?;

    let out = FrameLayout::temp(0);
    dynasm!(e.ops ; lea rdi, [rsp + out]);
    for (n, (arg, &reg)) in args.iter().zip(HELPER_ARGS.iter()).enumerate() {
        let temp = FrameLayout::temp(n + 1);
        match *arg {
            HelperArg::Vector(_) => dynasm!(e.ops ; lea Rq(reg), [rsp + temp]),
            HelperArg::Int(_) => dynasm!(e.ops ; mov Rq(reg), QWORD [rsp + temp]),
            HelperArg::Imm(x) => dynasm!(e.ops ; mov Rq(reg), QWORD x as i64),
        }
    }
    e.call_native(helper);

    let mut s = e.scope(i.opcode);
    let r = s.dest(d)?;
    dynasm!(s.ops ; movups Rx(r), [rsp + out]);
    s.end()
}

#[cfg(test)]
pub(crate) mod testing;
