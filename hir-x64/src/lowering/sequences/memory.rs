//! Context and guest memory accesses, MMIO redirection and atomics.
//!
//! Context accesses address `[rdi + offset]`. Guest accesses compute
//! `rcx = membase + zero-extended low 32 bits of the address` and go
//! through `[rcx]`; the flat buffer holds guest values in the byte order the
//! HIR already uses, so plain moves suffice. Only values handed to an
//! [`AccessDescriptor`] are byte-swapped at the access width.

use super::{dest, offset, src, width};
use crate::error::LoweringError;
use crate::hir::{Constant, Instr, Opcode, TypeName, ValueId, Width};
use crate::lowering::matcher::Pat::{self, Absent, Any, Float, FloatConst, Int, IntConst, VecConst};
use crate::lowering::matcher::Shape;
use crate::lowering::table::{Flow, LoweringTable, Rule, ALL, INT};
use crate::runtime::thunks;
use crate::runtime::{AccessDescriptor, TraceKind};
use crate::x64::regs;
use crate::x64::tracers::TraceAddress;
use crate::x64::X64Emitter;
use dynasmrt::{dynasm, DynasmApi};

pub(super) fn register(table: &mut LoweringTable) {
    table.add(
        Opcode::LoadClock,
        INT,
        vec![Rule::new(Shape::new(Int, Absent, Absent, Absent), "call clock", load_clock)],
    );

    table.add(
        Opcode::LoadContext,
        ALL,
        vec![
            Rule::new(Shape::unary(Int, Any), "mov r, [ctx]", load_context),
            Rule::new(Shape::unary(Float, Any), "movs* xmm, [ctx]", load_context),
            Rule::new(Shape::unary(Pat::Vec, Any), "movups xmm, [ctx]", load_context),
        ],
    );
    table.add(
        Opcode::StoreContext,
        ALL,
        vec![
            Rule::new(Shape::binary(Absent, Any, IntConst), "mov [ctx], imm", store_context_constant),
            Rule::new(Shape::binary(Absent, Any, FloatConst), "mov [ctx], imm", store_context_constant),
            Rule::new(Shape::binary(Absent, Any, VecConst), "mov [ctx], imm64 x2", store_context_constant),
            Rule::new(Shape::binary(Absent, Any, Int), "mov [ctx], r", store_context),
            Rule::new(Shape::binary(Absent, Any, Float), "movs* [ctx], xmm", store_context),
            Rule::new(Shape::binary(Absent, Any, Pat::Vec), "movups [ctx], xmm", store_context),
        ],
    );

    table.add(
        Opcode::Load,
        ALL,
        vec![
            Rule::new(Shape::unary(Int, Int), "mov r, [mem]", load),
            Rule::new(Shape::unary(Float, Int), "movs* xmm, [mem]", load),
            Rule::new(Shape::unary(Pat::Vec, Int), "movups xmm, [mem]", load),
        ],
    );
    table.add(
        Opcode::Store,
        ALL,
        vec![
            Rule::new(Shape::binary(Absent, Int, IntConst), "mov [mem], imm", store),
            Rule::new(Shape::binary(Absent, Int, FloatConst), "mov [mem], imm", store),
            Rule::new(Shape::binary(Absent, Int, VecConst), "mov [mem], imm64 x2", store),
            Rule::new(Shape::binary(Absent, Int, Int), "mov [mem], r", store),
            Rule::new(Shape::binary(Absent, Int, Float), "movs* [mem], xmm", store),
            Rule::new(Shape::binary(Absent, Int, Pat::Vec), "movups [mem], xmm", store),
        ],
    );
    table.add(
        Opcode::Prefetch,
        INT,
        vec![Rule::new(Shape::unary(Absent, Int), "prefetcht0", prefetch)],
    );

    table.add(
        Opcode::CompareExchange,
        INT,
        vec![Rule::new(Shape::new(Int, Int, Int, Int), "lock cmpxchg", compare_exchange)],
    );
    table.add(
        Opcode::AtomicExchange,
        INT,
        vec![Rule::new(Shape::binary(Int, Int, Int), "xchg", atomic_exchange)],
    );
    table.add(
        Opcode::AtomicAdd,
        INT,
        vec![Rule::new(Shape::binary(Int, Int, Int), "lock xadd", atomic_add)],
    );
    table.add(
        Opcode::AtomicSub,
        INT,
        vec![Rule::new(Shape::binary(Int, Int, Int), "neg; lock xadd", atomic_sub)],
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Access forms
// ═══════════════════════════════════════════════════════════════════════════

/// Load a value of type `ty` from `[base + disp]` into `d`.
fn emit_load(e: &mut X64Emitter<'_>, ty: TypeName, d: u8, base: u8, disp: i32) {
    match ty.storage() {
        TypeName::Int8 => dynasm!(e.ops ; mov Rb(d), BYTE [Rq(base) + disp]),
        TypeName::Int16 => dynasm!(e.ops ; mov Rw(d), WORD [Rq(base) + disp]),
        TypeName::Int32 => dynasm!(e.ops ; mov Rd(d), DWORD [Rq(base) + disp]),
        TypeName::Int64 => dynasm!(e.ops ; mov Rq(d), QWORD [Rq(base) + disp]),
        TypeName::Float32 => dynasm!(e.ops ; movss Rx(d), DWORD [Rq(base) + disp]),
        TypeName::Float64 => dynasm!(e.ops ; movsd Rx(d), QWORD [Rq(base) + disp]),
        _ => dynasm!(e.ops ; movups Rx(d), [Rq(base) + disp]),
    }
}

/// Store register `v` holding a value of type `ty` to `[base + disp]`.
fn emit_store(e: &mut X64Emitter<'_>, ty: TypeName, v: u8, base: u8, disp: i32) {
    match ty.storage() {
        TypeName::Int8 => dynasm!(e.ops ; mov BYTE [Rq(base) + disp], Rb(v)),
        TypeName::Int16 => dynasm!(e.ops ; mov WORD [Rq(base) + disp], Rw(v)),
        TypeName::Int32 => dynasm!(e.ops ; mov DWORD [Rq(base) + disp], Rd(v)),
        TypeName::Int64 => dynasm!(e.ops ; mov QWORD [Rq(base) + disp], Rq(v)),
        TypeName::Float32 => dynasm!(e.ops ; movss DWORD [Rq(base) + disp], Rx(v)),
        TypeName::Float64 => dynasm!(e.ops ; movsd QWORD [Rq(base) + disp], Rx(v)),
        _ => dynasm!(e.ops ; movups [Rq(base) + disp], Rx(v)),
    }
}

/// 64-bit immediate store: one sign-extended imm32 when it fits, two
/// dword stores otherwise.
fn emit_store_qword(e: &mut X64Emitter<'_>, bits: u64, base: u8, disp: i32) {
    match i32::try_from(bits as i64) {
        Ok(imm) => dynasm!(e.ops ; mov QWORD [Rq(base) + disp], imm),
        Err(_) => {
            let (lo, hi) = (bits as u32 as i32, (bits >> 32) as u32 as i32);
            dynasm!(e.ops
                ; mov DWORD [Rq(base) + disp], lo
                ; mov DWORD [Rq(base) + disp + 4], hi
            );
        }
    }
}

/// Store a constant without materializing it in a register.
fn emit_store_constant(e: &mut X64Emitter<'_>, constant: &Constant, base: u8, disp: i32) {
    let bits = constant.bits();
    match *constant {
        Constant::Int8(_) | Constant::Bool(_) => dynasm!(e.ops ; mov BYTE [Rq(base) + disp], bits as u8 as i8),
        Constant::Int16(_) => dynasm!(e.ops ; mov WORD [Rq(base) + disp], bits as u16 as i16),
        Constant::Int32(_) | Constant::Float32(_) => {
            dynasm!(e.ops ; mov DWORD [Rq(base) + disp], bits as u32 as i32)
        }
        Constant::Int64(_) | Constant::Float64(_) => emit_store_qword(e, bits, base, disp),
        Constant::Vec128(v) => {
            emit_store_qword(e, v.low, base, disp);
            emit_store_qword(e, v.high, base, disp + 8);
        }
    }
}

fn context_offset(i: &Instr) -> Result<i32, LoweringError> {
    let off = offset(i, 0)?;
    i32::try_from(off).map_err(|_| LoweringError::invalid(i.opcode, format!("context offset {off:#x} out of range")))
}

/// `rcx = membase + (address & 0xFFFF_FFFF)`. `a` is the bound address
/// register, or `None` for a constant address.
fn guest_address(e: &mut X64Emitter<'_>, a: Option<u8>, constant: u64) {
    match a {
        Some(a) => dynasm!(e.ops ; mov ecx, Rd(a)),
        None => dynasm!(e.ops ; mov ecx, constant as u32 as i32),
    }
    dynasm!(e.ops ; add rcx, rsi);
}

/// Address operand, with its value when it is a constant.
fn address_operand(e: &X64Emitter<'_>, i: &Instr) -> Result<(ValueId, Option<u64>), LoweringError> {
    let addr = src(i, 0)?;
    Ok((addr, e.constant(addr).map(|c| c.bits())))
}

fn trace_address(addr: ValueId, constant: Option<u64>) -> TraceAddress {
    match constant {
        Some(a) => TraceAddress::Immediate(a & 0xFFFF_FFFF),
        None => TraceAddress::Value(addr),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Clock and context
// ═══════════════════════════════════════════════════════════════════════════

fn load_clock(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let runtime = e.runtime_ptr();
    dynasm!(e.ops ; mov rdi, QWORD runtime);
    e.call_native(thunks::load_clock_thunk as usize as u64);
    let mut s = e.scope(i.opcode);
    let d = s.dest(dest(i)?)?;
    dynasm!(s.ops ; mov Rq(d), rax);
    s.end()?;
    Ok(Flow::Next)
}

fn load_context(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let off = context_offset(i)?;
    let value = dest(i)?;
    let ty = e.value_type(value)?;
    let mut s = e.scope(i.opcode);
    let d = s.dest(value)?;
    emit_load(&mut s, ty, d, regs::CONTEXT, off);
    s.end()?;
    if e.config().trace_data {
        e.trace_access(i.opcode, TraceKind::ContextLoad, TraceAddress::Immediate(off as u64), value)?;
    }
    Ok(Flow::Next)
}

fn store_context(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let off = context_offset(i)?;
    let value = src(i, 1)?;
    let ty = e.value_type(value)?;
    let mut s = e.scope(i.opcode);
    let v = s.src(value)?;
    emit_store(&mut s, ty, v, regs::CONTEXT, off);
    s.end()?;
    if e.config().trace_data {
        e.trace_access(i.opcode, TraceKind::ContextStore, TraceAddress::Immediate(off as u64), value)?;
    }
    Ok(Flow::Next)
}

fn store_context_constant(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let off = context_offset(i)?;
    let value = src(i, 1)?;
    let constant = e
        .constant(value)
        .ok_or_else(|| LoweringError::invalid(i.opcode, "expected a constant value"))?;
    emit_store_constant(e, &constant, regs::CONTEXT, off);
    if e.config().trace_data {
        e.trace_access(i.opcode, TraceKind::ContextStore, TraceAddress::Immediate(off as u64), value)?;
    }
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Guest memory
// ═══════════════════════════════════════════════════════════════════════════

/// Descriptor intercepting a constant address, if any. Only integer
/// accesses may be redirected.
fn intercept<'r>(
    e: &X64Emitter<'r>,
    i: &Instr,
    address: Option<u64>,
    ty: TypeName,
) -> Result<Option<(&'r AccessDescriptor, Width)>, LoweringError> {
    let Some(address) = address else {
        return Ok(None);
    };
    let Some(descriptor) = e.runtime().access_chain().find(address) else {
        return Ok(None);
    };
    match ty.width() {
        Some(w) => {
            log::trace!("[MMIO] {} {:#x} -> '{}'", i.opcode, address, descriptor.name());
            Ok(Some((descriptor, w)))
        }
        None => Err(LoweringError::invalid(
            i.opcode,
            format!("{ty} access to intercepted address {address:#x} ('{}')", descriptor.name()),
        )),
    }
}

/// Byte-swap the low `w` bytes of `reg` in place.
fn swap_bytes(e: &mut X64Emitter<'_>, w: Width, reg: u8) {
    match w {
        Width::B8 => {}
        Width::B16 => dynasm!(e.ops ; rol Rw(reg), 8),
        Width::B32 => dynasm!(e.ops ; bswap Rd(reg)),
        Width::B64 => dynasm!(e.ops ; bswap Rq(reg)),
    }
}

fn load(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = dest(i)?;
    let ty = e.value_type(value)?;
    let (addr, constant) = address_operand(e, i)?;

    if let (Some(address), Some((descriptor, w))) = (constant, intercept(e, i, constant, ty)?) {
        let descriptor = descriptor as *const AccessDescriptor as i64;
        dynasm!(e.ops
            ; mov rdi, QWORD descriptor
            ; mov rsi, QWORD address as i64
        );
        e.call_native(thunks::access_read_thunk as usize as u64);
        swap_bytes(e, w, regs::RAX);
        let mut s = e.scope(i.opcode);
        let d = s.dest(value)?;
        dynasm!(s.ops ; mov Rq(d), rax);
        s.end()?;
        e.stats.mmio_redirections += 1;
    } else {
        let mut s = e.scope(i.opcode);
        let a = match constant {
            Some(_) => None,
            None => Some(s.src(addr)?),
        };
        let d = s.dest(value)?;
        guest_address(&mut s, a, constant.unwrap_or(0));
        emit_load(&mut s, ty, d, regs::RCX, 0);
        s.end()?;
    }

    if e.config().trace_data {
        e.trace_access(i.opcode, TraceKind::MemoryLoad, trace_address(addr, constant), value)?;
    }
    Ok(Flow::Next)
}

fn store(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let value = src(i, 1)?;
    let ty = e.value_type(value)?;
    let (addr, constant) = address_operand(e, i)?;

    if let (Some(address), Some((descriptor, w))) = (constant, intercept(e, i, constant, ty)?) {
        let mut s = e.scope(i.opcode);
        let v = s.src(value)?;
        match w {
            Width::B8 => dynasm!(s.ops ; movzx edx, Rb(v)),
            Width::B16 => dynasm!(s.ops ; movzx edx, Rw(v)),
            Width::B32 => dynasm!(s.ops ; mov edx, Rd(v)),
            Width::B64 => dynasm!(s.ops ; mov rdx, Rq(v)),
        }
        s.end()?;
        swap_bytes(e, w, regs::RDX);
        if w == Width::B16 {
            dynasm!(e.ops ; movzx edx, dx);
        }
        let descriptor = descriptor as *const AccessDescriptor as i64;
        dynasm!(e.ops
            ; mov rdi, QWORD descriptor
            ; mov rsi, QWORD address as i64
        );
        e.call_native(thunks::access_write_thunk as usize as u64);
        e.stats.mmio_redirections += 1;
    } else {
        match e.constant(value) {
            Some(c) => {
                let mut s = e.scope(i.opcode);
                let a = match constant {
                    Some(_) => None,
                    None => Some(s.src(addr)?),
                };
                guest_address(&mut s, a, constant.unwrap_or(0));
                emit_store_constant(&mut s, &c, regs::RCX, 0);
                s.end()?;
            }
            None => {
                let mut s = e.scope(i.opcode);
                let v = s.src(value)?;
                let a = match constant {
                    Some(_) => None,
                    None => Some(s.src(addr)?),
                };
                guest_address(&mut s, a, constant.unwrap_or(0));
                emit_store(&mut s, ty, v, regs::RCX, 0);
                s.end()?;
            }
        }
    }

    if e.config().trace_data {
        e.trace_access(i.opcode, TraceKind::MemoryStore, trace_address(addr, constant), value)?;
    }
    Ok(Flow::Next)
}

fn prefetch(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let (addr, constant) = address_operand(e, i)?;
    let mut s = e.scope(i.opcode);
    let a = match constant {
        Some(_) => None,
        None => Some(s.src(addr)?),
    };
    guest_address(&mut s, a, constant.unwrap_or(0));
    dynasm!(s.ops ; prefetcht0 [rcx]);
    s.end()?;
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// Atomics
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy)]
enum Rmw {
    Exchange,
    Add,
    Sub,
}

/// `dest = [address]; [address] op= value`, atomically.
fn atomic_rmw(e: &mut X64Emitter<'_>, i: &Instr, op: Rmw) -> Result<Flow, LoweringError> {
    let w = width(e, i, dest(i)?)?;
    let (addr, constant) = address_operand(e, i)?;
    let mut s = e.scope(i.opcode);
    let v = s.src(src(i, 1)?)?;
    let a = match constant {
        Some(_) => None,
        None => Some(s.src(addr)?),
    };
    let d = s.dest(dest(i)?)?;
    guest_address(&mut s, a, constant.unwrap_or(0));
    dynasm!(s.ops ; mov Rq(d), Rq(v));
    if let Rmw::Sub = op {
        int_r!(s, w, neg, d);
    }
    match (op, w) {
        (Rmw::Exchange, Width::B8) => dynasm!(s.ops ; xchg BYTE [rcx], Rb(d)),
        (Rmw::Exchange, Width::B16) => dynasm!(s.ops ; xchg WORD [rcx], Rw(d)),
        (Rmw::Exchange, Width::B32) => dynasm!(s.ops ; xchg DWORD [rcx], Rd(d)),
        (Rmw::Exchange, Width::B64) => dynasm!(s.ops ; xchg QWORD [rcx], Rq(d)),
        (_, Width::B8) => dynasm!(s.ops ; lock xadd BYTE [rcx], Rb(d)),
        (_, Width::B16) => dynasm!(s.ops ; lock xadd WORD [rcx], Rw(d)),
        (_, Width::B32) => dynasm!(s.ops ; lock xadd DWORD [rcx], Rd(d)),
        (_, Width::B64) => dynasm!(s.ops ; lock xadd QWORD [rcx], Rq(d)),
    }
    s.end()?;
    Ok(Flow::Next)
}

fn atomic_exchange(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    atomic_rmw(e, i, Rmw::Exchange)
}

fn atomic_add(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    atomic_rmw(e, i, Rmw::Add)
}

fn atomic_sub(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    atomic_rmw(e, i, Rmw::Sub)
}

/// `dest = [address]`; stores src3 there when it equals src2.
fn compare_exchange(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let w = width(e, i, dest(i)?)?;
    let (addr, constant) = address_operand(e, i)?;
    let mut s = e.scope(i.opcode);
    let expected = s.src(src(i, 1)?)?;
    let new = s.src(src(i, 2)?)?;
    let a = match constant {
        Some(_) => None,
        None => Some(s.src(addr)?),
    };
    let d = s.dest(dest(i)?)?;
    guest_address(&mut s, a, constant.unwrap_or(0));
    dynasm!(s.ops ; mov rax, Rq(expected));
    match w {
        Width::B8 => dynasm!(s.ops ; lock cmpxchg BYTE [rcx], Rb(new)),
        Width::B16 => dynasm!(s.ops ; lock cmpxchg WORD [rcx], Rw(new)),
        Width::B32 => dynasm!(s.ops ; lock cmpxchg DWORD [rcx], Rd(new)),
        Width::B64 => dynasm!(s.ops ; lock cmpxchg QWORD [rcx], Rq(new)),
    }
    dynasm!(s.ops ; mov Rq(d), rax);
    s.end()?;
    Ok(Flow::Next)
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::super::testing::*;
    use crate::error::LoweringError;
    use crate::hir::{Constant, FunctionBuilder, Opcode, TypeName, Vec128};
    use crate::runtime::{AccessDescriptor, GuestRuntime, TraceBuffer, TraceKind, TraceValue};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_context_add_store() {
        let mut b = FunctionBuilder::new("bump");
        let v = b.load_context(16, TypeName::Int32);
        let five = b.constant(Constant::Int32(5));
        let r = b.binary(Opcode::Add, v, five);
        b.store_context(16, r);
        b.ret();

        let mut ctx = vec![0u8; 64];
        ctx_write(&mut ctx, 16, 4, 10);
        ctx_write(&mut ctx, 20, 4, 0xAAAA_AAAA);
        run(&b.finish(), &mut ctx, &mut []);
        assert_eq!(ctx_read(&ctx, 16, 4), 15);
        assert_eq!(ctx_read(&ctx, 20, 4), 0xAAAA_AAAA);
    }

    #[test]
    fn test_context_constant_stores() {
        let mut b = FunctionBuilder::new("consts");
        let small = b.constant(Constant::Int64(-2));
        let wide = b.constant(Constant::Int64(0x1122_3344_5566_7788));
        let half = b.constant(Constant::Int16(0x1234));
        let f = b.constant(Constant::Float32(1.5));
        let v = b.constant(Constant::Vec128(Vec128::from_lanes([1, 2, 3, 4])));
        b.store_context(0, small);
        b.store_context(8, wide);
        b.store_context(16, half);
        b.store_context(20, f);
        b.store_context(32, v);
        b.ret();

        let mut ctx = vec![0xFFu8; 64];
        run(&b.finish(), &mut ctx, &mut []);
        assert_eq!(ctx_read(&ctx, 0, 8), (-2i64) as u64);
        assert_eq!(ctx_read(&ctx, 8, 8), 0x1122_3344_5566_7788);
        assert_eq!(ctx_read(&ctx, 16, 4), 0xFFFF_1234);
        assert_eq!(ctx_read(&ctx, 20, 4), 1.5f32.to_bits() as u64);
        assert_eq!(ctx_read_vec(&ctx, 32).lanes(), [1, 2, 3, 4]);
    }

    #[test]
    fn test_flat_memory_round_trip() {
        let mut b = FunctionBuilder::new("flat");
        let addr = b.load_context(0, TypeName::Int64);
        let value = b.load_context(8, TypeName::Int32);
        b.store(addr, value);
        let vaddr = b.constant(Constant::Int32(0x40));
        let vec = b.load(vaddr, TypeName::Vec128);
        b.store_context(16, vec);
        let back = b.load(addr, TypeName::Int16);
        b.store_context(32, back);
        b.ret();

        let mut ctx = vec![0u8; 64];
        let mut mem = vec![0u8; 0x100];
        // upper address bits are dropped
        ctx_write(&mut ctx, 0, 8, 0x1_0000_0020);
        ctx_write(&mut ctx, 8, 4, 0xCAFE_BABE);
        ctx_write_vec(&mut mem, 0x40, Vec128::from_lanes([9, 8, 7, 6]));
        run(&b.finish(), &mut ctx, &mut mem);

        assert_eq!(ctx_read(&mem, 0x20, 4), 0xCAFE_BABE);
        assert_eq!(ctx_read_vec(&ctx, 16).lanes(), [9, 8, 7, 6]);
        assert_eq!(ctx_read(&ctx, 32, 2), 0xBABE);
    }

    #[test]
    fn test_flat_constant_store() {
        let mut b = FunctionBuilder::new("flat_const");
        let addr = b.load_context(0, TypeName::Int32);
        let wide = b.constant(Constant::Int64(-0x0123_4567_89AB_CDEF));
        b.store(addr, wide);
        let at = b.constant(Constant::Int32(0x30));
        let byte = b.constant(Constant::Int8(0x5A));
        b.store(at, byte);
        b.ret();

        let mut ctx = vec![0u8; 16];
        let mut mem = vec![0u8; 0x40];
        ctx_write(&mut ctx, 0, 4, 0x10);
        run(&b.finish(), &mut ctx, &mut mem);
        assert_eq!(ctx_read(&mem, 0x10, 8), (-0x0123_4567_89AB_CDEFi64) as u64);
        assert_eq!(mem[0x30], 0x5A);
        assert_eq!(mem[0x31], 0);
    }

    fn device(writes: Arc<Mutex<Vec<(u64, u64)>>>) -> AccessDescriptor {
        AccessDescriptor::range(
            "regs",
            0x80..0xA0,
            |address| 0x1122_3344_0000_0000 | address,
            move |address, value| {
                if let Ok(mut w) = writes.lock() {
                    w.push((address, value));
                }
            },
        )
    }

    #[test]
    fn test_mmio_store_is_exclusive() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let runtime = GuestRuntime::builder().access(device(Arc::clone(&writes))).build();

        let mut b = FunctionBuilder::new("mmio_store");
        let reg = b.constant(Constant::Int32(0x84));
        let value = b.load_context(0, TypeName::Int32);
        b.store(reg, value);
        let half = b.constant(Constant::Int32(0x88));
        let h = b.constant(Constant::Int16(0x1234));
        b.store(half, h);
        let plain = b.constant(Constant::Int32(0x10));
        b.store(plain, value);
        b.ret();

        let compiled = compile_with(&b.finish(), test_config(), runtime).unwrap();
        assert_eq!(compiled.stats().mmio_redirections, 2);

        let mut ctx = vec![0u8; 16];
        let mut mem = vec![0u8; 0x100];
        ctx_write(&mut ctx, 0, 4, 0x1122_3344);
        run_compiled(&compiled, &mut ctx, &mut mem);

        let writes = writes.lock().unwrap().clone();
        assert_eq!(writes, vec![(0x84, 0x4433_2211), (0x88, 0x3412)]);
        assert!(mem[0x80..0xA0].iter().all(|&b| b == 0));
        assert_eq!(ctx_read(&mem, 0x10, 4), 0x1122_3344);
    }

    #[test]
    fn test_mmio_load_swaps_at_width() {
        let runtime = GuestRuntime::builder()
            .access(device(Arc::new(Mutex::new(Vec::new()))))
            .build();

        let mut b = FunctionBuilder::new("mmio_load");
        let reg = b.constant(Constant::Int32(0x90));
        let word = b.load(reg, TypeName::Int32);
        b.store_context(0, word);
        let wide = b.load(reg, TypeName::Int64);
        b.store_context(8, wide);
        b.ret();

        let compiled = compile_with(&b.finish(), test_config(), runtime).unwrap();
        let mut ctx = vec![0u8; 16];
        let mut mem = vec![0xEEu8; 0x100];
        run_compiled(&compiled, &mut ctx, &mut mem);
        assert_eq!(ctx_read(&ctx, 0, 4), 0x9000_0000);
        assert_eq!(ctx_read(&ctx, 8, 8), 0x9000_0000_4433_2211);
    }

    #[test]
    fn test_float_mmio_access_is_rejected() {
        let runtime = GuestRuntime::builder()
            .access(device(Arc::new(Mutex::new(Vec::new()))))
            .build();
        let mut b = FunctionBuilder::new("mmio_float");
        let reg = b.constant(Constant::Int32(0x80));
        let f = b.load(reg, TypeName::Float32);
        b.store_context(0, f);
        b.ret();

        let err = compile_with(&b.finish(), test_config(), runtime).unwrap_err();
        assert!(matches!(err, LoweringError::InvalidOperandType { opcode: Opcode::Load, .. }), "{err}");
    }

    #[test]
    fn test_data_tracing_reports_accesses() {
        let trace = Arc::new(TraceBuffer::new(16));
        let runtime = GuestRuntime::builder().tracer(Arc::clone(&trace)).build();

        let mut b = FunctionBuilder::new("traced");
        let v = b.load_context(8, TypeName::Int32);
        let addr = b.constant(Constant::Int32(0x20));
        b.store(addr, v);
        b.store_context(12, v);
        b.ret();

        let compiled = compile_with(&b.finish(), test_config().with_tracing(), runtime).unwrap();
        let mut ctx = vec![0u8; 16];
        let mut mem = vec![0u8; 0x40];
        ctx_write(&mut ctx, 8, 4, 77);
        run_compiled(&compiled, &mut ctx, &mut mem);

        let events = trace.events();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![TraceKind::ContextLoad, TraceKind::MemoryStore, TraceKind::ContextStore]
        );
        assert_eq!(events[1].offset, 0x20);
        assert!(events.iter().all(|e| e.value == TraceValue::Int(77)));
    }

    #[test]
    fn test_atomics_return_old_value() {
        let mut b = FunctionBuilder::new("atomics");
        let addr = b.load_context(0, TypeName::Int32);
        let n = b.constant(Constant::Int32(5));
        let old_add = b.binary(Opcode::AtomicAdd, addr, n);
        b.store_context(8, old_add);
        let three = b.constant(Constant::Int32(3));
        let old_sub = b.binary(Opcode::AtomicSub, addr, three);
        b.store_context(12, old_sub);
        let x = b.constant(Constant::Int32(100));
        let old_xchg = b.binary(Opcode::AtomicExchange, addr, x);
        b.store_context(16, old_xchg);
        b.ret();

        let mut ctx = vec![0u8; 32];
        let mut mem = vec![0u8; 0x20];
        ctx_write(&mut ctx, 0, 4, 0x10);
        ctx_write(&mut mem, 0x10, 4, 40);
        run(&b.finish(), &mut ctx, &mut mem);
        assert_eq!(ctx_read(&ctx, 8, 4), 40);
        assert_eq!(ctx_read(&ctx, 12, 4), 45);
        assert_eq!(ctx_read(&ctx, 16, 4), 42);
        assert_eq!(ctx_read(&mem, 0x10, 4), 100);
    }

    #[test]
    fn test_compare_exchange() {
        let mut b = FunctionBuilder::new("cas");
        let addr = b.load_context(0, TypeName::Int64);
        let expected = b.load_context(8, TypeName::Int64);
        let new = b.constant(Constant::Int64(-1));
        let hit = b.op(
            Opcode::CompareExchange,
            TypeName::Int64,
            &[addr.into(), expected.into(), new.into()],
            0,
        );
        b.store_context(16, hit);
        let miss = b.op(
            Opcode::CompareExchange,
            TypeName::Int64,
            &[addr.into(), expected.into(), new.into()],
            0,
        );
        b.store_context(24, miss);
        b.ret();

        let mut ctx = vec![0u8; 32];
        let mut mem = vec![0u8; 0x20];
        ctx_write(&mut ctx, 0, 8, 0x8);
        ctx_write(&mut ctx, 8, 8, 7);
        ctx_write(&mut mem, 0x8, 8, 7);
        run(&b.finish(), &mut ctx, &mut mem);
        assert_eq!(ctx_read(&ctx, 16, 8), 7);
        assert_eq!(ctx_read(&ctx, 24, 8), u64::MAX);
        assert_eq!(ctx_read(&mem, 0x8, 8), u64::MAX);
    }

    #[test]
    fn test_clock_and_prefetch() {
        let mut b = FunctionBuilder::new("clock");
        let addr = b.constant(Constant::Int32(0));
        b.op_void(Opcode::Prefetch, &[addr.into()], 0);
        let t0 = b.op(Opcode::LoadClock, TypeName::Int64, &[], 0);
        let t1 = b.op(Opcode::LoadClock, TypeName::Int64, &[], 0);
        let dt = b.binary(Opcode::Sub, t1, t0);
        b.store_context(0, dt);
        b.ret();

        let mut ctx = vec![0xFFu8; 8];
        let mut mem = vec![0u8; 64];
        run(&b.finish(), &mut ctx, &mut mem);
        assert!(ctx_read(&ctx, 0, 8) < 1_000_000_000);
    }
}
