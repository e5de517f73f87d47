//! Shared helpers for tests that execute lowered code.

use crate::config::LoweringConfig;
use crate::error::LoweringError;
use crate::hir::{Constant, FunctionBuilder, HirFunction, Opcode, TypeName, Vec128};
use crate::lowering::{CompiledFunction, Compiler, LoweringTable};
use crate::runtime::GuestRuntime;
use std::sync::{Arc, OnceLock};

pub(crate) fn table() -> Arc<LoweringTable> {
    static TABLE: OnceLock<Arc<LoweringTable>> = OnceLock::new();
    Arc::clone(TABLE.get_or_init(|| Arc::new(LoweringTable::new())))
}

/// Config used by the executing tests: every path enabled.
pub(crate) fn test_config() -> LoweringConfig {
    LoweringConfig {
        unverified_lane_order: true,
        ..LoweringConfig::default()
    }
}

pub(crate) fn compile_with(
    func: &HirFunction,
    config: LoweringConfig,
    runtime: Arc<GuestRuntime>,
) -> Result<CompiledFunction, LoweringError> {
    let _ = env_logger::builder().is_test(true).try_init();
    Compiler::new(table(), runtime, config).compile(func)
}

pub(crate) fn try_compile(func: &HirFunction) -> Result<CompiledFunction, LoweringError> {
    compile_with(func, test_config(), GuestRuntime::standalone())
}

pub(crate) fn compile(func: &HirFunction) -> CompiledFunction {
    try_compile(func).unwrap_or_else(|e| panic!("{} failed to compile: {e}", func.name))
}

/// Compile and run `func` once.
pub(crate) fn run(func: &HirFunction, context: &mut [u8], memory: &mut [u8]) {
    let compiled = compile(func);
    run_compiled(&compiled, context, memory);
}

pub(crate) fn run_compiled(compiled: &CompiledFunction, context: &mut [u8], memory: &mut [u8]) {
    // SAFETY: tests only touch offsets inside the buffers they pass
    unsafe { compiled.call(context.as_mut_ptr(), memory.as_mut_ptr()) }
}

/// Little-endian read of `size` bytes at `offset`.
pub(crate) fn ctx_read(buf: &[u8], offset: usize, size: usize) -> u64 {
    buf[offset..offset + size]
        .iter()
        .rev()
        .fold(0u64, |acc, &b| acc << 8 | b as u64)
}

pub(crate) fn ctx_write(buf: &mut [u8], offset: usize, size: usize, value: u64) {
    for (i, b) in buf[offset..offset + size].iter_mut().enumerate() {
        *b = (value >> (8 * i)) as u8;
    }
}

pub(crate) fn ctx_read_vec(buf: &[u8], offset: usize) -> Vec128 {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[offset..offset + 16]);
    Vec128::from_bytes(bytes)
}

pub(crate) fn ctx_write_vec(buf: &mut [u8], offset: usize, v: Vec128) {
    buf[offset..offset + 16].copy_from_slice(&v.to_bytes());
}

/// Input offsets used by the operator helpers below.
pub(crate) const IN: [u64; 3] = [0x40, 0x60, 0x80];

/// Operand passed to [`eval`]: live values are loaded from the context,
/// constants are used directly.
pub(crate) enum Arg {
    Live(TypeName, u64),
    Vec(Vec128),
    Const(Constant),
}

/// Run `opcode` on `args` and return the context bytes the result of type
/// `result` was stored to.
pub(crate) fn eval(opcode: Opcode, flags: u32, result: TypeName, args: &[Arg]) -> Vec128 {
    let mut b = FunctionBuilder::new(format!("eval_{opcode}"));
    let mut ctx = vec![0u8; 0x100];
    let mut operands = Vec::new();
    for (arg, &offset) in args.iter().zip(IN.iter()) {
        let v = match *arg {
            Arg::Live(ty, bits) => {
                ctx_write(&mut ctx, offset as usize, ty.size(), bits);
                b.load_context(offset, ty)
            }
            Arg::Vec(v) => {
                ctx_write_vec(&mut ctx, offset as usize, v);
                b.load_context(offset, TypeName::Vec128)
            }
            Arg::Const(c) => b.constant(c),
        };
        operands.push(v.into());
    }
    let r = b.op(opcode, result, &operands, flags);
    b.store_context(0, r);
    b.ret();
    run(&b.finish(), &mut ctx, &mut []);
    ctx_read_vec(&ctx, 0)
}

/// Integer or float result of [`eval`], masked to the result width.
pub(crate) fn eval_scalar(opcode: Opcode, flags: u32, result: TypeName, args: &[Arg]) -> u64 {
    let v = eval(opcode, flags, result, args);
    match result.size() {
        8 => v.low,
        n => v.low & ((1u64 << (n * 8)) - 1),
    }
}
