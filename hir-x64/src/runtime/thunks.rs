//! Native entry points called from lowered code.
//!
//! Every thunk uses the System V calling convention and receives the
//! [`GuestRuntime`] (or an [`AccessDescriptor`]) as a raw pointer baked into
//! the code as an immediate. Compiled functions hold an `Arc` to the runtime,
//! so those pointers outlive the code that embeds them.
//!
//! Thunks never unwind: resolver panics and failures are converted into a
//! [`GuestFault`] and the call site receives [`unresolved_entry`].

use super::access::AccessDescriptor;
use super::trace::{TraceEvent, TraceKind, TraceValue};
use super::{GuestFault, GuestRuntime};
use crate::error::ResolveError;
use crate::hir::{FunctionSymbol, TypeName, Vec128};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Signature of every compiled guest function.
pub type GuestEntry = extern "sysv64" fn(*mut u8, *mut u8);

/// Stand-in target for calls that failed to resolve.
pub extern "sysv64" fn unresolved_entry(_context: *mut u8, _membase: *mut u8) {}

fn unresolved(runtime: &GuestRuntime, target: u64, error: ResolveError) -> *const u8 {
    runtime.raise(GuestFault { target, error });
    unresolved_entry as GuestEntry as *const u8
}

fn resolved(
    runtime: &GuestRuntime,
    target: u64,
    result: std::thread::Result<Result<*const u8, ResolveError>>,
) -> *const u8 {
    match result {
        Ok(Ok(entry)) if !entry.is_null() => entry,
        Ok(Ok(_)) => unresolved(runtime, target, ResolveError::InvalidAddress(target)),
        Ok(Err(error)) => unresolved(runtime, target, error),
        Err(_) => unresolved(
            runtime,
            target,
            ResolveError::CompileFailed {
                address: target,
                reason: "resolver panicked".into(),
            },
        ),
    }
}

/// `rax = resolve(symbol)`; caches the entry on the symbol.
pub(crate) extern "sysv64" fn resolve_symbol_thunk(
    runtime: *const GuestRuntime,
    symbol: *const FunctionSymbol,
) -> *const u8 {
    // SAFETY: both pointers are kept alive by the compiled function.
    let (runtime, symbol) = unsafe { (&*runtime, &*symbol) };
    if let Some(entry) = symbol.entry() {
        return entry;
    }
    let result = catch_unwind(AssertUnwindSafe(|| {
        runtime.resolver().resolve_symbol(symbol)
    }));
    let entry = resolved(runtime, symbol.address, result);
    if entry != unresolved_entry as GuestEntry as *const u8 {
        symbol.set_entry(entry);
    }
    entry
}

/// `rax = resolve(address)` for computed call targets.
pub(crate) extern "sysv64" fn resolve_address_thunk(
    runtime: *const GuestRuntime,
    address: u64,
) -> *const u8 {
    // SAFETY: kept alive by the compiled function.
    let runtime = unsafe { &*runtime };
    let result = catch_unwind(AssertUnwindSafe(|| {
        runtime.resolver().resolve_address(address)
    }));
    resolved(runtime, address, result)
}

pub(crate) extern "sysv64" fn access_read_thunk(
    descriptor: *const AccessDescriptor,
    address: u64,
) -> u64 {
    // SAFETY: descriptors live in the frozen chain of a retained runtime.
    let descriptor = unsafe { &*descriptor };
    catch_unwind(AssertUnwindSafe(|| descriptor.read(address))).unwrap_or_else(|_| {
        log::warn!("[MMIO] Read handler '{}' panicked at {:#x}", descriptor.name(), address);
        0
    })
}

pub(crate) extern "sysv64" fn access_write_thunk(
    descriptor: *const AccessDescriptor,
    address: u64,
    value: u64,
) {
    // SAFETY: descriptors live in the frozen chain of a retained runtime.
    let descriptor = unsafe { &*descriptor };
    if catch_unwind(AssertUnwindSafe(|| descriptor.write(address, value))).is_err() {
        log::warn!("[MMIO] Write handler '{}' panicked at {:#x}", descriptor.name(), address);
    }
}

pub(crate) extern "sysv64" fn load_clock_thunk(runtime: *const GuestRuntime) -> u64 {
    // SAFETY: kept alive by the compiled function.
    unsafe { &*runtime }.clock()
}

// ═══════════════════════════════════════════════════════════════════════════
// Tracers
// ═══════════════════════════════════════════════════════════════════════════

fn emit(runtime: *const GuestRuntime, kind: TraceKind, ty: TypeName, offset: u64, value: TraceValue) {
    // SAFETY: kept alive by the compiled function.
    let runtime = unsafe { &*runtime };
    let event = TraceEvent { kind, ty, offset, value };
    if catch_unwind(AssertUnwindSafe(|| runtime.trace(event))).is_err() {
        log::warn!("[TRACE] Trace sink panicked");
    }
}

macro_rules! int_tracers {
    ($($name:ident => $kind:ident, $ty:ident, $arg:ty;)*) => {
        $(
            pub(crate) extern "sysv64" fn $name(runtime: *const GuestRuntime, offset: u64, value: $arg) {
                emit(runtime, TraceKind::$kind, TypeName::$ty, offset, TraceValue::Int(value as u64));
            }
        )*
    };
}

int_tracers! {
    trace_context_load_i8 => ContextLoad, Int8, u8;
    trace_context_load_i16 => ContextLoad, Int16, u16;
    trace_context_load_i32 => ContextLoad, Int32, u32;
    trace_context_load_i64 => ContextLoad, Int64, u64;
    trace_context_store_i8 => ContextStore, Int8, u8;
    trace_context_store_i16 => ContextStore, Int16, u16;
    trace_context_store_i32 => ContextStore, Int32, u32;
    trace_context_store_i64 => ContextStore, Int64, u64;
    trace_memory_load_i8 => MemoryLoad, Int8, u8;
    trace_memory_load_i16 => MemoryLoad, Int16, u16;
    trace_memory_load_i32 => MemoryLoad, Int32, u32;
    trace_memory_load_i64 => MemoryLoad, Int64, u64;
    trace_memory_store_i8 => MemoryStore, Int8, u8;
    trace_memory_store_i16 => MemoryStore, Int16, u16;
    trace_memory_store_i32 => MemoryStore, Int32, u32;
    trace_memory_store_i64 => MemoryStore, Int64, u64;
}

macro_rules! float_tracers {
    ($($name:ident => $kind:ident, $ty:ident, $arg:ty, $variant:ident;)*) => {
        $(
            pub(crate) extern "sysv64" fn $name(runtime: *const GuestRuntime, offset: u64, value: $arg) {
                emit(runtime, TraceKind::$kind, TypeName::$ty, offset, TraceValue::$variant(value));
            }
        )*
    };
}

float_tracers! {
    trace_context_load_f32 => ContextLoad, Float32, f32, F32;
    trace_context_load_f64 => ContextLoad, Float64, f64, F64;
    trace_context_store_f32 => ContextStore, Float32, f32, F32;
    trace_context_store_f64 => ContextStore, Float64, f64, F64;
    trace_memory_load_f32 => MemoryLoad, Float32, f32, F32;
    trace_memory_load_f64 => MemoryLoad, Float64, f64, F64;
    trace_memory_store_f32 => MemoryStore, Float32, f32, F32;
    trace_memory_store_f64 => MemoryStore, Float64, f64, F64;
}

macro_rules! vec_tracers {
    ($($name:ident => $kind:ident;)*) => {
        $(
            pub(crate) extern "sysv64" fn $name(runtime: *const GuestRuntime, offset: u64, value: *const [u8; 16]) {
                // SAFETY: points at a frame temp written just before the call.
                let value = Vec128::from_bytes(unsafe { *value });
                emit(runtime, TraceKind::$kind, TypeName::Vec128, offset, TraceValue::V128(value));
            }
        )*
    };
}

vec_tracers! {
    trace_context_load_v128 => ContextLoad;
    trace_context_store_v128 => ContextStore;
    trace_memory_load_v128 => MemoryLoad;
    trace_memory_store_v128 => MemoryStore;
}

/// Text of a COMMENT instruction, stored inline after the epilogue.
pub(crate) extern "sysv64" fn trace_comment(runtime: *const GuestRuntime, text: *const u8, len: u64) {
    // SAFETY: the string lives in the same executable buffer as the caller.
    let bytes = unsafe { std::slice::from_raw_parts(text, len as usize) };
    let text = String::from_utf8_lossy(bytes).into_owned();
    emit(runtime, TraceKind::Comment, TypeName::Int8, 0, TraceValue::Text(text));
}

/// Tracer address for one access kind and value type.
pub(crate) fn tracer(kind: TraceKind, ty: TypeName) -> Option<u64> {
    use TraceKind as K;
    use TypeName as T;
    let f: usize = match (kind, ty.storage()) {
        (K::ContextLoad, T::Int8) => trace_context_load_i8 as usize,
        (K::ContextLoad, T::Int16) => trace_context_load_i16 as usize,
        (K::ContextLoad, T::Int32) => trace_context_load_i32 as usize,
        (K::ContextLoad, T::Int64) => trace_context_load_i64 as usize,
        (K::ContextLoad, T::Float32) => trace_context_load_f32 as usize,
        (K::ContextLoad, T::Float64) => trace_context_load_f64 as usize,
        (K::ContextLoad, T::Vec128) => trace_context_load_v128 as usize,
        (K::ContextStore, T::Int8) => trace_context_store_i8 as usize,
        (K::ContextStore, T::Int16) => trace_context_store_i16 as usize,
        (K::ContextStore, T::Int32) => trace_context_store_i32 as usize,
        (K::ContextStore, T::Int64) => trace_context_store_i64 as usize,
        (K::ContextStore, T::Float32) => trace_context_store_f32 as usize,
        (K::ContextStore, T::Float64) => trace_context_store_f64 as usize,
        (K::ContextStore, T::Vec128) => trace_context_store_v128 as usize,
        (K::MemoryLoad, T::Int8) => trace_memory_load_i8 as usize,
        (K::MemoryLoad, T::Int16) => trace_memory_load_i16 as usize,
        (K::MemoryLoad, T::Int32) => trace_memory_load_i32 as usize,
        (K::MemoryLoad, T::Int64) => trace_memory_load_i64 as usize,
        (K::MemoryLoad, T::Float32) => trace_memory_load_f32 as usize,
        (K::MemoryLoad, T::Float64) => trace_memory_load_f64 as usize,
        (K::MemoryLoad, T::Vec128) => trace_memory_load_v128 as usize,
        (K::MemoryStore, T::Int8) => trace_memory_store_i8 as usize,
        (K::MemoryStore, T::Int16) => trace_memory_store_i16 as usize,
        (K::MemoryStore, T::Int32) => trace_memory_store_i32 as usize,
        (K::MemoryStore, T::Int64) => trace_memory_store_i64 as usize,
        (K::MemoryStore, T::Float32) => trace_memory_store_f32 as usize,
        (K::MemoryStore, T::Float64) => trace_memory_store_f64 as usize,
        (K::MemoryStore, T::Vec128) => trace_memory_store_v128 as usize,
        _ => return None,
    };
    Some(f as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{StaticResolver, TraceBuffer};
    use std::sync::Arc;

    #[test]
    fn test_unresolved_symbol_records_fault() {
        let runtime = GuestRuntime::standalone();
        let sym = FunctionSymbol::user(0x8200_1000, "missing");
        let entry = resolve_symbol_thunk(Arc::as_ptr(&runtime), &sym);
        assert_eq!(entry, unresolved_entry as GuestEntry as *const u8);
        assert!(sym.entry().is_none());
        let fault = runtime.take_fault().unwrap();
        assert_eq!(fault.target, 0x8200_1000);
    }

    #[test]
    fn test_resolved_symbol_is_cached() {
        let resolver = Arc::new(StaticResolver::new());
        resolver.register(0x4000, 0x5000usize as *const u8);
        let runtime = GuestRuntime::builder().resolver(resolver).build();
        let sym = FunctionSymbol::user(0x4000, "f");
        assert_eq!(resolve_symbol_thunk(Arc::as_ptr(&runtime), &sym) as usize, 0x5000);
        assert_eq!(sym.entry().map(|p| p as usize), Some(0x5000));
        assert!(runtime.take_fault().is_none());
    }

    #[test]
    fn test_tracers_forward_to_sink() {
        let buffer = Arc::new(TraceBuffer::new(8));
        let runtime = GuestRuntime::builder().tracer(buffer.clone()).build();
        trace_context_store_i32(Arc::as_ptr(&runtime), 0x20, 7);
        trace_memory_load_f32(Arc::as_ptr(&runtime), 0x100, 1.5);
        let events = buffer.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, TraceKind::ContextStore);
        assert_eq!(events[0].value, TraceValue::Int(7));
        assert_eq!(events[1].value, TraceValue::F32(1.5));
    }

    #[test]
    fn test_tracer_table_covers_every_type() {
        for kind in [
            TraceKind::ContextLoad,
            TraceKind::ContextStore,
            TraceKind::MemoryLoad,
            TraceKind::MemoryStore,
        ] {
            for ty in [TypeName::Int8, TypeName::Bool, TypeName::Float64, TypeName::Vec128] {
                assert!(tracer(kind, ty).is_some());
            }
        }
        assert!(tracer(TraceKind::Comment, TypeName::Int8).is_none());
    }
}
