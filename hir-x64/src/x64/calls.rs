//! Call sequences: guest calls, extern shims, tail calls and native helpers.
//!
//! Every sequence that returns restores rdi (context) and rsi (membase) from
//! the frame before the next instruction runs; callees are free to clobber
//! them. Tail calls reload them too, then tear the frame down and jump.

use super::emitter::X64Emitter;
use crate::error::LoweringError;
use crate::hir::{flags, FunctionSymbol, Opcode, SymbolKind, ValueId};
use crate::runtime::thunks;
use dynasmrt::{dynasm, DynasmApi};

impl X64Emitter<'_> {
    /// `call` a native function at `target`, then reload context and membase.
    /// Arguments must already be in place; clobbers rax.
    pub(crate) fn call_native(&mut self, target: u64) {
        dynasm!(self.ops
            ; mov rax, QWORD target as i64
            ; call rax
        );
        self.reload_context();
    }

    /// Call through rax, or jump through it when `call_flags` asks for a
    /// tail call.
    fn dispatch_rax(&mut self, call_flags: u32) {
        if call_flags & flags::CALL_TAIL != 0 {
            self.teardown();
            dynasm!(self.ops ; jmp rax);
        } else {
            dynasm!(self.ops ; call rax);
            self.reload_context();
        }
        self.stats.calls += 1;
    }

    /// Direct call to a guest symbol.
    pub(crate) fn call_symbol(&mut self, symbol: &FunctionSymbol, call_flags: u32) {
        match symbol.kind {
            SymbolKind::Extern(shim) => {
                // handler(context, arg0, arg1); rdi already holds the context
                dynasm!(self.ops
                    ; mov rsi, QWORD shim.arg0 as i64
                    ; mov rdx, QWORD shim.arg1 as i64
                    ; mov rax, QWORD shim.handler as usize as i64
                );
            }
            SymbolKind::User => {
                let runtime = self.runtime_ptr();
                let symbol = symbol as *const FunctionSymbol as i64;
                dynasm!(self.ops
                    ; mov rdi, QWORD runtime
                    ; mov rsi, QWORD symbol
                );
                self.call_native(thunks::resolve_symbol_thunk as usize as u64);
            }
        }
        self.dispatch_rax(call_flags);
    }

    /// Call to a guest address computed at runtime. The address is truncated
    /// to 32 bits before resolution.
    pub(crate) fn call_address(&mut self, opcode: Opcode, target: ValueId, call_flags: u32) -> Result<(), LoweringError> {
        if !self.value_type(target)?.is_int() {
            return Err(LoweringError::invalid(opcode, "call target must be an integer"));
        }
        match self.constant(target) {
            Some(c) => {
                let address = c.bits() as u32 as i32;
                dynasm!(self.ops ; mov esi, address);
            }
            None => {
                let mut s = self.scope(opcode);
                let t = s.src(target)?;
                dynasm!(s.ops ; mov esi, Rd(t));
                s.end()?;
            }
        }
        let runtime = self.runtime_ptr();
        dynasm!(self.ops ; mov rdi, QWORD runtime);
        self.call_native(thunks::resolve_address_thunk as usize as u64);
        self.dispatch_rax(call_flags);
        Ok(())
    }
}
