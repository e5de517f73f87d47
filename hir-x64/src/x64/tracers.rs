//! Tracer calls emitted after data accesses and comments.
//!
//! Tracers are ordinary native calls: they run after the traced operation's
//! scope has been released, read the value from its home and restore
//! context and membase like any other call.

use super::emitter::X64Emitter;
use super::frame::FrameLayout;
use crate::error::LoweringError;
use crate::hir::{Opcode, TypeClass, ValueId};
use crate::runtime::thunks;
use crate::runtime::TraceKind;
use dynasmrt::{dynasm, DynasmApi, DynasmLabelApi};

/// Where the traced offset or address comes from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TraceAddress {
    /// Context offset or constant guest address.
    Immediate(u64),
    /// Guest address held in a value; traced truncated to 32 bits.
    Value(ValueId),
}

impl X64Emitter<'_> {
    /// `tracer(runtime, address, value)` for one load or store.
    pub(crate) fn trace_access(
        &mut self,
        opcode: Opcode,
        kind: TraceKind,
        address: TraceAddress,
        value: ValueId,
    ) -> Result<(), LoweringError> {
        let ty = self.value_type(value)?;
        let tracer = thunks::tracer(kind, ty)
            .ok_or_else(|| LoweringError::invalid(opcode, format!("no tracer for {kind:?} {ty}")))?;

        let mut s = self.scope(opcode);
        let v = s.src(value)?;
        let (a, offset) = match address {
            TraceAddress::Value(id) => (Some(s.src(id)?), 0),
            TraceAddress::Immediate(offset) => (None, offset),
        };
        match ty.class() {
            TypeClass::Int => dynasm!(s.ops ; mov rdx, Rq(v)),
            TypeClass::Float => dynasm!(s.ops ; movaps xmm0, Rx(v)),
            TypeClass::Vec => {
                let temp = FrameLayout::temp(0);
                dynasm!(s.ops
                    ; movups [rsp + temp], Rx(v)
                    ; lea rdx, [rsp + temp]
                );
            }
        }
        match a {
            Some(reg) => dynasm!(s.ops ; mov esi, Rd(reg)),
            None => dynasm!(s.ops ; mov rsi, QWORD offset as i64),
        }
        let runtime = s.runtime_ptr();
        dynasm!(s.ops ; mov rdi, QWORD runtime);
        s.call_native(tracer);
        s.stats.tracer_calls += 1;
        s.end()
    }

    /// Pass a COMMENT's text to the comment tracer. The bytes are placed
    /// after the epilogue.
    pub(crate) fn trace_comment(&mut self, text: &str) {
        let len = text.len() as i64;
        let label = self.add_data(text.as_bytes().to_vec());
        let runtime = self.runtime_ptr();
        dynasm!(self.ops
            ; mov rdi, QWORD runtime
            ; lea rsi, [=>label]
            ; mov rdx, QWORD len
        );
        self.call_native(thunks::trace_comment as usize as u64);
        self.stats.tracer_calls += 1;
    }
}
