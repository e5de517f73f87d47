//! Scoped operand binding for a single emitted operation.
//!
//! An [`OpScope`] borrows the emitter for the duration of one emission path.
//! Each `dest`/`src` call acquires a binding from the allocator and returns a
//! physical register usable until the scope ends:
//!
//! - values homed in a register are used in place;
//! - spilled sources are loaded into scratch, spilled destinations get a
//!   scratch register that [`OpScope::end`] stores back;
//! - constant sources are materialized into scratch.
//!
//! Every binding is released exactly once, by `end` or by `Drop` when an
//! emission path bails out early with an error.

use super::emitter::X64Emitter;
use super::frame::FrameLayout;
use super::regalloc::{Home, Role};
use super::regs;
use crate::error::LoweringError;
use crate::hir::{Opcode, TypeClass, TypeName, ValueId};
use dynasmrt::{dynasm, DynasmApi};
use std::ops::{Deref, DerefMut};

#[derive(Debug, Clone, Copy)]
struct Binding {
    value: ValueId,
    role: Role,
    home: Home,
    reg: u8,
    class: TypeClass,
}

pub struct OpScope<'s, 'a> {
    emitter: &'s mut X64Emitter<'a>,
    opcode: Opcode,
    bindings: Vec<Binding>,
    used_gpr: u8,
    used_xmm: u8,
    released: bool,
}

impl<'s, 'a> OpScope<'s, 'a> {
    pub(crate) fn new(emitter: &'s mut X64Emitter<'a>, opcode: Opcode) -> Self {
        Self {
            emitter,
            opcode,
            bindings: Vec::with_capacity(4),
            used_gpr: 0,
            used_xmm: 0,
            released: false,
        }
    }

    /// Bind the destination value. Its previous contents are not loaded.
    pub fn dest(&mut self, value: ValueId) -> Result<u8, LoweringError> {
        let class = self.emitter.value_type(value)?.class();
        let home = self.emitter.acquire(value, class, Role::Dest)?;
        let reg = match home {
            Home::Gpr(r) | Home::Xmm(r) => r,
            Home::Slot(_) => self.scratch(class)?,
            Home::Constant => {
                self.emitter.release(value, Role::Dest);
                return Err(LoweringError::RegisterAllocation(format!(
                    "{} writes constant {value}",
                    self.opcode
                )));
            }
        };
        self.bindings.push(Binding {
            value,
            role: Role::Dest,
            home,
            reg,
            class,
        });
        Ok(reg)
    }

    /// Bind a source value, loading it when it does not live in a register.
    /// Binding the same value twice yields the same register.
    pub fn src(&mut self, value: ValueId) -> Result<u8, LoweringError> {
        if let Some(b) = self
            .bindings
            .iter()
            .find(|b| b.value == value && b.role == Role::Src)
        {
            return Ok(b.reg);
        }
        let ty = self.emitter.value_type(value)?;
        let class = ty.class();
        let home = self.emitter.acquire(value, class, Role::Src)?;
        let reg = match home {
            Home::Gpr(r) | Home::Xmm(r) => r,
            Home::Slot(slot) => {
                let reg = self.scratch(class)?;
                self.load_slot(reg, class, slot);
                reg
            }
            Home::Constant => {
                let reg = self.scratch(class)?;
                self.materialize(value, ty, reg)?;
                reg
            }
        };
        self.bindings.push(Binding {
            value,
            role: Role::Src,
            home,
            reg,
            class,
        });
        Ok(reg)
    }

    /// Store spilled destinations back and release every binding.
    pub fn end(mut self) -> Result<(), LoweringError> {
        let spilled: Vec<Binding> = self
            .bindings
            .iter()
            .filter(|b| b.role == Role::Dest)
            .copied()
            .collect();
        for b in spilled {
            if let Home::Slot(slot) = b.home {
                self.store_slot(b.reg, b.class, slot);
            }
        }
        self.release_all();
        Ok(())
    }

    /// Register class of a bound value's scratch pool.
    fn scratch(&mut self, class: TypeClass) -> Result<u8, LoweringError> {
        let (pool, used): (&[u8], &mut u8) = match class {
            TypeClass::Int => (&regs::SCRATCH_GPR, &mut self.used_gpr),
            TypeClass::Float | TypeClass::Vec => (&regs::SCRATCH_XMM, &mut self.used_xmm),
        };
        let reg = pool.get(*used as usize).copied().ok_or_else(|| {
            LoweringError::RegisterAllocation(format!(
                "{} needs more than {} {:?} scratch registers",
                self.opcode,
                pool.len(),
                class
            ))
        })?;
        *used += 1;
        Ok(reg)
    }

    fn load_slot(&mut self, reg: u8, class: TypeClass, slot: u32) {
        let off = FrameLayout::slot(slot);
        match class {
            TypeClass::Int => dynasm!(self.emitter.ops ; mov Rq(reg), QWORD [rsp + off]),
            _ => dynasm!(self.emitter.ops ; movups Rx(reg), [rsp + off]),
        }
    }

    fn store_slot(&mut self, reg: u8, class: TypeClass, slot: u32) {
        let off = FrameLayout::slot(slot);
        match class {
            TypeClass::Int => dynasm!(self.emitter.ops ; mov QWORD [rsp + off], Rq(reg)),
            _ => dynasm!(self.emitter.ops ; movups [rsp + off], Rx(reg)),
        }
    }

    fn materialize(&mut self, value: ValueId, ty: TypeName, reg: u8) -> Result<(), LoweringError> {
        let constant = self
            .emitter
            .constant(value)
            .ok_or_else(|| LoweringError::RegisterAllocation(format!("{value} is not a constant")))?;
        match ty.class() {
            TypeClass::Int => self.emitter.load_constant_gpr(reg, &constant),
            TypeClass::Float | TypeClass::Vec => self.emitter.load_constant_xmm(reg, &constant),
        }
        Ok(())
    }

    fn release_all(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for b in self.bindings.drain(..) {
            self.emitter.release(b.value, b.role);
        }
    }
}

impl<'a> Deref for OpScope<'_, 'a> {
    type Target = X64Emitter<'a>;

    fn deref(&self) -> &Self::Target {
        self.emitter
    }
}

impl<'a> DerefMut for OpScope<'_, 'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.emitter
    }
}

impl Drop for OpScope<'_, '_> {
    fn drop(&mut self) {
        self.release_all();
    }
}
