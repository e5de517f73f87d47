//! Register allocator interface and the default linear-scan allocator.
//!
//! The lowering pass never decides where a value lives. It asks the
//! allocator for a [`Home`] when an operation scope binds an operand and
//! hands the binding back when the scope ends.

use super::regs;
use crate::error::LoweringError;
use crate::hir::{HirFunction, TypeClass, ValueId};
use std::collections::HashMap;

/// Why an operand is being bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Dest,
    Src,
}

/// Where a value lives between instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Home {
    /// Callee-saved general-purpose register.
    Gpr(u8),
    /// Vector register. Not preserved across calls.
    Xmm(u8),
    /// 16-byte spill slot in the frame.
    Slot(u32),
    /// Constant operand, materialized by the scope.
    Constant,
}

/// External allocator protocol.
///
/// `acquire` and `release` are strictly paired per operand within one
/// instruction; bindings never span instructions.
pub trait RegisterAllocator: Send {
    /// Analyze `func` before emission. Returns the number of spill slots
    /// the frame must reserve.
    fn prepare(&mut self, func: &HirFunction) -> Result<u32, LoweringError>;

    fn acquire(&mut self, value: ValueId, class: TypeClass, role: Role) -> Result<Home, LoweringError>;

    fn release(&mut self, value: ValueId, role: Role);
}

/// Interval-based allocator over block-local integer values.
///
/// Integer values defined and consumed inside one block are assigned one of
/// the callee-saved registers for their live interval. Everything else gets
/// a private spill slot. Sources are expired only after the destination of
/// the same instruction is assigned, so a destination never shares a
/// register with any of its instruction's sources.
#[derive(Debug, Default)]
pub struct LinearScanAllocator {
    homes: HashMap<ValueId, Home>,
    bound: HashMap<(ValueId, Role), u32>,
    slots: u32,
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    block: usize,
    def: Option<usize>,
    defs: u32,
    last_use: usize,
    local: bool,
}

impl LinearScanAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Home computed by the last `prepare`.
    pub fn home(&self, value: ValueId) -> Option<Home> {
        self.homes.get(&value).copied()
    }

    fn intervals(func: &HirFunction) -> HashMap<ValueId, Interval> {
        let mut intervals: HashMap<ValueId, Interval> = HashMap::new();
        let mut pos = 0usize;
        for (b, block) in func.blocks.iter().enumerate() {
            for instr in &block.instrs {
                for v in instr.used_values() {
                    let entry = intervals.entry(v).or_insert(Interval {
                        block: b,
                        def: None,
                        defs: 0,
                        last_use: pos,
                        local: true,
                    });
                    entry.local &= entry.block == b;
                    entry.last_use = pos;
                }
                if let Some(d) = instr.dest {
                    let entry = intervals.entry(d).or_insert(Interval {
                        block: b,
                        def: None,
                        defs: 0,
                        last_use: pos,
                        local: true,
                    });
                    entry.local &= entry.block == b;
                    entry.defs += 1;
                    if entry.def.is_none() {
                        entry.def = Some(pos);
                    }
                }
                pos += 1;
            }
        }
        // a use before the definition means the value flows in from elsewhere
        for interval in intervals.values_mut() {
            let defined_first = interval.def.is_some_and(|d| d <= interval.last_use);
            interval.local &= interval.defs == 1 && defined_first;
        }
        intervals
    }
}

impl RegisterAllocator for LinearScanAllocator {
    fn prepare(&mut self, func: &HirFunction) -> Result<u32, LoweringError> {
        self.homes.clear();
        self.bound.clear();
        self.slots = 0;

        let intervals = Self::intervals(func);
        let mut free: Vec<u8> = regs::CALLEE_SAVED.iter().rev().copied().collect();
        let mut active: Vec<(usize, ValueId, u8)> = Vec::new();

        let mut pos = 0usize;
        for block in &func.blocks {
            for instr in &block.instrs {
                if let Some(dest) = instr.dest {
                    let value = func
                        .value(dest)
                        .ok_or_else(|| LoweringError::RegisterAllocation(format!("unknown value {dest}")))?;
                    let interval = intervals.get(&dest);
                    let register = match interval {
                        Some(iv) if iv.local && value.ty.is_int() && iv.def == Some(pos) => free.pop(),
                        _ => None,
                    };
                    match register {
                        Some(reg) => {
                            let end = interval.map_or(pos, |iv| iv.last_use.max(pos));
                            active.push((end, dest, reg));
                            self.homes.insert(dest, Home::Gpr(reg));
                        }
                        None if !self.homes.contains_key(&dest) => {
                            self.homes.insert(dest, Home::Slot(self.slots));
                            self.slots += 1;
                        }
                        None => {}
                    }
                }
                // expire everything whose interval ends here, sources included
                active.retain(|&(end, _, reg)| {
                    if end <= pos {
                        free.push(reg);
                        false
                    } else {
                        true
                    }
                });
                pos += 1;
            }
        }

        for value in &func.values {
            if value.is_constant() {
                self.homes.insert(value.id, Home::Constant);
            } else if !self.homes.contains_key(&value.id) {
                // read but never written: still needs storage
                self.homes.insert(value.id, Home::Slot(self.slots));
                self.slots += 1;
            }
        }

        log::trace!(
            "[REGALLOC] {}: {} values, {} in registers, {} spill slots",
            func.name,
            func.values.len(),
            self.homes.values().filter(|h| matches!(h, Home::Gpr(_))).count(),
            self.slots
        );
        Ok(self.slots)
    }

    fn acquire(&mut self, value: ValueId, class: TypeClass, role: Role) -> Result<Home, LoweringError> {
        let home = self
            .homes
            .get(&value)
            .copied()
            .ok_or_else(|| LoweringError::RegisterAllocation(format!("value {value} has no home")))?;
        match (home, class) {
            (Home::Constant, _) if role == Role::Dest => {
                return Err(LoweringError::RegisterAllocation(format!(
                    "constant {value} used as a destination"
                )))
            }
            (Home::Gpr(_), TypeClass::Float | TypeClass::Vec) => {
                return Err(LoweringError::RegisterAllocation(format!(
                    "{value} is homed in a general-purpose register but used as {class:?}"
                )))
            }
            _ => {}
        }
        *self.bound.entry((value, role)).or_insert(0) += 1;
        Ok(home)
    }

    fn release(&mut self, value: ValueId, role: Role) {
        if let Some(count) = self.bound.get_mut(&(value, role)) {
            *count -= 1;
            if *count == 0 {
                self.bound.remove(&(value, role));
            }
        }
    }
}

impl LinearScanAllocator {
    /// Bindings currently held. Zero between instructions.
    pub fn outstanding(&self) -> usize {
        self.bound.values().map(|&n| n as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{Constant, FunctionBuilder, Opcode, TypeName};

    #[test]
    fn test_local_ints_get_callee_saved_registers() {
        let mut b = FunctionBuilder::new("f");
        let a = b.load_context(0, TypeName::Int32);
        let c = b.constant(Constant::Int32(3));
        let sum = b.binary(Opcode::Add, a, c);
        b.store_context(0, sum);
        b.ret();
        let func = b.finish();

        let mut alloc = LinearScanAllocator::new();
        assert_eq!(alloc.prepare(&func).unwrap(), 0);
        let Some(Home::Gpr(ra)) = alloc.home(a) else {
            panic!("a should live in a register");
        };
        let Some(Home::Gpr(rs)) = alloc.home(sum) else {
            panic!("sum should live in a register");
        };
        assert_ne!(ra, rs, "dest must not alias its source");
        assert!(regs::is_allocatable(ra));
        assert_eq!(alloc.home(c), Some(Home::Constant));
    }

    #[test]
    fn test_cross_block_and_float_values_spill() {
        let mut b = FunctionBuilder::new("f");
        let x = b.load_context(0, TypeName::Int64);
        let f = b.load_context(8, TypeName::Float64);
        let next = b.new_label("next");
        b.bind(next);
        b.store_context(16, x);
        b.store_context(24, f);
        b.ret();
        let func = b.finish();

        let mut alloc = LinearScanAllocator::new();
        assert_eq!(alloc.prepare(&func).unwrap(), 2);
        assert!(matches!(alloc.home(x), Some(Home::Slot(_))));
        assert!(matches!(alloc.home(f), Some(Home::Slot(_))));
    }

    #[test]
    fn test_registers_are_reused_after_expiry() {
        let mut b = FunctionBuilder::new("chain");
        let mut v = b.load_context(0, TypeName::Int32);
        for _ in 0..12 {
            v = b.unary(Opcode::Neg, v);
        }
        b.store_context(0, v);
        let func = b.finish();

        let mut alloc = LinearScanAllocator::new();
        assert_eq!(alloc.prepare(&func).unwrap(), 0);
        assert!(func
            .values
            .iter()
            .all(|val| matches!(alloc.home(val.id), Some(Home::Gpr(_)))));
    }

    #[test]
    fn test_acquire_release_pairing() {
        let mut b = FunctionBuilder::new("f");
        let a = b.load_context(0, TypeName::Int8);
        b.store_context(1, a);
        let func = b.finish();

        let mut alloc = LinearScanAllocator::new();
        alloc.prepare(&func).unwrap();
        alloc.acquire(a, TypeClass::Int, Role::Src).unwrap();
        assert_eq!(alloc.outstanding(), 1);
        alloc.release(a, Role::Src);
        assert_eq!(alloc.outstanding(), 0);
        assert!(alloc.acquire(ValueId(99), TypeClass::Int, Role::Src).is_err());
    }
}
