//! Assembler wrapper for one compilation unit.
//!
//! Owns the dynasm assembler, the label table, the frame layout and the
//! inline data emitted after the epilogue. Emission paths reach it through an
//! [`OpScope`](super::scope::OpScope) or directly for operand-free sequences.

use super::frame::{offsets, FrameLayout};
use super::regalloc::{Home, RegisterAllocator, Role};
use super::scope::OpScope;
use crate::config::LoweringConfig;
use crate::error::LoweringError;
use crate::hir::{Constant, HirFunction, Instr, InstrRef, LabelId, Opcode, TypeClass, TypeName, Value, ValueId};
use crate::lowering::{LoweringStats, SourceMapEntry};
use crate::runtime::GuestRuntime;
use dynasmrt::x64::Assembler;
use dynasmrt::{dynasm, AssemblyOffset, DynamicLabel, DynasmApi, DynasmLabelApi, ExecutableBuffer};
use std::collections::HashMap;

/// Machine code and offsets produced by [`X64Emitter::finish`].
pub(crate) struct Emitted {
    pub buffer: ExecutableBuffer,
    pub entry: AssemblyOffset,
    pub epilog: AssemblyOffset,
    pub frame: FrameLayout,
    pub source_map: Vec<SourceMapEntry>,
    pub stats: LoweringStats,
}

pub struct X64Emitter<'a> {
    pub(crate) ops: Assembler,
    func: &'a HirFunction,
    runtime: &'a GuestRuntime,
    config: &'a LoweringConfig,
    allocator: &'a mut dyn RegisterAllocator,
    labels: Vec<DynamicLabel>,
    epilog: DynamicLabel,
    frame: FrameLayout,
    data: Vec<(DynamicLabel, Vec<u8>)>,
    source_map: Vec<SourceMapEntry>,
    pub(crate) stats: LoweringStats,
    cursor: InstrRef,
    uses: HashMap<ValueId, u32>,
}

impl<'a> X64Emitter<'a> {
    pub(crate) fn new(
        func: &'a HirFunction,
        runtime: &'a GuestRuntime,
        config: &'a LoweringConfig,
        allocator: &'a mut dyn RegisterAllocator,
        spill_slots: u32,
    ) -> Result<Self, LoweringError> {
        let mut ops = Assembler::new().map_err(|e| LoweringError::Assembler(e.to_string()))?;
        let labels = (0..func.labels.len()).map(|_| ops.new_dynamic_label()).collect();
        let epilog = ops.new_dynamic_label();
        let mut uses = HashMap::new();
        for instr in func.blocks.iter().flat_map(|b| &b.instrs) {
            for value in instr.used_values() {
                *uses.entry(value).or_insert(0) += 1;
            }
        }
        Ok(Self {
            ops,
            func,
            runtime,
            config,
            allocator,
            labels,
            epilog,
            frame: FrameLayout::new(spill_slots),
            data: Vec::new(),
            source_map: Vec::new(),
            stats: LoweringStats::default(),
            cursor: InstrRef { block: 0, index: 0 },
            uses,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn func(&self) -> &'a HirFunction {
        self.func
    }

    pub fn config(&self) -> &'a LoweringConfig {
        self.config
    }

    pub(crate) fn runtime(&self) -> &'a GuestRuntime {
        self.runtime
    }

    /// Runtime pointer as baked into generated code.
    pub(crate) fn runtime_ptr(&self) -> i64 {
        self.runtime as *const GuestRuntime as i64
    }

    pub fn cursor(&self) -> InstrRef {
        self.cursor
    }

    pub(crate) fn set_cursor(&mut self, cursor: InstrRef) {
        self.cursor = cursor;
    }

    pub fn value(&self, id: ValueId) -> Result<&'a Value, LoweringError> {
        self.func
            .value(id)
            .ok_or_else(|| LoweringError::RegisterAllocation(format!("unknown value {id}")))
    }

    pub fn value_type(&self, id: ValueId) -> Result<TypeName, LoweringError> {
        Ok(self.value(id)?.ty)
    }

    /// Constant payload of `id`, if it is a constant.
    pub fn constant(&self, id: ValueId) -> Option<Constant> {
        self.func.value(id).and_then(|v| v.constant)
    }

    pub fn label(&self, id: LabelId) -> Result<DynamicLabel, LoweringError> {
        self.labels
            .get(id.0 as usize)
            .copied()
            .ok_or(LoweringError::UnknownLabel(id))
    }

    pub fn epilog(&self) -> DynamicLabel {
        self.epilog
    }

    pub fn frame(&self) -> &FrameLayout {
        &self.frame
    }

    /// Number of instructions reading `id`.
    pub fn use_count(&self, id: ValueId) -> u32 {
        self.uses.get(&id).copied().unwrap_or(0)
    }

    /// Instruction following the current one in the same block.
    pub fn next_instr(&self) -> Option<&'a Instr> {
        self.func.instr(InstrRef {
            block: self.cursor.block,
            index: self.cursor.index + 1,
        })
    }

    /// True when the current instruction is the last one before the epilogue.
    pub fn at_final_instr(&self) -> bool {
        self.func.is_final_instr(self.cursor)
    }

    /// True when `label` is bound to the block control reaches by running
    /// off the end of the current block.
    pub fn is_fallthrough(&self, label: LabelId) -> bool {
        let block = &self.func.blocks[self.cursor.block];
        if self.cursor.index + 1 != block.instrs.len() {
            return false;
        }
        match (self.func.fallthrough_block(self.cursor.block), self.func.label_block(label)) {
            (Some(next), Some(target)) => {
                // every block between here and the target is empty
                next == target || (self.cursor.block < target && target < next)
            }
            _ => false,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Register allocation
    // ═══════════════════════════════════════════════════════════════════════

    /// Open an operand scope for one emitted operation.
    pub fn scope(&mut self, opcode: Opcode) -> OpScope<'_, 'a> {
        OpScope::new(self, opcode)
    }

    pub(crate) fn acquire(&mut self, value: ValueId, class: TypeClass, role: Role) -> Result<Home, LoweringError> {
        self.allocator.acquire(value, class, role)
    }

    pub(crate) fn release(&mut self, value: ValueId, role: Role) {
        self.allocator.release(value, role)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Frame
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn prologue(&mut self) {
        let frame = self.frame.frame_size as i32;
        let (ctx, mem) = (offsets::CONTEXT, offsets::MEMBASE);
        dynasm!(self.ops
            ; push rbx
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; sub rsp, frame
            ; mov QWORD [rsp + ctx], rdi
            ; mov QWORD [rsp + mem], rsi
        );
    }

    /// Drop the frame and restore callee-saved registers, leaving the return
    /// address on top of the stack.
    pub(crate) fn teardown(&mut self) {
        let frame = self.frame.frame_size as i32;
        dynasm!(self.ops
            ; add rsp, frame
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbx
        );
    }

    /// Restore the context and membase registers after a call.
    pub(crate) fn reload_context(&mut self) {
        let (ctx, mem) = (offsets::CONTEXT, offsets::MEMBASE);
        dynasm!(self.ops
            ; mov rdi, QWORD [rsp + ctx]
            ; mov rsi, QWORD [rsp + mem]
        );
    }

    pub(crate) fn bind_label(&mut self, label: DynamicLabel) {
        dynasm!(self.ops ; =>label);
    }

    /// Record a guest address to native offset pair.
    pub(crate) fn mark_source(&mut self, guest_address: u64) {
        if self.config.emit_source_map {
            let native_offset = self.ops.offset().0;
            self.source_map.push(SourceMapEntry {
                guest_address,
                native_offset,
            });
        }
    }

    /// Queue bytes to be placed after the epilogue; returns their label.
    pub(crate) fn add_data(&mut self, bytes: Vec<u8>) -> DynamicLabel {
        let label = self.ops.new_dynamic_label();
        self.data.push((label, bytes));
        label
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Constants
    // ═══════════════════════════════════════════════════════════════════════

    /// Load an integer constant without touching the flags.
    pub(crate) fn load_constant_gpr(&mut self, reg: u8, constant: &Constant) {
        let bits = constant.bits();
        match constant.as_i64() {
            Some(v) if matches!(constant, Constant::Int64(_)) && i32::try_from(v).is_ok() => {
                dynasm!(self.ops ; mov Rq(reg), v as i32)
            }
            _ if bits <= u32::MAX as u64 => dynasm!(self.ops ; mov Rd(reg), bits as i32),
            _ => dynasm!(self.ops ; mov Rq(reg), QWORD bits as i64),
        }
    }

    /// Load a float or vector constant. Clobbers rax and xmm0.
    pub(crate) fn load_constant_xmm(&mut self, reg: u8, constant: &Constant) {
        match *constant {
            Constant::Vec128(v) if v.low == 0 && v.high == 0 => {
                dynasm!(self.ops ; pxor Rx(reg), Rx(reg))
            }
            Constant::Vec128(v) => dynasm!(self.ops
                ; mov rax, QWORD v.low as i64
                ; movq Rx(reg), rax
                ; mov rax, QWORD v.high as i64
                ; movq xmm0, rax
                ; punpcklqdq Rx(reg), xmm0
            ),
            Constant::Float32(f) => dynasm!(self.ops
                ; mov eax, f.to_bits() as i32
                ; movd Rx(reg), eax
            ),
            _ => dynasm!(self.ops
                ; mov rax, QWORD constant.bits() as i64
                ; movq Rx(reg), rax
            ),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Finalization
    // ═══════════════════════════════════════════════════════════════════════

    /// Emit the epilogue and inline data, then map the code executable.
    pub(crate) fn finish(mut self) -> Result<Emitted, LoweringError> {
        let epilog = self.epilog;
        dynasm!(self.ops ; =>epilog);
        let epilog_offset = self.ops.offset();
        self.teardown();
        dynasm!(self.ops ; ret);

        for (label, bytes) in std::mem::take(&mut self.data) {
            dynasm!(self.ops ; =>label);
            self.ops.extend(bytes.iter().copied());
        }

        self.stats.code_size = self.ops.offset().0;
        let buffer = self
            .ops
            .finalize()
            .map_err(|_| LoweringError::Assembler("failed to finalize executable buffer".into()))?;
        Ok(Emitted {
            buffer,
            entry: AssemblyOffset(0),
            epilog: epilog_offset,
            frame: self.frame,
            source_map: self.source_map,
            stats: self.stats,
        })
    }
}
