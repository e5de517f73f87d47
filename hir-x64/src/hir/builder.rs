//! Incremental construction of [`HirFunction`]s.
//!
//! The builder appends to the current block; binding a label starts a new
//! block whenever the current one already holds instructions.

use super::function::{Block, FunctionSymbol, HirFunction};
use super::instr::{Instr, LabelId, Operand, SymbolId, Value, ValueId};
use super::opcode::Opcode;
use super::types::{Constant, TypeName};
use std::sync::Arc;

pub struct FunctionBuilder {
    func: HirFunction,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            func: HirFunction {
                name: name.into(),
                blocks: vec![Block::default()],
                ..Default::default()
            },
        }
    }

    pub fn with_address(mut self, address: u64) -> Self {
        self.func.address = address;
        self
    }

    pub fn finish(self) -> HirFunction {
        self.func
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Arena management
    // ═══════════════════════════════════════════════════════════════════════

    /// Fresh live value of type `ty`.
    pub fn value(&mut self, ty: TypeName) -> ValueId {
        self.push_value(ty, None)
    }

    pub fn constant(&mut self, constant: Constant) -> ValueId {
        self.push_value(constant.ty(), Some(constant))
    }

    fn push_value(&mut self, ty: TypeName, constant: Option<Constant>) -> ValueId {
        let id = ValueId(self.func.values.len() as u32);
        self.func.values.push(Value { id, ty, constant });
        id
    }

    pub fn type_of(&self, v: ValueId) -> TypeName {
        self.func.values[v.0 as usize].ty
    }

    pub fn new_label(&mut self, name: impl Into<String>) -> LabelId {
        let id = LabelId(self.func.labels.len() as u32);
        self.func.labels.push(name.into());
        id
    }

    /// Attach `label` to the next instruction appended.
    pub fn bind(&mut self, label: LabelId) {
        if self.current().instrs.is_empty() {
            self.current().labels.push(label);
        } else {
            self.func.blocks.push(Block {
                labels: vec![label],
                instrs: Vec::new(),
            });
        }
    }

    /// Close the current block even without a label.
    pub fn new_block(&mut self) {
        if !self.current().instrs.is_empty() {
            self.func.blocks.push(Block::default());
        }
    }

    pub fn symbol(&mut self, symbol: Arc<FunctionSymbol>) -> SymbolId {
        let id = SymbolId(self.func.symbols.len() as u32);
        self.func.symbols.push(symbol);
        id
    }

    fn current(&mut self) -> &mut Block {
        if self.func.blocks.is_empty() {
            self.func.blocks.push(Block::default());
        }
        let last = self.func.blocks.len() - 1;
        &mut self.func.blocks[last]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Generic emission
    // ═══════════════════════════════════════════════════════════════════════

    pub fn push(&mut self, instr: Instr) {
        self.current().instrs.push(instr);
    }

    /// Append an instruction producing a fresh value of type `ty`.
    pub fn op(&mut self, opcode: Opcode, ty: TypeName, src: &[Operand], flags: u32) -> ValueId {
        let dest = self.value(ty);
        let mut instr = Instr::new(opcode).with_dest(dest).with_flags(flags);
        for (slot, operand) in src.iter().take(3).enumerate() {
            instr.src[slot] = *operand;
        }
        self.push(instr);
        dest
    }

    /// Append an instruction without a destination.
    pub fn op_void(&mut self, opcode: Opcode, src: &[Operand], flags: u32) {
        let mut instr = Instr::new(opcode).with_flags(flags);
        for (slot, operand) in src.iter().take(3).enumerate() {
            instr.src[slot] = *operand;
        }
        self.push(instr);
    }

    /// Result has the type of `a`.
    pub fn unary(&mut self, opcode: Opcode, a: ValueId) -> ValueId {
        let ty = self.type_of(a);
        self.op(opcode, ty, &[a.into()], 0)
    }

    /// Result has the type of `a`.
    pub fn binary(&mut self, opcode: Opcode, a: ValueId, b: ValueId) -> ValueId {
        self.binary_flags(opcode, a, b, 0)
    }

    pub fn binary_flags(&mut self, opcode: Opcode, a: ValueId, b: ValueId, flags: u32) -> ValueId {
        let ty = self.type_of(a);
        self.op(opcode, ty, &[a.into(), b.into()], flags)
    }

    /// Result has the type of `a`.
    pub fn ternary(&mut self, opcode: Opcode, a: ValueId, b: ValueId, c: ValueId) -> ValueId {
        let ty = self.type_of(a);
        self.op(opcode, ty, &[a.into(), b.into(), c.into()], 0)
    }

    /// Width or class change into `ty` (extend, truncate, convert, cast).
    pub fn convert(&mut self, opcode: Opcode, a: ValueId, ty: TypeName) -> ValueId {
        self.op(opcode, ty, &[a.into()], 0)
    }

    /// Scalar comparison producing a boolean.
    pub fn compare(&mut self, opcode: Opcode, a: ValueId, b: ValueId) -> ValueId {
        self.op(opcode, TypeName::Bool, &[a.into(), b.into()], 0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Memory
    // ═══════════════════════════════════════════════════════════════════════

    pub fn load_context(&mut self, offset: u64, ty: TypeName) -> ValueId {
        self.op(Opcode::LoadContext, ty, &[Operand::Offset(offset)], 0)
    }

    pub fn store_context(&mut self, offset: u64, value: ValueId) {
        self.op_void(
            Opcode::StoreContext,
            &[Operand::Offset(offset), value.into()],
            0,
        );
    }

    pub fn load(&mut self, address: ValueId, ty: TypeName) -> ValueId {
        self.op(Opcode::Load, ty, &[address.into()], 0)
    }

    pub fn store(&mut self, address: ValueId, value: ValueId) {
        self.op_void(Opcode::Store, &[address.into(), value.into()], 0);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control flow
    // ═══════════════════════════════════════════════════════════════════════

    pub fn ret(&mut self) {
        self.op_void(Opcode::Return, &[], 0);
    }

    pub fn ret_true(&mut self, cond: ValueId) {
        self.op_void(Opcode::ReturnTrue, &[cond.into()], 0);
    }

    pub fn branch(&mut self, label: LabelId) {
        self.op_void(Opcode::Branch, &[label.into()], 0);
    }

    pub fn branch_true(&mut self, cond: ValueId, label: LabelId) {
        self.op_void(Opcode::BranchTrue, &[cond.into(), label.into()], 0);
    }

    pub fn branch_false(&mut self, cond: ValueId, label: LabelId) {
        self.op_void(Opcode::BranchFalse, &[cond.into(), label.into()], 0);
    }

    pub fn call(&mut self, symbol: SymbolId, flags: u32) {
        self.op_void(Opcode::Call, &[symbol.into()], flags);
    }

    pub fn call_true(&mut self, cond: ValueId, symbol: SymbolId, flags: u32) {
        self.op_void(Opcode::CallTrue, &[cond.into(), symbol.into()], flags);
    }

    pub fn call_indirect(&mut self, target: ValueId, flags: u32) {
        self.op_void(Opcode::CallIndirect, &[target.into()], flags);
    }

    pub fn call_indirect_true(&mut self, cond: ValueId, target: ValueId, flags: u32) {
        self.op_void(Opcode::CallIndirectTrue, &[cond.into(), target.into()], flags);
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        let index = self.func.comments.len() as u64;
        self.func.comments.push(text.into());
        self.op_void(Opcode::Comment, &[Operand::Offset(index)], 0);
    }

    pub fn source_offset(&mut self, guest_address: u64) {
        self.op_void(Opcode::SourceOffset, &[Operand::Offset(guest_address)], 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_splits_blocks() {
        let mut b = FunctionBuilder::new("loop");
        let top = b.new_label("top");
        b.bind(top);
        let one = b.constant(Constant::Int32(1));
        let x = b.load_context(16, TypeName::Int32);
        let y = b.binary(Opcode::Add, x, one);
        b.store_context(16, y);
        let exit = b.new_label("exit");
        b.bind(exit);
        b.ret();
        let func = b.finish();

        assert_eq!(func.blocks.len(), 2);
        assert_eq!(func.blocks[0].labels, vec![top]);
        assert_eq!(func.blocks[1].labels, vec![exit]);
        assert_eq!(func.label_block(exit), Some(1));
        assert_eq!(func.value(y).map(|v| v.ty), Some(TypeName::Int32));
        assert!(func.value(one).is_some_and(Value::is_constant));
    }

    #[test]
    fn test_compare_yields_bool() {
        let mut b = FunctionBuilder::new("cmp");
        let a = b.value(TypeName::Int64);
        let c = b.constant(Constant::Int64(7));
        let r = b.compare(Opcode::CompareSlt, a, c);
        assert_eq!(b.type_of(r), TypeName::Bool);
    }
}
