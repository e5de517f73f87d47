//! Blocks, function symbols and the per-function compilation unit.

use super::instr::{Instr, InstrRef, LabelId, SymbolId, Value, ValueId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// Native handler invoked by an extern shim: `(context, arg0, arg1)`.
pub type ExternHandler = extern "sysv64" fn(*mut u8, u64, u64);

/// Host function reached through a fixed handler and two argument words.
#[derive(Clone, Copy)]
pub struct ExternShim {
    pub handler: ExternHandler,
    pub arg0: u64,
    pub arg1: u64,
}

impl fmt::Debug for ExternShim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternShim")
            .field("handler", &(self.handler as usize as *const u8))
            .field("arg0", &self.arg0)
            .field("arg1", &self.arg1)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    /// Guest code compiled by this backend, reached through resolution.
    #[default]
    User,
    /// Native shim; never serialized.
    #[serde(skip)]
    Extern(ExternShim),
}

/// Guest function descriptor.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FunctionSymbol {
    pub address: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: SymbolKind,
    /// Native entry once the function has been compiled; null before.
    #[serde(skip)]
    entry: AtomicPtr<u8>,
}

impl FunctionSymbol {
    pub fn user(address: u64, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            kind: SymbolKind::User,
            entry: AtomicPtr::default(),
        }
    }

    pub fn external(address: u64, name: impl Into<String>, shim: ExternShim) -> Self {
        Self {
            address,
            name: name.into(),
            kind: SymbolKind::Extern(shim),
            entry: AtomicPtr::default(),
        }
    }

    pub fn is_extern(&self) -> bool {
        matches!(self.kind, SymbolKind::Extern(_))
    }

    /// Resolved native entry, if any.
    pub fn entry(&self) -> Option<*const u8> {
        let ptr = self.entry.load(Ordering::Acquire);
        (!ptr.is_null()).then_some(ptr as *const u8)
    }

    pub fn set_entry(&self, entry: *const u8) {
        self.entry.store(entry as *mut u8, Ordering::Release);
    }
}

/// Straight-line run of instructions with its branch-target labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub labels: Vec<LabelId>,
    pub instrs: Vec<Instr>,
}

/// One compilation unit: a value arena, a label table, a symbol table and
/// the ordered blocks. Block `n + 1` is the positional successor of `n`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HirFunction {
    pub name: String,
    #[serde(default)]
    pub address: u64,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub symbols: Vec<Arc<FunctionSymbol>>,
    /// COMMENT strings, referenced by index from src1.
    #[serde(default)]
    pub comments: Vec<String>,
    pub blocks: Vec<Block>,
}

impl HirFunction {
    pub fn value(&self, id: ValueId) -> Option<&Value> {
        self.values.get(id.0 as usize)
    }

    pub fn symbol(&self, id: SymbolId) -> Option<&Arc<FunctionSymbol>> {
        self.symbols.get(id.0 as usize)
    }

    pub fn comment(&self, index: u64) -> Option<&str> {
        self.comments.get(index as usize).map(String::as_str)
    }

    pub fn label_name(&self, id: LabelId) -> Option<&str> {
        self.labels.get(id.0 as usize).map(String::as_str)
    }

    /// Block that carries `label`.
    pub fn label_block(&self, label: LabelId) -> Option<usize> {
        self.blocks.iter().position(|b| b.labels.contains(&label))
    }

    pub fn instr(&self, at: InstrRef) -> Option<&Instr> {
        self.blocks.get(at.block)?.instrs.get(at.index)
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// True when `at` is the last instruction of the last non-empty block,
    /// so execution falls straight into the epilogue.
    pub fn is_final_instr(&self, at: InstrRef) -> bool {
        let Some(block) = self.blocks.get(at.block) else {
            return false;
        };
        at.index + 1 == block.instrs.len()
            && self.blocks[at.block + 1..].iter().all(|b| b.instrs.is_empty())
    }

    /// Index of the first non-empty block after `block`, i.e. where control
    /// goes when `block` runs off its end.
    pub fn fallthrough_block(&self, block: usize) -> Option<usize> {
        (block + 1..self.blocks.len()).find(|&b| !self.blocks[b].instrs.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{Instr, Opcode};

    fn block(ops: &[Opcode]) -> Block {
        Block {
            labels: Vec::new(),
            instrs: ops.iter().map(|&op| Instr::new(op)).collect(),
        }
    }

    #[test]
    fn test_final_instr_skips_trailing_empty_blocks() {
        let func = HirFunction {
            name: "f".into(),
            blocks: vec![block(&[Opcode::Nop, Opcode::Return]), block(&[])],
            ..Default::default()
        };
        assert!(func.is_final_instr(InstrRef { block: 0, index: 1 }));
        assert!(!func.is_final_instr(InstrRef { block: 0, index: 0 }));
        assert_eq!(func.fallthrough_block(0), None);
    }

    #[test]
    fn test_symbol_entry_starts_unresolved() {
        let sym = FunctionSymbol::user(0x8200_0000, "sub_82000000");
        assert!(sym.entry().is_none());
        let target = 0x1234usize as *const u8;
        sym.set_entry(target);
        assert_eq!(sym.entry(), Some(target));
        assert!(!sym.is_extern());
    }

    #[test]
    fn test_function_json_round_trip() {
        let json = r#"{
            "name": "demo",
            "values": [{"id": 0, "type": "int32"}],
            "symbols": [{"address": 4096}],
            "blocks": [{"instrs": [
                {"opcode": "LOAD_CONTEXT", "dest": 0, "src": [{"offset": 16}, "none", "none"]},
                {"opcode": "RETURN"}
            ]}]
        }"#;
        let func: HirFunction = serde_json::from_str(json).unwrap();
        assert_eq!(func.instruction_count(), 2);
        assert_eq!(func.blocks[0].instrs[0].src_offset(0), Some(16));
        assert_eq!(func.symbols[0].address, 4096);
        assert!(func.symbols[0].entry().is_none());
    }
}
