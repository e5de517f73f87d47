//! Lowering driver: one HIR function in, one executable buffer out.

use super::table::{Flow, LoweringTable};
use crate::config::LoweringConfig;
use crate::error::LoweringError;
use crate::hir::{FunctionSymbol, HirFunction, Instr, InstrRef};
use crate::runtime::thunks::GuestEntry;
use crate::runtime::GuestRuntime;
use crate::x64::{FrameLayout, LinearScanAllocator, RegisterAllocator, X64Emitter};
use dynasmrt::{AssemblyOffset, ExecutableBuffer};
use serde::Serialize;
use std::sync::Arc;

/// Counters gathered while lowering one function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoweringStats {
    /// HIR instructions consumed, fused ones included.
    pub instructions: usize,
    /// Guest and extern calls (helper calls are not counted).
    pub calls: usize,
    /// Loads and stores redirected to an access handler.
    pub mmio_redirections: usize,
    pub tracer_calls: usize,
    /// Bytes of machine code and inline data.
    pub code_size: usize,
}

/// Guest address to native offset pair recorded at SOURCE_OFFSET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceMapEntry {
    pub guest_address: u64,
    pub native_offset: usize,
}

/// Executable result of [`Compiler::compile`].
///
/// Holds the runtime and every symbol the code embeds a pointer to, so the
/// code stays callable for as long as this value lives.
pub struct CompiledFunction {
    name: String,
    address: u64,
    buffer: ExecutableBuffer,
    entry: AssemblyOffset,
    epilog: AssemblyOffset,
    frame: FrameLayout,
    source_map: Vec<SourceMapEntry>,
    stats: LoweringStats,
    _runtime: Arc<GuestRuntime>,
    _symbols: Vec<Arc<FunctionSymbol>>,
}

impl CompiledFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Guest address of the source function.
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn entry(&self) -> GuestEntry {
        // SAFETY: the buffer starts with a prologue following GuestEntry's ABI
        unsafe { std::mem::transmute::<*const u8, GuestEntry>(self.entry_ptr()) }
    }

    pub fn entry_ptr(&self) -> *const u8 {
        self.buffer.ptr(self.entry)
    }

    /// Offset of the shared return path.
    pub fn epilog_offset(&self) -> usize {
        self.epilog.0
    }

    /// Machine code followed by inline data.
    pub fn code(&self) -> &[u8] {
        &self.buffer
    }

    pub fn frame(&self) -> &FrameLayout {
        &self.frame
    }

    pub fn source_map(&self) -> &[SourceMapEntry] {
        &self.source_map
    }

    pub fn stats(&self) -> &LoweringStats {
        &self.stats
    }

    /// Run the function.
    ///
    /// # Safety
    ///
    /// `context` must point to a context block covering every offset the
    /// function accesses, and `membase` to a guest memory mapping covering
    /// every address it loads or stores (4 GiB for arbitrary addresses).
    pub unsafe fn call(&self, context: *mut u8, membase: *mut u8) {
        (self.entry())(context, membase)
    }
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .field("address", &format_args!("{:#x}", self.address))
            .field("entry", &self.entry_ptr())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Lowers HIR functions. One compiler per thread; the table and runtime are
/// shared.
pub struct Compiler {
    table: Arc<LoweringTable>,
    runtime: Arc<GuestRuntime>,
    config: LoweringConfig,
    allocator: Box<dyn RegisterAllocator>,
}

impl Compiler {
    pub fn new(table: Arc<LoweringTable>, runtime: Arc<GuestRuntime>, config: LoweringConfig) -> Self {
        Self {
            table,
            runtime,
            config,
            allocator: Box::new(LinearScanAllocator::new()),
        }
    }

    /// Replace the default allocator.
    pub fn with_allocator(mut self, allocator: Box<dyn RegisterAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn config(&self) -> &LoweringConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<GuestRuntime> {
        &self.runtime
    }

    /// Lower `func` into executable code.
    pub fn compile(&mut self, func: &HirFunction) -> Result<CompiledFunction, LoweringError> {
        log::debug!(
            "[LOWER] Compiling '{}' at {:#x} ({} instructions)",
            func.name,
            func.address,
            func.instruction_count()
        );
        match self.lower(func) {
            Ok(compiled) => {
                log::debug!(
                    "[LOWER] Compiled '{}': {} bytes, {} calls, {} spill slots",
                    func.name,
                    compiled.stats.code_size,
                    compiled.stats.calls,
                    compiled.frame.spill_slots
                );
                if self.config.debug_listing {
                    log::debug!("[LOWER] {}: {}", func.name, hex::encode(compiled.code()));
                }
                Ok(compiled)
            }
            Err(e) => {
                log::debug!("[LOWER] Failed to compile '{}': {}", func.name, e);
                Err(e)
            }
        }
    }

    fn lower(&mut self, func: &HirFunction) -> Result<CompiledFunction, LoweringError> {
        if let Some(instr) = func
            .blocks
            .iter()
            .flat_map(|b| &b.instrs)
            .nth(self.config.max_instructions)
        {
            return Err(LoweringError::invalid(
                instr.opcode,
                format!(
                    "function has {} instructions, limit is {}",
                    func.instruction_count(),
                    self.config.max_instructions
                ),
            ));
        }

        let slots = self.allocator.prepare(func)?;
        let table = &self.table;
        let mut e = X64Emitter::new(func, &self.runtime, &self.config, self.allocator.as_mut(), slots)?;
        e.prologue();

        for (b, block) in func.blocks.iter().enumerate() {
            for &label in &block.labels {
                let label = e.label(label)?;
                e.bind_label(label);
            }
            let mut index = 0;
            while index < block.instrs.len() {
                e.set_cursor(InstrRef { block: b, index });
                let consumed = match lower_instr(table, &mut e, &block.instrs[index])? {
                    Flow::Next => 1,
                    Flow::Skip(n) => 1 + n,
                };
                e.stats.instructions += consumed;
                index += consumed;
            }
        }

        let emitted = e.finish()?;
        Ok(CompiledFunction {
            name: func.name.clone(),
            address: func.address,
            buffer: emitted.buffer,
            entry: emitted.entry,
            epilog: emitted.epilog,
            frame: emitted.frame,
            source_map: emitted.source_map,
            stats: emitted.stats,
            _runtime: Arc::clone(&self.runtime),
            _symbols: func.symbols.clone(),
        })
    }
}

fn lower_instr(table: &LoweringTable, e: &mut X64Emitter<'_>, instr: &Instr) -> Result<Flow, LoweringError> {
    let func = e.func();
    let entry = table
        .entry(instr.opcode)
        .ok_or_else(|| LoweringError::unimplemented(instr.opcode, super::signature(func, instr)))?;
    let rule = entry.select(func, instr)?;
    log::trace!("[LOWER] {} -> {}", instr.opcode, rule.name);
    (rule.emit)(e, instr)
}
