//! Comments, debug markers, calls, returns and branches.

use super::{offset, src, width};
use crate::error::LoweringError;
use crate::hir::{Instr, LabelId, Opcode, Width, ValueId};
use crate::lowering::matcher::Pat::{Absent, Int};
use crate::lowering::matcher::Shape;
use crate::lowering::table::{Flow, LoweringTable, Rule, ALL, INT};
use crate::x64::X64Emitter;
use dynasmrt::{dynasm, DynasmApi, DynasmLabelApi};

pub(super) fn register(table: &mut LoweringTable) {
    table.add(Opcode::Comment, ALL, vec![Rule::new(Shape::any(), "comment", comment)]);
    table.add(Opcode::Nop, ALL, vec![Rule::new(Shape::any(), "nop", nop)]);
    table.add(Opcode::SourceOffset, ALL, vec![Rule::new(Shape::any(), "source_offset", source_offset)]);

    table.add(Opcode::DebugBreak, ALL, vec![Rule::new(Shape::any(), "int3", debug_break)]);
    table.add(
        Opcode::DebugBreakTrue,
        INT,
        vec![Rule::new(Shape::unary(Absent, Int), "int3_if", debug_break_true)],
    );
    table.add(Opcode::Trap, ALL, vec![Rule::new(Shape::any(), "trap", debug_break)]);
    table.add(
        Opcode::TrapTrue,
        INT,
        vec![Rule::new(Shape::unary(Absent, Int), "trap_if", debug_break_true)],
    );

    table.add(Opcode::Call, ALL, vec![Rule::new(Shape::unary(Absent, Absent), "call", call)]);
    table.add(
        Opcode::CallTrue,
        INT,
        vec![Rule::new(Shape::binary(Absent, Int, Absent), "call_if", call_true)],
    );
    table.add(
        Opcode::CallIndirect,
        INT,
        vec![Rule::new(Shape::unary(Absent, Int), "call_indirect", call_indirect)],
    );
    table.add(
        Opcode::CallIndirectTrue,
        INT,
        vec![Rule::new(Shape::binary(Absent, Int, Int), "call_indirect_if", call_indirect_true)],
    );

    table.add(Opcode::Return, ALL, vec![Rule::new(Shape::any(), "return", ret)]);
    table.add(
        Opcode::ReturnTrue,
        INT,
        vec![Rule::new(Shape::unary(Absent, Int), "return_if", ret_true)],
    );
    table.add(Opcode::Branch, ALL, vec![Rule::new(Shape::unary(Absent, Absent), "jmp", branch)]);
    table.add(
        Opcode::BranchTrue,
        INT,
        vec![Rule::new(Shape::binary(Absent, Int, Absent), "jnz", branch_true)],
    );
    table.add(
        Opcode::BranchFalse,
        INT,
        vec![Rule::new(Shape::binary(Absent, Int, Absent), "jz", branch_false)],
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Set ZF from `cond`, or fold it when it is a constant.
pub(super) fn test_cond(e: &mut X64Emitter<'_>, i: &Instr, cond: ValueId) -> Result<Option<bool>, LoweringError> {
    if let Some(c) = e.constant(cond) {
        return Ok(Some(!c.is_zero()));
    }
    let w = width(e, i, cond)?;
    let mut s = e.scope(i.opcode);
    let c = s.src(cond)?;
    int_rr!(s, w, test, c, c);
    s.end()?;
    Ok(None)
}

fn label_operand(i: &Instr, slot: usize) -> Result<LabelId, LoweringError> {
    i.src_label(slot)
        .ok_or_else(|| LoweringError::invalid(i.opcode, format!("src{} is not a label", slot + 1)))
}

/// Run `action` only when `cond` is non-zero.
fn when_true(
    e: &mut X64Emitter<'_>,
    i: &Instr,
    cond: ValueId,
    action: impl FnOnce(&mut X64Emitter<'_>) -> Result<(), LoweringError>,
) -> Result<Flow, LoweringError> {
    match test_cond(e, i, cond)? {
        Some(true) => action(e)?,
        Some(false) => {}
        None => {
            let skip = e.ops.new_dynamic_label();
            dynasm!(e.ops ; jz =>skip);
            action(e)?;
            e.bind_label(skip);
        }
    }
    Ok(Flow::Next)
}

// ═══════════════════════════════════════════════════════════════════════════
// General
// ═══════════════════════════════════════════════════════════════════════════

fn comment(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    if e.config().trace_instructions {
        let index = offset(i, 0)?;
        let text = e
            .func()
            .comment(index)
            .ok_or_else(|| LoweringError::invalid(i.opcode, format!("no comment string {index}")))?;
        e.trace_comment(text);
    }
    Ok(Flow::Next)
}

fn nop(e: &mut X64Emitter<'_>, _i: &Instr) -> Result<Flow, LoweringError> {
    dynasm!(e.ops ; nop);
    Ok(Flow::Next)
}

fn source_offset(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let address = offset(i, 0)?;
    e.mark_source(address);
    Ok(Flow::Next)
}

fn debug_break(e: &mut X64Emitter<'_>, _i: &Instr) -> Result<Flow, LoweringError> {
    dynasm!(e.ops ; int3);
    Ok(Flow::Next)
}

fn debug_break_true(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    when_true(e, i, src(i, 0)?, |e| {
        dynasm!(e.ops ; int3);
        Ok(())
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Calls
// ═══════════════════════════════════════════════════════════════════════════

fn call_symbol_operand(e: &mut X64Emitter<'_>, i: &Instr, slot: usize) -> Result<(), LoweringError> {
    let id = i
        .src_symbol(slot)
        .ok_or_else(|| LoweringError::invalid(i.opcode, format!("src{} is not a symbol", slot + 1)))?;
    let symbol = e
        .func()
        .symbol(id)
        .ok_or_else(|| LoweringError::invalid(i.opcode, format!("unknown symbol {}", id.0)))?;
    e.call_symbol(symbol, i.flags);
    Ok(())
}

fn call(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    call_symbol_operand(e, i, 0)?;
    Ok(Flow::Next)
}

fn call_true(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    when_true(e, i, src(i, 0)?, |e| call_symbol_operand(e, i, 1))
}

fn call_indirect(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    e.call_address(i.opcode, src(i, 0)?, i.flags)?;
    Ok(Flow::Next)
}

fn call_indirect_true(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let target = src(i, 1)?;
    when_true(e, i, src(i, 0)?, |e| e.call_address(i.opcode, target, i.flags))
}

// ═══════════════════════════════════════════════════════════════════════════
// Returns and branches
// ═══════════════════════════════════════════════════════════════════════════

fn ret(e: &mut X64Emitter<'_>, _i: &Instr) -> Result<Flow, LoweringError> {
    // the last instruction falls into the epilogue
    if !e.at_final_instr() {
        let epilog = e.epilog();
        dynasm!(e.ops ; jmp =>epilog);
    }
    Ok(Flow::Next)
}

fn ret_true(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let epilog = e.epilog();
    match test_cond(e, i, src(i, 0)?)? {
        Some(true) => return ret(e, i),
        Some(false) => {}
        None => dynasm!(e.ops ; jnz =>epilog),
    }
    Ok(Flow::Next)
}

fn branch(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    let target = label_operand(i, 0)?;
    let label = e.label(target)?;
    if !e.is_fallthrough(target) {
        dynasm!(e.ops ; jmp =>label);
    }
    Ok(Flow::Next)
}

/// Branch to src2's label when src1 is non-zero (`when`) or zero (`!when`).
fn branch_if(e: &mut X64Emitter<'_>, i: &Instr, when: bool) -> Result<Flow, LoweringError> {
    let target = label_operand(i, 1)?;
    let label = e.label(target)?;
    match test_cond(e, i, src(i, 0)?)? {
        Some(taken) if taken == when => {
            if !e.is_fallthrough(target) {
                dynasm!(e.ops ; jmp =>label);
            }
        }
        Some(_) => {}
        None if when => dynasm!(e.ops ; jnz =>label),
        None => dynasm!(e.ops ; jz =>label),
    }
    Ok(Flow::Next)
}

fn branch_true(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    branch_if(e, i, true)
}

fn branch_false(e: &mut X64Emitter<'_>, i: &Instr) -> Result<Flow, LoweringError> {
    branch_if(e, i, false)
}
