//! Native stack frame of a compiled function.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Offset from rsp  │ Size       │ Contents                 │
//! ├──────────────────────────────────────────────────────────┤
//! │ 0x00             │ 8          │ saved context (rdi)      │
//! │ 0x08             │ 8          │ saved membase (rsi)      │
//! │ 0x10             │ 4 × 16     │ call temporaries         │
//! │ 0x50             │ n × 16     │ spill slots              │
//! │ frame size       │ 5 × 8      │ rbx, r12-r15 (pushed)    │
//! │ frame size + 40  │ 8          │ return address           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The caller's rsp is 8 mod 16 at entry; five pushes make it 0 mod 16 and
//! the frame size is a multiple of 16, so calls made from the body see an
//! aligned stack.

use super::regs;
use serde::Serialize;

pub mod offsets {
    /// Saved guest context pointer.
    pub const CONTEXT: i32 = 0x00;
    /// Saved guest memory base.
    pub const MEMBASE: i32 = 0x08;
    /// First of the 16-byte temporaries used to pass values to helpers.
    pub const TEMPS: i32 = 0x10;
    pub const TEMP_SIZE: i32 = 16;
    pub const TEMP_COUNT: i32 = 4;
    /// First spill slot.
    pub const SLOTS: i32 = TEMPS + TEMP_SIZE * TEMP_COUNT; // 0x50
    pub const SLOT_SIZE: i32 = 16;
}

/// Frame metadata reported with every compiled function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameLayout {
    /// Bytes reserved below the pushed registers.
    pub frame_size: u32,
    pub spill_slots: u32,
    /// Callee-saved registers in push order.
    pub saved_registers: Vec<&'static str>,
}

impl FrameLayout {
    pub fn new(spill_slots: u32) -> Self {
        let frame_size = offsets::SLOTS as u32 + spill_slots * offsets::SLOT_SIZE as u32;
        Self {
            frame_size,
            spill_slots,
            saved_registers: regs::CALLEE_SAVED.iter().map(|&r| regs::gpr_name(r)).collect(),
        }
    }

    /// rsp-relative offset of spill slot `slot`.
    pub fn slot(slot: u32) -> i32 {
        offsets::SLOTS + slot as i32 * offsets::SLOT_SIZE
    }

    /// rsp-relative offset of call temporary `index`.
    pub fn temp(index: usize) -> i32 {
        offsets::TEMPS + index as i32 * offsets::TEMP_SIZE
    }
}
