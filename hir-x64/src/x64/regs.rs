//! Host register assignment.
//!
//! | Register        | Role                                          |
//! |-----------------|-----------------------------------------------|
//! | rdi             | guest context pointer (reloaded after calls)  |
//! | rsi             | guest memory base (reloaded after calls)      |
//! | rax, rcx, rdx   | fixed-constraint temporaries                  |
//! | r8 - r11        | scope scratch for spilled or constant values  |
//! | rbx, r12 - r15  | allocator homes, saved in the prologue        |
//! | xmm0            | temporary                                     |
//! | xmm1 - xmm5     | scope scratch                                 |
//!
//! rsp and rbp are never handed out.

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;
pub const R11: u8 = 11;
pub const R12: u8 = 12;
pub const R13: u8 = 13;
pub const R14: u8 = 14;
pub const R15: u8 = 15;

pub const CONTEXT: u8 = RDI;
pub const MEMBASE: u8 = RSI;

/// Callee-saved registers the default allocator assigns as value homes.
/// Pushed in this order by the prologue.
pub const CALLEE_SAVED: [u8; 5] = [RBX, R12, R13, R14, R15];

/// Integer scratch handed out by an operation scope.
pub const SCRATCH_GPR: [u8; 4] = [R8, R9, R10, R11];

pub const XMM_TEMP: u8 = 0;

/// Vector scratch handed out by an operation scope.
pub const SCRATCH_XMM: [u8; 5] = [1, 2, 3, 4, 5];

pub fn gpr_name(reg: u8) -> &'static str {
    const NAMES: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    NAMES.get(reg as usize).copied().unwrap_or("?")
}

/// True for registers an allocator may use as a value home.
pub fn is_allocatable(reg: u8) -> bool {
    CALLEE_SAVED.contains(&reg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_registers_are_never_homes() {
        for reg in [RAX, RCX, RDX, RSP, RBP, CONTEXT, MEMBASE] {
            assert!(!is_allocatable(reg), "{} must stay reserved", gpr_name(reg));
        }
        for reg in SCRATCH_GPR {
            assert!(!is_allocatable(reg));
        }
        assert!(!SCRATCH_XMM.contains(&XMM_TEMP));
    }
}
