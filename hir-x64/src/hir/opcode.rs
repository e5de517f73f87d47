//! HIR opcodes and their flag encodings.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opcodes {
    ($($variant:ident => $name:literal,)*) => {
        /// Every operation the lowering table knows about.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum Opcode {
            $(#[serde(rename = $name)] $variant,)*
        }

        impl Opcode {
            /// All opcodes in declaration order; `ALL[op.index()] == op`.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            /// Canonical upper-case name.
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }
        }
    };
}

opcodes! {
    Comment => "COMMENT",
    Nop => "NOP",
    SourceOffset => "SOURCE_OFFSET",
    DebugBreak => "DEBUG_BREAK",
    DebugBreakTrue => "DEBUG_BREAK_TRUE",
    Trap => "TRAP",
    TrapTrue => "TRAP_TRUE",
    Call => "CALL",
    CallTrue => "CALL_TRUE",
    CallIndirect => "CALL_INDIRECT",
    CallIndirectTrue => "CALL_INDIRECT_TRUE",
    Return => "RETURN",
    ReturnTrue => "RETURN_TRUE",
    Branch => "BRANCH",
    BranchTrue => "BRANCH_TRUE",
    BranchFalse => "BRANCH_FALSE",
    Assign => "ASSIGN",
    Cast => "CAST",
    ZeroExtend => "ZERO_EXTEND",
    SignExtend => "SIGN_EXTEND",
    Truncate => "TRUNCATE",
    Convert => "CONVERT",
    Round => "ROUND",
    VectorConvertI2F => "VECTOR_CONVERT_I2F",
    VectorConvertF2I => "VECTOR_CONVERT_F2I",
    LoadVectorShl => "LOAD_VECTOR_SHL",
    LoadVectorShr => "LOAD_VECTOR_SHR",
    LoadClock => "LOAD_CLOCK",
    LoadContext => "LOAD_CONTEXT",
    StoreContext => "STORE_CONTEXT",
    Load => "LOAD",
    Store => "STORE",
    Prefetch => "PREFETCH",
    Max => "MAX",
    Min => "MIN",
    Select => "SELECT",
    IsTrue => "IS_TRUE",
    IsFalse => "IS_FALSE",
    CompareEq => "COMPARE_EQ",
    CompareNe => "COMPARE_NE",
    CompareSlt => "COMPARE_SLT",
    CompareSle => "COMPARE_SLE",
    CompareSgt => "COMPARE_SGT",
    CompareSge => "COMPARE_SGE",
    CompareUlt => "COMPARE_ULT",
    CompareUle => "COMPARE_ULE",
    CompareUgt => "COMPARE_UGT",
    CompareUge => "COMPARE_UGE",
    DidCarry => "DID_CARRY",
    DidOverflow => "DID_OVERFLOW",
    DidSaturate => "DID_SATURATE",
    VectorCompareEq => "VECTOR_COMPARE_EQ",
    VectorCompareSgt => "VECTOR_COMPARE_SGT",
    VectorCompareSge => "VECTOR_COMPARE_SGE",
    VectorCompareUgt => "VECTOR_COMPARE_UGT",
    VectorCompareUge => "VECTOR_COMPARE_UGE",
    Add => "ADD",
    AddCarry => "ADD_CARRY",
    VectorAdd => "VECTOR_ADD",
    Sub => "SUB",
    Mul => "MUL",
    MulHi => "MUL_HI",
    Div => "DIV",
    MulAdd => "MUL_ADD",
    MulSub => "MUL_SUB",
    Neg => "NEG",
    Abs => "ABS",
    Sqrt => "SQRT",
    Rsqrt => "RSQRT",
    Pow2 => "POW2",
    Log2 => "LOG2",
    DotProduct3 => "DOT_PRODUCT_3",
    DotProduct4 => "DOT_PRODUCT_4",
    And => "AND",
    Or => "OR",
    Xor => "XOR",
    Not => "NOT",
    Shl => "SHL",
    Shr => "SHR",
    Sha => "SHA",
    VectorShl => "VECTOR_SHL",
    VectorShr => "VECTOR_SHR",
    VectorSha => "VECTOR_SHA",
    RotateLeft => "ROTATE_LEFT",
    ByteSwap => "BYTE_SWAP",
    Cntlz => "CNTLZ",
    Insert => "INSERT",
    Extract => "EXTRACT",
    Splat => "SPLAT",
    Permute => "PERMUTE",
    Swizzle => "SWIZZLE",
    Pack => "PACK",
    Unpack => "UNPACK",
    CompareExchange => "COMPARE_EXCHANGE",
    AtomicExchange => "ATOMIC_EXCHANGE",
    AtomicAdd => "ATOMIC_ADD",
    AtomicSub => "ATOMIC_SUB",
}

impl Opcode {
    pub const COUNT: usize = Opcode::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    /// True for opcodes that may transfer control out of the straight-line
    /// stream of their block.
    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            Opcode::Call
                | Opcode::CallTrue
                | Opcode::CallIndirect
                | Opcode::CallIndirectTrue
                | Opcode::Return
                | Opcode::ReturnTrue
                | Opcode::Branch
                | Opcode::BranchTrue
                | Opcode::BranchFalse
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Instruction flag encodings.
///
/// The low nibble carries an element or format tag for vector opcodes;
/// arithmetic modifiers live above it so both can be combined.
pub mod flags {
    use crate::hir::types::TypeName;

    /// CALL*: discard the current frame and jump to the target.
    pub const CALL_TAIL: u32 = 1 << 0;

    pub const ARITHMETIC_SATURATE: u32 = 1 << 8;
    pub const ARITHMETIC_UNSIGNED: u32 = 1 << 9;

    /// ROUND / CONVERT rounding modes.
    pub const ROUND_TO_ZERO: u32 = 0;
    pub const ROUND_TO_NEAREST: u32 = 1;
    pub const ROUND_TO_MINUS_INFINITY: u32 = 2;
    pub const ROUND_TO_POSITIVE_INFINITY: u32 = 3;
    pub const ROUND_MASK: u32 = 0x3;

    /// PACK / UNPACK format tags.
    pub const PACK_TYPE_D3DCOLOR: u32 = 0;
    pub const PACK_TYPE_FLOAT16_2: u32 = 1;
    pub const PACK_TYPE_FLOAT16_4: u32 = 2;
    pub const PACK_TYPE_SHORT_2: u32 = 3;
    pub const PACK_TYPE_S8_IN_16_LO: u32 = 4;
    pub const PACK_TYPE_S8_IN_16_HI: u32 = 5;
    pub const PACK_TYPE_S16_IN_32_LO: u32 = 6;
    pub const PACK_TYPE_S16_IN_32_HI: u32 = 7;

    pub const ELEMENT_MASK: u32 = 0xF;

    /// Element type of a vector opcode.
    pub fn element(flags: u32) -> Option<TypeName> {
        TypeName::from_index(flags & ELEMENT_MASK)
    }

    /// Encode an element type with arithmetic modifiers.
    pub fn vector(element: TypeName, arithmetic: u32) -> u32 {
        element as u32 | arithmetic
    }

    pub fn is_unsigned(flags: u32) -> bool {
        flags & ARITHMETIC_UNSIGNED != 0
    }

    pub fn is_saturate(flags: u32) -> bool {
        flags & ARITHMETIC_SATURATE != 0
    }

    /// Logical lane selector mask for SWIZZLE: source lane per x, y, z, w.
    pub fn swizzle_mask(x: u8, y: u8, z: u8, w: u8) -> u64 {
        ((x & 3) | (y & 3) << 2 | (z & 3) << 4 | (w & 3) << 6) as u64
    }

    /// PERMUTE control for 32-bit lanes. Each `(select, lane)` picks
    /// `lane` of src2 (`select == 0`) or src3 (`select == 1`).
    pub fn permute_mask(lanes: [(u8, u8); 4]) -> u32 {
        lanes
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, &(select, lane))| {
                acc | ((((select & 1) << 2) | (lane & 3)) as u32) << (8 * i)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_indices_are_dense() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(op.index(), i, "{op} out of order");
        }
        assert_eq!(Opcode::COUNT, 97);
    }

    #[test]
    fn test_opcode_json_names() {
        let json = serde_json::to_string(&Opcode::ZeroExtend).unwrap();
        assert_eq!(json, "\"ZERO_EXTEND\"");
        let op: Opcode = serde_json::from_str("\"VECTOR_CONVERT_I2F\"").unwrap();
        assert_eq!(op, Opcode::VectorConvertI2F);
        assert_eq!(op.name(), "VECTOR_CONVERT_I2F");
    }

    #[test]
    fn test_flag_helpers() {
        use crate::hir::TypeName;
        let f = flags::vector(TypeName::Int16, flags::ARITHMETIC_UNSIGNED);
        assert_eq!(flags::element(f), Some(TypeName::Int16));
        assert!(flags::is_unsigned(f));
        assert!(!flags::is_saturate(f));
        assert_eq!(flags::swizzle_mask(3, 2, 1, 0), 0x1B);
        assert_eq!(flags::permute_mask([(0, 0), (1, 1), (0, 2), (1, 3)]), 0x0702_0500);
    }
}
