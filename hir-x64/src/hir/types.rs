//! Type tags and constant storage for HIR values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag carried by every HIR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TypeName {
    Int8 = 0,
    Int16 = 1,
    Int32 = 2,
    Int64 = 3,
    Float32 = 4,
    Float64 = 5,
    Vec128 = 6,
    /// Byte-sized 0/1 value produced by comparisons.
    Bool = 7,
}

/// Operand class used by the matcher and the register allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeClass {
    Int,
    Float,
    Vec,
}

/// Integer operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    B8,
    B16,
    B32,
    B64,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::B8 => 8,
            Width::B16 => 16,
            Width::B32 => 32,
            Width::B64 => 64,
        }
    }

    pub fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Mask covering the low `bits()` bits.
    pub fn mask(self) -> u64 {
        match self {
            Width::B64 => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }
}

impl TypeName {
    /// Decode a type stored in the low nibble of an instruction's flags.
    pub fn from_index(index: u32) -> Option<TypeName> {
        Some(match index {
            0 => TypeName::Int8,
            1 => TypeName::Int16,
            2 => TypeName::Int32,
            3 => TypeName::Int64,
            4 => TypeName::Float32,
            5 => TypeName::Float64,
            6 => TypeName::Vec128,
            7 => TypeName::Bool,
            _ => return None,
        })
    }

    pub fn class(self) -> TypeClass {
        match self {
            TypeName::Float32 | TypeName::Float64 => TypeClass::Float,
            TypeName::Vec128 => TypeClass::Vec,
            _ => TypeClass::Int,
        }
    }

    pub fn is_int(self) -> bool {
        self.class() == TypeClass::Int
    }

    pub fn is_float(self) -> bool {
        self.class() == TypeClass::Float
    }

    pub fn is_vec(self) -> bool {
        self.class() == TypeClass::Vec
    }

    /// Type used for shape matching. Booleans share every Int8 path.
    pub fn storage(self) -> TypeName {
        match self {
            TypeName::Bool => TypeName::Int8,
            t => t,
        }
    }

    /// Integer width, `None` for float and vector types.
    pub fn width(self) -> Option<Width> {
        match self.storage() {
            TypeName::Int8 => Some(Width::B8),
            TypeName::Int16 => Some(Width::B16),
            TypeName::Int32 => Some(Width::B32),
            TypeName::Int64 => Some(Width::B64),
            _ => None,
        }
    }

    /// Size in bytes.
    pub fn size(self) -> usize {
        match self {
            TypeName::Int8 | TypeName::Bool => 1,
            TypeName::Int16 => 2,
            TypeName::Int32 | TypeName::Float32 => 4,
            TypeName::Int64 | TypeName::Float64 => 8,
            TypeName::Vec128 => 16,
        }
    }

    pub fn bits(self) -> u32 {
        self.size() as u32 * 8
    }

    /// Short lowercase name used in rendered signatures.
    pub fn short_name(self) -> &'static str {
        match self {
            TypeName::Int8 => "i8",
            TypeName::Int16 => "i16",
            TypeName::Int32 => "i32",
            TypeName::Int64 => "i64",
            TypeName::Float32 => "f32",
            TypeName::Float64 => "f64",
            TypeName::Vec128 => "v128",
            TypeName::Bool => "bool",
        }
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Vector constants
// ═══════════════════════════════════════════════════════════════════════════

/// 128-bit vector stored as its host register image.
///
/// `low` holds physical lanes 0-1 and `high` physical lanes 2-3. Guest code
/// addresses lanes logically as x, y, z, w, which sit in physical lanes
/// 3, 2, 1, 0 respectively; use [`Vec128::from_lanes`] and
/// [`Vec128::lanes`] to work in logical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Vec128 {
    pub low: u64,
    pub high: u64,
}

impl Vec128 {
    pub const ZERO: Vec128 = Vec128 { low: 0, high: 0 };

    pub fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    /// Build from physical 32-bit lanes (index 0 is the least significant).
    pub fn from_physical(p: [u32; 4]) -> Self {
        Self {
            low: p[0] as u64 | (p[1] as u64) << 32,
            high: p[2] as u64 | (p[3] as u64) << 32,
        }
    }

    /// Physical 32-bit lanes, least significant first.
    pub fn physical(self) -> [u32; 4] {
        [
            self.low as u32,
            (self.low >> 32) as u32,
            self.high as u32,
            (self.high >> 32) as u32,
        ]
    }

    /// Build from logical `[x, y, z, w]` lanes.
    pub fn from_lanes(lanes: [u32; 4]) -> Self {
        Self::from_physical(reverse(lanes))
    }

    /// Logical `[x, y, z, w]` lanes.
    pub fn lanes(self) -> [u32; 4] {
        reverse(self.physical())
    }

    pub fn from_f32_lanes(lanes: [f32; 4]) -> Self {
        Self::from_lanes(lanes.map(f32::to_bits))
    }

    pub fn f32_lanes(self) -> [f32; 4] {
        self.lanes().map(f32::from_bits)
    }

    pub fn splat(value: u32) -> Self {
        Self::from_lanes([value; 4])
    }

    /// Register image as bytes in memory order.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.low.to_le_bytes());
        out[8..].copy_from_slice(&self.high.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut low = [0u8; 8];
        let mut high = [0u8; 8];
        low.copy_from_slice(&bytes[..8]);
        high.copy_from_slice(&bytes[8..]);
        Self {
            low: u64::from_le_bytes(low),
            high: u64::from_le_bytes(high),
        }
    }
}

fn reverse(lanes: [u32; 4]) -> [u32; 4] {
    [lanes[3], lanes[2], lanes[1], lanes[0]]
}

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Constant operand. The variant determines the type tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Constant {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Vec128(Vec128),
    Bool(bool),
}

impl Constant {
    pub fn ty(&self) -> TypeName {
        match self {
            Constant::Int8(_) => TypeName::Int8,
            Constant::Int16(_) => TypeName::Int16,
            Constant::Int32(_) => TypeName::Int32,
            Constant::Int64(_) => TypeName::Int64,
            Constant::Float32(_) => TypeName::Float32,
            Constant::Float64(_) => TypeName::Float64,
            Constant::Vec128(_) => TypeName::Vec128,
            Constant::Bool(_) => TypeName::Bool,
        }
    }

    /// Raw bit pattern, zero-extended to 64 bits. Vectors yield their low half.
    pub fn bits(&self) -> u64 {
        match *self {
            Constant::Int8(v) => v as u8 as u64,
            Constant::Int16(v) => v as u16 as u64,
            Constant::Int32(v) => v as u32 as u64,
            Constant::Int64(v) => v as u64,
            Constant::Float32(v) => v.to_bits() as u64,
            Constant::Float64(v) => v.to_bits(),
            Constant::Vec128(v) => v.low,
            Constant::Bool(v) => v as u64,
        }
    }

    /// Integer value sign-extended to 64 bits.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Constant::Int8(v) => Some(v as i64),
            Constant::Int16(v) => Some(v as i64),
            Constant::Int32(v) => Some(v as i64),
            Constant::Int64(v) => Some(v),
            Constant::Bool(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_vec128(&self) -> Option<Vec128> {
        match *self {
            Constant::Vec128(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            Constant::Vec128(v) => v == Vec128::ZERO,
            _ => self.bits() == 0,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int8(v) => write!(f, "{v}:i8"),
            Constant::Int16(v) => write!(f, "{v}:i16"),
            Constant::Int32(v) => write!(f, "{v}:i32"),
            Constant::Int64(v) => write!(f, "{v}:i64"),
            Constant::Float32(v) => write!(f, "{v}:f32"),
            Constant::Float64(v) => write!(f, "{v}:f64"),
            Constant::Vec128(v) => write!(f, "{:#018x}_{:016x}:v128", v.high, v.low),
            Constant::Bool(v) => write!(f, "{v}:bool"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_lanes_are_reversed_physically() {
        let v = Vec128::from_lanes([1, 2, 3, 4]);
        assert_eq!(v.physical(), [4, 3, 2, 1]);
        assert_eq!(v.lanes(), [1, 2, 3, 4]);
        // x lives in the most significant dword
        assert_eq!(v.high >> 32, 1);
        assert_eq!(v.low & 0xFFFF_FFFF, 4);
    }

    #[test]
    fn test_constant_bits_zero_extend() {
        assert_eq!(Constant::Int8(-1).bits(), 0xFF);
        assert_eq!(Constant::Int16(-2).bits(), 0xFFFE);
        assert_eq!(Constant::Int32(-1).as_i64(), Some(-1));
        assert_eq!(Constant::Float32(1.0).bits(), 0x3F80_0000);
        assert!(Constant::Vec128(Vec128::ZERO).is_zero());
        assert!(!Constant::Bool(true).is_zero());
    }

    #[test]
    fn test_bool_matches_int8_storage() {
        assert_eq!(TypeName::Bool.storage(), TypeName::Int8);
        assert_eq!(TypeName::Bool.width(), Some(Width::B8));
        assert!(TypeName::Bool.is_int());
        assert_eq!(TypeName::from_index(TypeName::Float32 as u32), Some(TypeName::Float32));
        assert_eq!(TypeName::from_index(9), None);
    }

    #[test]
    fn test_constant_json_shape() {
        let json = serde_json::to_string(&Constant::Int32(5)).unwrap();
        assert_eq!(json, r#"{"type":"int32","value":5}"#);
        let back: Constant = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Constant::Int32(5));
    }
}
