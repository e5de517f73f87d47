//! Logical/physical vector lane convention.
//!
//! Guest vectors are `{x, y, z, w}` with logical indices 0..3. XMM registers
//! hold the same lanes in reverse, so logical lane `i` of a 4×32 vector sits
//! in physical lane `3 - i`. The identity every vector path preserves:
//!
//! ```text
//! pshufd(v, 0x1B) : {x, y, z, w} <-> {w, z, y, x}
//! ```
//!
//! Narrower elements follow the same whole-register reversal: 16-bit lane
//! `i` is physical `7 - i` and byte `i` is physical `15 - i`.

/// pshufd immediate that reverses the four 32-bit lanes.
pub const REVERSE_DWORDS: u8 = 0x1B;

/// Physical lane of logical lane `index` for elements of `element_bytes`.
pub fn physical_lane(index: u8, element_bytes: usize) -> u8 {
    let count = (16 / element_bytes) as u8;
    count - 1 - (index % count)
}

/// Translate a logical SWIZZLE mask (two bits of source lane per logical
/// destination lane, x in the low bits) into a pshufd immediate.
pub fn swizzle_immediate(logical: u8) -> u8 {
    (0..4u8).fold(0u8, |imm, dst| {
        let src = (logical >> (2 * dst)) & 3;
        imm | (3 - src) << (2 * (3 - dst))
    })
}

/// dpps immediate summing the logical lanes in `lanes` (bit i = logical
/// lane i) and writing the scalar to physical lane 0.
pub fn dot_product_immediate(lanes: u8) -> u8 {
    let physical = (0..4u8)
        .filter(|i| lanes & (1 << i) != 0)
        .fold(0u8, |mask, i| mask | 1 << (3 - i));
    physical << 4 | 0x1
}

/// Apply a logical swizzle to logical lanes in software.
pub fn swizzle(lanes: [u32; 4], logical: u8) -> [u32; 4] {
    [0, 1, 2, 3].map(|dst| lanes[((logical >> (2 * dst)) & 3) as usize])
}
