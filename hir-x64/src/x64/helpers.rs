//! Out-of-line helpers for vector operations with no direct SSE4.1 form.
//!
//! The pure functions work on logical lanes and are what the tests exercise;
//! the `*_thunk` wrappers are what generated code calls. Vector operands are
//! passed by pointer to 16-byte frame temporaries holding register images.

use crate::hir::{flags, TypeName, Vec128};
use half::f16;

/// Element-wise shift flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftKind {
    Shl = 0,
    Shr = 1,
    Sha = 2,
}

impl ShiftKind {
    fn from_bits(bits: u64) -> ShiftKind {
        match bits & 0xFF {
            0 => ShiftKind::Shl,
            1 => ShiftKind::Shr,
            _ => ShiftKind::Sha,
        }
    }
}

/// Encode the shift helper's control word.
pub(crate) fn shift_control(kind: ShiftKind, element: TypeName) -> u64 {
    kind as u64 | (element as u64) << 8
}

fn read_le(bytes: &[u8]) -> u64 {
    bytes.iter().rev().fold(0u64, |acc, &b| acc << 8 | b as u64)
}

fn write_le(out: &mut [u8], value: u64) {
    for (i, b) in out.iter_mut().enumerate() {
        *b = (value >> (8 * i)) as u8;
    }
}

/// Bytes in guest order: logical byte 0 is the most significant byte of x.
fn logical_bytes(v: Vec128) -> [u8; 16] {
    let mut bytes = v.to_bytes();
    bytes.reverse();
    bytes
}

fn from_logical_bytes(mut bytes: [u8; 16]) -> Vec128 {
    bytes.reverse();
    Vec128::from_bytes(bytes)
}

fn logical_halfwords(v: Vec128) -> [u16; 8] {
    let b = logical_bytes(v);
    std::array::from_fn(|i| u16::from_be_bytes([b[2 * i], b[2 * i + 1]]))
}

fn from_logical_halfwords(h: [u16; 8]) -> Vec128 {
    let mut bytes = [0u8; 16];
    for (i, hw) in h.iter().enumerate() {
        bytes[2 * i..2 * i + 2].copy_from_slice(&hw.to_be_bytes());
    }
    from_logical_bytes(bytes)
}

// ═══════════════════════════════════════════════════════════════════════════
// Shifts and permutes
// ═══════════════════════════════════════════════════════════════════════════

/// Shift each element of `a` by the matching element of `b`, modulo the
/// element width.
pub fn shift_lanes(a: Vec128, b: Vec128, kind: ShiftKind, element: TypeName) -> Vec128 {
    let size = element.size().clamp(1, 8);
    let bits = (size * 8) as u32;
    let (a, b) = (a.to_bytes(), b.to_bytes());
    let mut out = [0u8; 16];
    for lane in 0..16 / size {
        let range = lane * size..(lane + 1) * size;
        let x = read_le(&a[range.clone()]);
        let n = (read_le(&b[range.clone()]) as u32) & (bits - 1);
        let value = match kind {
            ShiftKind::Shl => x << n,
            ShiftKind::Shr => x >> n,
            ShiftKind::Sha => {
                let pad = 64 - bits;
                (((x << pad) as i64 >> pad) >> n) as u64
            }
        };
        write_le(&mut out[range], value);
    }
    Vec128::from_bytes(out)
}

/// Word permute: control byte `i` picks logical lane `i` of the result,
/// bit 2 selecting `b` over `a` and bits 0-1 the source lane.
pub fn permute_words(control: u32, a: Vec128, b: Vec128) -> Vec128 {
    let (a, b) = (a.lanes(), b.lanes());
    Vec128::from_lanes([0, 1, 2, 3].map(|i| {
        let select = (control >> (8 * i)) & 0xFF;
        let source = if select & 4 != 0 { &b } else { &a };
        source[(select & 3) as usize]
    }))
}

/// Byte permute over the 32-byte concatenation `a || b` in logical order.
pub fn permute_bytes(control: Vec128, a: Vec128, b: Vec128) -> Vec128 {
    let (c, a, b) = (logical_bytes(control), logical_bytes(a), logical_bytes(b));
    from_logical_bytes(std::array::from_fn(|i| {
        let select = (c[i] & 0x1F) as usize;
        if select < 16 {
            a[select]
        } else {
            b[select - 16]
        }
    }))
}

/// Permute control that shifts a 32-byte concatenation left by `sh`.
pub fn load_vector_shl(sh: u8) -> Vec128 {
    let sh = sh & 0xF;
    from_logical_bytes(std::array::from_fn(|i| sh + i as u8))
}

/// Permute control that shifts a 32-byte concatenation right by `sh`.
pub fn load_vector_shr(sh: u8) -> Vec128 {
    let sh = sh & 0xF;
    from_logical_bytes(std::array::from_fn(|i| 16 - sh + i as u8))
}

// ═══════════════════════════════════════════════════════════════════════════
// Pack / unpack
// ═══════════════════════════════════════════════════════════════════════════

fn color_byte(lane: u32) -> u32 {
    // 1.0 + n * 2^-23 carries n in the low mantissa byte
    let v = f32::from_bits(lane).clamp(1.0, f32::from_bits(0x3F80_00FF));
    v.to_bits() & 0xFF
}

fn half_bits(lane: u32) -> u32 {
    f16::from_f32(f32::from_bits(lane)).to_bits() as u32
}

fn half_lane(bits: u32) -> u32 {
    f16::from_bits(bits as u16).to_f32().to_bits()
}

fn sat_i16(v: u32) -> u16 {
    (v as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16 as u16
}

fn sat_i8(v: u16) -> u8 {
    (v as i16).clamp(i8::MIN as i16, i8::MAX as i16) as i8 as u8
}

const ONE: u32 = 0x3F80_0000;
const THREE: u32 = 0x4040_0000;

/// Narrow `a` (and `b` for the saturating formats) into `format`.
/// `None` for unknown format tags.
pub fn pack(format: u32, a: Vec128, b: Vec128) -> Option<Vec128> {
    let l = a.lanes();
    Some(match format {
        flags::PACK_TYPE_D3DCOLOR => {
            let [r, g, bl, alpha] = l.map(color_byte);
            Vec128::from_lanes([0, 0, 0, alpha << 24 | r << 16 | g << 8 | bl])
        }
        flags::PACK_TYPE_FLOAT16_2 => {
            Vec128::from_lanes([0, 0, 0, half_bits(l[0]) << 16 | half_bits(l[1])])
        }
        flags::PACK_TYPE_FLOAT16_4 => Vec128::from_lanes([
            0,
            0,
            half_bits(l[0]) << 16 | half_bits(l[1]),
            half_bits(l[2]) << 16 | half_bits(l[3]),
        ]),
        flags::PACK_TYPE_SHORT_2 => {
            let short = |lane: u32| sat_i16(lane.wrapping_sub(THREE)) as u32;
            Vec128::from_lanes([0, 0, 0, short(l[0]) << 16 | short(l[1])])
        }
        flags::PACK_TYPE_S16_IN_32_LO | flags::PACK_TYPE_S16_IN_32_HI => {
            let m = b.lanes();
            from_logical_halfwords(std::array::from_fn(|i| {
                sat_i16(if i < 4 { l[i] } else { m[i - 4] })
            }))
        }
        flags::PACK_TYPE_S8_IN_16_LO | flags::PACK_TYPE_S8_IN_16_HI => {
            let (h, m) = (logical_halfwords(a), logical_halfwords(b));
            from_logical_bytes(std::array::from_fn(|i| {
                sat_i8(if i < 8 { h[i] } else { m[i - 8] })
            }))
        }
        _ => return None,
    })
}

/// Widen `a` out of `format`. `None` for unknown format tags.
pub fn unpack(format: u32, a: Vec128) -> Option<Vec128> {
    let l = a.lanes();
    Some(match format {
        flags::PACK_TYPE_D3DCOLOR => {
            let c = l[3];
            let byte = |shift: u32| ONE | (c >> shift) & 0xFF;
            Vec128::from_lanes([byte(16), byte(8), byte(0), byte(24)])
        }
        flags::PACK_TYPE_FLOAT16_2 => {
            Vec128::from_lanes([half_lane(l[3] >> 16), half_lane(l[3] & 0xFFFF), 0, ONE])
        }
        flags::PACK_TYPE_FLOAT16_4 => Vec128::from_lanes([
            half_lane(l[2] >> 16),
            half_lane(l[2] & 0xFFFF),
            half_lane(l[3] >> 16),
            half_lane(l[3] & 0xFFFF),
        ]),
        flags::PACK_TYPE_SHORT_2 => {
            let short = |v: u32| THREE.wrapping_add(v as u16 as i16 as i32 as u32);
            Vec128::from_lanes([short(l[3] >> 16), short(l[3] & 0xFFFF), 0, ONE])
        }
        flags::PACK_TYPE_S8_IN_16_HI | flags::PACK_TYPE_S8_IN_16_LO => {
            let base = if format == flags::PACK_TYPE_S8_IN_16_HI { 0 } else { 8 };
            let bytes = logical_bytes(a);
            from_logical_halfwords(std::array::from_fn(|i| bytes[base + i] as i8 as i16 as u16))
        }
        flags::PACK_TYPE_S16_IN_32_HI | flags::PACK_TYPE_S16_IN_32_LO => {
            let base = if format == flags::PACK_TYPE_S16_IN_32_HI { 0 } else { 4 };
            let h = logical_halfwords(a);
            Vec128::from_lanes(std::array::from_fn(|i| h[base + i] as i16 as i32 as u32))
        }
        _ => return None,
    })
}

/// Saturating float to integer conversion of each lane. NaN becomes 0.
pub fn convert_f2i(a: Vec128, unsigned: bool) -> Vec128 {
    Vec128::from_lanes(a.f32_lanes().map(|f| {
        if unsigned {
            f as u32
        } else {
            f as i32 as u32
        }
    }))
}

fn map_f32(a: Vec128, f: impl Fn(f32) -> f32) -> Vec128 {
    Vec128::from_f32_lanes(a.f32_lanes().map(f))
}

// ═══════════════════════════════════════════════════════════════════════════
// Native entry points
// ═══════════════════════════════════════════════════════════════════════════

// SAFETY (all thunks below): pointers reference 16-byte frame temporaries
// of the calling function, valid for the duration of the call.

fn load(ptr: *const [u8; 16]) -> Vec128 {
    Vec128::from_bytes(unsafe { *ptr })
}

fn store(ptr: *mut [u8; 16], value: Vec128) {
    unsafe { *ptr = value.to_bytes() }
}

pub(crate) extern "sysv64" fn vector_shift_thunk(
    out: *mut [u8; 16],
    a: *const [u8; 16],
    b: *const [u8; 16],
    control: u64,
) {
    let element = TypeName::from_index((control >> 8) as u32 & 0xF).unwrap_or(TypeName::Int32);
    store(out, shift_lanes(load(a), load(b), ShiftKind::from_bits(control), element));
}

pub(crate) extern "sysv64" fn permute_words_thunk(
    out: *mut [u8; 16],
    control: u64,
    a: *const [u8; 16],
    b: *const [u8; 16],
) {
    store(out, permute_words(control as u32, load(a), load(b)));
}

pub(crate) extern "sysv64" fn permute_bytes_thunk(
    out: *mut [u8; 16],
    control: *const [u8; 16],
    a: *const [u8; 16],
    b: *const [u8; 16],
) {
    store(out, permute_bytes(load(control), load(a), load(b)));
}

pub(crate) extern "sysv64" fn load_vector_shl_thunk(out: *mut [u8; 16], sh: u64) {
    store(out, load_vector_shl(sh as u8));
}

pub(crate) extern "sysv64" fn load_vector_shr_thunk(out: *mut [u8; 16], sh: u64) {
    store(out, load_vector_shr(sh as u8));
}

pub(crate) extern "sysv64" fn pack_thunk(
    out: *mut [u8; 16],
    a: *const [u8; 16],
    b: *const [u8; 16],
    format: u64,
) {
    store(out, pack(format as u32, load(a), load(b)).unwrap_or(Vec128::ZERO));
}

pub(crate) extern "sysv64" fn unpack_thunk(out: *mut [u8; 16], a: *const [u8; 16], format: u64) {
    store(out, unpack(format as u32, load(a)).unwrap_or(Vec128::ZERO));
}

pub(crate) extern "sysv64" fn vector_f2i_thunk(out: *mut [u8; 16], a: *const [u8; 16], flags: u64) {
    store(out, convert_f2i(load(a), flags::is_unsigned(flags as u32)));
}

pub(crate) extern "sysv64" fn pow2_f32(x: f32) -> f32 {
    x.exp2()
}

pub(crate) extern "sysv64" fn pow2_f64(x: f64) -> f64 {
    x.exp2()
}

pub(crate) extern "sysv64" fn log2_f32(x: f32) -> f32 {
    x.log2()
}

pub(crate) extern "sysv64" fn log2_f64(x: f64) -> f64 {
    x.log2()
}

pub(crate) extern "sysv64" fn pow2_v128_thunk(out: *mut [u8; 16], a: *const [u8; 16]) {
    store(out, map_f32(load(a), f32::exp2));
}

pub(crate) extern "sysv64" fn log2_v128_thunk(out: *mut [u8; 16], a: *const [u8; 16]) {
    store(out, map_f32(load(a), f32::log2));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_masks_count_per_element() {
        let a = Vec128::splat(0x8000_0001);
        let b = Vec128::from_lanes([1, 33, 31, 0]);
        let shl = shift_lanes(a, b, ShiftKind::Shl, TypeName::Int32);
        assert_eq!(shl.lanes(), [2, 2, 0x8000_0000, 0x8000_0001]);
        let sha = shift_lanes(a, b, ShiftKind::Sha, TypeName::Int32);
        assert_eq!(sha.lanes(), [0xC000_0000, 0xC000_0000, 0xFFFF_FFFF, 0x8000_0001]);
        let shr = shift_lanes(a, b, ShiftKind::Shr, TypeName::Int32);
        assert_eq!(shr.lanes()[2], 1);
    }

    #[test]
    fn test_shift_halfwords() {
        let a = from_logical_halfwords([0x8001; 8]);
        let b = from_logical_halfwords([1, 17, 15, 0, 1, 1, 1, 1]);
        let out = logical_halfwords(shift_lanes(a, b, ShiftKind::Sha, TypeName::Int16));
        assert_eq!(out[..4], [0xC000, 0xC000, 0xFFFF, 0x8001]);
    }

    #[test]
    fn test_permute_words_selects_logical_lanes() {
        let a = Vec128::from_lanes([1, 2, 3, 4]);
        let b = Vec128::from_lanes([5, 6, 7, 8]);
        let control = flags::permute_mask([(0, 3), (1, 0), (0, 0), (1, 3)]);
        assert_eq!(permute_words(control, a, b).lanes(), [4, 5, 1, 8]);
    }

    #[test]
    fn test_load_vector_shl_permute_is_byte_shift() {
        let a = from_logical_bytes(std::array::from_fn(|i| i as u8));
        let b = from_logical_bytes(std::array::from_fn(|i| 16 + i as u8));
        let shifted = permute_bytes(load_vector_shl(3), a, b);
        assert_eq!(logical_bytes(shifted), std::array::from_fn(|i| 3 + i as u8));
        let right = permute_bytes(load_vector_shr(3), a, b);
        assert_eq!(logical_bytes(right)[0], 13);
    }

    #[test]
    fn test_logical_bytes_are_big_endian_lanes() {
        let v = Vec128::from_lanes([0x0001_0203, 0, 0, 0]);
        assert_eq!(logical_bytes(v)[..4], [0, 1, 2, 3]);
    }

    #[test]
    fn test_half_float_round_trip() {
        let v = Vec128::from_f32_lanes([1.5, -2.0, 0.25, 65504.0]);
        let packed = pack(flags::PACK_TYPE_FLOAT16_4, v, Vec128::ZERO).unwrap();
        let back = unpack(flags::PACK_TYPE_FLOAT16_4, packed).unwrap();
        assert_eq!(back.f32_lanes(), [1.5, -2.0, 0.25, 65504.0]);

        let two = unpack(flags::PACK_TYPE_FLOAT16_2, pack(flags::PACK_TYPE_FLOAT16_2, v, v).unwrap()).unwrap();
        assert_eq!(two.f32_lanes(), [1.5, -2.0, 0.0, 1.0]);
    }

    #[test]
    fn test_d3dcolor_round_trip() {
        let packed = Vec128::from_lanes([0, 0, 0, 0x80FF_4010]);
        let unpacked = unpack(flags::PACK_TYPE_D3DCOLOR, packed).unwrap();
        assert_eq!(unpacked.lanes(), [ONE | 0xFF, ONE | 0x40, ONE | 0x10, ONE | 0x80]);
        assert_eq!(pack(flags::PACK_TYPE_D3DCOLOR, unpacked, Vec128::ZERO), Some(packed));
    }

    #[test]
    fn test_short2_round_trip() {
        let packed = Vec128::from_lanes([0, 0, 0, 0xFFFE_0005]);
        let unpacked = unpack(flags::PACK_TYPE_SHORT_2, packed).unwrap();
        assert_eq!(unpacked.lanes()[0], THREE - 2);
        assert_eq!(unpacked.lanes()[1], THREE + 5);
        assert_eq!(pack(flags::PACK_TYPE_SHORT_2, unpacked, Vec128::ZERO), Some(packed));
    }

    #[test]
    fn test_signed_widen_and_narrow() {
        let bytes: [u8; 16] = std::array::from_fn(|i| if i % 2 == 0 { 0x80 } else { 0x7F });
        let v = from_logical_bytes(bytes);
        let hi = logical_halfwords(unpack(flags::PACK_TYPE_S8_IN_16_HI, v).unwrap());
        assert_eq!(hi[0], 0xFF80);
        assert_eq!(hi[1], 0x007F);

        let wide = Vec128::from_lanes([70000, (-70000i32) as u32, 5, (-5i32) as u32]);
        let narrow = logical_halfwords(pack(flags::PACK_TYPE_S16_IN_32_LO, wide, wide).unwrap());
        assert_eq!(narrow[..4], [0x7FFF, 0x8000, 5, 0xFFFB]);
        assert!(unpack(42, v).is_none());
    }

    #[test]
    fn test_float_to_int_saturates() {
        let v = Vec128::from_f32_lanes([3.9, -1.5, f32::NAN, 5e9]);
        assert_eq!(convert_f2i(v, false).lanes(), [3, (-1i32) as u32, 0, i32::MAX as u32]);
        assert_eq!(convert_f2i(v, true).lanes(), [3, 0, 0, u32::MAX]);
    }
}
