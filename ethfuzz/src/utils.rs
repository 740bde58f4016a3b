// Copyright 2021 Michael Rodler
// This file is part of ethfuzz.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Small helpers shared by the codec, the mutation stages and the status output: keccak-based
//! selectors, effector-map arithmetic, the AFL-style "could this be a product of an earlier
//! stage" predicates and explicit little/big-endian read-modify-write helpers.

use sha3::Digest;
use std::time::Duration;

/// maximum delta for the arithmetic stages
pub const ARITH_MAX: u32 = 35;
/// havoc stacks `1 << (1 + rand(HAVOC_STACK_POW2))` edits per iteration
pub const HAVOC_STACK_POW2: u32 = 7;
/// number of havoc iterations per havoc stage
pub const HAVOC_MIN: usize = 2000;
/// above this many tokens, the dictionary stage probabilistically skips tokens
pub const MAX_DET_EXTRAS: usize = 200;
/// effector map scale: one flag per `1 << EFF_MAP_SCALE2` bytes
pub const EFF_MAP_SCALE2: usize = 3;
/// if the effector map is denser than this percentage, mark everything as interesting
pub const EFF_MAX_PERC: usize = 90;

pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];

pub const INTERESTING_16: [i16; 19] = [
    -128, -1, 0, 1, 16, 32, 64, 100, 127, // 8 bit values
    -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767,
];

pub const INTERESTING_32: [i32; 27] = [
    -128,
    -1,
    0,
    1,
    16,
    32,
    64,
    100,
    127,
    -32768,
    -129,
    128,
    255,
    256,
    512,
    1000,
    1024,
    4096,
    32767,
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

/// keccak256 over arbitrary bytes
#[inline]
pub fn keccak(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&sha3::Keccak256::digest(data)[..]);
    out
}

/// Compute the 4-byte selector for a canonical signature like `transfer(address,uint256)`.
pub fn short_signature(signature: &str) -> [u8; 4] {
    let mut result = [0u8; 4];
    result.copy_from_slice(&keccak(signature.as_bytes())[..4]);
    result
}

/// Render a fuzz buffer as rows of 32 bytes hex, one row per line.
pub fn format_buffer_rows(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2 + data.len() / 32 + 1);
    for chunk in data.chunks(32).map(hexutil::to_hex) {
        s.push_str(hexutil::clean_0x(&chunk));
        s.push('\n');
    }
    s
}

/* effector map helpers */

#[inline]
pub fn eff_a_pos(p: usize) -> usize {
    p >> EFF_MAP_SCALE2
}

#[inline]
pub fn eff_rem(x: usize) -> usize {
    x & ((1 << EFF_MAP_SCALE2) - 1)
}

/// number of effector map entries needed for a buffer of length `l`
#[inline]
pub fn eff_a_len(l: usize) -> usize {
    eff_a_pos(l) + usize::from(eff_rem(l) != 0)
}

/// number of effector map entries touched by `[p, p + l)`
#[inline]
pub fn eff_span_a_len(p: usize, l: usize) -> usize {
    if l == 0 {
        return 0;
    }
    eff_a_pos(p + l - 1) - eff_a_pos(p) + 1
}

#[inline]
pub fn swap16(x: u16) -> u16 {
    x.swap_bytes()
}

#[inline]
pub fn swap32(x: u32) -> u32 {
    x.swap_bytes()
}

/* explicit little-endian accessors; "swapped" values are the big-endian view of the same bytes */

#[inline]
pub fn read_u16_le(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

#[inline]
pub fn write_u16_le(buf: &mut [u8], pos: usize, value: u16) {
    buf[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn read_u32_le(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

#[inline]
pub fn write_u32_le(buf: &mut [u8], pos: usize, value: u32) {
    buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

/// Returns true if `xor_val` (old ^ new) could be the result of one of the walking bit or walking
/// byte flips.
pub fn could_be_bitflip(xor_val: u32) -> bool {
    if xor_val == 0 {
        return true;
    }
    let sh = xor_val.trailing_zeros();
    let xor_val = xor_val >> sh;
    // 1-, 2- and 4-bit patterns at any offset
    if xor_val == 1 || xor_val == 3 || xor_val == 15 {
        return true;
    }
    // 8-, 16- and 32-bit patterns only at byte offsets
    if sh & 7 != 0 {
        return false;
    }
    xor_val == 0xff || xor_val == 0xffff || xor_val == 0xffff_ffff
}

/// Returns true if `new_val` could be reached from `old_val` by one of the arithmetic stages,
/// considering `blen` bytes.
pub fn could_be_arith(old_val: u32, new_val: u32, blen: usize) -> bool {
    if old_val == new_val {
        return true;
    }
    let arith_max = ARITH_MAX;

    // single byte change within range
    let mut diffs = 0;
    let (mut ov, mut nv) = (0u32, 0u32);
    for i in 0..blen {
        let a = (old_val >> (8 * i)) as u8;
        let b = (new_val >> (8 * i)) as u8;
        if a != b {
            diffs += 1;
            ov = a as u32;
            nv = b as u32;
        }
    }
    if diffs == 1
        && (((ov as u8).wrapping_sub(nv as u8) as u32) <= arith_max
            || ((nv as u8).wrapping_sub(ov as u8) as u32) <= arith_max)
    {
        return true;
    }
    if blen == 1 {
        return false;
    }

    // word changes, both endians
    diffs = 0;
    let (mut ov, mut nv) = (0u16, 0u16);
    for i in 0..(blen / 2) {
        let a = (old_val >> (16 * i)) as u16;
        let b = (new_val >> (16 * i)) as u16;
        if a != b {
            diffs += 1;
            ov = a;
            nv = b;
        }
    }
    if diffs == 1 {
        if (ov.wrapping_sub(nv) as u32) <= arith_max || (nv.wrapping_sub(ov) as u32) <= arith_max
        {
            return true;
        }
        let (ov, nv) = (swap16(ov), swap16(nv));
        if (ov.wrapping_sub(nv) as u32) <= arith_max || (nv.wrapping_sub(ov) as u32) <= arith_max
        {
            return true;
        }
    }

    if blen == 4 {
        if old_val.wrapping_sub(new_val) <= arith_max || new_val.wrapping_sub(old_val) <= arith_max
        {
            return true;
        }
        let (old_val, new_val) = (swap32(old_val), swap32(new_val));
        if old_val.wrapping_sub(new_val) <= arith_max || new_val.wrapping_sub(old_val) <= arith_max
        {
            return true;
        }
    }

    false
}

/// Returns true if `new_val` could be the product of inserting an interesting value into
/// `old_val` in one of the earlier (narrower) interesting-value stages.
pub fn could_be_interest(old_val: u32, new_val: u32, blen: usize, check_le: bool) -> bool {
    if old_val == new_val {
        return true;
    }

    for i in 0..blen {
        for j in INTERESTING_8.iter() {
            let tval = (old_val & !(0xffu32 << (i * 8))) | (((*j as u8) as u32) << (i * 8));
            if new_val == tval {
                return true;
            }
        }
    }

    if blen == 2 && !check_le {
        return false;
    }

    for i in 0..blen.saturating_sub(1) {
        for j in INTERESTING_16.iter() {
            let v = *j as u16;
            let tval = (old_val & !(0xffffu32 << (i * 8))) | ((v as u32) << (i * 8));
            if new_val == tval {
                return true;
            }
            if blen > 2 {
                let tval = (old_val & !(0xffffu32 << (i * 8))) | ((swap16(v) as u32) << (i * 8));
                if new_val == tval {
                    return true;
                }
            }
        }
    }

    if blen == 4 && check_le {
        for j in INTERESTING_32.iter() {
            if new_val == *j as u32 {
                return true;
            }
        }
    }

    false
}

/// Pick a block length for havoc's copy/set operation: a multiple of 32 bytes not exceeding
/// `limit`, or 0 when the buffer is too small for a single block.
pub fn choose_block_len<R: rand::Rng + ?Sized>(rng: &mut R, limit: usize) -> usize {
    let max_factor = limit / 128;
    if max_factor == 0 {
        return 0;
    }
    (rng.gen_range(0..max_factor) + 1) * 32
}

/// Locate first and last differing byte between `a` and `b` (compared up to the shorter length).
pub fn locate_diffs(a: &[u8], b: &[u8]) -> Option<(usize, usize)> {
    let mut first = None;
    let mut last = None;
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        if x != y {
            if first.is_none() {
                first = Some(i);
            }
            last = Some(i);
        }
    }
    first.zip(last)
}

/// Levenshtein distance over chars; used to keep execution orders apart and to match advisor
/// output against function names.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        cur[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            cur[j] = std::cmp::min(
                std::cmp::min(prev[j] + 1, cur[j - 1] + 1),
                prev[j - 1] + cost,
            );
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let days = secs / 86400;
    let hrs = (secs / 3600) % 24;
    let min = (secs / 60) % 60;
    let sec = secs % 60;
    format!("{} days, {} hrs, {} min, {} sec", days, hrs, min, sec)
}

/// left-align `s` in a field of `width` chars
#[inline]
pub fn pad_str(s: &str, width: usize) -> String {
    format!("{:<width$}", s, width = width)
}
