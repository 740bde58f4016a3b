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

//! AFL-style byte level mutation of a single fuzz buffer.
//!
//! A [`Mutation`] owns a copy of the test case it mutates. Every stage hands each candidate to a
//! callback and restores the original bytes afterwards, so after any stage returns (also on
//! [`Flow::Halt`] or on a callback error) the buffer is byte-identical to the input. The callback
//! reports the trace checksum of the candidate, which the walking byte flip uses to build the
//! effector map, and whether the campaign wants to stop.

use rand::distributions::{Distribution, Standard};
use rand::prelude::*;
use std::fmt;

use crate::codec::ParamSpan;
use crate::dictionary::{Dictionary, Dicts};
use crate::session::MutationFlags;
use crate::utils::*;
use crate::RngI;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
#[repr(u8)]
pub enum Stage {
    Flip1,
    Flip2,
    Flip4,
    Flip8,
    Flip16,
    Flip32,
    Arith8,
    Arith16,
    Arith32,
    Interest8,
    Interest16,
    Interest32,
    /// overwrite with tokens of the code dictionary
    ExtrasUO,
    /// overwrite the address part of every word with known addresses
    ExtrasAO,
    Havoc,
    /// mutation restricted to the parameters flagged for mutation
    Targeted,
    /// a single stacked havoc round over the whole buffer
    Random,
}

impl Stage {
    pub const COUNT: usize = 17;

    pub const ALL: [Stage; Stage::COUNT] = [
        Stage::Flip1,
        Stage::Flip2,
        Stage::Flip4,
        Stage::Flip8,
        Stage::Flip16,
        Stage::Flip32,
        Stage::Arith8,
        Stage::Arith16,
        Stage::Arith32,
        Stage::Interest8,
        Stage::Interest16,
        Stage::Interest32,
        Stage::ExtrasUO,
        Stage::ExtrasAO,
        Stage::Havoc,
        Stage::Targeted,
        Stage::Random,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Flip1 => "bitflip 1/1",
            Stage::Flip2 => "bitflip 2/1",
            Stage::Flip4 => "bitflip 4/1",
            Stage::Flip8 => "bitflip 8/8",
            Stage::Flip16 => "bitflip 16/8",
            Stage::Flip32 => "bitflip 32/8",
            Stage::Arith8 => "arith 8/8",
            Stage::Arith16 => "arith 16/8",
            Stage::Arith32 => "arith 32/8",
            Stage::Interest8 => "interest 8/8",
            Stage::Interest16 => "interest 16/8",
            Stage::Interest32 => "interest 32/8",
            Stage::ExtrasUO => "dict (over)",
            Stage::ExtrasAO => "address (over)",
            Stage::Havoc => "havoc",
            Stage::Targeted => "log-based mutation",
            Stage::Random => "random havoc",
        }
    }

    /// short key used in the statistics output
    pub fn key(&self) -> &'static str {
        match self {
            Stage::Flip1 => "flip1",
            Stage::Flip2 => "flip2",
            Stage::Flip4 => "flip4",
            Stage::Flip8 => "flip8",
            Stage::Flip16 => "flip16",
            Stage::Flip32 => "flip32",
            Stage::Arith8 => "arith8",
            Stage::Arith16 => "arith16",
            Stage::Arith32 => "arith32",
            Stage::Interest8 => "interest8",
            Stage::Interest16 => "interest16",
            Stage::Interest32 => "interest32",
            Stage::ExtrasUO => "extras_uo",
            Stage::ExtrasAO => "extras_ao",
            Stage::Havoc => "havoc",
            Stage::Targeted => "log",
            Stage::Random => "random",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// one counter per [`Stage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageCounters([u64; Stage::COUNT]);

impl StageCounters {
    #[inline]
    pub fn add(&mut self, stage: Stage, n: u64) {
        self.0[stage as usize] += n;
    }

    #[inline]
    pub fn get(&self, stage: Stage) -> u64 {
        self.0[stage as usize]
    }

    pub fn merge(&mut self, other: &StageCounters) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a += b;
        }
    }
}

/// where a stage currently is; passed along with every candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub cur: usize,
    pub max: usize,
}

/// What the callback reports back for a single candidate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    /// checksum of the trace the candidate produced
    pub checksum: String,
    /// the campaign is over, stop mutating as soon as possible
    pub halt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt,
}

impl Flow {
    #[inline]
    pub fn is_halt(&self) -> bool {
        *self == Flow::Halt
    }
}

/// Callback invoked once per candidate buffer.
pub trait OnMutate: FnMut(&Progress, &[u8]) -> anyhow::Result<Outcome> {}
impl<T: FnMut(&Progress, &[u8]) -> anyhow::Result<Outcome>> OnMutate for T {}

/// The elementary edits havoc stacks on top of each other.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HavocOp {
    FlipBit,
    Interesting8,
    Interesting16,
    Interesting32,
    Sub8,
    Add8,
    Sub16,
    Add16,
    Sub32,
    Add32,
    RandomXor,
    /// overwrite a block with another block (75%) or a constant (25%)
    Block,
    /// overwrite with a dictionary token
    Extra,
}

/// Samples [`HavocOp`]s uniformly; [`HavocOp::Extra`] (twice as likely) only with a dictionary.
pub struct HavocOps {
    pub with_dict: bool,
}

impl Distribution<HavocOp> for HavocOps {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> HavocOp {
        let upper = if self.with_dict { 13 } else { 11 };
        match rng.gen_range(0..upper) {
            0 => HavocOp::FlipBit,
            1 => HavocOp::Interesting8,
            2 => HavocOp::Interesting16,
            3 => HavocOp::Interesting32,
            4 => HavocOp::Sub8,
            5 => HavocOp::Add8,
            6 => HavocOp::Sub16,
            7 => HavocOp::Add16,
            8 => HavocOp::Sub32,
            9 => HavocOp::Add32,
            10 => HavocOp::RandomXor,
            11 => HavocOp::Block,
            12 => HavocOp::Extra,
            _ => panic!("Distribution<HavocOp>::sample invalid integer sampled"),
        }
    }
}

/// The targeted stage sometimes falls back to a single round of whole-buffer havoc.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum TargetedMode {
    WholeBuffer,
    Parameters,
}

impl Distribution<TargetedMode> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> TargetedMode {
        match rng.gen_range(0..5) {
            0 => TargetedMode::WholeBuffer,
            1 | 2 | 3 | 4 => TargetedMode::Parameters,
            _ => panic!("Distribution<TargetedMode>::sample invalid integer sampled"),
        }
    }
}

#[inline]
fn flip_bit(data: &mut [u8], pos: usize) {
    data[pos >> 3] ^= 128 >> (pos & 7);
}

#[inline]
fn arith_delta<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    1 + rng.gen_range(0..ARITH_MAX)
}

/// Apply one havoc edit to `data`. Edits that do not fit are silently skipped.
pub fn havoc_edit<R: Rng + ?Sized>(rng: &mut R, data: &mut [u8], op: HavocOp, dict: &Dictionary) {
    let len = data.len();
    if len == 0 {
        return;
    }
    match op {
        HavocOp::FlipBit => {
            let pos = rng.gen_range(0..(len << 3));
            flip_bit(data, pos);
        }
        HavocOp::Interesting8 => {
            let pos = rng.gen_range(0..len);
            data[pos] = *INTERESTING_8.choose(rng).unwrap_or(&0) as u8;
        }
        HavocOp::Interesting16 => {
            if len < 2 {
                return;
            }
            let pos = rng.gen_range(0..(len - 1));
            let v = *INTERESTING_16.choose(rng).unwrap_or(&0) as u16;
            let v = if rng.gen() { v } else { swap16(v) };
            write_u16_le(data, pos, v);
        }
        HavocOp::Interesting32 => {
            if len < 4 {
                return;
            }
            let pos = rng.gen_range(0..(len - 3));
            let v = *INTERESTING_32.choose(rng).unwrap_or(&0) as u32;
            let v = if rng.gen() { v } else { swap32(v) };
            write_u32_le(data, pos, v);
        }
        HavocOp::Sub8 | HavocOp::Add8 => {
            let pos = rng.gen_range(0..len);
            let num = arith_delta(rng) as u8;
            data[pos] = if op == HavocOp::Sub8 {
                data[pos].wrapping_sub(num)
            } else {
                data[pos].wrapping_add(num)
            };
        }
        HavocOp::Sub16 | HavocOp::Add16 => {
            if len < 2 {
                return;
            }
            let little = rng.gen::<bool>();
            let pos = rng.gen_range(0..(len - 1));
            let num = arith_delta(rng) as u16;
            let orig = read_u16_le(data, pos);
            let apply = |v: u16| {
                if op == HavocOp::Sub16 {
                    v.wrapping_sub(num)
                } else {
                    v.wrapping_add(num)
                }
            };
            let v = if little {
                apply(orig)
            } else {
                swap16(apply(swap16(orig)))
            };
            write_u16_le(data, pos, v);
        }
        HavocOp::Sub32 | HavocOp::Add32 => {
            if len < 4 {
                return;
            }
            let little = rng.gen::<bool>();
            let pos = rng.gen_range(0..(len - 3));
            let num = arith_delta(rng);
            let orig = read_u32_le(data, pos);
            let apply = |v: u32| {
                if op == HavocOp::Sub32 {
                    v.wrapping_sub(num)
                } else {
                    v.wrapping_add(num)
                }
            };
            let v = if little {
                apply(orig)
            } else {
                swap32(apply(swap32(orig)))
            };
            write_u32_le(data, pos, v);
        }
        HavocOp::RandomXor => {
            let pos = rng.gen_range(0..len);
            data[pos] ^= rng.gen_range(1..=255u8);
        }
        HavocOp::Block => {
            if len < 2 {
                return;
            }
            let copy_len = choose_block_len(rng, len - 1);
            let copy_from = rng.gen_range(0..(len - copy_len + 1));
            let copy_to = rng.gen_range(0..(len - copy_len + 1));
            if rng.gen_range(0..4) != 0 {
                if copy_from != copy_to {
                    data.copy_within(copy_from..(copy_from + copy_len), copy_to);
                }
            } else {
                let value = if rng.gen() {
                    rng.gen::<u8>()
                } else {
                    data[rng.gen_range(0..len)]
                };
                data[copy_to..(copy_to + copy_len)]
                    .iter_mut()
                    .for_each(|b| *b = value);
            }
        }
        HavocOp::Extra => {
            if let Some(token) = dict.sample(rng) {
                if token.len() > len {
                    return;
                }
                let at = rng.gen_range(0..(len - token.len() + 1));
                data[at..(at + token.len())].copy_from_slice(token);
            }
        }
    }
}

/// Apply `1 << (1 + rand(HAVOC_STACK_POW2))` stacked havoc edits to `data`.
pub fn havoc_round<R: Rng + ?Sized>(rng: &mut R, data: &mut [u8], dict: &Dictionary) {
    let stacking = 1usize << (1 + rng.gen_range(0..HAVOC_STACK_POW2));
    let ops = HavocOps {
        with_dict: !dict.is_empty(),
    };
    for _ in 0..stacking {
        let op = ops.sample(rng);
        havoc_edit(rng, data, op, dict);
    }
}

macro_rules! emit_or_halt {
    ($self:ident, $cb:ident) => {{
        let outcome = $self.emit($cb)?;
        if outcome.halt {
            return Ok($self.halt());
        }
        outcome
    }};
}

/// Mutates a single test case. See the module documentation.
pub struct Mutation<'d> {
    origin: Vec<u8>,
    data: Vec<u8>,
    /// trace checksum of the unmodified test case
    checksum: String,
    dicts: &'d Dicts,
    /// one flag per `1 << EFF_MAP_SCALE2` bytes; 0 means flipping these bytes had no effect
    eff: Vec<u8>,
    eff_count: usize,
    stage: Stage,
    stage_cur: usize,
    stage_max: usize,
    cycles: StageCounters,
    rng: RngI,
}

impl<'d> Mutation<'d> {
    pub fn new(data: Vec<u8>, checksum: String, dicts: &'d Dicts, seed: u64) -> Self {
        let len = data.len();
        let mut eff = vec![0u8; eff_a_len(len)];
        let mut eff_count = 0;
        if !eff.is_empty() {
            // first and last span are always considered interesting
            eff[0] = 1;
            let last = eff_a_pos(len - 1);
            if last != 0 {
                eff[last] = 1;
                eff_count += 1;
            }
        }
        Mutation {
            origin: data.clone(),
            data,
            checksum,
            dicts,
            eff,
            eff_count,
            stage: Stage::Flip1,
            stage_cur: 0,
            stage_max: 0,
            cycles: StageCounters::default(),
            rng: RngI::seed_from_u64(seed),
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn effector_map(&self) -> &[u8] {
        &self.eff
    }

    /// executions performed (or planned, for an interrupted stage) per stage
    #[inline]
    pub fn cycles(&self) -> &StageCounters {
        &self.cycles
    }

    #[inline]
    pub fn progress(&self) -> Progress {
        Progress {
            stage: self.stage,
            cur: self.stage_cur,
            max: self.stage_max,
        }
    }

    fn begin(&mut self, stage: Stage, max: usize) {
        self.stage = stage;
        self.stage_cur = 0;
        self.stage_max = max;
    }

    fn finish(&mut self) -> Flow {
        self.cycles.add(self.stage, self.stage_max as u64);
        Flow::Continue
    }

    fn halt(&mut self) -> Flow {
        self.reset();
        self.cycles.add(self.stage, self.stage_cur as u64);
        Flow::Halt
    }

    #[inline]
    fn reset(&mut self) {
        self.data.copy_from_slice(&self.origin);
    }

    #[inline]
    fn skip(&mut self, n: usize) {
        self.stage_max = self.stage_max.saturating_sub(n);
    }

    fn emit<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Outcome> {
        let progress = self.progress();
        match cb(&progress, &self.data) {
            Ok(outcome) => {
                self.stage_cur += 1;
                anyhow::Result::Ok(outcome)
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    #[inline]
    fn eff_at(&self, pos: usize) -> bool {
        self.eff[eff_a_pos(pos)] != 0
    }

    /// true if none of the bytes in `[pos, pos + n)` is marked as interesting
    #[inline]
    fn inert(&self, pos: usize, n: usize) -> bool {
        let start = eff_a_pos(pos);
        let span = eff_span_a_len(pos, n);
        !self.eff[start..(start + span)].iter().any(|e| *e != 0)
    }

    /// Runs every deterministic stage followed by havoc.
    pub fn deterministic<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let stages: [fn(&mut Self, &mut S) -> anyhow::Result<Flow>; 15] = [
            Self::single_walking_bit,
            Self::two_walking_bit,
            Self::four_walking_bit,
            Self::single_walking_byte,
            Self::two_walking_byte,
            Self::four_walking_byte,
            Self::single_arith,
            Self::two_arith,
            Self::four_arith,
            Self::single_interest,
            Self::two_interest,
            Self::four_interest,
            Self::overwrite_with_dictionary,
            Self::overwrite_with_address_dictionary,
            Self::havoc,
        ];
        for stage in stages.iter() {
            if stage(self, cb)?.is_halt() {
                return Ok(Flow::Halt);
            }
        }
        Ok(Flow::Continue)
    }

    fn walking_bits<S: OnMutate>(&mut self, cb: &mut S, stage: Stage, width: usize) -> anyhow::Result<Flow> {
        let max = (self.data.len() << 3).saturating_sub(width - 1);
        self.begin(stage, max);
        for pos in 0..max {
            for k in 0..width {
                flip_bit(&mut self.data, pos + k);
            }
            let outcome = self.emit(cb)?;
            for k in 0..width {
                flip_bit(&mut self.data, pos + k);
            }
            if outcome.halt {
                return Ok(self.halt());
            }
        }
        Ok(self.finish())
    }

    pub fn single_walking_bit<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        self.walking_bits(cb, Stage::Flip1, 1)
    }

    pub fn two_walking_bit<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        self.walking_bits(cb, Stage::Flip2, 2)
    }

    pub fn four_walking_bit<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        self.walking_bits(cb, Stage::Flip4, 4)
    }

    /// Walking byte flip. Also builds the effector map: a span is marked as soon as inverting one
    /// of its bytes changes the trace checksum.
    pub fn single_walking_byte<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let len = self.data.len();
        self.begin(Stage::Flip8, len);
        for i in 0..len {
            self.data[i] ^= 0xff;
            let outcome = self.emit(cb)?;
            let apos = eff_a_pos(i);
            if self.eff[apos] == 0 && outcome.checksum != self.checksum {
                self.eff[apos] = 1;
                self.eff_count += 1;
            }
            self.data[i] ^= 0xff;
            if outcome.halt {
                return Ok(self.halt());
            }
        }
        // nearly everything matters anyway, so don't bother skipping anything
        let eff_len = self.eff.len();
        if eff_len > 0 && self.eff_count != eff_len && self.eff_count * 100 / eff_len > EFF_MAX_PERC
        {
            self.eff.iter_mut().for_each(|e| *e = 1);
            self.eff_count = eff_len;
        }
        Ok(self.finish())
    }

    fn walking_bytes<S: OnMutate>(&mut self, cb: &mut S, stage: Stage, width: usize) -> anyhow::Result<Flow> {
        let positions = self.data.len().saturating_sub(width - 1);
        self.begin(stage, positions);
        for i in 0..positions {
            if self.inert(i, width) {
                self.skip(1);
                continue;
            }
            self.data[i..(i + width)].iter_mut().for_each(|b| *b ^= 0xff);
            let outcome = self.emit(cb)?;
            self.data[i..(i + width)].iter_mut().for_each(|b| *b ^= 0xff);
            if outcome.halt {
                return Ok(self.halt());
            }
        }
        Ok(self.finish())
    }

    pub fn two_walking_byte<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        self.walking_bytes(cb, Stage::Flip16, 2)
    }

    pub fn four_walking_byte<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        self.walking_bytes(cb, Stage::Flip32, 4)
    }

    pub fn single_arith<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let len = self.data.len();
        let per_pos = 2 * ARITH_MAX as usize;
        self.begin(Stage::Arith8, len * per_pos);
        for i in 0..len {
            if !self.eff_at(i) {
                self.skip(per_pos);
                continue;
            }
            let orig = self.data[i];
            for j in 1..=(ARITH_MAX as u8) {
                for candidate in [orig.wrapping_add(j), orig.wrapping_sub(j)] {
                    if could_be_bitflip((orig ^ candidate) as u32) {
                        self.skip(1);
                        continue;
                    }
                    self.data[i] = candidate;
                    emit_or_halt!(self, cb);
                }
                self.data[i] = orig;
            }
        }
        Ok(self.finish())
    }

    pub fn two_arith<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let positions = self.data.len().saturating_sub(1);
        let per_pos = 4 * ARITH_MAX as usize;
        self.begin(Stage::Arith16, positions * per_pos);
        for i in 0..positions {
            if self.inert(i, 2) {
                self.skip(per_pos);
                continue;
            }
            let orig = read_u16_le(&self.data, i);
            for j in 1..=(ARITH_MAX as u16) {
                // only try additions and subtractions that carry into the other byte, everything
                // else was already covered by the 8 bit stage
                let candidates = [
                    ((orig & 0xff) + j > 0xff, orig.wrapping_add(j)),
                    ((orig & 0xff) < j, orig.wrapping_sub(j)),
                    ((orig >> 8) + j > 0xff, swap16(swap16(orig).wrapping_add(j))),
                    ((orig >> 8) < j, swap16(swap16(orig).wrapping_sub(j))),
                ];
                for (carries, candidate) in candidates {
                    if !carries || could_be_bitflip((orig ^ candidate) as u32) {
                        self.skip(1);
                        continue;
                    }
                    write_u16_le(&mut self.data, i, candidate);
                    emit_or_halt!(self, cb);
                }
                write_u16_le(&mut self.data, i, orig);
            }
        }
        Ok(self.finish())
    }

    pub fn four_arith<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let positions = self.data.len().saturating_sub(3);
        let per_pos = 4 * ARITH_MAX as usize;
        self.begin(Stage::Arith32, positions * per_pos);
        for i in 0..positions {
            if self.inert(i, 4) {
                self.skip(per_pos);
                continue;
            }
            let orig = read_u32_le(&self.data, i);
            let swapped = swap32(orig);
            for j in 1..=ARITH_MAX {
                let candidates = [
                    ((orig & 0xffff) + j > 0xffff, orig.wrapping_add(j)),
                    ((orig & 0xffff) < j, orig.wrapping_sub(j)),
                    ((swapped & 0xffff) + j > 0xffff, swap32(swapped.wrapping_add(j))),
                    ((swapped & 0xffff) < j, swap32(swapped.wrapping_sub(j))),
                ];
                for (carries, candidate) in candidates {
                    if !carries || could_be_bitflip(orig ^ candidate) {
                        self.skip(1);
                        continue;
                    }
                    write_u32_le(&mut self.data, i, candidate);
                    emit_or_halt!(self, cb);
                }
                write_u32_le(&mut self.data, i, orig);
            }
        }
        Ok(self.finish())
    }

    pub fn single_interest<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let len = self.data.len();
        let per_pos = INTERESTING_8.len();
        self.begin(Stage::Interest8, len * per_pos);
        for i in 0..len {
            if !self.eff_at(i) {
                self.skip(per_pos);
                continue;
            }
            let orig = self.data[i];
            for v in INTERESTING_8.iter() {
                let v = *v as u8;
                if could_be_bitflip((orig ^ v) as u32) || could_be_arith(orig as u32, v as u32, 1) {
                    self.skip(1);
                    continue;
                }
                self.data[i] = v;
                let outcome = self.emit(cb)?;
                self.data[i] = orig;
                if outcome.halt {
                    return Ok(self.halt());
                }
            }
        }
        Ok(self.finish())
    }

    pub fn two_interest<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let positions = self.data.len().saturating_sub(1);
        let per_pos = 2 * INTERESTING_16.len();
        self.begin(Stage::Interest16, positions * per_pos);
        for i in 0..positions {
            if self.inert(i, 2) {
                self.skip(per_pos);
                continue;
            }
            let orig = read_u16_le(&self.data, i);
            for v in INTERESTING_16.iter() {
                let le = *v as u16;
                let be = swap16(le);
                let candidates = [(true, le, false), (le != be, be, true)];
                for (distinct, candidate, swapped) in candidates {
                    let (o, c) = (orig as u32, candidate as u32);
                    if !distinct
                        || could_be_bitflip(o ^ c)
                        || could_be_arith(o, c, 2)
                        || could_be_interest(o, c, 2, swapped)
                    {
                        self.skip(1);
                        continue;
                    }
                    write_u16_le(&mut self.data, i, candidate);
                    emit_or_halt!(self, cb);
                }
            }
            write_u16_le(&mut self.data, i, orig);
        }
        Ok(self.finish())
    }

    pub fn four_interest<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let positions = self.data.len().saturating_sub(3);
        let per_pos = 2 * INTERESTING_32.len();
        self.begin(Stage::Interest32, positions * per_pos);
        for i in 0..positions {
            if self.inert(i, 4) {
                self.skip(per_pos);
                continue;
            }
            let orig = read_u32_le(&self.data, i);
            for v in INTERESTING_32.iter() {
                let le = *v as u32;
                let be = swap32(le);
                let candidates = [(true, le, false), (le != be, be, true)];
                for (distinct, candidate, swapped) in candidates {
                    if !distinct
                        || could_be_bitflip(orig ^ candidate)
                        || could_be_arith(orig, candidate, 4)
                        || could_be_interest(orig, candidate, 4, swapped)
                    {
                        self.skip(1);
                        continue;
                    }
                    write_u32_le(&mut self.data, i, candidate);
                    emit_or_halt!(self, cb);
                }
            }
            write_u32_le(&mut self.data, i, orig);
        }
        Ok(self.finish())
    }

    /// Overwrite every position with every code dictionary token.
    pub fn overwrite_with_dictionary<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let dicts = self.dicts;
        let dict = &dicts.code;
        let len = self.data.len();
        let count = dict.len();
        self.begin(Stage::ExtrasUO, len * count);
        for i in 0..len {
            let mut clobbered = 0;
            for token in dict.iter() {
                let tlen = token.len();
                // with large dictionaries only a random subset is tried at each position
                let skip = (count > MAX_DET_EXTRAS && self.rng.gen_range(0..count) > MAX_DET_EXTRAS)
                    || tlen > len - i
                    || &self.data[i..(i + tlen)] == token
                    || self.inert(i, tlen);
                if skip {
                    self.skip(1);
                    continue;
                }
                clobbered = std::cmp::max(clobbered, tlen);
                self.data[i..(i + tlen)].copy_from_slice(token);
                emit_or_halt!(self, cb);
            }
            self.data[i..(i + clobbered)].copy_from_slice(&self.origin[i..(i + clobbered)]);
        }
        Ok(self.finish())
    }

    /// Overwrite the lower 20 bytes of every 32 byte word with every known address.
    pub fn overwrite_with_address_dictionary<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let dicts = self.dicts;
        let dict = &dicts.address;
        let len = self.data.len();
        let count = dict.len();
        self.begin(Stage::ExtrasAO, (len / 32) * count);
        for i in (0..len).step_by(32) {
            if i + 32 > len {
                continue;
            }
            for token in dict.iter() {
                if token.len() != 20 || &self.data[(i + 12)..(i + 32)] == token {
                    self.skip(1);
                    continue;
                }
                self.data[(i + 12)..(i + 32)].copy_from_slice(token);
                emit_or_halt!(self, cb);
            }
            self.data[i..(i + 32)].copy_from_slice(&self.origin[i..(i + 32)]);
        }
        Ok(self.finish())
    }

    /// [`HAVOC_MIN`] rounds of stacked random edits, each starting from the original buffer.
    pub fn havoc<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let dicts = self.dicts;
        let dict = &dicts.code;
        self.begin(Stage::Havoc, HAVOC_MIN);
        for _ in 0..HAVOC_MIN {
            havoc_round(&mut self.rng, &mut self.data, dict);
            let outcome = self.emit(cb)?;
            self.reset();
            if outcome.halt {
                return Ok(self.halt());
            }
        }
        Ok(self.finish())
    }

    /// A single stacked havoc round over the whole buffer.
    pub fn havoc_once<S: OnMutate>(&mut self, cb: &mut S) -> anyhow::Result<Flow> {
        let dicts = self.dicts;
        let dict = &dicts.code;
        self.begin(Stage::Random, 1);
        havoc_round(&mut self.rng, &mut self.data, dict);
        let outcome = self.emit(cb)?;
        self.reset();
        if outcome.halt {
            return Ok(self.halt());
        }
        Ok(self.finish())
    }

    /// Mutation restricted to the parameters enabled in `flags`.
    ///
    /// On the `first` visit of a test case every parameter gets walking bit and byte flips, one
    /// candidate each. Later visits degrade to [`Mutation::havoc_once`] with probability 1/5,
    /// otherwise they apply a stacked havoc round inside every enabled parameter and execute the
    /// combined result once.
    pub fn targeted<S: OnMutate>(
        &mut self,
        spans: &[ParamSpan],
        flags: &MutationFlags,
        first: bool,
        cb: &mut S,
    ) -> anyhow::Result<Flow> {
        if !first && self.rng.gen::<TargetedMode>() == TargetedMode::WholeBuffer {
            return self.havoc_once(cb);
        }
        let len = self.data.len();
        let ranges: Vec<(usize, usize)> = spans
            .iter()
            .filter(|s| flags.get(s.function, s.param))
            .map(|s| (s.start, std::cmp::min(s.end, len)))
            .filter(|(start, end)| start < end)
            .collect();

        if first {
            let max = ranges
                .iter()
                .map(|(s, e)| {
                    let n = e - s;
                    n * 8 + n + n.saturating_sub(1) + n.saturating_sub(3)
                })
                .sum();
            self.begin(Stage::Targeted, max);
            for (start, end) in ranges.into_iter() {
                for pos in (start << 3)..(end << 3) {
                    flip_bit(&mut self.data, pos);
                    let outcome = self.emit(cb)?;
                    flip_bit(&mut self.data, pos);
                    if outcome.halt {
                        return Ok(self.halt());
                    }
                }
                for width in [1, 2, 4] {
                    for i in start..(end.saturating_sub(width - 1)) {
                        self.data[i..(i + width)].iter_mut().for_each(|b| *b ^= 0xff);
                        let outcome = self.emit(cb)?;
                        self.data[i..(i + width)].iter_mut().for_each(|b| *b ^= 0xff);
                        if outcome.halt {
                            return Ok(self.halt());
                        }
                    }
                }
            }
        } else {
            self.begin(Stage::Targeted, 1);
            let empty = Dictionary::new();
            for (start, end) in ranges.into_iter() {
                havoc_round(&mut self.rng, &mut self.data[start..end], &empty);
            }
            let outcome = self.emit(cb)?;
            self.reset();
            if outcome.halt {
                return Ok(self.halt());
            }
        }
        Ok(self.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;

    /// Records every candidate; reports a checksum that depends only on `sensitive` bytes.
    struct Recorder {
        candidates: Vec<Vec<u8>>,
        stages: Vec<Stage>,
        sensitive: Vec<usize>,
        halt_after: Option<usize>,
    }

    impl Recorder {
        fn new() -> Self {
            Recorder {
                candidates: vec![],
                stages: vec![],
                sensitive: vec![],
                halt_after: None,
            }
        }

        fn callback(&mut self) -> impl FnMut(&Progress, &[u8]) -> anyhow::Result<Outcome> + '_ {
            move |p: &Progress, data: &[u8]| {
                self.candidates.push(data.to_vec());
                self.stages.push(p.stage);
                let checksum: String = self
                    .sensitive
                    .iter()
                    .map(|i| format!("{:02x}", data[*i]))
                    .collect();
                let halt = self
                    .halt_after
                    .map(|n| self.candidates.len() >= n)
                    .unwrap_or(false);
                Ok(Outcome { checksum, halt })
            }
        }
    }

    fn checksum_of(data: &[u8], sensitive: &[usize]) -> String {
        sensitive.iter().map(|i| format!("{:02x}", data[*i])).collect()
    }

    #[test]
    fn single_bit_flip_on_four_bytes() {
        let dicts = Dicts::default();
        let input = vec![0x00, 0xff, 0x5a, 0x01];
        let mut m = Mutation::new(input.clone(), String::new(), &dicts, 0);
        let mut rec = Recorder::new();
        let flow = m.single_walking_bit(&mut rec.callback()).unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(rec.candidates.len(), 32);
        assert_eq!(m.data(), &input[..]);
        assert_eq!(m.cycles().get(Stage::Flip1), 32);
        // every candidate differs from the input in exactly one bit
        for (i, c) in rec.candidates.iter().enumerate() {
            let diff: u32 = c
                .iter()
                .zip(input.iter())
                .map(|(a, b)| (a ^ b).count_ones())
                .sum();
            assert_eq!(diff, 1);
            assert_eq!(c[i / 8] ^ input[i / 8], 128 >> (i % 8));
        }
    }

    #[test]
    fn multi_bit_flips_restore() {
        let dicts = Dicts::default();
        let input = vec![0x12, 0x34, 0x56];
        let mut m = Mutation::new(input.clone(), String::new(), &dicts, 0);
        let mut rec = Recorder::new();
        m.two_walking_bit(&mut rec.callback()).unwrap();
        assert_eq!(rec.candidates.len(), 23);
        m.four_walking_bit(&mut rec.callback()).unwrap();
        assert_eq!(rec.candidates.len(), 23 + 21);
        assert_eq!(m.data(), &input[..]);
    }

    #[test]
    fn byte_flip_builds_effector_map() {
        let dicts = Dicts::default();
        let input = vec![0u8; 64];
        // only byte 20 (span 2) and byte 40 (span 5) influence the trace
        let sensitive = vec![20, 40];
        let mut m = Mutation::new(input.clone(), checksum_of(&input, &sensitive), &dicts, 0);
        let mut rec = Recorder::new();
        rec.sensitive = sensitive;
        m.single_walking_byte(&mut rec.callback()).unwrap();
        assert_eq!(rec.candidates.len(), 64);
        assert_eq!(m.effector_map(), &[1, 0, 1, 0, 0, 1, 0, 1][..]);
        assert_eq!(m.data(), &input[..]);

        // the 16 bit stage only touches positions overlapping a marked span
        let before = rec.candidates.len();
        m.two_walking_byte(&mut rec.callback()).unwrap();
        let flips16 = rec.candidates.len() - before;
        // spans 0, 2, 5, 7 are marked: positions 0..=7, 15..=23, 39..=47, 55..=62
        assert_eq!(flips16, 8 + 9 + 9 + 8);
        assert_eq!(m.cycles().get(Stage::Flip16), flips16 as u64);
        assert_eq!(m.data(), &input[..]);
    }

    #[test]
    fn dense_effector_map_marks_everything() {
        let dicts = Dicts::default();
        let input = vec![0u8; 200];
        // every byte matters except the ones in span 4
        let sensitive: Vec<usize> = (0..200).filter(|i| i / 8 != 4).collect();
        let mut m = Mutation::new(input.clone(), checksum_of(&input, &sensitive), &dicts, 0);
        let mut rec = Recorder::new();
        rec.sensitive = sensitive;
        m.single_walking_byte(&mut rec.callback()).unwrap();
        assert!(m.effector_map().iter().all(|e| *e == 1));
    }

    #[test]
    fn dictionary_skips_inert_spans() {
        let mut dicts = Dicts::default();
        dicts.code.add_token(&[0xaa, 0xbb]);
        let input = vec![0u8; 32];
        let mut m = Mutation::new(input.clone(), String::new(), &dicts, 0);
        // only span 1 (bytes 8..16) is interesting
        m.eff.iter_mut().for_each(|e| *e = 0);
        m.eff[1] = 1;
        let mut rec = Recorder::new();
        m.overwrite_with_dictionary(&mut rec.callback()).unwrap();
        // a two byte token touches span 1 when written at 7..=15
        assert_eq!(rec.candidates.len(), 9);
        for c in rec.candidates.iter() {
            let (first, _) = locate_diffs(c, &input).unwrap();
            assert!((7..16).contains(&first));
        }
        assert_eq!(m.cycles().get(Stage::ExtrasUO), 9);
        assert_eq!(m.data(), &input[..]);
    }

    #[test]
    fn dictionary_overwrite_restores_longest_token() {
        let mut dicts = Dicts::default();
        dicts.code.add_token(&[0x01]);
        dicts.code.add_token(&[0x02, 0x03, 0x04]);
        let input = vec![0x77u8; 40];
        let mut m = Mutation::new(input.clone(), String::new(), &dicts, 0);
        m.eff.iter_mut().for_each(|e| *e = 1);
        let mut rec = Recorder::new();
        m.overwrite_with_dictionary(&mut rec.callback()).unwrap();
        assert_eq!(m.data(), &input[..]);
        // no candidate carries leftovers of an earlier position
        for c in rec.candidates.iter() {
            let (first, last) = locate_diffs(c, &input).unwrap();
            assert!(last - first < 3);
        }
    }

    #[test]
    fn address_overwrite_targets_low_20_bytes() {
        let mut dicts = Dicts::default();
        dicts.address.add_token(&[0xad; 20]);
        let mut input = vec![0u8; 96];
        input[32 + 12..64].copy_from_slice(&[0xad; 20]);
        let mut m = Mutation::new(input.clone(), String::new(), &dicts, 0);
        let mut rec = Recorder::new();
        m.overwrite_with_address_dictionary(&mut rec.callback()).unwrap();
        // the second word already holds the address
        assert_eq!(rec.candidates.len(), 2);
        assert_eq!(&rec.candidates[0][12..32], &[0xad; 20]);
        assert_eq!(&rec.candidates[0][..12], &[0u8; 12]);
        assert_eq!(&rec.candidates[1][64 + 12..96], &[0xad; 20]);
        assert_eq!(m.data(), &input[..]);
    }

    #[test]
    fn arith_and_interest_restore() {
        let dicts = Dicts::default();
        let input: Vec<u8> = (0..24u8).map(|i| i.wrapping_mul(37)).collect();
        let mut m = Mutation::new(input.clone(), String::new(), &dicts, 0);
        m.eff.iter_mut().for_each(|e| *e = 1);
        let mut rec = Recorder::new();
        for stage in [
            Stage::Arith8,
            Stage::Arith16,
            Stage::Interest8,
            Stage::Interest16,
            Stage::Interest32,
        ]
        .iter()
        {
            let before = rec.candidates.len();
            let flow = {
                let mut cb = rec.callback();
                match stage {
                    Stage::Arith8 => m.single_arith(&mut cb),
                    Stage::Arith16 => m.two_arith(&mut cb),
                    Stage::Interest8 => m.single_interest(&mut cb),
                    Stage::Interest16 => m.two_interest(&mut cb),
                    _ => m.four_interest(&mut cb),
                }
            };
            assert_eq!(flow.unwrap(), Flow::Continue);
            assert_eq!(m.data(), &input[..]);
            let emitted = rec.candidates.len() - before;
            assert!(emitted > 0);
            assert!(rec.stages[before..].iter().all(|s| s == stage));
            assert_eq!(m.cycles().get(*stage), emitted as u64);
        }
        // candidates never equal the input
        assert!(rec.candidates.iter().all(|c| c != &input));
    }

    #[test]
    fn four_arith_only_tries_carries() {
        let dicts = Dicts::default();
        // no 16 bit half near a carry in either byte order
        let quiet: Vec<u8> = (0..24u8).map(|i| i.wrapping_mul(37)).collect();
        let mut m = Mutation::new(quiet.clone(), String::new(), &dicts, 0);
        m.eff.iter_mut().for_each(|e| *e = 1);
        let mut rec = Recorder::new();
        assert_eq!(m.four_arith(&mut rec.callback()).unwrap(), Flow::Continue);
        assert!(rec.candidates.is_empty());
        assert_eq!(m.data(), &quiet[..]);

        for input in [vec![0xf0u8, 0xff, 0, 0], vec![0, 0, 0xff, 0xf0]] {
            let mut m = Mutation::new(input.clone(), String::new(), &dicts, 0);
            m.eff.iter_mut().for_each(|e| *e = 1);
            let mut rec = Recorder::new();
            assert_eq!(m.four_arith(&mut rec.callback()).unwrap(), Flow::Continue);
            assert_eq!(m.data(), &input[..]);
            assert!(!rec.candidates.is_empty());
            assert!(rec.stages.iter().all(|s| *s == Stage::Arith32));
            assert_eq!(m.cycles().get(Stage::Arith32), rec.candidates.len() as u64);
            assert!(rec.candidates.iter().all(|c| c != &input));
        }

        // 0x0000fff0 + 16 carries into the upper half, big endian 0x0000fff0 - 1 borrows
        let mut m = Mutation::new(vec![0xf0, 0xff, 0, 0], String::new(), &dicts, 0);
        m.eff.iter_mut().for_each(|e| *e = 1);
        let mut rec = Recorder::new();
        m.four_arith(&mut rec.callback()).unwrap();
        assert!(rec.candidates.contains(&vec![0, 0, 1, 0]));
        assert!(rec.candidates.contains(&vec![0xf0, 0xfe, 0xff, 0xff]));

        let mut m = Mutation::new(vec![0, 0, 0xff, 0xf0], String::new(), &dicts, 0);
        m.eff.iter_mut().for_each(|e| *e = 1);
        let mut rec = Recorder::new();
        m.four_arith(&mut rec.callback()).unwrap();
        assert!(rec.candidates.contains(&vec![0, 1, 0, 0]));
        assert!(rec.candidates.contains(&vec![0xff, 0xff, 0xfe, 0xf0]));
    }

    #[test]
    fn havoc_keeps_length_and_restores() {
        let mut dicts = Dicts::default();
        dicts.code.add_token(&[1, 2, 3, 4]);
        let input = vec![0u8; 256];
        let mut m = Mutation::new(input.clone(), String::new(), &dicts, 7);
        let mut rec = Recorder::new();
        m.havoc(&mut rec.callback()).unwrap();
        assert_eq!(rec.candidates.len(), HAVOC_MIN);
        assert!(rec.candidates.iter().all(|c| c.len() == input.len()));
        assert!(rec.candidates.iter().any(|c| c != &input));
        assert_eq!(m.data(), &input[..]);
    }

    #[test]
    fn halting_stops_and_restores() {
        let dicts = Dicts::default();
        let input = vec![0x0fu8; 16];
        let mut m = Mutation::new(input.clone(), String::new(), &dicts, 0);
        let mut rec = Recorder::new();
        rec.halt_after = Some(5);
        let flow = m.deterministic(&mut rec.callback()).unwrap();
        assert_eq!(flow, Flow::Halt);
        assert_eq!(rec.candidates.len(), 5);
        assert_eq!(m.data(), &input[..]);
    }

    #[test]
    fn callback_errors_restore() {
        let dicts = Dicts::default();
        let input = vec![0x0fu8; 8];
        let mut m = Mutation::new(input.clone(), String::new(), &dicts, 0);
        let mut cb = |_: &Progress, _: &[u8]| -> anyhow::Result<Outcome> {
            anyhow::bail!("executor died")
        };
        assert!(m.single_walking_byte(&mut cb).is_err());
        assert_eq!(m.data(), &input[..]);
    }

    #[test]
    fn targeted_mutation_stays_in_enabled_parameters() {
        let abi = single_function_abi("f", &["uint256", "uint256"]);
        let order = crate::session::ExecutionOrder::identity(1);
        let input = crate::codec::seed(&abi, &order).unwrap();
        let decoded = crate::codec::decode(&abi, &order, &input).unwrap();
        let mut flags = MutationFlags::all_yes(&abi);
        flags.set(0, 0, false);
        let dicts = Dicts::default();

        for seed in 0..20 {
            for first in [true, false] {
                let mut m = Mutation::new(input.clone(), String::new(), &dicts, seed);
                let mut rec = Recorder::new();
                m.targeted(&decoded.spans, &flags, first, &mut rec.callback())
                    .unwrap();
                assert_eq!(m.data(), &input[..]);
                for (c, stage) in rec.candidates.iter().zip(rec.stages.iter()) {
                    if *stage == Stage::Targeted {
                        if let Some((first, last)) = locate_diffs(c, &input) {
                            assert!(first >= 128 && last < 160);
                        }
                    }
                }
                if first {
                    // 32 bytes: 256 bit flips plus 32 + 31 + 29 byte flips
                    assert_eq!(rec.candidates.len(), 256 + 32 + 31 + 29);
                }
            }
        }
    }

    #[test]
    fn first_targeted_visit_always_walks_parameters() {
        let abi = single_function_abi("f", &["uint256"]);
        let order = crate::session::ExecutionOrder::identity(1);
        let input = crate::codec::seed(&abi, &order).unwrap();
        let decoded = crate::codec::decode(&abi, &order, &input).unwrap();
        let flags = MutationFlags::all_yes(&abi);
        let dicts = Dicts::default();

        // enough seeds that the whole-buffer branch would be drawn for some of them
        for seed in 0..50 {
            let mut m = Mutation::new(input.clone(), String::new(), &dicts, seed);
            let mut rec = Recorder::new();
            m.targeted(&decoded.spans, &flags, true, &mut rec.callback())
                .unwrap();
            assert!(rec.stages.iter().all(|s| *s == Stage::Targeted));
            assert_eq!(rec.candidates.len(), 256 + 32 + 31 + 29);
        }

        let mut random_rounds = 0;
        for seed in 0..50 {
            let mut m = Mutation::new(input.clone(), String::new(), &dicts, seed);
            let mut rec = Recorder::new();
            m.targeted(&decoded.spans, &flags, false, &mut rec.callback())
                .unwrap();
            assert_eq!(rec.candidates.len(), 1);
            if rec.stages[0] == Stage::Random {
                random_rounds += 1;
            }
        }
        assert!(random_rounds > 0 && random_rounds < 50);
    }
}
