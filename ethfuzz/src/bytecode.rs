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

//! Linear EVM bytecode walking: push immediates and conditional jumps.

use std::collections::BTreeSet;

use anyhow::anyhow;

pub const PUSH1: u8 = 0x60;
pub const PUSH32: u8 = 0x7f;
pub const JUMPI: u8 = 0x57;

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub pc: usize,
    pub opcode: u8,
    /// push immediate, empty for all other opcodes
    pub immediate: &'a [u8],
}

/// Iterates over the instructions of a piece of bytecode. Iteration stops at a push whose
/// immediate runs past the end of the code.
pub struct Instructions<'a> {
    code: &'a [u8],
    pc: usize,
}

impl<'a> Instructions<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Instructions { code, pc: 0 }
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Instruction<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let pc = self.pc;
        let opcode = *self.code.get(pc)?;
        let immediate = if (PUSH1..=PUSH32).contains(&opcode) {
            let n = (opcode - PUSH1 + 1) as usize;
            let end = pc + 1 + n;
            if end > self.code.len() {
                self.pc = self.code.len();
                return None;
            }
            &self.code[(pc + 1)..end]
        } else {
            &self.code[0..0]
        };
        self.pc = pc + 1 + immediate.len();
        Some(Instruction {
            pc,
            opcode,
            immediate,
        })
    }
}

/// Program counters of all conditional jumps in `code`.
pub fn find_jumpis(code: &[u8]) -> BTreeSet<u64> {
    Instructions::new(code)
        .filter(|i| i.opcode == JUMPI)
        .map(|i| i.pc as u64)
        .collect()
}

/// Valid branch points of the deployment and the runtime code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidJumpis {
    pub deploy: BTreeSet<u64>,
    pub runtime: BTreeSet<u64>,
}

impl ValidJumpis {
    pub fn from_code(bin: &[u8], bin_runtime: &[u8]) -> Self {
        ValidJumpis {
            deploy: find_jumpis(bin),
            runtime: find_jumpis(bin_runtime),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.deploy.len() + self.runtime.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// each conditional jump has two outcomes
    #[inline]
    pub fn total_branches(&self) -> usize {
        self.len() * 2
    }
}

/// Parse hex encoded bytecode, tolerating a `0x` prefix and surrounding whitespace.
pub fn parse_hex_code(code: &str) -> anyhow::Result<Vec<u8>> {
    let code = code.trim();
    if code.is_empty() || code == "0x" {
        return Ok(vec![]);
    }
    hexutil::read_hex(hexutil::clean_0x(code))
        .map_err(|e| anyhow!("Failed to decode bytecode hex: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn walk_skips_immediates() {
        // PUSH1 0x57; JUMPI; PUSH2 0x5757; STOP
        let code = hex!("6057 57 615757 00");
        let ops: Vec<(usize, u8)> = Instructions::new(&code).map(|i| (i.pc, i.opcode)).collect();
        assert_eq!(ops, vec![(0, 0x60), (2, 0x57), (3, 0x61), (6, 0x00)]);
        assert_eq!(find_jumpis(&code).into_iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn truncated_push_stops_walk() {
        let code = hex!("57 62 0102");
        let ops: Vec<_> = Instructions::new(&code).collect();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].opcode, JUMPI);
    }

    #[test]
    fn valid_jumpis() {
        let j = ValidJumpis::from_code(&hex!("57 57"), &hex!("6001 57"));
        assert_eq!(j.len(), 3);
        assert_eq!(j.total_branches(), 6);
        assert!(ValidJumpis::default().is_empty());
    }

    #[test]
    fn hex_code() {
        assert_eq!(parse_hex_code("0x6001\n").unwrap(), vec![0x60, 0x01]);
        assert!(parse_hex_code("").unwrap().is_empty());
        assert!(parse_hex_code("zz").is_err());
    }
}
