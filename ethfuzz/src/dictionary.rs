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

//! Mutation tokens ("extras"): literal push immediates scraped from the bytecode and known
//! addresses. Dictionaries can also be exchanged as AFL-style dictionary files.
//!
//! Everything interesting is in the [`Dictionary`] struct.

use anyhow::{anyhow, bail};
use rand::Rng;
use std::cmp::Ordering;

use crate::bytecode::Instructions;

const DICTIONARY_MAX_LOAD: usize = 1024 * 10;

/// shorter tokens first, tokens of equal length in lexicographic order
fn token_order(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// A sorted set of raw byte tokens. The mutation stages iterate over the tokens by index, so we
/// keep a plain [`Vec`] instead of a set type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dictionary {
    /// INVARIANT: sorted by [`token_order`], no duplicates
    tokens: Vec<Box<[u8]>>,
}

#[allow(dead_code)]
impl Dictionary {
    pub fn new() -> Dictionary {
        Dictionary {
            tokens: Vec::with_capacity(128),
        }
    }

    /// Collect all push immediates from `code`. Scanning stops at a truncated push, the tokens
    /// found up to that point are kept.
    pub fn from_code(code: &[u8]) -> Dictionary {
        let mut d = Self::new();
        d.add_code(code);
        d
    }

    pub fn add_code(&mut self, code: &[u8]) -> usize {
        let mut added = 0;
        for ins in Instructions::new(code) {
            if !ins.immediate.is_empty() && self.add_token(ins.immediate) {
                added += 1;
            }
        }
        added
    }

    /// Record a raw 20 byte address.
    pub fn add_address(&mut self, address: &ethereum_types::H160) -> bool {
        self.add_token(address.as_bytes())
    }

    pub fn add_token(&mut self, token: &[u8]) -> bool {
        match self
            .tokens
            .binary_search_by(|t| token_order(t, token))
        {
            Ok(_) => false,
            Err(pos) => {
                self.tokens.insert(pos, token.to_vec().into_boxed_slice());
                true
            }
        }
    }

    pub fn stats(&self) -> String {
        let longest = self.tokens.last().map(|t| t.len()).unwrap_or(0);
        format!("Dict(#tokens={}, longest={})", self.tokens.len(), longest)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        self.tokens.get(idx).map(|t| &t[..])
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.tokens.iter().map(|t| &t[..])
    }

    pub fn contains(&self, token: &[u8]) -> bool {
        self.tokens
            .binary_search_by(|t| token_order(t, token))
            .is_ok()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&[u8]> {
        if self.tokens.is_empty() {
            None
        } else {
            self.get(rng.gen_range(0..self.tokens.len()))
        }
    }

    pub fn from_string(dict_string: &str) -> anyhow::Result<Dictionary> {
        let mut d = Self::new();
        d.add_from_string(dict_string)?;
        anyhow::Result::Ok(d)
    }

    /// Parse AFL dictionary lines of the form `"\x01\x02"`.
    pub fn add_from_string(&mut self, dict_string: &str) -> anyhow::Result<()> {
        let mut loaded = 0usize;
        for line in dict_string.split('\n') {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.len() == 2 {
                // ignorable line
                continue;
            }
            // AFL allows `name="..."`, we only care about the value
            let line = match line.find('"') {
                Some(idx) if idx > 0 && line[..idx].ends_with('=') => &line[idx..],
                _ => line,
            };
            if !line.starts_with('"') || !line.ends_with('"') || (line.len() - 2) % 4 != 0 {
                bail!(
                    "Invalid line {:?} must begin and end with '\"' and have length {} - 2 % 4 == {} != 0.",
                    line,
                    line.len(),
                    (line.len() - 2) % 4
                );
            }

            let hex = line[1..(line.len() - 1)].replace("\\x", "");
            let bytes =
                hexutil::read_hex(&hex).map_err(|e| anyhow!("Failed to decode hex: {:?}", e))?;
            if !bytes.is_empty() {
                self.add_token(&bytes);
            }

            loaded += 1;
            if loaded > DICTIONARY_MAX_LOAD {
                tracing::warn!("truncating dictionary load after {} entries", loaded);
                break;
            }
        }
        anyhow::Result::Ok(())
    }

    pub fn to_string(&self) -> String {
        let mut strbuf = String::new();
        for buf in self.tokens.iter() {
            strbuf.push('"');
            for b in buf.iter() {
                strbuf.push_str(&format!("\\x{:02X}", b));
            }
            strbuf.push_str("\"\n");
        }
        strbuf
    }

    pub fn add_from_file(&mut self, path: &std::path::Path) -> anyhow::Result<()> {
        let contents = std::fs::read_to_string(path)?;
        self.add_from_string(&contents)
    }

    pub fn load_from_file(path: &std::path::Path) -> anyhow::Result<Dictionary> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_string(&contents)
    }

    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        std::fs::write(path, self.to_string())?;
        anyhow::Result::Ok(())
    }
}

/// The two dictionaries a campaign works with.
#[derive(Debug, Clone, Default)]
pub struct Dicts {
    /// constants from the deployment bytecode (plus user supplied tokens)
    pub code: Dictionary,
    /// 20 byte addresses of deployed contracts and configured accounts
    pub address: Dictionary,
}

impl Dicts {
    pub fn stats(&self) -> String {
        format!("code: {}; address: {}", self.code.stats(), self.address.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H160;
    use hex_literal::hex;

    #[test]
    fn tokens_from_code() {
        // PUSH2 0xbeef; PUSH1 0x01; PUSH1 0x01; PUSH1 0x00; JUMPI; PUSH32 truncated
        let code = hex!("61beef 6001 6001 6000 57 7f0102");
        let d = Dictionary::from_code(&code);
        let tokens: Vec<&[u8]> = d.iter().collect();
        assert_eq!(tokens, vec![&[0x00][..], &[0x01][..], &[0xbe, 0xef][..]]);
    }

    #[test]
    fn ordering_and_dedup() {
        let mut d = Dictionary::new();
        assert!(d.add_token(&[0x02, 0x00]));
        assert!(d.add_token(&[0xff]));
        assert!(d.add_token(&[0x01, 0xff]));
        assert!(!d.add_token(&[0xff]));
        let tokens: Vec<&[u8]> = d.iter().collect();
        assert_eq!(tokens, vec![&[0xff][..], &[0x01, 0xff][..], &[0x02, 0x00][..]]);
        assert!(d.contains(&[0x01, 0xff]));
        assert!(!d.contains(&[0x01]));
    }

    #[test]
    fn addresses() {
        let mut d = Dictionary::new();
        let a = H160::repeat_byte(0xad);
        assert!(d.add_address(&a));
        assert!(!d.add_address(&a));
        assert_eq!(d.get(0).unwrap().len(), 20);
    }

    #[test]
    fn afl_format() {
        let testcase = r#"
# comment
"\x01"
"\x01\x02"
name="\x41\x41\x41\x41"
"\x01"
"#;
        let d = Dictionary::from_string(testcase).unwrap();
        assert_eq!(d.len(), 3);
        let s = d.to_string();
        assert_eq!(s, "\"\\x01\"\n\"\\x01\\x02\"\n\"\\x41\\x41\\x41\\x41\"\n");
        let d2 = Dictionary::from_string(&s).unwrap();
        assert_eq!(d, d2);
        assert!(Dictionary::from_string("\"\\x0\"").is_err());
        assert!(Dictionary::from_string("\\x01").is_err());
    }

    #[cfg(feature = "tests_with_fs")]
    #[test]
    fn file_roundtrip() {
        let mut d = Dictionary::from_code(&hex!("6001 62aabbcc"));
        d.add_address(&H160::repeat_byte(1));
        let file = tempfile::NamedTempFile::new().unwrap();
        d.write_to_file(file.path()).unwrap();
        let loaded = Dictionary::load_from_file(file.path()).unwrap();
        assert_eq!(d, loaded);
    }
}
