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

//! Two codecs sharing the [`TypeDef`] metadata:
//!
//! 1. the fuzz buffer format, a compact self-describing layout the mutation stages work on:
//!
//! ```text
//! | scratch (32) | balance (12) + sender (20) | number (8) + timestamp (8) + spare (16) | args... |
//! ```
//!
//!    Whenever a dynamic length or an unspecified array extent is needed, the next scratch byte
//!    is consulted (cyclically). Every scalar occupies its real length rounded up to 32 bytes.
//!    Decoding never fails on short input, missing bytes read as zero.
//!
//! 2. canonical head/tail ABI call-data, produced from the decoded values.
//!
//! Both directions are tested independently; decode followed by encode is not expected to
//! reproduce the fuzz buffer.

use std::borrow::Cow;

use ethereum_types::{H160, U256};
use serde_json::json;
use zerocopy::{FromBytes, LayoutVerified};

use crate::abi::{ContractAbi, FuncDef, FunctionKind};
use crate::error::CodecError;
use crate::session::ExecutionOrder;
use crate::types::{BufferHeader, Shape, TypeDef, BUFFER_HEADER_SIZE};

/// value of every scratch byte in a fresh seed
pub const SEED_SCRATCH_BYTE: u8 = 5;
/// forced into the balance field if the balance is zero
pub const BALANCE_MARKER: u8 = 0xff;
/// forced into the last sender byte if the sender address is zero
pub const SENDER_MARKER: u8 = 0xf0;

const SCRATCH_LEN: usize = 32;

/// A decoded argument value. Scalars keep their raw (unpadded) bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Single(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    pub fn depth(&self) -> usize {
        match self {
            Value::Single(_) => 0,
            Value::Array(items) => 1 + items.iter().map(|i| i.depth()).max().unwrap_or(0),
        }
    }

    /// all scalar leaves, depth first
    pub fn leaves(&self) -> Vec<&[u8]> {
        match self {
            Value::Single(v) => vec![v.as_slice()],
            Value::Array(items) => items.iter().flat_map(|i| i.leaves()).collect(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Single(v) => json!(hexutil::to_hex(v)),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|i| i.to_json()).collect())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub balance: U256,
    pub address: H160,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Block {
    pub number: u64,
    pub timestamp: u64,
}

/// byte range of a single argument inside the fuzz buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpan {
    /// 0-based index into the ABI's functions
    pub function: usize,
    pub param: usize,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCall {
    /// 0-based index into the ABI's functions
    pub function: usize,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInput {
    /// deduplicated by address; the first one is the transaction sender
    pub accounts: Vec<Account>,
    pub block: Block,
    /// one entry per function in execution order
    pub calls: Vec<DecodedCall>,
    pub spans: Vec<ParamSpan>,
    /// length of the buffer after zero-padding
    pub padded_len: usize,
}

impl DecodedInput {
    #[inline]
    pub fn sender(&self) -> Option<&Account> {
        self.accounts.first()
    }

    /// JSON view of a test case: functions with their typed inputs, accounts and block
    pub fn to_standard_json(&self, abi: &ContractAbi) -> serde_json::Value {
        let functions: Vec<serde_json::Value> = self
            .calls
            .iter()
            .filter_map(|call| {
                let f = abi.function(call.function)?;
                let inputs: Vec<serde_json::Value> = f
                    .inputs
                    .iter()
                    .zip(call.args.iter())
                    .map(|(td, v)| json!({"type": td.name, "value": v.to_json()}))
                    .collect();
                Some(json!({"name": f.name, "inputs": inputs}))
            })
            .collect();
        let accounts: Vec<serde_json::Value> = self
            .accounts
            .iter()
            .map(|a| {
                json!({
                    "address": format!("{:?}", a.address),
                    "balance": a.balance.to_string(),
                })
            })
            .collect();
        json!({
            "functions": functions,
            "accounts": accounts,
            "block": {"number": self.block.number, "timestamp": self.block.timestamp},
        })
    }
}

/// real length rounded up to a multiple of 32
#[inline]
pub fn container_len(real_len: usize) -> usize {
    (real_len + 31) / 32 * 32
}

/// Walks the fuzz buffer, padding it with zeros whenever more bytes are needed.
struct Cursor<'a> {
    data: Cow<'a, [u8]>,
    len_offset: usize,
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor {
            data: Cow::Borrowed(data),
            len_offset: 0,
            offset: BUFFER_HEADER_SIZE,
        }
    }

    fn consult(&mut self) -> usize {
        let len = self.data[self.len_offset] as usize;
        self.len_offset = (self.len_offset + 1) % SCRATCH_LEN;
        len
    }

    fn take(&mut self, real_len: usize) -> Vec<u8> {
        let container = container_len(real_len);
        let fit = self.offset + container;
        if self.data.len() < fit {
            self.data.to_mut().resize(fit, 0);
        }
        let value = self.data[self.offset..(self.offset + real_len)].to_vec();
        self.offset += container;
        value
    }

    fn value(&mut self, td: &TypeDef) -> Value {
        // all extents of a type are resolved before its elements, outermost first
        let extents: Vec<usize> = td
            .dimensions
            .iter()
            .map(|d| if *d == 0 { self.consult() } else { *d })
            .collect();
        self.level(td, &extents)
    }

    fn level(&mut self, td: &TypeDef, extents: &[usize]) -> Value {
        match extents.split_first() {
            None => {
                let real_len = if td.is_dynamic { self.consult() } else { 32 };
                Value::Single(self.take(real_len))
            }
            Some((n, rest)) => Value::Array((0..*n).map(|_| self.level(td, rest)).collect()),
        }
    }
}

fn account_from_record(record: &[u8]) -> Account {
    let mut raw = [0u8; 32];
    let n = std::cmp::min(record.len(), 32);
    raw[..n].copy_from_slice(&record[..n]);
    Account {
        balance: U256::from_big_endian(&raw[..12]),
        address: H160::from_slice(&raw[12..]),
    }
}

fn walk<'a>(
    abi: &ContractAbi,
    order: &ExecutionOrder,
    data: &'a [u8],
) -> Result<(DecodedInput, Cow<'a, [u8]>), CodecError> {
    if data.len() < BUFFER_HEADER_SIZE {
        return Err(CodecError::EmptyBlock(data.len()));
    }
    let header = BufferHeader::read_from_prefix(data).ok_or(CodecError::EmptyBlock(data.len()))?;
    let block = Block {
        number: header.block_number(),
        timestamp: header.block_timestamp(),
    };

    let mut records: Vec<Account> = vec![account_from_record(&data[32..64])];
    let mut calls = Vec::with_capacity(order.len());
    let mut spans = vec![];
    let mut cur = Cursor::new(data);
    for fidx in order.positions() {
        let func = abi.function(fidx).ok_or(CodecError::UnknownFunction(fidx + 1))?;
        let mut args = Vec::with_capacity(func.inputs.len());
        for (pidx, td) in func.inputs.iter().enumerate() {
            let start = cur.offset;
            let value = cur.value(td);
            spans.push(ParamSpan {
                function: fidx,
                param: pidx,
                start,
                end: cur.offset,
            });
            if td.is_address() {
                records.extend(value.leaves().into_iter().map(account_from_record));
            }
            args.push(value);
        }
        calls.push(DecodedCall {
            function: fidx,
            args,
        });
    }

    let mut accounts: Vec<Account> = Vec::with_capacity(records.len());
    for r in records.into_iter() {
        if !accounts.iter().any(|a| a.address == r.address) {
            accounts.push(r);
        }
    }

    let padded_len = cur.data.len();
    Ok((
        DecodedInput {
            accounts,
            block,
            calls,
            spans,
            padded_len,
        },
        cur.data,
    ))
}

/// Decode a fuzz buffer according to the current execution order.
pub fn decode(
    abi: &ContractAbi,
    order: &ExecutionOrder,
    data: &[u8],
) -> Result<DecodedInput, CodecError> {
    walk(abi, order, data).map(|(d, _)| d)
}

/// Decode and return the zero padded buffer, i.e., the bytes the decoded values were read from.
pub fn decode_padded(
    abi: &ContractAbi,
    order: &ExecutionOrder,
    data: &[u8],
) -> Result<(DecodedInput, Vec<u8>), CodecError> {
    walk(abi, order, data).map(|(d, buf)| (d, buf.into_owned()))
}

/// Initial buffer: constant scratch bytes, zero sender and block, zero-filled argument segments
/// laid out with the same consultation rules as [`decode`].
pub fn seed(abi: &ContractAbi, order: &ExecutionOrder) -> Result<Vec<u8>, CodecError> {
    let mut header = vec![0u8; BUFFER_HEADER_SIZE];
    header[..SCRATCH_LEN].iter_mut().for_each(|b| *b = SEED_SCRATCH_BYTE);
    decode_padded(abi, order, &header).map(|(_, buf)| buf)
}

/// Make sure neither the sender address nor its balance is zero.
pub fn postprocess(data: &mut Vec<u8>) {
    if data.len() < BUFFER_HEADER_SIZE {
        data.resize(BUFFER_HEADER_SIZE, 0);
    }
    if let Some((mut header, _)) =
        LayoutVerified::<_, BufferHeader>::new_unaligned_from_prefix(&mut data[..])
    {
        if header.balance == [0u8; 12] {
            header.balance[0] = BALANCE_MARKER;
        }
        if header.sender == [0u8; 20] {
            header.sender[19] = SENDER_MARKER;
        }
    }
}

/* canonical ABI encoding */

fn word(value: usize) -> [u8; 32] {
    let mut w = [0u8; 32];
    U256::from(value).to_big_endian(&mut w);
    w
}

fn encode_single(td: &TypeDef, v: &[u8]) -> Result<Vec<u8>, CodecError> {
    if !td.is_dynamic && v.len() > 32 {
        return Err(CodecError::OversizedStatic(td.full_name.clone(), v.len()));
    }
    let padded_len = if td.is_dynamic {
        container_len(v.len())
    } else {
        32
    };
    let mut out = Vec::with_capacity(padded_len + 32);
    if td.is_dynamic {
        out.extend_from_slice(&word(v.len()));
    }
    if td.pad_left {
        out.resize(out.len() + (padded_len - v.len()), 0);
        out.extend_from_slice(v);
    } else {
        out.extend_from_slice(v);
        out.resize(out.len() + (padded_len - v.len()), 0);
    }
    Ok(out)
}

/// head/tail layout: dynamic parts get an offset (head length + prior tail length) in the head
fn encode_sequence(parts: Vec<(bool, Vec<u8>)>) -> Vec<u8> {
    let head_len: usize = parts
        .iter()
        .map(|(dynamic, enc)| if *dynamic { 32 } else { enc.len() })
        .sum();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = vec![];
    for (dynamic, enc) in parts.into_iter() {
        if dynamic {
            head.extend_from_slice(&word(head_len + tail.len()));
            tail.extend(enc);
        } else {
            head.extend(enc);
        }
    }
    head.extend(tail);
    head
}

fn element_is_dynamic(td: &TypeDef, shape: &Shape) -> bool {
    td.is_dynamic || shape.has_dynamic_extent()
}

fn encode_shape(td: &TypeDef, shape: &Shape, value: &Value) -> Result<Vec<u8>, CodecError> {
    match (shape, value) {
        (Shape::Scalar, Value::Single(v)) => encode_single(td, v),
        (Shape::Array(inner, len), Value::Array(items)) => {
            if let Some(n) = len {
                if *n != items.len() {
                    return Err(CodecError::LengthMismatch {
                        ty: td.full_name.clone(),
                        expected: *n,
                        got: items.len(),
                    });
                }
            }
            let dynamic = element_is_dynamic(td, inner);
            let parts = items
                .iter()
                .map(|item| encode_shape(td, inner, item).map(|enc| (dynamic, enc)))
                .collect::<Result<Vec<_>, _>>()?;
            let body = encode_sequence(parts);
            if len.is_none() {
                let mut out = Vec::with_capacity(body.len() + 32);
                out.extend_from_slice(&word(items.len()));
                out.extend(body);
                Ok(out)
            } else {
                Ok(body)
            }
        }
        _ => Err(CodecError::DimensionMismatch {
            ty: td.full_name.clone(),
            expected: shape.depth(),
            got: value.depth(),
        }),
    }
}

/// Encode a single argument value.
pub fn encode_value(td: &TypeDef, value: &Value) -> Result<Vec<u8>, CodecError> {
    encode_shape(td, &td.shape, value)
}

/// Encode an argument list as an ABI tuple (no selector).
pub fn encode_args(inputs: &[TypeDef], args: &[Value]) -> Result<Vec<u8>, CodecError> {
    if inputs.len() != args.len() {
        return Err(CodecError::LengthMismatch {
            ty: "tuple".to_string(),
            expected: inputs.len(),
            got: args.len(),
        });
    }
    let parts = inputs
        .iter()
        .zip(args.iter())
        .map(|(td, v)| encode_value(td, v).map(|enc| (td.needs_offset(), enc)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(encode_sequence(parts))
}

/// Call-data for a function: selector followed by the encoded arguments. The constructor gets
/// no selector and the fallback is called with empty call-data.
pub fn encode_call(func: &FuncDef, args: &[Value]) -> Result<Vec<u8>, CodecError> {
    match func.kind {
        FunctionKind::Fallback => Ok(vec![]),
        FunctionKind::Constructor => encode_args(&func.inputs, args),
        FunctionKind::Function => {
            let mut out = func.selector().map(|s| s.to_vec()).unwrap_or_default();
            out.extend(encode_args(&func.inputs, args)?);
            Ok(out)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCall {
    pub name: String,
    pub data: Vec<u8>,
    pub payable: bool,
    /// wei sent along, half the sender balance for payable functions
    pub value: U256,
}

/// Everything the execution oracle needs to run one test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPlan {
    /// encoded constructor arguments, empty if the contract has no constructor
    pub constructor: Vec<u8>,
    pub calls: Vec<PlannedCall>,
    pub accounts: Vec<Account>,
    pub block: Block,
}

impl TxPlan {
    #[inline]
    pub fn sender(&self) -> Option<&Account> {
        self.accounts.first()
    }
}

/// Decode a buffer and turn it into constructor call-data plus one call per function.
pub fn plan(
    abi: &ContractAbi,
    order: &ExecutionOrder,
    data: &[u8],
) -> Result<TxPlan, CodecError> {
    let decoded = decode(abi, order, data)?;
    plan_decoded(abi, &decoded)
}

pub fn plan_decoded(abi: &ContractAbi, decoded: &DecodedInput) -> Result<TxPlan, CodecError> {
    let sender_balance = decoded.sender().map(|a| a.balance).unwrap_or_default();
    let mut constructor = vec![];
    let mut calls = Vec::with_capacity(decoded.calls.len());
    for call in decoded.calls.iter() {
        let func = abi
            .function(call.function)
            .ok_or(CodecError::UnknownFunction(call.function + 1))?;
        let data = encode_call(func, &call.args)?;
        if func.is_constructor() {
            constructor = data;
            continue;
        }
        calls.push(PlannedCall {
            name: func.name.clone(),
            data,
            payable: func.payable,
            value: if func.payable {
                sender_balance / 2
            } else {
                U256::zero()
            },
        });
    }
    Ok(TxPlan {
        constructor,
        calls,
        accounts: decoded.accounts.clone(),
        block: decoded.block,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use ethabi::Token;

    fn td(name: &str) -> TypeDef {
        TypeDef::new(name, "x").unwrap()
    }

    #[test]
    fn seed_layout() {
        let abi = codec_abi();
        let order = ExecutionOrder::identity(abi.function_count());
        let buf = seed(&abi, &order).unwrap();
        assert!(buf[..32].iter().all(|b| *b == SEED_SCRATCH_BYTE));
        assert!(buf[32..].iter().all(|b| *b == 0));
        let decoded = decode(&abi, &order, &buf).unwrap();
        // the seed is exactly as long as the schema needs
        assert_eq!(decoded.padded_len, buf.len());
        assert_eq!(decoded.spans.last().unwrap().end, buf.len());
    }

    #[test]
    fn scalar_static_values_are_32_bytes() {
        let abi = codec_abi();
        let order = ExecutionOrder::identity(abi.function_count());
        let mut buf = seed(&abi, &order).unwrap();
        // scramble the scratch area so dynamic parts get other lengths
        for (i, b) in buf[..32].iter_mut().enumerate() {
            *b = (i * 7 % 40) as u8;
        }
        let decoded = decode(&abi, &order, &buf).unwrap();
        for call in decoded.calls.iter() {
            let func = abi.function(call.function).unwrap();
            for (t, v) in func.inputs.iter().zip(call.args.iter()) {
                if !t.is_dynamic {
                    for leaf in v.leaves() {
                        assert_eq!(leaf.len(), 32, "{}", t.name);
                    }
                }
            }
        }
    }

    #[test]
    fn decode_consults_scratch_bytes() {
        let abi = single_function_abi("f", &["string", "uint8[]"]);
        let order = ExecutionOrder::identity(1);
        let mut buf = vec![0u8; 96];
        buf[0] = 40; // string length
        buf[1] = 3; // array count
        let (decoded, padded) = decode_padded(&abi, &order, &buf).unwrap();
        let args = &decoded.calls[0].args;
        match &args[0] {
            Value::Single(v) => assert_eq!(v.len(), 40),
            _ => panic!("expected scalar"),
        }
        match &args[1] {
            Value::Array(items) => assert_eq!(items.len(), 3),
            _ => panic!("expected array"),
        }
        // 64 bytes for the string container, 3 * 32 for the array
        assert_eq!(padded.len(), 96 + 64 + 96);
        assert_eq!(decoded.spans[0].start, 96);
        assert_eq!(decoded.spans[0].end, 160);
        assert_eq!(decoded.spans[1].end, 256);
    }

    #[test]
    fn two_dimensional_extents_are_consulted_once() {
        let abi = single_function_abi("f", &["uint256[][]"]);
        let order = ExecutionOrder::identity(1);
        let mut buf = vec![0u8; 96];
        buf[0] = 2;
        buf[1] = 3;
        let decoded = decode(&abi, &order, &buf).unwrap();
        match &decoded.calls[0].args[0] {
            Value::Array(outer) => {
                assert_eq!(outer.len(), 2);
                for inner in outer {
                    assert_eq!(inner, &Value::Array(vec![Value::Single(vec![0; 32]); 3]));
                }
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn accounts_are_deduplicated() {
        let abi = single_function_abi("f", &["address", "address[2]", "uint256"]);
        let order = ExecutionOrder::identity(1);
        let mut buf = vec![0u8; 96 + 4 * 32];
        buf[32] = 0x01; // balance
        buf[63] = 0xaa; // sender
        buf[96 + 31] = 0xbb; // address arg
        buf[128 + 31] = 0xaa; // same as sender
        buf[160 + 31] = 0xbb; // duplicate
        let decoded = decode(&abi, &order, &buf).unwrap();
        let addrs: Vec<H160> = decoded.accounts.iter().map(|a| a.address).collect();
        assert_eq!(
            addrs,
            vec![H160::from_low_u64_be(0xaa), H160::from_low_u64_be(0xbb)]
        );
        assert_eq!(decoded.sender().unwrap().balance, U256::from(1) << 88);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let abi = single_function_abi("f", &["uint256"]);
        let order = ExecutionOrder::identity(1);
        assert_eq!(
            decode(&abi, &order, &[0u8; 50]),
            Err(CodecError::EmptyBlock(50))
        );
    }

    #[test]
    fn postprocess_forces_markers() {
        let mut buf = vec![0u8; 96];
        postprocess(&mut buf);
        assert_eq!(buf[32], BALANCE_MARKER);
        assert_eq!(buf[63], SENDER_MARKER);

        let mut short = vec![];
        postprocess(&mut short);
        assert_eq!(short.len(), 96);
        assert_ne!(&short[32..44], &[0u8; 12]);
        assert_ne!(&short[44..64], &[0u8; 20]);

        let mut set = vec![0u8; 96];
        set[40] = 1;
        set[50] = 2;
        postprocess(&mut set);
        assert_eq!(set[32], 0);
        assert_eq!(set[63], 0);
    }

    #[test]
    fn encode_matches_ethabi() {
        let inputs = vec![td("uint256"), td("string"), td("uint8[]"), td("bool"), td("bytes")];
        let mut n = vec![0u8; 32];
        n[31] = 42;
        let args = vec![
            Value::Single(n),
            Value::Single(b"hello".to_vec()),
            Value::Array(vec![
                Value::Single(vec![1; 1]),
                Value::Single(vec![2; 1]),
            ]),
            Value::Single(vec![1]),
            Value::Single(vec![0xab; 33]),
        ];
        let ours = encode_args(&inputs, &args).unwrap();
        let theirs = ethabi::encode(&[
            Token::Uint(42.into()),
            Token::String("hello".to_string()),
            Token::Array(vec![Token::Uint(1.into()), Token::Uint(2.into())]),
            Token::Bool(true),
            Token::Bytes(vec![0xab; 33]),
        ]);
        assert_eq!(ours, theirs);
    }

    #[test]
    fn encode_nested_dynamic_matches_ethabi() {
        let inputs = vec![td("string[]"), td("uint256[2][]"), td("uint256[][2]")];
        let w = |x: u8| {
            let mut v = vec![0u8; 32];
            v[31] = x;
            Value::Single(v)
        };
        let args = vec![
            Value::Array(vec![
                Value::Single(b"a".to_vec()),
                Value::Single(b"bc".to_vec()),
                Value::Single(vec![]),
            ]),
            Value::Array(vec![Value::Array(vec![w(1), w(2)])]),
            Value::Array(vec![Value::Array(vec![w(3)]), Value::Array(vec![])]),
        ];
        let ours = encode_args(&inputs, &args).unwrap();
        let u = |x: u64| Token::Uint(x.into());
        let theirs = ethabi::encode(&[
            Token::Array(vec![
                Token::String("a".into()),
                Token::String("bc".into()),
                Token::String("".into()),
            ]),
            Token::Array(vec![Token::FixedArray(vec![u(1), u(2)])]),
            Token::FixedArray(vec![Token::Array(vec![u(3)]), Token::Array(vec![])]),
        ]);
        assert_eq!(ours, theirs);
    }

    #[test]
    fn offset_table_of_dynamic_elements() {
        let t = td("bytes[]");
        let n = 4;
        let v = Value::Array((0..n).map(|i| Value::Single(vec![i as u8; 40])).collect());
        let enc = encode_value(&t, &v).unwrap();
        // count word, then one offset per element pointing behind the table
        assert_eq!(U256::from_big_endian(&enc[..32]), U256::from(n));
        let first_offset = U256::from_big_endian(&enc[32..64]).as_usize();
        assert_eq!(first_offset + 32, 32 * (n + 1));
        // each payload is a length word plus 64 bytes
        assert_eq!(enc.len(), 32 * (n + 1) + n * 96);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let t = td("uint256[]");
        assert!(matches!(
            encode_value(&t, &Value::Single(vec![0; 32])),
            Err(CodecError::DimensionMismatch { .. })
        ));
        let t = td("uint256[2]");
        assert!(matches!(
            encode_value(&t, &Value::Array(vec![Value::Single(vec![0; 32])])),
            Err(CodecError::LengthMismatch { .. })
        ));
        let t = td("uint256");
        assert!(matches!(
            encode_value(&t, &Value::Single(vec![0; 33])),
            Err(CodecError::OversizedStatic(..))
        ));
    }

    #[test]
    fn plan_orders_calls_and_values() {
        let abi = wallet_abi();
        let order = ExecutionOrder::new(vec![3, 1, 5]);
        let mut buf = seed(&abi, &order).unwrap();
        postprocess(&mut buf);
        let plan = plan(&abi, &order, &buf).unwrap();
        // constructor is not part of the call list
        let names: Vec<&str> = plan.calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["invest", "setOwner"]);
        assert!(plan.calls[0].payable);
        assert_eq!(plan.calls[0].value, plan.sender().unwrap().balance / 2);
        assert_eq!(plan.calls[1].value, U256::zero());
        assert_eq!(plan.calls[1].data.len(), 4 + 32);
        assert!(plan.constructor.is_empty());
    }

    #[test]
    fn standard_json_view() {
        let abi = single_function_abi("f", &["uint8[2]"]);
        let order = ExecutionOrder::identity(1);
        let buf = seed(&abi, &order).unwrap();
        let decoded = decode(&abi, &order, &buf).unwrap();
        let j = decoded.to_standard_json(&abi);
        assert_eq!(j["functions"][0]["name"], "f");
        assert_eq!(j["functions"][0]["inputs"][0]["type"], "uint8[2]");
        assert_eq!(j["functions"][0]["inputs"][0]["value"].as_array().unwrap().len(), 2);
        assert_eq!(j["accounts"].as_array().unwrap().len(), 1);
    }
}
