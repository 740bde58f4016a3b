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

//! Type definition and core datastructures

use std::default::Default;

use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::error::CodecError;

/// size of the fixed prefix of every fuzz buffer (scratch, sender, block)
pub const BUFFER_HEADER_SIZE: usize = std::mem::size_of::<BufferHeader>();

/// Fixed prefix of a fuzz buffer. All fields are raw big-endian byte arrays.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(packed)]
pub struct BufferHeader {
    /// consulted cyclically whenever a dynamic length or array extent is needed
    pub scratch: [u8; 32], // offset 0
    pub balance: [u8; 12], // offset 32
    pub sender: [u8; 20],  // offset 44
    pub number: [u8; 8],   // offset 64
    pub timestamp: [u8; 8],
    padding: [u8; 16],
}

impl Default for BufferHeader {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl BufferHeader {
    pub fn block_number(&self) -> u64 {
        u64::from_be_bytes(self.number)
    }

    pub fn block_timestamp(&self) -> u64 {
        u64::from_be_bytes(self.timestamp)
    }
}

/// Recursive shape of an argument. The rightmost bracket of a type string is the outermost
/// array, i.e., `uint8[2][]` is a dynamic array of `uint8[2]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    Scalar,
    /// element shape and fixed length (`None` for dynamically sized arrays)
    Array(Box<Shape>, Option<usize>),
}

impl Shape {
    pub fn depth(&self) -> usize {
        match self {
            Shape::Scalar => 0,
            Shape::Array(inner, _) => 1 + inner.depth(),
        }
    }

    /// extents from outermost to innermost; 0 stands for a dynamic extent
    pub fn extents(&self) -> Vec<usize> {
        let mut v = vec![];
        let mut cur = self;
        while let Shape::Array(inner, len) = cur {
            v.push(len.unwrap_or(0));
            cur = inner;
        }
        v
    }

    pub fn has_dynamic_extent(&self) -> bool {
        match self {
            Shape::Scalar => false,
            Shape::Array(inner, len) => len.is_none() || inner.has_dynamic_extent(),
        }
    }
}

const KNOWN_BASES: [&str; 9] = [
    "address", "bool", "string", "bytes", "int", "uint", "fixed", "ufixed", "function",
];

/// Descriptor of a single function (or event) argument. All attributes are derived once from
/// the declared type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDef {
    /// declared type name, e.g. `uint[]`
    pub name: String,
    pub param_name: String,
    /// canonical name used for selectors, e.g. `uint256[]`
    pub full_name: String,
    /// name of the underlying value type, `address` is `uint160` and `bool` is `uint8`
    pub real_name: String,
    /// array extents outermost first, 0 meaning dynamic
    pub dimensions: Vec<usize>,
    pub shape: Shape,
    pub pad_left: bool,
    /// variable-length element content (`string`/`bytes`)
    pub is_dynamic: bool,
    pub is_dynamic_array: bool,
    pub is_sub_dynamic_array: bool,
}

/// splits `uint8[2][]` into `("uint8", [Some(2), None])`
fn split_type(name: &str) -> Result<(&str, Vec<Option<usize>>), CodecError> {
    let invalid = || CodecError::InvalidType(name.to_string());
    let (base, mut rest) = match name.find('[') {
        Some(idx) => (&name[..idx], &name[idx..]),
        None => (name, ""),
    };
    let mut brackets = vec![];
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(invalid());
        }
        let close = rest.find(']').ok_or_else(invalid)?;
        let inner = &rest[1..close];
        if inner.is_empty() {
            brackets.push(None);
        } else {
            let n: usize = inner.parse().map_err(|_| invalid())?;
            if n == 0 {
                return Err(invalid());
            }
            brackets.push(Some(n));
        }
        rest = &rest[(close + 1)..];
    }
    Ok((base, brackets))
}

/// Checks that a base type matches `[a-z]+[0-9]*(x[0-9]+)?` and names a known elementary type.
fn validate_base(base: &str, name: &str) -> Result<(), CodecError> {
    let alpha_end = base
        .find(|c: char| !c.is_ascii_lowercase())
        .unwrap_or(base.len());
    let alpha = &base[..alpha_end];
    if alpha == "tuple" {
        return Err(CodecError::UnsupportedType(name.to_string()));
    }
    if alpha.is_empty() || !KNOWN_BASES.contains(&alpha) {
        return Err(CodecError::InvalidType(name.to_string()));
    }
    let suffix = &base[alpha_end..];
    let (size, frac) = match suffix.find('x') {
        Some(idx) => (&suffix[..idx], Some(&suffix[(idx + 1)..])),
        None => (suffix, None),
    };
    let digits_ok = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    let fixed_point = alpha == "fixed" || alpha == "ufixed";
    let ok = match frac {
        Some(frac) => fixed_point && !size.is_empty() && !frac.is_empty() && digits_ok(size) && digits_ok(frac),
        None => digits_ok(size),
    };
    if ok {
        Ok(())
    } else {
        Err(CodecError::InvalidType(name.to_string()))
    }
}

fn full_base(base: &str) -> &str {
    match base {
        "int" => "int256",
        "uint" => "uint256",
        "fixed" => "fixed128x128",
        "ufixed" => "ufixed128x128",
        b => b,
    }
}

fn real_base(full_base: &str) -> &str {
    match full_base {
        "address" => "uint160",
        "bool" => "uint8",
        b => b,
    }
}

impl TypeDef {
    pub fn new(name: &str, param_name: &str) -> Result<TypeDef, CodecError> {
        let name = name.trim();
        let (base, brackets) = split_type(name)?;
        validate_base(base, name)?;

        let suffix = &name[base.len()..];
        let fbase = full_base(base);
        let full_name = format!("{}{}", fbase, suffix);
        let real_name = format!("{}{}", real_base(fbase), suffix);

        // brackets are declared innermost first
        let mut shape = Shape::Scalar;
        for len in brackets.iter() {
            shape = Shape::Array(Box::new(shape), *len);
        }
        let dimensions = shape.extents();

        let pad_left = !(full_name.starts_with("bytes") || full_name.starts_with("string"));
        let is_dynamic = fbase == "string" || fbase == "bytes";
        let is_dynamic_array = dimensions.first().map(|d| *d == 0).unwrap_or(false);
        let is_sub_dynamic_array = dimensions.get(1).map(|d| *d == 0).unwrap_or(false);

        Ok(TypeDef {
            name: name.to_string(),
            param_name: param_name.to_string(),
            full_name,
            real_name,
            dimensions,
            shape,
            pad_left,
            is_dynamic,
            is_dynamic_array,
            is_sub_dynamic_array,
        })
    }

    /// number of array dimensions; 0 for scalars
    #[inline]
    pub fn depth(&self) -> usize {
        self.dimensions.len()
    }

    /// address-typed values feed the account list
    #[inline]
    pub fn is_address(&self) -> bool {
        self.name.starts_with("address")
    }

    /// whether the ABI encoding of this argument lives in the tail section
    pub fn needs_offset(&self) -> bool {
        self.is_dynamic || self.shape.has_dynamic_extent()
    }

    /// `type param` as used in function and event listings
    pub fn display(&self) -> String {
        if self.param_name.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.param_name)
        }
    }

    /// corresponding ethabi parameter type
    pub fn param_type(&self) -> anyhow::Result<ethabi::ParamType> {
        ethabi::param_type::Reader::read(&self.full_name)
            .map_err(|e| anyhow::anyhow!("ethabi cannot parse {}: {:?}", self.full_name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(BUFFER_HEADER_SIZE, 96);
        let mut raw = [0u8; 96];
        raw[32] = 0x11;
        raw[44] = 0x22;
        raw[71] = 7;
        raw[79] = 9;
        let h = BufferHeader::read_from_prefix(&raw[..]).unwrap();
        assert_eq!(h.balance[0], 0x11);
        assert_eq!(h.sender[0], 0x22);
        assert_eq!(h.block_number(), 7);
        assert_eq!(h.block_timestamp(), 9);
        assert_eq!(h.as_bytes(), &raw[..]);
    }

    #[test]
    fn scalar_names() {
        let t = TypeDef::new("uint", "amount").unwrap();
        assert_eq!(t.full_name, "uint256");
        assert_eq!(t.real_name, "uint256");
        assert_eq!(t.depth(), 0);
        assert!(t.pad_left);
        assert!(!t.is_dynamic);

        let t = TypeDef::new("address", "to").unwrap();
        assert_eq!(t.real_name, "uint160");
        assert!(t.is_address());

        let t = TypeDef::new("bool", "").unwrap();
        assert_eq!(t.real_name, "uint8");

        let t = TypeDef::new("string", "s").unwrap();
        assert!(t.is_dynamic);
        assert!(!t.pad_left);
        assert!(t.needs_offset());

        let t = TypeDef::new("bytes32", "h").unwrap();
        assert!(!t.is_dynamic);
        assert!(!t.pad_left);

        let t = TypeDef::new("fixed", "f").unwrap();
        assert_eq!(t.full_name, "fixed128x128");
    }

    #[test]
    fn array_shapes() {
        let t = TypeDef::new("uint[]", "xs").unwrap();
        assert_eq!(t.full_name, "uint256[]");
        assert_eq!(t.dimensions, vec![0]);
        assert!(t.is_dynamic_array);
        assert!(t.needs_offset());

        let t = TypeDef::new("uint8[2][]", "m").unwrap();
        assert_eq!(t.dimensions, vec![0, 2]);
        assert_eq!(
            t.shape,
            Shape::Array(Box::new(Shape::Array(Box::new(Shape::Scalar), Some(2))), None)
        );
        assert!(t.is_dynamic_array);
        assert!(!t.is_sub_dynamic_array);

        let t = TypeDef::new("address[][3]", "m").unwrap();
        assert_eq!(t.dimensions, vec![3, 0]);
        assert!(!t.is_dynamic_array);
        assert!(t.is_sub_dynamic_array);
        assert!(t.needs_offset());

        let t = TypeDef::new("int16[4]", "m").unwrap();
        assert!(!t.needs_offset());

        let t = TypeDef::new("bytes[2][2][]", "deep").unwrap();
        assert_eq!(t.depth(), 3);
        assert!(t.is_dynamic);
    }

    #[test]
    fn invalid_types() {
        assert!(matches!(TypeDef::new("uint[", ""), Err(CodecError::InvalidType(_))));
        assert!(matches!(TypeDef::new("uint[0]", ""), Err(CodecError::InvalidType(_))));
        assert!(matches!(TypeDef::new("Uint", ""), Err(CodecError::InvalidType(_))));
        assert!(matches!(TypeDef::new("foo32", ""), Err(CodecError::InvalidType(_))));
        assert!(matches!(TypeDef::new("uint8x8", ""), Err(CodecError::InvalidType(_))));
        assert!(matches!(TypeDef::new("tuple[]", ""), Err(CodecError::UnsupportedType(_))));
        assert!(TypeDef::new("ufixed64x10", "").is_ok());
    }

    #[test]
    fn ethabi_param_types() {
        let t = TypeDef::new("uint8[2][]", "m").unwrap();
        assert_eq!(t.param_type().unwrap().to_string(), "uint8[2][]");
    }
}
