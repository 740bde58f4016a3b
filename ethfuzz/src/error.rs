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

//! Typed errors for codec invariant violations. Everything else uses [`anyhow`].

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("fuzz buffer has {0} bytes, no room for the block segment")]
    EmptyBlock(usize),

    #[error("value for `{ty}` has nesting depth {got}, expected {expected}")]
    DimensionMismatch {
        ty: String,
        expected: usize,
        got: usize,
    },

    #[error("fixed array `{ty}` expects {expected} elements, got {got}")]
    LengthMismatch {
        ty: String,
        expected: usize,
        got: usize,
    },

    #[error("invalid type string: {0:?}")]
    InvalidType(String),

    #[error("unsupported type: {0:?}")]
    UnsupportedType(String),

    #[error("static value of `{0}` exceeds 32 bytes ({1} bytes)")]
    OversizedStatic(String, usize),

    #[error("execution order references unknown function index {0}")]
    UnknownFunction(usize),
}
