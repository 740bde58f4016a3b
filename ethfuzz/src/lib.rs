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

//! Coverage-guided fuzzing of smart contract transaction sequences.
//!
//! A test case is a single byte buffer. Given the contract ABI and an execution order, [`codec`]
//! reads account, block and argument values out of it and turns them into call-data. The
//! [`mutation`] engine mutates such buffers, the [`tracker`] keeps the best buffer per branch and
//! the [`fuzzer`] drives everything against an [`oracle::ExecutionOracle`].

/// version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION", "0-dev");

#[cfg(feature = "use_jemalloc")]
extern crate jemallocator;

#[cfg(not(any(feature = "use_mimalloc", feature = "use_mimalloc_secure")))]
#[cfg(not(feature = "use_snmalloc"))]
#[cfg(feature = "use_jemalloc")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[cfg(not(feature = "use_jemalloc"))]
#[cfg(not(feature = "use_snmalloc"))]
#[cfg(any(feature = "use_mimalloc", feature = "use_mimalloc_secure"))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[cfg(not(feature = "use_jemalloc"))]
#[cfg(not(any(feature = "use_mimalloc", feature = "use_mimalloc_secure")))]
#[cfg(feature = "use_snmalloc")]
#[global_allocator]
static ALLOC: snmalloc_rs::SnMalloc = snmalloc_rs::SnMalloc;

extern crate ethabi;
extern crate hexutil;
extern crate rand;
extern crate rand_pcg;
extern crate sha3;
#[macro_use]
extern crate lazy_static;
extern crate anyhow;
extern crate ethereum_types;
extern crate serde;

pub use ethereum_types::{H160, U256};
use indexmap::{IndexMap, IndexSet};
use std::hash::BuildHasherDefault;
use twox_hash::XxHash64;

pub mod abi;
pub mod advisor;
pub mod bytecode;
pub mod codec;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod executor;
pub mod fuzzer;
pub mod logger;
pub mod mutation;
pub mod oracle;
pub mod ordering;
pub mod report;
pub mod session;
pub mod tracker;
pub mod types;
pub mod utils;

//#[cfg(any(test, bench))]
pub mod test_helpers;

/// the PRNG used everywhere; seeded from the campaign configuration
pub type RngI = rand_pcg::Pcg64Mcg;

pub type FastIndexSet<T> = IndexSet<T, BuildHasherDefault<XxHash64>>;
pub type FastIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<XxHash64>>;

pub use abi::ContractAbi;
pub use config::FuzzConfig;
pub use dictionary::{Dictionary, Dicts};
pub use error::CodecError;
pub use fuzzer::{CampaignSummary, Fuzzer, StopReason, Target};
pub use oracle::{ExecutionOracle, TraceResult, VulnerabilityOracle};
pub use session::{ExecutionOrder, FuzzSession, MutationFlags};
