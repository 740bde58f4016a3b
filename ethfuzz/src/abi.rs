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

//! The contract interface: an immutable table of function and event signatures loaded from a
//! JSON ABI description. The mutable parts of a campaign (execution order, mutation flags) live
//! in [`crate::session::FuzzSession`].

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use twox_hash::XxHash64;

use crate::types::TypeDef;
use crate::utils::{keccak, short_signature};

/// topic hash (hex, no `0x`) to `Name(type param,...)`
pub type EventMap = HashMap<String, String, BuildHasherDefault<XxHash64>>;

/// name used for the synthetic fallback function
pub const FALLBACK_NAME: &str = "fallback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Function,
    Constructor,
    Fallback,
}

/// A function signature. A constructor has an empty name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncDef {
    pub name: String,
    pub inputs: Vec<TypeDef>,
    pub payable: bool,
    pub kind: FunctionKind,
}

impl FuncDef {
    pub fn new(name: &str, inputs: Vec<TypeDef>, payable: bool, kind: FunctionKind) -> Self {
        FuncDef {
            name: name.to_string(),
            inputs,
            payable,
            kind,
        }
    }

    #[inline]
    pub fn is_constructor(&self) -> bool {
        self.kind == FunctionKind::Constructor
    }

    /// canonical signature over full type names, e.g. `transfer(address,uint256)`
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self.inputs.iter().map(|t| t.full_name.as_str()).collect();
        format!("{}({})", self.name, types.join(","))
    }

    /// 4-byte selector; the constructor and the fallback are called without one
    pub fn selector(&self) -> Option<[u8; 4]> {
        match self.kind {
            FunctionKind::Function => Some(short_signature(&self.signature())),
            _ => None,
        }
    }

    /// human readable `name(type param,...)`; the constructor is shown with the contract name
    pub fn api(&self, contract_name: &str) -> String {
        let name = if self.is_constructor() {
            contract_name
        } else {
            &self.name
        };
        let params: Vec<String> = self.inputs.iter().map(|t| t.display()).collect();
        format!("{}({})", name, params.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDef {
    pub name: String,
    pub inputs: Vec<TypeDef>,
}

impl EventDef {
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self.inputs.iter().map(|t| t.full_name.as_str()).collect();
        format!("{}({})", self.name, types.join(","))
    }

    /// full keccak of the canonical signature, i.e., topic 0 of the emitted log
    pub fn topic(&self) -> [u8; 32] {
        keccak(self.signature().as_bytes())
    }

    pub fn display(&self) -> String {
        let params: Vec<String> = self.inputs.iter().map(|t| t.display()).collect();
        format!("{}({})", self.name, params.join(","))
    }
}

#[derive(Deserialize, Debug)]
struct AbiParam {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize, Debug)]
struct AbiEntry {
    #[serde(rename = "type", default = "default_entry_kind")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<AbiParam>,
    #[serde(default)]
    payable: Option<bool>,
    #[serde(default)]
    constant: Option<serde_json::Value>,
    #[serde(default, rename = "stateMutability")]
    state_mutability: Option<String>,
}

fn default_entry_kind() -> String {
    "function".to_string()
}

impl AbiEntry {
    fn is_constant(&self) -> bool {
        let flagged = match &self.constant {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s == "true",
            _ => false,
        };
        flagged
            || matches!(
                self.state_mutability.as_deref(),
                Some("view") | Some("pure")
            )
    }

    fn is_payable(&self) -> bool {
        self.payable.unwrap_or(false) || self.state_mutability.as_deref() == Some("payable")
    }

    fn type_defs(&self) -> anyhow::Result<Vec<TypeDef>> {
        self.inputs
            .iter()
            .map(|p| {
                TypeDef::new(&p.kind, &p.name).with_context(|| {
                    format!("invalid parameter `{}` of `{}`", p.name, self.name)
                })
            })
            .collect()
    }
}

/// Contract interface loaded from a JSON ABI.
#[derive(Debug, Clone)]
pub struct ContractAbi {
    pub name: String,
    functions: Vec<FuncDef>,
    events: Vec<EventDef>,
    event_map: EventMap,
}

impl ContractAbi {
    pub fn from_json(contract_name: &str, abi_json: &str) -> anyhow::Result<ContractAbi> {
        let entries: Vec<AbiEntry> =
            serde_json::from_str(abi_json).context("malformed ABI JSON")?;

        let mut functions = vec![];
        let mut events = vec![];
        for entry in entries.iter() {
            match entry.kind.as_str() {
                "fallback" => {
                    functions.push(FuncDef::new(
                        FALLBACK_NAME,
                        vec![],
                        entry.is_payable(),
                        FunctionKind::Fallback,
                    ));
                }
                "constructor" if !entry.is_constant() => {
                    functions.push(FuncDef::new(
                        "",
                        entry.type_defs()?,
                        entry.is_payable(),
                        FunctionKind::Constructor,
                    ));
                }
                "function" if !entry.is_constant() => {
                    functions.push(FuncDef::new(
                        &entry.name,
                        entry.type_defs()?,
                        entry.is_payable(),
                        FunctionKind::Function,
                    ));
                }
                "event" => {
                    events.push(EventDef {
                        name: entry.name.clone(),
                        inputs: entry.type_defs()?,
                    });
                }
                other => {
                    tracing::debug!("skipping ABI entry {:?} of type {}", entry.name, other);
                }
            }
        }

        let mut event_map = EventMap::default();
        for event in events.iter() {
            let topic = hexutil::to_hex(&event.topic());
            event_map.insert(hexutil::clean_0x(&topic).to_string(), event.display());
        }

        anyhow::Result::Ok(ContractAbi {
            name: contract_name.to_string(),
            functions,
            events,
            event_map,
        })
    }

    pub fn load_from_file(contract_name: &str, path: &std::path::Path) -> anyhow::Result<ContractAbi> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ABI file {}", path.display()))?;
        Self::from_json(contract_name, &contents)
            .with_context(|| format!("failed to load ABI definition from file {}", path.display()))
    }

    /// all fuzz target functions in declaration order (constructor and fallback included)
    #[inline]
    pub fn functions(&self) -> &[FuncDef] {
        &self.functions
    }

    #[inline]
    pub fn function(&self, idx: usize) -> Option<&FuncDef> {
        self.functions.get(idx)
    }

    #[inline]
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn constructor(&self) -> Option<&FuncDef> {
        self.functions.iter().find(|f| f.is_constructor())
    }

    #[inline]
    pub fn events(&self) -> &[EventDef] {
        &self.events
    }

    #[inline]
    pub fn event_map(&self) -> &EventMap {
        &self.event_map
    }

    pub fn function_api(&self, idx: usize) -> Option<String> {
        self.functions.get(idx).map(|f| f.api(&self.name))
    }

    /// `1:api,2:api,...` listing of all functions
    pub fn function_apis(&self) -> String {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, f)| format!("{}:{}", i + 1, f.api(&self.name)))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn print_functions(&self) {
        for (i, f) in self.functions.iter().enumerate() {
            let sel = match f.selector() {
                Some(s) => hexutil::to_hex(&s),
                None => "-".to_string(),
            };
            let payable = if f.payable { " payable" } else { "" };
            println!("{:>3} {:>10} => {}{}", i + 1, sel, f.api(&self.name), payable);
        }
    }
}
