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

//! Interfaces to the collaborators that actually run bytecode and classify vulnerabilities.
//!
//! Branch ids are strings of the form `<pc of last jumpi>:<jump target>`. A covered branch is a
//! *tracebit*, an uncovered branch together with its distance to being flipped is a *predicate*.

use ethereum_types::{H160, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::abi::EventMap;
use crate::bytecode::ValidJumpis;
use crate::codec::TxPlan;
use crate::{FastIndexMap, FastIndexSet};

/// Everything observed while executing one test case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceResult {
    /// covered branch ids in the order they were first hit
    pub tracebits: FastIndexSet<String>,
    /// uncovered branch id to comparison value (smaller is closer to flipping)
    pub predicates: FastIndexMap<String, U256>,
    /// ids (pc of the faulting instruction) of the exceptions raised
    pub exceptions: FastIndexSet<String>,
    /// concatenation of the tracebits, only ever compared for equality
    pub checksum: String,
    /// events and exceptions per executed function, see [`render_log`]
    pub log: String,
}

impl TraceResult {
    /// Builds a result from its parts, deriving the checksum from the tracebits.
    pub fn new(
        tracebits: FastIndexSet<String>,
        predicates: FastIndexMap<String, U256>,
        exceptions: FastIndexSet<String>,
        log: String,
    ) -> TraceResult {
        let checksum = tracebits.iter().map(|s| s.as_str()).collect::<String>();
        TraceResult {
            tracebits,
            predicates,
            exceptions,
            checksum,
            log,
        }
    }
}

/// Runs transaction sequences against the target contract.
pub trait ExecutionOracle {
    /// Deploy the contract described by the plan's constructor call-data. Returns the deployed
    /// address if the backend knows it.
    fn deploy(&mut self, plan: &TxPlan) -> anyhow::Result<Option<H160>>;

    /// Run constructor and all calls of `plan`, recording only branches at `jumpis`.
    fn exec(&mut self, plan: &TxPlan, jumpis: &ValidJumpis) -> anyhow::Result<TraceResult>;
}

/// The fixed vulnerability taxonomy, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vulnerability {
    GaslessSend,
    ExceptionDisorder,
    TimeDependency,
    NumberDependency,
    DelegateCall,
    Reentrancy,
    Freezing,
    Underflow,
    Overflow,
    UncheckedCall,
    Suicidal,
}

impl Vulnerability {
    pub const COUNT: usize = 11;

    pub const ALL: [Vulnerability; Vulnerability::COUNT] = [
        Vulnerability::GaslessSend,
        Vulnerability::ExceptionDisorder,
        Vulnerability::TimeDependency,
        Vulnerability::NumberDependency,
        Vulnerability::DelegateCall,
        Vulnerability::Reentrancy,
        Vulnerability::Freezing,
        Vulnerability::Underflow,
        Vulnerability::Overflow,
        Vulnerability::UncheckedCall,
        Vulnerability::Suicidal,
    ];

    /// key used in the JSON report
    pub fn key(&self) -> &'static str {
        match self {
            Vulnerability::GaslessSend => "gasless_send",
            Vulnerability::ExceptionDisorder => "exception_disorder",
            Vulnerability::TimeDependency => "time_dependency",
            Vulnerability::NumberDependency => "number_dependency",
            Vulnerability::DelegateCall => "delegate_call",
            Vulnerability::Reentrancy => "reentrancy",
            Vulnerability::Freezing => "freezing",
            Vulnerability::Underflow => "underflow",
            Vulnerability::Overflow => "overflow",
            Vulnerability::UncheckedCall => "unchecked_call",
            Vulnerability::Suicidal => "suicidal",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Vulnerability::GaslessSend => "Gasless Send",
            Vulnerability::ExceptionDisorder => "Exception Disorder",
            Vulnerability::TimeDependency => "Time Dependency",
            Vulnerability::NumberDependency => "Block Number Dependency",
            Vulnerability::DelegateCall => "Delegate Call",
            Vulnerability::Reentrancy => "Reentrancy",
            Vulnerability::Freezing => "Freezing",
            Vulnerability::Underflow => "Underflow",
            Vulnerability::Overflow => "Overflow",
            Vulnerability::UncheckedCall => "Unchecked Call",
            Vulnerability::Suicidal => "Suicidal",
        }
    }

    pub fn from_key(key: &str) -> Option<Vulnerability> {
        Self::ALL.iter().find(|v| v.key() == key).cloned()
    }
}

impl fmt::Display for Vulnerability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One yes/no flag per [`Vulnerability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VulnerabilityFlags([bool; Vulnerability::COUNT]);

impl VulnerabilityFlags {
    /// Oracles may report fewer flags than we know about; missing ones are `false`, extra ones
    /// are ignored.
    pub fn from_bools(flags: &[bool]) -> Self {
        let mut v = Self::default();
        for (slot, flag) in v.0.iter_mut().zip(flags.iter()) {
            *slot = *flag;
        }
        v
    }

    #[inline]
    pub fn get(&self, vuln: Vulnerability) -> bool {
        self.0[vuln as usize]
    }

    #[inline]
    pub fn set(&mut self, vuln: Vulnerability, value: bool) {
        self.0[vuln as usize] = value;
    }

    pub fn count(&self) -> usize {
        self.0.iter().filter(|f| **f).count()
    }

    pub fn found(&self) -> impl Iterator<Item = Vulnerability> + '_ {
        Vulnerability::ALL.iter().cloned().filter(move |v| self.get(*v))
    }

    pub fn merge(&mut self, other: &VulnerabilityFlags) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a |= *b;
        }
    }

    /// `{"gasless_send": "Yes", ...}`
    pub fn to_report_json(&self) -> serde_json::Map<String, serde_json::Value> {
        Vulnerability::ALL
            .iter()
            .map(|v| {
                let yes = if self.get(*v) { "Yes" } else { "No" };
                (v.key().to_string(), serde_json::Value::from(yes))
            })
            .collect()
    }
}

/// Post-hoc classifier over everything executed since the last reset.
pub trait VulnerabilityOracle {
    fn analyze(&mut self) -> anyhow::Result<VulnerabilityFlags>;

    /// forget everything recorded so far
    fn reset(&mut self) -> anyhow::Result<()>;
}

/// An event emitted during a call, topics and data as hex without `0x`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmittedEvent {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

/// What happened in a single function call of a transaction sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallLog {
    pub function: String,
    #[serde(default)]
    pub events: Vec<EmittedEvent>,
    /// exception name, `None` if the call went through
    #[serde(default)]
    pub exception: Option<String>,
}

fn render_event(out: &mut String, events: &EventMap, event: &EmittedEvent) {
    let topic0 = match event.topics.first() {
        Some(t) => hexutil::clean_0x(t).to_lowercase(),
        None => return,
    };
    match events.get(&topic0) {
        Some(sig) => {
            out.push_str(&format!("Event: `{}`; ", sig));
            if event.topics.len() > 1 {
                out.push_str("Indexed Parameters: ");
                for (i, topic) in event.topics.iter().enumerate().skip(1) {
                    out.push_str(&format!("Param{}: {}; ", i, hexutil::clean_0x(topic)));
                }
            }
            if !event.data.is_empty() {
                out.push_str(&format!(
                    "Non-Indexed Parameters: {}; ",
                    hexutil::clean_0x(&event.data)
                ));
            }
        }
        None => out.push_str(&format!("Unknown Event with Hash: {}; ", topic0)),
    }
}

/// Renders the execution log the mutation advisor works with, e.g.
/// ``In function `f`, No events were triggered during this transaction; Exception: No exception.``
pub fn render_log(events: &EventMap, calls: &[CallLog]) -> String {
    let mut parts = Vec::with_capacity(calls.len());
    for call in calls.iter() {
        let mut out = format!("In function `{}`, ", call.function);
        if call.events.is_empty() {
            out.push_str("No events were triggered during this transaction; ");
        } else {
            out.push_str("the following events were triggered: ");
            for event in call.events.iter() {
                render_event(&mut out, events, event);
            }
        }
        out.push_str(&format!(
            "Exception: {}.",
            call.exception.as_deref().unwrap_or("No exception")
        ));
        parts.push(out);
    }
    parts.join(" ")
}
