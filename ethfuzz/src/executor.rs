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

//! Oracles backed by an external process.
//!
//! The process reads one JSON request per line on stdin and answers each with one JSON object on
//! stdout. Requests carry an `op` field:
//!
//! ```text
//! {"op":"deploy","constructor":"<hex>","accounts":[...],"block":{...}}
//!     -> {"address":"0x..."}            (address may be null or missing)
//! {"op":"exec","constructor":"<hex>","calls":[...],"accounts":[...],"block":{...},
//!  "jumpis":{"deploy":[pc,...],"runtime":[pc,...]}}
//!     -> {"tracebits":["pc:target",...],"predicates":{"pc:target":"<decimal>",...},
//!         "exceptions":["pc",...],"calls":[{"function":"f","events":[...],"exception":null}]}
//! {"op":"analyze"} -> {"vulnerabilities":[true,false,...]}
//! {"op":"reset"}   -> {}
//! ```
//!
//! Any reply may instead be `{"error":"..."}`.

use anyhow::{anyhow, bail, Context};
use ethereum_types::{H160, U256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;
use subprocess::{Popen, PopenConfig, Redirection};

use crate::abi::EventMap;
use crate::bytecode::ValidJumpis;
use crate::codec::{Account, Block, TxPlan};
use crate::oracle::{
    render_log, CallLog, ExecutionOracle, TraceResult, VulnerabilityFlags, VulnerabilityOracle,
};
use crate::{FastIndexMap, FastIndexSet};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Serialize)]
struct AccountMsg {
    address: String,
    balance: String,
}

impl From<&Account> for AccountMsg {
    fn from(a: &Account) -> AccountMsg {
        AccountMsg {
            address: format!("{:?}", a.address),
            balance: a.balance.to_string(),
        }
    }
}

#[derive(Serialize)]
struct BlockMsg {
    number: u64,
    timestamp: u64,
}

impl From<&Block> for BlockMsg {
    fn from(b: &Block) -> BlockMsg {
        BlockMsg {
            number: b.number,
            timestamp: b.timestamp,
        }
    }
}

#[derive(Serialize)]
struct CallMsg<'a> {
    name: &'a str,
    data: String,
    payable: bool,
    value: String,
}

#[derive(Serialize)]
struct JumpisMsg<'a> {
    deploy: Vec<&'a u64>,
    runtime: Vec<&'a u64>,
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Deploy {
        constructor: String,
        accounts: Vec<AccountMsg>,
        block: BlockMsg,
    },
    Exec {
        constructor: String,
        calls: Vec<CallMsg<'a>>,
        accounts: Vec<AccountMsg>,
        block: BlockMsg,
        jumpis: JumpisMsg<'a>,
    },
    Analyze,
    Reset,
}

#[derive(Deserialize, Default)]
struct DeployReply {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Deserialize, Default)]
struct ExecReply {
    #[serde(default)]
    tracebits: Vec<String>,
    #[serde(default)]
    predicates: FastIndexMap<String, String>,
    #[serde(default)]
    exceptions: Vec<String>,
    #[serde(default)]
    calls: Vec<CallLog>,
}

#[derive(Deserialize, Default)]
struct AnalyzeReply {
    #[serde(default)]
    vulnerabilities: Vec<bool>,
}

#[derive(Deserialize)]
struct Ignored {}

fn encode_hex(data: &[u8]) -> String {
    hexutil::to_hex(data)
}

fn parse_address(s: &str) -> anyhow::Result<H160> {
    let bytes = hexutil::read_hex(hexutil::clean_0x(s))
        .map_err(|e| anyhow!("invalid address {:?} from executor: {:?}", s, e))?;
    if bytes.len() != 20 {
        bail!("executor reported address {:?} with {} bytes", s, bytes.len());
    }
    anyhow::Result::Ok(H160::from_slice(&bytes))
}

impl ExecReply {
    fn into_trace(self, events: &EventMap) -> anyhow::Result<TraceResult> {
        let mut predicates = FastIndexMap::default();
        for (id, value) in self.predicates.into_iter() {
            let v = U256::from_dec_str(&value)
                .map_err(|e| anyhow!("invalid comparison value {:?} for {}: {:?}", value, id, e))?;
            predicates.insert(id, v);
        }
        let tracebits: FastIndexSet<String> = self.tracebits.into_iter().collect();
        let exceptions: FastIndexSet<String> = self.exceptions.into_iter().collect();
        let log = render_log(events, &self.calls);
        anyhow::Result::Ok(TraceResult::new(tracebits, predicates, exceptions, log))
    }
}

/// Talks to a long-running executor process, see the module documentation for the protocol.
pub struct ProcessExecutor {
    proc: Popen,
    stdin: Option<File>,
    stdout: BufReader<File>,
    events: EventMap,
    line: String,
}

impl ProcessExecutor {
    /// Spawn `argv` (program followed by its arguments). `events` is used to render the
    /// execution logs.
    pub fn spawn<S: AsRef<OsStr>>(argv: &[S], events: EventMap) -> anyhow::Result<ProcessExecutor> {
        if argv.is_empty() {
            bail!("empty executor command");
        }
        let mut proc = Popen::create(
            argv,
            PopenConfig {
                stdin: Redirection::Pipe,
                stdout: Redirection::Pipe,
                ..Default::default()
            },
        )
        .with_context(|| {
            format!(
                "failed to launch executor {:?}",
                argv[0].as_ref().to_string_lossy()
            )
        })?;
        let stdin = proc.stdin.take();
        let stdout = proc
            .stdout
            .take()
            .ok_or_else(|| anyhow!("executor stdout is not a pipe"))?;
        anyhow::Result::Ok(ProcessExecutor {
            proc,
            stdin,
            stdout: BufReader::new(stdout),
            events,
            line: String::new(),
        })
    }

    fn request<T: DeserializeOwned>(&mut self, req: &Request<'_>) -> anyhow::Result<T> {
        let msg = serde_json::to_string(req)?;
        let stdin = match self.stdin.as_mut() {
            Some(s) => s,
            None => bail!("executor stdin already closed"),
        };
        writeln!(stdin, "{}", msg)
            .and_then(|_| stdin.flush())
            .context("failed to send request to executor")?;

        self.line.clear();
        let n = self
            .stdout
            .read_line(&mut self.line)
            .context("failed to read executor reply")?;
        if n == 0 {
            bail!("executor exited unexpectedly");
        }
        let reply: serde_json::Value = serde_json::from_str(self.line.trim())
            .with_context(|| format!("malformed executor reply: {:?}", self.line.trim()))?;
        if let Some(err) = reply.get("error") {
            bail!("executor error: {}", err);
        }
        let reply = serde_json::from_value(reply).context("unexpected executor reply")?;
        anyhow::Result::Ok(reply)
    }
}

impl ExecutionOracle for ProcessExecutor {
    fn deploy(&mut self, plan: &TxPlan) -> anyhow::Result<Option<H160>> {
        let req = Request::Deploy {
            constructor: encode_hex(&plan.constructor),
            accounts: plan.accounts.iter().map(AccountMsg::from).collect(),
            block: BlockMsg::from(&plan.block),
        };
        let reply: DeployReply = self.request(&req)?;
        match reply.address {
            Some(a) => parse_address(&a).map(Some),
            None => anyhow::Result::Ok(None),
        }
    }

    fn exec(&mut self, plan: &TxPlan, jumpis: &ValidJumpis) -> anyhow::Result<TraceResult> {
        let req = Request::Exec {
            constructor: encode_hex(&plan.constructor),
            calls: plan
                .calls
                .iter()
                .map(|c| CallMsg {
                    name: &c.name,
                    data: encode_hex(&c.data),
                    payable: c.payable,
                    value: c.value.to_string(),
                })
                .collect(),
            accounts: plan.accounts.iter().map(AccountMsg::from).collect(),
            block: BlockMsg::from(&plan.block),
            jumpis: JumpisMsg {
                deploy: jumpis.deploy.iter().collect(),
                runtime: jumpis.runtime.iter().collect(),
            },
        };
        let reply: ExecReply = self.request(&req)?;
        reply.into_trace(&self.events)
    }
}

impl VulnerabilityOracle for ProcessExecutor {
    fn analyze(&mut self) -> anyhow::Result<VulnerabilityFlags> {
        let reply: AnalyzeReply = self.request(&Request::Analyze)?;
        anyhow::Result::Ok(VulnerabilityFlags::from_bools(&reply.vulnerabilities))
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        let _: Ignored = self.request(&Request::Reset)?;
        anyhow::Result::Ok(())
    }
}

impl Drop for ProcessExecutor {
    fn drop(&mut self) {
        // closing stdin asks the executor to exit
        self.stdin.take();
        match self.proc.wait_timeout(SHUTDOWN_TIMEOUT) {
            Ok(Some(_)) => {}
            _ => {
                if let Err(e) = self.proc.kill() {
                    tracing::warn!("failed to kill executor process ({})", e);
                }
                let _ = self.proc.wait();
            }
        }
    }
}
