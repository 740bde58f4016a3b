use crate::abi::ContractAbi;
use crate::advisor::Advisor;
use crate::bytecode::ValidJumpis;
use crate::codec::TxPlan;
use crate::oracle::{ExecutionOracle, TraceResult, VulnerabilityFlags, VulnerabilityOracle};
use crate::{FastIndexMap, FastIndexSet};

use ethereum_types::{H160, U256};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub const SAMPLE_ABI: &str = r#"[
    {"type": "constructor", "inputs": [{"type": "uint256", "name": "supply"}], "payable": false},
    {"type": "function", "name": "transfer", "inputs": [{"type": "address", "name": "to"}, {"type": "uint256", "name": "value"}], "constant": false},
    {"type": "function", "name": "deposit", "inputs": [], "stateMutability": "payable"},
    {"type": "fallback", "payable": true},
    {"type": "event", "name": "Transfer", "inputs": [{"type": "address", "name": "from", "indexed": true}, {"type": "address", "name": "to", "indexed": true}, {"type": "uint256", "name": "value"}]}
]"#;

pub fn sample_abi() -> ContractAbi {
    ContractAbi::from_json("Token", SAMPLE_ABI).unwrap()
}

/// one function per interesting type family
pub fn codec_abi() -> ContractAbi {
    let abi = r#"[
        {"type": "constructor", "inputs": [{"type": "uint256", "name": "cap"}]},
        {"type": "function", "name": "f", "inputs": [{"type": "uint8", "name": "a"}, {"type": "string", "name": "s"}, {"type": "address", "name": "to"}]},
        {"type": "function", "name": "g", "inputs": [{"type": "uint256[]", "name": "xs"}, {"type": "bytes", "name": "b"}, {"type": "bool", "name": "flag"}]},
        {"type": "function", "name": "h", "inputs": [{"type": "uint256[2][]", "name": "m"}, {"type": "bytes32", "name": "k"}, {"type": "int16", "name": "i"}]}
    ]"#;
    ContractAbi::from_json("Codec", abi).unwrap()
}

/// contract `Test` with a single non-payable function `name(p0, p1, ...)`
pub fn single_function_abi(name: &str, types: &[&str]) -> ContractAbi {
    let inputs: Vec<serde_json::Value> = types
        .iter()
        .enumerate()
        .map(|(i, t)| serde_json::json!({"type": t, "name": format!("p{}", i)}))
        .collect();
    let abi = serde_json::json!([{"type": "function", "name": name, "inputs": inputs}]);
    ContractAbi::from_json("Test", &abi.to_string()).unwrap()
}

pub fn crowdsale_abi() -> ContractAbi {
    let abi = r#"[
        {"type": "constructor", "inputs": [{"type": "uint256", "name": "_goal"}]},
        {"type": "function", "name": "invest", "inputs": [{"type": "uint256", "name": "amount"}], "payable": true},
        {"type": "function", "name": "setPhase", "inputs": [{"type": "uint256", "name": "newPhase"}]}
    ]"#;
    ContractAbi::from_json("Crowdsale", abi).unwrap()
}

pub fn wallet_abi() -> ContractAbi {
    let abi = r#"[
        {"type": "constructor", "inputs": []},
        {"type": "function", "name": "withdraw", "inputs": [{"type": "uint256", "name": "amount"}]},
        {"type": "function", "name": "invest", "inputs": [], "stateMutability": "payable"},
        {"type": "function", "name": "kill", "inputs": []},
        {"type": "function", "name": "setOwner", "inputs": [{"type": "address", "name": "owner"}]},
        {"type": "function", "name": "owner", "inputs": [], "constant": true}
    ]"#;
    ContractAbi::from_json("Wallet", abi).unwrap()
}

pub fn trace(tracebits: &[&str], predicates: &[(&str, u64)]) -> TraceResult {
    let tracebits: FastIndexSet<String> = tracebits.iter().map(|s| s.to_string()).collect();
    let predicates: FastIndexMap<String, U256> = predicates
        .iter()
        .map(|(id, v)| (id.to_string(), U256::from(*v)))
        .collect();
    TraceResult::new(tracebits, predicates, FastIndexSet::default(), String::new())
}

/// Replies with the given answers in order, then fails. Every prompt is recorded.
pub struct ScriptedAdvisor {
    replies: VecDeque<String>,
    prompts: Rc<RefCell<Vec<String>>>,
}

impl ScriptedAdvisor {
    pub fn new(replies: Vec<String>) -> (ScriptedAdvisor, Rc<RefCell<Vec<String>>>) {
        let prompts = Rc::new(RefCell::new(vec![]));
        (
            ScriptedAdvisor {
                replies: replies.into_iter().collect(),
                prompts: prompts.clone(),
            },
            prompts,
        )
    }
}

impl Advisor for ScriptedAdvisor {
    fn ask(&mut self, prompt: &str) -> anyhow::Result<String> {
        self.prompts.borrow_mut().push(prompt.to_string());
        self.replies
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("advisor has no more replies"))
    }
}

pub type Script = Box<dyn FnMut(&TxPlan) -> (TraceResult, VulnerabilityFlags)>;

/// Deterministic execution and vulnerability oracle driven by a closure over the plan.
pub struct ScriptedOracle {
    script: Script,
    pub deployed: Option<H160>,
    pub deploys: u64,
    pub execs: u64,
    pub resets: u64,
    seen: VulnerabilityFlags,
}

impl ScriptedOracle {
    pub fn new<F>(script: F) -> ScriptedOracle
    where
        F: FnMut(&TxPlan) -> (TraceResult, VulnerabilityFlags) + 'static,
    {
        ScriptedOracle {
            script: Box::new(script),
            deployed: None,
            deploys: 0,
            execs: 0,
            resets: 0,
            seen: VulnerabilityFlags::default(),
        }
    }
}

impl ExecutionOracle for ScriptedOracle {
    fn deploy(&mut self, _plan: &TxPlan) -> anyhow::Result<Option<H160>> {
        self.deploys += 1;
        Ok(self.deployed)
    }

    fn exec(&mut self, plan: &TxPlan, _jumpis: &ValidJumpis) -> anyhow::Result<TraceResult> {
        self.execs += 1;
        let (res, vulns) = (self.script)(plan);
        self.seen.merge(&vulns);
        Ok(res)
    }
}

impl VulnerabilityOracle for ScriptedOracle {
    fn analyze(&mut self) -> anyhow::Result<VulnerabilityFlags> {
        Ok(self.seen)
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.resets += 1;
        self.seen = VulnerabilityFlags::default();
        Ok(())
    }
}

/// For [`single_function_abi`] with a `uint256` first argument: `10:20` is always covered,
/// `10:30` only if the argument is non-zero, which also counts as an overflow.
pub fn nonzero_argument_oracle() -> ScriptedOracle {
    ScriptedOracle::new(|plan: &TxPlan| {
        let nonzero = plan
            .calls
            .first()
            .map(|c| c.data.len() >= 36 && c.data[4..36].iter().any(|b| *b != 0))
            .unwrap_or(false);
        let mut vulns = VulnerabilityFlags::default();
        if nonzero {
            vulns.set(crate::oracle::Vulnerability::Overflow, true);
            (trace(&["10:20", "10:30"], &[]), vulns)
        } else {
            (trace(&["10:20"], &[("10:30", 1)]), vulns)
        }
    })
}

/// bytecode with a single JUMPI at pc 10
pub const ONE_JUMPI_CODE: [u8; 12] = [
    0x60, 0x01, 0x60, 0x01, 0x60, 0x00, 0x60, 0x00, 0x60, 0x00, 0x57, 0x00,
];
