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

//! Optional text advisor that proposes execution orders and which parameters to mutate.
//!
//! The advisor is an external program that receives a prompt and answers in free text. Nothing
//! it says is trusted: replies are parsed leniently, retried a bounded number of times and
//! replaced by a fallback when they stay unusable.

use anyhow::{bail, Context};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use subprocess::{Exec, Redirection};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::abi::ContractAbi;
use crate::ordering::{is_valid_order, parse_order};
use crate::session::{ExecutionOrder, MutationFlags};
use crate::utils::edit_distance;

/// maximum edit distance when matching reply keys against function and parameter names
pub const MAX_NAME_DISTANCE: usize = 2;

pub trait Advisor {
    /// Send `prompt` and return the raw reply.
    fn ask(&mut self, prompt: &str) -> anyhow::Result<String>;
}

/// Runs `timeout --kill-after=1s <N>s <command> <prompt file>` and takes stdout as the reply.
#[derive(Debug, Clone)]
pub struct CommandAdvisor {
    command: PathBuf,
    timeout: Duration,
}

impl CommandAdvisor {
    pub fn new(command: PathBuf, timeout: Duration) -> CommandAdvisor {
        CommandAdvisor { command, timeout }
    }
}

impl Advisor for CommandAdvisor {
    fn ask(&mut self, prompt: &str) -> anyhow::Result<String> {
        let mut file = NamedTempFile::new()?;
        file.write_all(prompt.as_bytes())?;
        // Close the file, but keep the path to it around.
        let path = file.into_temp_path();

        let out = Exec::cmd("timeout")
            .arg("--kill-after=1s")
            .arg(format!("{}s", std::cmp::max(1, self.timeout.as_secs())))
            .arg(&self.command)
            .arg(path.as_os_str())
            .stdout(Redirection::Pipe)
            .stderr(subprocess::NullFile)
            .capture()
            .with_context(|| format!("failed to launch advisor {}", self.command.display()))?;
        if !out.exit_status.success() {
            bail!(
                "advisor {} exited with {:?}",
                self.command.display(),
                out.exit_status
            );
        }
        anyhow::Result::Ok(out.stdout_str())
    }
}

/// Why a mutation advice reply was rejected. The messages are fed back to the advisor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdviceError {
    #[error("The reply contains no function suggestions. Please provide suggestions for all state functions and their parameters.")]
    NoSuggestions,

    #[error("Function or signature '{0}' is missing.")]
    MissingFunction(String),

    #[error("Parameter '{param}' in function '{function}' is missing.")]
    MissingParameter { function: String, param: String },

    #[error("Invalid suggestion for parameter '{param}' in function '{function}'.")]
    InvalidSuggestion { function: String, param: String },
}

/// The first balanced `{...}` in `text`.
fn first_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (i, c) in text[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..(start + i + 1)]);
                }
            }
            _ => {}
        }
    }
    None
}

type Suggestions = Vec<(String, Vec<(String, String)>)>;

fn parse_suggestions(reply: &str) -> Suggestions {
    let cleaned = reply.replace('\'', "\"");
    let cleaned = cleaned.trim().trim_end_matches('.');
    let object = match first_object(cleaned) {
        Some(o) => o,
        None => return vec![],
    };
    let value: serde_json::Value = match serde_json::from_str(object) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("advisor reply is no valid JSON: {}", e);
            return vec![];
        }
    };
    let map = match value.as_object() {
        Some(m) => m,
        None => return vec![],
    };
    map.iter()
        .filter_map(|(function, params)| {
            let params = params.as_object()?;
            let params = params
                .iter()
                .map(|(p, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (p.clone(), v)
                })
                .collect();
            Some((function.clone(), params))
        })
        .collect()
}

/// Turn an advisor reply into mutation flags. Every function with parameters and every one of
/// its parameters must be covered by the reply.
pub fn parse_mutation_advice(abi: &ContractAbi, reply: &str) -> Result<MutationFlags, AdviceError> {
    let suggestions = parse_suggestions(reply);
    if suggestions.is_empty() {
        return Err(AdviceError::NoSuggestions);
    }
    let mut flags = MutationFlags::all_yes(abi);
    for (fidx, func) in abi.functions().iter().enumerate() {
        if func.inputs.is_empty() {
            continue;
        }
        let name = if func.is_constructor() {
            abi.name.clone()
        } else {
            func.name.clone()
        };
        let api = func.api(&abi.name);
        let api_payable = format!("{} payable", api);
        let (_, params) = suggestions
            .iter()
            .find(|(k, _)| {
                edit_distance(k, &name) <= MAX_NAME_DISTANCE
                    || edit_distance(k, &api) <= MAX_NAME_DISTANCE
                    || edit_distance(k, &api_payable) <= MAX_NAME_DISTANCE
            })
            .ok_or_else(|| AdviceError::MissingFunction(name.clone()))?;

        for (pidx, td) in func.inputs.iter().enumerate() {
            let (_, value) = params
                .iter()
                .find(|(k, _)| edit_distance(k, &td.param_name) <= MAX_NAME_DISTANCE)
                .ok_or_else(|| AdviceError::MissingParameter {
                    function: name.clone(),
                    param: td.param_name.clone(),
                })?;
            let enabled = match value.as_str() {
                "yes" | "Yes" => true,
                "no" | "No" => false,
                _ => {
                    return Err(AdviceError::InvalidSuggestion {
                        function: name,
                        param: td.param_name.clone(),
                    })
                }
            };
            flags.set(fidx, pidx, enabled);
        }
    }
    Ok(flags)
}

/// Prompt asking for a function execution order.
pub fn order_prompt(abi: &ContractAbi, source: &str, existing: &[String]) -> String {
    let mut prompt = String::from(
        "Below is the source code of a smart contract. Work out the dependencies between its \
         functions and return a sensible execution order for the functions listed at the end. \
         Write the order as function numbers separated by arrows, e.g. `1->2->3` runs function 1 \
         first, then 2, then 3. Functions that depend on the effects of others must come after \
         them. If several orders make sense, return one of them, preceded by 'The orders are:'. ",
    );
    if !existing.is_empty() {
        prompt.push_str(
            "The new order must have a Levenshtein distance of at least 2 to each of these \
             existing orders: ",
        );
        prompt.push_str(&existing.join("; "));
        prompt.push_str(". ");
    }
    prompt.push_str("Contract source: ```");
    prompt.push_str(source);
    prompt.push_str("``` Return only the order, no explanations, for these functions: ");
    prompt.push_str(&abi.function_apis());
    prompt
}

/// What the advisor gets to see when asked which parameters to mutate.
#[derive(Debug, Clone, Copy)]
pub struct AdviceContext<'a> {
    /// rendered execution log of the leader
    pub log: &'a str,
    pub order: &'a str,
    /// hex of the leader's fuzz buffer
    pub testcase: &'a str,
}

/// Prompt asking which parameters should be mutated; `remind` lists earlier problems.
pub fn advice_prompt(abi: &ContractAbi, source: &str, ctx: &AdviceContext<'_>, remind: &str) -> String {
    format!(
        "A smart contract is being fuzzed and we need to decide which parameters of its state \
         functions to mutate. Every branch of the contract emits an event, the log below shows \
         which events a recent execution triggered. Execution log: {log}. The functions ran in \
         this order: {order}. The test case that produced the log: {testcase}. The contract: \
         {source} Use exactly the parameter names of these state functions: {apis}. Answer in \
         JSON with exact function and parameter names, labeling every parameter 'Yes' or 'No', \
         e.g. {{'function_name1': {{'parameter_name1': 'Yes','parameter_name2': 'No'}}}}. \
         Problems with earlier answers: {remind} Make sure every function and parameter is \
         present and avoid these problems.",
        log = ctx.log,
        order = ctx.order,
        testcase = ctx.testcase,
        source = source,
        apis = abi.function_apis(),
        remind = remind,
    )
}

/// Wraps an [`Advisor`] with bounded retries and fallbacks.
pub struct BoundedAdvisor {
    inner: Box<dyn Advisor>,
    retries: usize,
    /// contract source code shown to the advisor
    source: String,
    /// number of unusable replies so far
    pub failures: usize,
}

impl BoundedAdvisor {
    pub fn new(inner: Box<dyn Advisor>, retries: usize, source: String) -> BoundedAdvisor {
        BoundedAdvisor {
            inner,
            retries: std::cmp::max(retries, 1),
            source,
            failures: 0,
        }
    }

    fn ask(&mut self, prompt: &str) -> Option<String> {
        match self.inner.ask(prompt) {
            Ok(reply) => Some(reply),
            Err(e) => {
                tracing::warn!("advisor failed: {:#}", e);
                self.failures += 1;
                None
            }
        }
    }

    /// A valid (possibly repaired) execution order, or `None` once the retries are used up.
    pub fn suggest_order(&mut self, abi: &ContractAbi, existing: &[String]) -> Option<ExecutionOrder> {
        let prompt = order_prompt(abi, &self.source, existing);
        for attempt in 0..self.retries {
            let reply = match self.ask(&prompt) {
                Some(r) => r,
                None => continue,
            };
            let order = parse_order(&reply).and_then(|o| is_valid_order(&o, abi.function_count()));
            if order.is_some() {
                return order;
            }
            self.failures += 1;
            tracing::debug!("attempt {}: unusable order in advisor reply {:?}", attempt, reply);
        }
        None
    }

    /// Mutation flags for the leader described by `ctx`; all parameters enabled if the advisor
    /// does not produce a usable answer.
    pub fn mutation_advice(&mut self, abi: &ContractAbi, ctx: &AdviceContext<'_>) -> MutationFlags {
        let mut remind = String::new();
        for _ in 0..self.retries {
            let prompt = advice_prompt(abi, &self.source, ctx, &remind);
            let reply = match self.ask(&prompt) {
                Some(r) => r,
                None => continue,
            };
            match parse_mutation_advice(abi, &reply) {
                Ok(flags) => return flags,
                Err(e) => {
                    self.failures += 1;
                    tracing::debug!("rejected mutation advice: {}", e);
                    remind.push_str(&e.to_string());
                    remind.push(' ');
                }
            }
        }
        tracing::warn!("no usable mutation advice, mutating all parameters");
        MutationFlags::all_yes(abi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;

    #[test]
    fn balanced_object() {
        assert_eq!(first_object("x {a {b} c} {d}"), Some("{a {b} c}"));
        assert_eq!(first_object("{ open"), None);
        assert_eq!(first_object("none"), None);
    }

    #[test]
    fn advice_with_fuzzy_names() {
        let abi = crowdsale_abi();
        // single quotes, a typo in a parameter name and a trailing dot
        let reply = "Sure: {'Crowdsale': {'_goal': 'No'}, \
                     'invest(uint256 amount)': {'amout': 'Yes'}, \
                     'setPhase': {'newPhase': 'no'}}.";
        let flags = parse_mutation_advice(&abi, reply).unwrap();
        assert!(!flags.get(0, 0));
        assert!(flags.get(1, 0));
        assert!(!flags.get(2, 0));
    }

    #[test]
    fn advice_problems() {
        let abi = crowdsale_abi();
        assert_eq!(
            parse_mutation_advice(&abi, "no idea"),
            Err(AdviceError::NoSuggestions)
        );
        let reply = r#"{"Crowdsale": {"_goal": "No"}, "invest": {"amount": "Yes"}}"#;
        assert_eq!(
            parse_mutation_advice(&abi, reply),
            Err(AdviceError::MissingFunction("setPhase".to_string()))
        );
        let reply = r#"{"Crowdsale": {"_goal": "maybe"}, "invest": {"amount": "Yes"}, "setPhase": {"newPhase": "no"}}"#;
        assert_eq!(
            parse_mutation_advice(&abi, reply),
            Err(AdviceError::InvalidSuggestion {
                function: "Crowdsale".to_string(),
                param: "_goal".to_string()
            })
        );
        let reply = r#"{"Crowdsale": {"_goal": "No"}, "invest": {"value": "Yes"}, "setPhase": {"newPhase": "no"}}"#;
        assert!(matches!(
            parse_mutation_advice(&abi, reply),
            Err(AdviceError::MissingParameter { .. })
        ));
    }

    #[test]
    fn bounded_mutation_advice_feeds_back_problems() {
        let abi = crowdsale_abi();
        let (advisor, prompts) = ScriptedAdvisor::new(vec![
            "nothing useful".to_string(),
            r#"{"Crowdsale": {"_goal": "No"}, "invest": {"amount": "No"}, "setPhase": {"newPhase": "Yes"}}"#.to_string(),
        ]);
        let mut bounded = BoundedAdvisor::new(Box::new(advisor), 3, "contract C {}".to_string());
        let ctx = AdviceContext {
            log: "In function `invest`, ...",
            order: "1->2->3",
            testcase: "00",
        };
        let flags = bounded.mutation_advice(&abi, &ctx);
        assert!(!flags.get(1, 0));
        assert!(flags.get(2, 0));
        assert_eq!(bounded.failures, 1);
        let prompts = prompts.borrow();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("no function suggestions"));
    }

    #[test]
    fn bounded_advisor_falls_back() {
        let abi = crowdsale_abi();
        let (advisor, prompts) = ScriptedAdvisor::new(vec![]);
        let mut bounded = BoundedAdvisor::new(Box::new(advisor), 2, String::new());
        let ctx = AdviceContext {
            log: "",
            order: "",
            testcase: "",
        };
        assert_eq!(bounded.mutation_advice(&abi, &ctx), MutationFlags::all_yes(&abi));
        assert_eq!(bounded.suggest_order(&abi, &[]), None);
        assert_eq!(prompts.borrow().len(), 4);
        assert_eq!(bounded.failures, 4);
    }

    #[test]
    fn order_suggestions() {
        let abi = crowdsale_abi();
        let (advisor, prompts) = ScriptedAdvisor::new(vec![
            "1->7".to_string(),
            "The orders are: 3 -> 1".to_string(),
        ]);
        let mut bounded = BoundedAdvisor::new(Box::new(advisor), 5, String::new());
        let order = bounded.suggest_order(&abi, &["1->2->3".to_string()]).unwrap();
        assert_eq!(order.to_string(), "3->1->2");
        assert!(prompts.borrow()[0].contains("1->2->3"));
        assert_eq!(bounded.failures, 1);
    }

    #[test]
    fn single_function_order() {
        let abi = single_function_abi("f", &["uint256"]);
        let (advisor, _) = ScriptedAdvisor::new(vec!["1".to_string()]);
        let mut bounded = BoundedAdvisor::new(Box::new(advisor), 2, String::new());
        let order = bounded.suggest_order(&abi, &[]).unwrap();
        assert_eq!(order.to_string(), "1");
        assert_eq!(bounded.failures, 0);
    }

    #[cfg(feature = "tests_with_fs")]
    #[test]
    fn command_advisor() {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        script
            .write_all(b"#!/bin/sh\necho \"The orders are: 2->1 for $(wc -c < $1) bytes\"\n")
            .unwrap();
        let path = script.into_temp_path();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&path, perms).unwrap();

        let mut advisor = CommandAdvisor::new(path.to_path_buf(), Duration::from_secs(5));
        let reply = advisor.ask("12345").unwrap();
        assert!(reply.contains("2->1"));
        assert!(reply.contains("5 bytes"));
    }
}
