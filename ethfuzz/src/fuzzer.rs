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

//! The loop controller.
//!
//! A campaign goes through [`FuzzState::Init`] (dictionaries, branch points, deployment),
//! [`FuzzState::SeedEvaluation`] (a short trial run per candidate execution order) and
//! [`FuzzState::MainLoop`] (mutating the leaders in queue order, periodically re-scoring the
//! current order) until it is [`FuzzState::Terminated`]. Everything runs on the calling thread;
//! time limits are checked after every execution.

use anyhow::Context;
use rand::prelude::*;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use crate::abi::ContractAbi;
use crate::advisor::{AdviceContext, BoundedAdvisor};
use crate::bytecode::ValidJumpis;
use crate::codec;
use crate::config::FuzzConfig;
use crate::dictionary::{Dictionary, Dicts};
use crate::logger::{LogSink, NullSink};
use crate::mutation::{Flow, Mutation, Outcome, Progress, Stage, StageCounters};
use crate::oracle::{ExecutionOracle, VulnerabilityFlags, VulnerabilityOracle};
use crate::ordering::{effective_num_orders, random_order, trial_score, OrderBook, RescoreBaseline};
use crate::report::{self, CoverageReport, StatusView};
use crate::session::{ExecutionOrder, FuzzSession};
use crate::tracker::Tracker;
use crate::RngI;

/// parameter-targeted rounds per visit of an already mutated leader
pub const TARGETED_ROUNDS: usize = 20;
/// attempts per wanted order to come up with a new unique one
const ORDER_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzState {
    Init,
    SeedEvaluation,
    MainLoop,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// wall-clock budget used up
    Timeout,
    MaxExecs,
    /// every known branch is covered
    AllCovered,
    TooFewFunctions,
    NoJumpis,
}

impl StopReason {
    /// the campaign could not run at all
    pub fn is_fatal(&self) -> bool {
        matches!(self, StopReason::TooFewFunctions | StopReason::NoJumpis)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Timeout => "time budget exhausted",
            StopReason::MaxExecs => "execution limit reached",
            StopReason::AllCovered => "nothing left to improve",
            StopReason::TooFewFunctions => "too few functions to fuzz",
            StopReason::NoJumpis => "no valid JUMPI",
        };
        f.write_str(s)
    }
}

/// The contract under test.
#[derive(Debug, Clone)]
pub struct Target {
    pub abi: ContractAbi,
    /// deployment bytecode
    pub bin: Vec<u8>,
    pub bin_runtime: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CampaignSummary {
    pub reason: StopReason,
    pub report: CoverageReport,
    /// final execution order
    pub order: ExecutionOrder,
    pub finds: StageCounters,
    pub cycles: StageCounters,
}

/// Executes candidates and folds the results into the tracker. Kept apart from the dictionaries
/// so that a [`Mutation`] can borrow those while its callback borrows this.
struct Harness<O> {
    oracle: O,
    jumpis: ValidJumpis,
    tracker: Tracker,
    total_execs: u64,
    max_execs: Option<u64>,
    deadline: Instant,
    stop_when_covered: bool,
    finds: StageCounters,
    progress: Option<Progress>,
}

impl<O: ExecutionOracle> Harness<O> {
    fn covered_everything(&self) -> bool {
        !self.tracker.leaders().is_empty() && self.tracker.all_covered()
    }

    fn execs_exhausted(&self) -> bool {
        self.max_execs.map_or(false, |m| self.total_execs >= m)
    }

    fn limit_reached(&self) -> bool {
        Instant::now() >= self.deadline
            || self.execs_exhausted()
            || (self.stop_when_covered && self.covered_everything())
    }

    fn save(
        &mut self,
        abi: &ContractAbi,
        order: &ExecutionOrder,
        data: &[u8],
        depth: u64,
        progress: Option<&Progress>,
    ) -> anyhow::Result<Outcome> {
        let mut data = data.to_vec();
        codec::postprocess(&mut data);
        let plan = codec::plan(abi, order, &data)
            .with_context(|| format!("failed to plan test case for order {}", order))?;
        let res = self.oracle.exec(&plan, &self.jumpis)?;
        self.total_execs += 1;
        let summary = self.tracker.update(&data, &res, depth);
        if let Some(p) = progress {
            self.progress = Some(*p);
            if summary.is_interesting() {
                self.finds.add(p.stage, 1);
            }
        }
        anyhow::Result::Ok(Outcome {
            checksum: res.checksum,
            halt: self.limit_reached(),
        })
    }
}

pub struct Fuzzer<O> {
    config: FuzzConfig,
    abi: ContractAbi,
    dicts: Dicts,
    session: FuzzSession,
    harness: Harness<O>,
    orders: OrderBook,
    baseline: RescoreBaseline,
    advisor: Option<BoundedAdvisor>,
    sink: Box<dyn LogSink>,
    rng: RngI,
    state: FuzzState,
    cycles: StageCounters,
    vulns: VulnerabilityFlags,
    start: Instant,
    last_stat: Instant,
    last_eval: Instant,
}

impl<O: ExecutionOracle + VulnerabilityOracle> Fuzzer<O> {
    pub fn new(target: Target, config: FuzzConfig, oracle: O) -> anyhow::Result<Fuzzer<O>> {
        let config = config.with_env_overrides();
        let mut code = Dictionary::from_code(&target.bin);
        code.add_code(&target.bin_runtime);
        let mut address = Dictionary::new();
        for a in config.parsed_addresses()?.iter() {
            address.add_address(a);
        }
        let jumpis = ValidJumpis::from_code(&target.bin, &target.bin_runtime);
        let now = Instant::now();
        anyhow::Result::Ok(Fuzzer {
            session: FuzzSession::new(&target.abi),
            abi: target.abi,
            dicts: Dicts { code, address },
            harness: Harness {
                oracle,
                jumpis,
                tracker: Tracker::new(),
                total_execs: 0,
                max_execs: config.max_execs,
                deadline: now,
                stop_when_covered: false,
                finds: StageCounters::default(),
                progress: None,
            },
            orders: OrderBook::new(),
            baseline: RescoreBaseline::default(),
            advisor: None,
            sink: Box::new(NullSink),
            rng: RngI::seed_from_u64(config.seed),
            state: FuzzState::Init,
            cycles: StageCounters::default(),
            vulns: VulnerabilityFlags::default(),
            start: now,
            last_stat: now,
            last_eval: now,
            config,
        })
    }

    pub fn with_advisor(mut self, advisor: BoundedAdvisor) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// e.g. to add user supplied tokens before the campaign starts
    pub fn dicts_mut(&mut self) -> &mut Dicts {
        &mut self.dicts
    }

    #[inline]
    pub fn dicts(&self) -> &Dicts {
        &self.dicts
    }

    #[inline]
    pub fn state(&self) -> FuzzState {
        self.state
    }

    #[inline]
    pub fn tracker(&self) -> &Tracker {
        &self.harness.tracker
    }

    #[inline]
    pub fn orders(&self) -> &OrderBook {
        &self.orders
    }

    #[inline]
    pub fn session(&self) -> &FuzzSession {
        &self.session
    }

    #[inline]
    pub fn total_execs(&self) -> u64 {
        self.harness.total_execs
    }

    #[inline]
    pub fn oracle(&self) -> &O {
        &self.harness.oracle
    }

    #[inline]
    pub fn config(&self) -> &FuzzConfig {
        &self.config
    }

    /// Runs the campaign and writes the coverage report to the configured report directory.
    pub fn run(&mut self) -> anyhow::Result<(CampaignSummary, PathBuf)> {
        let summary = self.campaign()?;
        let path = summary.report.write_to_dir(&self.config.report_dir)?;
        tracing::info!("coverage report written to {}", path.display());
        anyhow::Result::Ok((summary, path))
    }

    /// Runs the campaign without writing any files besides the campaign log.
    pub fn campaign(&mut self) -> anyhow::Result<CampaignSummary> {
        self.start = Instant::now();
        self.last_stat = self.start;
        let reason = match self.init()? {
            Some(reason) => reason,
            None => {
                self.evaluate_orders()?;
                self.main_loop()?
            }
        };
        self.finish(reason)
    }

    fn init(&mut self) -> anyhow::Result<Option<StopReason>> {
        self.state = FuzzState::Init;
        let n = self.abi.function_count();
        if n == 0 || n < self.config.min_functions {
            tracing::error!(
                "{} has {} functions to fuzz, need at least {}",
                self.abi.name,
                n,
                self.config.min_functions
            );
            return Ok(Some(StopReason::TooFewFunctions));
        }
        if self.harness.jumpis.is_empty() {
            tracing::error!("no valid JUMPI in {}", self.abi.name);
            return Ok(Some(StopReason::NoJumpis));
        }
        tracing::info!(
            "fuzzing {} with {} functions and {} JUMPIs",
            self.abi.name,
            n,
            self.harness.jumpis.len()
        );

        let order = ExecutionOrder::identity(n);
        let mut seed = codec::seed(&self.abi, &order)?;
        codec::postprocess(&mut seed);
        let plan = codec::plan(&self.abi, &order, &seed)?;
        let deployed = self
            .harness
            .oracle
            .deploy(&plan)
            .with_context(|| format!("failed to deploy {}", self.abi.name))?;
        if let Some(address) = deployed {
            tracing::debug!("deployed {} at {:?}", self.abi.name, address);
            self.dicts.address.add_address(&address);
        }
        tracing::debug!("dictionaries: {}", self.dicts.stats());
        Ok(None)
    }

    /// Try candidate execution orders and keep the best one as the current order.
    fn evaluate_orders(&mut self) -> anyhow::Result<()> {
        self.state = FuzzState::SeedEvaluation;
        let n = self.abi.function_count();
        let wanted = effective_num_orders(self.config.num_orders, n);
        let mut attempts = 0;
        while self.orders.len() < wanted && attempts < wanted * ORDER_ATTEMPTS {
            if Instant::now() >= self.campaign_deadline() || self.harness.execs_exhausted() {
                tracing::info!("campaign limit reached after {} orders", self.orders.len());
                break;
            }
            attempts += 1;
            let existing = self.orders.rendered();
            let suggested = match self.advisor.as_mut() {
                Some(advisor) if !self.config.random_order => {
                    advisor.suggest_order(&self.abi, &existing)
                }
                _ => None,
            };
            let order = match suggested {
                Some(order) => order,
                None => random_order(&mut self.rng, n),
            };
            if !self.orders.is_unique(&order) {
                tracing::debug!("order {} is too close to an already tried one", order);
                continue;
            }
            let score = self.trial(&order)?;
            tracing::info!("order {} scored {:.4}", order, score);
            self.sink
                .info(&format!("Order {} score {:.4}", order.describe(&self.abi), score));
            self.orders.insert(order, score);
        }
        if self.orders.len() < wanted {
            tracing::warn!("only found {} of {} unique orders", self.orders.len(), wanted);
        }

        let best = match self.orders.best() {
            Some(order) => order.clone(),
            None => ExecutionOrder::identity(n),
        };
        tracing::info!("starting with order {}", best);
        self.session.set_order(&self.abi, best)?;
        Ok(())
    }

    /// Fuzz `order` for the trial duration and score the result. Forgets everything afterwards.
    fn trial(&mut self, order: &ExecutionOrder) -> anyhow::Result<f64> {
        self.session.set_order(&self.abi, order.clone())?;
        self.harness.deadline = std::cmp::min(
            Instant::now() + self.config.trial_duration(),
            self.campaign_deadline(),
        );
        self.harness.stop_when_covered = false;
        if !self.harness.execs_exhausted() {
            self.run_seed()?;
        }
        while !self.harness.limit_reached() {
            self.fuzz_round()?;
            self.periodic(false)?;
        }
        let vulns = self.harness.oracle.analyze()?;
        let coverage = self
            .harness
            .tracker
            .coverage(self.harness.jumpis.total_branches());
        let score = trial_score(coverage, vulns.count());

        self.harness.tracker.clear();
        self.harness.oracle.reset()?;
        Ok(score)
    }

    fn main_loop(&mut self) -> anyhow::Result<StopReason> {
        self.state = FuzzState::MainLoop;
        self.harness.deadline = self.campaign_deadline();
        self.harness.stop_when_covered = true;
        if self.stop_reason().is_none() {
            self.run_seed()?;
        }
        self.last_eval = Instant::now();
        loop {
            if let Some(reason) = self.stop_reason() {
                tracing::info!("stopping: {}", reason);
                return Ok(reason);
            }
            self.fuzz_round()?;
            self.periodic(true)?;
        }
    }

    fn campaign_deadline(&self) -> Instant {
        self.start + self.config.duration()
    }

    fn stop_reason(&self) -> Option<StopReason> {
        if Instant::now() >= self.harness.deadline {
            Some(StopReason::Timeout)
        } else if self.harness.execs_exhausted() {
            Some(StopReason::MaxExecs)
        } else if self.harness.covered_everything() {
            Some(StopReason::AllCovered)
        } else {
            None
        }
    }

    fn run_seed(&mut self) -> anyhow::Result<()> {
        let seed = codec::seed(&self.abi, self.session.order())?;
        self.harness
            .save(&self.abi, self.session.order(), &seed, 0, None)?;
        Ok(())
    }

    /// Ask the advisor which parameters of the current leader deserve mutation.
    fn refresh_flags(&mut self, log: &str, data: &[u8]) {
        let advisor = match self.advisor.as_mut() {
            Some(a) => a,
            None => return,
        };
        let order = self.session.order().describe(&self.abi);
        let testcase = hexutil::to_hex(data);
        let ctx = AdviceContext {
            log,
            order: &order,
            testcase: &testcase,
        };
        self.session.flags = advisor.mutation_advice(&self.abi, &ctx);
        tracing::debug!(
            "advisor enabled {} parameters",
            self.session.flags.count_enabled()
        );
    }

    /// Mutate the leader at the head of the queue: all deterministic stages on the first visit,
    /// parameter-targeted rounds afterwards.
    fn fuzz_round(&mut self) -> anyhow::Result<Flow> {
        let leader = self.harness.tracker.current().and_then(|id| {
            self.harness
                .tracker
                .current_leader()
                .map(|l| (id.to_string(), l.item.clone()))
        });
        let (id, item) = match leader {
            Some(l) => l,
            None => return self.fuzz_seed(),
        };

        if item.fuzzed_count > 0 && self.harness.tracker.new_branch_covered {
            self.harness.tracker.new_branch_covered = false;
            self.refresh_flags(&item.res.log, &item.data);
        }

        let (decoded, buf) = codec::decode_padded(&self.abi, self.session.order(), &item.data)?;
        let seed: u64 = self.rng.gen();
        let mut mutation = Mutation::new(buf, item.res.checksum.clone(), &self.dicts, seed);
        let abi = &self.abi;
        let order = self.session.order();
        let flags = &self.session.flags;
        let harness = &mut self.harness;
        let depth = item.depth;
        let mut cb = |p: &Progress, data: &[u8]| harness.save(abi, order, data, depth, Some(p));

        let flow = if item.fuzzed_count == 0 {
            mutation.deterministic(&mut cb)?
        } else {
            let mut flow = Flow::Continue;
            for i in 0..TARGETED_ROUNDS {
                let first = item.fuzzed_count == 1 && i == 0;
                flow = mutation.targeted(&decoded.spans, flags, first, &mut cb)?;
                if flow.is_halt() {
                    break;
                }
            }
            flow
        };
        let cycles = *mutation.cycles();

        self.cycles.merge(&cycles);
        self.harness.tracker.mark_fuzzed(&id, &item.data);
        self.harness.tracker.advance();
        Ok(flow)
    }

    /// Nothing is queued yet, so havoc the seed.
    fn fuzz_seed(&mut self) -> anyhow::Result<Flow> {
        let buf = codec::seed(&self.abi, self.session.order())?;
        let seed: u64 = self.rng.gen();
        let mut mutation = Mutation::new(buf, String::new(), &self.dicts, seed);
        let abi = &self.abi;
        let order = self.session.order();
        let harness = &mut self.harness;
        let mut cb = |p: &Progress, data: &[u8]| harness.save(abi, order, data, 0, Some(p));
        let flow = mutation.havoc(&mut cb)?;
        let cycles = *mutation.cycles();
        self.cycles.merge(&cycles);
        Ok(flow)
    }

    fn periodic(&mut self, evaluate: bool) -> anyhow::Result<()> {
        let now = Instant::now();
        if now.duration_since(self.last_stat) >= self.config.stat_interval() {
            self.last_stat = now;
            self.show_stats();
        }
        if evaluate && now.duration_since(self.last_eval) >= self.config.evaluate_interval() {
            self.last_eval = now;
            self.evaluate()?;
        }
        Ok(())
    }

    fn show_stats(&self) {
        let tracker = &self.harness.tracker;
        let total = self.harness.jumpis.total_branches();
        if self.config.show_ui {
            let progress = self.harness.progress.unwrap_or(Progress {
                stage: Stage::Flip1,
                cur: 0,
                max: 0,
            });
            let view = StatusView {
                contract: &self.abi.name,
                elapsed: self.start.elapsed(),
                since_last_path: tracker.last_new_path().map(|t| t.elapsed()),
                queue_cycle: tracker.queue_cycle(),
                progress,
                total_execs: self.harness.total_execs,
                covered: tracker.tracebits().len(),
                total_branches: total,
                queue_len: tracker.queue().len(),
                max_depth: tracker.max_depth(),
                order: self.session.order(),
                finds: &self.harness.finds,
                cycles: &self.cycles,
                vulns: &self.vulns,
            };
            println!("{}", report::render_status(&view));
        } else {
            tracing::info!(
                "execs: {}, coverage: {}/{}, queue: {}, cycles: {}",
                self.harness.total_execs,
                tracker.tracebits().len(),
                total,
                tracker.queue().len(),
                tracker.queue_cycle()
            );
        }
    }

    /// Re-score the current order and maybe switch to another one.
    fn evaluate(&mut self) -> anyhow::Result<()> {
        let vulns = self.harness.oracle.analyze()?;
        self.vulns.merge(&vulns);
        let coverage = self
            .harness
            .tracker
            .coverage_f64(self.harness.jumpis.total_branches());
        let increment = match self.baseline.increment(coverage, self.vulns.count()) {
            Some(inc) => inc,
            None => return Ok(()),
        };
        let current = self.session.order().clone();
        self.orders.rescore(&current, increment);
        let next = self.orders.select(&mut self.rng).cloned();
        if let Some(next) = next {
            if next != current {
                tracing::info!("switching order {} -> {}", current, next);
                self.session.set_order(&self.abi, next)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self, reason: StopReason) -> anyhow::Result<CampaignSummary> {
        self.state = FuzzState::Terminated;
        if !reason.is_fatal() {
            let vulns = self.harness.oracle.analyze()?;
            self.vulns.merge(&vulns);
            self.show_stats();
        }
        let tracker = &self.harness.tracker;
        report::log_jumpi_summary(tracker, &self.harness.jumpis, self.sink.as_mut());
        report::dump_leaders(tracker, self.sink.as_mut());
        let report = CoverageReport::new(
            &self.abi.name,
            tracker,
            self.harness.jumpis.total_branches(),
            self.abi.function_count(),
            self.harness.total_execs,
            &self.vulns,
        );
        tracing::info!(
            "{}: {} of {} branches covered after {} executions in {}",
            reason,
            report.covered_paths,
            report.total_paths,
            report.total_execs,
            crate::utils::format_duration(self.start.elapsed())
        );
        for vuln in self.vulns.found() {
            tracing::warn!("found vulnerability: {}", vuln);
        }
        Ok(CampaignSummary {
            reason,
            report,
            order: self.session.order().clone(),
            finds: self.harness.finds,
            cycles: self.cycles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Vulnerability;
    use crate::test_helpers::*;
    use std::time::Duration;

    fn config() -> FuzzConfig {
        FuzzConfig {
            duration: 600,
            trial_duration: 0,
            evaluate_interval: 3600,
            stat_interval: 3600,
            min_functions: 1,
            random_order: true,
            show_ui: false,
            max_execs: Some(100_000),
            ..Default::default()
        }
    }

    fn target(abi: ContractAbi) -> Target {
        Target {
            abi,
            bin: ONE_JUMPI_CODE.to_vec(),
            bin_runtime: vec![],
        }
    }

    #[test]
    fn too_few_functions_is_fatal() {
        let cfg = FuzzConfig {
            min_functions: 6,
            ..config()
        };
        let mut fuzzer = Fuzzer::new(target(wallet_abi()), cfg, nonzero_argument_oracle()).unwrap();
        let summary = fuzzer.campaign().unwrap();
        assert_eq!(summary.reason, StopReason::TooFewFunctions);
        assert!(summary.reason.is_fatal());
        assert_eq!(fuzzer.oracle().execs, 0);
        assert_eq!(fuzzer.state(), FuzzState::Terminated);
        assert_eq!(summary.report.total_execs, 0);
    }

    #[test]
    fn no_jumpis_is_fatal() {
        let t = Target {
            abi: single_function_abi("f", &["uint256"]),
            bin: vec![0x60, 0x00, 0x00],
            bin_runtime: vec![],
        };
        let mut fuzzer = Fuzzer::new(t, config(), nonzero_argument_oracle()).unwrap();
        let summary = fuzzer.campaign().unwrap();
        assert_eq!(summary.reason, StopReason::NoJumpis);
        assert_eq!(summary.report.total_paths, 0);
    }

    #[test]
    fn campaign_covers_both_edges() {
        let abi = single_function_abi("f", &["uint256"]);
        let mut oracle = nonzero_argument_oracle();
        oracle.deployed = Some(ethereum_types::H160::from_low_u64_be(0xc0ffee));
        let sink = crate::logger::MemorySink::new();
        let mut fuzzer = Fuzzer::new(target(abi), config(), oracle)
            .unwrap()
            .with_sink(Box::new(sink.clone()));
        let summary = fuzzer.campaign().unwrap();

        assert_eq!(summary.reason, StopReason::AllCovered);
        assert_eq!(summary.report.covered_paths, 2);
        assert_eq!(summary.report.total_paths, 2);
        assert_eq!(summary.report.coverage, 100);
        assert_eq!(summary.report.vulnerabilities["overflow"], "Yes");
        assert_eq!(summary.report.vulnerabilities["reentrancy"], "No");
        assert_eq!(fuzzer.oracle().deploys, 1);
        // the trial run was forgotten
        assert_eq!(fuzzer.oracle().resets, 1);
        assert_eq!(fuzzer.dicts().address.len(), 1);
        assert!(summary.finds.get(Stage::Flip1) > 0);
        assert_eq!(fuzzer.total_execs(), fuzzer.oracle().execs);

        assert!(sink.info_lines().contains(&">> Full".to_string()));
        let debug = sink.debug_lines();
        assert!(debug.contains(&"BR 10:30".to_string()));
        assert!(debug.contains(&"ComparisonValue 0".to_string()));
    }

    #[test]
    fn execution_limit() {
        let oracle = ScriptedOracle::new(|_| {
            (
                trace(&["10:20"], &[("10:30", 5)]),
                VulnerabilityFlags::default(),
            )
        });
        let cfg = FuzzConfig {
            max_execs: Some(50),
            ..config()
        };
        let mut fuzzer =
            Fuzzer::new(target(single_function_abi("f", &["uint256"])), cfg, oracle).unwrap();
        let summary = fuzzer.campaign().unwrap();
        assert_eq!(summary.reason, StopReason::MaxExecs);
        assert_eq!(fuzzer.total_execs(), 50);
        assert_eq!(fuzzer.oracle().execs, 50);
        assert_eq!(summary.report.coverage, 50);
    }

    #[test]
    fn advisor_orders_are_scored() {
        // covering 1:2 requires setPhase to run first
        let oracle = ScriptedOracle::new(|plan| {
            let first = plan.calls.first().map(|c| c.name.as_str());
            if first == Some("setPhase") {
                let mut v = VulnerabilityFlags::default();
                v.set(Vulnerability::Freezing, true);
                (trace(&["1:2"], &[("1:3", 1)]), v)
            } else {
                (trace(&[], &[("1:2", 9), ("1:3", 1)]), VulnerabilityFlags::default())
            }
        });
        let (advisor, prompts) = ScriptedAdvisor::new(vec![
            "2->1->3".to_string(),
            "again: 2->1->3".to_string(),
            "3->2->1".to_string(),
        ]);
        let cfg = FuzzConfig {
            num_orders: 2,
            random_order: false,
            max_execs: Some(2),
            ..config()
        };
        let mut fuzzer = Fuzzer::new(target(crowdsale_abi()), cfg, oracle)
            .unwrap()
            .with_advisor(BoundedAdvisor::new(Box::new(advisor), 3, String::new()));
        let summary = fuzzer.campaign().unwrap();

        assert_eq!(summary.reason, StopReason::MaxExecs);
        assert_eq!(fuzzer.orders().len(), 2);
        assert_eq!(fuzzer.orders().best().unwrap().to_string(), "3->2->1");
        assert_eq!(fuzzer.session().order().to_string(), "3->2->1");
        assert_eq!(summary.order.to_string(), "3->2->1");
        let entries = fuzzer.orders().entries();
        assert!((entries[0].score - trial_score(50, 1)).abs() < 1e-9);
        assert!((entries[1].score - trial_score(0, 0)).abs() < 1e-9);
        let prompts = prompts.borrow();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[1].contains("2->1->3"));
        assert_eq!(fuzzer.oracle().resets, 2);
        // the main loop does not run the seed past the limit
        assert_eq!(fuzzer.total_execs(), 2);
    }

    fn half_covering_oracle() -> ScriptedOracle {
        ScriptedOracle::new(|_| {
            (
                trace(&["10:20"], &[("10:30", 5)]),
                VulnerabilityFlags::default(),
            )
        })
    }

    #[test]
    fn trials_end_with_the_campaign() {
        let cfg = FuzzConfig {
            duration: 1,
            trial_duration: 3600,
            num_orders: 3,
            max_execs: None,
            ..config()
        };
        let mut fuzzer =
            Fuzzer::new(target(crowdsale_abi()), cfg, half_covering_oracle()).unwrap();
        let start = Instant::now();
        let summary = fuzzer.campaign().unwrap();

        assert_eq!(summary.reason, StopReason::Timeout);
        assert!(start.elapsed() < Duration::from_secs(60));
        // the first trial used up the whole campaign
        assert_eq!(fuzzer.orders().len(), 1);
        assert_eq!(fuzzer.oracle().resets, 1);
    }

    #[test]
    fn trials_respect_execution_limit() {
        let cfg = FuzzConfig {
            num_orders: 3,
            max_execs: Some(1),
            ..config()
        };
        let mut fuzzer =
            Fuzzer::new(target(crowdsale_abi()), cfg, half_covering_oracle()).unwrap();
        let summary = fuzzer.campaign().unwrap();

        assert_eq!(summary.reason, StopReason::MaxExecs);
        assert_eq!(fuzzer.total_execs(), 1);
        assert_eq!(fuzzer.oracle().execs, 1);
        assert_eq!(fuzzer.orders().len(), 1);
        assert_eq!(summary.report.total_execs, 1);
    }
}
