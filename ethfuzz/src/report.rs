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

//! Campaign output: the JSON coverage report, the status screen and the stop-time dumps.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bytecode::ValidJumpis;
use crate::logger::LogSink;
use crate::mutation::{Progress, Stage, StageCounters};
use crate::oracle::VulnerabilityFlags;
use crate::session::ExecutionOrder;
use crate::tracker::Tracker;
use crate::utils::{format_buffer_rows, format_duration, pad_str};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub contract: String,
    pub covered_paths: usize,
    pub total_paths: usize,
    /// number of fuzzed functions, constructor included
    pub state_functions_size: usize,
    /// percent, truncated
    pub coverage: u64,
    pub total_execs: u64,
    pub vulnerabilities: serde_json::Map<String, serde_json::Value>,
}

impl CoverageReport {
    pub fn new(
        contract: &str,
        tracker: &Tracker,
        total_paths: usize,
        state_functions_size: usize,
        total_execs: u64,
        vulns: &VulnerabilityFlags,
    ) -> CoverageReport {
        CoverageReport {
            contract: contract.to_string(),
            covered_paths: tracker.tracebits().len(),
            total_paths,
            state_functions_size,
            coverage: tracker.coverage(total_paths),
            total_execs,
            vulnerabilities: vulns.to_report_json(),
        }
    }

    pub fn path_in(&self, report_dir: &Path) -> PathBuf {
        report_dir.join(format!("{}_coverage.json", self.contract))
    }

    /// Writes `<report_dir>/<contract>_coverage.json` and returns its path.
    pub fn write_to_dir(&self, report_dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(report_dir).with_context(|| {
            format!("failed to create report directory {}", report_dir.display())
        })?;
        let path = self.path_in(report_dir);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write coverage report {}", path.display()))?;
        anyhow::Result::Ok(path)
    }
}

/// How many edges of the conditional jumps are covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JumpiSummary {
    pub full: usize,
    pub half: usize,
    pub unreachable: usize,
}

/// Logs one `>> Full`/`>> Haft`/`>> Unreachable` entry per conditional jump to the info sink.
pub fn log_jumpi_summary(tracker: &Tracker, jumpis: &ValidJumpis, sink: &mut dyn LogSink) -> JumpiSummary {
    let covered = tracker.covered_edges_per_jumpi();
    let pcs: BTreeSet<u64> = jumpis.deploy.union(&jumpis.runtime).cloned().collect();
    let mut summary = JumpiSummary::default();
    for pc in pcs.iter() {
        let label = match covered.get(pc).cloned().unwrap_or(0) {
            0 => {
                summary.unreachable += 1;
                ">> Unreachable"
            }
            1 => {
                summary.half += 1;
                ">> Haft"
            }
            _ => {
                summary.full += 1;
                ">> Full"
            }
        };
        sink.info(label);
        sink.info(&format!("JUMPI at pc {}", pc));
    }
    sink.info(&format!(
        "Full: {}, Haft: {}, Unreachable: {}",
        summary.full, summary.half, summary.unreachable
    ));
    summary
}

/// Dumps every leader with its test case to the debug sink.
pub fn dump_leaders(tracker: &Tracker, sink: &mut dyn LogSink) {
    sink.debug("== TEST ==");
    for (id, leader) in tracker.leaders().iter() {
        sink.debug(&format!("BR {}", id));
        sink.debug(&format!("ComparisonValue {}", leader.comparison_value));
        sink.debug(format_buffer_rows(&leader.item.data).trim_end());
    }
    sink.debug("== END TEST ==");
}

/// Snapshot of everything the status screen shows.
pub struct StatusView<'a> {
    pub contract: &'a str,
    pub elapsed: Duration,
    pub since_last_path: Option<Duration>,
    pub queue_cycle: u64,
    pub progress: Progress,
    pub total_execs: u64,
    pub covered: usize,
    pub total_branches: usize,
    pub queue_len: usize,
    pub max_depth: u64,
    pub order: &'a ExecutionOrder,
    pub finds: &'a StageCounters,
    pub cycles: &'a StageCounters,
    pub vulns: &'a VulnerabilityFlags,
}

const STAGE_ROWS: [(&str, [Stage; 3]); 4] = [
    ("bit flips", [Stage::Flip1, Stage::Flip2, Stage::Flip4]),
    ("byte flips", [Stage::Flip8, Stage::Flip16, Stage::Flip32]),
    ("arithmetics", [Stage::Arith8, Stage::Arith16, Stage::Arith32]),
    ("known ints", [Stage::Interest8, Stage::Interest16, Stage::Interest32]),
];

fn stage_cell(finds: &StageCounters, cycles: &StageCounters, stage: Stage) -> String {
    format!("{}/{}", finds.get(stage), cycles.get(stage))
}

pub fn render_status(v: &StatusView<'_>) -> String {
    let mut out = String::new();
    let execs_per_sec = if v.elapsed.as_secs() > 0 {
        v.total_execs / v.elapsed.as_secs()
    } else {
        v.total_execs
    };
    let coverage = if v.total_branches > 0 {
        v.covered as f64 / v.total_branches as f64 * 100.0
    } else {
        0.0
    };
    let last_path = match v.since_last_path {
        Some(d) => format_duration(d),
        None => "none yet".to_string(),
    };

    out.push_str(&format!("ethfuzz {} ({})\n", crate::VERSION, v.contract));
    out.push_str(&format!("{} : {}\n", pad_str("run time", 16), format_duration(v.elapsed)));
    out.push_str(&format!("{} : {}\n", pad_str("cycles done", 16), v.queue_cycle));
    out.push_str(&format!("{} : {}\n", pad_str("last new path", 16), last_path));
    out.push_str(&format!(
        "{} : {} {}/{}\n",
        pad_str("now trying", 16),
        v.progress.stage.name(),
        v.progress.cur,
        v.progress.max
    ));
    out.push_str(&format!(
        "{} : {} ({}/sec)\n",
        pad_str("total execs", 16),
        v.total_execs,
        execs_per_sec
    ));
    out.push_str(&format!(
        "{} : {}/{} ({:.2}%)\n",
        pad_str("branch coverage", 16),
        v.covered,
        v.total_branches,
        coverage
    ));
    out.push_str(&format!("{} : {}\n", pad_str("queue size", 16), v.queue_len));
    out.push_str(&format!("{} : {}\n", pad_str("max depth", 16), v.max_depth));
    out.push_str(&format!("{} : {}\n", pad_str("order", 16), v.order));
    out.push_str("-- stage yields (finds/execs) --\n");
    for (label, stages) in STAGE_ROWS.iter() {
        let cells: Vec<String> = stages
            .iter()
            .map(|s| stage_cell(v.finds, v.cycles, *s))
            .collect();
        out.push_str(&format!("{} : {}\n", pad_str(label, 16), cells.join(", ")));
    }
    out.push_str(&format!(
        "{} : {}, {}\n",
        pad_str("dictionary", 16),
        stage_cell(v.finds, v.cycles, Stage::ExtrasUO),
        stage_cell(v.finds, v.cycles, Stage::ExtrasAO)
    ));
    out.push_str(&format!(
        "{} : {}, {}, {}\n",
        pad_str("havoc/log/random", 16),
        stage_cell(v.finds, v.cycles, Stage::Havoc),
        stage_cell(v.finds, v.cycles, Stage::Targeted),
        stage_cell(v.finds, v.cycles, Stage::Random)
    ));
    out.push_str("-- vulnerabilities --\n");
    for vuln in crate::oracle::Vulnerability::ALL.iter() {
        let found = if v.vulns.get(*vuln) { "found" } else { "none" };
        out.push_str(&format!("{} : {}\n", pad_str(vuln.name(), 24), found));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemorySink;
    use crate::oracle::Vulnerability;
    use crate::test_helpers::trace;

    fn tracker() -> Tracker {
        let mut t = Tracker::new();
        t.update(&[1, 2], &trace(&["10:20", "10:30", "40:41"], &[("50:51", 3)]), 0);
        t
    }

    #[test]
    fn coverage_report_json() {
        let t = tracker();
        let mut vulns = VulnerabilityFlags::default();
        vulns.set(Vulnerability::Reentrancy, true);
        let r = CoverageReport::new("Token", &t, 8, 4, 1234, &vulns);
        assert_eq!(r.covered_paths, 3);
        assert_eq!(r.coverage, 37);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["contract"], "Token");
        assert_eq!(v["total_paths"], 8);
        assert_eq!(v["state_functions_size"], 4);
        assert_eq!(v["total_execs"], 1234);
        assert_eq!(v["vulnerabilities"]["reentrancy"], "Yes");
        assert_eq!(v["vulnerabilities"]["suicidal"], "No");
        assert_eq!(
            r.path_in(Path::new("coverage")),
            PathBuf::from("coverage/Token_coverage.json")
        );
    }

    #[cfg(feature = "tests_with_fs")]
    #[test]
    fn report_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let r = CoverageReport::new("A", &tracker(), 8, 1, 1, &VulnerabilityFlags::default());
        let path = r.write_to_dir(&dir.path().join("cov")).unwrap();
        let read: CoverageReport =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(read, r);
    }

    #[test]
    fn jumpi_summary() {
        let t = tracker();
        let jumpis = ValidJumpis {
            deploy: [10].iter().cloned().collect(),
            runtime: [40, 50, 60].iter().cloned().collect(),
        };
        let mut sink = MemorySink::new();
        let s = log_jumpi_summary(&t, &jumpis, &mut sink);
        assert_eq!(
            s,
            JumpiSummary {
                full: 1,
                half: 1,
                unreachable: 2
            }
        );
        let info = sink.info_lines();
        assert_eq!(info[0], ">> Full");
        assert_eq!(info[1], "JUMPI at pc 10");
        assert_eq!(info[2], ">> Haft");
        assert_eq!(info[4], ">> Unreachable");
    }

    #[test]
    fn leader_dump() {
        let t = tracker();
        let mut sink = MemorySink::new();
        dump_leaders(&t, &mut sink);
        let lines = sink.debug_lines();
        assert_eq!(lines.first().map(|s| s.as_str()), Some("== TEST =="));
        assert_eq!(lines.last().map(|s| s.as_str()), Some("== END TEST =="));
        assert!(lines.contains(&"BR 50:51".to_string()));
        assert!(lines.contains(&"ComparisonValue 3".to_string()));
        assert!(lines.contains(&"0102".to_string()));
    }

    #[test]
    fn status_screen() {
        let order = ExecutionOrder::new(vec![2, 1]);
        let mut finds = StageCounters::default();
        finds.add(Stage::Havoc, 3);
        let cycles = StageCounters::default();
        let vulns = VulnerabilityFlags::default();
        let s = render_status(&StatusView {
            contract: "Token",
            elapsed: Duration::from_secs(3661),
            since_last_path: None,
            queue_cycle: 2,
            progress: Progress {
                stage: Stage::Havoc,
                cur: 5,
                max: 2000,
            },
            total_execs: 7322,
            covered: 3,
            total_branches: 8,
            queue_len: 4,
            max_depth: 2,
            order: &order,
            finds: &finds,
            cycles: &cycles,
            vulns: &vulns,
        });
        assert!(s.contains("0 days, 1 hrs, 1 min, 1 sec"));
        assert!(s.contains("havoc 5/2000"));
        assert!(s.contains("7322 (2/sec)"));
        assert!(s.contains("3/8 (37.50%)"));
        assert!(s.contains("2->1"));
        assert!(s.contains("3/0, 0/0, 0/0"));
    }
}
