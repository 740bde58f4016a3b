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

//! Coverage bookkeeping: the best test case per branch ("leader") and the round-robin queue of
//! branches whose leaders get mutated.

use ethereum_types::U256;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::oracle::TraceResult;
use crate::{FastIndexMap, FastIndexSet};

/// A test case together with what it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzItem {
    pub data: Vec<u8>,
    pub res: TraceResult,
    /// number of mutation rounds between the seed and this test case
    pub depth: u64,
    /// how often this test case was picked for mutation
    pub fuzzed_count: u64,
}

impl FuzzItem {
    pub fn new(data: Vec<u8>, res: TraceResult, depth: u64) -> FuzzItem {
        FuzzItem {
            data,
            res,
            depth,
            fuzzed_count: 0,
        }
    }
}

/// Best known test case for one branch. A comparison value of 0 means the branch is covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leader {
    pub item: FuzzItem,
    pub comparison_value: U256,
}

impl Leader {
    #[inline]
    pub fn is_covered(&self) -> bool {
        self.comparison_value.is_zero()
    }
}

/// What a single [`Tracker::update`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateSummary {
    pub new_tracebits: usize,
    pub new_predicates: usize,
    pub improved_predicates: usize,
}

impl UpdateSummary {
    #[inline]
    pub fn is_interesting(&self) -> bool {
        self.new_tracebits + self.new_predicates + self.improved_predicates > 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tracker {
    leaders: FastIndexMap<String, Leader>,
    queue: Vec<String>,
    tracebits: FastIndexSet<String>,
    predicates: FastIndexSet<String>,
    exceptions: FastIndexSet<String>,
    idx: usize,
    queue_cycle: u64,
    max_depth: u64,
    last_new_path: Option<Instant>,
    /// set whenever a new branch is covered; cleared by the loop controller
    pub new_branch_covered: bool,
}

impl Tracker {
    pub fn new() -> Tracker {
        Tracker::default()
    }

    /// Fold the result of executing `data` (at mutation depth `depth`) into the coverage state.
    pub fn update(&mut self, data: &[u8], res: &TraceResult, depth: u64) -> UpdateSummary {
        let mut summary = UpdateSummary::default();

        for tracebit in res.tracebits.iter() {
            if self.tracebits.contains(tracebit) {
                continue;
            }
            // the branch may have been an uncovered predicate so far
            self.remove_leader(tracebit);
            let item = FuzzItem::new(data.to_vec(), res.clone(), depth + 1);
            self.leaders.insert(
                tracebit.clone(),
                Leader {
                    item,
                    comparison_value: U256::zero(),
                },
            );
            self.queue.push(tracebit.clone());
            self.max_depth = std::cmp::max(self.max_depth, depth + 1);
            self.last_new_path = Some(Instant::now());
            self.new_branch_covered = true;
            summary.new_tracebits += 1;
        }

        for (predicate, value) in res.predicates.iter() {
            match self.leaders.get_mut(predicate) {
                Some(leader) => {
                    if !leader.is_covered() && leader.comparison_value > *value {
                        leader.item = FuzzItem::new(data.to_vec(), res.clone(), depth + 1);
                        leader.comparison_value = *value;
                        summary.improved_predicates += 1;
                    }
                }
                None => {
                    self.leaders.insert(
                        predicate.clone(),
                        Leader {
                            item: FuzzItem::new(data.to_vec(), res.clone(), depth + 1),
                            comparison_value: *value,
                        },
                    );
                    self.queue.push(predicate.clone());
                    summary.new_predicates += 1;
                }
            }
        }

        self.exceptions.extend(res.exceptions.iter().cloned());
        self.tracebits.extend(res.tracebits.iter().cloned());
        self.predicates.extend(res.predicates.keys().cloned());
        let tracebits = &self.tracebits;
        self.predicates.retain(|p| !tracebits.contains(p));

        summary
    }

    fn remove_leader(&mut self, id: &str) {
        if self.leaders.shift_remove(id).is_none() {
            return;
        }
        if let Some(pos) = self.queue.iter().position(|q| q == id) {
            self.queue.remove(pos);
            if pos < self.idx {
                self.idx -= 1;
            }
        }
        if self.idx >= self.queue.len() {
            self.idx = 0;
        }
    }

    /// id of the branch whose leader is up for mutation
    pub fn current(&self) -> Option<&str> {
        self.queue.get(self.idx).map(|s| s.as_str())
    }

    pub fn current_leader(&self) -> Option<&Leader> {
        self.current().and_then(|id| self.leaders.get(id))
    }

    /// Count a mutation round on the leader of `id`, unless it was replaced by another test
    /// case in the meantime.
    pub fn mark_fuzzed(&mut self, id: &str, data: &[u8]) {
        if let Some(leader) = self.leaders.get_mut(id) {
            if leader.item.data == data {
                leader.item.fuzzed_count += 1;
            }
        }
    }

    /// Move on to the next queue entry, counting a cycle on wraparound.
    pub fn advance(&mut self) {
        if self.queue.is_empty() {
            self.idx = 0;
            return;
        }
        self.idx = (self.idx + 1) % self.queue.len();
        if self.idx == 0 {
            self.queue_cycle += 1;
        }
    }

    /// true once every leader's branch is covered, i.e., there is nothing left to improve
    pub fn all_covered(&self) -> bool {
        self.leaders.values().all(|l| l.is_covered())
    }

    /// Forget everything, e.g., after a trial run of an execution order.
    pub fn clear(&mut self) {
        *self = Tracker::default();
    }

    #[inline]
    pub fn leaders(&self) -> &FastIndexMap<String, Leader> {
        &self.leaders
    }

    #[inline]
    pub fn queue(&self) -> &[String] {
        &self.queue
    }

    #[inline]
    pub fn tracebits(&self) -> &FastIndexSet<String> {
        &self.tracebits
    }

    #[inline]
    pub fn predicates(&self) -> &FastIndexSet<String> {
        &self.predicates
    }

    #[inline]
    pub fn exceptions(&self) -> &FastIndexSet<String> {
        &self.exceptions
    }

    #[inline]
    pub fn idx(&self) -> usize {
        self.idx
    }

    #[inline]
    pub fn queue_cycle(&self) -> u64 {
        self.queue_cycle
    }

    #[inline]
    pub fn max_depth(&self) -> u64 {
        self.max_depth
    }

    #[inline]
    pub fn last_new_path(&self) -> Option<Instant> {
        self.last_new_path
    }

    /// covered branches in percent of `total_branches`, truncated
    pub fn coverage(&self, total_branches: usize) -> u64 {
        self.coverage_f64(total_branches) as u64
    }

    pub fn coverage_f64(&self, total_branches: usize) -> f64 {
        let total = std::cmp::max(total_branches, 1);
        self.tracebits.len() as f64 / total as f64 * 100.0
    }

    /// Number of covered outcomes per conditional jump (keyed by the pc before the `:` of the
    /// branch id): 2 means both edges are covered, 1 only one of them.
    pub fn covered_edges_per_jumpi(&self) -> BTreeMap<u64, usize> {
        let mut brs = BTreeMap::new();
        for (id, leader) in self.leaders.iter() {
            if !leader.is_covered() {
                continue;
            }
            let pc = id.split(':').next().and_then(|pc| pc.parse::<u64>().ok());
            if let Some(pc) = pc {
                *brs.entry(pc).or_insert(0) += 1;
            }
        }
        brs
    }
}
