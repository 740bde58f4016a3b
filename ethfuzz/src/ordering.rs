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

//! Candidate execution orders and their scores.

use rand::prelude::*;
use regex::Regex;
use std::collections::BTreeSet;

use crate::session::ExecutionOrder;
use crate::utils::edit_distance;

pub const COVERAGE_WEIGHT: f64 = 0.0089;
pub const VULNERABILITY_WEIGHT: f64 = 0.01;
/// cap on the reward a single re-scoring can add
pub const MAX_SCORE_INCREMENT: f64 = 0.15;
pub const SCORE_DECAY: f64 = 0.95;
pub const MIN_SCORE: f64 = 0.1;
/// probability of picking a random tried order instead of the best one
pub const EXPLORE_PROBABILITY: f64 = 0.2;
/// minimum edit distance between the renderings of two tried orders
pub const MIN_ORDER_DISTANCE: usize = 2;

lazy_static! {
    static ref ORDER_PATTERN: Regex =
        Regex::new(r"(?:\d+\s*->\s*)+\d+").expect("order pattern is a valid regex");
}

fn factorial(n: usize) -> usize {
    (1..=n).fold(1usize, |acc, i| acc.saturating_mul(i))
}

/// How many candidate orders to try for `n` functions if not configured explicitly.
pub fn orders_to_generate(n: usize) -> usize {
    if n <= 4 {
        factorial(n)
    } else {
        n / 2
    }
}

/// The configured number of orders, or the derived one for `0`; never more than there are
/// permutations.
pub fn effective_num_orders(configured: usize, n: usize) -> usize {
    let wanted = if configured == 0 {
        orders_to_generate(n)
    } else {
        configured
    };
    std::cmp::min(wanted, factorial(n))
}

pub fn random_order<R: Rng + ?Sized>(rng: &mut R, n: usize) -> ExecutionOrder {
    let mut indices: Vec<usize> = (1..=n).collect();
    indices.shuffle(rng);
    ExecutionOrder::new(indices)
}

/// Extract the first `1->2->3` style sequence from free text. Text that is nothing but a number
/// is the order of a single function.
pub fn parse_order(text: &str) -> Option<Vec<usize>> {
    let m = match ORDER_PATTERN.find(text) {
        Some(m) => m,
        None => return text.trim().parse::<usize>().ok().map(|i| vec![i]),
    };
    m.as_str()
        .split("->")
        .map(|s| s.trim().parse::<usize>().ok())
        .collect()
}

/// Checks that `order` mentions every function index in `1..=n`. An order lacking exactly one
/// index is repaired by appending it. Unknown indices invalidate the order.
pub fn is_valid_order(order: &[usize], n: usize) -> Option<ExecutionOrder> {
    if n == 0 {
        return None;
    }
    if order.iter().any(|i| *i == 0 || *i > n) {
        return None;
    }
    let provided: BTreeSet<usize> = order.iter().cloned().collect();
    let missing: Vec<usize> = (1..=n).filter(|i| !provided.contains(i)).collect();
    match missing.len() {
        0 => Some(ExecutionOrder::new(order.to_vec())),
        1 => {
            let mut repaired = order.to_vec();
            repaired.push(missing[0]);
            tracing::debug!("appending missing function {} to order", missing[0]);
            Some(ExecutionOrder::new(repaired))
        }
        _ => None,
    }
}

/// Score of a trial run of an order.
pub fn trial_score(coverage_percent: u64, vulnerabilities: usize) -> f64 {
    coverage_percent as f64 * COVERAGE_WEIGHT + vulnerabilities as f64 * VULNERABILITY_WEIGHT
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredOrder {
    pub order: ExecutionOrder,
    pub score: f64,
    /// how often this order was re-scored while being the current one
    pub selections: u32,
}

/// All tried orders, sorted by descending score.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    entries: Vec<ScoredOrder>,
}

impl OrderBook {
    pub fn new() -> OrderBook {
        OrderBook::default()
    }

    pub fn insert(&mut self, order: ExecutionOrder, score: f64) {
        self.entries.push(ScoredOrder {
            order,
            score,
            selections: 0,
        });
        self.sort();
    }

    fn sort(&mut self) {
        // stable, so ties keep insertion order
        self.entries.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    #[inline]
    pub fn entries(&self) -> &[ScoredOrder] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn best(&self) -> Option<&ExecutionOrder> {
        self.entries.first().map(|e| &e.order)
    }

    /// renderings of all tried orders, e.g. for the advisor prompt
    pub fn rendered(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.order.to_string()).collect()
    }

    /// true if `order` is at least [`MIN_ORDER_DISTANCE`] edits away from every tried order
    pub fn is_unique(&self, order: &ExecutionOrder) -> bool {
        let rendered = order.to_string();
        self.entries
            .iter()
            .all(|e| edit_distance(&rendered, &e.order.to_string()) >= MIN_ORDER_DISTANCE)
    }

    /// Decay the score of `current` and add the (capped) reward.
    pub fn rescore(&mut self, current: &ExecutionOrder, increment: f64) {
        let increment = increment.min(MAX_SCORE_INCREMENT);
        if let Some(entry) = self.entries.iter_mut().find(|e| &e.order == current) {
            entry.selections += 1;
            let decay = SCORE_DECAY.powi(entry.selections as i32);
            entry.score = (entry.score * decay + increment).max(MIN_SCORE);
        }
        self.sort();
    }

    /// Mostly the best order, sometimes a random one.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&ExecutionOrder> {
        if rng.gen_bool(EXPLORE_PROBABILITY) {
            self.entries.choose(rng).map(|e| &e.order)
        } else {
            self.best()
        }
    }
}

/// Tracks coverage and vulnerability counts between two re-scorings.
#[derive(Debug, Clone, Default)]
pub struct RescoreBaseline {
    last: Option<(f64, usize)>,
}

impl RescoreBaseline {
    /// Returns the reward since the last call; the first call only records the baseline.
    pub fn increment(&mut self, coverage_percent: f64, vulnerabilities: usize) -> Option<f64> {
        let prev = self.last.replace((coverage_percent, vulnerabilities));
        prev.map(|(cov, vulns)| {
            let inc = (coverage_percent - cov) * COVERAGE_WEIGHT
                + (vulnerabilities as f64 - vulns as f64) * VULNERABILITY_WEIGHT;
            inc.min(MAX_SCORE_INCREMENT)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RngI;

    #[test]
    fn number_of_orders() {
        assert_eq!(orders_to_generate(1), 1);
        assert_eq!(orders_to_generate(3), 6);
        assert_eq!(orders_to_generate(4), 24);
        assert_eq!(orders_to_generate(5), 2);
        assert_eq!(orders_to_generate(9), 4);
        assert_eq!(effective_num_orders(15, 3), 6);
        assert_eq!(effective_num_orders(15, 6), 15);
        assert_eq!(effective_num_orders(0, 6), 3);
    }

    #[test]
    fn parse_advisor_orders() {
        assert_eq!(
            parse_order("The orders are: 2 -> 1->3. Done"),
            Some(vec![2, 1, 3])
        );
        assert_eq!(parse_order("call 4 first"), None);
        assert_eq!(parse_order(" 1\n"), Some(vec![1]));
        assert_eq!(parse_order("a 1->2 b 3->4"), Some(vec![1, 2]));
    }

    #[test]
    fn order_validation() {
        assert_eq!(is_valid_order(&[3, 1, 2], 3).unwrap().to_string(), "3->1->2");
        assert_eq!(is_valid_order(&[3, 1], 3).unwrap().to_string(), "3->1->2");
        assert!(is_valid_order(&[3], 3).is_none());
        assert!(is_valid_order(&[1, 2, 4], 3).is_none());
        assert_eq!(is_valid_order(&[1], 1).unwrap().to_string(), "1");
        assert!(is_valid_order(&[2], 1).is_none());
        assert!(is_valid_order(&[1], 0).is_none());
    }

    #[test]
    fn uniqueness() {
        let mut book = OrderBook::new();
        book.insert(ExecutionOrder::new(vec![1, 2, 3]), 0.5);
        assert!(!book.is_unique(&ExecutionOrder::new(vec![1, 2, 3])));
        // "1->2->4" is a single substitution away
        assert!(!book.is_unique(&ExecutionOrder::new(vec![1, 2, 4])));
        assert!(book.is_unique(&ExecutionOrder::new(vec![2, 1, 3])));
    }

    #[test]
    fn scoring_and_selection() {
        let mut book = OrderBook::new();
        let a = ExecutionOrder::new(vec![1, 2]);
        let b = ExecutionOrder::new(vec![2, 1]);
        book.insert(a.clone(), trial_score(50, 0));
        book.insert(b.clone(), trial_score(40, 2));
        assert_eq!(book.best(), Some(&a));

        // a stays on top after one decay, a negative reward pushes it to the floor
        book.rescore(&a, 0.0);
        assert!((book.entries()[0].score - 0.445 * 0.95).abs() < 1e-9);
        book.rescore(&a, -1.0);
        assert_eq!(book.best(), Some(&b));
        assert_eq!(book.entries()[1].score, MIN_SCORE);
        // rewards are capped
        book.rescore(&b, 10.0);
        let eb = &book.entries()[0];
        assert!((eb.score - (0.376 * 0.95 + MAX_SCORE_INCREMENT)).abs() < 1e-9);

        let mut rng = RngI::seed_from_u64(1);
        let mut picked_a = false;
        for _ in 0..200 {
            let o = book.select(&mut rng).unwrap();
            picked_a |= o == &a;
        }
        assert!(picked_a);
    }

    #[test]
    fn rescore_baseline() {
        let mut b = RescoreBaseline::default();
        assert_eq!(b.increment(10.0, 0), None);
        let inc = b.increment(20.0, 1).unwrap();
        assert!((inc - (10.0 * COVERAGE_WEIGHT + VULNERABILITY_WEIGHT)).abs() < 1e-9);
        assert_eq!(b.increment(100.0, 1), Some(MAX_SCORE_INCREMENT));
    }

    #[test]
    fn random_orders_are_permutations() {
        let mut rng = RngI::seed_from_u64(3);
        let o = random_order(&mut rng, 6);
        let mut idx = o.indices().to_vec();
        idx.sort_unstable();
        assert_eq!(idx, vec![1, 2, 3, 4, 5, 6]);
    }
}
