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

//! Mutable per-campaign state that sits next to the immutable [`ContractAbi`]: the current
//! execution order and the per-parameter mutation flags.

use std::fmt;

use crate::abi::ContractAbi;
use crate::error::CodecError;

/// A sequence of 1-based function indices, rendered as `1->2->3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionOrder(Vec<usize>);

impl ExecutionOrder {
    /// Builds an order from 1-based indices. Indices are validated against the ABI by
    /// [`FuzzSession::set_order`].
    pub fn new(indices: Vec<usize>) -> Self {
        ExecutionOrder(indices)
    }

    /// declaration order `1->2->...->n`
    pub fn identity(n: usize) -> Self {
        ExecutionOrder((1..=n).collect())
    }

    #[inline]
    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 0-based function indices
    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().map(|i| i - 1)
    }

    /// renders the functions instead of their indices, e.g. `Token(uint256 s)->transfer(...)`
    pub fn describe(&self, abi: &ContractAbi) -> String {
        self.positions()
            .filter_map(|i| abi.function_api(i))
            .collect::<Vec<_>>()
            .join("->")
    }
}

impl fmt::Display for ExecutionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|i| i.to_string()).collect();
        write!(f, "{}", parts.join("->"))
    }
}

/// Per-function, per-parameter "should this be mutated" flags. Defaults to all `true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationFlags(Vec<Vec<bool>>);

impl MutationFlags {
    pub fn all_yes(abi: &ContractAbi) -> Self {
        MutationFlags(
            abi.functions()
                .iter()
                .map(|f| vec![true; f.inputs.len()])
                .collect(),
        )
    }

    /// `function` is a 0-based index into the ABI's functions
    pub fn get(&self, function: usize, param: usize) -> bool {
        self.0
            .get(function)
            .and_then(|f| f.get(param))
            .cloned()
            .unwrap_or(true)
    }

    pub fn set(&mut self, function: usize, param: usize, value: bool) {
        if let Some(slot) = self.0.get_mut(function).and_then(|f| f.get_mut(param)) {
            *slot = value;
        }
    }

    pub fn count_enabled(&self) -> usize {
        self.0.iter().flatten().filter(|b| **b).count()
    }
}

/// Explicitly owned campaign state passed by reference into the codec and the mutation engine.
#[derive(Debug, Clone)]
pub struct FuzzSession {
    order: ExecutionOrder,
    pub flags: MutationFlags,
}

impl FuzzSession {
    pub fn new(abi: &ContractAbi) -> Self {
        FuzzSession {
            order: ExecutionOrder::identity(abi.function_count()),
            flags: MutationFlags::all_yes(abi),
        }
    }

    #[inline]
    pub fn order(&self) -> &ExecutionOrder {
        &self.order
    }

    pub fn set_order(&mut self, abi: &ContractAbi, order: ExecutionOrder) -> Result<(), CodecError> {
        if let Some(bad) = order
            .indices()
            .iter()
            .find(|i| **i == 0 || **i > abi.function_count())
        {
            return Err(CodecError::UnknownFunction(*bad));
        }
        self.order = order;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;

    #[test]
    fn order_display() {
        let o = ExecutionOrder::new(vec![3, 1, 2]);
        assert_eq!(o.to_string(), "3->1->2");
        assert_eq!(o.positions().collect::<Vec<_>>(), vec![2, 0, 1]);
        assert_eq!(ExecutionOrder::identity(3).to_string(), "1->2->3");
    }

    #[test]
    fn session_rejects_unknown_indices() {
        let abi = sample_abi();
        let mut session = FuzzSession::new(&abi);
        assert_eq!(session.order().len(), abi.function_count());
        assert!(session
            .set_order(&abi, ExecutionOrder::new(vec![0, 1]))
            .is_err());
        assert!(session
            .set_order(&abi, ExecutionOrder::new(vec![abi.function_count() + 1]))
            .is_err());
        session.set_order(&abi, ExecutionOrder::new(vec![2, 1])).unwrap();
        assert_eq!(session.order().to_string(), "2->1");
    }

    #[test]
    fn flags_default_to_yes() {
        let abi = sample_abi();
        let mut flags = MutationFlags::all_yes(&abi);
        let total: usize = abi.functions().iter().map(|f| f.inputs.len()).sum();
        assert_eq!(flags.count_enabled(), total);
        flags.set(1, 0, false);
        assert!(!flags.get(1, 0));
        assert_eq!(flags.count_enabled(), total - 1);
        // out of range lookups stay permissive
        assert!(flags.get(100, 100));
    }
}
