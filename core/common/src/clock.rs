//! Vector clocks: per-client causal counters.
//!
//! All operations here are pure. A client only ever advances its own entry
//! (`increment`), and knowledge from other clients is folded in with
//! `merge`, which is a pointwise maximum.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::ClientId;

/// Causal relation between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClockOrdering {
    /// Left happened strictly before right.
    Before,
    /// Left happened strictly after right.
    After,
    /// Neither dominates the other.
    Concurrent,
    /// Identical knowledge.
    Equal,
}

/// Map of client id to counter. Missing entries are zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<ClientId, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `client`, zero when absent.
    pub fn get(&self, client: &ClientId) -> u64 {
        self.entries.get(client).copied().unwrap_or(0)
    }

    /// Return a new clock with `client`'s entry advanced by one.
    pub fn increment(&self, client: &ClientId) -> Self {
        let mut next = self.clone();
        *next.entries.entry(client.clone()).or_insert(0) += 1;
        next
    }

    /// Pointwise maximum of two clocks.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for (client, &counter) in &other.entries {
            let slot = merged.entries.entry(client.clone()).or_insert(0);
            if counter > *slot {
                *slot = counter;
            }
        }
        merged
    }

    /// Compare two clocks causally.
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for client in self.entries.keys().chain(other.entries.keys()) {
            let a = self.get(client);
            let b = other.get(client);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
            if self_ahead && other_ahead {
                return ClockOrdering::Concurrent;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::After | ClockOrdering::Equal
        )
    }

    /// Sum of all counters. Strictly grows along any causal chain, so it is
    /// usable as the leading key of a total order that respects causality.
    pub fn sum(&self) -> u64 {
        self.entries.values().sum()
    }

    /// Whether no client has ever ticked this clock.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|&c| c == 0)
    }

    /// Iterate over `(client, counter)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, u64)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }
}

impl FromIterator<(ClientId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (ClientId, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Duplicate guard shared by every path that materializes remote operations.
///
/// An operation whose clock is already dominated by the local clock has been
/// applied before (or is an ancestor of something applied) and must be
/// skipped.
pub fn detect_duplicate(op_clock: &VectorClock, local_clock: &VectorClock) -> bool {
    matches!(
        op_clock.compare(local_clock),
        ClockOrdering::Before | ClockOrdering::Equal
    )
}
