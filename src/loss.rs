//! Sequence-gap loss accounting per (agent, source ID)
//!
//! Assumes in-order arrival per source; reordered UDP datagrams are
//! re-based rather than counted, so loss may be under-reported briefly.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{FlowmirrorError, Result};

/// Deltas at or above this are treated as a restart or reordering
const RESTART_THRESHOLD: u32 = 1 << 31;

#[derive(Debug, Clone, Copy)]
struct SequenceState {
    last: u32,
    lost: u64,
}

#[derive(Default)]
pub struct LossTracker {
    agents: Mutex<HashMap<String, HashMap<u32, SequenceState>>>,
}

impl LossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed sequence number, returning the packets newly counted as lost
    pub fn record(&self, agent: &str, source_id: u32, sequence: u32) -> u64 {
        let mut agents = self.agents.lock();
        let sources = agents.entry(agent.to_string()).or_default();
        let state = match sources.entry(source_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(SequenceState {
                    last: sequence,
                    lost: 0,
                });
                return 0;
            }
        };

        let delta = sequence.wrapping_sub(state.last);
        let lost = match delta {
            0 => return 0,
            d if d < RESTART_THRESHOLD => u64::from(d - 1),
            _ => 0,
        };
        state.last = sequence;
        state.lost += lost;
        lost
    }

    /// Cumulative loss across every source ID of `agent`
    pub fn loss(&self, agent: &str) -> Result<u64> {
        self.agents
            .lock()
            .get(agent)
            .map(|sources| sources.values().map(|s| s.lost).sum())
            .ok_or_else(|| FlowmirrorError::AgentNotFound(agent.to_string()))
    }

    pub fn total_loss(&self) -> u64 {
        self.agents
            .lock()
            .values()
            .flat_map(|sources| sources.values())
            .map(|s| s.lost)
            .sum()
    }

    pub fn agents(&self) -> Vec<String> {
        let mut agents: Vec<_> = self.agents.lock().keys().cloned().collect();
        agents.sort();
        agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_counts_nothing() {
        let tracker = LossTracker::new();
        assert_eq!(tracker.record("10.1.1.1", 5, 1000), 0);
        assert_eq!(tracker.loss("10.1.1.1").unwrap(), 0);
    }

    #[test]
    fn test_consecutive_sequences_lose_nothing() {
        let tracker = LossTracker::new();
        for seq in 10..20 {
            tracker.record("10.1.1.1", 5, seq);
        }
        assert_eq!(tracker.loss("10.1.1.1").unwrap(), 0);
    }

    #[test]
    fn test_gap_counts_missing_packets() {
        let tracker = LossTracker::new();
        tracker.record("10.1.1.1", 5, 100);
        assert_eq!(tracker.record("10.1.1.1", 5, 103), 2);
        assert_eq!(tracker.loss("10.1.1.1").unwrap(), 2);

        tracker.record("10.1.1.1", 5, 108);
        assert_eq!(tracker.loss("10.1.1.1").unwrap(), 6);
    }

    #[test]
    fn test_duplicate_is_ignored() {
        let tracker = LossTracker::new();
        tracker.record("a", 0, 7);
        assert_eq!(tracker.record("a", 0, 7), 0);
        assert_eq!(tracker.record("a", 0, 8), 0);
    }

    #[test]
    fn test_wraparound_counts_only_the_gap() {
        let tracker = LossTracker::new();
        tracker.record("a", 0, u32::MAX - 1);
        assert_eq!(tracker.record("a", 0, 1), 2);
        assert_eq!(tracker.loss("a").unwrap(), 2);
    }

    #[test]
    fn test_backwards_jump_rebases() {
        let tracker = LossTracker::new();
        tracker.record("a", 0, 5000);
        assert_eq!(tracker.record("a", 0, 10), 0);
        assert_eq!(tracker.record("a", 0, 12), 1);
        assert_eq!(tracker.loss("a").unwrap(), 1);
    }

    #[test]
    fn test_loss_sums_sources_and_unknown_agent_errors() {
        let tracker = LossTracker::new();
        tracker.record("a", 1, 1);
        tracker.record("a", 1, 4);
        tracker.record("a", 2, 10);
        tracker.record("a", 2, 12);
        tracker.record("b", 1, 1);
        tracker.record("b", 1, 3);

        assert_eq!(tracker.loss("a").unwrap(), 3);
        assert_eq!(tracker.total_loss(), 4);
        assert_eq!(tracker.agents(), vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(
            tracker.loss("c"),
            Err(FlowmirrorError::AgentNotFound(_))
        ));
    }
}
