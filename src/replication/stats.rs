use serde::Serialize;

use crate::replication::candidates::CandidateStats;
use crate::replication::dirty::DirtyFlush;
use crate::replication::scheduler::PassOutcome;

/// Aggregate counters for one scheduling tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TickStats {
    pub now: f64,
    pub connections_serviced: usize,
    /// Connections with no viewer this tick
    pub connections_skipped: usize,
    pub saturated_connections: usize,
    pub dirty_entities: usize,
    pub dirty_channels: usize,
    /// Entities that passed the update throttle
    pub eligible: usize,
    pub considered: usize,
    pub clean_skipped: usize,
    pub relevancy_queries: usize,
    pub replicated: usize,
    pub bytes: u64,
    pub channels_opened: usize,
    pub channels_closed: usize,
    pub unknown_class: usize,
    pub truncated: usize,
}

impl TickStats {
    pub fn new(now: f64) -> Self {
        Self {
            now,
            ..Self::default()
        }
    }

    pub fn absorb_flush(&mut self, flush: DirtyFlush) {
        self.dirty_entities += flush.entities;
        self.dirty_channels += flush.channels;
    }

    pub fn absorb_candidates(&mut self, candidates: CandidateStats) {
        self.eligible += candidates.eligible;
    }

    /// Fold one connection's pass in
    pub fn absorb(&mut self, pass: &PassOutcome) {
        self.connections_serviced += 1;
        if pass.saturated() {
            self.saturated_connections += 1;
        }
        self.considered += pass.considered;
        self.clean_skipped += pass.clean_skipped;
        self.relevancy_queries += pass.relevancy_queries;
        self.replicated += pass.replicated;
        self.bytes += pass.bytes;
        self.channels_opened += pass.channels_opened;
        self.channels_closed += pass.channels_closed;
        self.unknown_class += pass.unknown_class;
        self.truncated += pass.truncated;
    }
}
