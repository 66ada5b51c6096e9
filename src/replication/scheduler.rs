//! Per-connection replication pass
//!
//! One pass per connection per tick:
//! `Idle -> BuildingCandidates -> Sorting -> Walking -> {Saturated | Exhausted}`.
//!
//! The walk replicates in strictly descending priority while the transport
//! has room. Whatever is left when it stops is made immediately eligible
//! again so the next tick starts with it.

use rand::Rng;
use tracing::{debug, trace};

use crate::config::SchedulerConfig;
use crate::net::connection::ClientConnection;
use crate::replication::candidates::PassScratch;
use crate::replication::priority::PriorityModel;
use crate::replication::relevancy::RelevancyOracle;
use crate::replication::viewer::ViewerContext;
use crate::world::entity::EntityId;
use crate::world::occlusion::OcclusionQuery;
use crate::world::table::EntityTable;

/// Pass state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassState {
    /// No pass running
    #[default]
    Idle,
    /// Merging global and owned lists, clean-skipping, scoring
    BuildingCandidates,
    Sorting,
    /// Replicating in priority order
    Walking,
    /// Transport ran out of room before the list did
    Saturated,
    /// Whole list walked with room to spare
    Exhausted,
}

impl PassState {
    pub fn can_transition_to(self, next: PassState) -> bool {
        use PassState::*;
        matches!(
            (self, next),
            (Idle, BuildingCandidates)
                | (BuildingCandidates, Sorting)
                | (Sorting, Walking)
                | (Walking, Saturated)
                | (Walking, Exhausted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PassState::Saturated | PassState::Exhausted)
    }
}

/// What one pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub state: PassState,
    /// Candidates scored and sorted
    pub considered: usize,
    /// Candidates skipped because their channel had nothing new
    pub clean_skipped: usize,
    pub relevancy_queries: usize,
    pub replicated: usize,
    pub bytes: u64,
    pub channels_opened: usize,
    pub channels_closed: usize,
    /// Relevant but the client cannot instantiate the class yet
    pub unknown_class: usize,
    /// Channel not ready; retried next tick
    pub channel_deferred: usize,
    /// Left unvisited after saturation
    pub truncated: usize,
}

impl PassOutcome {
    fn enter(&mut self, next: PassState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid pass transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    pub fn saturated(&self) -> bool {
        self.state == PassState::Saturated
    }
}

/// Runs replication passes with a fixed set of timing parameters
#[derive(Debug, Clone)]
pub struct ReplicationScheduler {
    priority: PriorityModel,
    spawn_priority_seconds: f32,
    relevant_timeout: f64,
    recheck_interval: f64,
    relevant_time_jitter: f64,
}

impl ReplicationScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            priority: PriorityModel::new(config.spawn_priority_seconds),
            spawn_priority_seconds: config.spawn_priority_seconds,
            relevant_timeout: config.relevant_timeout as f64,
            recheck_interval: config.relevancy_recheck_interval as f64,
            relevant_time_jitter: config.relevant_time_jitter as f64,
        }
    }

    /// Run one connection's pass over its merged candidate lists
    #[allow(clippy::too_many_arguments)]
    pub fn run_pass<R: Rng>(
        &self,
        conn: &mut ClientConnection,
        ctx: &ViewerContext,
        world: &mut EntityTable,
        global: &[EntityId],
        owned: &[EntityId],
        oracle: &mut RelevancyOracle,
        occlusion: &dyn OcclusionQuery,
        scratch: &mut PassScratch,
        rng: &mut R,
        now: f64,
    ) -> PassOutcome {
        let mut outcome = PassOutcome::default();
        scratch.reset(world.slot_count());

        outcome.enter(PassState::BuildingCandidates);
        self.build_records(conn, ctx, world, global, owned, scratch, now, &mut outcome);

        outcome.enter(PassState::Sorting);
        // Stable: equal priorities keep list order
        scratch.records.sort_by(|a, b| b.priority.cmp(&a.priority));
        outcome.considered = scratch.records.len();

        outcome.enter(PassState::Walking);
        let tail_start = self.walk(conn, ctx, world, oracle, occlusion, scratch, rng, now, &mut outcome);

        if tail_start < scratch.records.len() {
            outcome.enter(PassState::Saturated);
            for record in &scratch.records[tail_start..] {
                if let Some(entity) = world.get_mut(record.entity) {
                    entity.next_eligible_time = now;
                }
            }
            outcome.truncated = scratch.records.len() - tail_start;
        } else {
            outcome.enter(PassState::Exhausted);
        }

        conn.was_saturated = outcome.saturated();
        conn.last_rep_time = now;
        conn.record_sent(outcome.replicated as u64, outcome.bytes);

        debug!(
            "Connection {} pass: {:?}, {} considered, {} replicated ({} bytes), {} clean, {} truncated",
            ctx.connection,
            outcome.state,
            outcome.considered,
            outcome.replicated,
            outcome.bytes,
            outcome.clean_skipped,
            outcome.truncated
        );
        outcome
    }

    /// Merge both lists, clean-skip, and score the rest
    #[allow(clippy::too_many_arguments)]
    fn build_records(
        &self,
        conn: &mut ClientConnection,
        ctx: &ViewerContext,
        world: &EntityTable,
        global: &[EntityId],
        owned: &[EntityId],
        scratch: &mut PassScratch,
        now: f64,
        outcome: &mut PassOutcome,
    ) {
        let channels = conn.channels_mut();
        for &id in global.iter().chain(owned) {
            // A live entity's index is always inside the scratch bitset
            let Some(entity) = world.get(id) else {
                continue;
            };
            if scratch.considered[id.index()] {
                continue;
            }
            scratch.considered.set(id.index(), true);
            if let Some(channel) = channels.get_mut(id) {
                if channel.is_clean() {
                    channel.relevant_time = now;
                    outcome.clean_skipped += 1;
                    continue;
                }
            }
            let record = self.priority.record(world, id, entity, channels.get(id), ctx, now);
            scratch.records.push(record);
        }
    }

    /// Walk sorted records; returns the index of the first unvisited record
    #[allow(clippy::too_many_arguments)]
    fn walk<R: Rng>(
        &self,
        conn: &mut ClientConnection,
        ctx: &ViewerContext,
        world: &mut EntityTable,
        oracle: &mut RelevancyOracle,
        occlusion: &dyn OcclusionQuery,
        scratch: &PassScratch,
        rng: &mut R,
        now: f64,
        outcome: &mut PassOutcome,
    ) -> usize {
        let (channels, transport, package_map) = conn.split_mut();

        for (index, record) in scratch.records.iter().enumerate() {
            let id = record.entity;
            let Some(entity) = world.get(id) else {
                continue;
            };
            debug_assert_eq!(record.has_channel, channels.contains(id), "entity {} walked twice", id);

            let since_relevant = channels.get(id).map(|c| c.since_relevant(now));
            let needs_query = !entity.flags.torn_off && since_relevant.map_or(true, |s| s > self.recheck_interval);
            let confirmed = if needs_query {
                outcome.relevancy_queries += 1;
                Some(oracle.is_relevant(world, id, ctx.viewer, ctx.controller, ctx.relevancy_origin, occlusion))
            } else {
                None
            };
            let keep = confirmed == Some(true) || since_relevant.is_some_and(|s| s < self.relevant_timeout);

            if !keep {
                if channels.close(id).is_some() {
                    outcome.channels_closed += 1;
                    debug!("Connection {} closed channel for {}", ctx.connection, id);
                }
                continue;
            }

            if !channels.contains(id) {
                if !package_map.knows(entity.class) {
                    outcome.unknown_class += 1;
                    trace!("Connection {} cannot resolve class {} of {}", ctx.connection, entity.class, id);
                    continue;
                }
                channels.open(id, now, self.spawn_priority_seconds);
                outcome.channels_opened += 1;
                debug!("Connection {} opened channel for {}", ctx.connection, id);
            }

            if !transport.is_ready(0) {
                return index;
            }

            let Some(channel) = channels.get_mut(id) else {
                continue;
            };
            if confirmed == Some(true) {
                channel.relevant_time = now + self.relevant_time_jitter * rng.gen::<f64>();
            }

            if transport.channel_ready(channel) {
                let bytes = transport.replicate(id, entity, channel);
                channel.mark_sent(now);
                outcome.replicated += 1;
                outcome.bytes += bytes as u64;
                trace!("Replicated {} to connection {} ({} bytes)", id, ctx.connection, bytes);
            } else {
                outcome.channel_deferred += 1;
                if let Some(entity) = world.get_mut(id) {
                    entity.next_eligible_time = now;
                }
            }

            if !transport.is_ready(0) {
                return index + 1;
            }
        }
        scratch.records.len()
    }
}
