//! Candidate list construction
//!
//! Once per tick, every replicated entity past its update throttle lands on
//! exactly one list: the global list shared by all connections, or the owned
//! list of each connection whose viewer or controller owns it. Lists and
//! per-pass buffers live in `TickScratch` and keep their capacity across ticks.

use bitvec::vec::BitVec;
use rand::Rng;
use smallvec::SmallVec;

use crate::replication::priority::PriorityRecord;
use crate::replication::viewer::ViewerContext;
use crate::world::entity::EntityId;
use crate::world::table::EntityTable;

/// Initial capacity for the global candidate list
const GLOBAL_LIST_INITIAL_CAPACITY: usize = 1024;

/// Owned entities per connection kept inline before spilling to the heap
const OWNED_INLINE: usize = 8;

pub type OwnedList = SmallVec<[EntityId; OWNED_INLINE]>;

/// Per-pass buffers reused for every connection
#[derive(Debug, Default)]
pub struct PassScratch {
    pub records: Vec<PriorityRecord>,
    /// Entities already scored for the current connection
    pub considered: BitVec,
}

impl PassScratch {
    /// Prepare for the next connection's pass
    pub fn reset(&mut self, slot_count: usize) {
        self.records.clear();
        self.considered.clear();
        self.considered.resize(slot_count, false);
    }
}

/// Per-tick scratch arena; cleared, never freed, between ticks
#[derive(Debug)]
pub struct TickScratch {
    /// Resolved viewer per connection (index-aligned with the driver's connections)
    pub viewers: Vec<Option<ViewerContext>>,
    pub global: Vec<EntityId>,
    /// Owned list per connection (index-aligned)
    pub owned: Vec<OwnedList>,
    pub pass: PassScratch,
}

impl Default for TickScratch {
    fn default() -> Self {
        Self {
            viewers: Vec::new(),
            global: Vec::with_capacity(GLOBAL_LIST_INITIAL_CAPACITY),
            owned: Vec::new(),
            pass: PassScratch::default(),
        }
    }
}

impl TickScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self, connection_count: usize) {
        self.viewers.clear();
        self.global.clear();
        for list in &mut self.owned {
            list.clear();
        }
        self.owned.resize_with(connection_count, OwnedList::new);
    }
}

/// Counters from one build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateStats {
    /// Entities that passed the throttle
    pub eligible: usize,
    pub global: usize,
    pub owned: usize,
    /// Owner-only entities with no matching connection this tick
    pub unclaimed: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateListBuilder;

impl CandidateListBuilder {
    /// Fill `global` and `owned` for this tick.
    ///
    /// Every entity that passes the throttle has its next eligible time pushed
    /// to `now + jitter + 1/frequency` exactly once, however many connections
    /// will later look at it. `viewers` must be index-aligned with `owned`.
    pub fn build<R: Rng>(
        world: &mut EntityTable,
        now: f64,
        server_tick_time: f32,
        viewers: &[Option<ViewerContext>],
        global: &mut Vec<EntityId>,
        owned: &mut [OwnedList],
        rng: &mut R,
    ) -> CandidateStats {
        debug_assert_eq!(viewers.len(), owned.len());
        let mut stats = CandidateStats::default();

        // Ownership routing reads other entities, so collect the throttled set first
        let mut owner_only: SmallVec<[(EntityId, EntityId); 32]> = SmallVec::new();
        for (id, entity) in world.iter_mut() {
            if !entity.flags.replicated || now <= entity.next_eligible_time {
                continue;
            }
            let jitter = rng.gen::<f64>() * server_tick_time as f64;
            entity.next_eligible_time = now + jitter + entity.update_interval();
            stats.eligible += 1;

            if entity.flags.always_relevant || !entity.flags.only_relevant_to_owner {
                global.push(id);
                stats.global += 1;
                continue;
            }

            let owner = match entity.owner {
                Some(owner) => owner,
                None if entity.is_viewer_capable() => id,
                None => {
                    stats.unclaimed += 1;
                    continue;
                }
            };
            owner_only.push((id, owner));
        }

        for (id, owner) in owner_only {
            let mut claimed = false;
            for (slot, viewer) in viewers.iter().enumerate() {
                let Some(ctx) = viewer else {
                    continue;
                };
                if owner == ctx.viewer || owner == ctx.controller {
                    owned[slot].push(id);
                    stats.owned += 1;
                    claimed = true;
                }
            }
            if !claimed {
                stats.unclaimed += 1;
            }
        }

        tracing::trace!(
            "Candidates: {} eligible, {} global, {} owned",
            stats.eligible,
            stats.global,
            stats.owned
        );
        stats
    }
}
