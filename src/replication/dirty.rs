//! Change propagation from entities to channels
//!
//! The simulation flags entities as they change; once per tick, before any
//! candidate list is built, the flags are pushed onto every connection's
//! channel for that entity and cleared.

use crate::net::connection::ClientConnection;
use crate::world::entity::EntityId;
use crate::world::table::EntityTable;

/// Result of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyFlush {
    /// Entities whose flag was cleared
    pub entities: usize,
    /// Channels newly or re-flagged dirty
    pub channels: usize,
}

#[derive(Debug, Default)]
pub struct DirtyTracker {
    marked_total: u64,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag an entity as changed; false if it does not exist
    pub fn mark_dirty(&mut self, world: &mut EntityTable, id: EntityId) -> bool {
        match world.get_mut(id) {
            Some(entity) => {
                if !entity.dirty {
                    entity.dirty = true;
                    self.marked_total += 1;
                }
                true
            }
            None => false,
        }
    }

    /// Push entity flags onto open connections' channels and clear them
    pub fn flush(&mut self, world: &mut EntityTable, connections: &mut [ClientConnection]) -> DirtyFlush {
        let mut flush = DirtyFlush::default();
        for (id, entity) in world.iter_mut() {
            if !entity.dirty {
                continue;
            }
            if entity.flags.replicated {
                for conn in connections.iter_mut().filter(|c| c.is_open()) {
                    if conn.channels_mut().mark_dirty(id) {
                        flush.channels += 1;
                    }
                }
            }
            entity.dirty = false;
            flush.entities += 1;
        }
        if flush.entities > 0 {
            tracing::trace!("Dirty flush: {} entities, {} channels", flush.entities, flush.channels);
        }
        flush
    }

    /// Distinct mark events since startup (repeat marks within a tick count once)
    pub fn marked_total(&self) -> u64 {
        self.marked_total
    }
}
