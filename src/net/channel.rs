//! Per-(entity, connection) replication state
//!
//! A connection owns exactly one `ChannelTable`; the table holds at most one
//! channel per entity. Scheduling code refers to channels by entity id only.

use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;

use crate::world::entity::EntityId;

/// Initial capacity for a connection's channel table
const CHANNEL_TABLE_INITIAL_CAPACITY: usize = 128;

/// Persistent replication state for one entity on one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub entity: EntityId,
    pub opened_at: f64,
    /// Last time the entity was confirmed relevant (may carry forward jitter)
    pub relevant_time: f64,
    /// Last successful replication; seeds the priority aging term
    pub last_update_time: f64,
    /// At least one replication went through this channel
    pub has_sent: bool,
    /// Entity changed since this channel's last successful send
    pub dirty: bool,
}

impl Channel {
    /// Fresh channel; its aging term starts at the spawn baseline
    pub fn open(entity: EntityId, now: f64, spawn_priority_seconds: f32) -> Self {
        Self {
            entity,
            opened_at: now,
            relevant_time: now,
            last_update_time: now - spawn_priority_seconds as f64,
            has_sent: false,
            dirty: true,
        }
    }

    /// Sent before and unchanged since: nothing new to replicate
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.has_sent && !self.dirty
    }

    /// Record a successful replication
    pub fn mark_sent(&mut self, now: f64) {
        self.has_sent = true;
        self.dirty = false;
        self.last_update_time = now;
    }

    #[inline]
    pub fn since_relevant(&self, now: f64) -> f64 {
        now - self.relevant_time
    }
}

/// Entity -> channel map for one connection
#[derive(Debug)]
pub struct ChannelTable {
    channels: HashMap<EntityId, Channel, FxBuildHasher>,
    opened_total: u64,
    closed_total: u64,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            channels: HashMap::with_capacity_and_hasher(CHANNEL_TABLE_INITIAL_CAPACITY, FxBuildHasher),
            opened_total: 0,
            closed_total: 0,
        }
    }

    /// Open a channel for `entity`.
    ///
    /// Opening twice is a list-construction defect; release builds hand back
    /// the existing channel instead of replacing it.
    pub fn open(&mut self, entity: EntityId, now: f64, spawn_priority_seconds: f32) -> &mut Channel {
        debug_assert!(
            !self.channels.contains_key(&entity),
            "duplicate channel for entity {}",
            entity
        );
        let opened = &mut self.opened_total;
        self.channels.entry(entity).or_insert_with(|| {
            *opened += 1;
            Channel::open(entity, now, spawn_priority_seconds)
        })
    }

    pub fn close(&mut self, entity: EntityId) -> Option<Channel> {
        let closed = self.channels.remove(&entity);
        if closed.is_some() {
            self.closed_total += 1;
        }
        closed
    }

    #[inline]
    pub fn get(&self, entity: EntityId) -> Option<&Channel> {
        self.channels.get(&entity)
    }

    #[inline]
    pub fn get_mut(&mut self, entity: EntityId) -> Option<&mut Channel> {
        self.channels.get_mut(&entity)
    }

    #[inline]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.channels.contains_key(&entity)
    }

    /// Flag the entity's channel as needing a resend; false if none is open
    pub fn mark_dirty(&mut self, entity: EntityId) -> bool {
        match self.channels.get_mut(&entity) {
            Some(channel) => {
                channel.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Drop every channel (connection teardown); returns how many were open
    pub fn clear(&mut self) -> usize {
        let count = self.channels.len();
        self.closed_total += count as u64;
        self.channels.clear();
        count
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total
    }

    pub fn closed_total(&self) -> u64 {
        self.closed_total
    }
}
