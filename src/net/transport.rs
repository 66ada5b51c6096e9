//! Transport collaborator seen from the scheduler
//!
//! Serialization, packetization and acknowledgement live behind this trait.
//! The scheduler only polls capacity and asks for one entity at a time.

use crate::net::channel::Channel;
use crate::world::entity::{Entity, EntityId};

/// Bytes charged for a channel's first replication relative to later updates
const INITIAL_UPDATE_MULTIPLIER: usize = 3;

pub trait Transport {
    /// Non-blocking capacity poll: can the connection absorb `bytes_hint` more bytes?
    fn is_ready(&self, bytes_hint: usize) -> bool;

    /// Per-channel readiness (e.g. reliable window full on just this channel)
    fn channel_ready(&self, _channel: &Channel) -> bool {
        true
    }

    /// Replicate the entity through the channel, returning bytes queued
    fn replicate(&mut self, id: EntityId, entity: &Entity, channel: &Channel) -> usize;

    /// Let time pass (drains outgoing queues)
    fn advance(&mut self, _delta: f32) {}
}

/// Byte-budget transport: each tick refills `net_speed * delta` bytes of
/// allowance and stalls once queued bytes exceed it.
#[derive(Debug, Clone)]
pub struct ThrottledTransport {
    /// Bytes per second
    net_speed: u32,
    /// Positive = backlog, negative = unused allowance
    queued_bytes: i64,
    bytes_per_update: usize,
    sent_bytes: u64,
    sent_updates: u64,
}

impl ThrottledTransport {
    pub fn new(net_speed: u32, bytes_per_update: usize) -> Self {
        Self {
            net_speed,
            queued_bytes: 0,
            bytes_per_update,
            sent_bytes: 0,
            sent_updates: 0,
        }
    }

    pub fn net_speed(&self) -> u32 {
        self.net_speed
    }

    pub fn set_net_speed(&mut self, net_speed: u32) {
        self.net_speed = net_speed;
    }

    pub fn queued_bytes(&self) -> i64 {
        self.queued_bytes
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    pub fn sent_updates(&self) -> u64 {
        self.sent_updates
    }
}

impl Transport for ThrottledTransport {
    fn is_ready(&self, bytes_hint: usize) -> bool {
        self.queued_bytes + bytes_hint as i64 <= 0
    }

    fn replicate(&mut self, _id: EntityId, _entity: &Entity, channel: &Channel) -> usize {
        let bytes = if channel.has_sent {
            self.bytes_per_update
        } else {
            self.bytes_per_update * INITIAL_UPDATE_MULTIPLIER
        };
        self.queued_bytes += bytes as i64;
        self.sent_bytes += bytes as u64;
        self.sent_updates += 1;
        bytes
    }

    fn advance(&mut self, delta: f32) {
        let allowance = (self.net_speed as f64 * delta as f64) as i64;
        // Unused allowance does not bank beyond one tick
        self.queued_bytes = (self.queued_bytes - allowance).max(-allowance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(sent: bool) -> Channel {
        let mut c = Channel::open(EntityId::new(0, 0), 0.0, 1.0);
        if sent {
            c.mark_sent(0.0);
        }
        c
    }

    #[test]
    fn test_fresh_transport_ready_for_probe_only() {
        let transport = ThrottledTransport::new(1000, 50);
        assert!(transport.is_ready(0));
        assert!(!transport.is_ready(1));
    }

    #[test]
    fn test_allowance_refills_per_tick() {
        let mut transport = ThrottledTransport::new(1000, 50);
        transport.advance(0.1);
        assert_eq!(transport.queued_bytes(), -100);
        assert!(transport.is_ready(100));

        let entity = Entity::generic(1);
        transport.replicate(EntityId::new(0, 0), &entity, &channel(true));
        transport.replicate(EntityId::new(0, 0), &entity, &channel(true));
        assert!(transport.is_ready(0));
        transport.replicate(EntityId::new(0, 0), &entity, &channel(true));
        assert!(!transport.is_ready(0));
        assert_eq!(transport.sent_updates(), 3);
    }

    #[test]
    fn test_idle_allowance_does_not_bank() {
        let mut transport = ThrottledTransport::new(1000, 50);
        for _ in 0..10 {
            transport.advance(0.1);
        }
        assert_eq!(transport.queued_bytes(), -100);
    }

    #[test]
    fn test_initial_update_costs_more() {
        let mut transport = ThrottledTransport::new(1000, 40);
        let entity = Entity::generic(1);
        assert_eq!(transport.replicate(EntityId::new(0, 0), &entity, &channel(false)), 120);
        assert_eq!(transport.replicate(EntityId::new(0, 0), &entity, &channel(true)), 40);
        assert_eq!(transport.sent_bytes(), 160);
    }
}
