//! Replicable entity records
//!
//! The simulation owns every field here except the scheduling metadata
//! (`next_eligible_time`, `dirty`), which the replication driver rewrites each tick.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::util::vec3::Vec3;

// ============================================================================
// Defaults
// ============================================================================

/// Default relative replication priority
pub const DEFAULT_NET_PRIORITY: f32 = 1.0;

/// Default desired replications per second
pub const DEFAULT_NET_UPDATE_FREQUENCY: f32 = 10.0;

/// Lowest update frequency honoured by the throttle (prevents a zero rate from
/// parking an entity forever)
pub const MIN_NET_UPDATE_FREQUENCY: f32 = 0.01;

/// Generational handle into the entity table
///
/// Slot indices are recycled; the generation makes a handle to a despawned
/// entity miss instead of resolving to whatever took its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    index: u32,
    generation: u32,
}

impl EntityId {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Replicated class identifier, resolved against each connection's package map
pub type ClassId = u16;

/// Which relevancy/priority rules apply to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelevancyCategory {
    Generic,
    Projectile,
    Controller,
    Pawn,
    Vehicle,
    Weapon,
}

impl RelevancyCategory {
    /// Player-controllable bodies (pawns and vehicles)
    pub fn is_body(self) -> bool {
        matches!(self, RelevancyCategory::Pawn | RelevancyCategory::Vehicle)
    }
}

/// State shared by player-controllable bodies
#[derive(Debug, Clone, Default)]
pub struct BodyState {
    /// Eye offset above the body origin, used as the occludee point
    pub eye_height: f32,
    pub controller: Option<EntityId>,
    /// Vehicle this body is currently driving
    pub driven_vehicle: Option<EntityId>,
    /// Currently held weapon
    pub weapon: Option<EntityId>,
    /// Whether the held weapon rides on this body's relevancy
    pub replicate_weapon: bool,
}

/// Entity subtype, resolved by tag rather than a class hierarchy
#[derive(Debug, Clone)]
pub enum EntityKind {
    Generic,
    Projectile,
    /// A connection's player controller
    Controller {
        pawn: Option<EntityId>,
        /// Entity whose eyes define the viewpoint (spectating, cameras)
        view_target: Option<EntityId>,
        view_direction: Vec3,
    },
    Pawn(BodyState),
    Vehicle(BodyState),
    Weapon,
}

/// Replication behaviour switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationFlags {
    /// Entity has a remote role at all
    pub replicated: bool,
    pub always_relevant: bool,
    pub only_relevant_to_owner: bool,
    pub hidden: bool,
    pub only_owner_see: bool,
    /// Hidden entities that still block stay eligible for the occlusion check
    pub blocks: bool,
    /// Replication was torn off; never re-query relevancy
    pub torn_off: bool,
}

impl Default for ReplicationFlags {
    fn default() -> Self {
        Self {
            replicated: true,
            always_relevant: false,
            only_relevant_to_owner: false,
            hidden: false,
            only_owner_see: false,
            blocks: false,
            torn_off: false,
        }
    }
}

/// A replicable simulation object
#[derive(Debug, Clone)]
pub struct Entity {
    pub class: ClassId,
    pub kind: EntityKind,
    /// `None` when the entity has no spatial presence
    pub position: Option<Vec3>,
    pub velocity: Vec3,
    pub owner: Option<EntityId>,
    pub instigator: Option<EntityId>,
    /// Entity this one stands on or rides
    pub base: Option<EntityId>,
    pub flags: ReplicationFlags,
    pub net_priority: f32,
    pub net_update_frequency: f32,
    /// Earliest tick time at which the entity may enter a candidate list again
    pub next_eligible_time: f64,
    /// Changed since the dirty tracker last ran
    pub dirty: bool,
}

impl Entity {
    pub fn new(class: ClassId, kind: EntityKind) -> Self {
        Self {
            class,
            kind,
            position: None,
            velocity: Vec3::ZERO,
            owner: None,
            instigator: None,
            base: None,
            flags: ReplicationFlags::default(),
            net_priority: DEFAULT_NET_PRIORITY,
            net_update_frequency: DEFAULT_NET_UPDATE_FREQUENCY,
            next_eligible_time: f64::NEG_INFINITY,
            dirty: false,
        }
    }

    pub fn generic(class: ClassId) -> Self {
        Self::new(class, EntityKind::Generic)
    }

    pub fn projectile(class: ClassId) -> Self {
        Self::new(class, EntityKind::Projectile)
    }

    pub fn controller(class: ClassId, pawn: Option<EntityId>) -> Self {
        Self::new(
            class,
            EntityKind::Controller {
                pawn,
                view_target: None,
                view_direction: Vec3::FORWARD,
            },
        )
    }

    pub fn pawn(class: ClassId, eye_height: f32) -> Self {
        Self::new(
            class,
            EntityKind::Pawn(BodyState {
                eye_height,
                ..BodyState::default()
            }),
        )
    }

    pub fn vehicle(class: ClassId) -> Self {
        Self::new(class, EntityKind::Vehicle(BodyState::default()))
    }

    pub fn weapon(class: ClassId) -> Self {
        Self::new(class, EntityKind::Weapon)
    }

    pub fn at(mut self, position: Vec3) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_owner(mut self, owner: EntityId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_instigator(mut self, instigator: EntityId) -> Self {
        self.instigator = Some(instigator);
        self
    }

    pub fn with_base(mut self, base: EntityId) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_flags(mut self, flags: ReplicationFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_frequency(mut self, net_update_frequency: f32) -> Self {
        self.net_update_frequency = net_update_frequency;
        self
    }

    pub fn with_priority(mut self, net_priority: f32) -> Self {
        self.net_priority = net_priority;
        self
    }

    // ========================================================================
    // Capability set
    // ========================================================================

    #[inline]
    pub fn is_always_relevant(&self) -> bool {
        self.flags.always_relevant
    }

    pub fn relevancy_category(&self) -> RelevancyCategory {
        match self.kind {
            EntityKind::Generic => RelevancyCategory::Generic,
            EntityKind::Projectile => RelevancyCategory::Projectile,
            EntityKind::Controller { .. } => RelevancyCategory::Controller,
            EntityKind::Pawn(_) => RelevancyCategory::Pawn,
            EntityKind::Vehicle(_) => RelevancyCategory::Vehicle,
            EntityKind::Weapon => RelevancyCategory::Weapon,
        }
    }

    /// Offset from `position` to the point other viewers try to see
    pub fn occludee_offset(&self) -> Vec3 {
        match self.body() {
            Some(body) => Vec3::UP * body.eye_height,
            None => Vec3::ZERO,
        }
    }

    /// Controllers and bodies may stand in as their own owner
    pub fn is_viewer_capable(&self) -> bool {
        matches!(
            self.kind,
            EntityKind::Controller { .. } | EntityKind::Pawn(_) | EntityKind::Vehicle(_)
        )
    }

    pub fn body(&self) -> Option<&BodyState> {
        match &self.kind {
            EntityKind::Pawn(body) | EntityKind::Vehicle(body) => Some(body),
            _ => None,
        }
    }

    pub fn body_mut(&mut self) -> Option<&mut BodyState> {
        match &mut self.kind {
            EntityKind::Pawn(body) | EntityKind::Vehicle(body) => Some(body),
            _ => None,
        }
    }

    /// Seconds between throttled candidate-list entries
    #[inline]
    pub fn update_interval(&self) -> f64 {
        1.0 / self.net_update_frequency.max(MIN_NET_UPDATE_FREQUENCY) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags_replicated() {
        let flags = ReplicationFlags::default();
        assert!(flags.replicated);
        assert!(!flags.always_relevant);
        assert!(!flags.torn_off);
    }

    #[test]
    fn test_occludee_offset_uses_eye_height() {
        let pawn = Entity::pawn(1, 64.0);
        assert_eq!(pawn.occludee_offset(), Vec3::new(0.0, 0.0, 64.0));
        assert_eq!(Entity::generic(1).occludee_offset(), Vec3::ZERO);
    }

    #[test]
    fn test_viewer_capable_kinds() {
        assert!(Entity::pawn(1, 0.0).is_viewer_capable());
        assert!(Entity::vehicle(1).is_viewer_capable());
        assert!(Entity::controller(1, None).is_viewer_capable());
        assert!(!Entity::projectile(1).is_viewer_capable());
        assert!(!Entity::weapon(1).is_viewer_capable());
    }

    #[test]
    fn test_update_interval_clamped() {
        assert!((Entity::generic(1).with_frequency(10.0).update_interval() - 0.1).abs() < 1e-6);
        let parked = Entity::generic(1).with_frequency(0.0);
        assert!(parked.update_interval().is_finite());
    }

    #[test]
    fn test_new_entity_immediately_eligible() {
        let e = Entity::generic(1);
        assert!(0.0 > e.next_eligible_time);
        assert!(!e.dirty);
    }
}
