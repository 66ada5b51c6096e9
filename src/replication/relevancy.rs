//! Relevancy oracle
//!
//! Decides whether an entity should be considered for replication to one
//! viewer. Rules, first match wins:
//!
//! 1. Always-relevant entities, entities owned (directly or one level up) by
//!    the viewer or the connection's controller, the viewer itself, and
//!    entities instigated by the viewer.
//! 2. Hidden entities that do not block are never relevant.
//! 3. Otherwise an unobstructed line from the entity's occludee point to the
//!    viewer's eye decides, after an optional squared-distance cull.
//!
//! Controllers are relevant only to their own connection; vehicles also
//! accept rider/vehicle base relationships; weapons ride on the relevancy of
//! the body carrying them.

use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;

use crate::util::vec3::Vec3;
use crate::world::entity::{Entity, EntityId, RelevancyCategory};
use crate::world::occlusion::OcclusionQuery;
use crate::world::table::EntityTable;

/// Initial capacity for the per-tick relevancy cache
const RELEVANCY_CACHE_INITIAL_CAPACITY: usize = 256;

/// Stateless relevancy evaluation
pub fn is_net_relevant_for(
    world: &EntityTable,
    id: EntityId,
    viewer: EntityId,
    controller: EntityId,
    origin: Vec3,
    occlusion: &dyn OcclusionQuery,
    max_distance_sq: Option<f32>,
) -> bool {
    let Some(entity) = world.get(id) else {
        return false;
    };
    if is_directly_relevant(world, id, entity, viewer, controller, origin, occlusion, max_distance_sq) {
        return true;
    }
    // The holder is a body, never a weapon, so this recursion is one level deep
    carrying_body(world, id, entity).is_some_and(|holder| {
        is_net_relevant_for(world, holder, viewer, controller, origin, occlusion, max_distance_sq)
    })
}

/// Every rule except riding on a carrier's relevancy
#[allow(clippy::too_many_arguments)]
fn is_directly_relevant(
    world: &EntityTable,
    id: EntityId,
    entity: &Entity,
    viewer: EntityId,
    controller: EntityId,
    origin: Vec3,
    occlusion: &dyn OcclusionQuery,
    max_distance_sq: Option<f32>,
) -> bool {
    if entity.is_always_relevant() {
        return true;
    }

    let category = entity.relevancy_category();
    if category == RelevancyCategory::Controller {
        return id == controller;
    }

    if is_implicitly_relevant(world, id, entity, viewer, controller) {
        return true;
    }

    if category == RelevancyCategory::Vehicle
        && (world.is_based_on(id, viewer) || world.is_based_on(viewer, id))
    {
        return true;
    }

    is_visible(entity, origin, occlusion, max_distance_sq)
}

/// Rule 1: ownership, self and instigator relationships
#[inline]
fn is_implicitly_relevant(
    world: &EntityTable,
    id: EntityId,
    entity: &Entity,
    viewer: EntityId,
    controller: EntityId,
) -> bool {
    id == viewer
        || entity.instigator == Some(viewer)
        || world.is_owned_by(id, viewer)
        || world.is_owned_by(id, controller)
}

/// Rules 2 and 3
fn is_visible(
    entity: &Entity,
    origin: Vec3,
    occlusion: &dyn OcclusionQuery,
    max_distance_sq: Option<f32>,
) -> bool {
    if (entity.flags.hidden || entity.flags.only_owner_see) && !entity.flags.blocks {
        return false;
    }
    let Some(position) = entity.position else {
        return false;
    };
    if let Some(max_sq) = max_distance_sq {
        if position.distance_sq_to(origin) > max_sq {
            return false;
        }
    }

    let occludee = position + entity.occludee_offset();
    if occlusion.has_unobstructed_line(occludee, origin) {
        return true;
    }
    // Bodies are also checked at their centre
    entity.relevancy_category().is_body()
        && occludee != position
        && occlusion.has_unobstructed_line(position, origin)
}

/// Body whose relevancy a held weapon rides on
fn carrying_body(world: &EntityTable, id: EntityId, entity: &Entity) -> Option<EntityId> {
    if entity.relevancy_category() != RelevancyCategory::Weapon {
        return None;
    }
    let holder = entity.instigator?;
    let body = world.get(holder).and_then(Entity::body)?;
    (body.replicate_weapon && body.weapon == Some(id)).then_some(holder)
}

#[derive(Debug, Clone, Copy)]
struct CachedRelevancy {
    viewer: EntityId,
    controller: EntityId,
    relevant: bool,
}

/// Relevancy evaluation with a per-tick memo keyed on (entity, viewer, controller).
///
/// Within one pass an entity is queried once, so hits come from a held
/// weapon and its holder resolving each other's relevancy.
#[derive(Debug)]
pub struct RelevancyOracle {
    cache: HashMap<EntityId, CachedRelevancy, FxBuildHasher>,
    max_distance_sq: Option<f32>,
    queries: u64,
    cache_hits: u64,
}

impl RelevancyOracle {
    pub fn new(max_distance_sq: Option<f32>) -> Self {
        Self {
            cache: HashMap::with_capacity_and_hasher(RELEVANCY_CACHE_INITIAL_CAPACITY, FxBuildHasher),
            max_distance_sq,
            queries: 0,
            cache_hits: 0,
        }
    }

    /// Invalidate every cached result; call once at the start of each tick
    pub fn begin_tick(&mut self) {
        self.cache.clear();
    }

    pub fn is_relevant(
        &mut self,
        world: &EntityTable,
        id: EntityId,
        viewer: EntityId,
        controller: EntityId,
        origin: Vec3,
        occlusion: &dyn OcclusionQuery,
    ) -> bool {
        if let Some(cached) = self.cache.get(&id) {
            if cached.viewer == viewer && cached.controller == controller {
                self.cache_hits += 1;
                return cached.relevant;
            }
        }

        self.queries += 1;
        let Some(entity) = world.get(id) else {
            return false;
        };
        let relevant =
            is_directly_relevant(world, id, entity, viewer, controller, origin, occlusion, self.max_distance_sq)
                || carrying_body(world, id, entity).is_some_and(|holder| {
                    // Shares the holder's memo with its own candidate record
                    self.is_relevant(world, holder, viewer, controller, origin, occlusion)
                });
        self.cache.insert(
            id,
            CachedRelevancy {
                viewer,
                controller,
                relevant,
            },
        );
        relevant
    }

    /// Full evaluations performed (cache misses)
    pub fn queries(&self) -> u64 {
        self.queries
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }
}
