//! Entity arena
//!
//! Entities live in index-addressed slots. Freed slots are recycled through a
//! free list, and each reuse bumps the slot's generation, so an `EntityId`
//! held by a channel never resolves to a newer entity.

use crate::world::entity::{Entity, EntityId, EntityKind};

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

#[derive(Debug, Default)]
pub struct EntityTable {
    slots: Vec<Slot>,
    /// Vacant slot indices, reused LIFO
    free: Vec<u32>,
    live: usize,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Insert an entity, returning its handle
    pub fn spawn(&mut self, entity: Entity) -> EntityId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entity = Some(entity);
            return EntityId::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entity: Some(entity),
        });
        EntityId::new(index, 0)
    }

    /// Remove an entity and recycle its slot under the next generation
    pub fn despawn(&mut self, id: EntityId) -> Option<Entity> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())?;
        let removed = slot.entity.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        self.live -= 1;
        Some(removed)
    }

    #[inline]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entity.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entity.as_mut())
    }

    #[inline]
    pub fn contains(&self, id: EntityId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live entities
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Upper bound on entity indices (sizes per-tick scratch); tracks the
    /// peak live count, not the number of spawns
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Live entities in slot order
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.entity
                .as_ref()
                .map(|e| (EntityId::new(i as u32, slot.generation), e))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut Entity)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            let generation = slot.generation;
            slot.entity
                .as_mut()
                .map(|e| (EntityId::new(i as u32, generation), e))
        })
    }

    /// Number of player controllers (humans and bots)
    pub fn player_count(&self) -> usize {
        self.iter()
            .filter(|(_, e)| matches!(e.kind, EntityKind::Controller { .. }))
            .count()
    }

    // ========================================================================
    // Relationship queries (bounded depth, cycles cannot loop)
    // ========================================================================

    /// True when `test` owns `id` directly or through one intermediate owner
    pub fn is_owned_by(&self, id: EntityId, test: EntityId) -> bool {
        let Some(owner) = self.get(id).and_then(|e| e.owner) else {
            return false;
        };
        if owner == test {
            return true;
        }
        self.get(owner).and_then(|o| o.owner) == Some(test)
    }

    /// True when `id` stands on `other` directly or through one intermediate base
    pub fn is_based_on(&self, id: EntityId, other: EntityId) -> bool {
        let Some(base) = self.get(id).and_then(|e| e.base) else {
            return false;
        };
        if base == other {
            return true;
        }
        self.get(base).and_then(|b| b.base) == Some(other)
    }

    /// Pawn possessed by a controller
    pub fn controlled_pawn(&self, controller: EntityId) -> Option<EntityId> {
        match self.get(controller)?.kind {
            EntityKind::Controller { pawn, .. } => pawn.filter(|p| self.contains(*p)),
            _ => None,
        }
    }

    /// Entity whose eyes define a controller's viewpoint: explicit view
    /// target, else the possessed pawn, else the controller itself
    pub fn view_target(&self, controller: EntityId) -> Option<EntityId> {
        match self.get(controller)?.kind {
            EntityKind::Controller { pawn, view_target, .. } => view_target
                .filter(|t| self.contains(*t))
                .or_else(|| pawn.filter(|p| self.contains(*p)))
                .or(Some(controller)),
            _ => None,
        }
    }
}
