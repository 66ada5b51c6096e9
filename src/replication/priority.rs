//! Replication priority
//!
//! Priority is aging-weighted: the base term is the time since the entity was
//! last sent on this connection, so anything left waiting long enough rises to
//! the top regardless of where it is. View alignment and distance only shape
//! that term, more aggressively when the connection is short on bandwidth.

use crate::net::channel::Channel;
use crate::replication::viewer::ViewerContext;
use crate::world::entity::{Entity, EntityId, EntityKind, RelevancyCategory};
use crate::world::table::EntityTable;

/// Fixed-point scale applied before rounding
const PRIORITY_SCALE: f64 = 65536.0;

/// Boost for the viewer, its body, and anything it instigated
const SELF_BOOST: f32 = 4.0;

// Behind-view distance bands (squared units)
const BEHIND_FAR_SQ: f32 = 4_000_000.0;
const BEHIND_NEAR_SQ: f32 = 250_000.0;
const BEHIND_FAR_SCALE: f32 = 0.3;
const BEHIND_FAR_SCALE_LOW_BANDWIDTH: f32 = 0.2;
const BEHIND_NEAR_SCALE: f32 = 0.5;

// Low-bandwidth category shaping
const IN_VIEW_COS: f32 = 0.7;
const IN_VIEW_BOOST: f32 = 2.5;
const BODY_FAR_SQ: f32 = 10_000_000.0;
const BODY_FAR_SCALE: f32 = 0.5;
const PROJECTILE_FAR_SQ: f32 = 10_000_000.0;
const PROJECTILE_FAR_SCALE: f32 = 0.2;
const GENERIC_FAR_SQ: f32 = 25_000_000.0;
const GENERIC_FAR_SCALE: f32 = 0.3;
const RIDING_VIEWER_BOOST: f32 = 3.0;

/// One scored (entity, connection) pair; lives for a single pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityRecord {
    pub priority: i64,
    pub entity: EntityId,
    /// Whether a channel existed when the record was scored
    pub has_channel: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PriorityModel {
    spawn_priority_seconds: f32,
}

impl PriorityModel {
    pub fn new(spawn_priority_seconds: f32) -> Self {
        Self { spawn_priority_seconds }
    }

    /// Score an entity for one connection; higher is serviced sooner
    pub fn compute(
        &self,
        world: &EntityTable,
        id: EntityId,
        entity: &Entity,
        channel: Option<&Channel>,
        ctx: &ViewerContext,
        now: f64,
    ) -> i64 {
        let elapsed = match channel {
            Some(channel) => (now - channel.last_update_time).max(0.0),
            None => self.spawn_priority_seconds as f64,
        };

        let mut scale = 1.0f32;
        if id == ctx.controller
            || id == ctx.viewer
            || Some(id) == ctx.viewer_pawn
            || entity.instigator == Some(ctx.viewer)
        {
            scale *= SELF_BOOST;
        }
        if !entity.flags.hidden {
            scale *= direction_scale(world, entity, ctx);
        }

        (PRIORITY_SCALE * entity.net_priority as f64 * elapsed * scale as f64).round() as i64
    }

    pub fn record(
        &self,
        world: &EntityTable,
        id: EntityId,
        entity: &Entity,
        channel: Option<&Channel>,
        ctx: &ViewerContext,
        now: f64,
    ) -> PriorityRecord {
        PriorityRecord {
            priority: self.compute(world, id, entity, channel, ctx, now),
            entity: id,
            has_channel: channel.is_some(),
        }
    }
}

/// View-alignment and distance shaping
fn direction_scale(world: &EntityTable, entity: &Entity, ctx: &ViewerContext) -> f32 {
    let Some(position) = entity.position else {
        return 1.0;
    };
    let dir = position - ctx.view_position;
    let dist_sq = dir.length_sq();
    let behind = ctx.view_direction.dot(dir) < 0.0;
    let mut scale = 1.0f32;

    if behind {
        if dist_sq > BEHIND_FAR_SQ {
            scale *= if ctx.low_bandwidth {
                BEHIND_FAR_SCALE_LOW_BANDWIDTH
            } else {
                BEHIND_FAR_SCALE
            };
        } else if dist_sq > BEHIND_NEAR_SQ {
            scale *= BEHIND_NEAR_SCALE;
        }
    }
    if !ctx.low_bandwidth {
        return scale;
    }

    let in_view = !behind && ctx.view_direction.dot(dir.safe_normal()) > IN_VIEW_COS;
    match entity.relevancy_category() {
        RelevancyCategory::Pawn | RelevancyCategory::Vehicle => {
            if in_view || (behind && drives_connection_vehicle(world, entity, ctx)) {
                scale *= IN_VIEW_BOOST;
            }
            if dist_sq > BODY_FAR_SQ {
                scale *= BODY_FAR_SCALE;
            }
        }
        RelevancyCategory::Projectile => {
            if in_view {
                scale *= IN_VIEW_BOOST;
            }
            if dist_sq > PROJECTILE_FAR_SQ {
                scale *= PROJECTILE_FAR_SCALE;
            }
        }
        _ => {
            if dist_sq > GENERIC_FAR_SQ {
                scale *= GENERIC_FAR_SCALE;
            } else if entity.base.is_some() && entity.base == ctx.viewer_pawn {
                scale *= RIDING_VIEWER_BOOST;
            }
        }
    }
    scale
}

/// Body driving a vehicle that this connection's controller is in charge of
fn drives_connection_vehicle(world: &EntityTable, entity: &Entity, ctx: &ViewerContext) -> bool {
    let Some(vehicle) = entity.body().and_then(|b| b.driven_vehicle) else {
        return false;
    };
    match world.get(vehicle).map(|v| &v.kind) {
        Some(EntityKind::Vehicle(body)) => body.controller == Some(ctx.controller),
        _ => false,
    }
}
