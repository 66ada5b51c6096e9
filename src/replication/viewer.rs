//! Per-connection viewpoint resolution
//!
//! Decides whether a connection has a viewer this tick and, if so, where its
//! relevancy queries originate and how its priorities should be shaped.

use crate::config::SchedulerConfig;
use crate::net::connection::{ClientConnection, ConnectionId};
use crate::util::vec3::Vec3;
use crate::world::entity::{EntityId, EntityKind};
use crate::world::occlusion::OcclusionQuery;
use crate::world::table::EntityTable;

/// Look-ahead on ticks where bit 1 of the tick count is set (seconds)
const SHORT_PREDICTION_SECONDS: f32 = 0.4;

/// Look-ahead on the remaining odd ticks (seconds)
const LONG_PREDICTION_SECONDS: f32 = 0.9;

/// Everything one connection's pass needs to know about its viewer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewerContext {
    pub connection: ConnectionId,
    /// The connection's player controller
    pub controller: EntityId,
    /// Entity whose eyes define the viewpoint
    pub viewer: EntityId,
    /// Body possessed by the controller, if any
    pub viewer_pawn: Option<EntityId>,
    /// Un-predicted viewer location (priority shaping)
    pub view_position: Vec3,
    /// Unit view direction
    pub view_direction: Vec3,
    /// Eye point, possibly pushed ahead (relevancy queries)
    pub relevancy_origin: Vec3,
    pub low_bandwidth: bool,
}

impl ViewerContext {
    /// Resolve the viewer for this tick.
    ///
    /// Returns `None` (nothing to do this tick) unless the connection is open,
    /// its controller still exists, its transport accepts a zero-byte probe
    /// and the client was heard from within the receive timeout. Bumps the
    /// connection's tick count when a viewer is found.
    pub fn resolve(
        conn: &mut ClientConnection,
        world: &EntityTable,
        config: &SchedulerConfig,
        occlusion: &dyn OcclusionQuery,
        now: f64,
        player_count: usize,
    ) -> Option<Self> {
        if !conn.is_open() {
            return None;
        }
        let controller = conn.controller.filter(|c| world.contains(*c))?;
        if !conn.is_ready(0) {
            return None;
        }
        if now - conn.last_receive_time >= config.receive_timeout as f64 {
            return None;
        }

        let viewer = world.view_target(controller)?;
        let viewer_entity = world.get(viewer)?;
        let controller_entity = world.get(controller)?;

        let view_direction = match controller_entity.kind {
            EntityKind::Controller { view_direction, .. } => view_direction.safe_normal(),
            _ => Vec3::ZERO,
        };
        let view_direction = if view_direction == Vec3::ZERO {
            Vec3::FORWARD
        } else {
            view_direction
        };

        let view_position = viewer_entity
            .position
            .or(controller_entity.position)
            .unwrap_or(Vec3::ZERO);

        conn.tick_count += 1;

        let eye = view_position + viewer_entity.occludee_offset();
        let mut relevancy_origin = eye;
        if config.viewpoint_prediction && conn.tick_count & 1 == 1 {
            let predict = if conn.tick_count & 2 != 0 {
                SHORT_PREDICTION_SECONDS
            } else {
                LONG_PREDICTION_SECONDS
            };
            let mut ahead = viewer_entity.velocity * predict;
            if let Some(base) = viewer_entity.base.and_then(|b| world.get(b)) {
                ahead += base.velocity * predict;
            }
            if ahead != Vec3::ZERO {
                relevancy_origin = occlusion.trace(eye, eye + ahead);
            }
        }

        let per_player = conn.current_net_speed as f32 / player_count.max(1) as f32;
        let low_bandwidth = per_player < config.low_bandwidth_threshold() || conn.was_saturated;

        Some(Self {
            connection: conn.id,
            controller,
            viewer,
            viewer_pawn: world.controlled_pawn(controller),
            view_position,
            view_direction,
            relevancy_origin,
            low_bandwidth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::ThrottledTransport;
    use crate::world::entity::Entity;
    use crate::world::occlusion::{Aabb, BoxOccluders, OpenSpace};

    fn setup(net_speed: u32) -> (EntityTable, ClientConnection, EntityId, EntityId) {
        let mut world = EntityTable::new();
        let mut pawn = Entity::pawn(2, 50.0).at(Vec3::new(0.0, 0.0, 0.0));
        pawn.velocity = Vec3::new(100.0, 0.0, 0.0);
        let pawn_id = world.spawn(pawn);
        let pc = world.spawn(Entity::controller(1, Some(pawn_id)));
        let mut conn = ClientConnection::new(1, Box::new(ThrottledTransport::new(net_speed, 40)), net_speed);
        conn.join(pc, 0.0);
        (world, conn, pc, pawn_id)
    }

    fn config(prediction: bool) -> SchedulerConfig {
        SchedulerConfig {
            viewpoint_prediction: prediction,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn test_resolves_pawn_eye() {
        let (world, mut conn, pc, pawn) = setup(20_000);
        let ctx = ViewerContext::resolve(&mut conn, &world, &config(false), &OpenSpace, 0.5, 1).unwrap();
        assert_eq!(ctx.controller, pc);
        assert_eq!(ctx.viewer, pawn);
        assert_eq!(ctx.viewer_pawn, Some(pawn));
        assert_eq!(ctx.relevancy_origin, Vec3::new(0.0, 0.0, 50.0));
        assert_eq!(ctx.view_direction, Vec3::FORWARD);
        assert!(!ctx.low_bandwidth);
        assert_eq!(conn.tick_count, 1);
    }

    #[test]
    fn test_no_viewer_when_silent() {
        let (world, mut conn, _, _) = setup(20_000);
        assert!(ViewerContext::resolve(&mut conn, &world, &config(false), &OpenSpace, 2.0, 1).is_none());
        assert_eq!(conn.tick_count, 0);
    }

    #[test]
    fn test_no_viewer_without_controller() {
        let (mut world, mut conn, pc, _) = setup(20_000);
        world.despawn(pc);
        assert!(ViewerContext::resolve(&mut conn, &world, &config(false), &OpenSpace, 0.1, 1).is_none());
    }

    #[test]
    fn test_prediction_on_odd_ticks() {
        let (world, mut conn, _, _) = setup(20_000);
        let cfg = config(true);

        // tick 1: bit 1 clear -> long look-ahead
        let first = ViewerContext::resolve(&mut conn, &world, &cfg, &OpenSpace, 0.1, 1).unwrap();
        assert!((first.relevancy_origin.x - 90.0).abs() < 0.01);
        // tick 2: even -> no prediction
        let second = ViewerContext::resolve(&mut conn, &world, &cfg, &OpenSpace, 0.2, 1).unwrap();
        assert_eq!(second.relevancy_origin.x, 0.0);
        // tick 3: bit 1 set -> short look-ahead
        let third = ViewerContext::resolve(&mut conn, &world, &cfg, &OpenSpace, 0.3, 1).unwrap();
        assert!((third.relevancy_origin.x - 40.0).abs() < 0.01);
        // priority position never moves
        assert_eq!(third.view_position, Vec3::ZERO);
    }

    #[test]
    fn test_prediction_clamped_by_geometry() {
        let (world, mut conn, _, _) = setup(20_000);
        let wall = BoxOccluders::new(vec![Aabb::new(
            Vec3::new(20.0, -100.0, -100.0),
            Vec3::new(30.0, 100.0, 200.0),
        )]);
        let ctx = ViewerContext::resolve(&mut conn, &world, &config(true), &wall, 0.1, 1).unwrap();
        assert!(ctx.relevancy_origin.x < 20.0);
    }

    #[test]
    fn test_low_bandwidth_per_player() {
        let (world, mut conn, _, _) = setup(2_000);
        // 2000 / 10 players = 200 < 300
        let ctx = ViewerContext::resolve(&mut conn, &world, &config(false), &OpenSpace, 0.1, 10).unwrap();
        assert!(ctx.low_bandwidth);
    }

    #[test]
    fn test_saturation_forces_low_bandwidth() {
        let (world, mut conn, _, _) = setup(20_000);
        conn.was_saturated = true;
        let ctx = ViewerContext::resolve(&mut conn, &world, &config(false), &OpenSpace, 0.1, 1).unwrap();
        assert!(ctx.low_bandwidth);
    }
}
