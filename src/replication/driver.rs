//! Replication driver
//!
//! Owns the connection table and the per-tick machinery, and runs one full
//! scheduling tick on request:
//!
//! 1. advance every transport by the tick delta
//! 2. flush dirty entities onto channels
//! 3. resolve each connection's viewer
//! 4. build the global and owned candidate lists
//! 5. run one replication pass per connection that has a viewer
//!
//! Everything runs on the caller's thread; nothing here blocks or awaits.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::DriverError;
use crate::net::connection::{ClientConnection, ConnectionId};
use crate::replication::candidates::{CandidateListBuilder, TickScratch};
use crate::replication::dirty::DirtyTracker;
use crate::replication::relevancy::RelevancyOracle;
use crate::replication::scheduler::ReplicationScheduler;
use crate::replication::stats::TickStats;
use crate::replication::viewer::ViewerContext;
use crate::world::clock::SimClock;
use crate::world::entity::EntityId;
use crate::world::occlusion::OcclusionQuery;
use crate::world::table::EntityTable;

/// Saturation is reported as a rate over this window (seconds)
const SATURATION_LOG_INTERVAL: f64 = 1.0;

pub struct ReplicationDriver {
    config: SchedulerConfig,
    /// Processed in insertion order every tick
    connections: Vec<ClientConnection>,
    dirty: DirtyTracker,
    oracle: RelevancyOracle,
    scheduler: ReplicationScheduler,
    scratch: TickScratch,
    rng: StdRng,
    window_start: f64,
    window_passes: usize,
    window_saturated: usize,
}

impl ReplicationDriver {
    pub fn new(config: SchedulerConfig) -> Self {
        let rng = match config.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            oracle: RelevancyOracle::new(config.max_relevancy_distance_sq()),
            scheduler: ReplicationScheduler::new(&config),
            config,
            connections: Vec::new(),
            dirty: DirtyTracker::new(),
            scratch: TickScratch::new(),
            rng,
            window_start: 0.0,
            window_passes: 0,
            window_saturated: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ========================================================================
    // Lifecycle hooks
    // ========================================================================

    /// Start scheduling for a connection (its channel table starts empty)
    pub fn on_connection_opened(&mut self, conn: ClientConnection) -> Result<(), DriverError> {
        if self.connections.iter().any(|c| c.id == conn.id) {
            return Err(DriverError::DuplicateConnection(conn.id));
        }
        info!("Replication connection {} opened (controller {:?})", conn.id, conn.controller);
        self.connections.push(conn);
        Ok(())
    }

    /// Stop scheduling for a connection and tear down its channels
    pub fn on_connection_closed(&mut self, id: ConnectionId) -> Result<ClientConnection, DriverError> {
        let index = self
            .connections
            .iter()
            .position(|c| c.id == id)
            .ok_or(DriverError::UnknownConnection(id))?;
        let mut conn = self.connections.remove(index);
        let dropped = conn.close();
        info!(
            "Replication connection {} closed ({} channels dropped, {} updates sent)",
            id, dropped, conn.replicated_total
        );
        Ok(conn)
    }

    /// Close every connection's channel to a destroyed entity; returns channels closed
    pub fn on_entity_destroyed(&mut self, id: EntityId) -> usize {
        let closed = self
            .connections
            .iter_mut()
            .filter_map(|conn| conn.channels_mut().close(id))
            .count();
        if closed > 0 {
            debug!("Entity {} destroyed, closed {} channels", id, closed);
        }
        closed
    }

    /// Record that a replicated property of `id` changed
    pub fn mark_dirty(&mut self, world: &mut EntityTable, id: EntityId) -> Result<(), DriverError> {
        if self.dirty.mark_dirty(world, id) {
            Ok(())
        } else {
            Err(DriverError::UnknownEntity(id))
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ClientConnection> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut ClientConnection> {
        self.connections.iter_mut().find(|c| c.id == id)
    }

    pub fn connections(&self) -> &[ClientConnection] {
        &self.connections
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Full relevancy evaluations since startup
    pub fn relevancy_queries(&self) -> u64 {
        self.oracle.queries()
    }

    /// Relevancy answers served from the per-tick memo since startup
    pub fn relevancy_cache_hits(&self) -> u64 {
        self.oracle.cache_hits()
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Run one scheduling tick at `clock.now()`
    pub fn tick(
        &mut self,
        world: &mut EntityTable,
        occlusion: &dyn OcclusionQuery,
        clock: &SimClock,
    ) -> TickStats {
        let now = clock.now();
        let mut stats = TickStats::new(now);

        for conn in &mut self.connections {
            conn.transport_mut().advance(clock.delta());
        }

        stats.absorb_flush(self.dirty.flush(world, &mut self.connections));
        self.oracle.begin_tick();
        self.scratch.reset(self.connections.len());

        let player_count = world.player_count();
        let TickScratch {
            viewers,
            global,
            owned,
            pass,
        } = &mut self.scratch;

        for conn in &mut self.connections {
            viewers.push(ViewerContext::resolve(
                conn,
                world,
                &self.config,
                occlusion,
                now,
                player_count,
            ));
        }

        let candidates = CandidateListBuilder::build(
            world,
            now,
            clock.server_tick_time(),
            viewers,
            global,
            owned,
            &mut self.rng,
        );
        stats.absorb_candidates(candidates);

        for (slot, conn) in self.connections.iter_mut().enumerate() {
            let Some(ctx) = viewers[slot] else {
                stats.connections_skipped += 1;
                continue;
            };
            let outcome = self.scheduler.run_pass(
                conn,
                &ctx,
                world,
                global,
                &owned[slot],
                &mut self.oracle,
                occlusion,
                pass,
                &mut self.rng,
                now,
            );
            stats.absorb(&outcome);
        }

        self.report_saturation(&stats, now);
        stats
    }

    /// Log saturated passes as a rate, at most once per window
    fn report_saturation(&mut self, stats: &TickStats, now: f64) {
        self.window_passes += stats.connections_serviced;
        self.window_saturated += stats.saturated_connections;

        let elapsed = now - self.window_start;
        if elapsed < SATURATION_LOG_INTERVAL {
            return;
        }
        if self.window_saturated > 0 {
            let ratio = self.window_saturated as f64 / self.window_passes.max(1) as f64;
            if ratio > 0.5 {
                warn!(
                    "{}/{} replication passes saturated over {:.1}s",
                    self.window_saturated, self.window_passes, elapsed
                );
            } else {
                debug!(
                    "{}/{} replication passes saturated over {:.1}s",
                    self.window_saturated, self.window_passes, elapsed
                );
            }
        }
        self.window_start = now;
        self.window_passes = 0;
        self.window_saturated = 0;
    }
}

impl std::fmt::Debug for ReplicationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationDriver")
            .field("connections", &self.connections.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionState;
    use crate::replication::test_support::*;
    use crate::util::vec3::Vec3;
    use crate::world::entity::{Entity, ReplicationFlags};
    use crate::world::occlusion::{Aabb, BoxOccluders, OpenSpace};

    fn driver() -> ReplicationDriver {
        ReplicationDriver::new(test_config())
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let mut world = EntityTable::new();
        let (pc, _) = spawn_player(&mut world, Vec3::ZERO);
        let mut driver = driver();
        driver.on_connection_opened(scripted_connection(1, pc, None).0).unwrap();
        assert_eq!(
            driver.on_connection_opened(scripted_connection(1, pc, None).0),
            Err(DriverError::DuplicateConnection(1))
        );
        assert_eq!(driver.connection_count(), 1);
    }

    #[test]
    fn test_close_unknown_and_known() {
        let mut world = EntityTable::new();
        let (pc, _) = spawn_player(&mut world, Vec3::ZERO);
        let target = world.spawn(generic_at(100.0));
        let mut driver = driver();
        assert_eq!(driver.on_connection_closed(9).unwrap_err(), DriverError::UnknownConnection(9));

        driver.on_connection_opened(scripted_connection(1, pc, None).0).unwrap();
        driver.tick(&mut world, &OpenSpace, &clock_at(1));
        assert!(driver.connection(1).unwrap().channels().contains(target));

        let closed = driver.on_connection_closed(1).unwrap();
        assert_eq!(closed.state, ConnectionState::Closed);
        assert!(closed.channels().is_empty());
        assert!(driver.connection(1).is_none());
    }

    #[test]
    fn test_mark_dirty_unknown_entity() {
        let mut world = EntityTable::new();
        let mut driver = driver();
        assert_eq!(
            driver.mark_dirty(&mut world, EntityId::new(3, 0)),
            Err(DriverError::UnknownEntity(EntityId::new(3, 0)))
        );
    }

    #[test]
    fn test_dirty_clears_on_send_and_reflags() {
        let mut world = EntityTable::new();
        let (pc, _) = spawn_player(&mut world, Vec3::ZERO);
        let id = world.spawn(generic_at(100.0));
        let mut driver = driver();
        let (conn, log) = scripted_connection(1, pc, None);
        driver.on_connection_opened(conn).unwrap();

        driver.tick(&mut world, &OpenSpace, &clock_at(1));
        assert!(!driver.connection(1).unwrap().channels().get(id).unwrap().dirty);
        let sent_once = log.replicated().iter().filter(|e| **e == id).count();
        assert_eq!(sent_once, 1);

        // Unchanged: clean-skipped, not resent
        let stats = driver.tick(&mut world, &OpenSpace, &clock_at(2));
        assert!(stats.clean_skipped >= 1);
        assert_eq!(log.replicated().iter().filter(|e| **e == id).count(), 1);

        driver.mark_dirty(&mut world, id).unwrap();
        let stats = driver.tick(&mut world, &OpenSpace, &clock_at(3));
        assert_eq!(stats.dirty_channels, 1);
        assert_eq!(log.replicated().iter().filter(|e| **e == id).count(), 2);
        assert!(!driver.connection(1).unwrap().channels().get(id).unwrap().dirty);
    }

    #[test]
    fn test_missing_viewer_leaves_channels_untouched() {
        let mut world = EntityTable::new();
        let (pc, _) = spawn_player(&mut world, Vec3::ZERO);
        let id = world.spawn(generic_at(100.0));
        let mut driver = driver();
        let (mut conn, log) = scripted_connection(1, pc, None);
        conn.channels_mut().open(id, 0.0, 1.0);
        conn.controller = None;
        driver.on_connection_opened(conn).unwrap();

        for tick in 1..=100 {
            let stats = driver.tick(&mut world, &OpenSpace, &clock_at(tick));
            assert_eq!(stats.connections_skipped, 1);
            assert_eq!(stats.connections_serviced, 0);
        }
        let conn = driver.connection(1).unwrap();
        assert!(conn.channels().contains(id));
        assert_eq!(conn.tick_count, 0);
        assert!(log.replicated().is_empty());
    }

    #[test]
    fn test_far_occluded_entity_never_scheduled() {
        let mut world = EntityTable::new();
        let (pc, _) = spawn_player(&mut world, Vec3::ZERO);
        let far = world.spawn(Entity::generic(GENERIC_CLASS).at(Vec3::new(1e6, 0.0, 0.0)).with_frequency(10.0));
        let wall = BoxOccluders::new(vec![Aabb::new(
            Vec3::new(500.0, -1e7, -1e7),
            Vec3::new(600.0, 1e7, 1e7),
        )]);
        let mut driver = driver();
        let (conn, log) = scripted_connection(1, pc, None);
        driver.on_connection_opened(conn).unwrap();

        for tick in 1..=50 {
            driver.tick(&mut world, &wall, &clock_at(tick));
        }
        assert!(!log.replicated().contains(&far));
        assert!(!driver.connection(1).unwrap().channels().contains(far));
    }

    #[test]
    fn test_backpressure_recovers_over_ticks() {
        let mut world = EntityTable::new();
        let (pc, _) = spawn_player(&mut world, Vec3::ZERO);
        let ids: Vec<_> = (0..10).map(|i| world.spawn(generic_at(100.0 + i as f32))).collect();
        let mut driver = driver();
        let (conn, _log) = scripted_connection(1, pc, Some(3));
        driver.on_connection_opened(conn).unwrap();

        let first = driver.tick(&mut world, &OpenSpace, &clock_at(1));
        assert_eq!(first.replicated, 3);
        assert_eq!(first.saturated_connections, 1);
        assert!(driver.connection(1).unwrap().was_saturated);

        for tick in 2..=6 {
            driver.tick(&mut world, &OpenSpace, &clock_at(tick));
        }
        let conn = driver.connection(1).unwrap();
        for id in ids {
            assert!(conn.channels().get(id).is_some_and(|c| c.has_sent), "{} starved", id);
        }
    }

    #[test]
    fn test_at_most_one_channel_per_entity() {
        let mut world = EntityTable::new();
        let (pc_a, pawn_a) = spawn_player(&mut world, Vec3::ZERO);
        let (pc_b, _) = spawn_player(&mut world, Vec3::new(200.0, 0.0, 0.0));
        let owner_only = ReplicationFlags {
            only_relevant_to_owner: true,
            ..ReplicationFlags::default()
        };
        world.spawn(generic_at(50.0).with_owner(pawn_a).with_flags(owner_only));
        for i in 0..5 {
            world.spawn(generic_at(300.0 + 10.0 * i as f32));
        }
        let mut driver = driver();
        driver.on_connection_opened(scripted_connection(1, pc_a, Some(2)).0).unwrap();
        driver.on_connection_opened(scripted_connection(2, pc_b, Some(2)).0).unwrap();

        for tick in 1..=30 {
            if tick % 3 == 0 {
                let ids: Vec<_> = world.iter().map(|(id, _)| id).collect();
                for id in ids {
                    driver.mark_dirty(&mut world, id).unwrap();
                }
            }
            driver.tick(&mut world, &OpenSpace, &clock_at(tick));
        }
        for conn in driver.connections() {
            let mut seen: Vec<_> = conn.channels().iter().map(|c| c.entity).collect();
            let total = seen.len();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), total);
            assert_eq!(conn.channels().opened_total(), total as u64);
        }
    }

    #[test]
    fn test_entity_destroyed_closes_everywhere() {
        let mut world = EntityTable::new();
        let (pc_a, _) = spawn_player(&mut world, Vec3::ZERO);
        let (pc_b, _) = spawn_player(&mut world, Vec3::new(10.0, 0.0, 0.0));
        let id = world.spawn(generic_at(100.0));
        let mut driver = driver();
        driver.on_connection_opened(scripted_connection(1, pc_a, None).0).unwrap();
        driver.on_connection_opened(scripted_connection(2, pc_b, None).0).unwrap();
        driver.tick(&mut world, &OpenSpace, &clock_at(1));

        world.despawn(id);
        assert_eq!(driver.on_entity_destroyed(id), 2);
        assert_eq!(driver.on_entity_destroyed(id), 0);
        // The recycled slot gets a fresh channel; the old handle stays closed
        let successor = world.spawn(generic_at(200.0));
        assert_eq!(successor.index(), id.index());
        driver.tick(&mut world, &OpenSpace, &clock_at(2));
        assert!(driver.connections().iter().all(|c| !c.channels().contains(id)));
        assert!(driver.connections().iter().all(|c| c.channels().contains(successor)));
    }

    #[test]
    fn test_carried_weapon_reuses_holder_relevancy() {
        let mut world = EntityTable::new();
        let (pc_a, _) = spawn_player(&mut world, Vec3::ZERO);
        let (_, pawn_b) = spawn_player(&mut world, Vec3::new(300.0, 0.0, 0.0));
        let gun = world.spawn(Entity::weapon(GENERIC_CLASS).with_instigator(pawn_b));
        if let Some(body) = world.get_mut(pawn_b).and_then(Entity::body_mut) {
            body.weapon = Some(gun);
            body.replicate_weapon = true;
        }
        let mut driver = driver();
        driver.on_connection_opened(scripted_connection(1, pc_a, None).0).unwrap();
        driver.tick(&mut world, &OpenSpace, &clock_at(1));

        let conn = driver.connection(1).unwrap();
        assert!(conn.channels().contains(gun));
        assert!(conn.channels().contains(pawn_b));
        // Gun and holder resolve through one evaluation of the holder
        assert!(driver.relevancy_cache_hits() > 0);
    }

    #[test]
    fn test_owner_only_reaches_owner_connection_only() {
        let mut world = EntityTable::new();
        let (pc_a, pawn_a) = spawn_player(&mut world, Vec3::ZERO);
        let (pc_b, _) = spawn_player(&mut world, Vec3::new(10.0, 0.0, 0.0));
        let owner_only = ReplicationFlags {
            only_relevant_to_owner: true,
            ..ReplicationFlags::default()
        };
        let item = world.spawn(generic_at(5.0).with_owner(pawn_a).with_flags(owner_only));
        let mut driver = driver();
        driver.on_connection_opened(scripted_connection(1, pc_a, None).0).unwrap();
        driver.on_connection_opened(scripted_connection(2, pc_b, None).0).unwrap();
        driver.tick(&mut world, &OpenSpace, &clock_at(1));

        assert!(driver.connection(1).unwrap().channels().contains(item));
        assert!(!driver.connection(2).unwrap().channels().contains(item));
        // Each controller only reaches its own connection
        assert!(driver.connection(1).unwrap().channels().contains(pc_a));
        assert!(!driver.connection(1).unwrap().channels().contains(pc_b));
    }
}
