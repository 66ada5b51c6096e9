//! Scripted collaborators and world builders for replication tests

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::config::SchedulerConfig;
use crate::net::channel::Channel;
use crate::net::connection::ClientConnection;
use crate::net::transport::Transport;
use crate::util::vec3::Vec3;
use crate::world::clock::SimClock;
use crate::world::entity::{ClassId, Entity, EntityId, ReplicationFlags};
use crate::world::occlusion::OcclusionQuery;
use crate::world::table::EntityTable;

pub(crate) const CONTROLLER_CLASS: ClassId = 1;
pub(crate) const PAWN_CLASS: ClassId = 2;
pub(crate) const GENERIC_CLASS: ClassId = 3;

pub(crate) const TICK_DELTA: f32 = 0.1;
pub(crate) const SCRIPTED_UPDATE_BYTES: usize = 40;

/// Eligible on every tick at `TICK_DELTA`
const FAST_FREQUENCY: f32 = 100.0;

/// Deterministic config: no jitter, no prediction, generous receive timeout
pub(crate) fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        relevant_time_jitter: 0.0,
        viewpoint_prediction: false,
        receive_timeout: 1_000.0,
        jitter_seed: Some(7),
        ..SchedulerConfig::default()
    }
}

/// Throttle jitter bound stays far below one tick
const TEST_TICK_RATE: f32 = 1_000.0;

pub(crate) fn clock_at(tick: u32) -> SimClock {
    SimClock::at(tick as f64 * TICK_DELTA as f64, TICK_DELTA, TEST_TICK_RATE)
}

pub(crate) fn generic_at(x: f32) -> Entity {
    Entity::generic(GENERIC_CLASS)
        .at(Vec3::new(x, 0.0, 0.0))
        .with_frequency(FAST_FREQUENCY)
}

/// Controller possessing a pawn at `at`; returns (controller, pawn)
pub(crate) fn spawn_player(world: &mut EntityTable, at: Vec3) -> (EntityId, EntityId) {
    let pawn = world.spawn(Entity::pawn(PAWN_CLASS, 50.0).at(at).with_frequency(FAST_FREQUENCY));
    let owner_only = ReplicationFlags {
        only_relevant_to_owner: true,
        ..ReplicationFlags::default()
    };
    let controller = world.spawn(
        Entity::controller(CONTROLLER_CLASS, Some(pawn))
            .with_flags(owner_only)
            .with_frequency(FAST_FREQUENCY),
    );
    if let Some(entity) = world.get_mut(pawn) {
        entity.owner = Some(controller);
        if let Some(body) = entity.body_mut() {
            body.controller = Some(controller);
        }
    }
    (controller, pawn)
}

#[derive(Debug, Default)]
struct LogState {
    replicated: Vec<EntityId>,
    sent_this_tick: usize,
    blocked: Vec<EntityId>,
}

/// Shared view of what a `ScriptedTransport` did
#[derive(Debug, Clone, Default)]
pub(crate) struct TransportLog(Rc<RefCell<LogState>>);

impl TransportLog {
    /// Every entity replicated so far, in order
    pub(crate) fn replicated(&self) -> Vec<EntityId> {
        self.0.borrow().replicated.clone()
    }

    /// Refill capacity without a driver advancing the transport
    pub(crate) fn begin_tick(&self) {
        self.0.borrow_mut().sent_this_tick = 0;
    }

    /// Report this entity's channel as not ready
    pub(crate) fn block_channel(&self, id: EntityId) {
        self.0.borrow_mut().blocked.push(id);
    }
}

/// Accepts `capacity` replications per tick (unbounded if `None`)
pub(crate) struct ScriptedTransport {
    capacity: Option<usize>,
    log: TransportLog,
}

impl ScriptedTransport {
    pub(crate) fn new(capacity: Option<usize>) -> (Self, TransportLog) {
        let log = TransportLog::default();
        (
            Self {
                capacity,
                log: log.clone(),
            },
            log,
        )
    }
}

impl Transport for ScriptedTransport {
    fn is_ready(&self, _bytes_hint: usize) -> bool {
        self.capacity
            .map_or(true, |capacity| self.log.0.borrow().sent_this_tick < capacity)
    }

    fn channel_ready(&self, channel: &Channel) -> bool {
        !self.log.0.borrow().blocked.contains(&channel.entity)
    }

    fn replicate(&mut self, id: EntityId, _entity: &Entity, _channel: &Channel) -> usize {
        let mut state = self.log.0.borrow_mut();
        state.replicated.push(id);
        state.sent_this_tick += 1;
        SCRIPTED_UPDATE_BYTES
    }

    fn advance(&mut self, _delta: f32) {
        self.log.begin_tick();
    }
}

/// Joined connection over a scripted transport
pub(crate) fn scripted_connection(
    id: u64,
    controller: EntityId,
    capacity: Option<usize>,
) -> (ClientConnection, TransportLog) {
    let (transport, log) = ScriptedTransport::new(capacity);
    let mut conn = ClientConnection::new(id, Box::new(transport), 20_000);
    conn.join(controller, 0.0);
    (conn, log)
}

/// Counts line-of-sight queries made against the wrapped geometry
pub(crate) struct CountingOcclusion<O> {
    inner: O,
    calls: Cell<usize>,
}

impl<O: OcclusionQuery> CountingOcclusion<O> {
    pub(crate) fn new(inner: O) -> Self {
        Self {
            inner,
            calls: Cell::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl<O: OcclusionQuery> OcclusionQuery for CountingOcclusion<O> {
    fn has_unobstructed_line(&self, from: Vec3, to: Vec3) -> bool {
        self.calls.set(self.calls.get() + 1);
        self.inner.has_unobstructed_line(from, to)
    }

    fn trace(&self, from: Vec3, to: Vec3) -> Vec3 {
        self.inner.trace(from, to)
    }
}
