use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relevance_server::config::SchedulerConfig;
use relevance_server::metrics::{self, Metrics};
use relevance_server::net::{ClientConnection, ConnectionId, ThrottledTransport};
use relevance_server::replication::ReplicationDriver;
use relevance_server::util::vec3::Vec3;
use relevance_server::world::clock::SimClock;
use relevance_server::world::entity::{ClassId, Entity, EntityId, EntityKind, ReplicationFlags};
use relevance_server::world::occlusion::{Aabb, BoxOccluders};
use relevance_server::world::table::EntityTable;

// Synthetic world classes
const CONTROLLER_CLASS: ClassId = 1;
const PAWN_CLASS: ClassId = 2;
const PROP_CLASS: ClassId = 3;
const PROJECTILE_CLASS: ClassId = 4;
const GAME_STATE_CLASS: ClassId = 5;

/// Half-width of the square arena (world units)
const ARENA_HALF_EXTENT: f32 = 8_000.0;
const PAWN_EYE_HEIGHT: f32 = 64.0;
const PAWN_SPEED: f32 = 400.0;
const PROJECTILE_SPEED: f32 = 2_500.0;
const OCCLUDER_COUNT: usize = 40;
const ALWAYS_RELEVANT_COUNT: usize = 4;

/// Bytes charged per steady-state update by the host transport
const BYTES_PER_UPDATE: usize = 48;

const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

/// Host loop rate when the config leaves the tick rate uncapped
const UNCAPPED_HOST_RATE: f32 = 60.0;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Random arena position at ground level
fn random_position(rng: &mut StdRng) -> Vec3 {
    Vec3::new(
        rng.gen_range(-ARENA_HALF_EXTENT..ARENA_HALF_EXTENT),
        rng.gen_range(-ARENA_HALF_EXTENT..ARENA_HALF_EXTENT),
        0.0,
    )
}

fn random_heading(rng: &mut StdRng, speed: f32) -> Vec3 {
    Vec3::from_yaw_pitch(rng.gen_range(0.0..std::f32::consts::TAU), 0.0) * speed
}

/// Populate the world; returns the player controllers
fn build_world(
    world: &mut EntityTable,
    rng: &mut StdRng,
    players: usize,
    props: usize,
) -> Vec<EntityId> {
    let mut controllers = Vec::with_capacity(players);

    for _ in 0..players {
        let mut pawn = Entity::pawn(PAWN_CLASS, PAWN_EYE_HEIGHT)
            .at(random_position(rng))
            .with_frequency(20.0)
            .with_priority(2.0);
        pawn.velocity = random_heading(rng, PAWN_SPEED);
        let pawn = world.spawn(pawn);

        let owner_only = ReplicationFlags {
            only_relevant_to_owner: true,
            ..ReplicationFlags::default()
        };
        let controller = world.spawn(
            Entity::controller(CONTROLLER_CLASS, Some(pawn))
                .with_flags(owner_only)
                .with_priority(3.0),
        );
        if let Some(entity) = world.get_mut(pawn) {
            entity.owner = Some(controller);
            if let Some(body) = entity.body_mut() {
                body.controller = Some(controller);
            }
        }
        controllers.push(controller);
    }

    for _ in 0..props {
        let mut prop = Entity::generic(PROP_CLASS).at(random_position(rng));
        if rng.gen_bool(0.3) {
            let speed = rng.gen_range(20.0..200.0);
            prop.velocity = random_heading(rng, speed);
        }
        world.spawn(prop);
    }

    // Projectiles fired by random players
    for _ in 0..props / 10 {
        let Some(&shooter) = controllers.get(rng.gen_range(0..controllers.len().max(1))) else {
            break;
        };
        let mut projectile = Entity::projectile(PROJECTILE_CLASS)
            .at(random_position(rng))
            .with_instigator(shooter)
            .with_frequency(30.0);
        projectile.velocity = random_heading(rng, PROJECTILE_SPEED);
        world.spawn(projectile);
    }

    let always = ReplicationFlags {
        always_relevant: true,
        ..ReplicationFlags::default()
    };
    for _ in 0..ALWAYS_RELEVANT_COUNT {
        world.spawn(Entity::generic(GAME_STATE_CLASS).with_flags(always).with_frequency(1.0));
    }

    controllers
}

fn build_occluders(rng: &mut StdRng) -> BoxOccluders {
    let boxes = (0..OCCLUDER_COUNT)
        .map(|_| {
            let half = Vec3::new(
                rng.gen_range(100.0..600.0),
                rng.gen_range(100.0..600.0),
                rng.gen_range(200.0..800.0),
            );
            Aabb::from_center(random_position(rng), half)
        })
        .collect();
    BoxOccluders::new(boxes)
}

/// Integrate motion, bounce off the arena walls, and collect moved entities
fn step_world(world: &mut EntityTable, delta: f32, moved: &mut Vec<EntityId>) {
    moved.clear();
    for (id, entity) in world.iter_mut() {
        let Some(position) = entity.position else {
            continue;
        };
        if entity.velocity.length_sq() == 0.0 {
            continue;
        }
        let mut next = position + entity.velocity * delta;
        if next.x.abs() > ARENA_HALF_EXTENT {
            entity.velocity.x = -entity.velocity.x;
            next.x = next.x.clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
        }
        if next.y.abs() > ARENA_HALF_EXTENT {
            entity.velocity.y = -entity.velocity.y;
            next.y = next.y.clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
        }
        entity.position = Some(next);
        moved.push(id);
    }

    // Controllers look where their pawn is heading
    let headings: Vec<(EntityId, Vec3)> = world
        .iter()
        .filter_map(|(id, entity)| match entity.kind {
            EntityKind::Controller { pawn: Some(pawn), .. } => world
                .get(pawn)
                .map(|p| (id, p.velocity.safe_normal()))
                .filter(|(_, dir)| dir.length_sq() > 0.0),
            _ => None,
        })
        .collect();
    for (id, heading) in headings {
        if let Some(Entity {
            kind: EntityKind::Controller { view_direction, .. },
            ..
        }) = world.get_mut(id)
        {
            *view_direction = heading;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Relevance Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = SchedulerConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: tick_rate={}Hz, relevant_timeout={}s, recheck={}s, prediction={}",
        config.max_tick_rate,
        config.relevant_timeout,
        config.relevancy_recheck_interval,
        config.viewpoint_prediction
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    // Start metrics server on port 9090 (configurable via METRICS_PORT)
    let metrics_port: u16 = env_or("METRICS_PORT", 9090);
    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Synthetic world
    let players: usize = env_or("SIM_PLAYERS", 32);
    let props: usize = env_or("SIM_ENTITIES", 2_000);
    let net_speed: u32 = env_or("SIM_NET_SPEED", 10_000);
    let mut rng = match config.jitter_seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
        None => StdRng::from_entropy(),
    };

    let mut world = EntityTable::with_capacity(players * 2 + props + props / 10 + ALWAYS_RELEVANT_COUNT);
    let controllers = build_world(&mut world, &mut rng, players, props);
    let occluders = build_occluders(&mut rng);
    info!(
        "World ready: {} entities, {} players, {} occluders",
        world.len(),
        controllers.len(),
        occluders.len()
    );

    let tick_rate = if config.max_tick_rate > 0.0 {
        config.max_tick_rate
    } else {
        UNCAPPED_HOST_RATE
    };
    let mut clock = SimClock::new(config.max_tick_rate);
    let mut driver = ReplicationDriver::new(config);

    let mut connection_ids: Vec<ConnectionId> = Vec::with_capacity(controllers.len());
    for (slot, &controller) in controllers.iter().enumerate() {
        let id = slot as ConnectionId + 1;
        let transport = ThrottledTransport::new(net_speed, BYTES_PER_UPDATE);
        let mut conn = ClientConnection::new(id, Box::new(transport), net_speed);
        conn.join(controller, clock.now());
        driver.on_connection_opened(conn)?;
        connection_ids.push(id);
    }
    metrics
        .connections_active
        .store(driver.connection_count() as u64, Ordering::Relaxed);

    // Shutdown signal handler
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut interval = tokio::time::interval(Duration::from_secs_f32(1.0 / tick_rate));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut moved = Vec::new();
    let mut last_tick = Instant::now();
    let mut last_summary = Instant::now();
    let mut summary_replications = 0u64;
    let mut summary_bytes = 0u64;
    let mut summary_saturated = 0u64;

    info!("Replicating at {}Hz to {} connections", tick_rate, connection_ids.len());

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let started = Instant::now();
                let delta = started.duration_since(last_tick).as_secs_f32();
                last_tick = started;
                clock.advance(delta);

                step_world(&mut world, delta, &mut moved);
                for &id in &moved {
                    driver.mark_dirty(&mut world, id)?;
                }
                for &id in &connection_ids {
                    if let Some(conn) = driver.connection_mut(id) {
                        conn.touch(clock.now());
                    }
                }

                let stats = driver.tick(&mut world, &occluders, &clock);

                metrics.record_tick(&stats);
                metrics.record_tick_time(started.elapsed());
                metrics.entities.store(world.len() as u64, Ordering::Relaxed);
                metrics.players.store(world.player_count() as u64, Ordering::Relaxed);

                summary_replications += stats.replicated as u64;
                summary_bytes += stats.bytes;
                summary_saturated += stats.saturated_connections as u64;

                if last_summary.elapsed() >= SUMMARY_INTERVAL {
                    info!(
                        "Last {}s: {} replications, {} KB, {} saturated passes, tick p95={}us",
                        SUMMARY_INTERVAL.as_secs(),
                        summary_replications,
                        summary_bytes / 1024,
                        summary_saturated,
                        metrics.tick_time_p95_us.load(Ordering::Relaxed)
                    );
                    summary_replications = 0;
                    summary_bytes = 0;
                    summary_saturated = 0;
                    last_summary = Instant::now();
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Cleanup
    for id in connection_ids {
        driver.on_connection_closed(id)?;
    }
    info!("Server stopped");

    Ok(())
}
