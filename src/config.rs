use std::str::FromStr;

use crate::error::ConfigError;

/// Replication scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Server tick rate in Hz (0 = uncapped, jitter bounded by the tick delta)
    pub max_tick_rate: f32,
    /// Aging baseline for entities that have no channel yet
    pub spawn_priority_seconds: f32,
    /// Grace window a channel survives after its entity stops being relevant
    pub relevant_timeout: f32,
    /// Minimum seconds between occlusion re-queries for a channeled entity
    pub relevancy_recheck_interval: f32,
    /// Random extra seconds added on each confirmed relevancy refresh
    pub relevant_time_jitter: f32,
    /// Connections silent for longer than this get no viewer
    pub receive_timeout: f32,
    /// Bytes/s per player under which a connection counts as low bandwidth
    pub low_bandwidth_per_player: f32,
    /// Same threshold when vehicles are enabled
    pub low_bandwidth_per_player_vehicles: f32,
    pub allow_vehicles: bool,
    /// Optional distance cull applied before the occlusion query
    pub max_relevancy_distance: Option<f32>,
    /// Push the relevancy viewpoint ahead along the viewer's velocity
    pub viewpoint_prediction: bool,
    /// Seed for scheduling jitter (deterministic runs)
    pub jitter_seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tick_rate: 30.0,
            spawn_priority_seconds: 1.0,
            relevant_timeout: 5.0,
            relevancy_recheck_interval: 1.0,
            relevant_time_jitter: 0.5,
            receive_timeout: 1.5,
            low_bandwidth_per_player: 300.0,
            low_bandwidth_per_player_vehicles: 500.0,
            allow_vehicles: false,
            max_relevancy_distance: None,
            viewpoint_prediction: cfg!(feature = "viewpoint_prediction"),
            jitter_seed: None,
        }
    }
}

/// Read and parse an env var, warning and returning `None` on bad input
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

/// Non-negative float env var
fn env_seconds(name: &str) -> Option<f32> {
    let value = env_parse::<f32>(name)?;
    if value >= 0.0 && value.is_finite() {
        Some(value)
    } else {
        tracing::warn!("{} must be a non-negative number, using default", name);
        None
    }
}

impl SchedulerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(rate) = env_seconds("NET_MAX_TICK_RATE") {
            config.max_tick_rate = rate;
        }
        if let Some(secs) = env_seconds("NET_SPAWN_PRIORITY_SECONDS") {
            config.spawn_priority_seconds = secs;
        }
        if let Some(secs) = env_seconds("NET_RELEVANT_TIMEOUT") {
            config.relevant_timeout = secs;
        }
        if let Some(secs) = env_seconds("NET_RELEVANCY_RECHECK") {
            config.relevancy_recheck_interval = secs;
        }
        if let Some(secs) = env_seconds("NET_RELEVANT_JITTER") {
            config.relevant_time_jitter = secs;
        }
        if let Some(secs) = env_seconds("NET_RECEIVE_TIMEOUT") {
            config.receive_timeout = secs;
        }
        if let Some(rate) = env_seconds("NET_LOW_BANDWIDTH_PER_PLAYER") {
            config.low_bandwidth_per_player = rate;
        }
        if let Some(rate) = env_seconds("NET_LOW_BANDWIDTH_PER_PLAYER_VEHICLES") {
            config.low_bandwidth_per_player_vehicles = rate;
        }
        if let Some(allow) = env_parse::<bool>("NET_ALLOW_VEHICLES") {
            config.allow_vehicles = allow;
        }
        if let Some(distance) = env_seconds("NET_MAX_RELEVANCY_DISTANCE") {
            config.max_relevancy_distance = (distance > 0.0).then_some(distance);
        }
        if let Some(enabled) = env_parse::<bool>("NET_VIEWPOINT_PREDICTION") {
            config.viewpoint_prediction = enabled;
        }
        if let Some(seed) = env_parse::<u64>("NET_JITTER_SEED") {
            config.jitter_seed = Some(seed);
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("max_tick_rate", self.max_tick_rate),
            ("spawn_priority_seconds", self.spawn_priority_seconds),
            ("relevancy_recheck_interval", self.relevancy_recheck_interval),
            ("relevant_time_jitter", self.relevant_time_jitter),
            ("low_bandwidth_per_player", self.low_bandwidth_per_player),
            ("low_bandwidth_per_player_vehicles", self.low_bandwidth_per_player_vehicles),
        ] {
            if value < 0.0 {
                return Err(ConfigError::Negative { field, value });
            }
        }
        if self.receive_timeout <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "receive_timeout",
                value: self.receive_timeout,
            });
        }
        if let Some(distance) = self.max_relevancy_distance {
            if distance <= 0.0 {
                return Err(ConfigError::NotPositive {
                    field: "max_relevancy_distance",
                    value: distance,
                });
            }
        }
        if self.relevant_timeout <= self.relevancy_recheck_interval {
            return Err(ConfigError::TimeoutBelowRecheck {
                timeout: self.relevant_timeout,
                recheck: self.relevancy_recheck_interval,
            });
        }
        Ok(())
    }

    /// Per-player bandwidth floor for the current game mode
    pub fn low_bandwidth_threshold(&self) -> f32 {
        if self.allow_vehicles {
            self.low_bandwidth_per_player_vehicles
        } else {
            self.low_bandwidth_per_player
        }
    }

    /// Squared cull distance, if culling is enabled
    pub fn max_relevancy_distance_sq(&self) -> Option<f32> {
        self.max_relevancy_distance.map(|d| d * d)
    }
}
