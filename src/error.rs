use crate::net::connection::ConnectionId;
use crate::world::entity::EntityId;

/// Invalid scheduler configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f32 },
    #[error("{field} cannot be negative, got {value}")]
    Negative { field: &'static str, value: f32 },
    #[error("relevant_timeout ({timeout}s) must exceed relevancy_recheck_interval ({recheck}s)")]
    TimeoutBelowRecheck { timeout: f32, recheck: f32 },
}

/// Errors from the replication driver's lifecycle hooks
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("connection {0} is already open")]
    DuplicateConnection(ConnectionId),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
}
