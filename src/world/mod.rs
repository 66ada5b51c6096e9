//! Simulation-side collaborators: entities, the entity arena, the clock and
//! the line-of-sight query.

pub mod clock;
pub mod entity;
pub mod occlusion;
pub mod table;

pub use clock::SimClock;
pub use entity::{BodyState, ClassId, Entity, EntityId, EntityKind, RelevancyCategory, ReplicationFlags};
pub use occlusion::{Aabb, BoxOccluders, OcclusionQuery, OpenSpace};
pub use table::EntityTable;
