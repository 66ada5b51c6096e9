//! Replication scheduling: which entities go to which connection, in what
//! order, and how much each connection absorbs per tick.

pub mod candidates;
pub mod dirty;
pub mod driver;
pub mod priority;
pub mod relevancy;
pub mod scheduler;
pub mod stats;
pub mod viewer;

#[cfg(test)]
pub(crate) mod test_support;

pub use candidates::{CandidateListBuilder, CandidateStats, TickScratch};
pub use dirty::{DirtyFlush, DirtyTracker};
pub use driver::ReplicationDriver;
pub use priority::{PriorityModel, PriorityRecord};
pub use relevancy::RelevancyOracle;
pub use scheduler::{PassOutcome, PassState, ReplicationScheduler};
pub use stats::TickStats;
pub use viewer::ViewerContext;
