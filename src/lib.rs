//! Relevance Server Library
//!
//! Server-side network replication scheduling: once per simulation tick,
//! decides which entities are sent to which client, in what order, and how
//! much a bandwidth-limited connection absorbs before it stops.
//!
//! # Features
//!
//! - `viewpoint_prediction` - Look-ahead relevancy viewpoint default (enabled by default)
//! - `metrics_extended` - Per-tick relevancy and clean-skip counters in metrics output (enabled by default)
//! - `minimal` - Build without optional features for testing/debugging

pub mod config;
pub mod error;
pub mod metrics;
pub mod net;
pub mod replication;
pub mod util;
pub mod world;
