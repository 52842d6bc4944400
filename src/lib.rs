//! cqlstress — a workload-centric load generator for wide-column clusters.
//!
//! An operator picks a named workload profile, supplies dimensions
//! (operation count or wall-clock duration, target rate, thread count,
//! partition-space size, read/write/delete mix), and the tool drives a
//! live cluster at the requested rate while measuring latency, throughput
//! and errors.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`workload`]: named profiles bundling schema DDL, prepared statements,
//!   an operation pattern, and tunable parameters, discovered through a
//!   static registry.
//! - [`keys`]: the shared partition-key stream (uniform, sequential, or
//!   gaussian over the key space).
//! - [`engine`]: the stress execution core — a token-bucket rate limiter,
//!   per-worker dispatch loops with bounded in-flight windows, the async
//!   completion path, and the termination coordinator.
//! - [`metrics`] and [`collector`]: per-kind latency timers and meters fed
//!   by a composable collector chain on every completion.
//! - [`driver`]: the session seam the real cluster driver plugs into, with
//!   an in-memory reference session for tests and offline runs.
//! - [`server`]: the optional remote-control surface (line-oriented JSON
//!   commands, single-run exclusivity, live status).
//!
//! # Where to start
//!
//! [`engine::run_stress`] is the controller: it builds the per-run context,
//! runs the optional populate phase, launches the measured phase, and tears
//! everything down once the coordinator reports Stopped.

pub mod collector;
pub mod compaction;
pub mod config;
pub mod driver;
pub mod engine;
pub mod fields;
pub mod keys;
pub mod metrics;
pub mod server;
pub mod workload;

pub use collector::{Collector, CompositeCollector, OpSample};
pub use compaction::CompactionOptions;
pub use config::{ConfigError, PopulateOpt, RunConfig, parse_duration_secs, parse_iterations};
pub use engine::termination::{RunState, StopReason, Terminator};
pub use engine::{RunOutcome, StressContext, StressError, run_stress};
pub use keys::{KeyDistribution, KeyStream, PartitionKey};
pub use metrics::{MetricsBundle, MetricsSnapshot, OpKind};
pub use server::StressTestManager;
