//! # Meshwork Engine
//!
//! The graph interpreter at the center of the mesh:
//!
//! - [`Engine`]: dequeues transition messages, drives activities through
//!   their two-leg contract, persists every transition atomically, and
//!   publishes completions
//! - `activities`: per-kind behavior (`trigger`, `worker`, `hook`, `await`,
//!   `cycle`, `signal`)
//! - [`Router`]: stream consumer with throttle, adaptive backoff, and
//!   idle-claim recovery
//! - [`Scout`]: the elected time-hook service (sleep / expire / interrupt)
//! - [`Quorum`]: the LISTEN/NOTIFY coordination plane (roll call, throttle,
//!   version activation, completion notifications)

pub mod activities;
pub mod config;
pub mod engine;
pub mod quorum;
pub mod router;
pub mod scout;

pub use config::EngineConfig;
pub use engine::{Engine, InterruptOptions, JobContext};
pub use quorum::{Quorum, QuorumEvent, QuorumMessage, QuorumProfile, ThrottleCache, MAX_DELAY_MS};
pub use router::{Router, RouterConfig};
pub use scout::{Scout, ScoutConfig};
