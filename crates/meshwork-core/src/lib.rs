//! # Meshwork Core
//!
//! Shared model for the meshwork process-orchestration engine:
//!
//! - **Manifest**: the deployed graph descriptor (`AppManifest`, `Graph`,
//!   `ActivityDef`) that the engine interprets
//! - **Messages**: the stream transition payload and the bit-exact status
//!   codes the mesh speaks on the wire
//! - **Job**: field-name discipline for the per-job HASH record plus the
//!   query/export DTOs
//! - **Mapper & Pipe**: `{a.b.c}` substitution, `@pipe`/`@reduce`
//!   expressions, and transition match evaluation
//! - **Errors**: the wire-visible error taxonomy
//!
//! Everything here is pure data + pure functions; the store, engine, and
//! durable runtime crates build on top of it.

pub mod codes;
pub mod control;
pub mod error;
pub mod job;
pub mod manifest;
pub mod mapper;
pub mod message;
pub mod pipe;
pub mod retry;
pub mod transition;

pub use error::{JobError, MeshError};
pub use job::{JobExport, JobMetadata, JobOutput};
pub use manifest::{ActivityDef, ActivityKind, AppManifest, Graph, SignalSubtype};
pub use mapper::{map_rules, resolve_expr, MapError, MapRules};
pub use message::{MessageMetadata, StreamMessage};
pub use retry::RetryPolicy;
pub use transition::{eval_transitions, Gate, Transition, TransitionConditions};
