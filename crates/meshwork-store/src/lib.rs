//! # Meshwork Store
//!
//! Provider-agnostic persistence for the meshwork engine: the [`MeshStore`]
//! trait plus two providers —
//!
//! - [`PostgresMeshStore`]: the production backend (SKIP LOCKED stream
//!   claiming, LISTEN/NOTIFY pub/sub, lease-table scout election)
//! - [`MemoryMeshStore`]: an in-process backend with the same guarantees,
//!   used by the test suites
//!
//! All state the mesh shares between members lives behind this trait; the
//! engine holds no mutable data across operations.

pub mod glob;
pub mod keys;
pub mod memory;
pub mod postgres;
pub mod store;

pub use keys::{mint_key, KeyParams, KeyType, Keys};
pub use memory::MemoryMeshStore;
pub use postgres::PostgresMeshStore;
pub use store::{
    HookSignal, HookTarget, LegCommit, MeshStore, StoreError, StreamEntry, TaskKind, ThrottleSpec,
    TimeHook,
};
