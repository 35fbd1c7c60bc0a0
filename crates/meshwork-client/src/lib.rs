//! # Meshwork Client
//!
//! The mesh-member facade: [`MeshClient::init`] wires a store, engine,
//! quorum, time scout, and any attached durable workers under one shutdown
//! channel and exposes the full client surface — deploy/activate,
//! `pub_job`/`pubsub`, signals, queries, interrupt/scrub, roll call and
//! throttle.
//!
//! ```ignore
//! let store = Arc::new(PostgresMeshStore::new(pool));
//! let client = MeshClient::init(store, ClientConfig::new("mesh", "orders")).await?;
//! client.deploy_yaml(MANIFEST)?;
//! client.activate("1", Duration::ZERO).await?;
//!
//! let output = client
//!     .pubsub("order.created", json!({"sku": "x"}), None, Duration::from_secs(30))
//!     .await?;
//! ```

pub mod client;
pub mod handle;

pub use client::{ClientConfig, MeshClient};
pub use handle::WorkflowHandle;

pub use meshwork_core::{JobExport, JobMetadata, JobOutput, MeshError};
pub use meshwork_durable::{DurableWorker, WorkerConfig};
pub use meshwork_engine::{InterruptOptions, QuorumMessage, QuorumProfile};
pub use meshwork_store::{MemoryMeshStore, PostgresMeshStore, ThrottleSpec};
