//! # Meshwork Durable
//!
//! The worker-side durable-function runtime: ordinary async functions become
//! deterministic, crash-resumable workflows.
//!
//! - [`WorkflowContext`]: per-invocation replay context; every durable
//!   primitive (`sleep_for`, `wait_for`, `proxy_activities`, `exec_child`,
//!   side effects) hangs off it
//! - [`DurableError`]: the `Result`-threaded control-flow discipline —
//!   suspension is an `Err` the user propagates with `?`, and
//!   [`did_interrupt`] is the guard every `catch`-equivalent must honor
//! - [`DurableWorker`]: consumes a task queue's workflow and activity
//!   streams, replays registered functions, and maps outcomes to the wire
//! - `factory`: the built-in "durable" meta-graph the engine interprets
//!
//! ```ignore
//! let worker = DurableWorker::new(store, WorkerConfig::new("mesh", "durable", "orders"));
//! worker.register_workflow("greet", |ctx, args| async move {
//!     ctx.sleep_for(Duration::from_secs(2)).await?;
//!     Ok(json!(format!("hi {}", args[0])))
//! });
//! worker.run(shutdown).await;
//! ```

pub mod context;
pub mod error;
pub mod factory;
pub mod interceptor;
pub mod interruption;
pub mod worker;

pub use context::{ChildOptions, ProxyOptions, WorkflowContext};
pub use error::{did_interrupt, DurableError};
pub use factory::{activity_topic, durable_manifest, workflow_topic, EXECUTE_TOPIC};
pub use interceptor::{ActivityInterceptor, Next, WorkflowInterceptor};
pub use interruption::Interruption;
pub use worker::{DurableWorker, WorkerConfig};
