//! Interceptor chains
//!
//! Workflow and activity interceptors wrap user functions in an onion:
//! the first registered runs outermost. Interceptors participate in the
//! same interruption discipline as user code — recovery logic inside an
//! interceptor must consult [`did_interrupt`](crate::did_interrupt) and
//! propagate engine interruptions.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::DurableError;

/// Continuation handed to an interceptor; call it to run the rest of the
/// chain (ending at the user function).
pub type Next<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<Value, DurableError>> + Send + 'a>;

/// Wraps every workflow invocation.
#[async_trait]
pub trait WorkflowInterceptor: Send + Sync + 'static {
    async fn intercept(
        &self,
        ctx: &WorkflowContext,
        input: &Value,
        next: Next<'_>,
    ) -> Result<Value, DurableError>;
}

/// Wraps every proxied-activity execution on the worker.
#[async_trait]
pub trait ActivityInterceptor: Send + Sync + 'static {
    async fn intercept(
        &self,
        activity_name: &str,
        input: &Value,
        next: Next<'_>,
    ) -> Result<Value, DurableError>;
}

/// Compose workflow interceptors around a terminal future, outermost first.
pub(crate) fn compose_workflow<'a>(
    interceptors: &'a [Arc<dyn WorkflowInterceptor>],
    ctx: &'a WorkflowContext,
    input: &'a Value,
    terminal: BoxFuture<'a, Result<Value, DurableError>>,
) -> BoxFuture<'a, Result<Value, DurableError>> {
    match interceptors.split_first() {
        None => terminal,
        Some((head, rest)) => {
            let next: Next<'a> = Box::new(move || compose_workflow(rest, ctx, input, terminal));
            Box::pin(head.intercept(ctx, input, next))
        }
    }
}

/// Compose activity interceptors around a terminal future, outermost first.
pub(crate) fn compose_activity<'a>(
    interceptors: &'a [Arc<dyn ActivityInterceptor>],
    activity_name: &'a str,
    input: &'a Value,
    terminal: BoxFuture<'a, Result<Value, DurableError>>,
) -> BoxFuture<'a, Result<Value, DurableError>> {
    match interceptors.split_first() {
        None => terminal,
        Some((head, rest)) => {
            let next: Next<'a> =
                Box::new(move || compose_activity(rest, activity_name, input, terminal));
            Box::pin(head.intercept(activity_name, input, next))
        }
    }
}
