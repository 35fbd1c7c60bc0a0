//! Workflow handles

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use meshwork_core::{codes, MeshError};
use meshwork_engine::InterruptOptions;
use meshwork_engine::QuorumMessage;

use crate::client::MeshClient;

/// A handle to one running (or finished) workflow job.
#[derive(Clone)]
pub struct WorkflowHandle {
    client: Arc<MeshClient>,
    job_id: String,
}

impl WorkflowHandle {
    pub fn new(client: Arc<MeshClient>, job_id: impl Into<String>) -> Self {
        Self {
            client,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Await the workflow result. Returns immediately when the job already
    /// completed; otherwise waits for the completion notification up to
    /// `timeout` (client-side only — the job keeps running on expiry).
    pub async fn result<T: DeserializeOwned>(&self, timeout: Duration) -> Result<T, MeshError> {
        let mut events = self.client.sub_quorum();

        // Already terminal?
        if let Ok(status) = self.client.get_status(&self.job_id).await {
            if status == 0.0 {
                return self.decode_result().await;
            }
            if status <= codes::INTERRUPTED_FLOOR {
                return Err(MeshError::fatal(format!(
                    "job {} interrupted",
                    self.job_id
                )));
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(MeshError::PubSubTimeout(self.job_id.clone()));
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(QuorumMessage::Job { jid, .. })) if jid == self.job_id => {
                    return self.decode_result().await;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return Err(MeshError::Store("quorum channel closed".into())),
                Err(_) => return Err(MeshError::PubSubTimeout(self.job_id.clone())),
            }
        }
    }

    async fn decode_result<T: DeserializeOwned>(&self) -> Result<T, MeshError> {
        let state = self.client.get_state(&self.job_id).await?;
        if let Some(error) = state.data.get("$error") {
            let error: meshwork_core::JobError = serde_json::from_value(error.clone())?;
            return Err(MeshError::Fatal {
                message: error.message,
            });
        }
        let value = state
            .data
            .get("response")
            .cloned()
            .unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    /// Deliver a signal toward this job's hooks.
    pub async fn signal(&self, topic: &str, data: Value) -> Result<String, MeshError> {
        self.client.signal(topic, data, None).await
    }

    /// Interrupt this job.
    pub async fn interrupt(&self, options: InterruptOptions) -> Result<String, MeshError> {
        self.client.interrupt("", &self.job_id, options).await
    }
}
