//! Best-effort build notifications
//!
//! Events are handed to a [`NotificationSink`] on a detached task. The
//! caller never waits on delivery and sink failures are only logged.

use ::async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipyard_core::{AppId, ArtifactId, CiPipelineId, GitCommit, UserId, WorkflowId};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildEventKind {
    Success,
    Fail,
}

/// Payload of a build notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub kind: BuildEventKind,
    pub pipeline_id: CiPipelineId,
    pub pipeline_name: String,
    pub app_id: AppId,
    pub workflow_id: Option<WorkflowId>,
    pub artifact_id: Option<ArtifactId>,
    pub user_id: UserId,
    pub image: String,
    /// First revision of every material, comma joined.
    pub source: String,
    pub failure_reason: Option<String>,
    pub git_triggers: BTreeMap<i64, GitCommit>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("notification delivery failed: {0}")]
pub struct NotificationError(pub String);

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, event: BuildEvent) -> Result<(), NotificationError>;
}

/// Fire-and-forget dispatcher.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Send on a detached task. The handle is returned for tests; production
    /// callers drop it.
    pub fn dispatch(&self, event: BuildEvent) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            let kind = event.kind;
            let pipeline_id = event.pipeline_id;
            match sink.send(event).await {
                Ok(()) => debug!(?kind, pipeline_id = %pipeline_id, "Build notification sent"),
                Err(e) => error!(
                    ?kind,
                    pipeline_id = %pipeline_id,
                    error = %e,
                    "Error in writing build notification event"
                ),
            }
        })
    }
}
