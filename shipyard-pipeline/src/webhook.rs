//! Build-completion ingestion
//!
//! Turns internal and external build callbacks into durable artifacts and
//! hands them to the fan-out engine. Committed artifacts always reflect
//! "the build succeeded and was recorded": downstream trigger failures are
//! reported alongside the result, never rolled back, except for the external
//! path where an event that triggered nothing leaves no artifact behind.

use crate::constants::API_KEY_SEPARATOR;
use crate::fanout::{Authorizer, AutoTriggerEngine, FanOutReport};
use crate::notify::{BuildEvent, BuildEventKind, Notifier};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use shipyard_core::material::{compact, source_revisions};
use shipyard_core::{
    Artifact, ArtifactId, AuditLog, AuthorizationError, CdPipelineId, CiConfig, CiPipeline,
    CiPipelineId, CiWorkflow, DataSource, EntityKind, ExternalCiId, FanOutFailure, NewArtifact,
    ShipyardError, ShipyardResult, Timestamp, TriggerError, TriggerMode, UserId, ValidationError,
    WorkflowId, WorkflowStatus,
};
use shipyard_storage::{ArtifactStore, PipelineRepository, WorkflowStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Callback payload sent by a build runner or an external CI system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildEventRequest {
    pub image: String,
    pub image_digest: String,
    /// Raw provenance JSON.
    pub material_info: Option<String>,
    /// Raw data-source name. Empty means the configured default.
    pub data_source: Option<String>,
    pub pipeline_name: Option<String>,
    pub workflow_id: Option<WorkflowId>,
    pub user_id: UserId,
    pub is_artifact_uploaded: bool,
    pub failure_reason: Option<String>,
}

/// Result of a successful ingestion.
#[must_use = "downstream trigger failures are only reported through `fan_out_error`"]
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionOutcome {
    pub artifact_id: ArtifactId,
    /// Clones created for child pipelines, in discovery order.
    pub clone_ids: Vec<ArtifactId>,
    pub fan_out: FanOutReport,
}

impl IngestionOutcome {
    /// Downstream failures, if any. Ingestion itself still succeeded.
    pub fn fan_out_error(&self) -> Option<FanOutFailure> {
        self.fan_out.failure()
    }
}

pub struct WebhookService {
    artifacts: Arc<dyn ArtifactStore>,
    workflows: Arc<dyn WorkflowStore>,
    pipelines: Arc<dyn PipelineRepository>,
    engine: AutoTriggerEngine,
    notifier: Notifier,
    config: CiConfig,
}

impl WebhookService {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        workflows: Arc<dyn WorkflowStore>,
        pipelines: Arc<dyn PipelineRepository>,
        engine: AutoTriggerEngine,
        notifier: Notifier,
        config: CiConfig,
    ) -> Self {
        Self {
            artifacts,
            workflows,
            pipelines,
            engine,
            notifier,
            config,
        }
    }

    fn resolve_data_source(&self, raw: Option<&str>) -> ShipyardResult<DataSource> {
        match raw.map(str::trim) {
            None | Some("") => Ok(self.config.default_data_source),
            Some(name) => name.parse::<DataSource>().map_err(|_| {
                ShipyardError::from(ValidationError::UnsupportedDataSource {
                    data_source: name.to_string(),
                })
            }),
        }
    }

    fn trigger_mode(&self, user: UserId) -> TriggerMode {
        if user == self.config.system_user_id {
            TriggerMode::Automatic
        } else {
            TriggerMode::Manual
        }
    }

    async fn load_workflow(&self, id: WorkflowId) -> ShipyardResult<CiWorkflow> {
        self.workflows
            .ci_workflow_get(id)
            .await?
            .ok_or_else(|| ShipyardError::not_found(EntityKind::CiWorkflow, id))
    }

    async fn load_pipeline(&self, id: CiPipelineId) -> ShipyardResult<CiPipeline> {
        self.pipelines
            .ci_pipeline_get(id)
            .await?
            .ok_or_else(|| ShipyardError::not_found(EntityKind::CiPipeline, id))
    }

    /// Outcome of a success callback whose workflow already succeeded. The
    /// recorded artifact is returned as is and nothing is triggered again.
    async fn replay_success(&self, workflow_id: WorkflowId) -> ShipyardResult<IngestionOutcome> {
        let artifact = self
            .artifacts
            .artifact_find_by_workflow(workflow_id)
            .await?
            .ok_or_else(|| ValidationError::InvalidStatusTransition {
                workflow_id: workflow_id.0,
                from: WorkflowStatus::Succeeded.to_string(),
                to: WorkflowStatus::Succeeded.to_string(),
            })?;
        let clone_ids: Vec<ArtifactId> = self
            .artifacts
            .artifact_list_by_parent(artifact.id)
            .await?
            .iter()
            .map(|a| a.id)
            .collect();
        info!(
            workflow_id = %workflow_id,
            artifact_id = %artifact.id,
            "Workflow already succeeded, skipping redelivered success event"
        );
        Ok(IngestionOutcome {
            artifact_id: artifact.id,
            clone_ids,
            fan_out: FanOutReport::default(),
        })
    }

    /// Record a successful build for `pipeline_id` and every child pipeline
    /// sharing its output, then trigger downstream pipelines.
    pub async fn handle_build_success(
        &self,
        pipeline_id: CiPipelineId,
        request: BuildEventRequest,
        image_pushed_at: Option<Timestamp>,
    ) -> ShipyardResult<IngestionOutcome> {
        info!(pipeline_id = %pipeline_id, image = %request.image, "Handling ci success event");

        if let Some(workflow_id) = request.workflow_id {
            let workflow = self.load_workflow(workflow_id).await?;
            if workflow.status == WorkflowStatus::Succeeded {
                return self.replay_success(workflow_id).await;
            }
        }
        let pipeline = self.load_pipeline(pipeline_id).await?;
        let pipeline_name = request
            .pipeline_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| pipeline.name.clone());
        let data_source = self.resolve_data_source(request.data_source.as_deref())?;
        let material_info = compact(request.material_info.as_deref())?;

        let created_on = image_pushed_at.unwrap_or_else(Utc::now);
        let own = NewArtifact {
            pipeline_id: Some(pipeline.id),
            external_ci_pipeline_id: None,
            image: request.image.clone(),
            image_digest: request.image_digest.clone(),
            material_info: material_info.clone(),
            data_source,
            workflow_id: request.workflow_id,
            parent_ci_artifact: None,
            scan_enabled: pipeline.scan_enabled,
            // Without scanning there is nothing to wait for.
            scanned: !pipeline.scan_enabled,
            is_artifact_uploaded: request.is_artifact_uploaded,
            audit: AuditLog::at(created_on, request.user_id),
        };
        let artifact = match request.workflow_id {
            Some(workflow_id) => {
                self.artifacts
                    .artifact_save_with_workflow_success(own, workflow_id, Utc::now())
                    .await?
            }
            None => self.artifacts.artifact_save(own).await?,
        };

        let children = self.pipelines.ci_pipeline_find_children(pipeline.id).await?;
        let clones: Vec<NewArtifact> = children
            .iter()
            .map(|child| NewArtifact {
                pipeline_id: Some(child.id),
                external_ci_pipeline_id: None,
                image: request.image.clone(),
                image_digest: request.image_digest.clone(),
                material_info: material_info.clone(),
                data_source,
                workflow_id: None,
                parent_ci_artifact: Some(artifact.id),
                scan_enabled: child.scan_enabled,
                scanned: !child.scan_enabled,
                is_artifact_uploaded: request.is_artifact_uploaded,
                audit: AuditLog::now(request.user_id),
            })
            .collect();
        let clones = if clones.is_empty() {
            Vec::new()
        } else {
            self.artifacts.artifact_save_all(clones).await?
        };

        self.notifier.dispatch(BuildEvent {
            kind: BuildEventKind::Success,
            pipeline_id: pipeline.id,
            pipeline_name,
            app_id: pipeline.app_id,
            workflow_id: request.workflow_id,
            artifact_id: Some(artifact.id),
            user_id: request.user_id,
            image: request.image.clone(),
            source: source_revisions(&artifact.material_info),
            failure_reason: None,
            git_triggers: BTreeMap::new(),
        });

        let clone_ids: Vec<ArtifactId> = clones.iter().map(|a| a.id).collect();
        let artifact_id = artifact.id;
        let mut batch: Vec<Artifact> = Vec::with_capacity(clones.len() + 1);
        batch.push(artifact);
        batch.extend(clones);

        let fan_out = self
            .engine
            .fan_out(&batch, self.trigger_mode(request.user_id), request.user_id)
            .await;
        if let Some(failure) = fan_out.failure() {
            warn!(artifact_id = %artifact_id, error = %failure, "Partial fan-out failure");
        }

        Ok(IngestionOutcome {
            artifact_id,
            clone_ids,
            fan_out,
        })
    }

    /// Record an artifact pushed by an external CI system and trigger the CD
    /// pipelines it feeds that `authorizer` allows for `token`.
    ///
    /// When nothing was triggered the artifact is deleted again and an error
    /// is returned.
    pub async fn handle_external_webhook(
        &self,
        external_ci_id: ExternalCiId,
        request: BuildEventRequest,
        token: &str,
        authorizer: &dyn Authorizer,
    ) -> ShipyardResult<IngestionOutcome> {
        let external = self
            .pipelines
            .external_ci_get(external_ci_id)
            .await?
            .ok_or_else(|| {
                error!(external_ci_id = %external_ci_id, "Invalid external ci id");
                AuthorizationError::InvalidExternalCiId {
                    id: external_ci_id.0,
                }
            })?;
        info!(external_ci_id = %external.id, image = %request.image, "Request of webhook external ci");

        let data_source = self.resolve_data_source(request.data_source.as_deref())?;
        let material_info = compact(request.material_info.as_deref())?;
        let artifact = self
            .artifacts
            .artifact_save(NewArtifact {
                pipeline_id: None,
                external_ci_pipeline_id: Some(external.id),
                image: request.image.clone(),
                image_digest: request.image_digest.clone(),
                material_info,
                data_source,
                workflow_id: request.workflow_id,
                parent_ci_artifact: None,
                scan_enabled: false,
                scanned: false,
                is_artifact_uploaded: request.is_artifact_uploaded,
                audit: AuditLog::now(request.user_id),
            })
            .await?;

        let targets = self
            .pipelines
            .external_ci_downstream_targets(external.id)
            .await?;
        let target_count = targets.len();
        let fan_out = self
            .engine
            .fan_out_external(&artifact, targets, token, authorizer, request.user_id)
            .await;

        if fan_out.triggered_any() {
            if let Some(failure) = fan_out.failure() {
                warn!(artifact_id = %artifact.id, error = %failure, "Partial external fan-out failure");
            }
            return Ok(IngestionOutcome {
                artifact_id: artifact.id,
                clone_ids: Vec::new(),
                fan_out,
            });
        }

        let cause: ShipyardError = if fan_out.cancelled {
            TriggerError::Cancelled {
                artifact_id: artifact.id.0,
            }
            .into()
        } else if let Some(failure) = fan_out.failure() {
            failure.into()
        } else if fan_out.skipped > 0 {
            AuthorizationError::Denied {
                resource: format!("external ci {} downstream pipelines", external.id),
            }
            .into()
        } else {
            ShipyardError::not_found(EntityKind::CdPipeline, CdPipelineId(0))
        };
        error!(
            artifact_id = %artifact.id,
            targets = target_count,
            error = %cause,
            "External ci event triggered nothing, rolling back artifact"
        );
        self.artifacts.artifact_delete(artifact.id).await?;
        Err(cause)
    }

    /// Emit a failure notification for a failed build. No artifact exists
    /// for a failed build, so the artifact store is untouched.
    pub async fn handle_build_failure(
        &self,
        pipeline_id: CiPipelineId,
        request: BuildEventRequest,
    ) -> ShipyardResult<()> {
        let workflow_id = request
            .workflow_id
            .ok_or_else(|| ValidationError::RequiredFieldMissing {
                field: "workflow_id".to_string(),
            })?;
        let workflow = self.load_workflow(workflow_id).await?;
        let pipeline = self.load_pipeline(pipeline_id).await?;

        self.notifier.dispatch(BuildEvent {
            kind: BuildEventKind::Fail,
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name.clone(),
            app_id: pipeline.app_id,
            workflow_id: Some(workflow.id),
            artifact_id: None,
            user_id: workflow.triggered_by,
            image: request.image.clone(),
            source: request
                .material_info
                .as_deref()
                .map(source_revisions)
                .unwrap_or_default(),
            failure_reason: request.failure_reason.clone(),
            git_triggers: workflow.git_triggers.clone(),
        });
        Ok(())
    }

    /// Resolve an external CI api key (`base64(id).token`) to the
    /// registration it belongs to.
    pub async fn authenticate_external_ci_webhook(
        &self,
        api_key: &str,
    ) -> ShipyardResult<ExternalCiId> {
        let parts: Vec<&str> = api_key.split(API_KEY_SEPARATOR).collect();
        let [encoded_id, token] = parts.as_slice() else {
            return Err(AuthorizationError::InvalidApiKey {
                reason: "invalid key".to_string(),
            }
            .into());
        };
        let id = STANDARD
            .decode(encoded_id)
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .map(ExternalCiId)
            .ok_or_else(|| AuthorizationError::InvalidApiKey {
                reason: "invalid ci pipeline".to_string(),
            })?;

        let external = self.pipelines.external_ci_get(id).await?;
        match external {
            Some(ext) if ext.access_token == *token => Ok(id),
            _ => Err(AuthorizationError::InvalidApiKey {
                reason: "invalid key, auth failed".to_string(),
            }
            .into()),
        }
    }
}
