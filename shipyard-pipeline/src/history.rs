//! Deployment template history
//!
//! Every chart configuration change and every deployment trigger appends an
//! immutable snapshot. Reads reconcile deployed snapshots against CD run
//! records by matching the deployment time to the run start time; a snapshot
//! without a matching run is left out rather than given a made-up status.

use serde::{Deserialize, Serialize};
use shipyard_core::constants::{DEFAULT_TEMPLATE_NAME, HISTORY_CODE_EDITOR_DISPLAY_NAME};
use shipyard_core::{
    AppId, AuditLog, CdPipeline, CdPipelineId, CdWorkflowRunner, CdWorkflowRunnerId,
    CdWorkflowType, Chart, ChartRef, DeploymentTemplateHistory, EntityKind, EnvOverride,
    EnvironmentId, HistoryId, NewDeploymentTemplateHistory, ShipyardError, ShipyardResult,
    Timestamp, UserId, WorkflowStatus,
};
use shipyard_storage::{ChartStore, HistoryStore, PipelineRepository};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// READ MODELS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeEditorValue {
    pub display_name: String,
    pub value: serde_json::Value,
}

/// Full view of one history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryDetail {
    pub template_name: String,
    pub template_version: String,
    pub is_app_metrics_enabled: bool,
    pub code_editor_value: CodeEditorValue,
    pub variable_snapshot: BTreeMap<String, String>,
}

impl From<&DeploymentTemplateHistory> for HistoryDetail {
    fn from(h: &DeploymentTemplateHistory) -> Self {
        Self {
            template_name: h.template_name.clone(),
            template_version: h.template_version.clone(),
            is_app_metrics_enabled: h.is_app_metrics_enabled,
            code_editor_value: CodeEditorValue {
                display_name: HISTORY_CODE_EDITOR_DISPLAY_NAME.to_string(),
                value: h.template.clone(),
            },
            variable_snapshot: h.variable_snapshot.clone(),
        }
    }
}

/// A deployed entry joined with the run that deployed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDetail {
    pub history_id: HistoryId,
    pub pipeline_id: CdPipelineId,
    pub deployed_on: Timestamp,
    pub deployed_by: UserId,
    pub email_id: String,
    pub deployment_status: WorkflowStatus,
    pub wfr_id: CdWorkflowRunnerId,
    pub workflow_type: CdWorkflowType,
}

/// Compact list row for the deployed-history picker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedHistorySummary {
    pub id: HistoryId,
    pub deployed_on: Timestamp,
    pub deployed_by: String,
    pub deployment_status: WorkflowStatus,
}

// ============================================================================
// RECORDER
// ============================================================================

pub struct DeploymentHistoryRecorder {
    history: Arc<dyn HistoryStore>,
    charts: Arc<dyn ChartStore>,
    pipelines: Arc<dyn PipelineRepository>,
}

impl DeploymentHistoryRecorder {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        charts: Arc<dyn ChartStore>,
        pipelines: Arc<dyn PipelineRepository>,
    ) -> Self {
        Self {
            history,
            charts,
            pipelines,
        }
    }

    async fn chart_ref_for(&self, chart: &Chart) -> ShipyardResult<ChartRef> {
        self.charts
            .chart_ref_get(chart.chart_ref_id)
            .await?
            .ok_or_else(|| ShipyardError::not_found(EntityKind::ChartRef, chart.chart_ref_id))
    }

    async fn chart_for(&self, env_override: &EnvOverride) -> ShipyardResult<Chart> {
        self.charts
            .chart_get(env_override.chart_id)
            .await?
            .ok_or_else(|| ShipyardError::not_found(EntityKind::Chart, env_override.chart_id))
    }

    /// Snapshot a global chart change: one template-level entry plus one per
    /// pipeline that does not override the chart in its environment.
    pub async fn record_global_template_change(
        &self,
        chart: &Chart,
        app_metrics_enabled: bool,
        user: UserId,
    ) -> ShipyardResult<Vec<DeploymentTemplateHistory>> {
        let chart_ref = self.chart_ref_for(chart).await?;
        let pipelines = self
            .pipelines
            .cd_pipeline_find_not_overriding_chart(chart.app_id, chart.id)
            .await?;

        let base = NewDeploymentTemplateHistory {
            app_id: chart.app_id,
            pipeline_id: None,
            target_environment: None,
            template: chart.global_override.clone(),
            image_descriptor_template: chart.image_descriptor_template.clone(),
            template_name: template_name(&chart_ref),
            template_version: chart_ref.version.to_string(),
            is_app_metrics_enabled: app_metrics_enabled,
            deployed: false,
            deployed_on: None,
            deployed_by: None,
            variable_snapshot: BTreeMap::new(),
            audit: AuditLog::now(user),
        };
        let mut entries = Vec::with_capacity(pipelines.len() + 1);
        for pipeline in &pipelines {
            entries.push(NewDeploymentTemplateHistory {
                pipeline_id: Some(pipeline.id),
                target_environment: Some(pipeline.environment_id),
                ..base.clone()
            });
        }
        entries.insert(0, base);

        let saved = self.history.history_insert_all(entries).await?;
        info!(
            chart_id = %chart.id,
            app_id = %chart.app_id,
            entries = saved.len(),
            "Recorded global deployment template history"
        );
        Ok(saved)
    }

    /// Snapshot an environment override change. When `pipeline_id` is not
    /// given it is resolved from the (application, environment) pair; an
    /// environment without a pipeline yields an entry with no pipeline.
    pub async fn record_env_override_change(
        &self,
        env_override: &EnvOverride,
        app_metrics_enabled: bool,
        pipeline_id: Option<CdPipelineId>,
        user: UserId,
    ) -> ShipyardResult<DeploymentTemplateHistory> {
        let chart = self.chart_for(env_override).await?;
        let chart_ref = self.chart_ref_for(&chart).await?;
        let pipeline_id = match pipeline_id {
            Some(id) => Some(id),
            None => self
                .pipelines
                .cd_pipeline_find_by_app_and_env(chart.app_id, env_override.target_environment)
                .await?
                .map(|p| p.id),
        };

        let entry = self
            .history
            .history_insert(NewDeploymentTemplateHistory {
                app_id: chart.app_id,
                pipeline_id,
                target_environment: Some(env_override.target_environment),
                template: effective_template(env_override, &chart),
                image_descriptor_template: chart.image_descriptor_template.clone(),
                template_name: template_name(&chart_ref),
                template_version: chart_ref.version.to_string(),
                is_app_metrics_enabled: app_metrics_enabled,
                deployed: false,
                deployed_on: None,
                deployed_by: None,
                variable_snapshot: BTreeMap::new(),
                audit: AuditLog::now(user),
            })
            .await?;
        debug!(history_id = %entry.id, env_override_id = %env_override.id, "Recorded env override history");
        Ok(entry)
    }

    /// Environment-level flag wins, then application level, then `false`.
    pub async fn resolve_app_metrics(
        &self,
        app_id: AppId,
        env_id: EnvironmentId,
    ) -> ShipyardResult<bool> {
        if let Some(env) = self.charts.env_metrics_get(app_id, env_id).await? {
            return Ok(env.app_metrics);
        }
        Ok(self
            .charts
            .app_metrics_get(app_id)
            .await?
            .map(|m| m.app_metrics)
            .unwrap_or(false))
    }

    /// Snapshot exactly what a deployment used. This is the only entry kind
    /// usable for rollback.
    pub async fn record_deployment_trigger(
        &self,
        pipeline: &CdPipeline,
        env_override: &EnvOverride,
        rendered_image_template: String,
        deployed_on: Timestamp,
        deployed_by: UserId,
        variable_snapshot: BTreeMap<String, String>,
    ) -> ShipyardResult<DeploymentTemplateHistory> {
        let chart = self.chart_for(env_override).await?;
        let chart_ref = self.chart_ref_for(&chart).await?;
        let app_metrics = self
            .resolve_app_metrics(pipeline.app_id, pipeline.environment_id)
            .await?;

        let entry = self
            .history
            .history_insert(NewDeploymentTemplateHistory {
                app_id: pipeline.app_id,
                pipeline_id: Some(pipeline.id),
                target_environment: Some(pipeline.environment_id),
                template: effective_template(env_override, &chart),
                image_descriptor_template: rendered_image_template,
                template_name: template_name(&chart_ref),
                template_version: chart_ref.version.to_string(),
                is_app_metrics_enabled: app_metrics,
                deployed: true,
                deployed_on: Some(deployed_on),
                deployed_by: Some(deployed_by),
                variable_snapshot,
                audit: AuditLog::at(deployed_on, deployed_by),
            })
            .await?;
        info!(history_id = %entry.id, pipeline_id = %pipeline.id, "Recorded deployment trigger history");
        Ok(entry)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Deployed entry `id` of `pipeline_id`.
    pub async fn get_history_by_id(
        &self,
        id: HistoryId,
        pipeline_id: CdPipelineId,
    ) -> ShipyardResult<HistoryDetail> {
        self.history
            .history_get(id)
            .await?
            .filter(|h| h.pipeline_id == Some(pipeline_id) && h.deployed)
            .map(|h| HistoryDetail::from(&h))
            .ok_or_else(|| ShipyardError::not_found(EntityKind::DeploymentTemplateHistory, id))
    }

    async fn deployed_with_runs(
        &self,
        pipeline_id: CdPipelineId,
    ) -> ShipyardResult<Vec<(DeploymentTemplateHistory, CdWorkflowRunner)>> {
        let histories = self
            .history
            .history_list_deployed_by_pipeline(pipeline_id)
            .await?;
        let runs: HashMap<Timestamp, CdWorkflowRunner> = self
            .history
            .cd_runner_list_deploys(pipeline_id)
            .await?
            .into_iter()
            .map(|r| (r.started_on, r))
            .collect();
        Ok(histories
            .into_iter()
            .filter_map(|h| {
                let run = runs.get(&h.deployed_on?)?.clone();
                Some((h, run))
            })
            .collect())
    }

    /// Deployed entries with their run status and deployer email, newest
    /// first, paged by `offset`/`limit`.
    pub async fn get_deployment_details(
        &self,
        pipeline_id: CdPipelineId,
        offset: usize,
        limit: usize,
    ) -> ShipyardResult<Vec<DeploymentDetail>> {
        let joined = self.deployed_with_runs(pipeline_id).await?;
        let mut details = Vec::new();
        for (history, run) in joined.into_iter().skip(offset).take(limit) {
            let (Some(deployed_on), Some(deployed_by)) = (history.deployed_on, history.deployed_by)
            else {
                continue;
            };
            let email_id = match self.history.user_get(deployed_by).await? {
                Some(user) => user.email_id,
                None => {
                    warn!(user_id = %deployed_by, history_id = %history.id, "Unable to find user by id");
                    String::new()
                }
            };
            details.push(DeploymentDetail {
                history_id: history.id,
                pipeline_id,
                deployed_on,
                deployed_by,
                email_id,
                deployment_status: run.status,
                wfr_id: run.id,
                workflow_type: run.workflow_type,
            });
        }
        Ok(details)
    }

    /// Deployed entries up to and including `base_history_id`, newest first.
    pub async fn get_deployed_list(
        &self,
        pipeline_id: CdPipelineId,
        base_history_id: HistoryId,
    ) -> ShipyardResult<Vec<DeployedHistorySummary>> {
        let joined = self.deployed_with_runs(pipeline_id).await?;
        let mut list = Vec::new();
        for (history, run) in joined.into_iter().filter(|(h, _)| h.id <= base_history_id) {
            let Some(deployed_on) = history.deployed_on else {
                continue;
            };
            let deployed_by = match history.deployed_by {
                Some(user) => self
                    .history
                    .user_get(user)
                    .await?
                    .map(|u| u.email_id)
                    .unwrap_or_default(),
                None => String::new(),
            };
            list.push(DeployedHistorySummary {
                id: history.id,
                deployed_on,
                deployed_by,
                deployment_status: run.status,
            });
        }
        Ok(list)
    }

    async fn find_for_run(
        &self,
        pipeline_id: CdPipelineId,
        run_id: CdWorkflowRunnerId,
    ) -> ShipyardResult<Option<DeploymentTemplateHistory>> {
        let Some(run) = self
            .history
            .cd_runner_get(run_id)
            .await?
            .filter(|r| r.cd_pipeline_id == pipeline_id)
        else {
            return Ok(None);
        };
        Ok(self
            .history
            .history_list_deployed_by_pipeline(pipeline_id)
            .await?
            .into_iter()
            .find(|h| h.deployed_on == Some(run.started_on)))
    }

    /// History entry deployed by run `run_id`.
    pub async fn get_history_by_pipeline_and_run_id(
        &self,
        pipeline_id: CdPipelineId,
        run_id: CdWorkflowRunnerId,
    ) -> ShipyardResult<HistoryDetail> {
        self.find_for_run(pipeline_id, run_id)
            .await?
            .map(|h| HistoryDetail::from(&h))
            .ok_or_else(|| ShipyardError::not_found(EntityKind::DeploymentTemplateHistory, run_id.0))
    }

    pub async fn check_history_exists_for_run(
        &self,
        pipeline_id: CdPipelineId,
        run_id: CdWorkflowRunnerId,
    ) -> ShipyardResult<Option<HistoryId>> {
        Ok(self.find_for_run(pipeline_id, run_id).await?.map(|h| h.id))
    }
}

fn template_name(chart_ref: &ChartRef) -> String {
    if chart_ref.name.is_empty() {
        DEFAULT_TEMPLATE_NAME.to_string()
    } else {
        chart_ref.name.clone()
    }
}

fn effective_template(env_override: &EnvOverride, chart: &Chart) -> serde_json::Value {
    if env_override.is_override {
        env_override.env_override_values.clone()
    } else {
        chart.global_override.clone()
    }
}
