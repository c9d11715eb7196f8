//! Shipyard Storage
//!
//! Async storage traits for every persisted concern of the control plane,
//! and [`InMemoryStore`], a transactional in-memory implementation.
//!
//! Rows the domain creates (artifacts, charts, env overrides, history entries)
//! get store-assigned ids. Reference rows (pipelines, applications, workflows,
//! run records, users) are inserted with the id their owner already holds.
//!
//! Multi-row operations (`artifact_save_all`, the Latest/Previous flip) are
//! all-or-nothing: either every row is written or none is.

use ::async_trait::async_trait;
use shipyard_core::{
    AppId, AppLevelMetrics, Application, Artifact, ArtifactId, CdPipeline, CdPipelineId,
    CdWorkflowRunner, CdWorkflowRunnerId, Chart, ChartId, ChartRef, ChartRefId, ChartRepo,
    ChartVersion, CiPipeline, CiPipelineId, CiWorkflow, DeploymentTemplateHistory,
    DownstreamTarget, EnvLevelAppMetrics, EnvOverride, EnvOverrideId, Environment,
    EnvironmentId, ExternalCiId, ExternalCiPipeline, HistoryId, NewArtifact,
    NewDeploymentTemplateHistory, NewEnvOverride, NewChart, ShipyardResult, Timestamp, User,
    UserId, WorkflowId,
};

mod memory;

pub use memory::InMemoryStore;

// ============================================================================
// ARTIFACTS
// ============================================================================

/// Durable record of built container images.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Insert one artifact. Empty image or digest is a constraint violation.
    async fn artifact_save(&self, artifact: NewArtifact) -> ShipyardResult<Artifact>;

    /// Insert a batch in one transaction. If any row fails, none is written.
    async fn artifact_save_all(&self, artifacts: Vec<NewArtifact>) -> ShipyardResult<Vec<Artifact>>;

    /// Mark the workflow succeeded and insert the artifact in one transaction.
    async fn artifact_save_with_workflow_success(
        &self,
        artifact: NewArtifact,
        workflow_id: WorkflowId,
        finished_on: Timestamp,
    ) -> ShipyardResult<Artifact>;

    async fn artifact_get(&self, id: ArtifactId) -> ShipyardResult<Option<Artifact>>;

    /// Only used as the rollback of an external ingestion that triggered
    /// nothing.
    async fn artifact_delete(&self, id: ArtifactId) -> ShipyardResult<()>;

    async fn artifact_find_latest_by_pipeline(
        &self,
        pipeline_id: CiPipelineId,
    ) -> ShipyardResult<Option<Artifact>>;

    /// Newest artifact carrying this digest.
    async fn artifact_find_by_digest(&self, digest: &str) -> ShipyardResult<Option<Artifact>>;

    /// Artifact recorded by the success of `workflow_id`. Clones carry no
    /// workflow and are never returned.
    async fn artifact_find_by_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> ShipyardResult<Option<Artifact>>;

    /// Clones synthesised from `parent`.
    async fn artifact_list_by_parent(&self, parent: ArtifactId) -> ShipyardResult<Vec<Artifact>>;

    /// Artifacts referenced by succeeded deploy runs of a CD pipeline, newest
    /// first.
    async fn artifact_list_deployed_for_cd_pipeline(
        &self,
        cd_pipeline_id: CdPipelineId,
    ) -> ShipyardResult<Vec<Artifact>>;
}

// ============================================================================
// BUILD WORKFLOWS
// ============================================================================

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn ci_workflow_insert(&self, workflow: &CiWorkflow) -> ShipyardResult<()>;

    async fn ci_workflow_get(&self, id: WorkflowId) -> ShipyardResult<Option<CiWorkflow>>;

    /// Persist a status change. Rejects transitions out of terminal states.
    async fn ci_workflow_update(&self, workflow: &CiWorkflow) -> ShipyardResult<()>;
}

// ============================================================================
// PIPELINES
// ============================================================================

/// Read access to pipeline topology.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    async fn ci_pipeline_get(&self, id: CiPipelineId) -> ShipyardResult<Option<CiPipeline>>;

    /// Non-deleted pipelines declaring `parent` as their parent.
    async fn ci_pipeline_find_children(&self, parent: CiPipelineId)
        -> ShipyardResult<Vec<CiPipeline>>;

    async fn external_ci_get(&self, id: ExternalCiId)
        -> ShipyardResult<Option<ExternalCiPipeline>>;

    /// CD pipelines fed by an external CI source.
    async fn external_ci_downstream_targets(
        &self,
        id: ExternalCiId,
    ) -> ShipyardResult<Vec<DownstreamTarget>>;

    async fn cd_pipeline_get(&self, id: CdPipelineId) -> ShipyardResult<Option<CdPipeline>>;

    async fn cd_pipeline_find_by_app_and_env(
        &self,
        app_id: AppId,
        env_id: EnvironmentId,
    ) -> ShipyardResult<Option<CdPipeline>>;

    /// Pipelines of the chart's application whose environment has no active
    /// override of `chart_id`.
    async fn cd_pipeline_find_not_overriding_chart(
        &self,
        app_id: AppId,
        chart_id: ChartId,
    ) -> ShipyardResult<Vec<CdPipeline>>;

    async fn app_get(&self, id: AppId) -> ShipyardResult<Option<Application>>;

    async fn environment_get(&self, id: EnvironmentId) -> ShipyardResult<Option<Environment>>;
}

// ============================================================================
// CHARTS
// ============================================================================

#[async_trait]
pub trait ChartStore: Send + Sync {
    async fn chart_ref_get(&self, id: ChartRefId) -> ShipyardResult<Option<ChartRef>>;

    async fn chart_repo_get_default(&self) -> ShipyardResult<Option<ChartRepo>>;

    async fn chart_get(&self, id: ChartId) -> ShipyardResult<Option<Chart>>;

    async fn chart_find_latest(&self, app_id: AppId) -> ShipyardResult<Option<Chart>>;

    async fn chart_find_previous(&self, app_id: AppId) -> ShipyardResult<Option<Chart>>;

    async fn chart_find_by_app_and_ref(
        &self,
        app_id: AppId,
        chart_ref_id: ChartRefId,
    ) -> ShipyardResult<Option<Chart>>;

    async fn chart_list_by_app(&self, app_id: AppId) -> ShipyardResult<Vec<Chart>>;

    /// Highest version in a `(repo, chart name, major.minor)` bucket.
    async fn chart_max_version_in_bucket(
        &self,
        chart_repo: &str,
        chart_name: &str,
        major: u32,
        minor: u32,
    ) -> ShipyardResult<Option<ChartVersion>>;

    /// Insert a chart as its application's only latest row, demoting the
    /// prior latest to previous and clearing every other flag, in one
    /// transaction.
    async fn chart_create_latest(&self, chart: NewChart) -> ShipyardResult<Chart>;

    /// Write `chart` in place and make it the latest, with the same flag flip
    /// as [`ChartStore::chart_create_latest`] when it was not latest already.
    async fn chart_update_as_latest(&self, chart: &Chart) -> ShipyardResult<Chart>;

    async fn env_override_get(&self, id: EnvOverrideId) -> ShipyardResult<Option<EnvOverride>>;

    async fn env_override_find_by_chart(&self, chart_id: ChartId)
        -> ShipyardResult<Vec<EnvOverride>>;

    async fn env_override_find_by_chart_and_env(
        &self,
        chart_id: ChartId,
        env_id: EnvironmentId,
    ) -> ShipyardResult<Option<EnvOverride>>;

    /// Insert an env override as latest for its (application, environment),
    /// demoting the prior one to previous.
    async fn env_override_create_latest(
        &self,
        env_override: NewEnvOverride,
    ) -> ShipyardResult<EnvOverride>;

    async fn app_metrics_get(&self, app_id: AppId) -> ShipyardResult<Option<AppLevelMetrics>>;

    async fn app_metrics_upsert(
        &self,
        app_id: AppId,
        enabled: bool,
        user: UserId,
    ) -> ShipyardResult<AppLevelMetrics>;

    async fn env_metrics_get(
        &self,
        app_id: AppId,
        env_id: EnvironmentId,
    ) -> ShipyardResult<Option<EnvLevelAppMetrics>>;

    async fn env_metrics_upsert(
        &self,
        app_id: AppId,
        env_id: EnvironmentId,
        enabled: bool,
        user: UserId,
    ) -> ShipyardResult<EnvLevelAppMetrics>;
}

// ============================================================================
// HISTORY & DEPLOYMENT RUNS
// ============================================================================

/// Append-only deployment template history plus the run records it is
/// reconciled against.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn history_insert(
        &self,
        entry: NewDeploymentTemplateHistory,
    ) -> ShipyardResult<DeploymentTemplateHistory>;

    /// Append a batch in one transaction.
    async fn history_insert_all(
        &self,
        entries: Vec<NewDeploymentTemplateHistory>,
    ) -> ShipyardResult<Vec<DeploymentTemplateHistory>>;

    async fn history_get(&self, id: HistoryId) -> ShipyardResult<Option<DeploymentTemplateHistory>>;

    async fn history_list_by_app(&self, app_id: AppId)
        -> ShipyardResult<Vec<DeploymentTemplateHistory>>;

    /// Deployed entries of a pipeline, newest first.
    async fn history_list_deployed_by_pipeline(
        &self,
        pipeline_id: CdPipelineId,
    ) -> ShipyardResult<Vec<DeploymentTemplateHistory>>;

    async fn cd_runner_insert(&self, runner: &CdWorkflowRunner) -> ShipyardResult<()>;

    async fn cd_runner_get(&self, id: CdWorkflowRunnerId)
        -> ShipyardResult<Option<CdWorkflowRunner>>;

    /// Deploy-stage runs of a pipeline.
    async fn cd_runner_list_deploys(
        &self,
        pipeline_id: CdPipelineId,
    ) -> ShipyardResult<Vec<CdWorkflowRunner>>;

    async fn user_get(&self, id: UserId) -> ShipyardResult<Option<User>>;
}
