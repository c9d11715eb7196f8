//! In-memory storage for tests and local development.
//!
//! All tables sit behind one `RwLock`, so every trait method is a single
//! transaction: multi-row writes validate first and apply under the same
//! write guard, and readers never observe a half-applied flag flip.

use crate::{ArtifactStore, ChartStore, HistoryStore, PipelineRepository, WorkflowStore};
use ::async_trait::async_trait;
use shipyard_core::{
    AppId, AppLevelMetrics, Application, Artifact, ArtifactId, AuditLog, CdPipeline,
    CdPipelineId, CdWorkflowRunner, CdWorkflowRunnerId, CdWorkflowType, Chart, ChartId, ChartRef,
    ChartRefId, ChartRepo, ChartRepoId, ChartVersion, CiPipeline, CiPipelineId, CiWorkflow,
    DeploymentTemplateHistory, DownstreamTarget, EntityKind, EnvLevelAppMetrics, EnvOverride,
    EnvOverrideId, Environment, EnvironmentId, ExternalCiId, ExternalCiPipeline, HistoryId,
    NewArtifact, NewChart, NewDeploymentTemplateHistory, NewEnvOverride, ShipyardError,
    ShipyardResult, StorageError, Timestamp, User, UserId, ValidationError, WorkflowId,
    WorkflowStatus,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct Sequences {
    artifact: i64,
    chart: i64,
    env_override: i64,
    history: i64,
}

fn next(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[derive(Debug, Default)]
struct Tables {
    artifacts: BTreeMap<ArtifactId, Artifact>,
    workflows: HashMap<WorkflowId, CiWorkflow>,
    ci_pipelines: BTreeMap<CiPipelineId, CiPipeline>,
    external_cis: HashMap<ExternalCiId, ExternalCiPipeline>,
    cd_pipelines: BTreeMap<CdPipelineId, CdPipeline>,
    apps: HashMap<AppId, Application>,
    environments: HashMap<EnvironmentId, Environment>,
    chart_repos: BTreeMap<ChartRepoId, ChartRepo>,
    default_chart_repo: Option<ChartRepoId>,
    chart_refs: HashMap<ChartRefId, ChartRef>,
    charts: BTreeMap<ChartId, Chart>,
    env_overrides: BTreeMap<EnvOverrideId, EnvOverride>,
    app_metrics: HashMap<AppId, AppLevelMetrics>,
    env_metrics: HashMap<(AppId, EnvironmentId), EnvLevelAppMetrics>,
    history: BTreeMap<HistoryId, DeploymentTemplateHistory>,
    cd_runners: BTreeMap<CdWorkflowRunnerId, CdWorkflowRunner>,
    users: HashMap<UserId, User>,
    seq: Sequences,
}

impl Tables {
    /// Demote every other chart of the application: the current latest
    /// becomes previous, everything else loses both flags.
    fn demote_charts(&mut self, app_id: AppId, keep: ChartId) {
        for chart in self
            .charts
            .values_mut()
            .filter(|c| c.app_id == app_id && c.id != keep)
        {
            chart.previous = chart.latest;
            chart.latest = false;
        }
    }

    fn demote_env_overrides(&mut self, app_id: AppId, env_id: EnvironmentId, keep: EnvOverrideId) {
        let app_charts: HashSet<ChartId> = self
            .charts
            .values()
            .filter(|c| c.app_id == app_id)
            .map(|c| c.id)
            .collect();
        for eo in self.env_overrides.values_mut().filter(|eo| {
            eo.id != keep && eo.target_environment == env_id && app_charts.contains(&eo.chart_id)
        }) {
            eo.previous = eo.latest;
            eo.latest = false;
        }
    }
}

fn validate_artifact(artifact: &NewArtifact) -> Result<(), StorageError> {
    if artifact.image.trim().is_empty() {
        return Err(StorageError::ConstraintViolation {
            constraint: "ci_artifact.image".to_string(),
            reason: "image must not be empty".to_string(),
        });
    }
    if artifact.image_digest.trim().is_empty() {
        return Err(StorageError::ConstraintViolation {
            constraint: "ci_artifact.image_digest".to_string(),
            reason: "image digest must not be empty".to_string(),
        });
    }
    Ok(())
}

fn not_found(entity: EntityKind, id: impl Into<i64>) -> ShipyardError {
    StorageError::NotFound {
        entity,
        id: id.into(),
    }
    .into()
}

/// Transactional in-memory store implementing every storage trait.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StorageError> {
        self.tables.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StorageError> {
        self.tables.write().map_err(|_| StorageError::LockPoisoned)
    }

    // ========================================================================
    // SEEDING
    // ========================================================================

    pub fn insert_app(&self, app: Application) -> ShipyardResult<()> {
        self.write()?.apps.insert(app.id, app);
        Ok(())
    }

    pub fn insert_environment(&self, env: Environment) -> ShipyardResult<()> {
        self.write()?.environments.insert(env.id, env);
        Ok(())
    }

    pub fn insert_ci_pipeline(&self, pipeline: CiPipeline) -> ShipyardResult<()> {
        self.write()?.ci_pipelines.insert(pipeline.id, pipeline);
        Ok(())
    }

    pub fn insert_external_ci(&self, external: ExternalCiPipeline) -> ShipyardResult<()> {
        self.write()?.external_cis.insert(external.id, external);
        Ok(())
    }

    pub fn insert_cd_pipeline(&self, pipeline: CdPipeline) -> ShipyardResult<()> {
        self.write()?.cd_pipelines.insert(pipeline.id, pipeline);
        Ok(())
    }

    pub fn insert_chart_repo(&self, repo: ChartRepo, is_default: bool) -> ShipyardResult<()> {
        let mut tables = self.write()?;
        if is_default {
            tables.default_chart_repo = Some(repo.id);
        }
        tables.chart_repos.insert(repo.id, repo);
        Ok(())
    }

    pub fn insert_chart_ref(&self, chart_ref: ChartRef) -> ShipyardResult<()> {
        self.write()?.chart_refs.insert(chart_ref.id, chart_ref);
        Ok(())
    }

    pub fn insert_user(&self, user: User) -> ShipyardResult<()> {
        self.write()?.users.insert(user.id, user);
        Ok(())
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn artifact_count(&self) -> ShipyardResult<usize> {
        Ok(self.read()?.artifacts.len())
    }

    pub fn history_count(&self) -> ShipyardResult<usize> {
        Ok(self.read()?.history.len())
    }

    /// Number of charts of the application flagged latest.
    pub fn latest_chart_count(&self, app_id: AppId) -> ShipyardResult<usize> {
        Ok(self
            .read()?
            .charts
            .values()
            .filter(|c| c.app_id == app_id && c.latest)
            .count())
    }
}

// ============================================================================
// ARTIFACTS
// ============================================================================

#[async_trait]
impl ArtifactStore for InMemoryStore {
    async fn artifact_save(&self, artifact: NewArtifact) -> ShipyardResult<Artifact> {
        validate_artifact(&artifact)?;
        let mut tables = self.write()?;
        let id = ArtifactId(next(&mut tables.seq.artifact));
        let stored = artifact.with_id(id);
        tables.artifacts.insert(id, stored.clone());
        Ok(stored)
    }

    async fn artifact_save_all(&self, artifacts: Vec<NewArtifact>) -> ShipyardResult<Vec<Artifact>> {
        for artifact in &artifacts {
            validate_artifact(artifact)?;
        }
        let mut tables = self.write()?;
        let mut saved = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let id = ArtifactId(next(&mut tables.seq.artifact));
            let stored = artifact.with_id(id);
            tables.artifacts.insert(id, stored.clone());
            saved.push(stored);
        }
        Ok(saved)
    }

    async fn artifact_save_with_workflow_success(
        &self,
        artifact: NewArtifact,
        workflow_id: WorkflowId,
        finished_on: Timestamp,
    ) -> ShipyardResult<Artifact> {
        validate_artifact(&artifact)?;
        let mut tables = self.write()?;
        let workflow = tables
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| not_found(EntityKind::CiWorkflow, workflow_id))?;
        if !workflow.status.can_transition_to(WorkflowStatus::Succeeded) {
            return Err(ValidationError::InvalidStatusTransition {
                workflow_id: workflow_id.0,
                from: workflow.status.to_string(),
                to: WorkflowStatus::Succeeded.to_string(),
            }
            .into());
        }
        workflow.status = WorkflowStatus::Succeeded;
        workflow.finished_on = Some(finished_on);

        let id = ArtifactId(next(&mut tables.seq.artifact));
        let stored = artifact.with_id(id);
        tables.artifacts.insert(id, stored.clone());
        Ok(stored)
    }

    async fn artifact_get(&self, id: ArtifactId) -> ShipyardResult<Option<Artifact>> {
        Ok(self.read()?.artifacts.get(&id).cloned())
    }

    async fn artifact_delete(&self, id: ArtifactId) -> ShipyardResult<()> {
        self.write()?
            .artifacts
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(EntityKind::Artifact, id))
    }

    async fn artifact_find_latest_by_pipeline(
        &self,
        pipeline_id: CiPipelineId,
    ) -> ShipyardResult<Option<Artifact>> {
        Ok(self
            .read()?
            .artifacts
            .values()
            .rev()
            .find(|a| a.pipeline_id == Some(pipeline_id))
            .cloned())
    }

    async fn artifact_find_by_digest(&self, digest: &str) -> ShipyardResult<Option<Artifact>> {
        Ok(self
            .read()?
            .artifacts
            .values()
            .rev()
            .find(|a| a.image_digest == digest)
            .cloned())
    }

    async fn artifact_find_by_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> ShipyardResult<Option<Artifact>> {
        Ok(self
            .read()?
            .artifacts
            .values()
            .find(|a| a.workflow_id == Some(workflow_id))
            .cloned())
    }

    async fn artifact_list_by_parent(&self, parent: ArtifactId) -> ShipyardResult<Vec<Artifact>> {
        Ok(self
            .read()?
            .artifacts
            .values()
            .filter(|a| a.parent_ci_artifact == Some(parent))
            .cloned()
            .collect())
    }

    async fn artifact_list_deployed_for_cd_pipeline(
        &self,
        cd_pipeline_id: CdPipelineId,
    ) -> ShipyardResult<Vec<Artifact>> {
        let tables = self.read()?;
        let mut runs: Vec<&CdWorkflowRunner> = tables
            .cd_runners
            .values()
            .filter(|r| {
                r.cd_pipeline_id == cd_pipeline_id
                    && r.workflow_type == CdWorkflowType::Deploy
                    && r.status == WorkflowStatus::Succeeded
            })
            .collect();
        runs.sort_by(|a, b| b.started_on.cmp(&a.started_on));

        let mut seen = HashSet::new();
        Ok(runs
            .into_iter()
            .filter(|r| seen.insert(r.artifact_id))
            .filter_map(|r| tables.artifacts.get(&r.artifact_id).cloned())
            .collect())
    }
}

// ============================================================================
// BUILD WORKFLOWS
// ============================================================================

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn ci_workflow_insert(&self, workflow: &CiWorkflow) -> ShipyardResult<()> {
        let mut tables = self.write()?;
        if tables.workflows.contains_key(&workflow.id) {
            return Err(StorageError::InsertFailed {
                entity: EntityKind::CiWorkflow,
                reason: "already exists".to_string(),
            }
            .into());
        }
        tables.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn ci_workflow_get(&self, id: WorkflowId) -> ShipyardResult<Option<CiWorkflow>> {
        Ok(self.read()?.workflows.get(&id).cloned())
    }

    async fn ci_workflow_update(&self, workflow: &CiWorkflow) -> ShipyardResult<()> {
        let mut tables = self.write()?;
        let existing = tables
            .workflows
            .get_mut(&workflow.id)
            .ok_or_else(|| not_found(EntityKind::CiWorkflow, workflow.id))?;
        if !existing.status.can_transition_to(workflow.status) {
            return Err(ValidationError::InvalidStatusTransition {
                workflow_id: workflow.id.0,
                from: existing.status.to_string(),
                to: workflow.status.to_string(),
            }
            .into());
        }
        *existing = workflow.clone();
        Ok(())
    }
}

// ============================================================================
// PIPELINES
// ============================================================================

#[async_trait]
impl PipelineRepository for InMemoryStore {
    async fn ci_pipeline_get(&self, id: CiPipelineId) -> ShipyardResult<Option<CiPipeline>> {
        Ok(self.read()?.ci_pipelines.get(&id).filter(|p| !p.deleted).cloned())
    }

    async fn ci_pipeline_find_children(
        &self,
        parent: CiPipelineId,
    ) -> ShipyardResult<Vec<CiPipeline>> {
        Ok(self
            .read()?
            .ci_pipelines
            .values()
            .filter(|p| p.parent_ci_pipeline == Some(parent) && !p.deleted)
            .cloned()
            .collect())
    }

    async fn external_ci_get(
        &self,
        id: ExternalCiId,
    ) -> ShipyardResult<Option<ExternalCiPipeline>> {
        Ok(self.read()?.external_cis.get(&id).filter(|e| e.active).cloned())
    }

    async fn external_ci_downstream_targets(
        &self,
        id: ExternalCiId,
    ) -> ShipyardResult<Vec<DownstreamTarget>> {
        let tables = self.read()?;
        Ok(tables
            .cd_pipelines
            .values()
            .filter(|p| p.external_ci_id == Some(id) && !p.deleted)
            .filter_map(|p| {
                let app = tables.apps.get(&p.app_id)?;
                let env = tables.environments.get(&p.environment_id)?;
                Some(DownstreamTarget::new(p, app, env))
            })
            .collect())
    }

    async fn cd_pipeline_get(&self, id: CdPipelineId) -> ShipyardResult<Option<CdPipeline>> {
        Ok(self.read()?.cd_pipelines.get(&id).filter(|p| !p.deleted).cloned())
    }

    async fn cd_pipeline_find_by_app_and_env(
        &self,
        app_id: AppId,
        env_id: EnvironmentId,
    ) -> ShipyardResult<Option<CdPipeline>> {
        Ok(self
            .read()?
            .cd_pipelines
            .values()
            .find(|p| p.app_id == app_id && p.environment_id == env_id && !p.deleted)
            .cloned())
    }

    async fn cd_pipeline_find_not_overriding_chart(
        &self,
        app_id: AppId,
        chart_id: ChartId,
    ) -> ShipyardResult<Vec<CdPipeline>> {
        let tables = self.read()?;
        let overriding: HashSet<EnvironmentId> = tables
            .env_overrides
            .values()
            .filter(|eo| eo.chart_id == chart_id && eo.is_override && eo.active)
            .map(|eo| eo.target_environment)
            .collect();
        Ok(tables
            .cd_pipelines
            .values()
            .filter(|p| {
                p.app_id == app_id && !p.deleted && !overriding.contains(&p.environment_id)
            })
            .cloned()
            .collect())
    }

    async fn app_get(&self, id: AppId) -> ShipyardResult<Option<Application>> {
        Ok(self.read()?.apps.get(&id).cloned())
    }

    async fn environment_get(&self, id: EnvironmentId) -> ShipyardResult<Option<Environment>> {
        Ok(self.read()?.environments.get(&id).cloned())
    }
}

// ============================================================================
// CHARTS
// ============================================================================

#[async_trait]
impl ChartStore for InMemoryStore {
    async fn chart_ref_get(&self, id: ChartRefId) -> ShipyardResult<Option<ChartRef>> {
        Ok(self.read()?.chart_refs.get(&id).cloned())
    }

    async fn chart_repo_get_default(&self) -> ShipyardResult<Option<ChartRepo>> {
        let tables = self.read()?;
        Ok(tables
            .default_chart_repo
            .and_then(|id| tables.chart_repos.get(&id))
            .cloned())
    }

    async fn chart_get(&self, id: ChartId) -> ShipyardResult<Option<Chart>> {
        Ok(self.read()?.charts.get(&id).cloned())
    }

    async fn chart_find_latest(&self, app_id: AppId) -> ShipyardResult<Option<Chart>> {
        Ok(self
            .read()?
            .charts
            .values()
            .find(|c| c.app_id == app_id && c.latest)
            .cloned())
    }

    async fn chart_find_previous(&self, app_id: AppId) -> ShipyardResult<Option<Chart>> {
        Ok(self
            .read()?
            .charts
            .values()
            .find(|c| c.app_id == app_id && c.previous)
            .cloned())
    }

    async fn chart_find_by_app_and_ref(
        &self,
        app_id: AppId,
        chart_ref_id: ChartRefId,
    ) -> ShipyardResult<Option<Chart>> {
        Ok(self
            .read()?
            .charts
            .values()
            .find(|c| c.app_id == app_id && c.chart_ref_id == chart_ref_id)
            .cloned())
    }

    async fn chart_list_by_app(&self, app_id: AppId) -> ShipyardResult<Vec<Chart>> {
        Ok(self
            .read()?
            .charts
            .values()
            .filter(|c| c.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn chart_max_version_in_bucket(
        &self,
        chart_repo: &str,
        chart_name: &str,
        major: u32,
        minor: u32,
    ) -> ShipyardResult<Option<ChartVersion>> {
        Ok(self
            .read()?
            .charts
            .values()
            .filter(|c| {
                c.chart_repo == chart_repo
                    && c.chart_name == chart_name
                    && c.chart_version.major == major
                    && c.chart_version.minor == minor
            })
            .map(|c| c.chart_version)
            .max())
    }

    async fn chart_create_latest(&self, chart: NewChart) -> ShipyardResult<Chart> {
        let mut tables = self.write()?;
        if tables
            .charts
            .values()
            .any(|c| c.app_id == chart.app_id && c.chart_ref_id == chart.chart_ref_id)
        {
            return Err(StorageError::ConstraintViolation {
                constraint: "charts.app_id_chart_ref_id".to_string(),
                reason: format!(
                    "application {} already has chart reference {}",
                    chart.app_id, chart.chart_ref_id
                ),
            }
            .into());
        }
        let id = ChartId(next(&mut tables.seq.chart));
        tables.demote_charts(chart.app_id, id);
        let stored = chart.with_id(id);
        tables.charts.insert(id, stored.clone());
        Ok(stored)
    }

    async fn chart_update_as_latest(&self, chart: &Chart) -> ShipyardResult<Chart> {
        let mut tables = self.write()?;
        let was_latest = tables
            .charts
            .get(&chart.id)
            .map(|c| c.latest)
            .ok_or_else(|| not_found(EntityKind::Chart, chart.id))?;
        if !was_latest {
            tables.demote_charts(chart.app_id, chart.id);
        }
        let mut stored = chart.clone();
        stored.latest = true;
        stored.previous = false;
        tables.charts.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn env_override_get(&self, id: EnvOverrideId) -> ShipyardResult<Option<EnvOverride>> {
        Ok(self.read()?.env_overrides.get(&id).cloned())
    }

    async fn env_override_find_by_chart(
        &self,
        chart_id: ChartId,
    ) -> ShipyardResult<Vec<EnvOverride>> {
        Ok(self
            .read()?
            .env_overrides
            .values()
            .filter(|eo| eo.chart_id == chart_id && eo.active)
            .cloned()
            .collect())
    }

    async fn env_override_find_by_chart_and_env(
        &self,
        chart_id: ChartId,
        env_id: EnvironmentId,
    ) -> ShipyardResult<Option<EnvOverride>> {
        Ok(self
            .read()?
            .env_overrides
            .values()
            .rev()
            .find(|eo| eo.chart_id == chart_id && eo.target_environment == env_id && eo.active)
            .cloned())
    }

    async fn env_override_create_latest(
        &self,
        env_override: NewEnvOverride,
    ) -> ShipyardResult<EnvOverride> {
        let mut tables = self.write()?;
        let app_id = tables
            .charts
            .get(&env_override.chart_id)
            .map(|c| c.app_id)
            .ok_or_else(|| not_found(EntityKind::Chart, env_override.chart_id))?;
        let id = EnvOverrideId(next(&mut tables.seq.env_override));
        tables.demote_env_overrides(app_id, env_override.target_environment, id);
        let stored = EnvOverride {
            id,
            chart_id: env_override.chart_id,
            target_environment: env_override.target_environment,
            env_override_values: env_override.env_override_values,
            is_override: env_override.is_override,
            latest: true,
            previous: false,
            active: env_override.active,
            audit: env_override.audit,
        };
        tables.env_overrides.insert(id, stored.clone());
        Ok(stored)
    }

    async fn app_metrics_get(&self, app_id: AppId) -> ShipyardResult<Option<AppLevelMetrics>> {
        Ok(self.read()?.app_metrics.get(&app_id).cloned())
    }

    async fn app_metrics_upsert(
        &self,
        app_id: AppId,
        enabled: bool,
        user: UserId,
    ) -> ShipyardResult<AppLevelMetrics> {
        let mut tables = self.write()?;
        let row = tables
            .app_metrics
            .entry(app_id)
            .and_modify(|m| {
                m.app_metrics = enabled;
                m.audit.touch(user);
            })
            .or_insert_with(|| AppLevelMetrics {
                app_id,
                app_metrics: enabled,
                audit: AuditLog::now(user),
            });
        Ok(row.clone())
    }

    async fn env_metrics_get(
        &self,
        app_id: AppId,
        env_id: EnvironmentId,
    ) -> ShipyardResult<Option<EnvLevelAppMetrics>> {
        Ok(self.read()?.env_metrics.get(&(app_id, env_id)).cloned())
    }

    async fn env_metrics_upsert(
        &self,
        app_id: AppId,
        env_id: EnvironmentId,
        enabled: bool,
        user: UserId,
    ) -> ShipyardResult<EnvLevelAppMetrics> {
        let mut tables = self.write()?;
        let row = tables
            .env_metrics
            .entry((app_id, env_id))
            .and_modify(|m| {
                m.app_metrics = enabled;
                m.audit.touch(user);
            })
            .or_insert_with(|| EnvLevelAppMetrics {
                app_id,
                env_id,
                app_metrics: enabled,
                audit: AuditLog::now(user),
            });
        Ok(row.clone())
    }
}

// ============================================================================
// HISTORY & DEPLOYMENT RUNS
// ============================================================================

#[async_trait]
impl HistoryStore for InMemoryStore {
    async fn history_insert(
        &self,
        entry: NewDeploymentTemplateHistory,
    ) -> ShipyardResult<DeploymentTemplateHistory> {
        let mut tables = self.write()?;
        let id = HistoryId(next(&mut tables.seq.history));
        let stored = entry.with_id(id);
        tables.history.insert(id, stored.clone());
        Ok(stored)
    }

    async fn history_insert_all(
        &self,
        entries: Vec<NewDeploymentTemplateHistory>,
    ) -> ShipyardResult<Vec<DeploymentTemplateHistory>> {
        let mut tables = self.write()?;
        let mut saved = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = HistoryId(next(&mut tables.seq.history));
            let stored = entry.with_id(id);
            tables.history.insert(id, stored.clone());
            saved.push(stored);
        }
        Ok(saved)
    }

    async fn history_get(
        &self,
        id: HistoryId,
    ) -> ShipyardResult<Option<DeploymentTemplateHistory>> {
        Ok(self.read()?.history.get(&id).cloned())
    }

    async fn history_list_by_app(
        &self,
        app_id: AppId,
    ) -> ShipyardResult<Vec<DeploymentTemplateHistory>> {
        Ok(self
            .read()?
            .history
            .values()
            .filter(|h| h.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn history_list_deployed_by_pipeline(
        &self,
        pipeline_id: CdPipelineId,
    ) -> ShipyardResult<Vec<DeploymentTemplateHistory>> {
        Ok(self
            .read()?
            .history
            .values()
            .rev()
            .filter(|h| h.pipeline_id == Some(pipeline_id) && h.deployed)
            .cloned()
            .collect())
    }

    async fn cd_runner_insert(&self, runner: &CdWorkflowRunner) -> ShipyardResult<()> {
        let mut tables = self.write()?;
        if tables.cd_runners.contains_key(&runner.id) {
            return Err(StorageError::InsertFailed {
                entity: EntityKind::CdWorkflowRunner,
                reason: "already exists".to_string(),
            }
            .into());
        }
        tables.cd_runners.insert(runner.id, runner.clone());
        Ok(())
    }

    async fn cd_runner_get(
        &self,
        id: CdWorkflowRunnerId,
    ) -> ShipyardResult<Option<CdWorkflowRunner>> {
        Ok(self.read()?.cd_runners.get(&id).cloned())
    }

    async fn cd_runner_list_deploys(
        &self,
        pipeline_id: CdPipelineId,
    ) -> ShipyardResult<Vec<CdWorkflowRunner>> {
        Ok(self
            .read()?
            .cd_runners
            .values()
            .filter(|r| r.cd_pipeline_id == pipeline_id && r.workflow_type == CdWorkflowType::Deploy)
            .cloned()
            .collect())
    }

    async fn user_get(&self, id: UserId) -> ShipyardResult<Option<User>> {
        Ok(self.read()?.users.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;
    use shipyard_core::DataSource;

    fn new_artifact(image: &str, digest: &str) -> NewArtifact {
        NewArtifact {
            pipeline_id: Some(CiPipelineId(1)),
            external_ci_pipeline_id: None,
            image: image.to_string(),
            image_digest: digest.to_string(),
            material_info: "[]".to_string(),
            data_source: DataSource::CiRunner,
            workflow_id: None,
            parent_ci_artifact: None,
            scan_enabled: false,
            scanned: true,
            is_artifact_uploaded: false,
            audit: AuditLog::now(UserId(1)),
        }
    }

    fn new_chart(app: i64, chart_ref: i64, patch: u32) -> NewChart {
        NewChart {
            app_id: AppId(app),
            chart_repo_id: ChartRepoId(1),
            chart_repo: "default".to_string(),
            chart_name: format!("app-{}", app),
            chart_ref_id: ChartRefId(chart_ref),
            reference_template: "reference-chart".to_string(),
            values: json!({}),
            global_override: json!({}),
            image_descriptor_template: String::new(),
            chart_version: ChartVersion::new(1, 0, patch),
            audit: AuditLog::now(UserId(2)),
        }
    }

    #[tokio::test]
    async fn test_save_all_is_atomic() {
        let store = InMemoryStore::new();
        let batch = vec![
            new_artifact("repo/app:1", "sha256:a"),
            new_artifact("repo/app:1", "sha256:a"),
            new_artifact("repo/app:1", ""),
            new_artifact("repo/app:1", "sha256:a"),
        ];
        let err = store.artifact_save_all(batch).await.unwrap_err();
        assert!(matches!(
            err,
            ShipyardError::Persistence(StorageError::ConstraintViolation { .. })
        ));
        assert_eq!(store.artifact_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_by_digest_returns_newest() {
        let store = InMemoryStore::new();
        store.artifact_save(new_artifact("repo/app:1", "sha256:a")).await.unwrap();
        let second = store.artifact_save(new_artifact("repo/app:1", "sha256:a")).await.unwrap();
        let found = store.artifact_find_by_digest("sha256:a").await.unwrap().unwrap();
        assert_eq!(found.id, second.id);
        assert!(store.artifact_find_by_digest("sha256:zzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_then_get_is_none() {
        let store = InMemoryStore::new();
        let saved = store.artifact_save(new_artifact("repo/app:1", "sha256:a")).await.unwrap();
        store.artifact_delete(saved.id).await.unwrap();
        assert!(store.artifact_get(saved.id).await.unwrap().is_none());
        assert!(store.artifact_delete(saved.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_workflow_success_and_artifact_are_one_transaction() {
        let store = InMemoryStore::new();
        let workflow = CiWorkflow {
            id: WorkflowId(7),
            name: "build-7".to_string(),
            status: WorkflowStatus::Failed,
            message: String::new(),
            started_on: Utc::now(),
            finished_on: None,
            ci_pipeline_id: CiPipelineId(1),
            git_triggers: BTreeMap::new(),
            triggered_by: UserId(2),
        };
        store.ci_workflow_insert(&workflow).await.unwrap();

        let err = store
            .artifact_save_with_workflow_success(
                new_artifact("repo/app:1", "sha256:a"),
                WorkflowId(7),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShipyardError::Validation(ValidationError::InvalidStatusTransition { .. })
        ));
        assert_eq!(store.artifact_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_workflow_succeeds_once() {
        let store = InMemoryStore::new();
        store
            .ci_workflow_insert(&CiWorkflow {
                id: WorkflowId(8),
                name: "build-8".to_string(),
                status: WorkflowStatus::Running,
                message: String::new(),
                started_on: Utc::now(),
                finished_on: None,
                ci_pipeline_id: CiPipelineId(1),
                git_triggers: BTreeMap::new(),
                triggered_by: UserId(2),
            })
            .await
            .unwrap();
        let mut own = new_artifact("repo/app:1", "sha256:a");
        own.workflow_id = Some(WorkflowId(8));

        let first = store
            .artifact_save_with_workflow_success(own.clone(), WorkflowId(8), Utc::now())
            .await
            .unwrap();
        let err = store
            .artifact_save_with_workflow_success(own, WorkflowId(8), Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ShipyardError::Validation(ValidationError::InvalidStatusTransition { .. })
        ));
        assert_eq!(store.artifact_count().unwrap(), 1);
        let found = store.artifact_find_by_workflow(WorkflowId(8)).await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert!(store.artifact_find_by_workflow(WorkflowId(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_latest_flips_flags() {
        let store = InMemoryStore::new();
        let first = store.chart_create_latest(new_chart(1, 10, 1)).await.unwrap();
        let second = store.chart_create_latest(new_chart(1, 11, 2)).await.unwrap();
        let third = store.chart_create_latest(new_chart(1, 12, 3)).await.unwrap();

        let first = store.chart_get(first.id).await.unwrap().unwrap();
        let second = store.chart_get(second.id).await.unwrap().unwrap();
        assert!(!first.latest && !first.previous);
        assert!(!second.latest && second.previous);
        assert!(third.latest && !third.previous);

        let dup = store.chart_create_latest(new_chart(1, 10, 4)).await.unwrap_err();
        assert!(matches!(
            dup,
            ShipyardError::Persistence(StorageError::ConstraintViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_as_latest_promotes_older_chart() {
        let store = InMemoryStore::new();
        let old = store.chart_create_latest(new_chart(1, 10, 1)).await.unwrap();
        let current = store.chart_create_latest(new_chart(1, 11, 2)).await.unwrap();

        let old = store.chart_get(old.id).await.unwrap().unwrap();
        store.chart_update_as_latest(&old).await.unwrap();

        assert_eq!(store.chart_find_latest(AppId(1)).await.unwrap().unwrap().id, old.id);
        assert_eq!(store.chart_find_previous(AppId(1)).await.unwrap().unwrap().id, current.id);
    }

    #[tokio::test]
    async fn test_not_overriding_excludes_overridden_envs() {
        let store = InMemoryStore::new();
        let chart = store.chart_create_latest(new_chart(1, 10, 1)).await.unwrap();
        for (id, env) in [(1, 100), (2, 200)] {
            store
                .insert_cd_pipeline(CdPipeline {
                    id: CdPipelineId(id),
                    app_id: AppId(1),
                    environment_id: EnvironmentId(env),
                    name: format!("cd-{}", id),
                    ci_pipeline_id: None,
                    external_ci_id: None,
                    deleted: false,
                })
                .unwrap();
        }
        store
            .env_override_create_latest(NewEnvOverride {
                chart_id: chart.id,
                target_environment: EnvironmentId(200),
                env_override_values: json!({"replicas": 3}),
                is_override: true,
                active: true,
                audit: AuditLog::now(UserId(2)),
            })
            .await
            .unwrap();

        let pipelines = store
            .cd_pipeline_find_not_overriding_chart(AppId(1), chart.id)
            .await
            .unwrap();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].id, CdPipelineId(1));
    }

    proptest! {
        #[test]
        fn prop_exactly_one_latest(ops in prop::collection::vec((0u8..2, 0usize..8), 1..20)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryStore::new();
                let mut created: Vec<Chart> = Vec::new();
                let mut next_ref = 0;
                for (kind, pick) in ops {
                    if kind == 0 || created.is_empty() {
                        next_ref += 1;
                        let chart = store
                            .chart_create_latest(new_chart(1, next_ref, next_ref as u32))
                            .await
                            .unwrap();
                        created.push(chart);
                    } else {
                        let id = created[pick % created.len()].id;
                        let chart = store.chart_get(id).await.unwrap().unwrap();
                        store.chart_update_as_latest(&chart).await.unwrap();
                    }
                    prop_assert_eq!(store.latest_chart_count(AppId(1)).unwrap(), 1);
                    let previous = store
                        .chart_list_by_app(AppId(1))
                        .await
                        .unwrap()
                        .into_iter()
                        .filter(|c| c.previous)
                        .count();
                    prop_assert!(previous <= 1);
                }
                Ok(())
            })?;
        }
    }
}
