//! Core entity structures
//!
//! Persisted rows come in two shapes: a `New*` form the caller builds, and
//! the stored form carrying the surrogate id assigned by the store.

use crate::{
    AppId, ArtifactId, CdPipelineId, CdWorkflowRunnerId, CdWorkflowType, ChartId, ChartRefId,
    ChartRepoId, ChartVersion, CiPipelineId, DataSource, EnvOverrideId, EnvironmentId,
    ExternalCiId, HistoryId, Timestamp, UserId, WorkflowId, WorkflowStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Audit columns shared by every mutable table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLog {
    pub created_on: Timestamp,
    pub created_by: UserId,
    pub updated_on: Timestamp,
    pub updated_by: UserId,
}

impl AuditLog {
    pub fn now(user: UserId) -> Self {
        Self::at(Utc::now(), user)
    }

    pub fn at(ts: Timestamp, user: UserId) -> Self {
        Self {
            created_on: ts,
            created_by: user,
            updated_on: ts,
            updated_by: user,
        }
    }

    /// Stamp an update, keeping the creation columns.
    pub fn touch(&mut self, user: UserId) {
        self.updated_on = Utc::now();
        self.updated_by = user;
    }
}

// ============================================================================
// ARTIFACTS & BUILDS
// ============================================================================

/// An artifact before the store assigns it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArtifact {
    /// Owning internal build pipeline. `None` for webhook-sourced artifacts.
    pub pipeline_id: Option<CiPipelineId>,
    pub external_ci_pipeline_id: Option<ExternalCiId>,
    pub image: String,
    pub image_digest: String,
    /// Compact provenance JSON.
    pub material_info: String,
    pub data_source: DataSource,
    pub workflow_id: Option<WorkflowId>,
    /// Set only on clones synthesised for child pipelines.
    pub parent_ci_artifact: Option<ArtifactId>,
    pub scan_enabled: bool,
    pub scanned: bool,
    pub is_artifact_uploaded: bool,
    pub audit: AuditLog,
}

impl NewArtifact {
    pub fn with_id(self, id: ArtifactId) -> Artifact {
        Artifact {
            id,
            pipeline_id: self.pipeline_id,
            external_ci_pipeline_id: self.external_ci_pipeline_id,
            image: self.image,
            image_digest: self.image_digest,
            material_info: self.material_info,
            data_source: self.data_source,
            workflow_id: self.workflow_id,
            parent_ci_artifact: self.parent_ci_artifact,
            scan_enabled: self.scan_enabled,
            scanned: self.scanned,
            is_artifact_uploaded: self.is_artifact_uploaded,
            audit: self.audit,
        }
    }
}

/// A recorded container image plus its build provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub pipeline_id: Option<CiPipelineId>,
    pub external_ci_pipeline_id: Option<ExternalCiId>,
    pub image: String,
    pub image_digest: String,
    pub material_info: String,
    pub data_source: DataSource,
    pub workflow_id: Option<WorkflowId>,
    pub parent_ci_artifact: Option<ArtifactId>,
    pub scan_enabled: bool,
    pub scanned: bool,
    pub is_artifact_uploaded: bool,
    pub audit: AuditLog,
}

/// Commit metadata captured when a build was triggered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCommit {
    pub commit: String,
    pub author: String,
    pub message: String,
    pub date: Option<Timestamp>,
    #[serde(default)]
    pub changes: Vec<String>,
}

/// A single CI run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiWorkflow {
    pub id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub message: String,
    pub started_on: Timestamp,
    pub finished_on: Option<Timestamp>,
    pub ci_pipeline_id: CiPipelineId,
    /// Material index to the commit that triggered the build.
    pub git_triggers: BTreeMap<i64, GitCommit>,
    pub triggered_by: UserId,
}

// ============================================================================
// PIPELINES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiPipeline {
    pub id: CiPipelineId,
    pub app_id: AppId,
    pub name: String,
    /// Linked pipelines reuse the parent's build output instead of building.
    pub parent_ci_pipeline: Option<CiPipelineId>,
    pub scan_enabled: bool,
    pub deleted: bool,
}

/// A registered webhook-driven CI source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCiPipeline {
    pub id: ExternalCiId,
    pub app_id: AppId,
    pub access_token: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdPipeline {
    pub id: CdPipelineId,
    pub app_id: AppId,
    pub environment_id: EnvironmentId,
    pub name: String,
    pub ci_pipeline_id: Option<CiPipelineId>,
    pub external_ci_id: Option<ExternalCiId>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: AppId,
    pub app_name: String,
    pub team_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub name: String,
    pub environment_identifier: String,
}

/// A CD pipeline an external artifact may trigger, with the resource names
/// the authorisation predicate is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamTarget {
    pub cd_pipeline_id: CdPipelineId,
    /// `team/app`
    pub project_resource: String,
    /// `environment-identifier/app`
    pub env_resource: String,
}

impl DownstreamTarget {
    pub fn new(pipeline: &CdPipeline, app: &Application, env: &Environment) -> Self {
        Self {
            cd_pipeline_id: pipeline.id,
            project_resource: format!("{}/{}", app.team_name, app.app_name),
            env_resource: format!("{}/{}", env.environment_identifier, app.app_name),
        }
    }
}

// ============================================================================
// CHARTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRepo {
    pub id: ChartRepoId,
    pub name: String,
}

/// A reference chart template that application charts are built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartRef {
    pub id: ChartRefId,
    /// Family name. Empty means the default rollout chart.
    pub name: String,
    pub version: ChartVersion,
    pub location: String,
    pub default_values: Value,
    pub image_descriptor_template: String,
    pub user_uploaded: bool,
    pub app_metrics_supported: bool,
}

/// A chart version before the store assigns it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChart {
    pub app_id: AppId,
    pub chart_repo_id: ChartRepoId,
    pub chart_repo: String,
    pub chart_name: String,
    pub chart_ref_id: ChartRefId,
    pub reference_template: String,
    /// Reference defaults merged with the global override.
    pub values: Value,
    /// User supplied delta.
    pub global_override: Value,
    pub image_descriptor_template: String,
    pub chart_version: ChartVersion,
    pub audit: AuditLog,
}

impl NewChart {
    /// Stored form. New charts are always inserted as latest.
    pub fn with_id(self, id: ChartId) -> Chart {
        Chart {
            id,
            app_id: self.app_id,
            chart_repo_id: self.chart_repo_id,
            chart_repo: self.chart_repo,
            chart_name: self.chart_name,
            chart_ref_id: self.chart_ref_id,
            reference_template: self.reference_template,
            values: self.values,
            global_override: self.global_override,
            image_descriptor_template: self.image_descriptor_template,
            chart_version: self.chart_version,
            latest: true,
            previous: false,
            audit: self.audit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub id: ChartId,
    pub app_id: AppId,
    pub chart_repo_id: ChartRepoId,
    pub chart_repo: String,
    pub chart_name: String,
    pub chart_ref_id: ChartRefId,
    pub reference_template: String,
    pub values: Value,
    pub global_override: Value,
    pub image_descriptor_template: String,
    pub chart_version: ChartVersion,
    pub latest: bool,
    pub previous: bool,
    pub audit: AuditLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEnvOverride {
    pub chart_id: ChartId,
    pub target_environment: EnvironmentId,
    pub env_override_values: Value,
    pub is_override: bool,
    pub active: bool,
    pub audit: AuditLog,
}

/// Per-environment override of a chart. Latest/Previous are scoped per
/// (application, environment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvOverride {
    pub id: EnvOverrideId,
    pub chart_id: ChartId,
    pub target_environment: EnvironmentId,
    pub env_override_values: Value,
    /// `false` means the environment inherits the global values.
    pub is_override: bool,
    pub latest: bool,
    pub previous: bool,
    pub active: bool,
    pub audit: AuditLog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLevelMetrics {
    pub app_id: AppId,
    pub app_metrics: bool,
    pub audit: AuditLog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvLevelAppMetrics {
    pub app_id: AppId,
    pub env_id: EnvironmentId,
    pub app_metrics: bool,
    pub audit: AuditLog,
}

// ============================================================================
// HISTORY & DEPLOYMENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeploymentTemplateHistory {
    pub app_id: AppId,
    /// `None` for template-level entries with no concrete deployment target.
    pub pipeline_id: Option<CdPipelineId>,
    pub target_environment: Option<EnvironmentId>,
    pub template: Value,
    pub image_descriptor_template: String,
    pub template_name: String,
    pub template_version: String,
    pub is_app_metrics_enabled: bool,
    pub deployed: bool,
    pub deployed_on: Option<Timestamp>,
    pub deployed_by: Option<UserId>,
    pub variable_snapshot: BTreeMap<String, String>,
    pub audit: AuditLog,
}

impl NewDeploymentTemplateHistory {
    pub fn with_id(self, id: HistoryId) -> DeploymentTemplateHistory {
        DeploymentTemplateHistory {
            id,
            app_id: self.app_id,
            pipeline_id: self.pipeline_id,
            target_environment: self.target_environment,
            template: self.template,
            image_descriptor_template: self.image_descriptor_template,
            template_name: self.template_name,
            template_version: self.template_version,
            is_app_metrics_enabled: self.is_app_metrics_enabled,
            deployed: self.deployed,
            deployed_on: self.deployed_on,
            deployed_by: self.deployed_by,
            variable_snapshot: self.variable_snapshot,
            audit: self.audit,
        }
    }
}

/// Immutable audit record of a configuration or deployment event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTemplateHistory {
    pub id: HistoryId,
    pub app_id: AppId,
    pub pipeline_id: Option<CdPipelineId>,
    pub target_environment: Option<EnvironmentId>,
    pub template: Value,
    pub image_descriptor_template: String,
    pub template_name: String,
    pub template_version: String,
    pub is_app_metrics_enabled: bool,
    pub deployed: bool,
    pub deployed_on: Option<Timestamp>,
    pub deployed_by: Option<UserId>,
    pub variable_snapshot: BTreeMap<String, String>,
    pub audit: AuditLog,
}

/// One execution of a CD pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdWorkflowRunner {
    pub id: CdWorkflowRunnerId,
    pub cd_pipeline_id: CdPipelineId,
    pub workflow_type: CdWorkflowType,
    pub status: WorkflowStatus,
    pub started_on: Timestamp,
    pub artifact_id: ArtifactId,
    pub triggered_by: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email_id: String,
}
