//! Chart version service
//!
//! Creates and edits application chart versions. Each application has at most
//! one latest chart; the flag flip itself is a single store transaction, and
//! version derivation (read max patch, add one) is serialised per
//! application by an in-process async lock. Deployments running several
//! service instances must add their own cross-process serialisation.

use crate::history::DeploymentHistoryRecorder;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shipyard_core::{
    merged, AppId, AppLevelMetrics, AuditLog, Chart, ChartId, ChartKind, ChartRef, ChartRefId,
    ChartVersion, EntityKind, NewChart, NewEnvOverride, ShipyardError, ShipyardResult, UserId,
    ValidationError,
};
use shipyard_storage::{ChartStore, PipelineRepository};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Request to create a chart version for an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRequest {
    pub app_id: AppId,
    pub chart_ref_id: ChartRefId,
    /// User supplied delta applied over the reference chart's defaults.
    pub values_override: Value,
    pub is_app_metrics_enabled: bool,
    pub user_id: UserId,
}

pub struct ChartService {
    charts: Arc<dyn ChartStore>,
    pipelines: Arc<dyn PipelineRepository>,
    history: Arc<DeploymentHistoryRecorder>,
    app_locks: DashMap<AppId, Arc<Mutex<()>>>,
}

impl ChartService {
    pub fn new(
        charts: Arc<dyn ChartStore>,
        pipelines: Arc<dyn PipelineRepository>,
        history: Arc<DeploymentHistoryRecorder>,
    ) -> Self {
        Self {
            charts,
            pipelines,
            history,
            app_locks: DashMap::new(),
        }
    }

    fn app_lock(&self, app_id: AppId) -> Arc<Mutex<()>> {
        self.app_locks.entry(app_id).or_default().clone()
    }

    async fn chart_ref(&self, id: ChartRefId) -> ShipyardResult<ChartRef> {
        self.charts
            .chart_ref_get(id)
            .await?
            .ok_or_else(|| ShipyardError::not_found(EntityKind::ChartRef, id))
    }

    async fn app_metrics_flag(&self, app_id: AppId) -> ShipyardResult<bool> {
        Ok(self
            .charts
            .app_metrics_get(app_id)
            .await?
            .map(|m| m.app_metrics)
            .unwrap_or(false))
    }

    /// Next version in the `(repo, chart name, parent major.minor)` bucket.
    async fn next_version(
        &self,
        chart_repo: &str,
        chart_name: &str,
        parent: ChartVersion,
    ) -> ShipyardResult<ChartVersion> {
        let current = self
            .charts
            .chart_max_version_in_bucket(chart_repo, chart_name, parent.major, parent.minor)
            .await?;
        Ok(match current {
            Some(v) => v.bump_patch(),
            None => ChartVersion::first_in_bucket(parent.major, parent.minor),
        })
    }

    /// Create a new chart version and make it the application's latest.
    pub async fn create_version(&self, request: TemplateRequest) -> ShipyardResult<Chart> {
        let lock = self.app_lock(request.app_id);
        let _guard = lock.lock().await;
        self.create_version_locked(request).await
    }

    async fn create_version_locked(&self, request: TemplateRequest) -> ShipyardResult<Chart> {
        let app = self
            .pipelines
            .app_get(request.app_id)
            .await?
            .ok_or_else(|| ShipyardError::not_found(EntityKind::Application, request.app_id))?;
        let chart_ref = self.chart_ref(request.chart_ref_id).await?;

        if self
            .charts
            .chart_find_by_app_and_ref(app.id, chart_ref.id)
            .await?
            .is_some()
        {
            return Err(ValidationError::DuplicateChartReference {
                app_id: app.id.0,
                chart_ref_id: chart_ref.id.0,
            }
            .into());
        }

        let repo = self
            .charts
            .chart_repo_get_default()
            .await?
            .ok_or_else(|| ShipyardError::not_found(EntityKind::ChartRepo, 0))?;
        let version = self
            .next_version(&repo.name, &app.app_name, chart_ref.version)
            .await?;

        let chart = self
            .charts
            .chart_create_latest(NewChart {
                app_id: app.id,
                chart_repo_id: repo.id,
                chart_repo: repo.name.clone(),
                chart_name: app.app_name.clone(),
                chart_ref_id: chart_ref.id,
                reference_template: chart_ref.location.clone(),
                values: merged(&chart_ref.default_values, &request.values_override),
                global_override: request.values_override.clone(),
                image_descriptor_template: chart_ref.image_descriptor_template.clone(),
                chart_version: version,
                audit: AuditLog::now(request.user_id),
            })
            .await?;

        // Charts that cannot render metrics never carry the flag.
        let app_metrics = request.is_app_metrics_enabled && chart_ref.app_metrics_supported;
        self.charts
            .app_metrics_upsert(app.id, app_metrics, request.user_id)
            .await?;
        self.history
            .record_global_template_change(&chart, app_metrics, request.user_id)
            .await?;

        info!(
            app_id = %app.id,
            chart_id = %chart.id,
            version = %chart.chart_version,
            "Created chart version"
        );
        Ok(chart)
    }

    /// Merge `delta` into a chart's values and global override in place.
    /// Editing a chart that is not the latest promotes it back to latest.
    /// `app_metrics` of `None` keeps the current application flag.
    pub async fn update_override(
        &self,
        chart_id: ChartId,
        delta: &Value,
        app_metrics: Option<bool>,
        user: UserId,
    ) -> ShipyardResult<Chart> {
        let app_id = self.load_chart(chart_id).await?.app_id;
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;

        let mut chart = self.load_chart(chart_id).await?;
        if !chart.latest {
            debug!(chart_id = %chart.id, "Promoting edited chart to latest");
        }
        chart.values = merged(&chart.values, delta);
        chart.global_override = merged(&chart.global_override, delta);
        chart.audit.touch(user);
        let chart = self.charts.chart_update_as_latest(&chart).await?;

        let app_metrics = match app_metrics {
            Some(requested) => {
                let supported = self.chart_ref(chart.chart_ref_id).await?.app_metrics_supported;
                let enabled = requested && supported;
                self.charts.app_metrics_upsert(app_id, enabled, user).await?;
                enabled
            }
            None => self.app_metrics_flag(app_id).await?,
        };
        self.history
            .record_global_template_change(&chart, app_metrics, user)
            .await?;
        Ok(chart)
    }

    async fn load_chart(&self, chart_id: ChartId) -> ShipyardResult<Chart> {
        self.charts
            .chart_get(chart_id)
            .await?
            .ok_or_else(|| ShipyardError::not_found(EntityKind::Chart, chart_id))
    }

    /// Whether switching between two chart families is structurally safe.
    pub fn get_compatibility(old: &ChartKind, new: &ChartKind) -> bool {
        old.is_compatible_with(new)
    }

    /// Compatibility of two chart references, by family name.
    pub async fn chart_refs_compatible(
        &self,
        old_ref: ChartRefId,
        new_ref: ChartRefId,
    ) -> ShipyardResult<bool> {
        let old = self.chart_ref(old_ref).await?;
        let new = self.chart_ref(new_ref).await?;
        Ok(shipyard_core::chart_kinds_compatible(&old.name, &new.name))
    }

    pub async fn find_latest(&self, app_id: AppId) -> ShipyardResult<Chart> {
        self.charts
            .chart_find_latest(app_id)
            .await?
            .ok_or_else(|| ShipyardError::not_found(EntityKind::Chart, app_id))
    }

    pub async fn find_previous(&self, app_id: AppId) -> ShipyardResult<Option<Chart>> {
        self.charts.chart_find_previous(app_id).await
    }

    pub async fn get_by_app_and_chart_ref(
        &self,
        app_id: AppId,
        chart_ref_id: ChartRefId,
    ) -> ShipyardResult<Option<Chart>> {
        self.charts.chart_find_by_app_and_ref(app_id, chart_ref_id).await
    }

    /// Move an application to another chart reference of the same family,
    /// carrying over the global override and every environment override.
    pub async fn upgrade_for_app(
        &self,
        app_id: AppId,
        target_chart_ref: ChartRefId,
        user: UserId,
    ) -> ShipyardResult<Chart> {
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;

        let current = self
            .charts
            .chart_find_latest(app_id)
            .await?
            .ok_or_else(|| ShipyardError::not_found(EntityKind::Chart, app_id))?;
        let current_ref = self.chart_ref(current.chart_ref_id).await?;
        let target_ref = self.chart_ref(target_chart_ref).await?;

        let from = ChartKind::from_chart_name(
            &current_ref.name,
            flagger_canary_enabled(&current.values)?,
        );
        let to = ChartKind::from_chart_name(
            &target_ref.name,
            flagger_canary_enabled(&target_ref.default_values)?,
        );
        match (from, to) {
            (Some(a), Some(b)) if Self::get_compatibility(&a, &b) => {}
            _ => {
                return Err(ValidationError::IncompatibleChartKinds {
                    from: current_ref.name.clone(),
                    to: target_ref.name.clone(),
                }
                .into())
            }
        }

        let app_metrics = self.app_metrics_flag(app_id).await?;
        let upgraded = self
            .create_version_locked(TemplateRequest {
                app_id,
                chart_ref_id: target_ref.id,
                values_override: current.global_override.clone(),
                is_app_metrics_enabled: app_metrics,
                user_id: user,
            })
            .await?;

        for env_override in self.charts.env_override_find_by_chart(current.id).await? {
            let carried = self
                .charts
                .env_override_create_latest(NewEnvOverride {
                    chart_id: upgraded.id,
                    target_environment: env_override.target_environment,
                    env_override_values: env_override.env_override_values.clone(),
                    is_override: env_override.is_override,
                    active: true,
                    audit: AuditLog::now(user),
                })
                .await?;
            let env_metrics = self
                .history
                .resolve_app_metrics(app_id, carried.target_environment)
                .await?;
            self.history
                .record_env_override_change(&carried, env_metrics, None, user)
                .await?;
        }

        info!(
            app_id = %app_id,
            from_chart = %current.id,
            to_chart = %upgraded.id,
            "Upgraded application chart"
        );
        Ok(upgraded)
    }

    /// Toggle app metrics. Enabling needs a user-uploaded chart or a chart
    /// version of at least 3.7.
    pub async fn app_metrics_enable_disable(
        &self,
        app_id: AppId,
        enabled: bool,
        user: UserId,
    ) -> ShipyardResult<AppLevelMetrics> {
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;

        let chart = self
            .charts
            .chart_find_latest(app_id)
            .await?
            .ok_or_else(|| ShipyardError::not_found(EntityKind::Chart, app_id))?;
        let chart_ref = self.chart_ref(chart.chart_ref_id).await?;
        if enabled && !(chart_ref.user_uploaded || chart_ref.version.supports_app_metrics()) {
            return Err(ValidationError::InvalidValue {
                field: "app_metrics".to_string(),
                reason: format!(
                    "chart version {} does not support app metrics",
                    chart_ref.version
                ),
            }
            .into());
        }

        let metrics = self.charts.app_metrics_upsert(app_id, enabled, user).await?;
        self.history
            .record_global_template_change(&chart, enabled, user)
            .await?;
        Ok(metrics)
    }
}

/// Read `flaggerCanary.enabled` from chart values. A missing section means
/// disabled; a section without the flag is invalid.
pub fn flagger_canary_enabled(values: &Value) -> ShipyardResult<bool> {
    let Some(section) = values.get("flaggerCanary") else {
        return Ok(false);
    };
    match section.get("enabled") {
        Some(Value::Bool(enabled)) => Ok(*enabled),
        Some(other) => Err(ValidationError::InvalidValue {
            field: "flaggerCanary.enabled".to_string(),
            reason: format!("expected boolean, got {}", other),
        }
        .into()),
        None => Err(ValidationError::RequiredFieldMissing {
            field: "flaggerCanary.enabled".to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shipyard_core::WorkloadKind;

    #[test]
    fn test_flagger_canary_lookup() {
        assert!(!flagger_canary_enabled(&json!({"replicaCount": 1})).unwrap());
        assert!(flagger_canary_enabled(&json!({"flaggerCanary": {"enabled": true}})).unwrap());
        assert!(flagger_canary_enabled(&json!({"flaggerCanary": {}})).is_err());
        assert!(flagger_canary_enabled(&json!({"flaggerCanary": {"enabled": "yes"}})).is_err());
    }

    #[test]
    fn test_canary_variant_compatible_with_base() {
        let plain = ChartKind::new(WorkloadKind::Deployment, false);
        let canary = ChartKind::new(WorkloadKind::Deployment, true);
        let job = ChartKind::new(WorkloadKind::Job, false);
        assert!(ChartService::get_compatibility(&plain, &canary));
        assert!(!ChartService::get_compatibility(&plain, &job));
    }
}
