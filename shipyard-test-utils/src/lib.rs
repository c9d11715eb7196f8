//! Shipyard Test Utilities
//!
//! Centralized test infrastructure for the Shipyard workspace:
//! - Recording mocks for the trigger executor and notification sink
//! - Fixtures for pipelines, charts and workflows
//! - A harness wiring every service to one in-memory store
//! - Proptest generators and Shipyard-specific assertions

use ::async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use shipyard_pipeline::{
    Authorizer, AutoTriggerEngine, BuildEvent, BuildEventRequest, ChartService,
    DeploymentHistoryRecorder, NotificationError, NotificationSink, Notifier, TriggerExecutor,
    WebhookService,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

pub use shipyard_core::*;
pub use shipyard_storage::InMemoryStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// RECORDING MOCKS
// ============================================================================

/// One observed trigger call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerCall {
    pub artifact_id: ArtifactId,
    pub pipeline_id: Option<CiPipelineId>,
    pub cd_pipeline_id: Option<CdPipelineId>,
    pub is_manual: bool,
    pub user: UserId,
}

/// Trigger executor that records every call and fails for chosen artifacts.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<TriggerCall>>,
    failing_artifacts: Mutex<HashSet<ArtifactId>>,
    failing_pipelines: Mutex<HashSet<CiPipelineId>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_artifact(&self, id: ArtifactId) {
        lock(&self.failing_artifacts).insert(id);
    }

    /// Fail every artifact built for `pipeline`. Handy when ids are not yet
    /// known at setup time.
    pub fn fail_pipeline(&self, pipeline: CiPipelineId) {
        lock(&self.failing_pipelines).insert(pipeline);
    }

    pub fn calls(&self) -> Vec<TriggerCall> {
        lock(&self.calls).clone()
    }

    pub fn triggered_artifacts(&self) -> Vec<ArtifactId> {
        self.calls().into_iter().map(|c| c.artifact_id).collect()
    }

    fn should_fail(&self, artifact: &Artifact) -> bool {
        lock(&self.failing_artifacts).contains(&artifact.id)
            || artifact
                .pipeline_id
                .is_some_and(|p| lock(&self.failing_pipelines).contains(&p))
    }

    fn outcome(&self, artifact: &Artifact) -> Result<(), TriggerError> {
        if self.should_fail(artifact) {
            Err(TriggerError::Failed {
                artifact_id: artifact.id.0,
                reason: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TriggerExecutor for RecordingExecutor {
    async fn trigger(
        &self,
        artifact: &Artifact,
        is_manual: bool,
        _is_async: bool,
        user: UserId,
    ) -> Result<(), TriggerError> {
        lock(&self.calls).push(TriggerCall {
            artifact_id: artifact.id,
            pipeline_id: artifact.pipeline_id,
            cd_pipeline_id: None,
            is_manual,
            user,
        });
        self.outcome(artifact)
    }

    async fn trigger_external(
        &self,
        artifact: &Artifact,
        target: &DownstreamTarget,
        user: UserId,
    ) -> Result<(), TriggerError> {
        lock(&self.calls).push(TriggerCall {
            artifact_id: artifact.id,
            pipeline_id: None,
            cd_pipeline_id: Some(target.cd_pipeline_id),
            is_manual: true,
            user,
        });
        self.outcome(artifact)
    }
}

/// Notification sink that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<BuildEvent>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose deliveries always fail.
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<BuildEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, event: BuildEvent) -> Result<(), NotificationError> {
        lock(&self.events).push(event);
        if self.fail {
            return Err(NotificationError("sink unavailable".to_string()));
        }
        Ok(())
    }
}

/// Authoriser allowing only the listed environment resources.
pub fn allow_envs(envs: &[&str]) -> impl Authorizer {
    let allowed: HashSet<String> = envs.iter().map(|e| e.to_string()).collect();
    move |_token: &str, _project: &str, env: &str| allowed.contains(env)
}

pub fn deny_all() -> impl Authorizer {
    |_token: &str, _project: &str, _env: &str| false
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built entities for common testing scenarios.

    use super::*;

    pub const TEST_USER: UserId = UserId(2);

    pub fn application(id: i64, name: &str) -> Application {
        Application {
            id: AppId(id),
            app_name: name.to_string(),
            team_name: "platform".to_string(),
        }
    }

    pub fn environment(id: i64, identifier: &str) -> Environment {
        Environment {
            id: EnvironmentId(id),
            name: identifier.to_string(),
            environment_identifier: identifier.to_string(),
        }
    }

    pub fn ci_pipeline(id: i64, app: AppId, scan_enabled: bool) -> CiPipeline {
        CiPipeline {
            id: CiPipelineId(id),
            app_id: app,
            name: format!("ci-{}", id),
            parent_ci_pipeline: None,
            scan_enabled,
            deleted: false,
        }
    }

    /// A pipeline linked to `parent`, reusing its build output.
    pub fn child_ci_pipeline(
        id: i64,
        app: AppId,
        parent: CiPipelineId,
        scan_enabled: bool,
    ) -> CiPipeline {
        CiPipeline {
            parent_ci_pipeline: Some(parent),
            ..ci_pipeline(id, app, scan_enabled)
        }
    }

    pub fn external_ci(id: i64, app: AppId, token: &str) -> ExternalCiPipeline {
        ExternalCiPipeline {
            id: ExternalCiId(id),
            app_id: app,
            access_token: token.to_string(),
            active: true,
        }
    }

    pub fn cd_pipeline(id: i64, app: AppId, env: EnvironmentId) -> CdPipeline {
        CdPipeline {
            id: CdPipelineId(id),
            app_id: app,
            environment_id: env,
            name: format!("cd-{}", id),
            ci_pipeline_id: None,
            external_ci_id: None,
            deleted: false,
        }
    }

    pub fn running_workflow(id: i64, pipeline: CiPipelineId) -> CiWorkflow {
        CiWorkflow {
            id: WorkflowId(id),
            name: format!("build-{}", id),
            status: WorkflowStatus::Running,
            message: String::new(),
            started_on: Utc::now(),
            finished_on: None,
            ci_pipeline_id: pipeline,
            git_triggers: Default::default(),
            triggered_by: TEST_USER,
        }
    }

    pub fn chart_repo() -> ChartRepo {
        ChartRepo {
            id: ChartRepoId(1),
            name: "default-chartmuseum".to_string(),
        }
    }

    /// A reference chart at `version` with `replicaCount: 1` defaults.
    pub fn chart_ref(id: i64, name: &str, version: &str) -> ChartRef {
        let version: ChartVersion = version.parse().unwrap_or(ChartVersion::new(1, 0, 0));
        ChartRef {
            id: ChartRefId(id),
            name: name.to_string(),
            version,
            location: format!("reference-chart_{}", version),
            default_values: json!({"replicaCount": 1, "image": {"pullPolicy": "IfNotPresent"}}),
            image_descriptor_template: "{{.image}}".to_string(),
            user_uploaded: false,
            app_metrics_supported: version.supports_app_metrics(),
        }
    }

    pub fn user(id: UserId, email: &str) -> User {
        User {
            id,
            email_id: email.to_string(),
        }
    }

    pub fn build_request(image: &str, digest: &str) -> BuildEventRequest {
        BuildEventRequest {
            image: image.to_string(),
            image_digest: digest.to_string(),
            material_info: Some(
                json!([{
                    "material": {
                        "plugin-id": "git",
                        "git-configuration": {"url": "https://example.com/app.git"},
                        "type": "git"
                    },
                    "changed": true,
                    "modifications": [{"revision": "abc123", "modified-time": ""}]
                }])
                .to_string(),
            ),
            user_id: TEST_USER,
            ..BuildEventRequest::default()
        }
    }

    pub fn new_artifact(pipeline: CiPipelineId, image: &str, digest: &str) -> NewArtifact {
        NewArtifact {
            pipeline_id: Some(pipeline),
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
            audit: AuditLog::now(TEST_USER),
        }
    }

    pub fn values(replicas: i64) -> Value {
        json!({"replicaCount": replicas})
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// Every service wired to one shared [`InMemoryStore`].
pub struct TestHarness {
    pub store: Arc<InMemoryStore>,
    pub executor: Arc<RecordingExecutor>,
    pub sink: Arc<RecordingSink>,
    pub recorder: Arc<DeploymentHistoryRecorder>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let recorder = Arc::new(DeploymentHistoryRecorder::new(
            store.clone(),
            store.clone(),
            store.clone(),
        ));
        Self {
            store,
            executor: Arc::new(RecordingExecutor::new()),
            sink: Arc::new(RecordingSink::new()),
            recorder,
        }
    }

    pub fn engine(&self, batch_size: usize) -> AutoTriggerEngine {
        AutoTriggerEngine::new(self.executor.clone(), batch_size)
    }

    pub fn webhook_service(&self, config: CiConfig) -> WebhookService {
        let engine = self.engine(config.effective_batch_size());
        self.webhook_service_with_engine(config, engine)
    }

    /// Webhook service driven by a caller-built engine, e.g. one wired to a
    /// cancellation signal.
    pub fn webhook_service_with_engine(
        &self,
        config: CiConfig,
        engine: AutoTriggerEngine,
    ) -> WebhookService {
        WebhookService::new(
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            engine,
            Notifier::new(self.sink.clone()),
            config,
        )
    }

    pub fn chart_service(&self) -> ChartService {
        ChartService::new(self.store.clone(), self.store.clone(), self.recorder.clone())
    }

    /// Seed application 1 (`demo-app`) with environments `dev`/`prod`, one CD
    /// pipeline per environment, the default chart repo and two `Deployment`
    /// reference charts (1.2.0 and 3.9.0) plus a `Job & CronJob` one.
    pub fn seed_app(&self) -> ShipyardResult<AppId> {
        let app = fixtures::application(1, "demo-app");
        self.store.insert_app(app.clone())?;
        self.store.insert_environment(fixtures::environment(10, "dev"))?;
        self.store.insert_environment(fixtures::environment(11, "prod"))?;
        self.store
            .insert_cd_pipeline(fixtures::cd_pipeline(100, app.id, EnvironmentId(10)))?;
        self.store
            .insert_cd_pipeline(fixtures::cd_pipeline(101, app.id, EnvironmentId(11)))?;
        self.store.insert_chart_repo(fixtures::chart_repo(), true)?;
        self.store
            .insert_chart_ref(fixtures::chart_ref(1, "Deployment", "1.2.0"))?;
        self.store
            .insert_chart_ref(fixtures::chart_ref(2, "Deployment", "3.9.0"))?;
        self.store
            .insert_chart_ref(fixtures::chart_ref(3, "Job & CronJob", "1.2.0"))?;
        self.store
            .insert_user(fixtures::user(fixtures::TEST_USER, "dev@example.com"))?;
        Ok(app.id)
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Shipyard values.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_chart_version() -> impl Strategy<Value = ChartVersion> {
        (0u32..10, 0u32..20, 0u32..50)
            .prop_map(|(major, minor, patch)| ChartVersion::new(major, minor, patch))
    }

    /// Flat chart values with a few well-known keys.
    pub fn arb_values() -> impl Strategy<Value = Value> {
        (1i64..10, any::<bool>(), "[a-z]{1,8}").prop_map(|(replicas, autoscale, tag)| {
            json!({
                "replicaCount": replicas,
                "autoscaling": {"enabled": autoscale},
                "image": {"tag": tag}
            })
        })
    }

    /// One step of a chart edit session.
    #[derive(Debug, Clone)]
    pub enum ChartOp {
        /// Create a version against the given reference chart.
        Create { chart_ref: i64, values: Value },
        /// Edit the chart at this position (modulo count) of the app's charts.
        Update { index: usize, values: Value },
    }

    pub fn arb_chart_op() -> impl Strategy<Value = ChartOp> {
        prop_oneof![
            (1i64..=2, arb_values())
                .prop_map(|(chart_ref, values)| ChartOp::Create { chart_ref, values }),
            (any::<usize>(), arb_values()).prop_map(|(index, values)| ChartOp::Update { index, values }),
        ]
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for Shipyard-specific validation.

    use super::*;

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &ShipyardResult<T>, kind: EntityKind) {
        match result {
            Err(ShipyardError::NotFound { entity, .. }) => {
                assert_eq!(*entity, kind, "Wrong entity in NotFound error")
            }
            Err(ShipyardError::Persistence(StorageError::NotFound { entity, .. })) => {
                assert_eq!(*entity, kind, "Wrong entity in NotFound error")
            }
            other => panic!("Expected NotFound for {:?}, got: {:?}", kind, other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &ShipyardResult<T>) {
        match result {
            Err(ShipyardError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_authorization_error<T: std::fmt::Debug>(result: &ShipyardResult<T>) {
        match result {
            Err(ShipyardError::Authorization(_)) => {}
            other => panic!("Expected Authorization error, got: {:?}", other),
        }
    }

    /// Exactly one latest chart and at most one previous chart.
    #[track_caller]
    pub fn assert_chart_flags(charts: &[Chart]) {
        let latest = charts.iter().filter(|c| c.latest).count();
        let previous = charts.iter().filter(|c| c.previous).count();
        assert_eq!(latest, 1, "expected exactly one latest chart in {:?}", charts);
        assert!(previous <= 1, "expected at most one previous chart in {:?}", charts);
        assert!(
            charts.iter().all(|c| !(c.latest && c.previous)),
            "a chart cannot be latest and previous at once"
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_ref_fixture_metrics_support() {
        assert!(!fixtures::chart_ref(1, "Deployment", "1.2.0").app_metrics_supported);
        assert!(fixtures::chart_ref(2, "Deployment", "3.9.0").app_metrics_supported);
    }

    #[test]
    fn test_child_pipeline_points_at_parent() {
        let child = fixtures::child_ci_pipeline(2, AppId(1), CiPipelineId(1), true);
        assert_eq!(child.parent_ci_pipeline, Some(CiPipelineId(1)));
        assert!(child.scan_enabled);
    }

    #[tokio::test]
    async fn test_recording_executor_fails_chosen_artifacts() {
        let executor = RecordingExecutor::new();
        executor.fail_artifact(ArtifactId(2));
        let ok = fixtures::new_artifact(CiPipelineId(1), "a", "d").with_id(ArtifactId(1));
        let bad = fixtures::new_artifact(CiPipelineId(1), "a", "d").with_id(ArtifactId(2));

        assert!(executor.trigger(&ok, false, false, UserId(2)).await.is_ok());
        assert!(executor.trigger(&bad, false, false, UserId(2)).await.is_err());
        assert_eq!(executor.triggered_artifacts(), vec![ArtifactId(1), ArtifactId(2)]);
    }

    #[test]
    fn test_allow_envs_authorizer() {
        let auth = allow_envs(&["dev/demo-app"]);
        assert!(auth.authorize("t", "platform/demo-app", "dev/demo-app"));
        assert!(!auth.authorize("t", "platform/demo-app", "prod/demo-app"));
    }
}
