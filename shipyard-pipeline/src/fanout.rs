//! Auto-trigger fan-out
//!
//! Given the artifacts a build produced, trigger every downstream pipeline
//! that depends on them. Artifacts are processed in fixed-size batches: all
//! triggers in a batch run concurrently and the engine joins the whole batch
//! before starting the next one. A failing trigger is recorded and never
//! stops its siblings or later batches.

use ::async_trait::async_trait;
use futures_util::future::join_all;
use shipyard_core::{
    Artifact, ArtifactId, DownstreamTarget, FanOutFailure, TriggerError, TriggerMode, UserId,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Downstream executor invoked once per artifact (or per external target).
#[async_trait]
pub trait TriggerExecutor: Send + Sync {
    /// Trigger every CD or stage pipeline fed by `artifact`'s pipeline.
    async fn trigger(
        &self,
        artifact: &Artifact,
        is_manual: bool,
        is_async: bool,
        user: UserId,
    ) -> Result<(), TriggerError>;

    /// Trigger one CD pipeline fed by an external CI source.
    async fn trigger_external(
        &self,
        artifact: &Artifact,
        target: &DownstreamTarget,
        user: UserId,
    ) -> Result<(), TriggerError>;
}

/// Authorisation predicate for external-webhook targets.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: &str, project_resource: &str, env_resource: &str) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&str, &str, &str) -> bool + Send + Sync,
{
    fn authorize(&self, token: &str, project_resource: &str, env_resource: &str) -> bool {
        self(token, project_resource, env_resource)
    }
}

/// Outcome of one fan-out run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// External targets denied by the authoriser.
    pub skipped: usize,
    pub failures: Vec<TriggerError>,
    /// Set when cancellation stopped the run before every batch started.
    pub cancelled: bool,
}

impl FanOutReport {
    pub fn triggered_any(&self) -> bool {
        self.succeeded > 0
    }

    /// Aggregated error when at least one trigger failed.
    pub fn failure(&self) -> Option<FanOutFailure> {
        if self.failures.is_empty() {
            return None;
        }
        Some(FanOutFailure {
            failures: self.failures.clone(),
            succeeded: self.succeeded,
            triggered_any: self.triggered_any(),
        })
    }

    fn absorb(&mut self, outcome: Result<(), TriggerError>) {
        self.attempted += 1;
        match outcome {
            Ok(()) => self.succeeded += 1,
            Err(e) => self.failures.push(e),
        }
    }
}

/// Batched, concurrent trigger engine.
#[derive(Clone)]
pub struct AutoTriggerEngine {
    executor: Arc<dyn TriggerExecutor>,
    batch_size: usize,
    cancel: Option<watch::Receiver<bool>>,
}

impl AutoTriggerEngine {
    /// `batch_size` below 1 is treated as 1.
    pub fn new(executor: Arc<dyn TriggerExecutor>, batch_size: usize) -> Self {
        Self {
            executor,
            batch_size: batch_size.max(1),
            cancel: None,
        }
    }

    /// Stop launching new batches once `true` is published. Triggers already
    /// running in the current batch finish normally.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Trigger downstream pipelines for each artifact, in discovery order.
    pub async fn fan_out(
        &self,
        artifacts: &[Artifact],
        mode: TriggerMode,
        user: UserId,
    ) -> FanOutReport {
        let mut report = FanOutReport::default();
        let is_manual = mode.is_manual();

        for (batch_index, batch) in artifacts.chunks(self.batch_size).enumerate() {
            if self.is_cancelled() {
                warn!(batch = batch_index, "Fan-out cancelled before batch start");
                report.cancelled = true;
                break;
            }
            debug!(batch = batch_index, size = batch.len(), "Starting trigger batch");

            let handles: Vec<_> = batch
                .iter()
                .cloned()
                .map(|artifact| {
                    let executor = Arc::clone(&self.executor);
                    tokio::spawn(async move {
                        executor.trigger(&artifact, is_manual, false, user).await
                    })
                })
                .collect();

            let ids: Vec<ArtifactId> = batch.iter().map(|a| a.id).collect();
            for (id, joined) in ids.into_iter().zip(join_all(handles).await) {
                let outcome = flatten(id, joined);
                if let Err(e) = &outcome {
                    error!(artifact_id = %id, error = %e, "Error on handle ci success event");
                }
                report.absorb(outcome);
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failures.len(),
            "Completed auto trigger for downstream pipelines"
        );
        report
    }

    /// Trigger the CD pipelines fed by an external CI source. Each target is
    /// authorised first; denied targets are skipped, not failed.
    pub async fn fan_out_external(
        &self,
        artifact: &Artifact,
        targets: Vec<DownstreamTarget>,
        token: &str,
        authorizer: &dyn Authorizer,
        user: UserId,
    ) -> FanOutReport {
        let mut report = FanOutReport::default();
        let mut allowed = Vec::with_capacity(targets.len());
        for target in targets {
            if authorizer.authorize(token, &target.project_resource, &target.env_resource) {
                allowed.push(target);
            } else {
                warn!(
                    cd_pipeline_id = %target.cd_pipeline_id,
                    project = %target.project_resource,
                    env = %target.env_resource,
                    "Unauthorized to trigger pipeline from external ci"
                );
                report.skipped += 1;
            }
        }

        for (batch_index, batch) in allowed.chunks(self.batch_size).enumerate() {
            if self.is_cancelled() {
                warn!(batch = batch_index, "External fan-out cancelled before batch start");
                report.cancelled = true;
                break;
            }

            let handles: Vec<_> = batch
                .iter()
                .cloned()
                .map(|target| {
                    let executor = Arc::clone(&self.executor);
                    let artifact = artifact.clone();
                    tokio::spawn(async move {
                        executor.trigger_external(&artifact, &target, user).await
                    })
                })
                .collect();

            for (target, joined) in batch.iter().zip(join_all(handles).await) {
                let outcome = flatten(artifact.id, joined);
                if let Err(e) = &outcome {
                    error!(
                        artifact_id = %artifact.id,
                        cd_pipeline_id = %target.cd_pipeline_id,
                        error = %e,
                        "Error triggering pipeline from external ci"
                    );
                }
                report.absorb(outcome);
            }
        }
        report
    }
}

fn flatten(
    id: ArtifactId,
    joined: Result<Result<(), TriggerError>, tokio::task::JoinError>,
) -> Result<(), TriggerError> {
    joined.unwrap_or_else(|e| {
        Err(TriggerError::Aborted {
            artifact_id: id.0,
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shipyard_core::{AuditLog, CdPipelineId, CiPipelineId, DataSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn artifact(id: i64) -> Artifact {
        Artifact {
            id: ArtifactId(id),
            pipeline_id: Some(CiPipelineId(1)),
            external_ci_pipeline_id: None,
            image: "repo/app:1".to_string(),
            image_digest: "sha256:a".to_string(),
            material_info: "[]".to_string(),
            data_source: DataSource::CiRunner,
            workflow_id: None,
            parent_ci_artifact: None,
            scan_enabled: false,
            scanned: true,
            is_artifact_uploaded: false,
            audit: AuditLog::at(Utc::now(), UserId(1)),
        }
    }

    /// Tracks peak concurrency and fails a fixed artifact id.
    #[derive(Default)]
    struct Probe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        seen: Mutex<Vec<i64>>,
        fail_id: Option<i64>,
    }

    #[async_trait]
    impl TriggerExecutor for Probe {
        async fn trigger(
            &self,
            artifact: &Artifact,
            _is_manual: bool,
            _is_async: bool,
            _user: UserId,
        ) -> Result<(), TriggerError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(artifact.id.0);
            }
            if self.fail_id == Some(artifact.id.0) {
                return Err(TriggerError::Failed {
                    artifact_id: artifact.id.0,
                    reason: "deterministic failure".to_string(),
                });
            }
            Ok(())
        }

        async fn trigger_external(
            &self,
            _artifact: &Artifact,
            _target: &DownstreamTarget,
            _user: UserId,
        ) -> Result<(), TriggerError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_is_isolated() {
        let probe = Arc::new(Probe {
            fail_id: Some(3),
            ..Probe::default()
        });
        let engine = AutoTriggerEngine::new(probe.clone(), 2);
        let artifacts: Vec<Artifact> = (1..=5).map(artifact).collect();

        let report = engine.fan_out(&artifacts, TriggerMode::Automatic, UserId(1)).await;

        assert_eq!(report.attempted, 5);
        assert_eq!(report.succeeded, 4);
        let failure = report.failure().unwrap();
        assert_eq!(failure.failures.len(), 1);
        assert_eq!(failure.failures[0].artifact_id(), 3);

        let mut seen = probe.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batch_bounds_concurrency() {
        let probe = Arc::new(Probe::default());
        let engine = AutoTriggerEngine::new(probe.clone(), 3);
        let artifacts: Vec<Artifact> = (1..=10).map(artifact).collect();

        let report = engine.fan_out(&artifacts, TriggerMode::Manual, UserId(9)).await;

        assert_eq!(report.succeeded, 10);
        assert!(probe.peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_zero_batch_size_clamped() {
        let engine = AutoTriggerEngine::new(Arc::new(Probe::default()), 0);
        assert_eq!(engine.batch_size(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_engine_starts_no_batch() {
        let (tx, rx) = watch::channel(false);
        let probe = Arc::new(Probe::default());
        let engine = AutoTriggerEngine::new(probe.clone(), 1).with_cancellation(rx);
        tx.send(true).unwrap();

        let report = engine
            .fan_out(&[artifact(1), artifact(2)], TriggerMode::Automatic, UserId(1))
            .await;

        assert!(report.cancelled);
        assert_eq!(report.attempted, 0);
        assert!(probe.seen.lock().unwrap().is_empty());
    }

    /// Publishes cancellation from inside its first trigger call.
    struct CancelOnFirstTrigger {
        cancel: watch::Sender<bool>,
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl TriggerExecutor for CancelOnFirstTrigger {
        async fn trigger(
            &self,
            artifact: &Artifact,
            _is_manual: bool,
            _is_async: bool,
            _user: UserId,
        ) -> Result<(), TriggerError> {
            let _ = self.cancel.send(true);
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(artifact.id.0);
            }
            Ok(())
        }

        async fn trigger_external(
            &self,
            _artifact: &Artifact,
            _target: &DownstreamTarget,
            _user: UserId,
        ) -> Result<(), TriggerError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_batch_finishes_it_and_stops_the_next() {
        let (tx, rx) = watch::channel(false);
        let executor = Arc::new(CancelOnFirstTrigger {
            cancel: tx,
            seen: Mutex::new(Vec::new()),
        });
        let engine = AutoTriggerEngine::new(executor.clone(), 2).with_cancellation(rx);
        let artifacts: Vec<Artifact> = (1..=5).map(artifact).collect();

        let report = engine.fan_out(&artifacts, TriggerMode::Automatic, UserId(1)).await;

        assert!(report.cancelled);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 2);
        let mut seen = executor.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_external_denied_targets_are_skipped() {
        let engine = AutoTriggerEngine::new(Arc::new(Probe::default()), 2);
        let targets = vec![
            DownstreamTarget {
                cd_pipeline_id: CdPipelineId(1),
                project_resource: "team/app".to_string(),
                env_resource: "dev/app".to_string(),
            },
            DownstreamTarget {
                cd_pipeline_id: CdPipelineId(2),
                project_resource: "team/app".to_string(),
                env_resource: "prod/app".to_string(),
            },
        ];
        let only_dev = |_: &str, _: &str, env: &str| env.starts_with("dev/");

        let report = engine
            .fan_out_external(&artifact(1), targets, "token", &only_dev, UserId(2))
            .await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.succeeded, 1);
        assert!(report.triggered_any());
        assert!(report.failure().is_none());
    }
}
