//! Deployment template history: recording and queries.

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use shipyard_pipeline::TemplateRequest;
use shipyard_storage::{ChartStore, HistoryStore, PipelineRepository};
use shipyard_test_utils::assertions::assert_not_found;
use shipyard_test_utils::fixtures::{self, TEST_USER};
use shipyard_test_utils::*;
use std::collections::BTreeMap;

const DEV_PIPELINE: CdPipelineId = CdPipelineId(100);

struct Seeded {
    h: TestHarness,
    app: AppId,
    chart: Chart,
    env_override: EnvOverride,
}

async fn seeded() -> Seeded {
    let h = TestHarness::new();
    let app = h.seed_app().unwrap();
    let chart = h
        .chart_service()
        .create_version(TemplateRequest {
            app_id: app,
            chart_ref_id: ChartRefId(1),
            values_override: fixtures::values(2),
            is_app_metrics_enabled: false,
            user_id: TEST_USER,
        })
        .await
        .unwrap();
    let env_override = h
        .store
        .env_override_create_latest(NewEnvOverride {
            chart_id: chart.id,
            target_environment: EnvironmentId(10),
            env_override_values: fixtures::values(7),
            is_override: true,
            active: true,
            audit: AuditLog::now(TEST_USER),
        })
        .await
        .unwrap();
    Seeded {
        h,
        app,
        chart,
        env_override,
    }
}

/// Deploy the dev pipeline at `at`, writing both the history entry and the
/// matching deploy run.
async fn deploy(s: &Seeded, run_id: i64, at: Timestamp, by: UserId) -> DeploymentTemplateHistory {
    let pipeline = s
        .h
        .store
        .cd_pipeline_get(DEV_PIPELINE)
        .await
        .unwrap()
        .unwrap();
    s.h.store
        .cd_runner_insert(&CdWorkflowRunner {
            id: CdWorkflowRunnerId(run_id),
            cd_pipeline_id: DEV_PIPELINE,
            workflow_type: CdWorkflowType::Deploy,
            status: WorkflowStatus::Succeeded,
            started_on: at,
            artifact_id: ArtifactId(1),
            triggered_by: by,
        })
        .await
        .unwrap();
    let mut snapshot = BTreeMap::new();
    snapshot.insert("DB_HOST".to_string(), "db.internal".to_string());
    s.h.recorder
        .record_deployment_trigger(
            &pipeline,
            &s.env_override,
            "repo/app:1.0".to_string(),
            at,
            by,
            snapshot,
        )
        .await
        .unwrap()
}

fn at(minute: i64) -> Timestamp {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
}

#[tokio::test]
async fn test_deployment_trigger_snapshot_is_queryable() {
    let s = seeded().await;
    let entry = deploy(&s, 1, at(0), TEST_USER).await;

    assert!(entry.deployed);
    assert_eq!(entry.template, fixtures::values(7));
    assert_eq!(entry.image_descriptor_template, "repo/app:1.0");

    let detail = s
        .h
        .recorder
        .get_history_by_id(entry.id, DEV_PIPELINE)
        .await
        .unwrap();
    assert_eq!(detail.template_name, "Deployment");
    assert_eq!(detail.template_version, "1.2.0");
    assert_eq!(detail.code_editor_value.display_name, "values.yaml");
    assert_eq!(detail.code_editor_value.value, fixtures::values(7));
    assert_eq!(
        detail.variable_snapshot.get("DB_HOST").map(String::as_str),
        Some("db.internal")
    );
}

#[tokio::test]
async fn test_history_by_id_requires_deployed_entry_of_pipeline() {
    let s = seeded().await;
    let entry = deploy(&s, 1, at(0), TEST_USER).await;

    let result = s
        .h
        .recorder
        .get_history_by_id(entry.id, CdPipelineId(101))
        .await;
    assert_not_found(&result, EntityKind::DeploymentTemplateHistory);

    // Entries written on chart creation are never deployed.
    let undeployed = s.h.store.history_list_by_app(s.app).await.unwrap()[0].id;
    let result = s.h.recorder.get_history_by_id(undeployed, DEV_PIPELINE).await;
    assert_not_found(&result, EntityKind::DeploymentTemplateHistory);
}

#[tokio::test]
async fn test_deployment_details_newest_first_with_paging() {
    let s = seeded().await;
    s.h.store
        .insert_user(fixtures::user(UserId(3), "ops@example.com"))
        .unwrap();
    deploy(&s, 1, at(0), TEST_USER).await;
    deploy(&s, 2, at(5), UserId(3)).await;
    deploy(&s, 3, at(10), TEST_USER).await;

    let details = s
        .h
        .recorder
        .get_deployment_details(DEV_PIPELINE, 0, 10)
        .await
        .unwrap();
    assert_eq!(details.len(), 3);
    assert_eq!(details[0].wfr_id, CdWorkflowRunnerId(3));
    assert_eq!(details[1].email_id, "ops@example.com");
    assert_eq!(details[2].deployed_on, at(0));
    assert!(details
        .iter()
        .all(|d| d.deployment_status == WorkflowStatus::Succeeded));

    let page = s
        .h
        .recorder
        .get_deployment_details(DEV_PIPELINE, 1, 1)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].wfr_id, CdWorkflowRunnerId(2));
}

#[tokio::test]
async fn test_missing_deployer_yields_empty_email() {
    let s = seeded().await;
    deploy(&s, 1, at(0), UserId(404)).await;

    let details = s
        .h
        .recorder
        .get_deployment_details(DEV_PIPELINE, 0, 10)
        .await
        .unwrap();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].email_id, "");
}

#[tokio::test]
async fn test_deployed_list_stops_at_base_id() {
    let s = seeded().await;
    let first = deploy(&s, 1, at(0), TEST_USER).await;
    let second = deploy(&s, 2, at(5), TEST_USER).await;
    deploy(&s, 3, at(10), TEST_USER).await;

    let list = s
        .h
        .recorder
        .get_deployed_list(DEV_PIPELINE, second.id)
        .await
        .unwrap();
    let ids: Vec<HistoryId> = list.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert_eq!(list[0].deployed_by, "dev@example.com");
}

#[tokio::test]
async fn test_lookup_by_run() {
    let s = seeded().await;
    deploy(&s, 1, at(0), TEST_USER).await;
    let second = deploy(&s, 2, at(5), TEST_USER).await;

    let detail = s
        .h
        .recorder
        .get_history_by_pipeline_and_run_id(DEV_PIPELINE, CdWorkflowRunnerId(2))
        .await
        .unwrap();
    assert_eq!(detail.code_editor_value.value, second.template);
    assert_eq!(
        s.h.recorder
            .check_history_exists_for_run(DEV_PIPELINE, CdWorkflowRunnerId(2))
            .await
            .unwrap(),
        Some(second.id)
    );

    assert_eq!(
        s.h.recorder
            .check_history_exists_for_run(DEV_PIPELINE, CdWorkflowRunnerId(9))
            .await
            .unwrap(),
        None
    );
    let result = s
        .h
        .recorder
        .get_history_by_pipeline_and_run_id(CdPipelineId(101), CdWorkflowRunnerId(2))
        .await;
    assert_not_found(&result, EntityKind::DeploymentTemplateHistory);
}

#[tokio::test]
async fn test_env_override_change_uses_effective_template() {
    let s = seeded().await;

    let entry = s
        .h
        .recorder
        .record_env_override_change(&s.env_override, false, None, TEST_USER)
        .await
        .unwrap();
    assert_eq!(entry.pipeline_id, Some(DEV_PIPELINE));
    assert_eq!(entry.template, fixtures::values(7));

    let inherited = EnvOverride {
        is_override: false,
        ..s.env_override.clone()
    };
    let entry = s
        .h
        .recorder
        .record_env_override_change(&inherited, false, None, TEST_USER)
        .await
        .unwrap();
    assert_eq!(entry.template, s.chart.global_override);
}

#[tokio::test]
async fn test_env_override_without_pipeline_has_no_pipeline() {
    let s = seeded().await;
    s.h.store
        .insert_environment(fixtures::environment(12, "qa"))
        .unwrap();
    let qa = s
        .h
        .store
        .env_override_create_latest(NewEnvOverride {
            chart_id: s.chart.id,
            target_environment: EnvironmentId(12),
            env_override_values: json!({"replicaCount": 9}),
            is_override: true,
            active: true,
            audit: AuditLog::now(TEST_USER),
        })
        .await
        .unwrap();

    let entry = s
        .h
        .recorder
        .record_env_override_change(&qa, false, None, TEST_USER)
        .await
        .unwrap();
    assert!(entry.pipeline_id.is_none());
    assert_eq!(entry.target_environment, Some(EnvironmentId(12)));
}

#[tokio::test]
async fn test_app_metrics_resolution_order() {
    let s = seeded().await;
    let recorder = &s.h.recorder;

    assert!(!recorder
        .resolve_app_metrics(s.app, EnvironmentId(10))
        .await
        .unwrap());

    s.h.store.app_metrics_upsert(s.app, true, TEST_USER).await.unwrap();
    assert!(recorder
        .resolve_app_metrics(s.app, EnvironmentId(10))
        .await
        .unwrap());

    s.h.store
        .env_metrics_upsert(s.app, EnvironmentId(10), false, TEST_USER)
        .await
        .unwrap();
    assert!(!recorder
        .resolve_app_metrics(s.app, EnvironmentId(10))
        .await
        .unwrap());
    assert!(recorder
        .resolve_app_metrics(s.app, EnvironmentId(11))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_overriding_env_is_excluded_from_global_history() {
    let s = seeded().await;
    let before = s.h.store.history_count().unwrap();

    let entries = s
        .h
        .recorder
        .record_global_template_change(&s.chart, false, TEST_USER)
        .await
        .unwrap();

    // Template-level entry plus prod only: dev overrides the chart.
    assert_eq!(entries.len(), 2);
    assert!(entries[0].pipeline_id.is_none());
    assert_eq!(entries[1].pipeline_id, Some(CdPipelineId(101)));
    assert_eq!(s.h.store.history_count().unwrap(), before + 2);
}
