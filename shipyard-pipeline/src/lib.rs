//! Shipyard Pipeline
//!
//! Services of the CI/CD control plane built on the storage traits:
//!
//! - [`WebhookService`]: build-completion ingestion for internal and external CI
//! - [`AutoTriggerEngine`]: batched, failure-isolated downstream fan-out
//! - [`ChartService`]: versioned chart configuration per application
//! - [`DeploymentHistoryRecorder`]: immutable deployment template history
//! - [`Notifier`]: fire-and-forget build notifications
//!
//! Logging goes through `tracing`; call [`init_tracing`] once at startup.

pub mod chart;
pub mod constants;
pub mod fanout;
pub mod history;
pub mod notify;
pub mod telemetry;
pub mod webhook;

pub use chart::{flagger_canary_enabled, ChartService, TemplateRequest};
pub use fanout::{Authorizer, AutoTriggerEngine, FanOutReport, TriggerExecutor};
pub use history::{
    CodeEditorValue, DeployedHistorySummary, DeploymentDetail, DeploymentHistoryRecorder,
    HistoryDetail,
};
pub use notify::{BuildEvent, BuildEventKind, NotificationError, NotificationSink, Notifier};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use webhook::{BuildEventRequest, IngestionOutcome, WebhookService};
