//! Shared constants for the Shipyard control plane.

// ============================================================================
// CHART FAMILIES
// ============================================================================

pub const CHART_NAME_ROLLOUT: &str = "Rollout Deployment";
pub const CHART_NAME_DEPLOYMENT: &str = "Deployment";
pub const CHART_NAME_CRONJOB: &str = "Job & CronJob";
pub const CHART_NAME_STATEFULSET: &str = "StatefulSet";

/// Template name recorded in history when a chart reference has no name.
pub const DEFAULT_TEMPLATE_NAME: &str = CHART_NAME_ROLLOUT;

/// Display name of the template in history detail views.
pub const HISTORY_CODE_EDITOR_DISPLAY_NAME: &str = "values.yaml";

// ============================================================================
// CONFIGURATION DEFAULTS
// ============================================================================

pub const DEFAULT_CI_AUTO_TRIGGER_BATCH_SIZE: i64 = 1;
pub const DEFAULT_SYSTEM_USER_ID: i64 = 1;

pub const ENV_CI_AUTO_TRIGGER_BATCH_SIZE: &str = "SHIPYARD_CI_AUTO_TRIGGER_BATCH_SIZE";
pub const ENV_SYSTEM_USER_ID: &str = "SHIPYARD_SYSTEM_USER_ID";
pub const ENV_DEFAULT_DATA_SOURCE: &str = "SHIPYARD_DEFAULT_DATA_SOURCE";
