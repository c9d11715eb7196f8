//! Constants for the pipeline services.

// ============================================================================
// TELEMETRY
// ============================================================================

pub const ENV_LOG_FILTER: &str = "SHIPYARD_LOG_FILTER";
pub const ENV_LOG_JSON: &str = "SHIPYARD_LOG_JSON";
pub const ENV_SERVICE_NAME: &str = "SHIPYARD_SERVICE_NAME";

pub const DEFAULT_SERVICE_NAME: &str = "shipyard";
pub const DEFAULT_LOG_FILTER: &str = "shipyard_pipeline=info,shipyard_storage=info,warn";

// ============================================================================
// WEBHOOKS
// ============================================================================

/// Separator between the encoded registration id and the token of an
/// external CI api key.
pub const API_KEY_SEPARATOR: char = '.';
