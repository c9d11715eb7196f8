//! Error types for Shipyard operations

use crate::EntityKind;
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity:?} with id {id}")]
    NotFound { entity: EntityKind, id: i64 },

    #[error("Insert failed for {entity:?}: {reason}")]
    InsertFailed { entity: EntityKind, reason: String },

    #[error("Update failed for {entity:?} with id {id}: {reason}")]
    UpdateFailed {
        entity: EntityKind,
        id: i64,
        reason: String,
    },

    #[error("Delete failed for {entity:?} with id {id}: {reason}")]
    DeleteFailed {
        entity: EntityKind,
        id: i64,
        reason: String,
    },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Chart reference {chart_ref_id} is already bound to application {app_id}")]
    DuplicateChartReference { app_id: i64, chart_ref_id: i64 },

    #[error("Data source not supported: {data_source}")]
    UnsupportedDataSource { data_source: String },

    #[error("Invalid chart version: {version}")]
    InvalidChartVersion { version: String },

    #[error("Chart kinds are not compatible: {from} -> {to}")]
    IncompatibleChartKinds { from: String, to: String },

    #[error("Invalid workflow status transition for {workflow_id}: {from} -> {to}")]
    InvalidStatusTransition {
        workflow_id: i64,
        from: String,
        to: String,
    },

    #[error("Invalid material info: {reason}")]
    InvalidMaterialInfo { reason: String },
}

/// Authorization errors. Rejections, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("invalid external ci id: {id}")]
    InvalidExternalCiId { id: i64 },

    #[error("invalid api key: {reason}")]
    InvalidApiKey { reason: String },

    #[error("permission denied on {resource}")]
    Denied { resource: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Tracing initialisation failed: {reason}")]
    TracingInit { reason: String },
}

/// A single downstream trigger failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("trigger failed for artifact {artifact_id}: {reason}")]
    Failed { artifact_id: i64, reason: String },

    #[error("trigger task for artifact {artifact_id} aborted: {reason}")]
    Aborted { artifact_id: i64, reason: String },

    #[error("fan-out for artifact {artifact_id} cancelled before any trigger ran")]
    Cancelled { artifact_id: i64 },
}

impl TriggerError {
    pub fn artifact_id(&self) -> i64 {
        match self {
            TriggerError::Failed { artifact_id, .. }
            | TriggerError::Aborted { artifact_id, .. }
            | TriggerError::Cancelled { artifact_id } => *artifact_id,
        }
    }
}

/// Aggregated, non-fatal fan-out outcome: some triggers failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{} downstream trigger(s) failed, {succeeded} succeeded", failures.len())]
pub struct FanOutFailure {
    pub failures: Vec<TriggerError>,
    pub succeeded: usize,
    pub triggered_any: bool,
}

/// Master error type for all Shipyard errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShipyardError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: i64 },

    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Authorization error: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Partial fan-out failure: {0}")]
    PartialFanOut(#[from] FanOutFailure),
}

impl ShipyardError {
    pub fn not_found(entity: EntityKind, id: impl Into<i64>) -> Self {
        ShipyardError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether this error means a referenced row is absent, whether raised by
    /// the service layer or surfaced from storage.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ShipyardError::NotFound { .. } | ShipyardError::Persistence(StorageError::NotFound { .. })
        )
    }
}

/// Result type alias for Shipyard operations.
pub type ShipyardResult<T> = Result<T, ShipyardError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::NotFound {
            entity: EntityKind::Artifact,
            id: 17,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("Artifact"));
        assert!(msg.contains("17"));
    }

    #[test]
    fn test_fan_out_failure_mentions_count() {
        let err = FanOutFailure {
            failures: vec![TriggerError::Failed {
                artifact_id: 3,
                reason: "boom".to_string(),
            }],
            succeeded: 4,
            triggered_any: true,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("1 downstream"));
        assert!(msg.contains("4 succeeded"));
    }

    #[test]
    fn test_not_found_detection() {
        let direct = ShipyardError::not_found(EntityKind::CiWorkflow, 5);
        let from_storage: ShipyardError = StorageError::NotFound {
            entity: EntityKind::Chart,
            id: 1,
        }
        .into();
        assert!(direct.is_not_found());
        assert!(from_storage.is_not_found());
        assert!(!ShipyardError::from(StorageError::LockPoisoned).is_not_found());
    }

    #[test]
    fn test_authorization_error_display() {
        let err = AuthorizationError::InvalidExternalCiId { id: 9 };
        assert_eq!(format!("{}", err), "invalid external ci id: 9");
    }
}
