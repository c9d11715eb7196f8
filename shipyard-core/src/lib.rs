//! Shipyard Core - Entity Types
//!
//! Pure data structures for the CI/CD control plane: identifiers, enums,
//! entities, errors, configuration and the small pure helpers (chart kind
//! compatibility, chart versions, JSON merge-patch, provenance parsing)
//! every other crate builds on. No I/O lives here.

pub mod chart_kind;
pub mod config;
pub mod constants;
pub mod entities;
pub mod enums;
pub mod error;
pub mod identity;
pub mod material;
pub mod merge;
pub mod version;

pub use chart_kind::{chart_kinds_compatible, ChartKind, WorkloadKind};
pub use config::CiConfig;
pub use entities::*;
pub use enums::{CdWorkflowType, DataSource, EntityKind, TriggerMode, WorkflowStatus};
pub use error::{
    AuthorizationError, ConfigError, FanOutFailure, ShipyardError, ShipyardResult, StorageError,
    TriggerError, ValidationError,
};
pub use identity::{
    AppId, ArtifactId, CdPipelineId, CdWorkflowRunnerId, ChartId, ChartRefId, ChartRepoId,
    CiPipelineId, EntityIdType, EnvOverrideId, EnvironmentId, ExternalCiId, HistoryId, Timestamp,
    UserId, WorkflowId, SYSTEM_USER_ID,
};
pub use material::MaterialInfo;
pub use merge::{merge_patch, merged};
pub use version::ChartVersion;
