//! Identity types for Shipyard entities
//!
//! Every persisted row is keyed by a surrogate integer assigned by the store.
//! Each table gets its own newtype so an artifact id can never be passed where
//! a pipeline id is expected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Common behaviour of all surrogate-key newtypes.
pub trait EntityIdType: Copy + Eq + std::hash::Hash + fmt::Debug + fmt::Display {
    /// Wrap a raw key.
    fn new(raw: i64) -> Self;

    /// The raw key as stored.
    fn as_i64(&self) -> i64;
}

macro_rules! define_entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl EntityIdType for $name {
            fn new(raw: i64) -> Self {
                Self(raw)
            }

            fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> i64 {
                id.0
            }
        }
    };
}

define_entity_id!(
    /// Recorded container image.
    ArtifactId
);
define_entity_id!(
    /// Internal CI (build) pipeline.
    CiPipelineId
);
define_entity_id!(
    /// Externally registered CI source (webhook-driven).
    ExternalCiId
);
define_entity_id!(
    /// Build workflow (one CI run).
    WorkflowId
);
define_entity_id!(
    /// CD (deployment) pipeline bound to one environment.
    CdPipelineId
);
define_entity_id!(
    /// CD workflow runner (one deployment execution).
    CdWorkflowRunnerId
);
define_entity_id!(AppId);
define_entity_id!(EnvironmentId);
define_entity_id!(ChartId);
define_entity_id!(ChartRefId);
define_entity_id!(ChartRepoId);
define_entity_id!(EnvOverrideId);
define_entity_id!(
    /// Deployment template history entry.
    HistoryId
);
define_entity_id!(UserId);

/// The principal used by automated (system) triggers.
pub const SYSTEM_USER_ID: UserId = UserId(1);

impl UserId {
    /// Whether this user is the automation principal.
    pub fn is_system(&self) -> bool {
        *self == SYSTEM_USER_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_transparently() {
        let id = ArtifactId(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: ArtifactId = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_system_user() {
        assert!(UserId(1).is_system());
        assert!(!UserId(7).is_system());
        assert_eq!(format!("{}", ChartId::new(9)), "9");
    }

    #[test]
    fn test_default_id_is_zero() {
        assert_eq!(UserId::default(), UserId(0));
        assert_eq!(WorkflowId::default().as_i64(), 0);
    }
}
