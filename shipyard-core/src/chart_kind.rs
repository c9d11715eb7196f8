//! Chart template families and migration compatibility
//!
//! A chart reference name maps onto a closed set of workload kinds. Switching
//! an application between two chart references is only allowed when both
//! render the same base workload.

use crate::constants::{
    CHART_NAME_CRONJOB, CHART_NAME_DEPLOYMENT, CHART_NAME_ROLLOUT, CHART_NAME_STATEFULSET,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base Kubernetes workload rendered by a chart family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    Rollout,
    Job,
    StatefulSet,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 4] = [
        WorkloadKind::Deployment,
        WorkloadKind::Rollout,
        WorkloadKind::Job,
        WorkloadKind::StatefulSet,
    ];

    /// Resolve a chart reference name. An empty name is the default rollout
    /// chart; unrecognised names resolve to `None`.
    pub fn from_chart_name(name: &str) -> Option<Self> {
        match name.trim() {
            "" | CHART_NAME_ROLLOUT => Some(WorkloadKind::Rollout),
            CHART_NAME_DEPLOYMENT => Some(WorkloadKind::Deployment),
            CHART_NAME_CRONJOB => Some(WorkloadKind::Job),
            CHART_NAME_STATEFULSET => Some(WorkloadKind::StatefulSet),
            _ => None,
        }
    }

    pub fn chart_name(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => CHART_NAME_DEPLOYMENT,
            WorkloadKind::Rollout => CHART_NAME_ROLLOUT,
            WorkloadKind::Job => CHART_NAME_CRONJOB,
            WorkloadKind::StatefulSet => CHART_NAME_STATEFULSET,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.chart_name())
    }
}

/// A chart family: base workload plus whether progressive (canary) delivery
/// is layered on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChartKind {
    pub workload: WorkloadKind,
    pub canary: bool,
}

impl ChartKind {
    pub fn new(workload: WorkloadKind, canary: bool) -> Self {
        Self { workload, canary }
    }

    pub fn from_chart_name(name: &str, canary: bool) -> Option<Self> {
        WorkloadKind::from_chart_name(name).map(|workload| Self { workload, canary })
    }

    /// Symmetric, reflexive. The canary layer does not change the rendered
    /// base workload, so it does not affect compatibility.
    pub fn is_compatible_with(&self, other: &ChartKind) -> bool {
        self.workload == other.workload
    }
}

/// Compatibility over raw chart reference names. Unknown names are never
/// compatible with anything, including themselves.
pub fn chart_kinds_compatible(old_name: &str, new_name: &str) -> bool {
    match (
        WorkloadKind::from_chart_name(old_name),
        WorkloadKind::from_chart_name(new_name),
    ) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_kind() -> impl Strategy<Value = ChartKind> {
        (0usize..4, any::<bool>()).prop_map(|(i, canary)| ChartKind::new(WorkloadKind::ALL[i], canary))
    }

    #[test]
    fn test_empty_name_is_rollout() {
        assert_eq!(WorkloadKind::from_chart_name(""), Some(WorkloadKind::Rollout));
        assert!(chart_kinds_compatible("", CHART_NAME_ROLLOUT));
    }

    #[test]
    fn test_unknown_names_never_compatible() {
        assert!(!chart_kinds_compatible("Knative", "Knative"));
        assert!(!chart_kinds_compatible("Knative", CHART_NAME_DEPLOYMENT));
        assert!(!chart_kinds_compatible(CHART_NAME_DEPLOYMENT, CHART_NAME_ROLLOUT));
    }

    proptest! {
        #[test]
        fn prop_compatibility_reflexive(k in any_kind()) {
            prop_assert!(k.is_compatible_with(&k));
        }

        #[test]
        fn prop_compatibility_symmetric(a in any_kind(), b in any_kind()) {
            prop_assert_eq!(a.is_compatible_with(&b), b.is_compatible_with(&a));
        }
    }
}
