//! Enum types for Shipyard entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// CORE ENUMS
// ============================================================================

/// Entity kind discriminator used in error diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Artifact,
    CiWorkflow,
    CiPipeline,
    ExternalCiPipeline,
    CdPipeline,
    CdWorkflowRunner,
    Application,
    Environment,
    Chart,
    ChartRef,
    ChartRepo,
    EnvOverride,
    AppLevelMetrics,
    EnvLevelMetrics,
    DeploymentTemplateHistory,
    User,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where a build artifact originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataSource {
    /// The in-cluster build runner.
    CiRunner,
    /// Legacy CI tool integration.
    Gocd,
    /// Webhook-driven external CI.
    #[default]
    External,
}

impl DataSource {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            DataSource::CiRunner => "CI-RUNNER",
            DataSource::Gocd => "GOCD",
            DataSource::External => "EXTERNAL",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for DataSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "cirunner" => Ok(DataSource::CiRunner),
            "gocd" => Ok(DataSource::Gocd),
            "external" => Ok(DataSource::External),
            _ => Err(format!("Invalid DataSource: {}", s)),
        }
    }
}

/// Execution status of a build workflow.
///
/// `Pending -> Running -> {Succeeded, Failed, Error}`. Terminal states are
/// sinks; a retry creates a new workflow row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Succeeded | WorkflowStatus::Failed | WorkflowStatus::Error
        )
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// A terminal status is written once; re-applying it is rejected.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, next) {
            (a, b) if *a == b => !a.is_terminal(),
            (Pending, Running) => true,
            (Pending | Running, Succeeded | Failed | Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            WorkflowStatus::Pending => "Pending",
            WorkflowStatus::Running => "Running",
            WorkflowStatus::Succeeded => "Succeeded",
            WorkflowStatus::Failed => "Failed",
            WorkflowStatus::Error => "Error",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "succeeded" | "success" => Ok(WorkflowStatus::Succeeded),
            "failed" | "failure" => Ok(WorkflowStatus::Failed),
            "error" => Ok(WorkflowStatus::Error),
            _ => Err(format!("Invalid WorkflowStatus: {}", s)),
        }
    }
}

/// Whether a downstream trigger was initiated by a person or by automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerMode {
    Manual,
    Automatic,
}

impl TriggerMode {
    pub fn is_manual(&self) -> bool {
        matches!(self, TriggerMode::Manual)
    }
}

/// Stage of a CD workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CdWorkflowType {
    PreDeploy,
    Deploy,
    PostDeploy,
}

impl fmt::Display for CdWorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            CdWorkflowType::PreDeploy => "PRE",
            CdWorkflowType::Deploy => "DEPLOY",
            CdWorkflowType::PostDeploy => "POST",
        };
        write!(f, "{}", value)
    }
}

fn normalize_token(value: &str) -> String {
    value
        .trim()
        .chars()
        .filter(|c| *c != '_' && *c != '-' && *c != ' ')
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_source_round_trips_db_names() {
        for ds in [DataSource::CiRunner, DataSource::Gocd, DataSource::External] {
            assert_eq!(ds.as_db_str().parse::<DataSource>(), Ok(ds));
        }
        assert!("JENKINS".parse::<DataSource>().is_err());
    }

    #[test]
    fn test_workflow_terminal_states_are_sinks() {
        use WorkflowStatus::*;
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Running));
        assert!(!Succeeded.can_transition_to(Succeeded));
        assert!(!Failed.can_transition_to(Succeeded));
        assert!(!Error.can_transition_to(Running));
        assert!(!Succeeded.can_transition_to(Failed));
    }

    #[test]
    fn test_workflow_status_from_str_aliases() {
        assert_eq!("success".parse::<WorkflowStatus>(), Ok(WorkflowStatus::Succeeded));
        assert_eq!("Failed".parse::<WorkflowStatus>(), Ok(WorkflowStatus::Failed));
    }
}
