//! Cross-execution conflict detection and plan graph validation

pub mod dependencies;
pub mod detector;

pub use dependencies::DependencyGraph;
pub use detector::ConflictDetector;

use crate::error::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// What a conflicting resource is already engaged in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictSource {
    /// A non-terminal execution references the resource
    Execution {
        /// Execution holding the resource
        execution_id: Uuid,
        /// Plan of that execution
        plan_id: Uuid,
    },
    /// A remote job in progress includes the resource
    RemoteJob {
        /// Remote job
        job_id: String,
    },
    /// Another protection group in the same region already selects it
    ProtectionGroup {
        /// Owning group
        group_id: Uuid,
        /// Owning group name
        name: String,
    },
}

/// One resource and where it is already in use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConflict {
    /// Conflicting resource
    pub resource_id: String,
    /// Where it is in use
    pub source: ConflictSource,
}

impl fmt::Display for ResourceConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConflictSource::Execution {
                execution_id,
                plan_id,
            } => write!(
                f,
                "{} is in use by execution {} (plan {})",
                self.resource_id, execution_id, plan_id
            ),
            ConflictSource::RemoteJob { job_id } => write!(
                f,
                "{} is part of remote job {} in progress",
                self.resource_id, job_id
            ),
            ConflictSource::ProtectionGroup { group_id, name } => write!(
                f,
                "{} already belongs to protection group {} ({})",
                self.resource_id, name, group_id
            ),
        }
    }
}

/// Result of a conflict check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictReport {
    conflicts: Vec<ResourceConflict>,
}

impl ConflictReport {
    /// Empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a conflict; exact duplicates are dropped
    pub fn push(&mut self, resource_id: impl Into<String>, source: ConflictSource) {
        let conflict = ResourceConflict {
            resource_id: resource_id.into(),
            source,
        };
        if !self.conflicts.contains(&conflict) {
            self.conflicts.push(conflict);
        }
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: ConflictReport) {
        for conflict in other.conflicts {
            self.push(conflict.resource_id, conflict.source);
        }
    }

    /// Whether nothing conflicts
    pub fn is_clear(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// All conflicts
    pub fn conflicts(&self) -> &[ResourceConflict] {
        &self.conflicts
    }

    /// Distinct conflicting resources
    pub fn resource_ids(&self) -> BTreeSet<&str> {
        self.conflicts
            .iter()
            .map(|c| c.resource_id.as_str())
            .collect()
    }

    /// Executions named in the report
    pub fn execution_ids(&self) -> BTreeSet<Uuid> {
        self.conflicts
            .iter()
            .filter_map(|c| match c.source {
                ConflictSource::Execution { execution_id, .. } => Some(execution_id),
                _ => None,
            })
            .collect()
    }

    /// `Ok` when clear, otherwise a `Conflict` error carrying every entry
    pub fn into_result(self) -> OrchestratorResult<()> {
        if self.is_clear() {
            Ok(())
        } else {
            Err(OrchestratorError::Conflict {
                conflicts: self.conflicts,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_dedupes_and_collects_executions() {
        let execution_id = Uuid::new_v4();
        let source = ConflictSource::Execution {
            execution_id,
            plan_id: Uuid::new_v4(),
        };
        let mut report = ConflictReport::new();
        report.push("s-1", source.clone());
        report.push("s-1", source.clone());
        report.push(
            "s-2",
            ConflictSource::RemoteJob {
                job_id: "job-7".to_string(),
            },
        );

        assert_eq!(report.conflicts().len(), 2);
        assert_eq!(report.execution_ids(), BTreeSet::from([execution_id]));
        assert_eq!(report.resource_ids(), BTreeSet::from(["s-1", "s-2"]));
    }

    #[test]
    fn test_into_result() {
        assert!(ConflictReport::new().into_result().is_ok());

        let mut report = ConflictReport::new();
        report.push(
            "s-9",
            ConflictSource::RemoteJob {
                job_id: "job-1".to_string(),
            },
        );
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("job-1"));
        assert_eq!(err.http_status_hint(), 409);
    }

    #[test]
    fn test_group_conflict_display() {
        let conflict = ResourceConflict {
            resource_id: "s-3".to_string(),
            source: ConflictSource::ProtectionGroup {
                group_id: Uuid::nil(),
                name: "web".to_string(),
            },
        };
        assert!(conflict.to_string().contains("protection group web"));
    }
}
