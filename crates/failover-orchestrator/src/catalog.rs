//! Protection group and recovery plan management

use crate::clients::{ClientFactory, ResourceScope};
use crate::conflict::ConflictDetector;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{Execution, ProtectionGroup, RecoveryPlan, ResourceSelector};
use crate::retry::{retry_remote, RetryPolicy};
use crate::store::{list_active_executions, OrchestrationStore};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Validated CRUD over protection groups and recovery plans
pub struct ProtectionCatalog {
    store: Arc<dyn OrchestrationStore>,
    factory: Arc<ClientFactory>,
    detector: Arc<ConflictDetector>,
    remote_retry: RetryPolicy,
}

impl ProtectionCatalog {
    /// Create new catalog
    pub fn new(
        store: Arc<dyn OrchestrationStore>,
        factory: Arc<ClientFactory>,
        detector: Arc<ConflictDetector>,
        remote_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            factory,
            detector,
            remote_retry,
        }
    }

    /// Create a protection group
    ///
    /// Explicit members must be known to the recovery API, may not belong to
    /// another group in the same region and may not be engaged by an active
    /// execution or remote job.
    pub async fn create_protection_group(
        &self,
        mut group: ProtectionGroup,
    ) -> OrchestratorResult<ProtectionGroup> {
        if group.version != 0 {
            return Err(OrchestratorError::validation(
                "version",
                "new protection groups must have version 0",
            ));
        }
        self.validate_group(&group).await?;

        group.version = self.store.put_protection_group(&group).await?;
        info!(group_id = %group.id, name = %group.name, "created protection group");
        Ok(group)
    }

    /// Replace a protection group; `group.version` must match the stored version
    pub async fn update_protection_group(
        &self,
        mut group: ProtectionGroup,
    ) -> OrchestratorResult<ProtectionGroup> {
        if self.store.get_protection_group(group.id).await?.is_none() {
            return Err(OrchestratorError::not_found("protection group", group.id));
        }
        self.validate_group(&group).await?;

        group.updated_at = Utc::now();
        group.version = self.store.put_protection_group(&group).await?;
        info!(group_id = %group.id, version = group.version, "updated protection group");
        Ok(group)
    }

    /// Delete a protection group no plan references
    pub async fn delete_protection_group(
        &self,
        group_id: Uuid,
        expected_version: u64,
    ) -> OrchestratorResult<()> {
        let referencing: Vec<String> = self
            .store
            .list_recovery_plans()
            .await?
            .into_iter()
            .filter(|p| p.references_group(group_id))
            .map(|p| p.name)
            .collect();
        if !referencing.is_empty() {
            return Err(OrchestratorError::validation(
                "protection_group_id",
                format!("group is used by plan(s): {}", referencing.join(", ")),
            ));
        }

        self.store
            .delete_protection_group(group_id, expected_version)
            .await?;
        info!(group_id = %group_id, "deleted protection group");
        Ok(())
    }

    /// Read a protection group
    pub async fn get_protection_group(&self, group_id: Uuid) -> OrchestratorResult<ProtectionGroup> {
        self.store
            .get_protection_group(group_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("protection group", group_id))
    }

    /// All protection groups
    pub async fn list_protection_groups(&self) -> OrchestratorResult<Vec<ProtectionGroup>> {
        Ok(self.store.list_protection_groups().await?)
    }

    /// Scope a group's resources live in, falling back to `default_account`
    pub fn group_scope(
        group: &ProtectionGroup,
        default_account: Option<&crate::model::AccountContext>,
    ) -> ResourceScope {
        ResourceScope::new(
            group.region.clone(),
            group.account.clone().or_else(|| default_account.cloned()),
        )
    }

    /// Current members of `group`, sorted; tag selectors are resolved remotely
    pub async fn resolve_members(
        &self,
        group: &ProtectionGroup,
        scope: &ResourceScope,
    ) -> OrchestratorResult<Vec<String>> {
        match &group.selector {
            ResourceSelector::Explicit(ids) => Ok(ids.iter().cloned().collect()),
            ResourceSelector::Tags(_) => {
                let client = self.factory.recovery_client(scope).await?;
                let servers = retry_remote(&self.remote_retry, "list_source_servers", |_| {
                    client.list_source_servers()
                })
                .await?;
                let members: BTreeSet<String> = servers
                    .into_iter()
                    .filter(|s| group.selector.matches_tags(&s.tags))
                    .map(|s| s.resource_id)
                    .collect();
                Ok(members.into_iter().collect())
            }
        }
    }

    /// Create (`version == 0`) or replace a recovery plan
    ///
    /// Cycles and other structural problems are rejected here, never at
    /// execution time.
    pub async fn save_recovery_plan(
        &self,
        mut plan: RecoveryPlan,
    ) -> OrchestratorResult<RecoveryPlan> {
        if plan.name.trim().is_empty() {
            return Err(OrchestratorError::validation("name", "plan name is required"));
        }
        self.detector.check_plan(&plan)?;

        for group_id in plan.protection_group_ids() {
            if self.store.get_protection_group(group_id).await?.is_none() {
                return Err(OrchestratorError::not_found("protection group", group_id));
            }
        }

        if plan.version != 0 {
            self.ensure_plan_idle(plan.id, "update plan").await?;
        }

        plan.updated_at = Utc::now();
        plan.version = self.store.put_recovery_plan(&plan).await?;
        info!(plan_id = %plan.id, waves = plan.waves.len(), version = plan.version, "saved recovery plan");
        Ok(plan)
    }

    /// Delete a recovery plan with no active execution
    pub async fn delete_recovery_plan(
        &self,
        plan_id: Uuid,
        expected_version: u64,
    ) -> OrchestratorResult<()> {
        self.ensure_plan_idle(plan_id, "delete plan").await?;
        self.store.delete_recovery_plan(plan_id, expected_version).await?;
        info!(plan_id = %plan_id, "deleted recovery plan");
        Ok(())
    }

    /// Read a recovery plan
    pub async fn get_recovery_plan(&self, plan_id: Uuid) -> OrchestratorResult<RecoveryPlan> {
        self.store
            .get_recovery_plan(plan_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("recovery plan", plan_id))
    }

    /// All recovery plans
    pub async fn list_recovery_plans(&self) -> OrchestratorResult<Vec<RecoveryPlan>> {
        Ok(self.store.list_recovery_plans().await?)
    }

    async fn validate_group(&self, group: &ProtectionGroup) -> OrchestratorResult<()> {
        if group.name.trim().is_empty() {
            return Err(OrchestratorError::validation("name", "group name is required"));
        }
        if group.region.trim().is_empty() {
            return Err(OrchestratorError::validation("region", "region is required"));
        }
        if group.selector.is_empty() {
            return Err(OrchestratorError::validation(
                "selector",
                "selector must name at least one resource or tag",
            ));
        }

        let ResourceSelector::Explicit(members) = &group.selector else {
            return Ok(());
        };

        let scope = Self::group_scope(group, None);
        let client = self.factory.recovery_client(&scope).await?;
        let requested: Vec<String> = members.iter().cloned().collect();
        let known: BTreeSet<String> = retry_remote(
            &self.remote_retry,
            "describe_resource_replication_state",
            |_| client.describe_resource_replication_state(&requested),
        )
        .await?
        .into_iter()
        .map(|s| s.resource_id)
        .collect();
        let missing: Vec<&str> = members
            .iter()
            .filter(|id| !known.contains(*id))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(OrchestratorError::validation(
                "selector",
                format!("unknown resource(s): {}", missing.join(", ")),
            ));
        }

        self.detector
            .check_group_membership(group)
            .await?
            .into_result()?;
        self.detector
            .check_conflicts(&scope, members, None)
            .await?
            .into_result()
    }

    async fn ensure_plan_idle(&self, plan_id: Uuid, operation: &str) -> OrchestratorResult<()> {
        let active: Option<Execution> = list_active_executions(self.store.as_ref())
            .await?
            .into_iter()
            .find(|e| e.plan_id == plan_id);
        match active {
            Some(execution) => Err(OrchestratorError::InvalidState {
                execution_id: execution.id.to_string(),
                status: execution.status.to_string(),
                operation: operation.to_string(),
            }),
            None => Ok(()),
        }
    }
}
