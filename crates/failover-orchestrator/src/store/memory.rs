//! In-memory store backend

use super::{OrchestrationStore, StoreError, StoreResult};
use crate::model::{Execution, ExecutionStatus, ProtectionGroup, RecoveryPlan};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use uuid::Uuid;

/// Store backed by concurrent maps
///
/// Conditional writes hold the record's shard lock for the compare and the
/// swap; the status index is updated under the same lock. Creates are
/// serialized so admission order matches visibility order.
#[derive(Default)]
pub struct InMemoryStore {
    admissions: Mutex<u64>,
    executions: DashMap<Uuid, Execution>,
    status_index: DashMap<ExecutionStatus, HashSet<Uuid>>,
    groups: DashMap<Uuid, ProtectionGroup>,
    plans: DashMap<Uuid, RecoveryPlan>,
}

impl InMemoryStore {
    /// Create new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions
    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }

    fn index_insert(&self, status: ExecutionStatus, id: Uuid) {
        self.status_index.entry(status).or_default().insert(id);
    }

    fn index_move(&self, from: ExecutionStatus, to: ExecutionStatus, id: Uuid) {
        if from == to {
            return;
        }
        // listed under at least one status at every instant
        self.index_insert(to, id);
        if let Some(mut ids) = self.status_index.get_mut(&from) {
            ids.remove(&id);
        }
    }
}

#[async_trait]
impl OrchestrationStore for InMemoryStore {
    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        Ok(self.executions.get(&id).map(|e| e.clone()))
    }

    async fn create_execution(&self, execution: &Execution) -> StoreResult<u64> {
        if execution.version != 0 {
            return Err(StoreError::ConditionFailed {
                record: "execution",
                id: execution.id,
                expected_version: execution.version,
            });
        }
        let mut admissions = self.admissions.lock();
        match self.executions.entry(execution.id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                record: "execution",
                id: execution.id,
            }),
            Entry::Vacant(slot) => {
                *admissions += 1;
                let mut stored = execution.clone();
                stored.version = 1;
                stored.admission_seq = *admissions;
                self.index_insert(stored.status, stored.id);
                slot.insert(stored);
                Ok(1)
            }
        }
    }

    async fn update_execution(&self, execution: &Execution) -> StoreResult<u64> {
        let mut stored = self
            .executions
            .get_mut(&execution.id)
            .ok_or(StoreError::NotFound {
                record: "execution",
                id: execution.id,
            })?;
        if stored.version != execution.version {
            return Err(StoreError::ConditionFailed {
                record: "execution",
                id: execution.id,
                expected_version: execution.version,
            });
        }

        let previous_status = stored.status;
        let mut next = execution.clone();
        next.version = execution.version + 1;
        next.admission_seq = stored.admission_seq;
        let version = next.version;
        *stored = next;
        self.index_move(previous_status, execution.status, execution.id);
        Ok(version)
    }

    async fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> StoreResult<Vec<Execution>> {
        let ids: Vec<Uuid> = self
            .status_index
            .get(&status)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        let mut executions: Vec<Execution> = ids
            .into_iter()
            .filter_map(|id| self.executions.get(&id).map(|e| e.clone()))
            .filter(|e| e.status == status)
            .collect();
        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }

    async fn get_protection_group(&self, id: Uuid) -> StoreResult<Option<ProtectionGroup>> {
        Ok(self.groups.get(&id).map(|g| g.clone()))
    }

    async fn put_protection_group(&self, group: &ProtectionGroup) -> StoreResult<u64> {
        put_versioned(&self.groups, "protection group", group.id, group.version, |v| {
            let mut stored = group.clone();
            stored.version = v;
            stored
        })
    }

    async fn delete_protection_group(&self, id: Uuid, expected_version: u64) -> StoreResult<()> {
        delete_versioned(&self.groups, "protection group", id, expected_version)
    }

    async fn list_protection_groups(&self) -> StoreResult<Vec<ProtectionGroup>> {
        let mut groups: Vec<_> = self.groups.iter().map(|g| g.clone()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn get_recovery_plan(&self, id: Uuid) -> StoreResult<Option<RecoveryPlan>> {
        Ok(self.plans.get(&id).map(|p| p.clone()))
    }

    async fn put_recovery_plan(&self, plan: &RecoveryPlan) -> StoreResult<u64> {
        put_versioned(&self.plans, "recovery plan", plan.id, plan.version, |v| {
            let mut stored = plan.clone();
            stored.version = v;
            stored
        })
    }

    async fn delete_recovery_plan(&self, id: Uuid, expected_version: u64) -> StoreResult<()> {
        delete_versioned(&self.plans, "recovery plan", id, expected_version)
    }

    async fn list_recovery_plans(&self) -> StoreResult<Vec<RecoveryPlan>> {
        let mut plans: Vec<_> = self.plans.iter().map(|p| p.clone()).collect();
        plans.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(plans)
    }
}

trait Versioned {
    fn version(&self) -> u64;
}

impl Versioned for ProtectionGroup {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for RecoveryPlan {
    fn version(&self) -> u64 {
        self.version
    }
}

fn put_versioned<T: Versioned>(
    map: &DashMap<Uuid, T>,
    record: &'static str,
    id: Uuid,
    expected_version: u64,
    build: impl FnOnce(u64) -> T,
) -> StoreResult<u64> {
    match map.entry(id) {
        Entry::Vacant(slot) => {
            if expected_version != 0 {
                return Err(StoreError::NotFound { record, id });
            }
            slot.insert(build(1));
            Ok(1)
        }
        Entry::Occupied(mut slot) => {
            if expected_version == 0 {
                return Err(StoreError::AlreadyExists { record, id });
            }
            if slot.get().version() != expected_version {
                return Err(StoreError::ConditionFailed {
                    record,
                    id,
                    expected_version,
                });
            }
            let version = expected_version + 1;
            slot.insert(build(version));
            Ok(version)
        }
    }
}

fn delete_versioned<T: Versioned>(
    map: &DashMap<Uuid, T>,
    record: &'static str,
    id: Uuid,
    expected_version: u64,
) -> StoreResult<()> {
    match map.entry(id) {
        Entry::Vacant(_) => Err(StoreError::NotFound { record, id }),
        Entry::Occupied(slot) => {
            if slot.get().version() != expected_version {
                return Err(StoreError::ConditionFailed {
                    record,
                    id,
                    expected_version,
                });
            }
            slot.remove();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionType, ResourceSelector, Wave};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn execution() -> Execution {
        Execution::new(
            Uuid::new_v4(),
            "plan",
            ExecutionType::Drill,
            None,
            vec![Wave::new(0, Uuid::new_v4(), "us-east-1", None, false, vec![])],
        )
    }

    #[tokio::test]
    async fn test_create_execution_is_conditional() {
        let store = InMemoryStore::new();
        let exec = execution();
        assert_eq!(store.create_execution(&exec).await.unwrap(), 1);
        assert!(matches!(
            store.create_execution(&exec).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_admission_seq_follows_create_order() {
        let store = InMemoryStore::new();
        let first = execution();
        let second = execution();
        store.create_execution(&second).await.unwrap();
        store.create_execution(&first).await.unwrap();

        let second = store.get_execution(second.id).await.unwrap().unwrap();
        let mut first = store.get_execution(first.id).await.unwrap().unwrap();
        assert_eq!(second.admission_seq, 1);
        assert_eq!(first.admission_seq, 2);

        // callers cannot rewrite their place in line
        first.admission_seq = 0;
        first.status = ExecutionStatus::Polling;
        store.update_execution(&first).await.unwrap();
        let stored = store.get_execution(first.id).await.unwrap().unwrap();
        assert_eq!(stored.admission_seq, 2);
    }

    #[tokio::test]
    async fn test_stale_update_rejected() {
        let store = InMemoryStore::new();
        let exec = execution();
        store.create_execution(&exec).await.unwrap();

        let mut fresh = store.get_execution(exec.id).await.unwrap().unwrap();
        let stale = fresh.clone();
        fresh.status = ExecutionStatus::Polling;
        assert_eq!(store.update_execution(&fresh).await.unwrap(), 2);

        let err = store.update_execution(&stale).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConditionFailed {
                expected_version: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_status_index_follows_updates() {
        let store = InMemoryStore::new();
        let exec = execution();
        store.create_execution(&exec).await.unwrap();
        assert_eq!(
            store
                .list_executions_by_status(ExecutionStatus::Pending)
                .await
                .unwrap()
                .len(),
            1
        );

        let mut stored = store.get_execution(exec.id).await.unwrap().unwrap();
        stored.status = ExecutionStatus::Polling;
        store.update_execution(&stored).await.unwrap();

        assert!(store
            .list_executions_by_status(ExecutionStatus::Pending)
            .await
            .unwrap()
            .is_empty());
        let polling = store
            .list_executions_by_status(ExecutionStatus::Polling)
            .await
            .unwrap();
        assert_eq!(polling.len(), 1);
        assert_eq!(polling[0].id, exec.id);
    }

    #[tokio::test]
    async fn test_concurrent_updates_exactly_one_wins() {
        let store = Arc::new(InMemoryStore::new());
        let exec = execution();
        store.create_execution(&exec).await.unwrap();
        let snapshot = store.get_execution(exec.id).await.unwrap().unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let mut candidate = snapshot.clone();
            candidate.status = ExecutionStatus::Polling;
            handles.push(tokio::spawn(async move {
                store.update_execution(&candidate).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_group_versioning() {
        let store = InMemoryStore::new();
        let mut group = ProtectionGroup::new(
            "db",
            "us-east-1",
            None,
            ResourceSelector::Explicit(BTreeSet::from(["s-1".to_string()])),
        );
        group.version = store.put_protection_group(&group).await.unwrap();
        assert_eq!(group.version, 1);

        let stale = group.clone();
        group.name = "db-tier".to_string();
        group.version = store.put_protection_group(&group).await.unwrap();
        assert_eq!(group.version, 2);

        assert!(matches!(
            store.put_protection_group(&stale).await,
            Err(StoreError::ConditionFailed { .. })
        ));
        assert!(matches!(
            store.delete_protection_group(group.id, 1).await,
            Err(StoreError::ConditionFailed { .. })
        ));
        store.delete_protection_group(group.id, 2).await.unwrap();
        assert!(store.get_protection_group(group.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_new_record_twice_is_already_exists() {
        let store = InMemoryStore::new();
        let plan = RecoveryPlan::new("p", None, vec![]);
        store.put_recovery_plan(&plan).await.unwrap();
        assert!(matches!(
            store.put_recovery_plan(&plan).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }
}
