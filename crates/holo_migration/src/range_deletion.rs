//! Durable range-deletion tasks and the overlap check that guards them.

use std::sync::Arc;

use fjall::Keyspace;
use uuid::Uuid;

use crate::error::{MigrationError, MigrationResult};
use crate::range::ChunkRange;
use crate::store::{PersistentTaskStore, StoreError, StoreResult, WriteConcern};
use crate::task::RangeDeletionTask;

/// Partition holding one record per range that must eventually be deleted.
pub const RANGE_DELETIONS_COLLECTION: &str = "config_range_deletions";

#[derive(Clone)]
pub struct RangeDeletionStore {
    tasks: PersistentTaskStore<RangeDeletionTask>,
}

impl RangeDeletionStore {
    pub fn open(keyspace: Arc<Keyspace>) -> StoreResult<Self> {
        Ok(Self {
            tasks: PersistentTaskStore::open(keyspace, RANGE_DELETIONS_COLLECTION)?,
        })
    }

    /// Inserts a task; fails with `StoreError::DuplicateKey` if its id exists.
    pub fn add(&self, task: &RangeDeletionTask) -> StoreResult<()> {
        self.tasks.add(task, WriteConcern::Majority)
    }

    pub fn get(&self, id: Uuid) -> StoreResult<Option<RangeDeletionTask>> {
        self.tasks.get(id)
    }

    pub fn remove(&self, id: Uuid) -> StoreResult<bool> {
        self.tasks.remove(id, WriteConcern::Majority)
    }

    /// Drops every task that targets the collection `collection_uuid`.
    pub fn remove_all_for_collection(&self, collection_uuid: Uuid) -> StoreResult<usize> {
        self.tasks.remove_where(
            |task| task.collection_uuid == collection_uuid,
            WriteConcern::Majority,
        )
    }

    pub fn remove_many(&self, ids: &[Uuid]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.tasks
            .remove_where(|task| ids.contains(&task.id), WriteConcern::Majority)
    }

    /// Marks the task ready for execution. Returns whether the task existed.
    pub fn clear_pending(&self, id: Uuid) -> StoreResult<bool> {
        self.tasks
            .update(id, |task| task.pending = false, WriteConcern::Majority)
    }

    /// Visits every ready task. Tasks the visitor rejects are removed once the
    /// scan has finished. Returns how many were removed.
    ///
    /// The visitor runs synchronously inside the scan. The step-up recovery
    /// sweep refreshes metadata asynchronously per task, so it works from a
    /// [`RangeDeletionStore::ready_tasks`] snapshot and removes stale tasks
    /// with [`RangeDeletionStore::remove_many`] instead.
    pub fn for_each_ready<V>(&self, mut visitor: V) -> StoreResult<usize>
    where
        V: FnMut(&RangeDeletionTask) -> bool,
    {
        let mut invalid = Vec::new();
        self.tasks.for_each(RangeDeletionTask::is_ready, |task| {
            if !visitor(task) {
                invalid.push(task.id);
            }
            true
        })?;
        self.remove_many(&invalid)
    }

    /// Snapshot of every ready task.
    pub fn ready_tasks(&self) -> StoreResult<Vec<RangeDeletionTask>> {
        self.tasks.collect_where(RangeDeletionTask::is_ready)
    }

    pub fn list(&self) -> StoreResult<Vec<RangeDeletionTask>> {
        self.tasks.list()
    }

    /// True iff a stored task for `collection_uuid` shares a key with `range`.
    ///
    /// The caller must hold whatever range-ownership lock makes "check, then
    /// record intent" atomic for the collection; this check alone is not.
    pub fn has_overlap(&self, range: &ChunkRange, collection_uuid: Uuid) -> StoreResult<bool> {
        Ok(self.count_overlapping(range, collection_uuid)? > 0)
    }

    pub fn count_overlapping(&self, range: &ChunkRange, collection_uuid: Uuid) -> StoreResult<usize> {
        self.tasks.count(|task| {
            task.collection_uuid == collection_uuid && task.range.overlaps(range)
        })
    }

    /// Removes every task. Operational reset only.
    pub fn drop_all(&self) -> StoreResult<usize> {
        self.tasks.remove_where(|_| true, WriteConcern::Majority)
    }
}

/// Records `task`, reporting a duplicate migration id as
/// `DuplicateRangeDeletion` rather than a raw storage conflict.
pub fn persist_range_deletion_task_locally(
    store: &RangeDeletionStore,
    task: &RangeDeletionTask,
) -> MigrationResult<()> {
    match store.add(task) {
        Ok(()) => Ok(()),
        Err(StoreError::DuplicateKey { .. }) => Err(MigrationError::DuplicateRangeDeletion {
            migration_id: task.id,
            task: serde_json::to_string(task).unwrap_or_else(|_| format!("{task:?}")),
        }),
        Err(err) => Err(err.into()),
    }
}
