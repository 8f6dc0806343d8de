//! Turns a ready range-deletion task into scheduled cleanup work.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::range_deletion::RangeDeletionStore;
use crate::sharding::{CleanupNotification, CollectionShardingRuntime};
use crate::task::RangeDeletionTask;

/// Why a task can never run and should be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    NamespaceNotFound,
    /// The collection was dropped and recreated under the same name.
    UuidMismatch { live: Uuid },
}

/// Result of one submission attempt.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Cleanup was handed to the sharding runtime.
    Scheduled(CleanupNotification),
    /// A cleanup for this task is still running from an earlier submission.
    AlreadyScheduled,
    /// Filtering metadata is not loaded; retry later, keep the task.
    MetadataUnknown,
    /// The migration is undecided; the task is kept and never executed.
    Pending,
    /// The task targets a collection that no longer exists as recorded.
    Stale(StaleReason),
}

impl SubmitOutcome {
    /// Whether the task is (now or still) scheduled for deletion.
    pub fn is_scheduled(&self) -> bool {
        matches!(self, SubmitOutcome::Scheduled(_) | SubmitOutcome::AlreadyScheduled)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, SubmitOutcome::Stale(_))
    }
}

/// Schedules ready tasks on the sharding runtime and removes each task once
/// its range has been deleted.
#[derive(Clone)]
pub struct RangeDeletionSubmitter {
    store: RangeDeletionStore,
    runtime: Arc<dyn CollectionShardingRuntime>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl RangeDeletionSubmitter {
    pub fn new(store: RangeDeletionStore, runtime: Arc<dyn CollectionShardingRuntime>) -> Self {
        Self {
            store,
            runtime,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Validates the task's collection and schedules its range for deletion.
    ///
    /// Never blocks on the deletion itself. A cleanup that has already failed
    /// by the time it is scheduled is logged, and the task is kept for the
    /// next recovery pass.
    pub fn submit(&self, task: &RangeDeletionTask) -> SubmitOutcome {
        if !task.is_ready() {
            tracing::warn!(migration_id = %task.id, nss = %task.nss, "refusing to submit pending range deletion task");
            return SubmitOutcome::Pending;
        }

        let Some(collection) = self.runtime.lookup(&task.nss) else {
            tracing::info!(migration_id = %task.id, nss = %task.nss, "namespace not found for range deletion");
            return SubmitOutcome::Stale(StaleReason::NamespaceNotFound);
        };
        if collection.uuid != task.collection_uuid {
            tracing::info!(
                migration_id = %task.id,
                nss = %task.nss,
                live_uuid = %collection.uuid,
                task_uuid = %task.collection_uuid,
                "collection uuid doesn't match the one marked for deletion"
            );
            return SubmitOutcome::Stale(StaleReason::UuidMismatch {
                live: collection.uuid,
            });
        }
        if !collection.metadata_known {
            tracing::info!(
                migration_id = %task.id,
                nss = %task.nss,
                "filtering metadata is not available; range deletion deferred"
            );
            return SubmitOutcome::MetadataUnknown;
        }

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if !in_flight.insert(task.id) {
                return SubmitOutcome::AlreadyScheduled;
            }
        }

        tracing::info!(
            migration_id = %task.id,
            nss = %task.nss,
            range = %task.range,
            when = ?task.when_to_clean,
            "scheduling range for deletion"
        );
        let mut notification =
            self.runtime
                .clean_up_range(&task.nss, &task.range, task.when_to_clean);

        if let Some(status) = notification.try_status().cloned() {
            self.finish(task.id, &status);
            if let Err(err) = &status {
                tracing::warn!(migration_id = %task.id, error = %err, "failed to resubmit range for deletion");
            }
            return SubmitOutcome::Scheduled(notification);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (completion, forwarded) = CleanupNotification::channel();
                let submitter = self.clone();
                let id = task.id;
                handle.spawn(async move {
                    let status = notification.wait().await;
                    let finished = status.clone();
                    if let Err(err) =
                        tokio::task::spawn_blocking(move || submitter.finish(id, &finished)).await
                    {
                        tracing::warn!(migration_id = %id, error = %err, "range deletion bookkeeping task failed");
                    }
                    completion.complete(status);
                });
                SubmitOutcome::Scheduled(forwarded)
            }
            Err(_) => {
                // Nobody can observe completion; let a later pass pick the
                // task up again once this cleanup is gone.
                self.release(task.id);
                SubmitOutcome::Scheduled(notification)
            }
        }
    }

    fn finish(&self, id: Uuid, status: &Result<u64, String>) {
        if status.is_ok() {
            match self.store.remove(id) {
                Ok(_) => tracing::debug!(migration_id = %id, "range deletion task completed"),
                Err(err) => tracing::warn!(
                    migration_id = %id,
                    error = ?err,
                    "failed to remove completed range deletion task"
                ),
            }
        }
        self.release(id);
    }

    fn release(&self, id: Uuid) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}
