//! Step-up recovery: resubmit every ready range-deletion task.

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{MigrationError, MigrationResult};
use crate::range_deletion::RangeDeletionStore;
use crate::sharding::MetadataRefresher;
use crate::store::run_blocking;
use crate::submitter::{RangeDeletionSubmitter, SubmitOutcome};

/// What one recovery pass did with the ready tasks it found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub submitted: usize,
    /// Still running from an earlier pass.
    pub already_scheduled: usize,
    /// Kept for a later pass because filtering metadata was unknown.
    pub deferred: usize,
    /// Removed because their collection is gone or was recreated.
    pub discarded: usize,
}

impl RecoverySummary {
    pub fn visited(&self) -> usize {
        self.submitted + self.already_scheduled + self.deferred + self.discarded
    }
}

/// Refreshes filtering metadata for, and submits, every ready task.
///
/// Stale tasks are removed once all tasks have been visited. A refresh failure
/// ends the pass immediately and nothing is removed.
pub async fn submit_pending_deletions(
    store: &RangeDeletionStore,
    submitter: &RangeDeletionSubmitter,
    refresher: &dyn MetadataRefresher,
) -> MigrationResult<RecoverySummary> {
    let tasks = {
        let store = store.clone();
        run_blocking(move || Ok(store.ready_tasks()?)).await?
    };
    let mut summary = RecoverySummary::default();
    if tasks.is_empty() {
        return Ok(summary);
    }
    tracing::info!(tasks = tasks.len(), "submitting ready range deletions");

    let mut stale: Vec<Uuid> = Vec::new();
    for task in tasks {
        refresher
            .refresh(&task.nss)
            .await
            .map_err(|source| MigrationError::MetadataRefresh {
                namespace: task.nss.to_string(),
                source,
            })?;

        let outcome = {
            let submitter = submitter.clone();
            let task = task.clone();
            run_blocking(move || Ok(submitter.submit(&task))).await?
        };
        match outcome {
            SubmitOutcome::Scheduled(notification) => {
                summary.submitted += 1;
                notification.abandon();
            }
            SubmitOutcome::AlreadyScheduled => summary.already_scheduled += 1,
            SubmitOutcome::MetadataUnknown | SubmitOutcome::Pending => summary.deferred += 1,
            SubmitOutcome::Stale(reason) => {
                tracing::warn!(migration_id = %task.id, nss = %task.nss, ?reason, "discarding stale range deletion task");
                stale.push(task.id);
            }
        }
    }

    let store = store.clone();
    summary.discarded = run_blocking(move || Ok(store.remove_many(&stale)?)).await?;
    Ok(summary)
}

/// Runs one recovery pass on a background task, as a node does when it
/// becomes primary.
pub fn resubmit_range_deletions_on_step_up(
    store: RangeDeletionStore,
    submitter: RangeDeletionSubmitter,
    refresher: Arc<dyn MetadataRefresher>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match submit_pending_deletions(&store, &submitter, refresher.as_ref()).await {
            Ok(summary) => tracing::info!(
                submitted = summary.submitted,
                already_scheduled = summary.already_scheduled,
                deferred = summary.deferred,
                discarded = summary.discarded,
                "range deletion recovery finished"
            ),
            Err(err) => tracing::warn!(error = %err, "range deletion recovery failed"),
        }
    })
}
