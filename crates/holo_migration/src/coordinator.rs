//! Donor-side commit/abort protocol for one migration attempt.
//!
//! `start_migration` durably records the coordinator document and a pending
//! range-deletion task before any data moves. The outcome then flips exactly
//! one side's task to ready:
//!
//! - commit: the recipient drops its task, the donor's task becomes ready.
//! - abort: the donor drops its task, the recipient's task becomes ready.
//!
//! In both cases the losing side's task is only touched after the winning
//! side's copy is confirmed, so a crash anywhere leaves either a pending task
//! (undecided, never executed) or a ready one (decided, safe to delete).

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::coordinator_store::persist_migration_coordinator_locally;
use crate::dispatch::RemoteCommand;
use crate::error::{MigrationError, MigrationResult};
use crate::node::ShardNode;
use crate::range::{ChunkRange, Namespace, ShardId};
use crate::range_deletion::persist_range_deletion_task_locally;
use crate::store::run_blocking;
use crate::submitter::SubmitOutcome;
use crate::task::{CleanWhen, MigrationCoordinatorDocument, RangeDeletionTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Created,
    /// Intent is durable; commit or abort must follow.
    Started,
    Committed,
    Aborted,
}

impl CoordinatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            CoordinatorState::Created => "created",
            CoordinatorState::Started => "started",
            CoordinatorState::Committed => "committed",
            CoordinatorState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CoordinatorState::Committed | CoordinatorState::Aborted)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Commit,
    Abort,
}

impl Decision {
    fn as_str(self) -> &'static str {
        match self {
            Decision::Commit => "commit",
            Decision::Abort => "abort",
        }
    }
}

/// Drives one migration attempt through `Created -> Started ->
/// {Committed | Aborted}`.
///
/// Once started, the coordinator must be resolved by a successful commit or
/// abort, or handed off with [`MigrationCoordinator::release_unresolved`].
/// Dropping a started, unresolved coordinator panics.
pub struct MigrationCoordinator {
    node: Arc<ShardNode>,
    doc: MigrationCoordinatorDocument,
    state: CoordinatorState,
    decision: Option<Decision>,
    wait_for_delete: bool,
    released: bool,
}

impl MigrationCoordinator {
    pub fn new(
        node: Arc<ShardNode>,
        migration_id: Uuid,
        donor_shard_id: ShardId,
        recipient_shard_id: ShardId,
        nss: Namespace,
        collection_uuid: Uuid,
        range: ChunkRange,
    ) -> Self {
        Self {
            node,
            doc: MigrationCoordinatorDocument {
                id: migration_id,
                nss,
                collection_uuid,
                donor_shard_id,
                recipient_shard_id,
                range,
            },
            state: CoordinatorState::Created,
            decision: None,
            wait_for_delete: false,
            released: false,
        }
    }

    pub fn migration_id(&self) -> Uuid {
        self.doc.id
    }

    pub fn document(&self) -> &MigrationCoordinatorDocument {
        &self.doc
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Records the migration and the donor's pending range-deletion task,
    /// both with majority durability.
    ///
    /// With `wait_for_delete`, a later commit waits for the donor's orphaned
    /// range to be deleted and the deletion is not delayed.
    ///
    /// Each coordinator starts once: calling this again on the same instance
    /// returns [`MigrationError::InvalidState`]. [`MigrationError::DuplicateMigration`]
    /// is reported only when a different coordinator already recorded this
    /// migration id.
    pub fn start_migration(&mut self, wait_for_delete: bool) -> MigrationResult<()> {
        if self.state != CoordinatorState::Created {
            return Err(self.invalid_state("start migration"));
        }
        self.doc.range.validate()?;

        tracing::info!(
            migration_id = %self.doc.id,
            nss = %self.doc.nss,
            range = %self.doc.range,
            donor = %self.doc.donor_shard_id,
            recipient = %self.doc.recipient_shard_id,
            "persisting migration coordinator document"
        );
        persist_migration_coordinator_locally(self.node.coordinators(), &self.doc)?;

        let when_to_clean = if wait_for_delete {
            CleanWhen::Now
        } else {
            CleanWhen::Delayed
        };
        let task = RangeDeletionTask::pending(
            self.doc.id,
            self.doc.nss.clone(),
            self.doc.collection_uuid,
            self.doc.donor_shard_id.clone(),
            self.doc.range.clone(),
            when_to_clean,
        );
        tracing::info!(migration_id = %self.doc.id, "persisting pending range deletion task on donor");
        persist_range_deletion_task_locally(self.node.range_deletions(), &task)?;

        self.wait_for_delete = wait_for_delete;
        self.state = CoordinatorState::Started;
        Ok(())
    }

    /// The recipient now owns the range: drop the recipient's task, then make
    /// the donor's task ready and submit it.
    ///
    /// Safe to call again after a failure; both steps are idempotent. With
    /// `wait_for_delete`, a repeated call after a failed deletion resubmits
    /// the donor's task and waits again.
    pub async fn commit_migration_on_donor_and_recipient(&mut self) -> MigrationResult<()> {
        self.decide(Decision::Commit)?;
        if self.state == CoordinatorState::Committed {
            if self.wait_for_delete {
                return self.submit_donor_deletion().await;
            }
            return Ok(());
        }

        tracing::info!(migration_id = %self.doc.id, recipient = %self.doc.recipient_shard_id, "deleting range deletion task on recipient");
        self.node
            .dispatcher()
            .send_to_recipient(
                &self.doc.recipient_shard_id,
                &RemoteCommand::DeleteRangeDeletionTask {
                    migration_id: self.doc.id,
                },
            )
            .await?;

        tracing::info!(migration_id = %self.doc.id, "marking range deletion task on donor as ready for processing");
        let store = self.node.range_deletions().clone();
        let id = self.doc.id;
        if !run_blocking(move || Ok(store.clear_pending(id)?)).await? {
            tracing::warn!(migration_id = %self.doc.id, "donor range deletion task not found");
        }
        self.state = CoordinatorState::Committed;

        self.submit_donor_deletion().await
    }

    /// The donor keeps the range: drop the donor's task, then make the
    /// recipient's task ready.
    ///
    /// Safe to call again after a failure; both steps are idempotent.
    pub async fn abort_migration_on_donor_and_recipient(&mut self) -> MigrationResult<()> {
        self.decide(Decision::Abort)?;
        if self.state == CoordinatorState::Aborted {
            return Ok(());
        }

        tracing::info!(migration_id = %self.doc.id, "deleting range deletion task on donor");
        let store = self.node.range_deletions().clone();
        let id = self.doc.id;
        run_blocking(move || Ok(store.remove(id)?)).await?;

        tracing::info!(migration_id = %self.doc.id, recipient = %self.doc.recipient_shard_id, "marking range deletion task on recipient as ready for processing");
        self.node
            .dispatcher()
            .send_to_recipient(
                &self.doc.recipient_shard_id,
                &RemoteCommand::MarkRangeDeletionTaskReady {
                    migration_id: self.doc.id,
                },
            )
            .await?;

        self.state = CoordinatorState::Aborted;
        Ok(())
    }

    /// Gives up on resolving this attempt in-process and returns its document
    /// to whoever will re-drive the decision later.
    pub fn release_unresolved(mut self) -> MigrationCoordinatorDocument {
        if self.state == CoordinatorState::Started {
            tracing::warn!(
                migration_id = %self.doc.id,
                decision = self.decision.map(Decision::as_str),
                "releasing unresolved migration"
            );
        }
        self.released = true;
        self.doc.clone()
    }

    fn decide(&mut self, decision: Decision) -> MigrationResult<()> {
        if self.state == CoordinatorState::Created {
            return Err(self.invalid_state(decision.as_str()));
        }
        match self.decision {
            Some(decided) if decided != decision => Err(MigrationError::ConflictingDecision {
                migration_id: self.doc.id,
                decided: decided.as_str(),
                operation: decision.as_str(),
            }),
            _ => {
                self.decision = Some(decision);
                Ok(())
            }
        }
    }

    async fn submit_donor_deletion(&self) -> MigrationResult<()> {
        let node = self.node.clone();
        let id = self.doc.id;
        let outcome = run_blocking(move || match node.range_deletions().get(id)? {
            Some(task) => Ok(Some(node.submitter().submit(&task))),
            None => Ok(None),
        })
        .await?;
        let Some(outcome) = outcome else {
            return Ok(());
        };
        match outcome {
            SubmitOutcome::Scheduled(notification) if self.wait_for_delete => {
                tracing::info!(migration_id = %self.doc.id, "waiting for cleanup of orphaned range");
                if let Err(reason) = notification.wait().await {
                    return Err(MigrationError::RangeDeletionFailed {
                        migration_id: self.doc.id,
                        reason,
                    });
                }
            }
            SubmitOutcome::Scheduled(notification) => notification.abandon(),
            SubmitOutcome::AlreadyScheduled
            | SubmitOutcome::MetadataUnknown
            | SubmitOutcome::Pending => {}
            SubmitOutcome::Stale(reason) => {
                tracing::warn!(migration_id = %id, ?reason, "discarding stale range deletion task");
                let store = self.node.range_deletions().clone();
                run_blocking(move || Ok(store.remove(id)?)).await?;
            }
        }
        Ok(())
    }

    fn invalid_state(&self, operation: &'static str) -> MigrationError {
        MigrationError::InvalidState {
            migration_id: self.doc.id,
            state: self.state.as_str(),
            operation,
        }
    }
}

impl fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationCoordinator")
            .field("doc", &self.doc)
            .field("state", &self.state)
            .field("decision", &self.decision)
            .field("wait_for_delete", &self.wait_for_delete)
            .finish()
    }
}

impl Drop for MigrationCoordinator {
    fn drop(&mut self) {
        if self.state != CoordinatorState::Started || self.released || std::thread::panicking() {
            return;
        }
        tracing::error!(
            migration_id = %self.doc.id,
            "migration coordinator dropped without commit or abort"
        );
        panic!(
            "migration {} was started but neither committed nor aborted",
            self.doc.id
        );
    }
}
