//! Per-node wiring of the migration stores and collaborators.

use std::sync::Arc;

use anyhow::Context;
use fjall::Keyspace;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::coordinator::MigrationCoordinator;
use crate::coordinator_store::MigrationCoordinatorStore;
use crate::dispatch::{CommandTransport, RecipientDispatcher, ShardRegistry};
use crate::error::MigrationResult;
use crate::range::{ChunkRange, Namespace, ShardId};
use crate::range_deletion::{persist_range_deletion_task_locally, RangeDeletionStore};
use crate::recovery::{self, RecoverySummary};
use crate::sharding::{CollectionShardingRuntime, LocalShardingRuntime, MetadataRefresher};
use crate::store::open_keyspace;
use crate::submitter::RangeDeletionSubmitter;
use crate::task::{CleanWhen, MigrationCoordinatorDocument, MigrationStatusDocument, RangeDeletionTask};

/// Everything one shard needs to take part in migrations, donor or
/// recipient. Built once at startup and shared by reference.
pub struct ShardNode {
    shard_id: ShardId,
    keyspace: Arc<Keyspace>,
    range_deletions: RangeDeletionStore,
    coordinators: MigrationCoordinatorStore,
    runtime: Arc<dyn CollectionShardingRuntime>,
    refresher: Arc<dyn MetadataRefresher>,
    submitter: RangeDeletionSubmitter,
    dispatcher: RecipientDispatcher,
}

impl ShardNode {
    pub fn new(
        shard_id: ShardId,
        keyspace: Arc<Keyspace>,
        runtime: Arc<dyn CollectionShardingRuntime>,
        refresher: Arc<dyn MetadataRefresher>,
        dispatcher: RecipientDispatcher,
    ) -> MigrationResult<Self> {
        let range_deletions = RangeDeletionStore::open(keyspace.clone())?;
        let coordinators = MigrationCoordinatorStore::open(keyspace.clone())?;
        let submitter = RangeDeletionSubmitter::new(range_deletions.clone(), runtime.clone());
        Ok(Self {
            shard_id,
            keyspace,
            range_deletions,
            coordinators,
            runtime,
            refresher,
            submitter,
            dispatcher,
        })
    }

    /// Opens a node backed by the fjall keyspace in `config.data_dir`, using
    /// the local catalog as both sharding runtime and metadata source.
    pub fn open_local(
        config: &MigrationConfig,
        registry: Arc<dyn ShardRegistry>,
        transport: Arc<dyn CommandTransport>,
    ) -> anyhow::Result<(Arc<Self>, Arc<LocalShardingRuntime>)> {
        let keyspace = open_keyspace(&config.data_dir)?;
        let catalog = Arc::new(
            LocalShardingRuntime::open(keyspace.clone(), config.orphan_cleanup_delay())
                .context("open collection catalog")?,
        );
        let dispatcher = RecipientDispatcher::new(registry, transport, config.retry_policy());
        let node = Self::new(
            config.shard_id(),
            keyspace,
            catalog.clone(),
            catalog.clone(),
            dispatcher,
        )
        .context("open migration stores")?;
        Ok((Arc::new(node), catalog))
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }

    pub fn range_deletions(&self) -> &RangeDeletionStore {
        &self.range_deletions
    }

    pub fn coordinators(&self) -> &MigrationCoordinatorStore {
        &self.coordinators
    }

    pub fn runtime(&self) -> &Arc<dyn CollectionShardingRuntime> {
        &self.runtime
    }

    pub fn submitter(&self) -> &RangeDeletionSubmitter {
        &self.submitter
    }

    pub fn dispatcher(&self) -> &RecipientDispatcher {
        &self.dispatcher
    }

    /// Admission check for a new migration of `range`. The caller must hold
    /// the collection's range-ownership lock until intent is recorded.
    pub fn has_overlap(&self, range: &ChunkRange, collection_uuid: Uuid) -> MigrationResult<bool> {
        Ok(self.range_deletions.has_overlap(range, collection_uuid)?)
    }

    /// Coordinator for migrating `range` from this shard to `recipient`.
    pub fn new_migration(
        self: &Arc<Self>,
        migration_id: Uuid,
        recipient: ShardId,
        nss: Namespace,
        collection_uuid: Uuid,
        range: ChunkRange,
    ) -> MigrationCoordinator {
        MigrationCoordinator::new(
            self.clone(),
            migration_id,
            self.shard_id.clone(),
            recipient,
            nss,
            collection_uuid,
            range,
        )
    }

    /// Recipient half of `startMigration`: records a pending task for the
    /// range about to be received, so an abort can clean it up.
    pub fn begin_receiving(
        &self,
        doc: &MigrationCoordinatorDocument,
        when_to_clean: CleanWhen,
    ) -> MigrationResult<()> {
        let task = RangeDeletionTask::pending(
            doc.id,
            doc.nss.clone(),
            doc.collection_uuid,
            doc.donor_shard_id.clone(),
            doc.range.clone(),
            when_to_clean,
        );
        tracing::info!(migration_id = %doc.id, donor = %doc.donor_shard_id, "persisting pending range deletion task on recipient");
        persist_range_deletion_task_locally(&self.range_deletions, &task)
    }

    pub async fn submit_pending_deletions(&self) -> MigrationResult<RecoverySummary> {
        recovery::submit_pending_deletions(
            &self.range_deletions,
            &self.submitter,
            self.refresher.as_ref(),
        )
        .await
    }

    pub fn spawn_step_up_recovery(&self) -> JoinHandle<()> {
        recovery::resubmit_range_deletions_on_step_up(
            self.range_deletions.clone(),
            self.submitter.clone(),
            self.refresher.clone(),
        )
    }

    /// Forgets every range-deletion task of a dropped collection.
    pub fn on_collection_dropped(&self, collection_uuid: Uuid) -> MigrationResult<usize> {
        let removed = self.range_deletions.remove_all_for_collection(collection_uuid)?;
        tracing::info!(%collection_uuid, removed, "removed range deletion tasks for dropped collection");
        Ok(removed)
    }

    /// Status of every recorded migration, from this shard's point of view.
    pub fn migration_statuses(&self) -> MigrationResult<Vec<MigrationStatusDocument>> {
        Ok(self
            .coordinators
            .list()?
            .iter()
            .map(|doc| doc.status_document(doc.donor_shard_id == self.shard_id))
            .collect())
    }

    /// Serves remote range-deletion commands on `listener` in the background.
    pub fn serve_commands(&self, listener: TcpListener) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(crate::command_server::serve(
            listener,
            self.range_deletions.clone(),
        ))
    }
}
