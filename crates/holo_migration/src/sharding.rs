//! Collection catalog, filtering metadata and range cleanup scheduling.
//!
//! `CollectionShardingRuntime` is what the submitter needs from the node: a
//! consistent read of a collection's identity and whether its filtering
//! metadata is known, plus a way to schedule deletion of a range. The local
//! implementation keeps the catalog in a fjall partition and deletes rows from
//! the collection's own partition on a background task.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::range::{ChunkRange, Namespace};
use crate::task::CleanWhen;

/// Partition mapping namespace -> collection uuid.
pub const CATALOG_COLLECTION: &str = "catalog_collections";

/// Outcome of a physical range deletion: rows removed, or why it failed.
pub type CleanupStatus = Result<u64, String>;

/// Point-in-time view of a collection taken under one catalog read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSnapshot {
    pub uuid: Uuid,
    pub metadata_known: bool,
}

pub trait CollectionShardingRuntime: Send + Sync + 'static {
    /// Returns `None` if no collection exists under `nss`.
    fn lookup(&self, nss: &Namespace) -> Option<CollectionSnapshot>;

    /// Schedules deletion of `range`. Returns without waiting for it.
    fn clean_up_range(
        &self,
        nss: &Namespace,
        range: &ChunkRange,
        when: CleanWhen,
    ) -> CleanupNotification;
}

/// Reloads a collection's filtering metadata from the authoritative source.
#[async_trait]
pub trait MetadataRefresher: Send + Sync + 'static {
    async fn refresh(&self, nss: &Namespace) -> anyhow::Result<()>;
}

/// Completion handle for a scheduled range cleanup.
///
/// Dropping or abandoning the notification does not cancel the cleanup.
#[derive(Debug)]
pub struct CleanupNotification {
    rx: Option<oneshot::Receiver<CleanupStatus>>,
    status: Option<CleanupStatus>,
}

/// Producer side of a `CleanupNotification`.
#[derive(Debug)]
pub struct CleanupCompletion {
    tx: oneshot::Sender<CleanupStatus>,
}

impl CleanupCompletion {
    pub fn complete(self, status: CleanupStatus) {
        // The waiter may have abandoned the notification.
        let _ = self.tx.send(status);
    }
}

impl CleanupNotification {
    pub fn channel() -> (CleanupCompletion, CleanupNotification) {
        let (tx, rx) = oneshot::channel();
        (
            CleanupCompletion { tx },
            CleanupNotification {
                rx: Some(rx),
                status: None,
            },
        )
    }

    /// A notification that has already resolved.
    pub fn resolved(status: CleanupStatus) -> Self {
        Self {
            rx: None,
            status: Some(status),
        }
    }

    /// Non-blocking poll; `None` while the cleanup is still running.
    pub fn try_status(&mut self) -> Option<&CleanupStatus> {
        if self.status.is_none() {
            if let Some(rx) = self.rx.as_mut() {
                match rx.try_recv() {
                    Ok(status) => {
                        self.status = Some(status);
                        self.rx = None;
                    }
                    Err(oneshot::error::TryRecvError::Empty) => {}
                    Err(oneshot::error::TryRecvError::Closed) => {
                        self.status = Some(Err("range cleanup dropped before completing".into()));
                        self.rx = None;
                    }
                }
            }
        }
        self.status.as_ref()
    }

    pub fn is_ready(&mut self) -> bool {
        self.try_status().is_some()
    }

    pub async fn wait(mut self) -> CleanupStatus {
        if let Some(status) = self.status.take() {
            return status;
        }
        match self.rx.take() {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err("range cleanup dropped before completing".into())),
            None => Err("range cleanup notification already consumed".into()),
        }
    }

    /// Stops tracking the cleanup; it keeps running in the background.
    pub fn abandon(self) {}
}

#[derive(Debug, Clone, Copy)]
struct CollectionEntry {
    uuid: Uuid,
    metadata_known: bool,
}

/// fjall-backed catalog and range cleaner for one node.
pub struct LocalShardingRuntime {
    keyspace: Arc<Keyspace>,
    catalog: PartitionHandle,
    collections: RwLock<HashMap<Namespace, CollectionEntry>>,
    orphan_cleanup_delay: Duration,
}

impl LocalShardingRuntime {
    /// Loads the persisted catalog. Filtering metadata starts unknown for
    /// every collection until it is refreshed.
    pub fn open(keyspace: Arc<Keyspace>, orphan_cleanup_delay: Duration) -> anyhow::Result<Self> {
        let catalog =
            keyspace.open_partition(CATALOG_COLLECTION, PartitionCreateOptions::default())?;
        let mut collections = HashMap::new();
        for item in catalog.iter() {
            let (key, value) = item?;
            let nss = Namespace::new(String::from_utf8(key.to_vec())?);
            let uuid = Uuid::from_slice(&value)?;
            collections.insert(
                nss,
                CollectionEntry {
                    uuid,
                    metadata_known: false,
                },
            );
        }
        Ok(Self {
            keyspace,
            catalog,
            collections: RwLock::new(collections),
            orphan_cleanup_delay,
        })
    }

    /// Creates or replaces the collection registered under `nss`.
    pub fn register_collection(&self, nss: &Namespace, uuid: Uuid) -> anyhow::Result<()> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        self.catalog
            .insert(nss.as_str().as_bytes().to_vec(), uuid.as_bytes().to_vec())?;
        collections.insert(
            nss.clone(),
            CollectionEntry {
                uuid,
                metadata_known: false,
            },
        );
        Ok(())
    }

    /// Forgets the collection and deletes all of its rows.
    pub fn drop_collection(&self, nss: &Namespace) -> anyhow::Result<Option<Uuid>> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = collections.remove(nss) else {
            return Ok(None);
        };
        self.catalog.remove(nss.as_str().as_bytes().to_vec())?;
        let data = self.data_partition(entry.uuid)?;
        self.keyspace.delete_partition(data)?;
        Ok(Some(entry.uuid))
    }

    pub fn set_metadata_known(&self, nss: &Namespace, known: bool) {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = collections.get_mut(nss) {
            entry.metadata_known = known;
        }
    }

    /// Partition holding the rows of the collection with `uuid`.
    pub fn data_partition(&self, uuid: Uuid) -> fjall::Result<PartitionHandle> {
        self.keyspace.open_partition(
            &format!("coll_{}", uuid.simple()),
            PartitionCreateOptions::default(),
        )
    }

    pub fn count_rows(&self, uuid: Uuid, range: &ChunkRange) -> fjall::Result<u64> {
        let data = self.data_partition(uuid)?;
        let mut rows = 0u64;
        for item in range_iter(&data, range) {
            item?;
            rows += 1;
        }
        Ok(rows)
    }
}

impl CollectionShardingRuntime for LocalShardingRuntime {
    fn lookup(&self, nss: &Namespace) -> Option<CollectionSnapshot> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        collections.get(nss).map(|entry| CollectionSnapshot {
            uuid: entry.uuid,
            metadata_known: entry.metadata_known,
        })
    }

    fn clean_up_range(
        &self,
        nss: &Namespace,
        range: &ChunkRange,
        when: CleanWhen,
    ) -> CleanupNotification {
        let Some(snapshot) = self.lookup(nss) else {
            return CleanupNotification::resolved(Err(format!("namespace {nss} not found")));
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return CleanupNotification::resolved(Err(
                "range cleanup requires a tokio runtime".into()
            ));
        };
        let data = match self.data_partition(snapshot.uuid) {
            Ok(data) => data,
            Err(err) => return CleanupNotification::resolved(Err(err.to_string())),
        };

        let (completion, notification) = CleanupNotification::channel();
        let keyspace = self.keyspace.clone();
        let range = range.clone();
        let nss = nss.clone();
        let delay = match when {
            CleanWhen::Now => Duration::ZERO,
            CleanWhen::Delayed => self.orphan_cleanup_delay,
        };
        runtime.spawn(async move {
            if !delay.is_zero() {
                tracing::debug!(%nss, %range, delay_ms = delay.as_millis() as u64, "delaying range cleanup");
                tokio::time::sleep(delay).await;
            }
            let status = match tokio::task::spawn_blocking(move || {
                delete_range(&keyspace, &data, &range)
            })
            .await
            {
                Ok(Ok(rows)) => Ok(rows),
                Ok(Err(err)) => Err(err.to_string()),
                Err(err) => Err(format!("range cleanup task failed: {err}")),
            };
            match &status {
                Ok(rows) => tracing::info!(%nss, rows, "deleted orphaned range"),
                Err(err) => tracing::warn!(%nss, error = %err, "range cleanup failed"),
            }
            completion.complete(status);
        });
        notification
    }
}

#[async_trait]
impl MetadataRefresher for LocalShardingRuntime {
    /// The local catalog is authoritative for this node; a refresh marks the
    /// collection's metadata as known. A missing collection refreshes to
    /// "nothing to filter", which is not an error.
    async fn refresh(&self, nss: &Namespace) -> anyhow::Result<()> {
        self.set_metadata_known(nss, true);
        Ok(())
    }
}

fn range_iter(
    data: &PartitionHandle,
    range: &ChunkRange,
) -> Box<dyn DoubleEndedIterator<Item = fjall::Result<fjall::KvPair>>> {
    let start = range.min.clone();
    if range.is_unbounded() {
        Box::new(data.range(start..))
    } else {
        Box::new(data.range(start..range.max.clone()))
    }
}

/// Deletes every row in `range`, committing in bounded batches.
fn delete_range(
    keyspace: &Keyspace,
    data: &PartitionHandle,
    range: &ChunkRange,
) -> fjall::Result<u64> {
    const CHUNK_ITEMS: usize = 10_000;

    // Snapshot keys before deleting; removing from a partition while
    // iterating it can skip entries.
    let mut keys = Vec::new();
    for item in range_iter(data, range) {
        let (key, _) = item?;
        keys.push(key.to_vec());
    }

    let deleted = keys.len() as u64;
    for chunk in keys.chunks(CHUNK_ITEMS) {
        let mut batch = keyspace.batch();
        for key in chunk {
            batch.remove(data, key.clone());
        }
        batch.commit()?;
    }
    Ok(deleted)
}
