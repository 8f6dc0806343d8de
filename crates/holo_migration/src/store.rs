//! Durable, id-keyed record collections on top of a fjall partition.
//!
//! Each collection is one partition. Records are JSON-encoded and keyed by
//! the raw 16 bytes of their migration id, so point lookups, inserts and
//! deletes are single-key operations. Scans read a snapshot of the partition
//! and never mutate it while iterating.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use thiserror::Error;
use uuid::Uuid;

use crate::error::MigrationResult;
use crate::task::TaskRecord;

/// Durability required before a write returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConcern {
    /// Applied to the memtable and journal buffer only.
    Local,
    /// Journal synced to disk; the single-node form of majority acknowledgment.
    Majority,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with this id already exists in the collection.
    #[error("duplicate key {id} in {collection}")]
    DuplicateKey { collection: &'static str, id: Uuid },

    #[error("storage error in {collection}: {source}")]
    Storage {
        collection: &'static str,
        #[source]
        source: fjall::Error,
    },

    #[error("corrupt record in {collection}: {source}")]
    Codec {
        collection: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed view over one durable collection.
pub struct PersistentTaskStore<T> {
    keyspace: Arc<Keyspace>,
    partition: PartitionHandle,
    collection: &'static str,
    // Serializes read-modify-write sequences (duplicate check + insert,
    // update) against each other.
    write_lock: Arc<Mutex<()>>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for PersistentTaskStore<T> {
    fn clone(&self) -> Self {
        Self {
            keyspace: self.keyspace.clone(),
            partition: self.partition.clone(),
            collection: self.collection,
            write_lock: self.write_lock.clone(),
            _record: PhantomData,
        }
    }
}

impl<T: TaskRecord> PersistentTaskStore<T> {
    pub fn open(keyspace: Arc<Keyspace>, collection: &'static str) -> StoreResult<Self> {
        let partition = keyspace
            .open_partition(collection, PartitionCreateOptions::default())
            .map_err(|source| StoreError::Storage { collection, source })?;
        Ok(Self {
            keyspace,
            partition,
            collection,
            write_lock: Arc::new(Mutex::new(())),
            _record: PhantomData,
        })
    }

    pub fn collection(&self) -> &'static str {
        self.collection
    }

    /// Inserts `record`, failing with `DuplicateKey` if its id is present.
    pub fn add(&self, record: &T, concern: WriteConcern) -> StoreResult<()> {
        let id = record.id();
        let value = self.encode(record)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let exists = self
            .partition
            .contains_key(id.as_bytes())
            .map_err(|source| self.storage(source))?;
        if exists {
            return Err(StoreError::DuplicateKey {
                collection: self.collection,
                id,
            });
        }
        self.partition
            .insert(id.as_bytes().to_vec(), value)
            .map_err(|source| self.storage(source))?;
        self.wait_for(concern)
    }

    pub fn get(&self, id: Uuid) -> StoreResult<Option<T>> {
        let bytes = self
            .partition
            .get(id.as_bytes())
            .map_err(|source| self.storage(source))?;
        bytes.map(|bytes| self.decode(&bytes)).transpose()
    }

    /// Deletes the record with `id`. Returns whether one existed.
    pub fn remove(&self, id: Uuid, concern: WriteConcern) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let existed = self
            .partition
            .contains_key(id.as_bytes())
            .map_err(|source| self.storage(source))?;
        if existed {
            self.partition
                .remove(id.as_bytes().to_vec())
                .map_err(|source| self.storage(source))?;
            self.wait_for(concern)?;
        }
        Ok(existed)
    }

    /// Deletes every record matching `predicate` in one batch.
    pub fn remove_where<F>(&self, predicate: F, concern: WriteConcern) -> StoreResult<usize>
    where
        F: Fn(&T) -> bool,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Snapshot matching ids first; deleting while iterating the same
        // partition can skip entries.
        let mut doomed = Vec::new();
        for item in self.partition.iter() {
            let (key, value) = item.map_err(|source| self.storage(source))?;
            if predicate(&self.decode(&value)?) {
                doomed.push(key.to_vec());
            }
        }
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut batch = self.keyspace.batch();
        for key in &doomed {
            batch.remove(&self.partition, key.clone());
        }
        batch.commit().map_err(|source| self.storage(source))?;
        self.wait_for(concern)?;
        Ok(doomed.len())
    }

    /// Applies `update` to the record with `id` in place. Never upserts.
    /// Returns whether a record was found.
    pub fn update<F>(&self, id: Uuid, update: F, concern: WriteConcern) -> StoreResult<bool>
    where
        F: FnOnce(&mut T),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut record) = self.get(id)? else {
            return Ok(false);
        };
        update(&mut record);
        let value = self.encode(&record)?;
        self.partition
            .insert(id.as_bytes().to_vec(), value)
            .map_err(|source| self.storage(source))?;
        self.wait_for(concern)?;
        Ok(true)
    }

    /// Visits records matching `filter` until `visitor` returns false.
    pub fn for_each<P, V>(&self, filter: P, mut visitor: V) -> StoreResult<()>
    where
        P: Fn(&T) -> bool,
        V: FnMut(&T) -> bool,
    {
        for item in self.partition.iter() {
            let (_, value) = item.map_err(|source| self.storage(source))?;
            let record = self.decode(&value)?;
            if filter(&record) && !visitor(&record) {
                break;
            }
        }
        Ok(())
    }

    pub fn count<P>(&self, filter: P) -> StoreResult<usize>
    where
        P: Fn(&T) -> bool,
    {
        let mut count = 0usize;
        self.for_each(filter, |_| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    pub fn list(&self) -> StoreResult<Vec<T>>
    where
        T: Clone,
    {
        self.collect_where(|_| true)
    }

    pub fn collect_where<P>(&self, filter: P) -> StoreResult<Vec<T>>
    where
        P: Fn(&T) -> bool,
        T: Clone,
    {
        let mut out = Vec::new();
        self.for_each(filter, |record| {
            out.push(record.clone());
            true
        })?;
        Ok(out)
    }

    fn wait_for(&self, concern: WriteConcern) -> StoreResult<()> {
        match concern {
            WriteConcern::Local => Ok(()),
            WriteConcern::Majority => self
                .keyspace
                .persist(PersistMode::SyncAll)
                .map_err(|source| self.storage(source)),
        }
    }

    fn encode(&self, record: &T) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(record).map_err(|source| StoreError::Codec {
            collection: self.collection,
            source,
        })
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<T> {
        serde_json::from_slice(bytes).map_err(|source| StoreError::Codec {
            collection: self.collection,
            source,
        })
    }

    fn storage(&self, source: fjall::Error) -> StoreError {
        StoreError::Storage {
            collection: self.collection,
            source,
        }
    }
}

/// Opens the fjall keyspace that holds every durable collection of a node.
pub fn open_keyspace(path: impl AsRef<std::path::Path>) -> anyhow::Result<Arc<Keyspace>> {
    use anyhow::Context;

    let path = path.as_ref();
    std::fs::create_dir_all(path).context("create storage dir")?;
    let keyspace = fjall::Config::new(path)
        .open()
        .context("open fjall keyspace")?;
    Ok(Arc::new(keyspace))
}

/// Runs a synchronous store operation on tokio's blocking pool.
pub async fn run_blocking<T, F>(op: F) -> MigrationResult<T>
where
    F: FnOnce() -> MigrationResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op).await?
}
