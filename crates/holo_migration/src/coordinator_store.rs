//! Durable migration coordinator documents.

use std::sync::Arc;

use fjall::Keyspace;
use uuid::Uuid;

use crate::error::{MigrationError, MigrationResult};
use crate::store::{PersistentTaskStore, StoreError, StoreResult, WriteConcern};
use crate::task::MigrationCoordinatorDocument;

pub const MIGRATION_COORDINATORS_COLLECTION: &str = "config_migration_coordinators";

#[derive(Clone)]
pub struct MigrationCoordinatorStore {
    docs: PersistentTaskStore<MigrationCoordinatorDocument>,
}

impl MigrationCoordinatorStore {
    pub fn open(keyspace: Arc<Keyspace>) -> StoreResult<Self> {
        Ok(Self {
            docs: PersistentTaskStore::open(keyspace, MIGRATION_COORDINATORS_COLLECTION)?,
        })
    }

    pub fn add(&self, doc: &MigrationCoordinatorDocument) -> StoreResult<()> {
        self.docs.add(doc, WriteConcern::Majority)
    }

    pub fn get(&self, id: Uuid) -> StoreResult<Option<MigrationCoordinatorDocument>> {
        self.docs.get(id)
    }

    pub fn remove(&self, id: Uuid) -> StoreResult<bool> {
        self.docs.remove(id, WriteConcern::Majority)
    }

    pub fn list(&self) -> StoreResult<Vec<MigrationCoordinatorDocument>> {
        self.docs.list()
    }
}

/// Records `doc`, reporting a duplicate migration id as `DuplicateMigration`.
pub fn persist_migration_coordinator_locally(
    store: &MigrationCoordinatorStore,
    doc: &MigrationCoordinatorDocument,
) -> MigrationResult<()> {
    match store.add(doc) {
        Ok(()) => Ok(()),
        Err(StoreError::DuplicateKey { .. }) => Err(MigrationError::DuplicateMigration {
            migration_id: doc.id,
            document: serde_json::to_string(doc).unwrap_or_else(|_| format!("{doc:?}")),
        }),
        Err(err) => Err(err.into()),
    }
}
