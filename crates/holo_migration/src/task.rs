//! Persisted record types for range deletion and migration coordination.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::range::{ChunkRange, Namespace, ShardId};

/// Record stored in a durable task collection, keyed by its migration id.
pub trait TaskRecord: Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static {
    fn id(&self) -> Uuid;
}

/// When a ready range may be physically deleted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanWhen {
    #[default]
    Now,
    /// Wait out the orphan cleanup delay first so in-flight readers that
    /// still route to the old owner can finish.
    Delayed,
}

/// Pending deletion of `range` in the collection identified by
/// `collection_uuid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDeletionTask {
    /// Id of the migration that produced this task.
    pub id: Uuid,
    pub nss: Namespace,
    pub collection_uuid: Uuid,
    pub donor_shard_id: ShardId,
    pub range: ChunkRange,
    /// Persisted only while set; an absent field reads back as ready.
    #[serde(default, skip_serializing_if = "is_false")]
    pub pending: bool,
    #[serde(default)]
    pub when_to_clean: CleanWhen,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl RangeDeletionTask {
    /// A task that must not run until the migration outcome is known.
    pub fn pending(
        id: Uuid,
        nss: Namespace,
        collection_uuid: Uuid,
        donor_shard_id: ShardId,
        range: ChunkRange,
        when_to_clean: CleanWhen,
    ) -> Self {
        Self {
            id,
            nss,
            collection_uuid,
            donor_shard_id,
            range,
            pending: true,
            when_to_clean,
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.pending
    }
}

impl TaskRecord for RangeDeletionTask {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// Identity and donor/recipient linkage of one in-flight migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCoordinatorDocument {
    pub id: Uuid,
    pub nss: Namespace,
    pub collection_uuid: Uuid,
    pub donor_shard_id: ShardId,
    pub recipient_shard_id: ShardId,
    pub range: ChunkRange,
}

impl MigrationCoordinatorDocument {
    /// Reporting view of this migration from one side's perspective.
    pub fn status_document(&self, is_donor_shard: bool) -> MigrationStatusDocument {
        MigrationStatusDocument {
            source: self.donor_shard_id.clone(),
            destination: self.recipient_shard_id.clone(),
            is_donor_shard,
            chunk: self.range.clone(),
            collection: self.nss.clone(),
        }
    }
}

impl TaskRecord for MigrationCoordinatorDocument {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// Operator-facing summary of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatusDocument {
    pub source: ShardId,
    pub destination: ShardId,
    pub is_donor_shard: bool,
    pub chunk: ChunkRange,
    pub collection: Namespace,
}
