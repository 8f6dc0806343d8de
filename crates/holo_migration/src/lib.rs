//! Chunk migration commit/abort coordination and orphaned range cleanup.
//!
//! When a key range moves from a donor shard to a recipient shard, the side
//! that loses the range is left with orphaned rows. This crate keeps a durable
//! record of every range that must eventually be deleted, and drives the
//! two-sided commit/abort protocol that decides which side's copy goes:
//!
//! 1. `startMigration` durably records the migration and a *pending*
//!    range-deletion task on the donor.
//! 2. On commit the recipient drops its pending task and the donor's task is
//!    marked ready; on abort the donor drops its task and the recipient's task
//!    is marked ready.
//! 3. Ready tasks are handed to the local sharding runtime for physical
//!    cleanup, both at runtime and by the step-up recovery sweep.
//!
//! A pending task is never executed. Everything the crate talks to outside of
//! its own stores (collection catalog, filtering metadata, remote shards) sits
//! behind a trait so a node wires the real implementations in `ShardNode`.

pub mod command_server;
pub mod config;
pub mod coordinator;
pub mod coordinator_store;
pub mod dispatch;
pub mod error;
pub mod node;
pub mod range;
pub mod range_deletion;
pub mod recovery;
pub mod sharding;
pub mod store;
pub mod submitter;
pub mod task;

pub use coordinator::{CoordinatorState, MigrationCoordinator};
pub use error::{ErrorCode, MigrationError, MigrationResult};
pub use node::ShardNode;
pub use range::{ChunkRange, Namespace, ShardId};
pub use task::{CleanWhen, MigrationCoordinatorDocument, RangeDeletionTask};
