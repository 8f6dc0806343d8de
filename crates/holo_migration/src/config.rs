//! Node configuration for the migration core.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::dispatch::{RetryPolicy, StaticShardRegistry};
use crate::range::ShardId;

#[derive(Args, Debug, Clone)]
pub struct MigrationConfig {
    /// Directory holding the node's fjall keyspace.
    #[arg(long, env = "HOLO_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Id of the shard this node serves.
    #[arg(long, env = "HOLO_SHARD_ID")]
    pub shard_id: String,

    /// Address the range-deletion command endpoint listens on.
    #[arg(long, env = "HOLO_LISTEN_COMMANDS", default_value = "127.0.0.1:27019")]
    pub listen_commands: SocketAddr,

    /// Comma-separated list like: `shard-a@127.0.0.1:27019,shard-b@127.0.0.1:27029`
    #[arg(long, env = "HOLO_SHARDS", default_value = "")]
    pub shards: String,

    /// Attempts per remote command before giving up.
    #[arg(long, env = "HOLO_DISPATCH_ATTEMPTS", default_value_t = 3)]
    pub dispatch_attempts: u32,

    /// Delay before the first retry (ms); doubles per attempt.
    #[arg(long, env = "HOLO_DISPATCH_BACKOFF_MS", default_value_t = 100)]
    pub dispatch_backoff_ms: u64,

    /// Per-attempt RPC timeout (ms).
    #[arg(long, env = "HOLO_RPC_TIMEOUT_MS", default_value_t = 10_000)]
    pub rpc_timeout_ms: u64,

    /// How long `Delayed` range cleanups wait before deleting (seconds).
    #[arg(long, env = "HOLO_ORPHAN_CLEANUP_DELAY_SECS", default_value_t = 900)]
    pub orphan_cleanup_delay_secs: u64,
}

impl MigrationConfig {
    pub fn shard_id(&self) -> ShardId {
        ShardId::new(self.shard_id.as_str())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = Duration::from_millis(self.dispatch_backoff_ms);
        RetryPolicy {
            max_attempts: self.dispatch_attempts.max(1),
            backoff,
            max_backoff: backoff.saturating_mul(16),
            attempt_timeout: Duration::from_millis(self.rpc_timeout_ms),
        }
    }

    pub fn orphan_cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.orphan_cleanup_delay_secs)
    }

    pub fn shard_registry(&self) -> anyhow::Result<StaticShardRegistry> {
        StaticShardRegistry::parse(&self.shards)
    }
}
