//! Shared helpers for integration tests.
//!
//! A `Cluster` is a donor (`shard-a`) and a recipient (`shard-b`), each with
//! its own fjall keyspace, wired either through an in-process transport or
//! through the real TCP command server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use holo_migration::command_server::{apply_remote_command, TcpCommandTransport};
use holo_migration::config::MigrationConfig;
use holo_migration::dispatch::{CommandResponse, CommandTransport, RemoteCommand, StaticShardRegistry};
use holo_migration::range_deletion::RangeDeletionStore;
use holo_migration::sharding::LocalShardingRuntime;
use holo_migration::{ChunkRange, CleanWhen, MigrationCoordinator, Namespace, ShardId, ShardNode};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// `Delayed` cleanups never fire within a test.
pub const ORPHAN_DELAY: Duration = Duration::from_secs(3600);

pub const DONOR: &str = "shard-a";
pub const RECIPIENT: &str = "shard-b";

/// Build a per-test data directory under the system temp dir.
pub fn test_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let pid = std::process::id();
    std::env::temp_dir()
        .join("holo_migration_tests")
        .join(format!("{name}-{pid}-{ts}"))
}

/// Best-effort cleanup of a test directory.
pub fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

pub fn range(min: &str, max: &str) -> ChunkRange {
    ChunkRange::new(min.as_bytes(), max.as_bytes()).expect("range")
}

/// Delivers commands straight to the target node's store. Can be told to
/// fail the next N sends at the transport level.
#[derive(Default)]
pub struct LoopbackTransport {
    stores: Mutex<HashMap<SocketAddr, RangeDeletionStore>>,
    fail_next: AtomicU32,
    sent: Mutex<Vec<RemoteCommand>>,
}

impl LoopbackTransport {
    pub fn attach(&self, addr: SocketAddr, store: RangeDeletionStore) {
        self.stores.lock().unwrap().insert(addr, store);
    }

    pub fn fail_next(&self, sends: u32) {
        self.fail_next.store(sends, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<RemoteCommand> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandTransport for LoopbackTransport {
    async fn send(&self, addr: SocketAddr, cmd: &RemoteCommand) -> anyhow::Result<CommandResponse> {
        self.sent.lock().unwrap().push(cmd.clone());
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            anyhow::bail!("injected transport failure to {addr}");
        }
        let store = self
            .stores
            .lock()
            .unwrap()
            .get(&addr)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("connection refused: {addr}"))?;
        Ok(apply_remote_command(&store, cmd))
    }
}

pub struct TestShard {
    pub node: Arc<ShardNode>,
    pub catalog: Arc<LocalShardingRuntime>,
    pub addr: SocketAddr,
}

pub struct Cluster {
    pub dir: PathBuf,
    pub donor: TestShard,
    pub recipient: TestShard,
    pub loopback: Option<Arc<LoopbackTransport>>,
    servers: Vec<JoinHandle<anyhow::Result<()>>>,
}

fn config(dir: &Path, shard: &str, listen: SocketAddr, shards: &str) -> MigrationConfig {
    MigrationConfig {
        data_dir: dir.join(shard),
        shard_id: shard.to_string(),
        listen_commands: listen,
        shards: shards.to_string(),
        dispatch_attempts: 3,
        dispatch_backoff_ms: 1,
        rpc_timeout_ms: 2_000,
        orphan_cleanup_delay_secs: ORPHAN_DELAY.as_secs(),
    }
}

fn open_shard(
    dir: &Path,
    shard: &str,
    addr: SocketAddr,
    shards: &str,
    transport: Arc<dyn CommandTransport>,
) -> TestShard {
    let config = config(dir, shard, addr, shards);
    let registry = Arc::new(config.shard_registry().expect("registry"));
    let (node, catalog) = ShardNode::open_local(&config, registry, transport).expect("open node");
    TestShard {
        node,
        catalog,
        addr,
    }
}

impl Cluster {
    /// Two nodes talking through `LoopbackTransport`.
    pub fn loopback(name: &str) -> Self {
        let dir = test_dir(name);
        let donor_addr: SocketAddr = "127.0.0.1:1".parse().expect("addr");
        let recipient_addr: SocketAddr = "127.0.0.1:2".parse().expect("addr");
        let shards = format!("{DONOR}@{donor_addr},{RECIPIENT}@{recipient_addr}");
        let transport = Arc::new(LoopbackTransport::default());

        let donor = open_shard(&dir, DONOR, donor_addr, &shards, transport.clone());
        let recipient = open_shard(&dir, RECIPIENT, recipient_addr, &shards, transport.clone());
        transport.attach(donor_addr, donor.node.range_deletions().clone());
        transport.attach(recipient_addr, recipient.node.range_deletions().clone());

        Self {
            dir,
            donor,
            recipient,
            loopback: Some(transport),
            servers: Vec::new(),
        }
    }

    /// Two nodes talking through the TCP command server.
    pub async fn tcp(name: &str) -> Self {
        let dir = test_dir(name);
        let donor_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let recipient_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let donor_addr = donor_listener.local_addr().expect("addr");
        let recipient_addr = recipient_listener.local_addr().expect("addr");
        let shards = format!("{DONOR}@{donor_addr},{RECIPIENT}@{recipient_addr}");
        let transport = Arc::new(TcpCommandTransport::new(Duration::from_secs(2)));

        let donor = open_shard(&dir, DONOR, donor_addr, &shards, transport.clone());
        let recipient = open_shard(&dir, RECIPIENT, recipient_addr, &shards, transport);
        let servers = vec![
            donor.node.serve_commands(donor_listener),
            recipient.node.serve_commands(recipient_listener),
        ];

        Self {
            dir,
            donor,
            recipient,
            loopback: None,
            servers,
        }
    }

    /// Registers the same collection on both shards with known metadata.
    pub fn register_collection(&self, nss: &Namespace) -> Uuid {
        let uuid = Uuid::new_v4();
        for shard in [&self.donor, &self.recipient] {
            shard.catalog.register_collection(nss, uuid).expect("register");
            shard.catalog.set_metadata_known(nss, true);
        }
        uuid
    }

    /// Writes one row per key into `shard`'s copy of the collection.
    pub fn fill(&self, shard: &TestShard, uuid: Uuid, keys: impl IntoIterator<Item = String>) {
        let data = shard.catalog.data_partition(uuid).expect("data partition");
        for key in keys {
            data.insert(key.into_bytes(), b"row".to_vec()).expect("insert row");
        }
    }

    /// Starts a migration on both sides the way the migration driver would:
    /// donor intent first, then the recipient's pending task.
    pub fn start_migration(
        &self,
        nss: &Namespace,
        uuid: Uuid,
        range: ChunkRange,
        wait_for_delete: bool,
    ) -> MigrationCoordinator {
        let mut coordinator = self.donor.node.new_migration(
            Uuid::new_v4(),
            ShardId::new(RECIPIENT),
            nss.clone(),
            uuid,
            range,
        );
        coordinator.start_migration(wait_for_delete).expect("start migration");
        self.recipient
            .node
            .begin_receiving(coordinator.document(), CleanWhen::Now)
            .expect("recipient intent");
        coordinator
    }

    pub fn shutdown(self) {
        for server in &self.servers {
            server.abort();
        }
        let dir = self.dir.clone();
        drop(self);
        cleanup_dir(&dir);
    }
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
