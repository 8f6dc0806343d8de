//! Idempotent, fixed-retry commands sent from the donor to the recipient.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, MigrationError, MigrationResult};
use crate::range::ShardId;

/// Single-document, id-keyed mutations of a recipient's range-deletion tasks.
/// Both are safe to apply more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RemoteCommand {
    DeleteRangeDeletionTask { migration_id: Uuid },
    MarkRangeDeletionTaskReady { migration_id: Uuid },
}

impl RemoteCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteCommand::DeleteRangeDeletionTask { .. } => "delete_range_deletion_task",
            RemoteCommand::MarkRangeDeletionTaskReady { .. } => "mark_range_deletion_task_ready",
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteCommand::DeleteRangeDeletionTask { migration_id }
            | RemoteCommand::MarkRangeDeletionTaskReady { migration_id } => {
                write!(f, "{}({migration_id})", self.name())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResponse {
    /// `n` is the number of documents the command matched.
    Ok { n: u64 },
    Error { code: ErrorCode, message: String },
}

impl CommandResponse {
    pub fn from_error(err: &MigrationError) -> Self {
        CommandResponse::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Resolves a shard id to the address of its command endpoint.
pub trait ShardRegistry: Send + Sync + 'static {
    fn resolve(&self, shard_id: &ShardId) -> Option<SocketAddr>;
}

/// In-memory shard registry, seeded from `shardA@host:port,shardB@host:port`.
#[derive(Debug, Default)]
pub struct StaticShardRegistry {
    shards: RwLock<HashMap<ShardId, SocketAddr>>,
}

impl StaticShardRegistry {
    pub fn parse(members: &str) -> anyhow::Result<Self> {
        let registry = Self::default();
        for entry in members.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (shard, addr) = entry
                .split_once('@')
                .with_context(|| format!("invalid shard entry (expected shard@host:port): {entry}"))?;
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid address for shard {shard}: {addr}"))?;
            registry.upsert(ShardId::new(shard), addr);
        }
        Ok(registry)
    }

    pub fn upsert(&self, shard_id: ShardId, addr: SocketAddr) {
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(shard_id, addr);
    }

    pub fn remove(&self, shard_id: &ShardId) -> Option<SocketAddr> {
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(shard_id)
    }
}

impl ShardRegistry for StaticShardRegistry {
    fn resolve(&self, shard_id: &ShardId) -> Option<SocketAddr> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(shard_id)
            .copied()
    }
}

/// Delivers one command to one node. Transport-level failures are errors;
/// command-level failures come back as `CommandResponse::Error`.
#[async_trait]
pub trait CommandTransport: Send + Sync + 'static {
    async fn send(&self, addr: SocketAddr, cmd: &RemoteCommand) -> anyhow::Result<CommandResponse>;
}

/// Fixed-attempt retry schedule for idempotent commands.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt up to `max_backoff`.
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn delay_before(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(2).min(16);
        self.backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

#[derive(Clone)]
pub struct RecipientDispatcher {
    registry: Arc<dyn ShardRegistry>,
    transport: Arc<dyn CommandTransport>,
    policy: RetryPolicy,
}

impl RecipientDispatcher {
    pub fn new(
        registry: Arc<dyn ShardRegistry>,
        transport: Arc<dyn CommandTransport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            transport,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Sends `cmd` to `recipient`, retrying transport failures and retriable
    /// error codes. Returns the matched document count on success.
    pub async fn send_to_recipient(
        &self,
        recipient: &ShardId,
        cmd: &RemoteCommand,
    ) -> MigrationResult<u64> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.delay_before(attempt)).await;
            }
            // Re-resolve every attempt; the recipient may have moved.
            let addr = self
                .registry
                .resolve(recipient)
                .ok_or_else(|| MigrationError::ShardNotFound(recipient.clone()))?;

            tracing::debug!(shard = %recipient, %addr, command = %cmd, attempt, "sending request to recipient");

            let sent =
                tokio::time::timeout(self.policy.attempt_timeout, self.transport.send(addr, cmd))
                    .await;
            match sent {
                Ok(Ok(CommandResponse::Ok { n })) => return Ok(n),
                Ok(Ok(CommandResponse::Error { code, message })) => {
                    last_failure = format!("{code:?}: {message}");
                    if !code.is_retriable() {
                        return Err(self.failure(recipient, cmd, attempt, last_failure));
                    }
                }
                Ok(Err(err)) => last_failure = format!("{err:#}"),
                Err(_) => {
                    last_failure = format!(
                        "timed out after {}ms",
                        self.policy.attempt_timeout.as_millis()
                    )
                }
            }
            tracing::warn!(
                shard = %recipient,
                command = %cmd,
                attempt,
                max_attempts,
                error = %last_failure,
                "recipient command attempt failed"
            );
        }

        Err(self.failure(recipient, cmd, max_attempts, last_failure))
    }

    fn failure(
        &self,
        recipient: &ShardId,
        cmd: &RemoteCommand,
        attempts: u32,
        reason: String,
    ) -> MigrationError {
        MigrationError::Dispatch {
            shard_id: recipient.clone(),
            command: cmd.to_string(),
            attempts,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport that replays a scripted sequence of replies.
    struct ScriptedTransport {
        replies: Mutex<VecDeque<anyhow::Result<CommandResponse>>>,
        calls: Mutex<Vec<(SocketAddr, RemoteCommand)>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<anyhow::Result<CommandResponse>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CommandTransport for ScriptedTransport {
        async fn send(
            &self,
            addr: SocketAddr,
            cmd: &RemoteCommand,
        ) -> anyhow::Result<CommandResponse> {
            self.calls.lock().unwrap().push((addr, cmd.clone()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted reply")))
        }
    }

    fn dispatcher(transport: Arc<ScriptedTransport>) -> RecipientDispatcher {
        let registry =
            StaticShardRegistry::parse("shard-a@127.0.0.1:15001, shard-b@127.0.0.1:15002")
                .expect("registry");
        RecipientDispatcher::new(
            Arc::new(registry),
            transport,
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                attempt_timeout: Duration::from_secs(1),
            },
        )
    }

    fn delete_cmd() -> RemoteCommand {
        RemoteCommand::DeleteRangeDeletionTask {
            migration_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn retries_transport_errors_until_success() {
        let transport = ScriptedTransport::new(vec![
            Err(anyhow::anyhow!("connection reset")),
            Ok(CommandResponse::Error {
                code: ErrorCode::ShuttingDown,
                message: "stepping down".into(),
            }),
            Ok(CommandResponse::Ok { n: 1 }),
        ]);
        let n = dispatcher(transport.clone())
            .send_to_recipient(&ShardId::new("shard-b"), &delete_cmd())
            .await
            .expect("third attempt succeeds");
        assert_eq!(n, 1);
        assert_eq!(transport.calls(), 3);
        let calls = transport.calls.lock().unwrap();
        assert!(calls.iter().all(|(addr, _)| addr.port() == 15002));
    }

    #[tokio::test]
    async fn exhausting_attempts_is_a_dispatch_failure() {
        let transport = ScriptedTransport::new(vec![
            Err(anyhow::anyhow!("refused")),
            Err(anyhow::anyhow!("refused")),
            Err(anyhow::anyhow!("refused")),
            Ok(CommandResponse::Ok { n: 1 }),
        ]);
        let err = dispatcher(transport.clone())
            .send_to_recipient(&ShardId::new("shard-b"), &delete_cmd())
            .await
            .expect_err("all attempts fail");
        match err {
            MigrationError::Dispatch {
                attempts, reason, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("refused"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn non_retriable_error_fails_on_first_attempt() {
        let transport = ScriptedTransport::new(vec![Ok(CommandResponse::Error {
            code: ErrorCode::FailedToParse,
            message: "bad command".into(),
        })]);
        let err = dispatcher(transport.clone())
            .send_to_recipient(&ShardId::new("shard-b"), &delete_cmd())
            .await
            .expect_err("non-retriable");
        assert!(matches!(err, MigrationError::Dispatch { attempts: 1, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_recipient_is_not_retried() {
        let transport = ScriptedTransport::new(Vec::new());
        let err = dispatcher(transport.clone())
            .send_to_recipient(&ShardId::new("shard-z"), &delete_cmd())
            .await
            .expect_err("unknown shard");
        assert!(matches!(err, MigrationError::ShardNotFound(ref s) if s.as_str() == "shard-z"));
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn registry_rejects_malformed_entries() {
        assert!(StaticShardRegistry::parse("shard-a").is_err());
        assert!(StaticShardRegistry::parse("shard-a@not-an-addr").is_err());
        let registry = StaticShardRegistry::parse("").expect("empty registry");
        assert!(registry.resolve(&ShardId::new("shard-a")).is_none());
    }

    #[test]
    fn commands_encode_with_an_op_tag() {
        let id = Uuid::new_v4();
        let encoded = serde_json::to_value(RemoteCommand::MarkRangeDeletionTaskReady {
            migration_id: id,
        })
        .expect("encode");
        assert_eq!(encoded["op"], "mark_range_deletion_task_ready");
        assert_eq!(encoded["migration_id"], id.to_string());
    }
}
