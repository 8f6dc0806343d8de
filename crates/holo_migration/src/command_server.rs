//! Recipient-side endpoint for remote range-deletion commands.
//!
//! Frames are length-delimited JSON: one `RemoteCommand` in, one
//! `CommandResponse` out, any number per connection.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::dispatch::{CommandResponse, CommandTransport, RemoteCommand};
use crate::error::{ErrorCode, MigrationError};
use crate::range_deletion::RangeDeletionStore;

/// Applies one command to the local range-deletion store. A missing task is
/// not an error; the response reports `n = 0`.
pub fn apply_remote_command(store: &RangeDeletionStore, cmd: &RemoteCommand) -> CommandResponse {
    let applied = match cmd {
        RemoteCommand::DeleteRangeDeletionTask { migration_id } => store.remove(*migration_id),
        RemoteCommand::MarkRangeDeletionTaskReady { migration_id } => {
            store.clear_pending(*migration_id)
        }
    };
    match applied {
        Ok(matched) => {
            tracing::debug!(command = %cmd, matched, "applied remote command");
            CommandResponse::Ok { n: matched as u64 }
        }
        Err(err) => {
            let err = MigrationError::from(err);
            tracing::warn!(command = %cmd, error = %err, "remote command failed");
            CommandResponse::from_error(&err)
        }
    }
}

pub async fn run(addr: SocketAddr, store: RangeDeletionStore) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind command listener on {addr}"))?;
    serve(listener, store).await
}

/// Accepts connections until the listener fails.
pub async fn serve(listener: TcpListener, store: RangeDeletionStore) -> anyhow::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "range deletion command server listening");
    loop {
        let (socket, peer) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, store).await {
                tracing::debug!(%peer, error = ?err, "command connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, store: RangeDeletionStore) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match serde_json::from_slice::<RemoteCommand>(&frame) {
            Ok(cmd) => {
                let store = store.clone();
                // fjall persists synchronously.
                tokio::task::spawn_blocking(move || apply_remote_command(&store, &cmd))
                    .await
                    .unwrap_or_else(|err| CommandResponse::Error {
                        code: ErrorCode::StorageError,
                        message: format!("command task failed: {err}"),
                    })
            }
            Err(err) => CommandResponse::Error {
                code: ErrorCode::FailedToParse,
                message: err.to_string(),
            },
        };
        framed
            .send(Bytes::from(serde_json::to_vec(&response)?))
            .await?;
    }
    Ok(())
}

/// Client half: one connection per command.
#[derive(Debug, Clone)]
pub struct TcpCommandTransport {
    connect_timeout: Duration,
}

impl TcpCommandTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpCommandTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl CommandTransport for TcpCommandTransport {
    async fn send(&self, addr: SocketAddr, cmd: &RemoteCommand) -> anyhow::Result<CommandResponse> {
        let socket = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("connect to {addr} timed out"))?
            .with_context(|| format!("connect to {addr}"))?;
        socket.set_nodelay(true)?;
        let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
        framed.send(Bytes::from(serde_json::to_vec(cmd)?)).await?;
        let frame = framed
            .next()
            .await
            .with_context(|| format!("{addr} closed the connection without a response"))??;
        Ok(serde_json::from_slice(&frame)?)
    }
}
