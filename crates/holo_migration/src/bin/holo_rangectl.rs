//! Operator tool for a shard's range-deletion and migration state.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_migration::command_server::TcpCommandTransport;
use holo_migration::config::MigrationConfig;
use holo_migration::{ChunkRange, Namespace, ShardNode};
use tokio::net::TcpListener;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "holo-rangectl")]
#[command(about = "Range deletion and migration admin for HoloStore shards", long_about = None)]
struct Args {
    #[command(flatten)]
    config: MigrationConfig,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the recipient command endpoint and the step-up recovery sweep.
    Serve,
    /// Create or replace a collection in the local catalog.
    RegisterCollection {
        #[arg(long)]
        nss: String,
        /// Defaults to a fresh uuid.
        #[arg(long)]
        uuid: Option<Uuid>,
    },
    /// Print every range deletion task as JSON, one per line.
    ListTasks {
        /// Only tasks that are no longer pending.
        #[arg(long, default_value_t = false)]
        ready: bool,
    },
    /// Print the status of every recorded migration.
    ListMigrations,
    /// Report whether a range overlaps any recorded range deletion task.
    CheckOverlap {
        #[arg(long)]
        collection_uuid: Uuid,
        /// Range lower bound as UTF-8 text.
        #[arg(long)]
        min: String,
        /// Range upper bound as UTF-8 text; empty means unbounded.
        #[arg(long, default_value = "")]
        max: String,
    },
    /// Refresh metadata for and submit every ready task.
    SubmitPending {
        /// Keep running until the scheduled deletions finish.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Remove every range deletion task.
    DropRangeDeletions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let registry = Arc::new(args.config.shard_registry()?);
    let transport = Arc::new(TcpCommandTransport::default());
    let (node, catalog) = ShardNode::open_local(&args.config, registry, transport)?;

    match args.command {
        Command::Serve => {
            let listener = TcpListener::bind(args.config.listen_commands)
                .await
                .with_context(|| format!("bind {}", args.config.listen_commands))?;
            tracing::info!(shard = %node.shard_id(), addr = %args.config.listen_commands, "shard node ready");
            let server = node.serve_commands(listener);
            let _recovery = node.spawn_step_up_recovery();
            tokio::select! {
                res = server => res.context("command server task")??,
                _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
            }
        }
        Command::RegisterCollection { nss, uuid } => {
            let uuid = uuid.unwrap_or_else(Uuid::new_v4);
            catalog.register_collection(&Namespace::new(nss.as_str()), uuid)?;
            println!("{nss} {uuid}");
        }
        Command::ListTasks { ready } => {
            let tasks = if ready {
                node.range_deletions().ready_tasks()?
            } else {
                node.range_deletions().list()?
            };
            for task in tasks {
                println!("{}", serde_json::to_string(&task)?);
            }
        }
        Command::ListMigrations => {
            for status in node.migration_statuses()? {
                println!("{}", serde_json::to_string(&status)?);
            }
        }
        Command::CheckOverlap {
            collection_uuid,
            min,
            max,
        } => {
            let range = ChunkRange::new(min.into_bytes(), max.into_bytes())?;
            let overlapping = node
                .range_deletions()
                .count_overlapping(&range, collection_uuid)?;
            println!("overlap={} tasks={overlapping}", overlapping > 0);
        }
        Command::SubmitPending { wait } => {
            let summary = node.submit_pending_deletions().await?;
            println!(
                "submitted={} already_scheduled={} deferred={} discarded={}",
                summary.submitted, summary.already_scheduled, summary.deferred, summary.discarded
            );
            if wait {
                while node.submitter().in_flight() > 0 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                println!("remaining={}", node.range_deletions().ready_tasks()?.len());
            }
        }
        Command::DropRangeDeletions => {
            let removed = node.range_deletions().drop_all()?;
            println!("ok (removed {removed} tasks)");
        }
    }
    Ok(())
}
