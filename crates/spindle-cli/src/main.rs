//! `spindle`: run workers and inspect a task table from the command line.

mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use spindle_core::{
    EnqueueOptions, QueueConfig, QueueError, SqliteTaskStore, StoreError, TaskId, TaskQueue,
    TaskQueueBuilder,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(about = "Embedded database-backed task queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "SPINDLE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `database_url` from the configuration
    #[arg(long)]
    database_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start workers for the demo tasks until Ctrl-C
    Run {
        /// Number of worker loops (defaults to the configured concurrency)
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
    },
    /// Enqueue a task by name with a JSON payload
    Enqueue {
        name: String,

        #[arg(value_name = "JSON")]
        payload: serde_json::Value,

        /// Delay before the task becomes eligible
        #[arg(long, default_value = "0")]
        delay_ms: u64,
    },
    /// Show row counts by state
    Stats,
    /// List dead-lettered tasks, most recent first
    Dead {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Move a dead task back to pending with a fresh retry budget
    Requeue {
        #[arg(value_name = "TASK_ID")]
        id: TaskId,
    },
    /// Delete done and dead tasks that finished before the cutoff
    Purge {
        #[arg(long)]
        older_than_secs: u64,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<(), QueueError> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = QueueConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let store = Arc::new(open_store(&config.database_url, config.max_connections).await?);
    let queue = demo::register(TaskQueueBuilder::from_config(store.clone(), &config))?.build()?;

    let result = execute(cli.command, &queue, &config).await;
    store.close().await;
    result
}

/// Every pooled connection to `:memory:` would get its own empty database,
/// so in-memory URLs go to the single-connection store.
async fn open_store(url: &str, max_connections: u32) -> Result<SqliteTaskStore, StoreError> {
    if is_memory_url(url) {
        SqliteTaskStore::in_memory().await
    } else {
        SqliteTaskStore::connect(url, max_connections).await
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

async fn execute(command: Commands, queue: &TaskQueue, config: &QueueConfig) -> Result<(), QueueError> {
    match command {
        Commands::Run { concurrency } => {
            let mut options = config.worker_options();
            if let Some(concurrency) = concurrency {
                options.concurrency = concurrency;
            }
            let workers = queue.start_worker(options).await?;

            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C; stopping");
            }
            info!("shutdown requested");

            for summary in workers.stop().await {
                info!(
                    worker_id = summary.worker_id,
                    claimed = summary.claimed,
                    succeeded = summary.succeeded,
                    retried = summary.retried,
                    dead = summary.dead,
                    aborted = summary.aborted,
                    "worker summary"
                );
            }
        }
        Commands::Enqueue {
            name,
            payload,
            delay_ms,
        } => {
            let options = EnqueueOptions::delayed(Duration::from_millis(delay_ms));
            let id = queue.enqueue_raw(&name, payload, options).await?;
            println!("{id}");
        }
        Commands::Stats => {
            let counts = queue.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Commands::Dead { limit } => {
            for row in queue.list_dead(limit).await? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Commands::Requeue { id } => {
            if queue.requeue_dead(id).await? {
                println!("requeued {id}");
            } else {
                println!("{id} is not dead; nothing to do");
            }
        }
        Commands::Purge { older_than_secs } => {
            let purged = queue
                .purge_finished(Duration::from_secs(older_than_secs))
                .await?;
            println!("purged {purged} task(s)");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_are_recognised() {
        assert!(is_memory_url("sqlite::memory:"));
        assert!(is_memory_url("sqlite://tasks?mode=memory"));
        assert!(!is_memory_url("sqlite://spindle.db"));
    }

    #[tokio::test]
    async fn memory_url_shares_one_database() {
        let store = Arc::new(open_store("sqlite::memory:", 5).await.unwrap());
        let queue = demo::register(TaskQueueBuilder::new(store.clone()))
            .unwrap()
            .build()
            .unwrap();

        for n in 0..10 {
            queue.enqueue(&demo::Noop { n }).await.unwrap();
        }
        assert_eq!(queue.counts().await.unwrap().ready, 10);
    }

    #[test]
    fn parses_enqueue() {
        let cli = Cli::try_parse_from([
            "spindle",
            "--database-url",
            "sqlite::memory:",
            "enqueue",
            "hello",
            r#"{"name":"spindle"}"#,
            "--delay-ms",
            "250",
        ])
        .unwrap();

        assert_eq!(cli.database_url.as_deref(), Some("sqlite::memory:"));
        match cli.command {
            Commands::Enqueue {
                name,
                payload,
                delay_ms,
            } => {
                assert_eq!(name, "hello");
                assert_eq!(payload["name"], "spindle");
                assert_eq!(delay_ms, 250);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_task_id() {
        assert!(Cli::try_parse_from(["spindle", "requeue", "not-a-ulid"]).is_err());
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(Cli::try_parse_from(["spindle", "enqueue", "hello", "{oops"]).is_err());
    }
}
