//! pushsub Hub
//!
//! Runs the maintenance scheduler and exposes lifecycle operations as
//! subcommands. Every subcommand except `run` prints its result as JSON.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::info;

use pushsub_core::config::{self, Config};
use pushsub_core::db::unix_timestamp;
use pushsub_core::tracing_init::{default_filter, init_tracing};
use pushsub_core::{BackoffPolicy, Decision, Priority, Renewal, SubscriptionLifecycle};

use pushsub_hub::dispatch::OutboxDispatcher;
use pushsub_hub::scheduler::{ScheduleSettings, spawn_scheduler};
use pushsub_hub::storage::HubDatabase;

#[derive(Parser, Debug)]
#[command(name = "pushsub-hub")]
#[command(version, about = "pushsub hub - subscriber lifecycle and delivery outbox")]
struct Cli {
    /// Path to SQLite database file.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Extra JSON config file layered over the global settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true)]
    log_json: bool,

    /// OTLP collector endpoint for traces and metrics.
    #[cfg(feature = "metrics")]
    #[arg(long, global = true, env = "PUSHSUB_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the requeue/prune scheduler until interrupted.
    Run,

    /// Mark an owner's idle subscribers pending and queue deliveries.
    Publish {
        #[arg(long)]
        owner: String,

        /// Priority for first attempts (default from config).
        #[arg(long)]
        priority: Option<Priority>,
    },

    /// Queue deliveries for every subscriber due now.
    Requeue {
        #[arg(long)]
        priority: Option<Priority>,
    },

    /// Apply a verified subscribe handshake.
    Subscribe {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        nickname: String,
        #[arg(long)]
        callback: String,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value = "")]
        secret: String,
    },

    /// Apply a verified unsubscribe handshake.
    Unsubscribe {
        #[arg(long)]
        callback: String,
    },

    /// Report a successful delivery.
    Delivered {
        #[arg(long)]
        id: String,

        /// Timestamp of the newest delivered item (default: now).
        #[arg(long)]
        through: Option<i64>,
    },

    /// Report a failed delivery.
    Failed {
        #[arg(long)]
        id: String,
    },

    /// List queued delivery jobs, or claim up to N of them.
    Jobs {
        #[arg(long)]
        claim: Option<usize>,
    },

    /// Subscriber counts per state and outbox size.
    Stats,

    /// Delete terminated subscribers not renewed recently.
    Prune {
        /// Age in days (default from config).
        #[arg(long)]
        older_than_days: Option<i64>,
    },

    /// Show the subscriber registered for a callback URL.
    Show {
        #[arg(long)]
        callback: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(cli.config.as_deref())?;
    if let Some(path) = &cli.db_path {
        config.hub.database_path = Some(path.clone());
    }

    init_tracing(&default_filter(&config.hub.log_level), cli.log_json);

    #[cfg(feature = "metrics")]
    let metrics_guard = cli
        .otlp_endpoint
        .as_deref()
        .map(pushsub_core::metrics::init_metrics)
        .transpose()?;

    let db_path = match &config.hub.database_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening hub database");
    let db = HubDatabase::open(&db_path).await?;

    run(cli.command, &config, db).await?;

    #[cfg(feature = "metrics")]
    if let Some(guard) = metrics_guard {
        guard.shutdown()?;
    }

    Ok(())
}

#[allow(clippy::too_many_lines)]
async fn run(command: Command, config: &Config, db: HubDatabase) -> anyhow::Result<()> {
    let outbox = OutboxDispatcher::new(db.clone());
    let lifecycle = Arc::new(
        SubscriptionLifecycle::new(Arc::new(db), Arc::new(outbox.clone()))
            .with_policy(BackoffPolicy::new(config.backoff)),
    );
    let default_priority = config.hub.default_priority;

    match command {
        Command::Run => {
            info!(version = env!("CARGO_PKG_VERSION"), "Starting pushsub-hub");
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let scheduler = spawn_scheduler(
                Arc::clone(&lifecycle),
                ScheduleSettings::from(&config.hub),
                shutdown_rx,
            );

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            scheduler.await?;
            info!("Hub stopped");
        }
        Command::Publish { owner, priority } => {
            let summary = lifecycle
                .publish(&owner, priority.unwrap_or(default_priority))
                .await?;
            emit(&summary)?;
        }
        Command::Requeue { priority } => {
            let enqueued = lifecycle
                .requeue(priority.unwrap_or(default_priority))
                .await?;
            emit(&json!({ "enqueued": enqueued }))?;
        }
        Command::Subscribe {
            owner,
            nickname,
            callback,
            topic,
            secret,
        } => {
            let replaced = lifecycle
                .renew(&Renewal {
                    owner_id: owner,
                    nickname,
                    subscribe: true,
                    callback_url: callback,
                    topic,
                    secret,
                })
                .await?;
            emit(&json!({ "previous": replaced.previous, "current": replaced.current }))?;
        }
        Command::Unsubscribe { callback } => {
            let replaced = lifecycle
                .renew(&Renewal {
                    owner_id: String::new(),
                    nickname: String::new(),
                    subscribe: false,
                    callback_url: callback,
                    topic: String::new(),
                    secret: String::new(),
                })
                .await?;
            emit(&json!({ "removed": replaced.previous }))?;
        }
        Command::Delivered { id, through } => {
            let updated = lifecycle
                .record_success(&id, through.unwrap_or_else(unix_timestamp))
                .await?;
            emit(&json!({ "id": id, "updated": updated }))?;
        }
        Command::Failed { id } => {
            let decision = lifecycle.record_failure(&id).await?;
            emit(&decision_json(&id, decision))?;
        }
        Command::Jobs { claim } => {
            let jobs = match claim {
                Some(limit) => outbox.claim(limit).await?,
                None => outbox.pending().await?,
            };
            emit(&jobs)?;
        }
        Command::Stats => {
            let subscribers = lifecycle.stats().await?;
            let jobs = outbox.count().await?;
            emit(&json!({ "subscribers": subscribers, "jobs": jobs }))?;
        }
        Command::Prune { older_than_days } => {
            let removed = lifecycle
                .prune_terminated(older_than_days.unwrap_or(config.hub.prune_after_days))
                .await?;
            emit(&json!({ "removed": removed }))?;
        }
        Command::Show { callback } => {
            let subscriber = lifecycle.subscriber_by_callback(&callback).await?;
            emit(&subscriber)?;
        }
    }

    Ok(())
}

fn decision_json(id: &str, decision: Option<Decision>) -> serde_json::Value {
    match decision {
        None => json!({ "id": id, "decision": null }),
        Some(Decision::Retry {
            delay_secs,
            next_retry_count,
        }) => json!({
            "id": id,
            "decision": "retry",
            "delay_secs": delay_secs,
            "retry_count": next_retry_count,
        }),
        Some(other) => json!({ "id": id, "decision": other.label() }),
    }
}

fn emit<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = config::database_path() {
        return Ok(path);
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".pushsub").join("hub.db"))
}
