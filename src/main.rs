use std::sync::Arc;

use clap::{Parser, Subcommand};
use procurator::cfg::Configuration;
use procurator::core::dispatch::default_registry;
use procurator::core::hooks::{LifecycleHooks, NoopHooks};
use procurator::dlq::DlqAdmin;
use procurator::error::Result;
use procurator::http::{self, AppState};
use procurator::metrics;
use procurator::queue::QueueManager;
use procurator::webhook::WebhookNotifier;
use procurator::worker::{WorkerContext, WorkerPool};
use tracing::{error, info, warn};

/// The queues this process services.
const QUEUES: &[&str] = &["api", "script"];

#[derive(Parser)]
#[command(name = "procurator", about = "HTTP-fronted task dispatch and execution broker")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and worker pool (default when no subcommand is given).
    Serve,
    /// Inspect or manage the dead-letter queue. Requires QUEUE_BACKEND=redis.
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
}

#[derive(Subcommand)]
enum DlqAction {
    /// List the most recent dead letters for a queue.
    List {
        queue: String,
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
    /// Show full detail for one dead letter.
    Inspect { queue: String, msg_id: String },
    /// Re-enqueue a dead letter's original payload under a fresh tid.
    Replay { queue: String, msg_id: String },
    /// Drop every dead letter for a queue. Irreversible.
    Purge { queue: String },
}

/// Sets up stdout logging plus, when `LOG_DIR` is set, a daily-rotating
/// file sink alongside it. The non-blocking writer's guard is leaked so
/// the background flush thread lives for the rest of the process.
fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file_layer = std::env::var("LOG_DIR").ok().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "procurator.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        std::mem::forget(guard);
        tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false)
    });

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = Configuration::from_env()?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg).await,
        Command::Dlq { action } => run_dlq_command(cfg, action).await,
    }
}

async fn serve(cfg: Configuration) -> Result<()> {
    let cfg = Arc::new(cfg);
    metrics::install();

    let hooks: Arc<dyn LifecycleHooks> = Arc::new(NoopHooks);
    let queue_manager = QueueManager::new(&cfg, hooks.clone()).await;
    let registry = Arc::new(default_registry());
    let dlq = queue_manager.redis().map(|backend| Arc::new(DlqAdmin::new(backend)));

    let worker_ctx = WorkerContext {
        queue_manager: queue_manager.clone(),
        registry: registry.clone(),
        hooks,
        webhook: Arc::new(WebhookNotifier::new(&cfg)),
        cfg: cfg.clone(),
    };
    let queues: Vec<String> = QUEUES.iter().map(|q| q.to_string()).collect();
    let pool = WorkerPool::spawn(&queues, worker_ctx);

    let state = AppState {
        queue_manager,
        registry,
        dlq,
    };
    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.http_addr).await.map_err(|e| {
        procurator::error::Error::Generic(format!("failed to bind {}: {e}", cfg.http_addr))
    })?;
    info!("listening on {}", cfg.http_addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!("HTTP server error: {e}");
    }

    info!("shutting down worker pool");
    pool.shutdown(cfg.shutdown_grace()).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_dlq_command(cfg: Configuration, action: DlqAction) -> Result<()> {
    let queue_manager = QueueManager::new(&cfg, Arc::new(NoopHooks)).await;
    let Some(backend) = queue_manager.redis() else {
        warn!("DLQ management requires QUEUE_BACKEND=redis");
        return Ok(());
    };
    let dlq = DlqAdmin::new(backend);

    match action {
        DlqAction::List { queue, count } => {
            let entries = dlq.list(&queue, count).await?;
            println!("--- DLQ: {queue} (last {}) ---", entries.len());
            for e in entries {
                println!("{}\t{}\t{}\t{}", e.msg_id, e.time, e.task, e.error);
            }
        }
        DlqAction::Inspect { queue, msg_id } => {
            let detail = dlq.inspect(&queue, &msg_id).await?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        DlqAction::Replay { queue, msg_id } => {
            let outcome = dlq.replay(&queue, &msg_id).await?;
            println!("[OK] re-enqueued as tid: {}", outcome.new_tid);
        }
        DlqAction::Purge { queue } => {
            dlq.purge(&queue).await?;
            println!("[OK] purged DLQ: {queue}");
        }
    }
    Ok(())
}
