use anyhow::Context;
use clap::Parser;
use gateway::{FileSystem, JobEngine, MemoryStore, UploadSessionService};
use scheduler::{
    CleanupUploadSessions, Dispatcher, DispatcherConfig, Registry, ScheduledSyncCopy,
};
use serve::config::BootstrapConfig;
use serve::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "filegate", about = "Multi-backend file gateway")]
struct Args {
    /// Bootstrap config file (storage configs, mounts, principals).
    #[arg(long, env = "FILEGATE_CONFIG")]
    config: std::path::PathBuf,

    /// Listen address.
    #[arg(long, env = "FILEGATE_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Scheduler tick interval in seconds.
    #[arg(long, default_value_t = 30)]
    tick_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = BootstrapConfig::from_file(&args.config)?;

    let store = MemoryStore::new();
    config.seed(&store).await?;

    let shutdown = CancellationToken::new();
    let fs = Arc::new(FileSystem::new(store.clone()));
    let jobs = JobEngine::new(store.clone(), fs.clone(), shutdown.clone());
    let sessions = Arc::new(UploadSessionService::new(fs.clone(), store.clone()));

    let registry = Registry::new().register(CleanupUploadSessions).register(ScheduledSyncCopy);
    let dispatcher = Dispatcher::new(
        registry,
        store.clone(),
        store.clone(),
        jobs.clone(),
        DispatcherConfig {
            tick_interval: std::time::Duration::from_secs(args.tick_secs.max(1)),
            ..Default::default()
        },
    );

    for entry in &config.scheduled_jobs {
        match dispatcher
            .create_job(Some(entry.task_id.clone()), entry.spec.clone())
            .await
        {
            Ok(job) => tracing::info!(task = %job.task_id, handler = %job.handler_id, "scheduled job loaded"),
            Err(err) => tracing::error!(task = %entry.task_id, ?err, "failed to load scheduled job"),
        }
    }
    tokio::spawn(dispatcher.clone().run(shutdown.clone()));

    let state = AppState {
        fs,
        jobs,
        sessions,
        dispatcher,
        auth: Arc::new(config.auth()),
    };
    let app = serve::router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(addr = %args.bind, "filegate listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("ctrl-c received, shutting down");
                }
                () = serve_shutdown.cancelled() => {}
            }
        })
        .await
        .context("server error")?;

    // Stop the dispatcher and signal in-flight jobs to wind down.
    shutdown.cancel();
    Ok(())
}
