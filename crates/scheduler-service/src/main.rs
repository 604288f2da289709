use std::sync::Arc;

use anyhow::{Context, Result};
use reduction_scheduler::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; real deployments set the environment directly
    let _ = dotenvy::dotenv();
    init_logging();

    tracing::info!("reduction-scheduler starting...");

    let config = SchedulerConfig::from_env().context("Invalid scheduler configuration")?;

    tracing::info!(
        processor = ?config.processor,
        max_parallel_tasks = config.poller.max_parallel_tasks,
        task_age_secs = config.poller.task_age_before_execution.as_secs(),
        stop_wait_secs = config.supervisor.stop_wait.as_secs(),
        content_types = ?config.content_types,
        "Loaded configuration"
    );

    let store = PostgresTaskQueueStore::connect(&config.database_url)
        .await
        .context("Failed to connect to the queue database")?;
    store
        .run_migrations()
        .await
        .context("Failed to run queue migrations")?;

    let processor: Arc<dyn DocumentProcessor> = match &config.processor {
        ProcessorEndpoint::Http { base_url } => Arc::new(
            HttpDocumentProcessor::new(base_url.clone())
                .context("Failed to create document processor client")?,
        ),
        ProcessorEndpoint::Simulated => {
            tracing::warn!("Using the simulated document processor");
            Arc::new(SimulatedDocumentProcessor::default())
        }
    };

    tokio::fs::create_dir_all(&config.pipeline.working_root)
        .await
        .with_context(|| {
            format!(
                "Failed to create working root {}",
                config.pipeline.working_root.display()
            )
        })?;

    let mut registry = RunnerRegistry::new();
    for content_type in &config.content_types {
        registry.register(ContentReductionRunner::new(
            content_type.clone(),
            Arc::clone(&processor),
            config.pipeline.clone(),
        ));
    }

    let supervisor = Supervisor::new(
        Arc::new(store),
        registry,
        config.poller.clone(),
        config.supervisor.clone(),
    );

    match supervisor.run(shutdown_signal()).await {
        Ok(()) => {
            tracing::info!("Scheduler shutdown complete");
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "Fatal scheduler error");
            Err(e).context("Scheduler stopped on a fatal poller error")
        }
        Err(e) => Err(e.into()),
    }
}

/// Console logging filtered by `RUST_LOG`, else `LOG_LEVEL`
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| std::env::var("LOG_LEVEL").ok().map(|level| crate_filter(&level)))
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new(crate_filter("info")));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
        .init();
}

/// Filter directive applying `level` to the scheduler crates
fn crate_filter(level: &str) -> String {
    format!("reduction_scheduler={level},reduction_scheduler_service={level}")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
