mod config;
mod consumer;
mod evaluator;
mod health;
mod pipeline;
mod pool;
mod queue;
mod runner;
mod runtime;
mod sandbox;

#[cfg(test)]
mod testing;

use config::WorkerSettings;
use consumer::JobConsumer;
use crucible_common::languages::LanguageConfigManager;
use health::HealthState;
use pipeline::ExecutionPipeline;
use pool::PoolManager;
use queue::RedisJobQueue;
use runtime::{ContainerRuntime, DockerRuntime};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("Received Ctrl+C, shutting down..."),
        _ = terminate => warn!("Received SIGTERM, shutting down..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Crucible Worker booting...");

    let settings = WorkerSettings::from_env().map_err(|e| {
        error!("Invalid worker configuration: {:#}", e);
        e
    })?;

    let languages = LanguageConfigManager::load_or_builtin(&settings.languages_config).map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        e
    })?;
    info!(
        languages = ?languages.languages().map(|l| l.as_str()).collect::<Vec<_>>(),
        "Loaded language configurations"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);

    // Connect to Redis
    let client = ::redis::Client::open(settings.queue.redis_url.as_str())?;
    let redis_conn = ::redis::aio::ConnectionManager::new(client.clone()).await?;
    // Separate connection for the blocking dequeue
    let dequeue_conn = ::redis::aio::ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", settings.queue.redis_url);

    let queue = RedisJobQueue::new(
        redis_conn,
        dequeue_conn,
        &settings.queue.queue_name,
        &settings.worker_id,
        settings.queue.result_ttl_secs,
    );
    queue.recover_unacked().await?;

    let pool = Arc::new(PoolManager::new(
        Arc::clone(&runtime),
        languages.clone(),
        settings.profile(),
        settings.pool_size,
    ));
    pool.initialize().await;

    let pipeline = Arc::new(ExecutionPipeline::new(
        Arc::clone(&pool),
        runtime,
        languages,
        settings.limits(),
    ));
    let consumer = Arc::new(JobConsumer::new(
        Arc::new(queue),
        pipeline,
        settings.max_concurrent_jobs,
        settings.dequeue_wait(),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let health_state = Arc::new(HealthState {
        worker_id: settings.worker_id.clone(),
        pool: Arc::clone(&pool),
        consumer: Arc::clone(&consumer),
    });
    let health_server = tokio::spawn(health::serve(settings.health_addr, health_state, shutdown.clone()));

    info!(
        worker_id = %settings.worker_id,
        queue = %settings.queue.queue_name,
        max_concurrent = settings.max_concurrent_jobs,
        "Worker ready"
    );

    let consumed = Arc::clone(&consumer).run(shutdown.clone()).await;
    if let Err(e) = &consumed {
        error!(error = %e, "Job consumer stopped with an error");
    }

    shutdown.cancel();
    pool.shutdown().await;
    match health_server.await {
        Ok(Err(e)) => error!(error = %e, "Health endpoint failed"),
        Err(e) => error!(error = %e, "Health endpoint task panicked"),
        Ok(Ok(())) => {}
    }

    info!(processed = consumer.processed(), "Worker shutdown complete");
    consumed
}
