// Liveness endpoint for orchestrators: pool fill levels and job counters

use crate::consumer::JobConsumer;
use crate::pool::PoolManager;
use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct HealthState {
    pub worker_id: String,
    pub pool: Arc<PoolManager>,
    pub consumer: Arc<JobConsumer>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub worker_id: String,
    pub pool_size: usize,
    pub pools: BTreeMap<String, usize>,
    pub in_flight: usize,
    pub processed: u64,
}

pub async fn health(State(state): State<Arc<HealthState>>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        worker_id: state.worker_id.clone(),
        pool_size: state.pool.pool_size(),
        pools: state.pool.idle_counts(),
        in_flight: state.consumer.in_flight(),
        processed: state.consumer.processed(),
    })
}

pub fn routes(state: Arc<HealthState>) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

/// Serve `/health` on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, state: Arc<HealthState>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Health endpoint listening on {}", addr);

    axum::serve(listener, routes(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ExecutionLimits, ExecutionPipeline};
    use crate::runtime::ContainerRuntime;
    use crate::sandbox::SandboxProfile;
    use crate::testing::{MockExec, MockQueue, MockRuntime};
    use crucible_common::languages::LanguageConfigManager;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_reports_pool_levels() {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(MockRuntime::new(|_| MockExec::ok("")));
        let pool = Arc::new(PoolManager::new(
            runtime.clone(),
            LanguageConfigManager::builtin(),
            SandboxProfile::default(),
            2,
        ));
        pool.initialize().await;
        let pipeline = Arc::new(ExecutionPipeline::new(
            Arc::clone(&pool),
            runtime,
            LanguageConfigManager::builtin(),
            ExecutionLimits::default(),
        ));
        let consumer = Arc::new(JobConsumer::new(
            Arc::new(MockQueue::default()),
            pipeline,
            5,
            Duration::from_millis(10),
        ));

        let state = Arc::new(HealthState {
            worker_id: "worker-test".to_string(),
            pool,
            consumer,
        });
        let Json(report) = health(State(state)).await;

        assert_eq!(report.status, "ok");
        assert_eq!(report.pool_size, 2);
        assert_eq!(report.pools.get("python"), Some(&2));
        assert_eq!(report.pools.len(), 4);
        assert_eq!(report.in_flight, 0);
        assert_eq!(report.processed, 0);

        let body = serde_json::to_value(&report).unwrap();
        assert_eq!(body["workerId"], "worker-test");
        assert!(body.get("inFlight").is_some());
    }
}
