// Foreman service binary
// Wires the engine together and exposes the admin HTTP surface (§4.7).
// The public execution-enqueue API and the real message broker are
// external collaborators per SPEC_FULL.md §1; this binary only runs the
// in-process broker stand-in (`broker::InProcessBroker`) plus the admin
// surface used to operate whatever real broker a deployment sits behind.

mod broker;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use foreman_core::{init_telemetry, EngineConfig, TelemetryConfig};
use foreman_engine::admin::{self, AdminOps};
use foreman_engine::breaker::{CircuitBreaker, CircuitBreakerConfig};
use foreman_engine::consumer::{BrokerConsumer, NoopPrewarm};
use foreman_engine::kv::{InMemoryKvStore, KvStore, RedisKvStore};
use foreman_engine::orchestrator::Orchestrator;
use foreman_engine::registry::{HeartbeatPublisher, WorkerRegistry};
use foreman_engine::runner::Runner;
use foreman_engine::sandbox::InProcessSandbox;
use foreman_engine::store::{ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore};
use foreman_core::config::ServiceConfig;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::broker::InProcessBroker;

#[derive(OpenApi)]
#[openapi(
    paths(
        routes::workers::list_workers,
        routes::workers::get_worker,
        routes::workers::recycle_process,
        routes::blacklist::list_blacklist,
        routes::blacklist::add_blacklist,
        routes::blacklist::remove_blacklist,
        routes::blacklist::stuck_history,
        routes::queue::list_queue,
    ),
    components(schemas(
        routes::workers::WorkerView,
        routes::workers::RecycleRequest,
        routes::blacklist::BlacklistEntryView,
        routes::blacklist::AddBlacklistRequest,
        routes::blacklist::StuckHistoryEntryView,
        routes::queue::PendingExecutionView,
    )),
    tags(
        (name = "admin-workers", description = "Worker presence and recycling"),
        (name = "admin-blacklist", description = "Circuit breaker / blacklist management"),
        (name = "admin-queue", description = "In-flight execution visibility"),
    ),
    info(
        title = "Foreman admin API",
        version = "0.1.0",
        description = "Admin control surface for the workflow execution engine",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry_guard = init_telemetry(TelemetryConfig::from_env());
    tracing::info!("foreman-service starting...");

    let engine_config = EngineConfig::from_env();
    let service_config = ServiceConfig::from_env();

    let store: Arc<dyn ExecutionStore> = match &service_config.database_url {
        Some(url) => {
            let pool = sqlx::PgPool::connect(url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            tracing::info!("connected to Postgres store");
            Arc::new(PostgresExecutionStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory execution store");
            Arc::new(InMemoryExecutionStore::new())
        }
    };

    let kv: Arc<dyn KvStore> = match &service_config.redis_url {
        Some(url) => {
            let redis = RedisKvStore::connect(url)
                .await
                .context("failed to connect to REDIS_URL")?;
            tracing::info!("connected to Redis KV store");
            Arc::new(redis)
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory KV store");
            Arc::new(InMemoryKvStore::new())
        }
    };

    let breaker = Arc::new(CircuitBreaker::new(
        CircuitBreakerConfig {
            threshold: engine_config.stuck_threshold,
            window: engine_config.stuck_window,
        },
        kv.clone(),
        store.clone(),
    ));

    let sandbox = InProcessSandbox::new();
    let runner = Arc::new(Runner::new(Arc::new(sandbox)));

    let broker = Arc::new(InProcessBroker::new());
    let consumer = Arc::new(BrokerConsumer::new(
        store.clone(),
        kv.clone(),
        breaker.clone(),
        broker.clone(),
        Arc::new(NoopPrewarm),
    ));

    let orchestrator = Orchestrator::start(engine_config.clone(), runner, consumer.clone()).await;
    consumer.attach_orchestrator(orchestrator.clone());

    let registry = Arc::new(WorkerRegistry::new(kv.clone()));
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let worker_id = format!("{hostname}-{}", std::process::id());
    let heartbeat = HeartbeatPublisher::new(registry.clone(), worker_id.clone(), engine_config.heartbeat_interval)
        .start(hostname)
        .await
        .context("failed to start heartbeat publisher")?;

    admin::spawn_command_listener(kv.clone(), worker_id.clone(), orchestrator.clone());

    tokio::spawn({
        let broker = broker.clone();
        let consumer = consumer.clone();
        async move { broker.run(consumer).await }
    });

    let admin_ops = Arc::new(AdminOps::new(
        store.clone(),
        kv.clone(),
        registry.clone(),
        breaker.clone(),
        consumer.clone(),
    ));

    let app = build_router(admin_ops);

    let addr = service_config.admin_bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "admin surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server error")?;

    tracing::info!("shutting down: deregistering worker and draining executions");
    if let Err(err) = heartbeat.shutdown().await {
        tracing::warn!(%err, "failed to deregister worker cleanly");
    }
    if let Err(err) = orchestrator.stop().await {
        tracing::warn!(%err, "graceful worker drain did not complete in time");
    }

    Ok(())
}

fn build_router(admin_ops: Arc<AdminOps>) -> Router {
    Router::new()
        .merge(routes::workers::routes(routes::workers::AppState { admin: admin_ops.clone() }))
        .merge(routes::blacklist::routes(routes::blacklist::AppState { admin: admin_ops.clone() }))
        .merge(routes::queue::routes(routes::queue::AppState { admin: admin_ops }))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
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
    tracing::info!("shutdown signal received");
}
