use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{watch, Semaphore};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use visionflow::app_state::AppState;
use visionflow::broker::memory::MemoryBroker;
use visionflow::broker::redis::RedisBroker;
use visionflow::broker::QueueBroker;
use visionflow::config::AppConfig;
use visionflow::db::{self, store::StateStore};
use visionflow::orchestrator::Orchestrator;
use visionflow::profiles::{watcher, ProfileRegistry};
use visionflow::qa::QaPipeline;
use visionflow::routes;
use visionflow::services::images::HttpImageProvider;
use visionflow::services::notify::WebhookSink;
use visionflow::services::registry::HttpJobRegistry;
use visionflow::services::vision::OllamaClient;
use visionflow::worker::{AnalysisWorker, MediaLocks, WorkerContext};

#[tokio::main]
async fn main() {
    // Structured JSON logging, level from RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("failed to load configuration from environment");

    tracing::info!("initializing visionflow orchestrator");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("visionflow_jobs_acquired", "Jobs acquired from the registry");
    metrics::describe_counter!("visionflow_tasks_completed", "Tasks that passed all QA tiers");
    metrics::describe_counter!("visionflow_tasks_failed", "Tasks that terminally failed");
    metrics::describe_counter!(
        "visionflow_tasks_manual_review",
        "Tasks routed to manual review"
    );
    metrics::describe_counter!("visionflow_tasks_reclaimed", "Expired leases reclaimed");
    metrics::describe_counter!("visionflow_results_submitted", "Results delivered to the registry");
    metrics::describe_counter!("visionflow_processes_completed", "Processes fully closed");
    metrics::describe_histogram!("visionflow_model_call_seconds", "Vision model call latency");
    metrics::describe_gauge!("visionflow_queue_depth", "Waiting items per queue");

    // Profiles are fatal at startup: the full tree must validate.
    tracing::info!(dir = %config.config_dir, "loading analysis and corrective profiles");
    let profiles = Arc::new(
        ProfileRegistry::load(&config.config_dir).expect("invalid profile configuration tree"),
    );

    tracing::info!("connecting to state store");
    let pool = db::init_pool(&config.database_url)
        .await
        .expect("failed to connect to state store");
    db::run_migrations(&pool)
        .await
        .expect("failed to run state store migrations");
    let store = StateStore::new(pool);

    let broker: Arc<dyn QueueBroker> = match &config.redis_url {
        Some(url) => {
            tracing::info!("connecting to Redis queue store");
            Arc::new(
                RedisBroker::new(url, config.queue_capacity, Duration::from_secs(300))
                    .expect("failed to initialize Redis queue broker"),
            )
        }
        None => {
            tracing::info!("no REDIS_URL configured; using in-memory queue broker");
            Arc::new(MemoryBroker::new(
                config.queue_capacity,
                Duration::from_secs(300),
            ))
        }
    };

    let model = Arc::new(OllamaClient::new(&config.model_base_url));
    let registry = Arc::new(HttpJobRegistry::new(
        &config.registry_base_url,
        &config.registry_api_key,
    ));
    let images = Arc::new(HttpImageProvider::new());
    let notifier = Arc::new(WebhookSink::new(config.webhook_url.clone()));
    let semaphore = Arc::new(Semaphore::new(config.model_parallelism));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Config hot reload: watch the tree, swap on change.
    tokio::spawn(watcher::watch_config_tree(
        config.config_dir.clone().into(),
        profiles.clone(),
        shutdown_rx.clone(),
    ));

    let qa = QaPipeline::new(store.clone(), model.clone(), semaphore.clone());
    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        broker: broker.clone(),
        profiles: profiles.clone(),
        model: model.clone(),
        images,
        qa,
        semaphore: semaphore.clone(),
        media_locks: MediaLocks::default(),
    });

    tracing::info!(count = config.worker_count, "starting analysis workers");
    let mut worker_handles = Vec::with_capacity(config.worker_count);
    for index in 0..config.worker_count {
        let worker = AnalysisWorker::new(index, ctx.clone(), shutdown_rx.clone());
        worker_handles.push(tokio::spawn(worker.run()));
    }

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        broker.clone(),
        registry,
        profiles.clone(),
        notifier,
        Duration::from_secs(config.poll_interval_secs),
    ));
    let orchestrator_handle = tokio::spawn(orchestrator.run(shutdown_rx.clone()));

    let state = AppState::new(store, broker, profiles, model);
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/admin/reload", post(routes::admin::reload_profiles))
        .route(
            "/admin/processes/:process_id/cancel",
            post(routes::admin::cancel_process),
        )
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    tracing::info!(addr = %config.bind_addr, "admin server listening");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind admin server address");

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    });
    server.await.expect("admin server error");

    // Cooperative shutdown: workers finish their current step and exit.
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = orchestrator_handle.await;
    tracing::info!("visionflow stopped");
}
