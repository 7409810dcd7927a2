use std::sync::Arc;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use sync_orchestrator::{
    app_state::AppState,
    checkpoint::PgCheckpointStore,
    config::AppConfig,
    db,
    jobs::PgJobStore,
    models::job::Job,
    models::message::Stage,
    pipeline::{AlwaysActive, JobPipeline, JobRunner, PipelineRegistry},
    progress::ProgressBroadcaster,
    queue::{RedisStageQueue, StageQueue},
    routes,
    scheduler::Orchestrator,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing sync-orchestrator");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("sync_jobs_completed_total", "Jobs that reached FINISHED");
    metrics::describe_counter!("sync_jobs_failed_total", "Jobs that reached FAILED or were cancelled");
    metrics::describe_counter!(
        "sync_messages_processed_total",
        "Pipeline messages processed across all stages"
    );
    metrics::describe_counter!(
        "sync_messages_dead_lettered_total",
        "Pipeline messages moved to a dead-letter queue"
    );
    metrics::describe_histogram!("sync_job_duration_seconds", "Wall-clock duration of one job run");
    metrics::describe_gauge!("sync_stage_queue_depth", "Pending messages per stage queue");

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize Redis stage queues
    tracing::info!("Connecting to Redis stage queues");
    let queue = Arc::new(
        RedisStageQueue::new(&config.redis_url, config.queue_ttl_secs)
            .expect("Failed to initialize stage queues"),
    );
    queue
        .health_check()
        .await
        .expect("Failed to reach Redis stage queues");

    // A crash between dequeue and ack leaves messages on the processing
    // lists; put them back in play before any consumer starts.
    for stage in Stage::ALL {
        let recovered = queue
            .recover(stage)
            .await
            .expect("Failed to recover in-flight stage messages");
        if recovered > 0 {
            tracing::warn!(stage = %stage, recovered, "requeued messages stranded by a previous process");
        }
    }

    let checkpoints = Arc::new(PgCheckpointStore::new(db_pool.clone()));
    let job_store = Arc::new(PgJobStore::new(db_pool.clone()));
    let progress = ProgressBroadcaster::default();

    // Collaborator pipelines are host-supplied per job type; configured jobs
    // without a real pipeline get the passthrough so wiring can be exercised
    // end to end.
    let mut registry = PipelineRegistry::new();
    for name in &config.jobs {
        registry.register(name.clone(), JobPipeline::passthrough());
    }
    let registry = Arc::new(registry);

    let gate = Arc::new(AlwaysActive);
    let runner = Arc::new(JobRunner::new(
        queue.clone(),
        checkpoints,
        job_store.clone(),
        registry,
        gate.clone(),
        progress.clone(),
        config.runner_config(),
    ));

    let (mut orchestrator, handle) = Orchestrator::new(
        job_store,
        runner,
        gate,
        config.scheduler_config(),
    );
    let configured: Vec<Job> = config.jobs.iter().map(|name| Job::new(name.as_str())).collect();
    orchestrator.load_jobs(&configured).await;

    let shutdown = CancellationToken::new();
    let orchestrator_shutdown = shutdown.clone();
    let orchestrator_task = tokio::spawn(async move {
        orchestrator.run(orchestrator_shutdown).await;
    });

    // Create shared state for the admin surface
    let state = AppState::new(db_pool, queue, handle, progress, prometheus_handle);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/jobs", get(routes::jobs::list_jobs))
        .route("/api/v1/jobs/{name}/{action}", post(routes::jobs::control_job))
        .route(
            "/api/v1/stages/{stage}/dead-letters",
            get(routes::jobs::stage_dead_letters),
        )
        .route("/api/v1/progress", get(routes::progress::progress_stream))
        .route("/metrics", get(routes::metrics::prometheus_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting sync-orchestrator on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Admin surface listening on {}", config.bind_addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    orchestrator_task.await.ok();
}
