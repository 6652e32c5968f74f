use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use pixelmill::app_state::AppState;
use pixelmill::config::AppConfig;
use pixelmill::db;
use pixelmill::routes;
use pixelmill::services::{
    queue::JobQueue, session::SessionStore, storage::ObjectStorage, sweeper::Sweeper,
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

    tracing::info!("Initializing pixelmill API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "pixelmill_jobs_created_total",
        "Total image processing jobs accepted"
    );
    metrics::describe_counter!(
        "pixelmill_jobs_canceled_total",
        "Total jobs canceled before dispatch"
    );
    metrics::describe_gauge!(
        "pixelmill_queue_depth",
        "Current length of the job stream"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.database_max_conn)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize object storage
    tracing::info!("Initializing object storage client");
    let storage = ObjectStorage::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object storage");
    storage
        .ensure_bucket()
        .await
        .expect("Failed to ensure storage bucket");

    // Initialize the job queue producer
    tracing::info!("Connecting to Redis job queue");
    let queue = JobQueue::new(&config.redis_url, &config.queue_stream_name)
        .expect("Failed to initialize job queue");

    let shutdown = CancellationToken::new();

    // Session store with background eviction
    let sessions = SessionStore::new(config.session_ttl_hours);
    sessions.spawn_evictor(Duration::from_secs(600), shutdown.clone());

    let state = AppState::new(db_pool, storage, queue, sessions, config.clone());

    // Retention sweeper runs co-located with the acceptor
    let sweeper = Sweeper::new(
        state.db.clone(),
        state.storage.clone(),
        Duration::from_secs(config.sweeper_interval_secs),
        config.sweeper_batch_size,
        config.pending_max_age_hours,
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown.clone()));

    // Periodic queue depth gauge refresh
    {
        let queue = state.queue.clone();
        let group = config.queue_consumer_group.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Ok(stats) = queue.stats(&group).await {
                            metrics::gauge!("pixelmill_queue_depth").set(stats.stream_length as f64);
                        }
                    }
                }
            }
        });
    }

    // Build API routes
    let app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route(
            "/api/v1/jobs",
            post(routes::jobs::create_job).get(routes::jobs::list_jobs),
        )
        .route(
            "/api/v1/jobs/:id",
            get(routes::jobs::get_job).delete(routes::jobs::cancel_job),
        )
        .route("/api/v1/jobs/:id/stream", get(routes::jobs::stream_job))
        .route("/api/v1/images/:id", get(routes::images::get_image))
        .route("/api/v1/stats/queue", get(routes::stats::queue_stats))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_secs,
        )))
        .layer(DefaultBodyLimit::max(config.max_upload_size))
        .layer(RequestBodyLimitLayer::new(config.max_upload_size));

    tracing::info!("Starting pixelmill on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install signal handler");
            tracing::info!("shutdown signal received, draining requests");
            signal_token.cancel();
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    if tokio::time::timeout(
        Duration::from_secs(config.shutdown_timeout_secs),
        sweeper_handle,
    )
    .await
    .is_err()
    {
        tracing::warn!("sweeper did not stop within the shutdown grace period");
    }

    tracing::info!("server stopped");
}
