//! Batch job orchestrator entrypoint: wires configuration, the database
//! pool, the Kubernetes client, and the GCS client into the Cluster
//! Adapter / Object Store Adapter / Job Repository, then spins up the
//! Lifecycle Coordinator, the Task Dispatcher, the Status Reconciler, and
//! the HTTP API, shutting all three down cooperatively on Ctrl+C.

mod config;
mod coordinator;
mod dispatcher;
mod handlers;
mod k8s;
mod reconciler;
mod repository;
mod storage;

use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use coordinator::LifecycleCoordinator;
use dispatcher::TaskDispatcher;
use handlers::AppState;
use k8s::K8sClusterAdapter;
use reconciler::StatusReconciler;
use repository::PgJobRepository;
use storage::GcsObjectStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the database")?;

    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .context("failed to run database migrations")?;

    let kube_client = build_kube_client(&config).await?;
    k8s::client::verify_namespace_exists(&kube_client, &config.kubernetes_namespace)
        .await
        .context("configured KUBERNETES_NAMESPACE does not exist")?;

    let gcs_credentials = tokio::fs::read(&config.gc_credentials_file_path)
        .await
        .context("failed to read GC_CREDENTIALS_FILE_PATH")?;

    let cluster: Arc<dyn k8s::ClusterAdapter> = Arc::new(K8sClusterAdapter::new(
        kube_client,
        config.kubernetes_namespace.clone(),
        config.gc_bucket_name.clone(),
        config.job_backoff_limit,
        gcs_credentials,
    ));

    let storage: Arc<dyn storage::ObjectStore> = Arc::new(
        GcsObjectStore::new(config.gc_bucket_name.clone())
            .await
            .context("failed to build GCS client")?,
    );

    let repository: Arc<dyn repository::JobRepository> =
        Arc::new(PgJobRepository::new(db_pool.clone()));

    let coordinator = Arc::new(LifecycleCoordinator::new(
        cluster.clone(),
        storage.clone(),
        repository.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let dispatcher = TaskDispatcher::spawn(
        db_pool.clone(),
        coordinator.clone(),
        config.dispatcher_workers,
        config.dispatcher_poll_interval(),
        config.dispatcher_claim_timeout_secs,
        shutdown_rx.clone(),
    );

    let reconciler = Arc::new(StatusReconciler::new(
        repository.clone(),
        cluster.clone(),
        storage.clone(),
        coordinator.clone(),
        config.created_grace_ticks,
    ));
    let reconciler_interval = config.job_synchronization_interval();
    let reconciler_shutdown = shutdown_rx.clone();
    let reconciler_handle = tokio::spawn(async move {
        reconciler.run(reconciler_interval, reconciler_shutdown).await;
    });

    let state = Arc::new(AppState {
        repository,
        coordinator,
        dispatcher,
        db_pool,
    });

    let app = Router::new()
        .route("/batch/", get(handlers::list_jobs).post(handlers::create_job))
        .route("/batch/{id}", get(handlers::get_job).delete(handlers::cancel_job))
        .route("/health", get(handlers::health))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((config.api_host.as_str(), config.api_port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.api_host, config.api_port))?;

    tracing::info!(host = %config.api_host, port = config.api_port, "job-runner listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("HTTP server error")?;

    let _ = reconciler_handle.await;
    Ok(())
}

async fn shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received, draining in-flight work");
    let _ = shutdown_tx.send(true);
}

async fn build_kube_client(config: &AppConfig) -> anyhow::Result<kube::Client> {
    match (&config.kubernetes_api_url, &config.kubernetes_api_key) {
        (Some(url), Some(key)) => {
            let mut kube_config = kube::Config::new(url.parse().context("invalid KUBERNETES_API_URL")?);
            kube_config.auth_info.token = Some(key.clone().into());
            kube::Client::try_from(kube_config).context("failed to build Kubernetes client")
        }
        _ => kube::Client::try_default()
            .await
            .context("failed to infer Kubernetes client config"),
    }
}
