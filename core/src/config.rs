//! Orchestrator configuration, loaded from the environment (with CLI
//! overrides) per the external interface contract.

use clap::Parser;
use std::time::Duration;

/// Runtime configuration for the batch job orchestrator.
///
/// Every field can be set via its environment variable; `clap`'s `env`
/// attribute means CLI flags take precedence when both are present.
#[derive(Debug, Clone, Parser)]
#[command(name = "job-runner", about = "Batch job orchestrator")]
pub struct AppConfig {
    /// Address the HTTP API binds to.
    #[arg(long, env = "API_HOST", default_value = "0.0.0.0")]
    pub api_host: String,

    /// Port the HTTP API binds to.
    #[arg(long, env = "API_PORT", default_value_t = 4898)]
    pub api_port: u16,

    /// Postgres connection string for the job repository and dispatch queue.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Base URL of the Kubernetes API server. Unset infers in-cluster or
    /// kubeconfig configuration, matching `kube::Config::infer`.
    #[arg(long, env = "KUBERNETES_API_URL")]
    pub kubernetes_api_url: Option<String>,

    /// Bearer token for the Kubernetes API, when not using ambient auth.
    #[arg(long, env = "KUBERNETES_API_KEY")]
    pub kubernetes_api_key: Option<String>,

    /// Namespace the orchestrator provisions resources in. Must pre-exist.
    #[arg(long, env = "KUBERNETES_NAMESPACE", default_value = "default")]
    pub kubernetes_namespace: String,

    /// Minimum log level, passed through to `tracing_subscriber::EnvFilter`.
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// GCS bucket backing the object store adapter.
    #[arg(long, env = "GC_BUCKET_NAME")]
    pub gc_bucket_name: String,

    /// Path to the GCS service-account credentials file, also mounted into
    /// the `gcs-api-key` Secret for init/cleanup containers.
    #[arg(long, env = "GC_CREDENTIALS_FILE_PATH")]
    pub gc_credentials_file_path: String,

    /// Reconciler tick interval, in seconds.
    #[arg(long, env = "JOB_SYNCHRONIZATION_INTERVAL", default_value_t = 30)]
    pub job_synchronization_interval_secs: u64,

    /// `backoffLimit` applied to every primary and cleanup Job.
    #[arg(long, env = "JOB_BACKOFF_LIMIT", default_value_t = 0)]
    pub job_backoff_limit: i32,

    /// Timeout applied to every cluster and object-store call.
    #[arg(long, env = "CALL_TIMEOUT_SECS", default_value_t = 30)]
    pub call_timeout_secs: u64,

    /// Consecutive reconciler ticks a `created` job may go unobserved on the
    /// cluster before it is marked `failed`.
    #[arg(long, env = "CREATED_GRACE_TICKS", default_value_t = 2)]
    pub created_grace_ticks: i32,

    /// Number of concurrent dispatcher workers draining the provisioning
    /// queue.
    #[arg(long, env = "DISPATCHER_WORKERS", default_value_t = 4)]
    pub dispatcher_workers: usize,

    /// How often each dispatcher worker polls the provisioning queue for an
    /// unclaimed row.
    #[arg(long, env = "DISPATCHER_POLL_INTERVAL_SECS", default_value_t = 2)]
    pub dispatcher_poll_interval_secs: u64,

    /// A provisioning queue row claimed longer than this (in seconds) is
    /// assumed to belong to a dead worker and is eligible for reclaim.
    #[arg(long, env = "DISPATCHER_CLAIM_TIMEOUT_SECS", default_value_t = 120)]
    pub dispatcher_claim_timeout_secs: i64,
}

impl AppConfig {
    #[must_use]
    pub fn job_synchronization_interval(&self) -> Duration {
        Duration::from_secs(self.job_synchronization_interval_secs)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    #[must_use]
    pub fn dispatcher_poll_interval(&self) -> Duration {
        Duration::from_secs(self.dispatcher_poll_interval_secs)
    }
}
