//! The Cluster Adapter: a thin, stateless capability layer over the
//! Kubernetes API. Translates `BatchJob` records into manifests and
//! performs CRUD; every method maps `NotFound`/`AlreadyExists` into the
//! idempotent outcomes the lifecycle engine expects.

use std::collections::HashMap;

use async_trait::async_trait;
use job_runner_common::BatchJob;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::{Client, Error as KubeError};
use tracing::info;

use crate::k8s::manifests::{self, ManifestConfig, LABEL_JOB_TYPE};

/// Errors surfaced by the Cluster Adapter. Carries the raw API response (if
/// any) so callers can attach it to `last_pod_response` for diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cluster error: {message}")]
pub struct ClusterError {
    pub message: String,
    pub raw_response: Option<serde_json::Value>,
}

impl ClusterError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            raw_response: None,
        }
    }

    fn from_kube(context: &str, err: KubeError) -> Self {
        let raw_response = match &err {
            KubeError::Api(resp) => serde_json::to_value(resp).ok(),
            _ => None,
        };
        Self {
            message: format!("{context}: {err}"),
            raw_response,
        }
    }
}

fn is_not_found(err: &KubeError) -> bool {
    matches!(err, KubeError::Api(resp) if resp.code == 404)
}

fn is_already_exists(err: &KubeError) -> bool {
    matches!(err, KubeError::Api(resp) if resp.code == 409)
}

/// Observed cluster state for one Job, as reported by the Kubernetes Job
/// status subresource.
#[derive(Debug, Clone, Default)]
pub struct JobObservation {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub start_time: Option<i64>,
    pub completion_time: Option<i64>,
}

impl JobObservation {
    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.succeeded > 0
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed > 0
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active > 0
    }
}

/// The Cluster Adapter contract. Implemented against a real cluster by
/// [`K8sClusterAdapter`]; mocked in coordinator/reconciler unit tests.
#[async_trait]
pub trait ClusterAdapter: Send + Sync {
    async fn ensure_secret(&self) -> Result<(), ClusterError>;
    async fn create_pvc(&self, name: &str) -> Result<(), ClusterError>;
    async fn delete_pvc(&self, name: &str) -> Result<(), ClusterError>;
    async fn create_job(&self, job: &BatchJob) -> Result<(), ClusterError>;
    async fn create_cleanup_job(&self, job: &BatchJob) -> Result<(), ClusterError>;
    async fn delete_job(&self, name: &str) -> Result<(), ClusterError>;
    /// List every primary and cleanup Job this orchestrator manages,
    /// keyed by Job name.
    async fn list_jobs(&self) -> Result<HashMap<String, JobObservation>, ClusterError>;
}

pub struct K8sClusterAdapter {
    client: Client,
    namespace: String,
    manifest_config: ManifestConfig,
    gcs_credentials: Vec<u8>,
}

impl K8sClusterAdapter {
    #[must_use]
    pub fn new(
        client: Client,
        namespace: String,
        bucket_name: String,
        backoff_limit: i32,
        gcs_credentials: Vec<u8>,
    ) -> Self {
        let manifest_config = ManifestConfig {
            namespace: namespace.clone(),
            bucket_name,
            backoff_limit,
        };
        Self {
            client,
            namespace,
            manifest_config,
            gcs_credentials,
        }
    }

    fn jobs_api(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs_api(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets_api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn submit_job(&self, job: Job, context: &str) -> Result<(), ClusterError> {
        let name = job.metadata.name.clone().unwrap_or_default();
        match self.jobs_api().create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(job_name = %name, "created Job");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                info!(job_name = %name, "Job already exists, treating as created");
                Ok(())
            }
            Err(e) => Err(ClusterError::from_kube(context, e)),
        }
    }
}

#[async_trait]
impl ClusterAdapter for K8sClusterAdapter {
    async fn ensure_secret(&self) -> Result<(), ClusterError> {
        let secret = manifests::render_gcs_secret(&self.manifest_config, &self.gcs_credentials);
        match self.secrets_api().create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(ClusterError::from_kube("ensure_secret", e)),
        }
    }

    async fn create_pvc(&self, name: &str) -> Result<(), ClusterError> {
        let pvc = manifests::render_pvc(name, &self.namespace);
        self.pvcs_api()
            .create(&PostParams::default(), &pvc)
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube("create_pvc", e))
    }

    async fn delete_pvc(&self, name: &str) -> Result<(), ClusterError> {
        match self.pvcs_api().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ClusterError::from_kube("delete_pvc", e)),
        }
    }

    async fn create_job(&self, job: &BatchJob) -> Result<(), ClusterError> {
        let manifest = manifests::render_primary_job(job, &self.manifest_config);
        self.submit_job(manifest, "create_job").await
    }

    async fn create_cleanup_job(&self, job: &BatchJob) -> Result<(), ClusterError> {
        let manifest = manifests::render_cleanup_job(job, &self.manifest_config);
        self.submit_job(manifest, "create_cleanup_job").await
    }

    async fn delete_job(&self, name: &str) -> Result<(), ClusterError> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.jobs_api().delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ClusterError::from_kube("delete_job", e)),
        }
    }

    async fn list_jobs(&self) -> Result<HashMap<String, JobObservation>, ClusterError> {
        let params = ListParams::default().labels(LABEL_JOB_TYPE);
        let list = self
            .jobs_api()
            .list(&params)
            .await
            .map_err(|e| ClusterError::from_kube("list_jobs", e))?;

        let mut out = HashMap::with_capacity(list.items.len());
        for item in list.items {
            let Some(name) = item.metadata.name.clone() else {
                continue;
            };
            let status = item.status.unwrap_or_default();
            out.insert(
                name,
                JobObservation {
                    active: status.active.unwrap_or(0),
                    succeeded: status.succeeded.unwrap_or(0),
                    failed: status.failed.unwrap_or(0),
                    start_time: status.start_time.map(|t| t.0.timestamp_millis()),
                    completion_time: status.completion_time.map(|t| t.0.timestamp_millis()),
                },
            );
        }
        Ok(out)
    }
}

/// Ensure the configured namespace exists; the orchestrator never creates
/// it, only verifies it (`KUBERNETES_NAMESPACE` "must pre-exist").
pub async fn verify_namespace_exists(client: &Client, namespace: &str) -> Result<(), ClusterError> {
    use k8s_openapi::api::core::v1::Namespace;
    let api: Api<Namespace> = Api::all(client.clone());
    api.get(namespace)
        .await
        .map(|_| ())
        .map_err(|e| ClusterError::from_kube("verify_namespace_exists", e))
}
