//! Lifecycle Coordinator: provisioning, teardown, and cancellation of the
//! cluster resource graph for one `BatchJob`.

use std::sync::Arc;

use base64::Engine as _;
use job_runner_common::{BatchJob, BatchStatus, Error as CommonError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::k8s::ClusterAdapter;
use crate::repository::{now_millis, JobRepository, RepoError, StatusUpdate};
use crate::storage::ObjectStore;

/// A step the provisioning protocol completed, in the order performed, so a
/// failure can be compensated for in reverse.
enum Provisioned {
    Secret,
    OutputPvc(String),
    InputPvc(String),
    InputUpload(String),
}

pub struct LifecycleCoordinator {
    cluster: Arc<dyn ClusterAdapter>,
    storage: Arc<dyn ObjectStore>,
    repository: Arc<dyn JobRepository>,
}

impl LifecycleCoordinator {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterAdapter>,
        storage: Arc<dyn ObjectStore>,
        repository: Arc<dyn JobRepository>,
    ) -> Self {
        Self {
            cluster,
            storage,
            repository,
        }
    }

    /// Provisioning protocol, invoked by the Dispatcher after a successful
    /// API create. Delivery is at-least-once: a redelivered task for a
    /// record that has already left `created` (promoted by the Reconciler,
    /// or cancelled) is a no-op.
    pub async fn provision(&self, job_id: Uuid) -> Result<(), CommonError> {
        let Some(mut job) = self
            .repository
            .get(job_id)
            .await
            .map_err(repo_err)?
        else {
            warn!(%job_id, "provision: record no longer exists");
            return Ok(());
        };

        if job.status != BatchStatus::Created {
            info!(%job_id, status = %job.status, "provision: record already left created, skipping");
            return Ok(());
        }

        let mut done: Vec<Provisioned> = Vec::new();
        if let Err(e) = self.run_provisioning_steps(&mut job, &mut done).await {
            error!(%job_id, error = %e, "provisioning failed, compensating");
            self.compensate(&job, &done).await;
            let diagnostic = serde_json::json!({ "error": e.to_string() });
            let applied = self
                .repository
                .cas_status(
                    job_id,
                    &[BatchStatus::Created],
                    StatusUpdate {
                        status: BatchStatus::Failed,
                        stop_time: Some(now_millis()),
                        last_pod_response: Some(diagnostic),
                        ..Default::default()
                    },
                )
                .await
                .map_err(repo_err)?;
            if !applied {
                info!(%job_id, "provisioning failure CAS skipped: record left created concurrently");
            }
            return Err(e);
        }

        Ok(())
    }

    async fn run_provisioning_steps(
        &self,
        job: &mut BatchJob,
        done: &mut Vec<Provisioned>,
    ) -> Result<(), CommonError> {
        self.cluster
            .ensure_secret()
            .await
            .map_err(|e| CommonError::Cluster(e.message))?;
        done.push(Provisioned::Secret);

        let output_pvc = job.output_pvc_claim_name();
        self.cluster
            .create_pvc(&output_pvc)
            .await
            .map_err(|e| CommonError::Cluster(e.message))?;
        done.push(Provisioned::OutputPvc(output_pvc));

        if job.has_input_file {
            let input_pvc = job.input_pvc_claim_name();
            self.cluster
                .create_pvc(&input_pvc)
                .await
                .map_err(|e| CommonError::Cluster(e.message))?;
            done.push(Provisioned::InputPvc(input_pvc));

            let encoded = job
                .job_parameters
                .input_zip
                .clone()
                .ok_or_else(|| CommonError::invalid("input_zip", "missing for has_input_file job"))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| CommonError::invalid("input_zip", format!("invalid base64: {e}")))?;
            let key = job.input_object_key();
            self.storage
                .upload(&key, bytes)
                .await
                .map_err(|e| CommonError::Storage(e.0))?;
            done.push(Provisioned::InputUpload(key));

            job.clear_input_zip();
            self.repository
                .clear_input_zip(job.id)
                .await
                .map_err(repo_err)?;
        }

        self.cluster
            .create_job(job)
            .await
            .map_err(|e| CommonError::Cluster(e.message))?;

        Ok(())
    }

    /// Undo whatever provisioning completed, in reverse order, tolerating
    /// `NotFound`/already-absent resources.
    async fn compensate(&self, job: &BatchJob, done: &[Provisioned]) {
        for step in done.iter().rev() {
            let result = match step {
                Provisioned::InputUpload(key) => self.storage.delete(key).await.map_err(|e| e.0),
                Provisioned::InputPvc(name) | Provisioned::OutputPvc(name) => {
                    self.cluster.delete_pvc(name).await.map_err(|e| e.message)
                }
                Provisioned::Secret => continue,
            };
            if let Err(e) = result {
                warn!(job_name = %job.name, error = %e, "compensating delete failed");
            }
        }
    }

    /// Teardown protocol, invoked by the Reconciler once a record reaches a
    /// terminal status. All four steps run unconditionally and tolerate
    /// individual failures; idempotent to run twice.
    pub async fn teardown(&self, job: &BatchJob) {
        if let Err(e) = self.cluster.delete_job(&job.name).await {
            warn!(job_name = %job.name, error = %e.message, "teardown: delete primary job failed");
        }
        if job.cleanup_launched {
            if let Err(e) = self.cluster.delete_job(&job.cleanup_job_name()).await {
                warn!(job_name = %job.name, error = %e.message, "teardown: delete cleanup job failed");
            }
        }
        if job.has_input_file {
            if let Err(e) = self.cluster.delete_pvc(&job.input_pvc_claim_name()).await {
                warn!(job_name = %job.name, error = %e.message, "teardown: delete input pvc failed");
            }
        }
        if let Err(e) = self.cluster.delete_pvc(&job.output_pvc_claim_name()).await {
            warn!(job_name = %job.name, error = %e.message, "teardown: delete output pvc failed");
        }
    }

    /// Cancellation protocol, invoked synchronously by the API on `DELETE`.
    /// Fails `InvalidParameters` unless the record is `running` or
    /// `cleaning`; otherwise deletes cluster Jobs, CAS's to `killed`, and
    /// tears down.
    pub async fn cancel(&self, job_id: Uuid) -> Result<BatchJob, CommonError> {
        let job = self
            .repository
            .get(job_id)
            .await
            .map_err(repo_err)?
            .ok_or_else(|| CommonError::NotFound(job_id.to_string()))?;

        if !matches!(job.status, BatchStatus::Running | BatchStatus::Cleaning) {
            return Err(CommonError::invalid(
                "status",
                format!("cannot cancel a job in status '{}'", job.status),
            ));
        }

        if let Err(e) = self.cluster.delete_job(&job.name).await {
            warn!(job_name = %job.name, error = %e.message, "cancel: delete primary job failed");
        }
        if job.cleanup_launched {
            if let Err(e) = self.cluster.delete_job(&job.cleanup_job_name()).await {
                warn!(job_name = %job.name, error = %e.message, "cancel: delete cleanup job failed");
            }
        }

        let applied = self
            .repository
            .cas_status(
                job_id,
                &[BatchStatus::Running, BatchStatus::Cleaning],
                StatusUpdate {
                    status: BatchStatus::Killed,
                    stop_time: Some(now_millis()),
                    ..Default::default()
                },
            )
            .await
            .map_err(repo_err)?;

        if !applied {
            return Err(CommonError::invalid(
                "status",
                "job left the running/cleaning state concurrently",
            ));
        }

        let updated = self
            .repository
            .get(job_id)
            .await
            .map_err(repo_err)?
            .ok_or_else(|| CommonError::NotFound(job_id.to_string()))?;
        self.teardown(&updated).await;
        Ok(updated)
    }
}

fn repo_err(e: RepoError) -> CommonError {
    CommonError::Repository(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{ClusterError, JobObservation};
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use job_runner_common::models::job::JobParameters;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCluster {
        fail_create_job: bool,
        deleted_pvcs: Mutex<Vec<String>>,
        deleted_jobs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClusterAdapter for FakeCluster {
        async fn ensure_secret(&self) -> Result<(), ClusterError> {
            Ok(())
        }
        async fn create_pvc(&self, _name: &str) -> Result<(), ClusterError> {
            Ok(())
        }
        async fn delete_pvc(&self, name: &str) -> Result<(), ClusterError> {
            self.deleted_pvcs.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn create_job(&self, _job: &BatchJob) -> Result<(), ClusterError> {
            if self.fail_create_job {
                Err(ClusterError {
                    message: "boom".to_string(),
                    raw_response: None,
                })
            } else {
                Ok(())
            }
        }
        async fn create_cleanup_job(&self, _job: &BatchJob) -> Result<(), ClusterError> {
            Ok(())
        }
        async fn delete_job(&self, name: &str) -> Result<(), ClusterError> {
            self.deleted_jobs.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn list_jobs(&self) -> Result<HashMap<String, JobObservation>, ClusterError> {
            Ok(HashMap::new())
        }
    }

    struct FakeStore {
        uploaded: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
    }

    impl Default for FakeStore {
        fn default() -> Self {
            Self {
                uploaded: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn upload(&self, key: &str, _bytes: Vec<u8>) -> Result<(), StorageError> {
            self.uploaded.lock().unwrap().push(key.to_string());
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.deleted.lock().unwrap().push(key.to_string());
            Ok(())
        }
        fn url_for(&self, key: &str) -> String {
            format!("https://example/{key}")
        }
    }

    #[derive(Default)]
    struct FakeRepo {
        jobs: Mutex<HashMap<Uuid, BatchJob>>,
    }

    #[async_trait]
    impl JobRepository for FakeRepo {
        async fn insert(&self, job: &BatchJob) -> Result<(), RepoError> {
            self.jobs.lock().unwrap().insert(job.id, job.clone());
            Ok(())
        }
        async fn get(&self, id: Uuid) -> Result<Option<BatchJob>, RepoError> {
            Ok(self.jobs.lock().unwrap().get(&id).cloned())
        }
        async fn list(&self, _status: Option<BatchStatus>) -> Result<Vec<BatchJob>, RepoError> {
            Ok(self.jobs.lock().unwrap().values().cloned().collect())
        }
        async fn list_non_terminal(&self) -> Result<Vec<BatchJob>, RepoError> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| !j.status.is_terminal())
                .cloned()
                .collect())
        }
        async fn cas_status(
            &self,
            id: Uuid,
            expected: &[BatchStatus],
            update: StatusUpdate,
        ) -> Result<bool, RepoError> {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(&id) else {
                return Ok(false);
            };
            if !expected.contains(&job.status) {
                return Ok(false);
            }
            job.status = update.status;
            if let Some(t) = update.start_time {
                job.start_time = Some(t);
            }
            if let Some(t) = update.stop_time {
                job.stop_time = Some(t);
            }
            if let Some(u) = update.output_file_url {
                job.output_file_url = Some(u);
            }
            if let Some(r) = update.last_pod_response {
                job.last_pod_response = Some(r);
            }
            if let Some(c) = update.cleanup_launched {
                job.cleanup_launched = c;
            }
            if let Some(t) = update.created_ticks_unseen {
                job.created_ticks_unseen = t;
            }
            Ok(true)
        }
        async fn clear_input_zip(&self, id: Uuid) -> Result<(), RepoError> {
            if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
                job.job_parameters.input_zip = None;
            }
            Ok(())
        }
    }

    fn coordinator(cluster: FakeCluster, store: FakeStore, repo: FakeRepo) -> LifecycleCoordinator {
        LifecycleCoordinator::new(Arc::new(cluster), Arc::new(store), Arc::new(repo))
    }

    #[tokio::test]
    async fn provision_happy_path_with_input_uploads_and_clears_payload() {
        let repo = FakeRepo::default();
        let params = JobParameters {
            docker_image: "alpine".to_string(),
            input_zip: Some("aGVsbG8=".to_string()),
            ..Default::default()
        };
        let job = BatchJob::new("alpine-1".to_string(), "acct".to_string(), params);
        let id = job.id;
        repo.insert(&job).await.unwrap();

        let coord = coordinator(FakeCluster::default(), FakeStore::default(), repo);
        coord.provision(id).await.unwrap();

        let stored = coord.repository.get(id).await.unwrap().unwrap();
        assert!(stored.job_parameters.input_zip.is_none());
        assert_eq!(stored.status, BatchStatus::Created);
    }

    #[tokio::test]
    async fn provision_failure_compensates_and_marks_failed() {
        let repo = FakeRepo::default();
        let params = JobParameters {
            docker_image: "alpine".to_string(),
            input_zip: Some("aGVsbG8=".to_string()),
            ..Default::default()
        };
        let job = BatchJob::new("alpine-2".to_string(), "acct".to_string(), params);
        let id = job.id;
        repo.insert(&job).await.unwrap();

        let cluster = FakeCluster {
            fail_create_job: true,
            ..Default::default()
        };
        let coord = coordinator(cluster, FakeStore::default(), repo);
        let err = coord.provision(id).await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        let stored = coord.repository.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Failed);
        assert!(stored.last_pod_response.is_some());
    }

    #[tokio::test]
    async fn provision_skips_when_record_already_progressed() {
        let repo = FakeRepo::default();
        let params = JobParameters {
            docker_image: "alpine".to_string(),
            ..Default::default()
        };
        let mut job = BatchJob::new("alpine-3".to_string(), "acct".to_string(), params);
        job.status = BatchStatus::Killed;
        let id = job.id;
        repo.insert(&job).await.unwrap();

        let coord = coordinator(FakeCluster::default(), FakeStore::default(), repo);
        coord.provision(id).await.unwrap();
        let stored = coord.repository.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Killed);
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_status() {
        let repo = FakeRepo::default();
        let params = JobParameters {
            docker_image: "alpine".to_string(),
            ..Default::default()
        };
        let mut job = BatchJob::new("alpine-4".to_string(), "acct".to_string(), params);
        job.status = BatchStatus::Succeeded;
        let id = job.id;
        repo.insert(&job).await.unwrap();

        let coord = coordinator(FakeCluster::default(), FakeStore::default(), repo);
        let err = coord.cancel(id).await.unwrap_err();
        assert!(matches!(err, CommonError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn cancel_running_job_tears_down_and_marks_killed() {
        let repo = FakeRepo::default();
        let params = JobParameters {
            docker_image: "alpine".to_string(),
            ..Default::default()
        };
        let mut job = BatchJob::new("alpine-5".to_string(), "acct".to_string(), params);
        job.status = BatchStatus::Running;
        let id = job.id;
        repo.insert(&job).await.unwrap();

        let coord = coordinator(FakeCluster::default(), FakeStore::default(), repo);
        let updated = coord.cancel(id).await.unwrap();
        assert_eq!(updated.status, BatchStatus::Killed);
        assert!(updated.stop_time.is_some());
    }
}
