//! The `BatchJob` record: the orchestrator's persisted view of one one-shot
//! containerized workload and its lifecycle.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A one-shot containerized workload submitted by an API client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub name: String,
    pub account_id: String,
    pub job_parameters: JobParameters,
    pub has_input_file: bool,
    pub status: BatchStatus,
    /// Epoch milliseconds.
    pub created: i64,
    /// Epoch milliseconds, taken from the Kubernetes Job's `startTime`.
    pub start_time: Option<i64>,
    /// Epoch milliseconds, taken from `completionTime` or an observed failure.
    pub stop_time: Option<i64>,
    pub output_file_url: Option<String>,
    pub last_pod_response: Option<serde_json::Value>,
    /// Guards the "at most one cleanup Job per `BatchJob`" invariant; set the
    /// moment the reconciler launches the cleanup Job, never before.
    #[serde(default)]
    pub cleanup_launched: bool,
    /// Consecutive reconciler ticks a `created` record has gone unobserved on
    /// the cluster; reset to zero the first time it is observed.
    #[serde(default)]
    pub created_ticks_unseen: i32,
}

/// Status of a `BatchJob`. See the status graph in the design for the legal
/// transitions; this type only carries the value, the graph lives in the
/// reconciler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Created,
    Running,
    Failed,
    Killed,
    Cleaning,
    Succeeded,
}

impl BatchStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Killed | BatchStatus::Succeeded)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Created => "created",
            BatchStatus::Running => "running",
            BatchStatus::Failed => "failed",
            BatchStatus::Killed => "killed",
            BatchStatus::Cleaning => "cleaning",
            BatchStatus::Succeeded => "succeeded",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(BatchStatus::Created),
            "running" => Ok(BatchStatus::Running),
            "failed" => Ok(BatchStatus::Failed),
            "killed" => Ok(BatchStatus::Killed),
            "cleaning" => Ok(BatchStatus::Cleaning),
            "succeeded" => Ok(BatchStatus::Succeeded),
            other => Err(crate::Error::invalid("status", format!("unknown status '{other}'"))),
        }
    }
}

/// The client-supplied payload describing what to run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobParameters {
    pub docker_image: String,
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
    #[serde(default)]
    pub resources: ResourceQuantities,
    /// Base64-encoded zip payload. Stripped from the persisted record once
    /// uploaded to object storage; never round-trips back out of the
    /// repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_zip: Option<String>,
}

/// Kubernetes resource limits/requests, each an optional quantity string
/// (e.g. `"500m"`, `"256Mi"`). Only populated keys are emitted into the
/// rendered manifest.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceQuantities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl BatchJob {
    /// Construct a new record in the initial `created` status.
    #[must_use]
    pub fn new(name: String, account_id: String, job_parameters: JobParameters) -> Self {
        let has_input_file = job_parameters.input_zip.is_some();
        Self {
            id: Uuid::new_v4(),
            name,
            account_id,
            job_parameters,
            has_input_file,
            status: BatchStatus::Created,
            created: Utc::now().timestamp_millis(),
            start_time: None,
            stop_time: None,
            output_file_url: None,
            last_pod_response: None,
            cleanup_launched: false,
            created_ticks_unseen: 0,
        }
    }

    /// Strip the uploaded input payload from the in-memory record so it is
    /// never persisted or held longer than the upload step requires.
    pub fn clear_input_zip(&mut self) {
        self.job_parameters.input_zip = None;
    }

    #[must_use]
    pub fn input_pvc_claim_name(&self) -> String {
        format!("job-{}-input", self.name)
    }

    #[must_use]
    pub fn output_pvc_claim_name(&self) -> String {
        format!("job-{}-output", self.name)
    }

    #[must_use]
    pub fn cleanup_job_name(&self) -> String {
        format!("{}-cleanup", self.name)
    }

    #[must_use]
    pub fn input_object_key(&self) -> String {
        format!("{}-input.zip", self.name)
    }

    #[must_use]
    pub fn output_object_key(&self) -> String {
        format!("{}-output.zip", self.name)
    }
}

/// Derive the default job name `<image-basename>-<creation-epoch-ms>` and
/// sanitize it into a valid DNS-1123 label.
#[must_use]
pub fn derive_job_name(docker_image: &str, created_epoch_ms: i64) -> String {
    let basename = docker_image
        .rsplit('/')
        .next()
        .unwrap_or(docker_image)
        .split(':')
        .next()
        .unwrap_or(docker_image);
    sanitize_dns_label(&format!("{basename}-{created_epoch_ms}"))
}

/// Lowercase, replace runs of invalid characters with `-`, and trim to a
/// valid DNS-1123 label (alphanumeric or `-`, starting/ending alphanumeric,
/// max 63 characters).
#[must_use]
pub fn sanitize_dns_label(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_dash = false;
    for c in input.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.len() > 63 {
        out.truncate(63);
        while out.ends_with('-') {
            out.pop();
        }
    }
    out
}

/// Check whether a string is already a valid DNS-1123 label, for validating
/// client-supplied `name` fields instead of silently rewriting them.
#[must_use]
pub fn is_valid_dns_label(input: &str) -> bool {
    if input.is_empty() || input.len() > 63 {
        return false;
    }
    let bytes = input.as_bytes();
    let starts_ok = bytes[0].is_ascii_alphanumeric();
    let ends_ok = bytes[bytes.len() - 1].is_ascii_alphanumeric();
    let body_ok = input
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    starts_ok && ends_ok && body_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_created_with_derived_invariants() {
        let params = JobParameters {
            docker_image: "alpine".to_string(),
            input_zip: Some("aGVsbG8=".to_string()),
            ..Default::default()
        };
        let job = BatchJob::new("alpine-123".to_string(), "acct-1".to_string(), params);

        assert_eq!(job.status, BatchStatus::Created);
        assert!(job.has_input_file);
        assert!(job.start_time.is_none());
        assert!(job.stop_time.is_none());
        assert!(!job.status.is_terminal());
        assert_eq!(job.input_pvc_claim_name(), "job-alpine-123-input");
        assert_eq!(job.output_pvc_claim_name(), "job-alpine-123-output");
        assert_eq!(job.cleanup_job_name(), "alpine-123-cleanup");
        assert_eq!(job.input_object_key(), "alpine-123-input.zip");
        assert_eq!(job.output_object_key(), "alpine-123-output.zip");
    }

    #[test]
    fn clear_input_zip_drops_payload_but_keeps_has_input_file() {
        let params = JobParameters {
            docker_image: "alpine".to_string(),
            input_zip: Some("aGVsbG8=".to_string()),
            ..Default::default()
        };
        let mut job = BatchJob::new("alpine-123".to_string(), "acct-1".to_string(), params);
        job.clear_input_zip();
        assert!(job.job_parameters.input_zip.is_none());
        assert!(job.has_input_file);
    }

    #[test]
    fn derive_job_name_strips_registry_and_tag() {
        assert_eq!(derive_job_name("alpine", 1000), "alpine-1000");
        assert_eq!(derive_job_name("library/python:3.12", 42), "python-42");
        assert_eq!(
            derive_job_name("gcr.io/my-proj/worker:latest", 99),
            "worker-99"
        );
    }

    #[test]
    fn sanitize_dns_label_collapses_invalid_characters() {
        assert_eq!(sanitize_dns_label("My_Job.Name!!"), "my-job-name");
        assert_eq!(sanitize_dns_label("___"), "");
    }

    #[test]
    fn is_valid_dns_label_rejects_bad_names() {
        assert!(is_valid_dns_label("alpine-123"));
        assert!(!is_valid_dns_label("Alpine_123"));
        assert!(!is_valid_dns_label("-alpine"));
        assert!(!is_valid_dns_label(""));
    }

    #[test]
    fn status_terminal_classification() {
        assert!(BatchStatus::Succeeded.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Killed.is_terminal());
        assert!(!BatchStatus::Created.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
        assert!(!BatchStatus::Cleaning.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&BatchStatus::Cleaning).unwrap();
        assert_eq!(json, "\"cleaning\"");
    }

    #[test]
    fn job_round_trips_through_json() {
        let params = JobParameters {
            docker_image: "python".to_string(),
            ..Default::default()
        };
        let job = BatchJob::new("python-1".to_string(), "acct-2".to_string(), params);
        let json = serde_json::to_string(&job).unwrap();
        let back: BatchJob = serde_json::from_str(&json).unwrap();
        assert_eq!(job.id, back.id);
        assert_eq!(job.status, back.status);
    }
}
