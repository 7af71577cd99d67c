//! Deterministic rendering of cluster manifests from a `BatchJob` record.
//!
//! Every function here is a pure transform: same record and config in,
//! byte-identical manifest out. No cluster I/O happens in this module.

use std::collections::BTreeMap;

use job_runner_common::models::job::ResourceQuantities;
use job_runner_common::BatchJob;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, ResourceRequirements, Secret, SecretVolumeSource, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex::Regex;
use std::sync::OnceLock;

/// Name of the Secret carrying the GCS service-account key, mounted by the
/// init and cleanup containers.
pub const GCS_SECRET_NAME: &str = "gcs-api-key";
const GCS_SECRET_KEY: &str = "key.json";

/// Label/annotation keys used to identify cleanup jobs from outside the
/// orchestrator, per the external cluster contract.
pub const LABEL_JOB_TYPE: &str = "job_runner_job_type";
pub const LABEL_RELATED_JOB: &str = "job_runner_related_job";
const JOB_TYPE_PRIMARY: &str = "primary";
const JOB_TYPE_CLEANUP: &str = "cleanup";

/// Default capacity requested for both input and output PVCs.
pub const DEFAULT_PVC_CAPACITY: &str = "10Gi";

/// Static knobs that do not vary per-record, threaded through rendering.
#[derive(Debug, Clone)]
pub struct ManifestConfig {
    pub namespace: String,
    pub bucket_name: String,
    pub backoff_limit: i32,
}

fn sanitizer() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._/-]").expect("static sanitizer pattern"))
}

/// Strip every character outside the safe set (alphanumeric, `-`, `.`, `_`,
/// `/`) from a string before it is interpolated into a manifest, image
/// reference, command argument, or environment value. Prevents manifest
/// injection via client-supplied fields.
#[must_use]
pub fn sanitize(input: &str) -> String {
    sanitizer().replace_all(input, "").to_string()
}

fn object_meta(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

fn resource_requirements(resources: &ResourceQuantities) -> Option<ResourceRequirements> {
    let limits = resources.limits.as_ref().and_then(|l| {
        let mut m = BTreeMap::new();
        if let Some(cpu) = &l.cpu {
            m.insert("cpu".to_string(), Quantity(sanitize(cpu)));
        }
        if let Some(mem) = &l.memory {
            m.insert("memory".to_string(), Quantity(sanitize(mem)));
        }
        (!m.is_empty()).then_some(m)
    });
    let requests = resources.requests.as_ref().and_then(|r| {
        let mut m = BTreeMap::new();
        if let Some(cpu) = &r.cpu {
            m.insert("cpu".to_string(), Quantity(sanitize(cpu)));
        }
        if let Some(mem) = &r.memory {
            m.insert("memory".to_string(), Quantity(sanitize(mem)));
        }
        (!m.is_empty()).then_some(m)
    });
    if limits.is_none() && requests.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        limits,
        requests,
        claims: None,
    })
}

fn env_vars(vars: &std::collections::HashMap<String, String>) -> Vec<EnvVar> {
    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|k| EnvVar {
            name: sanitize(k),
            value: Some(sanitize(&vars[k])),
            ..Default::default()
        })
        .collect()
}

/// Render the `gcs-api-key` Secret carrying the GCS service-account key.
#[must_use]
pub fn render_gcs_secret(cfg: &ManifestConfig, credentials_json: &[u8]) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(
        GCS_SECRET_KEY.to_string(),
        k8s_openapi::ByteString(credentials_json.to_vec()),
    );
    Secret {
        metadata: object_meta(GCS_SECRET_NAME, &cfg.namespace, BTreeMap::new()),
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Render a `ReadWriteOnce` PVC of the fixed default capacity.
#[must_use]
pub fn render_pvc(name: &str, namespace: &str) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(DEFAULT_PVC_CAPACITY.to_string()));
    PersistentVolumeClaim {
        metadata: object_meta(name, namespace, BTreeMap::new()),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                limits: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn gcsfuse_init_container(cfg: &ManifestConfig, job: &BatchJob) -> Container {
    let bucket = sanitize(&cfg.bucket_name);
    let object_key = sanitize(&job.input_object_key());
    let script = format!(
        "set -eu; mkdir -p /mnt/bucket /input; \
gcsfuse --key-file /secrets/gcs/{GCS_SECRET_KEY} {bucket} /mnt/bucket; \
unzip -o /mnt/bucket/{object_key} -d /input; \
fusermount -u /mnt/bucket"
    );
    Container {
        name: "initializer".to_string(),
        image: Some("gcr.io/cloud-builders/gcsfuse:latest".to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![script]),
        security_context: Some(k8s_openapi::api::core::v1::SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "gcs-secret".to_string(),
                mount_path: "/secrets/gcs".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "input".to_string(),
                mount_path: "/input".to_string(),
                read_only: Some(false),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

/// Render the primary Job: the user's `task` container, plus an
/// `initializer` init container when the record carries input.
#[must_use]
pub fn render_primary_job(job: &BatchJob, cfg: &ManifestConfig) -> Job {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_JOB_TYPE.to_string(), JOB_TYPE_PRIMARY.to_string());
    labels.insert(LABEL_RELATED_JOB.to_string(), sanitize(&job.name));

    let mut volumes = vec![Volume {
        name: "output".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: job.output_pvc_claim_name(),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut task_mounts = vec![VolumeMount {
        name: "output".to_string(),
        mount_path: "/output/".to_string(),
        read_only: Some(false),
        ..Default::default()
    }];
    let mut init_containers = Vec::new();

    if job.has_input_file {
        volumes.push(Volume {
            name: "input".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: job.input_pvc_claim_name(),
                ..Default::default()
            }),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "gcs-secret".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(GCS_SECRET_NAME.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        task_mounts.push(VolumeMount {
            name: "input".to_string(),
            mount_path: "/input/".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        init_containers.push(gcsfuse_init_container(cfg, job));
    }

    let task = Container {
        name: "task".to_string(),
        image: Some(sanitize(&job.job_parameters.docker_image)),
        env: Some(env_vars(&job.job_parameters.environment_variables)),
        volume_mounts: Some(task_mounts),
        resources: resource_requirements(&job.job_parameters.resources),
        ..Default::default()
    };

    Job {
        metadata: object_meta(&job.name, &cfg.namespace, labels.clone()),
        spec: Some(JobSpec {
            backoff_limit: Some(cfg.backoff_limit),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: (!init_containers.is_empty()).then_some(init_containers),
                    containers: vec![task],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Render the cleanup Job: zips the output PVC and uploads it to the
/// bucket via `gcsfuse`, then exits.
#[must_use]
pub fn render_cleanup_job(job: &BatchJob, cfg: &ManifestConfig) -> Job {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_JOB_TYPE.to_string(), JOB_TYPE_CLEANUP.to_string());
    labels.insert(LABEL_RELATED_JOB.to_string(), sanitize(&job.name));
    let mut annotations = BTreeMap::new();
    annotations.insert(LABEL_JOB_TYPE.to_string(), JOB_TYPE_CLEANUP.to_string());
    annotations.insert(LABEL_RELATED_JOB.to_string(), sanitize(&job.name));

    let bucket = sanitize(&cfg.bucket_name);
    let object_key = sanitize(&job.output_object_key());
    let script = format!(
        "set -eu; mkdir -p /mnt; \
gcsfuse --key-file /secrets/gcs/{GCS_SECRET_KEY} {bucket} /mnt; \
until mountpoint -q /mnt; do sleep 1; done; \
zip -r /mnt/{object_key} /process-output/; \
fusermount -u /mnt"
    );

    let container = Container {
        name: "cleanup".to_string(),
        image: Some("gcr.io/cloud-builders/gcsfuse:latest".to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![script]),
        security_context: Some(k8s_openapi::api::core::v1::SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "gcs-secret".to_string(),
                mount_path: "/secrets/gcs".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "output".to_string(),
                mount_path: "/process-output/".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: "gcs-secret".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(GCS_SECRET_NAME.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "output".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: job.output_pvc_claim_name(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    Job {
        metadata: ObjectMeta {
            annotations: Some(annotations),
            ..object_meta(&job.cleanup_job_name(), &cfg.namespace, labels.clone())
        },
        spec: Some(JobSpec {
            backoff_limit: Some(cfg.backoff_limit),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_runner_common::models::job::JobParameters;
    use job_runner_common::BatchJob;
    use std::collections::HashMap;

    fn cfg() -> ManifestConfig {
        ManifestConfig {
            namespace: "default".to_string(),
            bucket_name: "my-bucket".to_string(),
            backoff_limit: 0,
        }
    }

    fn job_with_input() -> BatchJob {
        let params = JobParameters {
            docker_image: "alpine".to_string(),
            input_zip: Some("aGVsbG8=".to_string()),
            ..Default::default()
        };
        BatchJob::new("alpine-1000".to_string(), "acct".to_string(), params)
    }

    #[test]
    fn sanitize_strips_unsafe_characters() {
        assert_eq!(sanitize("rm -rf /; echo$(whoami)"), "rm-rf/echowhoami");
        assert_eq!(sanitize("gcr.io/my-proj/worker:latest"), "gcr.io/my-proj/workerlatest");
    }

    #[test]
    fn primary_job_has_init_container_iff_input_present() {
        let with_input = render_primary_job(&job_with_input(), &cfg());
        let spec = with_input.spec.unwrap().template.spec.unwrap();
        assert!(spec.init_containers.is_some());
        assert_eq!(spec.containers[0].volume_mounts.as_ref().unwrap().len(), 2);

        let params = JobParameters {
            docker_image: "python".to_string(),
            ..Default::default()
        };
        let job = BatchJob::new("python-1".to_string(), "acct".to_string(), params);
        let without_input = render_primary_job(&job, &cfg());
        let spec = without_input.spec.unwrap().template.spec.unwrap();
        assert!(spec.init_containers.is_none());
        assert_eq!(spec.containers[0].volume_mounts.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn primary_job_mounts_output_at_well_known_path() {
        let job = job_with_input();
        let rendered = render_primary_job(&job, &cfg());
        let spec = rendered.spec.unwrap().template.spec.unwrap();
        let task = &spec.containers[0];
        let output_mount = task
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == "output")
            .unwrap();
        assert_eq!(output_mount.mount_path, "/output/");
    }

    #[test]
    fn cleanup_job_carries_identifying_annotations() {
        let job = job_with_input();
        let rendered = render_cleanup_job(&job, &cfg());
        let annotations = rendered.metadata.annotations.unwrap();
        assert_eq!(annotations.get(LABEL_JOB_TYPE).unwrap(), "cleanup");
        assert_eq!(annotations.get(LABEL_RELATED_JOB).unwrap(), "alpine-1000");
        assert_eq!(rendered.metadata.name.unwrap(), "alpine-1000-cleanup");
    }

    #[test]
    fn rendering_is_deterministic() {
        let job = job_with_input();
        let a = serde_json::to_string(&render_primary_job(&job, &cfg())).unwrap();
        let b = serde_json::to_string(&render_primary_job(&job, &cfg())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn resources_emit_only_populated_keys() {
        use job_runner_common::models::job::{ResourceSpec, ResourceQuantities};
        let resources = ResourceQuantities {
            limits: Some(ResourceSpec {
                cpu: Some("500m".to_string()),
                memory: None,
            }),
            requests: None,
        };
        let req = resource_requirements(&resources).unwrap();
        let limits = req.limits.unwrap();
        assert!(limits.contains_key("cpu"));
        assert!(!limits.contains_key("memory"));
        assert!(req.requests.is_none());
    }

    #[test]
    fn env_vars_sorted_for_determinism() {
        let mut vars = HashMap::new();
        vars.insert("B".to_string(), "2".to_string());
        vars.insert("A".to_string(), "1".to_string());
        let rendered = env_vars(&vars);
        assert_eq!(rendered[0].name, "A");
        assert_eq!(rendered[1].name, "B");
    }
}
