//! API Facade: HTTP handlers for the batch job endpoints. Responsibilities
//! are limited to parameter validation, delegation to the Repository /
//! Coordinator / Dispatcher, and response shaping into the `{data, error,
//! msg, result}` envelope every endpoint returns.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine as _;
use job_runner_common::models::job::{derive_job_name, is_valid_dns_label};
use job_runner_common::{BatchJob, BatchStatus, Error as CommonError, JobParameters};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{error, warn};
use uuid::Uuid;

use crate::coordinator::LifecycleCoordinator;
use crate::dispatcher::TaskDispatcher;
use crate::repository::{now_millis, JobRepository, RepoError};

pub struct AppState {
    pub repository: Arc<dyn JobRepository>,
    pub coordinator: Arc<LifecycleCoordinator>,
    pub dispatcher: TaskDispatcher,
    pub db_pool: PgPool,
}

/// The envelope every handler returns: `data` on success, `error`/`msg` on
/// failure, `result` mirroring HTTP-level success/failure for clients that
/// don't want to inspect the status code.
#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    data: Option<T>,
    error: Option<String>,
    msg: Option<String>,
    result: bool,
}

impl<T: Serialize> Envelope<T> {
    fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            msg: None,
            result: true,
        }
    }
}

fn ok_response<T: Serialize>(data: T) -> Response {
    Json(Envelope::ok(data)).into_response()
}

/// Maps an `ApiError` to the envelope's `error`/`msg` fields and the HTTP
/// status the spec assigns each error kind.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(serde_json::Value),
    #[error(transparent)]
    Common(#[from] CommonError),
    #[error(transparent)]
    Repository(#[from] RepoError),
    #[error("job not found")]
    NotFound,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_kind, msg) = match &self {
            ApiError::Validation(fields) => {
                (StatusCode::BAD_REQUEST, "InvalidParameters".to_string(), fields.clone())
            }
            ApiError::Common(CommonError::InvalidParameters(m)) => (
                StatusCode::BAD_REQUEST,
                "InvalidParameters".to_string(),
                serde_json::json!(m),
            ),
            ApiError::Common(CommonError::NotFound(m)) => {
                (StatusCode::NOT_FOUND, "NotFound".to_string(), serde_json::json!(m))
            }
            ApiError::Common(CommonError::Cluster(m)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ClusterError".to_string(),
                serde_json::json!(m),
            ),
            ApiError::Common(CommonError::Storage(m)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "StorageError".to_string(),
                serde_json::json!(m),
            ),
            ApiError::Common(CommonError::Repository(m)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "RepositoryError".to_string(),
                serde_json::json!(m),
            ),
            ApiError::Repository(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "RepositoryError".to_string(),
                serde_json::json!(e.to_string()),
            ),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                "NotFound".to_string(),
                serde_json::json!("job not found"),
            ),
        };

        error!(kind = %error_kind, "api error");
        let body = Envelope::<()> {
            data: None,
            error: Some(error_kind),
            msg: Some(msg.to_string()),
            result: false,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
}

/// `GET /batch/?status=<s>` — defaults to `running` when `status` is absent.
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let status = match query.status {
        Some(s) => Some(BatchStatus::from_str(&s).map_err(ApiError::Common)?),
        None => Some(BatchStatus::Running),
    };
    let jobs = state.repository.list(status).await?;
    Ok(ok_response(jobs))
}

/// `GET /batch/<id>`
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state.repository.get(id).await?.ok_or(ApiError::NotFound)?;
    Ok(ok_response(job))
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub account_id: Option<String>,
    pub job_parameters: Option<CreateJobParameters>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateJobParameters {
    pub docker_image: Option<String>,
    #[serde(default)]
    pub environment_variables: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub resources: job_runner_common::models::job::ResourceQuantities,
    #[serde(default)]
    pub input_zip: Option<String>,
}

/// `POST /batch/` — validates, inserts the record as `created`, enqueues it
/// with the Dispatcher, and returns the inserted record. Provisioning
/// itself happens asynchronously on the Dispatcher's worker pool so the
/// request returns promptly.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateJobRequest>,
) -> Result<Response, ApiError> {
    let mut field_errors = serde_json::Map::new();

    let account_id = body.account_id.filter(|s| !s.is_empty());
    if account_id.is_none() {
        field_errors.insert("account_id".to_string(), serde_json::json!("Field is required"));
    }

    let params = body.job_parameters.unwrap_or_default();
    let docker_image = params.docker_image.filter(|s| !s.is_empty());
    if docker_image.is_none() {
        field_errors.insert("docker_image".to_string(), serde_json::json!("Field is required"));
    }

    if let Some(name) = &body.name {
        if !is_valid_dns_label(name) {
            field_errors.insert(
                "name".to_string(),
                serde_json::json!("must be a valid DNS-1123 label"),
            );
        }
    }

    if let Some(zip) = &params.input_zip {
        if base64::engine::general_purpose::STANDARD.decode(zip).is_err() {
            field_errors.insert(
                "input_zip".to_string(),
                serde_json::json!("must be valid base64"),
            );
        }
    }

    if !field_errors.is_empty() {
        return Err(ApiError::Validation(serde_json::Value::Object(field_errors)));
    }

    let account_id = account_id.expect("validated above");
    let docker_image = docker_image.expect("validated above");
    let created = now_millis();
    let name = body
        .name
        .unwrap_or_else(|| derive_job_name(&docker_image, created));

    let job_parameters = JobParameters {
        docker_image,
        environment_variables: params.environment_variables,
        resources: params.resources,
        input_zip: params.input_zip,
    };

    let mut job = BatchJob::new(name, account_id, job_parameters);
    job.created = created;

    state.repository.insert(&job).await?;

    if let Err(e) = state.dispatcher.enqueue(job.id).await {
        error!(job_id = %job.id, error = %e, "failed to enqueue provisioning task");
    }

    Ok(ok_response(job))
}

/// `DELETE /batch/<id>` — cancellation, invoked synchronously.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state.coordinator.cancel(id).await?;
    Ok(ok_response(job))
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
    database: &'static str,
}

/// `GET /health` — liveness/readiness probe: process status, crate version,
/// and a shallow database connectivity check (`SELECT 1`).
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let database = match sqlx::query("SELECT 1").execute(&state.db_pool).await {
        Ok(_) => "ok",
        Err(e) => {
            warn!(error = %e, "health check: database unreachable");
            "unreachable"
        }
    };

    let status = if database == "ok" { "ok" } else { "degraded" };
    let code = if database == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthBody {
        status,
        version: env!("CARGO_PKG_VERSION"),
        database,
    };
    (code, ok_response(body)).into_response()
}
