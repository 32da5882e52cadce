//! HTTP JSON API.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, Path, State,
        multipart::{Field, MultipartError, MultipartRejection},
        rejection::JsonRejection,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use fleet_core::{JobStorage, RemoteShell};
use fleet_jobs::{DispatchError, Dispatcher, Operation, Payload, Placement};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::protocol::{
    AcceptedResponse, BatchResponse, CopyRequest, ErrorBody, ExecuteRequest, JobResponse, Mode,
    UploadForm, ValidationBody, ValidationErrors,
};

/// Shared handler state.
pub struct AppState<S, R>
where
    S: JobStorage,
    R: RemoteShell,
{
    pub dispatcher: Arc<Dispatcher<S, R>>,
}

impl<S, R> Clone for AppState<S, R>
where
    S: JobStorage,
    R: RemoteShell,
{
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

/// Handler error, rendered as a JSON body with `ok: false`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(#[from] ValidationErrors),
    #[error("Job not found")]
    JobNotFound,
    #[error("No file uploaded")]
    NoFile,
    /// Malformed multipart body, or any body over the size limit.
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = format!("Invalid request body: {}", rejection.body_text());
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::Rejected {
                status: rejection.status(),
                message,
            }
        } else {
            Self::Validation(ValidationErrors(vec![message]))
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::Rejected {
            status: rejection.status(),
            message: format!("Invalid upload: {}", rejection.body_text()),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::Rejected {
            status: e.status(),
            message: format!("Invalid upload: {}", e.body_text()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(errors) => {
                (StatusCode::BAD_REQUEST, Json(ValidationBody::from(errors))).into_response()
            }
            Self::JobNotFound => {
                (StatusCode::NOT_FOUND, Json(ErrorBody::new("Job not found"))).into_response()
            }
            Self::NoFile => {
                (StatusCode::BAD_REQUEST, Json(ErrorBody::new("No file uploaded"))).into_response()
            }
            Self::Rejected { status, message } => (status, Json(ErrorBody::new(message))).into_response(),
            Self::Dispatch(e) => {
                let status = match &e {
                    DispatchError::SourceDownload { .. } => StatusCode::BAD_GATEWAY,
                    DispatchError::NoHosts | DispatchError::Placement(_) => StatusCode::BAD_REQUEST,
                    DispatchError::Storage(_) | DispatchError::Staging(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                if status.is_server_error() {
                    tracing::error!(error = %e, "Request failed");
                }
                (status, Json(ErrorBody::new(e.to_string()))).into_response()
            }
        }
    }
}

/// Build the API router.
///
/// `max_body` bounds request bodies in bytes, including multipart uploads.
pub fn router<S, R>(dispatcher: Arc<Dispatcher<S, R>>, max_body: u64) -> Router
where
    S: JobStorage + 'static,
    R: RemoteShell + 'static,
{
    let max_body = usize::try_from(max_body).unwrap_or(usize::MAX);
    Router::new()
        .route("/api/health", get(health))
        .route("/api/execute", post(execute::<S, R>))
        .route("/api/job/{id}", get(job_status::<S, R>))
        .route("/api/upload-copy", post(upload_copy::<S, R>))
        .route("/api/copy-between-hosts", post(copy_between_hosts::<S, R>))
        .route("/api/copy-from-vm", post(copy_between_hosts::<S, R>))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { dispatcher })
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "status": "healthy" }))
}

async fn execute<S, R>(
    State(state): State<AppState<S, R>>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Response, ApiError>
where
    S: JobStorage + 'static,
    R: RemoteShell + 'static,
{
    let Json(request) = body?;
    let job = request.validate()?;
    tracing::info!(hosts = job.hosts.len(), mode = ?job.mode, "Execute request");
    dispatch(&state.dispatcher, job.hosts, job.operation, job.mode, None).await
}

async fn job_status<S, R>(
    State(state): State<AppState<S, R>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError>
where
    S: JobStorage + 'static,
    R: RemoteShell + 'static,
{
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::JobNotFound)?;
    let job = state.dispatcher.job(id).await?.ok_or(ApiError::JobNotFound)?;
    Ok(Json(JobResponse::truncated(job)))
}

async fn upload_copy<S, R>(
    State(state): State<AppState<S, R>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError>
where
    S: JobStorage + 'static,
    R: RemoteShell + 'static,
{
    let mut multipart = multipart?;
    let mut form = UploadForm::default();
    let mut upload: Option<(Payload, Option<String>, u64)> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let uploaded_name = field.file_name().map(str::to_string);
            let (payload, bytes) = stage_file(field).await?;
            upload = Some((payload, uploaded_name, bytes));
        } else {
            form.set(&name, field.text().await?);
        }
    }

    let (payload, uploaded_name, bytes) = upload.ok_or(ApiError::NoFile)?;
    let job = form.validate(uploaded_name.as_deref(), state.dispatcher.defaults())?;
    tracing::info!(
        hosts = job.hosts.len(),
        file = %job.file_name,
        bytes,
        mode = ?job.mode,
        "Upload request"
    );

    let filename = job.file_name.clone();
    let placement =
        Placement::new(Arc::new(payload), job.file_name, job.spec).map_err(DispatchError::from)?;
    dispatch(
        &state.dispatcher,
        job.hosts,
        Operation::Place(placement),
        job.mode,
        Some(filename),
    )
    .await
}

/// Stream a multipart file part into a temporary payload.
async fn stage_file(mut field: Field<'_>) -> Result<(Payload, u64), ApiError> {
    let payload = Payload::staging().map_err(DispatchError::Staging)?;
    let mut file = tokio::fs::File::create(payload.path())
        .await
        .map_err(DispatchError::Staging)?;
    let mut written = 0u64;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await.map_err(DispatchError::Staging)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(DispatchError::Staging)?;
    Ok((payload, written))
}

async fn copy_between_hosts<S, R>(
    State(state): State<AppState<S, R>>,
    body: Result<Json<CopyRequest>, JsonRejection>,
) -> Result<Response, ApiError>
where
    S: JobStorage + 'static,
    R: RemoteShell + 'static,
{
    let Json(request) = body?;
    let copy = request.validate(state.dispatcher.defaults())?;
    tracing::info!(
        source = %copy.source.host,
        path = %copy.path,
        hosts = copy.hosts.len(),
        "Copy request"
    );

    let outcome = state
        .dispatcher
        .copy_between_hosts(&copy.source, &copy.path, &copy.hosts, copy.spec)
        .await?;
    Ok(Json(BatchResponse {
        ok: true,
        completed: true,
        results: outcome.results,
        statuses: outcome.statuses,
        filename: None,
    })
    .into_response())
}

async fn dispatch<S, R>(
    dispatcher: &Dispatcher<S, R>,
    hosts: Vec<String>,
    operation: Operation,
    mode: Mode,
    filename: Option<String>,
) -> Result<Response, ApiError>
where
    S: JobStorage + 'static,
    R: RemoteShell + 'static,
{
    match mode {
        Mode::Async => {
            let job_id = dispatcher.submit(hosts, operation).await?;
            Ok(Json(AcceptedResponse { ok: true, job_id }).into_response())
        }
        Mode::Sync => {
            let outcome = dispatcher.run(&hosts, operation).await?;
            Ok(Json(BatchResponse {
                ok: true,
                completed: true,
                results: outcome.results,
                statuses: outcome.statuses,
                filename,
            })
            .into_response())
        }
    }
}
