//! HTTP server.
//!
//! Exposes the pipeline as a JSON HTTP API. Long stages (training, merge)
//! return `202 Accepted` with a job id to poll; document processing streams
//! its progress as server-sent events.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/download-model?model_name=` | Download a base model from the hub |
//! | `POST` | `/process_doc?model_name=` | Multipart upload (`file`), SSE progress |
//! | `POST` | `/finetune?model_name=` | Start training; optional JSON hyperparameters |
//! | `POST` | `/merge?model_name=` | Start merging the latest adapter |
//! | `GET`  | `/jobs/{id}` | Background job status |
//! | `POST` | `/prompting` | Generate a completion from the merged model |
//! | `GET`  | `/list-merged-models` | Names with a merged model |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "dataset_not_found", "stage": "training", "message": "..." } }
//! ```
//!
//! Status codes: validation and ingestion `400`, missing artifacts `404`,
//! busy model `409`, extraction `422`, everything else `500`. Prerequisite
//! failures of `/finetune` and `/merge` are reported synchronously, before
//! any job is created.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::Config;
use crate::error::PipelineError;
use crate::jobs::Job;
use crate::pipeline::{Collaborators, Pipeline};
use crate::progress::{ChannelProgress, ProgressEvent, ProgressReporter};
use crate::store::validate_model_name;

/// Multipart framing allowance on top of the upload size limit.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Starts the HTTP server with the built-in collaborators.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let collaborators = Collaborators::from_config(config)?;
    run_server_with_collaborators(config, collaborators).await
}

/// Starts the HTTP server with caller-supplied collaborators.
pub async fn run_server_with_collaborators(
    config: &Config,
    collaborators: Collaborators,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pipeline = Pipeline::new(config.clone(), collaborators);
    pipeline.store().init()?;

    let app = router(pipeline);

    println!("doctune server listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, store = %config.store.root.display(), "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the router over `pipeline`.
pub fn router(pipeline: Pipeline) -> Router {
    let body_limit = pipeline
        .config()
        .ingest
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/download-model", post(handle_download))
        .route("/process_doc", post(handle_process_doc))
        .route("/finetune", post(handle_finetune))
        .route("/merge", post(handle_merge))
        .route("/jobs/{id}", get(handle_job))
        .route("/prompting", post(handle_prompting))
        .route("/list-merged-models", get(handle_list_merged))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(pipeline)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    stage: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    stage: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                stage: self.stage,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::Validation { .. }
            | PipelineError::Ingestion(_)
            | PipelineError::InvalidModelName(_) => StatusCode::BAD_REQUEST,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            PipelineError::Busy(_) => StatusCode::CONFLICT,
            PipelineError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(stage = err.stage(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            stage: err.stage().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(field: &str, message: impl Into<String>) -> AppError {
    PipelineError::validation(field, message).into()
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        stage: "server".to_string(),
        message: message.into(),
    }
}

/// Decodes a JSON body, reporting malformed input as a validation error.
fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| bad_request("body", e.to_string()))
}

#[derive(Deserialize)]
struct ModelQuery {
    model_name: Option<String>,
}

impl ModelQuery {
    fn require(self) -> Result<String, AppError> {
        match self.model_name {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(bad_request("model_name", "query parameter is required")),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /download-model ============

#[derive(Serialize)]
struct DownloadResponse {
    model_name: String,
    path: String,
}

async fn handle_download(
    State(pipeline): State<Pipeline>,
    Query(query): Query<ModelQuery>,
) -> Result<Json<DownloadResponse>, AppError> {
    let model_name = query.require()?;
    let model = pipeline.download_model(&model_name).await?;
    Ok(Json(DownloadResponse {
        model_name: model.repo_id,
        path: model.path.display().to_string(),
    }))
}

// ============ POST /process_doc ============

/// Handler for `POST /process_doc`.
///
/// A bad model name or a busy model is rejected with an ordinary HTTP
/// error. Once the stream starts, every outcome arrives as events ending in
/// `complete` or `error`. The run continues if the client disconnects.
async fn handle_process_doc(
    State(pipeline): State<Pipeline>,
    Query(query): Query<ModelQuery>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let model_name = query.require()?;
    validate_model_name(&model_name)?;
    if pipeline.is_busy(&model_name) {
        return Err(PipelineError::Busy(model_name).into());
    }

    let (reporter, rx) = ChannelProgress::new();
    tokio::spawn(async move {
        loop {
            match multipart.next_field().await {
                Ok(Some(field)) if field.name() == Some("file") => {
                    let filename = field.file_name().unwrap_or("upload").to_string();
                    // Errors already reached the client as an `error` event.
                    let _ = pipeline
                        .process_document(&model_name, &filename, field, &reporter)
                        .await;
                    break;
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    let err = PipelineError::Ingestion("multipart field 'file' is missing".into());
                    reporter.report(ProgressEvent::from_error(&err));
                    break;
                }
                Err(e) => {
                    let err = PipelineError::Ingestion(format!("malformed multipart body: {}", e));
                    reporter.report(ProgressEvent::from_error(&err));
                    break;
                }
            }
        }
    });

    let frames = UnboundedReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(event.to_sse_frame()));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(frames))
        .map_err(|e| internal(e.to_string()))
}

// ============ POST /finetune, POST /merge ============

#[derive(Serialize)]
struct JobAccepted {
    job_id: Uuid,
}

/// Handler for `POST /finetune`.
///
/// The body is optional; present fields override the configured default
/// hyperparameters.
async fn handle_finetune(
    State(pipeline): State<Pipeline>,
    Query(query): Query<ModelQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    let model_name = query.require()?;
    let overrides: serde_json::Map<String, serde_json::Value> = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::Map::new()
    } else {
        parse_body(&body)?
    };
    let params = pipeline.training_params(&overrides)?;
    let job_id = pipeline.start_training(&model_name, params)?;
    tracing::info!(model = %model_name, job = %job_id, "training job accepted");
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

async fn handle_merge(
    State(pipeline): State<Pipeline>,
    Query(query): Query<ModelQuery>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    let model_name = query.require()?;
    let job_id = pipeline.start_merge(&model_name)?;
    tracing::info!(model = %model_name, job = %job_id, "merge job accepted");
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

// ============ GET /jobs/{id} ============

async fn handle_job(
    State(pipeline): State<Pipeline>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let id = Uuid::parse_str(&id).map_err(|_| bad_request("id", "not a valid job id"))?;
    pipeline.jobs().get(id).map(Json).ok_or_else(|| AppError {
        status: StatusCode::NOT_FOUND,
        code: "job_not_found".to_string(),
        stage: "server".to_string(),
        message: format!("no job with id {}", id),
    })
}

// ============ POST /prompting ============

#[derive(Deserialize)]
struct PromptRequest {
    model_name: String,
    message: String,
    max_new_tokens: Option<usize>,
    temperature: Option<f64>,
    top_p: Option<f64>,
}

#[derive(Serialize)]
struct PromptResponse {
    response: String,
}

async fn handle_prompting(
    State(pipeline): State<Pipeline>,
    body: Bytes,
) -> Result<Json<PromptResponse>, AppError> {
    let req: PromptRequest = parse_body(&body)?;
    let params = pipeline.sampling_params(req.max_new_tokens, req.temperature, req.top_p);
    let response = pipeline.prompt(&req.model_name, &req.message, params).await?;
    Ok(Json(PromptResponse { response }))
}

// ============ GET /list-merged-models ============

#[derive(Serialize)]
struct MergedModelsResponse {
    models: Vec<String>,
}

async fn handle_list_merged(
    State(pipeline): State<Pipeline>,
) -> Result<Json<MergedModelsResponse>, AppError> {
    Ok(Json(MergedModelsResponse {
        models: pipeline.list_merged_models()?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(tmp: &TempDir) -> (Router, Pipeline) {
        let config = Config::with_store_root(tmp.path());
        let pipeline = Pipeline::new(config.clone(), Collaborators::from_config(&config).unwrap());
        pipeline.store().init().unwrap();
        (router(pipeline.clone()), pipeline)
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn json(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_version() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);
        let (status, body) = send(app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "ok");
    }

    #[tokio::test]
    async fn finetune_without_dataset_is_404() {
        let tmp = TempDir::new().unwrap();
        let (app, pipeline) = app(&tmp);
        add_base_model(&pipeline);
        let (status, body) = send(app, post("/finetune?model_name=m", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body = json(&body);
        assert_eq!(body["error"]["code"], "dataset_not_found");
        assert_eq!(body["error"]["stage"], "training");
        assert!(pipeline.jobs().list().is_empty());
    }

    /// A present base model, so dataset checks are reached.
    fn add_base_model(pipeline: &Pipeline) {
        let model = pipeline.store().model_ref("m").unwrap();
        std::fs::create_dir_all(&model.path).unwrap();
        std::fs::write(model.tokenizer_path(), "{}").unwrap();
        std::fs::write(model.path.join("model.safetensors"), "w").unwrap();
    }

    #[tokio::test]
    async fn finetune_rejects_out_of_range_rank() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);
        let (status, body) = send(app, post("/finetune?model_name=m", r#"{"lora_r": 100}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body = json(&body);
        assert_eq!(body["error"]["code"], "validation_error");
        assert!(body["error"]["message"].as_str().unwrap().contains("lora_r"));
    }

    #[tokio::test]
    async fn merge_without_adapter_is_404() {
        let tmp = TempDir::new().unwrap();
        let (app, pipeline) = app(&tmp);
        add_base_model(&pipeline);
        let (status, body) = send(app, post("/merge?model_name=m", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["error"]["code"], "adapter_not_found");
    }

    #[tokio::test]
    async fn missing_model_name_is_400() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);
        let (status, body) = send(app, post("/merge", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["error"]["code"], "validation_error");
    }

    #[tokio::test]
    async fn prompting_without_merged_model_is_404() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);
        let (status, body) = send(
            app,
            post("/prompting", r#"{"model_name": "m", "message": "hi"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["error"]["code"], "model_not_found");
    }

    #[tokio::test]
    async fn prompting_with_malformed_body_is_400() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);
        let (status, _) = send(app, post("/prompting", r#"{"message": "hi"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_merged_models_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);
        let (status, body) = send(
            app,
            Request::get("/list-merged-models").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["models"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn job_lookup() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);
        let (status, _) = send(
            app.clone(),
            Request::get("/jobs/not-a-uuid").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/jobs/{}", Uuid::new_v4());
        let (status, body) = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["error"]["code"], "job_not_found");
    }

    fn multipart_request(uri: &str, filename: &str, contents: &str) -> Request<Body> {
        let boundary = "doctune-test-boundary";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\n\
             Content-Type: text/plain\r\n\r\n{c}\r\n--{b}--\r\n",
            b = boundary,
            f = filename,
            c = contents
        );
        Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn sse_events(body: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(body)
            .split("\n\n")
            .filter_map(|frame| frame.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn process_doc_streams_progress() {
        let tmp = TempDir::new().unwrap();
        let (app, pipeline) = app(&tmp);
        let req = multipart_request(
            "/process_doc?model_name=m",
            "notes.txt",
            "Rain falls in spring across the valley. Snow covers the peaks all winter long.",
        );
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let events = sse_events(&body);

        assert_eq!(events.first().unwrap()["type"], "total_pages");
        let last = events.last().unwrap();
        assert_eq!(last["type"], "complete");
        assert_eq!(last["records"], 2);
        assert!(pipeline.store().training_path("m").unwrap().is_file());
    }

    #[tokio::test]
    async fn process_doc_reports_unsupported_type_as_error_event() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);
        let req = multipart_request("/process_doc?model_name=m", "image.png", "not text");
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        let events = sse_events(&body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "error");
        assert_eq!(events[0]["stage"], "ingestion");
    }

    #[tokio::test]
    async fn process_doc_on_busy_model_is_409() {
        let tmp = TempDir::new().unwrap();
        let (app, pipeline) = app(&tmp);
        let _held = pipeline.lock_model("m").unwrap();
        let req = multipart_request("/process_doc?model_name=m", "notes.txt", "text");
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json(&body)["error"]["code"], "busy");
    }
}
