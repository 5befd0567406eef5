//! Axum request handlers for the HTTP API.
use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::api::routes::AppState;
use crate::error::{AppError, AppResult};
use crate::prompt::injector::PromptInputs;
use crate::service::{GenerationResult, HealthReport, ReloadSummary};
use crate::workflow::manager::{WorkflowDetails, WorkflowSummary};

const DEFAULT_USER: &str = "default";

pub async fn root() -> &'static str {
    "ComfyUI Image Service"
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(state.service.check_backend_health().await)
}

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub user: Option<String>,
    pub prompt: String,
    pub negative: Option<String>,
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateFromImageBody {
    pub user: Option<String>,
    pub prompt: String,
    /// Base64, optionally as a `data:` URL.
    pub image: String,
    pub negative: Option<String>,
    pub seed: Option<u64>,
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<GenerateBody>,
) -> AppResult<Response> {
    let inputs = PromptInputs {
        prompt: body.prompt,
        negative: body.negative,
        seed: body.seed,
        reference_image: None,
    };
    let result = run_generation(state, body.user, inputs).await?;
    Ok(render(result, raw_flag(&params)))
}

pub async fn generate_from_image(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<GenerateFromImageBody>,
) -> AppResult<Response> {
    let encoded = match body.image.split_once(";base64,") {
        Some((_, data)) => data,
        None => body.image.as_str(),
    };
    let image = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AppError::InvalidRequest(format!("image is not valid base64: {e}")))?;
    if image.is_empty() {
        return Err(AppError::InvalidRequest("image is empty".into()));
    }
    let inputs = PromptInputs {
        prompt: body.prompt,
        negative: body.negative,
        seed: body.seed,
        reference_image: Some(image),
    };
    let result = run_generation(state, body.user, inputs).await?;
    Ok(render(result, raw_flag(&params)))
}

/// Runs in its own task so a dropped connection still withdraws the backend job.
async fn run_generation(
    state: Arc<AppState>,
    user: Option<String>,
    inputs: PromptInputs,
) -> AppResult<GenerationResult> {
    let user = user.unwrap_or_else(|| DEFAULT_USER.to_string());
    let session = state.session(&user).await;
    let cancel = CancellationToken::new();
    let _on_disconnect = cancel.clone().drop_guard();

    let task = tokio::spawn(async move { state.service.generate_with(&session, inputs, &cancel).await });
    task.await
        .map_err(|e| AppError::JobFailed(format!("generation task aborted: {e}")))?
}

fn raw_flag(params: &HashMap<String, String>) -> bool {
    params.get("raw").map(|v| v == "true" || v == "1").unwrap_or(false)
}

fn render(result: GenerationResult, raw: bool) -> Response {
    if !raw {
        let mut meta = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
        meta["image"] = Value::String(STANDARD.encode(&result.image));
        return Json(meta).into_response();
    }

    let content_type = content_type_for(&result.image_ref.filename);
    let mut response = result.image.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(value) = HeaderValue::from_str(&result.prompt_id) {
        headers.insert("x-prompt-id", value);
    }
    if let Some(seed) = result.seed {
        headers.insert("x-seed", HeaderValue::from(seed));
    }
    response
}

fn content_type_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else {
        "image/png"
    }
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user: Option<String>,
}

pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Json<Value> {
    let user = query.user.unwrap_or_else(|| DEFAULT_USER.to_string());
    let session = state.session(&user).await;
    let workflows = state.service.list_workflows().await;
    Json(json!({
        "current": session.workflow_index(),
        "workflows": workflows,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SelectBody {
    pub user: Option<String>,
    pub index: usize,
}

pub async fn select_workflow(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SelectBody>,
) -> AppResult<Json<WorkflowSummary>> {
    let user = body.user.unwrap_or_else(|| DEFAULT_USER.to_string());
    let mut session = state.session(&user).await;
    let summary = state.service.select_workflow(&mut session, body.index).await?;
    state.store_session(&user, session).await;
    tracing::info!(%user, index = body.index, "Workflow selected");
    Ok(Json(summary))
}

pub async fn reload_workflows(State(state): State<Arc<AppState>>) -> AppResult<Json<ReloadSummary>> {
    state.service.reload_workflows().await.map(Json)
}

pub async fn describe_workflow(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> AppResult<Json<WorkflowDetails>> {
    state.service.describe_workflow(index).await.map(Json)
}
