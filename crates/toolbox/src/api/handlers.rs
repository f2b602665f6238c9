//! API request handlers.
//!
//! The service handlers are generic over the entity config; [`Managed`]
//! picks the matching table out of the supervisor.

use std::convert::Infallible;

use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::install::{InstallRequest, ProgressEvent};
use crate::registry::{ModelConfig, RagConfig, ServiceRecord, SqlServiceConfig};
use crate::supervisor::{
    DEFAULT_OPENAI_HOST, DEFAULT_OPENAI_PORT, LogChunk, LogStream, OpenAiStatus, ServiceConfig,
    ServiceManager, Started, StatusReport, Supervisor, Termination,
};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Generic acknowledgement.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

/// One row of a list response: the record with its name folded in.
#[derive(Debug, Serialize)]
pub struct NamedRecord<C> {
    pub name: String,
    #[serde(flatten)]
    pub record: ServiceRecord<C>,
}

/// Body of `POST /{kind}/add`.
#[derive(Debug, Deserialize)]
#[serde(bound = "C: ServiceConfig")]
pub struct AddServiceRequest<C> {
    pub name: String,
    #[serde(flatten)]
    pub config: C,
}

/// Result of `POST /{kind}/{name}/{action}`.
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
}

/// Query of `POST /openai-compatible-service/start`.
#[derive(Debug, Default, Deserialize)]
pub struct OpenAiStartParams {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct OpenAiStartResponse {
    pub message: String,
    pub pid: u32,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub message: String,
    pub task_id: String,
}

/// Entity configs that have a table in the [`Supervisor`].
pub trait Managed: ServiceConfig {
    fn manager(supervisor: &Supervisor) -> &ServiceManager<Self>;
}

impl Managed for ModelConfig {
    fn manager(supervisor: &Supervisor) -> &ServiceManager<Self> {
        &supervisor.models
    }
}

impl Managed for RagConfig {
    fn manager(supervisor: &Supervisor) -> &ServiceManager<Self> {
        &supervisor.rags
    }
}

impl Managed for SqlServiceConfig {
    fn manager(supervisor: &Supervisor) -> &ServiceManager<Self> {
        &supervisor.sql
    }
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// Service handlers
// ============================================================================

/// List every record of one table.
#[instrument(skip(state), fields(kind = C::KIND.label()))]
pub async fn list_services<C: Managed>(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<NamedRecord<C>>>> {
    let records = C::manager(&state.supervisor).list().await?;
    Ok(Json(
        records
            .into_iter()
            .map(|(name, record)| NamedRecord { name, record })
            .collect(),
    ))
}

#[instrument(skip(state, body), fields(kind = C::KIND.label()))]
pub async fn add_service<C: Managed>(
    State(state): State<AppState>,
    body: Result<Json<AddServiceRequest<C>>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let Json(request) = body?;
    C::manager(&state.supervisor)
        .add(&request.name, request.config)
        .await?;
    info!(name = %request.name, "Service added");
    Ok(MessageResponse::new(format!(
        "{} {} added successfully",
        C::KIND.label(),
        request.name
    )))
}

#[instrument(skip(state, body), fields(kind = C::KIND.label()))]
pub async fn update_service<C: Managed>(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<C>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let Json(config) = body?;
    C::manager(&state.supervisor).update(&name, config).await?;
    Ok(MessageResponse::new(format!(
        "{} {} updated successfully",
        C::KIND.label(),
        name
    )))
}

#[instrument(skip(state), fields(kind = C::KIND.label()))]
pub async fn delete_service<C: Managed>(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    C::manager(&state.supervisor).delete(&name).await?;
    info!(name = %name, "Service deleted");
    Ok(MessageResponse::new(format!(
        "{} {} deleted successfully",
        C::KIND.label(),
        name
    )))
}

/// `start` or `stop` one service.
#[instrument(skip(state), fields(kind = C::KIND.label()))]
pub async fn manage_service<C: Managed>(
    State(state): State<AppState>,
    Path((name, action)): Path<(String, String)>,
) -> ApiResult<Json<ActionResponse>> {
    let manager = C::manager(&state.supervisor);
    let label = C::KIND.label();
    match action.as_str() {
        "start" => {
            let Started {
                process_id,
                already_running,
            } = manager.start(&name).await?;
            let message = if already_running {
                format!("{label} {name} is already running")
            } else {
                format!("{label} {name} started successfully")
            };
            Ok(Json(ActionResponse {
                message,
                process_id: Some(process_id),
            }))
        }
        "stop" => {
            let message = match manager.stop(&name).await? {
                Termination::AlreadyGone => format!("{label} {name} was not running"),
                Termination::Graceful | Termination::Killed => {
                    format!("{label} {name} stopped successfully")
                }
            };
            Ok(Json(ActionResponse {
                message,
                process_id: None,
            }))
        }
        other => Err(ApiError::bad_request(format!(
            "Invalid action: {other} (expected start or stop)"
        ))),
    }
}

#[instrument(skip(state), fields(kind = C::KIND.label()))]
pub async fn service_status<C: Managed>(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<StatusReport>> {
    let report = C::manager(&state.supervisor).status(&name).await?;
    Ok(Json(report))
}

/// Read a service's stdout or stderr from `offset`; negative reads the tail.
#[instrument(skip(state), fields(kind = C::KIND.label()))]
pub async fn service_logs<C: Managed>(
    State(state): State<AppState>,
    Path((name, log_type, offset)): Path<(String, String, i64)>,
) -> ApiResult<Json<LogChunk>> {
    let stream: LogStream = log_type.parse()?;
    let chunk = C::manager(&state.supervisor)
        .read_log(&name, stream, offset)
        .await?;
    Ok(Json(chunk))
}

// ============================================================================
// OpenAI-compatible service handlers
// ============================================================================

#[instrument(skip(state, params))]
pub async fn start_openai_service(
    State(state): State<AppState>,
    params: Result<Query<OpenAiStartParams>, QueryRejection>,
) -> ApiResult<Json<OpenAiStartResponse>> {
    let Query(params) = params?;
    let host = params.host.as_deref().unwrap_or(DEFAULT_OPENAI_HOST);
    let port = params.port.unwrap_or(DEFAULT_OPENAI_PORT);
    let Started {
        process_id,
        already_running,
    } = state.supervisor.openai.start(host, port).await?;
    let message = if already_running {
        "OpenAI compatible service is already running"
    } else {
        info!(pid = process_id, host = %host, port, "OpenAI compatible service started");
        "OpenAI compatible service started successfully"
    };
    Ok(Json(OpenAiStartResponse {
        message: message.to_string(),
        pid: process_id,
    }))
}

#[instrument(skip(state))]
pub async fn stop_openai_service(
    State(state): State<AppState>,
) -> ApiResult<Json<MessageResponse>> {
    if state.supervisor.openai.stop().await? {
        Ok(MessageResponse::new(
            "OpenAI compatible service stopped successfully",
        ))
    } else {
        Ok(MessageResponse::new("OpenAI compatible service is not running"))
    }
}

#[instrument(skip(state))]
pub async fn openai_service_status(
    State(state): State<AppState>,
) -> ApiResult<Json<OpenAiStatus>> {
    Ok(Json(state.supervisor.openai.status().await?))
}

// ============================================================================
// Install handlers
// ============================================================================

#[instrument(skip(state, body))]
pub async fn download_sql_engine(
    State(state): State<AppState>,
    body: Result<Json<InstallRequest>, JsonRejection>,
) -> ApiResult<Json<DownloadResponse>> {
    let Json(request) = body?;
    let install_dir = request.install_dir.display().to_string();
    let handle = state.installer.start(request)?;
    info!(task_id = %handle.task_id, install_dir = %install_dir, "Install started");
    Ok(Json(DownloadResponse {
        message: "Download started".to_string(),
        task_id: handle.task_id,
    }))
}

#[instrument(skip(state))]
pub async fn cancel_download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    if !state.installer.cancel(&task_id) {
        return Err(ApiError::not_found(format!("download task {task_id}")));
    }
    Ok(MessageResponse::new(format!("Download task {task_id} cancelled")))
}

/// SSE stream of install progress; `keepalive` while nothing is stored.
#[instrument(skip(state))]
pub async fn download_progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = state
        .progress
        .subscribe(task_id, state.progress_interval)
        .map(|event| {
            let data = match event {
                ProgressEvent::Snapshot(snapshot) => match serde_json::to_string(&snapshot) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!("Failed to serialize progress snapshot: {:?}", err);
                        "{\"error\":\"progress_serialization_failed\"}".to_string()
                    }
                },
                ProgressEvent::KeepAlive => "keepalive".to_string(),
            };
            Ok(Event::default().data(data))
        });

    Sse::new(stream).keep_alive(KeepAlive::new().text("keepalive"))
}

// ============================================================================
// Configuration handlers
// ============================================================================

#[instrument(skip(state))]
pub async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<Map<String, Value>>> {
    Ok(Json(state.settings.load().await?))
}

#[instrument(skip(state, body))]
pub async fn add_settings(
    State(state): State<AppState>,
    body: Result<Json<Map<String, Value>>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let Json(items) = body?;
    state.settings.add_items(items).await?;
    Ok(MessageResponse::new("Configuration updated"))
}

/// Body is either the list itself or an object carrying it under `key`.
#[instrument(skip(state, body))]
pub async fn update_settings(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let Json(body) = body?;
    let items = match body {
        Value::Object(mut object) if object.contains_key(&key) => {
            object.remove(&key).unwrap_or(Value::Null)
        }
        other => other,
    };
    state.settings.update_items(&key, items).await?;
    Ok(MessageResponse::new(format!("Configuration item {key} updated")))
}

#[instrument(skip(state))]
pub async fn delete_settings(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    state.settings.delete_key(&key).await?;
    Ok(MessageResponse::new(format!("Configuration item {key} deleted")))
}
