//! REST and WebSocket handlers.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::bus::LiveBus;
use crate::database::channels::ChannelInput;
use crate::database::hosts::CredentialKind;
use crate::database::records::{AuthMode, Host, NewHost};
use crate::errors::CoreError;
use crate::notify::ssrf::validate_outbound_url;
use crate::sanitize::sanitize;
use crate::web::AppState;

pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<CoreError>() {
            Some(CoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(CoreError::Validation(_)) | Some(CoreError::Config(_)) => StatusCode::BAD_REQUEST,
            Some(CoreError::AuthDenied { .. }) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = sanitize(&format!("{:#}", self.0));
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn not_found(what: &str) -> ApiError {
    ApiError(CoreError::NotFound(what.to_string()).into())
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(CoreError::Validation(message.into()).into())
}

// ----------------------------------------------------------------------
// Hosts
// ----------------------------------------------------------------------

pub async fn list_hosts(State(state): State<AppState>) -> ApiResult<Json<Vec<Host>>> {
    Ok(Json(state.database.list_hosts().await?))
}

pub async fn create_host(
    State(state): State<AppState>,
    Json(new): Json<NewHost>,
) -> ApiResult<(StatusCode, Json<Host>)> {
    let host = state.database.create_host(&new, &state.vault).await?;
    Ok((StatusCode::CREATED, Json(host)))
}

pub async fn get_host(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> ApiResult<Json<Host>> {
    let host = state
        .database
        .get_host(&host_id)
        .await?
        .ok_or_else(|| not_found("host"))?;
    Ok(Json(host))
}

#[derive(Debug, Deserialize)]
pub struct UpdateHostRequest {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub auth_mode: Option<AuthMode>,
    pub disabled_managers: Option<Vec<String>>,
    pub exclude_from_bulk: Option<bool>,
    // Credentials: omitted = keep, "(stored)" = keep, "" = clear,
    // anything else = replace.
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub key_passphrase: Option<String>,
    pub sudo_password: Option<String>,
}

pub async fn update_host(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    Json(request): Json<UpdateHostRequest>,
) -> ApiResult<Json<Host>> {
    let existing = state
        .database
        .get_host(&host_id)
        .await?
        .ok_or_else(|| not_found("host"))?;

    state
        .database
        .update_host_settings(
            &host_id,
            request.name.as_deref().unwrap_or(&existing.name),
            request.hostname.as_deref().unwrap_or(&existing.hostname),
            request.port.unwrap_or(existing.port),
            request.username.as_deref().unwrap_or(&existing.username),
            request.auth_mode.unwrap_or(existing.auth_mode),
            request
                .disabled_managers
                .as_deref()
                .unwrap_or(&existing.disabled_managers),
            request.exclude_from_bulk.unwrap_or(existing.exclude_from_bulk),
        )
        .await?;

    let credentials = [
        (CredentialKind::Password, request.password.as_deref()),
        (CredentialKind::PrivateKey, request.private_key.as_deref()),
        (CredentialKind::KeyPassphrase, request.key_passphrase.as_deref()),
        (CredentialKind::SudoPassword, request.sudo_password.as_deref()),
    ];
    for (kind, value) in credentials {
        state
            .database
            .apply_host_credential(&host_id, kind, value, &state.vault)
            .await?;
    }

    let host = state
        .database
        .get_host(&host_id)
        .await?
        .ok_or_else(|| not_found("host"))?;
    Ok(Json(host))
}

pub async fn delete_host(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.database.delete_host(&host_id).await? {
        return Err(not_found("host"));
    }
    state.orchestrator.forget_host(&host_id).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn host_status(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let host = state
        .database
        .get_host(&host_id)
        .await?
        .ok_or_else(|| not_found("host"))?;
    let update_count = state.database.cached_update_count(&host_id).await?;
    let active = state.orchestrator.active_operation(&host_id);
    Ok(Json(json!({
        "host": host,
        "update_count": update_count,
        "active_operation": active,
    })))
}

// ----------------------------------------------------------------------
// Jobs
// ----------------------------------------------------------------------

fn spawn_job<F>(
    state: &AppState,
    host_id: Option<&str>,
    action: &str,
    work: F,
) -> Json<serde_json::Value>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let job_id = state.jobs.create(host_id, action);
    let jobs = state.jobs.clone();
    let id = job_id.clone();
    tokio::spawn(async move {
        let error = work.await.err().map(|e| sanitize(&format!("{e:#}")));
        jobs.complete(&id, error);
    });
    Json(json!({ "job_id": job_id }))
}

pub async fn start_check(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Json<serde_json::Value> {
    let orchestrator = state.orchestrator.clone();
    let id = host_id.clone();
    spawn_job(&state, Some(&host_id), "check", async move {
        orchestrator.check(&id).await.map(|_| ())
    })
}

pub async fn start_upgrade(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Json<serde_json::Value> {
    let orchestrator = state.orchestrator.clone();
    let id = host_id.clone();
    spawn_job(&state, Some(&host_id), "upgrade_all", async move {
        orchestrator.upgrade_all(&id).await
    })
}

pub async fn start_full_upgrade(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Json<serde_json::Value> {
    let orchestrator = state.orchestrator.clone();
    let id = host_id.clone();
    spawn_job(&state, Some(&host_id), "full_upgrade_all", async move {
        orchestrator.full_upgrade_all(&id).await
    })
}

pub async fn start_package_upgrade(
    State(state): State<AppState>,
    Path((host_id, package)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    let orchestrator = state.orchestrator.clone();
    let id = host_id.clone();
    spawn_job(&state, Some(&host_id), "upgrade_package", async move {
        orchestrator.upgrade_package(&id, &package).await
    })
}

pub async fn start_reboot(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Json<serde_json::Value> {
    let orchestrator = state.orchestrator.clone();
    let id = host_id.clone();
    spawn_job(&state, Some(&host_id), "reboot", async move {
        orchestrator.reboot(&id).await
    })
}

pub async fn start_check_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    let orchestrator = state.orchestrator.clone();
    spawn_job(&state, None, "check_all", async move {
        orchestrator.check_all().await.map(|_| ())
    })
}

pub async fn start_upgrade_all_hosts(State(state): State<AppState>) -> Json<serde_json::Value> {
    let orchestrator = state.orchestrator.clone();
    spawn_job(&state, None, "upgrade_all_hosts", async move {
        orchestrator.upgrade_all_hosts().await
    })
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<crate::web::jobs::JobRecord>> {
    state
        .jobs
        .get(&job_id)
        .map(Json)
        .ok_or_else(|| not_found("job"))
}

// ----------------------------------------------------------------------
// Updates and history
// ----------------------------------------------------------------------

pub async fn host_updates(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let updates = state.database.cached_updates(&host_id).await?;
    Ok(Json(json!({ "updates": updates })))
}

pub async fn all_updates(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let mut per_host = Vec::new();
    for host in state.database.list_hosts().await? {
        let updates = state.database.cached_updates(&host.id).await?;
        per_host.push(json!({
            "host_id": host.id,
            "host_name": host.name,
            "updates": updates,
        }));
    }
    Ok(Json(json!({ "hosts": per_host })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    100
}

pub async fn host_history(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let history = state.database.host_history(&host_id, query.limit).await?;
    Ok(Json(json!({ "history": history })))
}

// ----------------------------------------------------------------------
// Notification channels
// ----------------------------------------------------------------------

async fn validate_channel_input(input: &ChannelInput) -> Result<(), ApiError> {
    if !matches!(input.provider.as_str(), "email" | "http_push") {
        return Err(bad_request(format!(
            "unknown provider type {:?}",
            input.provider
        )));
    }
    if input.provider == "http_push" {
        let base = input
            .config
            .get("base_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| bad_request("http_push config requires base_url"))?;
        let topic = input.config.get("topic").and_then(|v| v.as_str()).unwrap_or("");
        let url = if topic.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base.trim_end_matches('/'), topic)
        };
        validate_outbound_url(&url).await?;
    }
    Ok(())
}

pub async fn list_channels(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let channels = state.notifier.list_channels_masked().await?;
    Ok(Json(json!({ "channels": channels })))
}

pub async fn create_channel(
    State(state): State<AppState>,
    Json(input): Json<ChannelInput>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    validate_channel_input(&input).await?;
    let channel = state.notifier.create_channel(input).await?;
    Ok((StatusCode::CREATED, Json(json!({ "channel": channel }))))
}

pub async fn update_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(input): Json<ChannelInput>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_channel_input(&input).await?;
    let channel = state.notifier.update_channel(&channel_id, input).await?;
    Ok(Json(json!({ "channel": channel })))
}

pub async fn delete_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.database.delete_channel(&channel_id).await? {
        return Err(not_found("channel"));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn test_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.notifier.test_channel(&channel_id).await?;
    Ok(Json(json!({ "delivered": true })))
}

// ----------------------------------------------------------------------
// Live output (WebSocket)
// ----------------------------------------------------------------------

pub async fn live_output(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let bus = state.bus.clone();
    ws.on_upgrade(move |socket| forward_live_output(socket, bus, host_id))
}

async fn forward_live_output(mut socket: WebSocket, bus: Arc<LiveBus>, host_id: String) {
    let mut events = bus.subscribe(&host_id).await;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                // No client -> server protocol; any close ends the stream.
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!("Live output stream for {} closed", host_id);
}
