//! HTTP handlers for the Workbench REST API

use crate::devicehub::DeviceHubConnection;
use crate::error::WorkbenchError;
use crate::extract::{AppJson, AppPath, AppQuery};
use crate::settings::Settings;
use crate::snapshot::PatchKind;
use crate::state::AppState;
use crate::uploader::Trigger;
use crate::usb::UsbRecord;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "workbench-server"
    }))
}

/// DeviceHub connection parameters a DeviceHubClient passes to `/info`.
#[derive(Debug, Default, Deserialize)]
pub struct InfoQuery {
    #[serde(alias = "device-hub")]
    pub device_hub: Option<String>,
    pub db: Option<String>,
}

/// Server status: plugged USBs, their names and every snapshot.
///
/// With `device_hub` and `db` in the query it also sets the DeviceHub
/// connection, using the request's `Authorization` header as token.
#[instrument(skip(state, headers))]
pub async fn info(
    State(state): State<Arc<AppState>>,
    AppQuery(query): AppQuery<InfoQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, WorkbenchError> {
    if let (Some(url), Some(db)) = (query.device_hub, query.db) {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let conn = DeviceHubConnection { url, db, token };

        let changed = {
            let mut current = state.devicehub.write().await;
            let changed = current.as_ref() != Some(&conn);
            *current = Some(conn);
            changed
        };
        if changed {
            info!("DeviceHub connection set");
            state.uploader.enqueue_ready(Trigger::Reconnect).await;
        }
    }

    let snapshots: Vec<Value> = state
        .store
        .list()
        .await
        .into_iter()
        .map(|s| Value::Object(s.document().clone()))
        .collect();

    Ok(Json(serde_json::json!({
        "attempts": state.attempts.load(Ordering::Relaxed),
        "ip": state.config.ip(),
        "names": state.usbs.names().await,
        "snapshots": snapshots,
        "usbs": state.usbs.info_list().await,
    })))
}

pub async fn get_config(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, WorkbenchError> {
    Ok(Json(state.settings.view().await?))
}

#[instrument(skip(state))]
pub async fn post_config(
    State(state): State<Arc<AppState>>,
    AppJson(settings): AppJson<Settings>,
) -> Result<StatusCode, WorkbenchError> {
    state.settings.set(settings).await?;
    state.uploader.enqueue_ready(Trigger::Automatic).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_snapshots(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshots: Vec<Value> = state
        .store
        .list()
        .await
        .into_iter()
        .map(|s| Value::Object(s.document().clone()))
        .collect();
    Json(snapshots)
}

pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    AppPath(uuid): AppPath<Uuid>,
) -> Result<impl IntoResponse, WorkbenchError> {
    let snapshot = state
        .store
        .get(&uuid)
        .await
        .ok_or_else(|| WorkbenchError::SnapshotNotFound(uuid.to_string()))?;
    Ok(Json(snapshot))
}

/// Workbench reports a phase, or a link signal, for a computer.
#[instrument(skip(state, patch))]
pub async fn patch_snapshot(
    State(state): State<Arc<AppState>>,
    AppPath(uuid): AppPath<Uuid>,
    AppJson(patch): AppJson<Value>,
) -> Result<StatusCode, WorkbenchError> {
    let total_phases = state.settings.get().await.total_phases();
    let (snapshot, kind) = state.store.patch(uuid, patch, total_phases).await?;

    info!(
        kind = ?kind,
        phases = snapshot.phases(),
        total = snapshot.total_phases(),
        linked = snapshot.is_linked(),
        "Snapshot patched"
    );

    if let PatchKind::Phase(phases) = kind {
        if phases == snapshot.total_phases() {
            info!("All phases received");
        }
    }

    state.uploader.enqueue_if_ready(uuid).await;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    AppPath(uuid): AppPath<Uuid>,
) -> Result<StatusCode, WorkbenchError> {
    state.store.remove(&uuid).await?;
    info!("Snapshot deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Manually (re)upload a finished snapshot.
#[instrument(skip(state))]
pub async fn upload_snapshot(
    State(state): State<Arc<AppState>>,
    AppPath(uuid): AppPath<Uuid>,
) -> Result<StatusCode, WorkbenchError> {
    state.uploader.retry(uuid).await?;
    Ok(StatusCode::ACCEPTED)
}

#[instrument(skip(state, record))]
pub async fn plug_usb(
    State(state): State<Arc<AppState>>,
    AppPath(hid): AppPath<String>,
    AppJson(record): AppJson<UsbRecord>,
) -> Result<StatusCode, WorkbenchError> {
    state.usbs.plug(&hid, record).await;
    state.uploader.enqueue_ready(Trigger::Automatic).await;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn unplug_usb(
    State(state): State<Arc<AppState>>,
    AppPath(hid): AppPath<String>,
) -> Result<StatusCode, WorkbenchError> {
    state.usbs.unplug(&hid).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct NameBody {
    pub name: String,
}

#[instrument(skip(state))]
pub async fn name_usb(
    State(state): State<Arc<AppState>>,
    AppPath(serial): AppPath<String>,
    AppJson(body): AppJson<NameBody>,
) -> Result<StatusCode, WorkbenchError> {
    if body.name.trim().is_empty() {
        return Err(WorkbenchError::ValidationError("name cannot be empty".into()));
    }
    state.usbs.name(&serial, body.name.trim()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn unname_usb(
    State(state): State<Arc<AppState>>,
    AppPath(serial): AppPath<String>,
) -> Result<StatusCode, WorkbenchError> {
    state.usbs.unname(&serial).await?;
    Ok(StatusCode::NO_CONTENT)
}
