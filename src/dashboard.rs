//! Dashboard API: tag computers, edit `config.ini`, list USBs and inventories
//!
//! Every endpoint answers JSON with an `acknowledge` flag, which is what the
//! dashboard front-end checks.

use crate::config_ini;
use crate::error::WorkbenchError;
use crate::extract::{AppJson, AppQuery};
use crate::snapshot::{Document, SnapshotState};
use crate::state::AppState;
use crate::uploader::Trigger;
use crate::usb::UsbRecord;
use axum::{
    extract::State,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct InventoryQuery {
    pub inventory: Uuid,
}

/// Identifiers a user reads from the stickers on a computer.
#[derive(Debug, Default, Deserialize)]
pub struct TagForm {
    pub id_: Option<String>,
    pub label: Option<String>,
    pub pid: Option<String>,
    pub gid: Option<String>,
}

impl TagForm {
    /// Non-empty identifiers keyed as they go into `device`.
    fn device_fields(&self) -> Document {
        [
            ("_id", &self.id_),
            ("label", &self.label),
            ("pid", &self.pid),
            ("gid", &self.gid),
        ]
        .into_iter()
        .filter_map(|(key, value)| {
            let value = value.as_deref()?.trim();
            (!value.is_empty()).then(|| (key.to_string(), Value::String(value.to_string())))
        })
        .collect()
    }
}

#[instrument(skip(state))]
pub async fn tag_computer(
    State(state): State<Arc<AppState>>,
    AppQuery(query): AppQuery<InventoryQuery>,
    AppJson(form): AppJson<TagForm>,
) -> Result<Json<Value>, WorkbenchError> {
    let fields = form.device_fields();
    if fields.is_empty() {
        return Err(WorkbenchError::ValidationError(
            "at least one of id_, label, pid or gid is required".into(),
        ));
    }

    let identifiers: Vec<&str> = ["label", "pid", "_id"]
        .iter()
        .filter_map(|key| fields.get(*key).and_then(Value::as_str))
        .collect();
    let msg = format!("The computer {} has been tagged", identifiers.join(" - "));

    state.store.tag(&query.inventory, fields).await?;
    info!(inventory = %query.inventory, "Computer tagged");

    state.uploader.enqueue_if_ready(query.inventory).await;

    Ok(Json(json!({ "acknowledge": true, "msg": msg })))
}

pub async fn get_config_ini(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, WorkbenchError> {
    let path = state.config.config_ini.clone();
    let parsed = tokio::task::spawn_blocking(move || config_ini::read(&path))
        .await
        .map_err(|e| WorkbenchError::Internal(e.to_string()))??;

    Ok(Json(json!({
        "acknowledge": true,
        "config": parsed.config,
        "sections": parsed.sections,
        "structure": parsed.structure,
    })))
}

#[instrument(skip(state, changes))]
pub async fn post_config_ini(
    State(state): State<Arc<AppState>>,
    AppJson(changes): AppJson<Map<String, Value>>,
) -> Result<Json<Value>, WorkbenchError> {
    let path = state.config.config_ini.clone();
    tokio::task::spawn_blocking(move || config_ini::edit(&path, changes))
        .await
        .map_err(|e| WorkbenchError::Internal(e.to_string()))??;

    info!(path = ?state.config.config_ini, "config.ini edited");
    Ok(Json(json!({
        "acknowledge": true,
        "msg": "The configuration has been edited",
    })))
}

/// Every snapshot with the inventory bucket its state puts it in.
pub async fn inventories(State(state): State<Arc<AppState>>) -> Json<Value> {
    let inventories: Vec<Value> = state
        .store
        .list()
        .await
        .into_iter()
        .map(|snapshot| {
            let snapshot_state = snapshot.state();
            let mut entry = json!({
                "id": snapshot.uuid(),
                "state": snapshot_state.inventory_label(),
                "json": snapshot.document(),
            });
            if snapshot_state == SnapshotState::UploadFailed {
                entry["response"] = snapshot
                    .upload_error()
                    .and_then(|e| e.get("response"))
                    .cloned()
                    .unwrap_or(Value::Null);
            }
            entry
        })
        .collect();

    Json(json!({ "acknowledge": true, "inventories": inventories }))
}

#[derive(Debug, Default, Deserialize)]
pub struct UsbsQuery {
    pub vuejs: Option<String>,
}

fn truthy(flag: Option<&str>) -> bool {
    !matches!(flag.map(str::trim), None | Some("" | "0" | "false" | "False" | "no"))
}

pub async fn usbs(
    State(state): State<Arc<AppState>>,
    AppQuery(query): AppQuery<UsbsQuery>,
) -> Json<Value> {
    let usbs = if truthy(query.vuejs.as_deref()) {
        Value::Array(state.usbs.vuejs_list().await)
    } else {
        Value::Object(state.usbs.keyed_list().await)
    };
    Json(json!({ "acknowledge": true, "usbs": usbs }))
}

#[derive(Debug, Deserialize)]
pub struct AddUsbQuery {
    pub usb: String,
    pub hid: Option<String>,
    pub inventory: Option<Uuid>,
    pub vendor: Option<String>,
    pub product: Option<String>,
}

#[instrument(skip(state))]
pub async fn add_usb(
    State(state): State<Arc<AppState>>,
    AppQuery(query): AppQuery<AddUsbQuery>,
) -> Json<Value> {
    let hid = query.hid.unwrap_or_else(|| query.usb.clone());
    let record = UsbRecord {
        usb: query.usb,
        vendor: query.vendor,
        product: query.product,
        inventory: query.inventory,
        plugged: None,
    };
    state.usbs.plug(&hid, record).await;
    state.uploader.enqueue_ready(Trigger::Automatic).await;

    Json(json!({ "acknowledge": true }))
}

#[derive(Debug, Deserialize)]
pub struct DelUsbQuery {
    pub hid: Option<String>,
    pub usb: Option<String>,
}

#[instrument(skip(state))]
pub async fn del_usb(
    State(state): State<Arc<AppState>>,
    AppQuery(query): AppQuery<DelUsbQuery>,
) -> Result<Json<Value>, WorkbenchError> {
    let hid = match (query.hid, query.usb) {
        (Some(hid), _) => hid,
        (None, Some(serial)) => state
            .usbs
            .hid_of(&serial)
            .await
            .ok_or(WorkbenchError::UsbNotFound(serial))?,
        (None, None) => {
            return Err(WorkbenchError::ValidationError(
                "hid or usb is required".into(),
            ))
        }
    };
    state.usbs.unplug(&hid).await?;

    Ok(Json(json!({ "acknowledge": true })))
}
