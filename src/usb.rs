//! USB pen-drive registry
//!
//! Tracks the USBs currently plugged into computers being snapshotted and the
//! names users give to them. Names persist across restarts; plugged USBs do
//! not.

use crate::error::WorkbenchError;
use crate::store::write_atomic;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// A plugged USB as reported by the USB watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbRecord {
    /// Serial number
    pub usb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    /// Snapshot of the computer the USB is plugged into, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Uuid>,
    #[serde(rename = "_plugged", default, skip_serializing_if = "Option::is_none")]
    pub plugged: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsbName {
    pub usb: String,
    pub name: String,
}

pub struct UsbRegistry {
    plugged: RwLock<HashMap<String, UsbRecord>>,
    names: RwLock<BTreeMap<String, String>>,
    names_path: PathBuf,
}

impl UsbRegistry {
    pub async fn load(names_path: PathBuf) -> Result<Self, WorkbenchError> {
        let names = match tokio::fs::read(&names_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = ?names_path, error = %e, "Ignoring corrupt USB names file");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            plugged: RwLock::new(HashMap::new()),
            names: RwLock::new(names),
            names_path,
        })
    }

    pub async fn plug(&self, hid: &str, mut record: UsbRecord) -> UsbRecord {
        record.plugged = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        info!(hid, usb = %record.usb, inventory = ?record.inventory, "USB plugged");
        self.plugged
            .write()
            .await
            .insert(hid.to_string(), record.clone());
        record
    }

    pub async fn unplug(&self, hid: &str) -> Result<UsbRecord, WorkbenchError> {
        let record = self
            .plugged
            .write()
            .await
            .remove(hid)
            .ok_or_else(|| WorkbenchError::UsbNotFound(hid.to_string()))?;
        info!(hid, usb = %record.usb, "USB unplugged");
        Ok(record)
    }

    /// Plugged USBs ordered by hardware id.
    pub async fn plugged(&self) -> Vec<(String, UsbRecord)> {
        let mut all: Vec<_> = self
            .plugged
            .read()
            .await
            .iter()
            .map(|(hid, record)| (hid.clone(), record.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Hardware id of the plugged USB with serial `serial`.
    pub async fn hid_of(&self, serial: &str) -> Option<String> {
        self.plugged
            .read()
            .await
            .iter()
            .find(|(_, record)| record.usb == serial)
            .map(|(hid, _)| hid.clone())
    }

    /// Whether a USB is plugged that counts for the snapshot `uuid`.
    ///
    /// A USB reported without an inventory counts for every snapshot.
    pub async fn plugged_for(&self, uuid: &Uuid) -> bool {
        self.plugged
            .read()
            .await
            .values()
            .any(|record| record.inventory.map_or(true, |inv| inv == *uuid))
    }

    pub async fn name(&self, serial: &str, name: &str) -> Result<(), WorkbenchError> {
        let mut names = self.names.write().await;
        names.insert(serial.to_string(), name.to_string());
        self.persist_names(&names).await
    }

    pub async fn unname(&self, serial: &str) -> Result<(), WorkbenchError> {
        let mut names = self.names.write().await;
        if names.remove(serial).is_none() {
            return Err(WorkbenchError::UsbNotFound(serial.to_string()));
        }
        self.persist_names(&names).await
    }

    pub async fn names(&self) -> Vec<UsbName> {
        self.names
            .read()
            .await
            .iter()
            .map(|(usb, name)| UsbName {
                usb: usb.clone(),
                name: name.clone(),
            })
            .collect()
    }

    /// Plugged USBs as `/info` reports them: each record with its `hid`.
    pub async fn info_list(&self) -> Vec<Value> {
        self.plugged()
            .await
            .into_iter()
            .map(|(hid, record)| {
                let mut value = to_object(&record);
                value.insert("hid".into(), Value::String(hid));
                Value::Object(value)
            })
            .collect()
    }

    /// Plugged USBs in the dashboard's list format: `usb` renamed to
    /// `serial` and the hardware id as `id`.
    pub async fn vuejs_list(&self) -> Vec<Value> {
        self.plugged()
            .await
            .into_iter()
            .map(|(hid, record)| {
                let mut value = to_object(&record);
                if let Some(serial) = value.remove("usb") {
                    value.insert("serial".into(), serial);
                }
                value.insert("id".into(), Value::String(hid));
                Value::Object(value)
            })
            .collect()
    }

    /// Plugged USBs keyed by hardware id.
    pub async fn keyed_list(&self) -> Map<String, Value> {
        self.plugged()
            .await
            .into_iter()
            .map(|(hid, record)| (hid, Value::Object(to_object(&record))))
            .collect()
    }

    async fn persist_names(&self, names: &BTreeMap<String, String>) -> Result<(), WorkbenchError> {
        write_atomic(&self.names_path, &serde_json::to_vec_pretty(names)?).await?;
        Ok(())
    }
}

fn to_object(record: &UsbRecord) -> Map<String, Value> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
