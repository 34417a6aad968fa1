//! Background sender of finished snapshots to DeviceHub

use crate::devicehub::{DeviceHubClient, DeviceHubConnection, DeviceHubError};
use crate::error::WorkbenchError;
use crate::settings::SettingsStore;
use crate::snapshot::Document;
use crate::store::{write_atomic, SnapshotStore};
use crate::usb::UsbRegistry;
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Uploads running at the same time.
const MAX_CONCURRENT_UPLOADS: usize = 4;

/// What asked for an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A patch, a tag, a USB or a settings change. Failed uploads stay put.
    Automatic,
    /// A new DeviceHub connection. Failed uploads are tried again.
    Reconnect,
    /// Requested by a user: skips the link and USB conditions
    Manual,
}

/// An upload request
#[derive(Debug, Clone, Copy)]
pub struct UploadJob {
    pub uuid: Uuid,
    pub trigger: Trigger,
}

/// Everything an upload touches.
pub struct UploadContext {
    pub store: Arc<SnapshotStore>,
    pub usbs: Arc<UsbRegistry>,
    pub settings: Arc<SettingsStore>,
    pub devicehub: Arc<RwLock<Option<DeviceHubConnection>>>,
    /// POSTs attempted so far, successful or not
    pub attempts: Arc<AtomicU64>,
    pub client: DeviceHubClient,
    pub export_dir: PathBuf,
    pub retry_delays: Vec<Duration>,
}

impl UploadContext {
    /// Whether `uuid` should be uploaded for `trigger`.
    async fn is_ready(&self, uuid: &Uuid, trigger: Trigger) -> bool {
        let Some(snapshot) = self.store.get(uuid).await else {
            return false;
        };
        match trigger {
            Trigger::Manual => return snapshot.is_ready(false, false),
            Trigger::Automatic if snapshot.upload_error().is_some() => return false,
            _ => {}
        }
        let link = self.settings.get().await.link;
        let usb = link && self.usbs.plugged_for(uuid).await;
        snapshot.is_ready(link, usb)
    }
}

pub struct Uploader {
    job_tx: mpsc::Sender<UploadJob>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    ctx: Arc<UploadContext>,
}

impl Uploader {
    /// Start the upload loop. It stops when `cancel` fires.
    pub fn new(ctx: UploadContext, queue_size: usize, cancel: CancellationToken) -> Self {
        let (job_tx, mut job_rx) = mpsc::channel::<UploadJob>(queue_size);
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_UPLOADS));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let ctx = Arc::new(ctx);

        let loop_ctx = ctx.clone();
        let loop_in_flight = in_flight.clone();
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Uploader stopping");
                        break;
                    }
                    job = job_rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                // Only pull the next job once there is capacity for it
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };

                let ctx = loop_ctx.clone();
                let in_flight = loop_in_flight.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    process(&ctx, job).await;
                    in_flight.lock().await.remove(&job.uuid);
                });
            }
        });

        Self {
            job_tx,
            in_flight,
            ctx,
        }
    }

    /// Queue an upload. Returns false when it was already queued or the
    /// queue is full.
    pub async fn enqueue(&self, job: UploadJob) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        if !in_flight.insert(job.uuid) {
            debug!(uuid = %job.uuid, "Upload already queued");
            return false;
        }

        if let Err(e) = self.job_tx.try_send(job) {
            in_flight.remove(&job.uuid);
            warn!(uuid = %job.uuid, error = %e, "Upload queue rejected job");
            return false;
        }

        debug!(uuid = %job.uuid, trigger = ?job.trigger, "Upload queued");
        true
    }

    /// Queue `uuid` if it is ready to go.
    pub async fn enqueue_if_ready(&self, uuid: Uuid) -> bool {
        self.enqueue_for(uuid, Trigger::Automatic).await
    }

    async fn enqueue_for(&self, uuid: Uuid, trigger: Trigger) -> bool {
        if !self.ctx.is_ready(&uuid, trigger).await {
            return false;
        }
        self.enqueue(UploadJob { uuid, trigger }).await
    }

    /// Queue every snapshot that is ready. Used when a condition shared by
    /// all snapshots changes: a USB, the settings or the DeviceHub connection.
    pub async fn enqueue_ready(&self, trigger: Trigger) -> usize {
        let mut queued = 0;
        for snapshot in self.ctx.store.list().await {
            if snapshot.is_uploaded() {
                continue;
            }
            if let Ok(uuid) = Uuid::parse_str(snapshot.uuid()) {
                if self.enqueue_for(uuid, trigger).await {
                    queued += 1;
                }
            }
        }
        if queued > 0 {
            info!(queued, "Queued ready snapshots for upload");
        }
        queued
    }

    /// User-requested upload of a finished snapshot.
    pub async fn retry(&self, uuid: Uuid) -> Result<(), WorkbenchError> {
        let snapshot = self
            .ctx
            .store
            .get(&uuid)
            .await
            .ok_or_else(|| WorkbenchError::SnapshotNotFound(uuid.to_string()))?;

        if snapshot.is_uploaded() {
            return Err(WorkbenchError::Conflict(format!(
                "snapshot {uuid} is already uploaded"
            )));
        }
        if !snapshot.is_ready(false, false) {
            return Err(WorkbenchError::Conflict(format!(
                "snapshot {uuid} has {} of {} phases",
                snapshot.phases(),
                snapshot.total_phases()
            )));
        }
        if self.ctx.devicehub.read().await.is_none() {
            return Err(WorkbenchError::Conflict(
                "no DeviceHub connection has been set".into(),
            ));
        }

        let job = UploadJob {
            uuid,
            trigger: Trigger::Manual,
        };
        if !self.enqueue(job).await {
            return Err(WorkbenchError::Conflict(format!(
                "snapshot {uuid} could not be queued"
            )));
        }
        Ok(())
    }
}

async fn process(ctx: &UploadContext, job: UploadJob) {
    if !ctx.is_ready(&job.uuid, job.trigger).await {
        debug!(uuid = %job.uuid, "Snapshot no longer ready, skipping upload");
        return;
    }

    let Some(conn) = ctx.devicehub.read().await.clone() else {
        info!(uuid = %job.uuid, "Snapshot ready, waiting for a DeviceHub connection");
        return;
    };

    let Some(snapshot) = ctx.store.get(&job.uuid).await else {
        return;
    };
    let document = snapshot.export();

    match write_export(&ctx.export_dir, &job.uuid, &document).await {
        Ok(path) => info!(uuid = %job.uuid, path = ?path, "Snapshot exported"),
        Err(e) => {
            error!(uuid = %job.uuid, error = %e, "Failed to export snapshot");
            record_failure(ctx, &job.uuid, None, e.to_string()).await;
            return;
        }
    }

    match deliver(ctx, &conn, &job.uuid, &document).await {
        Ok(()) => {
            info!(uuid = %job.uuid, url = %conn.snapshot_url(), "Snapshot uploaded");
            if let Err(e) = ctx
                .store
                .update(&job.uuid, |s| s.mark_uploaded(Utc::now()))
                .await
            {
                error!(uuid = %job.uuid, error = %e, "Failed to mark snapshot as uploaded");
            }
        }
        Err(e) => {
            error!(uuid = %job.uuid, error = %e, "Snapshot upload failed after all retries");
            record_failure(ctx, &job.uuid, e.status(), e.response()).await;
        }
    }
}

async fn record_failure(ctx: &UploadContext, uuid: &Uuid, status: Option<u16>, response: String) {
    if let Err(e) = ctx
        .store
        .update(uuid, |s| s.mark_failed(status, response, Utc::now()))
        .await
    {
        error!(uuid = %uuid, error = %e, "Failed to record upload failure");
    }
}

/// POST with retries, waiting each of `retry_delays` between attempts.
async fn deliver(
    ctx: &UploadContext,
    conn: &DeviceHubConnection,
    uuid: &Uuid,
    document: &Document,
) -> Result<(), DeviceHubError> {
    for (attempt, delay) in ctx.retry_delays.iter().enumerate() {
        ctx.attempts.fetch_add(1, Ordering::Relaxed);
        match ctx.client.post_snapshot(conn, document).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    uuid = %uuid,
                    attempt = attempt + 1,
                    error = %e,
                    "Upload attempt failed, retrying"
                );
                tokio::time::sleep(*delay).await;
            }
        }
    }

    // Final attempt after the last backoff
    ctx.attempts.fetch_add(1, Ordering::Relaxed);
    ctx.client.post_snapshot(conn, document).await
}

/// Write the exported document as `<YYYYMMDD-HHMMSS>_<uuid>.json`.
///
/// Only the latest export of a snapshot is kept: older files for the same
/// uuid are removed once the new one is in place.
async fn write_export(dir: &Path, uuid: &Uuid, document: &Document) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let suffix = format!("_{uuid}.json");
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("{timestamp}{suffix}"));
    write_atomic(&path, &serde_json::to_vec_pretty(document)?).await?;

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if entry.path() != path && name.to_string_lossy().ends_with(&suffix) {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(path)
}
