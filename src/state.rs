use crate::config::Config;
use crate::devicehub::{DeviceHubClient, DeviceHubConnection};
use crate::error::WorkbenchError;
use crate::settings::SettingsStore;
use crate::store::SnapshotStore;
use crate::uploader::{UploadContext, Uploader};
use crate::usb::UsbRegistry;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Application state shared across handlers
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SnapshotStore>,
    pub usbs: Arc<UsbRegistry>,
    pub settings: Arc<SettingsStore>,
    /// Set by a DeviceHubClient through `/info`
    pub devicehub: Arc<RwLock<Option<DeviceHubConnection>>>,
    pub attempts: Arc<AtomicU64>,
    pub uploader: Uploader,
}

impl AppState {
    /// Open the stores under the configured folder and start the uploader.
    pub async fn build(
        config: Arc<Config>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, WorkbenchError> {
        config.ensure_dirs().await?;

        let store = Arc::new(SnapshotStore::load(config.store_dir()).await?);
        let usbs = Arc::new(UsbRegistry::load(config.settings_dir().join("names.json")).await?);
        let settings = Arc::new(
            SettingsStore::load(config.settings_dir().join("config.json"), config.images_dir())
                .await?,
        );
        let devicehub = Arc::new(RwLock::new(None));
        let attempts = Arc::new(AtomicU64::new(0));

        let client = DeviceHubClient::new(Duration::from_secs(config.devicehub_timeout_secs))
            .map_err(|e| WorkbenchError::Internal(e.to_string()))?;

        let uploader = Uploader::new(
            UploadContext {
                store: store.clone(),
                usbs: usbs.clone(),
                settings: settings.clone(),
                devicehub: devicehub.clone(),
                attempts: attempts.clone(),
                client,
                export_dir: config.export_dir(),
                retry_delays: config
                    .upload_retry_delays
                    .iter()
                    .map(|secs| Duration::from_secs(*secs))
                    .collect(),
            },
            config.upload_queue_size,
            cancel,
        );

        Ok(Arc::new(Self {
            config,
            store,
            usbs,
            settings,
            devicehub,
            attempts,
            uploader,
        }))
    }
}
