//! Transfer registry of the in-process service

use crate::engine::{BandwidthArbiter, Transfer, TransferTask};
use crate::error::DoError;
use crate::property::WireValue;
use crate::service::DeliveryService;
use async_trait::async_trait;
use dosdk_types::{
    DownloadId, DownloadProperty, DownloadState, DownloadStatus, IntegrityCheckInfo,
    LocalServiceSettings, PropertyKind,
};
use parking_lot::RwLock;
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Delivery service running inside the calling process
pub struct LocalDeliveryService {
    transfers: RwLock<HashMap<DownloadId, Arc<Transfer>>>,
    client: Client,
    arbiter: BandwidthArbiter,
    settings: LocalServiceSettings,
    supported: Option<HashSet<DownloadProperty>>,
}

impl LocalDeliveryService {
    pub fn new(settings: LocalServiceSettings) -> Result<Self, DoError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DoError::NoService(format!("failed to build HTTP client: {}", e)))?;

        let supported = settings
            .supported_properties
            .as_ref()
            .map(|props| props.iter().copied().collect());

        Ok(Self {
            transfers: RwLock::new(HashMap::new()),
            client,
            arbiter: BandwidthArbiter::new(&settings),
            settings,
            supported,
        })
    }

    pub fn settings(&self) -> &LocalServiceSettings {
        &self.settings
    }

    pub fn arbiter(&self) -> &BandwidthArbiter {
        &self.arbiter
    }

    /// Number of transfers with a running worker
    pub fn active_transfers(&self) -> usize {
        self.transfers
            .read()
            .values()
            .filter(|t| t.status().state == DownloadState::Transferring)
            .count()
    }

    fn transfer(&self, id: &DownloadId) -> Result<Arc<Transfer>, DoError> {
        self.transfers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DoError::InvalidArgument(format!("unknown download id {}", id)))
    }

    fn check_supported(&self, property: DownloadProperty) -> Result<(), DoError> {
        match &self.supported {
            Some(supported) if !supported.contains(&property) => {
                Err(DoError::UnknownProperty(property.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn spawn_worker(&self, transfer: &Arc<Transfer>) {
        let task = TransferTask::new(
            transfer.clone(),
            self.client.clone(),
            self.arbiter.clone(),
            self.settings.user_agent.clone(),
            Duration::from_secs(self.settings.no_progress_timeout_secs),
            Duration::from_millis(self.settings.retry_delay_ms),
        );

        let mut slot = transfer.task.lock();
        transfer.paused.store(false, Ordering::Release);
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            // A concurrent start won the race
            return;
        }

        transfer.update(|s| {
            s.state = DownloadState::Transferring;
            s.error_code = dosdk_types::errc::S_OK;
            s.extended_error_code = dosdk_types::errc::S_OK;
        });
        *slot = Some(tokio::spawn(task.run()));
    }
}

fn invalid_state(id: &DownloadId, action: &str, state: DownloadState) -> DoError {
    DoError::InvalidState(format!("cannot {} download {} while {}", action, id, state))
}

#[async_trait]
impl DeliveryService for LocalDeliveryService {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self, uri: &str, path: &Path) -> Result<DownloadId, DoError> {
        let url = Url::parse(uri)
            .map_err(|e| DoError::InvalidArgument(format!("invalid uri {}: {}", uri, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DoError::InvalidArgument(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        if path.as_os_str().is_empty() {
            return Err(DoError::InvalidArgument("empty download path".to_string()));
        }

        let id = DownloadId(Uuid::new_v4().to_string());
        let transfer = Arc::new(Transfer::new(id.clone(), uri.to_string(), path.to_path_buf()));
        self.transfers.write().insert(id.clone(), transfer);

        info!("Created download {} for {}", id, uri);
        Ok(id)
    }

    async fn start(&self, id: &DownloadId) -> Result<(), DoError> {
        let transfer = self.transfer(id)?;

        let previous = {
            let mut slot = transfer.task.lock();
            let running = slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
            match transfer.status().state {
                DownloadState::Transferring if running => {
                    // Cancels a pause the worker has not confirmed yet
                    transfer.paused.store(false, Ordering::Release);
                    return Ok(());
                }
                DownloadState::Created | DownloadState::Paused | DownloadState::Transferring => {
                    slot.take()
                }
                state => return Err(invalid_state(id, "start", state)),
            }
        };

        // A worker that confirmed a pause may still be flushing
        if let Some(handle) = previous {
            if let Err(e) = handle.await {
                warn!("Worker of {} ended abnormally: {}", id, e);
            }
        }

        self.spawn_worker(&transfer);
        Ok(())
    }

    async fn pause(&self, id: &DownloadId) -> Result<(), DoError> {
        let transfer = self.transfer(id)?;
        match transfer.status().state {
            DownloadState::Created => {
                transfer.update(|s| s.state = DownloadState::Paused);
                Ok(())
            }
            DownloadState::Transferring => {
                debug!("Pause requested for {}", id);
                transfer.request_pause();
                Ok(())
            }
            DownloadState::Paused => Ok(()),
            state => Err(invalid_state(id, "pause", state)),
        }
    }

    async fn finalize(&self, id: &DownloadId) -> Result<(), DoError> {
        let transfer = self.transfer(id)?;
        match transfer.status().state {
            DownloadState::Transferred => {
                transfer.update(|s| s.state = DownloadState::Finalized);
                info!("Finalized download {}", id);
                Ok(())
            }
            DownloadState::Finalized => Ok(()),
            state => Err(invalid_state(id, "finalize", state)),
        }
    }

    async fn abort(&self, id: &DownloadId) -> Result<(), DoError> {
        let transfer = self.transfer(id)?;
        match transfer.status().state {
            DownloadState::Aborted => return Ok(()),
            DownloadState::Finalized => {
                return Err(invalid_state(id, "abort", DownloadState::Finalized))
            }
            _ => {}
        }

        transfer.cancel.cancel();
        let handle = transfer.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Worker of {} ended abnormally: {}", id, e);
            }
        }

        let path = transfer.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed partial file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }

        transfer.update(|s| s.state = DownloadState::Aborted);
        info!("Aborted download {}", id);
        Ok(())
    }

    async fn get_status(&self, id: &DownloadId) -> Result<DownloadStatus, DoError> {
        Ok(self.transfer(id)?.status())
    }

    async fn set_property(
        &self,
        id: &DownloadId,
        property: DownloadProperty,
        value: WireValue,
    ) -> Result<(), DoError> {
        self.check_supported(property)?;
        if property.is_read_only() {
            return Err(DoError::ReadOnlyProperty(property.to_string()));
        }
        if property.expected_kind() != value.kind() {
            return Err(DoError::InvalidArgument(format!(
                "{} expects a {} value",
                property,
                property.expected_kind()
            )));
        }

        let transfer = self.transfer(id)?;

        match (&property, &value) {
            (DownloadProperty::IntegrityCheckInfo, WireValue::String(json)) => {
                IntegrityCheckInfo::parse(json)
                    .map_err(|e| DoError::InvalidArgument(format!("malformed integrity check info: {}", e)))?;
            }
            (DownloadProperty::Uri | DownloadProperty::DownloadFilePath, _) => {
                let state = transfer.status().state;
                if state != DownloadState::Created {
                    return Err(invalid_state(id, "change the source or destination of", state));
                }
            }
            _ => {}
        }

        debug!("Set {} on {} to {:?}", property, id, value);
        transfer.set_property(property, value);
        Ok(())
    }

    async fn get_property(
        &self,
        id: &DownloadId,
        property: DownloadProperty,
    ) -> Result<WireValue, DoError> {
        self.check_supported(property)?;
        if property.expected_kind() == PropertyKind::Callback {
            return Err(DoError::InvalidArgument(format!(
                "{} has no wire representation",
                property
            )));
        }

        let transfer = self.transfer(id)?;
        match property {
            DownloadProperty::Id => Ok(WireValue::String(id.to_string())),
            DownloadProperty::TotalSizeBytes => Ok(WireValue::UInt64(transfer.status().bytes_total)),
            _ => transfer
                .property(property)
                .ok_or_else(|| DoError::InvalidState(format!("{} is not set on {}", property, id))),
        }
    }

    fn subscribe(&self, id: &DownloadId) -> Option<broadcast::Receiver<DownloadStatus>> {
        self.transfers.read().get(id).map(|t| t.subscribe())
    }
}
