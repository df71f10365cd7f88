//! Download handle
//!
//! A [`Download`] wraps one transfer owned by a delivery service. Dropping the
//! handle stops callback delivery but leaves the transfer to the service.

use crate::dispatcher::{CallbackSlot, Command, Dispatcher};
use crate::error::DoError;
use crate::property::{validate, PropertyValue, ToleratedErrors, WireValue};
use crate::service::DeliveryService;
use dosdk_types::{errc, DownloadId, DownloadProperty, DownloadState, DownloadStatus, PropertyKind, Settings};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing knobs of a handle
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub wait_poll_interval: Duration,
    pub callback_poll_interval: Duration,
    pub completion_timeout: Duration,
}

impl DownloadOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            wait_poll_interval: Duration::from_millis(settings.wait_poll_interval_ms),
            callback_poll_interval: Duration::from_millis(settings.callback_poll_interval_ms),
            completion_timeout: Duration::from_secs(settings.completion_timeout_secs),
        }
    }
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Control surface handed to status callbacks.
///
/// Commands are queued and run by the dispatcher once the callback returns,
/// so calling them from inside a callback never re-enters the handle.
#[derive(Clone)]
pub struct DownloadControl {
    id: DownloadId,
    commands: mpsc::UnboundedSender<Command>,
    latest: watch::Receiver<DownloadStatus>,
}

impl DownloadControl {
    pub fn id(&self) -> &DownloadId {
        &self.id
    }

    pub fn pause(&self) -> Result<(), DoError> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), DoError> {
        self.send(Command::Resume)
    }

    pub fn abort(&self) -> Result<(), DoError> {
        self.send(Command::Abort)
    }

    /// Latest snapshot the dispatcher has seen
    pub fn get_status(&self) -> DownloadStatus {
        self.latest.borrow().clone()
    }

    pub(crate) fn send(&self, command: Command) -> Result<(), DoError> {
        self.commands
            .send(command)
            .map_err(|_| DoError::InvalidState(format!("handle of {} is closed", self.id)))
    }
}

/// Handle to one download
pub struct Download {
    id: DownloadId,
    /// Last source and destination accepted by the service
    uri: RwLock<String>,
    path: RwLock<PathBuf>,
    service: Arc<dyn DeliveryService>,
    callback: CallbackSlot,
    control: DownloadControl,
    dispatcher: JoinHandle<()>,
    options: DownloadOptions,
}

impl Download {
    /// Register a new download of `uri` into `path` with the service
    pub async fn new(
        service: Arc<dyn DeliveryService>,
        uri: &str,
        path: impl AsRef<Path>,
    ) -> Result<Self, DoError> {
        Self::with_options(service, uri, path, DownloadOptions::default()).await
    }

    pub async fn with_options(
        service: Arc<dyn DeliveryService>,
        uri: &str,
        path: impl AsRef<Path>,
        options: DownloadOptions,
    ) -> Result<Self, DoError> {
        let path = path.as_ref().to_path_buf();
        if uri.is_empty() {
            return Err(DoError::InvalidArgument("empty uri".to_string()));
        }

        let id = service.create(uri, &path).await?;
        info!("Created download {} via {}: {} -> {}", id, service.name(), uri, path.display());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (latest_tx, latest_rx) = watch::channel(DownloadStatus::new(DownloadState::Created));
        let control = DownloadControl {
            id: id.clone(),
            commands: commands_tx,
            latest: latest_rx,
        };
        let callback: CallbackSlot = Arc::new(RwLock::new(None));

        let dispatcher = Dispatcher::new(
            service.clone(),
            callback.clone(),
            control.clone(),
            commands_rx,
            latest_tx,
            options.callback_poll_interval,
        )
        .spawn();

        Ok(Self {
            id,
            uri: RwLock::new(uri.to_string()),
            path: RwLock::new(path),
            service,
            callback,
            control,
            dispatcher,
            options,
        })
    }

    /// Download `uri` to `path`, blocking until it is finalized
    pub async fn download_url_to_path(
        service: Arc<dyn DeliveryService>,
        uri: &str,
        path: impl AsRef<Path>,
    ) -> Result<(), DoError> {
        let download = Self::new(service, uri, path).await?;
        download.start_and_wait_until_completion().await
    }

    pub fn id(&self) -> &DownloadId {
        &self.id
    }

    pub fn uri(&self) -> String {
        self.uri.read().clone()
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub fn control(&self) -> DownloadControl {
        self.control.clone()
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Begin or resume the transfer without waiting for it
    pub async fn start(&self) -> Result<(), DoError> {
        self.service.start(&self.id).await?;
        info!("Started download {}", self.id);
        self.control.send(Command::Activate)
    }

    /// Request a pause; observe `Paused` through the status
    pub async fn pause(&self) -> Result<(), DoError> {
        self.service.pause(&self.id).await?;
        info!("Pause requested for download {}", self.id);
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), DoError> {
        self.start().await
    }

    pub async fn finalize(&self) -> Result<(), DoError> {
        self.service.finalize(&self.id).await?;
        info!("Finalized download {}", self.id);
        Ok(())
    }

    pub async fn abort(&self) -> Result<(), DoError> {
        self.service.abort(&self.id).await?;
        info!("Aborted download {}", self.id);
        Ok(())
    }

    /// Fresh status from the service
    pub async fn get_status(&self) -> Result<DownloadStatus, DoError> {
        self.service.get_status(&self.id).await
    }

    /// Validate and apply a property.
    ///
    /// Callbacks stay in this process; everything else goes to the service.
    pub async fn set_property(
        &self,
        property: DownloadProperty,
        value: impl Into<PropertyValue>,
    ) -> Result<(), DoError> {
        let value = value.into();
        validate(property, &value)?;

        let wire = match value {
            PropertyValue::Callback(callback) => {
                *self.callback.write() = Some(callback);
                debug!("Status callback registered on {}", self.id);
                return Ok(());
            }
            other => other.to_wire().ok_or_else(|| {
                DoError::InvalidArgument(format!("{} has no wire representation", property))
            })?,
        };

        debug!("Setting {} on {}", property, self.id);
        self.service.set_property(&self.id, property, wire.clone()).await?;

        match (property, wire) {
            (DownloadProperty::Uri, WireValue::String(uri)) => *self.uri.write() = uri,
            (DownloadProperty::DownloadFilePath, WireValue::String(path)) => {
                *self.path.write() = PathBuf::from(path)
            }
            _ => {}
        }
        Ok(())
    }

    /// Like [`set_property`](Self::set_property) but returns the numeric code
    pub async fn set_property_nothrow(
        &self,
        property: DownloadProperty,
        value: impl Into<PropertyValue>,
    ) -> i32 {
        match self.set_property(property, value).await {
            Ok(()) => errc::S_OK,
            Err(e) => {
                debug!("Setting {} on {} failed: {}", property, self.id, e);
                e.code()
            }
        }
    }

    /// Set a property, accepting the failure codes listed in `tolerated`.
    ///
    /// Returns the code of the accepted outcome, `S_OK` on success.
    pub async fn set_property_tolerant(
        &self,
        property: DownloadProperty,
        value: impl Into<PropertyValue>,
        tolerated: &ToleratedErrors,
    ) -> Result<i32, DoError> {
        match self.set_property(property, value).await {
            Ok(()) => Ok(errc::S_OK),
            Err(e) if tolerated.is_tolerated(property, e.code()) => {
                warn!("{} not applied to {}, continuing: {}", property, self.id, e);
                Ok(e.code())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_property(&self, property: DownloadProperty) -> Result<PropertyValue, DoError> {
        if property.expected_kind() == PropertyKind::Callback {
            return Err(DoError::InvalidArgument(format!("{} cannot be read", property)));
        }
        let value = self.service.get_property(&self.id, property).await?;
        Ok(value.into())
    }

    /// Start and block until the download is finalized
    pub async fn start_and_wait_until_completion(&self) -> Result<(), DoError> {
        self.start_and_wait_until_completion_with(
            &CancellationToken::new(),
            self.options.completion_timeout,
        )
        .await
    }

    /// Start and block until finalized, `cancel` fires or `timeout` elapses.
    ///
    /// Failed, cancelled and timed out downloads are aborted before returning.
    pub async fn start_and_wait_until_completion_with(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), DoError> {
        self.start().await?;
        let deadline = Instant::now() + timeout;

        loop {
            let status = self.get_status().await?;
            debug!("Waiting on {}: {}", self.id, status);

            match status.state {
                DownloadState::Transferred => {
                    self.finalize().await?;
                    return Ok(());
                }
                DownloadState::Finalized => return Ok(()),
                DownloadState::Aborted => return Err(DoError::Cancelled),
                DownloadState::Paused if status.is_error() && !status.is_transient_error() => {
                    self.abort_quietly().await;
                    return Err(DoError::Transfer {
                        code: status.error_code,
                        extended_code: status.extended_error_code,
                    });
                }
                _ => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.abort_quietly().await;
                return Err(DoError::Timeout);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.abort_quietly().await;
                    return Err(DoError::Cancelled);
                }
                _ = tokio::time::sleep(self.options.wait_poll_interval.min(remaining)) => {}
            }
        }
    }

    /// Poll until the download reaches `state`
    pub async fn wait_for_state(
        &self,
        state: DownloadState,
        timeout: Duration,
    ) -> Result<DownloadStatus, DoError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.get_status().await?;
            if status.state == state {
                return Ok(status);
            }
            if status.state.is_terminal() {
                return Err(DoError::InvalidState(format!(
                    "download {} is {} while waiting for {}",
                    self.id, status.state, state
                )));
            }
            if Instant::now() >= deadline {
                return Err(DoError::Timeout);
            }
            tokio::time::sleep(self.options.wait_poll_interval.min(Duration::from_millis(100))).await;
        }
    }

    async fn abort_quietly(&self) {
        if let Err(e) = self.abort().await {
            warn!("Failed to abort download {}: {}", self.id, e);
        }
    }
}

impl Drop for Download {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
