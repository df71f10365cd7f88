//! Delivery service contract
//!
//! The SDK never moves bytes itself. Every download handle talks to a
//! [`DeliveryService`], either the agent's REST endpoint or the in-process
//! engine.

mod agent;

pub use agent::*;

use crate::engine::LocalDeliveryService;
use crate::error::DoError;
use crate::property::WireValue;
use async_trait::async_trait;
use dosdk_types::{DownloadId, DownloadProperty, DownloadStatus, Settings};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Operations the SDK needs from a delivery service
#[async_trait]
pub trait DeliveryService: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Register a transfer of `uri` into `path`
    async fn create(&self, uri: &str, path: &Path) -> Result<DownloadId, DoError>;

    /// Begin or resume the transfer; returns without waiting for it
    async fn start(&self, id: &DownloadId) -> Result<(), DoError>;

    /// Request a pause; the service may honor it later
    async fn pause(&self, id: &DownloadId) -> Result<(), DoError>;

    /// Commit a transferred download
    async fn finalize(&self, id: &DownloadId) -> Result<(), DoError>;

    /// Cancel the transfer and discard partial data
    async fn abort(&self, id: &DownloadId) -> Result<(), DoError>;

    async fn get_status(&self, id: &DownloadId) -> Result<DownloadStatus, DoError>;

    async fn set_property(
        &self,
        id: &DownloadId,
        property: DownloadProperty,
        value: WireValue,
    ) -> Result<(), DoError>;

    async fn get_property(
        &self,
        id: &DownloadId,
        property: DownloadProperty,
    ) -> Result<WireValue, DoError>;

    /// Push-based status stream, if the service has one.
    ///
    /// Handles fall back to polling `get_status` when this returns `None`.
    fn subscribe(&self, _id: &DownloadId) -> Option<broadcast::Receiver<DownloadStatus>> {
        None
    }
}

/// Which service implementation to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// The delivery-optimization agent running on this host
    Agent,
    /// The in-process engine
    Local,
}

/// Build a service from settings
pub async fn connect(
    kind: ServiceKind,
    settings: &Settings,
) -> Result<Arc<dyn DeliveryService>, DoError> {
    match kind {
        ServiceKind::Agent => {
            let agent = AgentService::from_settings(&settings.agent).await?;
            Ok(Arc::new(agent))
        }
        ServiceKind::Local => {
            let local = LocalDeliveryService::new(settings.local.clone())?;
            Ok(Arc::new(local))
        }
    }
}
