//! DOSDK Core - Delivery Optimization client
//!
//! This crate wraps a delivery-optimization service behind download handles.
//! It validates properties, drives the transfer lifecycle and delivers status
//! callbacks. Bytes are moved by the service: the local agent over REST, or
//! the in-process engine.

mod dispatcher;
mod download;
mod engine;
mod error;
mod property;
mod service;
mod storage;

pub use download::*;
pub use engine::{BandwidthArbiter, LocalDeliveryService, Priority, PriorityGuard, RateLimiter};
pub use error::*;
pub use property::*;
pub use service::*;
pub use storage::*;

pub use dosdk_types::{
    errc, AgentSettings, CompatSettings, DownloadId, DownloadProperty, DownloadState,
    DownloadStatus, IntegrityCheckInfo, LocalServiceSettings, PropertyKind, Settings,
};

use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Entry point tying a delivery service to the loaded settings
pub struct DoClient {
    service: Arc<dyn DeliveryService>,
    settings: Settings,
}

impl DoClient {
    /// Connect to the service of the given kind
    pub async fn connect(kind: ServiceKind, settings: Settings) -> Result<Self, DoError> {
        let service = service::connect(kind, &settings).await?;
        info!("Connected to {} delivery service", service.name());
        Ok(Self { service, settings })
    }

    /// Use an already constructed service
    pub fn with_service(service: Arc<dyn DeliveryService>, settings: Settings) -> Self {
        Self { service, settings }
    }

    pub fn service(&self) -> Arc<dyn DeliveryService> {
        self.service.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Error codes tolerated per property, from the compat settings
    pub fn tolerated_errors(&self) -> ToleratedErrors {
        ToleratedErrors::from_settings(&self.settings.compat)
    }

    /// Create a download handle using the configured timings
    pub async fn download(&self, uri: &str, path: impl AsRef<Path>) -> Result<Download, DoError> {
        Download::with_options(
            self.service.clone(),
            uri,
            path,
            DownloadOptions::from_settings(&self.settings),
        )
        .await
    }
}
