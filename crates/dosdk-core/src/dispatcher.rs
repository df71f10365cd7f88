//! Per-handle dispatcher task
//!
//! Delivers status snapshots to the registered callback and runs commands the
//! callback queued through its [`DownloadControl`]. Snapshots come from the
//! service's event stream when it has one, otherwise from polling.

use crate::download::DownloadControl;
use crate::property::StatusCallback;
use crate::service::DeliveryService;
use dosdk_types::{DownloadId, DownloadStatus};
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Callback storage shared by a handle and its dispatcher
pub(crate) type CallbackSlot = Arc<RwLock<Option<StatusCallback>>>;

/// Work queued for the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// The download was started; begin delivering callbacks
    Activate,
    Resume,
    Pause,
    Abort,
}

pub(crate) struct Dispatcher {
    id: DownloadId,
    service: Arc<dyn DeliveryService>,
    callback: CallbackSlot,
    control: DownloadControl,
    commands: mpsc::UnboundedReceiver<Command>,
    latest: watch::Sender<DownloadStatus>,
    poll_interval: Duration,
    active: bool,
    finished: bool,
    last_delivered: Option<DownloadStatus>,
}

impl Dispatcher {
    pub fn new(
        service: Arc<dyn DeliveryService>,
        callback: CallbackSlot,
        control: DownloadControl,
        commands: mpsc::UnboundedReceiver<Command>,
        latest: watch::Sender<DownloadStatus>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id: control.id().clone(),
            service,
            callback,
            control,
            commands,
            latest,
            poll_interval,
            active: false,
            finished: false,
            last_delivered: None,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut events = self.service.subscribe(&self.id);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.execute(command).await,
                    None => break,
                },
                event = next_event(&mut events), if events.is_some() => match event {
                    Ok(status) => self.deliver(status),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Dispatcher for {} skipped {} status events", self.id, skipped);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event stream of {} closed, polling instead", self.id);
                        events = None;
                    }
                },
                _ = ticker.tick(), if events.is_none() && self.active && !self.finished => {
                    self.poll().await;
                }
            }
        }

        debug!("Dispatcher for {} stopped", self.id);
    }

    async fn execute(&mut self, command: Command) {
        let result = match command {
            Command::Activate => {
                self.active = true;
                self.poll().await;
                return;
            }
            Command::Resume => self.service.start(&self.id).await,
            Command::Pause => self.service.pause(&self.id).await,
            Command::Abort => self.service.abort(&self.id).await,
        };

        match result {
            Ok(()) => debug!("Queued {:?} on {} done", command, self.id),
            Err(e) => warn!("Queued {:?} on {} failed: {}", command, self.id, e),
        }
    }

    async fn poll(&mut self) {
        match self.service.get_status(&self.id).await {
            Ok(status) => self.deliver(status),
            Err(e) => debug!("Status poll for {} failed: {}", self.id, e),
        }
    }

    fn deliver(&mut self, status: DownloadStatus) {
        self.latest.send_replace(status.clone());

        if !self.active || self.last_delivered.as_ref() == Some(&status) {
            return;
        }
        self.finished = status.state.is_terminal();
        self.last_delivered = Some(status.clone());

        // Clone out so the callback may replace itself
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            let control = self.control.clone();
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&control, &status)));
            if outcome.is_err() {
                warn!("Status callback for {} panicked", self.id);
            }
        }
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<DownloadStatus>>,
) -> Result<DownloadStatus, RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
