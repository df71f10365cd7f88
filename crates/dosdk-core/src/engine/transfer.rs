//! One transfer of the in-process service
//!
//! `Transfer` is the shared record (properties, status, control signals);
//! `TransferTask` is the worker that streams the body into the destination
//! file. A paused or interrupted transfer keeps the bytes it wrote and resumes
//! with a ranged request. Whatever else was at the destination is discarded.

use crate::engine::{BandwidthArbiter, Priority};
use crate::property::{parse_headers, WireValue};
use dosdk_types::{errc, DownloadId, DownloadProperty, DownloadState, DownloadStatus};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderName, HeaderValue, RANGE, USER_AGENT};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Minimum spacing of progress events
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// How often a silent stream is checked against the no-progress timeout
const STALL_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Shared state of one transfer
pub(crate) struct Transfer {
    pub id: DownloadId,
    properties: Mutex<HashMap<DownloadProperty, WireValue>>,
    status: Mutex<DownloadStatus>,
    events: broadcast::Sender<DownloadStatus>,
    pub paused: AtomicBool,
    pause_requested: Notify,
    pub cancel: CancellationToken,
    /// Bytes of the destination written and flushed by this transfer
    resume_offset: AtomicU64,
    /// Worker handle; also serializes pause confirmation against restarts
    pub task: Mutex<Option<JoinHandle<()>>>,
}

impl Transfer {
    pub fn new(id: DownloadId, uri: String, path: PathBuf) -> Self {
        let (events, _) = broadcast::channel(256);
        let mut properties = HashMap::new();
        properties.insert(DownloadProperty::Uri, WireValue::String(uri));
        properties.insert(
            DownloadProperty::DownloadFilePath,
            WireValue::String(path.to_string_lossy().into_owned()),
        );

        Self {
            id,
            properties: Mutex::new(properties),
            status: Mutex::new(DownloadStatus::new(DownloadState::Created)),
            events,
            paused: AtomicBool::new(false),
            pause_requested: Notify::new(),
            cancel: CancellationToken::new(),
            resume_offset: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> DownloadStatus {
        self.status.lock().clone()
    }

    /// Mutate the status and publish the result
    pub fn update<F>(&self, f: F) -> DownloadStatus
    where
        F: FnOnce(&mut DownloadStatus),
    {
        let snapshot = {
            let mut status = self.status.lock();
            f(&mut status);
            status.clone()
        };
        // No subscribers is fine
        let _ = self.events.send(snapshot.clone());
        snapshot
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadStatus> {
        self.events.subscribe()
    }

    pub fn property(&self, property: DownloadProperty) -> Option<WireValue> {
        self.properties.lock().get(&property).cloned()
    }

    pub fn set_property(&self, property: DownloadProperty, value: WireValue) {
        self.properties.lock().insert(property, value);
    }

    fn string_property(&self, property: DownloadProperty) -> Option<String> {
        match self.property(property) {
            Some(WireValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn uri(&self) -> String {
        self.string_property(DownloadProperty::Uri).unwrap_or_default()
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(
            self.string_property(DownloadProperty::DownloadFilePath)
                .unwrap_or_default(),
        )
    }

    pub fn priority(&self) -> Priority {
        let foreground = matches!(
            self.property(DownloadProperty::UseForegroundPriority),
            Some(WireValue::Bool(true))
        );
        Priority::from_foreground_flag(foreground)
    }

    pub fn no_progress_timeout(&self) -> Option<Duration> {
        match self.property(DownloadProperty::NoProgressTimeoutSeconds) {
            Some(WireValue::UInt(secs)) if secs > 0 => Some(Duration::from_secs(secs as u64)),
            _ => None,
        }
    }

    /// Request headers from the custom header properties
    pub fn custom_headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        [
            DownloadProperty::HttpCustomHeaders,
            DownloadProperty::HttpCustomAuthHeaders,
        ]
        .into_iter()
        .filter_map(|p| self.string_property(p))
        .filter_map(|raw| parse_headers(&raw).ok())
        .flatten()
        .collect()
    }

    /// Ask the worker to pause at its next await point
    pub fn request_pause(&self) {
        self.paused.store(true, Ordering::Release);
        self.pause_requested.notify_one();
    }

    /// Resolves once a pause or cancellation may have been requested
    async fn interrupted(&self) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = self.pause_requested.notified() => {}
        }
    }

    /// Enter the paused state if a pause is still requested.
    ///
    /// Runs under the task lock so a concurrent restart either clears the flag
    /// first or sees the paused state afterwards.
    pub fn confirm_pause(&self) -> bool {
        let _slot = self.task.lock();
        if !self.paused.load(Ordering::Acquire) {
            return false;
        }
        self.update(|s| s.state = DownloadState::Paused);
        true
    }
}

/// Why an attempt stopped early
#[derive(Debug)]
enum Stop {
    Paused,
    Cancelled,
    Failed {
        code: i32,
        extended_code: i32,
        message: String,
    },
}

impl Stop {
    fn transient(message: impl Into<String>) -> Self {
        Stop::Failed {
            code: errc::DO_E_TRANSIENT_NETWORK,
            extended_code: errc::S_OK,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Stop {
    fn from(e: std::io::Error) -> Self {
        Stop::Failed {
            code: errc::E_UNEXPECTED,
            extended_code: e.raw_os_error().unwrap_or(0),
            message: e.to_string(),
        }
    }
}

impl From<reqwest::Error> for Stop {
    fn from(e: reqwest::Error) -> Self {
        Stop::transient(e.to_string())
    }
}

/// Worker streaming one transfer to disk
pub(crate) struct TransferTask {
    transfer: Arc<Transfer>,
    client: Client,
    arbiter: BandwidthArbiter,
    user_agent: String,
    no_progress_timeout: Duration,
    retry_delay: Duration,
}

impl TransferTask {
    pub fn new(
        transfer: Arc<Transfer>,
        client: Client,
        arbiter: BandwidthArbiter,
        user_agent: String,
        default_no_progress_timeout: Duration,
        retry_delay: Duration,
    ) -> Self {
        let no_progress_timeout = transfer
            .no_progress_timeout()
            .unwrap_or(default_no_progress_timeout);

        Self {
            transfer,
            client,
            arbiter,
            user_agent,
            no_progress_timeout,
            retry_delay,
        }
    }

    pub async fn run(self) {
        let id = self.transfer.id.clone();
        let priority = self.transfer.priority();
        let _guard = self.arbiter.enter(priority);
        info!("Starting transfer {} ({:?}): {}", id, priority, self.transfer.uri());

        let mut last_progress = Instant::now();
        loop {
            let stop = match self.attempt(priority, &mut last_progress).await {
                Ok(()) => {
                    let status = self.transfer.update(|s| {
                        s.state = DownloadState::Transferred;
                        s.error_code = errc::S_OK;
                        s.extended_error_code = errc::S_OK;
                    });
                    info!("Transfer {} complete: {} bytes", id, status.bytes_transferred);
                    return;
                }
                Err(stop) => stop,
            };

            match stop {
                Stop::Paused => {
                    info!("Transfer {} paused", id);
                    return;
                }
                Stop::Cancelled => {
                    info!("Transfer {} cancelled", id);
                    return;
                }
                Stop::Failed {
                    code,
                    extended_code,
                    message,
                } if errc::is_transient(code) => {
                    if last_progress.elapsed() >= self.no_progress_timeout {
                        error!("Transfer {} made no progress for {:?}: {}", id, self.no_progress_timeout, message);
                        self.fail(errc::DO_E_DOWNLOAD_NO_PROGRESS, code);
                        return;
                    }

                    warn!("Transfer {} interrupted ({}), retrying in {:?}", id, message, self.retry_delay);
                    self.transfer.update(|s| {
                        s.error_code = code;
                        s.extended_error_code = extended_code;
                    });

                    match self.wait_retry_delay().await {
                        Ok(()) => continue,
                        Err(Stop::Paused) => {
                            info!("Transfer {} paused while waiting to retry", id);
                            return;
                        }
                        Err(_) => return,
                    }
                }
                Stop::Failed {
                    code,
                    extended_code,
                    message,
                } => {
                    error!("Transfer {} failed: {}", id, message);
                    self.fail(code, extended_code);
                    return;
                }
            }
        }
    }

    fn fail(&self, code: i32, extended_code: i32) {
        self.transfer.update(|s| {
            s.state = DownloadState::Paused;
            s.error_code = code;
            s.extended_error_code = extended_code;
        });
    }

    fn check_flags(&self) -> Result<(), Stop> {
        if self.transfer.cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        if self.transfer.paused.load(Ordering::Acquire) && self.transfer.confirm_pause() {
            return Err(Stop::Paused);
        }
        Ok(())
    }

    /// Resolves with the stop reason once a pause or cancellation lands
    async fn stopped(&self) -> Stop {
        loop {
            if let Err(stop) = self.check_flags() {
                return stop;
            }
            self.transfer.interrupted().await;
        }
    }

    async fn wait_retry_delay(&self) -> Result<(), Stop> {
        tokio::select! {
            biased;
            stop = self.stopped() => Err(stop),
            () = tokio::time::sleep(self.retry_delay) => self.check_flags(),
        }
    }

    /// One request/stream cycle, resuming from the bytes this transfer wrote
    async fn attempt(&self, priority: Priority, last_progress: &mut Instant) -> Result<(), Stop> {
        self.check_flags()?;

        let path = self.transfer.path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        let on_disk = file.metadata().await?.len();
        let existing = self.transfer.resume_offset.load(Ordering::Acquire).min(on_disk);
        if on_disk != existing {
            debug!(
                "Transfer {}: discarding {} bytes not written by this transfer",
                self.transfer.id,
                on_disk - existing
            );
            file.set_len(existing).await?;
        }

        let mut user_agent = self.user_agent.clone();
        if let Some(WireValue::String(caller)) = self.transfer.property(DownloadProperty::CallerName) {
            user_agent = format!("{} ({})", user_agent, caller);
        }

        let mut request = self
            .client
            .get(self.transfer.uri())
            .header(USER_AGENT, user_agent);
        for (name, value) in self.transfer.custom_headers() {
            request = request.header(name, value);
        }
        if existing > 0 {
            debug!("Transfer {} resuming from byte {}", self.transfer.id, existing);
            request = request.header(RANGE, format!("bytes={}-", existing));
        }

        let response = tokio::select! {
            biased;
            stop = self.stopped() => return Err(stop),
            result = tokio::time::timeout(self.no_progress_timeout, request.send()) => {
                result.map_err(|_| Stop::transient("request timed out"))??
            }
        };

        let status = response.status();
        let offset = if status == StatusCode::PARTIAL_CONTENT {
            existing
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            // Everything is already on disk
            self.transfer.update(|s| {
                s.bytes_total = existing;
                s.bytes_transferred = existing;
            });
            return Ok(());
        } else if status.is_success() {
            if existing > 0 {
                debug!("Transfer {}: server ignored range, restarting", self.transfer.id);
                file.set_len(0).await?;
                self.transfer.resume_offset.store(0, Ordering::Release);
            }
            0
        } else if status.is_server_error() {
            return Err(Stop::Failed {
                code: errc::DO_E_TRANSIENT_NETWORK,
                extended_code: status.as_u16() as i32,
                message: format!("HTTP {}", status),
            });
        } else {
            return Err(Stop::Failed {
                code: errc::DO_E_HTTP_STATUS,
                extended_code: status.as_u16() as i32,
                message: format!("HTTP {}", status),
            });
        };

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let total = response.content_length().map(|len| len + offset);

        self.transfer.update(|s| {
            s.state = DownloadState::Transferring;
            s.bytes_transferred = offset;
            s.bytes_total = total.unwrap_or(0);
            s.error_code = errc::S_OK;
            s.extended_error_code = errc::S_OK;
        });

        let mut written = offset;
        let streamed = self
            .stream_body(response, &mut file, &mut written, priority, last_progress)
            .await;

        // Only flushed bytes may be resumed from
        match file.flush().await {
            Ok(()) => self.transfer.resume_offset.store(written, Ordering::Release),
            Err(e) if streamed.is_ok() => return Err(e.into()),
            Err(e) => warn!("Transfer {}: flush after interruption failed: {}", self.transfer.id, e),
        }
        self.transfer.update(|s| s.bytes_transferred = written);
        streamed?;

        if let Some(total) = total {
            if written < total {
                return Err(Stop::transient(format!(
                    "connection closed at {} of {} bytes",
                    written, total
                )));
            }
        }

        self.transfer.update(|s| s.bytes_total = total.unwrap_or(written));
        Ok(())
    }

    async fn stream_body(
        &self,
        response: reqwest::Response,
        file: &mut tokio::fs::File,
        written: &mut u64,
        priority: Priority,
        last_progress: &mut Instant,
    ) -> Result<(), Stop> {
        let mut stream = response.bytes_stream();
        let mut last_emit = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                stop = self.stopped() => return Err(stop),
                next = stream.next() => next,
                () = tokio::time::sleep(STALL_CHECK_INTERVAL) => {
                    if last_progress.elapsed() >= self.no_progress_timeout {
                        return Err(Stop::transient("stream stalled"));
                    }
                    continue;
                }
            };

            let chunk = match next {
                Some(chunk) => chunk?,
                None => return Ok(()),
            };

            // A throttled background transfer can wait here for a while
            tokio::select! {
                biased;
                stop = self.stopped() => return Err(stop),
                () = self.arbiter.acquire(priority, chunk.len() as u64) => {}
            }
            file.write_all(&chunk).await?;
            *written += chunk.len() as u64;
            *last_progress = Instant::now();

            if last_emit.elapsed() >= PROGRESS_INTERVAL {
                let bytes = *written;
                self.transfer.update(|s| s.bytes_transferred = bytes);
                last_emit = Instant::now();
            }
        }
    }
}
