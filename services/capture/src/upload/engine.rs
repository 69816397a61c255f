//! Resilient upload of a single prepared photo.
//!
//! Each attempt starts a transfer through the [`StorageTransport`] and watches
//! it from a single `select!` loop: progress events, connectivity changes,
//! cancellation and a periodic tick all feed the attempt's
//! [`AttemptSupervisor`]. A tripped watchdog tears the transfer down before the
//! next attempt starts. Retryable failures back off exponentially.

use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use bodyscan_common::{build_scan_photo_path, Pose, PHOTO_CONTENT_TYPE};
use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connectivity::ConnectivityMonitor;
use super::error::{TransportError, UploadError, UploadFailure};
use super::transport::{
    PhotoTarget, StorageTransport, StoredObject, TransferControl, TransferHandle, TransferRequest,
    TransferSnapshot, TransferState,
};
use super::watchdog::{AttemptOutcome, AttemptSupervisor, Watchdog, WatchdogLimits};
use crate::config::UploadConfig;

/// Upper bound on attempts per photo.
pub const MAX_ATTEMPTS: u32 = 5;

/// Engine-wide timeouts and retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    pub stall_timeout: Duration,
    pub overall_timeout: Duration,
    pub no_progress_timeout: Duration,
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub watchdog_interval: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for UploadPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            stall_timeout: Duration::from_millis(config.stall_timeout_ms),
            overall_timeout: Duration::from_millis(config.overall_timeout_ms),
            no_progress_timeout: Duration::from_millis(config.no_progress_timeout_ms),
            max_retries: config.max_retries,
            backoff_initial: Duration::from_millis(config.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            watchdog_interval: Duration::from_millis(config.watchdog_interval_ms),
        }
    }
}

/// Progress event passed to [`UploadParams::on_progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub pose: Pose,
    pub attempt: u32,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub state: TransferState,
}

pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;
pub type TaskCallback = Arc<dyn Fn(&TransferControl) + Send + Sync>;

/// One photo to upload, with per-call overrides of the engine policy.
#[derive(Clone)]
pub struct UploadParams {
    pub file: Bytes,
    pub uid: String,
    pub scan_id: String,
    pub pose: Pose,
    pub content_type: String,
    pub stall_timeout: Option<Duration>,
    pub overall_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub include_download_url: bool,
    pub signal: Option<CancellationToken>,
    pub on_progress: Option<ProgressCallback>,
    pub on_task: Option<TaskCallback>,
}

impl UploadParams {
    pub fn new(
        uid: impl Into<String>,
        scan_id: impl Into<String>,
        pose: Pose,
        file: impl Into<Bytes>,
    ) -> Self {
        Self {
            file: file.into(),
            uid: uid.into(),
            scan_id: scan_id.into(),
            pose,
            content_type: PHOTO_CONTENT_TYPE.to_string(),
            stall_timeout: None,
            overall_timeout: None,
            max_retries: None,
            include_download_url: false,
            signal: None,
            on_progress: None,
            on_task: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_download_url(mut self, include: bool) -> Self {
        self.include_download_url = include;
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(UploadProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_task(mut self, callback: impl Fn(&TransferControl) + Send + Sync + 'static) -> Self {
        self.on_task = Some(Arc::new(callback));
        self
    }
}

/// A photo that reached storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPhoto {
    pub path: String,
    pub storage_path: String,
    pub download_url: Option<String>,
    pub size: u64,
}

/// The transfer of the current attempt. Dropping it cancels a transfer that
/// is still in flight.
struct ActiveTransfer {
    progress: tokio::sync::watch::Receiver<TransferSnapshot>,
    control: TransferControl,
    completion: JoinHandle<Result<StoredObject, TransportError>>,
    finished: bool,
}

impl ActiveTransfer {
    fn new(handle: TransferHandle) -> Self {
        Self {
            progress: handle.progress,
            control: handle.control,
            completion: handle.completion,
            finished: false,
        }
    }

    /// Cancel an unfinished transfer and wait for its task to end.
    async fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.control.cancel();
        self.completion.abort();
        let _ = (&mut self.completion).await;
    }
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        if !self.finished {
            self.control.cancel();
            self.completion.abort();
        }
    }
}

pub struct UploadEngine {
    transport: Arc<dyn StorageTransport>,
    connectivity: ConnectivityMonitor,
    policy: UploadPolicy,
}

impl UploadEngine {
    pub fn new(
        transport: Arc<dyn StorageTransport>,
        connectivity: ConnectivityMonitor,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            transport,
            connectivity,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            current_interval: self.policy.backoff_initial,
            initial_interval: self.policy.backoff_initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.policy.backoff_max,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }

    /// Upload several photos concurrently. Results keep the input order.
    pub async fn upload_all(
        &self,
        uploads: Vec<UploadParams>,
    ) -> Vec<Result<UploadedPhoto, UploadError>> {
        join_all(uploads.into_iter().map(|params| self.upload_prepared_photo(params))).await
    }

    /// Upload one photo, retrying retryable failures.
    #[instrument(skip_all, fields(uid = %params.uid, scan_id = %params.scan_id, pose = %params.pose))]
    pub async fn upload_prepared_photo(
        &self,
        params: UploadParams,
    ) -> Result<UploadedPhoto, UploadError> {
        let total_bytes = params.file.len() as u64;
        let signal = params.signal.clone().unwrap_or_default();

        let rejected = |failure: UploadFailure| {
            metrics::counter!("capture.upload.failures", "code" => failure.code().to_string())
                .increment(1);
            UploadError {
                failure,
                bytes_transferred: 0,
                total_bytes,
                was_offline: false,
                attempts: 0,
            }
        };
        if total_bytes == 0 {
            return Err(rejected(UploadFailure::ZeroBytes));
        }
        if signal.is_cancelled() {
            return Err(rejected(UploadFailure::Cancelled));
        }

        let path = build_scan_photo_path(&params.uid, &params.scan_id, params.pose);
        let target = PhotoTarget {
            uid: params.uid.clone(),
            scan_id: params.scan_id.clone(),
            pose: params.pose,
            path: path.clone(),
        };
        let limits = WatchdogLimits {
            no_progress: self.policy.no_progress_timeout,
            stall: params.stall_timeout.unwrap_or(self.policy.stall_timeout),
            overall: params.overall_timeout.unwrap_or(self.policy.overall_timeout),
        };
        let max_attempts = params
            .max_retries
            .unwrap_or(self.policy.max_retries)
            .clamp(1, MAX_ATTEMPTS);

        let started = Instant::now();
        let mut backoff = self.backoff();
        let mut attempt_number = 0;
        let mut went_offline = false;

        let stored = loop {
            attempt_number += 1;
            metrics::counter!("capture.upload.attempts").increment(1);

            let err = match self
                .run_attempt(&params, &target, &signal, attempt_number, limits)
                .await
            {
                Ok(stored) => break stored,
                Err(err) => err,
            };
            went_offline |= err.was_offline;
            let err = UploadError {
                was_offline: went_offline,
                ..err
            };

            metrics::counter!("capture.upload.failures", "code" => err.code().to_string())
                .increment(1);

            if !err.is_retryable() || attempt_number >= max_attempts {
                warn!(
                    attempt = attempt_number,
                    code = err.code(),
                    bytes_transferred = err.bytes_transferred,
                    "Upload failed"
                );
                return Err(err);
            }

            let delay = backoff.next_backoff().unwrap_or(self.policy.backoff_max);
            warn!(
                attempt = attempt_number,
                code = err.code(),
                delay_ms = delay.as_millis() as u64,
                "Upload attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    return Err(UploadError {
                        failure: UploadFailure::Cancelled,
                        ..err
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        };

        metrics::counter!("capture.upload.succeeded").increment(1);
        metrics::histogram!("capture.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        info!(
            attempts = attempt_number,
            size = total_bytes,
            storage_path = %stored.storage_path,
            "Photo uploaded"
        );

        let download_url = if params.include_download_url {
            match self.transport.download_url(&target).await {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(error = %e, "Download URL unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        Ok(UploadedPhoto {
            path,
            storage_path: stored.storage_path,
            download_url,
            size: total_bytes,
        })
    }

    async fn run_attempt(
        &self,
        params: &UploadParams,
        target: &PhotoTarget,
        signal: &CancellationToken,
        attempt_number: u32,
        limits: WatchdogLimits,
    ) -> Result<StoredObject, UploadError> {
        let total_bytes = params.file.len() as u64;
        let mut network = self.connectivity.subscribe();
        let mut supervisor = AttemptSupervisor::new(attempt_number, total_bytes, limits, Instant::now());

        let status = *network.borrow_and_update();
        if let Watchdog::Trip(failure) = supervisor.evaluate(Instant::now(), status) {
            supervisor.settle(AttemptOutcome::Failed(failure.clone()));
            return Err(supervisor.error(failure));
        }

        debug!(attempt = attempt_number, total_bytes, "Starting transfer");
        let mut transfer = ActiveTransfer::new(self.transport.start(TransferRequest {
            target: target.clone(),
            body: params.file.clone(),
            content_type: params.content_type.clone(),
        }));
        if let Some(on_task) = &params.on_task {
            on_task(&transfer.control);
        }

        let period = self.policy.watchdog_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress_open = true;
        let mut network_open = true;

        let outcome: Result<StoredObject, UploadFailure> = loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => break Err(UploadFailure::Cancelled),
                joined = &mut transfer.completion => {
                    transfer.finished = true;
                    break match joined {
                        Ok(Ok(stored)) => Ok(stored),
                        Ok(Err(e)) => Err(UploadFailure::from(e)),
                        Err(e) if e.is_cancelled() => Err(UploadFailure::Cancelled),
                        Err(e) => Err(UploadFailure::Transport(TransportError::retryable(
                            "transfer_panicked",
                            e.to_string(),
                        ))),
                    };
                }
                changed = transfer.progress.changed(), if progress_open => {
                    if changed.is_err() {
                        progress_open = false;
                        continue;
                    }
                    let snapshot = *transfer.progress.borrow_and_update();
                    if supervisor.observe(snapshot, Instant::now()) {
                        if let Some(on_progress) = &params.on_progress {
                            on_progress(UploadProgress {
                                pose: params.pose,
                                attempt: attempt_number,
                                bytes_transferred: snapshot.bytes_transferred,
                                total_bytes,
                                state: snapshot.state,
                            });
                        }
                    }
                }
                changed = network.changed(), if network_open => {
                    if changed.is_err() {
                        network_open = false;
                        continue;
                    }
                    let status = *network.borrow_and_update();
                    debug!(online = status.online, visible = status.visible, "Connectivity changed");
                }
                _ = ticker.tick() => {}
            }

            match supervisor.evaluate(Instant::now(), *network.borrow()) {
                Watchdog::Healthy => {}
                Watchdog::Resume => {
                    if transfer.control.is_paused() {
                        debug!(attempt = attempt_number, "Resuming paused transfer");
                        transfer.control.resume();
                    }
                }
                Watchdog::Trip(failure) => break Err(failure),
            }
        };

        supervisor.observe(*transfer.progress.borrow(), Instant::now());
        let settled = match &outcome {
            Ok(_) => AttemptOutcome::Succeeded,
            Err(failure) => AttemptOutcome::Failed(failure.clone()),
        };
        if let Some(AttemptOutcome::Failed(failure)) = supervisor.settle(settled) {
            debug!(attempt = attempt_number, code = failure.code(), "Tearing down transfer");
            transfer.shutdown().await;
        }

        outcome.map_err(|failure| supervisor.error(failure))
    }
}
