//! The write primitive the upload engine drives.
//!
//! A transport starts one transfer per attempt and hands back a
//! [`TransferHandle`]: a progress channel, a control for pause/resume/cancel,
//! and the completion task. The engine never looks inside a transfer beyond
//! these three.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bodyscan_common::Pose;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::TransportError;

/// Lifecycle of a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Running,
    Paused,
    Success,
    Error,
    Canceled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Success | TransferState::Error | TransferState::Canceled)
    }
}

/// Progress of a transfer at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub state: TransferState,
}

/// Where a photo is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoTarget {
    pub uid: String,
    pub scan_id: String,
    pub pose: Pose,
    /// Storage-relative object path
    pub path: String,
}

/// One transfer to start.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub target: PhotoTarget,
    pub body: Bytes,
    pub content_type: String,
}

/// Object written by a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Fully qualified location, e.g. `s3://bucket/key`
    pub storage_path: String,
}

/// Pause, resume and cancel a running transfer.
#[derive(Debug, Clone)]
pub struct TransferControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl TransferControl {
    fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Given to transfer implementations to publish progress and honour pauses.
#[derive(Debug)]
pub struct TransferReporter {
    progress: Arc<watch::Sender<TransferSnapshot>>,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl TransferReporter {
    /// Record `bytes` more bytes as sent.
    pub fn advance(&self, bytes: u64) {
        self.progress.send_if_modified(|snapshot| {
            let next = (snapshot.bytes_transferred + bytes).min(snapshot.total_bytes);
            let changed = next != snapshot.bytes_transferred;
            snapshot.bytes_transferred = next;
            changed
        });
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        *self.progress.borrow()
    }

    fn set_state(&self, state: TransferState) {
        self.progress.send_if_modified(|snapshot| {
            let changed = snapshot.state != state;
            snapshot.state = state;
            changed
        });
    }

    /// Block while the transfer is paused. Fails once the transfer is cancelled.
    pub async fn checkpoint(&mut self) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::cancelled());
        }
        if !*self.paused.borrow_and_update() {
            return Ok(());
        }

        self.set_state(TransferState::Paused);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::cancelled()),
                changed = self.paused.changed() => {
                    // a dropped control can no longer pause us
                    if changed.is_err() || !*self.paused.borrow_and_update() {
                        break;
                    }
                }
            }
        }
        self.set_state(TransferState::Running);
        Ok(())
    }
}

/// A started transfer.
#[derive(Debug)]
pub struct TransferHandle {
    pub progress: watch::Receiver<TransferSnapshot>,
    pub control: TransferControl,
    pub completion: JoinHandle<Result<StoredObject, TransportError>>,
}

impl TransferHandle {
    /// Run `work` as a transfer of `total_bytes` on the runtime.
    ///
    /// Cancelling the control aborts `work` at its next await point and
    /// completes the handle with [`TransportError::cancelled`]. The final
    /// snapshot state reflects the outcome.
    pub fn spawn<F, Fut>(total_bytes: u64, work: F) -> Self
    where
        F: FnOnce(TransferReporter) -> Fut,
        Fut: Future<Output = Result<StoredObject, TransportError>> + Send + 'static,
    {
        let control = TransferControl::new();
        let (progress_tx, progress) = watch::channel(TransferSnapshot {
            bytes_transferred: 0,
            total_bytes,
            state: TransferState::Running,
        });
        let progress_tx = Arc::new(progress_tx);

        let reporter = TransferReporter {
            progress: progress_tx.clone(),
            paused: control.paused.subscribe(),
            cancel: control.cancel.clone(),
        };
        let cancel = control.cancel.clone();
        let work = work(reporter);

        let completion = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::cancelled()),
                result = work => result,
            };

            let state = match &result {
                Ok(_) => TransferState::Success,
                Err(e) if e.is_cancelled() => TransferState::Canceled,
                Err(_) => TransferState::Error,
            };
            progress_tx.send_modify(|snapshot| snapshot.state = state);

            result
        });

        Self {
            progress,
            control,
            completion,
        }
    }
}

/// Storage backend for photo uploads.
#[async_trait]
pub trait StorageTransport: Send + Sync {
    /// Start writing `request.body` to `request.target`.
    fn start(&self, request: TransferRequest) -> TransferHandle;

    /// Resolve a read URL for an uploaded photo.
    async fn download_url(&self, target: &PhotoTarget) -> Result<String, TransportError>;
}
