//! Per-attempt state and watchdog checks.
//!
//! An [`AttemptSupervisor`] owns everything one upload attempt knows about its
//! transfer. It is fed progress snapshots and asked, on every tick and every
//! connectivity change, whether the attempt should be torn down.

use std::time::Duration;
use tokio::time::Instant;

use super::connectivity::NetworkStatus;
use super::error::{UploadError, UploadFailure};
use super::transport::{TransferSnapshot, TransferState};

/// Timeouts applied to a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogLimits {
    /// Zero bytes after this long aborts the attempt
    pub no_progress: Duration,
    /// No new bytes for this long aborts the attempt
    pub stall: Duration,
    /// Hard deadline for the attempt
    pub overall: Duration,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(UploadFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptPhase {
    Running,
    Paused,
    Settled(AttemptOutcome),
}

/// What the supervisor wants done after an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Watchdog {
    Healthy,
    /// The transfer is paused but may continue
    Resume,
    Trip(UploadFailure),
}

/// Snapshot of an attempt for callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAttempt {
    pub attempt_number: u32,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub state: TransferState,
    pub last_progress_at: Instant,
}

#[derive(Debug)]
pub struct AttemptSupervisor {
    attempt_number: u32,
    total_bytes: u64,
    bytes_transferred: u64,
    started_at: Instant,
    last_progress_at: Instant,
    phase: AttemptPhase,
    limits: WatchdogLimits,
    was_offline: bool,
}

impl AttemptSupervisor {
    pub fn new(attempt_number: u32, total_bytes: u64, limits: WatchdogLimits, now: Instant) -> Self {
        Self {
            attempt_number,
            total_bytes,
            bytes_transferred: 0,
            started_at: now,
            last_progress_at: now,
            phase: AttemptPhase::Running,
            limits,
            was_offline: false,
        }
    }

    /// Apply a progress snapshot. Returns true if new bytes were sent.
    ///
    /// Byte counts never move backwards within an attempt and snapshots are
    /// ignored once the attempt has settled.
    pub fn observe(&mut self, snapshot: TransferSnapshot, now: Instant) -> bool {
        if self.is_settled() {
            return false;
        }

        match snapshot.state {
            TransferState::Running => self.phase = AttemptPhase::Running,
            TransferState::Paused => self.phase = AttemptPhase::Paused,
            _ => {}
        }

        if snapshot.bytes_transferred > self.bytes_transferred {
            self.bytes_transferred = snapshot.bytes_transferred.min(self.total_bytes);
            self.last_progress_at = now;
            true
        } else {
            false
        }
    }

    /// Run the watchdogs.
    ///
    /// Checked in order: offline, no progress, stall, deadline. A paused but
    /// otherwise healthy attempt asks to be resumed.
    pub fn evaluate(&mut self, now: Instant, network: NetworkStatus) -> Watchdog {
        if self.is_settled() {
            return Watchdog::Healthy;
        }

        if !network.online {
            self.was_offline = true;
            return Watchdog::Trip(UploadFailure::Offline);
        }

        let age = now.saturating_duration_since(self.started_at);
        let idle = now.saturating_duration_since(self.last_progress_at);

        if self.bytes_transferred == 0 && age >= self.limits.no_progress {
            return Watchdog::Trip(UploadFailure::NoProgress(self.limits.no_progress));
        }

        if idle >= self.limits.stall {
            let failure = if self.phase == AttemptPhase::Paused {
                UploadFailure::Paused(self.limits.stall)
            } else {
                UploadFailure::Stalled(self.limits.stall)
            };
            return Watchdog::Trip(failure);
        }

        if age >= self.limits.overall {
            return Watchdog::Trip(UploadFailure::Timeout(self.limits.overall));
        }

        if self.phase == AttemptPhase::Paused {
            Watchdog::Resume
        } else {
            Watchdog::Healthy
        }
    }

    /// Settle the attempt. Only the first call has an effect and returns the
    /// outcome; later calls return `None`.
    pub fn settle(&mut self, outcome: AttemptOutcome) -> Option<AttemptOutcome> {
        if self.is_settled() {
            return None;
        }
        self.phase = AttemptPhase::Settled(outcome.clone());
        Some(outcome)
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.phase, AttemptPhase::Settled(_))
    }

    pub fn phase(&self) -> &AttemptPhase {
        &self.phase
    }

    pub fn attempt(&self) -> UploadAttempt {
        let state = match &self.phase {
            AttemptPhase::Running => TransferState::Running,
            AttemptPhase::Paused => TransferState::Paused,
            AttemptPhase::Settled(AttemptOutcome::Succeeded) => TransferState::Success,
            AttemptPhase::Settled(AttemptOutcome::Failed(UploadFailure::Cancelled)) => {
                TransferState::Canceled
            }
            AttemptPhase::Settled(AttemptOutcome::Failed(_)) => TransferState::Error,
        };

        UploadAttempt {
            attempt_number: self.attempt_number,
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            state,
            last_progress_at: self.last_progress_at,
        }
    }

    pub fn was_offline(&self) -> bool {
        self.was_offline
    }

    /// Build the error for `failure` with this attempt's progress.
    pub fn error(&self, failure: UploadFailure) -> UploadError {
        UploadError {
            failure,
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            was_offline: self.was_offline,
            attempts: self.attempt_number,
        }
    }
}
