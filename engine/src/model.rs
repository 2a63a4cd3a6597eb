//! Core data model for upload sessions.
//!
//! This module defines:
//! - UploadSession: the unit of work for one file submission
//! - SessionState: the lifecycle state machine
//! - TransferMetrics: progress figures derived from a session
//! - SessionOutcome: what a finished session produced

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::checksums::ChecksumValue;
use crate::error::{EngineError, SessionError};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// The lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No active session, or the previous one was reset
    Idle,
    /// The file is being written to local storage
    Uploading,
    /// The stored file has been handed to the segmentation service
    Processing,
    /// Terminal: holds either a result payload or an error
    Complete,
}

impl SessionState {
    /// Returns true if `next` is a legal successor of this state.
    ///
    /// `Uploading -> Complete` is only taken when the transfer fails.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Idle, SessionState::Uploading)
                | (SessionState::Uploading, SessionState::Processing)
                | (SessionState::Uploading, SessionState::Complete)
                | (SessionState::Processing, SessionState::Complete)
                | (SessionState::Complete, SessionState::Idle)
        )
    }

    /// Returns true while a worker owns the session.
    pub fn is_in_flight(self) -> bool {
        matches!(self, SessionState::Uploading | SessionState::Processing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Uploading => write!(f, "uploading"),
            SessionState::Processing => write!(f, "processing"),
            SessionState::Complete => write!(f, "complete"),
        }
    }
}

/// Progress figures for a transfer.
///
/// Never stored as a source of truth: always recomputed from the byte
/// counters and the elapsed wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TransferMetrics {
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
    /// MiB per second; 0.0 when no time has elapsed
    pub throughput_mbps: f64,
    /// In `[0.0, 1.0]`; 1.0 when `total_bytes` is zero
    pub percent_complete: f64,
}

impl TransferMetrics {
    pub fn compute(bytes_written: u64, total_bytes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let throughput_mbps = if secs > 0.0 {
            bytes_written as f64 / BYTES_PER_MIB / secs
        } else {
            0.0
        };
        let percent_complete = if total_bytes == 0 {
            1.0
        } else {
            (bytes_written as f64 / total_bytes as f64).min(1.0)
        };

        TransferMetrics {
            bytes_written,
            total_bytes,
            elapsed,
            throughput_mbps,
            percent_complete,
        }
    }
}

/// What a completed session produced.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    /// Raw bytes returned by the segmentation service, untouched
    Processed(Bytes),
    /// Why the session failed
    Failed(SessionError),
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Processed(_))
    }
}

/// A request to start a new session.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Original filename as given by the user
    pub source_name: String,

    /// Declared size of the file in bytes
    pub total_bytes: u64,

    /// Optional address for the fire-and-forget completion notice
    pub notify_email: Option<String>,
}

impl Submission {
    pub fn new(source_name: impl Into<String>, total_bytes: u64) -> Self {
        Submission {
            source_name: source_name.into(),
            total_bytes,
            notify_email: None,
        }
    }

    pub fn notify(mut self, email: impl Into<String>) -> Self {
        self.notify_email = Some(email.into());
        self
    }
}

/// The unit of work for one file submission.
///
/// Fields are read through accessors; only the controller advances the
/// state, which keeps these invariants:
/// - in `Complete`, exactly one of `result_payload` / `last_error` is set
/// - outside `Complete`, neither is set
/// - `bytes_written <= total_bytes`
#[derive(Debug, Clone)]
pub struct UploadSession {
    id: Uuid,
    state: SessionState,
    source_name: String,
    stored_path: Option<PathBuf>,
    total_bytes: u64,
    bytes_written: u64,
    result_payload: Option<Bytes>,
    last_error: Option<SessionError>,
    notify_email: Option<String>,
    stored_digest: Option<ChecksumValue>,
    submitted_at: Option<DateTime<Utc>>,
    transfer_started: Option<Instant>,
    transfer_elapsed: Option<Duration>,
    history: Vec<SessionState>,
}

impl Default for UploadSession {
    fn default() -> Self {
        UploadSession {
            id: Uuid::nil(),
            state: SessionState::Idle,
            source_name: String::new(),
            stored_path: None,
            total_bytes: 0,
            bytes_written: 0,
            result_payload: None,
            last_error: None,
            notify_email: None,
            stored_digest: None,
            submitted_at: None,
            transfer_started: None,
            transfer_elapsed: None,
            history: vec![SessionState::Idle],
        }
    }
}

impl UploadSession {
    /// Create a fresh session for `submission`, still in `Idle`.
    pub(crate) fn new(submission: &Submission) -> Self {
        UploadSession {
            id: Uuid::new_v4(),
            source_name: submission.source_name.clone(),
            total_bytes: submission.total_bytes,
            notify_email: submission.notify_email.clone(),
            submitted_at: Some(Utc::now()),
            ..UploadSession::default()
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn stored_path(&self) -> Option<&Path> {
        self.stored_path.as_deref()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn result_payload(&self) -> Option<&Bytes> {
        self.result_payload.as_ref()
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn notify_email(&self) -> Option<&str> {
        self.notify_email.as_deref()
    }

    pub fn stored_digest(&self) -> Option<&ChecksumValue> {
        self.stored_digest.as_ref()
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    /// Every state this session has been in, oldest first.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Current transfer metrics, recomputed on every call.
    pub fn metrics(&self) -> TransferMetrics {
        if self.state == SessionState::Idle {
            return TransferMetrics::default();
        }
        let elapsed = match (self.transfer_elapsed, self.transfer_started) {
            (Some(frozen), _) => frozen,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        };
        TransferMetrics::compute(self.bytes_written, self.total_bytes, elapsed)
    }

    /// The outcome of the session, once it is `Complete`.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        if self.state != SessionState::Complete {
            return None;
        }
        match (&self.result_payload, &self.last_error) {
            (Some(payload), None) => Some(SessionOutcome::Processed(payload.clone())),
            (None, Some(err)) => Some(SessionOutcome::Failed(err.clone())),
            _ => None,
        }
    }

    /// Move to `next`, refusing any edge `can_transition_to` does not allow.
    fn transition(&mut self, next: SessionState) -> Result<SessionState, EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        self.history.push(next);
        Ok(previous)
    }

    pub(crate) fn start_upload(&mut self) -> Result<(), EngineError> {
        self.transition(SessionState::Uploading)?;
        self.transfer_started = Some(Instant::now());
        Ok(())
    }

    pub(crate) fn record_progress(&mut self, metrics: &TransferMetrics) {
        debug_assert!(metrics.bytes_written >= self.bytes_written);
        self.bytes_written = metrics.bytes_written.min(self.total_bytes);
    }

    pub(crate) fn finish_upload(
        &mut self,
        stored_path: PathBuf,
        digest: Option<ChecksumValue>,
    ) -> Result<(), EngineError> {
        self.transition(SessionState::Processing)?;
        self.freeze_clock();
        self.bytes_written = self.total_bytes;
        self.stored_path = Some(stored_path);
        self.stored_digest = digest;
        Ok(())
    }

    pub(crate) fn complete_with_result(&mut self, payload: Bytes) -> Result<(), EngineError> {
        if self.state != SessionState::Processing {
            // A payload only ever comes out of processing
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: SessionState::Complete,
            });
        }
        self.transition(SessionState::Complete)?;
        self.result_payload = Some(payload);
        self.last_error = None;
        Ok(())
    }

    pub(crate) fn complete_with_error(&mut self, error: SessionError) -> Result<(), EngineError> {
        self.transition(SessionState::Complete)?;
        self.freeze_clock();
        self.result_payload = None;
        self.last_error = Some(error);
        Ok(())
    }

    /// Clear the outcome and storage location and return to `Idle`.
    pub(crate) fn reset(&mut self) -> Result<(), EngineError> {
        self.transition(SessionState::Idle)?;
        self.result_payload = None;
        self.last_error = None;
        self.stored_path = None;
        self.stored_digest = None;
        Ok(())
    }

    fn freeze_clock(&mut self) {
        if self.transfer_elapsed.is_none() {
            if let Some(started) = self.transfer_started {
                self.transfer_elapsed = Some(started.elapsed());
            }
        }
    }
}
