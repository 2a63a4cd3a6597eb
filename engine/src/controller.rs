//! Upload lifecycle controller.
//!
//! The controller owns a single `UploadSession` and drives it through
//! `Idle -> Uploading -> Processing -> Complete`. Submitting returns as soon
//! as the session is accepted; the transfer runs on Tokio's blocking pool
//! and the segmentation call on a spawned task. Progress and state are
//! published on `watch` channels and to the configured `ProgressSink`.
//!
//! Every accepted session ends in `Complete`, carrying either the processed
//! payload or the error that stopped it. Only `reset_for_new_upload` leaves
//! `Complete`.
//!
//! The `watch` channels are written while the session lock is held, so they
//! always agree with `state()`. Sinks are called after the lock is released.

use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::SegmentationService;
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, SessionError, TransferError};
use crate::model::{SessionOutcome, SessionState, Submission, TransferMetrics, UploadSession};
use crate::notify::{NotificationRequest, Notifier};
use crate::progress::{NoOpSink, ProgressSink};
use crate::transfer::{self, StoredFile, TransferOptions};

/// Builder for `UploadController`.
pub struct UploadControllerBuilder {
    config: EngineConfig,
    service: Arc<dyn SegmentationService>,
    sink: Arc<dyn ProgressSink>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl UploadControllerBuilder {
    pub fn sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> UploadController {
        let (progress_tx, _) = watch::channel(TransferMetrics::default());
        let (state_tx, _) = watch::channel(SessionState::Idle);

        UploadController {
            inner: Arc::new(Inner {
                config: self.config,
                service: self.service,
                sink: self.sink,
                notifier: self.notifier,
                session: Mutex::new(UploadSession::default()),
                cancel: Mutex::new(None),
                progress_tx,
                state_tx,
            }),
        }
    }
}

/// Drives one upload session at a time.
///
/// Methods that start work (`submit`, `submit_file`) must be called from
/// within a Tokio runtime.
pub struct UploadController {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    service: Arc<dyn SegmentationService>,
    sink: Arc<dyn ProgressSink>,
    notifier: Option<Arc<dyn Notifier>>,
    session: Mutex<UploadSession>,
    cancel: Mutex<Option<CancellationToken>>,
    progress_tx: watch::Sender<TransferMetrics>,
    state_tx: watch::Sender<SessionState>,
}

impl UploadController {
    pub fn builder(config: EngineConfig, service: Arc<dyn SegmentationService>) -> UploadControllerBuilder {
        UploadControllerBuilder {
            config,
            service,
            sink: Arc::new(NoOpSink),
            notifier: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Submit an in-memory file of `size` bytes.
    ///
    /// # Errors
    /// `SizeMismatch` if `size` differs from the payload length, plus every
    /// rejection `submit` can return.
    pub fn submit_file(&self, bytes: impl Into<Bytes>, filename: &str, size: u64) -> Result<Uuid, EngineError> {
        let bytes = bytes.into();
        if bytes.len() as u64 != size {
            return Err(EngineError::SizeMismatch {
                declared: size,
                actual: bytes.len() as u64,
            });
        }
        self.submit(Submission::new(filename, size), Cursor::new(bytes))
    }

    /// Start a new session streaming `source` to storage.
    ///
    /// Returns the new session's id once it is `Uploading`.
    ///
    /// # Errors
    /// `SessionBusy` unless the controller is `Idle`; `InvalidSubmission`
    /// or `UnsupportedFileType` for a bad filename. A rejected submission
    /// leaves the current session untouched.
    pub fn submit<R>(&self, submission: Submission, source: R) -> Result<Uuid, EngineError>
    where
        R: Read + Send + 'static,
    {
        let destination = self.validate(&submission)?;

        let token = CancellationToken::new();
        let session_id = {
            let mut session = self.inner.lock_session();
            if session.state() != SessionState::Idle {
                return Err(EngineError::SessionBusy {
                    state: session.state(),
                });
            }
            let mut fresh = UploadSession::new(&submission);
            fresh.start_upload()?;
            *session = fresh;
            *self.inner.lock_cancel() = Some(token.clone());
            self.inner.progress_tx.send_replace(session.metrics());
            self.inner.state_tx.send_replace(SessionState::Uploading);
            session.id()
        };

        info!(
            %session_id,
            file = %submission.source_name,
            total_bytes = submission.total_bytes,
            destination = %destination.display(),
            "Upload accepted"
        );
        self.inner
            .sink
            .on_state_changed(session_id, SessionState::Idle, SessionState::Uploading);

        if let (Some(notifier), Some(email)) = (&self.inner.notifier, &submission.notify_email) {
            let notifier = Arc::clone(notifier);
            let request = NotificationRequest {
                session_id,
                email: email.clone(),
                source_name: submission.source_name.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&request).await {
                    warn!(session_id = %request.session_id, error = %e, "Notification failed");
                }
            });
        }

        // The service sees the stored name, without any directory parts
        let upload_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| submission.source_name.clone());
        let inner = Arc::clone(&self.inner);
        let total_bytes = submission.total_bytes;
        tokio::spawn(async move {
            inner
                .run_session(session_id, upload_name, total_bytes, destination, source, token)
                .await;
        });

        Ok(session_id)
    }

    fn validate(&self, submission: &Submission) -> Result<PathBuf, EngineError> {
        let name = submission.source_name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidSubmission {
                reason: "filename is empty".to_string(),
            });
        }
        let destination = transfer::destination_for(&self.inner.config.upload_dir, name).ok_or_else(|| {
            EngineError::InvalidSubmission {
                reason: format!("'{}' is not a valid filename", name),
            }
        })?;
        if !self.inner.config.accepts(name) {
            let extension = Path::new(name)
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Err(EngineError::UnsupportedFileType {
                extension,
                accepted: self.inner.config.allowed_extensions.join(", "),
            });
        }
        Ok(destination)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock_session().state()
    }

    /// Snapshot of the current session.
    pub fn session(&self) -> UploadSession {
        self.inner.lock_session().clone()
    }

    /// Transfer metrics recomputed from the session's counters.
    pub fn progress(&self) -> TransferMetrics {
        self.inner.lock_session().metrics()
    }

    /// The processed payload or the recorded error, once `Complete`.
    pub fn result(&self) -> Option<SessionOutcome> {
        self.inner.lock_session().outcome()
    }

    /// Metrics published after every chunk.
    pub fn subscribe_progress(&self) -> watch::Receiver<TransferMetrics> {
        self.inner.progress_tx.subscribe()
    }

    /// State published on every transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the current session is `Complete` and return its outcome.
    ///
    /// Returns `None` straight away if there is no session.
    pub async fn wait_for_completion(&self) -> Option<SessionOutcome> {
        let mut state = self.inner.state_tx.subscribe();
        if *state.borrow_and_update() == SessionState::Idle {
            return None;
        }
        state.wait_for(|s| *s == SessionState::Complete).await.ok()?;
        self.result()
    }

    /// Abort the in-flight session, if any.
    ///
    /// The session still ends in `Complete`, with a cancellation error.
    /// Returns false when nothing was in flight.
    pub fn cancel(&self) -> bool {
        if !self.state().is_in_flight() {
            return false;
        }
        match self.inner.lock_cancel().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Clear the finished session and return to `Idle`.
    ///
    /// A no-op when already `Idle`.
    ///
    /// # Errors
    /// `SessionBusy` while a session is uploading or processing.
    pub fn reset_for_new_upload(&self) -> Result<(), EngineError> {
        let session_id = {
            let mut session = self.inner.lock_session();
            match session.state() {
                SessionState::Idle => return Ok(()),
                SessionState::Complete => session.reset()?,
                state => return Err(EngineError::SessionBusy { state }),
            }
            *self.inner.lock_cancel() = None;
            self.inner.progress_tx.send_replace(TransferMetrics::default());
            self.inner.state_tx.send_replace(SessionState::Idle);
            session.id()
        };

        info!(%session_id, "Session reset");
        self.inner
            .sink
            .on_state_changed(session_id, SessionState::Complete, SessionState::Idle);
        Ok(())
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, UploadSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cancel(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_session<R>(
        self: Arc<Self>,
        session_id: Uuid,
        source_name: String,
        total_bytes: u64,
        destination: PathBuf,
        source: R,
        cancel: CancellationToken,
    ) where
        R: Read + Send + 'static,
    {
        let stored = match self
            .clone()
            .transfer(session_id, total_bytes, destination, source, cancel.clone())
            .await
        {
            Ok(stored) => stored,
            Err(e) => return self.complete(session_id, Err(e.into())),
        };

        let stored_path = stored.path.clone();
        {
            let mut session = self.lock_session();
            if let Err(e) = session.finish_upload(stored.path, stored.digest) {
                error!(%session_id, error = %e, "Cannot start processing");
                return;
            }
            self.state_tx.send_replace(SessionState::Processing);
        }
        info!(
            %session_id,
            path = %stored_path.display(),
            bytes = stored.bytes_written,
            elapsed_ms = stored.elapsed.as_millis() as u64,
            "Upload stored"
        );
        self.sink
            .on_state_changed(session_id, SessionState::Uploading, SessionState::Processing);

        let file_bytes = match tokio::fs::read(&stored_path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => return self.complete(session_id, Err(TransferError::read(e).into())),
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.service.submit(file_bytes, &source_name) => result.map_err(SessionError::from),
        };

        self.complete(session_id, outcome);
    }

    async fn transfer<R>(
        self: Arc<Self>,
        session_id: Uuid,
        total_bytes: u64,
        destination: PathBuf,
        mut source: R,
        cancel: CancellationToken,
    ) -> Result<StoredFile, TransferError>
    where
        R: Read + Send + 'static,
    {
        let options = TransferOptions {
            chunk_size: self.config.chunk_size,
            checksum: self.config.checksum,
            cancel: Some(cancel),
        };
        let worker = Arc::clone(&self);
        let target = destination.clone();

        tokio::task::spawn_blocking(move || {
            transfer::write_chunked(&mut source, total_bytes, &target, &options, |metrics| {
                worker.publish_progress(session_id, metrics)
            })
        })
        .await
        .unwrap_or_else(|join_err| {
            Err(TransferError::write(
                destination,
                io::Error::new(io::ErrorKind::Other, join_err.to_string()),
            ))
        })
    }

    fn publish_progress(&self, session_id: Uuid, metrics: &TransferMetrics) {
        {
            let mut session = self.lock_session();
            session.record_progress(metrics);
            self.progress_tx.send_replace(*metrics);
        }
        self.sink.on_chunk_written(session_id, metrics);
    }

    /// Record the outcome, publish `Complete`, then tell the sink.
    fn complete(&self, session_id: Uuid, outcome: Result<Bytes, SessionError>) {
        let (snapshot, from) = {
            let mut session = self.lock_session();
            if session.id() != session_id {
                warn!(%session_id, current = %session.id(), "Dropping outcome of a replaced session");
                return;
            }
            let from = session.state();
            let recorded = match &outcome {
                Ok(payload) => session.complete_with_result(payload.clone()),
                Err(err) => session.complete_with_error(err.clone()),
            };
            if let Err(e) = recorded {
                error!(%session_id, error = %e, "Cannot complete session");
                return;
            }
            self.progress_tx.send_replace(session.metrics());
            self.state_tx.send_replace(SessionState::Complete);
            (session.clone(), from)
        };

        match &outcome {
            Ok(payload) => info!(%session_id, bytes = payload.len(), "Segmentation complete"),
            Err(err @ SessionError::Transfer(transfer)) => warn!(
                %session_id,
                stage = %from,
                os_error = ?transfer.raw_os_error(),
                "Session failed: {}",
                err
            ),
            Err(err) if err.kind() == ErrorKind::Unexpected => {
                error!(%session_id, stage = %from, error = ?err, "Session failed: {}", err)
            }
            Err(err) => warn!(%session_id, stage = %from, kind = ?err.kind(), "Session failed: {}", err),
        }

        self.sink.on_state_changed(session_id, from, SessionState::Complete);
        self.sink.on_completed(&snapshot);
    }
}
