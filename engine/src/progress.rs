//! Progress reporting.
//!
//! `ProgressSink` decouples the engine from whatever is watching a session
//! (terminal, GUI, test harness). The controller calls it from its worker
//! tasks, so implementations must be cheap and must not block.

use crossbeam_channel::Sender;
use tracing::info;
use uuid::Uuid;

use crate::model::{SessionState, TransferMetrics, UploadSession};

/// Receives lifecycle and progress events for upload sessions.
pub trait ProgressSink: Send + Sync {
    /// Called on every state transition.
    fn on_state_changed(&self, _session_id: Uuid, _from: SessionState, _to: SessionState) {}

    /// Called after every chunk written to storage.
    fn on_chunk_written(&self, session_id: Uuid, metrics: &TransferMetrics);

    /// Called once when a session reaches `Complete`.
    fn on_completed(&self, _session: &UploadSession) {}
}

/// Discards everything.
pub struct NoOpSink;

impl ProgressSink for NoOpSink {
    fn on_chunk_written(&self, _session_id: Uuid, _metrics: &TransferMetrics) {}
}

/// Logs progress through `tracing`, for runs without a terminal.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_state_changed(&self, session_id: Uuid, from: SessionState, to: SessionState) {
        info!(%session_id, %from, %to, "Session state changed");
    }

    fn on_chunk_written(&self, session_id: Uuid, metrics: &TransferMetrics) {
        info!(
            %session_id,
            bytes_written = metrics.bytes_written,
            total_bytes = metrics.total_bytes,
            percent = format_args!("{:.1}", metrics.percent_complete * 100.0),
            throughput_mbps = format_args!("{:.2}", metrics.throughput_mbps),
            "Upload progress"
        );
    }

    fn on_completed(&self, session: &UploadSession) {
        match session.last_error() {
            None => info!(session_id = %session.id(), "Session complete"),
            Some(err) => info!(session_id = %session.id(), kind = ?err.kind(), "Session complete: {}", err),
        }
    }
}

/// A progress event as delivered over a channel.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StateChanged {
        session_id: Uuid,
        from: SessionState,
        to: SessionState,
    },
    ChunkWritten {
        session_id: Uuid,
        metrics: TransferMetrics,
    },
    Completed {
        session_id: Uuid,
        success: bool,
    },
}

/// Forwards events to a crossbeam channel, e.g. for a UI thread.
///
/// Send failures (receiver gone) are ignored.
pub struct ChannelSink {
    sender: Sender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        ChannelSink { sender }
    }
}

impl ProgressSink for ChannelSink {
    fn on_state_changed(&self, session_id: Uuid, from: SessionState, to: SessionState) {
        let _ = self.sender.send(ProgressEvent::StateChanged { session_id, from, to });
    }

    fn on_chunk_written(&self, session_id: Uuid, metrics: &TransferMetrics) {
        let _ = self.sender.send(ProgressEvent::ChunkWritten {
            session_id,
            metrics: *metrics,
        });
    }

    fn on_completed(&self, session: &UploadSession) {
        let _ = self.sender.send(ProgressEvent::Completed {
            session_id: session.id(),
            success: session.result_payload().is_some(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_channel_sink_forwards_events() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = ChannelSink::new(tx);
        let id = Uuid::new_v4();

        sink.on_state_changed(id, SessionState::Idle, SessionState::Uploading);
        sink.on_chunk_written(id, &TransferMetrics::compute(5, 10, Duration::from_secs(1)));

        match rx.try_recv().expect("state event") {
            ProgressEvent::StateChanged { session_id, to, .. } => {
                assert_eq!(session_id, id);
                assert_eq!(to, SessionState::Uploading);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match rx.try_recv().expect("chunk event") {
            ProgressEvent::ChunkWritten { metrics, .. } => assert_eq!(metrics.percent_complete, 0.5),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let sink = ChannelSink::new(tx);
        sink.on_chunk_written(Uuid::new_v4(), &TransferMetrics::default());
    }
}
