//! Fire-and-forget notifications.
//!
//! A user may ask to be e-mailed about an upload. The controller hands the
//! request to a `Notifier` once, at submission, on a detached task. The
//! address is not validated and delivery is not tracked; a failing notifier
//! is logged and otherwise ignored.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::error::NotifyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub session_id: Uuid,
    pub email: String,
    pub source_name: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError>;
}

/// Records the request in the log and nothing else.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        info!(
            session_id = %request.session_id,
            email = %request.email,
            file = %request.source_name,
            "Notification requested"
        );
        Ok(())
    }
}
