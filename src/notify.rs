//! `Notifier` — the external collaborator contract for out-of-process
//! notification delivery (spec.md §6). The core never defines SMTP or
//! any other outbound transport itself; email delivery is always
//! delegated through an injected `Notifier`. A test-only in-memory
//! implementation is provided for crate tests and examples.

use crate::alerts::model::Severity;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notifier transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        channel: &str,
        subject: &str,
        body: &str,
        severity: Severity,
    ) -> Result<(), NotifyError>;
}

/// In-memory notifier that records every call it receives. Used by
/// crate tests and by `Orchestrator::demo` when no real notifier is
/// configured.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: parking_lot::Mutex<Vec<(String, String, String, Severity)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        channel: &str,
        subject: &str,
        body: &str,
        severity: Severity,
    ) -> Result<(), NotifyError> {
        self.sent.lock().push((
            channel.to_string(),
            subject.to_string(),
            body.to_string(),
            severity,
        ));
        Ok(())
    }
}

pub type SharedNotifier = Arc<dyn Notifier>;
