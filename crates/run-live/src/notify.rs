//! User-visible run outcome notifications.

use run_timeline::RunStatus;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub run_id: String,
    pub title: String,
    pub description: Option<String>,
}

impl Notification {
    /// Outcome notification for a run that reached `status`. `None` while the
    /// run is still in flight.
    #[must_use]
    pub fn for_outcome(run_id: &str, status: RunStatus) -> Option<Self> {
        if !status.is_finalized() {
            return None;
        }
        let kind = if status == RunStatus::Completed {
            NotificationKind::Success
        } else {
            NotificationKind::Failure
        };
        let title = match status {
            RunStatus::Completed => "Run completed",
            RunStatus::Failed => "Run failed",
            RunStatus::Terminated => "Run terminated",
            RunStatus::Canceled => "Run canceled",
            RunStatus::TimedOut => "Run timed out",
            _ => "Run finished",
        };
        Some(Self {
            kind,
            run_id: run_id.to_string(),
            title: title.to_string(),
            description: Some(format!("{run_id} finished with status {status}")),
        })
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        let description = notification.description.unwrap_or_default();
        match notification.kind {
            NotificationKind::Success => info!(
                run_id = %notification.run_id,
                "{}: {}", notification.title, description
            ),
            NotificationKind::Failure => warn!(
                run_id = %notification.run_id,
                "{}: {}", notification.title, description
            ),
        }
    }
}

impl Notifier for mpsc::UnboundedSender<Notification> {
    fn notify(&self, notification: Notification) {
        if self.send(notification).is_err() {
            warn!("notification receiver dropped");
        }
    }
}
