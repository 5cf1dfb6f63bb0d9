//! Best-effort desktop notifications.

use tracing::instrument;

use crate::config::ToolConfig;

/// How long a notification call may take before it is abandoned
pub const NOTIFY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Best-effort desktop notifications. Implementations must never fail the caller.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &str, body: &str);
}

/// Delivers notifications through `notify-send <summary> <body>`.
#[derive(Debug, Clone)]
pub struct NotifySend {
    program: std::ffi::OsString,
}

impl NotifySend {
    #[must_use]
    pub fn new(tools: &ToolConfig) -> Self {
        Self {
            program: tools.notify_send.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for NotifySend {
    #[instrument(skip(self))]
    async fn notify(&self, summary: &str, body: &str) {
        let status = tokio::process::Command::new(&self.program)
            .arg(summary)
            .arg(body)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(NOTIFY_TIMEOUT, status).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => tracing::debug!("notify-send exited with {}", status),
            Ok(Err(error)) => tracing::debug!("notify-send failed or not available: {}", error),
            Err(_) => tracing::debug!("notify-send timed out"),
        }
    }
}

/// Discards all notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

#[async_trait::async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, summary: &str, body: &str) {
        tracing::trace!("notification suppressed: {} - {}", summary, body);
    }
}
