//! User-facing notices shared by the managers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// A short message for the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
}

/// Broadcast channel of notices. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct NoticeBus {
    tx: broadcast::Sender<Notice>,
}

impl NoticeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    /// Publish and log a notice. Notices with no listener are dropped.
    pub fn post(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info | Severity::Success => info!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
        let _ = self.tx.send(Notice { severity, message });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.post(Severity::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.post(Severity::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.post(Severity::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.post(Severity::Error, message);
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_notices() {
        let bus = NoticeBus::default();
        let mut rx = bus.subscribe();

        bus.success("Punch In successful!");
        bus.warning("You are offline.");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.severity, Severity::Success);
        assert_eq!(first.message, "Punch In successful!");
        assert_eq!(rx.recv().await.unwrap().severity, Severity::Warning);
    }

    #[test]
    fn test_post_without_subscribers() {
        NoticeBus::new(1).error("nobody listening");
    }
}
