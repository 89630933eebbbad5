//! Fire-and-forget notifications about job outcomes.

use std::fmt;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Success,
    Failure,
}

impl fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyLevel::Info => write!(f, "info"),
            NotifyLevel::Success => write!(f, "success"),
            NotifyLevel::Failure => write!(f, "failure"),
        }
    }
}

/// Delivery channel for operator notifications (chat webhook, Apprise, ...).
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotifyLevel, title: &str, body: &str) -> anyhow::Result<()>;
}

/// Sends through `notifier`, logging instead of propagating any failure.
pub fn send(notifier: &dyn Notifier, level: NotifyLevel, title: &str, body: &str) {
    if let Err(e) = notifier.notify(level, title, body) {
        warn!("Failed to send {} notification: {:#}", level, e);
    }
}

/// Writes notifications into the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: NotifyLevel, title: &str, body: &str) -> anyhow::Result<()> {
        info!(level = %level, title = title, "{}", body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl Notifier for Broken {
        fn notify(&self, _: NotifyLevel, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("endpoint unreachable")
        }
    }

    #[test]
    fn test_send_swallows_errors() {
        // Must not panic or propagate.
        send(&Broken, NotifyLevel::Failure, "title", "body");
        send(&LogNotifier, NotifyLevel::Success, "title", "body");
    }
}
