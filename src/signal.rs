//! OS signal wiring for `taskr run`.

use tokio::sync::broadcast;
use tracing::{debug, info};

/// What the runner was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunSignal {
    /// Graceful shutdown (SIGTERM, SIGINT).
    Shutdown,
    /// Rebuild the consumer pool (SIGHUP).
    Reload,
}

impl std::fmt::Display for RunSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunSignal::Shutdown => write!(f, "SHUTDOWN"),
            RunSignal::Reload => write!(f, "RELOAD"),
        }
    }
}

/// Fans OS signals out to subscribers.
#[derive(Clone)]
pub(crate) struct SignalHandler {
    sender: broadcast::Sender<RunSignal>,
}

impl SignalHandler {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RunSignal> {
        self.sender.subscribe()
    }

    pub(crate) fn send(&self, signal: RunSignal) {
        debug!("Sending signal: {}", signal);
        let _ = self.sender.send(signal);
    }

    /// Install SIGTERM, SIGINT and SIGHUP handlers.
    #[cfg(unix)]
    pub(crate) fn install(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let forwards = [
            (SignalKind::terminate(), "SIGTERM", RunSignal::Shutdown),
            (SignalKind::interrupt(), "SIGINT", RunSignal::Shutdown),
            (SignalKind::hangup(), "SIGHUP", RunSignal::Reload),
        ];
        for (kind, name, run_signal) in forwards {
            let mut stream = signal(kind)?;
            let handler = self.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    info!("Received {}", name);
                    handler.send(run_signal);
                }
            });
        }

        info!("OS signal handlers installed (SIGTERM, SIGINT, SIGHUP)");
        Ok(())
    }

    /// Install a Ctrl-C handler.
    #[cfg(not(unix))]
    pub(crate) fn install(&self) -> std::io::Result<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C");
                handler.send(RunSignal::Shutdown);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_signals() {
        let handler = SignalHandler::new();
        let mut first = handler.subscribe();
        let mut second = handler.subscribe();

        handler.send(RunSignal::Reload);
        handler.send(RunSignal::Shutdown);

        assert_eq!(first.recv().await.unwrap(), RunSignal::Reload);
        assert_eq!(first.recv().await.unwrap(), RunSignal::Shutdown);
        assert_eq!(second.recv().await.unwrap(), RunSignal::Reload);
    }

    #[test]
    fn test_send_without_subscribers() {
        SignalHandler::new().send(RunSignal::Shutdown);
    }

    #[test]
    fn test_display() {
        assert_eq!(RunSignal::Shutdown.to_string(), "SHUTDOWN");
        assert_eq!(RunSignal::Reload.to_string(), "RELOAD");
    }
}
