//! Cooperative shutdown signal shared by every long-running task.
//! Triggered by SIGINT/SIGTERM or programmatically when a fatal component
//! failure means the process should wind down.

use slog::Logger;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> Receiver {
        Receiver {
            rx: self.tx.subscribe(),
            triggered: false,
        }
    }

    /// Signals shutdown to every subscriber. Safe to call more than once.
    pub fn trigger(&self) {
        // Err means no receivers remain, which is fine during teardown
        let _ = self.tx.send(());
    }
}

pub struct Receiver {
    rx: broadcast::Receiver<()>,
    triggered: bool,
}

impl Receiver {
    /// Completes once shutdown has been triggered.
    /// Completes immediately on every call after the first trigger.
    pub async fn recv(&mut self) {
        if self.triggered {
            return;
        }
        // Lagged/Closed both mean the signal fired or will never fire again;
        // treat them all as triggered
        let _ = self.rx.recv().await;
        self.triggered = true;
    }

    pub fn is_triggered(&mut self) -> bool {
        if !self.triggered {
            match self.rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_))
                | Err(broadcast::error::TryRecvError::Closed) => {
                    self.triggered = true;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }
        }
        self.triggered
    }
}

/// Waits for SIGINT or SIGTERM and then triggers the given shutdown handle
pub async fn wait_for_signal(shutdown: Shutdown, logger: Logger) {
    let sigint = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sigterm) => sigterm,
            Err(err) => {
                slog::error!(
                    logger,
                    "could not install SIGTERM handler";
                    "error" => ?err,
                );
                let _ = sigint.await;
                slog::info!(logger, "received SIGINT; beginning graceful shutdown");
                shutdown.trigger();
                return;
            }
        };

        tokio::select! {
            _ = sigint => {
                slog::info!(logger, "received SIGINT; beginning graceful shutdown");
            },
            _ = sigterm.recv() => {
                slog::info!(logger, "received SIGTERM; beginning graceful shutdown");
            },
        }
    }

    #[cfg(not(unix))]
    {
        let _ = sigint.await;
        slog::info!(logger, "received SIGINT; beginning graceful shutdown");
    }

    shutdown.trigger();
}
