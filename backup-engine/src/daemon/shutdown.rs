//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the coordinator's token. Runs started with that token
//! stop at their next stage boundary and clean up their partial output.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on shutdown; hand it to engine runs
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGTERM or SIGINT, then cancel the token
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling running work...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling running work...");
            }
            _ = self.token.cancelled() => return,
        }

        self.shutdown();
    }

    /// Spawn the signal listener and return the token it cancels
    pub fn listen(&self) -> CancellationToken {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.wait_for_signal().await });
        self.token()
    }

    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Graceful shutdown initiated");
            self.token.cancel();
        }
    }
}
