//! SIGINT/SIGTERM handling.
//!
//! A signal cancels the run-scoped token: in-flight uploads stop, no further
//! table metadata is published and the resumable ledger is flushed so the
//! next attempt picks up where this one stopped.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when a shutdown signal arrives.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token. Returns early if
    /// the token is cancelled some other way.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("can't listen for Ctrl+C: {}", e);
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
                    error!("can't listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = ctrl_c => {
                info!("Received SIGINT, cancelling upload");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling upload");
            }
        }
        self.token.cancel();
    }

    /// Spawn the signal listener in the background.
    pub fn spawn(self) -> CancellationToken {
        let token = self.token();
        tokio::spawn(async move { self.wait_for_signal().await });
        token
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
