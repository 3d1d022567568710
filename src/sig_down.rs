//! Shutdown signal handling.

use tokio_util::sync::CancellationToken;

/// Cancels a token on SIGINT or SIGTERM (Ctrl-C elsewhere).
pub struct SigDown {
    cancellation_token: CancellationToken,
}

impl SigDown {
    pub fn try_new() -> Result<Self, std::io::Error> {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                    _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
                }
                token.cancel();
            });
        }

        #[cfg(not(unix))]
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Ctrl-C received, shutting down"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
            }
            token.cancel();
        });

        Ok(Self { cancellation_token })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }
}
