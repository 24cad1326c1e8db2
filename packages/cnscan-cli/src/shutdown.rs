//! Graceful shutdown on SIGTERM/SIGINT
//!
//! A signal cancels the scan's token; workers stop after their current
//! network call and records already written stay on stdout.

use tokio_util::sync::CancellationToken;

/// Cancel `token` when the process receives SIGTERM or SIGINT (Ctrl+C
/// elsewhere).
pub fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::interrupt(), "SIGINT"),
        ] {
            let token = token.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = stream.recv() => {
                                tracing::info!("Received {}, stopping scan", name);
                                token.cancel();
                            }
                            _ = token.cancelled() => {}
                        }
                    });
                }
                Err(e) => tracing::warn!("Failed to register {} handler: {}", name, e),
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => {
                        tracing::info!("Received Ctrl+C, stopping scan");
                        token.cancel();
                    }
                    Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
                },
                _ = token.cancelled() => {}
            }
        });
    }
}
