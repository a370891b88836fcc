//! Graceful shutdown signal

use tokio_util::sync::CancellationToken;

/// Install a shutdown handler listening for SIGTERM and ctrl-c.
///
/// Returns a [`CancellationToken`] cancelled when either signal arrives.
/// Every long-running loop in the crate watches this token and drains
/// before exiting.
#[must_use]
pub fn install_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sig) => sig,
                    Err(err) => {
                        tracing::error!(%err, "failed to install SIGTERM handler");
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received ctrl-c, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received ctrl-c, shutting down");
        }

        handle.cancel();
    });

    token
}
