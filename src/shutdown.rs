use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// The node's loops watch this token and stop at their next await point.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot watch SIGTERM, relying on Ctrl-C only");
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Received SIGINT, shutting down");
                    cancel.cancel();
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Ctrl-C handler failed");
                    return;
                }
                tracing::info!("Received SIGINT, shutting down");
            }
        }

        cancel.cancel();
    });

    token
}
