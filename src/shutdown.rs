use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Token cancelled on SIGINT or SIGTERM. Subsystems select on it to drain
/// gracefully.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let sigterm = async {
            match signal(SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received, shutting down");
            }
            _ = sigterm => {
                tracing::info!("Termination signal received, shutting down");
            }
        }
        trigger.cancel();
    });

    token
}
