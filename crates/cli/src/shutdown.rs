use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels the token on SIGINT or SIGTERM so the pipeline can flush its
/// buffered tasks and stop at a clean position.
pub fn listen_for_shutdown(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install SIGINT handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, stopping at the next clean position"),
            _ = terminate => info!("received SIGTERM, stopping at the next clean position"),
        }
        cancel.cancel();
    });
}
