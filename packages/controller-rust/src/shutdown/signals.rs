use std::sync::Arc;

use tokio::task::JoinHandle;

use super::ShutdownController;

/// Triggers shutdown on SIGINT, or SIGTERM on unix.
///
/// The listener task exits once shutdown was triggered from any source.
pub fn spawn_signal_listener(controller: Arc<ShutdownController>) -> JoinHandle<()> {
    let mut rx = controller.shutdown_receiver();
    tokio::spawn(async move {
        tokio::select! {
            () = termination_signal() => {
                tracing::info!("termination signal received");
                controller.trigger_shutdown();
            }
            () = super::wait_for_shutdown(&mut rx) => {}
        }
    })
}

async fn termination_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
